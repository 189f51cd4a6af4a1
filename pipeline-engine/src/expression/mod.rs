// Rule Expression Module
// `if:` conditions: $VAR references, string and regex literals, ==, !=, =~, !~, &&, ||, !

pub mod evaluator;
pub mod lexer;
pub mod parser;

pub use evaluator::{EvalError, Evaluator, ExpressionContext, ExpressionEngine, ExpressionError, Value};
pub use lexer::{LexError, Lexer, Token};
pub use parser::{CompareOp, Expr, ExprParser, ParseExprError, Pattern};
