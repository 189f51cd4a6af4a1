// Rule Expression Parser
// Recursive descent over lexer tokens into a small tagged expression tree

use crate::expression::lexer::{LexError, Lexer, Token};

use std::fmt;

/// Expression tree for rule conditions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `null`
    Null,

    /// Quoted string literal
    Literal(String),

    /// `$NAME` reference
    Variable(String),

    /// `/pattern/flags` literal
    Pattern(Pattern),

    /// `left op right`
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

/// Regex literal as written in the condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub source: String,
    pub flags: String,
}

impl Pattern {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            flags: String::new(),
        }
    }

    /// Compile with inline flags, e.g. `(?i)pattern`
    pub fn compile(&self) -> Result<regex::Regex, regex::Error> {
        if self.flags.is_empty() {
            regex::Regex::new(&self.source)
        } else {
            regex::Regex::new(&format!("(?{}){}", self.flags, self.source))
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.source, self.flags)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,       // ==
    Ne,       // !=
    Match,    // =~
    NotMatch, // !~
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompareOp::Eq => write!(f, "=="),
            CompareOp::Ne => write!(f, "!="),
            CompareOp::Match => write!(f, "=~"),
            CompareOp::NotMatch => write!(f, "!~"),
        }
    }
}

/// Parser error
#[derive(Debug, Clone)]
pub struct ParseExprError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for ParseExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parse error at position {}: {}",
            self.position, self.message
        )
    }
}

impl std::error::Error for ParseExprError {}

impl From<LexError> for ParseExprError {
    fn from(err: LexError) -> Self {
        Self {
            message: err.message,
            position: err.position,
        }
    }
}

pub struct ExprParser {
    tokens: Vec<Token>,
    position: usize,
}

impl ExprParser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    /// Parse expression from string. Regex literals are compiled once here so
    /// that a malformed pattern is reported at parse time.
    pub fn parse_str(input: &str) -> Result<Expr, ParseExprError> {
        let mut lexer = Lexer::new(input);
        let tokens = lexer.tokenize()?;
        let mut parser = Self::new(tokens);
        let expr = parser.parse()?;
        validate_patterns(&expr)?;
        Ok(expr)
    }

    pub fn parse(&mut self) -> Result<Expr, ParseExprError> {
        let expr = self.parse_or()?;

        if self.peek() != &Token::Eof {
            return Err(self.error(&format!("unexpected token: {}", self.peek())));
        }

        Ok(expr)
    }

    // Precedence (lowest to highest):
    // 1. ||
    // 2. &&
    // 3. ! (unary)
    // 4. == != =~ !~
    // 5. primary

    fn parse_or(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_and()?;

        while self.peek() == &Token::Or {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_unary()?;

        while self.peek() == &Token::And {
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseExprError> {
        if self.peek() == &Token::Not {
            self.advance();
            let expr = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(expr)));
        }

        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseExprError> {
        let left = self.parse_primary()?;

        let op = match self.peek() {
            Token::Eq => CompareOp::Eq,
            Token::Ne => CompareOp::Ne,
            Token::Match => CompareOp::Match,
            Token::NotMatch => CompareOp::NotMatch,
            _ => return Ok(left),
        };
        self.advance();

        let right = self.parse_primary()?;

        if matches!(op, CompareOp::Match | CompareOp::NotMatch)
            && !matches!(right, Expr::Pattern(_) | Expr::Variable(_) | Expr::Literal(_))
        {
            return Err(self.error(&format!("right side of '{}' must be a pattern", op)));
        }

        Ok(Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseExprError> {
        let token = self.peek().clone();

        match token {
            Token::Null => {
                self.advance();
                Ok(Expr::Null)
            }
            Token::Variable(name) => {
                self.advance();
                Ok(Expr::Variable(name))
            }
            Token::String(s) => {
                self.advance();
                Ok(Expr::Literal(s))
            }
            Token::Regex { pattern, flags } => {
                self.advance();
                Ok(Expr::Pattern(Pattern {
                    source: pattern,
                    flags,
                }))
            }
            Token::LParen => {
                self.advance();
                let expr = self.parse_or()?;
                if self.peek() != &Token::RParen {
                    return Err(self.error("expected ')'"));
                }
                self.advance();
                Ok(expr)
            }
            Token::Eof => Err(self.error("unexpected end of expression")),
            other => Err(self.error(&format!("unexpected token: {}", other))),
        }
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.position).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() {
            self.position += 1;
        }
    }

    fn error(&self, message: &str) -> ParseExprError {
        ParseExprError {
            message: message.to_string(),
            position: self.position,
        }
    }
}

fn validate_patterns(expr: &Expr) -> Result<(), ParseExprError> {
    match expr {
        Expr::Pattern(pattern) => pattern.compile().map(|_| ()).map_err(|e| ParseExprError {
            message: format!("invalid regex {}: {}", pattern, e),
            position: 0,
        }),
        Expr::Compare { left, right, .. } | Expr::And(left, right) | Expr::Or(left, right) => {
            validate_patterns(left)?;
            validate_patterns(right)
        }
        Expr::Not(inner) => validate_patterns(inner),
        Expr::Null | Expr::Literal(_) | Expr::Variable(_) => Ok(()),
    }
}
