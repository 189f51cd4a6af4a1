// Rule Expression Evaluator
// Evaluates parsed conditions against an immutable variable map

use crate::expression::parser::{CompareOp, Expr, ExprParser, ParseExprError, Pattern};

use indexmap::IndexMap;
use std::fmt;
use thiserror::Error;

/// Evaluation error
#[derive(Debug, Clone)]
pub struct EvalError {
    pub message: String,
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evaluation error: {}", self.message)
    }
}

impl std::error::Error for EvalError {}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Error from parsing or evaluating a condition string
#[derive(Debug, Clone, Error)]
pub enum ExpressionError {
    #[error("invalid condition '{condition}': {source}")]
    Parse {
        condition: String,
        #[source]
        source: ParseExprError,
    },

    #[error("condition '{condition}' failed: {source}")]
    Eval {
        condition: String,
        #[source]
        source: EvalError,
    },
}

/// Variables visible to a condition
#[derive(Debug, Clone, Default)]
pub struct ExpressionContext {
    pub variables: IndexMap<String, String>,
}

impl ExpressionContext {
    pub fn new(variables: IndexMap<String, String>) -> Self {
        Self { variables }
    }

    /// Layer `overrides` on top of the current variables
    pub fn extended<'a, I>(&self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut variables = self.variables.clone();
        for (k, v) in overrides {
            variables.insert(k.clone(), v.clone());
        }
        Self { variables }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }
}

/// Runtime value of a sub-expression
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Pattern(Pattern),
    Bool(bool),
}

impl Value {
    /// Truthiness: undefined and empty strings are false
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            Value::Pattern(_) => true,
            Value::Bool(b) => *b,
        }
    }
}

pub struct Evaluator<'a> {
    context: &'a ExpressionContext,
}

impl<'a> Evaluator<'a> {
    pub fn new(context: &'a ExpressionContext) -> Self {
        Self { context }
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Literal(s) => Ok(Value::String(s.clone())),
            Expr::Pattern(p) => Ok(Value::Pattern(p.clone())),
            Expr::Variable(name) => Ok(self
                .context
                .get(name)
                .map(|v| Value::String(v.to_string()))
                .unwrap_or(Value::Null)),

            Expr::Not(inner) => Ok(Value::Bool(!self.eval(inner)?.is_truthy())),

            Expr::And(left, right) => {
                if !self.eval(left)?.is_truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval(right)?.is_truthy()))
            }

            Expr::Or(left, right) => {
                if self.eval(left)?.is_truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval(right)?.is_truthy()))
            }

            Expr::Compare { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                let result = match op {
                    CompareOp::Eq => Self::equals(&left, &right),
                    CompareOp::Ne => !Self::equals(&left, &right),
                    CompareOp::Match => Self::matches(&left, &right)?,
                    CompareOp::NotMatch => !Self::matches(&left, &right)?,
                };
                Ok(Value::Bool(result))
            }
        }
    }

    /// Evaluate to a boolean
    pub fn eval_bool(&self, expr: &Expr) -> Result<bool, EvalError> {
        Ok(self.eval(expr)?.is_truthy())
    }

    fn equals(left: &Value, right: &Value) -> bool {
        match (left, right) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Pattern(a), Value::Pattern(b)) => a == b,
            (a, b) => a.is_truthy() == b.is_truthy(),
        }
    }

    fn matches(subject: &Value, pattern: &Value) -> Result<bool, EvalError> {
        let regex = match pattern {
            Value::Pattern(p) => p.compile(),
            Value::String(s) => Pattern::new(s.clone()).compile(),
            Value::Null => return Ok(false),
            Value::Bool(_) => return Err(EvalError::new("cannot match against a boolean")),
        }
        .map_err(|e| EvalError::new(format!("invalid regex: {}", e)))?;

        Ok(match subject {
            Value::String(s) => regex.is_match(s),
            _ => false,
        })
    }
}

/// Convenience entry point: parse and evaluate a condition string
pub struct ExpressionEngine;

impl ExpressionEngine {
    /// Parse a condition without evaluating it
    pub fn parse(condition: &str) -> Result<Expr, ExpressionError> {
        ExprParser::parse_str(condition).map_err(|source| ExpressionError::Parse {
            condition: condition.to_string(),
            source,
        })
    }

    pub fn evaluate(condition: &str, context: &ExpressionContext) -> Result<bool, ExpressionError> {
        let expr = Self::parse(condition)?;
        Evaluator::new(context)
            .eval_bool(&expr)
            .map_err(|source| ExpressionError::Eval {
                condition: condition.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, &str)]) -> ExpressionContext {
        ExpressionContext::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn eval(condition: &str, context: &ExpressionContext) -> bool {
        ExpressionEngine::evaluate(condition, context).unwrap()
    }

    #[test]
    fn test_equality() {
        let c = ctx(&[("CI_COMMIT_BRANCH", "main")]);
        assert!(eval(r#"$CI_COMMIT_BRANCH == "main""#, &c));
        assert!(!eval(r#"$CI_COMMIT_BRANCH == "dev""#, &c));
        assert!(eval(r#"$CI_COMMIT_BRANCH != "dev""#, &c));
        assert!(eval(r#""main" == $CI_COMMIT_BRANCH"#, &c));
    }

    #[test]
    fn test_null_and_presence() {
        let c = ctx(&[("EMPTY", ""), ("SET", "1")]);
        assert!(eval("$MISSING == null", &c));
        assert!(!eval("$EMPTY == null", &c));
        assert!(eval(r#"$EMPTY == """#, &c));
        assert!(!eval(r#"$MISSING == """#, &c));
        assert!(eval("$SET", &c));
        assert!(!eval("$EMPTY", &c));
        assert!(!eval("$MISSING", &c));
        assert!(eval("!$MISSING", &c));
    }

    #[test]
    fn test_regex_matching() {
        let c = ctx(&[
            ("CI_COMMIT_BRANCH", "Release/1.2"),
            ("CI_COMMIT_MESSAGE", "wip [skip ci]"),
            ("PATTERN", "^Release"),
        ]);
        assert!(eval(r"$CI_COMMIT_BRANCH =~ /^release\//i", &c));
        assert!(!eval(r"$CI_COMMIT_BRANCH =~ /^release\//", &c));
        assert!(eval(r"$CI_COMMIT_MESSAGE =~ /\[skip ci\]/", &c));
        assert!(eval(r"$CI_COMMIT_BRANCH !~ /^main$/", &c));
        assert!(eval("$CI_COMMIT_BRANCH =~ $PATTERN", &c));
        assert!(!eval("$MISSING =~ /.*/", &c));
    }

    #[test]
    fn test_logical_operators() {
        let c = ctx(&[("A", "1"), ("B", "")]);
        assert!(eval("$A || $B", &c));
        assert!(!eval("$A && $B", &c));
        assert!(eval(r#"($A || $B) && $A == "1""#, &c));
        assert!(eval("!($A && $B)", &c));
    }

    #[test]
    fn test_invalid_condition_is_error() {
        let c = ExpressionContext::default();
        let err = ExpressionEngine::evaluate("$A ===", &c).unwrap_err();
        assert!(matches!(err, ExpressionError::Parse { .. }));
    }

    #[test]
    fn test_invalid_runtime_pattern_is_error() {
        let c = ctx(&[("A", "x"), ("P", "(")]);
        let err = ExpressionEngine::evaluate("$A =~ $P", &c).unwrap_err();
        assert!(matches!(err, ExpressionError::Eval { .. }));
    }

    #[test]
    fn test_extended_context() {
        let base = ctx(&[("A", "1")]);
        let overrides: IndexMap<String, String> =
            [("A".to_string(), "2".to_string())].into_iter().collect();
        let c = base.extended(&overrides);
        assert!(eval(r#"$A == "2""#, &c));
    }
}
