// Rule Expression Lexer
// Tokenizes `if:` conditions: $VARS, quoted strings, /regex/ literals and operators

use std::fmt;

/// Token types for rule expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Operands
    Null,
    Variable(String),
    String(String),
    Regex { pattern: String, flags: String },

    // Operators
    Eq,       // ==
    Ne,       // !=
    Match,    // =~
    NotMatch, // !~
    And,      // &&
    Or,       // ||
    Not,      // !

    // Delimiters
    LParen, // (
    RParen, // )

    // End of input
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Null => write!(f, "null"),
            Token::Variable(name) => write!(f, "${}", name),
            Token::String(s) => write!(f, "\"{}\"", s),
            Token::Regex { pattern, flags } => write!(f, "/{}/{}", pattern, flags),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Match => write!(f, "=~"),
            Token::NotMatch => write!(f, "!~"),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Eof => write!(f, "EOF"),
        }
    }
}

/// Lexer error
#[derive(Debug, Clone)]
pub struct LexError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lex error at position {}: {}",
            self.position, self.message
        )
    }
}

impl std::error::Error for LexError {}

pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
            position: 0,
        }
    }

    /// Tokenize the entire input
    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();

        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }

        Ok(tokens)
    }

    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace();

        let Some(&(pos, ch)) = self.chars.peek() else {
            return Ok(Token::Eof);
        };

        self.position = pos;

        match ch {
            '(' => {
                self.advance();
                Ok(Token::LParen)
            }
            ')' => {
                self.advance();
                Ok(Token::RParen)
            }
            '=' => {
                self.advance();
                match self.peek_char() {
                    Some('=') => {
                        self.advance();
                        Ok(Token::Eq)
                    }
                    Some('~') => {
                        self.advance();
                        Ok(Token::Match)
                    }
                    _ => Err(self.error("expected '==' or '=~' operator", pos)),
                }
            }
            '!' => {
                self.advance();
                match self.peek_char() {
                    Some('=') => {
                        self.advance();
                        Ok(Token::Ne)
                    }
                    Some('~') => {
                        self.advance();
                        Ok(Token::NotMatch)
                    }
                    _ => Ok(Token::Not),
                }
            }
            '&' => {
                self.advance();
                if self.peek_char() == Some('&') {
                    self.advance();
                    Ok(Token::And)
                } else {
                    Err(self.error("expected '&&' operator", pos))
                }
            }
            '|' => {
                self.advance();
                if self.peek_char() == Some('|') {
                    self.advance();
                    Ok(Token::Or)
                } else {
                    Err(self.error("expected '||' operator", pos))
                }
            }
            '$' => self.read_variable(),
            '"' | '\'' => self.read_string(ch),
            '/' => self.read_regex(),
            'a'..='z' | 'A'..='Z' => self.read_keyword(),
            _ => Err(self.error(&format!("unexpected character: '{}'", ch), pos)),
        }
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        self.chars.next()
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn error(&self, message: &str, position: usize) -> LexError {
        LexError {
            message: message.to_string(),
            position,
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_name(&mut self) -> String {
        let mut name = String::new();
        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                name.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        name
    }

    fn read_variable(&mut self) -> Result<Token, LexError> {
        let start = self.position;
        self.advance(); // consume '$'

        let braced = self.peek_char() == Some('{');
        if braced {
            self.advance();
        }

        let name = self.read_name();
        if name.is_empty() {
            return Err(self.error("expected variable name after '$'", start));
        }

        if braced {
            if self.peek_char() != Some('}') {
                return Err(self.error("unterminated '${' variable", start));
            }
            self.advance();
        }

        Ok(Token::Variable(name))
    }

    fn read_string(&mut self, quote: char) -> Result<Token, LexError> {
        let start = self.position;
        self.advance(); // consume opening quote

        let mut value = String::new();

        loop {
            match self.advance() {
                Some((_, '\\')) => match self.advance() {
                    Some((_, c)) if c == quote || c == '\\' => value.push(c),
                    Some((_, c)) => {
                        value.push('\\');
                        value.push(c);
                    }
                    None => break,
                },
                Some((_, c)) if c == quote => return Ok(Token::String(value)),
                Some((_, c)) => value.push(c),
                None => break,
            }
        }

        Err(self.error("unterminated string", start))
    }

    fn read_regex(&mut self) -> Result<Token, LexError> {
        let start = self.position;
        self.advance(); // consume opening '/'

        let mut pattern = String::new();

        loop {
            match self.advance() {
                Some((_, '\\')) => match self.advance() {
                    Some((_, '/')) => pattern.push('/'),
                    Some((_, c)) => {
                        pattern.push('\\');
                        pattern.push(c);
                    }
                    None => return Err(self.error("unterminated regex", start)),
                },
                Some((_, '/')) => break,
                Some((_, c)) => pattern.push(c),
                None => return Err(self.error("unterminated regex", start)),
            }
        }

        let mut flags = String::new();
        while let Some(&(pos, ch)) = self.chars.peek() {
            if !ch.is_ascii_alphabetic() {
                break;
            }
            if !matches!(ch, 'i' | 'm' | 's') {
                return Err(self.error(&format!("unsupported regex flag '{}'", ch), pos));
            }
            flags.push(ch);
            self.advance();
        }

        Ok(Token::Regex { pattern, flags })
    }

    fn read_keyword(&mut self) -> Result<Token, LexError> {
        let start = self.position;
        let word = self.read_name();

        match word.as_str() {
            "null" => Ok(Token::Null),
            _ => Err(self.error(
                &format!("unexpected identifier '{}' (variables start with '$')", word),
                start,
            )),
        }
    }
}
