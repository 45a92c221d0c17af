use rust_decimal::Decimal;
use thiserror::Error;

use crate::ast::Token;

/// Errors raised while tokenizing query text. Offsets are in characters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LexError {
    #[error("unterminated string literal starting at offset {0}")]
    UnterminatedString(usize),

    #[error("invalid escape sequence '\\{escape}' at offset {position}")]
    InvalidEscape { escape: char, position: usize },

    #[error("invalid character literal at offset {0}")]
    InvalidChar(usize),

    #[error("invalid number literal '{literal}' at offset {position}")]
    InvalidNumber { literal: String, position: usize },

    #[error("unexpected character '{ch}' at offset {position}")]
    UnexpectedChar { ch: char, position: usize },
}

pub struct Lexer {
    input: Vec<char>,
    position: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Lexer {
            input: input.chars().collect(),
            position: 0,
        }
    }

    /// Offset of the next unread character.
    pub fn position(&self) -> usize {
        self.position
    }

    fn current_char(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn peek_char(&self, offset: usize) -> Option<char> {
        self.input.get(self.position + offset).copied()
    }

    fn advance(&mut self) {
        self.position += 1;
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current_char() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_identifier(&mut self) -> String {
        let mut result = String::new();
        while let Some(ch) = self.current_char() {
            if ch.is_alphanumeric() || ch == '_' {
                result.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        result
    }

    fn read_escape(&mut self) -> Result<char, LexError> {
        let position = self.position;
        self.advance(); // backslash
        let escaped = match self.current_char() {
            Some('n') => '\n',
            Some('t') => '\t',
            Some('r') => '\r',
            Some('0') => '\0',
            Some('\\') => '\\',
            Some('"') => '"',
            Some('\'') => '\'',
            Some(ch) => return Err(LexError::InvalidEscape { escape: ch, position }),
            None => return Err(LexError::UnterminatedString(position)),
        };
        self.advance();
        Ok(escaped)
    }

    fn read_string(&mut self) -> Result<String, LexError> {
        let start = self.position;
        let mut result = String::new();
        self.advance(); // opening quote

        while let Some(ch) = self.current_char() {
            match ch {
                '"' => {
                    self.advance();
                    return Ok(result);
                }
                '\\' => result.push(self.read_escape()?),
                _ => {
                    result.push(ch);
                    self.advance();
                }
            }
        }

        Err(LexError::UnterminatedString(start))
    }

    fn read_char(&mut self) -> Result<char, LexError> {
        let start = self.position;
        self.advance(); // opening quote
        let ch = match self.current_char() {
            Some('\\') => self.read_escape()?,
            Some('\'') | None => return Err(LexError::InvalidChar(start)),
            Some(ch) => {
                self.advance();
                ch
            }
        };
        if self.current_char() != Some('\'') {
            return Err(LexError::InvalidChar(start));
        }
        self.advance();
        Ok(ch)
    }

    fn read_number(&mut self) -> Result<Token, LexError> {
        let start = self.position;
        let mut literal = String::new();
        let mut is_real = false;

        while let Some(ch) = self.current_char() {
            match ch {
                '0'..='9' | '_' => {
                    if ch != '_' {
                        literal.push(ch);
                    }
                    self.advance();
                }
                '.' if !is_real && self.peek_char(1).is_some_and(|c| c.is_ascii_digit()) => {
                    is_real = true;
                    literal.push(ch);
                    self.advance();
                }
                'e' | 'E' if !literal.contains(['e', 'E']) => {
                    is_real = true;
                    literal.push(ch);
                    self.advance();
                    if let Some(sign @ ('+' | '-')) = self.current_char() {
                        literal.push(sign);
                        self.advance();
                    }
                }
                _ => break,
            }
        }

        let invalid = |literal: &str| LexError::InvalidNumber {
            literal: literal.to_string(),
            position: start,
        };

        let suffix = self.current_char().map(|c| c.to_ascii_lowercase());
        match suffix {
            Some('m') => {
                self.advance();
                let value = if literal.contains(['e', 'E']) {
                    Decimal::from_scientific(&literal)
                } else {
                    literal.parse::<Decimal>()
                };
                value.map(Token::Decimal).map_err(|_| invalid(&literal))
            }
            Some('l') if !is_real => {
                self.advance();
                literal.parse().map(Token::Long).map_err(|_| invalid(&literal))
            }
            Some('d') | Some('f') => {
                self.advance();
                literal.parse().map(Token::Double).map_err(|_| invalid(&literal))
            }
            _ if is_real => literal.parse().map(Token::Double).map_err(|_| invalid(&literal)),
            _ => literal.parse().map(Token::Integer).map_err(|_| invalid(&literal)),
        }
    }

    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace();

        let position = self.position;
        let Some(ch) = self.current_char() else {
            return Ok(Token::Eof);
        };

        let token = match ch {
            '"' => return self.read_string().map(Token::String),
            '\'' => return self.read_char().map(Token::Char),
            '0'..='9' => return self.read_number(),
            c if c.is_alphabetic() || c == '_' || c == '@' => {
                if c == '@' {
                    // verbatim identifier: never a keyword
                    self.advance();
                    return Ok(Token::Identifier(self.read_identifier()));
                }
                let ident = self.read_identifier();
                return Ok(match ident.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "new" => Token::New,
                    "is" => Token::Is,
                    _ => Token::Identifier(ident),
                });
            }
            '.' => Token::Dot,
            ',' => Token::Comma,
            ':' => Token::Colon,
            '(' => Token::LeftParen,
            ')' => Token::RightParen,
            '[' => Token::LeftBracket,
            ']' => Token::RightBracket,
            '{' => Token::LeftBrace,
            '}' => Token::RightBrace,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '?' => {
                if self.peek_char(1) == Some('?') {
                    self.advance();
                    Token::QuestionQuestion
                } else {
                    Token::Question
                }
            }
            '=' => match self.peek_char(1) {
                Some('=') => {
                    self.advance();
                    Token::EqualEqual
                }
                Some('>') => {
                    self.advance();
                    Token::Arrow
                }
                _ => Token::Assign,
            },
            '!' => {
                if self.peek_char(1) == Some('=') {
                    self.advance();
                    Token::NotEqual
                } else {
                    Token::Bang
                }
            }
            '<' => {
                if self.peek_char(1) == Some('=') {
                    self.advance();
                    Token::LessEqual
                } else {
                    Token::Less
                }
            }
            '>' => {
                if self.peek_char(1) == Some('=') {
                    self.advance();
                    Token::GreaterEqual
                } else {
                    Token::Greater
                }
            }
            '&' if self.peek_char(1) == Some('&') => {
                self.advance();
                Token::AndAnd
            }
            '|' if self.peek_char(1) == Some('|') => {
                self.advance();
                Token::OrOr
            }
            ch => return Err(LexError::UnexpectedChar { ch, position }),
        };

        self.advance();
        Ok(token)
    }

    /// Tokenize the remaining input, pairing each token with its start offset.
    pub fn tokenize(&mut self) -> Result<Vec<(Token, usize)>, LexError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace();
            let position = self.position;
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push((token, position));
            if done {
                return Ok(tokens);
            }
        }
    }
}
