use std::fmt;

use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    /// Integer literal without suffix
    ///
    /// # Examples
    /// ```text
    /// 42
    /// 2147483648   // too wide for int, typed as long by the parser
    /// ```
    Integer(i64),

    /// Integer literal with the `L` suffix
    ///
    /// # Examples
    /// ```text
    /// 42L
    /// ```
    Long(i64),

    /// Floating-point literal
    ///
    /// # Examples
    /// ```text
    /// 3.14
    /// 1e3
    /// 2.5d
    /// ```
    Double(f64),

    /// Decimal literal with the `m` suffix
    ///
    /// # Examples
    /// ```text
    /// 1.5m
    /// 100m
    /// ```
    Decimal(Decimal),

    /// String literal enclosed in double quotes
    String(String),

    /// Character literal enclosed in single quotes
    Char(char),

    True,
    False,
    Null,

    /// `new` keyword (anonymous objects, member initializers, arrays)
    New,

    /// `is` type test keyword
    Is,

    /// Identifier (names, type keywords)
    Identifier(String),

    // Punctuation
    Dot,
    Comma,
    Colon,
    Question,
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    /// Lambda arrow `=>`
    Arrow,
    /// Member initializer `=`
    Assign,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    EqualEqual,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    AndAnd,
    OrOr,
    QuestionQuestion,

    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Integer(n) => write!(f, "{}", n),
            Token::Long(n) => write!(f, "{}L", n),
            Token::Double(n) => write!(f, "{}", n),
            Token::Decimal(d) => write!(f, "{}m", d),
            Token::String(s) => write!(f, "\"{}\"", s),
            Token::Char(c) => write!(f, "'{}'", c),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Null => write!(f, "null"),
            Token::New => write!(f, "new"),
            Token::Is => write!(f, "is"),
            Token::Identifier(name) => write!(f, "{}", name),
            Token::Dot => write!(f, "'.'"),
            Token::Comma => write!(f, "','"),
            Token::Colon => write!(f, "':'"),
            Token::Question => write!(f, "'?'"),
            Token::LeftParen => write!(f, "'('"),
            Token::RightParen => write!(f, "')'"),
            Token::LeftBracket => write!(f, "'['"),
            Token::RightBracket => write!(f, "']'"),
            Token::LeftBrace => write!(f, "'{{'"),
            Token::RightBrace => write!(f, "'}}'"),
            Token::Arrow => write!(f, "'=>'"),
            Token::Assign => write!(f, "'='"),
            Token::Plus => write!(f, "'+'"),
            Token::Minus => write!(f, "'-'"),
            Token::Star => write!(f, "'*'"),
            Token::Slash => write!(f, "'/'"),
            Token::Percent => write!(f, "'%'"),
            Token::Bang => write!(f, "'!'"),
            Token::EqualEqual => write!(f, "'=='"),
            Token::NotEqual => write!(f, "'!='"),
            Token::Less => write!(f, "'<'"),
            Token::LessEqual => write!(f, "'<='"),
            Token::Greater => write!(f, "'>'"),
            Token::GreaterEqual => write!(f, "'>='"),
            Token::AndAnd => write!(f, "'&&'"),
            Token::OrOr => write!(f, "'||'"),
            Token::QuestionQuestion => write!(f, "'??'"),
            Token::Eof => write!(f, "end of input"),
        }
    }
}
