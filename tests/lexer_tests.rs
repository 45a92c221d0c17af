// tests/lexer_tests.rs

use docstage::ast::Token;
use docstage::lexer::{LexError, Lexer};
use rust_decimal::Decimal;

fn single(input: &str) -> Token {
    let mut lexer = Lexer::new(input);
    let token = lexer.next_token().unwrap();
    assert_eq!(lexer.next_token().unwrap(), Token::Eof, "trailing input in: {}", input);
    token
}

// ============================================================================
// Punctuation and Operators
// ============================================================================

#[test]
fn test_single_char_tokens() {
    let test_cases = vec![
        (".", Token::Dot),
        (",", Token::Comma),
        (":", Token::Colon),
        ("?", Token::Question),
        ("(", Token::LeftParen),
        (")", Token::RightParen),
        ("[", Token::LeftBracket),
        ("]", Token::RightBracket),
        ("{", Token::LeftBrace),
        ("}", Token::RightBrace),
        ("=", Token::Assign),
        ("+", Token::Plus),
        ("-", Token::Minus),
        ("*", Token::Star),
        ("/", Token::Slash),
        ("%", Token::Percent),
        ("!", Token::Bang),
        ("<", Token::Less),
        (">", Token::Greater),
    ];

    for (input, expected) in test_cases {
        assert_eq!(single(input), expected, "Failed for input: {}", input);
    }
}

#[test]
fn test_two_char_tokens() {
    let test_cases = vec![
        ("=>", Token::Arrow),
        ("==", Token::EqualEqual),
        ("!=", Token::NotEqual),
        ("<=", Token::LessEqual),
        (">=", Token::GreaterEqual),
        ("&&", Token::AndAnd),
        ("||", Token::OrOr),
        ("??", Token::QuestionQuestion),
    ];

    for (input, expected) in test_cases {
        assert_eq!(single(input), expected, "Failed for input: {}", input);
    }
}

#[test]
fn test_lambda_arrow_vs_assignment() {
    let mut lexer = Lexer::new("x => new { A = x }");
    let tokens: Vec<Token> = lexer.tokenize().unwrap().into_iter().map(|(t, _)| t).collect();
    assert_eq!(
        tokens,
        vec![
            Token::Identifier("x".into()),
            Token::Arrow,
            Token::New,
            Token::LeftBrace,
            Token::Identifier("A".into()),
            Token::Assign,
            Token::Identifier("x".into()),
            Token::RightBrace,
            Token::Eof,
        ]
    );
}

#[test]
fn test_single_ampersand_is_invalid() {
    let mut lexer = Lexer::new("a & b");
    lexer.next_token().unwrap();
    assert_eq!(
        lexer.next_token(),
        Err(LexError::UnexpectedChar { ch: '&', position: 2 })
    );
}

// ============================================================================
// Keywords and Identifiers
// ============================================================================

#[test]
fn test_keywords() {
    let test_cases = vec![
        ("true", Token::True),
        ("false", Token::False),
        ("null", Token::Null),
        ("new", Token::New),
        ("is", Token::Is),
    ];

    for (input, expected) in test_cases {
        assert_eq!(single(input), expected, "Failed for input: {}", input);
    }
}

#[test]
fn test_keywords_vs_identifiers() {
    for input in ["newer", "island", "nullable", "truth", "_is", "News"] {
        assert_eq!(single(input), Token::Identifier(input.to_string()), "Failed for input: {}", input);
    }
}

#[test]
fn test_verbatim_identifier() {
    assert_eq!(single("@new"), Token::Identifier("new".into()));
}

// ============================================================================
// Numeric Literals
// ============================================================================

#[test]
fn test_integer_widths() {
    assert_eq!(single("42"), Token::Integer(42));
    assert_eq!(single("42L"), Token::Long(42));
    assert_eq!(single("1_000"), Token::Integer(1000));
}

#[test]
fn test_real_literals() {
    assert_eq!(single("3.25"), Token::Double(3.25));
    assert_eq!(single("1e3"), Token::Double(1000.0));
    assert_eq!(single("2d"), Token::Double(2.0));
    assert_eq!(single("1.5m"), Token::Decimal(Decimal::new(15, 1)));
    assert_eq!(single("100M"), Token::Decimal(Decimal::from(100)));
}

#[test]
fn test_member_access_on_number_is_not_a_fraction() {
    let mut lexer = Lexer::new("1.ToString");
    assert_eq!(lexer.next_token().unwrap(), Token::Integer(1));
    assert_eq!(lexer.next_token().unwrap(), Token::Dot);
}

// ============================================================================
// String and Character Literals
// ============================================================================

#[test]
fn test_string_escapes() {
    assert_eq!(single(r#""a\"b\n""#), Token::String("a\"b\n".into()));
}

#[test]
fn test_char_literal() {
    assert_eq!(single("'x'"), Token::Char('x'));
    assert_eq!(single(r"'\''"), Token::Char('\''));
}

#[test]
fn test_unterminated_string() {
    let mut lexer = Lexer::new("x == \"abc");
    lexer.next_token().unwrap();
    lexer.next_token().unwrap();
    assert_eq!(lexer.next_token(), Err(LexError::UnterminatedString(5)));
}

#[test]
fn test_invalid_escape() {
    let mut lexer = Lexer::new(r#""\q""#);
    assert!(matches!(
        lexer.next_token(),
        Err(LexError::InvalidEscape { escape: 'q', .. })
    ));
}

#[test]
fn test_token_offsets() {
    let mut lexer = Lexer::new("a.B  == 1");
    let offsets: Vec<usize> = lexer.tokenize().unwrap().into_iter().map(|(_, p)| p).collect();
    assert_eq!(offsets, vec![0, 1, 2, 5, 8, 9]);
}
