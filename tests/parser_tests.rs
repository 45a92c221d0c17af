// tests/parser_tests.rs

use docstage::ast::{BinOp, Expr, TypeRef, UnaryOp};
use docstage::parser::{ParseError, parse_query};
use docstage::value::Value;

fn parse(text: &str) -> Expr {
    parse_query(text).unwrap_or_else(|e| panic!("failed to parse {:?}: {}", text, e))
}

/// Parse, print and compare against the expected canonical text.
fn assert_prints(text: &str, expected: &str) {
    assert_eq!(parse(text).to_string(), expected, "canonical form of: {}", text);
}

// ============================================================================
// Literals
// ============================================================================

#[test]
fn test_integer_literals_pick_their_width() {
    assert_eq!(parse("42"), Expr::Constant(Value::Int32(42)));
    assert_eq!(parse("42L"), Expr::Constant(Value::Int64(42)));
    assert_eq!(parse("3000000000"), Expr::Constant(Value::Int64(3_000_000_000)));
}

#[test]
fn test_negative_literals_are_folded() {
    assert_eq!(parse("-5"), Expr::Constant(Value::Int32(-5)));
    assert_eq!(parse("-x"), Expr::unary(UnaryOp::Negate, Expr::ident("x")));
}

#[test]
fn test_char_literal_is_a_one_character_string() {
    assert_eq!(parse("'c'"), Expr::Constant(Value::String("c".into())));
}

// ============================================================================
// Operators and Precedence
// ============================================================================

#[test]
fn test_multiplication_binds_tighter() {
    let expr = parse("1 + 2 * 3");
    assert!(matches!(expr, Expr::Binary { op: BinOp::Add, .. }));
    assert_prints("(1 + 2) * 3", "(1 + 2) * 3");
    assert_prints("a - (b - c)", "a - (b - c)");
}

#[test]
fn test_logical_operators() {
    let expr = parse("a || b && c");
    let Expr::Binary { op: BinOp::OrElse, right, .. } = expr else {
        panic!("expected ||");
    };
    assert!(matches!(*right, Expr::Binary { op: BinOp::AndAlso, .. }));
}

#[test]
fn test_coalesce_is_right_associative() {
    let expr = parse("a ?? b ?? c");
    let Expr::Binary { op: BinOp::Coalesce, left, right } = expr else {
        panic!("expected ??");
    };
    assert_eq!(*left, Expr::ident("a"));
    assert!(matches!(*right, Expr::Binary { op: BinOp::Coalesce, .. }));
}

#[test]
fn test_conditional() {
    assert_prints("x => x.Age >= 18 ? \"adult\" : \"minor\"", "x => x.Age >= 18 ? \"adult\" : \"minor\"");
}

// ============================================================================
// Lambdas and Query Chains
// ============================================================================

#[test]
fn test_query_chain() {
    assert_prints(
        "docs.Where(x => x.A == 1 && x.B > 2).OrderBy(x => x.Name).Take(10)",
        "docs.Where(x => x.A == 1 && x.B > 2).OrderBy(x => x.Name).Take(10)",
    );
}

#[test]
fn test_two_parameter_lambda() {
    let expr = parse("(acc, item) => acc + item");
    let Expr::Lambda { params, .. } = &expr else {
        panic!("expected a lambda");
    };
    assert_eq!(params, &vec!["acc".to_string(), "item".to_string()]);
    assert_eq!(expr.to_string(), "(acc, item) => acc + item");
}

#[test]
fn test_generic_method_arguments() {
    let expr = parse("docs.OfType<Cat>()");
    let Expr::Call { method, type_args, args, .. } = expr else {
        panic!("expected a call");
    };
    assert_eq!(method, "OfType");
    assert_eq!(type_args, vec![TypeRef::Named("Cat".into())]);
    assert!(args.is_empty());
}

#[test]
fn test_less_than_is_not_a_type_argument_list() {
    let expr = parse("x => x.A < b");
    let Expr::Lambda { body, .. } = expr else {
        panic!("expected a lambda");
    };
    assert!(matches!(*body, Expr::Binary { op: BinOp::LessThan, .. }));
}

#[test]
fn test_indexers() {
    assert_prints("x => x.Tags[0]", "x => x.Tags[0]");
    assert_prints("x => x.Attributes[\"color\"]", "x => x.Attributes[\"color\"]");
}

// ============================================================================
// Casts and Type Tests
// ============================================================================

#[test]
fn test_cast() {
    let expr = parse("(decimal)x.Price");
    assert!(matches!(expr, Expr::Convert { to: TypeRef::Decimal, .. }));
    assert_eq!(expr.to_string(), "(decimal)x.Price");
}

#[test]
fn test_parenthesized_member_is_not_a_cast() {
    assert!(matches!(parse("(x.A) + 1"), Expr::Binary { op: BinOp::Add, .. }));
}

#[test]
fn test_nullable_cast() {
    assert!(matches!(
        parse("(int?)x.A"),
        Expr::Convert { to: TypeRef::Nullable(_), .. }
    ));
}

#[test]
fn test_type_test() {
    assert_eq!(
        parse("x is Cat"),
        Expr::TypeIs { operand: Box::new(Expr::ident("x")), type_name: "Cat".into() }
    );
    assert!(matches!(parse("x is Cat ? 1 : 2"), Expr::Conditional { .. }));
    assert!(matches!(parse("x is int?"), Expr::TypeIs { type_name, .. } if type_name == "int?"));
}

// ============================================================================
// Object and Array Construction
// ============================================================================

#[test]
fn test_anonymous_object_infers_member_names() {
    assert_prints(
        "x => new { x.Name, Total = x.A + 1 }",
        "x => new { Name = x.Name, Total = x.A + 1 }",
    );
}

#[test]
fn test_named_object() {
    assert_prints("x => new Summary { Name = x.Name }", "x => new Summary { Name = x.Name }");
}

#[test]
fn test_array_construction() {
    assert_eq!(
        parse("new[] { 1, 2 }"),
        Expr::NewArray(vec![Expr::constant(1), Expr::constant(2)])
    );
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_missing_lambda_body() {
    assert_eq!(
        parse_query("docs.Where(x => )"),
        Err(ParseError::Unexpected { found: "')'".into(), position: 16 })
    );
}

#[test]
fn test_unnamed_member_declarator() {
    assert_eq!(parse_query("new { x.A + 1 }"), Err(ParseError::InvalidMember(6)));
}

#[test]
fn test_unclosed_argument_list() {
    assert!(matches!(
        parse_query("docs.Where(x => x.A"),
        Err(ParseError::Expected { .. })
    ));
}

#[test]
fn test_trailing_tokens() {
    assert!(matches!(parse_query("x.A y"), Err(ParseError::Unexpected { .. })));
}

#[test]
fn test_lex_errors_propagate() {
    assert!(matches!(parse_query("x.A & 1"), Err(ParseError::Lex(_))));
}
