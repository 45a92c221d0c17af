// tests/transform_tests.rs

use docstage::ast::{BinOp, Expr};
use docstage::environment::{Environment, HostFunction};
use docstage::error::TranslationError;
use docstage::normalizer::normalize;
use docstage::parser::parse_query;
use docstage::transform::{any_node, children, free_parameters, map_children, references_parameter};
use docstage::value::Value;

fn env() -> Environment {
    Environment::new()
        .with_source("docs", "people", "Person")
        .with_capture("obj", Value::Array(vec![1.into(), 2.into(), 3.into()]))
        .with_function(HostFunction::new("Shout", false, |args: &[Value]| {
            Ok(args.first().cloned().unwrap_or(Value::Null))
        }))
}

fn normalized(text: &str) -> Expr {
    let expr = parse_query(text).unwrap_or_else(|e| panic!("failed to parse {:?}: {}", text, e));
    normalize(&expr, &env()).unwrap_or_else(|e| panic!("failed to normalize {:?}: {}", text, e))
}

/// Body of the single lambda argument of a top-level call.
fn lambda_body(expr: &Expr) -> (&str, &Expr) {
    let Expr::Call { args, .. } = expr else {
        panic!("expected a call, got {}", expr);
    };
    args[0].as_lambda1().unwrap_or_else(|| panic!("expected a lambda in {}", expr))
}

// ============================================================================
// Children and Rebuilding
// ============================================================================

#[test]
fn test_children_in_evaluation_order() {
    let expr = Expr::call(Expr::param("x"), "Substring", vec![Expr::constant(1), Expr::constant(2)]);
    assert_eq!(
        children(&expr),
        vec![&Expr::param("x"), &Expr::constant(1), &Expr::constant(2)]
    );
    assert!(children(&Expr::constant("leaf")).is_empty());
}

#[test]
fn test_map_children_rebuilds_one_level() {
    let expr = Expr::binary(
        BinOp::Add,
        Expr::member(Expr::param("x"), "A"),
        Expr::constant(1),
    );
    let rebuilt = map_children(&expr, &mut |child| {
        Ok::<_, ()>(match child {
            Expr::Constant(Value::Int32(n)) => Expr::constant(n * 10),
            other => other.clone(),
        })
    })
    .unwrap();
    assert_eq!(
        rebuilt,
        Expr::binary(BinOp::Add, Expr::member(Expr::param("x"), "A"), Expr::constant(10))
    );
}

#[test]
fn test_map_children_stops_at_the_first_error() {
    let expr = Expr::binary(BinOp::Add, Expr::constant(1), Expr::constant(2));
    let mut visited = 0;
    let result = map_children(&expr, &mut |_| {
        visited += 1;
        Err::<Expr, _>("boom")
    });
    assert_eq!(result, Err("boom"));
    assert_eq!(visited, 1);
}

// ============================================================================
// Parameter Usage
// ============================================================================

#[test]
fn test_free_parameters_in_first_occurrence_order() {
    let expr = Expr::binary(
        BinOp::Add,
        Expr::member(Expr::param("b"), "A"),
        Expr::binary(BinOp::Add, Expr::param("a"), Expr::param("b")),
    );
    assert_eq!(free_parameters(&expr), vec!["b".to_string(), "a".to_string()]);
}

#[test]
fn test_lambda_binds_its_parameters() {
    let expr = Expr::lambda(
        &["acc", "item"],
        Expr::binary(BinOp::Add, Expr::param("acc"), Expr::param("outer")),
    );
    assert_eq!(free_parameters(&expr), vec!["outer".to_string()]);
    assert!(references_parameter(&expr, "outer"));
    assert!(!references_parameter(&expr, "acc"));
}

#[test]
fn test_inner_lambda_shadows_outer_parameter() {
    let inner = Expr::lambda(&["x"], Expr::member(Expr::param("x"), "A"));
    let outer = Expr::lambda(
        &["x"],
        Expr::call(Expr::member(Expr::param("x"), "Items"), "Any", vec![inner.clone()]),
    );
    assert!(references_parameter(&Expr::call(Expr::param("x"), "Any", vec![inner]), "x"));
    assert!(free_parameters(&outer).is_empty());
}

#[test]
fn test_any_node() {
    let expr = Expr::binary(BinOp::Equal, Expr::member(Expr::param("x"), "Name"), Expr::constant("a"));
    assert!(any_node(&expr, &|e| matches!(e, Expr::Member { name, .. } if name == "Name")));
    assert!(!any_node(&expr, &|e| matches!(e, Expr::Source(_))));
}

// ============================================================================
// Normalization
// ============================================================================

#[test]
fn test_parameters_resolve_and_sources_bind() {
    let expr = normalized("docs.Where(x => x.A == 1)");
    let Expr::Call { target: Some(target), .. } = &expr else {
        panic!("expected a call");
    };
    assert!(matches!(target.as_ref(), Expr::Source(source) if source.name == "docs"));
    let (param, body) = lambda_body(&expr);
    assert_eq!(param, "x");
    assert!(references_parameter(body, "x"));
}

#[test]
fn test_unnamed_parameters_get_synthesized_names() {
    let query = Expr::call(
        Expr::ident("docs"),
        "Where",
        vec![Expr::lambda(
            &[""],
            Expr::binary(BinOp::Equal, Expr::member(Expr::ident(""), "A"), Expr::constant(1)),
        )],
    );
    let expr = normalize(&query, &env()).unwrap();
    assert_eq!(expr.to_string(), "docs.Where(_p0 => _p0.A == 1)");
}

#[test]
fn test_method_group_becomes_a_lambda() {
    assert_eq!(
        normalized("docs.Select(Shout)").to_string(),
        "docs.Select(_p0 => Shout(_p0))"
    );
}

#[test]
fn test_any_over_captured_values_becomes_contains() {
    let expr = normalized("docs.Where(x => obj.Any(y => x.X == y))");
    let (_, body) = lambda_body(&expr);
    let Expr::Call { target: Some(values), method, args, .. } = body else {
        panic!("expected a call, got {}", body);
    };
    assert_eq!(method, "Contains");
    assert_eq!(values.as_constant(), Some(&Value::Array(vec![1.into(), 2.into(), 3.into()])));
    assert_eq!(args, &vec![Expr::member(Expr::param("x"), "X")]);
}

#[test]
fn test_impure_host_calls_are_not_folded() {
    let expr = normalized("docs.Select(x => Shout(\"a\"))");
    let (_, body) = lambda_body(&expr);
    assert!(matches!(body, Expr::Call { target: None, method, .. } if method == "Shout"));
}

#[test]
fn test_conditional_on_constant_collapses() {
    assert_eq!(
        normalized("docs.Select(x => 1 > 2 ? x.A : x.X)").to_string(),
        "docs.Select(x => x.X)"
    );
}

#[test]
fn test_unknown_names_are_rejected() {
    let expr = parse_query("docs.Where(x => x.A == nope)").unwrap();
    assert_eq!(
        normalize(&expr, &env()),
        Err(TranslationError::UnknownIdentifier("nope".to_string()))
    );
}
