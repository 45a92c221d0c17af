// tests/execution_tests.rs

use docstage::capabilities::TranslationOptions;
use docstage::doc;
use docstage::environment::{Environment, HostFunction};
use docstage::execution::memory::InMemoryAdapter;
use docstage::execution::{ExecutionError, QueryResult};
use docstage::registry::SerializerRegistry;
use docstage::serializer::{ClassMap, Serializer};
use docstage::translate::QueryTranslator;
use docstage::value::Value;

fn registry() -> SerializerRegistry {
    let mut registry = SerializerRegistry::new();
    registry.register(
        ClassMap::builder("Person")
            .member("Id", Serializer::Int32)
            .member("Name", Serializer::String)
            .member("X", Serializer::Int32)
            .member("A", Serializer::Int32)
            .member("Tags", Serializer::array(Serializer::String))
            .build(),
    );
    registry
}

fn env() -> Environment {
    Environment::new()
        .with_source("docs", "people", "Person")
        .with_capture("obj", Value::Array(vec![1.into(), 2.into(), 3.into()]))
        .with_function(HostFunction::new("Shout", false, |args: &[Value]| {
            let name = args.first().and_then(Value::as_str).unwrap_or_default();
            Ok(Value::String(format!("{}!", name.to_uppercase())))
        }))
}

fn people() -> InMemoryAdapter {
    InMemoryAdapter::new().with_collection(
        "people",
        vec![
            Value::Document(doc! { "_id" => 1, "Name" => "John", "X" => 1, "A" => 5, "Tags" => vec![Value::from("red")] }),
            Value::Document(doc! { "_id" => 2, "Name" => "John", "X" => 4, "A" => 7, "Tags" => Vec::<Value>::new() }),
            Value::Document(doc! { "_id" => 3, "Name" => "Jane", "X" => 2, "A" => 1, "Tags" => vec![Value::from("blue")] }),
        ],
    )
}

fn run_with(options: TranslationOptions, query: &str) -> QueryResult {
    let registry = registry();
    let query = QueryTranslator::new(&registry)
        .with_options(options)
        .translate_text(query, &env())
        .unwrap_or_else(|e| panic!("failed to translate: {}", e));
    query.execute(&people()).unwrap()
}

fn run(query: &str) -> QueryResult {
    run_with(TranslationOptions::default(), query)
}

fn ids(result: QueryResult) -> Vec<i64> {
    result
        .into_values()
        .iter()
        .filter_map(|v| v.as_document().and_then(|d| d.get("_id")).and_then(Value::as_i64))
        .collect()
}

// ============================================================================
// Sequences
// ============================================================================

#[test]
fn test_membership_in_captured_values() {
    assert_eq!(ids(run("docs.Where(x => obj.Any(y => x.X == y))")), vec![1, 3]);
}

#[test]
fn test_groups_sorted_by_size() {
    assert_eq!(
        run("docs.GroupBy(x => x.Name).OrderBy(g => g.Count()).Select(g => g.Key)"),
        QueryResult::Sequence(vec!["Jane".into(), "John".into()])
    );
}

#[test]
fn test_grouped_totals() {
    assert_eq!(
        run("docs.GroupBy(x => x.Name).Select(g => new { Name = g.Key, Total = g.Sum(x => x.A) })"),
        QueryResult::Sequence(vec![
            Value::Document(doc! { "Name" => "John", "Total" => 12 }),
            Value::Document(doc! { "Name" => "Jane", "Total" => 1 }),
        ])
    );
}

#[test]
fn test_case_insensitive_match() {
    assert_eq!(ids(run("docs.Where(x => x.Name.ToLower() == \"john\")")), vec![1, 2]);
}

#[test]
fn test_unreachable_literal_returns_nothing() {
    assert_eq!(run("docs.Where(x => x.Name.ToLower() == \"JOHN\")"), QueryResult::Sequence(Vec::new()));
}

#[test]
fn test_projection_values_are_unwrapped() {
    assert_eq!(
        run("docs.OrderByDescending(x => x.A).Select(x => x.Name + \"!\")"),
        QueryResult::Sequence(vec!["John!".into(), "John!".into(), "Jane!".into()])
    );
}

#[test]
fn test_non_empty_arrays() {
    assert_eq!(ids(run("docs.Where(x => x.Tags.Any())")), vec![1, 3]);
}

#[test]
fn test_element_exclusions() {
    assert_eq!(ids(run("docs.Where(x => x.Tags.Any(t => t != \"red\" && t != \"green\"))")), vec![3]);
}

#[test]
fn test_widening_cast_results_are_long() {
    assert_eq!(
        run("docs.Select(x => (long)x.A)"),
        QueryResult::Sequence(vec![Value::Int64(5), Value::Int64(7), Value::Int64(1)])
    );
}

#[test]
fn test_paging() {
    assert_eq!(ids(run("docs.OrderBy(x => x.X).Skip(1).Take(1)")), vec![3]);
}

// ============================================================================
// Scalars
// ============================================================================

#[test]
fn test_count() {
    assert_eq!(run("docs.Count()"), QueryResult::Scalar(Value::Int32(3)));
    assert_eq!(run("docs.Count(x => x.A > 100)"), QueryResult::Scalar(Value::Int32(0)));
    assert_eq!(run("docs.LongCount(x => x.A > 1)"), QueryResult::Scalar(Value::Int64(2)));
}

#[test]
fn test_any_and_all() {
    assert_eq!(run("docs.Any(x => x.Name == \"Jane\")"), QueryResult::Scalar(Value::Boolean(true)));
    assert_eq!(run("docs.Any(x => x.Name == \"Bob\")"), QueryResult::Scalar(Value::Boolean(false)));
    assert_eq!(run("docs.All(x => x.A > 0)"), QueryResult::Scalar(Value::Boolean(true)));
}

#[test]
fn test_sum_and_max() {
    assert_eq!(run("docs.Sum(x => x.A)"), QueryResult::Scalar(Value::Int32(13)));
    assert_eq!(run("docs.Max(x => x.X)"), QueryResult::Scalar(Value::Int32(4)));
}

fn deviation(query: &str) -> f64 {
    match run(query) {
        QueryResult::Scalar(Value::Double(d)) => d,
        other => panic!("expected a double, got {:?}", other),
    }
}

#[test]
fn test_standard_deviation() {
    assert!((deviation("docs.StandardDeviationPop(x => x.A)") - 2.494438).abs() < 1e-6);
    assert!((deviation("docs.StandardDeviationSamp(x => x.A)") - 3.055050).abs() < 1e-6);
}

#[test]
fn test_grouped_deviation() {
    assert_eq!(
        run("docs.GroupBy(x => x.Name).Select(g => g.StandardDeviationPop(x => x.A))"),
        QueryResult::Sequence(vec![Value::Double(1.0), Value::Double(0.0)])
    );
}

#[test]
fn test_first() {
    let QueryResult::Scalar(first) = run("docs.First(x => x.Name == \"Jane\")") else {
        panic!("expected a scalar");
    };
    assert_eq!(first.as_document().and_then(|d| d.get("_id")), Some(&Value::Int32(3)));
}

#[test]
fn test_first_of_nothing_fails() {
    let registry = registry();
    let query = QueryTranslator::new(&registry)
        .translate_text("docs.First(x => x.A > 100)", &env())
        .unwrap();
    assert_eq!(query.execute(&people()), Err(ExecutionError::EmptySequence));
}

// ============================================================================
// Client Fallback
// ============================================================================

#[test]
fn test_projection_falls_back_to_the_client() {
    let fallback = TranslationOptions { enable_client_side_fallback: true };
    assert_eq!(
        run_with(fallback, "docs.Where(x => x.A > 1).Select(x => Shout(x.Name))"),
        QueryResult::Sequence(vec!["JOHN!".into(), "JOHN!".into()])
    );
}

#[test]
fn test_client_steps_keep_query_order() {
    let fallback = TranslationOptions { enable_client_side_fallback: true };
    let registry = registry();
    let query = QueryTranslator::new(&registry)
        .with_options(fallback)
        .translate_text("docs.Select(x => Shout(x.Name)).Skip(1).Take(1)", &env())
        .unwrap();
    assert_eq!(
        query.pipeline_text(),
        vec!["{ $project : { _snippets : ['$Name'], _id : 0 } }"]
    );
    assert_eq!(query.execute(&people()), Ok(QueryResult::Sequence(vec!["JOHN!".into()])));
}

fn fallback() -> TranslationOptions {
    TranslationOptions { enable_client_side_fallback: true }
}

#[test]
fn test_client_ordering() {
    assert_eq!(
        run_with(fallback(), "docs.Where(x => Shout(x.Name) != \"\").OrderByDescending(x => x.A).Select(x => x.Id)"),
        QueryResult::Sequence(vec![Value::Int32(2), Value::Int32(1), Value::Int32(3)])
    );
}

#[test]
fn test_client_grouping_keeps_first_appearance_order() {
    assert_eq!(
        run_with(fallback(), "docs.Where(x => Shout(x.Name) != \"\").GroupBy(x => x.Name).Select(g => g.Key)"),
        QueryResult::Sequence(vec!["John".into(), "Jane".into()])
    );
    assert_eq!(
        run_with(fallback(), "docs.Where(x => Shout(x.Name) != \"\").GroupBy(x => x.Name).Select(g => g.Count())"),
        QueryResult::Sequence(vec![Value::Int32(2), Value::Int32(1)])
    );
}

#[test]
fn test_client_flattening_and_distinct() {
    assert_eq!(
        run_with(fallback(), "docs.Where(x => Shout(x.Name) != \"\").SelectMany(x => x.Tags)"),
        QueryResult::Sequence(vec!["red".into(), "blue".into()])
    );
    assert_eq!(
        run_with(fallback(), "docs.Where(x => Shout(x.Name) != \"\").Select(x => x.Name).Distinct()"),
        QueryResult::Sequence(vec!["John".into(), "Jane".into()])
    );
}

#[test]
fn test_same_query_runs_twice() {
    let registry = registry();
    let query = QueryTranslator::new(&registry)
        .translate_text("docs.Where(x => x.A > 1)", &env())
        .unwrap();
    let adapter = people();
    assert_eq!(query.execute(&adapter), query.execute(&adapter));
}
