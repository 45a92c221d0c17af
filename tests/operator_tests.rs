// tests/operator_tests.rs

use docstage::capabilities::{Capabilities, ServerVersion};
use docstage::doc;
use docstage::environment::Environment;
use docstage::error::TranslationError;
use docstage::execution::memory::InMemoryAdapter;
use docstage::execution::{ExecutionError, QueryResult};
use docstage::registry::{DiscriminatorConvention, SerializerRegistry};
use docstage::serializer::{ClassMap, DecimalRepresentation, DictionaryRepresentation, Serializer};
use docstage::translate::QueryTranslator;
use docstage::value::Value;

fn registry(convention: DiscriminatorConvention) -> SerializerRegistry {
    let mut registry = SerializerRegistry::new().with_convention(convention);
    registry
        .register(
            ClassMap::builder("Animal")
                .member("Id", Serializer::Int32)
                .member("Name", Serializer::String)
                .member("Born", Serializer::DateTime)
                .member("Price", Serializer::Decimal(DecimalRepresentation::Decimal128))
                .member("Scores", Serializer::array(Serializer::Int32))
                .member("Ranks", Serializer::array(Serializer::Int32))
                .member(
                    "Attrs",
                    Serializer::Dictionary {
                        representation: DictionaryRepresentation::Document,
                        key: Box::new(Serializer::String),
                        value: Box::new(Serializer::Int32),
                    },
                )
                .member(
                    "Pairs",
                    Serializer::Dictionary {
                        representation: DictionaryRepresentation::ArrayOfArrays,
                        key: Box::new(Serializer::String),
                        value: Box::new(Serializer::Int32),
                    },
                )
                .build(),
        )
        .register(
            ClassMap::builder("Cat")
                .base_type("Animal")
                .member("Lives", Serializer::Int32)
                .build(),
        )
        .register(ClassMap::builder("Lion").base_type("Cat").build());
    registry
}

fn env() -> Environment {
    Environment::new().with_source("animals", "animals", "Animal")
}

fn translate_on(convention: DiscriminatorConvention, capabilities: Capabilities, query: &str) -> Vec<String> {
    let registry = registry(convention);
    QueryTranslator::new(&registry)
        .with_capabilities(capabilities)
        .translate_text(query, &env())
        .unwrap_or_else(|e| panic!("failed to translate {:?}: {}", query, e))
        .pipeline_text()
}

fn translate(query: &str) -> Vec<String> {
    translate_on(DiscriminatorConvention::Scalar, Capabilities::default(), query)
}

fn hierarchical(query: &str) -> Vec<String> {
    translate_on(DiscriminatorConvention::Hierarchical, Capabilities::default(), query)
}

fn error_on(capabilities: Capabilities, query: &str) -> TranslationError {
    let registry = registry(DiscriminatorConvention::Scalar);
    match QueryTranslator::new(&registry).with_capabilities(capabilities).translate_text(query, &env()) {
        Ok(translated) => panic!("expected {:?} to fail, got {:?}", query, translated.pipeline_text()),
        Err(error) => error,
    }
}

fn version(major: u32, minor: u32) -> Capabilities {
    Capabilities::for_version(ServerVersion::new(major, minor))
}

fn zoo() -> InMemoryAdapter {
    InMemoryAdapter::new().with_collection(
        "animals",
        vec![
            Value::Document(doc! {
                "_id" => 1,
                "_t" => "Animal",
                "Name" => "Rex",
                "Born" => Value::DateTime(0),
                "Scores" => vec![Value::from(1), Value::from(2)],
                "Ranks" => vec![Value::from(1), Value::from(2)],
                "Attrs" => Value::Document(doc! { "a" => 1, "b" => 2 }),
            }),
            Value::Document(doc! {
                "_id" => 2,
                "_t" => "Cat",
                "Name" => "Tom",
                "Born" => Value::DateTime(86_400_000),
                "Scores" => vec![Value::from(1), Value::from(2)],
                "Ranks" => vec![Value::from(2), Value::from(1)],
                "Attrs" => Value::Document(doc! { "b" => 3 }),
            }),
            Value::Document(doc! {
                "_id" => 3,
                "_t" => "Lion",
                "Name" => "Leo",
                "Born" => Value::DateTime(0),
                "Scores" => vec![Value::from(1)],
                "Attrs" => Value::Document(doc! {}),
            }),
        ],
    )
}

fn run(query: &str) -> Result<QueryResult, ExecutionError> {
    let registry = registry(DiscriminatorConvention::Scalar);
    let query = QueryTranslator::new(&registry)
        .translate_text(query, &env())
        .unwrap_or_else(|e| panic!("failed to translate: {}", e));
    query.execute(&zoo())
}

fn ids(query: &str) -> Vec<i64> {
    run(query)
        .unwrap()
        .into_values()
        .iter()
        .filter_map(|v| v.as_document().and_then(|d| d.get("_id")).and_then(Value::as_i64))
        .collect()
}

// ============================================================================
// Sequence Equality
// ============================================================================

#[test]
fn test_sequence_equal_zips_both_arrays() {
    assert_eq!(
        translate("animals.Select(x => x.Scores.SequenceEqual(x.Ranks))"),
        vec![concat!(
            "{ $project : { _v : { $and : [",
            "{ $isArray : '$Scores' }, ",
            "{ $isArray : '$Ranks' }, ",
            "{ $eq : [{ $size : '$Scores' }, { $size : '$Ranks' }] }, ",
            "{ $allElementsTrue : [{ $map : { input : { $zip : { inputs : ['$Scores', '$Ranks'] } }, as : 'pair', ",
            "in : { $eq : [{ $arrayElemAt : ['$$pair', 0] }, { $arrayElemAt : ['$$pair', 1] }] } } }] }",
            "] }, _id : 0 } }"
        )]
    );
}

#[test]
fn test_sequence_equal_is_false_for_missing_arrays() {
    assert_eq!(ids("animals.Where(x => x.Scores.SequenceEqual(x.Ranks))"), vec![1]);
}

// ============================================================================
// Type Tests
// ============================================================================

#[test]
fn test_of_type_with_scalar_discriminators() {
    assert_eq!(
        translate("animals.OfType<Cat>()"),
        vec!["{ $match : { _t : { $in : ['Cat', 'Lion'] } } }"]
    );
    assert_eq!(translate("animals.OfType<Lion>()"), vec!["{ $match : { _t : 'Lion' } }"]);
    assert_eq!(
        translate("animals.OfType<Cat>().Where(x => x.Lives > 1)"),
        vec!["{ $match : { _t : { $in : ['Cat', 'Lion'] }, Lives : { $gt : 1 } } }"]
    );
}

#[test]
fn test_of_type_with_hierarchical_discriminators() {
    assert_eq!(hierarchical("animals.OfType<Cat>()"), vec!["{ $match : { _t : 'Cat' } }"]);
}

#[test]
fn test_of_type_on_the_root_type_emits_nothing() {
    assert!(translate("animals.OfType<Animal>()").is_empty());
    assert!(hierarchical("animals.OfType<Animal>()").is_empty());
}

#[test]
fn test_is_in_a_filter() {
    assert_eq!(translate("animals.Where(x => x is Lion)"), vec!["{ $match : { _t : 'Lion' } }"]);
    assert_eq!(hierarchical("animals.Where(x => x is Cat)"), vec!["{ $match : { _t : 'Cat' } }"]);
}

#[test]
fn test_is_in_a_projection() {
    assert_eq!(
        translate("animals.Select(x => x is Cat)"),
        vec!["{ $project : { _v : { $in : ['$_t', ['Cat', 'Lion']] }, _id : 0 } }"]
    );
    assert_eq!(
        hierarchical("animals.Select(x => x is Cat)"),
        vec!["{ $project : { _v : { $cond : { if : { $isArray : '$_t' }, then : { $in : ['Cat', '$_t'] }, else : { $eq : ['$_t', 'Cat'] } } }, _id : 0 } }"]
    );
}

#[test]
fn test_of_type_keeps_matching_documents() {
    assert_eq!(ids("animals.OfType<Cat>()"), vec![2, 3]);
}

// ============================================================================
// Dictionaries
// ============================================================================

#[test]
fn test_document_dictionary_indexer_is_a_path() {
    assert_eq!(
        translate("animals.Select(x => x.Attrs[\"a\"])"),
        vec!["{ $project : { _v : '$Attrs.a', _id : 0 } }"]
    );
    assert_eq!(
        translate("animals.Where(x => x.Attrs[\"a\"] == 1)"),
        vec!["{ $match : { 'Attrs.a' : 1 } }"]
    );
}

#[test]
fn test_contains_key() {
    assert_eq!(
        translate("animals.Where(x => x.Attrs.ContainsKey(\"a\"))"),
        vec!["{ $match : { 'Attrs.a' : { $exists : true } } }"]
    );
    assert_eq!(
        translate("animals.Select(x => x.Attrs.ContainsKey(\"a\"))"),
        vec!["{ $project : { _v : { $ne : [{ $type : '$Attrs.a' }, 'missing'] }, _id : 0 } }"]
    );
    assert_eq!(
        translate("animals.Select(x => x.Pairs.ContainsKey(\"a\"))"),
        vec!["{ $project : { _v : { $in : ['a', { $map : { input : '$Pairs', as : 'kv', in : { $arrayElemAt : ['$$kv', 0] } } }] }, _id : 0 } }"]
    );
}

#[test]
fn test_document_dictionary_entries_use_object_to_array() {
    assert_eq!(
        translate("animals.Select(x => x.Attrs.Count)"),
        vec!["{ $project : { _v : { $size : { $objectToArray : '$Attrs' } }, _id : 0 } }"]
    );
    assert_eq!(
        translate("animals.Select(x => x.Attrs.Keys)"),
        vec!["{ $project : { _v : { $map : { input : { $objectToArray : '$Attrs' }, as : 'kv', in : '$$kv.k' } }, _id : 0 } }"]
    );
}

#[test]
fn test_dictionary_results() {
    assert_eq!(ids("animals.Where(x => x.Attrs.ContainsKey(\"b\"))"), vec![1, 2]);
    assert_eq!(
        run("animals.Select(x => x.Attrs.Count)"),
        Ok(QueryResult::Sequence(vec![Value::Int32(2), Value::Int32(1), Value::Int32(0)]))
    );
}

// ============================================================================
// Literals and Variables
// ============================================================================

#[test]
fn test_decimal_literals() {
    assert_eq!(
        translate("animals.Where(x => x.Price > 1.5m)"),
        vec!["{ $match : { Price : { $gt : NumberDecimal('1.5') } } }"]
    );
    assert_eq!(
        translate("animals.Select(x => x.Price * 2.5m)"),
        vec!["{ $project : { _v : { $multiply : ['$Price', NumberDecimal('2.5')] }, _id : 0 } }"]
    );
}

#[test]
fn test_nested_map_variables_are_renamed() {
    assert_eq!(
        translate("animals.Select(x => x.Scores.Select(s => x.Ranks.Select(_s => _s + s)))"),
        vec![concat!(
            "{ $project : { _v : { $map : { input : '$Scores', as : 's', ",
            "in : { $map : { input : '$Ranks', as : 's0', in : { $add : ['$$s0', '$$s'] } } } } }, _id : 0 } }"
        )]
    );
}

// ============================================================================
// Dates
// ============================================================================

#[test]
fn test_date_members() {
    assert_eq!(
        translate("animals.Select(x => x.Born.Year)"),
        vec!["{ $project : { _v : { $year : '$Born' }, _id : 0 } }"]
    );
    assert_eq!(
        translate("animals.Select(x => x.Born.DayOfWeek)"),
        vec!["{ $project : { _v : { $subtract : [{ $dayOfWeek : '$Born' }, 1] }, _id : 0 } }"]
    );
}

#[test]
fn test_date_arithmetic() {
    assert_eq!(
        translate("animals.Select(x => x.Born.AddDays(2))"),
        vec!["{ $project : { _v : { $dateAdd : { startDate : '$Born', unit : 'day', amount : 2 } }, _id : 0 } }"]
    );
    assert_eq!(
        translate_on(DiscriminatorConvention::Scalar, version(5, 0), "animals.Select(x => x.Born.AddHours(1))"),
        vec!["{ $project : { _v : { $dateAdd : { startDate : '$Born', unit : 'hour', amount : 1 } }, _id : 0 } }"]
    );
}

#[test]
fn test_date_arithmetic_needs_a_capable_server() {
    match error_on(version(4, 4), "animals.Select(x => x.Born.AddDays(2))") {
        TranslationError::FeatureNotSupported { feature, required, actual } => {
            assert_eq!(feature, "$dateAdd");
            assert_eq!(required, ServerVersion::new(5, 0));
            assert_eq!(actual, ServerVersion::new(4, 4));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_date_results() {
    assert_eq!(
        run("animals.Select(x => x.Born.DayOfWeek)"),
        Ok(QueryResult::Sequence(vec![Value::Int32(4), Value::Int32(5), Value::Int32(4)]))
    );
    assert_eq!(
        run("animals.Where(x => x.Id == 1).Select(x => x.Born.AddDays(1))"),
        Ok(QueryResult::Sequence(vec![Value::DateTime(86_400_000)]))
    );
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_query_source_inside_a_lambda_is_rejected() {
    assert_eq!(
        error_on(Capabilities::default(), "animals.Where(x => animals.Any())"),
        TranslationError::NestedQuerySource("animals".to_string())
    );
}

#[test]
fn test_engine_failure_names_the_stage() {
    match run("animals.Select(x => (int)x.Name)") {
        Err(ExecutionError::StageRejected { index, stage, message }) => {
            assert_eq!(index, 0);
            assert_eq!(stage, "{ $project : { _v : { $toInt : '$Name' }, _id : 0 } }");
            assert!(message.contains("Rex"), "{}", message);
        }
        other => panic!("expected a rejected stage, got {:?}", other),
    }
}
