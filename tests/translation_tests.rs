// tests/translation_tests.rs

use docstage::capabilities::{Capabilities, ServerVersion, TranslationOptions};
use docstage::environment::{Environment, HostFunction};
use docstage::error::TranslationError;
use docstage::execution::ExecutableQuery;
use docstage::registry::SerializerRegistry;
use docstage::residual::ClientStep;
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
            .member("B", Serializer::Int32)
            .member("Tags", Serializer::array(Serializer::String))
            .member("Scores", Serializer::array(Serializer::Int32))
            .build(),
    );
    registry
}

fn env() -> Environment {
    Environment::new()
        .with_source("docs", "people", "Person")
        .with_capture("obj", Value::Array(vec![1.into(), 2.into(), 3.into()]))
        .with_capture("limit", 10)
        .with_function(HostFunction::new("Check", false, |args: &[Value]| {
            Ok(Value::Boolean(args.first().and_then(Value::as_str).is_some_and(|s| s.len() > 3)))
        }))
}

fn translate_on(capabilities: Capabilities, query: &str) -> Vec<String> {
    let registry = registry();
    QueryTranslator::new(&registry)
        .with_capabilities(capabilities)
        .translate_text(query, &env())
        .unwrap_or_else(|e| panic!("failed to translate {:?}: {}", query, e))
        .pipeline_text()
}

fn translate(query: &str) -> Vec<String> {
    translate_on(Capabilities::default(), query)
}

fn version(major: u32, minor: u32) -> Capabilities {
    Capabilities::for_version(ServerVersion::new(major, minor))
}

// ============================================================================
// Filters
// ============================================================================

#[test]
fn test_any_over_captured_values_becomes_in() {
    assert_eq!(
        translate("docs.Where(x => obj.Any(y => x.X == y))"),
        vec!["{ $match : { X : { $in : [1, 2, 3] } } }"]
    );
    assert_eq!(
        translate("docs.Where(x => obj.Contains(x.X))"),
        vec!["{ $match : { X : { $in : [1, 2, 3] } } }"]
    );
}

#[test]
fn test_conjunction_merges_into_one_document() {
    assert_eq!(
        translate("docs.Where(x => x.A == 1 && x.B > 2)"),
        vec!["{ $match : { A : 1, B : { $gt : 2 } } }"]
    );
}

#[test]
fn test_disjunction() {
    assert_eq!(
        translate("docs.Where(x => x.A == 1 || x.B == 2)"),
        vec!["{ $match : { $or : [{ A : 1 }, { B : 2 }] } }"]
    );
}

#[test]
fn test_negated_equality() {
    assert_eq!(
        translate("docs.Where(x => !(x.A == 1))"),
        vec!["{ $match : { A : { $ne : 1 } } }"]
    );
}

#[test]
fn test_captured_arithmetic_is_folded() {
    assert_eq!(
        translate("docs.Where(x => x.A > limit * 2)"),
        vec!["{ $match : { A : { $gt : 20 } } }"]
    );
}

#[test]
fn test_case_insensitive_equality_is_a_regex() {
    assert_eq!(
        translate("docs.Where(x => x.Name.ToLower() == \"john\")"),
        vec!["{ $match : { Name : /^john$/i } }"]
    );
}

#[test]
fn test_unreachable_case_literal_matches_nothing() {
    assert_eq!(
        translate("docs.Where(x => x.Name.ToLower() == \"JOHN\")"),
        vec!["{ $match : { _id : { $type : -1 } } }"]
    );
}

#[test]
fn test_string_prefix() {
    assert_eq!(
        translate("docs.Where(x => x.Name.StartsWith(\"Jo\"))"),
        vec!["{ $match : { Name : /^Jo/ } }"]
    );
}

#[test]
fn test_array_predicates() {
    assert_eq!(
        translate("docs.Where(x => x.Tags.Any())"),
        vec!["{ $match : { Tags : { $ne : null, $not : { $size : 0 } } } }"]
    );
    assert_eq!(
        translate("docs.Where(x => x.Tags.Contains(\"red\"))"),
        vec!["{ $match : { Tags : 'red' } }"]
    );
    assert_eq!(
        translate("docs.Where(x => x.Scores.Any(s => s > 5))"),
        vec!["{ $match : { Scores : { $elemMatch : { $gt : 5 } } } }"]
    );
    assert_eq!(
        translate("docs.Where(x => x.Tags.Count > 2)"),
        vec!["{ $match : { 'Tags.2' : { $exists : true } } }"]
    );
}

#[test]
fn test_element_exclusions_become_nin() {
    assert_eq!(
        translate("docs.Where(x => x.Scores.Any(s => s != 1 && s != 2))"),
        vec!["{ $match : { Scores : { $elemMatch : { $nin : [1, 2] } } } }"]
    );
    assert_eq!(
        translate("docs.Where(x => x.Scores.Any(s => s > 2 && s < 9))"),
        vec!["{ $match : { Scores : { $elemMatch : { $gt : 2, $lt : 9 } } } }"]
    );
}

#[test]
fn test_repeated_element_operators_use_expr() {
    let pipeline = translate("docs.Where(x => x.Scores.Any(s => s > 2 && s > 5))");
    assert_eq!(pipeline.len(), 1);
    assert!(pipeline[0].starts_with("{ $match : { $expr : { $anyElementTrue : [{ $map : { input : '$Scores', as : 's'"));
    assert!(pipeline[0].contains("{ $and : [{ $gt : ['$$s', 2] }, { $gt : ['$$s', 5] }] }"));
}

#[test]
fn test_field_comparison_uses_expr() {
    assert_eq!(
        translate("docs.Where(x => x.A > x.B)"),
        vec!["{ $match : { $expr : { $gt : ['$A', '$B'] } } }"]
    );
}

#[test]
fn test_declarative_conjuncts_stay_outside_expr() {
    assert_eq!(
        translate("docs.Where(x => x.A == 1 && x.A < x.B)"),
        vec!["{ $match : { A : 1, $expr : { $lt : ['$A', '$B'] } } }"]
    );
}

#[test]
fn test_consecutive_wheres_combine() {
    assert_eq!(
        translate("docs.Where(x => x.A == 1).Where(x => x.B == 2)"),
        vec!["{ $match : { A : 1, B : 2 } }"]
    );
}

#[test]
fn test_always_true_where_is_dropped() {
    assert!(translate("docs.Where(x => true)").is_empty());
}

// ============================================================================
// Projections
// ============================================================================

#[test]
fn test_scalar_projection_is_wrapped() {
    assert_eq!(
        translate("docs.Select(x => x.Name)"),
        vec!["{ $project : { _v : '$Name', _id : 0 } }"]
    );
}

#[test]
fn test_anonymous_projection() {
    assert_eq!(
        translate("docs.Select(x => new { x.Name, Total = x.A + x.B })"),
        vec!["{ $project : { Name : '$Name', Total : { $add : ['$A', '$B'] }, _id : 0 } }"]
    );
}

#[test]
fn test_projected_constants_use_literal() {
    assert_eq!(
        translate("docs.Select(x => new { One = 1, x.Name })"),
        vec!["{ $project : { One : { $literal : 1 }, Name : '$Name', _id : 0 } }"]
    );
}

#[test]
fn test_dependent_selects_merge() {
    assert_eq!(
        translate("docs.Select(x => new { x.Name, x.A }).Select(y => y.A + 1)"),
        vec!["{ $project : { _v : { $add : ['$A', 1] }, _id : 0 } }"]
    );
}

#[test]
fn test_reads_into_computed_documents_do_not_merge() {
    assert_eq!(
        translate("docs.Select(x => new { P = new { x.A } }).Select(y => y.P.A)"),
        vec![
            "{ $project : { P : { A : '$A' }, _id : 0 } }",
            "{ $project : { _v : '$P.A', _id : 0 } }",
        ]
    );
}

#[test]
fn test_string_concatenation() {
    assert_eq!(
        translate("docs.Select(x => x.Name + \"!\")"),
        vec!["{ $project : { _v : { $concat : ['$Name', '!'] }, _id : 0 } }"]
    );
}

#[test]
fn test_conditional_projection() {
    assert_eq!(
        translate("docs.Select(x => x.A > 1 ? \"big\" : \"small\")"),
        vec!["{ $project : { _v : { $cond : { if : { $gt : ['$A', 1] }, then : 'big', else : 'small' } }, _id : 0 } }"]
    );
}

#[test]
fn test_case_insensitive_equals_is_one_regex_match() {
    assert_eq!(
        translate("docs.Select(x => x.Name.ToLower().Equals(\"john\"))"),
        vec!["{ $project : { _v : { $regexMatch : { input : '$Name', regex : /^john$/i } }, _id : 0 } }"]
    );
}

#[test]
fn test_case_insensitive_equals_without_regex_match() {
    assert_eq!(
        translate_on(version(4, 0), "docs.Select(x => x.Name.ToLower().Equals(\"john\"))"),
        vec!["{ $project : { _v : { $eq : [{ $strcasecmp : ['$Name', 'john'] }, 0] }, _id : 0 } }"]
    );
}

#[test]
fn test_integer_division_truncates() {
    assert_eq!(
        translate("docs.Select(x => x.A / 2)"),
        vec!["{ $project : { _v : { $toInt : { $divide : ['$A', 2] } }, _id : 0 } }"]
    );
    assert_eq!(
        translate_on(version(3, 6), "docs.Select(x => x.A / 2)"),
        vec!["{ $project : { _v : { $trunc : [{ $divide : ['$A', 2] }] }, _id : 0 } }"]
    );
}

#[test]
fn test_widening_casts_convert() {
    assert_eq!(
        translate("docs.Select(x => (long)x.A)"),
        vec!["{ $project : { _v : { $toLong : '$A' }, _id : 0 } }"]
    );
    assert_eq!(
        translate("docs.Select(x => (double)x.A + 1)"),
        vec!["{ $project : { _v : { $add : [{ $toDouble : '$A' }, 1] }, _id : 0 } }"]
    );
}

#[test]
fn test_widening_casts_need_conversion_operators() {
    let registry = registry();
    let result = QueryTranslator::new(&registry)
        .with_capabilities(version(3, 6))
        .translate_text("docs.Select(x => (long)x.A)", &env());
    assert!(matches!(
        result,
        Err(TranslationError::FeatureNotSupported { ref feature, .. }) if feature == "$toLong"
    ));
}

#[test]
fn test_widening_casts_in_filters_compare_the_field() {
    assert_eq!(
        translate("docs.Where(x => (long)x.A > 5)"),
        vec!["{ $match : { A : { $gt : 5 } } }"]
    );
}

#[test]
fn test_select_many_unwinds() {
    assert_eq!(
        translate("docs.SelectMany(x => x.Tags)"),
        vec!["{ $project : { _v : '$Tags', _id : 0 } }", "{ $unwind : '$_v' }"]
    );
}

#[test]
fn test_distinct_values() {
    assert_eq!(
        translate("docs.Select(x => x.Name).Distinct()"),
        vec![
            "{ $project : { _v : '$Name', _id : 0 } }",
            "{ $group : { _id : '$_v' } }",
            "{ $project : { _v : '$_id', _id : 0 } }",
        ]
    );
}

// ============================================================================
// Ordering and Paging
// ============================================================================

#[test]
fn test_sort_skip_take() {
    assert_eq!(
        translate("docs.OrderBy(x => x.Name).ThenByDescending(x => x.A).Skip(5).Take(10)"),
        vec!["{ $sort : { Name : 1, A : -1 } }", "{ $skip : 5 }", "{ $limit : 10 }"]
    );
}

#[test]
fn test_consecutive_windows_combine() {
    assert_eq!(
        translate("docs.Skip(2).Skip(3).Take(10).Take(4)"),
        vec!["{ $skip : 5 }", "{ $limit : 4 }"]
    );
}

#[test]
fn test_computed_sort_key_on_older_servers() {
    assert_eq!(
        translate_on(version(4, 0), "docs.OrderBy(x => x.A + x.B)"),
        vec![
            "{ $project : { _id : 0, _document : '$$ROOT', _key1 : { $add : ['$A', '$B'] } } }",
            "{ $sort : { _key1 : 1 } }",
            "{ $replaceRoot : { newRoot : '$_document' } }",
        ]
    );
}

// ============================================================================
// Grouping
// ============================================================================

#[test]
fn test_group_ordered_by_count() {
    assert_eq!(
        translate("docs.GroupBy(x => x.Name).OrderBy(g => g.Count())"),
        vec![
            "{ $group : { _id : '$Name', _elements : { $push : '$$ROOT' } } }",
            "{ $project : { _id : 0, _document : '$$ROOT', _key1 : { $size : '$_elements' } } }",
            "{ $sort : { _key1 : 1 } }",
            "{ $replaceWith : '$_document' }",
        ]
    );
}

#[test]
fn test_group_aggregates_fuse_into_accumulators() {
    assert_eq!(
        translate("docs.GroupBy(x => x.Name).Select(g => new { Name = g.Key, Count = g.Count(), Total = g.Sum(x => x.A) })"),
        vec![
            "{ $group : { _id : '$Name', __agg0 : { $sum : 1 }, __agg1 : { $sum : '$A' } } }",
            "{ $project : { Name : '$_id', Count : '$__agg0', Total : '$__agg1', _id : 0 } }",
        ]
    );
}

#[test]
fn test_group_deviation_fuses_into_an_accumulator() {
    assert_eq!(
        translate("docs.GroupBy(x => x.Name).Select(g => new { Name = g.Key, Spread = g.StandardDeviationPop(x => x.A) })"),
        vec![
            "{ $group : { _id : '$Name', __agg0 : { $stdDevPop : '$A' } } }",
            "{ $project : { Name : '$_id', Spread : '$__agg0', _id : 0 } }",
        ]
    );
}

// ============================================================================
// Terminal Operators
// ============================================================================

#[test]
fn test_count() {
    assert_eq!(translate("docs.Count()"), vec!["{ $count : '_v' }"]);
    assert_eq!(
        translate("docs.Count(x => x.A > 1)"),
        vec!["{ $match : { A : { $gt : 1 } } }", "{ $count : '_v' }"]
    );
}

#[test]
fn test_any_and_first_limit_to_one() {
    assert_eq!(
        translate("docs.Any(x => x.A > 1)"),
        vec!["{ $match : { A : { $gt : 1 } } }", "{ $limit : 1 }"]
    );
    assert_eq!(
        translate("docs.First(x => x.A == 1)"),
        vec!["{ $match : { A : 1 } }", "{ $limit : 1 }"]
    );
}

#[test]
fn test_sum() {
    assert_eq!(
        translate("docs.Sum(x => x.A)"),
        vec!["{ $group : { _id : null, _v : { $sum : '$A' } } }", "{ $project : { _id : 0 } }"]
    );
}

#[test]
fn test_standard_deviation() {
    assert_eq!(
        translate("docs.StandardDeviationPop(x => x.A)"),
        vec!["{ $group : { _id : null, _v : { $stdDevPop : '$A' } } }", "{ $project : { _id : 0 } }"]
    );
    assert_eq!(
        translate("docs.Where(x => x.B > 0).StandardDeviationSamp(x => x.A)"),
        vec![
            "{ $match : { B : { $gt : 0 } } }",
            "{ $group : { _id : null, _v : { $stdDevSamp : '$A' } } }",
            "{ $project : { _id : 0 } }",
        ]
    );
}

#[test]
fn test_array_deviation() {
    assert_eq!(
        translate("docs.Select(x => x.Scores.StandardDeviationSamp())"),
        vec!["{ $project : { _v : { $stdDevSamp : '$Scores' }, _id : 0 } }"]
    );
}

// ============================================================================
// Capabilities, Fallback and Errors
// ============================================================================

#[test]
fn test_expr_requires_a_capable_server() {
    let registry = registry();
    let result = QueryTranslator::new(&registry)
        .with_capabilities(version(3, 4))
        .translate_text("docs.Where(x => x.A > x.B)", &env());
    assert!(matches!(result, Err(TranslationError::FeatureNotSupported { .. })));
}

#[test]
fn test_host_function_without_fallback_fails() {
    let registry = registry();
    let result = QueryTranslator::new(&registry).translate_text("docs.Where(x => Check(x.Name))", &env());
    assert!(matches!(result, Err(TranslationError::Unsupported { .. })));
}

#[test]
fn test_host_function_with_fallback_splits_the_pipeline() {
    let registry = registry();
    let query = QueryTranslator::new(&registry)
        .with_options(TranslationOptions { enable_client_side_fallback: true })
        .translate_text("docs.Where(x => x.A > 1).Where(x => Check(x.Name))", &env())
        .unwrap();
    assert_eq!(query.pipeline_text(), vec!["{ $match : { A : { $gt : 1 } } }"]);
    let residual = query.residual.expect("client steps");
    assert_eq!(residual.steps().len(), 1);
}

fn translate_with_fallback(query: &str) -> ExecutableQuery {
    let registry = registry();
    QueryTranslator::new(&registry)
        .with_options(TranslationOptions { enable_client_side_fallback: true })
        .translate_text(query, &env())
        .unwrap_or_else(|e| panic!("failed to translate {:?}: {}", query, e))
}

#[test]
fn test_ordering_after_a_client_step_runs_on_the_client() {
    let query = translate_with_fallback("docs.Where(x => Check(x.Name)).OrderBy(x => x.A).ThenByDescending(x => x.B).Select(x => x.Id)");
    assert!(query.pipeline_text().is_empty());
    let residual = query.residual.expect("client steps");
    match residual.steps() {
        [ClientStep::Filter(_), ClientStep::Sort(keys), ClientStep::Project { snippets: false, .. }] => {
            assert_eq!(keys.len(), 2)
        }
        other => panic!("unexpected client steps {:?}", other),
    }
}

#[test]
fn test_grouping_after_a_client_step_runs_on_the_client() {
    let query = translate_with_fallback("docs.Where(x => x.A > 1).Where(x => Check(x.Name)).GroupBy(x => x.Name).Select(g => g.Count())");
    assert_eq!(query.pipeline_text(), vec!["{ $match : { A : { $gt : 1 } } }"]);
    let residual = query.residual.expect("client steps");
    assert!(matches!(
        residual.steps(),
        [ClientStep::Filter(_), ClientStep::Group { element: None, .. }, ClientStep::Project { .. }]
    ));
}

#[test]
fn test_flattening_and_distinct_after_a_client_step() {
    let query = translate_with_fallback("docs.Where(x => Check(x.Name)).SelectMany(x => x.Tags).Distinct()");
    assert!(query.pipeline_text().is_empty());
    let residual = query.residual.expect("client steps");
    assert!(matches!(
        residual.steps(),
        [ClientStep::Filter(_), ClientStep::SelectMany(_), ClientStep::Distinct]
    ));
}

#[test]
fn test_client_key_selector_moves_grouping_to_the_client() {
    let query = translate_with_fallback("docs.GroupBy(x => Check(x.Name)).Select(g => g.Key)");
    assert!(query.pipeline_text().is_empty());
    let residual = query.residual.expect("client steps");
    assert!(matches!(residual.steps(), [ClientStep::Group { .. }, ClientStep::Project { .. }]));
}

#[test]
fn test_unknown_member_is_reported() {
    let registry = registry();
    let result = QueryTranslator::new(&registry).translate_text("docs.Where(x => x.Missing == 1)", &env());
    assert!(matches!(
        result,
        Err(TranslationError::AmbiguousMember { ref member, .. }) if member == "Missing"
    ));
}

#[test]
fn test_unknown_identifier_is_reported() {
    let registry = registry();
    let result = QueryTranslator::new(&registry).translate_text("docs.Where(x => x.A == nope)", &env());
    assert_eq!(result.err(), Some(TranslationError::UnknownIdentifier("nope".into())));
}

#[test]
fn test_translation_is_deterministic() {
    let query = "docs.GroupBy(x => x.Name).Select(g => new { g.Key, Total = g.Sum(x => x.A) }).OrderBy(r => r.Total)";
    assert_eq!(translate(query), translate(query));
}
