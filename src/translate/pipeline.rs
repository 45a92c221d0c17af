//! Query operators to pipeline stages.
//!
//! The operator chain is walked from its source outwards. Each operator
//! appends stages to a [`Plan`] and updates the serializer describing the
//! documents flowing out of it. Scalar results are wrapped in `_v` so every
//! stage still sees documents.

use tracing::warn;

use super::{
    client,
    context::{Binding, Symbol, TranslationContext},
    expression::{Translated, member_of, translate_expression},
    filter::{translate_filter, type_filter},
    methods::average_serializer,
};
use crate::{
    ast::{Expr, TypeRef, UnaryOp},
    capabilities::Feature,
    error::{TranslationError, unsupported},
    execution::{AggregateOp, Reduction},
    mql::{Accumulator, AggExpr, ProjectField, SortDirection, Stage},
    residual::ClientStep,
    serializer::{DecimalRepresentation, Serializer},
    value::Value,
};
use rust_decimal::Decimal;

/// One translated operator, before optimization.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Server(Stage),
    Client(ClientStep),
}

/// The stages built so far and what they produce.
#[derive(Debug, Clone)]
pub struct Plan {
    pub collection: String,
    pub steps: Vec<Step>,
    /// Serializer of the values leaving the last step
    pub serializer: Serializer,
    /// Whether the server's output is `_v`-wrapped. Fixed once a client step exists.
    client_unwrap: Option<bool>,
    pub reduction: Option<Reduction>,
    sort: Vec<(Expr, SortDirection)>,
}

impl Plan {
    fn new(collection: String, serializer: Serializer) -> Self {
        Plan {
            collection,
            steps: Vec::new(),
            serializer,
            client_unwrap: None,
            reduction: None,
            sort: Vec::new(),
        }
    }

    fn is_client(&self) -> bool {
        self.client_unwrap.is_some()
    }

    /// Whether values returned by the server sit in a `_v` field.
    pub fn unwrap(&self) -> bool {
        self.client_unwrap
            .unwrap_or(matches!(self.serializer, Serializer::Wrapped(_)))
    }

    fn server(&mut self, stage: Stage) {
        self.steps.push(Step::Server(stage));
    }

    fn client(&mut self, step: ClientStep) {
        self.steps.push(Step::Client(step));
    }

    /// Everything after this point runs on the client.
    fn enter_client_mode(&mut self) {
        if self.is_client() {
            return;
        }
        self.client_unwrap = Some(matches!(self.serializer, Serializer::Wrapped(_)));
        if let Serializer::Wrapped(inner) = &self.serializer {
            self.serializer = (**inner).clone();
        }
    }

    /// The symbol a lambda over the current documents binds its parameter to.
    fn symbol(&self, parameter: &str) -> Symbol {
        match &self.serializer {
            Serializer::Wrapped(inner) => Symbol {
                parameter: parameter.to_string(),
                binding: Binding::Path("_v".into()),
                serializer: (**inner).clone(),
            },
            other => Symbol {
                parameter: parameter.to_string(),
                binding: Binding::Path(String::new()),
                serializer: other.clone(),
            },
        }
    }

    /// The current document as an expression.
    fn current(&self) -> Translated {
        let symbol = self.symbol("");
        Translated::new(symbol.to_expr().unwrap_or_else(AggExpr::root), symbol.serializer)
    }
}

/// Translate an operator chain rooted at a collection source.
pub fn plan_query(ctx: &mut TranslationContext<'_>, expr: &Expr) -> Result<Plan, TranslationError> {
    let mut plan = translate_chain(ctx, expr)?;
    flush_sort(ctx, &mut plan)?;
    Ok(plan)
}

fn translate_chain(ctx: &mut TranslationContext<'_>, expr: &Expr) -> Result<Plan, TranslationError> {
    match expr {
        Expr::Source(source) => {
            let serializer = ctx.registry.lookup(&source.document_type).ok_or_else(|| {
                TranslationError::AmbiguousMember {
                    member: source.name.clone(),
                    type_name: source.document_type.clone(),
                }
            })?;
            Ok(Plan::new(source.collection.clone(), serializer))
        }
        Expr::Call { target: Some(target), method, type_args, args } => {
            let mut plan = translate_chain(ctx, target)?;
            if plan.reduction.is_some() {
                return Err(unsupported(expr, "no operator may follow a terminal operator"));
            }
            if !matches!(method.as_str(), "ThenBy" | "ThenByDescending") {
                flush_sort(ctx, &mut plan)?;
            }
            apply_operator(ctx, &mut plan, expr, method, type_args, args)?;
            Ok(plan)
        }
        other => Err(unsupported(other, "a query must start from a collection")),
    }
}

fn apply_operator(
    ctx: &mut TranslationContext<'_>,
    plan: &mut Plan,
    expr: &Expr,
    method: &str,
    type_args: &[TypeRef],
    args: &[Expr],
) -> Result<(), TranslationError> {
    match (method, args) {
        ("Where", [predicate]) => where_(ctx, plan, predicate),
        ("Select", [selector]) => select(ctx, plan, expr, selector),
        ("SelectMany", [selector]) => select_many(ctx, plan, expr, selector),
        ("OrderBy" | "OrderByDescending" | "ThenBy" | "ThenByDescending", [key]) => {
            if method.starts_with("ThenBy") && plan.sort.is_empty() {
                return Err(unsupported(expr, "ThenBy must follow OrderBy"));
            }
            let direction = if method.ends_with("Descending") {
                SortDirection::Descending
            } else {
                SortDirection::Ascending
            };
            plan.sort.push((key.clone(), direction));
            Ok(())
        }
        ("GroupBy", [key]) => group_by(ctx, plan, expr, key, None),
        ("GroupBy", [key, element]) => group_by(ctx, plan, expr, key, Some(element)),
        ("Skip" | "Take", [count]) => {
            let n = count
                .as_constant()
                .and_then(Value::as_i64)
                .ok_or_else(|| unsupported(expr, "the count must be a constant integer"))?;
            let n = n.max(0);
            match (method, plan.is_client()) {
                ("Skip", false) => plan.server(Stage::Skip(n)),
                ("Skip", true) => plan.client(ClientStep::Skip(n as usize)),
                (_, false) => plan.server(Stage::Limit(n)),
                (_, true) => plan.client(ClientStep::Take(n as usize)),
            }
            Ok(())
        }
        ("Distinct", []) => {
            distinct(plan);
            Ok(())
        }
        ("OfType", []) => of_type(ctx, plan, expr, type_args),
        ("AsQueryable" | "AsEnumerable", []) => Ok(()),

        ("First" | "FirstOrDefault" | "Single" | "SingleOrDefault", [] | [_]) => {
            if let [predicate] = args {
                where_(ctx, plan, predicate)?;
            }
            let single = method.starts_with("Single");
            let or_default = method.ends_with("OrDefault");
            limit(plan, if single { 2 } else { 1 });
            plan.reduction = Some(if single {
                Reduction::Single { or_default }
            } else {
                Reduction::First { or_default }
            });
            Ok(())
        }
        ("Count" | "LongCount", [] | [_]) => {
            if let [predicate] = args {
                where_(ctx, plan, predicate)?;
            }
            let long = method == "LongCount";
            if plan.is_client() {
                plan.reduction = Some(Reduction::ClientCount { long });
            } else {
                plan.server(Stage::Count("_v".into()));
                plan.serializer = Serializer::Wrapped(Box::new(Serializer::Int32));
                plan.reduction = Some(Reduction::ServerCount { long });
            }
            Ok(())
        }
        ("Any", [] | [_]) => {
            if let [predicate] = args {
                where_(ctx, plan, predicate)?;
            }
            limit(plan, 1);
            plan.reduction = Some(Reduction::Any);
            Ok(())
        }
        ("All", [predicate]) => {
            let Expr::Lambda { params, body } = predicate else {
                return Err(unsupported(predicate, "expected a lambda"));
            };
            let counterexample = Expr::Lambda {
                params: params.clone(),
                body: Box::new(Expr::unary(UnaryOp::Not, (**body).clone())),
            };
            where_(ctx, plan, &counterexample)?;
            limit(plan, 1);
            plan.reduction = Some(Reduction::IsEmpty);
            Ok(())
        }
        ("Sum" | "Average" | "Min" | "Max" | "StandardDeviationPop" | "StandardDeviationSamp", [] | [_]) => {
            let op = match method {
                "Sum" => AggregateOp::Sum,
                "Average" => AggregateOp::Average,
                "Min" => AggregateOp::Min,
                "Max" => AggregateOp::Max,
                "StandardDeviationPop" => AggregateOp::StdDevPop,
                _ => AggregateOp::StdDevSamp,
            };
            aggregate(ctx, plan, op, args.first())
        }
        _ => Err(unsupported(expr, format!("{} is not a supported query operator", method))),
    }
}

fn limit(plan: &mut Plan, n: i64) {
    if plan.is_client() {
        plan.client(ClientStep::Take(n as usize));
    } else {
        plan.server(Stage::Limit(n));
    }
}

/// Errors that client evaluation can get around.
fn can_fall_back(ctx: &TranslationContext<'_>, error: &TranslationError) -> bool {
    ctx.options.enable_client_side_fallback
        && matches!(
            error,
            TranslationError::Unsupported { .. } | TranslationError::FeatureNotSupported { .. }
        )
}

/// Translate the body of a one-parameter lambda over the current documents.
fn with_lambda<T>(
    ctx: &mut TranslationContext<'_>,
    plan: &Plan,
    lambda: &Expr,
    f: impl FnOnce(&mut TranslationContext<'_>, &Expr) -> Result<T, TranslationError>,
) -> Result<T, TranslationError> {
    let (parameter, body) = lambda
        .as_lambda1()
        .ok_or_else(|| unsupported(lambda, "expected a lambda with one parameter"))?;
    let symbol = plan.symbol(parameter);
    ctx.scoped(vec![symbol], |ctx| f(ctx, body))
}

fn where_(ctx: &mut TranslationContext<'_>, plan: &mut Plan, predicate: &Expr) -> Result<(), TranslationError> {
    if plan.is_client() {
        plan.client(ClientStep::Filter(client::rewrite_lambda(predicate, &plan.serializer)));
        return Ok(());
    }
    match with_lambda(ctx, plan, predicate, translate_filter) {
        Ok(filter) => {
            plan.server(Stage::Match(filter));
            Ok(())
        }
        Err(error) if can_fall_back(ctx, &error) => {
            warn!(operator = "Where", %error, "evaluating the predicate on the client");
            plan.enter_client_mode();
            plan.client(ClientStep::Filter(client::rewrite_lambda(predicate, &plan.serializer)));
            Ok(())
        }
        Err(error) => Err(error),
    }
}

fn select(
    ctx: &mut TranslationContext<'_>,
    plan: &mut Plan,
    expr: &Expr,
    selector: &Expr,
) -> Result<(), TranslationError> {
    if plan.is_client() {
        plan.client(ClientStep::Project {
            selector: client::rewrite_lambda(selector, &plan.serializer),
            snippets: false,
        });
        plan.serializer = Serializer::Any;
        return Ok(());
    }
    let (parameter, body) = selector
        .as_lambda1()
        .ok_or_else(|| unsupported(expr, "expected a lambda with one parameter"))?;
    if matches!(body, Expr::Parameter(p) if p == parameter) {
        return Ok(());
    }
    match with_lambda(ctx, plan, selector, translate_expression) {
        Ok(translated) => {
            let (stage, serializer) = projection(translated);
            plan.server(stage);
            plan.serializer = serializer;
            Ok(())
        }
        Err(error) if can_fall_back(ctx, &error) => {
            warn!(operator = "Select", %error, "evaluating the projection on the client");
            let symbol = plan.symbol(parameter);
            let (snippets, rewritten) = client::extract_snippets(ctx, symbol, selector)?;
            plan.server(Stage::Project(vec![
                ("_snippets".into(), ProjectField::Computed(AggExpr::Array(snippets))),
                ("_id".into(), ProjectField::Exclude),
            ]));
            plan.serializer = Serializer::Any;
            plan.enter_client_mode();
            plan.client(ClientStep::Project { selector: rewritten, snippets: true });
            Ok(())
        }
        Err(error) => Err(error),
    }
}

/// The `$project` for a translated selector. Computed documents become the
/// output document; anything else is wrapped in `_v`.
fn projection(translated: Translated) -> (Stage, Serializer) {
    match translated.ast {
        AggExpr::Document(fields) if matches!(translated.serializer, Serializer::Class(_)) => {
            let mut spec: Vec<(String, ProjectField)> = fields
                .into_iter()
                .map(|(name, value)| (name, ProjectField::Computed(value)))
                .collect();
            if !spec.iter().any(|(name, _)| name == "_id") {
                spec.push(("_id".into(), ProjectField::Exclude));
            }
            (Stage::Project(spec), translated.serializer)
        }
        ast => (
            Stage::Project(vec![
                ("_v".into(), ProjectField::Computed(ast)),
                ("_id".into(), ProjectField::Exclude),
            ]),
            Serializer::Wrapped(Box::new(translated.serializer)),
        ),
    }
}

fn select_many(
    ctx: &mut TranslationContext<'_>,
    plan: &mut Plan,
    expr: &Expr,
    selector: &Expr,
) -> Result<(), TranslationError> {
    if plan.is_client() {
        plan.client(ClientStep::SelectMany(client::rewrite_lambda(selector, &plan.serializer)));
        plan.serializer = Serializer::Any;
        return Ok(());
    }
    let translated = match with_lambda(ctx, plan, selector, translate_expression) {
        Ok(translated) => translated,
        Err(error) if can_fall_back(ctx, &error) => {
            warn!(operator = "SelectMany", %error, "flattening on the client");
            plan.enter_client_mode();
            return select_many(ctx, plan, expr, selector);
        }
        Err(error) => return Err(error),
    };
    let (items, item) = match translated.serializer.underlying() {
        Serializer::Grouping { element, .. } => (
            member_of(&translated, "_elements", Serializer::Any).ast,
            (**element).clone(),
        ),
        other => match other.item() {
            Some(item) if other.is_array() || *other == Serializer::Any => (translated.ast, item),
            _ => return Err(unsupported(expr, format!("{} is not a sequence", translated.serializer.describe()))),
        },
    };
    plan.server(Stage::Project(vec![
        ("_v".into(), ProjectField::Computed(items)),
        ("_id".into(), ProjectField::Exclude),
    ]));
    plan.server(Stage::Unwind("_v".into()));
    plan.serializer = Serializer::Wrapped(Box::new(item));
    Ok(())
}

/// Emit the pending `OrderBy`/`ThenBy` keys.
fn flush_sort(ctx: &mut TranslationContext<'_>, plan: &mut Plan) -> Result<(), TranslationError> {
    if plan.sort.is_empty() {
        return Ok(());
    }
    let keys = std::mem::take(&mut plan.sort);
    let mut translated = Vec::with_capacity(keys.len());
    for (selector, direction) in &keys {
        if plan.is_client() {
            break;
        }
        match with_lambda(ctx, plan, selector, translate_expression) {
            Ok(key) => translated.push((key.ast, *direction)),
            Err(error) if can_fall_back(ctx, &error) => {
                warn!(operator = "OrderBy", %error, "sorting on the client");
                plan.enter_client_mode();
            }
            Err(error) => return Err(error),
        }
    }
    if plan.is_client() {
        let serializer = plan.serializer.clone();
        plan.client(ClientStep::Sort(
            keys.iter()
                .map(|(selector, direction)| (client::rewrite_lambda(selector, &serializer), *direction))
                .collect(),
        ));
        return Ok(());
    }

    let paths: Option<Vec<(String, SortDirection)>> = translated
        .iter()
        .map(|(key, direction)| match key {
            AggExpr::Field(path) => Some((path.clone(), *direction)),
            _ => None,
        })
        .collect();
    if let Some(spec) = paths {
        plan.server(Stage::Sort(spec));
        return Ok(());
    }

    // computed keys are materialized next to the document, then dropped
    let mut fields = vec![
        ("_id".to_string(), ProjectField::Exclude),
        ("_document".to_string(), ProjectField::Computed(AggExpr::root())),
    ];
    let mut spec = Vec::new();
    for (key, direction) in translated {
        match key {
            AggExpr::Field(path) => spec.push((format!("_document.{}", path), direction)),
            computed => {
                let name = format!("_key{}", ctx.next_index("_key") + 1);
                fields.push((name.clone(), ProjectField::Computed(computed)));
                spec.push((name, direction));
            }
        }
    }
    plan.server(Stage::Project(fields));
    plan.server(Stage::Sort(spec));
    plan.server(restore(ctx, AggExpr::field("_document")));
    Ok(())
}

/// Make `document` the pipeline document again.
fn restore(ctx: &TranslationContext<'_>, document: AggExpr) -> Stage {
    if ctx.capabilities.supports(Feature::ReplaceWith) {
        Stage::ReplaceWith(document)
    } else {
        Stage::ReplaceRoot(document)
    }
}

fn group_by(
    ctx: &mut TranslationContext<'_>,
    plan: &mut Plan,
    expr: &Expr,
    key: &Expr,
    element: Option<&Expr>,
) -> Result<(), TranslationError> {
    if plan.is_client() {
        let current = plan.serializer.clone();
        plan.client(ClientStep::Group {
            key: client::rewrite_lambda(key, &current),
            element: element.map(|selector| client::rewrite_lambda(selector, &current)),
        });
        plan.serializer = Serializer::Grouping {
            key: Box::new(Serializer::Any),
            element: Box::new(if element.is_some() { Serializer::Any } else { current }),
        };
        return Ok(());
    }
    let translated = with_lambda(ctx, plan, key, translate_expression).and_then(|id| {
        let value = match element {
            Some(selector) => with_lambda(ctx, plan, selector, translate_expression)?,
            None => plan.current(),
        };
        Ok((id, value))
    });
    let (id, value) = match translated {
        Ok(translated) => translated,
        Err(error) if can_fall_back(ctx, &error) => {
            warn!(operator = "GroupBy", %error, "grouping on the client");
            plan.enter_client_mode();
            return group_by(ctx, plan, expr, key, element);
        }
        Err(error) => return Err(error),
    };
    plan.server(Stage::Group {
        id: id.ast,
        accumulators: vec![("_elements".into(), Accumulator::new("$push", value.ast))],
    });
    plan.serializer = Serializer::Grouping {
        key: Box::new(id.serializer),
        element: Box::new(value.serializer),
    };
    Ok(())
}

fn distinct(plan: &mut Plan) {
    if plan.is_client() {
        plan.client(ClientStep::Distinct);
        return;
    }
    match &plan.serializer {
        Serializer::Wrapped(_) => {
            plan.server(Stage::Group { id: AggExpr::field("_v"), accumulators: Vec::new() });
            plan.server(Stage::Project(vec![
                ("_v".into(), ProjectField::Computed(AggExpr::field("_id"))),
                ("_id".into(), ProjectField::Exclude),
            ]));
        }
        _ => {
            plan.server(Stage::Group { id: AggExpr::root(), accumulators: Vec::new() });
            // the grouped key is the whole document
            plan.server(Stage::ReplaceRoot(AggExpr::field("_id")));
        }
    }
}

fn of_type(
    ctx: &mut TranslationContext<'_>,
    plan: &mut Plan,
    expr: &Expr,
    type_args: &[TypeRef],
) -> Result<(), TranslationError> {
    let [TypeRef::Named(type_name)] = type_args else {
        return Err(unsupported(expr, "OfType needs one class type argument"));
    };
    let target = ctx.registry.lookup(type_name).ok_or_else(|| TranslationError::AmbiguousMember {
        member: "OfType".into(),
        type_name: type_name.clone(),
    })?;
    let (wrapped, current) = match &plan.serializer {
        Serializer::Wrapped(inner) => (true, (**inner).clone()),
        other => (false, other.clone()),
    };
    let already = matches!(&current, Serializer::Class(map) if map.type_name == *type_name);
    if !already {
        if plan.is_client() {
            let parameter = "_t";
            plan.client(ClientStep::Filter(Expr::lambda(
                &[parameter],
                Expr::TypeIs {
                    operand: Box::new(Expr::param(parameter)),
                    type_name: type_name.clone(),
                },
            )));
        } else {
            let base = if wrapped { "_v" } else { "" };
            plan.server(Stage::Match(type_filter(ctx, base, type_name)));
        }
    }
    plan.serializer = if wrapped { Serializer::Wrapped(Box::new(target)) } else { target };
    Ok(())
}

fn aggregate(
    ctx: &mut TranslationContext<'_>,
    plan: &mut Plan,
    op: AggregateOp,
    selector: Option<&Expr>,
) -> Result<(), TranslationError> {
    if !plan.is_client() {
        let value = match selector {
            Some(selector) => with_lambda(ctx, plan, selector, translate_expression),
            None => Ok(plan.current()),
        };
        match value {
            Ok(value) => {
                server_aggregate(plan, op, value);
                return Ok(());
            }
            Err(error) if can_fall_back(ctx, &error) => {
                warn!(operator = ?op, %error, "aggregating on the client");
                plan.enter_client_mode();
            }
            Err(error) => return Err(error),
        }
    }
    let values = match selector {
        Some(selector) => {
            let serializer = plan.serializer.clone();
            plan.client(ClientStep::Project {
                selector: client::rewrite_lambda(selector, &serializer),
                snippets: false,
            });
            Serializer::Any
        }
        None => plan.serializer.clone(),
    };
    plan.reduction = Some(Reduction::ClientAggregate {
        op,
        nullable: op != AggregateOp::Sum && values.is_nullable(),
    });
    Ok(())
}

fn server_aggregate(plan: &mut Plan, op: AggregateOp, value: Translated) {
    let (accumulator, result) = match op {
        AggregateOp::Sum => ("$sum", value.serializer.clone()),
        AggregateOp::Average => ("$avg", average_serializer(&value.serializer)),
        AggregateOp::Min => ("$min", value.serializer.clone()),
        AggregateOp::Max => ("$max", value.serializer.clone()),
        AggregateOp::StdDevPop => ("$stdDevPop", deviation_serializer(&value.serializer)),
        AggregateOp::StdDevSamp => ("$stdDevSamp", deviation_serializer(&value.serializer)),
    };
    let nullable = matches!(value.serializer, Serializer::Nullable(_));
    let default = match op {
        AggregateOp::Sum => Some(zero(&value.serializer)),
        _ if nullable => Some(Value::Null),
        _ => None,
    };
    plan.server(Stage::Group {
        id: AggExpr::Literal(Value::Null),
        accumulators: vec![("_v".into(), Accumulator::new(accumulator, value.ast))],
    });
    plan.server(Stage::Project(vec![("_id".into(), ProjectField::Exclude)]));
    plan.serializer = Serializer::Wrapped(Box::new(result));
    plan.reduction = Some(Reduction::ServerAggregate { default });
}

/// The server computes standard deviations in doubles.
fn deviation_serializer(values: &Serializer) -> Serializer {
    match values {
        Serializer::Nullable(_) => Serializer::Nullable(Box::new(Serializer::Double)),
        _ => Serializer::Double,
    }
}

/// `Sum` over no values.
fn zero(serializer: &Serializer) -> Value {
    match serializer.underlying() {
        Serializer::Int64 => Value::Int64(0),
        Serializer::Double => Value::Double(0.0),
        Serializer::Decimal(DecimalRepresentation::Decimal128) => Value::Decimal(Decimal::ZERO),
        _ => Value::Int32(0),
    }
}
