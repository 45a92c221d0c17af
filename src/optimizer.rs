//! Pipeline rewrites applied after translation.
//!
//! Each pass walks the stage list left to right and only ever builds new
//! stages. Every rewrite is logged at `trace` level.

use std::cell::Cell;

use tracing::trace;

use crate::{
    mql::{Accumulator, AggExpr, Filter, ProjectField, Stage},
    residual::ClientStep,
    translate::pipeline::Step,
    value::Value,
};

/// Server stages and the client steps that follow them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Optimized {
    pub stages: Vec<Stage>,
    pub client: Vec<ClientStep>,
}

#[derive(Debug, Default)]
pub struct Optimizer;

impl Optimizer {
    pub fn new() -> Self {
        Self
    }

    pub fn optimize(&self, steps: Vec<Step>) -> Optimized {
        // 1) split at the first client step
        let (stages, client) = split(steps);

        // 2) accumulator fusion into $group
        let stages = fuse_groups(stages);

        // 3) constant and consecutive $match
        let stages = simplify_matches(stages);

        // 4) dependent $project merge
        let stages = merge_projects(stages);

        // 5) consecutive $skip / $limit
        let stages = merge_windows(stages);

        Optimized { stages, client }
    }
}

// -----------------------------
// 1) Split
// -----------------------------

fn split(steps: Vec<Step>) -> (Vec<Stage>, Vec<ClientStep>) {
    let mut stages = Vec::new();
    let mut client = Vec::new();
    for step in steps {
        match step {
            Step::Server(stage) if client.is_empty() => stages.push(stage),
            Step::Server(stage) => {
                // planning never puts server work after a client step
                trace!(stage = %stage, "dropping server stage after the split");
            }
            Step::Client(step) => client.push(step),
        }
    }
    if !client.is_empty() {
        trace!(server = stages.len(), client = client.len(), "split pipeline");
    }
    (stages, client)
}

// -----------------------------
// 2) Grouping fusion
// -----------------------------

const ELEMENTS: &str = "_elements";

fn fuse_groups(stages: Vec<Stage>) -> Vec<Stage> {
    let mut names = 0usize;
    let mut out = Vec::with_capacity(stages.len());
    let mut iter = stages.into_iter().peekable();
    while let Some(stage) = iter.next() {
        let fused = match (&stage, iter.peek()) {
            (Stage::Group { id, accumulators }, Some(Stage::Project(fields))) => {
                match accumulators.as_slice() {
                    [(name, push)] if name == ELEMENTS && push.op == "$push" => {
                        fuse_group(id, &push.arg, fields, &mut names)
                    }
                    _ => None,
                }
            }
            _ => None,
        };
        match fused {
            Some((group, project)) => {
                trace!(group = %group, project = %project, "fused accumulators into $group");
                iter.next();
                out.push(group);
                out.push(project);
            }
            None => out.push(stage),
        }
    }
    out
}

struct Fusion<'a> {
    pushed: &'a AggExpr,
    accumulators: Vec<(String, Accumulator)>,
    names: &'a mut usize,
}

impl Fusion<'_> {
    fn rewrite(&mut self, expr: &AggExpr) -> AggExpr {
        if let Some(accumulator) = accumulator_of(expr, self.pushed) {
            return AggExpr::field(self.name_for(accumulator));
        }
        expr.map_children(&mut |child| self.rewrite(child))
    }

    fn name_for(&mut self, accumulator: Accumulator) -> String {
        if let Some((name, _)) = self.accumulators.iter().find(|(_, a)| *a == accumulator) {
            return name.clone();
        }
        let name = format!("__agg{}", *self.names);
        *self.names += 1;
        self.accumulators.push((name.clone(), accumulator));
        name
    }
}

fn fuse_group(
    id: &AggExpr,
    pushed: &AggExpr,
    fields: &[(String, ProjectField)],
    names: &mut usize,
) -> Option<(Stage, Stage)> {
    let start = *names;
    let mut fusion = Fusion { pushed, accumulators: Vec::new(), names };
    let mut projected = Vec::with_capacity(fields.len());
    for (name, field) in fields {
        let field = match field {
            ProjectField::Computed(expr) => ProjectField::Computed(inline_lets(&fusion.rewrite(expr))),
            ProjectField::Include if name == ELEMENTS => return abandon(fusion.names, start),
            other => other.clone(),
        };
        projected.push((name.clone(), field));
    }
    // the elements array no longer exists once fused
    let leftover = projected.iter().any(|(_, field)| match field {
        ProjectField::Computed(expr) => reads_elements(expr) || expr.references_root(),
        _ => false,
    });
    if leftover || fusion.accumulators.is_empty() {
        return abandon(fusion.names, start);
    }
    let group = Stage::Group { id: id.clone(), accumulators: fusion.accumulators };
    Some((group, Stage::Project(projected)))
}

fn abandon(names: &mut usize, start: usize) -> Option<(Stage, Stage)> {
    *names = start;
    None
}

fn reads_elements(expr: &AggExpr) -> bool {
    let mut fields = Vec::new();
    expr.referenced_fields(&mut fields);
    fields.iter().any(|f| f == ELEMENTS)
}

fn is_elements(expr: &AggExpr) -> bool {
    matches!(expr, AggExpr::Field(path) if path == ELEMENTS)
}

/// `{ $map : { input : '$_elements', as : v, in : body } }`
fn map_over_elements(expr: &AggExpr) -> Option<(&str, &AggExpr)> {
    over_elements(expr, "$map", "in")
}

/// `{ $filter : { input : '$_elements', as : v, cond : body } }` without a limit
fn filter_over_elements(expr: &AggExpr) -> Option<(&str, &AggExpr)> {
    over_elements(expr, "$filter", "cond")
}

fn over_elements<'e>(expr: &'e AggExpr, op: &str, body_key: &str) -> Option<(&'e str, &'e AggExpr)> {
    let AggExpr::Named { name, args } = expr else {
        return None;
    };
    if name != op || args.len() != 3 {
        return None;
    }
    let arg = |key: &str| args.iter().find(|(k, _)| k == key).map(|(_, v)| v);
    if !is_elements(arg("input")?) {
        return None;
    }
    let Some(Value::String(var)) = arg("as")?.as_literal() else {
        return None;
    };
    Some((var.as_str(), arg(body_key)?))
}

/// The per-element values an accumulator should see.
fn element_values(expr: &AggExpr, pushed: &AggExpr) -> Option<AggExpr> {
    if is_elements(expr) {
        return Some(pushed.clone());
    }
    let (var, body) = map_over_elements(expr)?;
    body.substitute_var(var, pushed)
}

/// The accumulator computing `expr` over the grouped elements, if one does.
fn accumulator_of(expr: &AggExpr, pushed: &AggExpr) -> Option<Accumulator> {
    match expr {
        AggExpr::Unary { name, arg } if name == "$size" => {
            if is_elements(arg) {
                return Some(Accumulator::new("$sum", AggExpr::literal(1)));
            }
            let (var, cond) = filter_over_elements(arg)?;
            let cond = cond.substitute_var(var, pushed)?;
            Some(Accumulator::new(
                "$sum",
                AggExpr::named(
                    "$cond",
                    vec![("if", cond), ("then", AggExpr::literal(1)), ("else", AggExpr::literal(0))],
                ),
            ))
        }
        AggExpr::Unary { name, arg } if matches!(name.as_str(), "$sum" | "$avg" | "$min" | "$max" | "$stdDevPop" | "$stdDevSamp") => {
            Some(Accumulator::new(name, element_values(arg, pushed)?))
        }
        AggExpr::Op { name, args } if name == "$arrayElemAt" => match args.as_slice() {
            [input, AggExpr::Literal(index)] if is_elements(input) => match index.as_i64() {
                Some(0) => Some(Accumulator::new("$first", pushed.clone())),
                Some(-1) => Some(Accumulator::new("$last", pushed.clone())),
                _ => None,
            },
            _ => None,
        },
        AggExpr::Op { name, args } if name == "$setUnion" => match args.as_slice() {
            [input] => Some(Accumulator::new("$addToSet", element_values(input, pushed)?)),
            _ => None,
        },
        AggExpr::Op { name, args } if name == "$anyElementTrue" || name == "$allElementsTrue" => {
            let [input] = args.as_slice() else {
                return None;
            };
            let (var, body) = map_over_elements(input)?;
            let op = if name == "$anyElementTrue" { "$max" } else { "$min" };
            Some(Accumulator::new(op, body.substitute_var(var, pushed)?))
        }
        _ => None,
    }
}

/// Inline `$let` variables bound to plain field paths.
fn inline_lets(expr: &AggExpr) -> AggExpr {
    let expr = expr.map_children(&mut |child| inline_lets(child));
    let AggExpr::Named { name, args } = &expr else {
        return expr;
    };
    let [(vars_key, AggExpr::Document(vars)), (in_key, body)] = args.as_slice() else {
        return expr;
    };
    if name != "$let" || vars_key != "vars" || in_key != "in" {
        return expr;
    }
    if !vars.iter().all(|(_, value)| matches!(value, AggExpr::Field(_))) {
        return expr;
    }
    let mut inlined = body.clone();
    for (var, value) in vars {
        match inlined.substitute_var(var, value) {
            Some(next) => inlined = next,
            None => return expr,
        }
    }
    inlined
}

// -----------------------------
// 3) $match simplification
// -----------------------------

fn simplify_matches(stages: Vec<Stage>) -> Vec<Stage> {
    let mut out: Vec<Stage> = Vec::with_capacity(stages.len());
    for stage in stages {
        let Stage::Match(filter) = stage else {
            out.push(stage);
            continue;
        };
        let filter = filter.simplify();
        if filter == Filter::True {
            trace!("dropped an always-true $match");
            continue;
        }
        match out.last_mut() {
            Some(Stage::Match(previous)) => {
                let combined = Filter::And(vec![previous.clone(), filter]).simplify();
                trace!(filter = %Stage::Match(combined.clone()), "combined consecutive $match stages");
                *previous = combined;
            }
            _ => out.push(Stage::Match(filter)),
        }
    }
    out
}

// -----------------------------
// 4) $project merge
// -----------------------------

fn merge_projects(stages: Vec<Stage>) -> Vec<Stage> {
    let mut out: Vec<Stage> = Vec::with_capacity(stages.len());
    for stage in stages {
        let merged = match (out.last(), &stage) {
            (Some(Stage::Project(first)), Stage::Project(second)) => merge_project(first, second),
            _ => None,
        };
        match merged {
            Some(merged) => {
                trace!(stage = %merged, "merged consecutive $project stages");
                if let Some(last) = out.last_mut() {
                    *last = merged;
                }
            }
            None => out.push(stage),
        }
    }
    out
}

/// Compose two projections when the second reads only what the first computes.
fn merge_project(first: &[(String, ProjectField)], second: &[(String, ProjectField)]) -> Option<Stage> {
    if first.iter().any(|(_, f)| *f == ProjectField::Include) {
        return None;
    }
    let computed = |name: &str| {
        first.iter().find_map(|(n, f)| match f {
            ProjectField::Computed(expr) if n == name => Some(expr),
            _ => None,
        })
    };

    let mut reads = Vec::new();
    for (name, field) in second {
        match field {
            ProjectField::Computed(expr) => {
                if expr.references_root() {
                    return None;
                }
                expr.referenced_fields(&mut reads);
            }
            ProjectField::Include => reads.push(name.clone()),
            ProjectField::Exclude => {}
        }
    }
    if reads.iter().any(|name| computed(name).is_none()) {
        return None;
    }

    let mut merged = Vec::with_capacity(second.len());
    for (name, field) in second {
        let field = match field {
            ProjectField::Computed(expr) => {
                // a dotted read into a computed value that is not a path cannot be composed
                let failed = Cell::new(false);
                let substituted = expr.substitute_fields(&|path: &str| {
                    let (head, rest) = match path.split_once('.') {
                        Some((head, rest)) => (head, Some(rest)),
                        None => (path, None),
                    };
                    let source = computed(head)?;
                    let composed = match rest {
                        None => Some(source.clone()),
                        Some(rest) => source.extend_path(rest),
                    };
                    if composed.is_none() {
                        failed.set(true);
                    }
                    composed
                });
                if failed.get() {
                    return None;
                }
                ProjectField::Computed(substituted)
            }
            ProjectField::Include => ProjectField::Computed(computed(name)?.clone()),
            ProjectField::Exclude => ProjectField::Exclude,
        };
        merged.push((name.clone(), field));
    }
    if !second.iter().any(|(name, _)| name == "_id")
        && let Some(id) = first.iter().find(|(name, _)| name == "_id")
    {
        merged.push(id.clone());
    }
    Some(Stage::Project(merged))
}

// -----------------------------
// 5) $skip / $limit
// -----------------------------

fn merge_windows(stages: Vec<Stage>) -> Vec<Stage> {
    let mut out: Vec<Stage> = Vec::with_capacity(stages.len());
    for stage in stages {
        match (out.last_mut(), &stage) {
            (Some(Stage::Limit(previous)), Stage::Limit(n)) => {
                *previous = (*previous).min(*n);
                trace!(limit = *previous, "combined consecutive $limit stages");
            }
            (Some(Stage::Skip(previous)), Stage::Skip(n)) => {
                *previous = previous.saturating_add(*n);
                trace!(skip = *previous, "combined consecutive $skip stages");
            }
            _ => out.push(stage),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mql::FieldOp;

    fn server(stages: Vec<Stage>) -> Vec<Step> {
        stages.into_iter().map(Step::Server).collect()
    }

    #[test]
    fn windows_combine() {
        let out = Optimizer::new().optimize(server(vec![
            Stage::Skip(2),
            Stage::Skip(3),
            Stage::Limit(10),
            Stage::Limit(4),
        ]));
        assert_eq!(out.stages, vec![Stage::Skip(5), Stage::Limit(4)]);
    }

    #[test]
    fn always_true_match_is_dropped() {
        let out = Optimizer::new().optimize(server(vec![Stage::Match(Filter::And(vec![
            Filter::True,
            Filter::True,
        ]))]));
        assert!(out.stages.is_empty());
    }

    #[test]
    fn consecutive_matches_become_one() {
        let out = Optimizer::new().optimize(server(vec![
            Stage::Match(Filter::field("A", FieldOp::Eq(1.into()))),
            Stage::Match(Filter::field("B", FieldOp::Gt(2.into()))),
        ]));
        assert_eq!(
            render(&out.stages),
            vec!["{ $match : { A : 1, B : { $gt : 2 } } }"]
        );
    }

    #[test]
    fn let_over_a_field_is_inlined() {
        let expr = AggExpr::named(
            "$let",
            vec![
                ("vars", AggExpr::Document(vec![("this".into(), AggExpr::field("__agg0"))])),
                ("in", AggExpr::Var { name: "this".into(), path: Some("Name".into()) }),
            ],
        );
        assert_eq!(inline_lets(&expr), AggExpr::field("__agg0.Name"));
    }

    fn render(stages: &[Stage]) -> Vec<String> {
        crate::mql::render_pipeline(stages)
    }
}
