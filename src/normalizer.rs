//! Expression normalization.
//!
//! Produces the canonical form the translators work on:
//!
//! - every name is resolved: lambda parameters become [`Expr::Parameter`],
//!   captured values become constants, collections become [`Expr::Source`],
//!   static classes become qualified static calls (`Math.Abs`);
//! - unnamed lambda parameters get synthesized names (`_p0`, `_p1`, ...);
//! - closed subtrees are evaluated on the client and folded into constants;
//! - equivalent idioms are rewritten to one form, most notably
//!   case-insensitive string equality into a single [`Expr::StringEquals`].

use tracing::trace;

use crate::{
    ast::{BinOp, Expr, UnaryOp},
    environment::Environment,
    error::TranslationError,
    evaluator::Evaluator,
    transform::{any_node, free_parameters, map_children, references_parameter},
    value::Value,
};

/// Classes whose members are called statically.
const STATIC_CLASSES: &[&str] = &["Math", "string", "String", "Regex", "StringComparison", "RegexOptions"];

/// A lambda parameter in scope: its name in the source and its canonical name.
struct ScopeEntry {
    written: String,
    canonical: String,
}

pub struct Normalizer<'e> {
    env: &'e Environment,
    evaluator: Evaluator<'e>,
    scope: Vec<ScopeEntry>,
    synthesized: usize,
}

/// Normalize an expression graph against a capture environment.
pub fn normalize(expr: &Expr, env: &Environment) -> Result<Expr, TranslationError> {
    let mut normalizer = Normalizer::new(env);
    let resolved = normalizer.resolve(expr)?;
    Ok(normalizer.canonicalize(&resolved))
}

impl<'e> Normalizer<'e> {
    pub fn new(env: &'e Environment) -> Self {
        Normalizer {
            env,
            evaluator: Evaluator::new(env),
            scope: Vec::new(),
            synthesized: 0,
        }
    }

    fn synthesize_parameter(&mut self) -> String {
        let name = format!("_p{}", self.synthesized);
        self.synthesized += 1;
        name
    }

    fn lookup_parameter(&self, name: &str) -> Option<&str> {
        self.scope
            .iter()
            .rev()
            .find(|entry| entry.written == name)
            .map(|entry| entry.canonical.as_str())
    }

    /// Resolve names, synthesize parameter identities and expand method groups.
    pub fn resolve(&mut self, expr: &Expr) -> Result<Expr, TranslationError> {
        match expr {
            Expr::Identifier(name) => self.resolve_identifier(name),
            Expr::Parameter(name) => match self.lookup_parameter(name) {
                Some(canonical) => Ok(Expr::Parameter(canonical.to_string())),
                None => Ok(expr.clone()),
            },
            Expr::Source(source) if !self.scope.is_empty() => {
                Err(TranslationError::NestedQuerySource(source.name.clone()))
            }
            Expr::Lambda { params, body } => {
                let depth = self.scope.len();
                let mut canonical = Vec::with_capacity(params.len());
                for param in params {
                    let name = if param.is_empty() { self.synthesize_parameter() } else { param.clone() };
                    self.scope.push(ScopeEntry {
                        written: param.clone(),
                        canonical: name.clone(),
                    });
                    canonical.push(name);
                }
                let body = self.resolve(body);
                self.scope.truncate(depth);
                Ok(Expr::Lambda { params: canonical, body: Box::new(body?) })
            }
            Expr::Member { target, name } => match target.as_ref() {
                Expr::Identifier(class) if self.is_static_class(class) => {
                    Ok(static_member(class, name).unwrap_or_else(|| {
                        Expr::static_call(format!("{}.{}", canonical_class(class), name), Vec::new())
                    }))
                }
                _ => Ok(Expr::member(self.resolve(target)?, name.clone())),
            },
            Expr::Call { target: Some(target), method, type_args, args } => {
                let args = args
                    .iter()
                    .map(|a| self.resolve_argument(a))
                    .collect::<Result<Vec<_>, _>>()?;
                match target.as_ref() {
                    Expr::Identifier(class) if self.is_static_class(class) => Ok(Expr::Call {
                        target: None,
                        method: format!("{}.{}", canonical_class(class), method),
                        type_args: type_args.clone(),
                        args,
                    }),
                    _ => Ok(Expr::Call {
                        target: Some(Box::new(self.resolve(target)?)),
                        method: method.clone(),
                        type_args: type_args.clone(),
                        args,
                    }),
                }
            }
            Expr::Call { target: None, method, type_args, args } => {
                if !method.contains('.') && self.env.function(method).is_none() {
                    return Err(TranslationError::UnknownIdentifier(method.clone()));
                }
                Ok(Expr::Call {
                    target: None,
                    method: method.clone(),
                    type_args: type_args.clone(),
                    args: args.iter().map(|a| self.resolve(a)).collect::<Result<_, _>>()?,
                })
            }
            other => map_children(other, &mut |child| self.resolve(child)),
        }
    }

    fn is_static_class(&self, name: &str) -> bool {
        STATIC_CLASSES.contains(&name)
            && self.lookup_parameter(name).is_none()
            && self.env.capture(name).is_none()
    }

    fn resolve_identifier(&mut self, name: &str) -> Result<Expr, TranslationError> {
        if let Some(canonical) = self.lookup_parameter(name) {
            return Ok(Expr::Parameter(canonical.to_string()));
        }
        if let Some(value) = self.env.capture(name) {
            return Ok(Expr::Constant(value.clone()));
        }
        if let Some(source) = self.env.source(name) {
            if !self.scope.is_empty() {
                return Err(TranslationError::NestedQuerySource(name.to_string()));
            }
            return Ok(Expr::Source(source.clone()));
        }
        Err(TranslationError::UnknownIdentifier(name.to_string()))
    }

    /// Method-group arguments: a bare host function name where a lambda is
    /// expected becomes `_pN => f(_pN)`.
    fn resolve_argument(&mut self, arg: &Expr) -> Result<Expr, TranslationError> {
        if let Expr::Identifier(name) = arg
            && self.lookup_parameter(name).is_none()
            && self.env.capture(name).is_none()
            && self.env.function(name).is_some()
        {
            let param = self.synthesize_parameter();
            return Ok(Expr::Lambda {
                params: vec![param.clone()],
                body: Box::new(Expr::static_call(name.clone(), vec![Expr::Parameter(param)])),
            });
        }
        self.resolve(arg)
    }

    /// Apply canonical rewrites and constant folding bottom-up.
    pub fn canonicalize(&self, expr: &Expr) -> Expr {
        let rebuilt = match map_children(expr, &mut |child| {
            Ok::<_, std::convert::Infallible>(self.canonicalize(child))
        }) {
            Ok(e) => e,
            Err(never) => match never {},
        };
        let rewritten = self.rewrite(rebuilt);
        self.fold(rewritten)
    }

    fn rewrite(&self, expr: Expr) -> Expr {
        match expr {
            Expr::Conditional { test, if_true, if_false } => match test.as_constant() {
                Some(Value::Boolean(true)) => *if_true,
                Some(Value::Boolean(false)) => *if_false,
                _ => Expr::Conditional { test, if_true, if_false },
            },
            Expr::Binary { op: BinOp::Coalesce, left, right } => match left.as_constant() {
                Some(Value::Null) => *right,
                Some(_) => *left,
                None => Expr::Binary { op: BinOp::Coalesce, left, right },
            },
            Expr::Unary { op: UnaryOp::Not, operand } => match *operand {
                Expr::Unary { op: UnaryOp::Not, operand: inner } => *inner,
                other => Expr::unary(UnaryOp::Not, other),
            },
            // a.Equals(b, comparison)
            Expr::Call { target: Some(target), method, type_args, args }
                if method == "Equals" && (args.len() == 1 || args.len() == 2) =>
            {
                let mut args = args;
                let comparison = if args.len() == 2 { args.pop() } else { None };
                let other = args.remove(0);
                match comparison {
                    Some(cmp) => match ignore_case(&cmp) {
                        Some(true) => self.rewrite(Expr::StringEquals {
                            left: target,
                            right: Box::new(other),
                            ignore_case: true,
                        }),
                        Some(false) => self.rewrite(Expr::binary(BinOp::Equal, *target, other)),
                        None => Expr::Call {
                            target: Some(target),
                            method,
                            type_args,
                            args: vec![other, cmp],
                        },
                    },
                    None => self.rewrite(Expr::binary(BinOp::Equal, *target, other)),
                }
            }
            // string.Equals(a, b[, comparison])
            Expr::Call { target: None, method, args, type_args } if method == "string.Equals" => {
                match args.as_slice() {
                    [a, b] => self.rewrite(Expr::binary(BinOp::Equal, a.clone(), b.clone())),
                    [a, b, cmp] => match ignore_case(cmp) {
                        Some(true) => self.rewrite(Expr::StringEquals {
                            left: Box::new(a.clone()),
                            right: Box::new(b.clone()),
                            ignore_case: true,
                        }),
                        Some(false) => self.rewrite(Expr::binary(BinOp::Equal, a.clone(), b.clone())),
                        None => Expr::Call { target: None, method, args: args.clone(), type_args },
                    },
                    _ => Expr::Call { target: None, method, args: args.clone(), type_args },
                }
            }
            Expr::Binary { op: op @ (BinOp::Equal | BinOp::NotEqual), left, right } => {
                rewrite_case_comparison(op, *left, *right)
            }
            Expr::StringEquals { left, right, ignore_case: true } => {
                rewrite_case_comparison_folded(*left, *right)
            }
            // values.Any(y => F == y) over a constant collection
            Expr::Call { target: Some(target), method, type_args, args }
                if method == "Any" && args.len() == 1 && matches!(target.as_constant(), Some(Value::Array(_))) =>
            {
                match contains_rewrite(&args[0]) {
                    Some(field) => {
                        trace!(collection = %target, "rewriting Any equality into Contains");
                        Expr::call(*target, "Contains", vec![field])
                    }
                    None => Expr::Call { target: Some(target), method, type_args, args },
                }
            }
            other => other,
        }
    }

    /// Fold a closed subtree into a constant when the client interpreter can evaluate it.
    fn fold(&self, expr: Expr) -> Expr {
        if !self.is_foldable(&expr) {
            return expr;
        }
        match self.evaluator.evaluate_closed(&expr) {
            Ok(value) => {
                trace!(expression = %expr, value = %value, "folded closed subtree");
                Expr::Constant(value)
            }
            Err(error) => {
                trace!(expression = %expr, %error, "closed subtree left unfolded");
                expr
            }
        }
    }

    fn is_foldable(&self, expr: &Expr) -> bool {
        if matches!(expr, Expr::Constant(_) | Expr::Lambda { .. } | Expr::Source(_)) {
            return false;
        }
        free_parameters(expr).is_empty()
            && !any_node(expr, &|e| {
                matches!(e, Expr::Source(_) | Expr::Snippet(_) | Expr::Identifier(_))
                    || matches!(e, Expr::Call { target: None, method, .. }
                        if !method.contains('.') && !self.env.function(method).is_some_and(|f| f.is_pure()))
            })
    }
}

fn canonical_class(class: &str) -> &str {
    match class {
        "String" => "string",
        other => other,
    }
}

/// Static members that are constants rather than calls.
fn static_member(class: &str, name: &str) -> Option<Expr> {
    match class {
        "StringComparison" | "RegexOptions" => Some(Expr::constant(name)),
        "Math" if name == "PI" => Some(Expr::constant(std::f64::consts::PI)),
        "Math" if name == "E" => Some(Expr::constant(std::f64::consts::E)),
        "string" | "String" if name == "Empty" => Some(Expr::constant("")),
        _ => None,
    }
}

/// Whether a `StringComparison` argument ignores case; `None` when not constant.
fn ignore_case(comparison: &Expr) -> Option<bool> {
    match comparison.as_constant()? {
        Value::String(name) => Some(name.ends_with("IgnoreCase")),
        _ => None,
    }
}

/// Case conversion applied to a string: `Some(true)` for lower, `Some(false)` for upper.
fn case_conversion(expr: &Expr) -> Option<(&Expr, bool)> {
    match expr {
        Expr::Call { target: Some(target), method, args, .. } if args.is_empty() => match method.as_str() {
            "ToLower" | "ToLowerInvariant" => Some((target, true)),
            "ToUpper" | "ToUpperInvariant" => Some((target, false)),
            _ => None,
        },
        _ => None,
    }
}

/// `s.ToLower() == "lit"` and friends into one case-insensitive comparison.
fn rewrite_case_comparison(op: BinOp, left: Expr, right: Expr) -> Expr {
    let (converted, literal) = match (case_conversion(&left), right.as_constant()) {
        (Some(conversion), Some(Value::String(lit))) => (Some(conversion), Some(lit.clone())),
        _ => match (case_conversion(&right), left.as_constant()) {
            (Some(conversion), Some(Value::String(lit))) => (Some(conversion), Some(lit.clone())),
            _ => (None, None),
        },
    };

    let negate = |e: Expr| if op == BinOp::NotEqual { Expr::unary(UnaryOp::Not, e) } else { e };

    if let (Some((target, lower)), Some(literal)) = (converted, literal) {
        let reachable = if lower {
            literal == literal.to_lowercase()
        } else {
            literal == literal.to_uppercase()
        };
        if !reachable {
            trace!(literal = %literal, "case conversion can never equal literal");
            return Expr::constant(op == BinOp::NotEqual);
        }
        return negate(Expr::StringEquals {
            left: Box::new(target.clone()),
            right: Box::new(Expr::constant(literal)),
            ignore_case: true,
        });
    }

    if let (Some((a, lower_a)), Some((b, lower_b))) = (case_conversion(&left), case_conversion(&right))
        && lower_a == lower_b
    {
        return negate(Expr::StringEquals {
            left: Box::new(a.clone()),
            right: Box::new(b.clone()),
            ignore_case: true,
        });
    }

    Expr::binary(op, left, right)
}

/// Keep the field on the left of a case-insensitive comparison with a literal.
fn rewrite_case_comparison_folded(left: Expr, right: Expr) -> Expr {
    let (left, right) = if left.as_constant().is_some() && right.as_constant().is_none() {
        (right, left)
    } else {
        (left, right)
    };
    Expr::StringEquals {
        left: Box::new(left),
        right: Box::new(right),
        ignore_case: true,
    }
}

/// `y => F == y` or `y => y == F` where `F` does not use `y`.
fn contains_rewrite(lambda: &Expr) -> Option<Expr> {
    let (param, body) = lambda.as_lambda1()?;
    let Expr::Binary { op: BinOp::Equal, left, right } = body else {
        return None;
    };
    let is_param = |e: &Expr| matches!(e, Expr::Parameter(p) if p == param);
    let field = if is_param(right) {
        left
    } else if is_param(left) {
        right
    } else {
        return None;
    };
    if references_parameter(field, param) {
        return None;
    }
    Some((**field).clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_query;

    fn normalized(text: &str, env: &Environment) -> String {
        normalize(&parse_query(text).unwrap(), env).unwrap().to_string()
    }

    #[test]
    fn folds_captured_values() {
        let env = Environment::new()
            .with_source("docs", "c", "Doc")
            .with_capture("limit", 10);
        assert_eq!(
            normalized("docs.Where(x => x.A > limit * 2)", &env),
            "docs.Where(x => x.A > 20)"
        );
    }

    #[test]
    fn rewrites_lowercase_equality() {
        let env = Environment::new().with_source("docs", "c", "Doc");
        let expr = normalize(&parse_query("docs.Select(x => x.S.ToLower().Equals(\"abc\"))").unwrap(), &env).unwrap();
        let Expr::Call { args, .. } = expr else { panic!("expected a call") };
        let (_, body) = args[0].as_lambda1().unwrap();
        assert!(matches!(body, Expr::StringEquals { ignore_case: true, .. }));
    }

    #[test]
    fn unreachable_case_literal_folds_to_false() {
        let env = Environment::new().with_source("docs", "c", "Doc");
        assert_eq!(
            normalized("docs.Where(x => x.S.ToLower() == \"ABC\")", &env),
            "docs.Where(x => false)"
        );
    }

    #[test]
    fn nested_sources_are_rejected() {
        let env = Environment::new().with_source("docs", "c", "Doc");
        let result = normalize(&parse_query("docs.Where(x => docs.Any())").unwrap(), &env);
        assert_eq!(result, Err(TranslationError::NestedQuerySource("docs".to_string())));
    }
}
