//! Preparing lambdas that run on the client after a pipeline split.
//!
//! Values coming back from the server carry element names (`_id`, `k`,
//! renamed members), so member accesses are rewritten to match. A projection
//! that only partly translates keeps its translatable pieces on the server as
//! `_snippets` and reads them back through [`Expr::Snippet`].

use std::convert::Infallible;

use super::{
    context::{Symbol, TranslationContext},
    expression::translate_expression,
};
use crate::{
    ast::Expr,
    error::TranslationError,
    mql::AggExpr,
    serializer::Serializer,
    transform::{free_parameters, map_children},
};

type Scope = Vec<(String, Option<Serializer>)>;

/// Rewrite a one-parameter lambda over values described by `serializer`.
pub fn rewrite_lambda(lambda: &Expr, serializer: &Serializer) -> Expr {
    match lambda {
        Expr::Lambda { params, body } if params.len() == 1 => {
            let mut scope = vec![(params[0].clone(), Some(serializer.clone()))];
            Expr::Lambda {
                params: params.clone(),
                body: Box::new(rewrite(body, &mut scope).0),
            }
        }
        other => other.clone(),
    }
}

/// The rewritten node and, when known, the serializer of its value.
fn rewrite(expr: &Expr, scope: &mut Scope) -> (Expr, Option<Serializer>) {
    match expr {
        Expr::Parameter(name) => {
            let serializer = scope
                .iter()
                .rev()
                .find(|(p, _)| p == name)
                .and_then(|(_, s)| s.clone());
            (expr.clone(), serializer)
        }
        Expr::Member { target, name } => {
            let (target, serializer) = rewrite(target, scope);
            match serializer.as_ref().and_then(|s| element_member(s, name)) {
                Some((element, serializer)) => (Expr::member(target, element), Some(serializer)),
                None => (Expr::member(target, name.clone()), None),
            }
        }
        Expr::Index { target, index } => {
            let (target, serializer) = rewrite(target, scope);
            let (index, _) = rewrite(index, scope);
            let item = serializer.and_then(|s| match s.underlying() {
                Serializer::Dictionary { value, .. } => Some((**value).clone()),
                other => other.item(),
            });
            (Expr::index(target, index), item)
        }
        Expr::Call { target: Some(target), method, type_args, args } => {
            let (target, serializer) = rewrite(target, scope);
            let (target, item) = match serializer {
                Some(Serializer::Grouping { element, .. }) => (Expr::member(target, "_elements"), Some(*element)),
                Some(serializer) => (target, serializer.item()),
                None => (target, None),
            };
            let args = args
                .iter()
                .map(|arg| match arg {
                    Expr::Lambda { params, body } => {
                        let depth = scope.len();
                        for (i, param) in params.iter().enumerate() {
                            // the first parameter receives the enumerated item
                            let serializer = if i == 0 { item.clone() } else { None };
                            scope.push((param.clone(), serializer));
                        }
                        let body = rewrite(body, scope).0;
                        scope.truncate(depth);
                        Expr::Lambda { params: params.clone(), body: Box::new(body) }
                    }
                    other => rewrite(other, scope).0,
                })
                .collect();
            let call = Expr::Call {
                target: Some(Box::new(target)),
                method: method.clone(),
                type_args: type_args.clone(),
                args,
            };
            (call, None)
        }
        Expr::Lambda { params, body } => {
            let depth = scope.len();
            scope.extend(params.iter().map(|p| (p.clone(), None)));
            let body = rewrite(body, scope).0;
            scope.truncate(depth);
            (Expr::Lambda { params: params.clone(), body: Box::new(body) }, None)
        }
        other => {
            let rewritten = map_children(other, &mut |child| Ok::<_, Infallible>(rewrite(child, scope).0));
            match rewritten {
                Ok(rewritten) => (rewritten, None),
                Err(never) => match never {},
            }
        }
    }
}

/// Element name of a member as it appears in server output.
fn element_member(serializer: &Serializer, name: &str) -> Option<(String, Serializer)> {
    match (serializer, name) {
        (Serializer::Nullable(inner), "Value") => Some(("Value".into(), (**inner).clone())),
        (Serializer::Nullable(_), "HasValue") => Some(("HasValue".into(), Serializer::Boolean)),
        (Serializer::KeyValuePair { key, positional: true, .. }, "Key") => Some(("Key".into(), (**key).clone())),
        (Serializer::KeyValuePair { value, positional: true, .. }, "Value") => {
            Some(("Value".into(), (**value).clone()))
        }
        (Serializer::Any, _) => None,
        _ => serializer.member(name),
    }
}

/// Split a projection into server-computed snippets and a client lambda.
///
/// Every maximal subtree that reads the document and translates on its own
/// becomes a snippet; equal subtrees share one.
pub fn extract_snippets(
    ctx: &mut TranslationContext<'_>,
    symbol: Symbol,
    selector: &Expr,
) -> Result<(Vec<AggExpr>, Expr), TranslationError> {
    let Expr::Lambda { params, body } = selector else {
        return Ok((Vec::new(), selector.clone()));
    };
    let mut snippets = Vec::new();
    let body = ctx.scoped(vec![symbol], |ctx| split(ctx, body, &mut snippets))?;
    Ok((snippets, Expr::Lambda { params: params.clone(), body: Box::new(body) }))
}

fn split(
    ctx: &mut TranslationContext<'_>,
    expr: &Expr,
    snippets: &mut Vec<AggExpr>,
) -> Result<Expr, TranslationError> {
    let free = free_parameters(expr);
    if free.is_empty() {
        return Ok(expr.clone());
    }
    if !matches!(expr, Expr::Lambda { .. }) && free.iter().all(|p| ctx.lookup(p).is_some()) {
        match translate_expression(ctx, expr) {
            Ok(translated) => {
                let index = match snippets.iter().position(|s| *s == translated.ast) {
                    Some(index) => index,
                    None => {
                        snippets.push(translated.ast);
                        snippets.len() - 1
                    }
                };
                return Ok(Expr::Snippet(index));
            }
            Err(
                TranslationError::Unsupported { .. }
                | TranslationError::FeatureNotSupported { .. }
                | TranslationError::UnknownIdentifier(_),
            ) => {}
            Err(error) => return Err(error),
        }
    }
    map_children(expr, &mut |child| split(ctx, child, snippets))
}
