//! Structural helpers over expression trees: parameter usage and child
//! rewriting.

use crate::ast::Expr;

/// Direct children of a node, in evaluation order.
pub fn children(expr: &Expr) -> Vec<&Expr> {
    match expr {
        Expr::Constant(_)
        | Expr::Identifier(_)
        | Expr::Parameter(_)
        | Expr::Source(_)
        | Expr::Snippet(_) => Vec::new(),
        Expr::Member { target, .. } => vec![target],
        Expr::Index { target, index } => vec![target, index],
        Expr::Call { target, args, .. } => {
            let mut out: Vec<&Expr> = target.iter().map(|t| t.as_ref()).collect();
            out.extend(args.iter());
            out
        }
        Expr::Unary { operand, .. } => vec![operand],
        Expr::Binary { left, right, .. } => vec![left, right],
        Expr::Conditional { test, if_true, if_false } => vec![test, if_true, if_false],
        Expr::Lambda { body, .. } => vec![body],
        Expr::New { members, .. } => members.iter().map(|(_, e)| e).collect(),
        Expr::NewArray(items) => items.iter().collect(),
        Expr::Convert { operand, .. } | Expr::TypeIs { operand, .. } => vec![operand],
        Expr::StringEquals { left, right, .. } => vec![left, right],
    }
}

/// Rebuild a node with every direct child passed through `f`.
pub fn map_children<E>(
    expr: &Expr,
    f: &mut impl FnMut(&Expr) -> Result<Expr, E>,
) -> Result<Expr, E> {
    Ok(match expr {
        Expr::Constant(_)
        | Expr::Identifier(_)
        | Expr::Parameter(_)
        | Expr::Source(_)
        | Expr::Snippet(_) => expr.clone(),
        Expr::Member { target, name } => Expr::Member { target: boxed(target, f)?, name: name.clone() },
        Expr::Index { target, index } => Expr::Index {
            target: boxed(target, f)?,
            index: boxed(index, f)?,
        },
        Expr::Call { target, method, type_args, args } => Expr::Call {
            target: match target {
                Some(t) => Some(boxed(t, f)?),
                None => None,
            },
            method: method.clone(),
            type_args: type_args.clone(),
            args: args.iter().map(&mut *f).collect::<Result<_, _>>()?,
        },
        Expr::Unary { op, operand } => Expr::Unary { op: *op, operand: boxed(operand, f)? },
        Expr::Binary { op, left, right } => Expr::Binary {
            op: *op,
            left: boxed(left, f)?,
            right: boxed(right, f)?,
        },
        Expr::Conditional { test, if_true, if_false } => Expr::Conditional {
            test: boxed(test, f)?,
            if_true: boxed(if_true, f)?,
            if_false: boxed(if_false, f)?,
        },
        Expr::Lambda { params, body } => Expr::Lambda { params: params.clone(), body: boxed(body, f)? },
        Expr::New { type_name, members } => Expr::New {
            type_name: type_name.clone(),
            members: members
                .iter()
                .map(|(name, e)| f(e).map(|e| (name.clone(), e)))
                .collect::<Result<_, _>>()?,
        },
        Expr::NewArray(items) => Expr::NewArray(items.iter().map(&mut *f).collect::<Result<_, _>>()?),
        Expr::Convert { operand, to } => Expr::Convert { operand: boxed(operand, f)?, to: to.clone() },
        Expr::TypeIs { operand, type_name } => Expr::TypeIs {
            operand: boxed(operand, f)?,
            type_name: type_name.clone(),
        },
        Expr::StringEquals { left, right, ignore_case } => Expr::StringEquals {
            left: boxed(left, f)?,
            right: boxed(right, f)?,
            ignore_case: *ignore_case,
        },
    })
}

fn boxed<E>(
    expr: &Expr,
    f: &mut impl FnMut(&Expr) -> Result<Expr, E>,
) -> Result<Box<Expr>, E> {
    f(expr).map(Box::new)
}

/// Check whether `name` occurs free in `expr` (nested lambdas may shadow it).
pub fn references_parameter(expr: &Expr, name: &str) -> bool {
    match expr {
        Expr::Parameter(p) => p == name,
        Expr::Lambda { params, body } => {
            !params.iter().any(|p| p == name) && references_parameter(body, name)
        }
        other => children(other).into_iter().any(|c| references_parameter(c, name)),
    }
}

/// Free parameters of an expression, in first-occurrence order.
pub fn free_parameters(expr: &Expr) -> Vec<String> {
    let mut out = Vec::new();
    collect_free(expr, &mut Vec::new(), &mut out);
    out
}

fn collect_free(expr: &Expr, bound: &mut Vec<String>, out: &mut Vec<String>) {
    match expr {
        Expr::Parameter(p) => {
            if !bound.contains(p) && !out.contains(p) {
                out.push(p.clone());
            }
        }
        Expr::Lambda { params, body } => {
            let depth = bound.len();
            bound.extend(params.iter().cloned());
            collect_free(body, bound, out);
            bound.truncate(depth);
        }
        other => {
            for child in children(other) {
                collect_free(child, bound, out);
            }
        }
    }
}

/// True when any node satisfies `predicate`.
pub fn any_node(expr: &Expr, predicate: &impl Fn(&Expr) -> bool) -> bool {
    predicate(expr) || children(expr).into_iter().any(|c| any_node(c, predicate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadowed_parameters_are_not_free() {
        let inner = Expr::lambda(&["x"], Expr::member(Expr::param("x"), "A"));
        let outer = Expr::call(Expr::member(Expr::param("y"), "Items"), "Select", vec![inner]);
        assert_eq!(free_parameters(&outer), vec!["y".to_string()]);
        assert!(!references_parameter(&outer, "x"));
    }
}
