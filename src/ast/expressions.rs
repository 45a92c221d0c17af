use std::fmt;

use crate::ast::{BinOp, TypeRef, UnaryOp};
use crate::value::Value;

/// A named collection a query chain starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    /// Name the query text uses for the source
    pub name: String,
    /// Collection the pipeline runs against
    pub collection: String,
    /// Document type of the collection, resolved through the serializer registry
    pub document_type: String,
}

/// A node of the query expression graph.
///
/// Children are exclusively owned; the graph is a tree. Translation never
/// mutates a tree, rewrites build new nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal or folded value
    ///
    /// # Example
    /// ```text
    /// 42
    /// "abc"
    /// ```
    Constant(Value),

    /// Unresolved name, only present before normalization
    Identifier(String),

    /// Reference to a lambda parameter
    Parameter(String),

    /// The collection a query chain starts from
    Source(SourceRef),

    /// Member access
    ///
    /// # Example
    /// ```text
    /// x.Name
    /// x.Address.City
    /// ```
    Member { target: Box<Expr>, name: String },

    /// Indexer access
    ///
    /// # Example
    /// ```text
    /// x.Tags[0]
    /// x.Attributes["color"]
    /// ```
    Index { target: Box<Expr>, index: Box<Expr> },

    /// Method call. Static calls have no target and a qualified method name
    /// (`Math.Abs`); host functions have no target and a bare name.
    ///
    /// # Example
    /// ```text
    /// x.Name.StartsWith("J")
    /// docs.OfType<Cat>()
    /// Math.Abs(x.Delta)
    /// ```
    Call {
        target: Option<Box<Expr>>,
        method: String,
        type_args: Vec<TypeRef>,
        args: Vec<Expr>,
    },

    Unary { op: UnaryOp, operand: Box<Expr> },

    Binary { op: BinOp, left: Box<Expr>, right: Box<Expr> },

    /// Ternary conditional
    ///
    /// # Example
    /// ```text
    /// x.Age >= 18 ? "adult" : "minor"
    /// ```
    Conditional {
        test: Box<Expr>,
        if_true: Box<Expr>,
        if_false: Box<Expr>,
    },

    /// Lambda with named parameters (names may be empty in built expressions)
    ///
    /// # Example
    /// ```text
    /// x => x.Age > 21
    /// (acc, item) => acc + item
    /// ```
    Lambda { params: Vec<String>, body: Box<Expr> },

    /// Object construction; anonymous when `type_name` is `None`
    ///
    /// # Example
    /// ```text
    /// new { x.Name, Total = x.Items.Sum() }
    /// new Summary { Name = x.Name }
    /// ```
    New {
        type_name: Option<String>,
        members: Vec<(String, Expr)>,
    },

    /// Array construction
    ///
    /// # Example
    /// ```text
    /// new[] { 1, 2, 3 }
    /// ```
    NewArray(Vec<Expr>),

    /// Cast to a declared type
    ///
    /// # Example
    /// ```text
    /// (decimal)x.Price
    /// ```
    Convert { operand: Box<Expr>, to: TypeRef },

    /// Runtime type test
    ///
    /// # Example
    /// ```text
    /// x is Cat
    /// ```
    TypeIs { operand: Box<Expr>, type_name: String },

    /// Canonical string equality, optionally case-insensitive
    StringEquals {
        left: Box<Expr>,
        right: Box<Expr>,
        ignore_case: bool,
    },

    /// Value computed by the server for a client-side projection
    Snippet(usize),
}

impl Expr {
    pub fn constant(value: impl Into<Value>) -> Expr {
        Expr::Constant(value.into())
    }

    pub fn ident(name: impl Into<String>) -> Expr {
        Expr::Identifier(name.into())
    }

    pub fn param(name: impl Into<String>) -> Expr {
        Expr::Parameter(name.into())
    }

    pub fn member(target: Expr, name: impl Into<String>) -> Expr {
        Expr::Member { target: Box::new(target), name: name.into() }
    }

    pub fn index(target: Expr, index: Expr) -> Expr {
        Expr::Index { target: Box::new(target), index: Box::new(index) }
    }

    pub fn call(target: Expr, method: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Call {
            target: Some(Box::new(target)),
            method: method.into(),
            type_args: Vec::new(),
            args,
        }
    }

    pub fn static_call(method: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Call { target: None, method: method.into(), type_args: Vec::new(), args }
    }

    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary { op, left: Box::new(left), right: Box::new(right) }
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Expr {
        Expr::Unary { op, operand: Box::new(operand) }
    }

    pub fn lambda(params: &[&str], body: Expr) -> Expr {
        Expr::Lambda {
            params: params.iter().map(|p| p.to_string()).collect(),
            body: Box::new(body),
        }
    }

    pub fn as_constant(&self) -> Option<&Value> {
        match self {
            Expr::Constant(value) => Some(value),
            _ => None,
        }
    }

    /// Parameters and body of a single-parameter lambda.
    pub fn as_lambda1(&self) -> Option<(&str, &Expr)> {
        match self {
            Expr::Lambda { params, body } if params.len() == 1 => Some((&params[0], body)),
            _ => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_expr(f, self, 0)
    }
}

fn write_expr(f: &mut fmt::Formatter<'_>, expr: &Expr, parent: u8) -> fmt::Result {
    match expr {
        Expr::Constant(value) => write_constant(f, value),
        Expr::Identifier(name) | Expr::Parameter(name) => write!(f, "{}", name),
        Expr::Source(source) => write!(f, "{}", source.name),
        Expr::Member { target, name } => {
            write_expr(f, target, 10)?;
            write!(f, ".{}", name)
        }
        Expr::Index { target, index } => {
            write_expr(f, target, 10)?;
            write!(f, "[")?;
            write_expr(f, index, 0)?;
            write!(f, "]")
        }
        Expr::Call { target, method, type_args, args } => {
            if let Some(target) = target {
                write_expr(f, target, 10)?;
                write!(f, ".")?;
            }
            write!(f, "{}", method)?;
            if !type_args.is_empty() {
                let names: Vec<String> = type_args.iter().map(|t| t.to_string()).collect();
                write!(f, "<{}>", names.join(", "))?;
            }
            write!(f, "(")?;
            write_list(f, args)?;
            write!(f, ")")
        }
        Expr::Unary { op, operand } => {
            let symbol = match op {
                UnaryOp::Not => "!",
                UnaryOp::Negate => "-",
            };
            write!(f, "{}", symbol)?;
            write_expr(f, operand, 9)
        }
        Expr::Binary { op, left, right } => {
            let precedence = op.precedence();
            if precedence < parent {
                write!(f, "(")?;
            }
            write_expr(f, left, precedence)?;
            write!(f, " {} ", op.symbol())?;
            write_expr(f, right, precedence + 1)?;
            if precedence < parent {
                write!(f, ")")?;
            }
            Ok(())
        }
        Expr::Conditional { test, if_true, if_false } => {
            if parent > 0 {
                write!(f, "(")?;
            }
            write_expr(f, test, 1)?;
            write!(f, " ? ")?;
            write_expr(f, if_true, 1)?;
            write!(f, " : ")?;
            write_expr(f, if_false, 1)?;
            if parent > 0 {
                write!(f, ")")?;
            }
            Ok(())
        }
        Expr::Lambda { params, body } => {
            if params.len() == 1 && !params[0].is_empty() {
                write!(f, "{} => ", params[0])?;
            } else {
                write!(f, "({}) => ", params.join(", "))?;
            }
            write_expr(f, body, 0)
        }
        Expr::New { type_name, members } => {
            match type_name {
                Some(name) => write!(f, "new {} {{ ", name)?,
                None => write!(f, "new {{ ")?,
            }
            for (i, (name, value)) in members.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{} = ", name)?;
                write_expr(f, value, 0)?;
            }
            write!(f, " }}")
        }
        Expr::NewArray(items) => {
            write!(f, "new[] {{ ")?;
            write_list(f, items)?;
            write!(f, " }}")
        }
        Expr::Convert { operand, to } => {
            write!(f, "({})", to)?;
            write_expr(f, operand, 10)
        }
        Expr::TypeIs { operand, type_name } => {
            write_expr(f, operand, 5)?;
            write!(f, " is {}", type_name)
        }
        Expr::StringEquals { left, right, ignore_case } => {
            write_expr(f, left, 10)?;
            write!(f, ".Equals(")?;
            write_expr(f, right, 0)?;
            if *ignore_case {
                write!(f, ", StringComparison.OrdinalIgnoreCase")?;
            }
            write!(f, ")")
        }
        Expr::Snippet(index) => write!(f, "_snippets[{}]", index),
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write_expr(f, item, 0)?;
    }
    Ok(())
}

fn write_constant(f: &mut fmt::Formatter<'_>, value: &Value) -> fmt::Result {
    match value {
        Value::String(s) => write!(f, "\"{}\"", s.replace('"', "\\\"")),
        Value::Int64(n) => write!(f, "{}L", n),
        Value::Decimal(d) => write!(f, "{}m", d),
        Value::Array(items) => {
            write!(f, "{{ ")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write_constant(f, item)?;
            }
            write!(f, " }}")
        }
        other => write!(f, "{}", other),
    }
}
