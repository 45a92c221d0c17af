//! # Query Expression Graph
//!
//! This module defines the expression graph a query arrives in: a LINQ-style
//! method chain over a named collection, with lambdas for predicates,
//! selectors and keys.
//!
//! ## Architecture Overview
//!
//! - **[tokens]** - Lexical tokens produced by the lexer
//! - **[expressions]** - Expression nodes (constants, members, calls, lambdas, ...)
//! - **[operators]** - Binary and unary operators
//! - **[types]** - Type references used by casts, type tests and generic arguments
//!
//! ## Quick Start
//!
//! ```text
//! people.Where(p => p.Age >= 21).OrderBy(p => p.Name).Select(p => new { p.Name, p.Age })
//! ```
//!
//! The chain is an ordinary expression tree: each query operator is a
//! [`Expr::Call`] whose target is the previous operator, bottoming out at the
//! collection identifier. The normalizer resolves that identifier to an
//! [`Expr::Source`] and the translator walks the chain back up.
//!
//! ## Canonical Form
//!
//! After normalization the tree contains no [`Expr::Identifier`] nodes: every
//! name is a lambda [`Expr::Parameter`], a folded [`Expr::Constant`], a
//! [`Expr::Source`], or part of a qualified static call (`Math.Abs`).
//! Case-insensitive string comparisons appear as a single
//! [`Expr::StringEquals`] node.

pub mod expressions;
pub mod operators;
pub mod tokens;
pub mod types;

pub use expressions::{Expr, SourceRef};
pub use operators::{BinOp, UnaryOp};
pub use tokens::Token;
pub use types::TypeRef;
