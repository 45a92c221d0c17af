//! # Pipeline Output Model
//!
//! Typed representation of what the translator emits:
//!
//! - **[expr]** - aggregation expressions (`{ $add : ['$A', 1] }`)
//! - **[filter]** - `$match` filters, with negation and simplification
//! - **[stage]** - pipeline stages and their canonical text form
//!
//! Every type renders to a [`Value`](crate::Value) document, so the canonical
//! text (`Display`) and the in-memory engine agree on one structure.

pub mod expr;
pub mod filter;
pub mod stage;

pub use expr::AggExpr;
pub use filter::{FieldOp, Filter};
pub use stage::{Accumulator, ProjectField, SortDirection, Stage, render_pipeline};
