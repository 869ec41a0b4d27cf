//! A Datalog query execution engine: the phase executor, relational
//! algebra (hash join, cross product, semi/anti-join), a pattern matcher
//! contract with an in-memory indexed reference implementation, and
//! correlated-subquery execution with an optional decorrelation rewrite
//! path for grouped aggregations.
//!
//! The planner and rewriter that produce a [`plan::Plan`] are out of
//! scope; this crate starts from a `Plan` and a [`matcher::PatternMatcher`]
//! and executes it (see [`executor::run_plan`]).

pub mod config;
pub mod context;
pub mod datom;
pub mod decorrelate;
pub mod error;
pub mod executor;
pub mod expr;
pub mod join;
pub mod matcher;
pub mod plan;
pub mod relation;
pub mod subquery;
pub mod tuple_key;
pub mod value;

pub use config::ExecutorOptions;
pub use context::Context;
pub use error::{QueryError, QueryResult};
pub use executor::run_plan;
pub use matcher::{IndexedMatcher, PatternMatcher};
pub use plan::Plan;
pub use relation::Relation;
