//! Error taxonomy for the query execution engine.
//!
//! Recoverable failures (malformed plans, matcher failures, subquery errors)
//! are `QueryError` variants. Contract violations — reusing a consumed
//! streaming relation, exhausting an iterator out of contract — are
//! programming errors and `panic!`/`assert!` instead, per the error
//! taxonomy's "Programming error" row: these are bugs, not user errors.

use crate::value::Symbol;
use thiserror::Error;

/// Errors raised while matching a fact pattern against storage.
#[derive(Error, Debug)]
pub enum MatchError {
    #[error("pattern references unbound attribute with no index available")]
    NoIndexAvailable,

    #[error("storage error while matching pattern: {0}")]
    Storage(String),

    #[error("type mismatch while evaluating storage constraint: {0}")]
    TypeMismatch(String),
}

/// Errors raised while building or probing a hash join.
#[derive(Error, Debug)]
pub enum JoinError {
    #[error("relation was already consumed by a previous build or probe")]
    RelationAlreadyConsumed,

    #[error("join inputs share no columns and no cross product was requested")]
    NoSharedColumns,
}

/// Errors raised by relation operations (`project`, `filter`, `sort`).
#[derive(Error, Debug)]
pub enum RelationError {
    #[error("column '{0}' not present in relation")]
    MissingColumn(Symbol),

    #[error("duplicate column '{0}' in column list")]
    DuplicateColumn(Symbol),
}

/// Errors raised while executing a non-decorrelated subquery.
#[derive(Error, Debug)]
pub enum SubqueryError {
    #[error("subquery {index} with tuple binding form returned {rows} rows, expected exactly 1")]
    TupleBindingArity { index: usize, rows: usize },

    #[error("subquery {index} failed: {source}")]
    Nested {
        index: usize,
        #[source]
        source: Box<QueryError>,
    },

    #[error("parallel subquery execution cancelled after first error: {0}")]
    Cancelled(String),
}

/// Errors raised by the decorrelation rewrite.
#[derive(Error, Debug)]
pub enum DecorrelationError {
    #[error(
        "refusing to decorrelate a pure aggregation subquery (no non-aggregate :find variable): {0}"
    )]
    PureAggregation(String),

    #[error("merged plan result is missing grouping variable '{0}'")]
    MissingGroupingVar(Symbol),

    #[error("merged plan execution failed: {source}")]
    Nested {
        #[source]
        source: Box<QueryError>,
    },
}

/// Top-level error type returned by the phase executor.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("plan is malformed: {0}")]
    MalformedPlan(String),

    #[error("projection failed in phase {phase}: {source}")]
    Projection {
        phase: usize,
        #[source]
        source: RelationError,
    },

    #[error("pattern match failed in phase {phase}, pattern {pattern_index}: {source}")]
    Matcher {
        phase: usize,
        pattern_index: usize,
        #[source]
        source: MatchError,
    },

    #[error("join failed in phase {phase}: {source}")]
    Join {
        phase: usize,
        #[source]
        source: JoinError,
    },

    #[error("subquery failed in phase {phase}: {source}")]
    Subquery {
        phase: usize,
        #[source]
        source: SubqueryError,
    },

    #[error("decorrelation failed in phase {phase}: {source}")]
    Decorrelation {
        phase: usize,
        #[source]
        source: DecorrelationError,
    },

    #[error(
        "phase {phase} ended with {group_count} disjoint relation groups and no explicit cross product"
    )]
    CartesianResidual { phase: usize, group_count: usize },
}

pub type QueryResult<T> = Result<T, QueryError>;
