//! Planner output consumed by the core (§6 "Planner output"). The planner
//! and rewriter that produce a `Plan` are out of scope; the executor only
//! ever reads these types.

use crate::expr::{Aggregate, Comparison, Expression};
use crate::matcher::{Pattern, StorageConstraint};
use crate::value::Symbol;
use std::collections::HashMap;
use std::sync::Arc;

/// Opaque per-node metadata the planner attaches for rewrites to read back.
/// The executor never interprets these values itself.
pub type Metadata = HashMap<String, String>;

#[derive(Clone, Debug, Default)]
pub struct QuerySource {
    pub find: Vec<Symbol>,
    pub inputs: Vec<Symbol>,
    pub order_by: Vec<(Symbol, bool)>,
}

#[derive(Clone, Debug)]
pub struct Plan {
    pub query: QuerySource,
    pub phases: Vec<Phase>,
}

#[derive(Clone, Debug)]
pub struct PatternPlan {
    pub pattern: Pattern,
    pub storage_constraints: Vec<StorageConstraint>,
    pub metadata: Metadata,
}

#[derive(Clone, Debug)]
pub struct ExpressionPlan {
    pub expression: Expression,
    pub inputs: Vec<Symbol>,
    pub output: Symbol,
    pub is_equality: bool,
    pub metadata: Metadata,
}

#[derive(Clone, Debug)]
pub struct PredicatePlan {
    pub comparison: Comparison,
    pub metadata: Metadata,
}

/// How a nested query's result is applied back to the outer binding (§4.6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BindingForm {
    /// `[[?a ?b]]` — exactly one row, bound positionally.
    Tuple,
    /// `[[?a ?b] ...]` — each row extends the outer binding.
    Relation,
    /// `[?x ...]` — single column, multiple rows.
    Collection,
}

#[derive(Clone, Debug)]
pub struct SubqueryPlan {
    pub nested_plan: Arc<Plan>,
    /// Outer-scope symbols (or constants, carried as pre-bound columns by
    /// the planner) that correlate the nested query to the outer relation.
    pub inputs: Vec<Symbol>,
    pub binding: Vec<Symbol>,
    pub binding_form: BindingForm,
    pub decorrelated: bool,
    /// The nested query's `:in` accepts a relation input shaped like
    /// `inputs`, so every unique input combination can be materialized
    /// into one relation and the nested plan run once (§4.6 "Batched
    /// path"). Planner-supplied: the core never infers this.
    pub batchable: bool,
    /// The nested query's `:find` is an all-aggregate projection with no
    /// grouping variable. Forces per-row execution even when
    /// `batchable` is set (§4.6, §4.7 eligibility rule).
    pub pure_aggregation: bool,
}

/// One aggregate projected by a merged nested plan, with the binding symbol
/// it must end up under in the final schema (§4.7 step 4).
#[derive(Clone, Debug)]
pub struct AggregateBinding {
    pub aggregate: Aggregate,
    pub input: Symbol,
    pub output: Symbol,
}

/// A single nested plan produced by merging subqueries that share a filter
/// body (§4.7 "Merging").
#[derive(Clone, Debug)]
pub struct MergedPlan {
    pub nested_plan: Arc<Plan>,
    pub grouping_vars: Vec<Symbol>,
    pub aggregates: Vec<AggregateBinding>,
}

/// Which merged plan and output columns a given original subquery maps to,
/// after decorrelated execution (§4.7 `ColumnMapping`).
#[derive(Clone, Debug)]
pub struct ColumnMapping {
    pub subquery_index: usize,
    pub merged_plan_index: usize,
    pub binding_columns: Vec<Symbol>,
}

/// A group of subqueries sharing a correlation signature, rewritten into
/// one or more merged nested plans (§3 `DecorrelatedSubqueryPlan`).
#[derive(Clone, Debug)]
pub struct DecorrelatedSubqueryPlan {
    pub merged_plans: Vec<MergedPlan>,
    pub correlation_keys: Vec<Symbol>,
    pub column_mapping: Vec<ColumnMapping>,
}

#[derive(Clone, Debug, Default)]
pub struct Phase {
    pub patterns: Vec<PatternPlan>,
    pub expressions: Vec<ExpressionPlan>,
    pub predicates: Vec<PredicatePlan>,
    pub subqueries: Vec<SubqueryPlan>,
    pub decorrelated_subqueries: Vec<DecorrelatedSubqueryPlan>,
    pub provides: Vec<Symbol>,
    pub keep: Vec<Symbol>,
    pub available: Vec<Symbol>,
    pub metadata: Metadata,
}
