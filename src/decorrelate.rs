//! Correlated-subquery decorrelation (§4.7): a group of grouped-aggregation
//! subqueries sharing a correlation signature, rewritten by the planner
//! into one or more merged plans, is executed here by running each merged
//! plan once (not once per outer row), joining the results together on
//! their grouping variables, and joining that back onto the outer
//! relation.
//!
//! A subquery with no non-aggregate `:find` variable (a pure aggregation)
//! must never reach this path — §4.7's eligibility rule is a hard
//! invariant, not a heuristic, so `MergedPlan::grouping_vars` being empty
//! is treated as a malformed plan rather than silently falling back.

use crate::context::Context;
use crate::error::{DecorrelationError, QueryError, QueryResult};
use crate::matcher::TimeRange;
use crate::plan::{ColumnMapping, DecorrelatedSubqueryPlan, MergedPlan};
use crate::relation::{Relation, RelationsGroup};
use crate::value::{Symbol, Tuple, Value};
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use rayon::prelude::*;
use std::sync::Arc;

/// Below this many distinct correlation-key combinations, pushing time
/// ranges into the matcher costs more (building + comparing ranges) than
/// it saves (§4.7 "time-range pushdown").
const TIME_PUSHDOWN_THRESHOLD: usize = 50;

pub fn execute(
    ctx: &Context,
    phase_index: usize,
    group_index: usize,
    decorrelated: &DecorrelatedSubqueryPlan,
    outer: &Relation,
) -> QueryResult<Relation> {
    let event = ctx.collector.begin("decorrelate/execute");
    ctx.collector.finish(event);

    for merged in &decorrelated.merged_plans {
        if merged.grouping_vars.is_empty() {
            return Err(QueryError::Decorrelation {
                phase: phase_index,
                source: DecorrelationError::PureAggregation(format!(
                    "decorrelated group {group_index} has a merged plan with no grouping variable"
                )),
            });
        }
    }

    let local_ctx = with_time_range_pushdown(ctx, outer, &decorrelated.correlation_keys);

    let merged_results = run_merged_plans(&local_ctx, phase_index, &decorrelated.merged_plans)?;

    let aggregates = join_on_grouping_vars(phase_index, merged_results)?;

    let renamed = rename_columns(&aggregates, &decorrelated.merged_plans[0].grouping_vars, &decorrelated.correlation_keys);

    let joined = outer.join(&renamed).map_err(|source| QueryError::Join { phase: phase_index, source })?;

    apply_column_mapping(phase_index, outer, &joined, &decorrelated.merged_plans, &decorrelated.column_mapping)
}

fn run_merged_plans(ctx: &Context, phase_index: usize, merged_plans: &[MergedPlan]) -> QueryResult<Vec<Relation>> {
    let run_one = |merged: &MergedPlan| -> QueryResult<Relation> {
        let raw = crate::executor::run_plan(ctx, &merged.nested_plan, Vec::new()).map_err(|source| QueryError::Decorrelation {
            phase: phase_index,
            source: DecorrelationError::Nested { source: Box::new(source) },
        })?;
        Ok(aggregate_by_grouping_vars(merged, &raw))
    };

    if ctx.options.decorrelation.enable_parallel_decorrelation && merged_plans.len() > 1 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(ctx.options.resolved_worker_count())
            .build()
            .expect("worker pool construction must not fail under normal resource limits");
        pool.install(|| merged_plans.par_iter().map(run_one).collect())
    } else {
        merged_plans.iter().map(run_one).collect()
    }
}

/// Groups the merged plan's raw result rows by `merged.grouping_vars` and
/// reduces each `AggregateBinding`'s input column within each group,
/// producing a relation with columns `grouping_vars ++ aggregate outputs`.
/// The merged plan's `:find` is expected to carry the grouping variables
/// and every aggregate's input column at row granularity (§4.7); the
/// reduction itself happens here, not in the nested plan.
fn aggregate_by_grouping_vars(merged: &MergedPlan, raw: &Relation) -> Relation {
    let mat = raw.force_materialize();
    let cols = mat.columns();
    let group_positions: Vec<usize> = merged
        .grouping_vars
        .iter()
        .map(|g| cols.iter().position(|c| c == g).expect("merged plan result must carry every grouping variable"))
        .collect();
    let agg_positions: Vec<usize> = merged
        .aggregates
        .iter()
        .map(|a| cols.iter().position(|c| c == &a.input).expect("merged plan result must carry every aggregate input column"))
        .collect();

    let mut groups: std::collections::HashMap<crate::tuple_key::TupleKey, (Tuple, Vec<Vec<Value>>)> =
        std::collections::HashMap::new();
    for row in mat.tuples() {
        let key = crate::tuple_key::TupleKey::join_key(row, &group_positions);
        let entry = groups
            .entry(key)
            .or_insert_with(|| (row.project(&group_positions), vec![Vec::new(); merged.aggregates.len()]));
        for (slot, pos) in entry.1.iter_mut().zip(agg_positions.iter()) {
            slot.push(row.get(*pos).expect("aggregate input position is within row bounds").clone());
        }
    }

    let mut out_cols = merged.grouping_vars.clone();
    out_cols.extend(merged.aggregates.iter().map(|a| a.output.clone()));
    let out_tuples: Vec<Tuple> = groups
        .into_values()
        .map(|(key, value_lists)| {
            let mut values = key.0;
            for (agg, vals) in merged.aggregates.iter().zip(value_lists.iter()) {
                values.push(agg.aggregate.reduce(vals).expect("non-empty group always reduces to a value"));
            }
            Tuple::new(values)
        })
        .collect();
    Relation::materialized(out_cols, out_tuples, Arc::clone(raw.options()))
}

/// Joins every merged plan's result on the shared grouping variables. In
/// the common case of a single merged plan this is a no-op; with several
/// merged plans (distinct aggregate bodies sharing one correlation
/// signature) each contributes disjoint aggregate-output columns that all
/// key on the same grouping variables.
fn join_on_grouping_vars(phase_index: usize, mut results: Vec<Relation>) -> QueryResult<Relation> {
    let mut iter = results.drain(..);
    let mut acc = iter.next().expect("a decorrelated subquery group always has at least one merged plan");
    for next in iter {
        acc = acc.join(&next).map_err(|source| QueryError::Join { phase: phase_index, source })?;
    }
    Ok(acc)
}

/// Builds a new relation identical to `rel` except that each column in
/// `from` is renamed to the symbol at the same position in `to`.
fn rename_columns(rel: &Relation, from: &[Symbol], to: &[Symbol]) -> Relation {
    let new_cols: Vec<Symbol> = rel
        .columns()
        .iter()
        .map(|c| match from.iter().position(|f| f == c) {
            Some(pos) => to[pos].clone(),
            None => c.clone(),
        })
        .collect();
    let mat = rel.force_materialize();
    Relation::materialized(new_cols, mat.tuples().to_vec(), Arc::clone(rel.options()))
}

/// Reorders/renames the joined outer+aggregates relation to
/// `outer.columns() ++ binding columns in subquery_index order` (§4.7
/// step 4), using each mapping's `binding_columns` to rename that merged
/// plan's aggregate-output columns positionally.
fn apply_column_mapping(
    phase_index: usize,
    outer: &Relation,
    joined: &Relation,
    merged_plans: &[MergedPlan],
    column_mapping: &[ColumnMapping],
) -> QueryResult<Relation> {
    let mut ordered_mapping: Vec<&ColumnMapping> = column_mapping.iter().collect();
    ordered_mapping.sort_by_key(|m| m.subquery_index);

    let mut renames: Vec<(Symbol, Symbol)> = Vec::new();
    let mut final_cols: Vec<Symbol> = outer.columns().to_vec();

    for mapping in &ordered_mapping {
        let merged = &merged_plans[mapping.merged_plan_index];
        let agg_outputs: Vec<Symbol> = merged.aggregates.iter().map(|a| a.output.clone()).collect();
        for (bind_name, agg_col) in mapping.binding_columns.iter().zip(agg_outputs.iter()) {
            renames.push((agg_col.clone(), bind_name.clone()));
            final_cols.push(bind_name.clone());
        }
    }

    let renamed = rename_columns(joined, &renames.iter().map(|(f, _)| f.clone()).collect::<Vec<_>>(), &renames.iter().map(|(_, t)| t.clone()).collect::<Vec<_>>());

    renamed
        .project(&final_cols)
        .map_err(|source| QueryError::Projection { phase: phase_index, source })
}

/// Recognizable correlation-key component names, the donor's documented
/// heuristic for when a correlation key is a calendar component (§4.7,
/// matching the `looks_like_tx_column` heuristic in `crate::join`).
fn time_component(name: &str) -> Option<TimeComponent> {
    match name {
        "year" | "y" => Some(TimeComponent::Year),
        "month" | "m" => Some(TimeComponent::Month),
        "day" | "d" => Some(TimeComponent::Day),
        "hour" | "h" => Some(TimeComponent::Hour),
        _ => None,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TimeComponent {
    Year,
    Month,
    Day,
    Hour,
}

/// If `correlation_keys` includes recognizable calendar components and
/// the outer relation has enough distinct combinations to be worth it,
/// builds a `[start, end)` range per unique combination and pushes them
/// into the matcher for the rest of this decorrelated group's execution.
/// Otherwise returns `ctx` unchanged.
fn with_time_range_pushdown(ctx: &Context, outer: &Relation, correlation_keys: &[Symbol]) -> Context {
    let components: Vec<(usize, TimeComponent)> = correlation_keys
        .iter()
        .enumerate()
        .filter_map(|(i, s)| time_component(s.as_str()).map(|c| (i, c)))
        .collect();
    if components.is_empty() {
        return ctx.clone();
    }

    let outer_mat = outer.force_materialize();
    let positions: Vec<usize> = correlation_keys
        .iter()
        .filter_map(|k| outer_mat.columns().iter().position(|c| c == k))
        .collect();
    if positions.len() != correlation_keys.len() {
        return ctx.clone();
    }

    let mut combos: Vec<Tuple> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for t in outer_mat.tuples() {
        let key = crate::tuple_key::TupleKey::join_key(t, &positions);
        if seen.insert(key) {
            combos.push(t.project(&positions));
        }
    }
    if combos.len() < TIME_PUSHDOWN_THRESHOLD {
        return ctx.clone();
    }

    let ranges: Vec<TimeRange> = combos
        .iter()
        .filter_map(|combo| build_time_range(&components, combo))
        .collect();
    if ranges.is_empty() {
        return ctx.clone();
    }

    let mut local = ctx.clone();
    local.matcher = Arc::clone(&ctx.matcher).with_time_ranges(ranges);
    local
}

fn build_time_range(components: &[(usize, TimeComponent)], combo: &Tuple) -> Option<TimeRange> {
    let mut year = None;
    let mut month = 1u32;
    let mut day = 1u32;
    let mut hour = 0u32;
    let mut finest = TimeComponent::Year;

    for (pos, component) in components {
        let Value::Integer(v) = combo.get(*pos)? else { return None };
        match component {
            TimeComponent::Year => year = Some(*v),
            TimeComponent::Month => month = *v as u32,
            TimeComponent::Day => day = *v as u32,
            TimeComponent::Hour => hour = *v as u32,
        }
        finest = *component;
    }
    let year = year? as i32;
    let start = Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).single()?;
    let end = match finest {
        TimeComponent::Year => Utc
            .with_ymd_and_hms(year + 1, 1, 1, 0, 0, 0)
            .single()?,
        TimeComponent::Month => add_month(start),
        TimeComponent::Day => start + Duration::days(1),
        TimeComponent::Hour => start + Duration::hours(1),
    };
    Some(TimeRange { start, end })
}

fn add_month(t: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if t.month() == 12 { (t.year() + 1, 1) } else { (t.year(), t.month() + 1) };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single().unwrap_or(t)
}
