//! The phase executor (§4.5): runs a `Plan`'s phases sequentially, carrying
//! the previous phase's result forward as the next phase's initial
//! relation group.

mod expression;

use crate::context::Context;
use crate::decorrelate;
use crate::error::{QueryError, QueryResult};
use crate::plan::{Phase, Plan};
use crate::relation::{Relation, RelationsGroup};
use crate::subquery;
use crate::value::Symbol;
use std::sync::Arc;

/// Executes `plan` against `inputs` (the nested-query `:in` relations, or
/// empty for a top-level query) and returns the relation over the query's
/// `:find` columns, sorted per `:order-by` if present.
pub fn run_plan(ctx: &Context, plan: &Plan, inputs: Vec<Relation>) -> QueryResult<Relation> {
    let mut carried: Option<Relation> = if inputs.is_empty() {
        None
    } else {
        Some(
            RelationsGroup::from_relations(inputs)
                .collapse_to_single()
                .map_err(|source| QueryError::Join { phase: 0, source })?,
        )
    };

    for (phase_index, phase) in plan.phases.iter().enumerate() {
        carried = Some(run_phase(ctx, phase_index, phase, carried)?);
    }

    let result = carried.unwrap_or_else(|| Relation::empty(plan.query.find.clone(), Arc::clone(&ctx.options)));

    let find_cols: Vec<Symbol> = plan
        .query
        .find
        .iter()
        .filter(|s| result.columns().contains(s))
        .cloned()
        .collect();

    let mut projected = result.project(&find_cols).map_err(|source| QueryError::Projection {
        phase: plan.phases.len(),
        source,
    })?;

    if !plan.query.order_by.is_empty() {
        projected = projected.sort(&plan.query.order_by).map_err(|source| QueryError::Projection {
            phase: plan.phases.len(),
            source,
        })?;
    }

    Ok(projected)
}

fn run_phase(ctx: &Context, phase_index: usize, phase: &Phase, carried: Option<Relation>) -> QueryResult<Relation> {
    let event = ctx.collector.begin("phase/begin");
    ctx.collector.finish(event);

    let mut groups: Vec<Relation> = match carried {
        Some(rel) => vec![rel],
        None => Vec::new(),
    };

    for (pattern_index, pattern_plan) in phase.patterns.iter().enumerate() {
        let pattern_vars = pattern_plan.pattern.output_columns();

        // Any carried relation sharing a variable with this pattern is
        // used both as a binding hint and, afterward, as a join input —
        // materialize it so it survives both uses (§4.5 step 2).
        let mut bindings = Vec::new();
        for g in &groups {
            if pattern_vars.iter().any(|v| g.columns().contains(v)) {
                g.materialize();
                bindings.push(g.clone());
            }
        }

        let matched = if pattern_plan.storage_constraints.is_empty() {
            ctx.matcher.match_pattern(&pattern_plan.pattern, &bindings)
        } else {
            ctx.matcher
                .match_with_constraints(&pattern_plan.pattern, &bindings, &pattern_plan.storage_constraints)
        }
        .map_err(|source| QueryError::Matcher { phase: phase_index, pattern_index, source })?;

        groups.push(matched);
        groups = collapse(groups, phase_index)?;
    }

    for expr_plan in &phase.expressions {
        groups = groups.into_iter().map(|g| expression::apply_expression(&g, expr_plan)).collect();
        groups = collapse(groups, phase_index)?;
    }

    for pred_plan in &phase.predicates {
        groups = groups.into_iter().map(|g| expression::apply_predicate(&g, pred_plan)).collect();
    }

    for (sq_index, sq) in phase.subqueries.iter().enumerate() {
        let Some(idx) = group_index_with(&groups, &sq.inputs) else {
            return Err(QueryError::MalformedPlan(format!(
                "phase {phase_index} subquery {sq_index} inputs not available in any relation group"
            )));
        };
        groups[idx] = subquery::execute(ctx, phase_index, sq_index, sq, &groups[idx])?;
    }

    for (group_index, decorrelated) in phase.decorrelated_subqueries.iter().enumerate() {
        let Some(idx) = group_index_with(&groups, &decorrelated.correlation_keys) else {
            return Err(QueryError::MalformedPlan(format!(
                "phase {phase_index} decorrelated subquery group {group_index} correlation keys not available"
            )));
        };
        groups[idx] = decorrelate::execute(ctx, phase_index, group_index, decorrelated, &groups[idx])?;
    }

    groups = collapse(groups, phase_index)?;

    let keep: Vec<Symbol> = phase
        .keep
        .iter()
        .filter(|s| groups.iter().any(|g| g.columns().contains(s)))
        .cloned()
        .collect();

    match groups.len() {
        0 => Ok(Relation::empty(keep, Arc::clone(&ctx.options))),
        1 => {
            let only = groups.into_iter().next().unwrap();
            only.project(&keep).map_err(|source| QueryError::Projection { phase: phase_index, source })
        }
        group_count => Err(QueryError::CartesianResidual { phase: phase_index, group_count }),
    }
}

fn collapse(groups: Vec<Relation>, phase_index: usize) -> QueryResult<Vec<Relation>> {
    RelationsGroup::from_relations(groups)
        .collapse()
        .map_err(|source| QueryError::Join { phase: phase_index, source })
}

fn group_index_with(groups: &[Relation], required: &[Symbol]) -> Option<usize> {
    groups.iter().position(|g| required.iter().all(|s| g.columns().contains(s)))
}
