//! Per-group expression and predicate application (§4.5 steps 3-4).

use crate::plan::{ExpressionPlan, PredicatePlan};
use crate::relation::Relation;
use crate::value::Tuple;
use std::sync::Arc;

/// Evaluates `expr_plan` against every row of `group`. Groups missing a
/// required input symbol pass through unchanged. A binding expression
/// adds `output` as a new column; an equality expression filters rows by
/// comparing the computed value against an already-bound `output` column
/// (falling back to binding if `output` isn't bound yet).
pub fn apply_expression(group: &Relation, expr_plan: &ExpressionPlan) -> Relation {
    let cols = group.columns();
    if !expr_plan.inputs.iter().all(|s| cols.contains(s)) {
        return group.clone();
    }

    let mat = group.force_materialize();
    let columns = mat.columns().to_vec();
    let output_pos = columns.iter().position(|c| c == &expr_plan.output);

    if expr_plan.is_equality {
        if let Some(pos) = output_pos {
            let tuples: Vec<Tuple> = mat
                .tuples()
                .iter()
                .filter(|t| {
                    expr_plan
                        .expression
                        .evaluate(&columns, t)
                        .is_some_and(|v| t.get(pos) == Some(&v))
                })
                .cloned()
                .collect();
            return Relation::materialized(columns, tuples, Arc::clone(group.options()));
        }
    }

    let mut new_columns = columns.clone();
    new_columns.push(expr_plan.output.clone());
    let tuples: Vec<Tuple> = mat
        .tuples()
        .iter()
        .filter_map(|t| {
            let value = expr_plan.expression.evaluate(&columns, t)?;
            let mut values = t.0.clone();
            values.push(value);
            Some(Tuple::new(values))
        })
        .collect();
    Relation::materialized(new_columns, tuples, Arc::clone(group.options()))
}

/// Filters `group` by `pred_plan`. Groups missing a required input symbol
/// pass through unchanged (§4.5 step 4).
pub fn apply_predicate(group: &Relation, pred_plan: &PredicatePlan) -> Relation {
    let cols = group.columns();
    let required_bound = pred_plan.comparison.operands.iter().all(|op| match op {
        crate::expr::Operand::Column(sym) => cols.contains(sym),
        crate::expr::Operand::Constant(_) => true,
    });
    if !required_bound {
        return group.clone();
    }

    let mat = group.force_materialize();
    let columns = mat.columns().to_vec();
    let tuples: Vec<Tuple> = mat
        .tuples()
        .iter()
        .filter(|t| pred_plan.comparison.holds(&columns, t))
        .cloned()
        .collect();
    Relation::materialized(columns, tuples, Arc::clone(group.options()))
}
