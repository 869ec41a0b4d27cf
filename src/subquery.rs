//! Non-decorrelated subquery execution (§4.6).
//!
//! The nested plan runs once per unique combination of the outer
//! relation's correlating columns (deduplicated so a million outer rows
//! sharing one correlation key still cost one nested execution), and the
//! per-combination results are unioned and hash-joined back onto the
//! outer relation. When the planner marks a subquery `batchable`, every
//! unique combination is materialized into a single input relation and
//! the nested plan runs exactly once instead.
//!
//! The per-combination union itself has two strategies (§4.6 step 5, §5):
//! the default collects results into an order-preserving `Vec` (`rayon`'s
//! `par_iter().collect()`, which holds every in-flight result until the
//! whole batch finishes); `use_streaming_subquery_union` instead drains a
//! bounded `crossbeam-channel` as producers fill it, trading result order
//! for bounded memory — a slow consumer applies backpressure to the
//! producing workers instead of letting the whole batch pile up.

use crate::context::Context;
use crate::error::{QueryError, QueryResult, SubqueryError};
use crate::plan::{BindingForm, SubqueryPlan};
use crate::relation::Relation;
use crate::tuple_key::TupleKey;
use crate::value::Tuple;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Runs `sq` against the relation group `outer` (which carries every
/// symbol `sq.inputs` needs) and returns `outer` joined with the
/// subquery's binding columns.
pub fn execute(
    ctx: &Context,
    phase_index: usize,
    sq_index: usize,
    sq: &SubqueryPlan,
    outer: &Relation,
) -> QueryResult<Relation> {
    let event = ctx.collector.begin("subquery/execute");
    ctx.collector.finish(event);

    let outer_mat = outer.force_materialize();
    let input_positions: Vec<usize> = sq
        .inputs
        .iter()
        .map(|s| {
            outer_mat
                .columns()
                .iter()
                .position(|c| c == s)
                .expect("subquery inputs must already be available in the relation group carrying it")
        })
        .collect();

    let combinations = unique_combinations(outer_mat.tuples(), &input_positions);

    let combined_rows: Vec<Tuple> = if sq.batchable && !sq.pure_aggregation {
        run_batched(ctx, phase_index, sq_index, sq, &combinations)?
    } else if combinations.len() > 1 && ctx.options.subqueries.use_streaming_subquery_union {
        run_streaming(ctx, phase_index, sq_index, sq, &combinations)?
    } else if ctx.options.subqueries.enable_parallel_subqueries && combinations.len() > 1 {
        run_parallel(ctx, phase_index, sq_index, sq, &combinations)?
    } else {
        run_sequential(ctx, phase_index, sq_index, sq, &combinations)?
    };

    let mut combined_columns = sq.inputs.clone();
    combined_columns.extend(sq.binding.iter().cloned());
    let combined = Relation::materialized(combined_columns, combined_rows, Arc::clone(&ctx.options));

    if sq.inputs.is_empty() {
        return Ok(crate::join::cross_product(outer, &combined));
    }

    outer.join(&combined).map_err(|source| QueryError::Join { phase: phase_index, source })
}

/// Distinct values of the correlating columns seen in the outer relation,
/// in first-seen order (deterministic, and cheap since most queries have
/// far fewer distinct correlation keys than outer rows).
fn unique_combinations(tuples: &[Tuple], positions: &[usize]) -> Vec<Tuple> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for t in tuples {
        let key = TupleKey::join_key(t, positions);
        if seen.insert(key) {
            out.push(t.project(positions));
        }
    }
    if out.is_empty() && positions.is_empty() {
        // An uncorrelated subquery still runs exactly once.
        out.push(Tuple::new(Vec::new()));
    }
    out
}

fn nested_input_relation(ctx: &Context, sq: &SubqueryPlan, combination: &Tuple) -> Relation {
    Relation::materialized(sq.inputs.clone(), vec![combination.clone()], Arc::clone(&ctx.options))
}

/// Runs the nested plan for one input combination and applies the
/// binding form, returning the `sq.inputs ++ sq.binding` rows it
/// contributes (empty for a combination with no matches).
fn run_one(
    ctx: &Context,
    phase_index: usize,
    sq_index: usize,
    sq: &SubqueryPlan,
    combination: &Tuple,
) -> QueryResult<Vec<Tuple>> {
    let input_relation = nested_input_relation(ctx, sq, combination);
    let result = crate::executor::run_plan(ctx, &sq.nested_plan, vec![input_relation]).map_err(|source| {
        QueryError::Subquery {
            phase: phase_index,
            source: SubqueryError::Nested { index: sq_index, source: Box::new(source) },
        }
    })?;

    let result = result
        .project(&sq.binding)
        .map_err(|source| QueryError::Projection { phase: phase_index, source })?;
    let rows = result.iterator().collect_all();

    if sq.binding_form == BindingForm::Tuple {
        match rows.len() {
            0 => return Ok(Vec::new()),
            1 => {}
            n => {
                return Err(QueryError::Subquery {
                    phase: phase_index,
                    source: SubqueryError::TupleBindingArity { index: sq_index, rows: n },
                })
            }
        }
    }

    Ok(rows
        .into_iter()
        .map(|binding_row| combination.concat(&(0..binding_row.len()).collect::<Vec<_>>(), &binding_row))
        .collect())
}

fn run_sequential(
    ctx: &Context,
    phase_index: usize,
    sq_index: usize,
    sq: &SubqueryPlan,
    combinations: &[Tuple],
) -> QueryResult<Vec<Tuple>> {
    let mut out = Vec::new();
    for combination in combinations {
        out.extend(run_one(ctx, phase_index, sq_index, sq, combination)?);
    }
    Ok(out)
}

/// Runs each combination's nested plan on the rayon worker pool, sized
/// per `resolved_worker_count` (§5, §6). The first error seen cancels the
/// shared context so other in-flight workers stop early, and is the
/// error surfaced to the caller.
fn run_parallel(
    ctx: &Context,
    phase_index: usize,
    sq_index: usize,
    sq: &SubqueryPlan,
    combinations: &[Tuple],
) -> QueryResult<Vec<Tuple>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(ctx.options.resolved_worker_count())
        .build()
        .expect("worker pool construction must not fail under normal resource limits");

    let first_error: std::sync::Mutex<Option<QueryError>> = std::sync::Mutex::new(None);
    let cancelled_locally = AtomicBool::new(false);

    let rows: Vec<Tuple> = pool.install(|| {
        combinations
            .par_iter()
            .filter_map(|combination| {
                if ctx.is_cancelled() || cancelled_locally.load(Ordering::SeqCst) {
                    return None;
                }
                match run_one(ctx, phase_index, sq_index, sq, combination) {
                    Ok(rows) => Some(rows),
                    Err(err) => {
                        cancelled_locally.store(true, Ordering::SeqCst);
                        ctx.cancel();
                        let mut slot = first_error.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                        None
                    }
                }
            })
            .flatten()
            .collect()
    });

    if let Some(err) = first_error.into_inner().unwrap() {
        return Err(err);
    }
    Ok(rows)
}

/// Runs every combination on the worker pool, draining results through a
/// bounded channel as they arrive instead of collecting an intermediate
/// `Vec` per worker (§4.6 step 5, §5 "streaming path"). Order is not
/// preserved; a slow consumer applies backpressure to the channel's
/// producers rather than letting results pile up.
fn run_streaming(
    ctx: &Context,
    phase_index: usize,
    sq_index: usize,
    sq: &SubqueryPlan,
    combinations: &[Tuple],
) -> QueryResult<Vec<Tuple>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(ctx.options.resolved_worker_count())
        .build()
        .expect("worker pool construction must not fail under normal resource limits");

    let channel_capacity = ctx.options.resolved_worker_count().max(1) * 4;
    let (tx, rx) = crossbeam_channel::bounded::<QueryResult<Vec<Tuple>>>(channel_capacity);
    let cancelled_locally = AtomicBool::new(false);
    let collected: Mutex<Vec<Tuple>> = Mutex::new(Vec::new());
    let first_error: Mutex<Option<QueryError>> = Mutex::new(None);

    pool.scope(|scope| {
        scope.spawn(|_| {
            for item in rx.iter() {
                match item {
                    Ok(rows) => collected.lock().extend(rows),
                    Err(err) => {
                        let mut slot = first_error.lock();
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                    }
                }
            }
        });

        for combination in combinations {
            let tx = tx.clone();
            scope.spawn(move |_| {
                if ctx.is_cancelled() || cancelled_locally.load(Ordering::SeqCst) {
                    return;
                }
                let result = run_one(ctx, phase_index, sq_index, sq, combination);
                if result.is_err() {
                    cancelled_locally.store(true, Ordering::SeqCst);
                    ctx.cancel();
                }
                let _ = tx.send(result);
            });
        }
        drop(tx);
    });

    if let Some(err) = first_error.into_inner() {
        return Err(err);
    }
    Ok(collected.into_inner())
}

/// Materializes every unique combination into a single relation and runs
/// the nested plan exactly once (§4.6 "Batched path").
fn run_batched(
    ctx: &Context,
    phase_index: usize,
    sq_index: usize,
    sq: &SubqueryPlan,
    combinations: &[Tuple],
) -> QueryResult<Vec<Tuple>> {
    let input_relation =
        Relation::materialized(sq.inputs.clone(), combinations.to_vec(), Arc::clone(&ctx.options));
    let result = crate::executor::run_plan(ctx, &sq.nested_plan, vec![input_relation]).map_err(|source| {
        QueryError::Subquery {
            phase: phase_index,
            source: SubqueryError::Nested { index: sq_index, source: Box::new(source) },
        }
    })?;

    let mut expected_cols = sq.inputs.clone();
    expected_cols.extend(sq.binding.iter().cloned());
    let result = result
        .project(&expected_cols)
        .map_err(|source| QueryError::Projection { phase: phase_index, source })?;
    Ok(result.iterator().collect_all())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorOptions;
    use crate::context::Context;
    use crate::matcher::IndexedMatcher;
    use crate::plan::{Phase, Plan, QuerySource};
    use crate::value::Value;

    fn ctx() -> Context {
        Context::new(Arc::new(ExecutorOptions::default()), Arc::new(IndexedMatcher::new(Vec::new())))
    }

    fn identity_plan(find: Vec<&str>) -> Arc<Plan> {
        let symbols: Vec<_> = find.into_iter().map(Into::into).collect();
        Arc::new(Plan {
            query: QuerySource {
                find: symbols.clone(),
                inputs: Vec::new(),
                order_by: Vec::new(),
            },
            phases: vec![Phase {
                keep: symbols,
                ..Phase::default()
            }],
        })
    }

    #[test]
    fn relation_binding_extends_every_matching_outer_row() {
        let ctx = ctx();
        let outer = Relation::materialized(
            vec!["p".into()],
            vec![Tuple::new(vec![Value::Integer(1)]), Tuple::new(vec![Value::Integer(2)])],
            Arc::new(ExecutorOptions::default()),
        );

        // A nested plan that simply passes its input relation through
        // (`:in` == `:find`) stands in for "subquery returns the input
        // unchanged", enough to exercise dedup + join-back plumbing.
        let sq = SubqueryPlan {
            nested_plan: identity_plan(vec!["p"]),
            inputs: vec!["p".into()],
            binding: vec!["p".into()],
            binding_form: BindingForm::Relation,
            decorrelated: false,
            batchable: false,
            pure_aggregation: false,
        };

        let result = execute(&ctx, 0, 0, &sq, &outer).unwrap();
        let mut rows = result.iterator().collect_all();
        rows.sort_by_key(|t| match &t.0[0] {
            Value::Integer(i) => *i,
            _ => unreachable!(),
        });
        assert_eq!(
            rows,
            vec![
                Tuple::new(vec![Value::Integer(1)]),
                Tuple::new(vec![Value::Integer(2)]),
            ]
        );
    }

    #[test]
    fn duplicate_correlation_values_dedupe_before_running_the_nested_plan_once() {
        let ctx = ctx();
        let outer = Relation::materialized(
            vec!["p".into()],
            vec![
                Tuple::new(vec![Value::Integer(1)]),
                Tuple::new(vec![Value::Integer(1)]),
            ],
            Arc::new(ExecutorOptions::default()),
        );
        let sq = SubqueryPlan {
            nested_plan: identity_plan(vec!["p"]),
            inputs: vec!["p".into()],
            binding: vec!["p".into()],
            binding_form: BindingForm::Tuple,
            decorrelated: false,
            batchable: false,
            pure_aggregation: false,
        };
        // Same `p` value repeated in the outer relation collapses to one
        // combination (the nested plan sees exactly 1 row, satisfying the
        // tuple-binding arity check), then the join-back fans back out to
        // both outer rows.
        let result = execute(&ctx, 0, 0, &sq, &outer).unwrap();
        assert_eq!(result.iterator().collect_all().len(), 2);
    }

    #[test]
    fn streaming_union_collects_every_combinations_rows_regardless_of_order() {
        let mut opts = ExecutorOptions::default();
        opts.subqueries.use_streaming_subquery_union = true;
        let ctx = Context::new(Arc::new(opts), Arc::new(IndexedMatcher::new(Vec::new())));

        let outer = Relation::materialized(
            vec!["p".into()],
            (1..=8).map(|i| Tuple::new(vec![Value::Integer(i)])).collect(),
            Arc::new(ExecutorOptions::default()),
        );
        let sq = SubqueryPlan {
            nested_plan: identity_plan(vec!["p"]),
            inputs: vec!["p".into()],
            binding: vec!["p".into()],
            binding_form: BindingForm::Relation,
            decorrelated: false,
            batchable: false,
            pure_aggregation: false,
        };

        let result = execute(&ctx, 0, 0, &sq, &outer).unwrap();
        let mut rows: Vec<i64> = result
            .iterator()
            .collect_all()
            .into_iter()
            .map(|t| match t.0[0] {
                Value::Integer(i) => i,
                _ => unreachable!(),
            })
            .collect();
        rows.sort_unstable();
        assert_eq!(rows, (1..=8).collect::<Vec<_>>());
    }
}
