//! End-to-end tests running `run_plan` over an `IndexedMatcher` fixture,
//! exercising pattern matching, predicate filtering, subqueries, and the
//! decorrelation path together (§8).

use query_engine::config::ExecutorOptions;
use query_engine::context::Context;
use query_engine::datom::{Attribute, Datom, Entity, Tx};
use query_engine::expr::{Aggregate, CompareOp, Comparison, Operand};
use query_engine::matcher::{IndexedMatcher, Pattern, PatternElement};
use query_engine::plan::{
    AggregateBinding, BindingForm, ColumnMapping, DecorrelatedSubqueryPlan, MergedPlan, Phase,
    PatternPlan, Plan, PredicatePlan, QuerySource, SubqueryPlan,
};
use query_engine::run_plan;
use query_engine::value::{Symbol, Value};
use std::sync::Arc;

fn var(name: &str) -> PatternElement {
    PatternElement::Variable(Symbol::from(name))
}

fn konst(v: Value) -> PatternElement {
    PatternElement::Constant(v)
}

fn ctx_with(facts: Vec<Datom>) -> Context {
    Context::new(Arc::new(ExecutorOptions::default()), Arc::new(IndexedMatcher::new(facts)))
}

fn age_pattern() -> PatternPlan {
    PatternPlan {
        pattern: Pattern {
            entity: var("p"),
            attribute: konst(Value::keyword(":person/age")),
            value: var("age"),
            tx: None,
        },
        storage_constraints: Vec::new(),
        metadata: Default::default(),
    }
}

#[test]
fn pattern_match_then_predicate_filters_rows() {
    let facts = vec![
        Datom::new(Entity(1), Attribute::new(":person/age"), Value::Integer(30), Tx(1)),
        Datom::new(Entity(2), Attribute::new(":person/age"), Value::Integer(10), Tx(1)),
    ];
    let ctx = ctx_with(facts);

    let pred_plan = PredicatePlan {
        comparison: Comparison {
            op: CompareOp::Gt,
            operands: vec![Operand::Column("age".into()), Operand::Constant(Value::Integer(20))],
        },
        metadata: Default::default(),
    };
    let plan = Plan {
        query: QuerySource { find: vec!["p".into()], inputs: Vec::new(), order_by: Vec::new() },
        phases: vec![Phase {
            patterns: vec![age_pattern()],
            predicates: vec![pred_plan],
            keep: vec!["p".into(), "age".into()],
            ..Phase::default()
        }],
    };

    let rows = run_plan(&ctx, &plan, Vec::new()).unwrap().iterator().collect_all();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some(&Value::Identity(1)));
}

/// A subquery whose nested plan looks up each outer person's age, bound
/// back with the `Relation` form — exercises the dedup-then-join-back
/// plumbing in `crate::subquery` through the phase executor (§4.6, §8).
#[test]
fn subquery_with_relation_binding_extends_every_outer_row() {
    let facts = vec![
        Datom::new(Entity(1), Attribute::new(":person/age"), Value::Integer(30), Tx(1)),
        Datom::new(Entity(2), Attribute::new(":person/age"), Value::Integer(40), Tx(1)),
    ];
    let ctx = ctx_with(facts);

    let nested_plan = Arc::new(Plan {
        query: QuerySource { find: vec!["age".into()], inputs: vec!["p".into()], order_by: Vec::new() },
        phases: vec![Phase {
            patterns: vec![age_pattern()],
            keep: vec!["p".into(), "age".into()],
            ..Phase::default()
        }],
    });

    let subquery = SubqueryPlan {
        nested_plan,
        inputs: vec!["p".into()],
        binding: vec!["age".into()],
        binding_form: BindingForm::Relation,
        decorrelated: false,
        batchable: false,
        pure_aggregation: false,
    };

    let plan = Plan {
        query: QuerySource { find: vec!["p".into(), "age".into()], inputs: Vec::new(), order_by: vec![("p".into(), true)] },
        phases: vec![
            Phase {
                patterns: vec![PatternPlan {
                    pattern: Pattern { entity: var("p"), attribute: var("any_attr"), value: var("any_val"), tx: None },
                    storage_constraints: Vec::new(),
                    metadata: Default::default(),
                }],
                keep: vec!["p".into()],
                ..Phase::default()
            },
            Phase {
                subqueries: vec![subquery],
                keep: vec!["p".into(), "age".into()],
                ..Phase::default()
            },
        ],
    };

    let rows = run_plan(&ctx, &plan, Vec::new()).unwrap().iterator().collect_all();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get(0), Some(&Value::Identity(1)));
    assert_eq!(rows[0].get(1), Some(&Value::Integer(30)));
    assert_eq!(rows[1].get(0), Some(&Value::Identity(2)));
    assert_eq!(rows[1].get(1), Some(&Value::Integer(40)));
}

/// A grouped aggregation (count of orders per store) executed through the
/// decorrelation path: one merged plan runs once, independent of how many
/// outer rows correlate to it (§4.7, §8 "OHLC column order").
#[test]
fn decorrelated_grouped_aggregation_orders_columns_outer_then_binding() {
    let facts = vec![
        Datom::new(Entity(10), Attribute::new(":order/store"), Value::Identity(1), Tx(1)),
        Datom::new(Entity(11), Attribute::new(":order/store"), Value::Identity(1), Tx(1)),
        Datom::new(Entity(12), Attribute::new(":order/store"), Value::Identity(2), Tx(1)),
    ];
    let ctx = ctx_with(facts);

    let merged_nested = Arc::new(Plan {
        query: QuerySource { find: vec!["store".into(), "order".into()], inputs: Vec::new(), order_by: Vec::new() },
        phases: vec![Phase {
            patterns: vec![PatternPlan {
                pattern: Pattern {
                    entity: var("order"),
                    attribute: konst(Value::keyword(":order/store")),
                    value: var("store"),
                    tx: None,
                },
                storage_constraints: Vec::new(),
                metadata: Default::default(),
            }],
            keep: vec!["store".into(), "order".into()],
            ..Phase::default()
        }],
    });

    let merged_plan = MergedPlan {
        nested_plan: merged_nested,
        grouping_vars: vec!["store".into()],
        aggregates: vec![AggregateBinding { aggregate: Aggregate::Count, input: "order".into(), output: "order_count".into() }],
    };

    let decorrelated = DecorrelatedSubqueryPlan {
        merged_plans: vec![merged_plan],
        correlation_keys: vec!["store".into()],
        column_mapping: vec![ColumnMapping { subquery_index: 0, merged_plan_index: 0, binding_columns: vec!["count".into()] }],
    };

    let plan = Plan {
        query: QuerySource { find: vec!["store".into(), "count".into()], inputs: Vec::new(), order_by: vec![("store".into(), true)] },
        phases: vec![Phase {
            patterns: vec![PatternPlan {
                pattern: Pattern { entity: var("e"), attribute: konst(Value::keyword(":order/store")), value: var("store"), tx: None },
                storage_constraints: Vec::new(),
                metadata: Default::default(),
            }],
            decorrelated_subqueries: vec![decorrelated],
            keep: vec!["store".into(), "count".into()],
            ..Phase::default()
        }],
    };

    // Entities 10 and 11 both carry store = Identity(1), so the outer
    // relation has two rows for store 1 and one for store 2. The join-back
    // is not deduplicated, so store 1's aggregate is joined twice.
    let rows = run_plan(&ctx, &plan, Vec::new()).unwrap().iterator().collect_all();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].get(0), Some(&Value::Identity(1)));
    assert_eq!(rows[0].get(1), Some(&Value::Integer(2)));
    assert_eq!(rows[1].get(0), Some(&Value::Identity(1)));
    assert_eq!(rows[1].get(1), Some(&Value::Integer(2)));
    assert_eq!(rows[2].get(0), Some(&Value::Identity(2)));
    assert_eq!(rows[2].get(1), Some(&Value::Integer(1)));
}

/// A subquery group with no grouping variable (pure aggregation) must
/// never reach the decorrelation path (§4.7 eligibility rule).
#[test]
fn pure_aggregation_is_rejected_by_decorrelate_directly() {
    use query_engine::error::{DecorrelationError, QueryError};

    let ctx = ctx_with(Vec::new());
    let merged_nested = Arc::new(Plan {
        query: QuerySource { find: vec!["total".into()], inputs: Vec::new(), order_by: Vec::new() },
        phases: vec![Phase { keep: vec!["total".into()], ..Phase::default() }],
    });
    let merged_plan = MergedPlan {
        nested_plan: merged_nested,
        grouping_vars: Vec::new(),
        aggregates: vec![AggregateBinding { aggregate: Aggregate::Count, input: "x".into(), output: "total".into() }],
    };
    let decorrelated = DecorrelatedSubqueryPlan {
        merged_plans: vec![merged_plan],
        correlation_keys: Vec::new(),
        column_mapping: Vec::new(),
    };
    let outer = query_engine::Relation::empty(Vec::new(), Arc::new(ExecutorOptions::default()));

    let err = query_engine::decorrelate::execute(&ctx, 0, 0, &decorrelated, &outer).unwrap_err();
    assert!(matches!(
        err,
        QueryError::Decorrelation { source: DecorrelationError::PureAggregation(_), .. }
    ));
}
