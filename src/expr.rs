//! Expressions, predicates, and aggregates (§4.8).
//!
//! An `Expression` is evaluated per row to produce either a new bound
//! column (binding expression) or a boolean used to filter rows (equality
//! expression, selected by `ExpressionPlan::is_equality`). A `Comparison`
//! is a variadic chained predicate: `(< a b c 100)` holds iff every
//! adjacent pair compares true.

use crate::value::{Symbol, Tuple, Value};
use chrono::{Datelike, Timelike};

/// An operand: either a bound column or a literal constant.
#[derive(Clone, Debug)]
pub enum Operand {
    Column(Symbol),
    Constant(Value),
}

impl Operand {
    fn resolve(&self, columns: &[Symbol], row: &Tuple) -> Option<Value> {
        match self {
            Operand::Constant(v) => Some(v.clone()),
            Operand::Column(sym) => {
                let pos = columns.iter().position(|c| c == sym)?;
                row.get(pos).cloned()
            }
        }
    }
}

/// A scalar function over bound operands, producing the expression's
/// output column (`ExpressionPlan::output`).
#[derive(Clone, Debug)]
pub enum Expression {
    Add(Operand, Operand),
    Sub(Operand, Operand),
    Mul(Operand, Operand),
    Div(Operand, Operand),
    /// Extracts a calendar component from a timestamp operand.
    ExtractTime(TimeUnit, Operand),
    /// Passes a single operand through unchanged, e.g. renaming a column.
    Identity(Operand),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeUnit {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
}

impl Expression {
    /// Evaluates the expression against one row, returning the new value
    /// for `ExpressionPlan::output`. `None` means the row lacks a required
    /// input and is left unchanged by the caller.
    pub fn evaluate(&self, columns: &[Symbol], row: &Tuple) -> Option<Value> {
        match self {
            Expression::Add(a, b) => numeric_op(a, b, columns, row, |x, y| x + y),
            Expression::Sub(a, b) => numeric_op(a, b, columns, row, |x, y| x - y),
            Expression::Mul(a, b) => numeric_op(a, b, columns, row, |x, y| x * y),
            Expression::Div(a, b) => numeric_op(a, b, columns, row, |x, y| x / y),
            Expression::ExtractTime(unit, op) => {
                let v = op.resolve(columns, row)?;
                let Value::Timestamp(t) = v else { return None };
                let extracted = match unit {
                    TimeUnit::Year => t.year() as i64,
                    TimeUnit::Month => t.month() as i64,
                    TimeUnit::Day => t.day() as i64,
                    TimeUnit::Hour => t.hour() as i64,
                    TimeUnit::Minute => t.minute() as i64,
                    TimeUnit::Second => t.second() as i64,
                };
                Some(Value::Integer(extracted))
            }
            Expression::Identity(op) => op.resolve(columns, row),
        }
    }
}

fn numeric_op(
    a: &Operand,
    b: &Operand,
    columns: &[Symbol],
    row: &Tuple,
    f: impl Fn(f64, f64) -> f64,
) -> Option<Value> {
    let x = a.resolve(columns, row)?.as_f64()?;
    let y = b.resolve(columns, row)?.as_f64()?;
    Some(Value::Floating(f(x, y)))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
}

impl CompareOp {
    fn holds(self, a: &Value, b: &Value) -> bool {
        use std::cmp::Ordering;
        let ord = a.cmp(b);
        match self {
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Ge => ord != Ordering::Less,
            CompareOp::Gt => ord == Ordering::Greater,
        }
    }
}

/// A variadic chained comparison over two or more operands: `(< a b c 100)`
/// holds iff each adjacent pair satisfies `op`.
#[derive(Clone, Debug)]
pub struct Comparison {
    pub op: CompareOp,
    pub operands: Vec<Operand>,
}

impl Comparison {
    /// Evaluates the chain against one row. Rows missing a required
    /// operand are treated as not satisfying the predicate (the phase
    /// executor only applies a predicate to groups that already have all
    /// required symbols, per §4.5 step 4).
    pub fn holds(&self, columns: &[Symbol], row: &Tuple) -> bool {
        let values: Option<Vec<Value>> = self
            .operands
            .iter()
            .map(|o| o.resolve(columns, row))
            .collect();
        let Some(values) = values else { return false };
        values.windows(2).all(|w| self.op.holds(&w[0], &w[1]))
    }
}

/// Aggregate functions (§4.8). `min`/`max` ignore nulls (there is no null
/// `Value` variant here, so "null" means "absent column" — handled by the
/// caller skipping missing values before they reach these functions).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl Aggregate {
    /// Reduces a column of values per the definitions in §4.8. `avg`
    /// returns `None` for an empty group (undefined, not zero).
    pub fn reduce(self, values: &[Value]) -> Option<Value> {
        match self {
            Aggregate::Count => Some(Value::Integer(values.len() as i64)),
            Aggregate::Sum => {
                let total: f64 = values.iter().map(|v| v.as_f64().unwrap_or(0.0)).sum();
                Some(Value::Floating(total))
            }
            Aggregate::Avg => {
                let numerics: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
                if numerics.is_empty() {
                    None
                } else {
                    Some(Value::Floating(numerics.iter().sum::<f64>() / numerics.len() as f64))
                }
            }
            Aggregate::Min => values.iter().min().cloned(),
            Aggregate::Max => values.iter().max().cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols() -> Vec<Symbol> {
        vec!["a".into(), "b".into()]
    }

    #[test]
    fn chained_comparison_requires_every_adjacent_pair() {
        let row = Tuple::new(vec![Value::Integer(1), Value::Integer(5)]);
        let cmp = Comparison {
            op: CompareOp::Lt,
            operands: vec![
                Operand::Column("a".into()),
                Operand::Column("b".into()),
                Operand::Constant(Value::Integer(100)),
            ],
        };
        assert!(cmp.holds(&cols(), &row));

        let cmp_fail = Comparison {
            op: CompareOp::Lt,
            operands: vec![
                Operand::Column("b".into()),
                Operand::Column("a".into()),
            ],
        };
        assert!(!cmp_fail.holds(&cols(), &row));
    }

    #[test]
    fn sum_treats_non_numeric_as_zero() {
        let values = vec![Value::Integer(1), Value::string("x"), Value::Integer(2)];
        assert_eq!(Aggregate::Sum.reduce(&values), Some(Value::Floating(3.0)));
    }

    #[test]
    fn avg_is_undefined_for_empty_input() {
        assert_eq!(Aggregate::Avg.reduce(&[]), None);
    }

    #[test]
    fn add_expression_promotes_to_floating() {
        let expr = Expression::Add(Operand::Column("a".into()), Operand::Constant(Value::Integer(1)));
        let row = Tuple::new(vec![Value::Integer(4), Value::Integer(0)]);
        assert_eq!(expr.evaluate(&cols(), &row), Some(Value::Floating(5.0)));
    }
}
