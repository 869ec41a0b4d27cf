//! Pattern matcher contract (§4.3, §6 "Pattern matcher"). The fact storage
//! layer behind this trait is an external collaborator; `IndexedMatcher` is
//! the in-memory reference implementation the executor exercises in tests.

pub mod indexed;

pub use indexed::IndexedMatcher;

use crate::context::AnnotationCollector;
use crate::error::MatchError;
use crate::relation::Relation;
use crate::value::{Symbol, Value};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// One position of a 3- or 4-element fact pattern.
#[derive(Clone, Debug, PartialEq)]
pub enum PatternElement {
    Variable(Symbol),
    Blank,
    Constant(Value),
}

impl PatternElement {
    pub fn is_bound(&self) -> bool {
        matches!(self, PatternElement::Constant(_))
    }

    pub fn as_variable(&self) -> Option<&Symbol> {
        match self {
            PatternElement::Variable(s) => Some(s),
            _ => None,
        }
    }
}

/// A fact pattern: entity/attribute/value, with an optional tx position.
#[derive(Clone, Debug)]
pub struct Pattern {
    pub entity: PatternElement,
    pub attribute: PatternElement,
    pub value: PatternElement,
    pub tx: Option<PatternElement>,
}

impl Pattern {
    /// Output columns this pattern contributes: one per variable position,
    /// in entity/attribute/value/tx order, duplicates removed (a variable
    /// repeated across positions, e.g. `?x ?x`, contributes once).
    pub fn output_columns(&self) -> Vec<Symbol> {
        let mut out = Vec::new();
        for elem in [&self.entity, &self.attribute, &self.value]
            .into_iter()
            .chain(self.tx.as_ref())
        {
            if let PatternElement::Variable(sym) = elem {
                if !out.contains(sym) {
                    out.push(sym.clone());
                }
            }
        }
        out
    }
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

/// One of the three storage-constraint kinds (§4.3), evaluated during
/// candidate filtering before pattern matching.
#[derive(Clone, Debug)]
pub enum StorageConstraint {
    Equality {
        position: usize,
        value: Value,
    },
    Range {
        position: usize,
        min: Option<Value>,
        min_inclusive: bool,
        max: Option<Value>,
        max_inclusive: bool,
    },
    TimeExtraction {
        position: usize,
        unit: TimeUnit,
        expected: i64,
    },
}

impl StorageConstraint {
    pub fn holds(&self, value: &Value) -> Result<bool, MatchError> {
        match self {
            StorageConstraint::Equality { value: expected, .. } => Ok(value == expected),
            StorageConstraint::Range {
                min,
                min_inclusive,
                max,
                max_inclusive,
                ..
            } => {
                if let Some(min) = min {
                    let ok = if *min_inclusive { value >= min } else { value > min };
                    if !ok {
                        return Ok(false);
                    }
                }
                if let Some(max) = max {
                    let ok = if *max_inclusive { value <= max } else { value < max };
                    if !ok {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            StorageConstraint::TimeExtraction { unit, expected, .. } => {
                let Value::Timestamp(t) = value else {
                    return Err(MatchError::TypeMismatch(
                        "time-extraction constraint applied to a non-timestamp value".into(),
                    ));
                };
                Ok(extract(*unit, t) == *expected)
            }
        }
    }
}

fn extract(unit: TimeUnit, t: &DateTime<Utc>) -> i64 {
    use chrono::{Datelike, Timelike};
    match unit {
        TimeUnit::Year => t.year() as i64,
        TimeUnit::Month => t.month() as i64,
        TimeUnit::Day => t.day() as i64,
        TimeUnit::Hour => t.hour() as i64,
        TimeUnit::Minute => t.minute() as i64,
        TimeUnit::Second => t.second() as i64,
    }
}

/// A half-open `[start, end)` wall-clock range, used by the optional
/// time-range pushdown (§4.7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// The external interface the core consumes (§6). The fact storage engine
/// behind it is out of scope; `IndexedMatcher` is the in-memory reference
/// implementation used throughout this crate's tests.
pub trait PatternMatcher: Send + Sync + 'static {
    fn match_pattern(&self, pattern: &Pattern, bindings: &[Relation]) -> Result<Relation, MatchError>;

    fn match_with_constraints(
        &self,
        pattern: &Pattern,
        bindings: &[Relation],
        _constraints: &[StorageConstraint],
    ) -> Result<Relation, MatchError> {
        // Default: ignore pushdown. Matchers that can push constraints
        // into the scan override this.
        self.match_pattern(pattern, bindings)
    }

    /// Optional: restrict subsequent matches to the given time ranges
    /// (§4.7 time-range pushdown). Matchers without time awareness ignore
    /// this and return themselves unchanged.
    fn with_time_ranges(self: Arc<Self>, _ranges: Vec<TimeRange>) -> Arc<dyn PatternMatcher> {
        self
    }

    /// Optional: attach an annotation collector for per-match events.
    fn with_collector(self: Arc<Self>, _collector: Arc<AnnotationCollector>) -> Arc<dyn PatternMatcher> {
        self
    }
}
