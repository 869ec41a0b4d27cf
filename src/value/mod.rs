//! Value model: the tagged variant datom values are drawn from, interned
//! variable symbols, and fixed-width tuples over a column list.
//!
//! Comparison and equality dispatch on the tag, with numeric promotion
//! across integer/floating widths within a type family. Cross-type
//! comparison falls back to a fixed type-tag order so that sorting stays
//! total and stable; this ordering is non-semantic (see `Value::type_rank`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// An interned variable name, distinguishable from a constant by the
/// planner before it ever reaches the core. Cheap to clone: backed by an
/// `Arc<str>` the way repeated column lists across phases share storage.
#[derive(Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Symbol(Arc<str>);

impl Symbol {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Symbol(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "?{}", self.0)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "?{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Symbol::new(s)
    }
}

/// A datom value. Numbers compare numerically across integer and floating
/// widths; timestamps chronologically; strings lexicographically; booleans
/// false < true; identities by their canonical serialized form.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    Integer(i64),
    Floating(f64),
    String(Arc<str>),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    /// Opaque entity identity with a total order over its canonical form.
    Identity(u64),
    /// Namespaced symbol, e.g. `:person/name`.
    Keyword(Arc<str>),
}

impl Value {
    pub fn string(s: impl Into<Arc<str>>) -> Self {
        Value::String(s.into())
    }

    pub fn keyword(s: impl Into<Arc<str>>) -> Self {
        Value::Keyword(s.into())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Floating(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Floating(_))
    }

    /// Fixed rank used only to order otherwise-incomparable types.
    /// Non-semantic: exists purely so `sort` stays total (§4.1 / §9).
    fn type_rank(&self) -> u8 {
        match self {
            Value::Integer(_) | Value::Floating(_) => 0,
            Value::Boolean(_) => 1,
            Value::String(_) => 2,
            Value::Timestamp(_) => 3,
            Value::Identity(_) => 4,
            Value::Keyword(_) => 5,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        use Value::{Boolean, Floating, Identity, Integer, Keyword, String as Str, Timestamp};
        match (self, other) {
            (Integer(a), Integer(b)) => a.cmp(b),
            (Floating(a), Floating(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Integer(a), Floating(b)) => (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal),
            (Floating(a), Integer(b)) => a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal),
            (Str(a), Str(b)) => a.cmp(b),
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            (Identity(a), Identity(b)) => a.cmp(b),
            (Keyword(a), Keyword(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Integer(i) => {
                0u8.hash(state);
                i.hash(state);
            }
            Value::Floating(f) => {
                // Promote to the integer hash when the float is integral so
                // that Value::Integer(3) and Value::Floating(3.0) collide,
                // matching their numeric equality.
                0u8.hash(state);
                if f.fract() == 0.0 {
                    (*f as i64).hash(state);
                } else {
                    1u8.hash(state);
                    f.to_bits().hash(state);
                }
            }
            Value::String(s) => {
                2u8.hash(state);
                s.hash(state);
            }
            Value::Boolean(b) => {
                3u8.hash(state);
                b.hash(state);
            }
            Value::Timestamp(t) => {
                4u8.hash(state);
                t.timestamp_nanos_opt().unwrap_or_default().hash(state);
            }
            Value::Identity(e) => {
                5u8.hash(state);
                e.hash(state);
            }
            Value::Keyword(k) => {
                6u8.hash(state);
                k.hash(state);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(i) => write!(f, "{i}"),
            Value::Floating(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Timestamp(t) => write!(f, "{t}"),
            Value::Identity(e) => write!(f, "#{e}"),
            Value::Keyword(k) => write!(f, "{k}"),
        }
    }
}

/// A fixed-width heterogeneous row, indexed positionally against the
/// owning relation's column list. Value-typed: copy out of a reused
/// backing buffer before retaining it past a single `next()` call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Tuple(pub Vec<Value>);

impl Tuple {
    pub fn new(values: Vec<Value>) -> Self {
        Tuple(values)
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a new tuple containing only the given positions, in order.
    pub fn project(&self, positions: &[usize]) -> Tuple {
        Tuple(positions.iter().map(|&i| self.0[i].clone()).collect())
    }

    /// Concatenates `self` with the positions of `other` that survive the
    /// join-combine rule: left columns followed by right columns with
    /// join-key duplicates already removed from `other_positions`.
    pub fn concat(&self, other_positions: &[usize], other: &Tuple) -> Tuple {
        let mut values = self.0.clone();
        values.extend(other_positions.iter().map(|&i| other.0[i].clone()));
        Tuple(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_promotion_equality() {
        assert_eq!(Value::Integer(3), Value::Floating(3.0));
        assert!(Value::Integer(3) < Value::Floating(3.5));
    }

    #[test]
    fn cross_type_is_total_but_nonsemantic() {
        // Never panics, never returns None — just a deterministic order.
        assert!(Value::Boolean(true).partial_cmp(&Value::string("x")).is_some());
    }

    #[test]
    fn tuple_project_and_concat() {
        let t = Tuple::new(vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]);
        assert_eq!(t.project(&[2, 0]).0, vec![Value::Integer(3), Value::Integer(1)]);

        let left = Tuple::new(vec![Value::Integer(1)]);
        let right = Tuple::new(vec![Value::Integer(1), Value::Integer(9)]);
        assert_eq!(
            left.concat(&[1], &right).0,
            vec![Value::Integer(1), Value::Integer(9)]
        );
    }
}
