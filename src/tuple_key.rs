//! Hashable keys over a chosen subset of tuple positions, used by the hash
//! tables in joins and dedup (§4.1). Content-addressed: equal tuples at the
//! chosen positions produce equal keys, with the same numeric-promotion
//! rules as `Value::eq` so `Integer(3)` and `Floating(3.0)` key together.

use crate::value::{Tuple, Value};
use std::hash::{Hash, Hasher};

/// A packed, hashable key over selected positions of a tuple. Avoids
/// allocating strings in the hot join path — the values themselves are
/// kept (cheap for the `Value` variants we have: small scalars or
/// `Arc<str>` clones) and hashed/compared directly.
#[derive(Clone, Debug)]
pub struct TupleKey(Vec<Value>);

impl TupleKey {
    /// Key over a chosen index subset — the constructor joins use to build
    /// the probe/build key for a hash join or semi/anti-join.
    pub fn join_key(tuple: &Tuple, positions: &[usize]) -> Self {
        TupleKey(positions.iter().map(|&i| tuple.0[i].clone()).collect())
    }

    /// Key over all positions — used by dedup's "seen" set, which must key
    /// on the full combined tuple.
    pub fn full_key(tuple: &Tuple) -> Self {
        TupleKey(tuple.0.clone())
    }
}

impl PartialEq for TupleKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for TupleKey {}

impl Hash for TupleKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for v in &self.0 {
            v.hash(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_key_ignores_other_positions() {
        let a = Tuple::new(vec![Value::Integer(1), Value::Integer(99)]);
        let b = Tuple::new(vec![Value::Integer(1), Value::Integer(-5)]);
        assert_eq!(TupleKey::join_key(&a, &[0]), TupleKey::join_key(&b, &[0]));
    }

    #[test]
    fn full_key_content_addressed() {
        let a = Tuple::new(vec![Value::Integer(3)]);
        let b = Tuple::new(vec![Value::Floating(3.0)]);
        assert_eq!(TupleKey::full_key(&a), TupleKey::full_key(&b));
    }
}
