//! The datom: the unit of stored fact.
//!
//! `(entity, attribute, value, tx)` is immutable once written; joins that
//! land on the same `(entity, attribute)` must reduce to the datom with the
//! largest `tx` (see `crate::join::detect_tx_column` and
//! `crate::join::latest_tx_reduce`).

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Opaque entity identity with a total order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Entity(pub u64);

/// A namespaced symbol naming a datom's attribute, e.g. `:person/name`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attribute(pub Arc<str>);

impl Attribute {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Attribute(name.into())
    }
}

/// Unsigned, monotonically increasing transaction id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tx(pub u64);

/// `(entity, attribute, value, tx)` — globally unique by invariant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Datom {
    pub entity: Entity,
    pub attribute: Attribute,
    pub value: Value,
    pub tx: Tx,
}

impl Datom {
    pub fn new(entity: Entity, attribute: Attribute, value: Value, tx: Tx) -> Self {
        Datom {
            entity,
            attribute,
            value,
            tx,
        }
    }
}
