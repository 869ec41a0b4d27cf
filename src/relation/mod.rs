//! The relation layer (§3, §4.2): an ordered sequence of tuples over a
//! named column list, in materialized or streaming flavor, plus the
//! relations-group `collapse` operation phases use to join everything
//! that shares a column.

pub mod group;
pub mod materialized;
pub mod streaming;

pub use group::RelationsGroup;
pub use materialized::{MaterializedCursor, MaterializedRelation};
pub use streaming::{StreamingCursor, StreamingRelation};

use crate::config::ExecutorOptions;
use crate::error::RelationError;
use crate::value::{Symbol, Tuple};
use std::sync::Arc;

/// Predicate used by `Relation::filter`. Boxed because predicates are
/// built dynamically from plan expressions/comparisons (§4.8).
pub type Predicate = Arc<dyn Fn(&Tuple) -> bool + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelationSize {
    Exact(usize),
    Unknown,
}

/// A relation in either flavor, carrying the options record that
/// propagates to every relation derived from it (§4.2 `options`).
#[derive(Clone)]
pub struct Relation {
    inner: RelationInner,
    options: Arc<ExecutorOptions>,
}

#[derive(Clone)]
enum RelationInner {
    Materialized(MaterializedRelation),
    Streaming(StreamingRelation),
}

/// Cursor over either relation flavor. `next()`/`tuple()` map onto a
/// single `advance()` call since Rust's ownership model makes handing
/// back an owned `Tuple` per step both safe and idiomatic (no reused
/// backing buffer survives past the call, so there is nothing to copy
/// defensively beyond what `advance()` already does).
pub enum Cursor {
    Materialized(MaterializedCursor),
    Streaming(StreamingCursor),
}

impl Cursor {
    pub fn next(&mut self) -> Option<Tuple> {
        match self {
            Cursor::Materialized(c) => c.advance(),
            Cursor::Streaming(c) => c.advance(),
        }
    }

    /// Drains the cursor into a `Vec`, consuming it.
    pub fn collect_all(mut self) -> Vec<Tuple> {
        let mut out = Vec::new();
        while let Some(t) = self.next() {
            out.push(t);
        }
        out
    }
}

impl Relation {
    pub fn materialized(columns: Vec<Symbol>, tuples: Vec<Tuple>, options: Arc<ExecutorOptions>) -> Self {
        Relation {
            inner: RelationInner::Materialized(MaterializedRelation::new(columns, tuples)),
            options,
        }
    }

    pub fn empty(columns: Vec<Symbol>, options: Arc<ExecutorOptions>) -> Self {
        Relation::materialized(columns, Vec::new(), options)
    }

    pub fn streaming(
        columns: Vec<Symbol>,
        source: impl Iterator<Item = Tuple> + Send + 'static,
        options: Arc<ExecutorOptions>,
    ) -> Self {
        Relation {
            inner: RelationInner::Streaming(StreamingRelation::new(columns, source)),
            options,
        }
    }

    pub fn from_materialized(rel: MaterializedRelation, options: Arc<ExecutorOptions>) -> Self {
        Relation {
            inner: RelationInner::Materialized(rel),
            options,
        }
    }

    pub fn options(&self) -> &Arc<ExecutorOptions> {
        &self.options
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.inner, RelationInner::Streaming(_))
    }

    pub fn columns(&self) -> &[Symbol] {
        match &self.inner {
            RelationInner::Materialized(r) => r.columns(),
            RelationInner::Streaming(r) => r.columns(),
        }
    }

    pub fn size(&self) -> RelationSize {
        match &self.inner {
            RelationInner::Materialized(r) => RelationSize::Exact(r.len()),
            RelationInner::Streaming(r) => r.size(),
        }
    }

    pub fn iterator(&self) -> Cursor {
        match &self.inner {
            RelationInner::Materialized(r) => Cursor::Materialized(r.iterator()),
            RelationInner::Streaming(r) => Cursor::Streaming(r.iterator()),
        }
    }

    /// Marks a streaming relation for caching before its first
    /// iteration. A no-op on materialized relations (already re-iterable).
    pub fn materialize(&self) {
        if let RelationInner::Streaming(r) = &self.inner {
            r.materialize();
        }
    }

    /// Drains the relation (if streaming, building its cache first so the
    /// handle stays re-iterable) and returns it as a `MaterializedRelation`.
    pub fn force_materialize(&self) -> MaterializedRelation {
        match &self.inner {
            RelationInner::Materialized(r) => r.clone(),
            RelationInner::Streaming(r) => {
                r.materialize();
                let tuples = r.iterator().advance_all();
                MaterializedRelation::new(r.columns().to_vec(), tuples)
            }
        }
    }

    /// Returns a new relation with `cols` in the given order. Fails if any
    /// column is missing.
    pub fn project(&self, cols: &[Symbol]) -> Result<Relation, RelationError> {
        let src_cols = self.columns();
        let mut positions = Vec::with_capacity(cols.len());
        for c in cols {
            let pos = src_cols
                .iter()
                .position(|s| s == c)
                .ok_or_else(|| RelationError::MissingColumn(c.clone()))?;
            positions.push(pos);
        }
        let new_cols = cols.to_vec();
        match &self.inner {
            RelationInner::Materialized(r) => {
                let tuples = r.tuples().iter().map(|t| t.project(&positions)).collect();
                Ok(Relation::materialized(new_cols, tuples, Arc::clone(&self.options)))
            }
            RelationInner::Streaming(r) => {
                let cursor_source = r.clone();
                let iter = StreamingProjectIter {
                    cursor: cursor_source.iterator(),
                    positions,
                };
                Ok(Relation::streaming(new_cols, iter, Arc::clone(&self.options)))
            }
        }
    }

    /// Returns a relation of rows where `predicate` is true.
    pub fn filter(&self, predicate: Predicate) -> Relation {
        match &self.inner {
            RelationInner::Materialized(r) => {
                let tuples = r
                    .tuples()
                    .iter()
                    .filter(|t| predicate(t))
                    .cloned()
                    .collect();
                Relation::materialized(r.columns().to_vec(), tuples, Arc::clone(&self.options))
            }
            RelationInner::Streaming(r) => {
                let cols = r.columns().to_vec();
                let source = r.clone();
                let iter = source
                    .iterator_into_std_iter()
                    .filter(move |t| predicate(t));
                Relation::streaming(cols, iter, Arc::clone(&self.options))
            }
        }
    }

    /// Hash join on the intersection of column sets (§4.4), dispatched to
    /// `crate::join`.
    pub fn join(&self, other: &Relation) -> Result<Relation, crate::error::JoinError> {
        crate::join::hash_join(self, other)
    }

    /// Materialized, multi-key, per-key ascending/descending sort.
    pub fn sort(&self, order_by: &[(Symbol, bool)]) -> Result<Relation, RelationError> {
        let mat = self.force_materialize();
        let cols = mat.columns().to_vec();
        let mut positions = Vec::with_capacity(order_by.len());
        for (sym, ascending) in order_by {
            let pos = cols
                .iter()
                .position(|s| s == sym)
                .ok_or_else(|| RelationError::MissingColumn(sym.clone()))?;
            positions.push((pos, *ascending));
        }
        let mut tuples = mat.tuples().to_vec();
        tuples.sort_by(|a, b| {
            for (pos, ascending) in &positions {
                let ord = a.0[*pos].cmp(&b.0[*pos]);
                if ord != std::cmp::Ordering::Equal {
                    return if *ascending { ord } else { ord.reverse() };
                }
            }
            std::cmp::Ordering::Equal
        });
        Ok(Relation::materialized(cols, tuples, Arc::clone(&self.options)))
    }
}

impl StreamingRelation {
    fn iterator_into_std_iter(&self) -> impl Iterator<Item = Tuple> {
        let mut cursor = self.iterator();
        std::iter::from_fn(move || cursor.advance())
    }
}

impl StreamingCursor {
    fn advance_all(mut self) -> Vec<Tuple> {
        let mut out = Vec::new();
        while let Some(t) = self.advance() {
            out.push(t);
        }
        out
    }
}

struct StreamingProjectIter {
    cursor: StreamingCursor,
    positions: Vec<usize>,
}

impl Iterator for StreamingProjectIter {
    type Item = Tuple;
    fn next(&mut self) -> Option<Tuple> {
        self.cursor.advance().map(|t| t.project(&self.positions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn opts() -> Arc<ExecutorOptions> {
        Arc::new(ExecutorOptions::default())
    }

    #[test]
    fn project_reorders_and_validates_columns() {
        let rel = Relation::materialized(
            vec!["a".into(), "b".into()],
            vec![Tuple::new(vec![Value::Integer(1), Value::Integer(2)])],
            opts(),
        );
        let projected = rel.project(&["b".into(), "a".into()]).unwrap();
        assert_eq!(
            projected.iterator().collect_all(),
            vec![Tuple::new(vec![Value::Integer(2), Value::Integer(1)])]
        );

        assert!(rel.project(&["missing".into()]).is_err());
    }

    #[test]
    fn materialize_size_matches_iterate_and_count() {
        let rel = Relation::streaming(
            vec!["x".into()],
            (0..10).map(|i| Tuple::new(vec![Value::Integer(i)])),
            opts(),
        );
        rel.materialize();
        let count = rel.iterator().collect_all().len();
        assert_eq!(rel.size(), RelationSize::Exact(count));
        assert_eq!(count, 10);
    }
}
