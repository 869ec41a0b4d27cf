//! Streaming relation: a single-pass producer of tuples with optional
//! one-shot caching (§3, §4.2, §5).
//!
//! The "panic on double iteration" rule is implemented with an atomic
//! "started" flag; `materialize()` upgrades the relation to a shared,
//! multi-iterable form backed by a `parking_lot::Mutex` + `Condvar`
//! barrier so concurrent callers block until the first caller finishes
//! building the cache, mirroring the one-shot-guard shape used for lazy
//! index construction in `crate::matcher::indexed`.

use crate::relation::RelationSize;
use crate::value::{Symbol, Tuple};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type TupleIter = Box<dyn Iterator<Item = Tuple> + Send>;

enum CacheState {
    NotBuilding,
    Building,
    Ready(Arc<Vec<Tuple>>),
}

struct Inner {
    source: Mutex<Option<TupleIter>>,
    started: AtomicBool,
    cache_mode: AtomicBool,
    cache: Mutex<CacheState>,
    ready: Condvar,
}

/// Single-pass relation over an unknown-size source. Mark it for caching
/// with `materialize()` *before* the first `iterator()` call if it needs
/// to survive more than one pass.
#[derive(Clone)]
pub struct StreamingRelation {
    columns: Vec<Symbol>,
    inner: Arc<Inner>,
}

impl StreamingRelation {
    pub fn new(columns: Vec<Symbol>, source: impl Iterator<Item = Tuple> + Send + 'static) -> Self {
        StreamingRelation {
            columns,
            inner: Arc::new(Inner {
                source: Mutex::new(Some(Box::new(source))),
                started: AtomicBool::new(false),
                cache_mode: AtomicBool::new(false),
                cache: Mutex::new(CacheState::NotBuilding),
                ready: Condvar::new(),
            }),
        }
    }

    pub fn columns(&self) -> &[Symbol] {
        &self.columns
    }

    /// Marks this relation for caching on first iteration. Idempotent;
    /// must be called before the first `iterator()` call on this relation
    /// (or any of its clones) — calling it after iteration has begun is a
    /// contract violation the same way double-iterating without it is.
    pub fn materialize(&self) {
        if self.inner.cache_mode.swap(true, Ordering::SeqCst) {
            return; // already marked — idempotent
        }
        assert!(
            !self.inner.started.load(Ordering::SeqCst),
            "materialize() called after a streaming relation was already iterated; \
             it must be called before the first iterator() call"
        );
    }

    pub fn is_materializing(&self) -> bool {
        self.inner.cache_mode.load(Ordering::SeqCst)
    }

    /// -1 (reported as `RelationSize::Unknown`) unless caching has
    /// completed, in which case it blocks until the cache is ready.
    pub fn size(&self) -> RelationSize {
        if !self.inner.cache_mode.load(Ordering::SeqCst) {
            return RelationSize::Unknown;
        }
        if !self.inner.started.load(Ordering::SeqCst) {
            // Caching hasn't been triggered by any iteration yet.
            return RelationSize::Unknown;
        }
        let mut guard = self.inner.cache.lock();
        loop {
            match &*guard {
                CacheState::Ready(data) => return RelationSize::Exact(data.len()),
                _ => self.inner.ready.wait(&mut guard),
            }
        }
    }

    /// Produces a fresh single-pass cursor. Under cache mode, the first
    /// caller drains the underlying source into a shared cache and every
    /// caller (including the first) then iterates that cache; concurrent
    /// callers block on the cache barrier rather than racing to drain the
    /// source twice.
    pub fn iterator(&self) -> StreamingCursor {
        if self.inner.cache_mode.load(Ordering::SeqCst) {
            self.inner.started.store(true, Ordering::SeqCst);
            let data = self.build_or_wait_for_cache();
            return StreamingCursor::Cached {
                data,
                position: 0,
            };
        }

        assert!(
            !self.inner.started.swap(true, Ordering::SeqCst),
            "streaming relation iterated twice without a prior materialize() call; \
             this is a programming error, not a user error"
        );
        let source = self
            .inner
            .source
            .lock()
            .take()
            .expect("streaming relation source missing on first iteration");
        StreamingCursor::OneShot { source }
    }

    fn build_or_wait_for_cache(&self) -> Arc<Vec<Tuple>> {
        let mut guard = self.inner.cache.lock();
        loop {
            match &*guard {
                CacheState::Ready(data) => return Arc::clone(data),
                CacheState::Building => {
                    self.inner.ready.wait(&mut guard);
                }
                CacheState::NotBuilding => {
                    *guard = CacheState::Building;
                    drop(guard);
                    let source = self
                        .inner
                        .source
                        .lock()
                        .take()
                        .expect("streaming relation source missing while building cache");
                    let data = Arc::new(source.collect::<Vec<_>>());
                    let mut guard = self.inner.cache.lock();
                    *guard = CacheState::Ready(Arc::clone(&data));
                    self.inner.ready.notify_all();
                    return data;
                }
            }
        }
    }
}

/// Cursor over a `StreamingRelation`. Not thread-safe: each consumer must
/// obtain its own via `StreamingRelation::iterator()`.
pub enum StreamingCursor {
    OneShot {
        source: TupleIter,
    },
    Cached {
        data: Arc<Vec<Tuple>>,
        position: usize,
    },
    /// The current tuple, held separately so `tuple()` can return a
    /// reference without re-deriving it from the iterator state.
    Done,
}

impl StreamingCursor {
    /// Advances and returns the next tuple directly (simpler than the
    /// `next()`/`tuple()` split for a Rust iterator-backed cursor, but the
    /// stateful cursor shape is kept for `Cursor` trait parity across
    /// relation flavors — see `crate::relation::Cursor`).
    pub fn advance(&mut self) -> Option<Tuple> {
        match self {
            StreamingCursor::OneShot { source } => source.next(),
            StreamingCursor::Cached { data, position } => {
                let t = data.get(*position).cloned();
                if t.is_some() {
                    *position += 1;
                }
                t
            }
            StreamingCursor::Done => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn sample(n: i64) -> Vec<Tuple> {
        (0..n).map(|i| Tuple::new(vec![Value::Integer(i)])).collect()
    }

    #[test]
    #[should_panic(expected = "iterated twice")]
    fn double_iteration_without_materialize_panics() {
        let rel = StreamingRelation::new(vec!["x".into()], sample(3).into_iter());
        let mut c1 = rel.iterator();
        while c1.advance().is_some() {}
        let _ = rel.iterator();
    }

    #[test]
    fn materialize_allows_repeat_iteration_with_identical_sequence() {
        let rel = StreamingRelation::new(vec!["x".into()], sample(5).into_iter());
        rel.materialize();

        let mut c1 = rel.iterator();
        let mut v1 = Vec::new();
        while let Some(t) = c1.advance() {
            v1.push(t);
        }

        let mut c2 = rel.iterator();
        let mut v2 = Vec::new();
        while let Some(t) = c2.advance() {
            v2.push(t);
        }

        assert_eq!(v1, v2);
        assert_eq!(v1.len(), 5);
        assert_eq!(rel.size(), RelationSize::Exact(5));
    }

    #[test]
    fn materialize_is_idempotent() {
        let rel = StreamingRelation::new(vec!["x".into()], sample(2).into_iter());
        rel.materialize();
        rel.materialize();
        assert!(rel.is_materializing());
    }
}
