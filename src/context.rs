//! Execution context: the options/matcher/collector bundle threaded
//! through phase, subquery, and decorrelation execution (§5, §6, §9).
//!
//! Each worker in a parallel dispatch owns its own `Context` (cheap: every
//! field is an `Arc`), but the annotation collector and cancellation flag
//! are the same underlying instance, so events and cancellation are
//! visible across the whole query regardless of which worker produced
//! them.

use crate::config::ExecutorOptions;
use crate::matcher::PatternMatcher;
use crate::value::Symbol;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One field of an annotation event's metrics map.
#[derive(Clone, Debug)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Text(String),
    Symbols(Vec<Symbol>),
}

/// A single hierarchical event (`phase/begin`, `join/hash`, ...), per §6.
#[derive(Clone, Debug)]
pub struct AnnotationEvent {
    pub name: &'static str,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub latency_micros: Option<i64>,
    pub metrics: HashMap<String, MetricValue>,
}

/// Receives annotation events as they complete. Implementations must not
/// block the hot path significantly (§6 "Delivery is best-effort").
pub trait AnnotationHandler: Send + Sync {
    fn on_event(&self, event: &AnnotationEvent);
}

/// A handler that forwards events to `tracing` at debug level, matching
/// the donor's `tracing::debug!(field = value, ..., "event_name")` style.
pub struct TracingHandler;

impl AnnotationHandler for TracingHandler {
    fn on_event(&self, event: &AnnotationEvent) {
        tracing::debug!(
            event = event.name,
            latency_micros = event.latency_micros.unwrap_or_default(),
            metric_count = event.metrics.len(),
            "query_annotation"
        );
    }
}

/// An in-flight event returned by `AnnotationCollector::begin`, completed
/// with `finish`.
pub struct EventHandle {
    name: &'static str,
    start: DateTime<Utc>,
    metrics: HashMap<String, MetricValue>,
}

impl EventHandle {
    pub fn set(&mut self, key: impl Into<String>, value: MetricValue) {
        self.metrics.insert(key.into(), value);
    }
}

/// Collects annotation events behind a mutex and forwards completed ones
/// to an optional handler (§5 "protects its event log with a mutex and
/// pre-allocates a data-map pool").
pub struct AnnotationCollector {
    events: Mutex<Vec<AnnotationEvent>>,
    pool: Mutex<Vec<HashMap<String, MetricValue>>>,
    handler: Option<Arc<dyn AnnotationHandler>>,
    enabled: bool,
}

const METRIC_MAP_POOL_SIZE: usize = 32;

impl AnnotationCollector {
    pub fn new(handler: Option<Arc<dyn AnnotationHandler>>, enabled: bool) -> Self {
        let pool = (0..METRIC_MAP_POOL_SIZE).map(|_| HashMap::new()).collect();
        AnnotationCollector {
            events: Mutex::new(Vec::new()),
            pool: Mutex::new(pool),
            handler,
            enabled,
        }
    }

    /// Starts an event timer. Cheap even when logging is disabled — the
    /// timestamp is recorded eagerly so nested `finish` calls stay simple.
    pub fn begin(&self, name: &'static str) -> EventHandle {
        let metrics = self.pool.lock().pop().unwrap_or_default();
        EventHandle {
            name,
            start: Utc::now(),
            metrics,
        }
    }

    /// Completes an event, records it, and forwards it to the handler.
    pub fn finish(&self, mut handle: EventHandle) {
        let end = Utc::now();
        let latency_micros = (end - handle.start).num_microseconds();
        let event = AnnotationEvent {
            name: handle.name,
            start: handle.start,
            end: Some(end),
            latency_micros,
            metrics: std::mem::take(&mut handle.metrics),
        };
        if self.enabled {
            self.events.lock().push(event.clone());
        }
        if let Some(handler) = &self.handler {
            handler.on_event(&event);
        }
        self.pool.lock().push(HashMap::new());
    }

    pub fn events(&self) -> Vec<AnnotationEvent> {
        self.events.lock().clone()
    }
}

impl Default for AnnotationCollector {
    fn default() -> Self {
        AnnotationCollector::new(None, false)
    }
}

/// Bundle of everything execution needs, threaded top-down through phases,
/// subqueries, and decorrelated batches. Cheap to clone: every field is
/// `Arc`-backed, matching the "each worker owns its own context copy,
/// annotations collector is shared" rule of §5.
#[derive(Clone)]
pub struct Context {
    pub options: Arc<ExecutorOptions>,
    pub matcher: Arc<dyn PatternMatcher>,
    pub collector: Arc<AnnotationCollector>,
    cancelled: Arc<AtomicBool>,
}

impl Context {
    pub fn new(options: Arc<ExecutorOptions>, matcher: Arc<dyn PatternMatcher>) -> Self {
        let enabled = options.logging.enable_debug_logging;
        let handler: Option<Arc<dyn AnnotationHandler>> = if enabled {
            Some(Arc::new(TracingHandler))
        } else {
            None
        };
        Context {
            options,
            matcher,
            collector: Arc::new(AnnotationCollector::new(handler, enabled)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Signals cancellation to every worker sharing this context (§5,
    /// first-error-cancels-the-rest).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::IndexedMatcher;

    #[test]
    fn cancellation_is_visible_across_clones() {
        let ctx = Context::new(Arc::new(ExecutorOptions::default()), Arc::new(IndexedMatcher::new(Vec::new())));
        let worker_ctx = ctx.clone();
        worker_ctx.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn finished_events_reach_the_log_when_enabled() {
        let collector = AnnotationCollector::new(None, true);
        let mut handle = collector.begin("phase/begin");
        handle.set("phase", MetricValue::Int(0));
        collector.finish(handle);
        assert_eq!(collector.events().len(), 1);
    }
}
