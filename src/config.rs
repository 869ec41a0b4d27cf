//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - query_engine.toml (default configuration)
//! - query_engine.local.toml (git-ignored local overrides)
//! - Environment variables (QUERYENGINE_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # query_engine.toml
//! [joins]
//! enable_streaming_joins = true
//! default_hash_table_size = 1024
//!
//! [subqueries]
//! enable_parallel_subqueries = true
//! subquery_worker_count = 0
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! QUERYENGINE_JOINS__DEFAULT_HASH_TABLE_SIZE=4096
//! QUERYENGINE_SUBQUERIES__SUBQUERY_WORKER_COUNT=8
//! ```

use figment::{Figment, providers::{Env, Format, Toml}};
use serde::{Deserialize, Serialize};

/// Tunable knobs for a single query execution (§6 options table). Shared by
/// reference (`Arc<ExecutorOptions>`) across every relation and join the
/// executor produces for one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorOptions {
    #[serde(default)]
    pub joins: JoinOptions,
    #[serde(default)]
    pub subqueries: SubqueryOptions,
    #[serde(default)]
    pub decorrelation: DecorrelationOptions,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Join strategy knobs (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinOptions {
    /// Streaming joins return a `Relation::streaming` result instead of
    /// eagerly materializing. Disable to always materialize join output.
    #[serde(default = "default_true")]
    pub enable_streaming_joins: bool,

    /// Use the symmetric hash join when both sides are streaming, instead
    /// of forcing one side to materialize as the build side.
    #[serde(default = "default_true")]
    pub enable_symmetric_hash_join: bool,

    /// Initial capacity hint for the build-side hash table.
    #[serde(default = "default_hash_table_size")]
    pub default_hash_table_size: usize,
}

/// Subquery execution knobs (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubqueryOptions {
    /// Stream subquery-union results through a channel instead of
    /// collecting them into a `Vec` before wrapping as a relation.
    #[serde(default)]
    pub use_streaming_subquery_union: bool,

    /// Run independent subqueries across the worker pool instead of
    /// sequentially on the calling thread.
    #[serde(default = "default_true")]
    pub enable_parallel_subqueries: bool,

    /// Worker pool size for parallel subqueries and decorrelated batch
    /// execution. 0 means use all available CPU cores.
    #[serde(default)]
    pub subquery_worker_count: usize,
}

/// Correlated-subquery rewrite knobs (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecorrelationOptions {
    /// Attempt to rewrite eligible grouped-aggregation subqueries into a
    /// single batched execution over merged bindings.
    #[serde(default = "default_true")]
    pub enable_subquery_decorrelation: bool,

    /// Run independent decorrelated batches across the worker pool.
    #[serde(default = "default_true")]
    pub enable_parallel_decorrelation: bool,

    /// Common subexpression elimination across subquery signatures before
    /// merging (signature matching in §4.7).
    #[serde(default = "default_true")]
    pub enable_cse: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit per-phase annotation events (§6, §9) in addition to tracing
    /// spans.
    #[serde(default)]
    pub enable_debug_logging: bool,
}

// Default value functions
fn default_true() -> bool { true }
fn default_hash_table_size() -> usize { 1024 }
fn default_log_level() -> String { "info".to_string() }

impl ExecutorOptions {
    /// Load configuration from default locations.
    ///
    /// Merges in order:
    /// 1. query_engine.toml (base configuration)
    /// 2. query_engine.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (QUERYENGINE_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("query_engine.toml"))
            .merge(Toml::file("query_engine.local.toml"))
            .merge(Env::prefixed("QUERYENGINE_").split("__"))
            .extract()
    }

    /// Load configuration from a specific file path.
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("QUERYENGINE_").split("__"))
            .extract()
    }

    /// Resolves `subquery_worker_count == 0` to the number of available
    /// CPU cores, the convention used everywhere a worker pool is sized.
    pub fn resolved_worker_count(&self) -> usize {
        if self.subqueries.subquery_worker_count == 0 {
            num_cpus::get()
        } else {
            self.subqueries.subquery_worker_count
        }
    }
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        ExecutorOptions {
            joins: JoinOptions::default(),
            subqueries: SubqueryOptions::default(),
            decorrelation: DecorrelationOptions::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for JoinOptions {
    fn default() -> Self {
        JoinOptions {
            enable_streaming_joins: true,
            enable_symmetric_hash_join: true,
            default_hash_table_size: default_hash_table_size(),
        }
    }
}

impl Default for SubqueryOptions {
    fn default() -> Self {
        SubqueryOptions {
            use_streaming_subquery_union: false,
            enable_parallel_subqueries: true,
            subquery_worker_count: 0,
        }
    }
}

impl Default for DecorrelationOptions {
    fn default() -> Self {
        DecorrelationOptions {
            enable_subquery_decorrelation: true,
            enable_parallel_decorrelation: true,
            enable_cse: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            enable_debug_logging: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_favor_streaming_and_parallelism() {
        let opts = ExecutorOptions::default();
        assert!(opts.joins.enable_streaming_joins);
        assert!(opts.subqueries.enable_parallel_subqueries);
        assert!(opts.decorrelation.enable_subquery_decorrelation);
    }

    #[test]
    fn zero_worker_count_resolves_to_cpu_count() {
        let opts = ExecutorOptions::default();
        assert_eq!(opts.resolved_worker_count(), num_cpus::get());
    }

    #[test]
    fn options_round_trip_through_toml() {
        let opts = ExecutorOptions::default();
        let text = toml::to_string(&opts).unwrap();
        assert!(text.contains("[joins]"));
        assert!(text.contains("[subqueries]"));
    }
}
