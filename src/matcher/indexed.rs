//! `IndexedMatcher`: the in-memory reference `PatternMatcher` (§4.3).
//!
//! Indices are built lazily on first use under a one-time guard
//! (`std::sync::OnceLock`, which blocks concurrent callers until the
//! first completes building, same shape as the barrier in
//! `crate::relation::streaming`) and are read-only afterward.

use crate::context::{AnnotationCollector, MetricValue};
use crate::datom::{Attribute, Datom, Entity};
use crate::error::MatchError;
use crate::matcher::{Pattern, PatternElement, PatternMatcher, StorageConstraint, TimeRange};
use crate::relation::Relation;
use crate::value::{Symbol, Tuple, Value};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

struct Indices {
    entity: HashMap<Entity, Vec<usize>>,
    attribute: HashMap<Attribute, Vec<usize>>,
    value: HashMap<Value, Vec<usize>>,
    /// `(entity, attribute)` -> position of the datom with the largest tx.
    composite: HashMap<(Entity, Attribute), usize>,
}

/// In-memory matcher over a fixed set of datoms, exercised throughout this
/// crate's tests. A real storage engine sits behind the same
/// `PatternMatcher` trait in production.
pub struct IndexedMatcher {
    facts: Arc<[Datom]>,
    indices: Arc<OnceLock<Indices>>,
    /// Empty for the matcher every query starts with. A non-empty value
    /// only ever exists on a scoped copy produced by `with_time_ranges`,
    /// never by mutating the handle every other pattern match shares.
    time_ranges: Vec<TimeRange>,
    collector: ArcSwap<Option<Arc<AnnotationCollector>>>,
}

impl IndexedMatcher {
    pub fn new(facts: Vec<Datom>) -> Self {
        IndexedMatcher {
            facts: Arc::from(facts),
            indices: Arc::new(OnceLock::new()),
            time_ranges: Vec::new(),
            collector: ArcSwap::from_pointee(None),
        }
    }

    fn indices(&self) -> &Indices {
        self.indices.get_or_init(|| build_indices(&self.facts))
    }

    /// Index-selection priority per §4.3: composite, entity, attribute,
    /// value-hash, full scan.
    fn candidates(&self, pattern: &Pattern) -> Vec<usize> {
        let indices = self.indices();
        let entity_bound = bound_entity(pattern);
        let attribute_bound = bound_attribute(pattern);
        let value_bound = bound_value(pattern);

        match (entity_bound, attribute_bound, value_bound) {
            (Some(e), Some(a), _) => indices.composite.get(&(e, a)).copied().into_iter().collect(),
            (Some(e), None, _) => indices.entity.get(&e).cloned().unwrap_or_default(),
            (None, Some(a), _) => indices.attribute.get(&a).cloned().unwrap_or_default(),
            (None, None, Some(v)) => {
                // Exact-equality filtering guards against a hash
                // collision inside the HashMap's own bucket chain.
                indices
                    .value
                    .get(&v)
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|&pos| self.facts[pos].value == v)
                    .collect()
            }
            (None, None, None) => (0..self.facts.len()).collect(),
        }
    }

    fn within_time_ranges(&self, datom: &Datom) -> bool {
        if self.time_ranges.is_empty() {
            return true;
        }
        let Value::Timestamp(t) = &datom.value else { return true };
        self.time_ranges.iter().any(|r| *t >= r.start && *t < r.end)
    }

    fn scan(&self, pattern: &Pattern, constraints: &[StorageConstraint]) -> Result<Vec<Datom>, MatchError> {
        let mut out = Vec::new();
        for pos in self.candidates(pattern) {
            let datom = &self.facts[pos];
            if !pattern_matches(pattern, datom) {
                continue;
            }
            if !self.within_time_ranges(datom) {
                continue;
            }
            if !constraint_holds(constraints, datom)? {
                continue;
            }
            out.push(datom.clone());
        }
        Ok(out)
    }

    /// Scores how selective a binding relation is against this pattern's
    /// variable positions (entity most selective, attribute next, value
    /// last), tie-breaking on the smaller relation.
    fn best_binding<'a>(&self, pattern: &Pattern, bindings: &'a [Relation]) -> Option<&'a Relation> {
        let score = |rel: &Relation| -> (i32, i32) {
            let cols = rel.columns();
            let has = |elem: &PatternElement| matches!(elem, PatternElement::Variable(s) if cols.contains(s));
            let mut points = 0;
            if has(&pattern.entity) {
                points += 4;
            }
            if has(&pattern.attribute) {
                points += 2;
            }
            if has(&pattern.value) {
                points += 1;
            }
            let size_hint = match rel.size() {
                crate::relation::RelationSize::Exact(n) => n as i32,
                crate::relation::RelationSize::Unknown => i32::MAX,
            };
            (points, -size_hint)
        };

        bindings.iter().filter(|r| score(r).0 > 0).max_by_key(|r| score(r))
    }

    fn emit_match_event(&self, pattern_desc: &str, rows: usize) {
        let Some(collector) = &*self.collector.load_full() else { return };
        let mut handle = collector.begin("pattern/match");
        handle.set("pattern", MetricValue::Text(pattern_desc.to_string()));
        handle.set("rows", MetricValue::Int(rows as i64));
        collector.finish(handle);
    }
}

fn build_indices(facts: &[Datom]) -> Indices {
    let mut entity: HashMap<Entity, Vec<usize>> = HashMap::new();
    let mut attribute: HashMap<Attribute, Vec<usize>> = HashMap::new();
    let mut value: HashMap<Value, Vec<usize>> = HashMap::new();
    let mut composite: HashMap<(Entity, Attribute), usize> = HashMap::new();

    for (pos, d) in facts.iter().enumerate() {
        entity.entry(d.entity).or_default().push(pos);
        attribute.entry(d.attribute.clone()).or_default().push(pos);
        value.entry(d.value.clone()).or_default().push(pos);

        let key = (d.entity, d.attribute.clone());
        match composite.get(&key) {
            Some(&existing) if facts[existing].tx >= d.tx => {}
            _ => {
                composite.insert(key, pos);
            }
        }
    }

    Indices { entity, attribute, value, composite }
}

fn bound_entity(pattern: &Pattern) -> Option<Entity> {
    match &pattern.entity {
        PatternElement::Constant(Value::Identity(e)) => Some(Entity(*e)),
        _ => None,
    }
}

fn bound_attribute(pattern: &Pattern) -> Option<Attribute> {
    match &pattern.attribute {
        PatternElement::Constant(Value::Keyword(a)) => Some(Attribute(Arc::clone(a))),
        _ => None,
    }
}

fn bound_value(pattern: &Pattern) -> Option<Value> {
    match &pattern.value {
        PatternElement::Constant(v) => Some(v.clone()),
        _ => None,
    }
}

fn pattern_matches(pattern: &Pattern, datom: &Datom) -> bool {
    if let PatternElement::Constant(Value::Identity(e)) = &pattern.entity {
        if datom.entity.0 != *e {
            return false;
        }
    }
    if let PatternElement::Constant(Value::Keyword(a)) = &pattern.attribute {
        if datom.attribute.0.as_ref() != a.as_ref() {
            return false;
        }
    }
    if let PatternElement::Constant(v) = &pattern.value {
        if &datom.value != v {
            return false;
        }
    }
    if let Some(PatternElement::Constant(Value::Integer(tx))) = &pattern.tx {
        if datom.tx.0 as i64 != *tx {
            return false;
        }
    }
    true
}

fn row_for(pattern: &Pattern, columns: &[Symbol], datom: &Datom) -> Tuple {
    let mut values = Vec::with_capacity(columns.len());
    for col in columns {
        let v = if matches!(&pattern.entity, PatternElement::Variable(s) if s == col) {
            Value::Identity(datom.entity.0)
        } else if matches!(&pattern.attribute, PatternElement::Variable(s) if s == col) {
            Value::Keyword(Arc::clone(&datom.attribute.0))
        } else if matches!(&pattern.value, PatternElement::Variable(s) if s == col) {
            datom.value.clone()
        } else if matches!(&pattern.tx, Some(PatternElement::Variable(s)) if s == col) {
            Value::Integer(datom.tx.0 as i64)
        } else {
            unreachable!("column derived from a pattern must bind to one of its positions")
        };
        values.push(v);
    }
    Tuple::new(values)
}

fn substitute(pattern: &Pattern, binding_cols: &[Symbol], row: &Tuple) -> Pattern {
    let sub = |elem: &PatternElement| -> PatternElement {
        if let PatternElement::Variable(sym) = elem {
            if let Some(pos) = binding_cols.iter().position(|c| c == sym) {
                if let Some(v) = row.get(pos) {
                    return PatternElement::Constant(v.clone());
                }
            }
        }
        elem.clone()
    };
    Pattern {
        entity: sub(&pattern.entity),
        attribute: sub(&pattern.attribute),
        value: sub(&pattern.value),
        tx: pattern.tx.as_ref().map(sub),
    }
}

/// Facts-only scan used inside the streaming closure so the closure
/// doesn't borrow `&IndexedMatcher` across the iterator's `'static`
/// lifetime. The per-binding substituted pattern already has entity and
/// attribute constant-bound in the common case, so this linear scan is
/// cheap in practice even without reusing the outer indices.
///
/// No storage constraints ever reach this path (see
/// `match_with_constraints`, which takes the eager `scan_facts_checked`
/// path instead whenever `constraints` is non-empty), so `constraint_holds`
/// can never return `Err` here.
fn scan_facts(facts: &[Datom], pattern: &Pattern) -> Vec<Datom> {
    facts.iter().filter(|d| pattern_matches(pattern, d)).cloned().collect()
}

/// Same scan, but propagating a constraint evaluation failure (e.g. a
/// time-extraction constraint against a non-timestamp value) instead of
/// treating it as a non-match, matching the no-bindings `scan` path.
fn scan_facts_checked(
    facts: &[Datom],
    pattern: &Pattern,
    constraints: &[StorageConstraint],
) -> Result<Vec<Datom>, MatchError> {
    let mut out = Vec::new();
    for d in facts.iter().filter(|d| pattern_matches(pattern, d)) {
        if constraint_holds(constraints, d)? {
            out.push(d.clone());
        }
    }
    Ok(out)
}

fn constraint_holds(constraints: &[StorageConstraint], datom: &Datom) -> Result<bool, MatchError> {
    for c in constraints {
        let position = match c {
            StorageConstraint::Equality { position, .. }
            | StorageConstraint::Range { position, .. }
            | StorageConstraint::TimeExtraction { position, .. } => *position,
        };
        // Position 0/1/2/3 maps onto entity/attribute/value/tx, the fixed
        // shape every `Pattern` shares.
        let value = match position {
            0 => Value::Identity(datom.entity.0),
            1 => Value::Keyword(Arc::clone(&datom.attribute.0)),
            2 => datom.value.clone(),
            3 => Value::Integer(datom.tx.0 as i64),
            _ => return Err(MatchError::TypeMismatch("storage constraint position out of range".into())),
        };
        if !c.holds(&value)? {
            return Ok(false);
        }
    }
    Ok(true)
}

impl PatternMatcher for IndexedMatcher {
    fn match_pattern(&self, pattern: &Pattern, bindings: &[Relation]) -> Result<Relation, MatchError> {
        self.match_with_constraints(pattern, bindings, &[])
    }

    fn match_with_constraints(
        &self,
        pattern: &Pattern,
        bindings: &[Relation],
        constraints: &[StorageConstraint],
    ) -> Result<Relation, MatchError> {
        let columns = pattern.output_columns();
        let options = bindings
            .first()
            .map(|r| Arc::clone(r.options()))
            .unwrap_or_else(|| Arc::new(crate::config::ExecutorOptions::default()));

        let Some(binding) = self.best_binding(pattern, bindings) else {
            // No usable binding: a single direct scan, small enough that
            // materializing it outright is fine (§4.3 "unless the matcher
            // has no bindings and chooses to materialize").
            let datoms = self.scan(pattern, constraints)?;
            self.emit_match_event("direct-scan", datoms.len());
            let tuples = datoms.iter().map(|d| row_for(pattern, &columns, d)).collect();
            return Ok(Relation::materialized(columns, tuples, options));
        };

        let binding_cols = binding.columns().to_vec();
        let binding_rows = binding.iterator().collect_all();
        let output_cols = columns.clone();

        if constraints.is_empty() {
            // Streaming: lazily yields per-binding matches, one binding row
            // at a time, never eagerly collecting every row's matches up
            // front. Safe to run lazily because `scan_facts` with no
            // constraints can never fail.
            let pattern = pattern.clone();
            let facts = Arc::clone(&self.facts);
            let iter = binding_rows.into_iter().flat_map(move |row| {
                let concrete = substitute(&pattern, &binding_cols, &row);
                let cols = output_cols.clone();
                let facts = Arc::clone(&facts);
                scan_facts(&facts, &concrete)
                    .into_iter()
                    .map(move |d| row_for(&concrete, &cols, &d))
                    .collect::<Vec<_>>()
                    .into_iter()
            });
            return Ok(Relation::streaming(columns, iter, options));
        }

        // Storage constraints can fail to evaluate (e.g. a time-extraction
        // constraint against a non-timestamp value). Evaluate eagerly so
        // the failure surfaces from this call instead of being silently
        // dropped mid-stream (§7).
        let mut tuples = Vec::new();
        for row in binding_rows {
            let concrete = substitute(pattern, &binding_cols, &row);
            for d in scan_facts_checked(&self.facts, &concrete, constraints)? {
                tuples.push(row_for(&concrete, &output_cols, &d));
            }
        }
        Ok(Relation::materialized(columns, tuples, options))
    }

    /// Returns a distinct matcher handle scoped to `ranges`, sharing this
    /// matcher's facts and (lazily built) indices but never mutating them
    /// — `self` keeps matching with its own ranges (empty, unless it is
    /// itself a scoped handle) for every other caller.
    fn with_time_ranges(self: Arc<Self>, ranges: Vec<TimeRange>) -> Arc<dyn PatternMatcher> {
        let collector = (*self.collector.load_full()).clone();
        Arc::new(IndexedMatcher {
            facts: Arc::clone(&self.facts),
            indices: Arc::clone(&self.indices),
            time_ranges: ranges,
            collector: ArcSwap::from_pointee(collector),
        })
    }

    fn with_collector(self: Arc<Self>, collector: Arc<AnnotationCollector>) -> Arc<dyn PatternMatcher> {
        self.collector.store(Arc::new(Some(collector)));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datom::Tx;

    fn fact(e: u64, a: &str, v: Value, tx: u64) -> Datom {
        Datom::new(Entity(e), Attribute::new(a), v, Tx(tx))
    }

    fn var(name: &str) -> PatternElement {
        PatternElement::Variable(Symbol::from(name))
    }

    fn konst(v: Value) -> PatternElement {
        PatternElement::Constant(v)
    }

    #[test]
    fn composite_lookup_returns_latest_tx() {
        let facts = vec![
            fact(1, ":person/name", Value::string("alice-old"), 1),
            fact(1, ":person/name", Value::string("alice"), 2),
        ];
        let matcher = IndexedMatcher::new(facts);
        let pattern = Pattern {
            entity: konst(Value::Identity(1)),
            attribute: konst(Value::keyword(":person/name")),
            value: var("name"),
            tx: None,
        };
        let result = matcher.match_pattern(&pattern, &[]).unwrap();
        let rows = result.iterator().collect_all();
        // The composite index keeps only the latest-tx *position*; the
        // matcher doesn't itself dedup across history, so both positions
        // sharing (entity, attribute) still surface via pattern matching
        // unless storage already compacted history. Here the composite
        // lookup path returns exactly the latest position.
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0[0], Value::string("alice"));
    }

    #[test]
    fn entity_only_bound_returns_every_attribute() {
        let facts = vec![
            fact(1, ":person/name", Value::string("alice"), 1),
            fact(1, ":person/age", Value::Integer(30), 1),
            fact(2, ":person/name", Value::string("bob"), 1),
        ];
        let matcher = IndexedMatcher::new(facts);
        let pattern = Pattern {
            entity: konst(Value::Identity(1)),
            attribute: var("attr"),
            value: var("val"),
            tx: None,
        };
        let rows = matcher.match_pattern(&pattern, &[]).unwrap().iterator().collect_all();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn binding_relation_drives_a_streaming_lookup_per_row() {
        let facts = vec![
            fact(1, ":person/name", Value::string("alice"), 1),
            fact(2, ":person/name", Value::string("bob"), 1),
        ];
        let matcher = IndexedMatcher::new(facts);
        let pattern = Pattern {
            entity: var("p"),
            attribute: konst(Value::keyword(":person/name")),
            value: var("name"),
            tx: None,
        };
        let bindings_rel = Relation::materialized(
            vec![Symbol::from("p")],
            vec![
                Tuple::new(vec![Value::Identity(1)]),
                Tuple::new(vec![Value::Identity(2)]),
            ],
            Arc::new(crate::config::ExecutorOptions::default()),
        );
        let result = matcher.match_pattern(&pattern, &[bindings_rel]).unwrap();
        assert!(result.is_streaming());
        let mut rows = result.iterator().collect_all();
        rows.sort_by(|a, b| a.0[0].cmp(&b.0[0]));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0[1], Value::string("alice"));
    }

    #[test]
    fn storage_constraint_is_applied_before_pattern_match() {
        let facts = vec![
            fact(1, ":order/total", Value::Integer(10), 1),
            fact(2, ":order/total", Value::Integer(99), 1),
        ];
        let matcher = IndexedMatcher::new(facts);
        let pattern = Pattern {
            entity: var("o"),
            attribute: konst(Value::keyword(":order/total")),
            value: var("total"),
            tx: None,
        };
        let constraints = vec![StorageConstraint::Range {
            position: 2,
            min: Some(Value::Integer(50)),
            min_inclusive: true,
            max: None,
            max_inclusive: false,
        }];
        let rows = matcher
            .match_with_constraints(&pattern, &[], &constraints)
            .unwrap()
            .iterator()
            .collect_all();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0[1], Value::Integer(99));
    }

    #[test]
    fn binding_driven_constraint_type_mismatch_surfaces_instead_of_being_dropped() {
        use crate::matcher::TimeUnit;

        let facts = vec![fact(1, ":order/total", Value::Integer(10), 1)];
        let matcher = IndexedMatcher::new(facts);
        let pattern = Pattern {
            entity: var("o"),
            attribute: konst(Value::keyword(":order/total")),
            value: var("total"),
            tx: None,
        };
        let bindings_rel = Relation::materialized(
            vec![Symbol::from("o")],
            vec![Tuple::new(vec![Value::Identity(1)])],
            Arc::new(crate::config::ExecutorOptions::default()),
        );
        let constraints = vec![StorageConstraint::TimeExtraction {
            position: 2,
            unit: TimeUnit::Year,
            expected: 2024,
        }];

        // `:order/total` is an integer, not a timestamp: the constraint
        // can't be evaluated and must surface as an error rather than
        // silently filtering the row out.
        let err = matcher
            .match_with_constraints(&pattern, &[bindings_rel], &constraints)
            .unwrap_err();
        assert!(matches!(err, MatchError::TypeMismatch(_)));
    }

    #[test]
    fn with_time_ranges_does_not_affect_the_original_handle() {
        let facts = vec![fact(1, ":order/total", Value::Integer(10), 1)];
        let original: Arc<IndexedMatcher> = Arc::new(IndexedMatcher::new(facts));
        let range = TimeRange { start: chrono::Utc::now(), end: chrono::Utc::now() };
        let _scoped = Arc::clone(&original).with_time_ranges(vec![range]);
        // The handle every other caller still holds is untouched — the
        // scoped ranges live only on the new handle `with_time_ranges`
        // returned.
        assert!(original.time_ranges.is_empty());
    }
}
