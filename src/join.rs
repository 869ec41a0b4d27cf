//! Relational join operators (§4.4): hash join (materialized and
//! symmetric-streaming), semi-join, anti-join, and cross product.
//!
//! Hash join is the default join strategy. The build side is the smaller
//! materialized relation when relation sizes are known; if both inputs
//! are streaming, the engine either uses symmetric hash join (if enabled)
//! or materializes one side, per `ExecutorOptions`.

use crate::error::JoinError;
use crate::relation::{Relation, RelationSize};
use crate::tuple_key::TupleKey;
use crate::value::{Symbol, Tuple, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A column is a tx column iff its name matches this exact set *and*
/// every value seen for it so far is an integer. This is the donor's
/// documented heuristic (§9 open question) — fragile by design, not to be
/// extended beyond what is written here.
fn looks_like_tx_column(name: &str) -> bool {
    matches!(name, "tx" | "t" | "txid" | "transaction")
}

pub fn detect_tx_column(columns: &[Symbol], tuples: &[Tuple]) -> Option<usize> {
    let idx = columns.iter().position(|c| looks_like_tx_column(c.as_str()))?;
    let first = tuples.first()?;
    match first.get(idx)? {
        Value::Integer(_) => Some(idx),
        _ => None,
    }
}

/// Applies latest-tx-wins reduction on the build side before constructing
/// the hash table: when multiple tuples agree on every non-tx column,
/// only the one with the largest tx value survives.
pub fn latest_tx_reduce(columns: &[Symbol], tuples: Vec<Tuple>, tx_col: usize) -> Vec<Tuple> {
    let other_positions: Vec<usize> = (0..columns.len()).filter(|&i| i != tx_col).collect();
    let mut best: HashMap<TupleKey, Tuple> = HashMap::new();
    for t in tuples {
        let key = TupleKey::join_key(&t, &other_positions);
        match best.get(&key) {
            Some(existing) if existing.0[tx_col] >= t.0[tx_col] => {}
            _ => {
                best.insert(key, t);
            }
        }
    }
    best.into_values().collect()
}

fn shared_and_residual(left: &[Symbol], right: &[Symbol]) -> (Vec<usize>, Vec<usize>, Vec<usize>, Vec<Symbol>) {
    let left_positions: Vec<usize> = (0..left.len()).collect();
    let mut right_join_positions = Vec::new();
    let mut right_residual_positions = Vec::new();
    let mut right_residual_cols = Vec::new();
    for (i, c) in right.iter().enumerate() {
        if left.contains(c) {
            right_join_positions.push(i);
        } else {
            right_residual_positions.push(i);
            right_residual_cols.push(c.clone());
        }
    }
    (left_positions, right_join_positions, right_residual_positions, right_residual_cols)
}

/// Output columns = left columns ++ right columns with join-key
/// duplicates removed (§4.4 "Join combine rule").
fn combined_columns(left: &[Symbol], right: &[Symbol]) -> (Vec<Symbol>, Vec<usize>) {
    let (_, _, right_residual_positions, right_residual_cols) = shared_and_residual(left, right);
    let mut cols = left.to_vec();
    cols.extend(right_residual_cols);
    (cols, right_residual_positions)
}

fn join_key_positions(cols: &[Symbol], keys: &[Symbol]) -> Vec<usize> {
    keys.iter()
        .map(|k| cols.iter().position(|c| c == k).expect("join key must be present"))
        .collect()
}

/// Hash join on the intersection of `left`'s and `right`'s column sets.
pub fn hash_join(left: &Relation, right: &Relation) -> Result<Relation, JoinError> {
    let join_keys: Vec<Symbol> = left
        .columns()
        .iter()
        .filter(|c| right.columns().contains(c))
        .cloned()
        .collect();
    if join_keys.is_empty() {
        return Err(JoinError::NoSharedColumns);
    }

    let options = Arc::clone(left.options());
    let (out_cols, right_residual_positions) = combined_columns(left.columns(), right.columns());

    let use_symmetric = options.joins.enable_symmetric_hash_join && left.is_streaming() && right.is_streaming();

    if use_symmetric {
        return Ok(symmetric_hash_join(left, right, &join_keys, &out_cols, &right_residual_positions, options));
    }

    // Pick the smaller materialized side as the build side when sizes are
    // known; otherwise materialize the right side (arbitrary but
    // consistent) to build from.
    let (build, probe, build_is_left) = match (left.size(), right.size()) {
        (RelationSize::Exact(l), RelationSize::Exact(r)) if l <= r => (left, right, true),
        (RelationSize::Exact(_), RelationSize::Exact(_)) => (right, left, false),
        _ => (right, left, false),
    };

    let build_mat = build.force_materialize();
    let build_cols = build_mat.columns().to_vec();
    let build_key_positions = join_key_positions(&build_cols, &join_keys);

    let build_tuples: Vec<Tuple> = match detect_tx_column(&build_cols, build_mat.tuples()) {
        Some(tx_col) => latest_tx_reduce(&build_cols, build_mat.tuples().to_vec(), tx_col),
        None => build_mat.tuples().to_vec(),
    };

    let default_capacity = options.joins.default_hash_table_size;
    let mut table: HashMap<TupleKey, Vec<Tuple>> =
        HashMap::with_capacity(build_tuples.len().max(1).max(if build_tuples.is_empty() { default_capacity } else { 0 }));
    for t in &build_tuples {
        let key = TupleKey::join_key(t, &build_key_positions);
        table.entry(key).or_default().push(t.clone());
    }

    let probe_cols = probe.columns().to_vec();
    let probe_key_positions = join_key_positions(&probe_cols, &join_keys);
    let residual_positions = right_residual_positions.clone();

    let do_combine = move |probe_tuple: &Tuple, build_tuple: &Tuple| -> Tuple {
        if build_is_left {
            build_tuple.concat(&residual_positions, probe_tuple)
        } else {
            probe_tuple.concat(&residual_positions, build_tuple)
        }
    };

    let seen_key_all_positions: Vec<usize> = (0..out_cols.len()).collect();
    let mut seen = std::collections::HashSet::new();

    let probe_cursor_rel = probe.clone();
    let probe_tuples = probe_cursor_rel.iterator().collect_all();
    let mut output = Vec::new();
    for probe_tuple in &probe_tuples {
        let key = TupleKey::join_key(probe_tuple, &probe_key_positions);
        if let Some(matches) = table.get(&key) {
            for build_tuple in matches {
                let combined = do_combine(probe_tuple, build_tuple);
                let dedup_key = TupleKey::join_key(&combined, &seen_key_all_positions);
                if seen.insert(dedup_key) {
                    output.push(combined);
                }
            }
        }
    }

    if options.joins.enable_streaming_joins {
        Ok(Relation::streaming(out_cols, output.into_iter(), options))
    } else {
        Ok(Relation::materialized(out_cols, output, options))
    }
}

/// Interleaves reads from both sides, probing the opposite side's hash
/// table before inserting into its own, so streaming semantics survive a
/// streaming × streaming join at the cost of holding two hash tables.
fn symmetric_hash_join(
    left: &Relation,
    right: &Relation,
    join_keys: &[Symbol],
    out_cols: &[Symbol],
    right_residual_positions: &[usize],
    options: Arc<crate::config::ExecutorOptions>,
) -> Relation {
    let left_cols = left.columns().to_vec();
    let right_cols = right.columns().to_vec();
    let left_key_positions = join_key_positions(&left_cols, join_keys);
    let right_key_positions = join_key_positions(&right_cols, join_keys);

    let mut left_table: HashMap<TupleKey, Vec<Tuple>> = HashMap::new();
    let mut right_table: HashMap<TupleKey, Vec<Tuple>> = HashMap::new();
    let mut output = Vec::new();

    let mut left_cursor = left.iterator();
    let mut right_cursor = right.iterator();
    let mut left_done = false;
    let mut right_done = false;

    while !left_done || !right_done {
        if !left_done {
            match left_cursor.next() {
                Some(t) => {
                    let key = TupleKey::join_key(&t, &left_key_positions);
                    if let Some(matches) = right_table.get(&key) {
                        for r in matches {
                            output.push(t.concat(right_residual_positions, r));
                        }
                    }
                    left_table.entry(key).or_default().push(t);
                }
                None => left_done = true,
            }
        }
        if !right_done {
            match right_cursor.next() {
                Some(t) => {
                    let key = TupleKey::join_key(&t, &right_key_positions);
                    if let Some(matches) = left_table.get(&key) {
                        for l in matches {
                            output.push(l.concat(right_residual_positions, &t));
                        }
                    }
                    right_table.entry(key).or_default().push(t);
                }
                None => right_done = true,
            }
        }
    }

    Relation::materialized(out_cols.to_vec(), output, options)
}

/// Builds a key set from `right` restricted to `keys` and filters `left`
/// to rows whose key is present.
pub fn semi_join(left: &Relation, right: &Relation, keys: &[Symbol]) -> Relation {
    let right_positions = join_key_positions(right.columns(), keys);
    let right_keys: std::collections::HashSet<TupleKey> = right
        .iterator()
        .collect_all()
        .iter()
        .map(|t| TupleKey::join_key(t, &right_positions))
        .collect();

    let left_positions = join_key_positions(left.columns(), keys);
    let cols = left.columns().to_vec();
    let options = Arc::clone(left.options());
    let tuples: Vec<Tuple> = left
        .iterator()
        .collect_all()
        .into_iter()
        .filter(|t| right_keys.contains(&TupleKey::join_key(t, &left_positions)))
        .collect();
    Relation::materialized(cols, tuples, options)
}

/// The complement of `semi_join`: keeps rows of `left` whose key is
/// *absent* from `right`.
pub fn anti_join(left: &Relation, right: &Relation, keys: &[Symbol]) -> Relation {
    let right_positions = join_key_positions(right.columns(), keys);
    let right_keys: std::collections::HashSet<TupleKey> = right
        .iterator()
        .collect_all()
        .iter()
        .map(|t| TupleKey::join_key(t, &right_positions))
        .collect();

    let left_positions = join_key_positions(left.columns(), keys);
    let cols = left.columns().to_vec();
    let options = Arc::clone(left.options());
    let tuples: Vec<Tuple> = left
        .iterator()
        .collect_all()
        .into_iter()
        .filter(|t| !right_keys.contains(&TupleKey::join_key(t, &left_positions)))
        .collect();
    Relation::materialized(cols, tuples, options)
}

/// Used only when expressions/predicates reference symbols in disjoint
/// groups and no other way of combining them exists.
pub fn cross_product(left: &Relation, right: &Relation) -> Relation {
    let mut cols = left.columns().to_vec();
    cols.extend(right.columns().iter().cloned());
    let options = Arc::clone(left.options());

    let left_tuples = left.iterator().collect_all();
    let right_tuples = right.iterator().collect_all();
    let right_positions: Vec<usize> = (0..right.columns().len()).collect();

    let mut out = Vec::with_capacity(left_tuples.len() * right_tuples.len());
    for l in &left_tuples {
        for r in &right_tuples {
            out.push(l.concat(&right_positions, r));
        }
    }
    Relation::materialized(cols, out, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorOptions;

    fn opts() -> Arc<ExecutorOptions> {
        Arc::new(ExecutorOptions::default())
    }

    fn rel(cols: &[&str], rows: Vec<Vec<Value>>) -> Relation {
        Relation::materialized(
            cols.iter().map(|c| Symbol::from(*c)).collect(),
            rows.into_iter().map(Tuple::new).collect(),
            opts(),
        )
    }

    #[test]
    fn hash_join_combines_columns_left_then_right_residual() {
        let left = rel(&["p", "name"], vec![vec![Value::Integer(1), Value::string("alice")]]);
        let right = rel(&["p", "age"], vec![vec![Value::Integer(1), Value::Integer(30)]]);
        let joined = hash_join(&left, &right).unwrap();
        assert_eq!(
            joined.columns(),
            &[Symbol::from("p"), Symbol::from("name"), Symbol::from("age")]
        );
        let rows = joined.iterator().collect_all();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0[2], Value::Integer(30));
    }

    #[test]
    fn hash_join_no_shared_columns_errors() {
        let left = rel(&["a"], vec![vec![Value::Integer(1)]]);
        let right = rel(&["b"], vec![vec![Value::Integer(1)]]);
        assert!(hash_join(&left, &right).is_err());
    }

    #[test]
    fn semi_join_is_subset_of_left_and_has_a_match() {
        let left = rel(&["p"], vec![vec![Value::Integer(1)], vec![Value::Integer(2)]]);
        let right = rel(&["p"], vec![vec![Value::Integer(1)]]);
        let result = semi_join(&left, &right, &[Symbol::from("p")]);
        let rows = result.iterator().collect_all();
        assert!(rows.len() <= 2);
        assert_eq!(rows, vec![Tuple::new(vec![Value::Integer(1)])]);
    }

    #[test]
    fn latest_tx_wins() {
        let cols = vec![Symbol::from("e"), Symbol::from("tx")];
        let tuples = vec![
            Tuple::new(vec![Value::Integer(1), Value::Integer(5)]),
            Tuple::new(vec![Value::Integer(1), Value::Integer(9)]),
        ];
        let reduced = latest_tx_reduce(&cols, tuples, 1);
        assert_eq!(reduced.len(), 1);
        assert_eq!(reduced[0].0[1], Value::Integer(9));
    }
}
