//! Relations group: an ordered collection of relations held between
//! operators, with the `collapse` operation phases use to join everything
//! that shares a column until no further joins are possible (§3, §4.5).

use crate::relation::Relation;
use std::collections::HashSet;

/// An ordered collection of relations awaiting collapse.
#[derive(Default)]
pub struct RelationsGroup {
    relations: Vec<Relation>,
}

impl RelationsGroup {
    pub fn new() -> Self {
        RelationsGroup {
            relations: Vec::new(),
        }
    }

    pub fn from_relation(relation: Relation) -> Self {
        RelationsGroup {
            relations: vec![relation],
        }
    }

    pub fn from_relations(relations: Vec<Relation>) -> Self {
        RelationsGroup { relations }
    }

    pub fn push(&mut self, relation: Relation) {
        self.relations.push(relation);
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub fn into_relations(self) -> Vec<Relation> {
        self.relations
    }

    /// Joins any two relations that share a column, repeatedly, until the
    /// group is maximally joined. The result is one or more disjoint
    /// groups (relations whose column sets are pairwise disjoint).
    pub fn collapse(mut self) -> Result<Vec<Relation>, crate::error::JoinError> {
        loop {
            let pair = find_joinable_pair(&self.relations);
            let Some((i, j)) = pair else {
                return Ok(self.relations);
            };
            // j > i by construction of find_joinable_pair.
            let right = self.relations.remove(j);
            let left = self.relations.remove(i);
            let joined = left.join(&right)?;
            self.relations.push(joined);
        }
    }

    /// Collapses down to a single relation, joining disjoint groups with
    /// an explicit cross product. Callers that know a plan requires a
    /// cartesian product (expressions/predicates spanning disjoint
    /// groups) use this; the phase executor itself treats a leftover
    /// multi-group result as a `CartesianResidual` error instead.
    pub fn collapse_to_single(self) -> Result<Relation, crate::error::JoinError> {
        let mut groups = self.collapse()?;
        let mut result = groups.remove(0);
        for g in groups {
            result = crate::join::cross_product(&result, &g);
        }
        Ok(result)
    }
}

fn shared_columns(a: &Relation, b: &Relation) -> bool {
    let a_cols: HashSet<_> = a.columns().iter().collect();
    b.columns().iter().any(|c| a_cols.contains(c))
}

fn find_joinable_pair(relations: &[Relation]) -> Option<(usize, usize)> {
    for i in 0..relations.len() {
        for j in (i + 1)..relations.len() {
            if shared_columns(&relations[i], &relations[j]) {
                return Some((i, j));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorOptions;
    use crate::value::Value;
    use std::sync::Arc;

    fn opts() -> Arc<ExecutorOptions> {
        Arc::new(ExecutorOptions::default())
    }

    #[test]
    fn collapse_joins_relations_sharing_a_column_into_one_group() {
        let a = Relation::materialized(
            vec!["p".into(), "name".into()],
            vec![name_tuple(1, "alice".into())],
            opts(),
        );
        let b = Relation::materialized(
            vec!["p".into(), "age".into()],
            vec![age_tuple(1, 30)],
            opts(),
        );
        let mut group = RelationsGroup::new();
        group.push(a);
        group.push(b);
        let collapsed = group.collapse().unwrap();
        assert_eq!(collapsed.len(), 1);
        assert_eq!(collapsed[0].columns().len(), 3);
    }

    #[test]
    fn collapse_keeps_disjoint_groups_disjoint() {
        let a = Relation::materialized(vec!["x".into()], vec![], opts());
        let b = Relation::materialized(vec!["y".into()], vec![], opts());
        let mut group = RelationsGroup::new();
        group.push(a);
        group.push(b);
        let collapsed = group.collapse().unwrap();
        assert_eq!(collapsed.len(), 2);
    }

    fn name_tuple(p: i64, name: std::sync::Arc<str>) -> crate::value::Tuple {
        crate::value::Tuple::new(vec![Value::Integer(p), Value::String(name)])
    }
    fn age_tuple(p: i64, age: i64) -> crate::value::Tuple {
        crate::value::Tuple::new(vec![Value::Integer(p), Value::Integer(age)])
    }
}
