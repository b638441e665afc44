//! Key-based joins over [`Table`]s and max-level permission aggregation.

use std::collections::HashMap;

use crate::table::{Cell, Table, TableError};
use crate::{identity_key, PermissionLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// Both sides must match.
    Inner,
    /// Every left row survives; unmatched right columns are null.
    Left,
    /// Every row from both sides survives.
    Outer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyNorm {
    /// Compare the cell rendering as-is.
    Exact,
    /// Trim and case-fold before comparing (emails, UPNs).
    Identity,
}

#[derive(Debug, Clone)]
pub struct JoinSpec {
    pub left_on: Vec<String>,
    pub right_on: Vec<String>,
    pub kind: JoinKind,
    pub norm: KeyNorm,
}

impl JoinSpec {
    pub fn new(kind: JoinKind, left_on: &str, right_on: &str) -> Self {
        Self {
            left_on: vec![left_on.to_string()],
            right_on: vec![right_on.to_string()],
            kind,
            norm: KeyNorm::Exact,
        }
    }

    /// Same-named key columns on both sides.
    pub fn on(kind: JoinKind, keys: &[&str]) -> Self {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        Self {
            left_on: keys.clone(),
            right_on: keys,
            kind,
            norm: KeyNorm::Exact,
        }
    }

    pub fn identity(mut self) -> Self {
        self.norm = KeyNorm::Identity;
        self
    }
}

fn row_key(row: &[Cell], indices: &[usize], norm: KeyNorm) -> Option<Vec<String>> {
    indices
        .iter()
        .map(|&i| {
            row[i].join_key().map(|k| match norm {
                KeyNorm::Exact => k,
                KeyNorm::Identity => identity_key(&k),
            })
        })
        .collect()
}

/// Joins `left` with `right`.
///
/// Output columns are the left columns followed by the right columns. A right key column
/// sharing its name with the paired left key column is folded into the left one, and for
/// right-only rows of an outer join that column carries the right value. Any other shared
/// column name is an error; callers prefix one side first.
///
/// Row order: left rows in input order, each fanned out over its right matches in input
/// order, then (outer only) unmatched right rows in input order. Null key parts never match.
pub fn join(left: &Table, right: &Table, spec: &JoinSpec) -> Result<Table, TableError> {
    if spec.left_on.len() != spec.right_on.len() {
        return Err(TableError::Arity {
            expected: spec.left_on.len(),
            actual: spec.right_on.len(),
        });
    }

    let left_idx = spec
        .left_on
        .iter()
        .map(|c| left.require_column(c))
        .collect::<Result<Vec<_>, _>>()?;
    let right_idx = spec
        .right_on
        .iter()
        .map(|c| right.require_column(c))
        .collect::<Result<Vec<_>, _>>()?;

    // Right key columns folded into their same-named left partner: right index -> left index.
    let mut folded: HashMap<usize, usize> = HashMap::new();
    for (pos, (l, r)) in spec.left_on.iter().zip(&spec.right_on).enumerate() {
        if l == r {
            folded.insert(right_idx[pos], left_idx[pos]);
        }
    }

    let kept_right: Vec<usize> = (0..right.width())
        .filter(|i| !folded.contains_key(i))
        .collect();

    let mut columns: Vec<String> = left.columns().to_vec();
    for &i in &kept_right {
        let name = &right.columns()[i];
        if columns.contains(name) {
            return Err(TableError::DuplicateColumn(name.clone()));
        }
        columns.push(name.clone());
    }

    let mut index: HashMap<Vec<String>, Vec<usize>> = HashMap::new();
    for (i, row) in right.rows().iter().enumerate() {
        if let Some(key) = row_key(row, &right_idx, spec.norm) {
            index.entry(key).or_default().push(i);
        }
    }

    let mut matched_right = vec![false; right.len()];
    let mut out = Table::new(columns);

    for lrow in left.rows() {
        let matches = row_key(lrow, &left_idx, spec.norm)
            .and_then(|key| index.get(&key))
            .filter(|m| !m.is_empty());

        match matches {
            Some(matches) => {
                for &ri in matches {
                    matched_right[ri] = true;
                    let rrow = &right.rows()[ri];
                    let mut row = lrow.clone();
                    row.extend(kept_right.iter().map(|&i| rrow[i].clone()));
                    out.push_row(row)?;
                }
            }
            None if spec.kind != JoinKind::Inner => {
                let mut row = lrow.clone();
                row.extend(kept_right.iter().map(|_| Cell::Null));
                out.push_row(row)?;
            }
            None => {}
        }
    }

    if spec.kind == JoinKind::Outer {
        for (ri, rrow) in right.rows().iter().enumerate() {
            if matched_right[ri] {
                continue;
            }
            let mut row = vec![Cell::Null; left.width()];
            for (&r, &l) in &folded {
                row[l] = rrow[r].clone();
            }
            row.extend(kept_right.iter().map(|&i| rrow[i].clone()));
            out.push_row(row)?;
        }
    }

    Ok(out)
}

/// Collapses rows sharing the same `group` values to the single row with the highest
/// permission level in `level_column`. Groups keep first-seen order; among equal levels the
/// first row wins. Unparseable levels rank below `View`.
pub fn aggregate_max_level(
    table: &Table,
    group: &[&str],
    level_column: &str,
) -> Result<Table, TableError> {
    let group_idx = group
        .iter()
        .map(|c| table.require_column(c))
        .collect::<Result<Vec<_>, _>>()?;
    let level_idx = table.require_column(level_column)?;

    let mut order: Vec<(Option<PermissionLevel>, usize)> = Vec::new();
    let mut slot_for_group: HashMap<String, usize> = HashMap::new();

    for (i, row) in table.rows().iter().enumerate() {
        let key = format!(
            "{:?}",
            group_idx.iter().map(|&g| &row[g]).collect::<Vec<_>>()
        );
        let level = PermissionLevel::from_cell(&row[level_idx]);
        match slot_for_group.get(&key) {
            None => {
                slot_for_group.insert(key, order.len());
                order.push((level, i));
            }
            Some(&slot) => {
                if level > order[slot].0 {
                    order[slot] = (level, i);
                }
            }
        }
    }

    Table::from_rows(
        table.columns().to_vec(),
        order
            .into_iter()
            .map(|(_, i)| table.rows()[i].clone())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn side(key: &str, label: &str, keys: &[&str]) -> Table {
        Table::from_rows(
            vec![key.to_string(), label.to_string()],
            keys.iter()
                .map(|k| vec![Cell::text(*k), Cell::text(format!("{label}-{k}"))])
                .collect(),
        )
        .expect("table")
    }

    #[test]
    fn join_kinds_follow_population_semantics() {
        let a = side("a_key", "a_val", &["a1", "a2"]);
        let b = side("b_key", "b_val", &["a1", "a3"]);

        let outer = join(&a, &b, &JoinSpec::new(JoinKind::Outer, "a_key", "b_key")).expect("outer");
        assert_eq!(outer.len(), 3);
        assert_eq!(outer.value(0, "b_val"), Some(&Cell::text("b_val-a1")));
        assert_eq!(outer.value(1, "b_key"), Some(&Cell::Null));
        assert_eq!(outer.value(2, "a_key"), Some(&Cell::Null));
        assert_eq!(outer.value(2, "b_key"), Some(&Cell::text("a3")));

        let left = join(&a, &b, &JoinSpec::new(JoinKind::Left, "a_key", "b_key")).expect("left");
        assert_eq!(left.len(), 2);
        assert_eq!(left.value(1, "a_key"), Some(&Cell::text("a2")));
        assert_eq!(left.value(1, "b_val"), Some(&Cell::Null));

        let inner = join(&a, &b, &JoinSpec::new(JoinKind::Inner, "a_key", "b_key")).expect("inner");
        assert_eq!(inner.len(), 1);
        assert_eq!(inner.value(0, "a_key"), Some(&Cell::text("a1")));
    }

    #[test]
    fn identity_keys_match_across_casing_and_nulls_never_match() {
        let mut a = side("email", "name", &["Jane@Corp.com ", "x"]);
        a.push_row(vec![Cell::Null, Cell::text("ghost")]).expect("row");
        let mut b = side("upn", "dept", &["jane@corp.com"]);
        b.push_row(vec![Cell::Null, Cell::text("nobody")]).expect("row");

        let joined = join(
            &a,
            &b,
            &JoinSpec::new(JoinKind::Outer, "email", "upn").identity(),
        )
        .expect("join");
        assert_eq!(joined.len(), 4);
        assert_eq!(joined.value(0, "dept"), Some(&Cell::text("dept-jane@corp.com")));
        assert_eq!(joined.value(2, "dept"), Some(&Cell::Null));
        assert_eq!(joined.value(3, "dept"), Some(&Cell::text("nobody")));
    }

    #[test]
    fn fan_out_and_shared_key_folding() {
        let roles = Table::from_rows(
            vec!["role_id".into(), "role".into()],
            vec![vec![Cell::Int(7), Cell::text("Admin")]],
        )
        .expect("roles");
        let grants = Table::from_rows(
            vec!["role_id".into(), "perm".into()],
            vec![
                vec![Cell::Int(7), Cell::text("A")],
                vec![Cell::Int(7), Cell::text("B")],
                vec![Cell::Int(9), Cell::text("C")],
            ],
        )
        .expect("grants");

        let joined = join(&roles, &grants, &JoinSpec::on(JoinKind::Outer, &["role_id"])).expect("join");
        assert_eq!(joined.columns(), ["role_id", "role", "perm"]);
        assert_eq!(joined.len(), 3);
        assert_eq!(joined.value(2, "role_id"), Some(&Cell::Int(9)));
        assert_eq!(joined.value(2, "role"), Some(&Cell::Null));
    }

    #[test]
    fn colliding_non_key_columns_are_rejected() {
        let a = side("k", "name", &["1"]);
        let b = side("k2", "name", &["1"]);
        let err = join(&a, &b, &JoinSpec::new(JoinKind::Inner, "k", "k2")).unwrap_err();
        assert_eq!(err, TableError::DuplicateColumn("name".into()));
    }

    #[test]
    fn permission_aggregation_takes_the_maximum_level() {
        let grants = Table::from_rows(
            vec!["role".into(), "key".into(), "level".into()],
            vec![
                vec![Cell::text("r1"), Cell::text("LIST_EMPLOYEE"), Cell::text("View")],
                vec![Cell::text("r1"), Cell::text("LIST_EMPLOYEE"), Cell::text("Edit")],
                vec![Cell::text("r1"), Cell::text("LIST_EMPLOYEE"), Cell::text("Create")],
                vec![Cell::text("r2"), Cell::text("LIST_EMPLOYEE"), Cell::Int(1)],
            ],
        )
        .expect("grants");

        let collapsed = aggregate_max_level(&grants, &["role", "key"], "level").expect("aggregate");
        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed.value(0, "level"), Some(&Cell::text("Edit")));
        assert_eq!(collapsed.value(1, "level"), Some(&Cell::Int(1)));
    }
}
