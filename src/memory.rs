use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::store::{
    Assign, Comparison, OrderBy, Predicate, Record, Row, Scalar, Store, StoreError, StoreTx,
};

#[derive(Debug, Clone, Default)]
struct Table {
    rows: Vec<Row>,
    next_key: i64,
}

type Tables = HashMap<&'static str, Table>;

/// In-memory store for demos and tests. Transactions take the whole store,
/// so only one runs at a time and a second `begin` waits for the first to
/// commit or drop. Uniqueness is enforced on primary keys and on
/// `Record::UNIQUE` columns.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    snapshot: Option<Tables>,
}

impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let snapshot = Some(guard.clone());
        Ok(MemoryTx { guard, snapshot })
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

impl StoreTx for MemoryTx {
    async fn find<E: Record>(
        &mut self,
        predicates: &[Predicate],
        order: Option<OrderBy>,
        limit: Option<u32>,
    ) -> Result<Vec<E>, StoreError> {
        let Some(table) = self.guard.get(E::TABLE) else {
            return Ok(Vec::new());
        };

        let mut matched = Vec::new();
        for row in &table.rows {
            if matches_all(row, predicates)? {
                matched.push(row.clone());
            }
        }
        if let Some(order) = order {
            sort_rows(&mut matched, order);
        }
        if let Some(limit) = limit {
            matched.truncate(limit as usize);
        }

        matched.iter().map(E::from_row).collect()
    }

    async fn count<E: Record>(&mut self, predicates: &[Predicate]) -> Result<u64, StoreError> {
        let Some(table) = self.guard.get(E::TABLE) else {
            return Ok(0);
        };

        let mut total = 0u64;
        for row in &table.rows {
            if matches_all(row, predicates)? {
                total += 1;
            }
        }
        Ok(total)
    }

    async fn insert_one<E: Record>(&mut self, record: &E) -> Result<E, StoreError> {
        let row = insert_row::<E>(&mut self.guard, record)?;
        E::from_row(&row)
    }

    async fn insert_batch<E: Record>(&mut self, records: &[E]) -> Result<(), StoreError> {
        for record in records {
            insert_row::<E>(&mut self.guard, record)?;
        }
        Ok(())
    }

    async fn update<E: Record>(
        &mut self,
        changes: &[Assign],
        predicates: &[Predicate],
    ) -> Result<u64, StoreError> {
        let Some(table) = self.guard.get_mut(E::TABLE) else {
            return Ok(0);
        };

        let mut rows = table.rows.clone();
        let mut affected = 0u64;
        for row in &mut rows {
            if matches_all(row, predicates)? {
                for change in changes {
                    row.insert(change.column.to_string(), change.value.clone());
                }
                affected += 1;
            }
        }

        for column in E::UNIQUE {
            let mut seen = HashSet::new();
            for row in &rows {
                match row.get(*column) {
                    Some(value) if *value != Scalar::Null => {
                        if !seen.insert(value) {
                            return Err(StoreError::Conflict { table: E::TABLE });
                        }
                    }
                    _ => {}
                }
            }
        }

        table.rows = rows;
        Ok(affected)
    }

    async fn delete_batch<E: Record>(
        &mut self,
        predicates: &[Predicate],
    ) -> Result<Vec<E>, StoreError> {
        let Some(table) = self.guard.get_mut(E::TABLE) else {
            return Ok(Vec::new());
        };

        let mut kept = Vec::with_capacity(table.rows.len());
        let mut removed = Vec::new();
        for row in table.rows.drain(..) {
            if matches_all(&row, predicates)? {
                removed.push(E::from_row(&row)?);
            } else {
                kept.push(row);
            }
        }
        table.rows = kept;
        Ok(removed)
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        self.snapshot = None;
        Ok(())
    }
}

fn insert_row<E: Record>(tables: &mut Tables, record: &E) -> Result<Row, StoreError> {
    let mut row = record.to_row();
    let table = tables.entry(E::TABLE).or_default();

    if let Some(auto) = E::AUTO_KEY {
        table.next_key += 1;
        row.insert(auto.to_string(), Scalar::Int(table.next_key));
    }

    let key = key_tuple(&row, E::PRIMARY_KEY)?;
    for existing in &table.rows {
        if key_tuple(existing, E::PRIMARY_KEY)? == key {
            return Err(StoreError::Conflict { table: E::TABLE });
        }
    }

    // NULL never collides under UNIQUE, matching SQL.
    for column in E::UNIQUE {
        let Some(value) = row.get(*column) else {
            continue;
        };
        if *value == Scalar::Null {
            continue;
        }
        if table
            .rows
            .iter()
            .any(|existing| existing.get(*column) == Some(value))
        {
            return Err(StoreError::Conflict { table: E::TABLE });
        }
    }

    table.rows.push(row.clone());
    Ok(row)
}

fn key_tuple(row: &Row, columns: &[&'static str]) -> Result<Vec<Scalar>, StoreError> {
    columns
        .iter()
        .map(|column| {
            row.get(*column)
                .cloned()
                .ok_or_else(|| StoreError::Decode(format!("missing key column '{column}'")))
        })
        .collect()
}

fn matches_all(row: &Row, predicates: &[Predicate]) -> Result<bool, StoreError> {
    for predicate in predicates {
        let matched = match predicate {
            Predicate::Compare { column, op, value } => match row.get(*column) {
                Some(stored) => compare(*op, stored, value)?,
                None => false,
            },
            Predicate::In { column, values } => match row.get(*column) {
                Some(stored) if *stored != Scalar::Null => values.contains(stored),
                _ => false,
            },
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn compare(op: Comparison, stored: &Scalar, operand: &Scalar) -> Result<bool, StoreError> {
    if *stored == Scalar::Null || *operand == Scalar::Null {
        return Ok(false);
    }
    match op {
        Comparison::Like => match (stored, operand) {
            (Scalar::Text(text), Scalar::Text(pattern)) => Ok(like_match(pattern, text)),
            _ => Err(StoreError::Decode(format!(
                "LIKE requires text operands, got {stored:?} and {operand:?}"
            ))),
        },
        Comparison::Eq => Ok(ordered(stored, operand)?.is_eq()),
        Comparison::Gt => Ok(ordered(stored, operand)?.is_gt()),
        Comparison::Le => Ok(ordered(stored, operand)?.is_le()),
    }
}

fn ordered(lhs: &Scalar, rhs: &Scalar) -> Result<Ordering, StoreError> {
    match (lhs, rhs) {
        (Scalar::Int(a), Scalar::Int(b)) => Ok(a.cmp(b)),
        (Scalar::Text(a), Scalar::Text(b)) => Ok(a.cmp(b)),
        (Scalar::Bytes(a), Scalar::Bytes(b)) => Ok(a.cmp(b)),
        (Scalar::Timestamp(a), Scalar::Timestamp(b)) => Ok(a.cmp(b)),
        _ => Err(StoreError::Decode(format!(
            "cannot compare {lhs:?} with {rhs:?}"
        ))),
    }
}

fn sort_rows(rows: &mut [Row], order: OrderBy) {
    rows.sort_by(|a, b| {
        let ordering = sort_key(a.get(order.column()), b.get(order.column()));
        if order.descending() {
            ordering.reverse()
        } else {
            ordering
        }
    });
}

// Total order for sorting only: NULL and absent columns sort last, as
// Postgres defaults NULLS LAST for ascending scans.
fn sort_key(lhs: Option<&Scalar>, rhs: Option<&Scalar>) -> Ordering {
    match (lhs, rhs) {
        (Some(Scalar::Null) | None, Some(Scalar::Null) | None) => Ordering::Equal,
        (Some(Scalar::Null) | None, Some(_)) => Ordering::Greater,
        (Some(_), Some(Scalar::Null) | None) => Ordering::Less,
        (Some(a), Some(b)) => ordered(a, b).unwrap_or(Ordering::Equal),
    }
}

fn like_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let mut pi = 0usize;
    let mut ti = 0usize;
    let mut resume: Option<(usize, usize)> = None;

    while ti < text.len() {
        if pi < pattern.len() && (pattern[pi] == '_' || pattern[pi] == text[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < pattern.len() && pattern[pi] == '%' {
            resume = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = resume {
            pi = star_pi + 1;
            ti = star_ti + 1;
            resume = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    while pi < pattern.len() && pattern[pi] == '%' {
        pi += 1;
    }
    pi == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Keyed, row_i64, row_opt_text, row_text};

    #[derive(Debug, Clone, PartialEq)]
    struct Gadget {
        id: i64,
        label: String,
        note: Option<String>,
    }

    impl Record for Gadget {
        const TABLE: &'static str = "gadgets";
        const PRIMARY_KEY: &'static [&'static str] = &["id"];
        const AUTO_KEY: Option<&'static str> = Some("id");
        const UNIQUE: &'static [&'static str] = &["label"];

        fn to_row(&self) -> Row {
            Row::from([
                ("id".to_string(), Scalar::Int(self.id)),
                ("label".to_string(), Scalar::from(self.label.clone())),
                ("note".to_string(), Scalar::from(self.note.clone())),
            ])
        }

        fn from_row(row: &Row) -> Result<Self, StoreError> {
            Ok(Self {
                id: row_i64(row, "id")?,
                label: row_text(row, "label")?,
                note: row_opt_text(row, "note")?,
            })
        }
    }

    impl Keyed for Gadget {
        const KEY: &'static str = "id";

        fn key(&self) -> i64 {
            self.id
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Pairing {
        a: i64,
        b: i64,
    }

    impl Record for Pairing {
        const TABLE: &'static str = "pairings";
        const PRIMARY_KEY: &'static [&'static str] = &["a", "b"];

        fn to_row(&self) -> Row {
            Row::from([
                ("a".to_string(), Scalar::Int(self.a)),
                ("b".to_string(), Scalar::Int(self.b)),
            ])
        }

        fn from_row(row: &Row) -> Result<Self, StoreError> {
            Ok(Self {
                a: row_i64(row, "a")?,
                b: row_i64(row, "b")?,
            })
        }
    }

    fn gadget(label: &str) -> Gadget {
        Gadget {
            id: 0,
            label: label.to_string(),
            note: None,
        }
    }

    #[tokio::test]
    async fn insert_assigns_sequential_keys() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.expect("begin");

        let first = tx.insert_one(&gadget("alpha")).await.expect("insert");
        let second = tx.insert_one(&gadget("beta")).await.expect("insert");
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        tx.commit().await.expect("commit");
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = MemoryStore::new();

        {
            let mut tx = store.begin().await.expect("begin");
            tx.insert_one(&gadget("ghost")).await.expect("insert");
        }

        let mut tx = store.begin().await.expect("begin");
        let total = tx.count::<Gadget>(&[]).await.expect("count");
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn committed_transaction_persists() {
        let store = MemoryStore::new();

        let mut tx = store.begin().await.expect("begin");
        tx.insert_one(&gadget("kept")).await.expect("insert");
        tx.commit().await.expect("commit");

        let mut tx = store.begin().await.expect("begin");
        let total = tx.count::<Gadget>(&[]).await.expect("count");
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn duplicate_composite_key_conflicts() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.expect("begin");

        tx.insert_one(&Pairing { a: 1, b: 2 }).await.expect("insert");
        let err = tx
            .insert_one(&Pairing { a: 1, b: 2 })
            .await
            .expect_err("duplicate should conflict");
        assert!(matches!(err, StoreError::Conflict { table: "pairings" }));
    }

    #[tokio::test]
    async fn duplicate_unique_column_conflicts() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.expect("begin");

        tx.insert_one(&gadget("taken")).await.expect("insert");
        let err = tx
            .insert_one(&gadget("taken"))
            .await
            .expect_err("duplicate label should conflict");
        assert!(matches!(err, StoreError::Conflict { table: "gadgets" }));

        let others: Vec<Gadget> = tx.find(&[], None, None).await.expect("find");
        assert_eq!(others.len(), 1);
    }

    #[tokio::test]
    async fn update_cannot_steal_a_unique_value() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.expect("begin");
        tx.insert_one(&gadget("first")).await.expect("insert");
        tx.insert_one(&gadget("second")).await.expect("insert");

        let err = tx
            .update::<Gadget>(
                &[Assign::new("label", "first")],
                &[Predicate::eq("id", 2i64)],
            )
            .await
            .expect_err("rename onto a taken label should conflict");
        assert!(matches!(err, StoreError::Conflict { table: "gadgets" }));

        let rows: Vec<Gadget> = tx
            .find(&[Predicate::eq("id", 2i64)], None, None)
            .await
            .expect("find");
        assert_eq!(rows[0].label, "second");

        let renamed = tx
            .update::<Gadget>(
                &[Assign::new("label", "third")],
                &[Predicate::eq("id", 2i64)],
            )
            .await
            .expect("rename to a free label");
        assert_eq!(renamed, 1);
    }

    #[tokio::test]
    async fn find_filters_orders_and_limits() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.expect("begin");
        for label in ["one", "two", "three", "four"] {
            tx.insert_one(&gadget(label)).await.expect("insert");
        }

        let rows: Vec<Gadget> = tx
            .find(&[Gadget::key_after(1)], Some(OrderBy::Asc("id")), Some(2))
            .await
            .expect("find");
        assert_eq!(rows.iter().map(|g| g.id).collect::<Vec<_>>(), vec![2, 3]);

        let rows: Vec<Gadget> = tx
            .find(&[], Some(OrderBy::Desc("id")), None)
            .await
            .expect("find");
        assert_eq!(
            rows.iter().map(|g| g.id).collect::<Vec<_>>(),
            vec![4, 3, 2, 1]
        );
    }

    #[tokio::test]
    async fn delete_returns_removed_rows() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.expect("begin");
        for label in ["a", "b", "c"] {
            tx.insert_one(&gadget(label)).await.expect("insert");
        }

        let removed: Vec<Gadget> = tx
            .delete_batch(&[Predicate::gt("id", 1i64)])
            .await
            .expect("delete");
        assert_eq!(removed.len(), 2);
        assert_eq!(tx.count::<Gadget>(&[]).await.expect("count"), 1);

        let none: Vec<Pairing> = tx.delete_batch(&[]).await.expect("delete");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn null_columns_never_match_predicates() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.expect("begin");
        tx.insert_one(&gadget("bare")).await.expect("insert");
        tx.insert_one(&Gadget {
            id: 0,
            label: "annotated".to_string(),
            note: Some("note".to_string()),
        })
        .await
        .expect("insert");

        let rows: Vec<Gadget> = tx
            .find(&[Predicate::eq("note", "note")], None, None)
            .await
            .expect("find");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].label, "annotated");
    }

    #[tokio::test]
    async fn empty_membership_list_matches_nothing() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.expect("begin");
        tx.insert_one(&gadget("present")).await.expect("insert");

        let rows: Vec<Gadget> = tx
            .find(&[Predicate::one_of("id", Vec::<i64>::new())], None, None)
            .await
            .expect("find");
        assert!(rows.is_empty());
    }

    #[test]
    fn like_match_covers_wildcards() {
        assert!(like_match("%", ""));
        assert!(like_match("%ob%", "Bob"));
        assert!(like_match("_ob", "Bob"));
        assert!(like_match("B%b", "Bob"));
        assert!(!like_match("bob", "Bob"));
        assert!(!like_match("B_", "Bob"));
        assert!(like_match("", ""));
        assert!(!like_match("", "x"));
    }
}
