use std::collections::HashSet;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::{LibError, Result};
use crate::store::{Edge, Predicate, Store, StoreError, StoreTx};

/// Membership changes for one left-hand key. A key may not appear on both sides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDelta {
    pub add: Vec<i64>,
    pub remove: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedDelta {
    pub add: Vec<i64>,
    pub remove: Vec<i64>,
}

impl EdgeDelta {
    /// Repeated ids collapse to their first occurrence; an id on both sides
    /// fails with every offender listed. Runs before any storage access.
    pub fn normalize(self) -> Result<CheckedDelta> {
        let add = dedupe(self.add);
        let remove = dedupe(self.remove);

        let add_set: HashSet<i64> = add.iter().copied().collect();
        let conflicts: Vec<i64> = remove
            .iter()
            .copied()
            .filter(|id| add_set.contains(id))
            .collect();
        if !conflicts.is_empty() {
            return Err(LibError::add_remove_overlap(conflicts));
        }

        Ok(CheckedDelta { add, remove })
    }
}

fn dedupe(ids: Vec<i64>) -> Vec<i64> {
    let mut seen = HashSet::with_capacity(ids.len());
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if seen.insert(id) {
            out.push(id);
        }
    }
    out
}

/// Targets already present (or already absent) don't appear.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub added: Vec<i64>,
    pub removed: Vec<i64>,
}

/// A concurrent insert of the same pair surfaces as a retryable conflict.
pub async fn reconcile<E: Edge, S: Store>(
    store: &S,
    left: i64,
    delta: EdgeDelta,
) -> Result<ReconcileOutcome> {
    let delta = delta.normalize()?;
    let mut tx = store
        .begin()
        .await
        .map_err(|err| apply_err("begin", E::TABLE, err))?;
    let outcome = reconcile_tx::<E, _>(&mut tx, left, &delta).await?;
    tx.commit()
        .await
        .map_err(|err| apply_err("commit", E::TABLE, err))?;
    Ok(outcome)
}

/// `added` reports only rows this call inserted; existing pairs are
/// filtered out first.
pub async fn reconcile_tx<E: Edge, T: StoreTx>(
    tx: &mut T,
    left: i64,
    delta: &CheckedDelta,
) -> Result<ReconcileOutcome> {
    let mut outcome = ReconcileOutcome::default();

    if !delta.add.is_empty() {
        let present: Vec<E> = tx
            .find(
                &[
                    Predicate::eq(E::LEFT, left),
                    Predicate::one_of(E::RIGHT, delta.add.iter().copied()),
                ],
                None,
                None,
            )
            .await
            .map_err(|err| apply_err("find existing", E::TABLE, err))?;
        let present: HashSet<i64> = present.iter().map(Edge::right).collect();

        let fresh: Vec<E> = delta
            .add
            .iter()
            .copied()
            .filter(|right| !present.contains(right))
            .map(|right| E::join(left, right))
            .collect();
        if !fresh.is_empty() {
            tx.insert_batch(&fresh)
                .await
                .map_err(|err| apply_err("insert", E::TABLE, err))?;
        }
        outcome.added = fresh.iter().map(Edge::right).collect();
    }

    if !delta.remove.is_empty() {
        let removed: Vec<E> = tx
            .delete_batch(&[
                Predicate::eq(E::LEFT, left),
                Predicate::one_of(E::RIGHT, delta.remove.iter().copied()),
            ])
            .await
            .map_err(|err| apply_err("delete", E::TABLE, err))?;
        outcome.removed = removed.iter().map(Edge::right).collect();
    }

    Ok(outcome)
}

fn apply_err(stage: &'static str, table: &'static str, err: StoreError) -> LibError {
    // Conflicts keep their own code so callers can retry them.
    if matches!(err, StoreError::Conflict { .. }) {
        return LibError::from(err);
    }
    LibError::database(
        "Failed to apply relation changes",
        anyhow!(err).context(format!("{stage} on {table}")),
    )
}
