use anyhow::anyhow;
use serde::Serialize;

use crate::error::{LibError, Result};
use crate::models::PageArgs;
use crate::store::{Keyed, OrderBy, Predicate, Store, StoreError, StoreTx};

/// Rows strictly after `after` in key order, at most `limit` (`0` caps nothing).
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub after: i64,
    pub limit: u32,
    pub filters: Vec<Predicate>,
}

impl PageRequest {
    pub fn new(after: i64, limit: u32) -> Self {
        Self {
            after,
            limit,
            filters: Vec::new(),
        }
    }

    pub fn filtered(mut self, predicate: Predicate) -> Self {
        self.filters.push(predicate);
        self
    }
}

impl From<PageArgs> for PageRequest {
    fn from(args: PageArgs) -> Self {
        Self::new(args.after, args.limit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub has_previous_page: bool,
    pub has_next_page: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_cursor: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_cursor: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub rows: Vec<T>,
    pub info: PageInfo,
}

pub async fn read_page<E: Keyed, S: Store>(store: &S, request: &PageRequest) -> Result<Page<E>> {
    let mut tx = store
        .begin()
        .await
        .map_err(|err| read_err("begin", E::TABLE, err))?;
    let page = read_page_tx(&mut tx, request).await?;
    tx.commit()
        .await
        .map_err(|err| read_err("commit", E::TABLE, err))?;
    Ok(page)
}

/// The window select and both boundary counts run in the caller's transaction.
/// `has_previous_page` counts rows at or before the requested cursor, not the
/// first returned row.
pub async fn read_page_tx<E: Keyed, T: StoreTx>(
    tx: &mut T,
    request: &PageRequest,
) -> Result<Page<E>> {
    let mut window = request.filters.clone();
    window.push(E::key_after(request.after));
    let limit = (request.limit > 0).then_some(request.limit);

    let rows: Vec<E> = tx
        .find(&window, Some(OrderBy::Asc(E::KEY)), limit)
        .await
        .map_err(|err| read_err("window select", E::TABLE, err))?;

    let mut behind = request.filters.clone();
    behind.push(E::key_at_or_before(request.after));
    let previous = tx
        .count::<E>(&behind)
        .await
        .map_err(|err| read_err("previous count", E::TABLE, err))?;

    let next = match rows.last() {
        None => 0,
        Some(last) => {
            let mut ahead = request.filters.clone();
            ahead.push(last.after());
            tx.count::<E>(&ahead)
                .await
                .map_err(|err| read_err("next count", E::TABLE, err))?
        }
    };

    let info = PageInfo {
        has_previous_page: previous > 0,
        has_next_page: next > 0,
        start_cursor: rows.first().map(Keyed::key),
        end_cursor: rows.last().map(Keyed::key),
    };

    Ok(Page { rows, info })
}

fn read_err(stage: &'static str, table: &'static str, err: StoreError) -> LibError {
    LibError::database(
        "Failed to read page",
        anyhow!(err).context(format!("{stage} on {table}")),
    )
}
