use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated on {table}")]
    Conflict { table: &'static str },
    #[error("row decode failed: {0}")]
    Decode(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// `Null` only appears for nullable columns; predicates never match it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scalar {
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(NaiveDateTime),
    Null,
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&[u8]> for Scalar {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for Scalar {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<NaiveDateTime> for Scalar {
    fn from(value: NaiveDateTime) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(inner) => inner.into(),
            None => Self::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Gt,
    Le,
    Like,
}

/// Column names are `Record` constants, never caller input.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        column: &'static str,
        op: Comparison,
        value: Scalar,
    },
    In {
        column: &'static str,
        values: Vec<Scalar>,
    },
}

impl Predicate {
    pub fn eq(column: &'static str, value: impl Into<Scalar>) -> Self {
        Self::Compare {
            column,
            op: Comparison::Eq,
            value: value.into(),
        }
    }

    pub fn gt(column: &'static str, value: impl Into<Scalar>) -> Self {
        Self::Compare {
            column,
            op: Comparison::Gt,
            value: value.into(),
        }
    }

    pub fn le(column: &'static str, value: impl Into<Scalar>) -> Self {
        Self::Compare {
            column,
            op: Comparison::Le,
            value: value.into(),
        }
    }

    pub fn like(column: &'static str, pattern: impl Into<String>) -> Self {
        Self::Compare {
            column,
            op: Comparison::Like,
            value: Scalar::Text(pattern.into()),
        }
    }

    /// An empty list matches no rows.
    pub fn one_of<T: Into<Scalar>>(
        column: &'static str,
        values: impl IntoIterator<Item = T>,
    ) -> Self {
        Self::In {
            column,
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    Asc(&'static str),
    Desc(&'static str),
}

impl OrderBy {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Asc(column) | Self::Desc(column) => column,
        }
    }

    pub fn descending(&self) -> bool {
        matches!(self, Self::Desc(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assign {
    pub column: &'static str,
    pub value: Scalar,
}

impl Assign {
    pub fn new(column: &'static str, value: impl Into<Scalar>) -> Self {
        Self {
            column,
            value: value.into(),
        }
    }
}

pub type Row = BTreeMap<String, Scalar>;

fn require<'a>(row: &'a Row, column: &str) -> Result<&'a Scalar, StoreError> {
    row.get(column)
        .ok_or_else(|| StoreError::Decode(format!("missing column '{column}'")))
}

pub fn row_i64(row: &Row, column: &str) -> Result<i64, StoreError> {
    match require(row, column)? {
        Scalar::Int(value) => Ok(*value),
        other => Err(StoreError::Decode(format!(
            "column '{column}' is not an integer: {other:?}"
        ))),
    }
}

pub fn row_text(row: &Row, column: &str) -> Result<String, StoreError> {
    match require(row, column)? {
        Scalar::Text(value) => Ok(value.clone()),
        other => Err(StoreError::Decode(format!(
            "column '{column}' is not text: {other:?}"
        ))),
    }
}

pub fn row_opt_text(row: &Row, column: &str) -> Result<Option<String>, StoreError> {
    match require(row, column)? {
        Scalar::Text(value) => Ok(Some(value.clone())),
        Scalar::Null => Ok(None),
        other => Err(StoreError::Decode(format!(
            "column '{column}' is not nullable text: {other:?}"
        ))),
    }
}

pub fn row_bytes(row: &Row, column: &str) -> Result<Vec<u8>, StoreError> {
    match require(row, column)? {
        Scalar::Bytes(value) => Ok(value.clone()),
        other => Err(StoreError::Decode(format!(
            "column '{column}' is not bytes: {other:?}"
        ))),
    }
}

pub fn row_timestamp(row: &Row, column: &str) -> Result<NaiveDateTime, StoreError> {
    match require(row, column)? {
        Scalar::Timestamp(value) => Ok(*value),
        other => Err(StoreError::Decode(format!(
            "column '{column}' is not a timestamp: {other:?}"
        ))),
    }
}

/// `AUTO_KEY` names a serial column the store assigns on insert; `UNIQUE`
/// lists single-column unique constraints beyond the primary key.
pub trait Record: Clone + Send + Sync + 'static {
    const TABLE: &'static str;
    const PRIMARY_KEY: &'static [&'static str];
    const AUTO_KEY: Option<&'static str> = None;
    const UNIQUE: &'static [&'static str] = &[];

    fn to_row(&self) -> Row;
    fn from_row(row: &Row) -> Result<Self, StoreError>;
}

pub trait Keyed: Record {
    const KEY: &'static str;

    fn key(&self) -> i64;

    fn key_after(key: i64) -> Predicate {
        Predicate::gt(Self::KEY, key)
    }

    fn key_at_or_before(key: i64) -> Predicate {
        Predicate::le(Self::KEY, key)
    }

    fn after(&self) -> Predicate {
        Self::key_after(self.key())
    }

    fn at_or_before(&self) -> Predicate {
        Self::key_at_or_before(self.key())
    }
}

pub trait Edge: Record {
    const LEFT: &'static str;
    const RIGHT: &'static str;

    fn join(left: i64, right: i64) -> Self;
    fn left(&self) -> i64;
    fn right(&self) -> i64;
}

pub trait Store: Send + Sync {
    type Tx: StoreTx;

    fn begin(&self) -> impl Future<Output = Result<Self::Tx, StoreError>> + Send;
}

/// Dropping an open transaction without `commit` rolls back.
pub trait StoreTx: Send + Sized {
    fn find<E: Record>(
        &mut self,
        predicates: &[Predicate],
        order: Option<OrderBy>,
        limit: Option<u32>,
    ) -> impl Future<Output = Result<Vec<E>, StoreError>> + Send;

    fn count<E: Record>(
        &mut self,
        predicates: &[Predicate],
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Returns the row as stored, auto key included.
    fn insert_one<E: Record>(&mut self, record: &E)
    -> impl Future<Output = Result<E, StoreError>> + Send;

    fn insert_batch<E: Record>(
        &mut self,
        records: &[E],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn update<E: Record>(
        &mut self,
        changes: &[Assign],
        predicates: &[Predicate],
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    fn delete_batch<E: Record>(
        &mut self,
        predicates: &[Predicate],
    ) -> impl Future<Output = Result<Vec<E>, StoreError>> + Send;

    fn commit(self) -> impl Future<Output = Result<(), StoreError>> + Send;
}
