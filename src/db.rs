use anyhow::anyhow;
use once_cell::sync::Lazy;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::PgRow;
use sqlx::{Column as _, PgPool, Postgres, QueryBuilder, Row as _, Transaction, TypeInfo as _};

use crate::store::{
    Assign, Comparison, OrderBy, Predicate, Record, Row, Scalar, Store, StoreError, StoreTx,
};

pub static MIGRATOR: Lazy<Migrator> = Lazy::new(|| {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
});

pub async fn create_rulebook_tables(pool: &PgPool) -> std::result::Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Postgres-backed store. Table and column names reaching the SQL text are
/// `Record` consts, never caller input; caller values always travel as binds.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Store for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, StoreError> {
        let tx = self.pool.begin().await.map_err(backend)?;
        Ok(PgTx { tx })
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

impl StoreTx for PgTx {
    async fn find<E: Record>(
        &mut self,
        predicates: &[Predicate],
        order: Option<OrderBy>,
        limit: Option<u32>,
    ) -> Result<Vec<E>, StoreError> {
        let mut builder = QueryBuilder::new("SELECT * FROM ");
        builder.push(E::TABLE);
        push_predicates(&mut builder, predicates);
        if let Some(order) = order {
            builder.push(" ORDER BY ");
            builder.push(order.column());
            builder.push(if order.descending() { " DESC" } else { " ASC" });
        }
        if let Some(limit) = limit {
            builder.push(" LIMIT ");
            builder.push_bind(i64::from(limit));
        }

        let rows = builder
            .build()
            .fetch_all(&mut *self.tx)
            .await
            .map_err(backend)?;
        records_from(&rows)
    }

    async fn count<E: Record>(&mut self, predicates: &[Predicate]) -> Result<u64, StoreError> {
        let mut builder = QueryBuilder::new("SELECT COUNT(*) FROM ");
        builder.push(E::TABLE);
        push_predicates(&mut builder, predicates);

        let row = builder
            .build()
            .fetch_one(&mut *self.tx)
            .await
            .map_err(backend)?;
        let total: i64 = row
            .try_get(0)
            .map_err(|err| StoreError::Decode(format!("count on {}: {err}", E::TABLE)))?;
        Ok(total as u64)
    }

    async fn insert_one<E: Record>(&mut self, record: &E) -> Result<E, StoreError> {
        let row = record.to_row();
        let columns = insert_columns::<E>(&row);

        let mut builder = QueryBuilder::new("INSERT INTO ");
        builder.push(E::TABLE);
        builder.push(" (");
        builder.push(columns.join(", "));
        builder.push(") VALUES (");
        {
            let mut values = builder.separated(", ");
            for column in &columns {
                match row.get(column.as_str()) {
                    Some(Scalar::Int(v)) => {
                        values.push_bind(*v);
                    }
                    Some(Scalar::Text(v)) => {
                        values.push_bind(v.clone());
                    }
                    Some(Scalar::Bytes(v)) => {
                        values.push_bind(v.clone());
                    }
                    Some(Scalar::Timestamp(v)) => {
                        values.push_bind(*v);
                    }
                    Some(Scalar::Null) | None => {
                        values.push("NULL");
                    }
                }
            }
        }
        builder.push(") RETURNING *");

        let stored = builder
            .build()
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|err| write_err(E::TABLE, err))?;
        E::from_row(&decode_row(&stored)?)
    }

    async fn insert_batch<E: Record>(&mut self, records: &[E]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let rows: Vec<Row> = records.iter().map(Record::to_row).collect();
        let columns = insert_columns::<E>(&rows[0]);

        let mut builder = QueryBuilder::new("INSERT INTO ");
        builder.push(E::TABLE);
        builder.push(" (");
        builder.push(columns.join(", "));
        builder.push(") ");
        builder.push_values(rows.iter(), |mut values, row| {
            for column in &columns {
                match row.get(column.as_str()) {
                    Some(Scalar::Int(v)) => {
                        values.push_bind(*v);
                    }
                    Some(Scalar::Text(v)) => {
                        values.push_bind(v.clone());
                    }
                    Some(Scalar::Bytes(v)) => {
                        values.push_bind(v.clone());
                    }
                    Some(Scalar::Timestamp(v)) => {
                        values.push_bind(*v);
                    }
                    Some(Scalar::Null) | None => {
                        values.push("NULL");
                    }
                }
            }
        });

        builder
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(|err| write_err(E::TABLE, err))?;
        Ok(())
    }

    async fn update<E: Record>(
        &mut self,
        changes: &[Assign],
        predicates: &[Predicate],
    ) -> Result<u64, StoreError> {
        if changes.is_empty() {
            return Ok(0);
        }

        let mut builder = QueryBuilder::new("UPDATE ");
        builder.push(E::TABLE);
        builder.push(" SET ");
        {
            let mut assignments = builder.separated(", ");
            for change in changes {
                assignments.push(change.column);
                assignments.push_unseparated(" = ");
                match &change.value {
                    Scalar::Int(v) => {
                        assignments.push_bind_unseparated(*v);
                    }
                    Scalar::Text(v) => {
                        assignments.push_bind_unseparated(v.clone());
                    }
                    Scalar::Bytes(v) => {
                        assignments.push_bind_unseparated(v.clone());
                    }
                    Scalar::Timestamp(v) => {
                        assignments.push_bind_unseparated(*v);
                    }
                    Scalar::Null => {
                        assignments.push_unseparated("NULL");
                    }
                }
            }
        }
        push_predicates(&mut builder, predicates);

        let result = builder
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(|err| write_err(E::TABLE, err))?;
        Ok(result.rows_affected())
    }

    async fn delete_batch<E: Record>(
        &mut self,
        predicates: &[Predicate],
    ) -> Result<Vec<E>, StoreError> {
        let mut builder = QueryBuilder::new("DELETE FROM ");
        builder.push(E::TABLE);
        push_predicates(&mut builder, predicates);
        builder.push(" RETURNING *");

        let rows = builder
            .build()
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|err| write_err(E::TABLE, err))?;
        records_from(&rows)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(backend)
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(anyhow!(err))
}

fn write_err(table: &'static str, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            StoreError::Conflict { table }
        }
        _ => backend(err),
    }
}

fn insert_columns<E: Record>(row: &Row) -> Vec<String> {
    row.keys()
        .filter(|column| Some(column.as_str()) != E::AUTO_KEY)
        .cloned()
        .collect()
}

fn push_predicates(builder: &mut QueryBuilder<'_, Postgres>, predicates: &[Predicate]) {
    for (idx, predicate) in predicates.iter().enumerate() {
        builder.push(if idx == 0 { " WHERE " } else { " AND " });
        match predicate {
            Predicate::Compare { column, op, value } => {
                builder.push(*column);
                builder.push(match op {
                    Comparison::Eq => " = ",
                    Comparison::Gt => " > ",
                    Comparison::Le => " <= ",
                    Comparison::Like => " LIKE ",
                });
                push_scalar(builder, value);
            }
            Predicate::In { column, values } => {
                // NULL elements can never match, so they render away; an
                // empty list matches nothing.
                let values: Vec<&Scalar> = values
                    .iter()
                    .filter(|value| **value != Scalar::Null)
                    .collect();
                if values.is_empty() {
                    builder.push("FALSE");
                    continue;
                }
                builder.push(*column);
                builder.push(" IN (");
                {
                    let mut elements = builder.separated(", ");
                    for value in values {
                        match value {
                            Scalar::Int(v) => {
                                elements.push_bind(*v);
                            }
                            Scalar::Text(v) => {
                                elements.push_bind(v.clone());
                            }
                            Scalar::Bytes(v) => {
                                elements.push_bind(v.clone());
                            }
                            Scalar::Timestamp(v) => {
                                elements.push_bind(*v);
                            }
                            Scalar::Null => {}
                        }
                    }
                }
                builder.push(")");
            }
        }
    }
}

fn push_scalar(builder: &mut QueryBuilder<'_, Postgres>, value: &Scalar) {
    match value {
        Scalar::Int(v) => builder.push_bind(*v),
        Scalar::Text(v) => builder.push_bind(v.clone()),
        Scalar::Bytes(v) => builder.push_bind(v.clone()),
        Scalar::Timestamp(v) => builder.push_bind(*v),
        Scalar::Null => builder.push("NULL"),
    };
}

fn records_from<E: Record>(rows: &[PgRow]) -> Result<Vec<E>, StoreError> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(E::from_row(&decode_row(row)?)?);
    }
    Ok(out)
}

fn decode_row(row: &PgRow) -> Result<Row, StoreError> {
    let mut out = Row::new();
    for column in row.columns() {
        let name = column.name();
        let scalar = match column.type_info().name() {
            "INT8" => row
                .try_get::<Option<i64>, _>(name)
                .map(|value| value.map_or(Scalar::Null, Scalar::Int)),
            "INT4" | "INT2" => row
                .try_get::<Option<i32>, _>(name)
                .map(|value| value.map_or(Scalar::Null, |v| Scalar::Int(i64::from(v)))),
            "TEXT" | "VARCHAR" => row
                .try_get::<Option<String>, _>(name)
                .map(|value| value.map_or(Scalar::Null, Scalar::Text)),
            "BYTEA" => row
                .try_get::<Option<Vec<u8>>, _>(name)
                .map(|value| value.map_or(Scalar::Null, Scalar::Bytes)),
            "TIMESTAMP" => row
                .try_get::<Option<chrono::NaiveDateTime>, _>(name)
                .map(|value| value.map_or(Scalar::Null, Scalar::Timestamp)),
            other => {
                return Err(StoreError::Decode(format!(
                    "column '{name}' has unsupported type {other}"
                )));
            }
        }
        .map_err(|err| StoreError::Decode(format!("column '{name}': {err}")))?;
        out.insert(name.to_string(), scalar);
    }
    Ok(out)
}
