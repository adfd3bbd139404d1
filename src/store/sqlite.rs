//! SQLite store backend.

use super::StoreBackend;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::kinds::KindSchema;
use crate::types::{IdFilter, Predicate, RequestRow, ResultRow, Row, TableSide};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task;
use tracing::{debug, info};

/// Store backed by a SQLite database file.
///
/// Every row table has the columns `TAG, RANK, REQ`, followed by the kind's
/// payload columns and finally `REQTYPE` (requests) or `PROVENANCE` (results).
/// All calls run on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .field("open", &self.conn.lock().is_some())
            .finish()
    }
}

impl SqliteStore {
    /// Open the database at `config.path`.
    pub async fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let path = config.path.clone();
        let busy_timeout = config.busy_timeout;
        let open_path = path.clone();

        let conn = task::spawn_blocking(move || {
            let conn = Connection::open(&open_path).map_err(|e| classify("open", e))?;
            conn.busy_timeout(busy_timeout)
                .map_err(|e| classify("busy_timeout", e))?;
            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(|e| StoreError::fatal("open", e))??;

        info!(path = %path.display(), "Opened SQLite store");
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Create the request and result tables for `schemas` if missing.
    pub async fn init_schema(
        &self,
        schemas: impl IntoIterator<Item = &'static KindSchema>,
    ) -> Result<(), StoreError> {
        let statements: Vec<String> = schemas
            .into_iter()
            .flat_map(|s| [create_table(s, TableSide::Requests), create_table(s, TableSide::Results)])
            .collect();
        self.with_conn(move |conn| {
            for sql in &statements {
                debug!(sql = %sql, "Creating table");
                conn.execute(sql, []).map_err(|e| classify(sql, e))?;
            }
            Ok(())
        })
        .await
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let mut guard = conn.lock();
            match guard.as_mut() {
                Some(conn) => f(conn),
                None => Err(StoreError::fatal("connection", "store closed")),
            }
        })
        .await
        .map_err(|e| StoreError::fatal("blocking task", e))?
    }
}

fn table_name(schema: &KindSchema, side: TableSide) -> &'static str {
    match side {
        TableSide::Requests => schema.request_table,
        TableSide::Results => schema.result_table,
    }
}

fn payload_columns(schema: &KindSchema, side: TableSide) -> &'static [&'static str] {
    match side {
        TableSide::Requests => schema.request_columns,
        TableSide::Results => schema.result_columns,
    }
}

fn trailing_column(side: TableSide) -> &'static str {
    match side {
        TableSide::Requests => "REQTYPE",
        TableSide::Results => "PROVENANCE",
    }
}

fn create_table(schema: &KindSchema, side: TableSide) -> String {
    let payload: Vec<String> = payload_columns(schema, side)
        .iter()
        .map(|c| format!("{c} REAL"))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {}(TAG TEXT NOT NULL, RANK INT NOT NULL, REQ INT NOT NULL, {}, {} INT)",
        table_name(schema, side),
        payload.join(", "),
        trailing_column(side),
    )
}

fn insert_statement(schema: &KindSchema, side: TableSide) -> String {
    let columns = payload_columns(schema, side);
    let placeholders = vec!["?"; columns.len() + 4].join(", ");
    format!(
        "INSERT INTO {}(TAG, RANK, REQ, {}, {}) VALUES({})",
        table_name(schema, side),
        columns.join(", "),
        trailing_column(side),
        placeholders,
    )
}

fn row_values(row: &Row) -> Vec<Value> {
    let (tag, rank, id, fields, trailing) = match row {
        Row::Request(r) => (&r.tag, r.rank, r.id, &r.fields, r.mode.code()),
        Row::Result(r) => (&r.tag, r.rank, r.id, &r.fields, r.provenance),
    };
    let mut values = Vec::with_capacity(fields.len() + 4);
    values.push(Value::Text(tag.clone()));
    values.push(Value::Integer(i64::from(rank)));
    values.push(Value::Integer(id as i64));
    values.extend(fields.iter().map(|f| Value::Real(*f)));
    values.push(Value::Integer(trailing));
    values
}

fn row_side(row: &Row) -> TableSide {
    match row {
        Row::Request(_) => TableSide::Requests,
        Row::Result(_) => TableSide::Results,
    }
}

fn select_statement(predicate: &Predicate) -> (String, Vec<Value>) {
    let schema = predicate.kind.schema();
    let side = predicate.side;
    let mut clauses = Vec::new();
    let mut params = Vec::new();

    if let Some(tag) = &predicate.tag {
        clauses.push("TAG = ?");
        params.push(Value::Text(tag.clone()));
    }
    if let Some(rank) = predicate.rank {
        clauses.push("RANK = ?");
        params.push(Value::Integer(i64::from(rank)));
    }
    match predicate.ids {
        IdFilter::Any => {}
        IdFilter::Exact(id) => {
            clauses.push("REQ = ?");
            params.push(Value::Integer(id as i64));
        }
        IdFilter::Range(lo, hi) => {
            clauses.push("REQ BETWEEN ? AND ?");
            params.push(Value::Integer(lo as i64));
            params.push(Value::Integer(hi as i64));
        }
    }

    let mut sql = format!(
        "SELECT TAG, RANK, REQ, {}, {} FROM {}",
        payload_columns(schema, side).join(", "),
        trailing_column(side),
        table_name(schema, side),
    );
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    (sql, params)
}

/// Map a SQLite error onto the retry classification.
fn classify(statement: &str, err: rusqlite::Error) -> StoreError {
    match StoreError::from(err) {
        StoreError::Fatal { reason, .. } => StoreError::fatal(statement, reason),
        other => other,
    }
}

#[async_trait]
impl StoreBackend for SqliteStore {
    async fn insert(&self, row: &Row) -> Result<(), StoreError> {
        let sql = insert_statement(row.kind().schema(), row_side(row));
        let values = row_values(row);
        self.with_conn(move |conn| {
            conn.execute(&sql, params_from_iter(values))
                .map_err(|e| classify(&sql, e))?;
            Ok(())
        })
        .await
    }

    async fn insert_all(&self, rows: &[Row]) -> Result<(), StoreError> {
        let batch: Vec<(String, Vec<Value>)> = rows
            .iter()
            .map(|row| (insert_statement(row.kind().schema(), row_side(row)), row_values(row)))
            .collect();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(|e| classify("BEGIN", e))?;
            for (sql, values) in batch {
                let mut stmt = tx.prepare_cached(&sql).map_err(|e| classify(&sql, e))?;
                stmt.execute(params_from_iter(values))
                    .map_err(|e| classify(&sql, e))?;
            }
            tx.commit().map_err(|e| classify("COMMIT", e))
        })
        .await
    }

    async fn select(&self, predicate: &Predicate) -> Result<Vec<Row>, StoreError> {
        let (sql, params) = select_statement(predicate);
        let kind = predicate.kind;
        let side = predicate.side;
        let width = payload_columns(kind.schema(), side).len();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&sql).map_err(|e| classify(&sql, e))?;
            let rows = stmt
                .query_map(params_from_iter(params), |r| {
                    let tag: String = r.get(0)?;
                    let rank: i64 = r.get(1)?;
                    let id: i64 = r.get(2)?;
                    let fields = (0..width)
                        .map(|i| r.get::<_, f64>(3 + i))
                        .collect::<rusqlite::Result<Vec<f64>>>()?;
                    let trailing: i64 = r.get(3 + width)?;
                    Ok((tag, rank, id, fields, trailing))
                })
                .map_err(|e| classify(&sql, e))?;

            let mut out = Vec::new();
            for row in rows {
                let (tag, rank, id, fields, trailing) = row.map_err(|e| classify(&sql, e))?;
                let rank = rank as u32;
                let id = id as u64;
                out.push(match side {
                    TableSide::Requests => Row::Request(RequestRow {
                        kind,
                        tag,
                        rank,
                        id,
                        fields,
                        mode: trailing
                            .try_into()
                            .map_err(|e| StoreError::fatal(sql.as_str(), e))?,
                    }),
                    TableSide::Results => Row::Result(ResultRow {
                        kind,
                        tag,
                        rank,
                        id,
                        fields,
                        provenance: trailing,
                    }),
                });
            }
            Ok(out)
        })
        .await
    }

    async fn close(&self) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let taken = conn.lock().take();
        if let Some(conn) = taken {
            task::spawn_blocking(move || conn.close().map_err(|(_, e)| classify("close", e)))
                .await
                .map_err(|e| StoreError::fatal("close", e))??;
            info!(path = %self.path.display(), "Closed SQLite store");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::{BGK_SCHEMA, LBM_SCHEMA};
    use crate::types::{KindTag, OperatingMode};

    async fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&StoreConfig::new(dir.path().join("glue.db")))
            .await
            .unwrap();
        store.init_schema([&BGK_SCHEMA, &LBM_SCHEMA]).await.unwrap();
        (dir, store)
    }

    fn lbm_request(rank: u32, id: u64) -> Row {
        Row::Request(RequestRow {
            kind: KindTag::LbmToOneDmd,
            tag: "TAG".into(),
            rank,
            id,
            fields: vec![1.5, 2.5, 3.5],
            mode: OperatingMode::Default,
        })
    }

    #[test]
    fn test_statement_shapes() {
        let create = create_table(&LBM_SCHEMA, TableSide::Results);
        assert_eq!(
            create,
            "CREATE TABLE IF NOT EXISTS LBMTOONEDMDRESULTS(TAG TEXT NOT NULL, RANK INT NOT NULL, \
             REQ INT NOT NULL, ADSORPTION REAL, PROVENANCE INT)"
        );
        let insert = insert_statement(&LBM_SCHEMA, TableSide::Requests);
        assert!(insert.starts_with("INSERT INTO LBMTOONEDMDREQS(TAG, RANK, REQ, DISTANCE"));
        assert!(insert.ends_with("VALUES(?, ?, ?, ?, ?, ?, ?)"));

        let (sql, params) = select_statement(&Predicate::results(
            KindTag::Bgk,
            "TAG",
            3,
            IdFilter::Range(10, 20),
        ));
        assert!(sql.contains("FROM BGKRESULTS WHERE TAG = ? AND RANK = ? AND REQ BETWEEN ? AND ?"));
        assert_eq!(params.len(), 4);
    }

    #[tokio::test]
    async fn test_insert_and_select_round_trip() {
        let (_dir, store) = open_temp().await;
        store.insert(&lbm_request(0, 7)).await.unwrap();
        store
            .insert_all(&[lbm_request(1, 0), lbm_request(1, 1)])
            .await
            .unwrap();

        let rows = store
            .select(&Predicate::all_requests(KindTag::LbmToOneDmd))
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.contains(&lbm_request(0, 7)));
    }

    #[tokio::test]
    async fn test_result_range_query() {
        let (_dir, store) = open_temp().await;
        for id in 0..5 {
            store
                .insert(&Row::Result(ResultRow {
                    kind: KindTag::LbmToOneDmd,
                    tag: "TAG".into(),
                    rank: 2,
                    id,
                    fields: vec![id as f64 * 0.5],
                    provenance: OperatingMode::Analytic.code(),
                }))
                .await
                .unwrap();
        }

        let rows = store
            .select(&Predicate::results(
                KindTag::LbmToOneDmd,
                "TAG",
                2,
                IdFilter::Range(1, 3),
            ))
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_table_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&StoreConfig::new(dir.path().join("empty.db")))
            .await
            .unwrap();
        let err = store.insert(&lbm_request(0, 0)).await.unwrap_err();
        assert!(matches!(err, StoreError::Fatal { .. }));
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let (_dir, store) = open_temp().await;
        store.close().await.unwrap();
        assert!(store
            .select(&Predicate::all_requests(KindTag::Bgk))
            .await
            .is_err());
    }
}
