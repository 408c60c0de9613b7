//! Database sessions over a dedicated MySQL connection.
//!
//! Each session owns exactly one `MySqlConnection`, so statements from one
//! browser session never interleave with another's transaction state. Rows
//! come back as JSON objects keyed by column name with a best-effort decode
//! of whatever types the statement produced.

use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{Column, ConnectOptions, Connection, Row};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{BackendEvent, BackendSession, DbTarget, SessionKind, CHANNEL_CAPACITY};
use crate::config::Config;
use crate::error::SessionError;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DbOp {
    Query {
        statement: String,
        #[serde(default)]
        params: Vec<Value>,
    },
    Schema,
}

pub struct DbSession {
    cmd_tx: mpsc::Sender<DbOp>,
    cancel: CancellationToken,
}

impl BackendSession for DbSession {
    fn kind(&self) -> SessionKind {
        SessionKind::Database
    }

    fn send(&self, payload: Value) -> Result<(), SessionError> {
        let op: DbOp = serde_json::from_value(payload)
            .map_err(|e| SessionError::Backend(format!("invalid database operation: {e}")))?;
        if let DbOp::Query { ref params, .. } = op {
            validate_params(params).map_err(SessionError::Backend)?;
        }
        self.cmd_tx
            .try_send(op)
            .map_err(|_| SessionError::Backend("database operation queue full".to_string()))
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// Connect to the target database and spawn the statement worker.
pub async fn open(
    target: DbTarget,
    config: &Config,
) -> Result<(DbSession, mpsc::Receiver<BackendEvent>), SessionError> {
    let mut options = MySqlConnectOptions::new()
        .host(&target.host)
        .port(target.port)
        .username(&target.user)
        .database(&target.database);
    if let Some(ref password) = target.password {
        options = options.password(password);
    }

    let conn = tokio::time::timeout(
        std::time::Duration::from_secs(config.server.connect_timeout_secs),
        options.connect(),
    )
    .await
    .map_err(|_| {
        SessionError::OpenFailed(format!(
            "connection to {}:{} timed out",
            target.host, target.port
        ))
    })?
    .map_err(|e| SessionError::OpenFailed(format!("database connect failed: {e}")))?;

    let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();

    let database = target.database.clone();
    tokio::spawn(run_worker(conn, database, cmd_rx, event_tx, cancel.clone()));

    Ok((DbSession { cmd_tx, cancel }, event_rx))
}

async fn run_worker(
    mut conn: MySqlConnection,
    database: String,
    mut cmd_rx: mpsc::Receiver<DbOp>,
    event_tx: mpsc::Sender<BackendEvent>,
    cancel: CancellationToken,
) {
    loop {
        let op = tokio::select! {
            () = cancel.cancelled() => break,
            op = cmd_rx.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        let event = match op {
            DbOp::Query { statement, params } => {
                match run_query(&mut conn, &statement, &params).await {
                    Ok(result) => BackendEvent::Data(result),
                    Err(e) if is_fatal(&e) => BackendEvent::Fatal {
                        reason: format!("database connection lost: {e}"),
                    },
                    Err(e) => BackendEvent::OpError {
                        operation: "query",
                        path: None,
                        reason: format!("{e} (statement: {})", truncate_statement(&statement)),
                    },
                }
            }
            DbOp::Schema => match run_schema(&mut conn, &database).await {
                Ok(result) => BackendEvent::Data(result),
                Err(e) if is_fatal(&e) => BackendEvent::Fatal {
                    reason: format!("database connection lost: {e}"),
                },
                Err(e) => BackendEvent::OpError {
                    operation: "schema",
                    path: None,
                    reason: e.to_string(),
                },
            },
        };

        let fatal = matches!(event, BackendEvent::Fatal { .. });
        if event_tx.send(event).await.is_err() || fatal {
            break;
        }
    }

    debug!("database worker stopping");
    let _ = conn.close().await;
    let _ = event_tx.send(BackendEvent::Closed).await;
}

async fn run_query(
    conn: &mut MySqlConnection,
    statement: &str,
    params: &[Value],
) -> Result<Value, sqlx::Error> {
    let mut query = sqlx::query(statement);
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    query.bind(i)
                } else {
                    query.bind(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => query.bind(s.as_str()),
            // validate_params rejected these before enqueue
            Value::Array(_) | Value::Object(_) => query,
        };
    }

    let rows = query.fetch_all(conn).await?;
    let columns: Vec<String> = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let decoded: Vec<Value> = rows.iter().map(decode_row).collect();
    let row_count = decoded.len();

    Ok(json!({
        "op": "query",
        "columns": columns,
        "rows": decoded,
        "row_count": row_count,
    }))
}

async fn run_schema(conn: &mut MySqlConnection, database: &str) -> Result<Value, sqlx::Error> {
    // MySQL uppercases information_schema column names unless aliased.
    let table_rows = sqlx::query(
        "SELECT TABLE_NAME AS table_name FROM information_schema.tables \
         WHERE table_schema = ? ORDER BY TABLE_NAME",
    )
    .bind(database)
    .fetch_all(&mut *conn)
    .await?;

    let mut tables = Vec::with_capacity(table_rows.len());
    for table_row in &table_rows {
        let table: String = table_row.try_get("table_name")?;
        let column_rows = sqlx::query(
            "SELECT COLUMN_NAME AS column_name, COLUMN_TYPE AS column_type, \
                    IS_NULLABLE AS is_nullable, COLUMN_KEY AS column_key, \
                    COLUMN_DEFAULT AS column_default \
             FROM information_schema.columns \
             WHERE table_schema = ? AND table_name = ? ORDER BY ORDINAL_POSITION",
        )
        .bind(database)
        .bind(&table)
        .fetch_all(&mut *conn)
        .await?;

        let columns: Vec<Value> = column_rows
            .iter()
            .map(|row| {
                let nullable: String = row.try_get("is_nullable").unwrap_or_default();
                let key: String = row.try_get("column_key").unwrap_or_default();
                json!({
                    "name": row.try_get::<String, _>("column_name").unwrap_or_default(),
                    "type": row.try_get::<String, _>("column_type").unwrap_or_default(),
                    "nullable": nullable == "YES",
                    "primary": key == "PRI",
                    "default": row.try_get::<Option<String>, _>("column_default").unwrap_or(None),
                })
            })
            .collect();

        tables.push(json!({ "name": table, "columns": columns }));
    }

    Ok(json!({ "op": "schema", "database": database, "tables": tables }))
}

/// Decode one row into a JSON object, trying the common MySQL types in
/// order and falling back to base64 bytes, then null.
fn decode_row(row: &MySqlRow) -> Value {
    let mut object = Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_string(), decode_column(row, idx));
    }
    Value::Object(object)
}

fn decode_column(row: &MySqlRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
        return v.map_or(Value::Null, |dt| Value::from(dt.to_string()));
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
        return v.map_or(Value::Null, |d| Value::from(d.to_string()));
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v.map_or(Value::Null, |bytes| {
            Value::from(base64::engine::general_purpose::STANDARD.encode(bytes))
        });
    }
    Value::Null
}

/// Only JSON scalars can bind as statement parameters.
fn validate_params(params: &[Value]) -> Result<(), String> {
    for (idx, param) in params.iter().enumerate() {
        if matches!(param, Value::Array(_) | Value::Object(_)) {
            return Err(format!("parameter {idx} must be a scalar"));
        }
    }
    Ok(())
}

fn is_fatal(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolClosed
    )
}

/// Statements can be huge; error payloads only carry a prefix.
fn truncate_statement(statement: &str) -> String {
    const MAX: usize = 100;
    if statement.chars().count() <= MAX {
        statement.to_string()
    } else {
        let prefix: String = statement.chars().take(MAX).collect();
        format!("{prefix}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn db_op_wire_shapes() {
        let op: DbOp = serde_json::from_value(json!({
            "op": "query", "statement": "SELECT 1", "params": [1, "a", null, true],
        }))
        .unwrap();
        match op {
            DbOp::Query { statement, params } => {
                assert_eq!(statement, "SELECT 1");
                assert_eq!(params.len(), 4);
            }
            DbOp::Schema => panic!("wrong op"),
        }

        assert!(matches!(
            serde_json::from_value::<DbOp>(json!({"op": "schema"})).unwrap(),
            DbOp::Schema
        ));
    }

    #[test]
    fn params_default_to_empty() {
        let op: DbOp =
            serde_json::from_value(json!({"op": "query", "statement": "SELECT 1"})).unwrap();
        match op {
            DbOp::Query { params, .. } => assert!(params.is_empty()),
            DbOp::Schema => panic!("wrong op"),
        }
    }

    #[test]
    fn scalar_params_validate() {
        assert!(validate_params(&[json!(1), json!("x"), json!(null), json!(2.5)]).is_ok());
        assert!(validate_params(&[json!([1, 2])]).is_err());
        assert!(validate_params(&[json!({"a": 1})]).is_err());
    }

    #[test]
    fn long_statements_truncate_in_errors() {
        let statement = "SELECT ".to_string() + &"x".repeat(200);
        let shown = truncate_statement(&statement);
        assert_eq!(shown.chars().count(), 103);
        assert!(shown.ends_with("..."));
        assert_eq!(truncate_statement("SELECT 1"), "SELECT 1");
    }
}
