//! SQLite-backed query source. Also accepts statements from `sql` actions.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, InterruptHandle, OpenFlags};
use serde_json::{Number, Value};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{Record, Source, WritableSource};
use crate::context::Context;
use crate::resilience::{BreakerSnapshot, Resilience};
use crate::types::{Error, Result, SourceConfig};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// Per-call progress, shared between the caller and its blocking task.
const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const ABANDONED: u8 = 3;

type Slot = Arc<Mutex<Option<Connection>>>;
type InterruptSlot = Arc<Mutex<Option<InterruptHandle>>>;

pub struct SqlSource {
    name: String,
    dsn: String,
    query: String,
    conn: Slot,
    interrupt: InterruptSlot,
    policy: Resilience,
}

impl SqlSource {
    pub fn new(name: &str, config: &SourceConfig, policy: Resilience) -> Result<Self> {
        let query = config
            .query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| Error::config(format!("source {name:?}: query is required")))?;
        let dsn = config
            .dsn
            .as_deref()
            .or_else(|| config.option("dsn"))
            .filter(|d| !d.is_empty())
            .ok_or_else(|| {
                Error::config(format!("source {name:?}: database connection required (dsn)"))
            })?;

        Ok(Self {
            name: name.to_string(),
            dsn: dsn.to_string(),
            query: query.to_string(),
            conn: Arc::new(Mutex::new(None)),
            interrupt: Arc::new(Mutex::new(None)),
            policy,
        })
    }

    /// Run `op` on the blocking pool against the (lazily opened) connection.
    ///
    /// Dropping the returned future interrupts the statement only while this
    /// call holds the connection. A call dropped while still queued behind
    /// another statement never runs, and leaves that statement alone.
    async fn with_connection<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let slot = self.conn.clone();
        let interrupt = self.interrupt.clone();
        let dsn = self.dsn.clone();
        let name = self.name.clone();
        let progress = Arc::new(AtomicU8::new(QUEUED));

        let _guard = InterruptOnDrop {
            handle: self.interrupt.clone(),
            progress: Arc::clone(&progress),
        };
        tokio::task::spawn_blocking(move || {
            let mut conn = slot.lock();
            if progress
                .compare_exchange(QUEUED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(Error::cancelled(name));
            }
            let result = match conn.as_mut() {
                Some(c) => op(c),
                None => open_connection(&name, &dsn).and_then(|opened| {
                    *interrupt.lock() = Some(opened.get_interrupt_handle());
                    op(conn.insert(opened))
                }),
            };
            // Marked done under the interrupt lock, before the slot is released.
            let _handle = interrupt.lock();
            progress.store(DONE, Ordering::SeqCst);
            result
        })
        .await
        .map_err(|e| Error::internal(format!("sql task failed: {e}")))?
    }

    async fn query_once(&self) -> Result<Vec<Record>> {
        let name = self.name.clone();
        let query = self.query.clone();
        self.with_connection(move |conn| query_records(&name, conn, &query, &[]))
            .await
    }
}

#[async_trait]
impl Source for SqlSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, ctx: &Context) -> Result<Vec<Record>> {
        self.policy.call(ctx, || self.query_once()).await
    }

    async fn close(&self) -> Result<()> {
        let slot = self.conn.clone();
        self.interrupt.lock().take();
        tokio::task::spawn_blocking(move || {
            if let Some(conn) = slot.lock().take() {
                conn.close().map_err(|(_, e)| Error::internal(format!("sql close: {e}")))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::internal(format!("sql task failed: {e}")))?
    }

    fn writable(&self) -> Option<&dyn WritableSource> {
        Some(self)
    }

    fn health(&self) -> Option<BreakerSnapshot> {
        Some(self.policy.breaker().snapshot())
    }
}

#[async_trait]
impl WritableSource for SqlSource {
    async fn execute(&self, ctx: &Context, statement: &str, args: &[Value]) -> Result<u64> {
        let name = self.name.clone();
        let statement = statement.to_string();
        let args: Vec<SqlValue> = args.iter().map(to_sql_value).collect();
        tracing::info!(source = %self.name, statement = %statement, args = args.len(), "executing statement");
        let write = self.with_connection(move |conn| {
            conn.execute(&statement, params_from_iter(args.iter()))
                .map(|rows| rows as u64)
                .map_err(|e| classify(&name, "execute", e))
        });
        self.policy.call_once(ctx, write).await
    }
}

impl std::fmt::Debug for SqlSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlSource")
            .field("name", &self.name)
            .field("dsn", &self.dsn)
            .field("query", &self.query)
            .field("connected", &self.conn.lock().is_some())
            .finish_non_exhaustive()
    }
}

/// On drop: a queued call is abandoned, a running one is interrupted.
struct InterruptOnDrop {
    handle: InterruptSlot,
    progress: Arc<AtomicU8>,
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        let handle = self.handle.lock();
        let abandoned = self
            .progress
            .compare_exchange(QUEUED, ABANDONED, Ordering::SeqCst, Ordering::SeqCst);
        if abandoned == Err(RUNNING) {
            if let Some(handle) = handle.as_ref() {
                handle.interrupt();
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn open_connection(name: &str, dsn: &str) -> Result<Connection> {
    let conn = if dsn == ":memory:" {
        Connection::open_in_memory()
    } else {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        Connection::open_with_flags(dsn, flags)
    }
    .map_err(|e| classify(name, "open", e))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|e| classify(name, "open", e))?;
    Ok(conn)
}

fn query_records(name: &str, conn: &Connection, query: &str, args: &[SqlValue]) -> Result<Vec<Record>> {
    let mut stmt = conn
        .prepare(query)
        .map_err(|e| classify(name, "prepare", e))?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt
        .query(params_from_iter(args.iter()))
        .map_err(|e| classify(name, "query", e))?;

    let mut records = Vec::new();
    while let Some(row) = rows.next().map_err(|e| classify(name, "query", e))? {
        let mut record = Record::new();
        for (index, column) in columns.iter().enumerate() {
            let value = row
                .get_ref(index)
                .map_err(|e| classify(name, "decode", e))?;
            record.insert(column.clone(), from_sql_value(value));
        }
        records.push(record);
    }
    Ok(records)
}

/// Busy/locked databases are transient; interrupts are cancellations.
fn classify(name: &str, operation: &str, err: rusqlite::Error) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                Error::transient(name, operation, err.to_string())
            }
            ErrorCode::OperationInterrupted => Error::cancelled(format!("{name}: {operation}")),
            _ => Error::permanent(name, operation, err.to_string()),
        },
        _ => Error::permanent(name, operation, err.to_string()),
    }
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}
