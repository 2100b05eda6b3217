//! Relational backends and the create-then-append table synchronizer for tabdrop.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Row};
use tabdrop_core::{
    ColumnKind, MissingColumns, RecordSet, TableName, TargetRow, TypedRow, REQUIRED_COLUMNS,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unsupported connection target {0}")]
    UnsupportedTarget(String),
    #[error("invalid connection target: {0}")]
    InvalidTarget(#[source] BoxError),
    #[error("acquiring connection: {0}")]
    Connect(#[source] BoxError),
    #[error("checking table existence: {0}")]
    Lookup(#[source] BoxError),
    #[error("creating table: {0}")]
    Create(#[source] BoxError),
    #[error("starting transaction: {0}")]
    Begin(#[source] BoxError),
    #[error("inserting row {row}: {source}")]
    Insert {
        row: usize,
        #[source]
        source: BoxError,
    },
    #[error("committing: {0}")]
    Commit(#[source] BoxError),
    #[error("releasing connection: {0}")]
    Close(#[source] BoxError),
    #[error("session already closed")]
    Closed,
}

/// Source of per-file sessions against a relational store.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn connect(&self) -> Result<Box<dyn BackendSession>, BackendError>;
}

/// One transient connection, used for a single file and then closed.
#[async_trait]
pub trait BackendSession: Send {
    async fn table_exists(&mut self, table: &TableName) -> Result<bool, BackendError>;

    /// Create the table with the fixed required-column schema. Fails if it already exists.
    async fn create_table(&mut self, table: &TableName) -> Result<(), BackendError>;

    /// Insert rows in order as one unit of work; nothing is kept if any row fails.
    async fn insert_rows(
        &mut self,
        table: &TableName,
        rows: &[TargetRow],
    ) -> Result<u64, BackendError>;

    async fn close(&mut self) -> Result<(), BackendError>;
}

/// Pick a backend from a connection target: `postgres://`, `postgresql://` or `memory://`.
pub fn backend_for_target(target: &str) -> Result<Arc<dyn Backend>, BackendError> {
    if target.starts_with("postgres://") || target.starts_with("postgresql://") {
        return Ok(Arc::new(PgBackend::from_url(target)?));
    }
    if target.starts_with("memory://") {
        return Ok(Arc::new(MemoryBackend::new()));
    }
    Err(BackendError::UnsupportedTarget(redact_target(target)))
}

/// Hide the password part of a URL-style connection target.
pub fn redact_target(target: &str) -> String {
    let Some(scheme_end) = target.find("://") else {
        return target.to_string();
    };
    let authority_start = scheme_end + 3;
    let rest = &target[authority_start..];
    let authority_end = rest.find('/').unwrap_or(rest.len());
    let Some(at) = rest[..authority_end].rfind('@') else {
        return target.to_string();
    };
    let Some(colon) = rest[..at].find(':') else {
        return target.to_string();
    };
    format!(
        "{}{}:***{}",
        &target[..authority_start],
        &rest[..colon],
        &rest[at..]
    )
}

pub fn create_table_sql(table: &TableName) -> String {
    let columns = REQUIRED_COLUMNS
        .iter()
        .map(|spec| {
            let ty = match spec.kind {
                ColumnKind::Integer => "INTEGER".to_string(),
                ColumnKind::Text { max_chars } => format!("VARCHAR({max_chars})"),
            };
            format!("\"{}\" {ty}", spec.name)
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {} ({columns})", table.quoted())
}

pub fn insert_sql(table: &TableName) -> String {
    let columns = REQUIRED_COLUMNS
        .iter()
        .map(|spec| format!("\"{}\"", spec.name))
        .collect::<Vec<_>>()
        .join(", ");
    let params = (1..=REQUIRED_COLUMNS.len())
        .map(|n| format!("${n}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {} ({columns}) VALUES ({params})", table.quoted())
}

#[derive(Debug, Clone)]
pub struct PgBackend {
    options: PgConnectOptions,
}

impl PgBackend {
    pub fn from_url(url: &str) -> Result<Self, BackendError> {
        let options =
            PgConnectOptions::from_str(url).map_err(|err| BackendError::InvalidTarget(err.into()))?;
        Ok(Self { options })
    }
}

#[async_trait]
impl Backend for PgBackend {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&self) -> Result<Box<dyn BackendSession>, BackendError> {
        let conn = PgConnection::connect_with(&self.options)
            .await
            .map_err(|err| BackendError::Connect(err.into()))?;
        Ok(Box::new(PgSession { conn: Some(conn) }))
    }
}

struct PgSession {
    conn: Option<PgConnection>,
}

impl PgSession {
    fn conn(&mut self) -> Result<&mut PgConnection, BackendError> {
        self.conn.as_mut().ok_or(BackendError::Closed)
    }
}

#[async_trait]
impl BackendSession for PgSession {
    async fn table_exists(&mut self, table: &TableName) -> Result<bool, BackendError> {
        let conn = self.conn()?;
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1
                  FROM information_schema.tables
                 WHERE table_schema = current_schema()
                   AND table_name = $1
            ) AS present
            "#,
        )
        .bind(table.as_str())
        .fetch_one(&mut *conn)
        .await
        .map_err(|err| BackendError::Lookup(err.into()))?;
        row.try_get::<bool, _>("present")
            .map_err(|err| BackendError::Lookup(err.into()))
    }

    async fn create_table(&mut self, table: &TableName) -> Result<(), BackendError> {
        let conn = self.conn()?;
        let sql = create_table_sql(table);
        sqlx::query(&sql)
            .execute(&mut *conn)
            .await
            .map_err(|err| BackendError::Create(err.into()))?;
        Ok(())
    }

    async fn insert_rows(
        &mut self,
        table: &TableName,
        rows: &[TargetRow],
    ) -> Result<u64, BackendError> {
        let conn = self.conn()?;
        let sql = insert_sql(table);
        let mut tx = conn
            .begin()
            .await
            .map_err(|err| BackendError::Begin(err.into()))?;

        let mut written = 0u64;
        for (idx, row) in rows.iter().enumerate() {
            let typed = row.coerce().map_err(|err| BackendError::Insert {
                row: idx + 1,
                source: err.into(),
            })?;
            sqlx::query(&sql)
                .bind(typed.index)
                .bind(typed.country)
                .bind(typed.company)
                .execute(&mut *tx)
                .await
                .map_err(|err| BackendError::Insert {
                    row: idx + 1,
                    source: err.into(),
                })?;
            written += 1;
        }

        tx.commit()
            .await
            .map_err(|err| BackendError::Commit(err.into()))?;
        Ok(written)
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        match self.conn.take() {
            Some(conn) => conn
                .close()
                .await
                .map_err(|err| BackendError::Close(err.into())),
            None => Ok(()),
        }
    }
}

/// In-process backend with the same table semantics as Postgres; used for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<StdMutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, Vec<TypedRow>>,
    tables_created: usize,
    open_sessions: usize,
    refuse_connections: Option<String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `connect` fail with this reason.
    pub fn refuse_connections(&self, reason: impl Into<String>) {
        self.lock().refuse_connections = Some(reason.into());
    }

    pub fn table(&self, name: &str) -> Option<Vec<TypedRow>> {
        self.lock().tables.get(name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.lock().tables.keys().cloned().collect()
    }

    /// Number of successful `CREATE TABLE` operations so far.
    pub fn tables_created(&self) -> usize {
        self.lock().tables_created
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<Box<dyn BackendSession>, BackendError> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        if let Some(reason) = &state.refuse_connections {
            return Err(BackendError::Connect(reason.clone().into()));
        }
        state.open_sessions += 1;
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            open: true,
        }))
    }
}

struct MemorySession {
    state: Arc<StdMutex<MemoryState>>,
    open: bool,
}

impl MemorySession {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, BackendError> {
        if !self.open {
            return Err(BackendError::Closed);
        }
        Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn release(&mut self) {
        if self.open {
            self.open = false;
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl BackendSession for MemorySession {
    async fn table_exists(&mut self, table: &TableName) -> Result<bool, BackendError> {
        tokio::task::yield_now().await;
        Ok(self.lock()?.tables.contains_key(table.as_str()))
    }

    async fn create_table(&mut self, table: &TableName) -> Result<(), BackendError> {
        tokio::task::yield_now().await;
        let mut state = self.lock()?;
        if state.tables.contains_key(table.as_str()) {
            return Err(BackendError::Create(
                format!("relation \"{table}\" already exists").into(),
            ));
        }
        state.tables.insert(table.as_str().to_string(), Vec::new());
        state.tables_created += 1;
        Ok(())
    }

    async fn insert_rows(
        &mut self,
        table: &TableName,
        rows: &[TargetRow],
    ) -> Result<u64, BackendError> {
        tokio::task::yield_now().await;
        let typed = rows
            .iter()
            .enumerate()
            .map(|(idx, row)| {
                row.coerce().map_err(|err| BackendError::Insert {
                    row: idx + 1,
                    source: err.into(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut state = self.lock()?;
        let Some(stored) = state.tables.get_mut(table.as_str()) else {
            return Err(BackendError::Insert {
                row: 1,
                source: format!("relation \"{table}\" does not exist").into(),
            });
        };
        let written = typed.len() as u64;
        stored.extend(typed);
        Ok(written)
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        self.release();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub table: TableName,
    pub rows_written: u64,
    pub created: bool,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("record set for `{table}` does not carry the required columns: {source}")]
    Schema {
        table: TableName,
        #[source]
        source: MissingColumns,
    },
    #[error("backend failure for `{table}`: {source}")]
    Backend {
        table: TableName,
        #[source]
        source: BackendError,
    },
}

impl SyncError {
    pub fn table(&self) -> &TableName {
        match self {
            SyncError::Schema { table, .. } | SyncError::Backend { table, .. } => table,
        }
    }
}

/// Ensures destination tables exist and appends record sets to them.
///
/// The existence check, creation and inserts for one table run under a per-table lock,
/// so files sharing a destination never race to create it.
pub struct TableSynchronizer {
    backend: Arc<dyn Backend>,
    table_locks: Mutex<HashMap<TableName, Arc<Mutex<()>>>>,
}

impl TableSynchronizer {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            table_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind()
    }

    async fn table_lock(&self, table: &TableName) -> Arc<Mutex<()>> {
        let mut map = self.table_locks.lock().await;
        map.entry(table.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn sync(
        &self,
        table: &TableName,
        records: &RecordSet,
    ) -> Result<SyncOutcome, SyncError> {
        let rows = records.project_required().map_err(|source| SyncError::Schema {
            table: table.clone(),
            source,
        })?;

        let span = info_span!("table_sync", table = %table, backend = self.backend.kind());
        self.sync_locked(table, &rows).instrument(span).await
    }

    async fn sync_locked(
        &self,
        table: &TableName,
        rows: &[TargetRow],
    ) -> Result<SyncOutcome, SyncError> {
        let lock = self.table_lock(table).await;
        let _guard = lock.lock().await;

        let backend_err = |source| SyncError::Backend {
            table: table.clone(),
            source,
        };

        let mut session = self.backend.connect().await.map_err(backend_err)?;
        let result = write_table(session.as_mut(), table, rows).await;
        let closed = session.close().await;

        match (result, closed) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(outcome), Err(err)) => {
                warn!(error = %err, "rows committed but connection did not close cleanly");
                Ok(outcome)
            }
            (Err(err), _) => Err(backend_err(err)),
        }
    }
}

async fn write_table(
    session: &mut dyn BackendSession,
    table: &TableName,
    rows: &[TargetRow],
) -> Result<SyncOutcome, BackendError> {
    let created = if session.table_exists(table).await? {
        false
    } else {
        session.create_table(table).await?;
        debug!("created destination table");
        true
    };

    let rows_written = session.insert_rows(table, rows).await?;
    debug!(rows_written, "rows committed");

    Ok(SyncOutcome {
        table: table.clone(),
        rows_written,
        created,
    })
}
