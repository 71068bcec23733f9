//! Persistence layer for the credential pool and entitlement ledger.
//!
//! SQLite through sqlx: a read pool for lookups and a single-connection write
//! pool through which every check-then-write sequence runs as a
//! `BEGIN IMMEDIATE` transaction.

pub mod models;
pub mod repositories;
pub mod retry;
pub mod time;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Serialized write pool type alias (max_connections=1).
pub type WritePool = Pool<Sqlite>;

/// Upper bound for the read pool size.
const MAX_READ_POOL_SIZE: u32 = 10;

/// How long a connection waits on the SQLite lock before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Applied to every new connection of both pools.
const CONNECTION_PRAGMAS: &[&str] = &[
    "PRAGMA wal_autocheckpoint = 1000",
    // Negative means KiB, so ~16MB.
    "PRAGMA cache_size = -16000",
    "PRAGMA temp_store = MEMORY",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolRole {
    Read,
    Write,
}

impl PoolRole {
    fn name(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }

    fn max_connections(self) -> u32 {
        match self {
            Self::Read => default_read_pool_size(),
            // One connection: every check-then-write is serialized here.
            Self::Write => 1,
        }
    }

    fn acquire_timeout(self) -> Duration {
        match self {
            Self::Read => Duration::from_secs(30),
            Self::Write => Duration::from_secs(60),
        }
    }
}

/// Twice the available cores, capped at [`MAX_READ_POOL_SIZE`].
pub fn default_read_pool_size() -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(2);
    (cores * 2).min(MAX_READ_POOL_SIZE)
}

fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true)
        .create_if_missing(true))
}

async fn open_pool(database_url: &str, role: PoolRole) -> Result<DbPool, sqlx::Error> {
    let max_connections = role.max_connections();
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(role.acquire_timeout())
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                for pragma in CONNECTION_PRAGMAS {
                    sqlx::query(pragma).execute(&mut *conn).await?;
                }
                Ok(())
            })
        })
        .connect_with(connect_options(database_url)?)
        .await?;

    // WAL is a database-level setting; a file created elsewhere may not have it.
    let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(&pool)
        .await?;
    if mode != "wal" && mode != "memory" {
        warn!(pool = role.name(), mode = %mode, "Journal mode is not WAL; re-setting");
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    }

    info!(pool = role.name(), max_connections, "Database pool initialized");
    Ok(pool)
}

/// Open the read pool.
pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    open_pool(database_url, PoolRole::Read).await
}

/// Open the single-connection write pool used for immediate transactions.
pub async fn init_write_pool(database_url: &str) -> Result<WritePool, sqlx::Error> {
    open_pool(database_url, PoolRole::Write).await
}

/// Read and write pools opened against the same database file.
#[derive(Clone)]
pub struct DatabasePools {
    pub read: DbPool,
    pub write: WritePool,
}

impl DatabasePools {
    /// Open both pools and apply pending migrations.
    pub async fn open(database_url: &str) -> crate::Result<Self> {
        let read = init_pool(database_url).await?;
        run_migrations(&read).await?;
        let write = init_write_pool(database_url).await?;
        Ok(Self { read, write })
    }
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    info!("Running database migrations");
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations completed");
    Ok(())
}

pub async fn begin_immediate(pool: &WritePool) -> Result<ImmediateTransaction, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(ImmediateTransaction::new(conn))
}

/// Wrapper for a manual immediate transaction.
///
/// `BEGIN IMMEDIATE` takes the write lock up front, so a read made inside the
/// transaction cannot be invalidated by another writer before the commit.
pub struct ImmediateTransaction {
    conn: sqlx::pool::PoolConnection<Sqlite>,
    finished: bool,
}

impl ImmediateTransaction {
    pub fn new(conn: sqlx::pool::PoolConnection<Sqlite>) -> Self {
        Self {
            conn,
            finished: false,
        }
    }

    /// Commit the transaction.
    pub async fn commit(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("ROLLBACK").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }
}

impl std::ops::Deref for ImmediateTransaction {
    type Target = sqlx::SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        // A dangling transaction must not go back into the pool.
        if !self.finished {
            self.conn.close_on_drop();
        }
    }
}
