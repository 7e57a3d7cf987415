// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

mod schema;

use crate::error::ApwResult;
use sqlx::{
    Encode, Executor, FromRow, Pool, Sqlite, SqliteConnection,
    error::Error as SqlxError,
    pool::PoolConnection,
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePoolOptions, SqliteRow,
        SqliteSynchronous,
    },
};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const DB_FILENAME: &str = "apw.sqlite";

pub(crate) type SqliteResult<T> = Result<T, SqlxError>;

/// Cloning is by-reference.
#[derive(Clone)]
pub struct ApwDb {
    read_pool: Pool<Sqlite>,
    write_pool: Pool<Sqlite>,
}

impl ApwDb {
    /// Open the default database file in the working directory
    pub async fn open() -> ApwResult<Self> {
        Self::open_path(DB_FILENAME).await
    }

    /// Open (creating if needed) a database file
    pub async fn open_path<P: AsRef<Path>>(path: P) -> ApwResult<Self> {
        let pool_options_write = SqlitePoolOptions::new()
            .min_connections(1) // always keep at least one connection open
            .max_connections(1) // allow only 1 write connection
            .max_lifetime(None) // don't close connections for no reason, as we assume sqlite doesn't leak resources
            .test_before_acquire(false) // we assume sqlite is extremely reliable, as it's in-process
            .acquire_slow_threshold(Duration::from_millis(100)) // we expect sqlite to be fast
            .idle_timeout(Some(Duration::from_secs(90))); // idle extra connections may be closed after a while
        let pool_options_read = pool_options_write.clone().max_connections(4); // allow up to 4 read connections
        let connect_options_write = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .foreign_keys(true)
            .in_memory(false)
            .shared_cache(false) // superseded by WAL mode
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal) // must be Normal to have multiple connections
            .read_only(false)
            .create_if_missing(true)
            .statement_cache_capacity(100)
            .busy_timeout(Duration::from_secs(5))
            .synchronous(SqliteSynchronous::Normal) // small possibility a transaction may be rolled back on OS crash or power-off
            .auto_vacuum(SqliteAutoVacuum::None)
            .page_size(4096)
            .pragma("trusted_schema", "OFF"); // all applications are encouraged to switch this setting off on every database connection as soon as that connection is opened
        let connect_options_read = connect_options_write.clone().read_only(true).create_if_missing(false);

        let write_pool = pool_options_write.connect_with(connect_options_write).await?;
        {
            let mut write_connection = write_pool.acquire().await?;
            schema::init(&mut write_connection).await?;
        }

        let read_pool = pool_options_read.connect_with(connect_options_read).await?;

        Ok(ApwDb { read_pool, write_pool })
    }

    /// Open a private in-memory database. Every sqlite connection to `:memory:` is its own database, so reads and
    /// writes share a single connection that is never recycled.
    pub async fn open_in_memory() -> ApwResult<Self> {
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .max_lifetime(None)
            .idle_timeout(None)
            .test_before_acquire(false)
            .connect_with(
                SqliteConnectOptions::from_str("sqlite::memory:")?
                    .foreign_keys(true)
                    .pragma("trusted_schema", "OFF"),
            )
            .await?;
        {
            let mut connection = pool.acquire().await?;
            schema::init(&mut connection).await?;
        }
        Ok(ApwDb {
            read_pool: pool.clone(),
            write_pool: pool,
        })
    }

    /// Gracefully the database connections and wait for the close to complete
    pub async fn close(&self) {
        self.read_pool.close().await;
        self.write_pool.close().await;
    }

    /// Get something that we can DerefMut as SqliteConnection. Never hold this across a read pool query: in-memory
    /// databases have exactly one connection.
    pub(crate) async fn write_connection(&self) -> SqliteResult<PoolConnection<Sqlite>> {
        self.write_pool.acquire().await
    }

    pub(crate) fn read_pool(&self) -> &Pool<Sqlite> {
        &self.read_pool
    }

    /// Attempt to optimize the database.
    ///
    /// Applications that use long-lived database connections should run "PRAGMA optimize;" periodically, perhaps once per day or once per hour.
    pub async fn optimize(&self) -> ApwResult<()> {
        let mut connection = self.write_connection().await?;
        connection.execute(r#"PRAGMA optimize"#).await?;
        Ok(())
    }

    /// Get DB size in bytes
    pub async fn size(&self) -> ApwResult<u64> {
        let size: i64 =
            sqlx::query_scalar(r#"SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()"#)
                .fetch_one(&self.read_pool)
                .await?;
        Ok(size as u64)
    }

    pub(crate) async fn get_setting<'e, T>(&self, key: &str) -> SqliteResult<Option<T>>
    where
        T: sqlx::Type<Sqlite> + Send + Unpin + 'e,
        (T,): for<'r> FromRow<'r, SqliteRow>,
    {
        let mut connection = self.write_connection().await?;
        helper::get_setting(&mut connection, key).await
    }

    pub(crate) async fn set_setting<'q, T>(&self, key: &'q str, value: T) -> SqliteResult<bool>
    where
        T: Encode<'q, Sqlite> + sqlx::Type<Sqlite> + 'q,
    {
        let mut connection = self.write_connection().await?;
        helper::set_setting(&mut connection, key, value).await
    }

    /// Every persisted setting, rendered as text
    pub(crate) async fn get_settings_text(&self) -> ApwResult<HashMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as(r#"SELECT key, CAST(value AS TEXT) FROM settings"#)
            .fetch_all(&self.read_pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    pub(crate) async fn get_setting_text(&self, key: &str) -> ApwResult<Option<String>> {
        Ok(self.get_setting::<String>(key).await?)
    }

    pub(crate) async fn set_setting_text(&self, key: &str, value: &str) -> ApwResult<()> {
        self.set_setting(key, value).await?;
        Ok(())
    }
}

pub(crate) mod helper {
    use super::*;

    /// Get a single setting from the `settings` table. Note that if your setting is nullable you MUST read it as an
    /// Option<T> instead of a T. This function returns None only if the entire row is absent.
    pub(crate) async fn get_setting<'e, T>(connection: &'e mut SqliteConnection, key: &str) -> SqliteResult<Option<T>>
    where
        T: sqlx::Type<Sqlite> + Send + Unpin + 'e,
        (T,): for<'r> FromRow<'r, SqliteRow>,
    {
        let result: Option<T> = sqlx::query_scalar(r#"SELECT value FROM settings WHERE key = ?"#)
            .bind(key)
            .fetch_optional(connection)
            .await?;
        Ok(result)
    }

    pub(crate) async fn set_setting<'q, T>(
        connection: &mut SqliteConnection,
        key: &'q str,
        value: T,
    ) -> SqliteResult<bool>
    where
        T: Encode<'q, Sqlite> + sqlx::Type<Sqlite> + 'q,
    {
        let update_count = sqlx::query(
            r#"INSERT INTO settings (key, value) VALUES (?, ?)
               ON CONFLICT (key) DO UPDATE SET value = excluded.value"#,
        )
        .bind(key)
        .bind(value)
        .execute(connection)
        .await?
        .rows_affected();
        Ok(update_count != 0)
    }
}
