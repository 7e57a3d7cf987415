// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

use crate::db::helper;
use crate::error::ApwError;
use sqlx::{Executor, SqliteConnection};
use tokio::time::Instant;
use tracing::debug;

const SCHEMA_MINOR_VERSION_KEY: &str = "schema_minor_version";
const SCHEMA_PATCH_VERSION_KEY: &str = "schema_patch_version";
/// Increment this if there is a backwards-compatibility breaking schema change, such as deleting a column
const SCHEMA_MINOR_VERSION_VALUE: i32 = 0;
/// Increment this if there is a backwards-compatible change, such as adding a new column
const SCHEMA_PATCH_VERSION_VALUE: i32 = 0;

/// Set up the database
pub(super) async fn init(connection: &mut SqliteConnection) -> Result<(), ApwError> {
    let start = Instant::now();

    // simple key-value settings
    connection
        .execute(
            r#"CREATE TABLE IF NOT EXISTS "settings" (
                   key    TEXT NOT NULL PRIMARY KEY,
                   value  ANY NOT NULL
               ) STRICT, WITHOUT ROWID"#,
        )
        .await?;

    // cached upstream data, one row per (collection, key). `value` is JSON; `overrides` is an optional JSON object
    // merged into the value on read. `renewal` is the unix time after which the entry counts as stale.
    connection
        .execute(
            r#"CREATE TABLE IF NOT EXISTS key_value (
                   collection  TEXT NOT NULL,
                   name        TEXT NOT NULL,
                   value       BLOB NOT NULL,
                   overrides   BLOB,
                   available   INTEGER NOT NULL DEFAULT 0,
                   renewal     INTEGER NOT NULL DEFAULT 0,
                   PRIMARY KEY (collection, name)
               ) STRICT, WITHOUT ROWID"#,
        )
        .await?;
    // stale entry lookup
    connection
        .execute(r#"CREATE INDEX IF NOT EXISTS key_value_renewal ON key_value (collection, renewal)"#)
        .await?;

    // deal feed rows
    connection
        .execute(
            r#"CREATE TABLE IF NOT EXISTS deal (
                   asin         TEXT NOT NULL PRIMARY KEY,
                   deal_start   INTEGER NOT NULL,
                   deal_end     INTEGER NOT NULL,
                   deal_price   REAL NOT NULL,
                   deal_status  INTEGER NOT NULL,
                   created      INTEGER NOT NULL,
                   updated      INTEGER NOT NULL
               ) STRICT, WITHOUT ROWID"#,
        )
        .await?;

    // which content entity references which ASIN
    connection
        .execute(
            r#"CREATE TABLE IF NOT EXISTS asin_map (
                   entity_type  TEXT NOT NULL,
                   entity_id    INTEGER NOT NULL,
                   asin         TEXT NOT NULL,
                   PRIMARY KEY  (entity_type, entity_id, asin)
               ) STRICT, WITHOUT ROWID"#,
        )
        .await?;
    // asin -> entity lookup
    connection
        .execute(r#"CREATE INDEX IF NOT EXISTS asin_map_by_asin ON asin_map (asin)"#)
        .await?;

    // work queue. `expire` is 0 for unclaimed items, otherwise the unix time the lease ends.
    // we intentionally use rowid as we have an integer pk
    connection
        .execute(
            r#"CREATE TABLE IF NOT EXISTS queue (
                   item_id  INTEGER NOT NULL PRIMARY KEY,
                   name     TEXT NOT NULL,
                   data     TEXT NOT NULL,
                   expire   INTEGER NOT NULL DEFAULT 0,
                   created  INTEGER NOT NULL,
                   UNIQUE   (name, data)
               ) STRICT"#,
        )
        .await?;
    connection
        .execute(r#"CREATE INDEX IF NOT EXISTS queue_claim ON queue (name, expire)"#)
        .await?;

    // named cross-process locks. `expire` is in unix milliseconds.
    connection
        .execute(
            r#"CREATE TABLE IF NOT EXISTS semaphore (
                   name    TEXT NOT NULL PRIMARY KEY,
                   value   TEXT NOT NULL,
                   expire  INTEGER NOT NULL
               ) STRICT, WITHOUT ROWID"#,
        )
        .await?;

    let schema_minor_version: i32 = helper::get_setting(connection, SCHEMA_MINOR_VERSION_KEY)
        .await?
        .unwrap_or(SCHEMA_MINOR_VERSION_VALUE);
    let schema_patch_version: i32 = helper::get_setting(connection, SCHEMA_PATCH_VERSION_KEY)
        .await?
        .unwrap_or(SCHEMA_PATCH_VERSION_VALUE);

    // handle schema downgrade (or rather, DON'T handle it and throw an error)
    if schema_minor_version > SCHEMA_MINOR_VERSION_VALUE {
        let message = format!(
            "db schema version is v1.{schema_minor_version}.{schema_patch_version}, which is newer than v1.{SCHEMA_MINOR_VERSION_VALUE} which is the latest schema this apw build supports."
        );
        return Err(ApwError::new(message));
    }

    // Applications that use long-lived database connections should run "PRAGMA optimize=0x10002;" when the connection is first opened.
    // All applications should run "PRAGMA optimize;" after a schema change.
    connection.execute(r#"PRAGMA optimize = 0x10002"#).await?;

    // update the schema version value persisted to the DB
    helper::set_setting(connection, SCHEMA_MINOR_VERSION_KEY, SCHEMA_MINOR_VERSION_VALUE).await?;
    helper::set_setting(connection, SCHEMA_PATCH_VERSION_KEY, SCHEMA_PATCH_VERSION_VALUE).await?;

    let elapsed = start.elapsed();
    debug!(
        "initialized v1.{}.{} db in {}ms",
        SCHEMA_MINOR_VERSION_VALUE,
        SCHEMA_PATCH_VERSION_VALUE,
        elapsed.as_millis()
    );

    Ok(())
}
