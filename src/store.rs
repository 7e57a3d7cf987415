// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

//! Expiring key-value store. Each collection is an independent namespace; every entry carries a renewal time after
//! which it counts as stale. Stale entries are still served: staleness only drives background renewal.

use crate::db::ApwDb;
use crate::error::{ApwError, ApwResult};
use crate::settings::RenewalSettings;
use crate::time;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::{Connection, QueryBuilder, Sqlite};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, warn};

/// sqlite's default bind parameter limit is 32766, but there's no reason to get anywhere near it
const QUERY_CHUNK_SIZE: usize = 500;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Products,
    SearchResults,
}

impl Collection {
    pub const ALL: [Collection; 2] = [Collection::Products, Collection::SearchResults];

    pub const fn name(self) -> &'static str {
        match self {
            Collection::Products => "products",
            Collection::SearchResults => "search_results",
        }
    }
}

impl Display for Collection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Collection {
    type Err = ApwError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|collection| collection.name() == s)
            .ok_or_else(|| ApwError::new(format!("unknown collection \"{s}\"")))
    }
}

/// A value that can live in a [`KeyValueStore`]
pub trait CacheValue: Serialize + DeserializeOwned {
    /// Whether the entry describes something currently purchasable. Persisted alongside the value so that
    /// unavailable products can be found without decoding every entry.
    fn is_available(&self) -> bool;
}

/// Cloning is by-reference.
#[derive(Clone)]
pub struct KeyValueStore {
    db: ApwDb,
    collection: Collection,
    renewal_time: Duration,
    renewal_limit: u32,
}

impl KeyValueStore {
    pub fn new(db: ApwDb, collection: Collection, settings: &RenewalSettings) -> Self {
        Self {
            db,
            collection,
            renewal_time: settings.renewal_time,
            renewal_limit: settings.renewal_limit,
        }
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    /// Renewal time for an entry written right now
    pub fn next_renewal_time(&self) -> i64 {
        time::unix_now().saturating_add(self.renewal_time.as_secs() as i64)
    }

    pub async fn get<T: CacheValue>(&self, key: &str) -> ApwResult<Option<T>> {
        let value: Option<Vec<u8>> =
            sqlx::query_scalar(r#"SELECT value FROM key_value WHERE collection = ? AND name = ?"#)
                .bind(self.collection.name())
                .bind(key)
                .fetch_optional(self.db.read_pool())
                .await?;
        value.map(|value| serde_json::from_slice(&value)).transpose().map_err(Into::into)
    }

    /// Look up many keys at once. Absent keys are absent from the result; entries that fail to decode are logged and
    /// treated as absent.
    pub async fn get_multiple<T: CacheValue>(
        &self,
        keys: &[String],
    ) -> ApwResult<HashMap<String, T, ahash::RandomState>> {
        let mut values = HashMap::with_capacity_and_hasher(keys.len(), ahash::RandomState::default());
        for chunk in keys.chunks(QUERY_CHUNK_SIZE) {
            let mut query = QueryBuilder::<Sqlite>::new(r#"SELECT name, value FROM key_value WHERE collection = "#);
            query.push_bind(self.collection.name());
            query.push(" AND name IN (");
            let mut separated = query.separated(", ");
            for key in chunk {
                separated.push_bind(key.as_str());
            }
            separated.push_unseparated(")");
            let rows: Vec<(String, Vec<u8>)> = query.build_query_as().fetch_all(self.db.read_pool()).await?;
            for (name, value) in rows {
                match serde_json::from_slice(&value) {
                    Ok(value) => {
                        values.insert(name, value);
                    }
                    Err(e) => warn!("discarding undecodable {} entry \"{name}\": {e}", self.collection),
                }
            }
        }
        Ok(values)
    }

    /// Insert or replace a value. Existing overrides are kept. `renewal` defaults to [`Self::next_renewal_time`].
    pub async fn set<T: CacheValue>(&self, key: &str, value: &T, renewal: Option<i64>) -> ApwResult<()> {
        let renewal = renewal.unwrap_or_else(|| self.next_renewal_time());
        let encoded = serde_json::to_vec(value)?;
        let mut connection = self.db.write_connection().await?;
        sqlx::query(
            r#"INSERT INTO key_value (collection, name, value, available, renewal) VALUES (?, ?, ?, ?, ?)
               ON CONFLICT (collection, name) DO UPDATE
               SET value = excluded.value, available = excluded.available, renewal = excluded.renewal"#,
        )
        .bind(self.collection.name())
        .bind(key)
        .bind(encoded)
        .bind(value.is_available())
        .bind(renewal)
        .execute(&mut *connection)
        .await?;
        Ok(())
    }

    /// Insert only if the key is absent. Returns `true` if the value was written.
    pub async fn set_if_not_exists<T: CacheValue>(&self, key: &str, value: &T, renewal: Option<i64>) -> ApwResult<bool> {
        let renewal = renewal.unwrap_or_else(|| self.next_renewal_time());
        let encoded = serde_json::to_vec(value)?;
        let mut connection = self.db.write_connection().await?;
        let inserted = sqlx::query(
            r#"INSERT OR IGNORE INTO key_value (collection, name, value, available, renewal) VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(self.collection.name())
        .bind(key)
        .bind(encoded)
        .bind(value.is_available())
        .bind(renewal)
        .execute(&mut *connection)
        .await?
        .rows_affected();
        Ok(inserted != 0)
    }

    /// Insert or replace many values in one transaction, all with the same renewal time
    pub async fn set_multiple<'a, T, I>(&self, values: I, renewal: Option<i64>) -> ApwResult<()>
    where
        T: CacheValue + 'a,
        I: IntoIterator<Item = (&'a String, &'a T)>,
    {
        let renewal = renewal.unwrap_or_else(|| self.next_renewal_time());
        let encoded = values
            .into_iter()
            .map(|(key, value)| Ok((key.as_str(), serde_json::to_vec(value)?, value.is_available())))
            .collect::<Result<Vec<_>, serde_json::Error>>()?;

        let mut connection = self.db.write_connection().await?;
        let mut transaction = connection.begin().await?;
        for (key, value, available) in encoded {
            sqlx::query(
                r#"INSERT INTO key_value (collection, name, value, available, renewal) VALUES (?, ?, ?, ?, ?)
                   ON CONFLICT (collection, name) DO UPDATE
                   SET value = excluded.value, available = excluded.available, renewal = excluded.renewal"#,
            )
            .bind(self.collection.name())
            .bind(key)
            .bind(value)
            .bind(available)
            .bind(renewal)
            .execute(&mut *transaction)
            .await?;
        }
        transaction.commit().await?;
        Ok(())
    }

    /// Attach operator overrides to an entry. An entry that doesn't exist yet is created as an immediately stale
    /// negative entry so the next renewal run fetches it.
    pub async fn set_override<O: Serialize>(&self, key: &str, overrides: &O) -> ApwResult<()> {
        let encoded = serde_json::to_vec(overrides)?;
        let mut connection = self.db.write_connection().await?;
        sqlx::query(
            r#"INSERT INTO key_value (collection, name, value, overrides, available, renewal) VALUES (?, ?, CAST('null' AS BLOB), ?, FALSE, 0)
               ON CONFLICT (collection, name) DO UPDATE SET overrides = excluded.overrides"#,
        )
        .bind(self.collection.name())
        .bind(key)
        .bind(encoded)
        .execute(&mut *connection)
        .await?;
        Ok(())
    }

    /// Overrides for the given keys. Keys without overrides are absent. Failures are logged and yield no overrides.
    pub async fn get_overrides<O: DeserializeOwned>(&self, keys: &[String]) -> HashMap<String, O, ahash::RandomState> {
        match self.try_get_overrides(keys).await {
            Ok(overrides) => overrides,
            Err(e) => {
                error!("failed to read {} overrides: {e}", self.collection);
                HashMap::default()
            }
        }
    }

    async fn try_get_overrides<O: DeserializeOwned>(
        &self,
        keys: &[String],
    ) -> ApwResult<HashMap<String, O, ahash::RandomState>> {
        let mut overrides = HashMap::with_hasher(ahash::RandomState::default());
        for chunk in keys.chunks(QUERY_CHUNK_SIZE) {
            let mut query =
                QueryBuilder::<Sqlite>::new(r#"SELECT name, overrides FROM key_value WHERE overrides IS NOT NULL AND collection = "#);
            query.push_bind(self.collection.name());
            query.push(" AND name IN (");
            let mut separated = query.separated(", ");
            for key in chunk {
                separated.push_bind(key.as_str());
            }
            separated.push_unseparated(")");
            let rows: Vec<(String, Vec<u8>)> = query.build_query_as().fetch_all(self.db.read_pool()).await?;
            for (name, value) in rows {
                overrides.insert(name, serde_json::from_slice(&value)?);
            }
        }
        Ok(overrides)
    }

    /// Keys whose renewal time has passed, most overdue first, capped at the configured renewal limit
    pub async fn get_outdated_keys(&self) -> ApwResult<Vec<String>> {
        self.get_outdated_keys_limited(self.renewal_limit).await
    }

    pub async fn get_outdated_keys_limited(&self, limit: u32) -> ApwResult<Vec<String>> {
        let keys = sqlx::query_scalar(
            r#"SELECT name FROM key_value WHERE collection = ? AND renewal < ? ORDER BY renewal, name LIMIT ?"#,
        )
        .bind(self.collection.name())
        .bind(time::unix_now())
        .bind(limit)
        .fetch_all(self.db.read_pool())
        .await?;
        Ok(keys)
    }

    pub async fn get_outdated_keys_count(&self) -> ApwResult<u64> {
        let count: i64 = sqlx::query_scalar(r#"SELECT count(*) FROM key_value WHERE collection = ? AND renewal < ?"#)
            .bind(self.collection.name())
            .bind(time::unix_now())
            .fetch_one(self.db.read_pool())
            .await?;
        Ok(count as u64)
    }

    pub async fn has_stale_data(&self) -> ApwResult<bool> {
        let stale: bool =
            sqlx::query_scalar(r#"SELECT EXISTS(SELECT * FROM key_value WHERE collection = ? AND renewal < ?)"#)
                .bind(self.collection.name())
                .bind(time::unix_now())
                .fetch_one(self.db.read_pool())
                .await?;
        Ok(stale)
    }

    /// Mark every entry in this collection as stale
    pub async fn reset_all(&self) -> ApwResult<u64> {
        let mut connection = self.db.write_connection().await?;
        let updated = sqlx::query(r#"UPDATE key_value SET renewal = 0 WHERE collection = ?"#)
            .bind(self.collection.name())
            .execute(&mut *connection)
            .await?
            .rows_affected();
        Ok(updated)
    }

    pub async fn count(&self) -> ApwResult<u64> {
        let count: i64 = sqlx::query_scalar(r#"SELECT count(*) FROM key_value WHERE collection = ?"#)
            .bind(self.collection.name())
            .fetch_one(self.db.read_pool())
            .await?;
        Ok(count as u64)
    }
}
