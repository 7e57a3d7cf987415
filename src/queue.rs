// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

//! Database backed work queue with leases. Items are JSON; an identical item already waiting in the same queue is not
//! added twice.

use crate::db::ApwDb;
use crate::error::ApwResult;
use crate::time;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::warn;

/// A claimed item. It stays invisible to other workers until deleted, released, or its lease ends.
#[derive(Debug)]
pub struct ClaimedItem<T> {
    pub item_id: i64,
    pub data: T,
}

/// Cloning is by-reference.
#[derive(Clone)]
pub struct WorkQueue<T> {
    db: ApwDb,
    name: &'static str,
    item_type: PhantomData<fn() -> T>,
}

impl<T> WorkQueue<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(db: ApwDb, name: &'static str) -> Self {
        Self {
            db,
            name,
            item_type: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Add an item. Returns `false` if an identical item is already queued.
    pub async fn create_item(&self, data: &T) -> ApwResult<bool> {
        let data = serde_json::to_string(data)?;
        let mut connection = self.db.write_connection().await?;
        let created = sqlx::query(r#"INSERT OR IGNORE INTO queue (name, data, created) VALUES (?, ?, ?)"#)
            .bind(self.name)
            .bind(data)
            .bind(time::unix_now())
            .execute(&mut *connection)
            .await?
            .rows_affected();
        Ok(created != 0)
    }

    /// Lease the oldest available item. Items that fail to decode are dropped.
    pub async fn claim_item(&self, lease: Duration) -> ApwResult<Option<ClaimedItem<T>>> {
        loop {
            let now = time::unix_now();
            let expire = now.saturating_add(lease.as_secs() as i64);
            let claimed: Option<(i64, String)> = {
                let mut connection = self.db.write_connection().await?;
                sqlx::query_as(
                    r#"UPDATE queue SET expire = ?
                       WHERE item_id = (SELECT item_id FROM queue WHERE name = ? AND expire < ? ORDER BY item_id LIMIT 1)
                       RETURNING item_id, data"#,
                )
                .bind(expire)
                .bind(self.name)
                .bind(now)
                .fetch_optional(&mut *connection)
                .await?
            };
            let Some((item_id, data)) = claimed else {
                return Ok(None);
            };
            match serde_json::from_str(&data) {
                Ok(data) => return Ok(Some(ClaimedItem { item_id, data })),
                Err(e) => {
                    warn!("dropping undecodable item {item_id} from queue \"{}\": {e}", self.name);
                    self.delete_item(item_id).await?;
                }
            }
        }
    }

    pub async fn delete_item(&self, item_id: i64) -> ApwResult<()> {
        let mut connection = self.db.write_connection().await?;
        sqlx::query(r#"DELETE FROM queue WHERE item_id = ?"#)
            .bind(item_id)
            .execute(&mut *connection)
            .await?;
        Ok(())
    }

    /// Give a claimed item back to the queue
    pub async fn release_item(&self, item_id: i64) -> ApwResult<()> {
        let mut connection = self.db.write_connection().await?;
        sqlx::query(r#"UPDATE queue SET expire = 0 WHERE item_id = ?"#)
            .bind(item_id)
            .execute(&mut *connection)
            .await?;
        Ok(())
    }

    /// Count of queued items, claimed or not
    pub async fn number_of_items(&self) -> ApwResult<u64> {
        let count: i64 = sqlx::query_scalar(r#"SELECT count(*) FROM queue WHERE name = ?"#)
            .bind(self.name)
            .fetch_one(self.db.read_pool())
            .await?;
        Ok(count as u64)
    }
}
