// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

//! Daily upstream request counter. Stored as `{"date": "YYYYMMDD", "count": n}` in the settings table; a record from
//! an earlier day counts as zero.

use crate::db::ApwDb;
use crate::error::ApwResult;
use crate::time;

const REQUEST_COUNTER_KEY: &str = "request_counter";

/// Cloning is by-reference.
#[derive(Clone)]
pub struct RequestCounter {
    db: ApwDb,
}

impl RequestCounter {
    pub fn new(db: ApwDb) -> Self {
        Self { db }
    }

    /// Requests made so far today
    pub async fn todays_count(&self) -> ApwResult<u64> {
        self.count_on(&time::today()).await
    }

    /// Count `by` more requests for today, returning the new total
    pub async fn increase(&self, by: u64) -> ApwResult<u64> {
        self.increase_on(&time::today(), by).await
    }

    pub(crate) async fn count_on(&self, day: &str) -> ApwResult<u64> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"SELECT json_extract(value, '$.count') FROM settings WHERE key = ? AND json_extract(value, '$.date') = ?"#,
        )
        .bind(REQUEST_COUNTER_KEY)
        .bind(day)
        .fetch_optional(self.db.read_pool())
        .await?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }

    /// The read-modify-write happens in a single statement, so concurrent writers can't lose increments
    pub(crate) async fn increase_on(&self, day: &str, by: u64) -> ApwResult<u64> {
        let by = by as i64;
        let mut connection = self.db.write_connection().await?;
        let count: i64 = sqlx::query_scalar(
            r#"INSERT INTO settings (key, value) VALUES (?, json_object('date', ?, 'count', ?))
               ON CONFLICT (key) DO UPDATE SET value = CASE
                   WHEN json_extract(settings.value, '$.date') = json_extract(excluded.value, '$.date')
                   THEN json_set(settings.value, '$.count', json_extract(settings.value, '$.count') + json_extract(excluded.value, '$.count'))
                   ELSE excluded.value
               END
               RETURNING json_extract(value, '$.count')"#,
        )
        .bind(REQUEST_COUNTER_KEY)
        .bind(day)
        .bind(by)
        .fetch_one(&mut *connection)
        .await?;
        Ok(count.max(0) as u64)
    }
}
