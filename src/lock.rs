// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

//! Named locks shared by every process using the same database. A lock is a row in the `semaphore` table holding the
//! owner id and an expiry; expired locks may be taken over by anyone.

use crate::db::ApwDb;
use crate::error::ApwResult;
use crate::time;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(25);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(500);

static BACKEND_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Cloning is by-reference: clones share the same owner id.
#[derive(Clone)]
pub struct LockBackend {
    db: ApwDb,
    lock_id: String,
}

impl LockBackend {
    pub fn new(db: ApwDb) -> Self {
        let lock_id = format!(
            "{}-{}-{}",
            std::process::id(),
            time::unix_now_millis(),
            BACKEND_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        Self { db, lock_id }
    }

    /// Try to take the lock for `timeout`. Re-acquiring a lock this backend already holds extends it.
    pub async fn acquire(&self, name: &str, timeout: Duration) -> ApwResult<bool> {
        let now = time::unix_now_millis();
        let expire = now.saturating_add(timeout.as_millis() as i64);
        let mut connection = self.db.write_connection().await?;
        let taken = sqlx::query(
            r#"INSERT INTO semaphore (name, value, expire) VALUES (?, ?, ?)
               ON CONFLICT (name) DO UPDATE SET value = excluded.value, expire = excluded.expire
               WHERE semaphore.expire < ? OR semaphore.value = excluded.value"#,
        )
        .bind(name)
        .bind(self.lock_id.as_str())
        .bind(expire)
        .bind(now)
        .execute(&mut *connection)
        .await?
        .rows_affected();
        debug!("lock \"{name}\" acquire: {}", taken != 0);
        Ok(taken != 0)
    }

    /// Check if the lock is free, clearing it if it has expired
    pub async fn lock_may_be_available(&self, name: &str) -> ApwResult<bool> {
        let now = time::unix_now_millis();
        let mut connection = self.db.write_connection().await?;
        let held: bool = sqlx::query_scalar(r#"SELECT EXISTS(SELECT * FROM semaphore WHERE name = ? AND expire >= ?)"#)
            .bind(name)
            .bind(now)
            .fetch_one(&mut *connection)
            .await?;
        if held {
            return Ok(false);
        }
        sqlx::query(r#"DELETE FROM semaphore WHERE name = ? AND expire < ?"#)
            .bind(name)
            .bind(now)
            .execute(&mut *connection)
            .await?;
        Ok(true)
    }

    /// Wait up to `max_wait` for the lock to become available. Returns `true` if it may now be acquired.
    pub async fn wait(&self, name: &str, max_wait: Duration) -> ApwResult<bool> {
        let deadline = Instant::now() + max_wait;
        let mut interval = MIN_POLL_INTERVAL;
        loop {
            if self.lock_may_be_available(name).await? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
            interval = (interval * 2).min(MAX_POLL_INTERVAL);
        }
    }

    /// Release the lock if this backend holds it
    pub async fn release(&self, name: &str) -> ApwResult<()> {
        let mut connection = self.db.write_connection().await?;
        sqlx::query(r#"DELETE FROM semaphore WHERE name = ? AND value = ?"#)
            .bind(name)
            .bind(self.lock_id.as_str())
            .execute(&mut *connection)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tracing_test::traced_test;

    const LOCK: &str = "test_lock";

    #[tokio::test]
    #[traced_test]
    async fn test_exclusive() {
        let db = ApwDb::open_in_memory().await.expect("in-memory db");
        let ours = LockBackend::new(db.clone());
        let theirs = LockBackend::new(db);
        assert!(ours.acquire(LOCK, Duration::from_secs(30)).await.expect("acquire"));
        assert!(!theirs.acquire(LOCK, Duration::from_secs(30)).await.expect("acquire"));
        assert!(!theirs.lock_may_be_available(LOCK).await.expect("check"));

        // re-entrant for the holder
        assert!(ours.acquire(LOCK, Duration::from_secs(30)).await.expect("acquire"));

        // releasing someone else's lock does nothing
        theirs.release(LOCK).await.expect("release");
        assert!(!theirs.acquire(LOCK, Duration::from_secs(30)).await.expect("acquire"));

        ours.release(LOCK).await.expect("release");
        assert!(theirs.acquire(LOCK, Duration::from_secs(30)).await.expect("acquire"));
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let db = ApwDb::open_in_memory().await.expect("in-memory db");
        let ours = LockBackend::new(db.clone());
        let theirs = LockBackend::new(db);
        assert!(ours.acquire(LOCK, Duration::ZERO).await.expect("acquire"));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(theirs.lock_may_be_available(LOCK).await.expect("check"));
        assert!(theirs.acquire(LOCK, Duration::from_secs(30)).await.expect("acquire"));
    }

    #[tokio::test]
    async fn test_wait() {
        let db = ApwDb::open_in_memory().await.expect("in-memory db");
        let ours = LockBackend::new(db.clone());
        let theirs = LockBackend::new(db);
        assert!(theirs.wait(LOCK, Duration::from_millis(10)).await.expect("wait"));

        assert!(ours.acquire(LOCK, Duration::from_secs(30)).await.expect("acquire"));
        assert!(!theirs.wait(LOCK, Duration::from_millis(60)).await.expect("wait"));

        assert!(ours.acquire(LOCK, Duration::from_millis(40)).await.expect("acquire"));
        assert!(theirs.wait(LOCK, Duration::from_secs(2)).await.expect("wait"));
    }
}
