// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

use crate::db::ApwDb;
use crate::error::ApwResult;
use crate::time;
use serde::Serialize;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DealStatus {
    Unknown,
    Available,
    Upcoming,
}

impl DealStatus {
    /// Status column of the deal feed. Anything unrecognized is [`DealStatus::Unknown`].
    pub fn from_feed(status: &str) -> Self {
        match status.trim() {
            "AVAILABLE" => DealStatus::Available,
            "UPCOMING" => DealStatus::Upcoming,
            _ => DealStatus::Unknown,
        }
    }

    pub const fn from_number(status: i64) -> Self {
        match status {
            1 => DealStatus::Available,
            2 => DealStatus::Upcoming,
            _ => DealStatus::Unknown,
        }
    }

    pub const fn as_number(self) -> i64 {
        match self {
            DealStatus::Unknown => 0,
            DealStatus::Available => 1,
            DealStatus::Upcoming => 2,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            DealStatus::Unknown => "UNKNOWN",
            DealStatus::Available => "AVAILABLE",
            DealStatus::Upcoming => "UPCOMING",
        }
    }
}

/// A deal as read from the feed
#[derive(Clone, Debug, PartialEq)]
pub struct FeedDeal {
    pub asin: String,
    pub deal_start: i64,
    pub deal_end: i64,
    pub deal_price: f64,
    pub deal_status: DealStatus,
}

/// A stored deal
#[derive(Clone, Debug, PartialEq)]
pub struct Deal {
    pub asin: String,
    pub deal_start: i64,
    pub deal_end: i64,
    pub deal_price: f64,
    pub deal_status: DealStatus,
    pub created: i64,
    pub updated: i64,
}

#[derive(sqlx::FromRow)]
struct DealRow {
    asin: String,
    deal_start: i64,
    deal_end: i64,
    deal_price: f64,
    deal_status: i64,
    created: i64,
    updated: i64,
}

impl From<DealRow> for Deal {
    fn from(row: DealRow) -> Self {
        Deal {
            asin: row.asin,
            deal_start: row.deal_start,
            deal_end: row.deal_end,
            deal_price: row.deal_price,
            deal_status: DealStatus::from_number(row.deal_status),
            created: row.created,
            updated: row.updated,
        }
    }
}

/// Human readable deal, for operator output
#[derive(Clone, Debug, Serialize)]
pub struct PrettyDeal {
    pub asin: String,
    pub deal_start: Option<String>,
    pub deal_end: Option<String>,
    pub deal_price: f64,
    pub deal_status: &'static str,
    pub created: Option<String>,
    pub updated: Option<String>,
}

impl From<&Deal> for PrettyDeal {
    fn from(deal: &Deal) -> Self {
        PrettyDeal {
            asin: deal.asin.clone(),
            deal_start: time::format_rfc2822(deal.deal_start),
            deal_end: time::format_rfc2822(deal.deal_end),
            deal_price: deal.deal_price,
            deal_status: deal.deal_status.as_str(),
            created: time::format_rfc2822(deal.created),
            updated: time::format_rfc2822(deal.updated),
        }
    }
}

/// Cloning is by-reference.
#[derive(Clone)]
pub struct DealStore {
    db: ApwDb,
}

impl DealStore {
    pub fn new(db: ApwDb) -> Self {
        Self { db }
    }

    /// Insert a deal, or update it keeping its original creation time
    pub async fn insert_or_update(&self, deal: &FeedDeal) -> ApwResult<()> {
        let now = time::unix_now();
        let mut connection = self.db.write_connection().await?;
        sqlx::query(
            r#"INSERT INTO deal (asin, deal_start, deal_end, deal_price, deal_status, created, updated)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT (asin) DO UPDATE SET
                   deal_start = excluded.deal_start, deal_end = excluded.deal_end, deal_price = excluded.deal_price,
                   deal_status = excluded.deal_status, updated = excluded.updated"#,
        )
        .bind(deal.asin.as_str())
        .bind(deal.deal_start)
        .bind(deal.deal_end)
        .bind(deal.deal_price)
        .bind(deal.deal_status.as_number())
        .bind(now)
        .bind(now)
        .execute(&mut *connection)
        .await?;
        Ok(())
    }

    /// Price of the deal running right now for this ASIN, if any
    pub async fn get_active_deal(&self, asin: &str) -> ApwResult<Option<f64>> {
        self.get_active_deal_at(asin, time::unix_now()).await
    }

    pub async fn get_active_deal_at(&self, asin: &str, now: i64) -> ApwResult<Option<f64>> {
        let price = sqlx::query_scalar(
            r#"SELECT deal_price FROM deal WHERE asin = ? AND deal_start < ? AND deal_end >= ? AND deal_status = ?"#,
        )
        .bind(asin)
        .bind(now)
        .bind(now)
        .bind(DealStatus::Available.as_number())
        .fetch_optional(self.db.read_pool())
        .await?;
        Ok(price)
    }

    pub async fn get_by_asin(&self, asin: &str) -> ApwResult<Option<Deal>> {
        let row: Option<DealRow> = sqlx::query_as(
            r#"SELECT asin, deal_start, deal_end, deal_price, deal_status, created, updated FROM deal WHERE asin = ?"#,
        )
        .bind(asin)
        .fetch_optional(self.db.read_pool())
        .await?;
        Ok(row.map(Into::into))
    }

    /// Count of deals that are available and running right now
    pub async fn active_count(&self) -> ApwResult<u64> {
        let now = time::unix_now();
        let count: i64 = sqlx::query_scalar(
            r#"SELECT count(*) FROM deal WHERE deal_start < ? AND deal_end >= ? AND deal_status = ?"#,
        )
        .bind(now)
        .bind(now)
        .bind(DealStatus::Available.as_number())
        .fetch_one(self.db.read_pool())
        .await?;
        Ok(count as u64)
    }

    pub async fn count(&self) -> ApwResult<u64> {
        let count: i64 = sqlx::query_scalar(r#"SELECT count(*) FROM deal"#)
            .fetch_one(self.db.read_pool())
            .await?;
        Ok(count as u64)
    }
}
