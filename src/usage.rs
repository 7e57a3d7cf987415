// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

//! Which content entities reference which ASINs

use crate::db::ApwDb;
use crate::error::ApwResult;
use crate::product::{ProductField, normalize_asins};
use crate::store::Collection;
use serde::{Deserialize, Serialize};
use sqlx::Connection;
use std::collections::BTreeSet;
use tracing::debug;

/// Paragraphs are only indexed through the entity that contains them
pub const PARAGRAPH_ENTITY_TYPE: &str = "paragraph";

/// A saved piece of content, reduced to the fields that matter for the usage map
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentEntity {
    pub entity_type: String,
    /// `None` for content that hasn't been saved yet
    pub entity_id: Option<i64>,
    #[serde(default)]
    pub fields: Vec<FieldPayload>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldPayload {
    Product(ProductField),
    Paragraphs(Vec<Paragraph>),
    Other,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Paragraph {
    #[serde(default)]
    pub fields: Vec<FieldPayload>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, sqlx::FromRow)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: i64,
}

impl ContentEntity {
    /// Every ASIN referenced by a product field of this entity or of its paragraphs
    pub fn referenced_asins(&self) -> BTreeSet<String> {
        let mut asins = BTreeSet::new();
        collect_asins(&self.fields, &mut asins);
        asins
    }
}

fn collect_asins(fields: &[FieldPayload], asins: &mut BTreeSet<String>) {
    for field in fields {
        match field {
            FieldPayload::Product(product_field) => asins.extend(normalize_asins(&product_field.asins)),
            FieldPayload::Paragraphs(paragraphs) => {
                for paragraph in paragraphs {
                    collect_asins(&paragraph.fields, asins);
                }
            }
            FieldPayload::Other => {}
        }
    }
}

/// Cloning is by-reference.
#[derive(Clone)]
pub struct ProductUsageService {
    db: ApwDb,
}

impl ProductUsageService {
    pub fn new(db: ApwDb) -> Self {
        Self { db }
    }

    /// Rebuild the usage rows of a saved entity. Returns `false` if nothing had to be written.
    pub async fn update(&self, entity: &ContentEntity) -> ApwResult<bool> {
        if entity.entity_type == PARAGRAPH_ENTITY_TYPE {
            return Ok(false);
        }
        let Some(entity_id) = entity.entity_id else {
            return Ok(false);
        };

        let asins = entity.referenced_asins();
        let existing: BTreeSet<String> = self
            .asins_for_entity(&entity.entity_type, entity_id)
            .await?
            .into_iter()
            .collect();
        if existing == asins {
            return Ok(false);
        }

        let mut connection = self.db.write_connection().await?;
        let mut transaction = connection.begin().await?;
        sqlx::query(r#"DELETE FROM asin_map WHERE entity_type = ? AND entity_id = ?"#)
            .bind(entity.entity_type.as_str())
            .bind(entity_id)
            .execute(&mut *transaction)
            .await?;
        for asin in &asins {
            sqlx::query(r#"INSERT INTO asin_map (entity_type, entity_id, asin) VALUES (?, ?, ?)"#)
                .bind(entity.entity_type.as_str())
                .bind(entity_id)
                .bind(asin.as_str())
                .execute(&mut *transaction)
                .await?;
        }
        transaction.commit().await?;
        debug!(
            "{} {entity_id} now references {} ASINs",
            entity.entity_type,
            asins.len()
        );
        Ok(true)
    }

    pub async fn asins_for_entity(&self, entity_type: &str, entity_id: i64) -> ApwResult<Vec<String>> {
        let asins = sqlx::query_scalar(r#"SELECT asin FROM asin_map WHERE entity_type = ? AND entity_id = ? ORDER BY asin"#)
            .bind(entity_type)
            .bind(entity_id)
            .fetch_all(self.db.read_pool())
            .await?;
        Ok(asins)
    }

    pub async fn entities_by_asin(&self, asin: &str) -> ApwResult<Vec<EntityRef>> {
        let entities = sqlx::query_as(
            r#"SELECT entity_type, entity_id FROM asin_map WHERE asin = ? ORDER BY entity_type, entity_id"#,
        )
        .bind(asin)
        .fetch_all(self.db.read_pool())
        .await?;
        Ok(entities)
    }

    /// Every ASIN referenced anywhere
    pub async fn all_asins(&self) -> ApwResult<Vec<String>> {
        let asins = sqlx::query_scalar(r#"SELECT DISTINCT asin FROM asin_map ORDER BY asin"#)
            .fetch_all(self.db.read_pool())
            .await?;
        Ok(asins)
    }

    /// ASINs referenced by an entity whose cached product data says they are unavailable
    pub async fn unavailable_asins_for_entity(&self, entity_type: &str, entity_id: i64) -> ApwResult<Vec<String>> {
        let asins = sqlx::query_scalar(
            r#"SELECT DISTINCT am.asin FROM asin_map am
               JOIN key_value kv ON kv.collection = ? AND kv.name = am.asin AND kv.available = 0
               WHERE am.entity_type = ? AND am.entity_id = ?
               ORDER BY am.asin"#,
        )
        .bind(Collection::Products.name())
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(self.db.read_pool())
        .await?;
        Ok(asins)
    }
}
