// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

//! Operator settings. Every setting is declared up front in [`SCHEMA`] with its type and default, persisted as text in
//! the `settings` table, and loaded into a typed [`Settings`] snapshot.

use crate::db::ApwDb;
use crate::error::{ApwError, ApwResult};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SettingType {
    /// Non-negative integer
    Integer { min: u64 },
    Boolean,
    Text,
}

#[derive(Debug)]
pub struct SettingSpec {
    pub key: &'static str,
    pub kind: SettingType,
    pub default: &'static str,
    pub description: &'static str,
    /// hidden from `config ls` output
    pub secret: bool,
}

const fn setting(key: &'static str, kind: SettingType, default: &'static str, description: &'static str) -> SettingSpec {
    SettingSpec {
        key,
        kind,
        default,
        description,
        secret: false,
    }
}

const fn secret(key: &'static str, description: &'static str) -> SettingSpec {
    SettingSpec {
        key,
        kind: SettingType::Text,
        default: "",
        description,
        secret: true,
    }
}

const INTEGER: SettingType = SettingType::Integer { min: 0 };
const POSITIVE: SettingType = SettingType::Integer { min: 1 };

pub const SCHEMA: &[SettingSpec] = &[
    setting("max_requests_per_day", INTEGER, "8640", "Upstream requests allowed per local calendar day"),
    setting("max_requests_per_second", POSITIVE, "1", "Upstream requests allowed per second"),
    setting("render_max_age", INTEGER, "3600", "Seconds rendered widgets may be cached by clients"),
    setting("call_to_action_text", SettingType::Text, "Buy", "Button text shown next to each product"),
    setting("price_decimal_separator", SettingType::Text, ",", "Decimal separator for displayed prices"),
    setting("price_thousand_separator", SettingType::Text, ".", "Thousands separator for displayed prices"),
    setting("fill_up_with_fallback", SettingType::Boolean, "false", "Top up short product lists from search results"),
    setting("amazon_api_disabled", SettingType::Boolean, "false", "Never call the upstream product API"),
    setting("products.renewal_time", INTEGER, "48", "Hours before a cached product is renewed"),
    setting("products.renewal_limit", POSITIVE, "100", "Maximum products renewed per run"),
    setting("search_results.renewal_time", INTEGER, "48", "Hours before a cached search result is renewed"),
    setting("search_results.renewal_limit", POSITIVE, "100", "Maximum search results renewed per run"),
    setting("api.endpoint", SettingType::Text, "", "Base URL of the signing product API gateway"),
    secret("api.key", "Key sent to the product API gateway"),
    setting("api.partner_tag", SettingType::Text, "", "Associate partner tag"),
    setting("api.marketplace", SettingType::Text, "www.amazon.de", "Marketplace host"),
    setting("deals.active", SettingType::Boolean, "false", "Import the deal feed"),
    setting("deals.url", SettingType::Text, "", "Deal feed URL"),
    setting("deals.username", SettingType::Text, "", "Deal feed digest auth user"),
    secret("deals.password", "Deal feed digest auth password"),
    setting("deals.max_processing_time", POSITIVE, "30", "Seconds one import run may take before yielding"),
    setting("deals.imports_per_round", POSITIVE, "1000", "Rows imported per chunk"),
    setting("deals.max_invalid", POSITIVE, "100", "Invalid rows tolerated before an import is abandoned"),
];

pub fn spec(key: &str) -> Option<&'static SettingSpec> {
    SCHEMA.iter().find(|spec| spec.key == key)
}

impl SettingSpec {
    /// Check a raw value against this setting's type, returning its normalized text form
    pub fn normalize(&self, raw: &str) -> ApwResult<String> {
        let raw = raw.trim();
        match self.kind {
            SettingType::Integer { min } => match raw.parse::<u64>() {
                Ok(value) if value >= min => Ok(value.to_string()),
                Ok(_) => Err(ApwError::new(format!("{} must be at least {min}", self.key))),
                Err(_) => Err(ApwError::new(format!("{} must be an integer, got \"{raw}\"", self.key))),
            },
            SettingType::Boolean => parse_bool(raw)
                .map(|value| value.to_string())
                .ok_or_else(|| ApwError::new(format!("{} must be true or false, got \"{raw}\"", self.key))),
            SettingType::Text => Ok(raw.to_string()),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Clone, Debug)]
pub struct RenewalSettings {
    pub renewal_time: Duration,
    pub renewal_limit: u32,
}

#[derive(Clone, Debug)]
pub struct ApiSettings {
    pub endpoint: String,
    pub key: String,
    pub partner_tag: String,
    pub marketplace: String,
}

#[derive(Clone, Debug)]
pub struct DealSettings {
    pub active: bool,
    pub url: String,
    pub username: String,
    pub password: String,
    pub max_processing_time: Duration,
    pub imports_per_round: u64,
    pub max_invalid: u64,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub max_requests_per_day: u64,
    pub max_requests_per_second: u64,
    pub render_max_age: u64,
    pub call_to_action_text: String,
    pub price_decimal_separator: String,
    pub price_thousand_separator: String,
    pub fill_up_with_fallback: bool,
    pub amazon_api_disabled: bool,
    pub products: RenewalSettings,
    pub search_results: RenewalSettings,
    pub api: ApiSettings,
    pub deals: DealSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_values(&HashMap::new()).unwrap_or_else(|e| panic!("built-in setting defaults are invalid: {e}"))
    }
}

impl Settings {
    /// Load the current settings, falling back to the schema default for anything never set
    pub async fn load(db: &ApwDb) -> ApwResult<Self> {
        let values = db.get_settings_text().await?;
        Self::from_values(&values)
    }

    /// Validate and persist a single setting
    pub async fn set(db: &ApwDb, key: &str, value: &str) -> ApwResult<String> {
        let spec = spec(key).ok_or_else(|| ApwError::new(format!("unknown setting \"{key}\"")))?;
        let value = spec.normalize(value)?;
        db.set_setting_text(key, &value).await?;
        Ok(value)
    }

    /// Current raw value of a setting, or its default
    pub async fn get(db: &ApwDb, key: &str) -> ApwResult<String> {
        let spec = spec(key).ok_or_else(|| ApwError::new(format!("unknown setting \"{key}\"")))?;
        let value = db.get_setting_text(key).await?;
        Ok(value.unwrap_or_else(|| spec.default.to_string()))
    }

    fn from_values(values: &HashMap<String, String>) -> ApwResult<Self> {
        let reader = ValueReader(values);
        Ok(Self {
            max_requests_per_day: reader.integer("max_requests_per_day")?,
            max_requests_per_second: reader.integer("max_requests_per_second")?,
            render_max_age: reader.integer("render_max_age")?,
            call_to_action_text: reader.text("call_to_action_text")?,
            price_decimal_separator: reader.text("price_decimal_separator")?,
            price_thousand_separator: reader.text("price_thousand_separator")?,
            fill_up_with_fallback: reader.boolean("fill_up_with_fallback")?,
            amazon_api_disabled: reader.boolean("amazon_api_disabled")?,
            products: RenewalSettings {
                renewal_time: reader.hours("products.renewal_time")?,
                renewal_limit: reader.limit("products.renewal_limit")?,
            },
            search_results: RenewalSettings {
                renewal_time: reader.hours("search_results.renewal_time")?,
                renewal_limit: reader.limit("search_results.renewal_limit")?,
            },
            api: ApiSettings {
                endpoint: reader.text("api.endpoint")?,
                key: reader.text("api.key")?,
                partner_tag: reader.text("api.partner_tag")?,
                marketplace: reader.text("api.marketplace")?,
            },
            deals: DealSettings {
                active: reader.boolean("deals.active")?,
                url: reader.text("deals.url")?,
                username: reader.text("deals.username")?,
                password: reader.text("deals.password")?,
                max_processing_time: Duration::from_secs(reader.integer("deals.max_processing_time")?),
                imports_per_round: reader.integer("deals.imports_per_round")?,
                max_invalid: reader.integer("deals.max_invalid")?,
            },
        })
    }
}

struct ValueReader<'a>(&'a HashMap<String, String>);

impl ValueReader<'_> {
    fn normalized(&self, key: &str) -> ApwResult<String> {
        let spec = spec(key).ok_or_else(|| ApwError::new(format!("setting \"{key}\" is not declared")))?;
        let raw = self.0.get(key).map(String::as_str).unwrap_or(spec.default);
        spec.normalize(raw)
    }

    fn text(&self, key: &str) -> ApwResult<String> {
        self.normalized(key)
    }

    fn integer(&self, key: &str) -> ApwResult<u64> {
        self.normalized(key)?
            .parse()
            .map_err(|_| ApwError::new(format!("setting \"{key}\" is not an integer")))
    }

    fn limit(&self, key: &str) -> ApwResult<u32> {
        Ok(u32::try_from(self.integer(key)?).unwrap_or(u32::MAX))
    }

    fn hours(&self, key: &str) -> ApwResult<Duration> {
        Ok(Duration::from_secs(self.integer(key)?.saturating_mul(3600)))
    }

    fn boolean(&self, key: &str) -> ApwResult<bool> {
        Ok(self.normalized(key)? == "true")
    }
}
