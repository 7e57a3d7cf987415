// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

//! Choosing which products a widget shows when some of its own products can't be displayed

use crate::product::{ProductMap, ProductRecord};
use std::collections::HashSet;

/// Widgets with top-up enabled try to show at least this many products
pub const MIN_PRODUCTS: usize = 3;

/// How many fallback products a widget needs
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FallbackNeed {
    /// one for every primary product that can't be displayed
    pub replace: usize,
    /// slots left below [`MIN_PRODUCTS`] when top-up is enabled
    pub fill_up: usize,
}

impl FallbackNeed {
    pub fn is_needed(&self) -> bool {
        self.replace + self.fill_up > 0
    }
}

/// Whether a cached entry can be shown, taking overrides into account
pub fn is_displayable(entry: Option<&Option<ProductRecord>>) -> bool {
    matches!(entry, Some(Some(record)) if record.with_overrides_applied().is_displayable())
}

/// Fallback slots for a widget: one replacement per primary product that can't be displayed, plus top-up slots below
/// [`MIN_PRODUCTS`] when `fill_up` is set. Replacements are not capped by [`MIN_PRODUCTS`]; four undisplayable primaries
/// ask for four replacements even with top-up enabled.
pub fn fallback_need(primary: &[String], product_data: &ProductMap, fill_up: bool) -> FallbackNeed {
    let replace = primary
        .iter()
        .filter(|asin| !is_displayable(product_data.get(*asin)))
        .count();
    let fill_up = if fill_up && !primary.is_empty() {
        MIN_PRODUCTS.saturating_sub(primary.len())
    } else {
        0
    };
    FallbackNeed { replace, fill_up }
}

/// Displayable primary products in their configured order, followed by displayable fallback products in rank order
/// until `need` is used up. Replacement slots are used before top-up slots, and no ASIN appears twice.
pub fn resolve(
    primary: &[String],
    product_data: &ProductMap,
    fallback: &[String],
    fallback_data: &ProductMap,
    need: FallbackNeed,
) -> Vec<ProductRecord> {
    let mut seen: HashSet<&str, ahash::RandomState> = HashSet::default();
    let mut products = Vec::with_capacity(primary.len() + need.fill_up);

    for asin in primary {
        if let Some(Some(record)) = product_data.get(asin) {
            if is_displayable(product_data.get(asin)) && seen.insert(asin.as_str()) {
                products.push(record.clone());
            }
        }
    }

    let FallbackNeed {
        mut replace,
        mut fill_up,
    } = need;
    for asin in fallback {
        if replace + fill_up == 0 {
            break;
        }
        let entry = fallback_data.get(asin);
        if seen.contains(asin.as_str()) || !is_displayable(entry) {
            continue;
        }
        let Some(Some(record)) = entry else {
            continue;
        };
        if replace > 0 {
            replace -= 1;
        } else {
            fill_up -= 1;
        }
        seen.insert(asin.as_str());
        products.push(record.clone());
    }

    products
}
