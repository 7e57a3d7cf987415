// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

//! Amazon product widget backend: a cache of upstream product and search data with quota-aware background renewal,
//! fallback selection for widgets, and deal feed import.

pub mod db;
pub mod deals;
pub mod error;
pub mod fallback;
pub mod fetch;
pub mod http;
pub mod lock;
pub mod product;
pub mod product_service;
pub mod queue;
pub mod settings;
pub mod store;
pub mod time;
pub mod usage;
pub mod worker;

/// constants generated in build.rs
pub mod constants {
    include!(env!("CONSTANTS_PATH"));
}
