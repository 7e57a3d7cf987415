// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

use apw::constants::CLAP_VERSION;
use apw::db::DB_FILENAME;
use apw::product::SEARCH_CATEGORY_ALL;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Amazon product widget backend: product cache renewal, widget data, and deal feed imports.
#[derive(Parser)]
#[command(version = CLAP_VERSION, long_about, author)]
pub struct ApwArgs {
    /// Database file
    #[arg(long, global = true, default_value = DB_FILENAME)]
    pub db: PathBuf,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show or change settings
    Config(ConfigArgs),
    /// Queue renewal of stale products. Given ASINs that aren't cached yet are added as stale entries first.
    QueueProductRenewal {
        asins: Vec<String>,
    },
    /// Work through the renewal queue now
    RunProductRenewal,
    /// Show how many cached entries are stale
    Stale,
    /// Mark cached entries as stale so the next renewal run refreshes them
    ResetAllRenewals {
        /// `products` or `search_results`. Both if omitted.
        #[arg(long)]
        collection: Option<String>,
    },
    /// Show product data for one ASIN
    ProductInfo {
        asin: String,
        /// Ask upstream even if the product is cached
        #[arg(long)]
        renew: bool,
    },
    /// Show the top ASINs for a search
    Search {
        terms: String,
        #[arg(long, default_value = SEARCH_CATEGORY_ALL)]
        category: String,
        /// Ask upstream even if the search is cached
        #[arg(long)]
        renew: bool,
    },
    /// Manage operator overrides of product data
    Overrides(OverridesArgs),
    /// Print the widget contents of a product field as JSON
    Widget {
        /// Comma separated ASINs
        #[arg(long, default_value = "")]
        asins: String,
        /// Search used to replace or top up products
        #[arg(long)]
        search_terms: Option<String>,
        #[arg(long)]
        title: Option<String>,
    },
    /// Show today's upstream request count
    Requests,
    /// Run scheduled maintenance: queue renewals, then process the renewal and deal import queues
    Worker {
        /// Repeat every this many seconds until interrupted. Runs once if omitted.
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Deal feed
    Deals(DealsArgs),
    /// Which content references which ASINs
    Usage(UsageArgs),
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// List all settings with their current values
    Ls,
    /// Print one setting
    Get { key: String },
    /// Change one setting
    Set { key: String, value: String },
}

#[derive(Args)]
pub struct OverridesArgs {
    #[command(subcommand)]
    pub command: OverridesCommand,
}

#[derive(Subcommand)]
pub enum OverridesCommand {
    /// Print the overrides of some ASINs
    Get { asins: Vec<String> },
    /// Replace the overrides of an ASIN. Omitted fields are not overridden.
    Set {
        asin: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        manufacturer: Option<String>,
        #[arg(long)]
        price: Option<f64>,
        #[arg(long)]
        suggested_price: Option<f64>,
    },
}

#[derive(Args)]
pub struct DealsArgs {
    #[command(subcommand)]
    pub command: DealsCommand,
}

#[derive(Subcommand)]
pub enum DealsCommand {
    /// Count deals running right now
    ActiveCount,
    /// Show the stored deal of an ASIN
    Info { asin: String },
    /// Download the deal feed, or use a local file, and queue its import
    Update { path: Option<PathBuf> },
    /// Queue the import of a local deal CSV
    Enqueue { path: PathBuf },
    /// Work through the deal import queue now
    Import,
}

#[derive(Args)]
pub struct UsageArgs {
    #[command(subcommand)]
    pub command: UsageCommand,
}

#[derive(Subcommand)]
pub enum UsageCommand {
    /// Update the usage map from a JSON description of a saved entity
    Update { file: PathBuf },
    /// List the ASINs of an entity whose products are unavailable
    Unavailable { entity_type: String, entity_id: i64 },
    /// List the entities referencing an ASIN
    Entities { asin: String },
    /// List every referenced ASIN
    Asins,
}
