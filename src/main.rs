// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

use crate::cli_args::{ApwArgs, Command, ConfigCommand, DealsCommand, OverridesCommand, UsageCommand};
use apw::db::ApwDb;
use apw::deals::{DealFeedService, PrettyDeal};
use apw::error::{ApwError, ApwResult};
use apw::http::paapi::{PaapiClient, ProductApi};
use apw::product::{ProductField, ProductOverrides};
use apw::product_service::ProductService;
use apw::settings::{SCHEMA, Settings};
use apw::store::Collection;
use apw::usage::{ContentEntity, ProductUsageService};
use apw::{constants, worker};
use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

mod cli_args;

const DEFAULT_LOG_FILTER: &str = "info,apw=debug";

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let cli_args = ApwArgs::parse();

    // Init logging. stdout is reserved for command output.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
        .init();

    debug!(
        "starting {} {} {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        constants::GIT_COMMIT_HASH
    );

    match run(cli_args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Everything a command may need, built from the persisted settings
struct App {
    db: ApwDb,
    products: ProductService,
    deals: DealFeedService,
    usage: ProductUsageService,
}

impl App {
    async fn open(path: &Path) -> ApwResult<Self> {
        let db = ApwDb::open_path(path).await?;
        let settings = Settings::load(&db).await?;
        let api = match PaapiClient::new(&settings.api) {
            Ok(client) => Some(Arc::new(client) as Arc<dyn ProductApi>),
            Err(e) => {
                debug!("{e}");
                None
            }
        };
        Ok(Self {
            products: ProductService::new(db.clone(), api, &settings),
            deals: DealFeedService::new(db.clone(), &settings.deals),
            usage: ProductUsageService::new(db.clone()),
            db,
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> ApwResult<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

async fn run(cli_args: ApwArgs) -> ApwResult<()> {
    let app = App::open(&cli_args.db).await?;
    let result = run_command(&app, cli_args.command).await;
    app.db.close().await;
    result
}

#[allow(clippy::print_stdout)]
async fn run_command(app: &App, command: Command) -> ApwResult<()> {
    match command {
        Command::Config(args) => match args.command {
            ConfigCommand::Ls => {
                for spec in SCHEMA {
                    let value = if spec.secret {
                        "<hidden>".to_string()
                    } else {
                        Settings::get(&app.db, spec.key).await?
                    };
                    println!("{} = \"{value}\" # {}", spec.key, spec.description);
                }
            }
            ConfigCommand::Get { key } => println!("{}", Settings::get(&app.db, &key).await?),
            ConfigCommand::Set { key, value } => {
                let value = Settings::set(&app.db, &key, &value).await?;
                println!("{key} = \"{value}\"");
            }
        },
        Command::QueueProductRenewal { asins } => {
            let queued = app.products.queue_product_renewal(&asins).await?;
            if queued {
                println!("Queued product renewal.");
            } else {
                println!("Nothing new to queue.");
            }
        }
        Command::RunProductRenewal => {
            let summary = worker::run_product_queue(&app.products).await?;
            println!(
                "{} processed, {} skipped, {} requeued",
                summary.processed, summary.skipped, summary.requeued
            );
        }
        Command::Stale => {
            for collection in Collection::ALL {
                let store = app.products.store(collection);
                println!(
                    "{collection}: {} of {} stale",
                    store.get_outdated_keys_count().await?,
                    store.count().await?
                );
            }
        }
        Command::ResetAllRenewals { collection } => {
            let collections = match collection {
                Some(collection) => vec![collection.parse::<Collection>()?],
                None => Collection::ALL.to_vec(),
            };
            for collection in collections {
                let reset = app.products.store(collection).reset_all().await?;
                println!("{collection}: {reset} entries marked stale");
            }
        }
        Command::ProductInfo { asin, renew } => {
            let product_data = app.products.get_product_data(&[asin], renew).await?;
            println!("{}", to_json(&product_data)?);
        }
        Command::Search { terms, category, renew } => {
            let asins = app.products.get_search_results(&terms, &category, renew).await?;
            println!("{}", to_json(&asins)?);
        }
        Command::Overrides(args) => match args.command {
            OverridesCommand::Get { asins } => {
                println!("{}", to_json(&app.products.get_overrides(&asins).await)?);
            }
            OverridesCommand::Set {
                asin,
                title,
                url,
                manufacturer,
                price,
                suggested_price,
            } => {
                let overrides = ProductOverrides {
                    title,
                    url,
                    manufacturer,
                    price,
                    suggested_price,
                };
                app.products.set_overrides([(asin.as_str(), &overrides)]).await?;
                println!("Saved overrides for {asin}.");
            }
        },
        Command::Widget {
            asins,
            search_terms,
            title,
        } => {
            let field = ProductField::new(title, &asins, search_terms);
            let container = app.products.get_products_with_fallback(&field).await;
            let response = serde_json::json!({
                "count": container.products.len(),
                "content": container,
            });
            println!("{}", to_json(&response)?);
        }
        Command::Requests => {
            println!("{}", app.products.fetcher().counter().todays_count().await?);
        }
        Command::Worker { interval } => run_worker(app, interval.map(Duration::from_secs)).await?,
        Command::Deals(args) => match args.command {
            DealsCommand::ActiveCount => println!("{}", app.deals.store().active_count().await?),
            DealsCommand::Info { asin } => match app.deals.store().get_by_asin(&asin).await? {
                Some(deal) => println!("{}", to_json(&PrettyDeal::from(&deal))?),
                None => println!("No deal stored for {asin}."),
            },
            DealsCommand::Update { path } => {
                let continuation = app.deals.update(path).await?;
                println!(
                    "Queued import of {} deals from {}.",
                    continuation.total,
                    continuation.path.display()
                );
            }
            DealsCommand::Enqueue { path } => {
                let continuation = app.deals.start_batch_import(&path).await?;
                println!(
                    "Queued import of {} deals from {}.",
                    continuation.total,
                    continuation.path.display()
                );
            }
            DealsCommand::Import => {
                let summary = worker::run_deal_import_queue(&app.deals).await?;
                println!(
                    "{} finished, {} paused, {} failed",
                    summary.finished, summary.paused, summary.failed
                );
            }
        },
        Command::Usage(args) => match args.command {
            UsageCommand::Update { file } => {
                let json = tokio::fs::read_to_string(&file).await?;
                let entity: ContentEntity = serde_json::from_str(&json)?;
                if app.usage.update(&entity).await? {
                    println!("Usage map updated.");
                } else {
                    println!("Usage map unchanged.");
                }
            }
            UsageCommand::Unavailable { entity_type, entity_id } => {
                let asins = app.usage.unavailable_asins_for_entity(&entity_type, entity_id).await?;
                println!("{}", to_json(&asins)?);
            }
            UsageCommand::Entities { asin } => {
                println!("{}", to_json(&app.usage.entities_by_asin(&asin).await?)?);
            }
            UsageCommand::Asins => println!("{}", to_json(&app.usage.all_asins().await?)?),
        },
    }
    Ok(())
}

async fn run_worker(app: &App, interval: Option<Duration>) -> ApwResult<()> {
    let Some(interval) = interval else {
        return worker::cron(&app.products, &app.deals).await;
    };
    if interval.is_zero() {
        return Err(ApwError::new("worker interval must be at least one second"));
    }

    info!("running maintenance every {}s", interval.as_secs());
    loop {
        if let Err(e) = worker::cron(&app.products, &app.deals).await {
            error!("maintenance run failed: {e}");
        }
        if let Err(e) = app.db.optimize().await {
            error!("failed to optimize db: {e}");
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                return Ok(());
            }
        }
    }
}
