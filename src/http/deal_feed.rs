// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

//! Deal feed download. The feed URL sits behind HTTP digest auth and redirects to a gzipped CSV.

use super::{DOWNLOAD_CLIENT, NO_REDIRECT_CLIENT};
use crate::error::{ApwError, ApwResult};
use crate::settings::DealSettings;
use crate::time;
use flate2::read::GzDecoder;
use reqwest::{StatusCode, Url, header};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub const DOWNLOAD_FAILED_MESSAGE: &str = "Could not download CSV file from Amazon.";

fn feed_error<E: std::fmt::Display>(context: &str, e: E) -> ApwError {
    warn!("deal feed {context} failed: {e}");
    ApwError::ServiceUnavailable(DOWNLOAD_FAILED_MESSAGE.to_string())
}

/// Download the deal feed and extract it to `destination`
pub async fn download_deals_csv(settings: &DealSettings, destination: &Path) -> ApwResult<()> {
    let url = settings.url.trim();
    if url.is_empty() {
        return Err(ApwError::ServiceUnavailable(
            "no deal feed URL configured; set deals.url".to_string(),
        ));
    }
    let location = redirect_location(url, &settings.username, &settings.password).await?;
    debug!("deal feed redirected to {location}");

    let compressed = temporary_path(destination);
    let result = download_and_extract(location, &compressed, destination).await;
    if let Err(e) = tokio::fs::remove_file(&compressed).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove temporary file {}: {e}", compressed.display());
        }
    }
    result
}

async fn download_and_extract(location: Url, compressed: &Path, destination: &Path) -> ApwResult<()> {
    let mut response = DOWNLOAD_CLIENT
        .get(location)
        .send()
        .await
        .map_err(|e| feed_error("download", e))?;
    if !response.status().is_success() {
        return Err(feed_error("download", response.status()));
    }

    let mut file = tokio::fs::File::create(compressed).await?;
    let mut bytes_written: u64 = 0;
    while let Some(chunk) = response.chunk().await.map_err(|e| feed_error("download", e))? {
        file.write_all(&chunk).await?;
        bytes_written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);
    debug!("downloaded {bytes_written} compressed bytes");

    let compressed = compressed.to_path_buf();
    let destination = destination.to_path_buf();
    let extracted = tokio::task::spawn_blocking(move || gunzip(&compressed, &destination)).await??;
    info!("extracted deal feed: {extracted} bytes");
    Ok(())
}

/// Request the feed URL, answering a digest challenge if one comes, and return where it redirects to
async fn redirect_location(url: &str, username: &str, password: &str) -> ApwResult<Url> {
    let parsed_url = Url::parse(url).map_err(|e| feed_error("URL parsing", e))?;
    let mut response = NO_REDIRECT_CLIENT
        .get(parsed_url.clone())
        .send()
        .await
        .map_err(|e| feed_error("request", e))?;

    if response.status() == StatusCode::UNAUTHORIZED {
        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| feed_error("authentication", "401 without a WWW-Authenticate header"))?;
        let mut prompt = digest_auth::parse(challenge).map_err(|e| feed_error("authentication", e))?;
        let uri = match parsed_url.query() {
            Some(query) => format!("{}?{query}", parsed_url.path()),
            None => parsed_url.path().to_string(),
        };
        let context = digest_auth::AuthContext::new(username, password, uri);
        let answer = prompt.respond(&context).map_err(|e| feed_error("authentication", e))?;
        response = NO_REDIRECT_CLIENT
            .get(parsed_url.clone())
            .header(header::AUTHORIZATION, answer.to_header_string())
            .send()
            .await
            .map_err(|e| feed_error("request", e))?;
    }

    if response.status() != StatusCode::FOUND {
        return Err(feed_error("request", format!("expected 302, got {}", response.status())));
    }
    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| feed_error("request", "302 without a Location header"))?;
    parsed_url.join(location).map_err(|e| feed_error("redirect", e))
}

fn temporary_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "deals.csv".into());
    name.push(format!(".{}.gz", time::unix_now_millis()));
    destination.with_file_name(name)
}

fn gunzip(source: &Path, destination: &Path) -> std::io::Result<u64> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(source)?));
    let mut writer = BufWriter::new(File::create(destination)?);
    std::io::copy(&mut decoder, &mut writer)
}
