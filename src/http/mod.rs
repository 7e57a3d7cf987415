// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

//! HTTP API calls

use crate::constants;
use std::sync::LazyLock;
use std::time::Duration;

pub mod deal_feed;
pub mod paapi;

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .user_agent(constants::USER_AGENT)
        .gzip(true)
        .connect_timeout(Duration::from_secs(6))
        .timeout(Duration::from_secs(10))
        // .connection_verbose(true) // useful for debugging
        .build()
        .expect("Failed to build HTTP_CLIENT")
});

/// The deal feed answers with a redirect to the actual file, so this client must not follow redirects
static NO_REDIRECT_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .user_agent(constants::USER_AGENT)
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(Duration::from_secs(6))
        .timeout(Duration::from_secs(30))
        .build()
        .expect("Failed to build NO_REDIRECT_CLIENT")
});

/// Deal feed files are large, so downloads get a long timeout
static DOWNLOAD_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .user_agent(constants::USER_AGENT)
        .gzip(false) // we want the .gz file itself
        .connect_timeout(Duration::from_secs(6))
        .timeout(Duration::from_secs(600))
        .build()
        .expect("Failed to build DOWNLOAD_CLIENT")
});
