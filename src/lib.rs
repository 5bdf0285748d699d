use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

pub mod atom;
pub mod config;
pub mod custom_date;
pub mod feed;
pub mod gitlab;
pub mod persist;
pub mod scheduler;
pub mod security_headers;
pub mod server;
pub mod static_files;
pub mod tls;

use config::Settings;
use feed::{FeedProperties, FeedStore};

#[derive(Parser, Debug)]
#[clap(about, version, author)]
pub struct Args {
    /// Path to the JSON settings file.
    #[clap(short, long, default_value = "configuration/configuration.json")]
    pub config: PathBuf,
}

/// Restores the feed from its state file, or starts an empty one.
///
/// A missing or unreadable state file is not fatal. The link is always
/// replaced with the one derived from the current settings.
pub async fn hydrate_feed_store(settings: &Settings) -> FeedStore {
    let link = settings.feed_link();

    let store = match persist::load(&settings.feed_state_path) {
        Ok(data) => {
            info!(
                path = %settings.feed_state_path.display(),
                entries = data.entries.len(),
                "restored feed state"
            );
            FeedStore::from_data(data)
        }
        Err(e) => {
            warn!(error = %e, "starting with an empty feed");
            FeedStore::new(FeedProperties::new(
                &settings.feed_title,
                &link,
                &settings.author_name,
            ))
        }
    };

    store.set_link(&link).await;
    store
}
