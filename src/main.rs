use std::sync::Arc;

use actix_web::web;
use anyhow::Context;
use clap::Parser;
use task_trackerd::config::Settings;
use task_trackerd::gitlab::GitlabIssueSource;
use task_trackerd::scheduler::NotificationScheduler;
use task_trackerd::server::{self, Router};
use task_trackerd::static_files::StaticFiles;
use task_trackerd::{hydrate_feed_store, tls, Args};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = Settings::load_from_file(&args.config)
        .with_context(|| format!("loading settings from {}", args.config.display()))?;

    let static_files = StaticFiles::load(&settings.resources_dir)
        .context("loading static resources")?;
    let tls_config = tls::load_server_config(
        &settings.https_private_key,
        &settings.https_public_cert,
    )
    .context("loading TLS key and certificate")?;
    let source = GitlabIssueSource::from_settings(&settings).context("building GitLab client")?;

    let store = Arc::new(hydrate_feed_store(&settings).await);

    let cancel = CancellationToken::new();
    let scheduler = NotificationScheduler::new(
        source,
        Arc::clone(&store),
        settings.feed_state_path.clone(),
    )
    .with_policy(settings.threshold_policy)
    .with_poll_interval(settings.poll_interval())
    .with_startup_delay(settings.startup_delay())
    .run(cancel.clone());

    let router = web::Data::new(Router::new(static_files, &settings.token, store));
    let result = server::serve(&settings, router, tls_config).await;

    info!("shutting down");
    cancel.cancel();
    if let Err(e) = scheduler.await {
        tracing::error!(error = %e, "scheduler task ended abnormally");
    }

    result.context("HTTPS server failed")
}
