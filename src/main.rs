use std::process;
use std::sync::Arc;
use std::time::Instant;

use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

use ukiyo::{
    application::{filters::FilterStore, history::HistoryStore, settings::SettingsStore},
    cache::{CacheJanitor, ImageCache, MetadataCache},
    config,
    infra::{
        error::InfraError,
        http::{self, ApiState},
        telemetry,
        upstream::{FetchClient, RequestPacer, Upstream, UpstreamUrls},
    },
    util::bytes::format_bytes,
};

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_startup_error(&error);
        process::exit(1);
    }
}

fn report_startup_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| InfraError::configuration(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Sweep(_) => run_sweep(settings).await,
    }
}

struct Caches {
    metadata: Arc<MetadataCache>,
    images: Arc<ImageCache>,
}

async fn build_caches(settings: &config::Settings) -> Result<Caches, InfraError> {
    let pacer = Arc::new(RequestPacer::new(settings.upstream.min_interval));
    let client = FetchClient::new(&settings.upstream, pacer)?;
    let upstream: Arc<dyn Upstream> = Arc::new(client);
    let urls = UpstreamUrls::from(&settings.upstream);

    let metadata = Arc::new(MetadataCache::new(
        Arc::clone(&upstream),
        urls.clone(),
        settings.metadata.clone(),
    ));
    let images = ImageCache::open(
        settings.images.data_dir.join("cache"),
        upstream,
        urls,
        settings.images.capacity_bytes,
    )
    .await
    .map_err(|err| InfraError::configuration(format!("failed to open image cache: {err}")))?;

    Ok(Caches {
        metadata,
        images: Arc::new(images),
    })
}

async fn run_serve(settings: config::Settings) -> Result<(), InfraError> {
    let caches = build_caches(&settings).await?;

    let janitor = Arc::new(CacheJanitor::new(
        Arc::clone(&caches.images),
        Arc::clone(&caches.metadata),
        settings.images.max_age,
    ));
    let janitor_handle = Arc::clone(&janitor).spawn(settings.images.sweep_interval);

    let data_dir = &settings.images.data_dir;
    let state = ApiState {
        metadata: caches.metadata,
        images: caches.images,
        filters: Arc::new(FilterStore::open(data_dir.join("filters.json")).await),
        history: Arc::new(HistoryStore::open(data_dir.join("history.json")).await),
        settings: Arc::new(SettingsStore::open(data_dir.join("settings.json")).await),
        prefetch_thumbs: settings.images.prefetch_thumbs,
        started_at: Instant::now(),
    };
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr).await?;
    info!(addr = %settings.server.addr, "Listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Bound the janitor drain so shutdown cannot hang on a sweep.
    if tokio::time::timeout(settings.server.graceful_shutdown, janitor_handle.stop())
        .await
        .is_err()
    {
        error!("Cache janitor did not stop within the shutdown window");
    }
    Ok(())
}

async fn run_sweep(settings: config::Settings) -> Result<(), InfraError> {
    let caches = build_caches(&settings).await?;
    let janitor = CacheJanitor::new(caches.images, caches.metadata, settings.images.max_age);

    let report = janitor.sweep().await;
    info!(
        aged_out = report.aged_out,
        evicted = report.evicted,
        freed = %format_bytes(report.bytes_freed),
        "Sweep finished"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => error!(error = %err, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
