use std::{future::IntoFuture, process, sync::Arc, time::Duration};

use axum::http::{Method, Uri};
use pagecache::{
    cache::{PageCacheStore, RequestContext},
    config,
    infra::{error::InfraError, http, telemetry},
};
use tokio::sync::Notify;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
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
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        InfraError::configuration(format!("failed to load configuration: {err}"))
    })?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Flush(_) => run_flush(&settings),
        config::Command::Locate(args) => run_locate(&settings, &args),
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), InfraError> {
    let state = http::HttpState::from_settings(&settings)?;

    if let Some(cache) = state.cache.as_ref() {
        match cache.store.resolver().storage_root() {
            Some(root) => info!(root = %root.display(), "page cache enabled"),
            None => warn!(
                candidates = ?cache.store.resolver().candidates(),
                "no page cache storage root exists; pages will be served uncached"
            ),
        }
    }

    let router = http::build_router(state);
    let listener = tokio::net::TcpListener::bind(settings.server.addr).await?;
    info!(addr = %settings.server.addr, site = %settings.site.root.display(), "listening");

    let stopping = Arc::new(Notify::new());
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown({
        let stopping = Arc::clone(&stopping);
        async move {
            shutdown_signal().await;
            stopping.notify_one();
        }
    });

    let grace = settings.server.graceful_shutdown;
    tokio::select! {
        result = server.into_future() => result?,
        () = drain_deadline(stopping, grace) => {
            warn!(grace_secs = grace.as_secs(), "graceful shutdown timed out; dropping open connections");
        }
    }

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn drain_deadline(stopping: Arc<Notify>, grace: Duration) {
    stopping.notified().await;
    tokio::time::sleep(grace).await;
}

fn run_flush(settings: &config::Settings) -> Result<(), InfraError> {
    let store = PageCacheStore::new(&settings.cache);
    let removed = store.flush()?;
    println!("removed {removed} cached page(s)");
    Ok(())
}

fn run_locate(settings: &config::Settings, args: &config::LocateArgs) -> Result<(), InfraError> {
    let uri: Uri = args
        .uri
        .parse()
        .map_err(|err| InfraError::configuration(format!("invalid uri `{}`: {err}", args.uri)))?;
    let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes()).map_err(|err| {
        InfraError::configuration(format!("invalid method `{}`: {err}", args.method))
    })?;

    let store = PageCacheStore::new(&settings.cache);
    let key = store
        .deriver()
        .for_request(&RequestContext::from_uri(method, &uri));

    println!("key:    {key}");
    println!("digest: {}", key.digest());
    match store.locate(&key) {
        Some(address) => {
            let path = address.path();
            println!("path:   {}", path.display());
            println!("cached: {}", path.is_file());
        }
        None => println!("path:   <no storage root exists>"),
    }
    Ok(())
}
