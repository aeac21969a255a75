use std::{process, sync::Arc};

use strata::{
    cache::{CacheState, CacheStore},
    config::{self, Settings, StoreArgs},
    infra::{
        cache::{build_engine, open_persistent, spawn_purge_task},
        content::ContentOrigin,
        error::{AppError, InfraError},
        http::{self, AdminState, HttpState},
        telemetry,
    },
};
use tokio::{signal, sync::watch, try_join};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
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

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Inspect(args) => run_inspect(&settings, &args).await,
        config::Command::Clear(args) => run_clear(&settings, &args).await,
    }
}

async fn run_serve(settings: Settings) -> Result<(), AppError> {
    let engine = build_engine(&settings.cache).await?;
    let purge_handle = spawn_purge_task(Arc::clone(&engine), settings.cache.purge_interval);

    let cache = settings.cache.enabled.then(|| CacheState::new(Arc::clone(&engine)));
    if cache.is_none() {
        warn!("response cache disabled; requests go straight to the origin");
    }

    let http_state = HttpState {
        origin: Arc::new(ContentOrigin::new(&settings.content)),
        cache,
    };
    let admin_state = AdminState::new(Arc::clone(&engine));

    let result = serve_http(&settings, http_state, admin_state).await;

    purge_handle.abort();
    let _ = purge_handle.await;

    result
}

async fn serve_http(
    settings: &Settings,
    http_state: HttpState,
    admin_state: AdminState,
) -> Result<(), AppError> {
    let public_router = http::build_router(http_state);
    let admin_router = http::build_admin_router(admin_state);

    let public_listener = tokio::net::TcpListener::bind(settings.server.public_addr)
        .await
        .map_err(InfraError::from)?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr)
        .await
        .map_err(InfraError::from)?;

    info!(
        public = %settings.server.public_addr,
        admin = %settings.server.admin_addr,
        "listening"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let grace = settings.server.graceful_shutdown;
    tokio::spawn(async move {
        shutdown_signal().await;
        info!(grace_seconds = grace.as_secs(), "shutdown requested");
        let _ = shutdown_tx.send(true);
        tokio::time::sleep(grace).await;
        warn!("graceful shutdown timed out");
        process::exit(1);
    });

    let public_server = axum::serve(public_listener, public_router.into_make_service())
        .with_graceful_shutdown(wait_for(shutdown_rx.clone()));
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(wait_for(shutdown_rx));

    try_join!(public_server.into_future(), admin_server.into_future())
        .map_err(InfraError::from)?;

    Ok(())
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

async fn open_offline_store(
    settings: &Settings,
    args: &StoreArgs,
) -> Result<strata::cache::PersistentStore, AppError> {
    let store = settings
        .cache
        .store(&args.store)
        .ok_or_else(|| AppError::UnknownStore(args.store.clone()))?;
    open_persistent(store)
        .await?
        .ok_or_else(|| AppError::NotPersistent(args.store.clone()))
}

async fn run_inspect(settings: &Settings, args: &StoreArgs) -> Result<(), AppError> {
    let store = open_offline_store(settings, args).await?;
    let snapshot = store.stats();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn run_clear(settings: &Settings, args: &StoreArgs) -> Result<(), AppError> {
    let store = open_offline_store(settings, args).await?;
    store.invalidate_all().await;
    info!(store = %args.store, "store cleared");
    Ok(())
}
