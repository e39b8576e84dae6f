use std::{process, sync::Arc};

use axum::Router;
use clap::Parser;
use peercache::{
    application::{error::AppError, todo::TodoService},
    cache::{CacheConfig, CacheState, Signals},
    config::{self, CliArgs, Command},
    infra::{
        client::CachingHttpClient,
        error::InfraError,
        http::{self, GatewayState, TodoState},
        telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
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
    let cli_args = CliArgs::parse();
    let settings = config::load(&cli_args)
        .map_err(|err| AppError::from(InfraError::configuration(err.to_string())))?;

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    let cache_config = CacheConfig::from(&settings.cache);
    let router = match cli_args.command {
        Some(Command::Gateway(_)) => build_gateway(&settings, cache_config)?,
        Some(Command::Todo(_)) | None => build_todo(cache_config),
    };

    serve(&settings, router).await
}

fn build_todo(cache_config: CacheConfig) -> Router {
    let state = TodoState {
        todo: Arc::new(TodoService::new(Signals::new())),
    };
    let cache = cache_config
        .enable_server_cache
        .then(|| CacheState::new(cache_config));
    http::build_todo_router(state, cache)
}

fn build_gateway(settings: &config::Settings, cache_config: CacheConfig) -> Result<Router, AppError> {
    let client = CachingHttpClient::new(cache_config)?;
    info!(
        target = "peercache::gateway",
        todo_url = %settings.upstream.todo_url,
        "forwarding to todo service"
    );
    Ok(http::build_gateway_router(GatewayState {
        client,
        todo_url: settings.upstream.todo_url.clone(),
    }))
}

async fn serve(settings: &config::Settings, router: Router) -> Result<(), AppError> {
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "peercache::serve",
        addr = %settings.server.addr,
        "listening"
    );

    axum::serve(listener, router.into_make_service())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))
}
