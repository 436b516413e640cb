use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Socket, Type};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod bus;
mod config;
mod downloader;
mod error;
mod fetch;
mod model;
mod resolver;
mod scheduler;
mod statemachine;

use api::ApiState;
use bus::ProgressBus;
use fetch::RetryableFetcher;
use resolver::catalogue::build_catalogue_client;
use resolver::PlaylistResolver;
use scheduler::Scheduler;

#[tokio::main]
async fn main() {
    if let Err(e) = config::ensure_appdata_dirs() {
        eprintln!("failed to create appData directories: {e}, continuing anyway");
    }

    let config = config::load().expect("failed to load configuration");

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| format!("streamforge={}", config.logging.level)),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting streamforge v{}", env!("CARGO_PKG_VERSION"));

    let fetcher = Arc::new(RetryableFetcher::new(&config.extractor));
    let resolver = Arc::new(PlaylistResolver::new(fetcher.clone(), &config.extractor));
    let catalogue = build_catalogue_client(&config.catalogue.api_key);
    let bus = ProgressBus::new();

    let scheduler = Scheduler::new(config.clone(), fetcher, resolver, catalogue, bus);

    let api_state = ApiState { scheduler: scheduler.clone() };
    let app = api::router(api_state).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    ).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from((
        config.server.bind_address.parse::<std::net::IpAddr>().expect("invalid bind_address"),
        config.server.port,
    ));
    tracing::info!(%addr, "listening");

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None).expect("failed to create socket");
    socket.set_reuse_address(true).expect("failed to set SO_REUSEADDR");
    socket.bind(&addr.into()).expect("failed to bind socket");
    socket.listen(1024).expect("failed to listen on socket");
    socket.set_nonblocking(true).expect("failed to set non-blocking mode");

    let listener = tokio::net::TcpListener::from_std(socket.into()).expect("failed to convert to tokio listener");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler))
        .await
        .unwrap();
}

async fn shutdown_signal(scheduler: Scheduler) {
    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    tracing::info!("shutdown signal received, draining in-flight tasks");
    scheduler.shutdown().await;
}
