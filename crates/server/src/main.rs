mod app;
mod auth;
mod config;
mod metrics;
mod registry;
mod util;

use app::{App, AppState};
use auth::{AuthVerifier, JwtVerifier};
use config::StorageBackend;
use palaver_storage::{Datastore, MemoryDatastore};
use std::env;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tracing::info;

fn main() {
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .json()
        .init();

    let config_path = env::var("PALAVER_CONFIG").unwrap_or_else(|_| "palaver.toml".to_string());
    let config = config::load_configuration(Path::new(&config_path)).expect("configuration");

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(async move {
        let datastore: Arc<dyn Datastore> = match config.storage_backend {
            StorageBackend::Postgres => {
                let dsn = config.postgres_dsn.clone().expect("postgres dsn");
                let storage = palaver_storage::connect(&dsn).await.expect("storage");
                storage.migrate().await.expect("migrations");
                Arc::new(storage)
            }
            StorageBackend::Memory => Arc::new(MemoryDatastore::new()),
        };
        let verifier: Arc<dyn AuthVerifier> = Arc::new(JwtVerifier::new(&config.jwt_secret));
        let state = AppState::new(config, datastore, verifier);
        app::spawn_workers(&state);
        let listener = TcpListener::bind(&state.config.bind)
            .await
            .expect("listener");
        info!(address = %state.config.bind, "palaver listening");
        App::new(state).run(listener).await.expect("accept loop");
    });
}
