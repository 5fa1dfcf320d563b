//! Binary protocol server entrypoint. Reads configuration from an
//! optional TOML file plus environment overrides, opens the storage
//! engine and credential store, and runs the TCP accept loop until a
//! shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use nexadb::config::NexaConfig;
use nexadb::document::database::Catalog;
use nexadb::protocol::Server;
use nexadb::storage::StorageEngine;
use nexadb::auth::CredentialStore;

fn load_config() -> NexaConfig {
    let config_path = std::env::var("NEXADB_CONFIG").ok().map(PathBuf::from);
    let mut config = match config_path {
        Some(path) => match std::fs::read_to_string(&path) {
            Ok(s) => NexaConfig::from_toml_str(&s).unwrap_or_else(|e| {
                eprintln!("failed to parse {}: {e}", path.display());
                std::process::exit(1);
            }),
            Err(e) => {
                eprintln!("failed to read {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => NexaConfig::default(),
    };

    if let Ok(dir) = std::env::var("NEXADB_DATA_DIR") {
        config.storage.data_dir = PathBuf::from(dir);
    }
    if let Ok(host) = std::env::var("NEXADB_BIND_HOST") {
        config.network.bind_host = host;
    }
    if let Ok(port) = std::env::var("NEXADB_BIND_PORT") {
        match port.parse() {
            Ok(p) => config.network.bind_port = p,
            Err(_) => {
                eprintln!("NEXADB_BIND_PORT must be a valid u16, got {port:?}");
                std::process::exit(1);
            }
        }
    }
    if let Ok(pw) = std::env::var("NEXADB_ROOT_PASSWORD") {
        config.security.root_password_initial = Some(pw);
    }
    if std::env::var("NEXADB_REPAIR").is_ok() {
        config.storage.repair = true;
    }

    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {e}");
        std::process::exit(1);
    }
    config
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let config = load_config();
    tracing::info!(
        data_dir = %config.storage.data_dir.display(),
        bind = format!("{}:{}", config.network.bind_host, config.network.bind_port),
        "starting nexadb",
    );

    let engine = match StorageEngine::open(config.storage.clone()) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = %e, "failed to open storage engine");
            std::process::exit(if e.is_fatal() { 2 } else { 3 });
        }
    };

    let hnsw_dir = config.storage.data_dir.join("hnsw");
    let catalog = match Catalog::open(engine.clone(), config.index.clone(), hnsw_dir) {
        Ok(catalog) => Arc::new(catalog),
        Err(e) => {
            tracing::error!(error = %e, "failed to open catalog");
            std::process::exit(3);
        }
    };

    let credentials = match CredentialStore::open(engine.clone(), &config.security) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "failed to open credential store");
            std::process::exit(3);
        }
    };

    let server = Server::new(config.network.clone(), catalog, credentials);
    let shutdown = server.shutdown_handle();

    let engine_for_signal = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received shutdown signal, draining connections");
            let _ = shutdown.send(true);
            if let Err(e) = engine_for_signal.shutdown() {
                tracing::warn!(error = %e, "error during storage shutdown");
            }
            std::process::exit(0);
        }
    });

    if let Err(e) = server.run().await {
        tracing::error!(error = %e, "server exited with error");
        let _ = engine.shutdown();
        std::process::exit(4);
    }
}
