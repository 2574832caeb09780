use std::sync::Arc;

use tokio::signal;
use tracing::info;

use caphub::config::{self, Process};
use caphub::hub::HubState;
use caphub::hub::files::FileServer;
use caphub::hub::server::HubServer;
use caphub::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    config::init(Process::Hub);
    let config = config::get();

    let _guard = config.log.install();
    tracing::info!("log directives: {}", &config.log.level);

    let store = match &config.hub.db_path {
        Some(path) => match Store::open(path) {
            Ok(store) => {
                info!(path = %path, "Registry store opened");
                Some(store)
            }
            Err(err) => {
                // Memory stays authoritative; run without durable backing.
                tracing::error!(error = %err, path = %path, "Store unavailable");
                None
            }
        },
        None => None,
    };

    let state = HubState::new(store);
    let _sweeper = state.tracker.spawn_sweeper();

    let files = FileServer::bind(
        &config.hub.file_bind_addr(),
        config.hub.files_dir.clone(),
    )
    .await?;
    tokio::spawn(async move {
        if let Err(err) = files.run().await {
            tracing::error!(error = %err, "File listener failed");
        }
    });

    let server =
        HubServer::bind(&config.hub.bind_addr(), Arc::clone(&state)).await?;
    println!(
        "🚀 Hub listening on {}",
        config.hub.bind_addr().replace("0.0.0.0", "127.0.0.1")
    );

    tokio::select! {
        result = server.run() => result?,
        () = shutdown_signal() => info!("shutting down"),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl_c signal received"),
        _ = terminate => info!("terminate signal received"),
    }
}
