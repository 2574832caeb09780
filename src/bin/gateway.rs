use std::time::Duration;

use salvo::catcher::Catcher;
use salvo::prelude::*;
use salvo::server::ServerHandle;
use tokio::signal;
use tracing::info;

use caphub::config::{self, Process};
use caphub::gateway::{self, GatewayState, HubClient};

/// How long to keep retrying the initial hub connection.
const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_BACKOFF: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    config::init(Process::Gateway);
    let config = config::get();

    let _guard = config.log.install();
    tracing::info!("log directives: {}", &config.log.level);

    let client = connect_with_retry(&config.gateway.hub_address).await?;
    let request_timeout =
        Duration::from_secs(config.gateway.request_timeout_secs);

    // Log the endpoint table once so operators see what came up.
    match client.discover(request_timeout).await {
        Ok(discovery) => {
            for (name, cap) in &discovery.capabilities {
                info!(
                    capability = %name,
                    method = %cap.http_method,
                    "Endpoint: /api/call/{name}"
                );
            }
            info!(
                workers = discovery.workers.len(),
                capabilities = discovery.capabilities.len(),
                "Discovery complete"
            );
        }
        Err(err) => {
            tracing::warn!(error = %err, "Initial discovery failed");
        }
    }

    let state = GatewayState {
        client,
        request_timeout,
    };
    let service =
        Service::new(gateway::root(state)).catcher(Catcher::default());

    let listen_addr = format!("127.0.0.1:{}", config.gateway.port);
    println!("🚀 Gateway listening on http://{listen_addr}/");
    println!("📖 Swagger UI: http://{listen_addr}/api/docs");
    let acceptor = TcpListener::new(("0.0.0.0", config.gateway.port))
        .bind()
        .await;
    let server = Server::new(acceptor);
    tokio::spawn(shutdown_signal(server.handle()));
    server.serve(service).await;
    Ok(())
}

async fn connect_with_retry(hub_address: &str) -> anyhow::Result<HubClient> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match HubClient::connect(hub_address, "http_gateway").await {
            Ok(client) => {
                info!(hub_address, "Connected to hub");
                return Ok(client);
            }
            Err(err) if attempt < CONNECT_ATTEMPTS => {
                tracing::warn!(
                    hub_address,
                    attempt,
                    error = %err,
                    "Hub not reachable yet, retrying"
                );
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

async fn shutdown_signal(handle: ServerHandle) {
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
    handle.stop_graceful(std::time::Duration::from_secs(60));
}
