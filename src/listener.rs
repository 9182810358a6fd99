//! Listener / Supervisor (spec.md §4.6): binds the configured TCP addresses,
//! accepts sockets, spawns one Connection Handler task per socket, and owns
//! graceful shutdown. Structured the way the teacher's `main.rs` builds and
//! awaits its axum server future, but generalized to an arbitrary number of
//! raw TCP accept loops fanning into one shared cancellation token.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::IngestConfig;
use crate::connection;
use crate::metrics::Metrics;
use crate::registry::ConnectionRegistry;
use crate::store::StoreGateway;

/// Runs every configured listener until `cancel` fires, then waits up to
/// `shutdown_grace_secs` for in-flight connections to drain.
pub async fn run(
    config: Arc<IngestConfig>,
    store: Arc<dyn StoreGateway>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut listeners = Vec::new();
    for addr in &config.listen.addrs {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr, "listening");
        listeners.push(listener);
    }

    let registry = Arc::new(ConnectionRegistry::new());

    let mut accept_tasks = Vec::new();
    for listener in listeners {
        let store = store.clone();
        let metrics = metrics.clone();
        let timeouts = config.timeouts.clone();
        let cancel = cancel.clone();
        let registry = registry.clone();
        accept_tasks.push(tokio::spawn(accept_loop(listener, store, metrics, timeouts, cancel, registry)));
    }

    for task in accept_tasks {
        let _ = task.await;
    }

    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    store: Arc<dyn StoreGateway>,
    metrics: Arc<Metrics>,
    timeouts: crate::config::TimeoutConfig,
    cancel: CancellationToken,
    registry: Arc<ConnectionRegistry>,
) {
    let mut handlers = tokio::task::JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        tracing::debug!(%peer, "accepted connection");
                        let store = store.clone();
                        let metrics = metrics.clone();
                        let timeouts = timeouts.clone();
                        let cancel = cancel.clone();
                        let registry = registry.clone();
                        handlers.spawn(async move {
                            connection::handle_connection(socket, peer, store, metrics, timeouts, cancel, registry).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }

    tracing::info!(active = registry.active_connections().len(), "shutdown signaled, draining connections");
    let grace = std::time::Duration::from_secs(timeouts.shutdown_grace_secs);
    let drain = async {
        while handlers.join_next().await.is_some() {}
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        tracing::warn!(
            remaining = registry.active_connections().len(),
            "drain grace period elapsed, forcing close of remaining connections"
        );
        handlers.shutdown().await;
    }
}
