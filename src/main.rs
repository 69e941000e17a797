use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{error, info, warn};

use gearbook::config::Config;
use gearbook::engine::Engine;
use gearbook::{compactor, observability, wire};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    observability::init(config.metrics_port)?;
    let tls = config.tls_acceptor()?;

    std::fs::create_dir_all(&config.data_dir)?;
    let engine = Arc::new(Engine::new(config.wal_path(), config.persist_timeout).await?);
    tokio::spawn(compactor::run_compactor(engine.clone(), config.compact_threshold));

    let listener = TcpListener::bind(config.listen_addr()).await?;
    info!(
        addr = %config.listen_addr(),
        wal = %config.wal_path().display(),
        max_connections = config.max_connections,
        persist_timeout_ms = config.persist_timeout.as_millis() as u64,
        tls = tls.is_some(),
        metrics_port = ?config.metrics_port,
        "gearbook listening"
    );

    let permits = Arc::new(Semaphore::new(config.max_connections));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => match permits.clone().try_acquire_owned() {
                    Ok(permit) => spawn_connection(socket, peer, permit, &engine, &config, tls.clone()),
                    Err(_) => {
                        warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                    }
                },
                Err(e) => error!("accept error: {e}"),
            },
            _ = &mut shutdown => {
                info!("shutdown signal received, no longer accepting");
                break;
            }
        }
    }

    drain(&permits, config.max_connections).await;
    info!("gearbook stopped");
    Ok(())
}

fn spawn_connection(
    socket: TcpStream,
    peer: SocketAddr,
    permit: OwnedSemaphorePermit,
    engine: &Arc<Engine>,
    config: &Config,
    tls: Option<TlsAcceptor>,
) {
    info!("connection from {peer}");
    metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
    metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);

    let engine = engine.clone();
    let password = config.password.clone();
    tokio::spawn(async move {
        let _permit = permit;
        if let Err(e) = wire::process_connection(socket, engine, password, tls).await {
            error!("connection error from {peer}: {e}");
        }
        metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
    });
}

/// Resolves on ctrl-c, or SIGTERM where there is one.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => warn!("cannot listen for SIGTERM: {e}"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("cannot listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}

/// Wait until every connection permit is back, or give up after `DRAIN_TIMEOUT`.
async fn drain(permits: &Semaphore, max_connections: usize) {
    info!("draining connections...");
    let drained = async {
        while permits.available_permits() < max_connections {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, drained).await {
        Ok(()) => info!("all connections drained"),
        Err(_) => {
            let open = max_connections - permits.available_permits();
            warn!("drain timeout, {open} connections still open");
        }
    }
}
