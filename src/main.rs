use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use clinicd::api::Services;
use clinicd::auth::StaticTokenVerifier;
use clinicd::config::Config;
use clinicd::engine::Scheduler;
use clinicd::gateway::Gateway;
use clinicd::propagation::Propagator;
use clinicd::rooms::RoomRegistry;
use clinicd::server;
use clinicd::store::{self, DocumentStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    clinicd::observability::init(config.metrics_port)?;

    let tls_acceptor =
        clinicd::tls::load_tls_acceptor(config.tls_cert.as_deref(), config.tls_key.as_deref())?;

    let store = match (&config.data_dir, config.wal_path()) {
        (Some(dir), Some(wal_path)) => {
            std::fs::create_dir_all(dir)?;
            Arc::new(DocumentStore::open(&wal_path)?)
        }
        _ => {
            warn!("CLINICD_DATA_DIR not set, state is kept in memory only");
            Arc::new(DocumentStore::in_memory())
        }
    };
    if let Some(seed) = &config.seed_file {
        store::load_seed(&store, seed).await?;
    }

    let verifier = match &config.tokens_file {
        Some(path) => StaticTokenVerifier::from_file(path)?,
        None => {
            warn!("CLINICD_TOKENS_FILE not set, every connection will be rejected");
            StaticTokenVerifier::new()
        }
    };

    let rooms = Arc::new(RoomRegistry::new());
    let gateway = Arc::new(Gateway::new(Arc::new(verifier), store.clone(), rooms.clone()));
    let scheduler = Arc::new(Scheduler::with_offset(store.clone(), config.utc_offset));
    let services = Arc::new(Services {
        scheduler,
        gateway,
        store: store.clone(),
    });

    let propagation = Propagator::new(store.clone(), rooms.clone())
        .with_retry(config.retry)
        .start()
        .await;

    let background = CancellationToken::new();
    if config.data_dir.is_some() {
        tokio::spawn(store::run_compactor(
            store.clone(),
            config.compact_threshold,
            background.clone(),
        ));
    }

    let semaphore = Arc::new(Semaphore::new(config.max_connections));
    let connections = CancellationToken::new();

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("clinicd listening on {addr}");
    info!(
        "  data_dir: {}",
        config
            .data_dir
            .as_ref()
            .map_or("(memory)".to_string(), |d| d.display().to_string())
    );
    info!("  max_connections: {}", config.max_connections);
    info!("  utc_offset: {}", config.utc_offset);
    info!("  propagation: {}", if propagation.is_enabled() { "enabled" } else { "disabled" });
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    warn!("failed to register SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(clinicd::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(clinicd::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(clinicd::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let services = services.clone();
                let tls = tls_acceptor.clone();
                let closing = connections.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    let result = match tls {
                        Some(acceptor) => match acceptor.accept(socket).await {
                            Ok(stream) => server::process_connection(stream, services, closing).await,
                            Err(e) => Err(e.into()),
                        },
                        None => server::process_connection(socket, services, closing).await,
                    };
                    if let Err(e) = result {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(clinicd::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    propagation.shutdown().await;
    background.cancel();
    store.close().await;
    drop(listener);
    connections.cancel();

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(config.shutdown_grace);
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == config.max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = config.max_connections - semaphore.available_permits();
                warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("clinicd stopped");
    Ok(())
}
