use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use wayfare::auth::SharedSecret;
use wayfare::engine::{Engine, PlatformFees};
use wayfare::notify::NotifyHub;
use wayfare::{observability, reaper, wire};

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    observability::init(env_parse::<u16>("WAYFARE_METRICS_PORT"));

    let port = std::env::var("WAYFARE_PORT").unwrap_or_else(|_| "7460".into());
    let bind = std::env::var("WAYFARE_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("WAYFARE_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let secret = std::env::var("WAYFARE_SECRET").unwrap_or_else(|_| "wayfare".into());
    let max_connections: usize = env_parse("WAYFARE_MAX_CONNECTIONS").unwrap_or(256);
    let compact_threshold: u64 = env_parse("WAYFARE_COMPACT_THRESHOLD").unwrap_or(1000);
    let checkout_ttl_secs: u64 = env_parse("WAYFARE_CHECKOUT_TTL_SECS").unwrap_or(1800);
    let fee_percent: f64 = env_parse("WAYFARE_FEE_PERCENT").unwrap_or(5.0);
    let fee_flat: f64 = env_parse("WAYFARE_FEE_FLAT").unwrap_or(0.0);

    let tls_cert = std::env::var("WAYFARE_TLS_CERT").ok();
    let tls_key = std::env::var("WAYFARE_TLS_KEY").ok();
    let tls_acceptor = wayfare::tls::load_tls_acceptor(tls_cert.as_deref(), tls_key.as_deref())?;

    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("wayfare.wal");

    let notify = Arc::new(NotifyHub::new());
    let fees = Arc::new(PlatformFees::new(fee_percent, fee_flat));
    let engine = Arc::new(Engine::new(wal_path, notify, fees)?);

    tokio::spawn(reaper::run_reaper(
        engine.clone(),
        Duration::from_secs(checkout_ttl_secs),
    ));
    tokio::spawn(reaper::run_compactor(engine.clone(), compact_threshold));

    let auth = SharedSecret::new(secret);
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("wayfare listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  max_connections: {max_connections}");
    info!("  fees: {fee_percent}% + {fee_flat}");
    info!("  checkout_ttl: {checkout_ttl_secs}s");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, then drain.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
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
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let auth = auth.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until the connection closes
                    if let Err(e) = wire::process_connection(socket, engine, auth, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Let in-flight connections finish, up to 10s.
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("wayfare stopped");
    Ok(())
}
