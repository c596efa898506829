//! elevd - privileged group elevation daemon
//!
//! Grants principals temporary membership in a privileged local group,
//! records every grant in a durable ledger, and periodically reconciles the
//! ledger against live group membership so elevations end on timeout,
//! logoff, service stop, or external removal.
//!
//! The daemon runs four tasks on one runtime: the Unix socket request
//! server, the reconciliation sweep timer, a session watcher that turns
//! `loginctl` diffs into logoff notifications, and a signal handler. All of
//! them funnel into the shared [`GrantController`]; on shutdown every
//! outstanding grant is drained before exit.

mod os;
mod server;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use elevd_core::config::ElevdConfig;
use elevd_core::controller::{GrantController, RevokeReason};
use elevd_core::directory::{DirectoryError, GroupControl, IdentityDirectory, SessionDirectory};
use elevd_core::fs_safe;
use elevd_core::grant::store::JsonLedgerStore;
use elevd_core::principal::{Principal, SessionId};
use elevd_core::reconcile::Reconciler;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// elevd daemon - temporary privileged group elevation
#[derive(Parser, Debug)]
#[command(name = "elevd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/elevd/elevd.toml")]
    config: PathBuf,

    /// Path to the request Unix socket (overrides config)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Path to the ledger file (overrides config)
    #[arg(long)]
    ledger_file: Option<PathBuf>,

    /// Privileged group to manage (overrides config)
    #[arg(long)]
    group: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = if args.config.exists() {
        ElevdConfig::from_file(&args.config)
            .with_context(|| format!("failed to load config {}", args.config.display()))?
    } else {
        info!(
            path = %args.config.display(),
            "no configuration file, using defaults"
        );
        ElevdConfig::default()
    };

    if let Some(socket) = args.socket {
        config.daemon.socket = socket;
    }
    if let Some(ledger_file) = args.ledger_file {
        config.daemon.ledger_file = ledger_file;
    }
    if let Some(group) = args.group {
        config.daemon.privileged_group = group;
    }
    config.validate().context("invalid configuration")?;

    info!(
        group = %config.daemon.privileged_group,
        ledger = %config.daemon.ledger_file.display(),
        sweep_interval_secs = config.reconciler.interval_secs,
        "starting elevd"
    );

    fs_safe::ensure_parent_dir(&config.daemon.ledger_file)
        .context("failed to create ledger directory")?;
    fs_safe::ensure_parent_dir(&config.daemon.socket)
        .context("failed to create socket directory")?;

    let groups: Arc<dyn GroupControl> = Arc::new(os::PosixGroupControl);
    let identity: Arc<dyn IdentityDirectory> = Arc::new(os::PosixIdentity);
    let sessions: Arc<dyn SessionDirectory> = Arc::new(os::LoginctlSessions);

    let controller = Arc::new(GrantController::new(
        config.daemon.privileged_group.clone(),
        config.policy.clone(),
        config.timeout.clone(),
        Box::new(JsonLedgerStore::new(&config.daemon.ledger_file)),
        groups,
        identity,
        sessions.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(controller.clone()));

    // Heal any drift accumulated while the service was down before serving
    // requests: grants that expired offline are revoked here.
    let startup = reconciler.clone();
    tokio::task::spawn_blocking(move || startup.sweep(Utc::now()))
        .await
        .context("startup sweep panicked")?;

    let started_at = Instant::now();
    // Latched shutdown signal: a send is never lost even if a task is busy
    // in a tick when it fires.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let sweep_interval = Duration::from_secs(config.reconciler.interval_secs);
    let sweep_task = tokio::spawn(sweep_loop(
        reconciler.clone(),
        sweep_interval,
        shutdown_rx.clone(),
    ));

    let session_task = tokio::spawn(session_watch_loop(
        controller.clone(),
        sessions,
        sweep_interval,
        shutdown_rx.clone(),
    ));

    let server_controller = controller.clone();
    let socket_path = config.daemon.socket.clone();
    let server_tx = shutdown_tx.clone();
    let server_rx = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        server::serve(&socket_path, server_controller, started_at, server_tx, server_rx).await
    });

    let signal_tx = shutdown_tx.clone();
    let signal_task = tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
            }
        }

        let _ = signal_tx.send(true);
    });

    // Wait for shutdown from either the signal handler or an IPC request.
    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => info!("request server exited"),
                Ok(Err(e)) => error!(error = %e, "request server failed"),
                Err(e) => error!(error = %e, "request server task panicked"),
            }
        }
        _ = signal_task => {
            info!("signal handler triggered shutdown");
        }
    }
    let _ = shutdown_tx.send(true);

    let _ = sweep_task.await;
    let _ = session_task.await;

    // Every grant is temporary: service stop revokes them all. Failures stay
    // in the ledger and are retried by the startup sweep next run.
    let drain_controller = controller.clone();
    let revoked = tokio::task::spawn_blocking(move || {
        drain_controller.drain(RevokeReason::ServiceStopped)
    })
    .await
    .context("shutdown drain panicked")?;
    info!(revoked, "shutdown complete");

    if config.daemon.socket.exists() {
        let _ = std::fs::remove_file(&config.daemon.socket);
    }

    Ok(())
}

/// Runs the reconciliation sweep on a fixed interval until shutdown. A tick
/// arriving while the previous sweep still runs is skipped.
async fn sweep_loop(
    reconciler: Arc<Reconciler>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let reconciler = reconciler.clone();
                let result = tokio::task::spawn_blocking(move || {
                    reconciler.try_sweep(Utc::now())
                })
                .await;
                match result {
                    Ok(Some(report)) if !report.is_quiet() => {
                        debug!(?report, "sweep finished");
                    },
                    Ok(_) => {},
                    Err(e) => error!(error = %e, "sweep task panicked"),
                }
            }
        }
    }
}

/// Polls the session directory and reports vanished sessions as logoffs.
///
/// The principal is cached while the session is live because the session is
/// no longer resolvable once it has ended.
async fn session_watch_loop(
    controller: Arc<GrantController>,
    sessions: Arc<dyn SessionDirectory>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut known: HashMap<SessionId, Principal> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let dir = sessions.clone();
                let known_ids: Vec<SessionId> = known.keys().cloned().collect();
                let snapshot = tokio::task::spawn_blocking(move || {
                    let live = dir.list_sessions()?;
                    let new_pairs: Vec<(SessionId, Principal)> = live
                        .iter()
                        .filter(|s| !known_ids.contains(s))
                        .filter_map(|s| dir.principal_for_session(s).map(|p| (s.clone(), p)))
                        .collect();
                    Ok::<_, DirectoryError>((live, new_pairs))
                })
                .await;

                let (live, new_pairs) = match snapshot {
                    Ok(Ok(snapshot)) => snapshot,
                    Ok(Err(e)) => {
                        warn!(error = %e, "session enumeration failed");
                        continue;
                    },
                    Err(e) => {
                        error!(error = %e, "session watch task panicked");
                        continue;
                    },
                };

                let ended: Vec<Principal> = known
                    .iter()
                    .filter(|(s, _)| !live.contains(s))
                    .map(|(_, p)| p.clone())
                    .collect();
                known.retain(|s, _| live.contains(s));
                known.extend(new_pairs);

                for principal in ended {
                    debug!(principal = %principal, "session ended");
                    let controller = controller.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        controller.handle_principal_logoff(&principal)
                    })
                    .await;
                    if let Ok(Err(e)) = result {
                        warn!(error = %e, "logoff revocation failed, sweep will retry");
                    }
                }
            }
        }
    }
}
