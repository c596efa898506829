//! Unix socket request server.
//!
//! One task per connection; each connection carries any number of framed
//! requests (4-byte big-endian length prefix + JSON). Controller calls are
//! synchronous and go through `spawn_blocking` so a slow platform command
//! never stalls the accept loop.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use elevd_core::controller::{GrantController, GrantRequestError};
use elevd_core::ipc::{
    self, ElevationRequest, ElevationResponse, ErrorCode, MAX_FRAME_SIZE,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Binds the socket and serves requests until `shutdown` fires.
///
/// Any stale socket file is removed before binding; the socket is created
/// with mode 0660 so membership queries do not require root.
pub async fn serve(
    socket_path: &Path,
    controller: Arc<GrantController>,
    started_at: Instant,
    shutdown_tx: Arc<watch::Sender<bool>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("failed to remove stale socket {}", socket_path.display()))?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind socket {}", socket_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660))
            .context("failed to set socket permissions")?;
    }

    info!(socket = %socket_path.display(), "listening for elevation requests");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                debug!("server shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, _addr) = accepted.context("accept failed")?;
                let controller = controller.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, controller, started_at, shutdown_tx).await {
                        debug!(error = %e, "connection closed with error");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    mut stream: UnixStream,
    controller: Arc<GrantController>,
    started_at: Instant,
    shutdown_tx: Arc<watch::Sender<bool>>,
) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {},
            // Clean EOF between frames ends the connection.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let len = ipc::parse_frame_length(&len_buf).unwrap_or(0);
        if len == 0 || len > MAX_FRAME_SIZE {
            warn!(len, "rejecting oversized or empty frame");
            let resp = ElevationResponse::Error {
                code: ErrorCode::InvalidRequest,
                message: format!("frame length {len} outside accepted range"),
            };
            write_response(&mut stream, &resp).await?;
            return Ok(());
        }

        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;

        let request: ElevationRequest = match serde_json::from_slice(&payload) {
            Ok(req) => req,
            Err(e) => {
                let resp = ElevationResponse::Error {
                    code: ErrorCode::InvalidRequest,
                    message: format!("malformed request: {e}"),
                };
                write_response(&mut stream, &resp).await?;
                continue;
            },
        };

        let is_shutdown = matches!(request, ElevationRequest::Shutdown);
        let response = dispatch(request, &controller, started_at).await;
        write_response(&mut stream, &response).await?;

        if is_shutdown {
            info!("shutdown requested over IPC");
            let _ = shutdown_tx.send(true);
            return Ok(());
        }
    }
}

/// Maps one request to one response. Controller work runs on the blocking
/// pool.
async fn dispatch(
    request: ElevationRequest,
    controller: &Arc<GrantController>,
    started_at: Instant,
) -> ElevationResponse {
    match request {
        ElevationRequest::Ping => ElevationResponse::Pong {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: started_at.elapsed().as_secs(),
        },

        ElevationRequest::Grant {
            principal,
            origin,
            expires_at,
        } => {
            let controller = controller.clone();
            run_blocking(move || {
                match controller.request_grant(&principal, expires_at, origin) {
                    Ok(outcome) => ElevationResponse::Granted {
                        expires_at: outcome.expiration,
                    },
                    // Which list refused stays in the daemon log.
                    Err(GrantRequestError::NotAuthorized { .. }) => ElevationResponse::Error {
                        code: ErrorCode::NotAuthorized,
                        message: "not authorized for elevation".to_string(),
                    },
                    Err(e @ GrantRequestError::GroupAdd { .. }) => ElevationResponse::Error {
                        code: ErrorCode::GroupOperationFailed,
                        message: e.to_string(),
                    },
                    Err(e) => ElevationResponse::Error {
                        code: ErrorCode::InternalError,
                        message: e.to_string(),
                    },
                }
            })
            .await
        },

        ElevationRequest::Revoke { principal, reason } => {
            let controller = controller.clone();
            run_blocking(move || match controller.request_revoke(&principal, reason) {
                Ok(()) => ElevationResponse::Revoked,
                Err(e) => ElevationResponse::Error {
                    code: ErrorCode::GroupOperationFailed,
                    message: e.to_string(),
                },
            })
            .await
        },

        ElevationRequest::IsGranted { principal } => {
            let controller = controller.clone();
            run_blocking(move || ElevationResponse::GrantStatus {
                granted: controller.is_granted(&principal),
            })
            .await
        },

        ElevationRequest::IsSessionGranted { session_id } => {
            let controller = controller.clone();
            run_blocking(move || ElevationResponse::GrantStatus {
                granted: controller.is_session_granted(&session_id),
            })
            .await
        },

        ElevationRequest::ListGrants => {
            let controller = controller.clone();
            run_blocking(move || ElevationResponse::Grants {
                entries: controller.grant_snapshot().iter().cloned().collect(),
            })
            .await
        },

        ElevationRequest::Shutdown => ElevationResponse::Ok,
    }
}

async fn run_blocking<F>(f: F) -> ElevationResponse
where
    F: FnOnce() -> ElevationResponse + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(resp) => resp,
        Err(e) => ElevationResponse::Error {
            code: ErrorCode::InternalError,
            message: format!("worker task failed: {e}"),
        },
    }
}

async fn write_response(stream: &mut UnixStream, response: &ElevationResponse) -> Result<()> {
    let payload = serde_json::to_vec(response).context("failed to serialize response")?;
    stream
        .write_all(&ipc::frame_message(&payload))
        .await
        .context("failed to write response")?;
    Ok(())
}
