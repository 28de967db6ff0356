//! Connection handler: control commands against the queue core
//!
//! Commands serialize against the core's critical section, so no two
//! Enqueue calls can race for a sequence number.

use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use crate::queue::{CancelOutcome, QueueCore, QueueError, ShutdownSignal};

use super::listener::{read_request, send_response};
use super::messages::{ErrorKind, Request, Response};

/// Serve one client connection until it closes or asks for shutdown.
pub async fn serve_connection(mut stream: UnixStream, core: Arc<QueueCore>) {
    let (read_half, mut write_half) = stream.split();
    let mut reader = BufReader::new(read_half);

    loop {
        let request = match read_request(&mut reader).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Dropping connection after bad request");
                let response = Response::Error {
                    kind: ErrorKind::Internal,
                    message: e.to_string(),
                };
                let _ = send_response(&mut write_half, &response).await;
                break;
            }
        };

        let is_shutdown = matches!(request, Request::Shutdown { .. });
        let response = dispatch(request, &core).await;
        if let Err(e) = send_response(&mut write_half, &response).await {
            debug!(error = %e, "Client went away before the response");
            break;
        }
        if is_shutdown {
            break;
        }
    }
}

async fn dispatch(request: Request, core: &Arc<QueueCore>) -> Response {
    match request {
        Request::Ping => Response::Pong {
            version: env!("CARGO_PKG_VERSION").to_string(),
        },

        Request::Enqueue { spec } => match core.enqueue(spec).await {
            Ok(job) => Response::Accepted { job_id: job.id },
            Err(e) => queue_error_response(e),
        },

        Request::Status { job_id: Some(job_id) } => match core.job_view(&job_id).await {
            Some(job) => Response::Job { job },
            None => Response::Error {
                kind: ErrorKind::JobNotFound,
                message: format!("job not found: {}", job_id),
            },
        },

        Request::Status { job_id: None } => Response::Status {
            snapshot: core.snapshot().await,
        },

        Request::Cancel { job_id } => match core.cancel(&job_id).await {
            Ok(CancelOutcome::Removed | CancelOutcome::Flagged) => Response::Ok,
            Ok(CancelOutcome::AlreadyTerminal(state)) => Response::Error {
                kind: ErrorKind::Internal,
                message: format!("job already {}", state),
            },
            Err(e) => queue_error_response(e),
        },

        Request::Shutdown { force } => {
            info!(force, "Shutdown requested over IPC");
            let signal = if force {
                ShutdownSignal::Immediate
            } else {
                ShutdownSignal::Graceful
            };
            core.begin_shutdown(signal).await;
            Response::Ok
        }
    }
}

fn queue_error_response(e: QueueError) -> Response {
    let kind = match &e {
        QueueError::InvalidSpec(_) => ErrorKind::InvalidSpec,
        QueueError::NotFound(_) => ErrorKind::JobNotFound,
        QueueError::ShuttingDown => ErrorKind::ShuttingDown,
        QueueError::Durability(_) => ErrorKind::Internal,
    };
    Response::Error {
        kind,
        message: e.to_string(),
    }
}
