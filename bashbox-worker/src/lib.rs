//! bashbox worker.
//!
//! A worker accepts exactly one `POST /run` during its life: it verifies the
//! coordinator's signed token, executes the body as a shell command, streams
//! stdout/stderr back as server-sent events, and then shuts itself down.
//! Any later request is answered with 409.

use std::collections::HashMap;
use std::convert::Infallible;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Query, Request, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use bashbox_auth::Verifier;

const COPY_BUF_SIZE: usize = 4096;

/// State shared across the worker's handlers.
#[derive(Clone)]
pub struct WorkerState {
    pub verifier: Arc<Verifier>,
    pub machine_id: String,
    /// Set by the first admitted request; later requests get 409.
    pub used: Arc<AtomicBool>,
    /// Signalled once the single request has been served, so the server can
    /// shut itself down.
    pub done: Arc<Notify>,
}

impl WorkerState {
    pub fn new(verifier: Verifier, machine_id: impl Into<String>) -> Self {
        Self {
            verifier: Arc::new(verifier),
            machine_id: machine_id.into(),
            used: Arc::new(AtomicBool::new(false)),
            done: Arc::new(Notify::new()),
        }
    }
}

/// Builds the worker application: `POST /run` behind token verification and
/// the single-use gate.
pub fn create_app(state: WorkerState) -> Router {
    Router::new()
        .route("/run", post(handle_run))
        .layer(middleware::from_fn_with_state(state.clone(), require_once))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}

async fn require_auth(State(state): State<WorkerState>, req: Request, next: Next) -> Response {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if state.verifier.verify(Utc::now(), token).is_err() {
        return (StatusCode::UNAUTHORIZED, "unauthorized\n").into_response();
    }

    next.run(req).await
}

async fn require_once(State(state): State<WorkerState>, req: Request, next: Next) -> Response {
    if state.used.swap(true, Ordering::SeqCst) {
        return (StatusCode::CONFLICT, "conflict\n").into_response();
    }

    let resp = next.run(req).await;
    // One request per life; let the server drain this response and exit.
    state.done.notify_one();
    resp
}

async fn handle_run(
    State(state): State<WorkerState>,
    Query(params): Query<HashMap<String, String>>,
    req: Request,
) -> Response {
    let raw = params.get("raw").is_some_and(|v| !v.is_empty());

    let body = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(body) => body,
        Err(_) => return (StatusCode::BAD_REQUEST, "bad request\n").into_response(),
    };
    let script = String::from_utf8_lossy(&body).into_owned();
    debug!(raw, bytes = body.len(), "running script");

    let mut child = match Command::new("/bin/bash")
        .arg("-c")
        .arg(&script)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            warn!(error = %err, "spawning bash failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "spawn failed\n").into_response();
        }
    };

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "pipe failed\n").into_response();
    };

    // stdout and stderr are forwarded as they arrive; the channel serialises
    // the two copiers into one response stream.
    let (tx, rx) = mpsc::channel::<Bytes>(16);
    let out_copier = tokio::spawn(copy_frames("stdout", stdout, tx.clone(), raw));
    let err_copier = tokio::spawn(copy_frames("stderr", stderr, tx.clone(), raw));

    tokio::spawn(async move {
        let _ = out_copier.await;
        let _ = err_copier.await;

        let code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(err) => {
                warn!(error = %err, "waiting for command failed");
                1
            }
        };
        debug!(code, "command exited");

        let frame = if raw {
            format!("\nexit: {code}\n")
        } else {
            format!("event: exit\ndata: {{\"code\":{code}}}\n\n")
        };
        let _ = tx.send(Bytes::from(frame)).await;
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);

    let mut resp = Response::new(Body::from_stream(stream));
    resp.headers_mut().insert(
        HeaderName::from_static("worker"),
        HeaderValue::from_str(&state.machine_id)
            .unwrap_or_else(|_| HeaderValue::from_static("unknown")),
    );
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    resp
}

/// Reads one output pipe and forwards it in 4K chunks, either raw or framed
/// as server-sent events with the chunk JSON-encoded.
async fn copy_frames(
    event: &'static str,
    mut pipe: impl tokio::io::AsyncRead + Unpin,
    tx: mpsc::Sender<Bytes>,
    raw: bool,
) {
    let mut buf = [0u8; COPY_BUF_SIZE];
    loop {
        let n = match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        let text = String::from_utf8_lossy(&buf[..n]).into_owned();
        let frame = if raw {
            text
        } else {
            format!(
                "event: {event}\ndata: {}\n\n",
                serde_json::to_string(&text).unwrap_or_default()
            )
        };

        if tx.send(Bytes::from(frame)).await.is_err() {
            // Client went away; stop reading.
            break;
        }
    }
}
