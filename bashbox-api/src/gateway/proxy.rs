//! The `POST /run` pipeline: buffer the body, allocate a worker, delegate
//! with a signed token, proxy with connection-level retries, and stream the
//! worker's response back chunk by chunk.

use std::error::Error as _;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::StreamExt;
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::AppState;

/// Attempts against a worker whose HTTP listener may still be coming up.
const RETRY_TIMES: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_millis(20);

static REPLAY_STATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"state=retries-(-?\d+)$").expect("replay-state regex"));

/// Parses `retries_remaining` out of a `fly-replay-src` header value.
fn parse_retries(replay_src: &str) -> Option<i64> {
    let caps = REPLAY_STATE_RE.captures(replay_src)?;
    caps[1].parse().ok()
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    (status, format!("{msg}\n")).into_response()
}

/// `POST /run`. The response always carries a `coord` header naming this
/// coordinator instance.
pub async fn run(State(state): State<AppState>, req: Request) -> Response {
    let machine_id = state.machine_id.clone();
    let stats = state.stats.clone();
    let mut resp = proxy_to_worker(state, req).await;
    if let Ok(value) = HeaderValue::from_str(&machine_id) {
        resp.headers_mut()
            .insert(HeaderName::from_static("coord"), value);
    }
    debug!(
        request = ?stats.request.stats(),
        proxy = ?stats.proxy.stats(),
        "coord: request stats"
    );
    resp
}

async fn proxy_to_worker(state: AppState, req: Request) -> Response {
    let _request_timer = state.stats.request.start();

    let (parts, body) = req.into_parts();

    // The body is replayed across connection retries, so buffer all of it.
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(err) => {
            error!(error = %err, "coord: read body failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "read body failed");
        }
    };

    let mut retries_remaining: i64 = 1;
    if let Some(meta) = parts
        .headers
        .get("fly-replay-src")
        .and_then(|v| v.to_str().ok())
    {
        debug!(meta, "coord: replay metadata");
        if let Some(parsed) = parse_retries(meta) {
            retries_remaining = parsed;
        }
    }

    let wait_for_machine = retries_remaining <= 0;
    let worker = match state.pool.alloc(wait_for_machine).await {
        Ok(worker) => worker,
        Err(err) => {
            error!(error = %err, "coord: pool alloc failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "create worker failed");
        }
    };

    let Some(worker) = worker else {
        if retries_remaining <= 0 {
            info!("coord: no worker available, out of retries");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "no worker available");
        }

        // Ask the edge to replay this request on a sibling coordinator.
        let retries_remaining = retries_remaining - 1;
        info!(retries_remaining, "coord: no worker available, replaying");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(
                "fly-replay",
                format!("elsewhere=true;state=retries-{retries_remaining}"),
            )],
            "no worker available\n",
        )
            .into_response();
    };

    let worker_id = worker.id();
    let mut url = format!("{}{}", worker.url(), parts.uri.path());
    if let Some(query) = parts.uri.query() {
        url.push('?');
        url.push_str(query);
    }

    let mut headers = parts.headers.clone();
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    let instance = HeaderValue::from_str(&worker_id);
    let token = HeaderValue::from_str(&state.signer.sign(Utc::now(), &worker_id));
    match (instance, token) {
        (Ok(instance), Ok(token)) => {
            headers.insert(HeaderName::from_static("fly-force-instance-id"), instance);
            headers.insert(header::AUTHORIZATION, token);
        }
        _ => {
            error!(worker = %worker_id, "coord: building delegation headers failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "create worker request failed");
        }
    }

    info!(
        worker = %worker_id,
        method = %parts.method,
        url = %url,
        timeout = ?state.max_req_time,
        "coord: proxying to worker"
    );

    let upstream = {
        let _proxy_timer = state.stats.proxy.start();
        do_with_retry(
            &state.http,
            parts.method.clone(),
            &url,
            headers,
            body,
            state.max_req_time,
        )
        .await
    };

    let upstream = match upstream {
        Ok(upstream) => upstream,
        Err(err) if err.is_timeout() => {
            // Bytes may already be on the wire; end without an error body.
            warn!("coord: worker request timed out");
            return StatusCode::OK.into_response();
        }
        Err(err) => {
            error!(error = %err, "coord: worker request failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "make worker request failed");
        }
    };

    if let Some(id) = upstream.headers().get("worker").and_then(|v| v.to_str().ok()) {
        if id != worker_id {
            warn!(got = id, want = %worker_id, "coord: request went to the wrong worker");
        }
    }

    let mut resp = Response::builder().status(upstream.status());
    if let Some(resp_headers) = resp.headers_mut() {
        for (name, value) in upstream.headers() {
            resp_headers.insert(name.clone(), value.clone());
        }
    }

    // The worker handle rides inside the stream: when the client has consumed
    // the response (or disconnected), the stream is dropped and the worker
    // goes back to the pool.
    let stream = upstream.bytes_stream().map(move |chunk| {
        let _held = &worker;
        if let Err(err) = &chunk {
            warn!(error = %err, "coord: streaming worker response failed");
        }
        chunk
    });

    match resp.body(Body::from_stream(stream)) {
        Ok(resp) => resp,
        Err(err) => {
            error!(error = %err, "coord: building response failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "proxy response failed")
        }
    }
}

/// Sends the request, retrying a few times when the connection is refused or
/// reset: the worker machine is "started" before its HTTP listener is
/// reachable through the fabric proxy. The whole retry loop shares one
/// deadline so retries never extend the request budget.
async fn do_with_retry(
    client: &reqwest::Client,
    method: Method,
    url: &str,
    headers: HeaderMap,
    body: Bytes,
    max_req_time: Duration,
) -> Result<reqwest::Response, reqwest::Error> {
    let deadline = Instant::now() + max_req_time;
    let mut delay = RETRY_DELAY;
    let mut attempt = 0;

    loop {
        let result = client
            .request(method.clone(), url)
            .headers(headers.clone())
            .body(body.clone())
            .timeout(deadline.saturating_duration_since(Instant::now()))
            .send()
            .await;

        attempt += 1;
        match result {
            Err(err) if attempt < RETRY_TIMES && is_connection_error(&err) => {
                warn!(error = %err, delay = ?delay, "coord: worker connection failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            other => return other,
        }
    }
}

/// True for ECONNREFUSED/ECONNRESET anywhere in the error chain. Anything
/// else is not retriable.
fn is_connection_error(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
            );
        }
        source = cause.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_replay_retries() {
        assert_eq!(parse_retries("state=retries-3"), Some(3));
        assert_eq!(parse_retries("instance=abc;t=123;state=retries-0"), Some(0));
        assert_eq!(parse_retries("state=retries--1"), Some(-1));
    }

    #[test]
    fn ignores_malformed_replay_state() {
        assert_eq!(parse_retries(""), None);
        assert_eq!(parse_retries("state=retries-x"), None);
        // The state must be the final field.
        assert_eq!(parse_retries("state=retries-2;instance=abc"), None);
    }

    #[tokio::test]
    async fn connection_refused_is_retriable() {
        // Grab an ephemeral port with nothing listening behind it.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = reqwest::Client::new();
        let err = client
            .get(format!("http://{addr}/"))
            .send()
            .await
            .unwrap_err();
        assert!(is_connection_error(&err));
    }

    #[tokio::test]
    async fn timeout_is_not_retriable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept but never respond.
        tokio::spawn(async move {
            let _socket = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = reqwest::Client::new();
        let err = client
            .get(format!("http://{addr}/"))
            .timeout(Duration::from_millis(50))
            .send()
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(!is_connection_error(&err));
    }
}
