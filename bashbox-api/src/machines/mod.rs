//! Typed client for the machines control plane.
//!
//! Every operation is a JSON HTTP call with the bearer token attached.
//! Mutating calls take a [`ReqOpts`] so the caller can thread the lease
//! nonce header through on a per-call basis.

pub mod types;

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use types::*;

/// Header carrying the lease nonce on mutating calls.
pub const LEASE_NONCE_HEADER: &str = "fly-machine-lease-nonce";

/// Public control-plane endpoint.
pub const PUBLIC_URL: &str = "https://api.machines.dev";
/// In-fabric control-plane endpoint.
pub const INTERNAL_URL: &str = "http://_api.internal:4280";

const NO_BODY: Option<&()> = None;

#[derive(Debug, Error)]
pub enum MachinesError {
    #[error("{url}: status {status} ({body:?})")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("{url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url}: parse response: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl MachinesError {
    /// True when the error is an HTTP response with the given status.
    pub fn is_status(&self, code: StatusCode) -> bool {
        matches!(self, MachinesError::Status { status, .. } if *status == code)
    }
}

/// Extra headers and query parameters for a single call.
#[derive(Debug, Clone, Default)]
pub struct ReqOpts {
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
}

impl ReqOpts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options carrying a lease nonce header.
    pub fn lease_nonce(nonce: &str) -> Self {
        Self::new().header(LEASE_NONCE_HEADER, nonce)
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Machines control-plane client.
#[derive(Debug, Clone)]
pub struct Machines {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl Machines {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Client against the public endpoint.
    pub fn public(token: impl Into<String>) -> Self {
        Self::new(PUBLIC_URL, token)
    }

    /// Client against the in-fabric endpoint.
    pub fn internal(token: impl Into<String>) -> Self {
        Self::new(INTERNAL_URL, token)
    }

    pub async fn create(
        &self,
        app: &str,
        req: &CreateMachineReq,
    ) -> Result<MachineResp, MachinesError> {
        self.send(
            Method::POST,
            &format!("/v1/apps/{app}/machines"),
            Some(req),
            &[StatusCode::OK],
            &ReqOpts::new(),
            None,
        )
        .await
    }

    pub async fn start(
        &self,
        app: &str,
        mach_id: &str,
        opts: ReqOpts,
    ) -> Result<StartResp, MachinesError> {
        self.send(
            Method::POST,
            &format!("/v1/apps/{app}/machines/{mach_id}/start"),
            NO_BODY,
            &[StatusCode::OK],
            &opts,
            None,
        )
        .await
    }

    pub async fn stop(
        &self,
        app: &str,
        mach_id: &str,
        opts: ReqOpts,
    ) -> Result<OkResp, MachinesError> {
        self.send(
            Method::POST,
            &format!("/v1/apps/{app}/machines/{mach_id}/stop"),
            NO_BODY,
            &[StatusCode::OK],
            &opts,
            None,
        )
        .await
    }

    pub async fn destroy(
        &self,
        app: &str,
        mach_id: &str,
        force: bool,
        opts: ReqOpts,
    ) -> Result<OkResp, MachinesError> {
        let opts = opts.query("force", force.to_string());
        self.send(
            Method::DELETE,
            &format!("/v1/apps/{app}/machines/{mach_id}"),
            NO_BODY,
            &[StatusCode::OK],
            &opts,
            None,
        )
        .await
    }

    /// Waits for the machine to reach `state`, up to `timeout`.
    pub async fn wait_for(
        &self,
        app: &str,
        mach_id: &str,
        instance_id: &str,
        timeout: Duration,
        state: &str,
        opts: ReqOpts,
    ) -> Result<OkResp, MachinesError> {
        let opts = opts
            .query("instance_id", instance_id)
            .query("timeout", timeout.as_secs().to_string())
            .query("state", state);
        self.send(
            Method::GET,
            &format!("/v1/apps/{app}/machines/{mach_id}/wait"),
            NO_BODY,
            &[StatusCode::OK],
            &opts,
            // The control plane holds the request open while it waits.
            Some(timeout + Duration::from_secs(15)),
        )
        .await
    }

    pub async fn list(&self, app: &str, opts: ReqOpts) -> Result<Vec<MachineResp>, MachinesError> {
        self.send(
            Method::GET,
            &format!("/v1/apps/{app}/machines"),
            NO_BODY,
            &[StatusCode::OK],
            &opts,
            None,
        )
        .await
    }

    pub async fn lease(
        &self,
        app: &str,
        mach_id: &str,
        req: &LeaseReq,
        opts: ReqOpts,
    ) -> Result<LeaseResp, MachinesError> {
        self.send(
            Method::POST,
            &format!("/v1/apps/{app}/machines/{mach_id}/lease"),
            Some(req),
            &[StatusCode::OK, StatusCode::CREATED],
            &opts,
            None,
        )
        .await
    }

    pub async fn get_lease(
        &self,
        app: &str,
        mach_id: &str,
        opts: ReqOpts,
    ) -> Result<LeaseResp, MachinesError> {
        self.send(
            Method::GET,
            &format!("/v1/apps/{app}/machines/{mach_id}/lease"),
            NO_BODY,
            &[StatusCode::OK],
            &opts,
            None,
        )
        .await
    }

    async fn send<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        ok_codes: &[StatusCode],
        opts: &ReqOpts,
        timeout: Option<Duration>,
    ) -> Result<T, MachinesError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, path);

        let mut req = self
            .client
            .request(method, url.as_str())
            .bearer_auth(&self.token)
            .query(&opts.query);
        for (key, value) in &opts.headers {
            req = req.header(key, value);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }

        let resp = req.send().await.map_err(|source| MachinesError::Transport {
            url: url.clone(),
            source,
        })?;

        let status = resp.status();
        if !ok_codes.contains(&status) {
            let body = resp.text().await.unwrap_or_default();
            return Err(MachinesError::Status { url, status, body });
        }

        resp.json().await.map_err(|source| MachinesError::Decode { url, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_status_matches_only_http_errors() {
        let err = MachinesError::Status {
            url: "http://x/y".into(),
            status: StatusCode::PRECONDITION_FAILED,
            body: String::new(),
        };
        assert!(err.is_status(StatusCode::PRECONDITION_FAILED));
        assert!(!err.is_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn lease_nonce_opts_carry_the_header() {
        let opts = ReqOpts::lease_nonce("abc123");
        assert_eq!(
            opts.headers,
            vec![(LEASE_NONCE_HEADER.to_string(), "abc123".to_string())]
        );
    }
}
