//! Control-plane client: trait and HTTP implementation.
//!
//! Watch-style endpoints use the agent's blocking queries: the caller
//! passes the continuation token from the previous response (an index, or
//! a content hash for agent-local endpoints) and the server holds the
//! request open until the value changes or the wait expires. A response
//! with an unchanged token means "timed out, nothing new".

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use connect_core::{Error, Result};

use crate::api::{
    AgentService, AuthorizeRequest, AuthorizeResponse, CaRootList, LeafCertificate,
    PreparedQueryResponse, ServiceEntry,
};

/// Server-side hold time for blocking queries.
pub const WATCH_WAIT: Duration = Duration::from_secs(600);

/// Client-side grace added on top of [`WATCH_WAIT`] before a request is
/// considered hung.
const REQUEST_GRACE: Duration = Duration::from_secs(60);

/// Access to the catalog/identity/authorization API of the mesh agent.
///
/// All watch methods return `(value, token)`; callers feed the token back
/// on the next call and treat `token == previous` as a timeout with no
/// change.
#[async_trait]
pub trait MeshClient: Send + Sync + 'static {
    /// All services registered with the local agent.
    async fn agent_services(&self) -> Result<HashMap<String, AgentService>>;

    /// One service registration, long-polled on its content hash.
    ///
    /// Pass an empty hash for an immediate response.
    async fn agent_service(&self, id: &str, wait_hash: &str) -> Result<(AgentService, String)>;

    /// The root CA bundle, long-polled on its index.
    async fn ca_roots(&self, wait_index: u64) -> Result<(CaRootList, u64)>;

    /// The leaf identity for a service, long-polled on its index.
    async fn leaf_certificate(
        &self,
        service_name: &str,
        wait_index: u64,
    ) -> Result<(LeafCertificate, u64)>;

    /// Mesh-capable, health-filtered instances of a service, long-polled
    /// on the catalog index.
    async fn service_health(
        &self,
        service: &str,
        datacenter: &str,
        wait_index: u64,
    ) -> Result<(Vec<ServiceEntry>, u64)>;

    /// Execute a prepared query (no long poll; callers poll periodically).
    async fn execute_prepared_query(
        &self,
        query: &str,
        datacenter: &str,
    ) -> Result<Vec<ServiceEntry>>;

    /// Ask whether a caller identity may connect to a target service.
    async fn authorize(&self, request: &AuthorizeRequest) -> Result<AuthorizeResponse>;
}

/// [`MeshClient`] over the agent's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpMeshClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl HttpMeshClient {
    /// Create a client for the agent at `addr` (`host:port`).
    pub fn new(addr: &str, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(WATCH_WAIT + REQUEST_GRACE)
            .build()
            .map_err(|e| Error::transport("client construction", e))?;

        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{addr}")
        };

        Ok(Self {
            base_url,
            token,
            http,
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.get(format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            req = req.header("X-Consul-Token", token);
        }
        req
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.post(format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            req = req.header("X-Consul-Token", token);
        }
        req
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        operation: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<(T, reqwest::header::HeaderMap)> {
        let resp = req
            .send()
            .await
            .map_err(|e| Error::transport(operation.to_string(), e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::InvalidResponse {
                operation: operation.to_string(),
                reason: format!("status {status}: {body}"),
            });
        }

        let headers = resp.headers().clone();
        let value = resp
            .json()
            .await
            .map_err(|e| Error::InvalidResponse {
                operation: operation.to_string(),
                reason: e.to_string(),
            })?;
        Ok((value, headers))
    }

    fn header_index(headers: &reqwest::header::HeaderMap, fallback: u64) -> u64 {
        headers
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(fallback)
    }

    fn header_hash(headers: &reqwest::header::HeaderMap) -> String {
        headers
            .get("X-Consul-ContentHash")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    fn wait_param() -> String {
        format!("{}s", WATCH_WAIT.as_secs())
    }
}

#[async_trait]
impl MeshClient for HttpMeshClient {
    async fn agent_services(&self) -> Result<HashMap<String, AgentService>> {
        let (services, _) =
            Self::send_json("agent services", self.get("/v1/agent/services")).await?;
        Ok(services)
    }

    async fn agent_service(&self, id: &str, wait_hash: &str) -> Result<(AgentService, String)> {
        let mut req = self.get(&format!("/v1/agent/service/{id}"));
        if !wait_hash.is_empty() {
            req = req.query(&[("hash", wait_hash), ("wait", &Self::wait_param())]);
        }
        let (service, headers) = Self::send_json("agent service", req).await?;
        Ok((service, Self::header_hash(&headers)))
    }

    async fn ca_roots(&self, wait_index: u64) -> Result<(CaRootList, u64)> {
        let req = self.get("/v1/agent/connect/ca/roots").query(&[
            ("index", wait_index.to_string()),
            ("wait", Self::wait_param()),
        ]);
        let (roots, headers) = Self::send_json("ca roots", req).await?;
        Ok((roots, Self::header_index(&headers, wait_index)))
    }

    async fn leaf_certificate(
        &self,
        service_name: &str,
        wait_index: u64,
    ) -> Result<(LeafCertificate, u64)> {
        let req = self
            .get(&format!("/v1/agent/connect/ca/leaf/{service_name}"))
            .query(&[
                ("index", wait_index.to_string()),
                ("wait", Self::wait_param()),
            ]);
        let (leaf, headers) = Self::send_json("leaf certificate", req).await?;
        Ok((leaf, Self::header_index(&headers, wait_index)))
    }

    async fn service_health(
        &self,
        service: &str,
        datacenter: &str,
        wait_index: u64,
    ) -> Result<(Vec<ServiceEntry>, u64)> {
        let mut req = self.get(&format!("/v1/health/connect/{service}")).query(&[
            ("passing", "1".to_string()),
            ("index", wait_index.to_string()),
            ("wait", Self::wait_param()),
        ]);
        if !datacenter.is_empty() {
            req = req.query(&[("dc", datacenter)]);
        }
        let (entries, headers) = Self::send_json("service health", req).await?;
        Ok((entries, Self::header_index(&headers, wait_index)))
    }

    async fn execute_prepared_query(
        &self,
        query: &str,
        datacenter: &str,
    ) -> Result<Vec<ServiceEntry>> {
        let mut req = self
            .get(&format!("/v1/query/{query}/execute"))
            .query(&[("connect", "true")]);
        if !datacenter.is_empty() {
            req = req.query(&[("dc", datacenter)]);
        }
        let (resp, _): (PreparedQueryResponse, _) =
            Self::send_json("prepared query", req).await?;
        Ok(resp.nodes)
    }

    async fn authorize(&self, request: &AuthorizeRequest) -> Result<AuthorizeResponse> {
        let req = self.post("/v1/agent/connect/authorize").json(request);
        let (resp, _) = Self::send_json("authorize", req).await?;
        Ok(resp)
    }
}
