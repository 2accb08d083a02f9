//! Docker container factory — creates and manages action containers through
//! the Docker REST API.
//!
//! Talks to the daemon over a Unix socket (hyper 1.x on a `UnixStream`) or a
//! `tcp://` host (reqwest). Containers expose the action runtime proxy on
//! port 8080 of their bridge-network address; the proxy endpoints used here
//! are `/init`, `/run`, `/load` and `/offload`.

use crate::activation::{epoch_ms, ActionRef, ActivationResponse, Interval, TransactionId};
use crate::config::ContainerFactoryConfig;
use crate::container::{Container, ContainerFactory, RunOutput};
use crate::error::{InvokerError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Port of the in-container runtime proxy
const RUNTIME_PROXY_PORT: u16 = 8080;

// ── Docker API response types (minimal subset) ────────────────────────────────

/// Response of `POST /containers/create`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
}

/// Response of `GET /containers/{id}/json` (fields we need)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectResponse {
    network_settings: NetworkSettings,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct NetworkSettings {
    #[serde(default)]
    networks: HashMap<String, Network>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Network {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

/// Resolve the first non-empty IP address from a container's network settings.
fn resolve_ip(settings: &NetworkSettings) -> Option<String> {
    settings
        .networks
        .values()
        .map(|n| n.ip_address.clone())
        .find(|ip| !ip.is_empty())
}

// ── DockerContainerFactory ────────────────────────────────────────────────────

/// Container factory backed by the Docker daemon
pub struct DockerContainerFactory {
    config: ContainerFactoryConfig,
}

impl DockerContainerFactory {
    /// Create a new Docker factory
    pub fn new(config: ContainerFactoryConfig) -> Self {
        Self { config }
    }

    // ── Internal HTTP transport ───────────────────────────────────────────────

    /// Dispatch a request to the Docker API, choosing transport by host scheme.
    async fn docker_call(
        &self,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(u16, Bytes)> {
        let host = &self.config.docker_host;
        if host.starts_with("tcp://") || host.starts_with("http://") {
            self.docker_call_tcp(method, path, body).await
        } else {
            self.docker_call_unix(method, path, body).await
        }
    }

    /// TCP mode — use reqwest against a remote Docker host (`tcp://host:port`)
    async fn docker_call_tcp(
        &self,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(u16, Bytes)> {
        let base = self.config.docker_host.replacen("tcp://", "http://", 1);
        let url = format!("{}/v1.41{}", base, path);
        let client = reqwest::Client::new();
        let req = match method {
            "POST" => client.post(&url),
            "DELETE" => client.delete(&url),
            _ => client.get(&url),
        };
        let req = match body {
            Some(json) => req.json(&json),
            None => req,
        };
        let resp = req
            .send()
            .await
            .map_err(|e| InvokerError::ContainerStart(format!("Docker {} '{}': {}", method, url, e)))?;
        let status = resp.status().as_u16();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| InvokerError::ContainerStart(format!("Docker body '{}': {}", url, e)))?;
        Ok((status, bytes))
    }

    /// Unix socket mode — use hyper 1.x over a `tokio::net::UnixStream`
    #[cfg(unix)]
    async fn docker_call_unix(
        &self,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(u16, Bytes)> {
        use http_body_util::{BodyExt, Full};
        use hyper::client::conn::http1;
        use hyper_util::rt::TokioIo;
        use tokio::net::UnixStream;

        let socket = self.config.docker_host.clone();
        let stream = UnixStream::connect(&socket).await.map_err(|e| {
            InvokerError::ContainerStart(format!("Docker: cannot connect to '{}': {}", socket, e))
        })?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = http1::Builder::new()
            .handshake::<_, Full<Bytes>>(io)
            .await
            .map_err(|e| InvokerError::ContainerStart(format!("Docker handshake: {}", e)))?;

        // Drive the connection in the background; errors are non-fatal here.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let uri = format!("/v1.41{}", path);
        let payload = match body {
            Some(json) => Bytes::from(serde_json::to_vec(&json)?),
            None => Bytes::new(),
        };
        let req = hyper::Request::builder()
            .method(method)
            .uri(uri)
            .header("Host", "localhost")
            .header("Content-Type", "application/json")
            .body(Full::new(payload))
            .map_err(|e| InvokerError::ContainerStart(format!("Docker request build: {}", e)))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| InvokerError::ContainerStart(format!("Docker send: {}", e)))?;

        let status = resp.status().as_u16();
        let bytes = BodyExt::collect(resp.into_body())
            .await
            .map_err(|e| InvokerError::ContainerStart(format!("Docker collect body: {}", e)))?
            .to_bytes();
        Ok((status, bytes))
    }

    /// Unix socket mode is not supported on non-Unix platforms.
    #[cfg(not(unix))]
    async fn docker_call_unix(
        &self,
        _method: &str,
        _path: &str,
        _body: Option<serde_json::Value>,
    ) -> Result<(u16, Bytes)> {
        Err(InvokerError::ContainerStart(
            "Docker Unix socket connections are not supported on this platform. \
             Set container_factory.docker_host to a TCP URL (e.g. tcp://localhost:2375)."
                .to_string(),
        ))
    }
}

#[async_trait]
impl ContainerFactory for DockerContainerFactory {
    async fn create(
        &self,
        tid: &TransactionId,
        name: &str,
        image: &str,
        pull: bool,
        memory_mb: u64,
        cpu_shares: u32,
        _action: Option<&ActionRef>,
    ) -> Result<Arc<dyn Container>> {
        if pull {
            let path = format!("/images/create?fromImage={}", image);
            let (status, body) = self.docker_call("POST", &path, None).await?;
            if status == 404 {
                return Err(InvokerError::ImagePull(format!(
                    "image '{}' not found",
                    image
                )));
            }
            if status >= 400 {
                return Err(InvokerError::ContainerStart(format!(
                    "image pull returned {}: {}",
                    status,
                    String::from_utf8_lossy(&body)
                )));
            }
        }

        let create_body = serde_json::json!({
            "Image": image,
            "HostConfig": {
                "Memory": memory_mb * 1024 * 1024,
                "CpuShares": cpu_shares,
                "NetworkMode": self.config.network,
            },
            "Labels": { "icebreaker.tid": tid },
        });
        let path = format!("/containers/create?name={}", name);
        let (status, body) = self.docker_call("POST", &path, Some(create_body)).await?;
        if status == 404 {
            // Image missing locally and pull was not requested: user fault
            return Err(InvokerError::ImagePull(format!(
                "image '{}' not present",
                image
            )));
        }
        if status >= 400 {
            return Err(InvokerError::ContainerStart(format!(
                "container create returned {}: {}",
                status,
                String::from_utf8_lossy(&body)
            )));
        }
        let created: CreateResponse = serde_json::from_slice(&body)?;

        let (status, body) = self
            .docker_call("POST", &format!("/containers/{}/start", created.id), None)
            .await?;
        if status >= 400 {
            return Err(InvokerError::ContainerStart(format!(
                "container start returned {}: {}",
                status,
                String::from_utf8_lossy(&body)
            )));
        }

        let (status, body) = self
            .docker_call("GET", &format!("/containers/{}/json", created.id), None)
            .await?;
        if status >= 400 {
            return Err(InvokerError::ContainerStart(format!(
                "container inspect returned {}",
                status
            )));
        }
        let inspect: InspectResponse = serde_json::from_slice(&body)?;
        let ip = resolve_ip(&inspect.network_settings).ok_or_else(|| {
            InvokerError::ContainerStart(format!("container '{}' has no IP address", created.id))
        })?;

        tracing::info!(
            tid = %tid,
            container_id = %created.id,
            image = %image,
            ip = %ip,
            "Container started"
        );

        Ok(Arc::new(DockerContainer {
            id: created.id,
            ip,
            factory_config: self.config.clone(),
            client: reqwest::Client::new(),
        }))
    }

    fn name(&self) -> &str {
        "docker"
    }
}

// ── DockerContainer ───────────────────────────────────────────────────────────

/// One running Docker container with a runtime proxy on port 8080
#[derive(Debug)]
pub struct DockerContainer {
    id: String,
    ip: String,
    factory_config: ContainerFactoryConfig,
    client: reqwest::Client,
}

impl DockerContainer {
    fn proxy_url(&self, endpoint: &str) -> String {
        format!("http://{}:{}/{}", self.ip, RUNTIME_PROXY_PORT, endpoint)
    }

    /// POST to a runtime-proxy endpoint with a deadline. Returns the HTTP
    /// status, the body and whether the deadline was hit.
    async fn proxy_post(
        &self,
        endpoint: &str,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<(u16, serde_json::Value, bool)> {
        let url = self.proxy_url(endpoint);
        let fut = self.client.post(&url).json(&body).send();
        match tokio::time::timeout(timeout, fut).await {
            Err(_) => Ok((0, serde_json::Value::Null, true)),
            Ok(Err(e)) if e.is_connect() => Err(InvokerError::ContainerHealth(format!(
                "proxy unreachable at {}: {}",
                url, e
            ))),
            Ok(Err(e)) => Err(InvokerError::ContainerRun(format!("{}: {}", url, e))),
            Ok(Ok(resp)) => {
                let status = resp.status().as_u16();
                let json = resp.json().await.unwrap_or(serde_json::Value::Null);
                Ok((status, json, false))
            }
        }
    }
}

#[async_trait]
impl Container for DockerContainer {
    fn container_id(&self) -> &str {
        &self.id
    }

    fn addr(&self) -> (String, u16) {
        (self.ip.clone(), RUNTIME_PROXY_PORT)
    }

    async fn initialize(
        &self,
        init_body: serde_json::Value,
        timeout: Duration,
        max_concurrent: u32,
    ) -> Result<Interval> {
        let start = epoch_ms();
        let body = serde_json::json!({
            "value": init_body,
            "max_concurrent": max_concurrent,
        });
        let (status, json, timed_out) = self.proxy_post("init", body, timeout).await?;
        if timed_out {
            return Err(InvokerError::ContainerInit("init timed out".into()));
        }
        if status >= 400 {
            return Err(InvokerError::ContainerInit(
                json.get("error")
                    .and_then(|e| e.as_str())
                    .unwrap_or("init failed")
                    .to_string(),
            ));
        }
        Ok(Interval {
            start_ms: start,
            end_ms: epoch_ms(),
        })
    }

    async fn run(
        &self,
        params: serde_json::Value,
        env: serde_json::Value,
        timeout: Duration,
        max_concurrent: u32,
        _reschedule: bool,
    ) -> Result<RunOutput> {
        let start = epoch_ms();
        let body = serde_json::json!({
            "value": params,
            "environment": env,
            "max_concurrent": max_concurrent,
        });
        let (status, json, timed_out) = self.proxy_post("run", body, timeout).await?;
        let interval = Interval {
            start_ms: start,
            end_ms: epoch_ms(),
        };

        let response = if timed_out {
            ActivationResponse::developer_error(format!(
                "action exceeded its time limit of {} ms",
                timeout.as_millis()
            ))
        } else if status < 400 {
            ActivationResponse::Success { result: Some(json) }
        } else if status < 500 {
            ActivationResponse::ApplicationError { error: json }
        } else {
            ActivationResponse::whisk_error(format!("runtime proxy returned {}", status))
        };

        Ok(RunOutput {
            interval,
            response,
            timed_out,
        })
    }

    async fn load(
        &self,
        params: serde_json::Value,
        env: serde_json::Value,
        timeout: Duration,
        max_concurrent: u32,
    ) -> Result<()> {
        let body = serde_json::json!({
            "value": params,
            "environment": env,
            "max_concurrent": max_concurrent,
        });
        let (status, json, timed_out) = self.proxy_post("load", body, timeout).await?;
        if timed_out || status >= 400 {
            return Err(InvokerError::ContainerRun(format!(
                "model load failed (status {}): {}",
                status, json
            )));
        }
        Ok(())
    }

    async fn offload(
        &self,
        params: serde_json::Value,
        env: serde_json::Value,
        timeout: Duration,
        max_concurrent: u32,
    ) -> Result<()> {
        let body = serde_json::json!({
            "value": params,
            "environment": env,
            "max_concurrent": max_concurrent,
        });
        let (status, json, timed_out) = self.proxy_post("offload", body, timeout).await?;
        if timed_out || status >= 400 {
            return Err(InvokerError::ContainerRun(format!(
                "model offload failed (status {}): {}",
                status, json
            )));
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let factory = DockerContainerFactory::new(self.factory_config.clone());
        let path = format!("/containers/{}?force=true", self.id);
        let (status, body) = factory.docker_call("DELETE", &path, None).await?;
        if status >= 400 && status != 404 {
            return Err(InvokerError::Other(format!(
                "container remove returned {}: {}",
                status,
                String::from_utf8_lossy(&body)
            )));
        }
        tracing::debug!(container_id = %self.id, "Container destroyed");
        Ok(())
    }
}
