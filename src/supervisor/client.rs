//! REST client for the HA supervisor
//!
//! Requests that any member can answer (`/cluster`, switchover, config
//! patches) fall back to the peers' endpoints, HTTP before HTTPS, when the
//! local endpoint is unreachable.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use std::sync::RwLock;

use super::{ClusterMember, ClusterResponse, HaSupervisor, MemberHealth};
use crate::common::{retry_with_backoff, AgentConfig, Error, Result, RetryPolicy};

pub struct HttpSupervisor {
    client: Client,
    local_url: String,
    port: u16,
    peers: RwLock<Vec<String>>,
    retry: RetryPolicy,
}

impl HttpSupervisor {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let scheme = if config.supervisor_tls { "https" } else { "http" };
        Ok(Self {
            client,
            local_url: format!("{}://{}:{}", scheme, config.address, config.supervisor_port),
            port: config.supervisor_port,
            peers: RwLock::new(Vec::new()),
            retry: config.retry_policy(),
        })
    }

    /// Local endpoint first, then every peer over HTTP, then over HTTPS
    fn base_urls(&self) -> Vec<String> {
        let mut urls = vec![self.local_url.clone()];
        let peers = self.peers.read().map(|p| p.clone()).unwrap_or_default();
        for scheme in ["http", "https"] {
            for peer in &peers {
                let url = format!("{}://{}:{}", scheme, peer, self.port);
                if !urls.contains(&url) {
                    urls.push(url);
                }
            }
        }
        urls
    }

    async fn send(
        &self,
        base: &str,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let mut req = self.client.request(method, format!("{}{}", base, path));
        if let Some(body) = body {
            req = req.json(body);
        }
        Ok(req.send().await?)
    }

    async fn check(path: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(Error::Supervisor {
            path: path.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    /// One pass over every base URL; connection-level failures move on to the next
    async fn request_any(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let mut last_err = Error::ConnectionFailed(format!("no endpoint for {}", path));
        for base in self.base_urls() {
            match self.send(&base, method.clone(), path, body).await {
                Ok(resp) => return Self::check(path, resp).await,
                Err(e) => {
                    tracing::debug!("Supervisor {}{} unreachable: {}", base, path, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn get_any<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        retry_with_backoff(
            || async {
                let resp = self.request_any(Method::GET, path, None).await?;
                Ok(resp.json::<T>().await?)
            },
            self.retry,
        )
        .await
    }

    async fn post_any(&self, path: &str, body: serde_json::Value) -> Result<()> {
        retry_with_backoff(
            || async {
                self.request_any(Method::POST, path, Some(&body)).await?;
                Ok(())
            },
            self.retry,
        )
        .await
    }

    async fn local(&self, method: Method, path: &str, body: Option<serde_json::Value>) -> Result<()> {
        retry_with_backoff(
            || async {
                let resp = self
                    .send(&self.local_url, method.clone(), path, body.as_ref())
                    .await?;
                Self::check(path, resp).await?;
                Ok(())
            },
            self.retry,
        )
        .await
    }
}

#[async_trait]
impl HaSupervisor for HttpSupervisor {
    async fn cluster(&self) -> Result<Vec<ClusterMember>> {
        let resp: ClusterResponse = self.get_any("/cluster").await?;
        Ok(resp.members)
    }

    async fn health(&self) -> Result<MemberHealth> {
        // /health answers 503 with a JSON body while the database is down
        retry_with_backoff(
            || async {
                let resp = self
                    .send(&self.local_url, Method::GET, "/health", None)
                    .await?;
                let status = resp.status();
                let text = resp.text().await?;
                serde_json::from_str::<MemberHealth>(&text).map_err(|_| Error::Supervisor {
                    path: "/health".to_string(),
                    status: status.as_u16(),
                    body: text,
                })
            },
            self.retry,
        )
        .await
    }

    async fn switchover(&self, leader: &str, candidate: Option<&str>) -> Result<()> {
        let mut body = serde_json::json!({ "leader": leader });
        if let Some(candidate) = candidate {
            body["candidate"] = serde_json::Value::String(candidate.to_string());
        }
        self.post_any("/switchover", body).await
    }

    async fn failover(&self, candidate: &str) -> Result<()> {
        self.post_any("/failover", serde_json::json!({ "candidate": candidate }))
            .await
    }

    async fn reload(&self) -> Result<()> {
        self.local(Method::POST, "/reload", None).await
    }

    async fn restart(&self) -> Result<()> {
        self.local(Method::POST, "/restart", None).await
    }

    async fn reinitialize(&self) -> Result<()> {
        self.local(Method::POST, "/reinitialize", Some(serde_json::json!({ "force": true })))
            .await
    }

    async fn patch_config(&self, patch: serde_json::Value) -> Result<()> {
        retry_with_backoff(
            || async {
                self.request_any(Method::PATCH, "/config", Some(&patch))
                    .await?;
                Ok(())
            },
            self.retry,
        )
        .await
    }

    fn set_peers(&self, peers: Vec<String>) {
        if let Ok(mut p) = self.peers.write() {
            *p = peers;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_order() {
        let mut cfg = AgentConfig::new("pg/0", "pg", "10.0.0.1");
        cfg.supervisor_tls = true;
        let sup = HttpSupervisor::new(&cfg).unwrap();
        sup.set_peers(vec!["10.0.0.1".into(), "10.0.0.2".into()]);

        assert_eq!(
            sup.base_urls(),
            vec![
                "https://10.0.0.1:8008",
                "http://10.0.0.1:8008",
                "http://10.0.0.2:8008",
                "https://10.0.0.2:8008",
            ]
        );
    }

    #[tokio::test]
    async fn test_unreachable_supervisor_errors() {
        let mut cfg = AgentConfig::new("pg/0", "pg", "127.0.0.1");
        cfg.supervisor_port = 1;
        cfg.retry_attempts = 1;
        cfg.request_timeout_ms = 200;
        let sup = HttpSupervisor::new(&cfg).unwrap();
        assert!(sup.cluster().await.is_err());
    }
}
