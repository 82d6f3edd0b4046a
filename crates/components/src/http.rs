//! JSON-over-HTTP client shared by the component workflows.

use std::time::Duration;

use cairn_core::{Error, Result};
use reqwest::{Method, RequestBuilder};
use serde_json::Value;
use tracing::debug;

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    /// Every request made through this client is bounded by `timeout`.
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::http(format!("building http client: {}", e)))?;
        Ok(Self { http, base: base.into().trim_end_matches('/').to_string() })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn request(&self, method: Method, path: &str, token: Option<&str>) -> RequestBuilder {
        let req = self.http.request(method, self.url(path));
        match token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    async fn finish(path: &str, req: RequestBuilder) -> Result<Vec<u8>> {
        let resp = req.send().await.map_err(|e| Error::http(format!("{}: {}", path, e)))?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| Error::http(format!("{}: reading body: {}", path, e)))?;
        debug!(path = %path, status = status.as_u16(), bytes = body.len(), "http response");
        if !status.is_success() {
            return Err(Error::Upstream {
                resource: path.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body.to_vec())
    }

    fn parse(body: &[u8]) -> Result<Value> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(body)?)
    }

    pub async fn get_json(&self, path: &str, query: &[(&str, &str)], token: Option<&str>) -> Result<Value> {
        let req = self.request(Method::GET, path, token).query(query);
        Self::parse(&Self::finish(path, req).await?)
    }

    /// Send `body` as JSON; an empty response body yields `Value::Null`.
    pub async fn send_json(&self, method: Method, path: &str, token: Option<&str>, body: &Value) -> Result<Value> {
        let req = self.request(method, path, token).json(body);
        Self::parse(&Self::finish(path, req).await?)
    }

    pub async fn download(&self, path: &str) -> Result<Vec<u8>> {
        Self::finish(path, self.request(Method::GET, path, None)).await
    }

    /// Poll the base URL until anything answers.
    ///
    /// The first poll is immediate; connection failures retry every
    /// `interval`. Any HTTP status, errors included, counts as reachable.
    /// The loop is dropped when `deadline` expires.
    pub async fn wait_reachable(&self, interval: Duration, deadline: Duration) -> Result<()> {
        let poll = async {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut attempts = 0u32;
            loop {
                ticker.tick().await;
                attempts += 1;
                match self.http.get(&self.base).send().await {
                    Ok(resp) => {
                        debug!(url = %self.base, status = resp.status().as_u16(), attempts, "service reachable");
                        return;
                    }
                    Err(e) => debug!(url = %self.base, attempts, error = %e, "service not reachable yet"),
                }
            }
        };
        tokio::time::timeout(deadline, poll)
            .await
            .map_err(|_| Error::Timeout(format!("{} not reachable within {}s", self.base, deadline.as_secs_f64())))
    }
}
