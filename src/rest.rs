//! HTTPS client for the exchange REST API
//!
//! Every request runs on a fresh connection (no idle pooling) to avoid
//! stale-socket failures, with a shared 5 s timeout covering send and
//! read. Non-2xx responses carry a `{code, msg}` body which is
//! surfaced as a rejection.

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::auth::{Authenticator, API_KEY_HEADER};
use crate::error::{BridgeError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .pool_max_idle_per_host(0)
            .build()
            .expect("failed to build http client");
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Unauthenticated GET with query parameters.
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "rest get");
        let response = self.http.get(&url).query(query).send().await?;
        Self::decode(response).await
    }

    /// Request with the API key header but no signature (the
    /// user-data-stream endpoints).
    pub async fn keyed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        auth: &Authenticator,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, url = %url, "rest keyed request");
        let response = self
            .http
            .request(method, &url)
            .query(query)
            .header(API_KEY_HEADER, auth.api_key())
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Signed request: parameters (timestamp included) go into the URL
    /// query together with the signature.
    pub async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        auth: &Authenticator,
    ) -> Result<T> {
        let signed_query = auth.sign(params)?;
        let url = format!("{}{}?{}", self.base_url, path, signed_query);
        debug!(method = %method, path = %path, "rest signed request");
        let response = self
            .http
            .request(method, &url)
            .header(API_KEY_HEADER, auth.api_key())
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Connectivity probe.
    pub async fn ping(&self) -> Result<()> {
        let _: Value = self.get("/api/v3/ping", &[]).await?;
        Ok(())
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| BridgeError::Protocol(format!("bad response body: {e}")));
        }
        Err(Self::rejection(status, &body))
    }

    fn rejection(status: StatusCode, body: &str) -> BridgeError {
        // Error bodies look like {"code": -1121, "msg": "Invalid symbol."}
        if let Ok(value) = serde_json::from_str::<Value>(body) {
            let code = value.get("code").and_then(Value::as_i64);
            let msg = value.get("msg").and_then(Value::as_str);
            if let (Some(code), Some(msg)) = (code, msg) {
                return BridgeError::Rejected {
                    code,
                    msg: msg.to_string(),
                };
            }
        }
        BridgeError::Rejected {
            code: status.as_u16() as i64,
            msg: body.chars().take(200).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_parses_exchange_error_body() {
        let err = RestClient::rejection(
            StatusCode::BAD_REQUEST,
            r#"{"code": -1121, "msg": "Invalid symbol."}"#,
        );
        match err {
            BridgeError::Rejected { code, msg } => {
                assert_eq!(code, -1121);
                assert_eq!(msg, "Invalid symbol.");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_rejection_falls_back_to_status() {
        let err = RestClient::rejection(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>");
        match err {
            BridgeError::Rejected { code, .. } => assert_eq!(code, 502),
            other => panic!("unexpected error: {other}"),
        }
    }
}
