//! Request authentication for signed exchange endpoints
//!
//! Builds the canonical query string, appends a millisecond timestamp
//! when the caller has not supplied one, and signs with HMAC-SHA256
//! under the account secret. The signature is the lowercase hex digest
//! of the exact string submitted before `&signature=`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::Credentials;
use crate::error::{BridgeError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the API key on every authenticated call.
pub const API_KEY_HEADER: &str = "X-MBX-APIKEY";

pub struct Authenticator {
    api_key: String,
    secret_key: String,
    use_testnet: bool,
}

impl Authenticator {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            api_key: credentials.api_key,
            secret_key: credentials.secret_key,
            use_testnet: credentials.use_testnet,
        }
    }

    /// Load credentials from the vault file at `path`.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self::new(Credentials::load(path)?))
    }

    /// Replace the credentials in place (explicit reload).
    pub fn reload(&mut self, credentials: Credentials) {
        self.api_key = credentials.api_key;
        self.secret_key = credentials.secret_key;
        self.use_testnet = credentials.use_testnet;
    }

    pub fn has_valid_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.secret_key.is_empty()
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn is_testnet(&self) -> bool {
        self.use_testnet
    }

    /// Sign a parameter list, preserving insertion order.
    ///
    /// Appends `timestamp=<ms>` unless the caller already provided one,
    /// then returns `<query>&signature=<hex>`.
    pub fn sign(&self, params: &[(&str, String)]) -> Result<String> {
        let mut query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");

        if !params.iter().any(|(k, _)| *k == "timestamp") {
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(&format!("timestamp={}", timestamp_ms()));
        }

        let signature = self.sign_query(&query)?;
        Ok(format!("{query}&signature={signature}"))
    }

    /// HMAC-SHA256 over the exact query string, lowercase hex.
    pub fn sign_query(&self, query: &str) -> Result<String> {
        if !self.has_valid_credentials() {
            return Err(BridgeError::Auth("credentials not loaded".to_string()));
        }
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| BridgeError::Auth(format!("failed to init signer: {e}")))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Milliseconds since the Unix epoch.
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_auth() -> Authenticator {
        Authenticator::new(Credentials {
            api_key: "vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A".to_string(),
            secret_key: "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j"
                .to_string(),
            use_testnet: true,
        })
    }

    #[test]
    fn test_signature_matches_exchange_documentation_vector() {
        // Published reference vector from the exchange API docs.
        let auth = test_auth();
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1\
                     &recvWindow=5000&timestamp=1499827319559";
        let signature = auth.sign_query(query).unwrap();
        assert_eq!(
            signature,
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_sign_preserves_insertion_order_and_appends_timestamp() {
        let auth = test_auth();
        let params = vec![
            ("symbol", "BTCUSDT".to_string()),
            ("side", "BUY".to_string()),
        ];
        let signed = auth.sign(&params).unwrap();
        assert!(signed.starts_with("symbol=BTCUSDT&side=BUY&timestamp="));
        assert!(signed.contains("&signature="));
    }

    #[test]
    fn test_sign_respects_caller_timestamp() {
        let auth = test_auth();
        let params = vec![
            ("listenKey", "abc".to_string()),
            ("timestamp", "1499827319559".to_string()),
        ];
        let signed = auth.sign(&params).unwrap();
        assert!(signed.starts_with("listenKey=abc&timestamp=1499827319559&signature="));
        // Exactly one timestamp parameter.
        assert_eq!(signed.matches("timestamp=").count(), 1);
    }

    #[test]
    fn test_signing_without_credentials_fails() {
        let auth = Authenticator::new(Credentials {
            api_key: String::new(),
            secret_key: String::new(),
            use_testnet: true,
        });
        assert!(!auth.has_valid_credentials());
        assert!(matches!(
            auth.sign_query("a=1").unwrap_err(),
            BridgeError::Auth(_)
        ));
    }
}
