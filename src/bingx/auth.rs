//! Request signing for the BingX API
//!
//! Private endpoints take the form-encoded query string (including a
//! millisecond `timestamp`) signed with HMAC-SHA256 and appended as the
//! `signature` parameter. The key travels in the `X-BX-APIKEY` header.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{GatewayError, GatewayResult};

type HmacSha256 = Hmac<Sha256>;

pub const API_KEY_HEADER: &str = "X-BX-APIKEY";

/// Hex HMAC-SHA256 of `query` keyed by `secret`
pub fn sign_request(query: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Form-encode `params` in order and append their signature
pub fn signed_query(params: &[(&str, String)], secret: &str) -> GatewayResult<String> {
    let query = serde_urlencoded::to_string(params)
        .map_err(|e| GatewayError::Parse(format!("query encoding: {}", e)))?;
    let signature = sign_request(&query, secret);
    if query.is_empty() {
        Ok(format!("signature={}", signature))
    } else {
        Ok(format!("{}&signature={}", query, signature))
    }
}

/// API credentials container
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Create credentials from environment variables
    ///
    /// Looks for `BINGX_API_KEY` and `BINGX_API_SECRET`
    pub fn from_env() -> Result<Self, std::env::VarError> {
        let api_key = std::env::var("BINGX_API_KEY")?;
        let api_secret = std::env::var("BINGX_API_SECRET")?;
        Ok(Self::new(api_key, api_secret))
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn sign(&self, query: &str) -> String {
        sign_request(query, &self.api_secret)
    }

    pub fn signed_query(&self, params: &[(&str, String)]) -> GatewayResult<String> {
        signed_query(params, &self.api_secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_request() {
        let signature = sign_request("symbol=BTC-USDT&timestamp=1700000000000", "test_secret");

        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2
        assert_eq!(
            sign_request("what do ya want for nothing?", "Jefe"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_different_inputs_produce_different_signatures() {
        let query = "timestamp=1700000000000";
        assert_ne!(sign_request(query, "secret1"), sign_request(query, "secret2"));
        assert_ne!(
            sign_request("timestamp=1", "secret"),
            sign_request("timestamp=2", "secret")
        );
    }

    #[test]
    fn test_signed_query_appends_signature() {
        let params = [
            ("symbol", "BTC-USDT".to_string()),
            ("stopPrice", "101.5".to_string()),
            ("timestamp", "1700000000000".to_string()),
        ];
        let query = signed_query(&params, "s").unwrap();
        let unsigned = "symbol=BTC-USDT&stopPrice=101.5&timestamp=1700000000000";
        assert_eq!(query, format!("{}&signature={}", unsigned, sign_request(unsigned, "s")));
    }

    #[test]
    fn test_signed_query_escapes_reserved() {
        let query = signed_query(&[("clientOrderId", "a b&c=d".to_string())], "s").unwrap();
        assert!(query.starts_with("clientOrderId=a+b%26c%3Dd&signature="));
        assert_eq!(signed_query(&[], "s").unwrap(), format!("signature={}", sign_request("", "s")));
    }

    #[test]
    fn test_debug_hides_secret() {
        let creds = Credentials::new("key", "very-secret");
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("key"));
        assert!(!rendered.contains("very-secret"));
        assert_eq!(creds.sign("x"), sign_request("x", "very-secret"));
    }
}
