// Requester identification.
//
// Feed requests arrive with a service JWT whose `iss` claim is the
// requester's DID. Verifying the signature against the requester's signing
// key is the identity resolver's job and sits outside this service; here
// we extract the claim behind a small trait so the server can swap in a
// verifying implementation (or a fixed-DID one for tests).

use anyhow::{Context, Result};
use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;

pub trait RequesterAuth: Send + Sync {
    /// The authenticated requester DID, or an error when the request
    /// carries no usable identity.
    fn requester_did(&self, headers: &HeaderMap) -> Result<String>;
}

/// Claim-extracting authenticator: reads `iss` from the bearer JWT payload.
pub struct JwtClaimAuth;

#[derive(Deserialize)]
struct Claims {
    iss: String,
}

impl RequesterAuth for JwtClaimAuth {
    fn requester_did(&self, headers: &HeaderMap) -> Result<String> {
        let header = headers
            .get(axum::http::header::AUTHORIZATION)
            .context("Missing Authorization header")?
            .to_str()
            .context("Authorization header is not valid UTF-8")?;
        let token = header
            .strip_prefix("Bearer ")
            .context("Authorization header is not a bearer token")?;

        let payload = token
            .split('.')
            .nth(1)
            .context("Malformed JWT: no payload segment")?;
        let decoded = URL_SAFE_NO_PAD
            .decode(payload)
            .context("Malformed JWT: payload is not base64url")?;
        let claims: Claims =
            serde_json::from_slice(&decoded).context("Malformed JWT: payload is not JSON")?;

        if !claims.iss.starts_with("did:") {
            anyhow::bail!("JWT iss claim is not a DID");
        }
        Ok(claims.iss)
    }
}

/// Fixed-identity authenticator for tests and local development.
pub struct StaticAuth(pub String);

impl RequesterAuth for StaticAuth {
    fn requester_did(&self, _headers: &HeaderMap) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn bearer(claims: &serde_json::Value) -> HeaderMap {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256K"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        let token = format!("{header}.{payload}.sig");
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn test_extracts_iss_did() {
        let headers = bearer(&serde_json::json!({
            "iss": "did:plc:requester",
            "aud": "did:web:feed.example.com",
        }));
        let did = JwtClaimAuth.requester_did(&headers).unwrap();
        assert_eq!(did, "did:plc:requester");
    }

    #[test]
    fn test_rejects_missing_header() {
        assert!(JwtClaimAuth.requester_did(&HeaderMap::new()).is_err());
    }

    #[test]
    fn test_rejects_non_did_iss() {
        let headers = bearer(&serde_json::json!({"iss": "not-a-did"}));
        assert!(JwtClaimAuth.requester_did(&headers).is_err());
    }
}
