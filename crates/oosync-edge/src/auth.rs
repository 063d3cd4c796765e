//! Bearer JWT verification: HS256 against a shared secret, or ES256
//! against the issuer's JWKS endpoint with a per-URL key-set cache.

use std::collections::HashMap;

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

use crate::config::JwtVerifier;
use crate::error::{EdgeError, Result};

#[derive(Debug, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[allow(dead_code)]
    pub exp: Option<usize>,
}

// ============================================================================
// JWKS cache
// ============================================================================

/// Fetches a JWKS once per URL and keeps it for the process lifetime.
pub struct JwksCache {
    http: reqwest::Client,
    sets: Mutex<HashMap<String, JwkSet>>,
}

impl Default for JwksCache {
    fn default() -> Self {
        Self::new()
    }
}

impl JwksCache {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            sets: Mutex::new(HashMap::new()),
        }
    }

    async fn get(&self, url: &str) -> Result<JwkSet> {
        if let Some(set) = self.sets.lock().get(url) {
            return Ok(set.clone());
        }
        debug!(url, "fetching JWKS");
        let set: JwkSet = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| EdgeError::Jwks(e.to_string()))?
            .json()
            .await
            .map_err(|e| EdgeError::Jwks(e.to_string()))?;
        self.sets.lock().insert(url.to_string(), set.clone());
        Ok(set)
    }
}

// ============================================================================
// Verification
// ============================================================================

/// Verify the `Authorization` header value and return the JWT subject
/// (the user id).
pub async fn verify_bearer(
    header: Option<&str>,
    verifier: &JwtVerifier,
    jwks: &JwksCache,
) -> Result<String> {
    let header = header.ok_or_else(|| EdgeError::Unauthorized("missing bearer token".to_string()))?;
    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .ok_or_else(|| EdgeError::Unauthorized("malformed Authorization header".to_string()))?;

    let claims = match verifier {
        JwtVerifier::Hs256 { secret } => {
            if secret.is_empty() {
                return Err(EdgeError::Config("empty JWT secret".to_string()));
            }
            let key = DecodingKey::from_secret(secret.as_bytes());
            decode::<Claims>(token, &key, &Validation::new(Algorithm::HS256))
                .map_err(|e| EdgeError::Unauthorized(e.to_string()))?
                .claims
        }
        JwtVerifier::Es256 { jwks_url } => {
            let header = decode_header(token).map_err(|e| EdgeError::Unauthorized(e.to_string()))?;
            let kid = header
                .kid
                .ok_or_else(|| EdgeError::Unauthorized("token has no key id".to_string()))?;
            let set = jwks.get(jwks_url).await?;
            let jwk = set
                .find(&kid)
                .ok_or_else(|| EdgeError::Unauthorized(format!("unknown key id {kid}")))?;
            let key = DecodingKey::from_jwk(jwk)
                .map_err(|e| EdgeError::Config(format!("unusable JWK: {e}")))?;
            decode::<Claims>(token, &key, &Validation::new(Algorithm::ES256))
                .map_err(|e| EdgeError::Unauthorized(e.to_string()))?
                .claims
        }
    };

    if claims.sub.is_empty() {
        return Err(EdgeError::Unauthorized("token has no subject".to_string()));
    }
    Ok(claims.sub)
}

// ============================================================================
// Tests
// ============================================================================
