//! JWT verification with multi-key (kid) lookup and hot key rotation

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::dynamic::{DynamicConfigHolder, JwkItem};
use crate::error::{codes, gateway_error};
use crate::middleware::{TraceId, UserClaims};

struct KeyEntry {
    key: DecodingKey,
    algorithm: Algorithm,
}

/// kid -> public key map, replaced wholesale when the dynamic
/// configuration changes.
#[derive(Default)]
pub struct KeyManager {
    keys: RwLock<HashMap<String, KeyEntry>>,
}

impl KeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace the key set from configuration. Entries that
    /// fail to parse are skipped.
    pub fn update_keys(&self, items: &[JwkItem]) {
        let mut new_keys = HashMap::with_capacity(items.len());
        for item in items {
            match parse_key(item) {
                Ok(entry) => {
                    new_keys.insert(item.kid.clone(), entry);
                }
                Err(e) => {
                    warn!("skip key kid={}: {}", item.kid, e);
                }
            }
        }

        let count = new_keys.len();
        *self.keys.write().expect("key map poisoned") = new_keys;
        info!("JWT keys updated, {} key(s) loaded", count);
    }

    fn verify(&self, token: &str) -> Result<serde_json::Map<String, serde_json::Value>, String> {
        let header = decode_header(token).map_err(|e| format!("invalid token: {}", e))?;
        let kid = header.kid.ok_or("token missing kid in header")?;

        let keys = self.keys.read().expect("key map poisoned");
        let entry = keys.get(&kid).ok_or_else(|| format!("unknown kid: {}", kid))?;

        // the token must be signed with the algorithm configured for its kid
        if header.alg != entry.algorithm {
            return Err(format!(
                "kid {} expects {:?}, got {:?}",
                kid, entry.algorithm, header.alg
            ));
        }

        let mut validation = Validation::new(entry.algorithm);
        validation.required_spec_claims.clear();

        let data = decode::<serde_json::Map<String, serde_json::Value>>(
            token,
            &entry.key,
            &validation,
        )
        .map_err(|e| format!("invalid token: {}", e))?;
        Ok(data.claims)
    }
}

/// Only RS256 and EdDSA keys are accepted
fn parse_key(item: &JwkItem) -> Result<KeyEntry, String> {
    match item.algorithm.as_str() {
        "RS256" => Ok(KeyEntry {
            key: DecodingKey::from_rsa_pem(item.public_key.as_bytes())
                .map_err(|e| format!("parse RSA public key: {}", e))?,
            algorithm: Algorithm::RS256,
        }),
        "EdDSA" => Ok(KeyEntry {
            key: DecodingKey::from_ed_pem(item.public_key.as_bytes())
                .map_err(|e| format!("parse Ed25519 public key: {}", e))?,
            algorithm: Algorithm::EdDSA,
        }),
        other => Err(format!("unsupported algorithm: {}", other)),
    }
}

/// State for the JWT middleware
pub struct JwtState {
    pub holder: Arc<DynamicConfigHolder>,
    pub keys: Arc<KeyManager>,
}

/// Require `Authorization: Bearer <token>` outside the configured skip
/// paths; on success forward `user_id`/`role` claims as headers and stash
/// all claims on the request.
pub async fn jwt(
    State(state): State<Arc<JwtState>>,
    mut request: Request,
    next: Next,
) -> Response<Body> {
    let cfg = state.holder.load();
    if !cfg.jwt.enabled {
        return next.run(request).await;
    }
    if cfg
        .jwt
        .skip_paths
        .iter()
        .any(|path| path == request.uri().path())
    {
        return next.run(request).await;
    }

    let trace_id = request
        .extensions()
        .get::<TraceId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let Some(token) = bearer_token(&request) else {
        return gateway_error(codes::JWT_INVALID, "missing authorization token", &trace_id);
    };

    let claims = match state.keys.verify(&token) {
        Ok(claims) => claims,
        Err(message) => return gateway_error(codes::JWT_INVALID, &message, &trace_id),
    };

    // identity passthrough for backends
    if let Some(user_id) = claims.get("user_id").and_then(|v| v.as_str()) {
        if let Ok(value) = HeaderValue::from_str(user_id) {
            request.headers_mut().insert("X-User-Id", value);
        }
    }
    if let Some(role) = claims.get("role").and_then(|v| v.as_str()) {
        if let Ok(value) = HeaderValue::from_str(role) {
            request.headers_mut().insert("X-User-Role", value);
        }
    }
    request.extensions_mut().insert(UserClaims(claims));

    next.run(request).await
}

fn bearer_token(request: &Request) -> Option<String> {
    let auth = request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    let token = auth.strip_prefix("Bearer ")?;
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_algorithms_are_rejected() {
        let item = JwkItem {
            kid: "k1".to_string(),
            algorithm: "HS256".to_string(),
            public_key: "secret".to_string(),
        };
        assert!(parse_key(&item).is_err());
    }

    #[test]
    fn bad_pem_is_skipped_on_update() {
        let manager = KeyManager::new();
        manager.update_keys(&[JwkItem {
            kid: "k1".to_string(),
            algorithm: "RS256".to_string(),
            public_key: "not a pem".to_string(),
        }]);
        assert!(manager.keys.read().unwrap().is_empty());
    }

    #[test]
    fn tokens_without_kid_fail() {
        let manager = KeyManager::new();
        // alg=none style garbage never reaches key lookup
        assert!(manager.verify("not-a-token").is_err());
    }
}
