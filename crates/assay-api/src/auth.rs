use std::net::IpAddr;

use axum::http::HeaderMap;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;

use crate::config::{AppConfig, JwtConfig};
use crate::error::AppError;

pub const SYNC_KEY_HEADER: &str = "x-sync-key";

/// Roles allowed to change an assay's readiness by hand.
pub const STAFF_ROLES: [&str; 3] = ["admin", "worker", "boss"];

/// What a sync caller presents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCredential<'a> {
    pub key: Option<&'a str>,
    pub client_ip: Option<IpAddr>,
}

impl<'a> SyncCredential<'a> {
    /// Read the sync key header and resolve the client address.
    ///
    /// The first `X-Forwarded-For` hop is used only when the deployment says
    /// the proxy in front of it can be trusted.
    pub fn from_request(
        headers: &'a HeaderMap,
        peer: Option<IpAddr>,
        trust_forwarded_for: bool,
    ) -> Self {
        let key = headers
            .get(SYNC_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());

        let forwarded = trust_forwarded_for
            .then(|| headers.get("x-forwarded-for"))
            .flatten()
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|hop| hop.trim().parse::<IpAddr>().ok());

        Self {
            key,
            client_ip: forwarded.or(peer),
        }
    }

    /// Stable per-caller key for rate limiting.
    pub fn fingerprint(&self) -> String {
        self.client_ip
            .map_or_else(|| "unknown".to_string(), |ip| ip.to_string())
    }
}

/// Decides whether a caller may use the sync endpoints.
pub trait SyncGate: Send + Sync {
    fn allows(&self, credential: &SyncCredential<'_>) -> bool;
}

/// Shared-secret gate with an optional client address allowlist.
pub struct SharedKeyGate {
    key: String,
    allowed_ips: Vec<IpAddr>,
}

impl SharedKeyGate {
    pub fn new(key: impl Into<String>, allowed_ips: Vec<IpAddr>) -> Self {
        Self {
            key: key.into(),
            allowed_ips,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.sync_api_key.clone(), config.sync_allowed_ips.clone())
    }
}

impl SyncGate for SharedKeyGate {
    fn allows(&self, credential: &SyncCredential<'_>) -> bool {
        let Some(key) = credential.key else {
            return false;
        };
        if !constant_time_eq(key.as_bytes(), self.key.as_bytes()) {
            return false;
        }
        if self.allowed_ips.is_empty() {
            return true;
        }
        credential
            .client_ip
            .is_some_and(|ip| self.allowed_ips.contains(&ip))
    }
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right)
        .fold(0_u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[derive(Debug, Deserialize)]
struct StaffClaims {
    sub: String,
    #[serde(rename = "type")]
    token_type: Option<String>,
}

/// Verifies staff access tokens signed with the shared HMAC secret.
#[derive(Clone)]
pub struct StaffJwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl StaffJwtVerifier {
    pub fn from_config(config: &JwtConfig) -> Self {
        Self {
            key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation: Validation::new(config.algorithm),
        }
    }

    /// Returns the phone number the token was issued to.
    pub fn verify_access_token(&self, token: &str) -> Result<String, AppError> {
        let decoded = decode::<StaffClaims>(token, &self.key, &self.validation).map_err(|error| {
            AppError::unauthorized(format!("Token validation failed: {}", sanitize(&error)))
        })?;

        if decoded.claims.token_type.as_deref() != Some("access") {
            return Err(AppError::unauthorized("Token is not an access token"));
        }
        let phone = decoded.claims.sub.trim();
        if phone.is_empty() {
            return Err(AppError::unauthorized("Token subject is missing"));
        }
        Ok(phone.to_string())
    }
}

pub fn is_staff_role(role: &str) -> bool {
    STAFF_ROLES.contains(&role)
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Authorization header must be `Bearer <token>`"))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::unauthorized("Bearer token is empty"));
    }

    Ok(token)
}

fn sanitize(error: &impl std::fmt::Display) -> String {
    error.to_string().replace('\n', " ").trim().to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde_json::json;

    use super::*;

    pub(crate) fn sign(secret: &str, claims: &serde_json::Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn verifier(secret: &str) -> StaffJwtVerifier {
        StaffJwtVerifier::from_config(&JwtConfig {
            secret: secret.to_string(),
            algorithm: Algorithm::HS256,
        })
    }

    fn future_exp() -> i64 {
        chrono::Utc::now().timestamp() + 600
    }

    #[test]
    fn bearer_token_extractor_accepts_standard_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer abc.def.ghi"),
        );

        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc.def.ghi");
    }

    #[test]
    fn bearer_token_extractor_rejects_wrong_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert!(extract_bearer_token(&headers).is_err());
    }

    #[test]
    fn shared_key_gate_checks_key_and_allowlist() {
        let open = SharedKeyGate::new("secret-key", Vec::new());
        let ok = SyncCredential {
            key: Some("secret-key"),
            client_ip: None,
        };
        assert!(open.allows(&ok));
        assert!(!open.allows(&SyncCredential {
            key: Some("secret-kex"),
            client_ip: None
        }));
        assert!(!open.allows(&SyncCredential {
            key: None,
            client_ip: None
        }));

        let office: IpAddr = "10.1.2.3".parse().unwrap();
        let listed = SharedKeyGate::new("secret-key", vec![office]);
        assert!(!listed.allows(&ok));
        assert!(listed.allows(&SyncCredential {
            key: Some("secret-key"),
            client_ip: Some(office)
        }));
    }

    #[test]
    fn forwarded_for_only_when_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert(SYNC_KEY_HEADER, HeaderValue::from_static(" k "));
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        let peer: IpAddr = "10.0.0.1".parse().unwrap();

        let trusted = SyncCredential::from_request(&headers, Some(peer), true);
        assert_eq!(trusted.key, Some("k"));
        assert_eq!(trusted.fingerprint(), "203.0.113.9");

        let untrusted = SyncCredential::from_request(&headers, Some(peer), false);
        assert_eq!(untrusted.client_ip, Some(peer));
    }

    #[test]
    fn staff_token_yields_phone() {
        let token = sign(
            "jwt-secret",
            &json!({ "sub": "555-0100", "type": "access", "exp": future_exp() }),
        );
        assert_eq!(
            verifier("jwt-secret").verify_access_token(&token).unwrap(),
            "555-0100"
        );
    }

    #[test]
    fn refresh_or_foreign_tokens_are_rejected() {
        let refresh = sign(
            "jwt-secret",
            &json!({ "sub": "555-0100", "type": "refresh", "exp": future_exp() }),
        );
        let err = verifier("jwt-secret")
            .verify_access_token(&refresh)
            .unwrap_err();
        assert!(err.to_string().contains("not an access token"));

        let foreign = sign(
            "other-secret",
            &json!({ "sub": "555-0100", "type": "access", "exp": future_exp() }),
        );
        assert!(verifier("jwt-secret").verify_access_token(&foreign).is_err());

        let expired = sign(
            "jwt-secret",
            &json!({ "sub": "555-0100", "type": "access", "exp": 1_000 }),
        );
        assert!(verifier("jwt-secret").verify_access_token(&expired).is_err());
    }

    #[test]
    fn staff_roles() {
        assert!(is_staff_role("boss"));
        assert!(!is_staff_role("customer"));
    }
}
