//! Token issuance, verification, and password hashing.
//!
//! Tokens are HMAC-SHA256 over `{collection}:{record_id}:{expiry}`,
//! transported as `base64url(payload).base64url(signature)`. Passwords
//! are stored as `{salt}${hex(sha256(salt || password))}`; hashing
//! happens here at the API boundary — the engine only ever sees the
//! digest as opaque record data.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use plinth_types::token::new_token;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Identity extracted from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthIdentity {
    /// Auth collection the identity belongs to.
    pub collection: String,
    /// Record id of the authenticated user.
    pub record_id: String,
}

impl AuthIdentity {
    /// True for identities from the superuser collection.
    pub fn is_superuser(&self) -> bool {
        self.collection == "_superusers"
    }
}

/// Signs and verifies auth tokens.
#[derive(Clone)]
pub struct TokenService {
    secret: Vec<u8>,
    ttl: Duration,
}

impl TokenService {
    /// Creates a service with the given signing secret and token TTL.
    pub fn new(secret: impl Into<Vec<u8>>, ttl: Duration) -> Self {
        Self { secret: secret.into(), ttl }
    }

    /// Issues a token for `collection`/`record_id`, expiring after the
    /// configured TTL.
    pub fn issue(&self, collection: &str, record_id: &str) -> String {
        let expiry = unix_now().saturating_add(self.ttl.as_secs());
        let payload = format!("{collection}:{record_id}:{expiry}");
        let signature = self.sign(payload.as_bytes());
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload.as_bytes()),
            URL_SAFE_NO_PAD.encode(signature)
        )
    }

    /// Verifies a token, returning the identity if the signature checks
    /// out and the token has not expired.
    pub fn verify(&self, token: &str) -> Option<AuthIdentity> {
        let (payload_b64, signature_b64) = token.split_once('.')?;
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
        let signature = URL_SAFE_NO_PAD.decode(signature_b64).ok()?;

        let expected = self.sign(&payload);
        if !constant_time_eq(&signature, &expected) {
            return None;
        }

        let payload = String::from_utf8(payload).ok()?;
        let mut parts = payload.rsplitn(2, ':');
        let expiry: u64 = parts.next()?.parse().ok()?;
        let rest = parts.next()?;
        let (collection, record_id) = rest.split_once(':')?;

        if unix_now() > expiry {
            return None;
        }
        Some(AuthIdentity {
            collection: collection.to_string(),
            record_id: record_id.to_string(),
        })
    }

    /// Extracts and verifies a `Authorization: Bearer` header value.
    pub fn identify(&self, headers: &axum::http::HeaderMap) -> Option<AuthIdentity> {
        let header = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
        let token = header.strip_prefix("Bearer ").unwrap_or(header);
        self.verify(token)
    }

    fn sign(&self, data: &[u8]) -> [u8; 32] {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Hashes a password with a fresh random salt.
pub fn hash_password(password: &str) -> String {
    let salt = new_token(16);
    format!("{salt}${}", digest_hex(&salt, password))
}

/// Verifies a password against a stored `{salt}${hex}` digest.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, digest)) = stored.split_once('$') else {
        return false;
    };
    constant_time_eq(digest_hex(salt, password).as_bytes(), digest.as_bytes())
}

fn digest_hex(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new(b"secret".to_vec(), Duration::from_secs(60))
    }

    #[test]
    fn test_token_round_trip() {
        let svc = service();
        let token = svc.issue("users", "abc123def456ghi");
        let identity = svc.verify(&token).unwrap();
        assert_eq!(identity.collection, "users");
        assert_eq!(identity.record_id, "abc123def456ghi");
        assert!(!identity.is_superuser());
    }

    #[test]
    fn test_superuser_identity() {
        let svc = service();
        let token = svc.issue("_superusers", "root1root1root1");
        assert!(svc.verify(&token).unwrap().is_superuser());
    }

    #[test]
    fn test_tampered_token_rejected() {
        let svc = service();
        let token = svc.issue("users", "abc");
        let mut forged = token.clone();
        forged.replace_range(0..1, if token.starts_with('A') { "B" } else { "A" });
        assert!(svc.verify(&forged).is_none());
        // A token from a different secret never verifies.
        let other = TokenService::new(b"other".to_vec(), Duration::from_secs(60));
        assert!(other.verify(&token).is_none());
    }

    #[test]
    fn test_expired_token_rejected() {
        let svc = TokenService::new(b"secret".to_vec(), Duration::from_secs(0));
        let token = svc.issue("users", "abc");
        std::thread::sleep(Duration::from_millis(1100));
        assert!(svc.verify(&token).is_none());
    }

    #[test]
    fn test_password_hash_round_trip() {
        let stored = hash_password("hunter2");
        assert!(verify_password("hunter2", &stored));
        assert!(!verify_password("hunter3", &stored));
        // Fresh salt every time.
        assert_ne!(stored, hash_password("hunter2"));
    }
}
