use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use pmos_contracts::Role;
use serde::{Deserialize, Serialize};

/// Resolved workspace context for one request. Derived from the session
/// token alone, before any engine I/O, so every downstream component can
/// assume a valid caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub user_id: String,
    pub workspace_id: String,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    sub: String,
    workspace_id: String,
    role: Role,
    iat: u64,
    exp: u64,
}

const MIN_SECRET_LEN: usize = 32;

/// Verifies (and, for the platform login path and tests, issues)
/// HS256-signed session tokens carrying `{sub, workspace_id, role}`.
#[derive(Clone)]
pub struct SessionVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    clock_skew: Duration,
}

impl std::fmt::Debug for SessionVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionVerifier")
            .field("clock_skew", &self.clock_skew)
            .finish_non_exhaustive()
    }
}

impl SessionVerifier {
    pub fn new(secret: &[u8], clock_skew: Duration) -> Result<Self, AuthError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: format!("session secret must be at least {MIN_SECRET_LEN} bytes"),
            });
        }

        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            clock_skew,
        })
    }

    pub fn issue(
        &self,
        user_id: &str,
        workspace_id: &str,
        role: Role,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let now = unix_epoch_secs_now();
        let claims = SessionClaims {
            sub: user_id.to_string(),
            workspace_id: workspace_id.to_string(),
            role,
            iat: now,
            exp: now.saturating_add(ttl.as_secs()),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(|_| AuthError {
            code: "ERR_INTERNAL",
            message: "failed to sign session token".to_string(),
        })
    }

    pub fn verify(&self, token: &str) -> Result<SessionContext, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.clock_skew.as_secs();
        validation.set_required_spec_claims(&["exp"]);

        let data =
            decode::<SessionClaims>(token, &self.decoding, &validation).map_err(|err| {
                match err.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError {
                        code: "ERR_AUTH_INVALID",
                        message: "session expired".to_string(),
                    },
                    _ => AuthError {
                        code: "ERR_AUTH_INVALID",
                        message: "invalid session token".to_string(),
                    },
                }
            })?;

        let claims = data.claims;
        if claims.sub.trim().is_empty() || claims.workspace_id.trim().is_empty() {
            return Err(AuthError {
                code: "ERR_AUTH_INVALID",
                message: "session token is missing identity claims".to_string(),
            });
        }

        Ok(SessionContext {
            user_id: claims.sub,
            workspace_id: claims.workspace_id,
            role: claims.role,
        })
    }
}

fn unix_epoch_secs_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn verifier() -> SessionVerifier {
        SessionVerifier::new(SECRET, Duration::from_secs(0)).unwrap()
    }

    #[test]
    fn short_secret_is_rejected() {
        let err = SessionVerifier::new(b"short", Duration::ZERO).unwrap_err();
        assert_eq!(err.code, "ERR_INVALID_CONFIG");
    }

    #[test]
    fn issue_then_verify_roundtrips_context() {
        let verifier = verifier();
        let token = verifier
            .issue("u1", "A1", Role::WorkspaceAdmin, Duration::from_secs(600))
            .unwrap();

        let ctx = verifier.verify(&token).unwrap();
        assert_eq!(ctx.user_id, "u1");
        assert_eq!(ctx.workspace_id, "A1");
        assert_eq!(ctx.role, Role::WorkspaceAdmin);
    }

    #[test]
    fn expired_token_is_rejected() {
        let verifier = verifier();
        let now = unix_epoch_secs_now();
        let claims = SessionClaims {
            sub: "u1".to_string(),
            workspace_id: "A1".to_string(),
            role: Role::WorkspaceAdmin,
            iat: now - 600,
            exp: now - 120,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();

        let err = verifier.verify(&token).unwrap_err();
        assert_eq!(err.code, "ERR_AUTH_INVALID");
        assert!(err.message.contains("expired"));
    }

    #[test]
    fn clock_skew_tolerates_recent_expiry() {
        let lenient = SessionVerifier::new(SECRET, Duration::from_secs(300)).unwrap();
        let now = unix_epoch_secs_now();
        let claims = SessionClaims {
            sub: "u1".to_string(),
            workspace_id: "A1".to_string(),
            role: Role::WorkspaceAdmin,
            iat: now - 600,
            exp: now - 120,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();

        lenient.verify(&token).unwrap();
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let other = SessionVerifier::new(b"ffffffffffffffffffffffffffffffff", Duration::ZERO)
            .unwrap();
        let token = other
            .issue("u1", "A1", Role::SuperAdmin, Duration::from_secs(600))
            .unwrap();

        let err = verifier().verify(&token).unwrap_err();
        assert_eq!(err.code, "ERR_AUTH_INVALID");
    }

    #[test]
    fn unknown_role_claim_is_rejected() {
        #[derive(Serialize)]
        struct BadClaims<'a> {
            sub: &'a str,
            workspace_id: &'a str,
            role: &'a str,
            iat: u64,
            exp: u64,
        }

        let now = unix_epoch_secs_now();
        let token = encode(
            &Header::new(Algorithm::HS256),
            &BadClaims {
                sub: "u1",
                workspace_id: "A1",
                role: "owner",
                iat: now,
                exp: now + 600,
            },
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();

        let err = verifier().verify(&token).unwrap_err();
        assert_eq!(err.code, "ERR_AUTH_INVALID");
    }

    #[test]
    fn empty_workspace_claim_is_rejected() {
        let verifier = verifier();
        let token = verifier
            .issue("u1", " ", Role::WorkspaceAdmin, Duration::from_secs(600))
            .unwrap();

        let err = verifier.verify(&token).unwrap_err();
        assert_eq!(err.code, "ERR_AUTH_INVALID");
    }
}
