//! Bearer token verification and identity extraction
//!
//! Tokens are issued elsewhere; this module only verifies them. Signature,
//! expiry and (when configured) issuer/audience are always checked before any
//! claim is trusted. There is no unverified decoding path.

use crate::{config::IdentityConfig, types::AccountId, Error, Result};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Claims read from a verified token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject; becomes the account ID
    #[serde(default)]
    pub sub: Option<String>,
    /// Email claim
    #[serde(default)]
    pub email: Option<String>,
    /// Display name claim
    #[serde(default)]
    pub name: Option<String>,
    /// Role claims
    #[serde(default)]
    pub roles: Vec<String>,
    /// Expiry (seconds since epoch)
    pub exp: u64,
}

/// Verified caller identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable account identifier
    pub account_id: AccountId,
    /// Email claim
    pub email: Option<String>,
    /// Display name claim
    pub display_name: Option<String>,
    /// Role claims
    pub roles: Vec<String>,
    /// Whether the token carries the administrator role
    pub is_admin: bool,
}

impl Identity {
    /// Administrative context for this caller, if permitted
    pub fn require_admin(&self) -> Result<AdminContext> {
        if self.is_admin {
            Ok(AdminContext::new(self.account_id.as_str()))
        } else {
            Err(Error::Forbidden(format!(
                "{} is not an administrator",
                self.account_id
            )))
        }
    }
}

/// Proof that the caller was authorized as an administrator.
///
/// Built from a verified token via [`Identity::require_admin`], or directly by
/// trusted operator tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminContext {
    admin_id: String,
}

impl AdminContext {
    /// Operator context
    pub fn new(admin_id: impl Into<String>) -> Self {
        Self {
            admin_id: admin_id.into(),
        }
    }

    /// Acting administrator, recorded on every admin entry
    pub fn admin_id(&self) -> &str {
        &self.admin_id
    }
}

/// Verifies bearer tokens and extracts identities
pub struct IdentityResolver {
    key: DecodingKey,
    validation: Validation,
    admin_role: Option<String>,
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("algorithms", &self.validation.algorithms)
            .field("admin_role", &self.admin_role)
            .finish_non_exhaustive()
    }
}

impl IdentityResolver {
    /// Build from configuration; a verification key is mandatory
    pub fn from_config(config: &IdentityConfig) -> Result<Self> {
        let (key, algorithm) = match (&config.rsa_public_key_path, &config.hmac_secret) {
            (Some(path), _) => {
                let pem = std::fs::read(path)?;
                let key = DecodingKey::from_rsa_pem(&pem)
                    .map_err(|e| Error::Config(format!("Invalid RSA public key: {}", e)))?;
                (key, Algorithm::RS256)
            }
            (None, Some(secret)) if !secret.is_empty() => {
                (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256)
            }
            _ => {
                return Err(Error::Config(
                    "identity requires hmac_secret or rsa_public_key_path".to_string(),
                ))
            }
        };

        let mut validation = Validation::new(algorithm);
        match &config.issuer {
            Some(issuer) => validation.set_issuer(&[issuer]),
            None => validation.iss = None,
        }
        match &config.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Ok(Self {
            key,
            validation,
            admin_role: config.admin_role.clone(),
        })
    }

    /// Verify a bearer credential and extract the caller identity.
    ///
    /// Accepts the raw token or an `Authorization` header value.
    pub fn resolve(&self, credential: &str) -> Result<Identity> {
        let token = credential
            .trim()
            .strip_prefix("Bearer ")
            .unwrap_or(credential.trim());

        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|err| {
            tracing::warn!(error = %err, "Token verification failed");
            Error::InvalidCredential(err.to_string())
        })?;
        let claims = data.claims;

        let subject = claims
            .sub
            .filter(|sub| !sub.trim().is_empty())
            .ok_or_else(|| Error::InvalidCredential("token has no subject".to_string()))?;
        // Subject and email become parts of storage keys, which NUL separates
        let has_nul = subject.contains('\0')
            || claims.email.as_deref().map_or(false, |email| email.contains('\0'));
        if has_nul {
            tracing::warn!("Token identifier contains NUL");
            return Err(Error::InvalidCredential(
                "identifier contains NUL".to_string(),
            ));
        }

        let is_admin = self
            .admin_role
            .as_ref()
            .map_or(false, |role| claims.roles.iter().any(|r| r == role));

        Ok(Identity {
            account_id: AccountId::new(subject),
            email: claims.email,
            display_name: claims.name,
            roles: claims.roles,
            is_admin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "test-secret";

    fn resolver() -> IdentityResolver {
        IdentityResolver::from_config(&IdentityConfig {
            hmac_secret: Some(SECRET.to_string()),
            admin_role: Some("admin".to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    fn token(claims: serde_json::Value, secret: &str) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn in_one_hour() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn test_resolve_valid_token() {
        let t = token(
            json!({"sub": "user-1", "email": "a@example.com", "name": "Ann", "exp": in_one_hour()}),
            SECRET,
        );
        let identity = resolver().resolve(&format!("Bearer {}", t)).unwrap();

        assert_eq!(identity.account_id, AccountId::new("user-1"));
        assert_eq!(identity.email.as_deref(), Some("a@example.com"));
        assert_eq!(identity.display_name.as_deref(), Some("Ann"));
        assert!(!identity.is_admin);
        assert!(matches!(identity.require_admin(), Err(Error::Forbidden(_))));
    }

    #[test]
    fn test_admin_role() {
        let t = token(
            json!({"sub": "ops-1", "roles": ["admin"], "exp": in_one_hour()}),
            SECRET,
        );
        let admin = resolver().resolve(&t).unwrap().require_admin().unwrap();
        assert_eq!(admin.admin_id(), "ops-1");
    }

    #[test]
    fn test_missing_subject_rejected() {
        let r = resolver();
        let no_sub = token(json!({"email": "a@example.com", "exp": in_one_hour()}), SECRET);
        assert!(matches!(r.resolve(&no_sub), Err(Error::InvalidCredential(_))));

        let blank_sub = token(json!({"sub": "  ", "exp": in_one_hour()}), SECRET);
        assert!(matches!(r.resolve(&blank_sub), Err(Error::InvalidCredential(_))));
    }

    #[test]
    fn test_nul_in_identifiers_rejected() {
        let r = resolver();
        for claims in [
            json!({"sub": "user-1\u{0}tail", "exp": in_one_hour()}),
            json!({"sub": "user-1", "email": "a@example.com\u{0}b", "exp": in_one_hour()}),
        ] {
            assert!(matches!(
                r.resolve(&token(claims, SECRET)),
                Err(Error::InvalidCredential(_))
            ));
        }
    }

    #[test]
    fn test_wrong_signature_rejected() {
        let forged = token(json!({"sub": "user-1", "exp": in_one_hour()}), "attacker");
        assert!(matches!(
            resolver().resolve(&forged),
            Err(Error::InvalidCredential(_))
        ));
    }

    #[test]
    fn test_expired_and_garbage_rejected() {
        let r = resolver();
        let expired = token(json!({"sub": "user-1", "exp": 1_000}), SECRET);
        assert!(matches!(r.resolve(&expired), Err(Error::InvalidCredential(_))));
        assert!(matches!(r.resolve("not-a-jwt"), Err(Error::InvalidCredential(_))));
    }

    #[test]
    fn test_issuer_enforced() {
        let r = IdentityResolver::from_config(&IdentityConfig {
            hmac_secret: Some(SECRET.to_string()),
            issuer: Some("https://auth.example.com".to_string()),
            ..Default::default()
        })
        .unwrap();

        let wrong = token(
            json!({"sub": "u", "iss": "https://evil.example.com", "exp": in_one_hour()}),
            SECRET,
        );
        assert!(r.resolve(&wrong).is_err());

        let right = token(
            json!({"sub": "u", "iss": "https://auth.example.com", "exp": in_one_hour()}),
            SECRET,
        );
        assert!(r.resolve(&right).is_ok());
    }

    #[test]
    fn test_missing_key_is_config_error() {
        assert!(matches!(
            IdentityResolver::from_config(&IdentityConfig::default()),
            Err(Error::Config(_))
        ));
    }
}
