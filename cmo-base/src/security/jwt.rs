use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use cmo_core::SecurityError;

/// Claims of a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BearerClaims {
    /// Subject: the authenticated agent id.
    pub sub: String,
    /// Tenant scope of the token.
    pub tenant: String,
    /// Project scope of the token.
    pub project: String,
    /// Granted scopes; wildcard rules per [`scope_matches`].
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    /// Not valid before, seconds since epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    /// Expiry, seconds since epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Token id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

/// Key material and expectations for token verification.
#[derive(Debug, Clone)]
pub struct JwtConf {
    /// `HS256` or `RS256`.
    pub algorithm: String,
    /// HMAC secret (HS256) or PEM public key (RS256).
    pub secret_or_public_key: String,
    /// Expected issuer, when set.
    pub issuer: Option<String>,
    /// Expected audience, when set.
    pub audience: Option<String>,
}

/// Verifies bearer tokens.
#[derive(Clone)]
pub struct JwtVerifier {
    algorithm: Algorithm,
    key: DecodingKey,
    issuer: Option<String>,
    audience: Option<String>,
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl JwtVerifier {
    /// Build a verifier from configuration.
    pub fn new(conf: &JwtConf) -> Result<Self, SecurityError> {
        let (algorithm, key) = match conf.algorithm.as_str() {
            "HS256" => (
                Algorithm::HS256,
                DecodingKey::from_secret(conf.secret_or_public_key.as_bytes()),
            ),
            "RS256" => (
                Algorithm::RS256,
                DecodingKey::from_rsa_pem(conf.secret_or_public_key.as_bytes())
                    .map_err(|e| SecurityError::Malformed(format!("bad RSA key: {e}")))?,
            ),
            other => {
                return Err(SecurityError::Malformed(format!(
                    "unsupported algorithm `{other}`"
                )))
            }
        };
        Ok(Self {
            algorithm,
            key,
            issuer: conf.issuer.clone(),
            audience: conf.audience.clone(),
        })
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(self.algorithm);
        // Temporal claims are checked by hand below with zero leeway; a
        // token whose `exp` equals `now` is already expired.
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.required_spec_claims.clear();
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        validation
    }

    /// Verify a compact JWS and return its claims.
    pub fn verify(&self, token: &str) -> Result<BearerClaims, SecurityError> {
        self.verify_at(token, OffsetDateTime::now_utc())
    }

    /// Verify against an explicit clock; split out for tests.
    pub fn verify_at(
        &self,
        token: &str,
        now: OffsetDateTime,
    ) -> Result<BearerClaims, SecurityError> {
        let data = decode::<BearerClaims>(token, &self.key, &self.validation())
            .map_err(map_jwt_error)?;
        let claims = data.claims;
        check_temporal_claims(claims.exp, claims.nbf, now)?;
        if claims.sub.is_empty() {
            return Err(SecurityError::InvalidClaims("sub is empty".into()));
        }
        if claims.tenant.is_empty() || claims.project.is_empty() {
            return Err(SecurityError::InvalidClaims(
                "tenant and project are required".into(),
            ));
        }
        Ok(claims)
    }
}

/// Shared temporal-claim check: zero leeway, `exp == now` is expired.
pub(crate) fn check_temporal_claims(
    exp: Option<i64>,
    nbf: Option<i64>,
    now: OffsetDateTime,
) -> Result<(), SecurityError> {
    let now = now.unix_timestamp();
    if let Some(exp) = exp {
        if exp <= now {
            return Err(SecurityError::Expired);
        }
    }
    if let Some(nbf) = nbf {
        if nbf > now {
            return Err(SecurityError::NotBefore);
        }
    }
    Ok(())
}

pub(crate) fn map_jwt_error(err: jsonwebtoken::errors::Error) -> SecurityError {
    match err.kind() {
        ErrorKind::InvalidSignature => SecurityError::InvalidSignature,
        ErrorKind::ExpiredSignature => SecurityError::Expired,
        ErrorKind::ImmatureSignature => SecurityError::NotBefore,
        ErrorKind::InvalidIssuer => SecurityError::InvalidIssuer,
        ErrorKind::InvalidAudience => SecurityError::InvalidAudience,
        ErrorKind::Json(e) => SecurityError::InvalidClaims(e.to_string()),
        _ => SecurityError::Malformed(err.to_string()),
    }
}

/// Whether a granted scope satisfies a required one.
///
/// `admin` and `*` grant everything; `prefix:*` and `prefix/*` grant any
/// scope under the prefix; anything else must match exactly.
pub fn scope_matches(granted: &str, required: &str) -> bool {
    if granted == "*" || granted == "admin" || granted == required {
        return true;
    }
    for wildcard in [":*", "/*"] {
        if let Some(prefix) = granted.strip_suffix(wildcard) {
            let separator = &wildcard[..1];
            if required.starts_with(&format!("{prefix}{separator}")) {
                return true;
            }
        }
    }
    false
}

/// Whether any granted scope satisfies the required one.
pub fn has_scope(granted: &[String], required: &str) -> bool {
    granted.iter().any(|g| scope_matches(g, required))
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{encode, EncodingKey, Header};

    use super::*;

    const SECRET: &str = "test-secret";

    fn conf() -> JwtConf {
        JwtConf {
            algorithm: "HS256".into(),
            secret_or_public_key: SECRET.into(),
            issuer: None,
            audience: None,
        }
    }

    fn claims(exp: Option<i64>) -> BearerClaims {
        BearerClaims {
            sub: "planner".into(),
            tenant: "wesign".into(),
            project: "webapp".into(),
            scopes: vec!["tasks:publish".into()],
            iss: None,
            aud: None,
            nbf: None,
            exp,
            jti: None,
        }
    }

    fn sign(claims: &BearerClaims) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_round_trip() {
        let verifier = JwtVerifier::new(&conf()).unwrap();
        let now = OffsetDateTime::now_utc();
        let token = sign(&claims(Some(now.unix_timestamp() + 60)));
        let verified = verifier.verify_at(&token, now).unwrap();
        assert_eq!(verified.sub, "planner");
        assert_eq!(verified.tenant, "wesign");
    }

    #[test]
    fn exp_equal_to_now_is_expired() {
        let verifier = JwtVerifier::new(&conf()).unwrap();
        let now = OffsetDateTime::now_utc();
        let token = sign(&claims(Some(now.unix_timestamp())));
        assert_eq!(
            verifier.verify_at(&token, now).unwrap_err().code(),
            "expired"
        );
    }

    #[test]
    fn nbf_in_future_rejected() {
        let verifier = JwtVerifier::new(&conf()).unwrap();
        let now = OffsetDateTime::now_utc();
        let mut c = claims(None);
        c.nbf = Some(now.unix_timestamp() + 30);
        assert_eq!(
            verifier.verify_at(&sign(&c), now).unwrap_err().code(),
            "not_before"
        );
    }

    #[test]
    fn wrong_key_is_invalid_signature() {
        let verifier = JwtVerifier::new(&JwtConf {
            secret_or_public_key: "other-secret".into(),
            ..conf()
        })
        .unwrap();
        let token = sign(&claims(None));
        assert_eq!(
            verifier.verify(&token).unwrap_err().code(),
            "invalid_signature"
        );
    }

    #[test]
    fn issuer_mismatch_rejected() {
        let verifier = JwtVerifier::new(&JwtConf {
            issuer: Some("idp.wesign".into()),
            ..conf()
        })
        .unwrap();
        let mut c = claims(None);
        c.iss = Some("someone-else".into());
        assert_eq!(
            verifier.verify(&sign(&c)).unwrap_err().code(),
            "invalid_issuer"
        );
    }

    #[test]
    fn garbage_is_malformed() {
        let verifier = JwtVerifier::new(&conf()).unwrap();
        assert_eq!(
            verifier.verify("not-a-token").unwrap_err().code(),
            "malformed"
        );
    }

    #[test]
    fn empty_required_claims_rejected() {
        let verifier = JwtVerifier::new(&conf()).unwrap();
        let mut c = claims(None);
        c.tenant = String::new();
        assert_eq!(
            verifier.verify(&sign(&c)).unwrap_err().code(),
            "invalid_claims"
        );
    }

    #[test]
    fn scope_wildcards() {
        assert!(scope_matches("tasks:publish", "tasks:publish"));
        assert!(scope_matches("*", "anything"));
        assert!(scope_matches("admin", "anything"));
        assert!(scope_matches("tasks:*", "tasks:publish"));
        assert!(scope_matches("tasks/*", "tasks/publish"));
        assert!(!scope_matches("tasks:*", "results:publish"));
        assert!(!scope_matches("tasks", "tasks:publish"));
        assert!(has_scope(&["a".into(), "tasks:*".into()], "tasks:consume"));
    }
}
