use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use cmo_core::SecurityError;

use super::jwt::{check_temporal_claims, has_scope, map_jwt_error, scope_matches, JwtConf};

/// Claims of a capability token (a JWS nested inside the bearer flow).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityClaims {
    /// Granted capabilities; wildcard rules as for scopes.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Resource the grant is scoped to, e.g. `trace:abc123` or `trace:*`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Operation the grant is scoped to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Issuer.
    pub iss: String,
    /// Subject: the agent the grant was issued to.
    pub sub: String,
    /// Expiry, seconds since epoch.
    pub exp: i64,
}

impl CapabilityClaims {
    /// Whether the token is scoped to a specific resource.
    pub fn is_resource_scoped(&self) -> bool {
        self.resource.is_some()
    }
}

/// Verifies capability tokens and evaluates their grants.
#[derive(Clone)]
pub struct CapabilityVerifier {
    algorithm: Algorithm,
    key: DecodingKey,
    issuer: Option<String>,
}

impl std::fmt::Debug for CapabilityVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityVerifier")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl CapabilityVerifier {
    /// Build a verifier from the shared JWT configuration.
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
        })
    }

    /// Verify a capability token and return its claims.
    pub fn verify(&self, token: &str) -> Result<CapabilityClaims, SecurityError> {
        self.verify_at(token, OffsetDateTime::now_utc())
    }

    /// Verify against an explicit clock; split out for tests.
    pub fn verify_at(
        &self,
        token: &str,
        now: OffsetDateTime,
    ) -> Result<CapabilityClaims, SecurityError> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        let data =
            decode::<CapabilityClaims>(token, &self.key, &validation).map_err(map_jwt_error)?;
        let claims = data.claims;
        check_temporal_claims(Some(claims.exp), None, now)?;
        if claims.sub.is_empty() {
            return Err(SecurityError::InvalidClaims("sub is empty".into()));
        }
        Ok(claims)
    }
}

/// Require a capability grant, with the same wildcard rules as scopes.
pub fn check_capability(
    claims: &CapabilityClaims,
    required: &str,
) -> Result<(), SecurityError> {
    if has_scope(&claims.capabilities, required) {
        Ok(())
    } else {
        Err(SecurityError::InsufficientCapabilities {
            required: required.to_string(),
        })
    }
}

/// Require the token to be scoped onto `resource`.
///
/// A token without a `resource` claim cannot touch scoped resources at
/// all; a scoped token matches exactly or by `prefix:*` pattern.
pub fn check_resource(claims: &CapabilityClaims, resource: &str) -> Result<(), SecurityError> {
    match &claims.resource {
        None => Err(SecurityError::ResourceNotScoped {
            resource: resource.to_string(),
        }),
        Some(scoped) if scope_matches(scoped, resource) => Ok(()),
        Some(_) => Err(SecurityError::ResourceNotScoped {
            resource: resource.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{encode, EncodingKey, Header};

    use super::*;

    const SECRET: &str = "cap-secret";

    fn conf() -> JwtConf {
        JwtConf {
            algorithm: "HS256".into(),
            secret_or_public_key: SECRET.into(),
            issuer: None,
            audience: None,
        }
    }

    fn claims() -> CapabilityClaims {
        CapabilityClaims {
            capabilities: vec!["tasks:invoke".into(), "checkpoint:*".into()],
            resource: Some("trace:*".into()),
            operation: None,
            iss: "idp.wesign".into(),
            sub: "planner".into(),
            exp: OffsetDateTime::now_utc().unix_timestamp() + 300,
        }
    }

    fn sign(claims: &CapabilityClaims) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn verify_and_check_grants() {
        let verifier = CapabilityVerifier::new(&conf()).unwrap();
        let verified = verifier.verify(&sign(&claims())).unwrap();
        check_capability(&verified, "tasks:invoke").unwrap();
        check_capability(&verified, "checkpoint:replay").unwrap();
        assert_eq!(
            check_capability(&verified, "registry:write")
                .unwrap_err()
                .code(),
            "insufficient_capabilities"
        );
    }

    #[test]
    fn resource_scoping() {
        let verified = CapabilityVerifier::new(&conf())
            .unwrap()
            .verify(&sign(&claims()))
            .unwrap();
        // `trace:*` covers any trace.
        check_resource(&verified, "trace:abc123").unwrap();
        assert!(check_resource(&verified, "run:abc123").is_err());

        let mut unscoped = claims();
        unscoped.resource = None;
        let verified = CapabilityVerifier::new(&conf())
            .unwrap()
            .verify(&sign(&unscoped))
            .unwrap();
        assert_eq!(
            check_resource(&verified, "trace:abc123").unwrap_err().code(),
            "resource_not_scoped"
        );
    }

    #[test]
    fn expired_capability_rejected() {
        let mut expired = claims();
        expired.exp = OffsetDateTime::now_utc().unix_timestamp() - 1;
        let verifier = CapabilityVerifier::new(&conf()).unwrap();
        assert_eq!(verifier.verify(&sign(&expired)).unwrap_err().code(), "expired");
    }
}
