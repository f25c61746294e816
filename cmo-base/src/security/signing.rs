use hmac::{Hmac, Mac};
use sha2::Sha256;

use cmo_core::{canonicalize, Envelope, SecurityError, ValidationError};

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies envelopes with HMAC-SHA256 over the canonical bytes.
#[derive(Clone)]
pub struct EnvelopeSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for EnvelopeSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeSigner").finish_non_exhaustive()
    }
}

impl EnvelopeSigner {
    /// A signer over the given secret.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length")
    }

    /// Compute the signature over the canonical envelope, `meta.signature`
    /// excluded. Lowercase hex.
    pub fn signature(&self, envelope: &Envelope) -> Result<String, ValidationError> {
        let bytes = canonicalize(envelope)?;
        let mut mac = self.mac();
        mac.update(&bytes);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Sign the envelope in place.
    pub fn sign(&self, envelope: &mut Envelope) -> Result<(), ValidationError> {
        envelope.meta.signature = Some(self.signature(envelope)?);
        Ok(())
    }

    /// Verify `meta.signature`. The comparison is constant-time.
    pub fn verify(&self, envelope: &Envelope) -> Result<(), SecurityError> {
        let Some(signature) = &envelope.meta.signature else {
            return Err(SecurityError::InvalidSignature);
        };
        let claimed = hex::decode(signature).map_err(|_| SecurityError::InvalidSignature)?;
        let bytes = canonicalize(envelope)
            .map_err(|e| SecurityError::Malformed(e.to_string()))?;
        let mut mac = self.mac();
        mac.update(&bytes);
        mac.verify_slice(&claimed)
            .map_err(|_| SecurityError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmo_core::{AgentId, MessageType, TaskInvoke};

    fn envelope() -> Envelope {
        Envelope::new(
            MessageType::TaskInvoke,
            AgentId::agent("planner"),
            vec![AgentId::agent("specialist-sel")],
            "wesign",
            "webapp",
            &TaskInvoke {
                task: "extract selectors".into(),
                capability: "selector-extraction".into(),
                inputs: serde_json::json!({}),
                attempt_no: 0,
                summary_hint: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn sign_then_verify() {
        let signer = EnvelopeSigner::new("secret");
        let mut env = envelope();
        signer.sign(&mut env).unwrap();
        assert!(env.meta.signature.is_some());
        signer.verify(&env).unwrap();
    }

    #[test]
    fn any_perturbation_invalidates() {
        let signer = EnvelopeSigner::new("secret");
        let mut env = envelope();
        signer.sign(&mut env).unwrap();

        let mut tampered_meta = env.clone();
        tampered_meta.meta.tenant = "otherco".into();
        assert_eq!(
            signer.verify(&tampered_meta).unwrap_err().code(),
            "invalid_signature"
        );

        let mut tampered_payload = env.clone();
        tampered_payload.payload["task"] = serde_json::json!("different task");
        assert!(signer.verify(&tampered_payload).is_err());
    }

    #[test]
    fn wrong_key_rejected() {
        let signer = EnvelopeSigner::new("secret");
        let mut env = envelope();
        signer.sign(&mut env).unwrap();
        assert!(EnvelopeSigner::new("other").verify(&env).is_err());
    }

    #[test]
    fn missing_or_garbage_signature_rejected() {
        let signer = EnvelopeSigner::new("secret");
        let env = envelope();
        assert!(signer.verify(&env).is_err());

        let mut garbled = env;
        garbled.meta.signature = Some("not hex".into());
        assert!(signer.verify(&garbled).is_err());
    }
}
