use async_trait::async_trait;
use orama_registry::NamespaceName;
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// Verified caller identity, derived from an API key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub namespace: NamespaceName,
    pub wallet: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("wallet signature rejected: {reason}")]
    SignatureRejected { reason: &'static str },
}

/// Verifies the wallet signature of an auth request. The cryptographic
/// primitive lives outside the control plane; the core only consumes a
/// verified identity.
#[async_trait]
pub trait WalletVerifier: Send + Sync {
    async fn verify(&self, wallet: &str, nonce: &str, signature: &str) -> Result<(), AuthError>;
}

/// Development verifier: any well-formed triple passes.
pub struct DevWalletVerifier;

#[async_trait]
impl WalletVerifier for DevWalletVerifier {
    async fn verify(&self, wallet: &str, nonce: &str, signature: &str) -> Result<(), AuthError> {
        if wallet.is_empty() || nonce.is_empty() || signature.is_empty() {
            return Err(AuthError::SignatureRejected {
                reason: "empty wallet, nonce or signature",
            });
        }
        Ok(())
    }
}

const KEY_PREFIX: &str = "ok";
const MAC_LEN: usize = 32;

/// Issues and resolves API keys. A key is `ok.{namespace}.{wallet}.{mac}`
/// with the MAC bound to the cluster secret, so every host verifies keys
/// without shared session state.
pub struct ApiKeys {
    secret: String,
}

impl ApiKeys {
    #[must_use]
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    #[must_use]
    pub fn issue(&self, namespace: &NamespaceName, wallet: &str) -> String {
        let mac = self.mac(namespace.as_str(), wallet);
        format!("{KEY_PREFIX}.{namespace}.{wallet}.{mac}")
    }

    /// Parse and verify a presented key. Returns `None` on any mismatch;
    /// callers must not learn which part failed.
    #[must_use]
    pub fn resolve(&self, token: &str) -> Option<Identity> {
        let mut parts = token.split('.');
        if parts.next() != Some(KEY_PREFIX) {
            return None;
        }
        let namespace = parts.next()?;
        let wallet = parts.next()?;
        let mac = parts.next()?;
        if parts.next().is_some() {
            return None;
        }

        if self.mac(namespace, wallet) != mac {
            return None;
        }
        let namespace = NamespaceName::parse(namespace).ok()?;
        Some(Identity {
            namespace,
            wallet: wallet.to_owned(),
        })
    }

    fn mac(&self, namespace: &str, wallet: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b".");
        hasher.update(wallet.as_bytes());
        hasher.update(b".");
        hasher.update(namespace.as_bytes());
        hex::encode(hasher.finalize())[..MAC_LEN].to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> ApiKeys {
        ApiKeys::new("namespace-coordination".into())
    }

    #[test]
    fn issued_keys_resolve_to_the_same_identity() {
        let namespace = NamespaceName::parse("acme").unwrap();
        let token = keys().issue(&namespace, "0xabc");
        let identity = keys().resolve(&token).expect("key should resolve");
        assert_eq!(identity.namespace, namespace);
        assert_eq!(identity.wallet, "0xabc");
    }

    #[test]
    fn tampered_namespace_is_rejected() {
        let namespace = NamespaceName::parse("acme").unwrap();
        let token = keys().issue(&namespace, "0xabc");
        let forged = token.replacen("acme", "rival", 1);
        assert!(keys().resolve(&forged).is_none());
    }

    #[test]
    fn different_secret_invalidates_keys() {
        let namespace = NamespaceName::parse("acme").unwrap();
        let token = keys().issue(&namespace, "0xabc");
        let other = ApiKeys::new("other-secret".into());
        assert!(other.resolve(&token).is_none());
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(keys().resolve("").is_none());
        assert!(keys().resolve("ok.acme").is_none());
        assert!(keys().resolve("nope.acme.0xabc.deadbeef").is_none());
        assert!(keys().resolve("ok.acme.0xabc.deadbeef.extra").is_none());
    }
}
