//! Asymmetric message security for the datagram transport.
//!
//! The daemon holds one RSA private key; every driver declares a public key,
//! both distributed out of band and referenced from the configuration file.
//! Outbound messages are encrypted chunk-wise (PKCS#1 v1.5) with the
//! recipient's public key, inbound ones decrypted with the daemon key. A
//! message that fails to decrypt is dropped and counted by the transport,
//! never surfaced to the manager as data.
//!
//! Running without keys is supported for closed networks: the channel then
//! passes messages through in the clear.

use std::path::Path;

use anyhow::Context;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use tracing::debug;

use crate::protocol::ProtocolError;

/// PKCS#1 v1.5 padding overhead per block.
const PKCS1_PADDING: usize = 11;

/// The daemon-side key material. Construct once at startup and share.
pub struct MessageSecurity {
    private_key: Option<RsaPrivateKey>,
}

impl MessageSecurity {
    /// A channel that passes messages through unmodified.
    pub fn disabled() -> Self {
        Self { private_key: None }
    }

    pub fn from_private_key(private_key: RsaPrivateKey) -> Self {
        Self {
            private_key: Some(private_key),
        }
    }

    /// Load the daemon private key from a PEM file (PKCS#8 or PKCS#1).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("reading private key {}", path.display()))?;

        let key = parse_private_key_pem(&pem)
            .with_context(|| format!("parsing private key {}", path.display()))?;

        debug!("loaded {}-bit daemon private key", key.size() * 8);
        Ok(Self::from_private_key(key))
    }

    pub fn is_enabled(&self) -> bool {
        self.private_key.is_some()
    }

    /// Decrypt an inbound datagram with the daemon key.
    pub fn unseal(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let Some(key) = &self.private_key else {
            return Ok(data.to_vec());
        };

        let block = key.size();
        if data.is_empty() || data.len() % block != 0 {
            return Err(ProtocolError::DecryptionFailure);
        }

        let mut plain = Vec::with_capacity(data.len());
        for chunk in data.chunks_exact(block) {
            let decrypted = key
                .decrypt(Pkcs1v15Encrypt, chunk)
                .map_err(|_| ProtocolError::DecryptionFailure)?;
            plain.extend_from_slice(&decrypted);
        }

        Ok(plain)
    }

    /// Encrypt an outbound message for one recipient.
    pub fn seal(recipient: &RsaPublicKey, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut rng = rand::thread_rng();
        let block = recipient.size() - PKCS1_PADDING;

        let mut sealed = Vec::with_capacity(data.len() + recipient.size());
        for chunk in data.chunks(block) {
            let encrypted = recipient
                .encrypt(&mut rng, Pkcs1v15Encrypt, chunk)
                .context("rsa encryption failed")?;
            sealed.extend_from_slice(&encrypted);
        }

        Ok(sealed)
    }
}

/// Load a peer public key from a PEM file (SPKI or PKCS#1).
pub fn load_public_key(path: &Path) -> anyhow::Result<RsaPublicKey> {
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("reading public key {}", path.display()))?;

    parse_public_key_pem(&pem).with_context(|| format!("parsing public key {}", path.display()))
}

fn parse_private_key_pem(pem: &str) -> anyhow::Result<RsaPrivateKey> {
    use rsa::pkcs1::DecodeRsaPrivateKey;
    use rsa::pkcs8::DecodePrivateKey;

    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .context("not a PKCS#8 or PKCS#1 PEM private key")
}

fn parse_public_key_pem(pem: &str) -> anyhow::Result<RsaPublicKey> {
    use rsa::pkcs1::DecodeRsaPublicKey;
    use rsa::pkcs8::DecodePublicKey;

    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .context("not an SPKI or PKCS#1 PEM public key")
}
