//! HMAC-SHA256 message signing.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

use crate::types::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies the four JSON frames of a message.
///
/// An empty key puts the signer in unsigned mode: signatures are the empty
/// string and verification always succeeds.
#[derive(Clone)]
pub struct Signer {
    mac: Option<HmacSha256>,
}

impl Signer {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.is_empty() {
            return Ok(Self::unsigned());
        }
        let mac = HmacSha256::new_from_slice(key)
            .map_err(|e| Error::config(format!("invalid signing key: {}", e)))?;
        Ok(Self { mac: Some(mac) })
    }

    pub fn unsigned() -> Self {
        Self { mac: None }
    }

    pub fn is_signing(&self) -> bool {
        self.mac.is_some()
    }

    /// Lower-case hex HMAC over the concatenation of `parts`.
    pub fn sign(&self, parts: &[&[u8]]) -> String {
        match &self.mac {
            None => String::new(),
            Some(mac) => {
                let mut mac = mac.clone();
                for part in parts {
                    mac.update(part);
                }
                hex::encode(mac.finalize().into_bytes())
            }
        }
    }

    /// Check a hex signature (either case) against `parts`.
    pub fn verify(&self, signature: &[u8], parts: &[&[u8]]) -> Result<()> {
        let Some(mac) = &self.mac else {
            return Ok(());
        };
        let expected = hex::decode(signature)
            .map_err(|e| Error::signature(format!("signature is not hex: {}", e)))?;
        let mut mac = mac.clone();
        for part in parts {
            mac.update(part);
        }
        mac.verify_slice(&expected)
            .map_err(|_| Error::signature("signature mismatch"))
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("signing", &self.is_signing())
            .finish()
    }
}
