//! Signing backends a worker can be initialized with.

use std::sync::Arc;

use crate::bitcoin::secp256k1::{All, Keypair, Message, PublicKey, Secp256k1, SecretKey};

use super::message::{SignatureType, SigningTask};

pub const SECP256K1_BACKEND: &str = "secp256k1";

pub trait EccBackend: Send {
    /// Sign `task.hash` with `private_key`, returning a 64-byte signature.
    fn sign(&self, task: &SigningTask, private_key: &[u8; 32]) -> Result<Vec<u8>, String>;
}

/// Resolves the `ecc_lib_id` of an `Init` request to a backend.
pub type BackendFactory = Arc<dyn Fn(&str) -> Option<Box<dyn EccBackend>> + Send + Sync>;

pub fn default_backends() -> BackendFactory {
    Arc::new(|id| match id {
        SECP256K1_BACKEND => Some(Box::new(Secp256k1Backend::new()) as Box<dyn EccBackend>),
        _ => None,
    })
}

pub struct Secp256k1Backend {
    secp: Secp256k1<All>,
}

impl Secp256k1Backend {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }
}

impl Default for Secp256k1Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl EccBackend for Secp256k1Backend {
    fn sign(&self, task: &SigningTask, private_key: &[u8; 32]) -> Result<Vec<u8>, String> {
        let mut secret_key = SecretKey::from_slice(private_key).map_err(|e| e.to_string())?;
        let msg = Message::from_digest(task.hash);

        let signature = match task.signature_type {
            SignatureType::Ecdsa => {
                let pubkey = PublicKey::from_secret_key(&self.secp, &secret_key);
                if pubkey.serialize().as_slice() != task.public_key.as_slice() {
                    secret_key.non_secure_erase();
                    return Err("private key does not match task public key".to_string());
                }
                let sig = if task.low_r {
                    self.secp.sign_ecdsa_low_r(&msg, &secret_key)
                } else {
                    self.secp.sign_ecdsa(&msg, &secret_key)
                };
                Ok(sig.serialize_compact().to_vec())
            }
            SignatureType::Schnorr => {
                let mut keypair = Keypair::from_secret_key(&self.secp, &secret_key);
                let result = if keypair.x_only_public_key().0.serialize().as_slice() != task.public_key.as_slice() {
                    Err("private key does not match task public key".to_string())
                } else {
                    Ok(self.secp.sign_schnorr_no_aux_rand(&msg, &keypair).serialize().to_vec())
                };
                keypair.non_secure_erase();
                result
            }
        };
        secret_key.non_secure_erase();
        signature
    }
}
