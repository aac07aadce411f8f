//! Crypto provider: this node's keypair plus the public keys of every known remote user.

use std::collections::HashMap;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::identity::{self, Keypair, PublicKey};
use crate::protocol::User;

/// Owns the local keypair and the key registry. Keys live exactly as long as roster membership.
pub struct CryptoProvider {
    keypair: Keypair,
    user_keys: HashMap<Uuid, PublicKey>,
}

impl CryptoProvider {
    /// Generate this node's identity. Fails only if the OS RNG does.
    pub fn new() -> Result<Self, CryptoError> {
        Ok(Self::with_keypair(Keypair::generate()?))
    }

    pub fn with_keypair(keypair: Keypair) -> Self {
        Self {
            keypair,
            user_keys: HashMap::new(),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }

    /// Parse and store a remote user's key, replacing any earlier one.
    /// An unparsable key is logged and ignored; the user just can't be messaged privately.
    pub fn register_user(&mut self, id: Uuid, key: &[u8]) -> bool {
        match PublicKey::from_slice(key) {
            Some(key) => {
                self.user_keys.insert(id, key);
                true
            }
            None => {
                warn!(user = %id, len = key.len(), "ignoring invalid public key");
                false
            }
        }
    }

    pub fn has_key(&self, id: &Uuid) -> bool {
        self.user_keys.contains_key(id)
    }

    pub fn encrypt(&self, to: &Uuid, plaintext: &str) -> Result<Vec<u8>, CryptoError> {
        let key = self
            .user_keys
            .get(to)
            .ok_or(CryptoError::UnknownUser(*to))?;
        identity::seal(key, plaintext.as_bytes())
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<String, CryptoError> {
        let plain = self.keypair.open(ciphertext)?;
        String::from_utf8(plain).map_err(|_| CryptoError::DecryptFailed)
    }

    /// Drop keys of departed users.
    pub fn forget(&mut self, users: &[User]) {
        for user in users {
            if self.user_keys.remove(&user.id).is_some() {
                debug!(user = %user.id, "forgot public key");
            }
        }
    }

    pub fn fingerprint(&self, id: &Uuid) -> Result<String, CryptoError> {
        self.user_keys
            .get(id)
            .map(PublicKey::fingerprint)
            .ok_or(CryptoError::UnknownUser(*id))
    }

    pub fn local_fingerprint(&self) -> String {
        self.keypair.public_key().fingerprint()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key generation failed")]
    KeyGenFailed,
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("no public key registered for user {0}")]
    UnknownUser(Uuid),
}
