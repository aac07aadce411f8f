//! Node identity and end-to-end primitives: X25519 keypair, sealed messages, fingerprints.
//!
//! A sealed message is `version (1) || ephemeral public key (32) || ChaCha20-Poly1305 ciphertext`.
//! The AEAD key comes from HKDF-SHA256 over the ephemeral/recipient shared secret, so every
//! message uses a fresh key and the nonce can stay fixed.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::crypto::CryptoError;

/// Sealed message format version.
pub const SEALED_VERSION: u8 = 1;

const KEY_LEN: usize = 32;
const HEADER_LEN: usize = 1 + KEY_LEN;
const TAG_LEN: usize = 16;
const SEAL_DOMAIN: &[u8] = b"palmesh-private-message-v1";

/// Length in hex characters of a key fingerprint.
pub const FINGERPRINT_LEN: usize = 16;

/// X25519 public key (32 bytes). Travels as an opaque blob inside presence packets.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a `PublicKey` from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    /// Parse the exported form of a key. Rejects wrong lengths and the all-zero point.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        if arr == [0u8; 32] {
            return None;
        }
        Some(PublicKey(arr))
    }

    /// Short human-comparable digest: last 8 bytes of SHA-256 over the key, hex encoded.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[digest.len() - FINGERPRINT_LEN / 2..])
    }
}

/// X25519 keypair. The secret never leaves this struct.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    /// Generate a new random keypair from the OS RNG.
    pub fn generate() -> Result<Self, CryptoError> {
        let secret = random_secret().map_err(|_| CryptoError::KeyGenFailed)?;
        Ok(Self::from_secret(secret))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Open a message sealed to this keypair's public key.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < HEADER_LEN + TAG_LEN || sealed[0] != SEALED_VERSION {
            return Err(CryptoError::DecryptFailed);
        }
        let mut ephemeral = [0u8; KEY_LEN];
        ephemeral.copy_from_slice(&sealed[1..HEADER_LEN]);
        let shared = self
            .secret
            .diffie_hellman(&X25519PublicKey::from(ephemeral));
        if !shared.was_contributory() {
            return Err(CryptoError::DecryptFailed);
        }
        let key = derive_message_key(shared.as_bytes(), &ephemeral, self.public.as_bytes())
            .map_err(|_| CryptoError::DecryptFailed)?;
        let cipher =
            ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::DecryptFailed)?;
        cipher
            .decrypt(
                &message_nonce(),
                Payload {
                    msg: &sealed[HEADER_LEN..],
                    aad: &sealed[..HEADER_LEN],
                },
            )
            .map_err(|_| CryptoError::DecryptFailed)
    }
}

/// Seal `plaintext` to `recipient` with a fresh ephemeral key. Two seals of the same input differ.
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = random_secret().map_err(|_| CryptoError::EncryptFailed)?;
    let ephemeral_public = X25519PublicKey::from(&ephemeral).to_bytes();
    let shared = ephemeral.diffie_hellman(&X25519PublicKey::from(*recipient.as_bytes()));
    if !shared.was_contributory() {
        return Err(CryptoError::EncryptFailed);
    }
    let key = derive_message_key(shared.as_bytes(), &ephemeral_public, recipient.as_bytes())?;
    let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::EncryptFailed)?;

    let mut out = Vec::with_capacity(HEADER_LEN + plaintext.len() + TAG_LEN);
    out.push(SEALED_VERSION);
    out.extend_from_slice(&ephemeral_public);
    let ciphertext = cipher
        .encrypt(
            &message_nonce(),
            Payload {
                msg: plaintext,
                aad: out.as_slice(),
            },
        )
        .map_err(|_| CryptoError::EncryptFailed)?;
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn random_secret() -> Result<StaticSecret, rand::Error> {
    let mut bytes = [0u8; KEY_LEN];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(StaticSecret::from(bytes))
}

/// Derive the single-use AEAD key, binding both public keys into the HKDF info.
fn derive_message_key(
    shared_secret: &[u8; 32],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
) -> Result<[u8; 32], CryptoError> {
    let mut info = Vec::with_capacity(2 * KEY_LEN);
    info.extend_from_slice(ephemeral_public);
    info.extend_from_slice(recipient_public);
    let hkdf = Hkdf::<Sha256>::new(Some(SEAL_DOMAIN), shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(&info, &mut key)
        .map_err(|_| CryptoError::EncryptFailed)?;
    Ok(key)
}

// Each key seals exactly one message.
fn message_nonce() -> chacha20poly1305::Nonce {
    chacha20poly1305::Nonce::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let kp = Keypair::generate().unwrap();
        let sealed = seal(kp.public_key(), b"hello").unwrap();
        assert_eq!(kp.open(&sealed).unwrap(), b"hello");
    }

    #[test]
    fn seal_is_randomized() {
        let kp = Keypair::generate().unwrap();
        let a = seal(kp.public_key(), b"hello").unwrap();
        let b = seal(kp.public_key(), b"hello").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let alice = Keypair::generate().unwrap();
        let mallory = Keypair::generate().unwrap();
        let sealed = seal(alice.public_key(), b"hello").unwrap();
        assert!(matches!(
            mallory.open(&sealed),
            Err(CryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn open_rejects_tampering_and_truncation() {
        let kp = Keypair::generate().unwrap();
        let mut sealed = seal(kp.public_key(), b"hello").unwrap();
        assert!(kp.open(&sealed[..HEADER_LEN + 3]).is_err());
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(kp.open(&sealed), Err(CryptoError::DecryptFailed)));
        sealed[last] ^= 0x01;
        sealed[0] = SEALED_VERSION + 1;
        assert!(matches!(kp.open(&sealed), Err(CryptoError::DecryptFailed)));
    }

    #[test]
    fn public_key_from_slice() {
        let kp = Keypair::generate().unwrap();
        let bytes = kp.public_key().as_bytes().to_vec();
        assert_eq!(PublicKey::from_slice(&bytes).as_ref(), Some(kp.public_key()));
        assert!(PublicKey::from_slice(&bytes[..31]).is_none());
        assert!(PublicKey::from_slice(&[0u8; 32]).is_none());
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let key = PublicKey::from_bytes([7u8; 32]);
        let fp = key.fingerprint();
        assert_eq!(fp.len(), FINGERPRINT_LEN);
        assert_eq!(fp, PublicKey::from_bytes([7u8; 32]).fingerprint());
        assert_ne!(fp, PublicKey::from_bytes([8u8; 32]).fingerprint());
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn key_travels_as_raw_bytes_in_presence_packets() {
        use crate::protocol::{Packet, User, UserJoin, UserWithKey};
        use crate::wire::{decode_packet, encode_packet};

        let kp = Keypair::generate().unwrap();
        let join = Packet::UserJoin(UserJoin {
            user: UserWithKey {
                user: User::new("alice"),
                public_key: kp.public_key().as_bytes().to_vec(),
            },
            initial: true,
        });
        let Packet::UserJoin(decoded) = decode_packet(&encode_packet(&join).unwrap()).unwrap()
        else {
            panic!("expected join");
        };
        assert_eq!(decoded.user.public_key.len(), 32);
        assert_eq!(
            PublicKey::from_slice(&decoded.user.public_key).as_ref(),
            Some(kp.public_key())
        );
    }
}
