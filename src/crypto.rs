//! Cryptographic primitives for QuantDog
//!
//! ML-KEM (FIPS 203) for establishing a shared secret with a peer, and
//! XChaCha20-Poly1305 keyed from that secret for relay payloads.

use std::fmt;
use std::str::FromStr;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{Ciphertext, Encoded, EncodedSizeUser, KemCore, MlKem1024, MlKem512, MlKem768};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tracing::debug;

use crate::error::{Error, Result};

/// Shared secret size for every supported parameter set
pub const SHARED_SECRET_LEN: usize = 32;

/// XChaCha20 nonce size
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag size
pub const TAG_LEN: usize = 16;

const RELAY_KEY_INFO: &[u8] = b"quantdog relay v1";

/// Supported KEM parameter sets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KemAlgorithm {
    #[default]
    MlKem512,
    MlKem768,
    MlKem1024,
}

impl KemAlgorithm {
    pub const ALL: [KemAlgorithm; 3] = [
        KemAlgorithm::MlKem512,
        KemAlgorithm::MlKem768,
        KemAlgorithm::MlKem1024,
    ];

    /// Canonical identifier, as used in configuration
    pub fn name(&self) -> &'static str {
        match self {
            KemAlgorithm::MlKem512 => "ML-KEM-512",
            KemAlgorithm::MlKem768 => "ML-KEM-768",
            KemAlgorithm::MlKem1024 => "ML-KEM-1024",
        }
    }

    /// One-byte identifier carried in handshake messages
    pub fn wire_id(&self) -> u8 {
        match self {
            KemAlgorithm::MlKem512 => 1,
            KemAlgorithm::MlKem768 => 2,
            KemAlgorithm::MlKem1024 => 3,
        }
    }

    pub fn from_wire_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.wire_id() == id)
    }

    /// Encoded encapsulation (public) key size
    pub fn encapsulation_key_len(&self) -> usize {
        match self {
            KemAlgorithm::MlKem512 => 800,
            KemAlgorithm::MlKem768 => 1184,
            KemAlgorithm::MlKem1024 => 1568,
        }
    }

    /// Ciphertext size
    pub fn ciphertext_len(&self) -> usize {
        match self {
            KemAlgorithm::MlKem512 => 768,
            KemAlgorithm::MlKem768 => 1088,
            KemAlgorithm::MlKem1024 => 1568,
        }
    }

    /// Shared secret size
    pub fn shared_secret_len(&self) -> usize {
        SHARED_SECRET_LEN
    }

    /// Encapsulate against a peer's encoded public key.
    /// Returns (ciphertext, shared secret).
    pub fn encapsulate(&self, encapsulation_key: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        if encapsulation_key.len() != self.encapsulation_key_len() {
            return Err(Error::Crypto(format!(
                "{} public key must be {} bytes, got {}",
                self,
                self.encapsulation_key_len(),
                encapsulation_key.len()
            )));
        }
        match self {
            KemAlgorithm::MlKem512 => encapsulate_with::<MlKem512>(encapsulation_key),
            KemAlgorithm::MlKem768 => encapsulate_with::<MlKem768>(encapsulation_key),
            KemAlgorithm::MlKem1024 => encapsulate_with::<MlKem1024>(encapsulation_key),
        }
    }
}

impl fmt::Display for KemAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KemAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|alg| alg.name() == normalized)
            .ok_or_else(|| Error::Config(format!("unsupported KEM algorithm '{}'", s)))
    }
}

enum DecapsulationKey {
    MlKem512(<MlKem512 as KemCore>::DecapsulationKey),
    MlKem768(<MlKem768 as KemCore>::DecapsulationKey),
    MlKem1024(<MlKem1024 as KemCore>::DecapsulationKey),
}

/// Ephemeral KEM keypair held by the initiating side of a handshake.
/// Generated fresh for every attempt and never reused.
pub struct KemKeyPair {
    algorithm: KemAlgorithm,
    decapsulation_key: DecapsulationKey,
    public: Vec<u8>,
}

impl KemKeyPair {
    /// Generate a new random keypair
    pub fn generate(algorithm: KemAlgorithm) -> Self {
        let (decapsulation_key, public) = match algorithm {
            KemAlgorithm::MlKem512 => {
                let (dk, ek) = generate_with::<MlKem512>();
                (DecapsulationKey::MlKem512(dk), ek)
            }
            KemAlgorithm::MlKem768 => {
                let (dk, ek) = generate_with::<MlKem768>();
                (DecapsulationKey::MlKem768(dk), ek)
            }
            KemAlgorithm::MlKem1024 => {
                let (dk, ek) = generate_with::<MlKem1024>();
                (DecapsulationKey::MlKem1024(dk), ek)
            }
        };
        debug!("{} keypair generated (ek={}B)", algorithm, public.len());
        Self {
            algorithm,
            decapsulation_key,
            public,
        }
    }

    pub fn algorithm(&self) -> KemAlgorithm {
        self.algorithm
    }

    /// Encoded encapsulation key, sent to the peer
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Recover the shared secret from the peer's ciphertext
    pub fn decapsulate(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() != self.algorithm.ciphertext_len() {
            return Err(Error::Crypto(format!(
                "{} ciphertext must be {} bytes, got {}",
                self.algorithm,
                self.algorithm.ciphertext_len(),
                ciphertext.len()
            )));
        }
        match &self.decapsulation_key {
            DecapsulationKey::MlKem512(dk) => decapsulate_with::<MlKem512>(dk, ciphertext),
            DecapsulationKey::MlKem768(dk) => decapsulate_with::<MlKem768>(dk, ciphertext),
            DecapsulationKey::MlKem1024(dk) => decapsulate_with::<MlKem1024>(dk, ciphertext),
        }
    }
}

fn generate_with<K: KemCore>() -> (K::DecapsulationKey, Vec<u8>) {
    let (dk, ek) = K::generate(&mut OsRng);
    (dk, ek.as_bytes().as_slice().to_vec())
}

fn encapsulate_with<K: KemCore>(encapsulation_key: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let encoded = Encoded::<K::EncapsulationKey>::try_from(encapsulation_key)
        .map_err(|_| Error::Crypto("failed to parse encapsulation key".into()))?;
    let ek = K::EncapsulationKey::from_bytes(&encoded);
    let (ct, ss) = ek
        .encapsulate(&mut OsRng)
        .map_err(|_| Error::Crypto("encapsulation failed".into()))?;
    Ok((ct.as_slice().to_vec(), ss.as_slice().to_vec()))
}

fn decapsulate_with<K: KemCore>(dk: &K::DecapsulationKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let ct = Ciphertext::<K>::try_from(ciphertext)
        .map_err(|_| Error::Crypto("failed to parse ciphertext".into()))?;
    let ss = dk
        .decapsulate(&ct)
        .map_err(|_| Error::Crypto("decapsulation failed".into()))?;
    Ok(ss.as_slice().to_vec())
}

/// Authenticated cipher for relay payloads, keyed from a KEM shared secret.
///
/// Nonces are random 192-bit values; no counter state is kept, so one
/// cipher serves every connection to or from the peer.
#[derive(Clone)]
pub struct RelayCipher {
    cipher: XChaCha20Poly1305,
}

impl RelayCipher {
    /// Derive the relay key from a shared secret
    pub fn from_shared_secret(shared_secret: &[u8]) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(None, shared_secret);
        let mut key = [0u8; 32];
        hk.expand(RELAY_KEY_INFO, &mut key)
            .map_err(|_| Error::Crypto("relay key derivation failed".into()))?;
        Ok(Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(&key)),
        })
    }

    /// Encrypt, returns `nonce || ciphertext || tag`
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Crypto("encryption failed".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt the output of [`seal`](Self::seal)
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Crypto(format!(
                "sealed payload too short ({} bytes)",
                sealed.len()
            )));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Crypto("decryption failed (invalid key or corrupted data)".into()))
    }
}

impl fmt::Debug for RelayCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayCipher").field("key", &"[REDACTED]").finish()
    }
}
