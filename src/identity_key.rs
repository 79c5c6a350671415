use crate::Error;
use crate::{X25519PublicKey, X25519Secret};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{SecretKey, Signature, Signer, SigningKey, VerifyingKey};
use rand::TryRngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::SharedSecret;
use zeroize::Zeroize;

/// Generates a cryptographically secure random 32-byte seed.
pub(crate) fn generate_random_seed() -> Result<Box<[u8; 32]>, Error> {
    let mut seed = Box::new([0u8; 32]);
    OsRng
        .try_fill_bytes(seed.as_mut_slice())
        .map_err(|_| Error::Random)?;
    Ok(seed)
}

/// Long-term identity of a device: an Ed25519 key for signing chunks and
/// recency blobs, and an X25519 key for session bootstrap and the static
/// bundle-id key.
pub struct IdentityKey {
    signing_key: Box<SigningKey>,
    dh_key: X25519Secret,
}

impl IdentityKey {
    /// Creates a new identity key with randomly generated components.
    pub fn new() -> Result<Self, Error> {
        let signing_seed = generate_random_seed()?;
        let signing_key = Box::new(SigningKey::from(SecretKey::from(*signing_seed)));
        let dh_key = X25519Secret::from(generate_random_seed()?);

        Ok(Self {
            signing_key,
            dh_key,
        })
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// The shareable half of this identity.
    pub fn public(&self) -> IdentityPublicKey {
        IdentityPublicKey {
            signing_key: self.signing_key.verifying_key(),
            dh_key: self.dh_key.public_key(),
        }
    }

    pub(crate) fn dh(&self, public_key: &X25519PublicKey) -> SharedSecret {
        self.dh_key.dh(public_key)
    }

    /// Serializes the identity key to a 64-byte array.
    ///
    /// The first 32 bytes contain the Ed25519 private key,
    /// and the last 32 bytes contain the X25519 private key.
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[0..32].copy_from_slice(self.signing_key.as_bytes().as_slice());
        bytes[32..64].copy_from_slice(self.dh_key.as_bytes());

        bytes
    }
}

impl From<[u8; 64]> for IdentityKey {
    fn from(mut bytes: [u8; 64]) -> Self {
        let mut signing_bytes = Box::new([0u8; 32]);
        signing_bytes.copy_from_slice(&bytes[0..32]);
        let signing_key = Box::new(SigningKey::from_bytes(&signing_bytes));
        signing_bytes.zeroize();

        let mut dh_bytes = Box::new([0u8; 32]);
        dh_bytes.copy_from_slice(&bytes[32..64]);
        let dh_key = X25519Secret::from(dh_bytes);

        bytes.zeroize();

        Self {
            signing_key,
            dh_key,
        }
    }
}

/// Public identity of a counterparty.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdentityPublicKey {
    signing_key: VerifyingKey,
    dh_key: X25519PublicKey,
}

impl IdentityPublicKey {
    pub const LENGTH: usize = 64;

    /// Verifies an Ed25519 signature made by this identity.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), Error> {
        let signature = Signature::from_slice(signature)
            .map_err(|err| Error::Crypto(format!("Invalid signature encoding: {err}")))?;
        self.signing_key
            .verify_strict(message, &signature)
            .map_err(|err| Error::Crypto(err.to_string()))
    }

    pub fn dh_key(&self) -> X25519PublicKey {
        self.dh_key
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[0..32].copy_from_slice(self.signing_key.as_bytes());
        bytes[32..64].copy_from_slice(self.dh_key.as_bytes());
        bytes
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != Self::LENGTH {
            return Err(Error::UntrustedIdentity(
                "Invalid identity key length".to_string(),
            ));
        }
        let mut signing = [0u8; 32];
        signing.copy_from_slice(&bytes[0..32]);
        let signing_key = VerifyingKey::from_bytes(&signing)
            .map_err(|err| Error::UntrustedIdentity(err.to_string()))?;

        Ok(Self {
            signing_key,
            dh_key: X25519PublicKey::from_slice(&bytes[32..64])?,
        })
    }

    /// Stable client identifier derived from the identity: base64url of its
    /// SHA-256 digest.
    pub fn client_id(&self) -> String {
        let digest = Sha256::digest(self.to_bytes());
        URL_SAFE_NO_PAD.encode(digest)
    }
}

/// The responder's published key material: its identity and a ratchet key
/// signed by that identity.
#[derive(Clone, Debug)]
pub struct PeerBundle {
    pub(crate) identity: IdentityPublicKey,
    pub(crate) ratchet_key: X25519PublicKey,
    pub(crate) signature: Vec<u8>,
}

impl PeerBundle {
    /// Signs `ratchet_key` with `identity` and packages both for publication.
    pub fn new(identity: &IdentityKey, ratchet_key: X25519PublicKey) -> Self {
        Self {
            identity: identity.public(),
            ratchet_key,
            signature: identity.sign(ratchet_key.as_bytes()).to_vec(),
        }
    }

    pub fn from_parts(
        identity: IdentityPublicKey,
        ratchet_key: X25519PublicKey,
        signature: Vec<u8>,
    ) -> Self {
        Self {
            identity,
            ratchet_key,
            signature,
        }
    }

    /// Verifies that the ratchet key was signed by the identity key.
    pub fn verify(&self) -> Result<(), Error> {
        self.identity
            .verify(self.ratchet_key.as_bytes(), &self.signature)
            .map_err(|err| Error::UntrustedIdentity(err.to_string()))
    }

    pub fn identity(&self) -> IdentityPublicKey {
        self.identity
    }

    pub fn ratchet_key(&self) -> X25519PublicKey {
        self.ratchet_key
    }
}
