use crate::Error;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use x25519_dalek::SharedSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

const MESSAGE_KEY_SEED: u8 = 0x02;
const CHAIN_KEY_SEED: u8 = 0x01;

/// Symmetric ratchet chain: each step yields a fresh chain key and the
/// message keys for the current index.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub(crate) struct ChainKey {
    pub(crate) key: Box<[u8; 32]>,
    pub(crate) index: u32,
}

impl ChainKey {
    pub(crate) fn new(key: Box<[u8; 32]>, index: u32) -> Self {
        Self { key, index }
    }

    fn mac(&self, seed: u8) -> Result<[u8; 32], Error> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.key.as_slice())
            .map_err(|err| Error::Crypto(err.to_string()))?;
        mac.update(&[seed]);
        let mut output = [0u8; 32];
        output.copy_from_slice(&mac.finalize().into_bytes());
        Ok(output)
    }

    /// The chain key one step ahead.
    pub(crate) fn next(&self) -> Result<ChainKey, Error> {
        let index = self
            .index
            .checked_add(1)
            .ok_or_else(|| Error::InvalidMessage("Chain index exhausted".to_string()))?;
        Ok(ChainKey::new(Box::new(self.mac(CHAIN_KEY_SEED)?), index))
    }

    /// Derives the single-use message keys for this chain index.
    pub(crate) fn message_keys(&self) -> Result<MessageKeys, Error> {
        let mut seed = self.mac(MESSAGE_KEY_SEED)?;
        let hkdf = Hkdf::<Sha256>::new(None, &seed);
        seed.zeroize();

        let mut material = [0u8; 76];
        hkdf.expand(b"Ferry-Message-Keys", &mut material)
            .map_err(|_| Error::Crypto("HKDF expansion failed for message keys".to_string()))?;

        let mut keys = MessageKeys {
            cipher_key: Box::new([0u8; 32]),
            mac_key: Box::new([0u8; 32]),
            nonce: [0u8; 12],
            counter: self.index,
        };
        keys.cipher_key.copy_from_slice(&material[0..32]);
        keys.mac_key.copy_from_slice(&material[32..64]);
        keys.nonce.copy_from_slice(&material[64..76]);
        material.zeroize();

        Ok(keys)
    }
}

/// Keys for exactly one message.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct MessageKeys {
    pub(crate) cipher_key: Box<[u8; 32]>,
    pub(crate) mac_key: Box<[u8; 32]>,
    pub(crate) nonce: [u8; 12],
    pub(crate) counter: u32,
}

/// Root ratchet step: mixes a DH output into the root key, producing the next
/// root key and a fresh chain.
pub(crate) fn kdf_root(
    root_key: &[u8; 32],
    mut dh_output: SharedSecret,
) -> Result<(Box<[u8; 32]>, ChainKey), Error> {
    let hkdf = Hkdf::<Sha256>::new(Some(root_key), dh_output.as_bytes());

    let mut new_root_key = Box::new([0u8; 32]);
    let mut chain_key = Box::new([0u8; 32]);

    hkdf.expand(b"Ferry-Root", new_root_key.as_mut_slice())
        .map_err(|_| Error::Crypto("HKDF expansion failed for root key".to_string()))?;
    hkdf.expand(b"Ferry-Chain", chain_key.as_mut_slice())
        .map_err(|_| Error::Crypto("HKDF expansion failed for chain key".to_string()))?;

    dh_output.zeroize();

    Ok((new_root_key, ChainKey::new(chain_key, 0)))
}
