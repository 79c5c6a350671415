use crate::storage::{read_json, write_json};
use crate::{Error, IdentityKey, IdentityPublicKey};
use aes_gcm_siv::aead::Aead;
use aes_gcm_siv::{Aes256GcmSiv, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;
use zeroize::Zeroize;

const COUNTER_LENGTH: usize = 8;

/// Which way a bundle travels. Upstream bundles go from a client to the
/// server, downstream bundles from the server to a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upstream,
    Downstream,
}

/// Plaintext bundle identifier.
///
/// Upstream ids are `base64url(clientId ‖ counter)`, downstream ids are
/// `base64url(counter ‖ clientId)`, with the counter as 8 big-endian bytes.
/// Ids of one direction are ordered by their counter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleId(String);

impl BundleId {
    pub fn new(client_id: &str, counter: u64, direction: Direction) -> Result<Self, Error> {
        let client_id = decode(client_id)?;
        let counter = counter.to_be_bytes();

        let mut bytes = Vec::with_capacity(client_id.len() + COUNTER_LENGTH);
        match direction {
            Direction::Upstream => {
                bytes.extend_from_slice(&client_id);
                bytes.extend_from_slice(&counter);
            }
            Direction::Downstream => {
                bytes.extend_from_slice(&counter);
                bytes.extend_from_slice(&client_id);
            }
        }

        Ok(Self(URL_SAFE_NO_PAD.encode(bytes)))
    }

    /// Parses an id received from a counterparty.
    pub fn parse(id: &str) -> Result<Self, Error> {
        if decode(id)?.len() <= COUNTER_LENGTH {
            return Err(Error::BundleMalformed(format!("Bundle id too short: {id}")));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn counter(&self, direction: Direction) -> Result<u64, Error> {
        let bytes = decode(&self.0)?;
        if bytes.len() < COUNTER_LENGTH {
            return Err(Error::BundleMalformed(format!("Bundle id too short: {self}")));
        }
        let start = match direction {
            Direction::Upstream => bytes.len() - COUNTER_LENGTH,
            Direction::Downstream => 0,
        };
        let mut counter = [0u8; COUNTER_LENGTH];
        counter.copy_from_slice(&bytes[start..start + COUNTER_LENGTH]);
        Ok(u64::from_be_bytes(counter))
    }

    pub fn client_id(&self, direction: Direction) -> Result<String, Error> {
        let bytes = decode(&self.0)?;
        if bytes.len() < COUNTER_LENGTH {
            return Err(Error::BundleMalformed(format!("Bundle id too short: {self}")));
        }
        let client_id = match direction {
            Direction::Upstream => &bytes[..bytes.len() - COUNTER_LENGTH],
            Direction::Downstream => &bytes[COUNTER_LENGTH..],
        };
        Ok(URL_SAFE_NO_PAD.encode(client_id))
    }

    /// Orders two ids of the same direction by counter.
    pub fn compare(&self, other: &BundleId, direction: Direction) -> Result<Ordering, Error> {
        Ok(self.counter(direction)?.cmp(&other.counter(direction)?))
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn decode(value: &str) -> Result<Vec<u8>, Error> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|err| Error::BundleMalformed(format!("Invalid base64 in {value}: {err}")))
}

#[derive(Default, Serialize, Deserialize)]
#[serde(default)]
struct Counters {
    upstream: u64,
    downstream: u64,
}

/// Mints bundle ids for one client from a persisted counter per direction.
pub struct BundleIdGenerator {
    client_id: String,
    path: Option<PathBuf>,
    counters: Mutex<Counters>,
}

impl BundleIdGenerator {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            path: None,
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Opens a generator whose counters live in the JSON file at `path`.
    pub fn open(client_id: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let counters = read_json(&path)?.unwrap_or_default();
        Ok(Self {
            client_id: client_id.into(),
            path: Some(path),
            counters: Mutex::new(counters),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Counter of the last id minted for `direction`, 0 before the first.
    pub fn current(&self, direction: Direction) -> Result<u64, Error> {
        let counters = self
            .counters
            .lock()
            .map_err(|_| Error::Io("Bundle counter lock poisoned".to_string()))?;
        Ok(match direction {
            Direction::Upstream => counters.upstream,
            Direction::Downstream => counters.downstream,
        })
    }

    /// Mints the next id for `direction`. Counters start at 1 and the bumped
    /// counter is persisted before the id is handed out.
    pub fn next(&self, direction: Direction) -> Result<BundleId, Error> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| Error::Io("Bundle counter lock poisoned".to_string()))?;
        let counter = match direction {
            Direction::Upstream => &mut counters.upstream,
            Direction::Downstream => &mut counters.downstream,
        };
        let next = counter
            .checked_add(1)
            .ok_or_else(|| Error::BundleMalformed("Bundle counter exhausted".to_string()))?;
        *counter = next;

        if let Some(path) = &self.path {
            write_json(path, &*counters)?;
        }
        debug!(counter = next, ?direction, "Minted bundle id");

        BundleId::new(&self.client_id, next, direction)
    }
}

/// The ids a client asks for on its next download: the `window_length`
/// downstream ids following the largest one it has received.
pub fn download_window(
    client_id: &str,
    largest_received: Option<&BundleId>,
    window_length: u64,
) -> Result<Vec<BundleId>, Error> {
    let start = match largest_received {
        Some(id) => id.counter(Direction::Downstream)?.saturating_add(1),
        None => 1,
    };
    (start..start.saturating_add(window_length))
        .map(|counter| BundleId::new(client_id, counter, Direction::Downstream))
        .collect()
}

/// Deterministic encryption of bundle ids under a key both parties derive
/// from their long-term identity keys alone, so ids can be read before any
/// ratchet session exists. Equal ids encrypt to equal strings.
pub struct BundleIdCipher {
    cipher: Aes256GcmSiv,
    nonce: [u8; 12],
}

impl BundleIdCipher {
    pub fn new(
        local: &IdentityKey,
        remote: &IdentityPublicKey,
        info: &[u8],
    ) -> Result<Self, Error> {
        let mut shared = local.dh(&remote.dh_key());
        let hkdf = Hkdf::<Sha256>::new(Some(b"Ferry-Bundle-Id"), shared.as_bytes());
        shared.zeroize();

        let mut material = [0u8; 44];
        hkdf.expand(info, &mut material)
            .map_err(|_| Error::Crypto("HKDF expansion failed for bundle id key".to_string()))?;

        let key = aes_gcm_siv::Key::<Aes256GcmSiv>::from_slice(&material[0..32]);
        let cipher = Aes256GcmSiv::new(key);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&material[32..44]);
        material.zeroize();

        Ok(Self { cipher, nonce })
    }

    pub fn encrypt(&self, id: &BundleId) -> Result<String, Error> {
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&self.nonce), id.as_str().as_bytes())?;
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    pub fn decrypt(&self, encrypted: &str) -> Result<BundleId, Error> {
        let sealed = decode(encrypted.trim())?;
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&self.nonce), sealed.as_slice())
            .map_err(|_| Error::BundleMalformed("Bundle id does not decrypt".to_string()))?;
        let id = String::from_utf8(plaintext)
            .map_err(|_| Error::BundleMalformed("Bundle id is not UTF-8".to_string()))?;
        BundleId::parse(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn client_id() -> String {
        IdentityKey::new().unwrap().public().client_id()
    }

    #[test]
    fn test_counter_position_depends_on_direction() {
        let client = client_id();
        let up = BundleId::new(&client, 7, Direction::Upstream).unwrap();
        let down = BundleId::new(&client, 7, Direction::Downstream).unwrap();

        assert_ne!(up, down);
        assert_eq!(up.counter(Direction::Upstream).unwrap(), 7);
        assert_eq!(down.counter(Direction::Downstream).unwrap(), 7);
        assert_eq!(up.client_id(Direction::Upstream).unwrap(), client);
        assert_eq!(down.client_id(Direction::Downstream).unwrap(), client);
    }

    #[test]
    fn test_compare_uses_unsigned_counter() {
        let client = client_id();
        let small = BundleId::new(&client, 2, Direction::Downstream).unwrap();
        let large = BundleId::new(&client, 1 << 63, Direction::Downstream).unwrap();

        assert_eq!(
            small.compare(&large, Direction::Downstream).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            large.compare(&large.clone(), Direction::Downstream).unwrap(),
            Ordering::Equal
        );
    }

    #[test]
    fn test_generator_persists_counters() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("counters.json");
        let client = client_id();

        let generator = BundleIdGenerator::open(client.clone(), &path).unwrap();
        let first = generator.next(Direction::Upstream).unwrap();
        let second = generator.next(Direction::Upstream).unwrap();
        assert_eq!(first.counter(Direction::Upstream).unwrap(), 1);
        assert_eq!(second.counter(Direction::Upstream).unwrap(), 2);
        assert_eq!(
            generator
                .next(Direction::Downstream)
                .unwrap()
                .counter(Direction::Downstream)
                .unwrap(),
            1
        );
        drop(generator);

        let reopened = BundleIdGenerator::open(client, &path).unwrap();
        assert_eq!(reopened.current(Direction::Upstream).unwrap(), 2);
        assert_eq!(reopened.current(Direction::Downstream).unwrap(), 1);
        let third = reopened.next(Direction::Upstream).unwrap();
        assert_eq!(third.counter(Direction::Upstream).unwrap(), 3);
    }

    #[test]
    fn test_download_window_follows_largest_received() {
        let client = client_id();
        let window = download_window(&client, None, 3).unwrap();
        let counters: Vec<u64> = window
            .iter()
            .map(|id| id.counter(Direction::Downstream).unwrap())
            .collect();
        assert_eq!(counters, vec![1, 2, 3]);

        let largest = BundleId::new(&client, 41, Direction::Downstream).unwrap();
        let window = download_window(&client, Some(&largest), 2).unwrap();
        assert_eq!(window[0].counter(Direction::Downstream).unwrap(), 42);
        assert_eq!(window[1].counter(Direction::Downstream).unwrap(), 43);
    }

    #[test]
    fn test_id_cipher_is_shared_and_deterministic() {
        let client = IdentityKey::new().unwrap();
        let server = IdentityKey::new().unwrap();
        let on_client = BundleIdCipher::new(&client, &server.public(), b"test").unwrap();
        let on_server = BundleIdCipher::new(&server, &client.public(), b"test").unwrap();

        let id = BundleId::new(&client.public().client_id(), 5, Direction::Upstream).unwrap();
        let encrypted = on_client.encrypt(&id).unwrap();
        assert_eq!(encrypted, on_client.encrypt(&id).unwrap());
        assert_eq!(on_server.decrypt(&encrypted).unwrap(), id);

        let outsider = BundleIdCipher::new(&IdentityKey::new().unwrap(), &server.public(), b"test")
            .unwrap();
        assert!(matches!(
            outsider.decrypt(&encrypted),
            Err(Error::BundleMalformed(_))
        ));
    }
}
