//! Protocol Buffers schema for everything ferry writes to disk or sends over
//! the exchange transport, plus conversions for the session record.

use crate::cipher::{
    ChainKey, MessageKeys, ReceiverChain, SenderChain, SessionRecord, SessionState,
};
use crate::{Error, IdentityPublicKey, X25519PublicKey, X25519Secret};
use prost::Message;
use std::collections::{HashMap, VecDeque};

include!(concat!(env!("OUT_DIR"), "/ferry.rs"));

const SESSION_RECORD_VERSION: u32 = 1;

/// Current schema version of [`BundleArchiveProto`].
pub(crate) const BUNDLE_ARCHIVE_VERSION: u32 = 1;

fn key_32(bytes: &[u8], what: &str) -> Result<Box<[u8; 32]>, Error> {
    if bytes.len() != 32 {
        return Err(Error::Serde(format!("Invalid {what} length")));
    }
    let mut key = Box::new([0u8; 32]);
    key.copy_from_slice(bytes);
    Ok(key)
}

fn public_key(bytes: &[u8], what: &str) -> Result<X25519PublicKey, Error> {
    X25519PublicKey::from_slice(bytes).map_err(|_| Error::Serde(format!("Invalid {what} length")))
}

fn optional_public_key(bytes: &[u8], what: &str) -> Result<Option<X25519PublicKey>, Error> {
    if bytes.is_empty() {
        Ok(None)
    } else {
        public_key(bytes, what).map(Some)
    }
}

fn identity(bytes: &[u8], what: &str) -> Result<IdentityPublicKey, Error> {
    IdentityPublicKey::from_slice(bytes)
        .map_err(|err| Error::Serde(format!("Invalid {what}: {err}")))
}

impl From<&ChainKey> for ChainKeyProto {
    fn from(chain_key: &ChainKey) -> Self {
        Self {
            key: chain_key.key.to_vec(),
            index: chain_key.index,
        }
    }
}

impl TryFrom<Option<ChainKeyProto>> for ChainKey {
    type Error = Error;

    fn try_from(proto: Option<ChainKeyProto>) -> Result<Self, Error> {
        let proto = proto.ok_or_else(|| Error::Serde("Missing chain key".to_string()))?;
        Ok(ChainKey::new(key_32(&proto.key, "chain key")?, proto.index))
    }
}

impl From<&MessageKeys> for MessageKeysProto {
    fn from(keys: &MessageKeys) -> Self {
        Self {
            cipher_key: keys.cipher_key.to_vec(),
            mac_key: keys.mac_key.to_vec(),
            nonce: keys.nonce.to_vec(),
            counter: keys.counter,
        }
    }
}

impl TryFrom<MessageKeysProto> for MessageKeys {
    type Error = Error;

    fn try_from(proto: MessageKeysProto) -> Result<Self, Error> {
        let nonce: [u8; 12] = proto
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| Error::Serde("Invalid nonce length".to_string()))?;
        Ok(MessageKeys {
            cipher_key: key_32(&proto.cipher_key, "cipher key")?,
            mac_key: key_32(&proto.mac_key, "mac key")?,
            nonce,
            counter: proto.counter,
        })
    }
}

fn encode_state(state: &SessionState) -> SessionStateProto {
    let mut skipped_message_keys: Vec<_> = state
        .skipped_message_keys
        .iter()
        .map(|((ratchet_key, counter), keys)| SkippedMessageKeyProto {
            ratchet_key: ratchet_key.as_bytes().to_vec(),
            counter: *counter,
            keys: Some(MessageKeysProto::from(keys)),
        })
        .collect();
    skipped_message_keys.sort_by(|a, b| {
        (a.counter, &a.ratchet_key).cmp(&(b.counter, &b.ratchet_key))
    });

    SessionStateProto {
        version: u32::from(state.version),
        local_identity: state.local_identity.to_bytes().to_vec(),
        remote_identity: state.remote_identity.to_bytes().to_vec(),
        root_key: state.root_key.to_vec(),
        sender_chain: state.sender_chain.as_ref().map(|chain| SenderChainProto {
            ratchet_secret: chain.ratchet_key.as_bytes().to_vec(),
            chain_key: Some(ChainKeyProto::from(&chain.chain_key)),
        }),
        receiver_chains: state
            .receiver_chains
            .iter()
            .map(|chain| ReceiverChainProto {
                ratchet_key: chain.ratchet_key.as_bytes().to_vec(),
                chain_key: Some(ChainKeyProto::from(&chain.chain_key)),
            })
            .collect(),
        previous_counter: state.previous_counter,
        pending_base_key: state
            .pending_base_key
            .map(|key| key.as_bytes().to_vec())
            .unwrap_or_default(),
        remote_base_key: state
            .remote_base_key
            .map(|key| key.as_bytes().to_vec())
            .unwrap_or_default(),
        skipped_message_keys,
    }
}

fn decode_state(proto: SessionStateProto) -> Result<SessionState, Error> {
    let version = u8::try_from(proto.version)
        .map_err(|_| Error::Serde(format!("Invalid session version: {}", proto.version)))?;

    let sender_chain = match proto.sender_chain {
        Some(chain) => Some(SenderChain {
            ratchet_key: X25519Secret::from(key_32(&chain.ratchet_secret, "ratchet secret")?),
            chain_key: ChainKey::try_from(chain.chain_key)?,
        }),
        None => None,
    };

    let receiver_chains = proto
        .receiver_chains
        .into_iter()
        .map(|chain| {
            Ok(ReceiverChain {
                ratchet_key: public_key(&chain.ratchet_key, "receiver ratchet key")?,
                chain_key: ChainKey::try_from(chain.chain_key)?,
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;

    let mut skipped_message_keys = HashMap::with_capacity(proto.skipped_message_keys.len());
    for skipped in proto.skipped_message_keys {
        let keys = skipped
            .keys
            .ok_or_else(|| Error::Serde("Missing skipped message keys".to_string()))?;
        skipped_message_keys.insert(
            (
                public_key(&skipped.ratchet_key, "skipped ratchet key")?,
                skipped.counter,
            ),
            MessageKeys::try_from(keys)?,
        );
    }

    Ok(SessionState {
        version,
        local_identity: identity(&proto.local_identity, "local identity")?,
        remote_identity: identity(&proto.remote_identity, "remote identity")?,
        root_key: key_32(&proto.root_key, "root key")?,
        sender_chain,
        receiver_chains,
        previous_counter: proto.previous_counter,
        pending_base_key: optional_public_key(&proto.pending_base_key, "pending base key")?,
        remote_base_key: optional_public_key(&proto.remote_base_key, "remote base key")?,
        skipped_message_keys,
    })
}

pub(crate) fn encode_session_record(record: &SessionRecord) -> Result<Vec<u8>, Error> {
    let proto = SessionRecordProto {
        version: SESSION_RECORD_VERSION,
        current: record.current.as_ref().map(encode_state),
        previous: record.previous.iter().map(encode_state).collect(),
    };

    let mut buf = Vec::with_capacity(proto.encoded_len());
    proto
        .encode(&mut buf)
        .map_err(|err| Error::Serde(format!("Failed to encode session record: {err:?}")))?;

    Ok(buf)
}

pub(crate) fn decode_session_record(bytes: &[u8]) -> Result<SessionRecord, Error> {
    let proto = SessionRecordProto::decode(bytes)
        .map_err(|err| Error::Serde(format!("Failed to decode session record: {err:?}")))?;

    if proto.version != SESSION_RECORD_VERSION {
        return Err(Error::Serde(format!(
            "Unsupported schema version: {}",
            proto.version
        )));
    }

    Ok(SessionRecord {
        current: proto.current.map(decode_state).transpose()?,
        previous: proto
            .previous
            .into_iter()
            .map(decode_state)
            .collect::<Result<VecDeque<_>, Error>>()?,
    })
}

/// Encodes any schema message into a fresh buffer.
#[cfg(test)]
pub(crate) fn encode<M: Message>(message: &M) -> Vec<u8> {
    message.encode_to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FerryConfig, IdentityKey, PeerBundle, SessionCipher};
    use std::sync::Arc;

    #[test]
    fn test_session_record_roundtrip_preserves_skipped_keys() {
        let alice = Arc::new(IdentityKey::new().unwrap());
        let bob = Arc::new(IdentityKey::new().unwrap());
        let ratchet = X25519Secret::generate().unwrap();
        let bundle = PeerBundle::new(&bob, ratchet.public_key());

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bob.session");
        let alice_cipher = SessionCipher::new(alice, FerryConfig::default());
        alice_cipher.initiate(&bundle).unwrap();
        let bob_cipher = SessionCipher::open(bob.clone(), &path, FerryConfig::default())
            .unwrap()
            .with_signed_ratchet_key(ratchet.clone());

        let messages: Vec<_> = (0..4)
            .map(|i| alice_cipher.encrypt(format!("m{i}").as_bytes()).unwrap())
            .collect();
        bob_cipher.decrypt(&messages[3]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let record = decode_session_record(&bytes).unwrap();
        let state = record.current.as_ref().unwrap();
        assert_eq!(state.skipped_message_keys.len(), 3);
        assert_eq!(state.remote_identity, alice_cipher.local_identity());
        assert_eq!(encode_session_record(&record).unwrap(), bytes);
    }

    #[test]
    fn test_rejects_unknown_schema_version() {
        let bytes = encode(&SessionRecordProto {
            version: 9,
            current: None,
            previous: Vec::new(),
        });
        assert!(matches!(
            decode_session_record(&bytes),
            Err(Error::Serde(_))
        ));
    }

    #[test]
    fn test_rejects_truncated_keys() {
        let bytes = encode(&SessionRecordProto {
            version: SESSION_RECORD_VERSION,
            current: Some(SessionStateProto {
                version: 3,
                root_key: vec![0u8; 31],
                ..Default::default()
            }),
            previous: Vec::new(),
        });
        assert!(decode_session_record(&bytes).is_err());
    }
}
