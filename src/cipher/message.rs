use crate::{Error, IdentityPublicKey, X25519PublicKey};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::io::{ErrorKind, Read};

type HmacSha256 = Hmac<Sha256>;

/// Envelope version produced by this crate. Older versions are rejected.
pub const CURRENT_VERSION: u8 = 3;

/// Length of the truncated envelope MAC.
pub const MAC_LENGTH: usize = 8;

pub(crate) const HEADER_LENGTH: usize = 1 + 1 + 32 + 4 + 4;

const SIGNAL_TYPE: u8 = 2;
const PRE_KEY_TYPE: u8 = 3;

fn check_version(version: u8) -> Result<(), Error> {
    if version < CURRENT_VERSION {
        return Err(Error::InvalidMessage(format!(
            "Legacy message version: {version}"
        )));
    }
    if version > CURRENT_VERSION {
        return Err(Error::InvalidMessage(format!(
            "Unknown message version: {version}"
        )));
    }
    Ok(())
}

fn read_exact_or_invalid<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), Error> {
    reader.read_exact(buf).map_err(|err| match err.kind() {
        ErrorKind::UnexpectedEof => Error::InvalidMessage("Truncated message header".to_string()),
        _ => Error::from(err),
    })
}

/// Envelope header: `[version:1][ratchetKeyLen:1][ratchetKey][counter:4][prevCounter:4]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MessageHeader {
    pub(crate) version: u8,
    pub(crate) ratchet_key: X25519PublicKey,
    pub(crate) counter: u32,
    pub(crate) previous_counter: u32,
}

impl MessageHeader {
    pub(crate) fn to_bytes(&self) -> [u8; HEADER_LENGTH] {
        let mut bytes = [0u8; HEADER_LENGTH];
        bytes[0] = self.version;
        bytes[1] = 32;
        bytes[2..34].copy_from_slice(self.ratchet_key.as_bytes());
        bytes[34..38].copy_from_slice(&self.counter.to_be_bytes());
        bytes[38..42].copy_from_slice(&self.previous_counter.to_be_bytes());
        bytes
    }

    /// Reads the header fields in wire order, rejecting legacy versions before
    /// anything else is consumed.
    pub(crate) fn read_from<R: Read>(reader: &mut R) -> Result<Self, Error> {
        let mut version = [0u8; 1];
        read_exact_or_invalid(reader, &mut version)?;
        check_version(version[0])?;

        let mut key_length = [0u8; 1];
        read_exact_or_invalid(reader, &mut key_length)?;
        if key_length[0] != 32 {
            return Err(Error::InvalidMessage(format!(
                "Invalid ratchet key length: {}",
                key_length[0]
            )));
        }

        let mut key = [0u8; 32];
        read_exact_or_invalid(reader, &mut key)?;

        let mut counter = [0u8; 4];
        read_exact_or_invalid(reader, &mut counter)?;
        let mut previous_counter = [0u8; 4];
        read_exact_or_invalid(reader, &mut previous_counter)?;

        Ok(Self {
            version: version[0],
            ratchet_key: X25519PublicKey::from(key),
            counter: u32::from_be_bytes(counter),
            previous_counter: u32::from_be_bytes(previous_counter),
        })
    }
}

/// MAC over both identities, the header and the ciphertext, computed
/// incrementally so the streaming cipher never has to hold the whole body.
pub(crate) struct EnvelopeMac(HmacSha256);

impl EnvelopeMac {
    pub(crate) fn new(
        mac_key: &[u8; 32],
        sender: &IdentityPublicKey,
        receiver: &IdentityPublicKey,
    ) -> Result<Self, Error> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key)
            .map_err(|err| Error::Crypto(err.to_string()))?;
        mac.update(&sender.to_bytes());
        mac.update(&receiver.to_bytes());
        Ok(Self(mac))
    }

    pub(crate) fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub(crate) fn finalize(self) -> [u8; MAC_LENGTH] {
        let mut mac = [0u8; MAC_LENGTH];
        mac.copy_from_slice(&self.0.finalize().into_bytes()[..MAC_LENGTH]);
        mac
    }

    /// Constant-time comparison against a received truncated MAC.
    pub(crate) fn verify(self, received: &[u8]) -> Result<(), Error> {
        self.0
            .verify_truncated_left(received)
            .map_err(|_| Error::MacVerificationFailed)
    }
}

/// A ratchet message: header, block-sealed ciphertext and truncated MAC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignalMessage {
    pub(crate) header: MessageHeader,
    pub(crate) ciphertext: Vec<u8>,
    pub(crate) mac: [u8; MAC_LENGTH],
}

impl SignalMessage {
    /// The sending chain counter this message was encrypted at.
    pub fn counter(&self) -> u32 {
        self.header.counter
    }

    /// The sender's current ratchet public key.
    pub fn ratchet_key(&self) -> X25519PublicKey {
        self.header.ratchet_key
    }

    /// Serializes to the wire envelope, identical to what the streaming
    /// cipher writes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LENGTH + self.ciphertext.len() + MAC_LENGTH);
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&self.ciphertext);
        bytes.extend_from_slice(&self.mac);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = bytes;
        let header = MessageHeader::read_from(&mut reader)?;
        if reader.len() < MAC_LENGTH {
            return Err(Error::InvalidMessage("Message too short".to_string()));
        }

        let (ciphertext, mac_bytes) = reader.split_at(reader.len() - MAC_LENGTH);
        let mut mac = [0u8; MAC_LENGTH];
        mac.copy_from_slice(mac_bytes);

        Ok(Self {
            header,
            ciphertext: ciphertext.to_vec(),
            mac,
        })
    }
}

/// A signal message wrapped with the handshake material the responder needs
/// to build the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreKeySignalMessage {
    pub(crate) version: u8,
    pub(crate) base_key: X25519PublicKey,
    pub(crate) identity: IdentityPublicKey,
    pub(crate) message: SignalMessage,
}

impl PreKeySignalMessage {
    pub fn base_key(&self) -> X25519PublicKey {
        self.base_key
    }

    pub fn identity(&self) -> IdentityPublicKey {
        self.identity
    }

    pub fn message(&self) -> &SignalMessage {
        &self.message
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let inner = self.message.to_bytes();
        let mut bytes = Vec::with_capacity(1 + 32 + IdentityPublicKey::LENGTH + inner.len());
        bytes.push(self.version);
        bytes.extend_from_slice(self.base_key.as_bytes());
        bytes.extend_from_slice(&self.identity.to_bytes());
        bytes.extend_from_slice(&inner);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let prefix = 1 + 32 + IdentityPublicKey::LENGTH;
        if bytes.len() < prefix {
            return Err(Error::InvalidMessage("Pre-key message too short".to_string()));
        }
        check_version(bytes[0])?;

        Ok(Self {
            version: bytes[0],
            base_key: X25519PublicKey::from_slice(&bytes[1..33])?,
            identity: IdentityPublicKey::from_slice(&bytes[33..prefix])?,
            message: SignalMessage::from_bytes(&bytes[prefix..])?,
        })
    }
}

/// Output of the in-memory cipher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CiphertextMessage {
    /// First messages of an initiator whose session the peer has not confirmed.
    PreKey(PreKeySignalMessage),
    Signal(SignalMessage),
}

impl CiphertextMessage {
    /// Serializes with a leading type byte.
    pub fn to_bytes(&self) -> Vec<u8> {
        let (kind, body) = match self {
            CiphertextMessage::PreKey(message) => (PRE_KEY_TYPE, message.to_bytes()),
            CiphertextMessage::Signal(message) => (SIGNAL_TYPE, message.to_bytes()),
        };
        let mut bytes = Vec::with_capacity(1 + body.len());
        bytes.push(kind);
        bytes.extend_from_slice(&body);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        match bytes.split_first() {
            Some((&PRE_KEY_TYPE, body)) => Ok(Self::PreKey(PreKeySignalMessage::from_bytes(body)?)),
            Some((&SIGNAL_TYPE, body)) => Ok(Self::Signal(SignalMessage::from_bytes(body)?)),
            Some((kind, _)) => Err(Error::InvalidMessage(format!(
                "Unknown message type: {kind}"
            ))),
            None => Err(Error::InvalidMessage("Empty message".to_string())),
        }
    }

    /// The inner ratchet message.
    pub fn signal_message(&self) -> &SignalMessage {
        match self {
            CiphertextMessage::PreKey(message) => &message.message,
            CiphertextMessage::Signal(message) => message,
        }
    }
}
