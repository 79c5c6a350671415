mod chain;
mod handshake;
mod message;
mod state;
mod stream;

pub(crate) use chain::{ChainKey, MessageKeys};
use message::{EnvelopeMac, HEADER_LENGTH, MessageHeader};
pub use message::{
    CURRENT_VERSION, CiphertextMessage, MAC_LENGTH, PreKeySignalMessage, SignalMessage,
};
pub(crate) use state::{ReceiverChain, SenderChain, SessionRecord, SessionState};
use stream::{BlockCipher, open_stream, seal_stream};

use crate::storage::{read_optional, write_atomic};
use crate::{
    Error, FerryConfig, IdentityKey, IdentityPublicKey, PeerBundle, X25519PublicKey, X25519Secret,
};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Plaintext block size of the cipher body. Part of the wire format.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Ratcheting session cipher for one counterparty.
///
/// All operations take the session lock for their whole read-modify-write
/// cycle and work on a copy of the session state, which is only written back
/// (and persisted) once the operation has fully succeeded. A failed decrypt
/// therefore leaves the session exactly as it was.
///
/// The same cipher can act as the initiator of a session (see
/// [`SessionCipher::initiate`]) or as the responder, in which case it needs a
/// signed ratchet key to answer pre-key material.
pub struct SessionCipher {
    identity: Arc<IdentityKey>,
    signed_ratchet_key: Option<X25519Secret>,
    record: Mutex<SessionRecord>,
    path: Option<PathBuf>,
    config: FerryConfig,
}

impl SessionCipher {
    /// Creates a cipher whose session only lives in memory.
    pub fn new(identity: Arc<IdentityKey>, config: FerryConfig) -> Self {
        Self {
            identity,
            signed_ratchet_key: None,
            record: Mutex::new(SessionRecord::default()),
            path: None,
            config,
        }
    }

    /// Creates a cipher persisted at `path`, loading the stored session if
    /// one exists.
    pub fn open(
        identity: Arc<IdentityKey>,
        path: impl Into<PathBuf>,
        config: FerryConfig,
    ) -> Result<Self, Error> {
        let path = path.into();
        let record = match read_optional(&path)? {
            Some(bytes) => crate::proto::decode_session_record(&bytes)?,
            None => SessionRecord::default(),
        };

        Ok(Self {
            identity,
            signed_ratchet_key: None,
            record: Mutex::new(record),
            path: Some(path),
            config,
        })
    }

    /// Supplies the signed ratchet key used to answer pre-key material.
    pub fn with_signed_ratchet_key(mut self, key: X25519Secret) -> Self {
        self.signed_ratchet_key = Some(key);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, SessionRecord>, Error> {
        self.record
            .lock()
            .map_err(|_| Error::Crypto("Session lock poisoned".to_string()))
    }

    fn persist(&self, record: &SessionRecord) -> Result<(), Error> {
        if let Some(path) = &self.path {
            let bytes = crate::proto::encode_session_record(record)?;
            write_atomic(path, &bytes)?;
        }
        Ok(())
    }

    pub fn local_identity(&self) -> IdentityPublicKey {
        self.identity.public()
    }

    pub fn has_session(&self) -> Result<bool, Error> {
        Ok(self.lock()?.current.is_some())
    }

    /// Identity of the counterparty of the current session.
    pub fn remote_identity(&self) -> Result<Option<IdentityPublicKey>, Error> {
        Ok(self
            .lock()?
            .current
            .as_ref()
            .map(|state| state.remote_identity))
    }

    /// The initiator's base key while the responder has not answered yet.
    pub fn pending_base_key(&self) -> Result<Option<X25519PublicKey>, Error> {
        Ok(self
            .lock()?
            .current
            .as_ref()
            .and_then(|state| state.pending_base_key))
    }

    /// Base key of the current session: the pending one for an initiator,
    /// the received one for a responder.
    pub fn base_key(&self) -> Result<Option<X25519PublicKey>, Error> {
        Ok(self
            .lock()?
            .current
            .as_ref()
            .and_then(|state| state.pending_base_key.or(state.remote_base_key)))
    }

    /// Starts a new session towards `peer`, archiving any current one.
    pub fn initiate(&self, peer: &PeerBundle) -> Result<(), Error> {
        let mut record = self.lock()?;
        let state = handshake::initiate(&self.identity, peer, &self.config.protocol_info)?;
        record.promote_new(state, self.config.max_previous_states);
        self.persist(&record)?;
        info!("Initiated session");
        Ok(())
    }

    /// Builds the responder side of a session from the initiator's identity
    /// and base key. Known base keys are a no-op.
    pub fn process_pre_key(
        &self,
        their_identity: IdentityPublicKey,
        base_key: X25519PublicKey,
    ) -> Result<(), Error> {
        let mut record = self.lock()?;
        let mut working = record.clone();
        if self.apply_pre_key(&mut working, their_identity, base_key)? {
            *record = working;
            self.persist(&record)?;
        }
        Ok(())
    }

    fn apply_pre_key(
        &self,
        record: &mut SessionRecord,
        their_identity: IdentityPublicKey,
        base_key: X25519PublicKey,
    ) -> Result<bool, Error> {
        if let Some(current) = &record.current {
            if current.remote_identity != their_identity {
                return Err(Error::UntrustedIdentity(
                    "Identity differs from the established session".to_string(),
                ));
            }
        }

        if record
            .candidates()
            .any(|(_, state)| state.remote_base_key == Some(base_key))
        {
            return Ok(false);
        }

        let signed_ratchet_key = self.signed_ratchet_key.as_ref().ok_or_else(|| {
            Error::InvalidMessage("No signed ratchet key to answer pre-key material".to_string())
        })?;

        let state = handshake::respond(
            &self.identity,
            signed_ratchet_key,
            their_identity,
            base_key,
            &self.config.protocol_info,
        )?;
        record.promote_new(state, self.config.max_previous_states);
        info!("Built responder session from new base key");

        Ok(true)
    }

    /// Encrypts `plaintext` with the next sending message key. While the
    /// responder has not answered, the message is wrapped with the pending
    /// handshake material.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<CiphertextMessage, Error> {
        let mut record = self.lock()?;
        let mut state = record.current.clone().ok_or(Error::NoSession)?;

        let (header, keys) = state.sending_keys()?;
        let mut mac =
            EnvelopeMac::new(&keys.mac_key, &state.local_identity, &state.remote_identity)?;
        mac.update(&header.to_bytes());
        let ciphertext = BlockCipher::new(&keys, BLOCK_SIZE).seal_all(plaintext)?;
        mac.update(&ciphertext);

        let counter = header.counter;
        let message = SignalMessage {
            header,
            ciphertext,
            mac: mac.finalize(),
        };
        state.advance_sender_chain()?;

        let message = match state.pending_base_key {
            Some(base_key) => CiphertextMessage::PreKey(PreKeySignalMessage {
                version: state.version,
                base_key,
                identity: state.local_identity,
                message,
            }),
            None => CiphertextMessage::Signal(message),
        };

        record.current = Some(state);
        self.persist(&record)?;
        debug!(counter, "Encrypted message");

        Ok(message)
    }

    /// Decrypts a message, trying the current session state first and then
    /// every archived state. The first state that succeeds becomes current.
    pub fn decrypt(&self, message: &CiphertextMessage) -> Result<Vec<u8>, Error> {
        let mut record = self.lock()?;
        let mut working = record.clone();

        if let CiphertextMessage::PreKey(pre_key) = message {
            self.apply_pre_key(&mut working, pre_key.identity, pre_key.base_key)?;
        }

        let signal = message.signal_message();
        let mut first_error = None;
        let mut decrypted = None;
        for (slot, candidate) in working.candidates() {
            let mut state = candidate.clone();
            match decrypt_with_state(&mut state, signal, &self.config) {
                Ok(plaintext) => {
                    decrypted = Some((slot, state, plaintext));
                    break;
                }
                Err(err @ Error::DuplicateMessage(_)) => return Err(err),
                Err(err) => {
                    debug!(?slot, %err, "Session state could not decrypt message");
                    first_error.get_or_insert(err);
                }
            }
        }

        let (slot, state, plaintext) = match decrypted {
            Some(decrypted) => decrypted,
            None => return Err(first_error.unwrap_or(Error::NoSession)),
        };

        working.commit(slot, state, self.config.max_previous_states);
        *record = working;
        self.persist(&record)?;
        debug!(counter = signal.counter(), "Decrypted message");

        Ok(plaintext)
    }

    /// Streaming variant of [`SessionCipher::encrypt`] writing the bare
    /// envelope `[version][keyLen][ratchetKey][counter][prevCounter][ciphertext][mac]`
    /// in [`BLOCK_SIZE`] blocks. The message key is committed before any
    /// output is written, so a failed write never leads to key reuse.
    pub fn encrypt_stream<R: Read, W: Write>(
        &self,
        mut input: R,
        mut output: W,
    ) -> Result<u64, Error> {
        let mut record = self.lock()?;
        let mut state = record.current.clone().ok_or(Error::NoSession)?;

        let (header, keys) = state.sending_keys()?;
        let header_bytes = header.to_bytes();
        let mut mac =
            EnvelopeMac::new(&keys.mac_key, &state.local_identity, &state.remote_identity)?;
        mac.update(&header_bytes);

        state.advance_sender_chain()?;
        record.current = Some(state);
        self.persist(&record)?;

        output.write_all(&header_bytes)?;
        let body = seal_stream(
            &mut BlockCipher::new(&keys, BLOCK_SIZE),
            &mut mac,
            &mut input,
            &mut output,
        )?;
        output.write_all(&mac.finalize())?;
        output.flush()?;

        debug!(counter = header.counter, body, "Encrypted stream");
        Ok((HEADER_LENGTH + MAC_LENGTH) as u64 + body)
    }

    /// Streaming variant of [`SessionCipher::decrypt`]. The session state is
    /// picked from the header: the first state holding a receiving chain for
    /// the sender's ratchet key, or the current state for a new ratchet key.
    /// The trailing MAC never reaches `output`; the session is only updated
    /// once it has been verified.
    pub fn decrypt_stream<R: Read, W: Write>(
        &self,
        mut input: R,
        mut output: W,
    ) -> Result<u64, Error> {
        let mut record = self.lock()?;
        let header = MessageHeader::read_from(&mut input)?;

        let (slot, mut state) = {
            let (slot, candidate) = record
                .candidates()
                .find(|(_, state)| state.has_receiver_chain(&header.ratchet_key))
                .or_else(|| record.candidates().next())
                .ok_or(Error::NoSession)?;
            (slot, candidate.clone())
        };

        let keys = state.receiving_keys(&header, &self.config)?;
        let mut mac =
            EnvelopeMac::new(&keys.mac_key, &state.remote_identity, &state.local_identity)?;
        mac.update(&header.to_bytes());

        let (written, received_mac) = open_stream(
            &mut BlockCipher::new(&keys, BLOCK_SIZE),
            &mut mac,
            &mut input,
            &mut output,
        )?;
        mac.verify(&received_mac)?;
        output.flush()?;

        state.pending_base_key = None;
        record.commit(slot, state, self.config.max_previous_states);
        self.persist(&record)?;
        debug!(counter = header.counter, written, "Decrypted stream");

        Ok(written)
    }
}

fn decrypt_with_state(
    state: &mut SessionState,
    message: &SignalMessage,
    config: &FerryConfig,
) -> Result<Vec<u8>, Error> {
    let keys = state.receiving_keys(&message.header, config)?;

    let mut mac = EnvelopeMac::new(&keys.mac_key, &state.remote_identity, &state.local_identity)?;
    mac.update(&message.header.to_bytes());
    mac.update(&message.ciphertext);
    mac.verify(&message.mac)?;

    let plaintext = BlockCipher::new(&keys, BLOCK_SIZE).open_all(&message.ciphertext)?;
    state.pending_base_key = None;

    Ok(plaintext)
}
