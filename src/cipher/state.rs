use crate::cipher::chain::{ChainKey, MessageKeys, kdf_root};
use crate::cipher::message::MessageHeader;
use crate::{Error, FerryConfig, IdentityPublicKey, X25519PublicKey, X25519Secret};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct SenderChain {
    pub(crate) ratchet_key: X25519Secret,
    pub(crate) chain_key: ChainKey,
}

#[derive(Clone)]
pub(crate) struct ReceiverChain {
    pub(crate) ratchet_key: X25519PublicKey,
    pub(crate) chain_key: ChainKey,
}

/// Ratchet state for one counterparty.
#[derive(Clone)]
pub(crate) struct SessionState {
    pub(crate) version: u8,
    pub(crate) local_identity: IdentityPublicKey,
    pub(crate) remote_identity: IdentityPublicKey,
    pub(crate) root_key: Box<[u8; 32]>,
    pub(crate) sender_chain: Option<SenderChain>,
    // Most recent first
    pub(crate) receiver_chains: Vec<ReceiverChain>,
    pub(crate) previous_counter: u32,
    // Initiator's base key until the responder has answered
    pub(crate) pending_base_key: Option<X25519PublicKey>,
    // Base key the responder built this state from
    pub(crate) remote_base_key: Option<X25519PublicKey>,
    // Map<(their ratchet key, counter): message keys>
    pub(crate) skipped_message_keys: HashMap<(X25519PublicKey, u32), MessageKeys>,
}

impl Zeroize for SessionState {
    fn zeroize(&mut self) {
        self.root_key.zeroize();
        if let Some(chain) = self.sender_chain.as_mut() {
            chain.zeroize();
        }
        for chain in self.receiver_chains.iter_mut() {
            chain.chain_key.zeroize();
        }
        for (_, mut keys) in self.skipped_message_keys.drain() {
            keys.zeroize();
        }
    }
}

impl ZeroizeOnDrop for SessionState {}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl SessionState {
    fn receiver_chain(&self, ratchet_key: &X25519PublicKey) -> Option<&ReceiverChain> {
        self.receiver_chains
            .iter()
            .find(|chain| &chain.ratchet_key == ratchet_key)
    }

    pub(crate) fn has_receiver_chain(&self, ratchet_key: &X25519PublicKey) -> bool {
        self.receiver_chain(ratchet_key).is_some()
    }

    fn add_receiver_chain(&mut self, chain: ReceiverChain, max_chains: usize) {
        self.receiver_chains.insert(0, chain);
        if self.receiver_chains.len() > max_chains {
            self.receiver_chains.truncate(max_chains);
            debug!("Dropped oldest receiving chain");
        }
    }

    fn set_receiver_chain_key(&mut self, ratchet_key: &X25519PublicKey, chain_key: ChainKey) {
        if let Some(chain) = self
            .receiver_chains
            .iter_mut()
            .find(|chain| &chain.ratchet_key == ratchet_key)
        {
            chain.chain_key = chain_key;
        }
    }

    fn cache_skipped_keys(&mut self, ratchet_key: X25519PublicKey, keys: MessageKeys, max: usize) {
        self.skipped_message_keys
            .insert((ratchet_key, keys.counter), keys);

        while self.skipped_message_keys.len() > max {
            let oldest = self
                .skipped_message_keys
                .keys()
                .min_by_key(|(_, counter)| *counter)
                .copied();
            match oldest {
                Some(key) => {
                    self.skipped_message_keys.remove(&key);
                }
                None => break,
            }
        }
    }

    /// The sending ratchet key and the message keys for the next outgoing
    /// message, without advancing the chain.
    pub(crate) fn sending_keys(&self) -> Result<(MessageHeader, MessageKeys), Error> {
        let sender = self.sender_chain.as_ref().ok_or(Error::NoSession)?;
        let keys = sender.chain_key.message_keys()?;
        let header = MessageHeader {
            version: self.version,
            ratchet_key: sender.ratchet_key.public_key(),
            counter: sender.chain_key.index,
            previous_counter: self.previous_counter,
        };
        Ok((header, keys))
    }

    pub(crate) fn advance_sender_chain(&mut self) -> Result<(), Error> {
        let sender = self.sender_chain.as_mut().ok_or(Error::NoSession)?;
        sender.chain_key = sender.chain_key.next()?;
        Ok(())
    }

    /// Chain key for `their_ratchet_key`, performing a Diffie-Hellman ratchet
    /// step when the key has not been seen yet.
    fn receiver_chain_key(
        &mut self,
        their_ratchet_key: &X25519PublicKey,
        config: &FerryConfig,
    ) -> Result<ChainKey, Error> {
        if let Some(chain) = self.receiver_chain(their_ratchet_key) {
            return Ok(chain.chain_key.clone());
        }

        let sender = self
            .sender_chain
            .as_ref()
            .ok_or_else(|| Error::InvalidMessage("Uninitialized session".to_string()))?;

        let (root_key, receiver_chain_key) =
            kdf_root(&self.root_key, sender.ratchet_key.dh(their_ratchet_key))?;

        let our_new_ratchet_key = X25519Secret::generate()?;
        let (root_key, sender_chain_key) =
            kdf_root(&root_key, our_new_ratchet_key.dh(their_ratchet_key))?;

        self.previous_counter = sender.chain_key.index.saturating_sub(1);
        self.root_key = root_key;
        self.add_receiver_chain(
            ReceiverChain {
                ratchet_key: *their_ratchet_key,
                chain_key: receiver_chain_key.clone(),
            },
            config.max_receiver_chains,
        );
        self.sender_chain = Some(SenderChain {
            ratchet_key: our_new_ratchet_key,
            chain_key: sender_chain_key,
        });

        debug!(
            previous_counter = self.previous_counter,
            "Performed Diffie-Hellman ratchet step"
        );

        Ok(receiver_chain_key)
    }

    /// Message keys for an incoming header: consumes a cached skipped key,
    /// or walks the receiving chain forward, caching every key passed over.
    pub(crate) fn receiving_keys(
        &mut self,
        header: &MessageHeader,
        config: &FerryConfig,
    ) -> Result<MessageKeys, Error> {
        if self.sender_chain.is_none() {
            return Err(Error::InvalidMessage("Uninitialized session".to_string()));
        }
        if header.version != self.version {
            return Err(Error::InvalidMessage(format!(
                "Message version {} does not match session version {}",
                header.version, self.version
            )));
        }

        let mut chain_key = self.receiver_chain_key(&header.ratchet_key, config)?;
        let counter = header.counter;

        if chain_key.index > counter {
            return self
                .skipped_message_keys
                .remove(&(header.ratchet_key, counter))
                .ok_or_else(|| {
                    Error::DuplicateMessage(format!(
                        "Received message with old counter: {}, {}",
                        chain_key.index, counter
                    ))
                });
        }

        if counter - chain_key.index > config.max_skipped_messages {
            warn!(
                counter,
                index = chain_key.index,
                "Rejected message too far into the future"
            );
            return Err(Error::InvalidMessage(format!(
                "Over {} messages into the future",
                config.max_skipped_messages
            )));
        }

        while chain_key.index < counter {
            let keys = chain_key.message_keys()?;
            self.cache_skipped_keys(header.ratchet_key, keys, config.max_message_keys);
            chain_key = chain_key.next()?;
        }

        let keys = chain_key.message_keys()?;
        self.set_receiver_chain_key(&header.ratchet_key, chain_key.next()?);

        Ok(keys)
    }
}

/// The current session state plus archived ones, most recent first.
#[derive(Clone, Default)]
pub(crate) struct SessionRecord {
    pub(crate) current: Option<SessionState>,
    pub(crate) previous: VecDeque<SessionState>,
}

impl SessionRecord {
    /// Archives the current state (if any) and installs `state`.
    pub(crate) fn promote_new(&mut self, state: SessionState, max_previous: usize) {
        if let Some(current) = self.current.take() {
            self.previous.push_front(current);
            self.previous.truncate(max_previous);
        }
        self.current = Some(state);
    }

    /// Makes archived state `index` current again, replacing it with the
    /// updated copy that just decrypted successfully.
    pub(crate) fn promote_previous(
        &mut self,
        index: usize,
        state: SessionState,
        max_previous: usize,
    ) {
        self.previous.remove(index);
        self.promote_new(state, max_previous);
    }

    /// The current state followed by archived states, in trial order.
    pub(crate) fn candidates(&self) -> impl Iterator<Item = (Option<usize>, &SessionState)> {
        self.current
            .iter()
            .map(|state| (None, state))
            .chain(self.previous.iter().enumerate().map(|(i, s)| (Some(i), s)))
    }

    pub(crate) fn commit(&mut self, slot: Option<usize>, state: SessionState, max_previous: usize) {
        match slot {
            None => self.current = Some(state),
            Some(index) => self.promote_previous(index, state, max_previous),
        }
    }
}
