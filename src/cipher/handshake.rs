use crate::cipher::chain::{ChainKey, kdf_root};
use crate::cipher::message::CURRENT_VERSION;
use crate::cipher::state::{ReceiverChain, SenderChain, SessionState};
use crate::{Error, IdentityKey, IdentityPublicKey, PeerBundle, X25519PublicKey, X25519Secret};
use hkdf::Hkdf;
use sha2::Sha256;
use std::collections::HashMap;
use x25519_dalek::SharedSecret;
use zeroize::Zeroize;

const SALT: &[u8] = b"Ferry-Bundle-NaCl";

/// Root key and first chain key agreed by both sides of the handshake.
fn derive_initial_keys(
    mut agreements: [SharedSecret; 3],
    info: &[u8],
) -> Result<(Box<[u8; 32]>, ChainKey), Error> {
    let mut ikm = [0u8; 32 * 4];
    ikm[0..32].fill(0xFF);
    for (slot, agreement) in ikm[32..].chunks_mut(32).zip(agreements.iter()) {
        slot.copy_from_slice(agreement.as_bytes());
    }

    let hkdf = Hkdf::<Sha256>::new(Some(SALT), &ikm);
    let mut root_key = Box::new([0u8; 32]);
    let mut chain_key = Box::new([0u8; 32]);
    let mut okm = [0u8; 64];
    hkdf.expand(info, &mut okm)
        .map_err(|_| Error::Crypto("HKDF expansion failed for session keys".to_string()))?;
    root_key.copy_from_slice(&okm[0..32]);
    chain_key.copy_from_slice(&okm[32..64]);

    okm.zeroize();
    ikm.zeroize();
    for agreement in agreements.iter_mut() {
        agreement.zeroize();
    }

    Ok((root_key, ChainKey::new(chain_key, 0)))
}

/// Builds the initiator's state from the responder's published bundle. The
/// fresh base key stays pending on the state until the responder answers.
pub(crate) fn initiate(
    local: &IdentityKey,
    peer: &PeerBundle,
    info: &[u8],
) -> Result<SessionState, Error> {
    peer.verify()?;

    let base_key = X25519Secret::generate()?;
    let their_ratchet_key = peer.ratchet_key();
    let their_identity = peer.identity().dh_key();

    let (root_key, chain_key) = derive_initial_keys(
        [
            local.dh(&their_ratchet_key),
            base_key.dh(&their_identity),
            base_key.dh(&their_ratchet_key),
        ],
        info,
    )?;

    let sending_ratchet_key = X25519Secret::generate()?;
    let (root_key, sending_chain_key) =
        kdf_root(&root_key, sending_ratchet_key.dh(&their_ratchet_key))?;

    Ok(SessionState {
        version: CURRENT_VERSION,
        local_identity: local.public(),
        remote_identity: peer.identity(),
        root_key,
        sender_chain: Some(SenderChain {
            ratchet_key: sending_ratchet_key,
            chain_key: sending_chain_key,
        }),
        receiver_chains: vec![ReceiverChain {
            ratchet_key: their_ratchet_key,
            chain_key,
        }],
        previous_counter: 0,
        pending_base_key: Some(base_key.public_key()),
        remote_base_key: None,
        skipped_message_keys: HashMap::new(),
    })
}

/// Builds the responder's state from the initiator's identity and base key.
pub(crate) fn respond(
    local: &IdentityKey,
    signed_ratchet_key: &X25519Secret,
    their_identity: IdentityPublicKey,
    their_base_key: X25519PublicKey,
    info: &[u8],
) -> Result<SessionState, Error> {
    let (root_key, chain_key) = derive_initial_keys(
        [
            signed_ratchet_key.dh(&their_identity.dh_key()),
            local.dh(&their_base_key),
            signed_ratchet_key.dh(&their_base_key),
        ],
        info,
    )?;

    Ok(SessionState {
        version: CURRENT_VERSION,
        local_identity: local.public(),
        remote_identity: their_identity,
        root_key,
        sender_chain: Some(SenderChain {
            ratchet_key: signed_ratchet_key.clone(),
            chain_key,
        }),
        receiver_chains: Vec::new(),
        previous_counter: 0,
        pending_base_key: None,
        remote_base_key: Some(their_base_key),
        skipped_message_keys: HashMap::new(),
    })
}
