#[macro_use]
extern crate afl;
use ferry::{CiphertextMessage, FerryConfig, IdentityKey, PeerBundle, SessionCipher, X25519Secret};
use std::sync::Arc;

// The receiving side of an established session. Garbage must never
// advance its ratchet.
fn get_cipher() -> SessionCipher {
    let sender = Arc::new(IdentityKey::new().expect("Setup failed"));
    let receiver = Arc::new(IdentityKey::new().expect("Setup failed"));
    let ratchet = X25519Secret::generate().expect("Setup failed");
    let bundle = PeerBundle::new(&receiver, ratchet.public_key());

    let outbound = SessionCipher::new(sender, FerryConfig::default());
    outbound.initiate(&bundle).expect("Setup failed");
    let inbound =
        SessionCipher::new(receiver, FerryConfig::default()).with_signed_ratchet_key(ratchet);

    let first = outbound.encrypt(b"hello").expect("Setup failed");
    inbound.decrypt(&first).expect("Setup failed");
    inbound
}

fn main() {
    let cipher = get_cipher();

    fuzz!(|data: &[u8]| {
        if let Ok(message) = CiphertextMessage::from_bytes(data) {
            let _ = cipher.decrypt(&message);
        }
    });
}
