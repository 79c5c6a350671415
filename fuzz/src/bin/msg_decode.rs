#[macro_use]
extern crate afl;
use ferry::CiphertextMessage;

fn main() {
    fuzz!(|data: &[u8]| {
        if let Ok(message) = CiphertextMessage::from_bytes(data) {
            let _ = message.to_bytes();
        }
    });
}
