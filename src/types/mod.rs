mod x25519;
pub use x25519::*;
