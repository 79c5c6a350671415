mod types;
pub use types::*;

mod identity_key;
pub use identity_key::*;

mod cipher;
pub use cipher::*;

mod error;
pub use error::Error;

mod config;
pub use config::FerryConfig;

mod storage;

pub mod proto;

pub mod bundle;

pub mod adu;

pub mod transport;

pub mod transmission;
