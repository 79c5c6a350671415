use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables shared by the cipher, the bundle codec, the stores and the exchange.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    /// Maximum forward skip within one receiving chain.
    pub max_skipped_messages: u32,
    /// Maximum number of cached skipped message keys per session state.
    pub max_message_keys: usize,
    /// Maximum number of receiving chains kept per session state.
    pub max_receiver_chains: usize,
    /// Maximum number of archived session states.
    pub max_previous_states: usize,
    /// Plaintext chunk size used by the payload codec.
    pub chunk_size: usize,
    /// Upper bound for the encoded payload of one bundle.
    pub bundle_size_limit: u64,
    /// Upper bound for the ADU bytes carried in one bundle.
    pub adu_size_limit: u64,
    /// Number of downstream bundle ids requested per download.
    pub window_length: u64,
    #[serde(with = "millis")]
    pub clock_skew_tolerance: Duration,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    #[serde(with = "millis")]
    pub discovery_timeout: Duration,
    /// Bound for a single bundle upload or download.
    #[serde(with = "millis")]
    pub transfer_timeout: Duration,
    pub server_ping_retries: u32,
    #[serde(with = "millis")]
    pub server_ping_interval: Duration,
    /// Application specific info mixed into every key derivation.
    pub protocol_info: Vec<u8>,
}

impl Default for FerryConfig {
    fn default() -> Self {
        Self {
            max_skipped_messages: 2000,
            max_message_keys: 2000,
            max_receiver_chains: 5,
            max_previous_states: 40,
            chunk_size: 1024 * 1024,
            bundle_size_limit: 100 * 1024 * 1024,
            adu_size_limit: 100 * 1024 * 1024,
            window_length: 10,
            clock_skew_tolerance: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(5),
            transfer_timeout: Duration::from_secs(60),
            server_ping_retries: 8,
            server_ping_interval: Duration::from_millis(500),
            protocol_info: b"Ferry-DTN-Bundle".to_vec(),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
