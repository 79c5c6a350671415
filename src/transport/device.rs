use serde::{Deserialize, Serialize};

/// Id of the fixed server pseudo-device.
pub const SERVER_DEVICE_ID: &str = "server";

/// A counterparty we can exchange bundles with.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportDevice {
    /// A transport seen over a peer-to-peer link.
    WirelessPeer { address: String, name: String },
    /// The bundle server reached directly.
    ServerEndpoint,
    /// A stand-in used by tests and simulations.
    TestDevice { id: String },
}

impl TransportDevice {
    pub fn id(&self) -> &str {
        match self {
            Self::WirelessPeer { address, .. } => address,
            Self::ServerEndpoint => SERVER_DEVICE_ID,
            Self::TestDevice { id } => id,
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::WirelessPeer { address, name } if name.is_empty() => address.clone(),
            Self::WirelessPeer { address, name } => format!("{name} ({address})"),
            Self::ServerEndpoint => "Bundle server".to_string(),
            Self::TestDevice { id } => format!("Test device {id}"),
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self, Self::ServerEndpoint)
    }
}
