mod device;
pub use device::*;
mod recency;
pub use recency::*;

use crate::proto::RecencyBlobResponseProto;
use crate::storage::{now_millis, read_json, write_json};
use crate::{Error, IdentityPublicKey};
use prost::Message;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What we know about one transport. Times are milliseconds since the Unix
/// epoch; zero means never.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportRecord {
    pub device: TransportDevice,
    pub description: String,
    pub last_exchange: i64,
    pub last_seen: i64,
    /// Newest validated recency timestamp.
    pub recency_time: i64,
    /// Newest recency response the transport advertised during discovery
    /// that passed validation.
    #[serde(default, with = "blob_base64")]
    pub recency_blob: Option<Vec<u8>>,
}

impl TransportRecord {
    pub fn new(device: TransportDevice) -> Self {
        Self {
            description: device.description(),
            device,
            last_exchange: 0,
            last_seen: 0,
            recency_time: 0,
            recency_blob: None,
        }
    }

    /// The stored recency response, `None` if absent or unreadable.
    pub fn recency_response(&self) -> Option<RecencyBlobResponseProto> {
        let bytes = self.recency_blob.as_deref()?;
        RecencyBlobResponseProto::decode(bytes).ok()
    }
}

mod blob_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&URL_SAFE_NO_PAD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|encoded| {
                URL_SAFE_NO_PAD
                    .decode(encoded)
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}

/// True when the transport advertised data newer than our last exchange
/// with it.
pub fn does_transport_have_new_data(record: &TransportRecord) -> bool {
    record.recency_time > record.last_exchange
}

/// Tracks the transports seen recently and how fresh their data is.
pub struct TransportRecordManager {
    records: Mutex<HashMap<String, TransportRecord>>,
    path: Option<PathBuf>,
    clock_skew_tolerance: Duration,
}

impl TransportRecordManager {
    /// An in-memory manager.
    pub fn new(clock_skew_tolerance: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            path: None,
            clock_skew_tolerance,
        }
    }

    /// A manager persisted to the JSON file at `path`.
    pub fn open(
        path: impl Into<PathBuf>,
        clock_skew_tolerance: Duration,
    ) -> Result<Self, Error> {
        let path = path.into();
        let stored: BTreeMap<String, TransportRecord> = read_json(&path)?.unwrap_or_default();
        debug!(records = stored.len(), "Loaded transport records");

        Ok(Self {
            records: Mutex::new(stored.into_iter().collect()),
            path: Some(path),
            clock_skew_tolerance,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, TransportRecord>>, Error> {
        self.records
            .lock()
            .map_err(|_| Error::Io("Transport record lock poisoned".to_string()))
    }

    fn persist(&self, records: &HashMap<String, TransportRecord>) -> Result<(), Error> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let ordered: BTreeMap<&String, &TransportRecord> = records.iter().collect();
        write_json(path, &ordered)
    }

    /// Records that `device` is visible right now. An advertised recency
    /// response is kept only if it validates against `expected` and is newer
    /// than what the record holds; a rejected one leaves the recency alone.
    pub fn process_discovered_peer(
        &self,
        device: &TransportDevice,
        response: Option<&RecencyBlobResponseProto>,
        expected: &IdentityPublicKey,
    ) -> Result<(), Error> {
        let now = now_millis();
        let validated = response.and_then(|response| {
            validate_recency_blob(response, expected, now, self.clock_skew_tolerance)
                .inspect_err(|err| warn!(device = device.id(), %err, "Ignoring advertised recency"))
                .ok()
                .map(|blob| (blob.blob_timestamp, response.encode_to_vec()))
        });

        let mut records = self.lock()?;
        let record = records
            .entry(device.id().to_string())
            .or_insert_with(|| TransportRecord::new(device.clone()));
        record.device = device.clone();
        record.description = device.description();
        record.last_seen = now;

        if let Some((timestamp, encoded)) = validated {
            if timestamp > record.recency_time {
                record.recency_time = timestamp;
                record.recency_blob = Some(encoded);
            }
        }

        self.persist(&records)
    }

    /// Forgets every transport last seen before `cutoff`. Returns how many
    /// records were removed.
    pub fn expire_not_seen_peers(&self, cutoff: i64) -> Result<usize, Error> {
        let mut records = self.lock()?;
        let before = records.len();
        records.retain(|_, record| record.last_seen >= cutoff);
        let expired = before - records.len();
        if expired > 0 {
            info!(expired, "Expired transports not seen recently");
            self.persist(&records)?;
        }
        Ok(expired)
    }

    /// Marks a completed exchange with `device`. The server endpoint is
    /// never tracked.
    pub fn timestamp_exchange_with_transport(
        &self,
        device: &TransportDevice,
    ) -> Result<(), Error> {
        if device.is_server() {
            return Ok(());
        }

        let mut records = self.lock()?;
        let now = now_millis();
        let record = records
            .entry(device.id().to_string())
            .or_insert_with(|| TransportRecord::new(device.clone()));
        record.last_exchange = now;
        record.last_seen = now;
        self.persist(&records)
    }

    /// Validates a recency response from `device` against `expected` and
    /// records its timestamp. Returns whether it was newer than anything
    /// seen from the device before. A rejected blob leaves the record alone.
    pub fn process_recency_blob(
        &self,
        device: &TransportDevice,
        response: &RecencyBlobResponseProto,
        expected: &IdentityPublicKey,
    ) -> Result<bool, Error> {
        let now = now_millis();
        let blob = validate_recency_blob(response, expected, now, self.clock_skew_tolerance)
            .inspect_err(|err| warn!(device = device.id(), %err, "Rejected recency blob"))?;

        let mut records = self.lock()?;
        let record = records
            .entry(device.id().to_string())
            .or_insert_with(|| TransportRecord::new(device.clone()));
        if blob.blob_timestamp <= record.recency_time {
            return Ok(false);
        }
        record.recency_time = blob.blob_timestamp;
        self.persist(&records)?;

        debug!(device = device.id(), recency = blob.blob_timestamp, "Recorded recency blob");
        Ok(true)
    }

    /// Snapshot of every tracked transport.
    pub fn recent_transports(&self) -> Result<Vec<TransportRecord>, Error> {
        let mut records: Vec<TransportRecord> = self.lock()?.values().cloned().collect();
        records.sort_by(|a, b| a.device.id().cmp(b.device.id()));
        Ok(records)
    }

    pub fn record(&self, id: &str) -> Result<Option<TransportRecord>, Error> {
        Ok(self.lock()?.get(id).cloned())
    }

    /// Transports advertising data we have not exchanged yet, freshest first.
    pub fn transports_with_new_data(&self) -> Result<Vec<TransportRecord>, Error> {
        let mut records: Vec<TransportRecord> = self
            .recent_transports()?
            .into_iter()
            .filter(does_transport_have_new_data)
            .collect();
        records.sort_by_key(|record| std::cmp::Reverse(record.recency_time));
        Ok(records)
    }
}
