mod exchange;
pub use exchange::*;
mod queue;
pub use queue::*;

use crate::adu::ApplicationDataManager;
use crate::bundle::{
    AckRecord, Adu, Bundle, BundleId, BundleSecurity, Direction, Payload, PayloadBuilder,
    PayloadCodec, pack_bundle, unpack_bundle,
};
use crate::storage::{read_optional, remove_dir_if_exists, remove_file_if_exists, write_atomic};
use crate::transport::TransportRecordManager;
use crate::{Error, FerryConfig};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

const ADM_DIR: &str = "adm";
const OUTBOX_DIR: &str = "outbox";
const INBOX_DIR: &str = "inbox";
const STAGING_DIR: &str = "staging";
const ACK_RECORD_FILE: &str = "ack_record";
const TRANSPORTS_FILE: &str = "transports.json";
const ARCHIVE_EXTENSION: &str = "bundle";

/// Where an exchange attempt currently is. Every attempt ends back in
/// [`ExchangeState::Idle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    Connecting,
    Exchanging,
    Complete,
    Failed,
}

/// Outcome of one direction of an exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeStatus {
    Failed,
    /// Nothing to move in this direction.
    Empty,
    Complete,
}

impl fmt::Display for ExchangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Failed => "failed",
            Self::Empty => "empty",
            Self::Complete => "complete",
        })
    }
}

/// Upload and download results of one exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BundleExchangeCounts {
    pub upload: ExchangeStatus,
    pub download: ExchangeStatus,
}

impl BundleExchangeCounts {
    pub(crate) const FAILED: Self = Self {
        upload: ExchangeStatus::Failed,
        download: ExchangeStatus::Failed,
    };

    pub fn is_failed(&self) -> bool {
        self.upload == ExchangeStatus::Failed || self.download == ExchangeStatus::Failed
    }
}

/// What happened to a received bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// The bundle was new. `adus` are the ADUs stored from it.
    Accepted { bundle_id: BundleId, adus: Vec<Adu> },
    /// The bundle was not newer than the last accepted one and was ignored.
    Stale { bundle_id: BundleId },
}

/// Generates, receives and exchanges bundles for one side of a
/// client/server relationship.
///
/// Layout under `root`:
/// - `adm/`: the [`ApplicationDataManager`] stores
/// - `outbox/`: the packed bundle currently offered for upload
/// - `inbox/`, `staging/`: scratch space while (un)packing
/// - `ack_record`: id of the newest bundle accepted from the counterparty
/// - `transports.json`: the [`TransportRecordManager`] records
pub struct BundleTransmission {
    root: PathBuf,
    adm: ApplicationDataManager,
    transports: TransportRecordManager,
    codec: PayloadCodec,
    config: FerryConfig,
    state: Mutex<ExchangeState>,
}

impl BundleTransmission {
    pub fn open(root: impl Into<PathBuf>, config: FerryConfig) -> Result<Self, Error> {
        let root = root.into();
        std::fs::create_dir_all(root.join(OUTBOX_DIR))?;

        Ok(Self {
            adm: ApplicationDataManager::open(root.join(ADM_DIR), &config)?,
            transports: TransportRecordManager::open(
                root.join(TRANSPORTS_FILE),
                config.clock_skew_tolerance,
            )?,
            codec: PayloadCodec::new(&config),
            config,
            state: Mutex::new(ExchangeState::Idle),
            root,
        })
    }

    pub fn adm(&self) -> &ApplicationDataManager {
        &self.adm
    }

    pub fn transports(&self) -> &TransportRecordManager {
        &self.transports
    }

    pub fn config(&self) -> &FerryConfig {
        &self.config
    }

    pub fn exchange_state(&self) -> ExchangeState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ExchangeState::Failed)
    }

    pub(crate) fn set_state(&self, next: ExchangeState) {
        match self.state.lock() {
            Ok(mut state) => {
                debug!(from = ?*state, to = ?next, "Exchange state");
                *state = next;
            }
            Err(_) => warn!("Exchange state lock poisoned"),
        }
    }

    /// The acknowledgement we currently owe the counterparty, which is also
    /// the watermark for bundles we receive.
    pub fn ack_record(&self) -> Result<AckRecord, Error> {
        match read_optional(&self.root.join(ACK_RECORD_FILE))? {
            Some(bytes) => {
                let value = String::from_utf8(bytes)
                    .map_err(|_| Error::Serde("Ack record is not UTF-8".to_string()))?;
                AckRecord::parse(&value)
            }
            None => Ok(AckRecord::Heartbeat),
        }
    }

    fn outbox_path(&self, encrypted_id: &str) -> PathBuf {
        self.root
            .join(OUTBOX_DIR)
            .join(format!("{encrypted_id}.{ARCHIVE_EXTENSION}"))
    }

    /// Builds the bundle to upload next.
    ///
    /// When the content matches the last generated bundle that is still
    /// unacknowledged, that bundle is offered again under the same id.
    /// Otherwise a new id is minted and stale outbox bundles are dropped,
    /// unless the new id would fall outside the counterparty's download
    /// window, in which case the last bundle is offered again.
    pub fn generate_bundle_for_transmission(
        &self,
        security: &BundleSecurity,
    ) -> Result<Bundle, Error> {
        let ack_record = self.ack_record()?;
        let adus = self
            .adm
            .fetch_adus_to_send(&ack_record, self.config.bundle_size_limit)?;
        let fresh = PayloadBuilder::new().ack_record(ack_record).adus(adus);

        let last = self.adm.get_last_sent_bundle_builder()?;
        let full = self.window_is_full(security)?;
        let bundle_id = match last {
            Some(last) if last.content_digest() == fresh.content_digest() => {
                return self.retransmit(security, last);
            }
            Some(last) if full => {
                info!("Counterparty download window is full, holding back new content");
                return self.retransmit(security, last);
            }
            None if full => {
                let last_id = security.last_bundle_id()?.ok_or_else(|| {
                    Error::BundleMalformed("Full window without a minted bundle".to_string())
                })?;
                warn!(bundle_id = %last_id, "Last bundle is gone, refilling its id");
                last_id
            }
            _ => {
                debug!("Minting a new bundle id");
                security.next_bundle_id()?
            }
        };

        let payload = fresh.bundle_id(bundle_id).build()?;
        remove_dir_if_exists(&self.root.join(OUTBOX_DIR))?;
        let bundle = self.write_bundle(security, &payload)?;
        self.adm.notify_bundle_sent(&payload)?;

        info!(
            bundle_id = %bundle.id,
            adus = payload.adus().len(),
            ack = %payload.ack_record(),
            "Generated bundle"
        );
        Ok(bundle)
    }

    /// Whether minting another id would put it beyond the ids the counterparty
    /// asks for. Only downstream bundles are fetched through a window.
    fn window_is_full(&self, security: &BundleSecurity) -> Result<bool, Error> {
        let direction = security.role().outgoing();
        if direction != Direction::Downstream {
            return Ok(false);
        }

        let acknowledged = match self.adm.largest_acknowledged()? {
            Some(id) => id.counter(direction)?,
            None => 0,
        };
        let next = security
            .last_bundle_id()?
            .map_or(Ok(0), |id| id.counter(direction))?
            .saturating_add(1);
        Ok(next.saturating_sub(acknowledged) > self.config.window_length)
    }

    fn retransmit(
        &self,
        security: &BundleSecurity,
        last: PayloadBuilder,
    ) -> Result<Bundle, Error> {
        let payload = last.build()?;
        let encrypted_id = security.id_cipher().encrypt(payload.bundle_id())?;
        let path = self.outbox_path(&encrypted_id);
        if path.is_file() {
            info!(bundle_id = %payload.bundle_id(), "Offering unacknowledged bundle again");
            return Ok(Bundle {
                id: payload.bundle_id().clone(),
                encrypted_id,
                path,
            });
        }

        info!(bundle_id = %payload.bundle_id(), "Rebuilding unacknowledged bundle");
        self.write_bundle(security, &payload)
    }

    fn write_bundle(
        &self,
        security: &BundleSecurity,
        payload: &Payload,
    ) -> Result<Bundle, Error> {
        let encrypted_id = security.id_cipher().encrypt(payload.bundle_id())?;
        let staging = self.root.join(STAGING_DIR).join(&encrypted_id);

        self.codec.encrypt(security, payload, &staging)?;
        let archive = pack_bundle(&staging)?;
        remove_dir_if_exists(&staging)?;

        let path = self.outbox_path(&encrypted_id);
        write_atomic(&path, &archive)?;
        Ok(Bundle {
            id: payload.bundle_id().clone(),
            encrypted_id,
            path,
        })
    }

    /// Accepts a packed bundle from the counterparty.
    ///
    /// A bundle whose id is not newer than the last accepted one is reported
    /// as [`ReceiveOutcome::Stale`] without touching the session. Otherwise
    /// its ADUs are stored, its acknowledgement releases our sent ADUs and
    /// its id becomes the new watermark.
    pub fn process_received_bundle(
        &self,
        security: &BundleSecurity,
        archive: &[u8],
    ) -> Result<ReceiveOutcome, Error> {
        let name = URL_SAFE_NO_PAD.encode(Sha256::digest(archive));
        let dir = self.root.join(INBOX_DIR).join(&name);
        let output = self.root.join(INBOX_DIR).join(format!("{name}.payload"));

        remove_dir_if_exists(&dir)?;
        let result = unpack_bundle(archive, &dir)
            .and_then(|()| self.receive_unpacked(security, &dir, &output));
        remove_dir_if_exists(&dir)?;
        remove_file_if_exists(&output)?;
        result
    }

    fn receive_unpacked(
        &self,
        security: &BundleSecurity,
        dir: &Path,
        output: &Path,
    ) -> Result<ReceiveOutcome, Error> {
        let direction = security.role().incoming();
        let bundle_id = self.codec.read_bundle_id(security, dir)?;
        if bundle_id.client_id(direction)? != security.client_id() {
            return Err(Error::BundleMalformed(format!(
                "Bundle {bundle_id} belongs to another client"
            )));
        }

        if let Some(largest) = self.ack_record()?.bundle_id() {
            if bundle_id.compare(largest, direction)? != Ordering::Greater {
                info!(%bundle_id, %largest, "Ignoring bundle that is not newer");
                return Ok(ReceiveOutcome::Stale { bundle_id });
            }
        }

        let payload = self.codec.decrypt(security, dir, output)?;
        let adus = self.adm.store_received_adus(payload.adus())?;
        self.adm
            .process_acknowledgement(payload.ack_record(), security.role().outgoing())?;
        write_atomic(&self.root.join(ACK_RECORD_FILE), bundle_id.as_str().as_bytes())?;

        info!(%bundle_id, stored = adus.len(), "Accepted bundle");
        Ok(ReceiveOutcome::Accepted { bundle_id, adus })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Role;
    use crate::{IdentityKey, PeerBundle, X25519Secret};
    use std::sync::Arc;
    use tempfile::TempDir;

    pub(crate) struct Parties {
        pub(crate) _dir: TempDir,
        pub(crate) client: BundleSecurity,
        pub(crate) client_tx: BundleTransmission,
        pub(crate) server: BundleSecurity,
        pub(crate) server_tx: BundleTransmission,
        pub(crate) server_identity: Arc<IdentityKey>,
    }

    pub(crate) fn parties() -> Parties {
        let dir = TempDir::new().unwrap();
        let config = FerryConfig {
            chunk_size: 64,
            ..FerryConfig::default()
        };

        let server_identity = Arc::new(IdentityKey::new().unwrap());
        let signed_ratchet_key = X25519Secret::generate().unwrap();
        let published = PeerBundle::new(&server_identity, signed_ratchet_key.public_key());

        let client_identity = Arc::new(IdentityKey::new().unwrap());
        let client = BundleSecurity::client(
            &dir.path().join("client/security"),
            client_identity.clone(),
            &published,
            &config,
        )
        .unwrap();
        let server = BundleSecurity::server(
            &dir.path().join("server/security"),
            server_identity.clone(),
            signed_ratchet_key,
            client_identity.public(),
            &config,
        )
        .unwrap();

        Parties {
            client_tx: BundleTransmission::open(dir.path().join("client"), config.clone())
                .unwrap(),
            server_tx: BundleTransmission::open(dir.path().join("server"), config).unwrap(),
            client,
            server,
            server_identity,
            _dir: dir,
        }
    }

    #[test]
    fn test_unacknowledged_bundle_keeps_its_id() {
        let p = parties();
        p.client_tx.adm().add_adu("x", None, b"one").unwrap();

        let first = p.client_tx.generate_bundle_for_transmission(&p.client).unwrap();
        let again = p.client_tx.generate_bundle_for_transmission(&p.client).unwrap();
        assert_eq!(first, again);

        p.client_tx.adm().add_adu("x", None, b"two").unwrap();
        let grown = p.client_tx.generate_bundle_for_transmission(&p.client).unwrap();
        assert_ne!(grown.id, first.id);
        assert!(!first.path.exists());
        assert!(grown.path.is_file());
    }

    #[test]
    fn test_server_stays_inside_client_download_window() {
        let p = parties();
        p.client_tx.adm().add_adu("x", None, b"hello").unwrap();
        let upstream = p.client_tx.generate_bundle_for_transmission(&p.client).unwrap();
        let archive = std::fs::read(&upstream.path).unwrap();
        p.server_tx.process_received_bundle(&p.server, &archive).unwrap();

        let window_length = p.server_tx.config().window_length;
        let mut offered = Vec::new();
        for round in 0..window_length + 3 {
            let data = format!("reply {round}");
            p.server_tx.adm().add_adu("x", None, data.as_bytes()).unwrap();
            offered.push(p.server_tx.generate_bundle_for_transmission(&p.server).unwrap());
        }

        let largest = p.client_tx.ack_record().unwrap();
        let window = p
            .client
            .download_window(largest.bundle_id(), window_length)
            .unwrap();
        let last = offered.last().unwrap();
        assert!(window.contains(&last.encrypted_id));
        assert_eq!(last.id.counter(Direction::Downstream).unwrap(), window_length);
        assert!(last.path.is_file());

        // Once the client takes that bundle and acknowledges it, ids advance again.
        let archive = std::fs::read(&last.path).unwrap();
        let outcome = p.client_tx.process_received_bundle(&p.client, &archive).unwrap();
        assert!(matches!(outcome, ReceiveOutcome::Accepted { .. }));
        let reply = p.client_tx.generate_bundle_for_transmission(&p.client).unwrap();
        let archive = std::fs::read(&reply.path).unwrap();
        p.server_tx.process_received_bundle(&p.server, &archive).unwrap();
        assert_eq!(p.server_tx.adm().largest_acknowledged().unwrap(), Some(last.id.clone()));

        p.server_tx.adm().add_adu("x", None, b"after").unwrap();
        let next = p.server_tx.generate_bundle_for_transmission(&p.server).unwrap();
        assert_eq!(next.id.counter(Direction::Downstream).unwrap(), window_length + 1);
    }

    #[test]
    fn test_missing_outbox_archive_is_rebuilt_under_same_id() {
        let p = parties();
        p.client_tx.adm().add_adu("x", None, b"one").unwrap();

        let first = p.client_tx.generate_bundle_for_transmission(&p.client).unwrap();
        std::fs::remove_file(&first.path).unwrap();
        let rebuilt = p.client_tx.generate_bundle_for_transmission(&p.client).unwrap();
        assert_eq!(rebuilt.id, first.id);
        assert!(rebuilt.path.is_file());

        let archive = std::fs::read(&rebuilt.path).unwrap();
        let outcome = p.server_tx.process_received_bundle(&p.server, &archive).unwrap();
        assert!(matches!(outcome, ReceiveOutcome::Accepted { .. }));
    }

    #[test]
    fn test_round_trip_acknowledges_and_deduplicates() {
        let p = parties();
        p.client_tx.adm().add_adu("x", None, b"hello").unwrap();

        let upstream = p.client_tx.generate_bundle_for_transmission(&p.client).unwrap();
        let archive = std::fs::read(&upstream.path).unwrap();

        let outcome = p.server_tx.process_received_bundle(&p.server, &archive).unwrap();
        assert_eq!(
            outcome,
            ReceiveOutcome::Accepted {
                bundle_id: upstream.id.clone(),
                adus: vec![Adu::new("x", 1, b"hello".to_vec())],
            }
        );
        assert_eq!(
            p.server_tx.ack_record().unwrap(),
            AckRecord::Bundle(upstream.id.clone())
        );

        let replay = p.server_tx.process_received_bundle(&p.server, &archive).unwrap();
        assert_eq!(
            replay,
            ReceiveOutcome::Stale {
                bundle_id: upstream.id.clone()
            }
        );
        assert_eq!(p.server_tx.adm().received_adus("x").unwrap().len(), 1);

        let downstream = p.server_tx.generate_bundle_for_transmission(&p.server).unwrap();
        let reply = std::fs::read(&downstream.path).unwrap();
        p.client_tx.process_received_bundle(&p.client, &reply).unwrap();

        let adm = p.client_tx.adm();
        assert!(adm.fetch_adus_to_send(&AckRecord::Heartbeat, 1000).unwrap().is_empty());
        assert_eq!(p.client.role(), Role::Client);
    }

    #[test]
    fn test_garbage_archive_is_rejected() {
        let p = parties();
        assert!(p.server_tx.process_received_bundle(&p.server, b"not a bundle").is_err());
        assert_eq!(p.server_tx.ack_record().unwrap(), AckRecord::Heartbeat);
    }
}
