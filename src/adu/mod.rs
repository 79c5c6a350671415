mod store;
pub use store::AduMetadata;
use store::{AduStore, StoreKind};

use crate::bundle::{AckRecord, Adu, BundleId, Direction, Payload, PayloadBuilder};
use crate::storage::{read_json, remove_file_if_exists, write_json};
use crate::{Error, FerryConfig};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;
use tracing::{debug, info, warn};

const SEND_DIR: &str = "send";
const RECEIVE_DIR: &str = "receive";
const APP_IDS_FILE: &str = "app_ids.json";
const SENT_BUNDLE_DETAILS_FILE: &str = "sent_bundle_details.json";
const LAST_SENT_BUNDLE_FILE: &str = "last_sent_bundle.json";
const LAST_ACKNOWLEDGED_FILE: &str = "last_acknowledged_bundle.json";

/// Highest ADU id per app carried in each sent bundle.
type SentBundleDetails = BTreeMap<String, BTreeMap<String, u64>>;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
struct AduRef {
    app_id: String,
    id: u64,
}

/// Structure of the most recently generated bundle, enough to rebuild it
/// from the send store.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
struct LastSentBundle {
    bundle_id: BundleId,
    ack_record: String,
    adus: Vec<AduRef>,
    digest: String,
}

/// Running byte budget for one bundle.
struct SizeLimiter {
    remaining: u64,
}

impl SizeLimiter {
    fn new(limit: u64) -> Self {
        Self { remaining: limit }
    }

    /// Reserves `size` bytes, refusing once the budget would be exceeded.
    fn admit(&mut self, size: u64) -> bool {
        match self.remaining.checked_sub(size) {
            Some(remaining) => {
                self.remaining = remaining;
                true
            }
            None => false,
        }
    }
}

/// Persistent store of application data units on one side of a client/server
/// relationship.
///
/// Outbound ADUs stay on disk until the counterparty acknowledges a bundle
/// that carried them. Inbound ADUs are deduplicated by id per app and kept
/// until the consuming application marks them processed.
pub struct ApplicationDataManager {
    root: PathBuf,
    send: AduStore,
    receive: AduStore,
    adu_size_limit: u64,
    /// Serializes updates of the sent bundle bookkeeping.
    bookkeeping: Mutex<()>,
}

impl ApplicationDataManager {
    pub fn open(root: impl Into<PathBuf>, config: &FerryConfig) -> Result<Self, Error> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        Ok(Self {
            send: AduStore::open(root.join(SEND_DIR), StoreKind::Sending)?,
            receive: AduStore::open(root.join(RECEIVE_DIR), StoreKind::Receiving)?,
            adu_size_limit: config.adu_size_limit,
            bookkeeping: Mutex::new(()),
            root,
        })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, Error> {
        self.bookkeeping
            .lock()
            .map_err(|_| Error::Io("ADU bookkeeping lock poisoned".to_string()))
    }

    pub fn registered_app_ids(&self) -> Result<Vec<String>, Error> {
        let apps: Option<BTreeSet<String>> = read_json(&self.path(APP_IDS_FILE))?;
        Ok(apps.unwrap_or_default().into_iter().collect())
    }

    pub fn register_app_id(&self, app_id: &str) -> Result<(), Error> {
        let _guard = self.lock()?;
        let path = self.path(APP_IDS_FILE);
        let mut apps: BTreeSet<String> = read_json(&path)?.unwrap_or_default();
        if apps.insert(app_id.to_string()) {
            write_json(&path, &apps)?;
            info!(app_id, "Registered app");
        }
        Ok(())
    }

    /// Queues outbound data for `app_id`, registering the app on first use.
    /// Without an explicit id the next id is assigned; an explicit id must be
    /// larger than every id added before.
    pub fn add_adu(&self, app_id: &str, id: Option<u64>, data: &[u8]) -> Result<u64, Error> {
        self.register_app_id(app_id)?;
        let id = self.send.add(app_id, data, id)?.ok_or_else(|| {
            Error::InvalidMessage(format!("ADU id for {app_id} is not increasing"))
        })?;
        debug!(app_id, id, size = data.len(), "Queued ADU");
        Ok(id)
    }

    /// Watermarks of the outbound store for `app_id`.
    pub fn send_metadata(&self, app_id: &str) -> Result<AduMetadata, Error> {
        self.send.metadata(app_id)
    }

    /// Watermarks of the inbound store for `app_id`.
    pub fn receive_metadata(&self, app_id: &str) -> Result<AduMetadata, Error> {
        self.receive.metadata(app_id)
    }

    /// Unacknowledged ADUs in app and id order, as many as fit in `limit`
    /// once the ack record is accounted for. An ADU that does not fit ends
    /// the selection, so no app ever skips ahead of its own gap.
    pub fn fetch_adus_to_send(
        &self,
        ack_record: &AckRecord,
        limit: u64,
    ) -> Result<Vec<Adu>, Error> {
        let mut limiter = SizeLimiter::new(limit.min(self.adu_size_limit));
        if !limiter.admit(ack_record.encoded_len()) {
            return Ok(Vec::new());
        }

        let mut selected = Vec::new();
        for app_id in self.registered_app_ids()? {
            for adu in self.send.pending(&app_id)? {
                if !limiter.admit(adu.size()) {
                    info!(app_id = %app_id, id = adu.id, "Size limit reached, deferring ADUs");
                    return Ok(selected);
                }
                selected.push(adu);
            }
        }
        Ok(selected)
    }

    /// Persists inbound ADUs, skipping any at or below the per-app watermark.
    /// Returns the ADUs that were newly stored.
    pub fn store_received_adus(&self, adus: &[Adu]) -> Result<Vec<Adu>, Error> {
        let mut stored = Vec::new();
        for adu in adus {
            match self.receive.add(&adu.app_id, &adu.data, Some(adu.id))? {
                Some(_) => stored.push(adu.clone()),
                None => debug!(app_id = %adu.app_id, id = adu.id, "Dropping duplicate"),
            }
        }
        info!(received = adus.len(), stored = stored.len(), "Stored received ADUs");
        Ok(stored)
    }

    /// Inbound ADUs for `app_id` that have not been marked processed.
    pub fn received_adus(&self, app_id: &str) -> Result<Vec<Adu>, Error> {
        self.receive.unprocessed(app_id)
    }

    /// Drops inbound ADUs of `app_id` up to `id` once the application has
    /// consumed them.
    pub fn mark_processed(&self, app_id: &str, id: u64) -> Result<(), Error> {
        self.receive.delete_up_to(app_id, id)?;
        Ok(())
    }

    /// Whether outbound data was queued after `since`.
    pub fn has_new_adus(&self, since: SystemTime) -> Result<bool, Error> {
        self.send.has_new_since(since)
    }

    /// Records what a generated bundle carried so a later acknowledgement
    /// can release those ADUs.
    pub fn notify_bundle_sent(&self, payload: &Payload) -> Result<(), Error> {
        let _guard = self.lock()?;

        if !payload.adus().is_empty() {
            let path = self.path(SENT_BUNDLE_DETAILS_FILE);
            let mut details: SentBundleDetails = read_json(&path)?.unwrap_or_default();
            let key = payload.bundle_id().as_str().to_string();
            if !details.contains_key(&key) {
                let mut apps = BTreeMap::new();
                for adu in payload.adus() {
                    let max = apps.entry(adu.app_id.clone()).or_insert(adu.id);
                    *max = (*max).max(adu.id);
                }
                details.insert(key, apps);
                write_json(&path, &details)?;
            }
        }

        let last_sent = LastSentBundle {
            bundle_id: payload.bundle_id().clone(),
            ack_record: payload.ack_record().as_str().to_string(),
            adus: payload
                .adus()
                .iter()
                .map(|adu| AduRef {
                    app_id: adu.app_id.clone(),
                    id: adu.id,
                })
                .collect(),
            digest: payload.content_digest(),
        };
        write_json(&self.path(LAST_SENT_BUNDLE_FILE), &last_sent)?;
        debug!(bundle_id = %payload.bundle_id(), "Recorded sent bundle");
        Ok(())
    }

    /// Releases the outbound ADUs carried by the acknowledged bundle, whose
    /// id travels in `direction`. Bookkeeping of older bundles that were
    /// superseded before being acknowledged is dropped as well. Returns the
    /// number of ADU files deleted; acknowledging the same bundle again
    /// deletes nothing.
    pub fn process_acknowledgement(
        &self,
        ack_record: &AckRecord,
        direction: Direction,
    ) -> Result<usize, Error> {
        let Some(bundle_id) = ack_record.bundle_id() else {
            info!("Received heartbeat acknowledgement");
            return Ok(0);
        };

        let _guard = self.lock()?;
        let path = self.path(SENT_BUNDLE_DETAILS_FILE);
        let mut details: SentBundleDetails = read_json(&path)?.unwrap_or_default();

        let mut deleted = 0;
        match details.get(bundle_id.as_str()) {
            Some(apps) => {
                for (app_id, id) in apps {
                    deleted += self.send.delete_up_to(app_id, *id)?;
                }
            }
            None => debug!(%bundle_id, "Acknowledged bundle carried no pending ADUs"),
        }

        let before = details.len();
        details.retain(|key, _| {
            match BundleId::parse(key).and_then(|id| id.compare(bundle_id, direction)) {
                Ok(order) => order == Ordering::Greater,
                Err(err) => {
                    warn!(bundle_id = %key, %err, "Dropping unreadable sent bundle entry");
                    false
                }
            }
        });
        if details.len() != before {
            write_json(&path, &details)?;
        }

        let acknowledged_path = self.path(LAST_ACKNOWLEDGED_FILE);
        let newest = match read_json::<BundleId>(&acknowledged_path)? {
            Some(known) => known.compare(bundle_id, direction)? == Ordering::Less,
            None => true,
        };
        if newest {
            write_json(&acknowledged_path, bundle_id)?;
        }

        let last_sent_path = self.path(LAST_SENT_BUNDLE_FILE);
        let last_sent: Option<LastSentBundle> = read_json(&last_sent_path)?;
        if last_sent.is_some_and(|last| &last.bundle_id == bundle_id) {
            remove_file_if_exists(&last_sent_path)?;
        }

        info!(%bundle_id, deleted, pruned = before - details.len(), "Processed acknowledgement");
        Ok(deleted)
    }

    /// The newest of our bundles the counterparty has acknowledged.
    pub fn largest_acknowledged(&self) -> Result<Option<BundleId>, Error> {
        read_json(&self.path(LAST_ACKNOWLEDGED_FILE))
    }

    /// Rebuilds the last generated bundle from the send store, or `None`
    /// when there is none or it was acknowledged.
    pub fn get_last_sent_bundle_builder(&self) -> Result<Option<PayloadBuilder>, Error> {
        let Some(last_sent) = read_json::<LastSentBundle>(&self.path(LAST_SENT_BUNDLE_FILE))?
        else {
            return Ok(None);
        };

        let mut adus = Vec::with_capacity(last_sent.adus.len());
        for adu in &last_sent.adus {
            match self.send.get(&adu.app_id, adu.id)? {
                Some(adu) => adus.push(adu),
                None => {
                    warn!(app_id = %adu.app_id, id = adu.id, "Last sent bundle lost an ADU");
                    return Ok(None);
                }
            }
        }

        let builder = PayloadBuilder::new()
            .bundle_id(last_sent.bundle_id)
            .ack_record(AckRecord::parse(&last_sent.ack_record)?)
            .adus(adus);
        if builder.content_digest() != last_sent.digest {
            warn!("Last sent bundle no longer matches its digest");
            return Ok(None);
        }
        Ok(Some(builder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn bundle_id(counter: u64) -> BundleId {
        BundleId::new("AAAAAAAAAAAAAAAAAAAAAA", counter, Direction::Upstream).unwrap()
    }

    fn manager(dir: &TempDir) -> ApplicationDataManager {
        ApplicationDataManager::open(dir.path(), &FerryConfig::default()).unwrap()
    }

    fn payload(counter: u64, adus: Vec<Adu>) -> Payload {
        PayloadBuilder::new()
            .bundle_id(bundle_id(counter))
            .adus(adus)
            .build()
            .unwrap()
    }

    #[test]
    fn test_add_adu_rejects_non_increasing_ids() {
        let dir = TempDir::new().unwrap();
        let adm = manager(&dir);

        assert_eq!(adm.add_adu("chat", None, b"one").unwrap(), 1);
        assert_eq!(adm.add_adu("chat", Some(7), b"seven").unwrap(), 7);
        assert!(matches!(
            adm.add_adu("chat", Some(7), b"again"),
            Err(Error::InvalidMessage(_))
        ));
        assert_eq!(adm.registered_app_ids().unwrap(), vec!["chat".to_string()]);
    }

    #[test]
    fn test_fetch_stops_at_size_limit() {
        let dir = TempDir::new().unwrap();
        let adm = manager(&dir);
        adm.add_adu("a", None, &[0; 40]).unwrap();
        adm.add_adu("a", None, &[0; 40]).unwrap();
        adm.add_adu("b", None, &[0; 10]).unwrap();

        let ack = AckRecord::Heartbeat;
        let all = adm.fetch_adus_to_send(&ack, 1000).unwrap();
        assert_eq!(all.len(), 3);

        // Budget covers the ack and the first ADU only; "b" must not jump the gap.
        let limited = adm.fetch_adus_to_send(&ack, 2 + 60).unwrap();
        assert_eq!(limited, vec![Adu::new("a", 1, vec![0; 40])]);

        assert!(adm.fetch_adus_to_send(&ack, 1).unwrap().is_empty());
    }

    #[test]
    fn test_acknowledgement_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let adm = manager(&dir);
        for data in [b"1", b"2"] {
            adm.add_adu("x", None, data).unwrap();
        }

        let adus = adm.fetch_adus_to_send(&AckRecord::Heartbeat, 1000).unwrap();
        let first = payload(1, adus);
        adm.notify_bundle_sent(&first).unwrap();
        adm.notify_bundle_sent(&first).unwrap();

        // Content grew before the first bundle was acknowledged.
        adm.add_adu("x", None, b"3").unwrap();
        let adus = adm.fetch_adus_to_send(&AckRecord::Heartbeat, 1000).unwrap();
        adm.notify_bundle_sent(&payload(2, adus)).unwrap();
        assert!(adm.get_last_sent_bundle_builder().unwrap().is_some());

        let ack = AckRecord::Bundle(bundle_id(2));
        assert_eq!(adm.process_acknowledgement(&ack, Direction::Upstream).unwrap(), 3);
        assert_eq!(adm.process_acknowledgement(&ack, Direction::Upstream).unwrap(), 0);

        // The superseded bundle left no bookkeeping behind.
        let details: SentBundleDetails = read_json(&adm.path(SENT_BUNDLE_DETAILS_FILE))
            .unwrap()
            .unwrap();
        assert!(details.is_empty());

        let late = AckRecord::Bundle(bundle_id(1));
        assert_eq!(adm.process_acknowledgement(&late, Direction::Upstream).unwrap(), 0);
        assert_eq!(adm.largest_acknowledged().unwrap(), Some(bundle_id(2)));

        let remaining = adm.fetch_adus_to_send(&AckRecord::Heartbeat, 1000).unwrap();
        assert!(remaining.is_empty());
        assert!(adm.get_last_sent_bundle_builder().unwrap().is_none());
        assert_eq!(adm.send_metadata("x").unwrap().last_sent, 3);
    }

    #[test]
    fn test_heartbeat_acknowledgement_is_noop() {
        let dir = TempDir::new().unwrap();
        let adm = manager(&dir);
        adm.add_adu("x", None, b"1").unwrap();
        let adus = adm.fetch_adus_to_send(&AckRecord::Heartbeat, 100).unwrap();
        adm.notify_bundle_sent(&payload(1, adus)).unwrap();

        let deleted = adm
            .process_acknowledgement(&AckRecord::Heartbeat, Direction::Upstream)
            .unwrap();
        assert_eq!(deleted, 0);
        let remaining = adm.fetch_adus_to_send(&AckRecord::Heartbeat, 100).unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[test]
    fn test_received_adus_are_deduplicated() {
        let dir = TempDir::new().unwrap();
        let adm = manager(&dir);
        let adus = vec![
            Adu::new("mail", 1, b"a".to_vec()),
            Adu::new("mail", 2, b"b".to_vec()),
        ];

        assert_eq!(adm.store_received_adus(&adus).unwrap().len(), 2);
        assert!(adm.store_received_adus(&adus).unwrap().is_empty());
        assert_eq!(adm.received_adus("mail").unwrap(), adus);

        adm.mark_processed("mail", 1).unwrap();
        assert_eq!(adm.received_adus("mail").unwrap(), adus[1..].to_vec());
        assert_eq!(adm.receive_metadata("mail").unwrap().last_processed, 1);
    }

    #[test]
    fn test_has_new_adus_tracks_queue_time() {
        let dir = TempDir::new().unwrap();
        let adm = manager(&dir);
        let before = SystemTime::now() - Duration::from_secs(60);

        assert!(!adm.has_new_adus(before).unwrap());
        adm.add_adu("chat", None, b"hello").unwrap();
        assert!(adm.has_new_adus(before).unwrap());
        let later = SystemTime::now() + Duration::from_secs(60);
        assert!(!adm.has_new_adus(later).unwrap());
    }
}
