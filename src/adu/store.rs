use crate::Error;
use crate::bundle::Adu;
use crate::storage::{read_json, read_optional, remove_file_if_exists, write_atomic, write_json};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;
use tracing::{debug, warn};

const METADATA_FILE: &str = "metadata.json";
const ADU_EXTENSION: &str = "adu";

/// Watermarks kept per application.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AduMetadata {
    pub last_added: u64,
    pub last_sent: u64,
    pub last_received: u64,
    pub last_processed: u64,
    pub last_adu_deleted: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StoreKind {
    /// Outbound ADUs; deleting advances `last_sent`.
    Sending,
    /// Inbound ADUs; deleting advances `last_processed`.
    Receiving,
}

/// One directory of ADUs, laid out as `<root>/<app>/<id>.adu` with a
/// `metadata.json` next to the ADU files of every app.
pub(crate) struct AduStore {
    root: PathBuf,
    kind: StoreKind,
    metadata: Mutex<HashMap<String, AduMetadata>>,
}

impl AduStore {
    pub(crate) fn open(root: impl Into<PathBuf>, kind: StoreKind) -> Result<Self, Error> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let mut metadata = HashMap::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(app_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Some(app) = read_json::<AduMetadata>(&entry.path().join(METADATA_FILE))? {
                metadata.insert(app_id, app);
            }
        }

        Ok(Self {
            root,
            kind,
            metadata: Mutex::new(metadata),
        })
    }

    fn app_dir(&self, app_id: &str) -> Result<PathBuf, Error> {
        let valid = !app_id.is_empty()
            && app_id != "."
            && app_id != ".."
            && !app_id.contains(['/', '\\']);
        if !valid {
            return Err(Error::InvalidMessage(format!("Invalid app id: {app_id:?}")));
        }
        Ok(self.root.join(app_id))
    }

    fn adu_path(&self, app_id: &str, id: u64) -> Result<PathBuf, Error> {
        Ok(self.app_dir(app_id)?.join(format!("{id}.{ADU_EXTENSION}")))
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, AduMetadata>>, Error> {
        self.metadata
            .lock()
            .map_err(|_| Error::Io("ADU metadata lock poisoned".to_string()))
    }

    /// Snapshot of the watermarks for `app_id`.
    pub(crate) fn metadata(&self, app_id: &str) -> Result<AduMetadata, Error> {
        Ok(self.lock()?.get(app_id).copied().unwrap_or_default())
    }

    pub(crate) fn app_ids(&self) -> Result<Vec<String>, Error> {
        let mut apps: Vec<String> = self.lock()?.keys().cloned().collect();
        apps.sort();
        Ok(apps)
    }

    /// Stores one ADU. Without an explicit id the next id after the
    /// watermark is used. Returns `None` when the id is not above the
    /// watermark, which is how duplicates are dropped.
    pub(crate) fn add(
        &self,
        app_id: &str,
        data: &[u8],
        id: Option<u64>,
    ) -> Result<Option<u64>, Error> {
        let dir = self.app_dir(app_id)?;
        let mut metadata = self.lock()?;
        let mut app = metadata.get(app_id).copied().unwrap_or_default();

        let watermark = match self.kind {
            StoreKind::Sending => app.last_added,
            StoreKind::Receiving => app.last_received,
        };
        let id = match id {
            Some(id) if id <= watermark => {
                debug!(app_id, id, watermark, "Skipping ADU at or below watermark");
                return Ok(None);
            }
            Some(id) => id,
            None => watermark.checked_add(1).ok_or_else(|| {
                Error::InvalidMessage(format!("ADU ids for {app_id} are exhausted"))
            })?,
        };

        write_atomic(&dir.join(format!("{id}.{ADU_EXTENSION}")), data)?;
        match self.kind {
            StoreKind::Sending => app.last_added = id,
            StoreKind::Receiving => app.last_received = id,
        }
        write_json(&dir.join(METADATA_FILE), &app)?;
        metadata.insert(app_id.to_string(), app);
        Ok(Some(id))
    }

    /// Reads one ADU, `None` when it is missing on disk.
    pub(crate) fn get(&self, app_id: &str, id: u64) -> Result<Option<Adu>, Error> {
        Ok(read_optional(&self.adu_path(app_id, id)?)?.map(|data| Adu::new(app_id, id, data)))
    }

    /// ADUs on disk whose id falls in `ids`, in id order. Ids are sparse, so
    /// the directory is listed rather than the range walked.
    fn collect(&self, app_id: &str, ids: RangeInclusive<u64>) -> Result<Vec<Adu>, Error> {
        let dir = self.app_dir(app_id)?;
        if ids.is_empty() || !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            if let Some(id) = adu_id(&entry?.path()).filter(|id| ids.contains(id)) {
                found.push(id);
            }
        }
        found.sort_unstable();

        let mut adus = Vec::with_capacity(found.len());
        for id in found {
            match self.get(app_id, id)? {
                Some(adu) => adus.push(adu),
                None => warn!(app_id, id, "ADU vanished while listing"),
            }
        }
        Ok(adus)
    }

    /// Outbound ADUs not yet acknowledged, in id order.
    pub(crate) fn pending(&self, app_id: &str) -> Result<Vec<Adu>, Error> {
        let app = self.metadata(app_id)?;
        self.collect(app_id, app.last_sent.saturating_add(1)..=app.last_added)
    }

    /// Inbound ADUs the application has not consumed yet, in id order.
    pub(crate) fn unprocessed(&self, app_id: &str) -> Result<Vec<Adu>, Error> {
        let app = self.metadata(app_id)?;
        self.collect(app_id, app.last_processed.saturating_add(1)..=app.last_received)
    }

    /// Deletes every ADU of `app_id` with an id up to `id` and advances the
    /// watermarks. Returns how many ADU files were removed.
    pub(crate) fn delete_up_to(&self, app_id: &str, id: u64) -> Result<usize, Error> {
        let dir = self.app_dir(app_id)?;
        let mut metadata = self.lock()?;
        let mut app = metadata.get(app_id).copied().unwrap_or_default();

        let mut deleted = 0;
        if dir.is_dir() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if adu_id(&path).is_some_and(|adu| adu <= id) {
                    remove_file_if_exists(&path)?;
                    deleted += 1;
                }
            }
        }

        app.last_adu_deleted = app.last_adu_deleted.max(id);
        match self.kind {
            StoreKind::Sending => app.last_sent = app.last_sent.max(id),
            StoreKind::Receiving => app.last_processed = app.last_processed.max(id),
        }
        write_json(&dir.join(METADATA_FILE), &app)?;
        metadata.insert(app_id.to_string(), app);

        debug!(app_id, id, deleted, "Deleted ADUs");
        Ok(deleted)
    }

    /// Whether any ADU file was written after `since`.
    pub(crate) fn has_new_since(&self, since: SystemTime) -> Result<bool, Error> {
        for app_id in self.app_ids()? {
            let dir = self.app_dir(&app_id)?;
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                if adu_id(&entry.path()).is_some() && entry.metadata()?.modified()? > since {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

fn adu_id(path: &Path) -> Option<u64> {
    if path.extension()? != ADU_EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sending_store_assigns_ids_and_deletes() {
        let dir = TempDir::new().unwrap();
        let store = AduStore::open(dir.path(), StoreKind::Sending).unwrap();

        assert_eq!(store.add("chat", b"one", None).unwrap(), Some(1));
        assert_eq!(store.add("chat", b"two", None).unwrap(), Some(2));
        assert_eq!(store.add("chat", b"late", Some(2)).unwrap(), None);
        assert_eq!(store.add("chat", b"five", Some(5)).unwrap(), Some(5));

        let pending: Vec<u64> = store.pending("chat").unwrap().iter().map(|a| a.id).collect();
        assert_eq!(pending, vec![1, 2, 5]);

        assert_eq!(store.delete_up_to("chat", 2).unwrap(), 2);
        let app = store.metadata("chat").unwrap();
        assert_eq!((app.last_sent, app.last_adu_deleted, app.last_added), (2, 2, 5));
        assert_eq!(store.pending("chat").unwrap().len(), 1);
    }

    #[test]
    fn test_receiving_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = AduStore::open(dir.path(), StoreKind::Receiving).unwrap();
            store.add("mail", b"a", Some(1)).unwrap();
            store.add("mail", b"b", Some(2)).unwrap();
            store.delete_up_to("mail", 1).unwrap();
        }

        let store = AduStore::open(dir.path(), StoreKind::Receiving).unwrap();
        assert_eq!(store.add("mail", b"dup", Some(2)).unwrap(), None);
        let unprocessed = store.unprocessed("mail").unwrap();
        assert_eq!(unprocessed, vec![Adu::new("mail", 2, b"b".to_vec())]);
        assert_eq!(store.app_ids().unwrap(), vec!["mail".to_string()]);
    }

    #[test]
    fn test_rejects_path_like_app_ids() {
        let dir = TempDir::new().unwrap();
        let store = AduStore::open(dir.path(), StoreKind::Sending).unwrap();
        for app_id in ["", "..", "a/b"] {
            assert!(matches!(
                store.add(app_id, b"x", None),
                Err(Error::InvalidMessage(_))
            ));
        }
    }

    #[test]
    fn test_sparse_ids_are_listed_without_walking_the_gap() {
        let dir = TempDir::new().unwrap();
        let store = AduStore::open(dir.path(), StoreKind::Receiving).unwrap();
        store.add("feed", b"first", Some(1)).unwrap();
        store.add("feed", b"far", Some(3_000_000)).unwrap();
        store.add("feed", b"last", Some(u64::MAX)).unwrap();

        let ids: Vec<u64> = store.unprocessed("feed").unwrap().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![1, 3_000_000, u64::MAX]);

        store.delete_up_to("feed", 3_000_000).unwrap();
        let ids: Vec<u64> = store.unprocessed("feed").unwrap().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![u64::MAX]);
    }

    #[test]
    fn test_exhausted_ids_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = AduStore::open(dir.path(), StoreKind::Sending).unwrap();
        store.add("feed", b"last", Some(u64::MAX)).unwrap();
        assert!(matches!(
            store.add("feed", b"more", None),
            Err(Error::InvalidMessage(_))
        ));
    }
}
