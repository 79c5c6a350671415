mod codec;
pub use codec::*;
mod id;
pub use id::*;
mod payload;
pub use payload::*;
mod security;
pub use security::*;

use crate::Error;
use crate::proto::{BUNDLE_ARCHIVE_VERSION, BundleArchiveProto, BundleFileProto};
use crate::storage::write_atomic;
use prost::Message;
use std::path::{Component, Path, PathBuf};

/// Directory holding the encrypted chunks `payload1`, `payload2`, ...
pub const PAYLOAD_DIR: &str = "payload";
/// Directory holding one `payloadN.signature` per chunk.
pub const SIGNATURE_DIR: &str = "signatures";
/// The bundle id, encrypted with the [`BundleIdCipher`].
pub const BUNDLE_ID_FILE: &str = "bundle.id";
pub const SENDER_IDENTITY_FILE: &str = "sender_identity.pub";
/// Only present while the sender's session handshake is unacknowledged.
pub const SENDER_BASE_KEY_FILE: &str = "sender_base.pub";
pub const RECIPIENT_IDENTITY_FILE: &str = "recipient_identity.pub";

const MAX_ARCHIVE_DEPTH: usize = 2;

pub(crate) fn chunk_file_name(index: usize) -> String {
    format!("payload{index}")
}

pub(crate) fn signature_file_name(index: usize) -> String {
    format!("payload{index}.signature")
}

/// A generated bundle ready for upload: its plaintext id, the encrypted id
/// used on the wire, and the packed archive on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bundle {
    pub id: BundleId,
    pub encrypted_id: String,
    pub path: PathBuf,
}

fn collect_files(
    root: &Path,
    dir: &Path,
    depth: usize,
    files: &mut Vec<BundleFileProto>,
) -> Result<(), Error> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            if depth >= MAX_ARCHIVE_DEPTH {
                return Err(Error::BundleMalformed(format!(
                    "Bundle directory nested too deep: {}",
                    path.display()
                )));
            }
            collect_files(root, &path, depth + 1, files)?;
            continue;
        }

        let relative = path
            .strip_prefix(root)
            .map_err(|_| Error::BundleMalformed("Bundle file outside its directory".to_string()))?;
        let name = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push(BundleFileProto {
            path: name,
            contents: std::fs::read(&path)?,
        });
    }
    Ok(())
}

/// Packs a bundle directory into a single archive for transport.
pub fn pack_bundle(dir: &Path) -> Result<Vec<u8>, Error> {
    let mut files = Vec::new();
    collect_files(dir, dir, 1, &mut files)?;
    files.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(BundleArchiveProto {
        version: BUNDLE_ARCHIVE_VERSION,
        files,
    }
    .encode_to_vec())
}

fn validate_entry(path: &str) -> Result<PathBuf, Error> {
    let relative = Path::new(path);
    let components: Vec<_> = relative.components().collect();
    let valid = !components.is_empty()
        && components.len() <= MAX_ARCHIVE_DEPTH
        && components
            .iter()
            .all(|component| matches!(component, Component::Normal(_)));

    if valid {
        Ok(relative.to_path_buf())
    } else {
        Err(Error::BundleMalformed(format!("Invalid archive entry: {path}")))
    }
}

/// Unpacks an archive produced by [`pack_bundle`] into `dest`. Entries that
/// would escape `dest` reject the whole archive before anything is written.
pub fn unpack_bundle(archive: &[u8], dest: &Path) -> Result<(), Error> {
    let proto = BundleArchiveProto::decode(archive)
        .map_err(|err| Error::BundleMalformed(format!("Failed to decode archive: {err}")))?;
    if proto.version != BUNDLE_ARCHIVE_VERSION {
        return Err(Error::BundleMalformed(format!(
            "Unsupported archive version: {}",
            proto.version
        )));
    }

    let entries = proto
        .files
        .iter()
        .map(|file| Ok((validate_entry(&file.path)?, &file.contents)))
        .collect::<Result<Vec<_>, Error>>()?;

    std::fs::create_dir_all(dest)?;
    for (relative, contents) in entries {
        write_atomic(&dest.join(relative), contents)?;
    }
    Ok(())
}
