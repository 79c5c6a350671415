use crate::bundle::{
    BUNDLE_ID_FILE, BundleId, BundleSecurity, PAYLOAD_DIR, Payload, RECIPIENT_IDENTITY_FILE,
    SENDER_BASE_KEY_FILE, SENDER_IDENTITY_FILE, SIGNATURE_DIR, chunk_file_name,
    signature_file_name,
};
use crate::storage::{read_optional, remove_dir_if_exists, remove_file_if_exists, write_atomic};
use crate::{Error, FerryConfig, IdentityPublicKey, X25519PublicKey};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// Turns payloads into bundle directories and back.
///
/// Every chunk of the encoded payload is signed in plaintext with the
/// sender's identity key and encrypted as one ratchet message, so a bundle
/// is only accepted when every chunk both decrypts and verifies.
pub struct PayloadCodec {
    chunk_size: usize,
}

impl PayloadCodec {
    pub fn new(config: &FerryConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
        }
    }

    /// Writes the bundle directory for `payload` into `dir`, replacing
    /// whatever was there.
    pub fn encrypt(
        &self,
        security: &BundleSecurity,
        payload: &Payload,
        dir: &Path,
    ) -> Result<(), Error> {
        remove_dir_if_exists(dir)?;
        let payload_dir = dir.join(PAYLOAD_DIR);
        let signature_dir = dir.join(SIGNATURE_DIR);
        std::fs::create_dir_all(&payload_dir)?;
        std::fs::create_dir_all(&signature_dir)?;

        let encoded = payload.to_bytes();
        let mut chunks = 0;
        for (offset, chunk) in encoded.chunks(self.chunk_size).enumerate() {
            let index = offset + 1;
            let signature = security.identity().sign(chunk);
            write_atomic(
                &signature_dir.join(signature_file_name(index)),
                &signature.to_bytes(),
            )?;

            let file = File::create(payload_dir.join(chunk_file_name(index)))?;
            let mut output = BufWriter::new(file);
            security.cipher().encrypt_stream(chunk, &mut output)?;
            output.flush()?;
            chunks = index;
        }

        let encrypted_id = security.id_cipher().encrypt(payload.bundle_id())?;
        write_atomic(&dir.join(BUNDLE_ID_FILE), encrypted_id.as_bytes())?;
        write_atomic(
            &dir.join(SENDER_IDENTITY_FILE),
            &security.identity().public().to_bytes(),
        )?;
        if let Some(base_key) = security.cipher().pending_base_key()? {
            write_atomic(&dir.join(SENDER_BASE_KEY_FILE), base_key.as_bytes())?;
        }
        write_atomic(
            &dir.join(RECIPIENT_IDENTITY_FILE),
            &security.peer_identity().to_bytes(),
        )?;

        info!(
            bundle_id = %payload.bundle_id(),
            chunks,
            adus = payload.adus().len(),
            "Encrypted bundle"
        );
        Ok(())
    }

    /// Reads and decrypts the id of the bundle in `dir` without touching the
    /// ratchet session.
    pub fn read_bundle_id(
        &self,
        security: &BundleSecurity,
        dir: &Path,
    ) -> Result<BundleId, Error> {
        let encrypted = read_required(&dir.join(BUNDLE_ID_FILE))?;
        let encrypted = String::from_utf8(encrypted)
            .map_err(|_| Error::BundleMalformed("Bundle id file is not UTF-8".to_string()))?;
        security.id_cipher().decrypt(&encrypted)
    }

    /// Decrypts the bundle in `dir`, reassembling the payload into `output`.
    /// If any chunk fails to decrypt or verify, `output` is removed and
    /// nothing of the bundle is returned.
    pub fn decrypt(
        &self,
        security: &BundleSecurity,
        dir: &Path,
        output: &Path,
    ) -> Result<Payload, Error> {
        let recipient = read_identity(&dir.join(RECIPIENT_IDENTITY_FILE))?;
        if recipient != security.identity().public() {
            return Err(Error::UntrustedIdentity(
                "Bundle is addressed to another identity".to_string(),
            ));
        }

        let sender = read_identity(&dir.join(SENDER_IDENTITY_FILE))?;
        if sender != *security.peer_identity() {
            return Err(Error::UntrustedIdentity(
                "Bundle sender is not the trusted counterparty".to_string(),
            ));
        }

        if let Some(base_key) = read_optional(&dir.join(SENDER_BASE_KEY_FILE))? {
            let base_key = X25519PublicKey::from_slice(&base_key)?;
            security.cipher().process_pre_key(sender, base_key)?;
        }

        let chunks = chunk_count(dir)?;
        if let Err(err) = self.decrypt_chunks(security, dir, &sender, chunks, output) {
            warn!(%err, "Discarding partially decrypted bundle");
            remove_file_if_exists(output)?;
            return Err(err);
        }

        let payload = Payload::from_bytes(&std::fs::read(output)?)?;
        let expected = self.read_bundle_id(security, dir)?;
        if payload.bundle_id() != &expected {
            remove_file_if_exists(output)?;
            return Err(Error::BundleMalformed(format!(
                "Payload carries bundle id {} but the bundle is {expected}",
                payload.bundle_id()
            )));
        }

        info!(bundle_id = %expected, chunks, "Decrypted bundle");
        Ok(payload)
    }

    fn decrypt_chunks(
        &self,
        security: &BundleSecurity,
        dir: &Path,
        sender: &IdentityPublicKey,
        chunks: usize,
        output: &Path,
    ) -> Result<(), Error> {
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(output)?);

        for index in 1..=chunks {
            let chunk = File::open(dir.join(PAYLOAD_DIR).join(chunk_file_name(index)))?;
            let input = BufReader::new(chunk);
            let mut plaintext = Vec::with_capacity(self.chunk_size);
            security.cipher().decrypt_stream(input, &mut plaintext)?;

            let signature =
                read_required(&dir.join(SIGNATURE_DIR).join(signature_file_name(index)))?;
            sender.verify(&plaintext, &signature).map_err(|_| {
                Error::BundleMalformed(format!("Chunk {index} is not signed by the sender"))
            })?;

            writer.write_all(&plaintext)?;
            debug!(index, size = plaintext.len(), "Verified chunk");
        }

        writer.flush()?;
        Ok(())
    }
}

fn read_required(path: &Path) -> Result<Vec<u8>, Error> {
    read_optional(path)?
        .ok_or_else(|| Error::BundleMalformed(format!("Missing bundle file {}", path.display())))
}

fn read_identity(path: &Path) -> Result<IdentityPublicKey, Error> {
    IdentityPublicKey::from_slice(&read_required(path)?)
}

/// Number of chunks in the bundle. Chunks must be numbered `1..=n` without
/// gaps and each must have a signature.
fn chunk_count(dir: &Path) -> Result<usize, Error> {
    let payload_dir = dir.join(PAYLOAD_DIR);
    if !payload_dir.is_dir() {
        return Err(Error::BundleMalformed(
            "Bundle has no payload directory".to_string(),
        ));
    }

    let mut indices = BTreeSet::new();
    for entry in std::fs::read_dir(&payload_dir)? {
        let name = entry?.file_name();
        let index = name
            .to_str()
            .and_then(|name| name.strip_prefix("payload"))
            .and_then(|index| index.parse::<usize>().ok())
            .ok_or_else(|| {
                let name = name.to_string_lossy();
                Error::BundleMalformed(format!("Unexpected payload file {name}"))
            })?;
        indices.insert(index);
    }

    let count = indices.len();
    if count == 0 || indices.iter().copied().ne(1..=count) {
        return Err(Error::BundleMalformed(format!(
            "Payload chunks are not numbered 1..={count}"
        )));
    }
    for index in 1..=count {
        if !dir.join(SIGNATURE_DIR).join(signature_file_name(index)).is_file() {
            return Err(Error::BundleMalformed(format!("Chunk {index} has no signature")));
        }
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{Adu, AckRecord, PayloadBuilder};
    use crate::{IdentityKey, PeerBundle, X25519Secret};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Parties {
        _dir: TempDir,
        root: std::path::PathBuf,
        client: BundleSecurity,
        server: BundleSecurity,
    }

    fn parties(config: &FerryConfig) -> Parties {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let client_identity = Arc::new(IdentityKey::new().unwrap());
        let server_identity = Arc::new(IdentityKey::new().unwrap());
        let ratchet = X25519Secret::generate().unwrap();
        let server_bundle = PeerBundle::new(&server_identity, ratchet.public_key());

        let client = BundleSecurity::client(
            &root.join("client"),
            client_identity.clone(),
            &server_bundle,
            config,
        )
        .unwrap();
        let server = BundleSecurity::server(
            &root.join("server"),
            server_identity,
            ratchet,
            client_identity.public(),
            config,
        )
        .unwrap();

        Parties {
            _dir: dir,
            root,
            client,
            server,
        }
    }

    fn payload(security: &BundleSecurity, size: usize) -> Payload {
        PayloadBuilder::new()
            .bundle_id(security.next_bundle_id().unwrap())
            .ack_record(AckRecord::Heartbeat)
            .adus(vec![Adu::new("chat", 1, (0..size).map(|i| i as u8).collect())])
            .build()
            .unwrap()
    }

    #[test]
    fn test_bundle_round_trip_over_many_chunks() {
        let config = FerryConfig {
            chunk_size: 64,
            ..FerryConfig::default()
        };
        let parties = parties(&config);
        let codec = PayloadCodec::new(&config);
        let payload = payload(&parties.client, 1000);

        let bundle_dir = parties.root.join("bundle");
        codec.encrypt(&parties.client, &payload, &bundle_dir).unwrap();
        assert!(bundle_dir.join(SENDER_BASE_KEY_FILE).is_file());
        assert!(bundle_dir.join(PAYLOAD_DIR).join("payload2").is_file());

        assert_eq!(
            codec.read_bundle_id(&parties.server, &bundle_dir).unwrap(),
            *payload.bundle_id()
        );
        let output = parties.root.join("decrypted");
        let decrypted = codec.decrypt(&parties.server, &bundle_dir, &output).unwrap();
        assert_eq!(decrypted, payload);
        assert_eq!(std::fs::read(&output).unwrap(), payload.to_bytes());

        // The server answers through the established session
        let reply = PayloadBuilder::new()
            .bundle_id(parties.server.next_bundle_id().unwrap())
            .ack_record(AckRecord::Bundle(payload.bundle_id().clone()))
            .build()
            .unwrap();
        let reply_dir = parties.root.join("reply");
        codec.encrypt(&parties.server, &reply, &reply_dir).unwrap();
        assert!(!reply_dir.join(SENDER_BASE_KEY_FILE).exists());
        let received = codec
            .decrypt(&parties.client, &reply_dir, &parties.root.join("reply.out"))
            .unwrap();
        assert_eq!(received.ack_record(), reply.ack_record());
        assert_eq!(parties.client.cipher().pending_base_key().unwrap(), None);
    }

    #[test]
    fn test_bad_signature_discards_output() {
        let config = FerryConfig {
            chunk_size: 32,
            ..FerryConfig::default()
        };
        let parties = parties(&config);
        let codec = PayloadCodec::new(&config);
        let payload = payload(&parties.client, 200);

        let bundle_dir = parties.root.join("bundle");
        codec.encrypt(&parties.client, &payload, &bundle_dir).unwrap();
        let forged = IdentityKey::new().unwrap().sign(b"something else");
        std::fs::write(
            bundle_dir.join(SIGNATURE_DIR).join(signature_file_name(3)),
            forged.to_bytes(),
        )
        .unwrap();

        let output = parties.root.join("decrypted");
        assert!(matches!(
            codec.decrypt(&parties.server, &bundle_dir, &output),
            Err(Error::BundleMalformed(_))
        ));
        assert!(!output.exists());
    }

    #[test]
    fn test_missing_chunk_is_malformed() {
        let config = FerryConfig {
            chunk_size: 32,
            ..FerryConfig::default()
        };
        let parties = parties(&config);
        let codec = PayloadCodec::new(&config);
        let bundle_dir = parties.root.join("bundle");
        codec
            .encrypt(&parties.client, &payload(&parties.client, 200), &bundle_dir)
            .unwrap();
        std::fs::remove_file(bundle_dir.join(PAYLOAD_DIR).join(chunk_file_name(2))).unwrap();

        assert!(matches!(
            codec.decrypt(&parties.server, &bundle_dir, &parties.root.join("out")),
            Err(Error::BundleMalformed(_))
        ));
    }

    #[test]
    fn test_bundle_for_someone_else_is_untrusted() {
        let config = FerryConfig::default();
        let parties = parties(&config);
        let codec = PayloadCodec::new(&config);
        let bundle_dir = parties.root.join("bundle");
        codec
            .encrypt(&parties.client, &payload(&parties.client, 10), &bundle_dir)
            .unwrap();
        std::fs::write(
            bundle_dir.join(RECIPIENT_IDENTITY_FILE),
            IdentityKey::new().unwrap().public().to_bytes(),
        )
        .unwrap();

        assert!(matches!(
            codec.decrypt(&parties.server, &bundle_dir, &parties.root.join("out")),
            Err(Error::UntrustedIdentity(_))
        ));
    }
}
