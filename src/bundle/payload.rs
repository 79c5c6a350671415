use crate::Error;
use crate::bundle::BundleId;
use crate::proto::{AduProto, PayloadProto};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use prost::Message;
use sha2::{Digest, Sha256};
use std::fmt;

/// Ack record value meaning "nothing received yet". A bundle carrying it
/// acknowledges nothing and works as a heartbeat.
pub const HEARTBEAT: &str = "HB";

/// One application data unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Adu {
    pub app_id: String,
    pub id: u64,
    pub data: Vec<u8>,
}

impl Adu {
    pub fn new(app_id: impl Into<String>, id: u64, data: Vec<u8>) -> Self {
        Self {
            app_id: app_id.into(),
            id,
            data,
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// The highest bundle id accepted from the counterparty.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AckRecord {
    #[default]
    Heartbeat,
    Bundle(BundleId),
}

impl AckRecord {
    pub fn parse(value: &str) -> Result<Self, Error> {
        match value.trim() {
            "" | HEARTBEAT => Ok(Self::Heartbeat),
            id => Ok(Self::Bundle(BundleId::parse(id)?)),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Heartbeat => HEARTBEAT,
            Self::Bundle(id) => id.as_str(),
        }
    }

    pub fn bundle_id(&self) -> Option<&BundleId> {
        match self {
            Self::Heartbeat => None,
            Self::Bundle(id) => Some(id),
        }
    }

    pub(crate) fn encoded_len(&self) -> u64 {
        self.as_str().len() as u64
    }
}

impl fmt::Display for AckRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The plaintext content of a bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload {
    bundle_id: BundleId,
    ack_record: AckRecord,
    adus: Vec<Adu>,
}

impl Payload {
    pub fn bundle_id(&self) -> &BundleId {
        &self.bundle_id
    }

    pub fn ack_record(&self) -> &AckRecord {
        &self.ack_record
    }

    pub fn adus(&self) -> &[Adu] {
        &self.adus
    }

    /// Canonical encoding: ADUs ordered by app id and then ADU id.
    pub fn to_bytes(&self) -> Vec<u8> {
        to_proto(Some(&self.bundle_id), &self.ack_record, &self.adus).encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let proto = PayloadProto::decode(bytes)
            .map_err(|err| Error::BundleMalformed(format!("Failed to decode payload: {err}")))?;

        Ok(Self {
            bundle_id: BundleId::parse(&proto.bundle_id)?,
            ack_record: AckRecord::parse(&proto.ack_record)?,
            adus: proto
                .adus
                .into_iter()
                .map(|adu| Adu {
                    app_id: adu.app_id,
                    id: adu.id,
                    data: adu.data,
                })
                .collect(),
        })
    }

    pub fn content_digest(&self) -> String {
        content_digest(&self.ack_record, &self.adus)
    }
}

fn sorted(adus: &[Adu]) -> Vec<&Adu> {
    let mut adus: Vec<&Adu> = adus.iter().collect();
    adus.sort_by(|a, b| (&a.app_id, a.id).cmp(&(&b.app_id, b.id)));
    adus
}

fn to_proto(
    bundle_id: Option<&BundleId>,
    ack_record: &AckRecord,
    adus: &[Adu],
) -> PayloadProto {
    PayloadProto {
        bundle_id: bundle_id.map(|id| id.as_str().to_string()).unwrap_or_default(),
        ack_record: ack_record.as_str().to_string(),
        adus: sorted(adus)
            .into_iter()
            .map(|adu| AduProto {
                app_id: adu.app_id.clone(),
                id: adu.id,
                data: adu.data.clone(),
            })
            .collect(),
    }
}

/// SHA-256 over the canonical encoding of everything but the bundle id.
fn content_digest(ack_record: &AckRecord, adus: &[Adu]) -> String {
    let encoded = to_proto(None, ack_record, adus).encode_to_vec();
    URL_SAFE_NO_PAD.encode(Sha256::digest(encoded))
}

/// Assembles a [`Payload`]. The content digest is available before a bundle
/// id is assigned, which is what retransmission detection compares.
#[derive(Clone, Debug, Default)]
pub struct PayloadBuilder {
    bundle_id: Option<BundleId>,
    ack_record: AckRecord,
    adus: Vec<Adu>,
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bundle_id(mut self, bundle_id: BundleId) -> Self {
        self.bundle_id = Some(bundle_id);
        self
    }

    pub fn ack_record(mut self, ack_record: AckRecord) -> Self {
        self.ack_record = ack_record;
        self
    }

    pub fn adus(mut self, adus: Vec<Adu>) -> Self {
        self.adus = adus;
        self
    }

    pub fn current_bundle_id(&self) -> Option<&BundleId> {
        self.bundle_id.as_ref()
    }

    pub fn content_digest(&self) -> String {
        content_digest(&self.ack_record, &self.adus)
    }

    pub fn build(self) -> Result<Payload, Error> {
        let bundle_id = self
            .bundle_id
            .ok_or_else(|| Error::BundleMalformed("Payload has no bundle id".to_string()))?;
        Ok(Payload {
            bundle_id,
            ack_record: self.ack_record,
            adus: self.adus,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Direction;

    fn bundle_id(counter: u64) -> BundleId {
        BundleId::new("AAAAAAAAAAAAAAAAAAAAAA", counter, Direction::Upstream).unwrap()
    }

    #[test]
    fn test_digest_ignores_adu_order_and_bundle_id() {
        let a = Adu::new("chat", 1, b"one".to_vec());
        let b = Adu::new("chat", 2, b"two".to_vec());
        let c = Adu::new("mail", 1, b"three".to_vec());

        let first = PayloadBuilder::new()
            .adus(vec![c.clone(), a.clone(), b.clone()])
            .bundle_id(bundle_id(1));
        let second = PayloadBuilder::new()
            .adus(vec![a.clone(), b.clone(), c.clone()])
            .bundle_id(bundle_id(2));
        assert_eq!(first.content_digest(), second.content_digest());

        let acked = PayloadBuilder::new()
            .adus(vec![a, b, c])
            .ack_record(AckRecord::Bundle(bundle_id(9)));
        assert_ne!(first.content_digest(), acked.content_digest());
    }

    #[test]
    fn test_payload_encoding_is_canonical() {
        let payload = PayloadBuilder::new()
            .bundle_id(bundle_id(3))
            .ack_record(AckRecord::Bundle(bundle_id(2)))
            .adus(vec![
                Adu::new("mail", 4, vec![4]),
                Adu::new("chat", 9, vec![9]),
            ])
            .build()
            .unwrap();

        let decoded = Payload::from_bytes(&payload.to_bytes()).unwrap();
        assert_eq!(decoded.bundle_id(), payload.bundle_id());
        assert_eq!(decoded.ack_record(), payload.ack_record());
        assert_eq!(decoded.adus()[0].app_id, "chat");
        assert_eq!(decoded.to_bytes(), payload.to_bytes());
    }

    #[test]
    fn test_ack_record_sentinel() {
        assert_eq!(AckRecord::parse("HB").unwrap(), AckRecord::Heartbeat);
        assert_eq!(AckRecord::parse("").unwrap(), AckRecord::Heartbeat);
        assert_eq!(AckRecord::default().as_str(), HEARTBEAT);
        assert!(AckRecord::parse("not base64!").is_err());
    }

    #[test]
    fn test_build_requires_bundle_id() {
        assert!(matches!(
            PayloadBuilder::new().build(),
            Err(Error::BundleMalformed(_))
        ));
    }
}
