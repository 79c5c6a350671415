use crate::proto::{RecencyBlobProto, RecencyBlobResponseProto, RecencyBlobStatus};
use crate::{Error, IdentityKey, IdentityPublicKey};
use prost::Message;
use std::time::Duration;

pub(crate) const RECENCY_BLOB_VERSION: i32 = 1;

/// Builds a signed recency response asserting that the signer held data
/// as of `timestamp` (milliseconds since the Unix epoch).
pub fn sign_recency_blob(
    identity: &IdentityKey,
    sender_id: &str,
    nonce: i32,
    timestamp: i64,
) -> RecencyBlobResponseProto {
    let blob = RecencyBlobProto {
        version: RECENCY_BLOB_VERSION,
        nonce,
        blob_timestamp: timestamp,
        sender_id: sender_id.to_string(),
    };
    let signature = identity.sign(&blob.encode_to_vec());

    RecencyBlobResponseProto {
        status: RecencyBlobStatus::Success as i32,
        recency_blob: Some(blob),
        recency_blob_signature: signature.to_bytes().to_vec(),
        server_public_key: identity.public().to_bytes().to_vec(),
    }
}

/// Checks that a recency response is successful, not dated beyond
/// `now + skew` and signed by `expected`. Returns the trusted blob.
pub fn validate_recency_blob(
    response: &RecencyBlobResponseProto,
    expected: &IdentityPublicKey,
    now: i64,
    skew: Duration,
) -> Result<RecencyBlobProto, Error> {
    if response.status() != RecencyBlobStatus::Success {
        return Err(Error::RecencyRejected(format!(
            "Recency request failed with status {:?}",
            response.status()
        )));
    }

    let blob = response
        .recency_blob
        .as_ref()
        .ok_or_else(|| Error::RecencyRejected("Response carries no blob".to_string()))?;

    let skew = i64::try_from(skew.as_millis()).unwrap_or(i64::MAX);
    if blob.blob_timestamp > now.saturating_add(skew) {
        return Err(Error::RecencyRejected(format!(
            "Blob timestamp {} is in the future",
            blob.blob_timestamp
        )));
    }

    if response.server_public_key.as_slice() != expected.to_bytes().as_slice() {
        return Err(Error::RecencyRejected(
            "Blob signed by an unknown key".to_string(),
        ));
    }

    expected
        .verify(&blob.encode_to_vec(), &response.recency_blob_signature)
        .map_err(|_| Error::RecencyRejected("Blob signature verification failed".to_string()))?;

    Ok(blob.clone())
}
