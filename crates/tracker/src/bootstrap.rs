//! # Bulk Bootstrap Batches
//!
//! Update batches normally travel inline. During bulk bootstrap or
//! reconciliation a batch can be far too large for one frame, so a sender
//! may park the serialized batch in central storage and publish only a
//! reference; the consumer fetches and decodes it on dispatch. Steady-state
//! correctness never depends on this path.
//!
//! Serialized batch layout (little-endian, one prost message per entry):
//!
//! ```text
//! [entry_count:8][entry_1_len:8][entry_1_bytes]...[entry_n_len:8][entry_n_bytes]
//! ```

use async_trait::async_trait;
use prost::Message;

use dclt_common::{Result, TrackerError};
use dclt_proto::wire::LocationEntry;
use dclt_proto::ContentEntry;

/// A batch of location updates, inline or parked in central storage.
#[derive(Debug, Clone)]
pub enum LocationBatch {
    Inline(Vec<ContentEntry>),
    /// Reference to a serialized batch in central storage.
    Blob { storage_id: String },
}

/// Central storage for oversized batches.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Park a serialized batch; returns its storage id.
    async fn put_batch(&self, serialized: Vec<u8>) -> Result<String>;
    /// Fetch a previously parked batch.
    async fn fetch_batch(&self, storage_id: &str) -> Result<Vec<u8>>;
}

/// Serialize a batch for central storage.
pub fn encode_batch(entries: &[ContentEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for entry in entries {
        let encoded = LocationEntry::from(entry).encode_to_vec();
        out.extend_from_slice(&(encoded.len() as u64).to_le_bytes());
        out.extend_from_slice(&encoded);
    }
    out
}

/// Decode a serialized batch. Truncated or malformed input is `Corrupted`.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<ContentEntry>> {
    let corrupted = |what: &str| TrackerError::corrupted(format!("bootstrap batch: {what}"));

    let mut cursor = 0usize;
    let read_u64 = |cursor: &mut usize| -> Result<u64> {
        let end = cursor
            .checked_add(8)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| corrupted("truncated length"))?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[*cursor..end]);
        *cursor = end;
        Ok(u64::from_le_bytes(buf))
    };

    let count = read_u64(&mut cursor)? as usize;
    let mut entries = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let len = read_u64(&mut cursor)? as usize;
        let end = cursor
            .checked_add(len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| corrupted("truncated entry"))?;
        let wire = LocationEntry::decode(&bytes[cursor..end])
            .map_err(|e| corrupted(&e.to_string()))?;
        let entry = ContentEntry::try_from(&wire).map_err(|e| corrupted(&e.to_string()))?;
        entries.push(entry);
        cursor = end;
    }
    if cursor != bytes.len() {
        return Err(corrupted("trailing bytes"));
    }
    Ok(entries)
}

/// Resolve a batch to its entries, fetching from central storage when it
/// was published as a blob reference.
pub async fn resolve_batch(batch: LocationBatch, store: &dyn BlobStore) -> Result<Vec<ContentEntry>> {
    match batch {
        LocationBatch::Inline(entries) => Ok(entries),
        LocationBatch::Blob { storage_id } => {
            let bytes = store.fetch_batch(&storage_id).await?;
            decode_batch(&bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use dclt_proto::{ChangeStamp, ContentHash, MachineId, StampOperation};

    struct MemoryBlobStore {
        blobs: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl BlobStore for MemoryBlobStore {
        async fn put_batch(&self, serialized: Vec<u8>) -> Result<String> {
            let mut blobs = self.blobs.lock();
            let id = format!("blob-{}", blobs.len());
            blobs.insert(id.clone(), serialized);
            Ok(id)
        }

        async fn fetch_batch(&self, storage_id: &str) -> Result<Vec<u8>> {
            self.blobs
                .lock()
                .get(storage_id)
                .cloned()
                .ok_or_else(|| TrackerError::permanent(format!("no blob {storage_id}")))
        }
    }

    fn entries(n: u64) -> Vec<ContentEntry> {
        (0..n)
            .map(|i| {
                ContentEntry::single(
                    ContentHash::digest(&i.to_be_bytes()),
                    i as i64,
                    MachineId::new(1),
                    ChangeStamp::new(i + 1, chrono::Utc::now(), StampOperation::Add),
                )
            })
            .collect()
    }

    #[test]
    fn test_batch_roundtrip() {
        let batch = entries(17);
        assert_eq!(decode_batch(&encode_batch(&batch)).unwrap(), batch);
    }

    #[test]
    fn test_truncated_batch_is_corrupted() {
        let mut bytes = encode_batch(&entries(3));
        bytes.truncate(bytes.len() - 5);
        let err = decode_batch(&bytes).unwrap_err();
        assert_eq!(err.kind(), dclt_common::ErrorKind::Corrupted);
    }

    #[tokio::test]
    async fn test_blob_reference_resolves_through_store() {
        let store = MemoryBlobStore {
            blobs: Mutex::new(HashMap::new()),
        };
        let batch = entries(5);
        let storage_id = store.put_batch(encode_batch(&batch)).await.unwrap();

        let resolved = resolve_batch(LocationBatch::Blob { storage_id }, &store)
            .await
            .unwrap();
        assert_eq!(resolved, batch);
    }

    #[tokio::test]
    async fn test_inline_batch_needs_no_store() {
        let store = MemoryBlobStore {
            blobs: Mutex::new(HashMap::new()),
        };
        let batch = entries(2);
        let resolved = resolve_batch(LocationBatch::Inline(batch.clone()), &store)
            .await
            .unwrap();
        assert_eq!(resolved, batch);
    }
}
