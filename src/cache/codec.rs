//! Cold tier record encoding
//!
//! A record is a one-byte tag followed by the JSON form of the entry,
//! gzip-compressed when the tag says so. Timestamps are carried as wall
//! clock milliseconds since monotonic instants do not survive a process.

use std::io::{Read, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::types::{CacheEntry, CacheKey, Payload};
use crate::error::{CacheError, Result};

const TAG_PLAIN: u8 = 0x00;
const TAG_GZIP: u8 = 0x01;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ColdRecord {
    key: String,
    payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remote_version_hint: Option<String>,
    access_count: u64,
    ttl_ms: u64,
    /// Lifetime left when the record was written
    remaining_ms: u64,
    written_at_ms: u64,
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Encode an entry for the cold tier
pub fn encode(entry: &CacheEntry, now: Instant, compress: bool) -> Result<Vec<u8>> {
    let record = ColdRecord {
        key: entry.key.storage_key(),
        payload: entry.payload.clone(),
        remote_version_hint: entry.remote_version_hint.clone(),
        access_count: entry.access_count,
        ttl_ms: entry.ttl.as_millis() as u64,
        remaining_ms: entry.remaining_ttl(now).as_millis() as u64,
        written_at_ms: wall_clock_ms(),
    };
    let json = serde_json::to_vec(&record)?;

    if !compress {
        let mut out = Vec::with_capacity(json.len() + 1);
        out.push(TAG_PLAIN);
        out.extend_from_slice(&json);
        return Ok(out);
    }

    let mut encoder = GzEncoder::new(vec![TAG_GZIP], Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Decode a cold tier record for `key`
///
/// The returned entry's clock is rebuilt relative to `now` so that the time
/// spent in the cold tier counts against its TTL.
pub fn decode(key: &CacheKey, bytes: &[u8], now: Instant) -> Result<CacheEntry> {
    let (tag, body) = bytes
        .split_first()
        .ok_or_else(|| CacheError::Codec("empty record".to_string()))?;

    let record: ColdRecord = match *tag {
        TAG_PLAIN => serde_json::from_slice(body)?,
        TAG_GZIP => {
            let mut json = Vec::new();
            GzDecoder::new(body)
                .read_to_end(&mut json)
                .map_err(|e| CacheError::Codec(format!("bad gzip body: {}", e)))?;
            serde_json::from_slice(&json)?
        }
        other => return Err(CacheError::Codec(format!("unknown record tag {:#04x}", other))),
    };

    if record.key != key.storage_key() {
        return Err(CacheError::Codec(format!(
            "record for {} found under {}",
            record.key, key
        )));
    }
    if record.payload.kind() != key.kind() {
        return Err(CacheError::Codec(format!("payload kind mismatch for {}", key)));
    }

    let ttl = Duration::from_millis(record.ttl_ms);
    let in_cold_tier = wall_clock_ms().saturating_sub(record.written_at_ms);
    let remaining = Duration::from_millis(record.remaining_ms.saturating_sub(in_cold_tier));
    let age = ttl.saturating_sub(remaining);

    let mut entry = CacheEntry::new(key.clone(), record.payload, ttl, now);
    match now.checked_sub(age) {
        Some(created_at) => entry.created_at = created_at,
        // Monotonic clock too young to express the age
        None => entry.ttl = remaining,
    }
    entry.access_count = record.access_count;
    entry.remote_version_hint = record.remote_version_hint;
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::types::FileContent;

    fn sample(now: Instant) -> CacheEntry {
        let mut entry = CacheEntry::new(
            CacheKey::file("/notes.md"),
            FileContent::new("/notes.md", "# notes").into(),
            Duration::from_secs(60),
            now,
        );
        entry.remote_version_hint = Some("etag-1".to_string());
        entry.access_count = 3;
        entry
    }

    #[test]
    fn test_plain_and_gzip_decode_to_same_entry() {
        let now = Instant::now();
        let entry = sample(now);

        for compress in [false, true] {
            let bytes = encode(&entry, now, compress).unwrap();
            assert_eq!(bytes[0], if compress { TAG_GZIP } else { TAG_PLAIN });

            let decoded = decode(&entry.key, &bytes, now).unwrap();
            assert_eq!(decoded.payload, entry.payload);
            assert_eq!(decoded.remote_version_hint.as_deref(), Some("etag-1"));
            assert_eq!(decoded.access_count, 3);
            assert_eq!(decoded.size_bytes, entry.size_bytes);
        }
    }

    #[test]
    fn test_garbage_is_a_codec_error() {
        let key = CacheKey::file("/x");
        assert!(matches!(decode(&key, b"", Instant::now()), Err(CacheError::Codec(_))));
        assert!(matches!(decode(&key, b"\x00{nope", Instant::now()), Err(CacheError::Codec(_))));
        assert!(matches!(decode(&key, b"\x07{}", Instant::now()), Err(CacheError::Codec(_))));
        assert!(matches!(decode(&key, b"\x01garbage", Instant::now()), Err(CacheError::Codec(_))));
    }

    #[test]
    fn test_record_under_wrong_key_is_rejected() {
        let now = Instant::now();
        let bytes = encode(&sample(now), now, false).unwrap();
        assert!(decode(&CacheKey::directory("/notes.md"), &bytes, now).is_err());
    }
}
