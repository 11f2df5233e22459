//! Small bucketed key-value cache for manifests and layer descriptors

use crate::{
    errors::ImageError,
    storage::path::{safe_write, PathStore},
};
use sha1::{Digest, Sha1};
use std::{
    io,
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

/// Key-value records layered on a [PathStore]
///
/// A record for `(bucket, key)` lives at `<bucket>/<sha1(key)>` and holds
/// `msgpack(key) ++ msgpack(value)`, which keeps records self-describing so
/// [KeyValueCache::for_each] can recover the original keys. Records that
/// fail to decode, or that carry trailing bytes, are treated as absent.
#[derive(Clone)]
pub struct KeyValueCache {
    store: Arc<dyn PathStore>,
}

impl KeyValueCache {
    pub fn new(store: Arc<dyn PathStore>) -> Self {
        KeyValueCache { store }
    }

    /// Relative path of the record file for `(bucket, key)`
    pub fn record_path(bucket: &str, key: &str) -> PathBuf {
        let mut hasher = Sha1::new();
        hasher.update(key.as_bytes());
        PathBuf::from(bucket).join(hex::encode(hasher.finalize()))
    }

    pub fn save(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), ImageError> {
        let payload = encode_record(key, value)?;
        safe_write(&self.store, &KeyValueCache::record_path(bucket, key), |w| {
            w.write_all(&payload)?;
            Ok(())
        })
    }

    pub fn load(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, ImageError> {
        let path = KeyValueCache::record_path(bucket, key);
        let mut reader = match self.store.open(&path) {
            Ok(reader) => reader,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;
        Ok(decode_record(&raw).map(|(_, value)| value))
    }

    pub fn remove(&self, bucket: &str, key: &str) -> Result<(), ImageError> {
        match self.store.remove(&KeyValueCache::record_path(bucket, key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Visit every valid record in a bucket
    ///
    /// Temp files and undecodable records are skipped; an error from the
    /// callback stops the iteration.
    pub fn for_each(
        &self,
        bucket: &str,
        mut f: impl FnMut(&str, &[u8]) -> Result<(), ImageError>,
    ) -> Result<(), ImageError> {
        let items = match self.store.read_dir(Path::new(bucket)) {
            Ok(items) => items,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for item in items {
            if item.is_dir || item.name.contains('~') {
                continue;
            }
            let mut reader = match self.store.open(&Path::new(bucket).join(&item.name)) {
                Ok(reader) => reader,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            let mut raw = Vec::new();
            reader.read_to_end(&mut raw)?;
            if let Some((key, value)) = decode_record(&raw) {
                f(&key, &value)?;
            }
        }
        Ok(())
    }
}

fn encode_record(key: &str, value: &[u8]) -> Result<Vec<u8>, ImageError> {
    let mut payload = Vec::with_capacity(key.len() + value.len() + 16);
    rmp::encode::write_str(&mut payload, key)
        .map_err(|err| ImageError::Internal(format!("msgpack encode error: {}", err)))?;
    rmp::encode::write_bin(&mut payload, value)
        .map_err(|err| ImageError::Internal(format!("msgpack encode error: {}", err)))?;
    Ok(payload)
}

fn decode_record(raw: &[u8]) -> Option<(String, Vec<u8>)> {
    let (key, rest) = rmp::decode::read_str_from_slice(raw).ok()?;
    let mut rd = rest;
    let len = rmp::decode::read_bin_len(&mut rd).ok()? as usize;
    if rd.len() != len {
        // short record, or trailing garbage after the value
        return None;
    }
    Some((key.to_owned(), rd.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::path::MemStore;

    fn cache() -> KeyValueCache {
        KeyValueCache::new(Arc::new(MemStore::new()))
    }

    #[test]
    fn save_load_remove() {
        let cache = cache();
        assert_eq!(cache.load("bucket", "key").unwrap(), None);
        cache.save("bucket", "key", b"value").unwrap();
        assert_eq!(cache.load("bucket", "key").unwrap(), Some(b"value".to_vec()));
        cache.remove("bucket", "key").unwrap();
        assert_eq!(cache.load("bucket", "key").unwrap(), None);
        // removing twice is fine
        cache.remove("bucket", "key").unwrap();
    }

    #[test]
    fn for_each_recovers_keys() {
        let cache = cache();
        cache.save("b", "first", b"1").unwrap();
        cache.save("b", "second", b"2").unwrap();
        cache.save("other", "third", b"3").unwrap();

        let mut seen = Vec::new();
        cache
            .for_each("b", |key, value| {
                seen.push((key.to_owned(), value.to_vec()));
                Ok(())
            })
            .unwrap();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("first".to_owned(), b"1".to_vec()),
                ("second".to_owned(), b"2".to_vec()),
            ]
        );
    }

    #[test]
    fn for_each_of_missing_bucket_is_empty() {
        let cache = cache();
        cache
            .for_each("nothing", |_, _| {
                panic!("no records expected");
            })
            .unwrap();
    }

    #[test]
    fn corrupt_and_temp_records_are_skipped() {
        let store: Arc<dyn PathStore> = Arc::new(MemStore::new());
        let cache = KeyValueCache::new(store.clone());
        cache.save("b", "good", b"ok").unwrap();

        // a record with trailing garbage
        let mut bad = encode_record("bad", b"data").unwrap();
        bad.push(0xc0);
        safe_write(&store, &KeyValueCache::record_path("b", "bad"), |w| {
            w.write_all(&bad)?;
            Ok(())
        })
        .unwrap();

        // not msgpack at all
        safe_write(&store, Path::new("b/0000000000000000000000000000000000000000"), |w| {
            w.write_all(b"junk")?;
            Ok(())
        })
        .unwrap();

        // a stale temp file
        let mut w = store.create_exclusive(Path::new("b/leftover~0")).unwrap();
        w.write_all(b"partial").unwrap();
        drop(w);

        let mut seen = Vec::new();
        cache
            .for_each("b", |key, _| {
                seen.push(key.to_owned());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec!["good"]);

        assert_eq!(cache.load("b", "bad").unwrap(), None);
    }
}
