//! Content-addressed blob storage keyed by digest

use crate::{
    cancel::CancelToken,
    errors::ImageError,
    image::ContentDigest,
    manifest::Descriptor,
    storage::path::{safe_write, PathStore, TempFile},
};
use sha2::{Digest, Sha256};
use std::{
    io,
    io::{Read, Write},
    path::PathBuf,
    sync::Arc,
};

const COPY_CHUNK: usize = 64 * 1024;

/// Blob storage on top of a [PathStore]
///
/// Blobs are immutable once written: they are created by pulls and builds,
/// deduplicated by existence checks, and only ever deleted by the garbage
/// collector.
#[derive(Clone)]
pub struct BlobStore {
    store: Arc<dyn PathStore>,
}

impl BlobStore {
    pub fn new(store: Arc<dyn PathStore>) -> Self {
        BlobStore { store }
    }

    /// File name suffix implied by a descriptor's media type
    pub fn suffix_for(media_type: &str) -> &'static str {
        if media_type.ends_with("+json") {
            ".json"
        } else if media_type.ends_with(".tar.gzip") {
            ".tar.gz"
        } else if media_type.ends_with(".tar") {
            ".tar"
        } else {
            ".bin"
        }
    }

    /// Relative path of a blob: `<algorithm>/<hex[0:2]>/<hex[2:]><suffix>`
    pub fn blob_path(desc: &Descriptor) -> PathBuf {
        BlobStore::blob_path_with(&desc.digest, BlobStore::suffix_for(&desc.media_type))
    }

    /// Like [BlobStore::blob_path] but with an explicit suffix, used for
    /// sidecar files such as decoded `.tree` caches
    pub fn blob_path_with(digest: &ContentDigest, suffix: &str) -> PathBuf {
        let hex = digest.hex_str();
        PathBuf::from(digest.algorithm_str())
            .join(&hex[..2])
            .join(format!("{}{}", &hex[2..], suffix))
    }

    pub fn open(&self, desc: &Descriptor) -> Result<Box<dyn Read + Send>, ImageError> {
        match self.store.open(&BlobStore::blob_path(desc)) {
            Ok(reader) => Ok(reader),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(ImageError::NotFound(format!("blob {}", desc.digest)))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn read(&self, desc: &Descriptor) -> Result<Vec<u8>, ImageError> {
        let mut data = Vec::with_capacity(desc.size as usize);
        self.open(desc)?.read_to_end(&mut data)?;
        Ok(data)
    }

    pub fn has(&self, desc: &Descriptor) -> bool {
        match self.store.stat(&BlobStore::blob_path(desc)) {
            Ok(info) => !info.is_dir,
            Err(_) => false,
        }
    }

    pub fn remove(&self, desc: &Descriptor) -> Result<(), ImageError> {
        Ok(self.store.remove(&BlobStore::blob_path(desc))?)
    }

    /// Begin streaming a blob whose descriptor is already known
    ///
    /// The writer hashes everything written through it; the digest is not
    /// verified here, callers compare it against the descriptor after
    /// [BlobWriter::commit].
    pub fn writer(&self, desc: &Descriptor) -> Result<BlobWriter, ImageError> {
        let dest = BlobStore::blob_path(desc);
        Ok(BlobWriter {
            temp: TempFile::create(&self.store, &dest)?,
            hasher: Sha256::new(),
            size: 0,
            dest,
        })
    }

    /// Stream `reader` into the store under `desc`'s blob name
    ///
    /// Returns the digest actually observed on the stream without
    /// verifying it against `desc`.
    pub fn put_stream(
        &self,
        desc: &Descriptor,
        reader: &mut dyn Read,
        cancel: &CancelToken,
    ) -> Result<ContentDigest, ImageError> {
        let mut writer = self.writer(desc)?;
        let mut chunk = [0u8; COPY_CHUNK];
        loop {
            cancel.check()?;
            let count = reader.read(&mut chunk)?;
            if count == 0 {
                break;
            }
            writer.write_all(&chunk[..count])?;
        }
        let (_, digest) = writer.commit()?;
        Ok(digest)
    }

    /// Store small blob contents already held in memory
    pub fn put_bytes(&self, desc: &Descriptor, data: &[u8]) -> Result<(), ImageError> {
        if self.has(desc) {
            return Ok(());
        }
        safe_write(&self.store, &BlobStore::blob_path(desc), |w| {
            w.write_all(data)?;
            Ok(())
        })
    }

    /// Read a sidecar file stored next to a blob, if present
    pub fn read_sidecar(
        &self,
        digest: &ContentDigest,
        suffix: &str,
    ) -> Result<Option<Vec<u8>>, ImageError> {
        match self.store.open(&BlobStore::blob_path_with(digest, suffix)) {
            Ok(mut reader) => {
                let mut data = Vec::new();
                reader.read_to_end(&mut data)?;
                Ok(Some(data))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Atomically write a sidecar file next to a blob
    pub fn write_sidecar(
        &self,
        digest: &ContentDigest,
        suffix: &str,
        data: &[u8],
    ) -> Result<(), ImageError> {
        safe_write(&self.store, &BlobStore::blob_path_with(digest, suffix), |w| {
            w.write_all(data)?;
            Ok(())
        })
    }

    /// Begin a free-standing temp file for content whose digest is not yet
    /// known; commit it later with [BlobStore::promote]
    pub fn temp(&self, label: &str) -> Result<TempFile, ImageError> {
        TempFile::create(&self.store, std::path::Path::new(label))
    }

    /// Move a finished temp file to its blob name
    pub fn promote(&self, temp: TempFile, desc: &Descriptor) -> Result<(), ImageError> {
        let dest = BlobStore::blob_path(desc);
        if let Some(parent) = dest.parent() {
            self.store.mkdir_all(parent)?;
        }
        temp.commit(&dest)
    }
}

/// Streaming writer for one blob: temp file plus running sha256
pub struct BlobWriter {
    temp: TempFile,
    hasher: Sha256,
    size: u64,
    dest: PathBuf,
}

impl BlobWriter {
    /// Flush, rename into place, and report `(size, observed digest)`
    pub fn commit(mut self) -> Result<(u64, ContentDigest), ImageError> {
        self.temp.flush()?;
        let digest = ContentDigest::from_hash_bytes("sha256", &self.hasher.finalize())?;
        self.temp.commit(&self.dest)?;
        Ok((self.size, digest))
    }
}

impl Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.temp.write(buf)?;
        self.hasher.update(&buf[..count]);
        self.size += count as u64;
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.temp.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{manifest::media_types, storage::path::MemStore};

    fn blob_store() -> BlobStore {
        BlobStore::new(Arc::new(MemStore::new()))
    }

    fn descriptor_for(data: &[u8], media_type: &str) -> Descriptor {
        Descriptor {
            media_type: media_type.to_owned(),
            size: data.len() as u64,
            digest: ContentDigest::from_content(data),
        }
    }

    #[test]
    fn media_type_suffixes() {
        assert_eq!(BlobStore::suffix_for(media_types::RUNTIME_CONFIG), ".json");
        assert_eq!(BlobStore::suffix_for(media_types::LAYER_TAR_GZIP), ".tar.gz");
        assert_eq!(BlobStore::suffix_for(media_types::LAYER_TAR), ".tar");
        assert_eq!(BlobStore::suffix_for("application/octet-stream"), ".bin");
    }

    #[test]
    fn blob_path_shape() {
        let desc = descriptor_for(b"cat", media_types::LAYER_TAR_GZIP);
        let path = BlobStore::blob_path(&desc);
        let hex = desc.digest.hex_str();
        assert_eq!(
            path,
            PathBuf::from("sha256")
                .join(&hex[..2])
                .join(format!("{}.tar.gz", &hex[2..]))
        );
    }

    #[test]
    fn put_stream_and_read_back() {
        let blobs = blob_store();
        let cancel = CancelToken::new();
        let data = b"some layer bytes".to_vec();
        let desc = descriptor_for(&data, media_types::LAYER_TAR_GZIP);

        assert!(!blobs.has(&desc));
        let observed = blobs
            .put_stream(&desc, &mut io::Cursor::new(data.clone()), &cancel)
            .unwrap();
        assert_eq!(observed, desc.digest);
        assert!(blobs.has(&desc));
        assert_eq!(blobs.read(&desc).unwrap(), data);
    }

    #[test]
    fn put_stream_reports_wrong_digest() {
        let blobs = blob_store();
        let cancel = CancelToken::new();
        let desc = descriptor_for(b"expected", media_types::LAYER_TAR_GZIP);
        let observed = blobs
            .put_stream(&desc, &mut io::Cursor::new(b"tampered".to_vec()), &cancel)
            .unwrap();
        assert_ne!(observed, desc.digest);
    }

    #[test]
    fn open_missing_blob_is_not_found() {
        let blobs = blob_store();
        let desc = descriptor_for(b"nothing", media_types::RUNTIME_CONFIG);
        let err = match blobs.open(&desc) {
            Err(e) => e,
            Ok(_) => panic!("expected open() to fail for missing blob"),
        };
        assert!(err.is_not_found());
    }

    #[test]
    fn cancelled_put_stream_leaves_no_blob() {
        let blobs = blob_store();
        let cancel = CancelToken::new();
        cancel.cancel();
        let desc = descriptor_for(b"data", media_types::LAYER_TAR_GZIP);
        let err = blobs
            .put_stream(&desc, &mut io::Cursor::new(b"data".to_vec()), &cancel)
            .unwrap_err();
        assert!(matches!(err, ImageError::Cancelled));
        assert!(!blobs.has(&desc));
    }
}
