//! Removing image records and collecting unreferenced files

use crate::{
    cancel::CancelToken,
    errors::ImageError,
    image::ImageName,
    index::BUCKET_MANIFEST,
    save::BUCKET_UNPACKED,
    state::State,
    storage::{BlobStore, KeyValueCache},
};
use std::{collections::HashSet, path::PathBuf, time::SystemTime};

impl State {
    /// Drop manifest records and garbage collect everything they alone
    /// referenced
    ///
    /// After removing the records, every file under the state root that is
    /// not reachable from a surviving manifest is deleted. Temporary files
    /// (`name~N`) younger than the configured grace period are spared so
    /// an in-flight writer is not raced.
    pub async fn remove(
        &self,
        images: &[ImageName],
        cancel: &CancelToken,
    ) -> Result<(), ImageError> {
        for image in images {
            cancel.check()?;
            self.index().remove(image)?;
        }
        self.collect_garbage(cancel)
    }

    fn collect_garbage(&self, cancel: &CancelToken) -> Result<(), ImageError> {
        let files = self.find_all_files(cancel)?;
        let used = self.used_files(cancel)?;
        let min_age = self.min_temporary_age();
        let now = SystemTime::now();

        for (path, modified) in files {
            cancel.check()?;
            if used.contains(&path) {
                log::debug!("{:?} - keep", path);
                continue;
            }
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            if name.contains('~') {
                let age = now
                    .duration_since(modified)
                    .unwrap_or_default();
                if age < min_age {
                    log::debug!("{:?} - sparing young temporary file", path);
                    continue;
                }
            }
            log::info!("{:?} - remove", path);
            match self.store().remove(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Every file under the state root, breadth first
    fn find_all_files(
        &self,
        cancel: &CancelToken,
    ) -> Result<Vec<(PathBuf, SystemTime)>, ImageError> {
        let mut queue: Vec<PathBuf> = vec![PathBuf::new()];
        let mut result = Vec::new();
        while let Some(dir) = queue.pop() {
            cancel.check()?;
            let items = match self.store().read_dir(&dir) {
                Ok(items) => items,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            for item in items {
                let path = dir.join(&item.name);
                if item.is_dir {
                    queue.push(path);
                } else {
                    result.push((path, item.modified));
                }
            }
        }
        Ok(result)
    }

    /// Every file reachable from the surviving image index
    fn used_files(&self, cancel: &CancelToken) -> Result<HashSet<PathBuf>, ImageError> {
        let mut used: HashSet<PathBuf> = HashSet::new();
        for (image, manifest) in self.index().list()? {
            cancel.check()?;
            used.insert(KeyValueCache::record_path(BUCKET_MANIFEST, image.as_str()));
            used.insert(BlobStore::blob_path(manifest.config()));
            for layer in manifest.layers() {
                used.insert(BlobStore::blob_path(layer));
                used.insert(BlobStore::blob_path_with(&layer.digest, ".tree"));
                used.insert(KeyValueCache::record_path(
                    BUCKET_UNPACKED,
                    layer.digest.as_str(),
                ));
                if let Some(unpacked) = self.unpacked_descriptor(layer)? {
                    used.insert(BlobStore::blob_path(&unpacked));
                }
            }
        }
        Ok(used)
    }
}
