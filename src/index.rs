//! Local index mapping reference names to stored manifests

use crate::{
    errors::ImageError,
    image::ImageName,
    manifest::Manifest,
    storage::KeyValueCache,
};

/// Cache bucket holding one raw manifest per canonical reference string
pub const BUCKET_MANIFEST: &str = "manifest.v1";

/// The set of images known locally
///
/// A thin layer over [KeyValueCache]: keys are canonical reference
/// strings, values are raw manifest JSON. Saving happens after a pull or a
/// tagged build, removal through `rmi`.
#[derive(Clone)]
pub struct ImageIndex {
    cache: KeyValueCache,
}

impl ImageIndex {
    pub fn new(cache: KeyValueCache) -> Self {
        ImageIndex { cache }
    }

    pub fn load(&self, image: &ImageName) -> Result<Option<Manifest>, ImageError> {
        match self.cache.load(BUCKET_MANIFEST, image.as_str())? {
            Some(raw) => Ok(Some(Manifest::from_raw(raw)?)),
            None => Ok(None),
        }
    }

    pub fn save(&self, image: &ImageName, manifest: &Manifest) -> Result<(), ImageError> {
        self.cache
            .save(BUCKET_MANIFEST, image.as_str(), manifest.raw())
    }

    pub fn remove(&self, image: &ImageName) -> Result<(), ImageError> {
        self.cache.remove(BUCKET_MANIFEST, image.as_str())
    }

    /// Every image known locally, with its manifest
    ///
    /// Records whose key or value no longer parses are skipped with a
    /// warning rather than failing the whole listing.
    pub fn list(&self) -> Result<Vec<(ImageName, Manifest)>, ImageError> {
        let mut images = Vec::new();
        self.cache.for_each(BUCKET_MANIFEST, |key, value| {
            let image = match ImageName::parse(key) {
                Ok(image) => image,
                Err(err) => {
                    log::warn!("skipping malformed index key {:?}: {}", key, err);
                    return Ok(());
                }
            };
            match Manifest::from_raw(value.to_vec()) {
                Ok(manifest) => images.push((image, manifest)),
                Err(err) => log::warn!("skipping malformed manifest for {}: {}", image, err),
            }
            Ok(())
        })?;
        images.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(images)
    }

    /// Copy the manifest record of `source` under the key of `target`
    pub fn tag(&self, source: &ImageName, target: &ImageName) -> Result<(), ImageError> {
        let manifest = self.load(source)?.ok_or_else(|| {
            ImageError::IllegalArgument(format!("can't find manifest for: {}", source))
        })?;
        self.save(target, &manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{KeyValueCache, MemStore};
    use std::sync::Arc;

    const MANIFEST_JSON: &str = concat!(
        r#"{"schemaVersion":2,"#,
        r#""mediaType":"application/vnd.docker.distribution.manifest.v2+json","#,
        r#""config":{"mediaType":"application/vnd.docker.container.image.v1+json","#,
        r#""size":2,"digest":"sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"},"#,
        r#""layers":[]}"#,
    );

    fn index() -> ImageIndex {
        ImageIndex::new(KeyValueCache::new(Arc::new(MemStore::new())))
    }

    #[test]
    fn save_load_list_remove() {
        let index = index();
        let name = ImageName::parse("alpine").unwrap();
        assert!(index.load(&name).unwrap().is_none());

        let manifest = Manifest::from_raw(MANIFEST_JSON.as_bytes().to_vec()).unwrap();
        index.save(&name, &manifest).unwrap();

        let loaded = index.load(&name).unwrap().unwrap();
        assert_eq!(loaded.raw(), manifest.raw());

        let listed = index.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, name);

        index.remove(&name).unwrap();
        assert!(index.load(&name).unwrap().is_none());
        assert!(index.list().unwrap().is_empty());
    }

    #[test]
    fn tag_copies_raw_bytes() {
        let index = index();
        let src = ImageName::parse("alpine").unwrap();
        let dst = ImageName::parse("alpine:other").unwrap();
        let manifest = Manifest::from_raw(MANIFEST_JSON.as_bytes().to_vec()).unwrap();
        index.save(&src, &manifest).unwrap();

        index.tag(&src, &dst).unwrap();
        let a = index.load(&src).unwrap().unwrap();
        let b = index.load(&dst).unwrap().unwrap();
        assert_eq!(a.raw(), b.raw());
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn tag_of_missing_source_fails() {
        let index = index();
        let src = ImageName::parse("ghost").unwrap();
        let dst = ImageName::parse("ghost:copy").unwrap();
        let err = index.tag(&src, &dst).unwrap_err();
        assert!(matches!(err, ImageError::IllegalArgument(_)));
    }
}
