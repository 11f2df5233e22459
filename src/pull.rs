//! Pulling manifests and blobs from a registry into the local store

use crate::{
    cancel::CancelToken,
    errors::ImageError,
    image::{ContentDigest, ImageName},
    manifest::{Descriptor, Manifest},
    state::State,
};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::task;

impl State {
    /// Ensure a reference's manifest and every blob it names are local
    ///
    /// With `allow_cached`, a manifest already in the index short-circuits
    /// the network fetch; blobs present in the store are never downloaded
    /// again, so a repeated pull is a no-op. Blob downloads are verified
    /// against their descriptor digest while streaming, and run
    /// concurrently.
    pub async fn pull(
        &self,
        image: &ImageName,
        allow_cached: bool,
        cancel: &CancelToken,
    ) -> Result<Manifest, ImageError> {
        cancel.check()?;
        let cached = if allow_cached {
            self.index().load(image)?
        } else {
            None
        };
        let manifest = match cached {
            Some(manifest) => manifest,
            None => self.fetch_manifest(image, cancel).await?,
        };

        let mut downloads = FuturesUnordered::new();
        for desc in manifest.descriptors() {
            if self.blobs().has(desc) {
                continue;
            }
            let state = self.clone();
            let image = image.clone();
            let desc = desc.clone();
            let cancel = cancel.clone();
            downloads.push(task::spawn(async move {
                state.download_blob(&image, &desc, &cancel).await
            }));
        }
        while let Some(joined) = downloads.next().await {
            joined??;
        }
        Ok(manifest)
    }

    async fn fetch_manifest(
        &self,
        image: &ImageName,
        cancel: &CancelToken,
    ) -> Result<Manifest, ImageError> {
        let client = self.registry_for(image).await?;
        log::info!("{} downloading manifest...", image);
        let raw = client
            .fetch_manifest(image.repository_str(), image.version_str(), cancel)
            .await?;
        if let Some(expected) = image.content_digest() {
            let found = ContentDigest::from_content(&raw);
            if &found != expected {
                return Err(ImageError::ContentDigestMismatch {
                    expected: expected.clone(),
                    found,
                });
            }
        }
        log::trace!("raw json manifest, {}", String::from_utf8_lossy(&raw));
        let manifest = Manifest::from_raw(raw)?;
        self.index().save(image, &manifest)?;
        Ok(manifest)
    }

    async fn download_blob(
        &self,
        image: &ImageName,
        desc: &Descriptor,
        cancel: &CancelToken,
    ) -> Result<(), ImageError> {
        let client = self.registry_for(image).await?;
        log::info!("{} downloading {} ({} bytes)...", image, desc.digest, desc.size);
        let mut writer = self.blobs().writer(desc)?;
        client
            .fetch_blob(image.repository_str(), &desc.digest, &mut writer, cancel)
            .await?;
        let (size, found) = writer.commit()?;
        if found != desc.digest {
            // the blob landed under the descriptor's name with the wrong
            // content; take it back out before failing
            self.blobs().remove(desc)?;
            return Err(ImageError::ContentDigestMismatch {
                expected: desc.digest.clone(),
                found,
            });
        }
        log::debug!("{} downloaded, {} bytes", desc.digest, size);
        Ok(())
    }
}
