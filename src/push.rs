//! Uploading stored images back to a registry

use crate::{cancel::CancelToken, errors::ImageError, image::ImageName, state::State};

impl State {
    /// Upload each image's missing blobs, then its manifest
    ///
    /// The manifest goes last so the registry never advertises an image
    /// whose blobs are not fully present.
    pub async fn push(&self, images: &[ImageName], cancel: &CancelToken) -> Result<(), ImageError> {
        for image in images {
            cancel.check()?;
            let manifest = self.index().load(image)?.ok_or_else(|| {
                ImageError::IllegalArgument(format!("can't find manifest for: {}", image))
            })?;
            let client = self.registry_for(image).await?;
            let repository = image.repository_str();

            for desc in manifest.descriptors() {
                cancel.check()?;
                if client.has_blob(repository, &desc.digest).await? {
                    log::debug!("{} already has {}", image.registry_str(), desc.digest);
                    continue;
                }
                log::info!("{} uploading {} ({} bytes)...", image, desc.digest, desc.size);
                let content = self.blobs().read(desc)?;
                client
                    .upload_blob(repository, &desc.digest, content, cancel)
                    .await?;
            }

            log::info!("{} uploading manifest...", image);
            client
                .put_manifest(
                    repository,
                    image.identifier(),
                    manifest.media_type(),
                    manifest.raw().to_vec(),
                )
                .await?;
        }
        Ok(())
    }
}
