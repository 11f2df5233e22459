//! Exporting images in the `docker save` tar format

use crate::{
    cancel::CancelToken,
    errors::ImageError,
    image::{ContentDigest, ImageName},
    manifest::{media_types, ConfigFile, Descriptor},
    state::State,
};
use flate2::read::GzDecoder;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, BTreeSet},
    io::{Read, Write},
};
use tokio::task;

/// Cache bucket mapping compressed layer digests to unpacked descriptors
pub const BUCKET_UNPACKED: &str = "unpacked.v1";

const COPY_CHUNK: usize = 64 * 1024;

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ManifestItem {
    config: String,
    repo_tags: Vec<String>,
    layers: Vec<String>,
}

impl State {
    /// Stream a Docker-save tar of the given references into `writer`
    ///
    /// The output is deterministic: layer directories in ascending diff-ID
    /// order, then config blobs in ascending digest order, then a single
    /// `manifest.json`. References naming the same config are deduplicated
    /// into one entry whose `RepoTags` lists them all.
    pub async fn save<W: Write + Send + 'static>(
        &self,
        writer: W,
        images: Vec<ImageName>,
        cancel: &CancelToken,
    ) -> Result<W, ImageError> {
        let state = self.clone();
        let cancel = cancel.clone();
        task::spawn_blocking(move || state.save_blocking(writer, &images, &cancel)).await?
    }

    fn save_blocking<W: Write>(
        &self,
        writer: W,
        images: &[ImageName],
        cancel: &CancelToken,
    ) -> Result<W, ImageError> {
        // resolve every reference before writing a single byte
        let mut manifests = Vec::with_capacity(images.len());
        let mut tags: BTreeMap<String, ContentDigest> = BTreeMap::new();
        for image in images {
            let manifest = self.index().load(image)?.ok_or_else(|| {
                ImageError::IllegalArgument(format!("can't find manifest for: {}", image))
            })?;
            tags.insert(image.as_str().to_owned(), manifest.config().digest.clone());
            manifests.push(manifest);
        }

        // every layer needs an uncompressed sibling blob; its digest is
        // the layer's diff ID
        let mut unpacked_by_diff: BTreeMap<ContentDigest, Descriptor> = BTreeMap::new();
        for manifest in &manifests {
            for layer in manifest.layers() {
                cancel.check()?;
                let unpacked = self.unpacked_layer(layer, cancel)?;
                unpacked_by_diff.insert(unpacked.digest.clone(), unpacked);
            }
        }

        let mut configs: BTreeMap<ContentDigest, (Vec<u8>, ConfigFile)> = BTreeMap::new();
        for manifest in &manifests {
            let digest = manifest.config().digest.clone();
            if configs.contains_key(&digest) {
                continue;
            }
            let raw = self.blobs().read(manifest.config())?;
            let cfg: ConfigFile = serde_json::from_slice(&raw)?;
            configs.insert(digest, (raw, cfg));
        }

        let mut queue: BTreeSet<ContentDigest> = BTreeSet::new();
        for (_, cfg) in configs.values() {
            for diff_id in &cfg.rootfs.diff_ids {
                queue.insert(diff_id.clone());
            }
        }

        let mut builder = tar::Builder::new(writer);

        for diff_id in &queue {
            cancel.check()?;
            let unpacked = unpacked_by_diff.get(diff_id).ok_or_else(|| {
                ImageError::IllegalState(format!("can't find unpacked layer: {}", diff_id))
            })?;
            self.write_layer(&mut builder, unpacked, cancel)?;
        }

        for (digest, (raw, _)) in &configs {
            cancel.check()?;
            file_entry(&mut builder, &format!("{}.json", digest.hex_str()), raw)?;
        }

        let mut items = Vec::with_capacity(configs.len());
        for (digest, (_, cfg)) in &configs {
            let mut repo_tags: Vec<String> = tags
                .iter()
                .filter(|(_, tag_digest)| *tag_digest == digest)
                .map(|(name, _)| name.clone())
                .collect();
            repo_tags.sort();
            items.push(ManifestItem {
                config: format!("{}.json", digest.hex_str()),
                repo_tags,
                layers: cfg
                    .rootfs
                    .diff_ids
                    .iter()
                    .map(|diff_id| format!("{}/layer.tar", diff_id.hex_str()))
                    .collect(),
            });
        }
        file_entry(&mut builder, "manifest.json", &serde_json::to_vec(&items)?)?;

        let mut writer = builder.into_inner()?;
        writer.flush()?;
        Ok(writer)
    }

    fn write_layer<W: Write>(
        &self,
        builder: &mut tar::Builder<W>,
        unpacked: &Descriptor,
        cancel: &CancelToken,
    ) -> Result<(), ImageError> {
        cancel.check()?;
        let hex = unpacked.digest.hex_str();

        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_mode(0o755);
        dir.set_size(0);
        dir.set_mtime(0);
        builder.append_data(&mut dir, format!("{}/", hex), std::io::empty())?;

        let mut file = tar::Header::new_gnu();
        file.set_entry_type(tar::EntryType::Regular);
        file.set_mode(0o644);
        file.set_size(unpacked.size);
        file.set_mtime(0);
        let reader = self.blobs().open(unpacked)?;
        builder.append_data(&mut file, format!("{}/layer.tar", hex), reader)?;
        Ok(())
    }

    /// Get or create the uncompressed sibling of a compressed layer
    ///
    /// The descriptor is cached under [BUCKET_UNPACKED] keyed by the
    /// compressed digest; the blob itself lives at the unpacked
    /// descriptor's own blob name.
    pub(crate) fn unpacked_layer(
        &self,
        layer: &Descriptor,
        cancel: &CancelToken,
    ) -> Result<Descriptor, ImageError> {
        if let Some(unpacked) = self.unpacked_descriptor(layer)? {
            return Ok(unpacked);
        }

        log::info!("unpacking layer {}...", layer.digest);
        let mut decoder = GzDecoder::new(self.blobs().open(layer)?);
        let mut temp = self.blobs().temp("unpacked.tar")?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut chunk = [0u8; COPY_CHUNK];
        loop {
            cancel.check()?;
            let count = decoder.read(&mut chunk)?;
            if count == 0 {
                break;
            }
            temp.write_all(&chunk[..count])?;
            hasher.update(&chunk[..count]);
            size += count as u64;
        }

        let unpacked = Descriptor {
            media_type: media_types::LAYER_TAR.to_owned(),
            size,
            digest: ContentDigest::from_hash_bytes("sha256", &hasher.finalize())?,
        };
        self.blobs().promote(temp, &unpacked)?;
        self.cache().save(
            BUCKET_UNPACKED,
            layer.digest.as_str(),
            &serde_json::to_vec(&unpacked)?,
        )?;
        Ok(unpacked)
    }

    /// The cached unpacked descriptor for a layer, if both the record and
    /// the blob still exist; never creates one
    pub(crate) fn unpacked_descriptor(
        &self,
        layer: &Descriptor,
    ) -> Result<Option<Descriptor>, ImageError> {
        match self.cache().load(BUCKET_UNPACKED, layer.digest.as_str())? {
            Some(raw) => match serde_json::from_slice::<Descriptor>(&raw) {
                Ok(unpacked) if self.blobs().has(&unpacked) => Ok(Some(unpacked)),
                _ => Ok(None),
            },
            None => Ok(None),
        }
    }
}

fn file_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
) -> Result<(), ImageError> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(data.len() as u64);
    header.set_mtime(0);
    builder.append_data(&mut header, name, data)?;
    Ok(())
}
