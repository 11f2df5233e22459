//! Listing and inspecting locally stored images

use crate::{
    errors::ImageError,
    image::{ContentDigest, ImageName},
    manifest::ConfigFile,
    state::State,
};
use serde::Serialize;
use std::collections::BTreeMap;

/// One row of the `images` table
#[derive(Clone, Debug)]
pub struct ImageSummary {
    pub name: ImageName,
    /// Digest of the image configuration
    pub image_id: ContentDigest,
    /// Sum of the compressed layer sizes
    pub size: u64,
}

impl ImageSummary {
    /// The REPOSITORY column: registry and repository path
    pub fn repository(&self) -> String {
        format!("{}/{}", self.name.registry_str(), self.name.repository_str())
    }

    /// The IMAGE ID column: first 12 hex digits of the config digest
    pub fn short_id(&self) -> &str {
        &self.image_id.hex_str()[..12]
    }
}

/// Low-level image information, printed by `inspect` as JSON
#[derive(Clone, Debug, Serialize)]
pub struct ImageInspect {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "RepoTags")]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Created")]
    pub created: String,
    #[serde(rename = "DockerVersion")]
    pub docker_version: String,
    #[serde(rename = "Architecture")]
    pub architecture: String,
    #[serde(rename = "Os")]
    pub os: String,
    #[serde(rename = "Config")]
    pub config: InspectConfig,
    #[serde(rename = "RootFS")]
    pub rootfs: InspectRootFs,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "VirtualSize")]
    pub virtual_size: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct InspectConfig {
    #[serde(rename = "User")]
    pub user: String,
    #[serde(rename = "Env")]
    pub env: Vec<String>,
    #[serde(rename = "Cmd")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Entrypoint")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "WorkingDir")]
    pub working_dir: String,
    #[serde(rename = "Labels")]
    pub labels: Option<BTreeMap<String, String>>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct InspectRootFs {
    #[serde(rename = "Type")]
    pub fs_type: String,
    #[serde(rename = "Layers")]
    pub layers: Vec<String>,
}

impl State {
    /// Summaries of every image in the local index
    pub fn images(&self) -> Result<Vec<ImageSummary>, ImageError> {
        let mut rows = Vec::new();
        for (name, manifest) in self.index().list()? {
            rows.push(ImageSummary {
                image_id: manifest.config().digest.clone(),
                size: manifest.layers().iter().map(|layer| layer.size).sum(),
                name,
            });
        }
        Ok(rows)
    }

    /// Inspect records for the given references, deduplicated by config
    /// digest with their tags merged
    pub fn inspect(&self, images: &[ImageName]) -> Result<Vec<ImageInspect>, ImageError> {
        let mut inspected: Vec<ImageInspect> = Vec::new();
        let mut index_of: BTreeMap<ContentDigest, usize> = BTreeMap::new();
        for image in images {
            let manifest = self.index().load(image)?.ok_or_else(|| {
                ImageError::IllegalArgument(format!("image not found: {}", image))
            })?;
            let digest = manifest.config().digest.clone();
            if let Some(&at) = index_of.get(&digest) {
                inspected[at].repo_tags.push(image.as_str().to_owned());
                continue;
            }

            let cfg: ConfigFile = serde_json::from_slice(&self.blobs().read(manifest.config())?)?;
            let size: u64 = manifest.layers().iter().map(|layer| layer.size).sum();
            index_of.insert(digest.clone(), inspected.len());
            inspected.push(ImageInspect {
                id: digest.to_string(),
                repo_tags: vec![image.as_str().to_owned()],
                created: cfg.created.clone().unwrap_or_default(),
                docker_version: cfg.docker_version.clone().unwrap_or_default(),
                architecture: cfg.architecture.clone(),
                os: cfg.os.clone(),
                config: InspectConfig {
                    user: cfg.config.user.clone(),
                    env: cfg.config.env.clone(),
                    cmd: cfg.config.cmd.clone(),
                    entrypoint: cfg.config.entrypoint.clone(),
                    working_dir: cfg.config.working_dir.clone(),
                    labels: cfg.config.labels.clone(),
                },
                rootfs: InspectRootFs {
                    fs_type: cfg.rootfs.fs_type.clone(),
                    layers: cfg
                        .rootfs
                        .diff_ids
                        .iter()
                        .map(|diff_id| diff_id.to_string())
                        .collect(),
                },
                size,
                virtual_size: size,
            });
        }
        Ok(inspected)
    }
}

/// Format a byte count with decimal units, `humanize`-style
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "kB", "MB", "GB", "TB", "PB"];
    if bytes < 1000 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    let rendered = format!("{:.1}", value);
    let rendered = rendered.strip_suffix(".0").unwrap_or(&rendered);
    format!("{} {}", rendered, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn humanized_sizes() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(999), "999 B");
        assert_eq!(human_size(1000), "1 kB");
        assert_eq!(human_size(2_818_413), "2.8 MB");
        assert_eq!(human_size(5_500_000_000), "5.5 GB");
    }
}
