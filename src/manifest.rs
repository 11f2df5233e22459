//! Manifest v2 schema 2 and image configuration data model
//!
//! Reference: <https://docs.docker.com/registry/spec/manifest-v2-2/>

use crate::{errors::ImageError, image::ContentDigest};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod media_types {
    pub const MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const RUNTIME_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const LAYER_TAR_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
    pub const LAYER_TAR: &str = "application/vnd.docker.image.rootfs.diff.tar";
}

/// Reference to a blob: media type, size, and content digest
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: u64,
    pub digest: ContentDigest,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ManifestSchema {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    media_type: Option<String>,
    config: Descriptor,
    layers: Vec<Descriptor>,
}

/// A deserialized image manifest that remembers its canonical encoding
///
/// The raw JSON bytes are preserved exactly as stored or received, so the
/// manifest digest can be verified and reproduced byte for byte.
#[derive(Clone, Debug)]
pub struct Manifest {
    schema: ManifestSchema,
    raw: Vec<u8>,
}

impl Manifest {
    /// Decode a manifest, retaining `raw` as its canonical form
    pub fn from_raw(raw: Vec<u8>) -> Result<Self, ImageError> {
        let schema: ManifestSchema = serde_json::from_slice(&raw)?;
        if schema.schema_version != 2 {
            return Err(ImageError::IllegalFormat(format!(
                "only schema version 2 manifests are supported, found {}",
                schema.schema_version
            )));
        }
        Ok(Manifest { schema, raw })
    }

    /// Assemble a new manifest from a config descriptor and layer list
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Result<Self, ImageError> {
        let schema = ManifestSchema {
            schema_version: 2,
            media_type: Some(media_types::MANIFEST.to_owned()),
            config,
            layers,
        };
        let raw = serde_json::to_vec(&schema)?;
        Ok(Manifest { schema, raw })
    }

    /// The canonical JSON bytes of this manifest
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Digest of the canonical JSON bytes
    pub fn digest(&self) -> ContentDigest {
        ContentDigest::from_content(&self.raw)
    }

    pub fn media_type(&self) -> &str {
        self.schema
            .media_type
            .as_deref()
            .unwrap_or(media_types::MANIFEST)
    }

    pub fn config(&self) -> &Descriptor {
        &self.schema.config
    }

    pub fn layers(&self) -> &[Descriptor] {
        &self.schema.layers
    }

    /// Every descriptor this manifest references: the config, then each
    /// layer in order
    pub fn descriptors(&self) -> impl Iterator<Item = &Descriptor> {
        std::iter::once(&self.schema.config).chain(self.schema.layers.iter())
    }
}

pub const FS_TYPE: &str = "layers";

/// Decoded image configuration blob
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_version: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[serde(default)]
    pub config: ImageConfig,
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
}

/// Runtime configuration carried inside [ConfigFile]
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(rename = "User", default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    #[serde(rename = "Labels", default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(rename = "Shell", default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<Vec<String>>,
    #[serde(rename = "Healthcheck", default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthConfig>,
}

/// Docker `HEALTHCHECK` settings; durations are nanoseconds
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(rename = "Test", default, skip_serializing_if = "Vec::is_empty")]
    pub test: Vec<String>,
    #[serde(rename = "Interval", default, skip_serializing_if = "is_zero_i64")]
    pub interval: i64,
    #[serde(rename = "Timeout", default, skip_serializing_if = "is_zero_i64")]
    pub timeout: i64,
    #[serde(rename = "StartPeriod", default, skip_serializing_if = "is_zero_i64")]
    pub start_period: i64,
    #[serde(rename = "Retries", default, skip_serializing_if = "is_zero_u32")]
    pub retries: u32,
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub diff_ids: Vec<ContentDigest>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST_JSON: &str = concat!(
        r#"{"schemaVersion":2,"#,
        r#""mediaType":"application/vnd.docker.distribution.manifest.v2+json","#,
        r#""config":{"mediaType":"application/vnd.docker.container.image.v1+json","#,
        r#""size":1469,"#,
        r#""digest":"sha256:c059bfaa849c4d8e4aecaeb3a10c2d9b3d85f5165c66ad3a4d937758128c4d18"},"#,
        r#""layers":[{"mediaType":"application/vnd.docker.image.rootfs.diff.tar.gzip","#,
        r#""size":2818413,"#,
        r#""digest":"sha256:9d16cba9fb961d1aafec9542f2bf7cb64acfc55245f9e4eb5abecd4cdc38d749"}]}"#,
    );

    #[test]
    fn manifest_preserves_raw_bytes() {
        let manifest = Manifest::from_raw(MANIFEST_JSON.as_bytes().to_vec()).unwrap();
        assert_eq!(manifest.raw(), MANIFEST_JSON.as_bytes());
        assert_eq!(manifest.layers().len(), 1);
        assert_eq!(manifest.config().size, 1469);
        assert_eq!(manifest.media_type(), media_types::MANIFEST);
        assert_eq!(
            manifest.digest(),
            ContentDigest::from_content(MANIFEST_JSON.as_bytes())
        );
    }

    #[test]
    fn manifest_rejects_other_schema_versions() {
        let raw = MANIFEST_JSON.replace("\"schemaVersion\":2", "\"schemaVersion\":1");
        assert!(Manifest::from_raw(raw.into_bytes()).is_err());
    }

    #[test]
    fn built_manifest_round_trips() {
        let manifest = Manifest::from_raw(MANIFEST_JSON.as_bytes().to_vec()).unwrap();
        let rebuilt =
            Manifest::new(manifest.config().clone(), manifest.layers().to_vec()).unwrap();
        let reloaded = Manifest::from_raw(rebuilt.raw().to_vec()).unwrap();
        assert_eq!(rebuilt.raw(), reloaded.raw());
        assert_eq!(rebuilt.digest(), reloaded.digest());
    }

    #[test]
    fn config_file_defaults() {
        let cfg: ConfigFile = serde_json::from_str(
            r#"{"architecture":"amd64","os":"linux",
                "config":{"Env":["PATH=/usr/bin"],"Cmd":["/bin/sh"]},
                "rootfs":{"type":"layers","diff_ids":[
                  "sha256:8d3ac3489996423f53d6087c81180006263b79f206d3fdec9e66f0e27ceb8759"]}}"#,
        )
        .unwrap();
        assert_eq!(cfg.architecture, "amd64");
        assert_eq!(cfg.config.env, vec!["PATH=/usr/bin"]);
        assert_eq!(cfg.config.cmd.as_deref(), Some(&["/bin/sh".to_owned()][..]));
        assert_eq!(cfg.config.entrypoint, None);
        assert_eq!(cfg.rootfs.fs_type, FS_TYPE);
        assert_eq!(cfg.rootfs.diff_ids.len(), 1);
        assert!(cfg.history.is_empty());
    }

    #[test]
    fn history_serialization_omits_false_empty_layer() {
        let h = History {
            created: Some("2024-01-01T00:00:00Z".to_owned()),
            created_by: Some("ENV A=1".to_owned()),
            empty_layer: true,
        };
        let json = serde_json::to_string(&h).unwrap();
        assert!(json.contains("empty_layer"));

        let h = History {
            empty_layer: false,
            ..h
        };
        let json = serde_json::to_string(&h).unwrap();
        assert!(!json.contains("empty_layer"));
    }
}
