//! Daemonless, client-side container image builder and registry client
//!
//! porter pulls OCI/Docker v2 images from remote registries into a local
//! content-addressed store, builds new images from Dockerfiles by layering
//! a filesystem delta over a base image, pushes built images back to
//! registries, and exports images in the `docker save` tar format. Each
//! invocation constructs one [State] and runs exactly one operation; there
//! is no long-running server.

#[macro_use] extern crate lazy_static;

mod build;
mod cancel;
mod config;
mod errors;
mod filesystem;
mod image;
mod images;
mod index;
mod manifest;
mod pull;
mod push;
mod registry;
mod remove;
mod save;
mod state;
mod storage;

pub use crate::{
    build::{BuildArgs, BuildContext},
    cancel::CancelToken,
    config::{AuthConfig, Config},
    errors::ImageError,
    filesystem::{LayerFS, NodeKind, TreeNode},
    image::{ContentDigest, ImageName},
    images::{human_size, ImageInspect, ImageSummary},
    index::ImageIndex,
    manifest::{media_types, ConfigFile, Descriptor, HealthConfig, Manifest},
    registry::{HttpRegistryClient, RegistryClient},
    state::{default_cache_dir, default_config_file, resolve_path, State, StateSettings},
    storage::{BlobStore, KeyValueCache, MemStore, OsStore, OverlayStore, PathStore},
};
