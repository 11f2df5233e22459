//! Building images from Dockerfiles

mod context;
pub mod dockerfile;
pub mod stage;

pub use context::BuildContext;

use crate::{
    cancel::CancelToken, errors::ImageError, image::ContentDigest, image::ImageName,
    state::State,
};
use std::{fs, io, path::Path, path::PathBuf};

/// Options for one `build` invocation
#[derive(Clone, Debug, Default)]
pub struct BuildArgs {
    /// Dockerfile location; defaults to `<context>/Dockerfile`
    pub dockerfile: Option<PathBuf>,
    /// Reference to store the result under
    pub tag: Option<String>,
    /// Stage to build instead of the last one
    pub target: Option<String>,
    /// Target platform, `os[/arch]`
    pub platform: Option<String>,
}

impl State {
    /// Build an image from a Dockerfile and a host context directory
    ///
    /// Returns the digest of the new image configuration. When a tag is
    /// given the manifest is also stored in the local index under it.
    pub async fn build(
        &self,
        args: &BuildArgs,
        context_path: &Path,
        cancel: &CancelToken,
    ) -> Result<ContentDigest, ImageError> {
        let dockerfile = args
            .dockerfile
            .clone()
            .unwrap_or_else(|| context_path.join("Dockerfile"));
        let file = fs::File::open(&dockerfile).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                ImageError::IllegalArgument(format!("can't open Dockerfile: {:?}", dockerfile))
            } else {
                err.into()
            }
        })?;

        let instructions = dockerfile::parse(io::BufReader::new(file))?;
        let stages = stage::split_stages(instructions)?;
        let resolved = stage::select_target(stages, args.target.as_deref())?;

        let platform = args
            .platform
            .as_deref()
            .or(resolved.platform.as_deref());
        let mut context =
            BuildContext::for_base(self, &resolved.base, platform, context_path, cancel).await?;
        for instruction in &resolved.commands {
            cancel.check()?;
            context.apply_command(instruction, cancel)?;
        }

        let manifest = context.into_manifest(cancel)?;
        if let Some(tag) = &args.tag {
            self.index().save(&ImageName::parse(tag)?, &manifest)?;
        }
        Ok(manifest.config().digest.clone())
    }
}
