//! Evaluation of build instructions against a layered filesystem

use crate::{
    build::dockerfile::{CopyArgs, Instruction, KeyValue, ShellArgs},
    cancel::CancelToken,
    errors::ImageError,
    filesystem::{layer_tree, LayerFS, NodeHeader, NodeKind, TreeNode},
    image::{ContentDigest, ImageName},
    manifest::{media_types, ConfigFile, Descriptor, History, Manifest, RootFs, FS_TYPE},
    state::State,
    storage::BlobStore,
};
use chrono::{SecondsFormat, Utc};
use flate2::{write::GzEncoder, Compression};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::{
    collections::VecDeque,
    fs, io,
    io::Write,
    path::{Path, PathBuf},
};

/// Mutable build state: image config, layer list, and the filesystem view
///
/// The base tree is produced by stacking the base image's layers and stays
/// immutable; every filesystem effect of the build lands in the delta,
/// which is flushed into a new layer when the manifest is assembled.
pub struct BuildContext {
    cfg: ConfigFile,
    layers: Vec<Descriptor>,
    fs: LayerFS,
    context_path: PathBuf,
    blobs: BlobStore,
}

impl BuildContext {
    /// Prepare a context for a base image reference, or `scratch`
    pub async fn for_base(
        state: &State,
        base: &str,
        platform: Option<&str>,
        context_path: &Path,
        cancel: &CancelToken,
    ) -> Result<BuildContext, ImageError> {
        if base == "scratch" {
            let (os, architecture) = parse_platform(platform)?;
            let cfg = ConfigFile {
                architecture,
                os,
                created: Some(now()),
                rootfs: RootFs {
                    fs_type: FS_TYPE.to_owned(),
                    diff_ids: Vec::new(),
                },
                ..ConfigFile::default()
            };
            return Ok(BuildContext {
                cfg,
                layers: Vec::new(),
                fs: LayerFS::new(TreeNode::empty_dir()),
                context_path: context_path.to_path_buf(),
                blobs: state.blobs().clone(),
            });
        }

        let image = ImageName::parse(base)?;
        let manifest = state.pull(&image, true, cancel).await?;
        let cfg: ConfigFile = serde_json::from_slice(&state.blobs().read(manifest.config())?)?;

        let mut root = TreeNode::empty_dir();
        for layer in manifest.layers() {
            cancel.check()?;
            let tree = layer_tree(state.blobs(), layer, cancel)?;
            root.apply_diff(&tree);
        }

        Ok(BuildContext {
            cfg,
            layers: manifest.layers().to_vec(),
            fs: LayerFS::new(root),
            context_path: context_path.to_path_buf(),
            blobs: state.blobs().clone(),
        })
    }

    pub fn config(&self) -> &ConfigFile {
        &self.cfg
    }

    /// Apply one instruction, recording a history entry for it
    pub fn apply_command(
        &mut self,
        instruction: &Instruction,
        cancel: &CancelToken,
    ) -> Result<(), ImageError> {
        log::info!("apply command: {}", instruction);
        match instruction {
            Instruction::From(_) => {
                // consumed by stage selection, never evaluated here
                return Ok(());
            }
            Instruction::Env(pairs) => self.apply_env(pairs),
            Instruction::Label(pairs) => {
                let labels = self.cfg.config.labels.get_or_insert_with(Default::default);
                for pair in pairs {
                    labels.insert(pair.key.clone(), pair.value.clone());
                }
            }
            Instruction::Workdir(path) => {
                self.cfg.config.working_dir = path.clone();
            }
            Instruction::Entrypoint(args) => self.apply_entrypoint(args),
            Instruction::Healthcheck(health) => {
                self.cfg.config.healthcheck = Some(health.clone());
            }
            Instruction::Copy(copy) => self.apply_copy(copy, cancel)?,
            Instruction::Cmd(_) | Instruction::Other { .. } => {
                log::error!("unsupported command: {}", instruction);
                return Ok(());
            }
        }
        self.cfg.history.push(History {
            created: Some(now()),
            created_by: Some(instruction.to_string()),
            empty_layer: true,
        });
        Ok(())
    }

    /// Reset keys named by the instruction and append the new pairs in
    /// input order; a key repeated within one instruction keeps only its
    /// last value
    fn apply_env(&mut self, pairs: &[KeyValue]) {
        for pair in pairs {
            self.cfg
                .config
                .env
                .retain(|env| env.split('=').next().unwrap_or(env) != pair.key);
            self.cfg.config.env.push(format!("{}={}", pair.key, pair.value));
        }
    }

    fn apply_entrypoint(&mut self, args: &ShellArgs) {
        let mut cmdline = args.cmdline.clone();
        if args.prepend_shell {
            let shell = match &self.cfg.config.shell {
                Some(shell) if !shell.is_empty() => shell.clone(),
                _ => vec!["/bin/sh".to_owned(), "-c".to_owned()],
            };
            cmdline = shell.into_iter().chain(cmdline).collect();
        }
        self.cfg.config.cmd = None;
        self.cfg.config.entrypoint = Some(cmdline);
    }

    fn apply_copy(&mut self, copy: &CopyArgs, cancel: &CancelToken) -> Result<(), ImageError> {
        if copy.from.is_some() {
            return Err(ImageError::NotImplemented("COPY --from".to_owned()));
        }
        let chown = parse_chown(copy.chown.as_deref())?;

        let mut dst = copy.dest.clone();
        if !dst.starts_with('/') {
            dst = format!("{}/{}", self.cfg.config.working_dir, dst);
        }
        let dst = format!("/{}", dst.trim_start_matches('/'));
        let resolved = self.fs.eval_symlinks(&dst)?;
        let mut dir_dest = dst.ends_with('/');
        if let Some(node) = self.fs.get(&resolved) {
            if node.header.kind.is_dir() {
                dir_dest = true;
            }
        }

        for source in &copy.sources {
            cancel.check()?;
            let host = if Path::new(source).is_absolute() {
                PathBuf::from(source)
            } else {
                self.context_path.join(source)
            };
            let meta = fs::symlink_metadata(&host).map_err(|err| {
                if err.kind() == io::ErrorKind::NotFound {
                    ImageError::IllegalArgument(format!("COPY source not found: {}", source))
                } else {
                    err.into()
                }
            })?;

            if meta.is_dir() {
                if !dir_dest {
                    return Err(ImageError::IllegalArgument(format!(
                        "COPY of directory {} needs a directory destination: {}",
                        source, copy.dest
                    )));
                }
                self.copy_host_tree(&host, &resolved, chown, cancel)?;
            } else {
                let target = if dir_dest {
                    let base = host
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .ok_or_else(|| {
                            ImageError::IllegalArgument(format!("bad COPY source: {}", source))
                        })?;
                    join_tree_path(&resolved, &base)
                } else {
                    resolved.clone()
                };
                self.add_host_entry(&host, &meta, &target, chown)?;
            }
        }
        Ok(())
    }

    /// Breadth-first copy of a host directory into the delta
    fn copy_host_tree(
        &mut self,
        root: &Path,
        dest: &str,
        chown: Option<(u64, u64)>,
        cancel: &CancelToken,
    ) -> Result<(), ImageError> {
        let mut queue: VecDeque<(PathBuf, String)> = VecDeque::new();
        queue.push_back((root.to_path_buf(), dest.to_owned()));
        while let Some((host_dir, tree_path)) = queue.pop_front() {
            cancel.check()?;
            let meta = fs::symlink_metadata(&host_dir)?;
            self.add_host_entry(&host_dir, &meta, &tree_path, chown)?;

            let mut entries = fs::read_dir(&host_dir)?.collect::<io::Result<Vec<_>>>()?;
            entries.sort_by_key(|entry| entry.file_name());
            for entry in entries {
                cancel.check()?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let child_path = join_tree_path(&tree_path, &name);
                let meta = fs::symlink_metadata(entry.path())?;
                if meta.is_dir() {
                    queue.push_back((entry.path(), child_path));
                } else {
                    self.add_host_entry(&entry.path(), &meta, &child_path, chown)?;
                }
            }
        }
        Ok(())
    }

    fn add_host_entry(
        &mut self,
        host: &Path,
        meta: &fs::Metadata,
        tree_path: &str,
        chown: Option<(u64, u64)>,
    ) -> Result<(), ImageError> {
        let file_type = meta.file_type();
        let (kind, size, source) = if file_type.is_dir() {
            (NodeKind::Directory, 0, None)
        } else if file_type.is_symlink() {
            let target = fs::read_link(host)?.to_string_lossy().into_owned();
            (NodeKind::Symlink(target), 0, None)
        } else if file_type.is_file() {
            (NodeKind::File, meta.len(), Some(host.to_path_buf()))
        } else {
            // device nodes and sockets have no place in a build layer
            log::debug!("skipping special file: {:?}", host);
            return Ok(());
        };
        let (uid, gid) = chown.unwrap_or((0, 0));
        self.fs.add(TreeNode {
            header: NodeHeader {
                name: tree_path.to_owned(),
                kind,
                mode: host_mode(meta),
                uid,
                gid,
                size,
            },
            child: None,
            source,
        });
        Ok(())
    }

    /// Turn the delta tree into a new compressed layer blob
    ///
    /// A sorted tar of the delta is streamed through two sha256 hashes at
    /// once: one over the uncompressed stream for the diff ID, one over
    /// the gzip output for the layer descriptor.
    pub fn flush_delta(&mut self, cancel: &CancelToken) -> Result<(), ImageError> {
        let delta = match self.fs.take_delta() {
            Some(delta) => delta,
            None => return Ok(()),
        };
        if delta.child.as_ref().map(|c| c.is_empty()).unwrap_or(true) {
            return Ok(());
        }

        let temp = self.blobs.temp("layer.tar.gz")?;
        let compressed = DigestWriter::new(temp);
        let encoder = GzEncoder::new(compressed, Compression::default());
        let mut builder = tar::Builder::new(DigestWriter::new(encoder));
        write_tree(&mut builder, &delta, cancel)?;

        let (encoder, diff_id, tar_size) = builder.into_inner()?.finish()?;
        let (temp, digest, size) = encoder.finish()?.finish()?;
        log::debug!(
            "flushed delta layer, {} bytes tar, {} bytes compressed, {}",
            tar_size,
            size,
            digest
        );

        let desc = Descriptor {
            media_type: media_types::LAYER_TAR_GZIP.to_owned(),
            size,
            digest,
        };
        self.blobs.promote(temp, &desc)?;

        self.cfg.rootfs.diff_ids.push(diff_id);
        self.layers.push(desc);
        if let Some(last) = self.cfg.history.last_mut() {
            last.empty_layer = false;
        }
        Ok(())
    }

    /// Flush pending changes and assemble the image manifest
    pub fn into_manifest(mut self, cancel: &CancelToken) -> Result<Manifest, ImageError> {
        self.flush_delta(cancel)?;
        let payload = serde_json::to_vec(&self.cfg)?;
        let config = Descriptor {
            media_type: media_types::RUNTIME_CONFIG.to_owned(),
            size: payload.len() as u64,
            digest: ContentDigest::from_content(&payload),
        };
        self.blobs.put_bytes(&config, &payload)?;
        Manifest::new(config, self.layers)
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn join_tree_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_owned()
    } else {
        format!("{}/{}", dir, name)
    }
}

fn parse_chown(chown: Option<&str>) -> Result<Option<(u64, u64)>, ImageError> {
    lazy_static! {
        static ref CHOWN: Regex = Regex::new(r"^[0-9]+:[0-9]+$").unwrap();
    }
    match chown {
        None => Ok(None),
        Some(spec) => {
            if !CHOWN.is_match(spec) {
                return Err(ImageError::IllegalArgument(format!(
                    "--chown expects uid:gid, found: {:?}",
                    spec
                )));
            }
            match spec.split_once(':') {
                Some((uid, gid)) => Ok(Some((
                    uid.parse()
                        .map_err(|_| ImageError::IllegalArgument(format!("bad uid: {}", uid)))?,
                    gid.parse()
                        .map_err(|_| ImageError::IllegalArgument(format!("bad gid: {}", gid)))?,
                ))),
                None => Ok(None),
            }
        }
    }
}

#[cfg(unix)]
fn host_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn host_mode(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else {
        0o644
    }
}

fn write_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    node: &TreeNode,
    cancel: &CancelToken,
) -> Result<(), ImageError> {
    if let Some(children) = &node.child {
        for child in children.values() {
            cancel.check()?;
            append_node(builder, child)?;
            if child.header.kind.is_dir() {
                write_tree(builder, child, cancel)?;
            }
        }
    }
    Ok(())
}

fn append_node<W: Write>(
    builder: &mut tar::Builder<W>,
    node: &TreeNode,
) -> Result<(), ImageError> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(node.header.kind.entry_type());
    header.set_mode(node.header.mode);
    header.set_uid(node.header.uid);
    header.set_gid(node.header.gid);
    header.set_mtime(0);
    header.set_size(0);

    match &node.header.kind {
        NodeKind::File => {
            header.set_size(node.header.size);
            let source = node.source.as_ref().ok_or_else(|| {
                ImageError::IllegalState(format!(
                    "file {} has no backing source",
                    node.header.name
                ))
            })?;
            let file = fs::File::open(source)?;
            builder.append_data(&mut header, &node.header.name, file)?;
        }
        NodeKind::Directory => {
            builder.append_data(&mut header, format!("{}/", node.header.name), io::empty())?;
        }
        NodeKind::Symlink(target) | NodeKind::Hardlink(target) => {
            builder.append_link(&mut header, &node.header.name, target)?;
        }
        NodeKind::CharDevice { major, minor } | NodeKind::BlockDevice { major, minor } => {
            header.set_device_major(*major)?;
            header.set_device_minor(*minor)?;
            builder.append_data(&mut header, &node.header.name, io::empty())?;
        }
        NodeKind::Fifo => {
            builder.append_data(&mut header, &node.header.name, io::empty())?;
        }
    }
    Ok(())
}

fn parse_platform(platform: Option<&str>) -> Result<(String, String), ImageError> {
    match platform {
        None => Ok(("linux".to_owned(), "amd64".to_owned())),
        Some(spec) => {
            let mut parts = spec.split('/');
            let os = parts
                .next()
                .filter(|part| !part.is_empty())
                .ok_or_else(|| {
                    ImageError::IllegalArgument(format!("invalid platform: {:?}", spec))
                })?;
            let architecture = parts.next().unwrap_or("amd64");
            Ok((os.to_owned(), architecture.to_owned()))
        }
    }
}

/// Write-through hasher counting bytes and producing a sha256 digest
struct DigestWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    count: u64,
}

impl<W: Write> DigestWriter<W> {
    fn new(inner: W) -> Self {
        DigestWriter {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    fn finish(self) -> Result<(W, ContentDigest, u64), ImageError> {
        let digest = ContentDigest::from_hash_bytes("sha256", &self.hasher.finalize())?;
        Ok((self.inner, digest, self.count))
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.inner.write(buf)?;
        self.hasher.update(&buf[..count]);
        self.count += count as u64;
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
