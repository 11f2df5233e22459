//! In-memory tree of tar entries making up an image layer

use crate::{
    cancel::CancelToken,
    errors::ImageError,
    manifest::Descriptor,
    storage::BlobStore,
};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::{
    collections::{btree_map::Entry, BTreeMap},
    io::Read,
    path::PathBuf,
};
use tar::{Archive, EntryType};

/// Prefix marking a deleted entry when layers are stacked
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Prefix for whiteout bookkeeping entries that never become files
pub const WHITEOUT_META_PREFIX: &str = ".wh..wh.";
/// Marker that erases every inherited entry of its parent directory
pub const WHITEOUT_OPAQUE_DIR: &str = ".wh..wh..opq";

/// Kind of a tar entry, with link targets and device numbers attached
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Directory,
    File,
    Symlink(String),
    Hardlink(String),
    Fifo,
    CharDevice { major: u32, minor: u32 },
    BlockDevice { major: u32, minor: u32 },
}

impl NodeKind {
    pub fn is_dir(&self) -> bool {
        matches!(self, NodeKind::Directory)
    }

    pub(crate) fn entry_type(&self) -> EntryType {
        match self {
            NodeKind::Directory => EntryType::Directory,
            NodeKind::File => EntryType::Regular,
            NodeKind::Symlink(_) => EntryType::Symlink,
            NodeKind::Hardlink(_) => EntryType::Link,
            NodeKind::Fifo => EntryType::Fifo,
            NodeKind::CharDevice { .. } => EntryType::Char,
            NodeKind::BlockDevice { .. } => EntryType::Block,
        }
    }
}

/// Metadata retained for each tar entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHeader {
    /// Full path of the node within the layer, no leading slash
    pub name: String,
    pub kind: NodeKind,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
}

impl NodeHeader {
    pub fn directory(name: &str) -> Self {
        NodeHeader {
            name: name.to_owned(),
            kind: NodeKind::Directory,
            mode: 0o755,
            uid: 0,
            gid: 0,
            size: 0,
        }
    }
}

/// One node of a decoded layer tree
///
/// `child` is present iff the node is a directory; its keys are unescaped
/// path components. `source` points at a host file backing a regular file
/// that has not been flushed into a layer yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub header: NodeHeader,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child: Option<BTreeMap<String, TreeNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
}

impl TreeNode {
    /// An empty unnamed directory, the starting point for stacking layers
    pub fn empty_dir() -> Self {
        TreeNode {
            header: NodeHeader::directory(""),
            child: None,
            source: None,
        }
    }

    pub fn leaf(header: NodeHeader) -> Self {
        TreeNode {
            header,
            child: None,
            source: None,
        }
    }

    pub fn with_source(header: NodeHeader, source: PathBuf) -> Self {
        TreeNode {
            header,
            child: None,
            source: Some(source),
        }
    }

    fn implicit_dir() -> Self {
        TreeNode {
            header: NodeHeader::directory(""),
            child: None,
            source: None,
        }
    }

    /// Insert a tar header at its path, materializing implicit directories
    ///
    /// An existing directory survives unless the final component replaces
    /// it with a non-directory; any other collision is overwritten.
    pub fn add(&mut self, incoming: NodeHeader) {
        let full = incoming.name.trim_matches('/').to_owned();
        let mut node = self;
        let mut fullpath = String::new();
        let mut rest = full.as_str();
        while !rest.is_empty() {
            let (name, remainder) = match rest.split_once('/') {
                Some((name, remainder)) => (name, remainder),
                None => (rest, ""),
            };
            let is_final = remainder.is_empty();
            let children = node.child.get_or_insert_with(BTreeMap::new);
            let item = match children.entry(name.to_owned()) {
                Entry::Occupied(mut occupied) => {
                    let keep = occupied.get().header.kind.is_dir()
                        && !(is_final && !incoming.kind.is_dir());
                    if !keep {
                        *occupied.get_mut() = TreeNode::implicit_dir();
                    }
                    occupied.into_mut()
                }
                Entry::Vacant(vacant) => vacant.insert(TreeNode::implicit_dir()),
            };
            if is_final {
                item.header = incoming.clone();
            }
            item.header.name = format!("{}{}", fullpath, name);
            fullpath = format!("{}{}/", fullpath, name);
            node = item;
            rest = remainder;
        }
    }

    /// Stack `diff` on top of this tree, honoring OCI whiteouts
    ///
    /// The opaque marker is applied before the generic `.wh.` rule, and
    /// whiteout entries never appear in the merged tree.
    pub fn apply_diff(&mut self, diff: &TreeNode) {
        if !self.header.kind.is_dir() || !diff.header.kind.is_dir() {
            self.child = None;
        }
        if self.child.is_some() {
            if let Some(diff_children) = &diff.child {
                if diff_children.contains_key(WHITEOUT_OPAQUE_DIR) {
                    self.child = None;
                }
            }
        }
        self.header = diff.header.clone();
        if !diff.header.kind.is_dir() {
            self.source = diff.source.clone();
            return;
        }
        if let Some(diff_children) = &diff.child {
            for (name, item) in diff_children {
                if name.starts_with(WHITEOUT_META_PREFIX) {
                    continue;
                }
                if let Some(erased) = name.strip_prefix(WHITEOUT_PREFIX) {
                    if let Some(children) = self.child.as_mut() {
                        children.remove(erased);
                        if children.is_empty() {
                            self.child = None;
                        }
                    }
                    continue;
                }
                let children = self.child.get_or_insert_with(BTreeMap::new);
                let old = children.entry(name.clone()).or_insert_with(|| TreeNode {
                    header: item.header.clone(),
                    child: None,
                    source: item.source.clone(),
                });
                old.apply_diff(item);
            }
        }
    }
}

/// Decode the metadata of a gzipped tar layer into a [TreeNode]
///
/// Entry bodies are discarded; file contents are re-read from the blob
/// on demand.
pub fn decode_tree<R: Read>(gzipped: R, cancel: &CancelToken) -> Result<TreeNode, ImageError> {
    let mut root = TreeNode::empty_dir();
    let mut archive = Archive::new(GzDecoder::new(gzipped));
    for entry in archive.entries()? {
        cancel.check()?;
        let entry = entry?;
        if let Some(header) = node_header_from_entry(&entry)? {
            root.add(header);
        }
    }
    Ok(root)
}

/// Load the decoded tree of a compressed layer blob
///
/// The result is cached as a JSON sidecar at `blob_name(desc) + ".tree"`;
/// a corrupt sidecar is ignored and rebuilt.
pub fn layer_tree(
    blobs: &BlobStore,
    desc: &Descriptor,
    cancel: &CancelToken,
) -> Result<TreeNode, ImageError> {
    if let Some(cached) = blobs.read_sidecar(&desc.digest, ".tree")? {
        if let Ok(root) = serde_json::from_slice::<TreeNode>(&cached) {
            return Ok(root);
        }
        log::warn!("discarding corrupt tree cache for {}", desc.digest);
    }
    let reader = blobs.open(desc)?;
    let root = decode_tree(reader, cancel)?;
    blobs.write_sidecar(&desc.digest, ".tree", &serde_json::to_vec(&root)?)?;
    Ok(root)
}

fn node_header_from_entry<R: Read>(
    entry: &tar::Entry<R>,
) -> Result<Option<NodeHeader>, ImageError> {
    let header = entry.header();
    let name = entry.path()?.to_string_lossy().into_owned();

    let link_name = |entry: &tar::Entry<R>| -> Result<String, ImageError> {
        match entry.link_name()? {
            Some(link) => Ok(link.to_string_lossy().into_owned()),
            None => Err(ImageError::IllegalFormat(format!(
                "link entry without a target: {:?}",
                name
            ))),
        }
    };
    let device = |entry: &tar::Entry<R>| -> Result<(u32, u32), ImageError> {
        match (entry.header().device_major()?, entry.header().device_minor()?) {
            (Some(major), Some(minor)) => Ok((major, minor)),
            _ => Err(ImageError::IllegalFormat(format!(
                "device entry without device numbers: {:?}",
                name
            ))),
        }
    };

    let kind = match header.entry_type() {
        EntryType::Directory => NodeKind::Directory,
        EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => NodeKind::File,
        EntryType::Symlink => NodeKind::Symlink(link_name(entry)?),
        EntryType::Link => NodeKind::Hardlink(link_name(entry)?),
        EntryType::Fifo => NodeKind::Fifo,
        EntryType::Char => {
            let (major, minor) = device(entry)?;
            NodeKind::CharDevice { major, minor }
        }
        EntryType::Block => {
            let (major, minor) = device(entry)?;
            NodeKind::BlockDevice { major, minor }
        }
        other => {
            log::debug!("skipping unsupported tar entry type {:?}, {:?}", other, name);
            return Ok(None);
        }
    };

    Ok(Some(NodeHeader {
        name,
        kind,
        mode: header.mode()?,
        uid: header.uid()?,
        gid: header.gid()?,
        size: header.size()?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    fn gzipped_tar(entries: &[(&str, EntryType, &[u8])]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, entry_type, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(*entry_type);
            header.set_mode(if entry_type.is_dir() { 0o755 } else { 0o644 });
            header.set_size(data.len() as u64);
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            header.set_cksum();
            builder.append_data(&mut header, path, &data[..]).unwrap();
        }
        builder
            .into_inner()
            .unwrap()
            .finish()
            .unwrap()
    }

    fn decode(bytes: &[u8]) -> TreeNode {
        decode_tree(std::io::Cursor::new(bytes.to_vec()), &CancelToken::new()).unwrap()
    }

    fn child<'a>(node: &'a TreeNode, name: &str) -> &'a TreeNode {
        node.child.as_ref().unwrap().get(name).unwrap()
    }

    #[test]
    fn decode_creates_implicit_directories() {
        let tar = gzipped_tar(&[("usr/bin/true", EntryType::Regular, b"x")]);
        let root = decode(&tar);
        let usr = child(&root, "usr");
        assert!(usr.header.kind.is_dir());
        assert_eq!(usr.header.mode, 0o755);
        assert_eq!(usr.header.name, "usr");
        let file = child(child(usr, "bin"), "true");
        assert_eq!(file.header.kind, NodeKind::File);
        assert_eq!(file.header.name, "usr/bin/true");
        assert_eq!(file.header.size, 1);
    }

    #[test]
    fn add_replaces_directory_with_file() {
        let mut root = TreeNode::empty_dir();
        root.add(NodeHeader::directory("etc/service"));
        let mut file = NodeHeader::directory("etc/service");
        file.kind = NodeKind::File;
        root.add(file);
        assert_eq!(child(child(&root, "etc"), "service").header.kind, NodeKind::File);
        assert!(child(child(&root, "etc"), "service").child.is_none());
    }

    #[test]
    fn add_keeps_children_when_directory_header_arrives_late() {
        let mut root = TreeNode::empty_dir();
        let mut file = NodeHeader::directory("etc/passwd");
        file.kind = NodeKind::File;
        root.add(file);
        let mut dir = NodeHeader::directory("etc");
        dir.mode = 0o700;
        root.add(dir);
        let etc = child(&root, "etc");
        assert_eq!(etc.header.mode, 0o700);
        assert_eq!(child(etc, "passwd").header.kind, NodeKind::File);
    }

    #[test]
    fn apply_diff_over_empty_equals_decode() {
        let tar = gzipped_tar(&[
            ("bin/", EntryType::Directory, b""),
            ("bin/sh", EntryType::Regular, b"#!"),
            ("etc/", EntryType::Directory, b""),
            ("etc/hostname", EntryType::Regular, b"porter"),
        ]);
        let decoded = decode(&tar);
        let mut stacked = TreeNode::empty_dir();
        stacked.apply_diff(&decoded);
        assert_eq!(stacked, decoded);
    }

    #[test]
    fn apply_diff_merges_and_deletes() {
        let base_tar = gzipped_tar(&[
            ("etc/", EntryType::Directory, b""),
            ("etc/keep", EntryType::Regular, b"1"),
            ("etc/gone", EntryType::Regular, b"2"),
        ]);
        let diff_tar = gzipped_tar(&[
            ("etc/", EntryType::Directory, b""),
            ("etc/.wh.gone", EntryType::Regular, b""),
            ("etc/new", EntryType::Regular, b"3"),
        ]);
        let mut base = decode(&base_tar);
        base.apply_diff(&decode(&diff_tar));

        let etc = child(&base, "etc");
        let names: Vec<_> = etc.child.as_ref().unwrap().keys().cloned().collect();
        assert_eq!(names, vec!["keep", "new"]);
    }

    #[test]
    fn opaque_whiteout_clears_inherited_entries() {
        let base_tar = gzipped_tar(&[
            ("data/", EntryType::Directory, b""),
            ("data/old1", EntryType::Regular, b"1"),
            ("data/old2", EntryType::Regular, b"2"),
        ]);
        let diff_tar = gzipped_tar(&[
            ("data/", EntryType::Directory, b""),
            ("data/.wh..wh..opq", EntryType::Regular, b""),
            ("data/fresh", EntryType::Regular, b"3"),
        ]);
        let mut base = decode(&base_tar);
        base.apply_diff(&decode(&diff_tar));

        let data = child(&base, "data");
        let names: Vec<_> = data.child.as_ref().unwrap().keys().cloned().collect();
        assert_eq!(names, vec!["fresh"]);
    }

    #[test]
    fn whiteout_of_last_entry_leaves_no_child_map() {
        let base_tar = gzipped_tar(&[
            ("dir/", EntryType::Directory, b""),
            ("dir/only", EntryType::Regular, b"1"),
        ]);
        let diff_tar = gzipped_tar(&[
            ("dir/", EntryType::Directory, b""),
            ("dir/.wh.only", EntryType::Regular, b""),
        ]);
        let mut base = decode(&base_tar);
        base.apply_diff(&decode(&diff_tar));
        assert!(child(&base, "dir").child.is_none());
    }

    #[test]
    fn file_replacing_directory_drops_subtree() {
        let base_tar = gzipped_tar(&[
            ("opt/", EntryType::Directory, b""),
            ("opt/app/", EntryType::Directory, b""),
            ("opt/app/bin", EntryType::Regular, b"x"),
        ]);
        let diff_tar = gzipped_tar(&[("opt/app", EntryType::Regular, b"flat")]);
        let mut base = decode(&base_tar);
        base.apply_diff(&decode(&diff_tar));
        let app = child(child(&base, "opt"), "app");
        assert_eq!(app.header.kind, NodeKind::File);
        assert!(app.child.is_none());
    }

    #[test]
    fn layer_tree_uses_sidecar_cache() {
        use crate::{manifest::media_types, storage::MemStore};
        use std::sync::Arc;

        let blobs = BlobStore::new(Arc::new(MemStore::new()));
        let cancel = CancelToken::new();
        let tar = gzipped_tar(&[("hello", EntryType::Regular, b"hi")]);
        let desc = Descriptor {
            media_type: media_types::LAYER_TAR_GZIP.to_owned(),
            size: tar.len() as u64,
            digest: crate::image::ContentDigest::from_content(&tar),
        };
        blobs.put_bytes(&desc, &tar).unwrap();

        let first = layer_tree(&blobs, &desc, &cancel).unwrap();
        assert!(blobs.read_sidecar(&desc.digest, ".tree").unwrap().is_some());

        // poison the blob; the sidecar must satisfy the next decode
        blobs.remove(&desc).unwrap();
        let second = layer_tree(&blobs, &desc, &cancel).unwrap();
        assert_eq!(first, second);
    }
}
