//! Copy-on-write view over a stacked base tree and a build delta

use crate::{
    errors::ImageError,
    filesystem::tree::{NodeHeader, NodeKind, TreeNode},
};
use std::collections::{btree_map::Entry, BTreeMap, HashSet};

/// Normalize a path: strip slashes, drop `.` and empty components, and
/// resolve `..` against the preceding components
pub fn clean_path(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out.join("/")
}

/// A layered filesystem: an immutable base and an optional delta overlay
///
/// Lookups consult the delta first and fall back to the base. All build
/// modifications land in the delta; whiteout-style deletions are not
/// needed here because a build only ever adds entries.
pub struct LayerFS {
    base: TreeNode,
    delta: Option<TreeNode>,
}

impl LayerFS {
    pub fn new(base: TreeNode) -> Self {
        LayerFS { base, delta: None }
    }

    pub fn delta(&self) -> Option<&TreeNode> {
        self.delta.as_ref()
    }

    /// Detach the delta tree, leaving the base untouched
    pub fn take_delta(&mut self) -> Option<TreeNode> {
        self.delta.take()
    }

    /// Walk to a node without resolving symlinks; the delta wins
    ///
    /// Returns None if the path is absent or crosses a non-directory.
    pub fn get(&self, target: &str) -> Option<&TreeNode> {
        let target = clean_path(target);
        let mut base = Some(&self.base);
        let mut delta = self.delta.as_ref();
        let mut rest = target.as_str();
        while !rest.is_empty() {
            let (name, remainder) = match rest.split_once('/') {
                Some((name, remainder)) => (name, remainder),
                None => (rest, ""),
            };
            if let Some(node) = delta {
                if !node.header.kind.is_dir() {
                    return None;
                }
                if let Some(b) = base {
                    if !b.header.kind.is_dir() {
                        base = None;
                    }
                }
            } else if let Some(node) = base {
                if !node.header.kind.is_dir() {
                    return None;
                }
            }
            base = base
                .and_then(|node| node.child.as_ref())
                .and_then(|children| children.get(name));
            delta = delta
                .and_then(|node| node.child.as_ref())
                .and_then(|children| children.get(name));
            rest = remainder;
        }
        delta.or(base)
    }

    /// Resolve every symlink along `target`
    ///
    /// The walk restarts from the root whenever a component turns out to
    /// be a symlink, resolving the link target against the directory that
    /// contains the link. Revisiting a symlink fails with
    /// [ImageError::LoopDetected], and `..` cannot escape the root.
    /// Returns the accumulated path without a leading slash.
    pub fn eval_symlinks(&self, target: &str) -> Result<String, ImageError> {
        let mut result: Vec<String> = Vec::new();
        let mut base = Some(&self.base);
        let mut delta = self.delta.as_ref();
        let mut visited: HashSet<String> = HashSet::new();
        let mut target = target.to_owned();

        while !target.is_empty() {
            let (name, rest) = match target.split_once('/') {
                Some((name, rest)) => (name.to_owned(), rest.to_owned()),
                None => (target.clone(), String::new()),
            };

            if let Some(node) = delta {
                if !node.header.kind.is_dir() {
                    return Err(ImageError::IllegalState(format!(
                        "expected directory for: /{}",
                        result.join("/")
                    )));
                }
                if let Some(b) = base {
                    if !b.header.kind.is_dir() {
                        base = None;
                    }
                }
            } else if let Some(node) = base {
                if !node.header.kind.is_dir() {
                    return Err(ImageError::IllegalState(format!(
                        "expected directory for: /{}",
                        result.join("/")
                    )));
                }
            }

            if name.is_empty() || name == "." {
                target = rest;
                continue;
            }
            if name == ".." {
                if result.pop().is_none() {
                    return Err(ImageError::IllegalState(
                        "can't `..` out of the root directory".to_owned(),
                    ));
                }
                let prefix = result.join("/");
                target = match (prefix.is_empty(), rest.is_empty()) {
                    (true, _) => rest,
                    (false, true) => prefix,
                    (false, false) => format!("{}/{}", prefix, rest),
                };
                base = Some(&self.base);
                delta = self.delta.as_ref();
                result.clear();
                continue;
            }

            // a delta entry shadows the base even when it is not a symlink
            let mut check_base = true;
            let mut link: Option<&TreeNode> = None;
            if let Some(node) = delta {
                if let Some(found) = node.child.as_ref().and_then(|c| c.get(&name)) {
                    if matches!(found.header.kind, NodeKind::Symlink(_)) {
                        link = Some(found);
                    }
                    check_base = false;
                }
            }
            if link.is_none() && check_base {
                if let Some(node) = base {
                    if let Some(found) = node.child.as_ref().and_then(|c| c.get(&name)) {
                        if matches!(found.header.kind, NodeKind::Symlink(_)) {
                            link = Some(found);
                        }
                    }
                }
            }

            if let Some(link_node) = link {
                let link_name = link_node.header.name.clone();
                if !visited.insert(link_name.clone()) {
                    return Err(ImageError::LoopDetected(link_name));
                }
                let link_target = match &link_node.header.kind {
                    NodeKind::Symlink(link_target) => link_target.clone(),
                    _ => String::new(),
                };
                let resolved = if link_target.starts_with('/') {
                    clean_path(&link_target)
                } else {
                    let parent = match link_name.rfind('/') {
                        Some(i) => &link_name[..i],
                        None => "",
                    };
                    clean_path(&format!("{}/{}", parent, link_target))
                };
                target = match (resolved.is_empty(), rest.is_empty()) {
                    (true, _) => rest,
                    (false, true) => resolved,
                    (false, false) => format!("{}/{}", resolved, rest),
                };
                base = Some(&self.base);
                delta = self.delta.as_ref();
                result.clear();
                continue;
            }

            base = base
                .and_then(|node| node.child.as_ref())
                .and_then(|children| children.get(name.as_str()));
            delta = delta
                .and_then(|node| node.child.as_ref())
                .and_then(|children| children.get(name.as_str()));
            result.push(name);
            target = rest;
        }
        Ok(result.join("/"))
    }

    /// Place `node` into the delta at `node.header.name`
    ///
    /// Intermediate delta directories are materialized on the way down,
    /// copying the base directory's header where one exists so that
    /// permissions survive, and synthesizing a `0755` directory otherwise.
    /// A directory landing on an existing delta directory merges headers
    /// and keeps the children already copied there.
    pub fn add(&mut self, mut node: TreeNode) {
        let full = clean_path(&node.header.name);
        if full.is_empty() {
            return;
        }
        let (dir_part, leaf) = match full.rfind('/') {
            Some(i) => (&full[..i], &full[i + 1..]),
            None => ("", full.as_str()),
        };

        let base_root_header = self.base.header.clone();
        let delta_root = self.delta.get_or_insert_with(|| TreeNode {
            header: base_root_header,
            child: None,
            source: None,
        });

        let mut base_cursor: Option<&TreeNode> = Some(&self.base);
        let mut cursor: &mut TreeNode = delta_root;
        let mut fullpath = String::new();

        for name in dir_part.split('/').filter(|s| !s.is_empty()) {
            let base_child = base_cursor
                .and_then(|b| b.child.as_ref())
                .and_then(|children| children.get(name));
            let materialized = || match base_child {
                Some(existing) if existing.header.kind.is_dir() => TreeNode {
                    header: existing.header.clone(),
                    child: None,
                    source: None,
                },
                _ => TreeNode::leaf(NodeHeader::directory(&format!("{}{}", fullpath, name))),
            };
            let children = cursor.child.get_or_insert_with(BTreeMap::new);
            let item = match children.entry(name.to_owned()) {
                Entry::Occupied(mut occupied) => {
                    if !occupied.get().header.kind.is_dir() {
                        *occupied.get_mut() = materialized();
                    }
                    occupied.into_mut()
                }
                Entry::Vacant(vacant) => vacant.insert(materialized()),
            };
            item.header.name = format!("{}{}", fullpath, name);
            fullpath = format!("{}{}/", fullpath, name);
            cursor = item;
            base_cursor = base_child;
        }

        node.header.name = format!("{}{}", fullpath, leaf);
        let children = cursor.child.get_or_insert_with(BTreeMap::new);
        match children.entry(leaf.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().header.kind.is_dir() && node.header.kind.is_dir() {
                    occupied.get_mut().header = node.header;
                } else {
                    *occupied.get_mut() = node;
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(node);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir(name: &str) -> NodeHeader {
        NodeHeader::directory(name)
    }

    fn file(name: &str, size: u64) -> NodeHeader {
        NodeHeader {
            name: name.to_owned(),
            kind: NodeKind::File,
            mode: 0o644,
            uid: 0,
            gid: 0,
            size,
        }
    }

    fn symlink(name: &str, target: &str) -> NodeHeader {
        NodeHeader {
            name: name.to_owned(),
            kind: NodeKind::Symlink(target.to_owned()),
            mode: 0o777,
            uid: 0,
            gid: 0,
            size: 0,
        }
    }

    fn sample_base() -> TreeNode {
        let mut base = TreeNode::empty_dir();
        base.add(dir("usr/bin"));
        base.add(file("usr/bin/env", 100));
        base.add(symlink("bin", "usr/bin"));
        base.add(symlink("sbin", "/usr/bin"));
        base.add(dir("etc"));
        base.add(file("etc/hostname", 7));
        base
    }

    #[test]
    fn clean_paths() {
        assert_eq!(clean_path("/usr//bin/"), "usr/bin");
        assert_eq!(clean_path("a/./b"), "a/b");
        assert_eq!(clean_path("a/b/../c"), "a/c");
        assert_eq!(clean_path("../a"), "a");
        assert_eq!(clean_path("/"), "");
        assert_eq!(clean_path(""), "");
    }

    #[test]
    fn get_finds_base_nodes() {
        let fs = LayerFS::new(sample_base());
        assert_eq!(fs.get("/usr/bin/env").unwrap().header.size, 100);
        assert_eq!(fs.get("usr/bin").unwrap().header.kind, NodeKind::Directory);
        assert!(fs.get("usr/bin/missing").is_none());
        // symlinks are not resolved by get
        assert!(matches!(
            fs.get("bin").unwrap().header.kind,
            NodeKind::Symlink(_)
        ));
        // a path through a file is not a path
        assert!(fs.get("etc/hostname/deeper").is_none());
    }

    #[test]
    fn delta_wins_over_base() {
        let mut fs = LayerFS::new(sample_base());
        fs.add(TreeNode::leaf(file("etc/hostname", 42)));
        assert_eq!(fs.get("etc/hostname").unwrap().header.size, 42);
        // the base tree is untouched
        assert_eq!(
            fs.delta().unwrap().child.as_ref().unwrap()["etc"]
                .child
                .as_ref()
                .unwrap()["hostname"]
                .header
                .size,
            42
        );
    }

    #[test]
    fn add_copies_base_directory_headers() {
        let mut base = TreeNode::empty_dir();
        let mut restricted = dir("secrets");
        restricted.mode = 0o700;
        base.add(restricted);
        let mut fs = LayerFS::new(base);

        fs.add(TreeNode::leaf(file("secrets/token", 1)));
        let delta = fs.delta().unwrap();
        let secrets = &delta.child.as_ref().unwrap()["secrets"];
        assert_eq!(secrets.header.mode, 0o700);

        fs.add(TreeNode::leaf(file("fresh/file", 1)));
        let delta = fs.delta().unwrap();
        let fresh = &delta.child.as_ref().unwrap()["fresh"];
        assert_eq!(fresh.header.mode, 0o755);
    }

    #[test]
    fn eval_symlinks_passthrough() {
        let fs = LayerFS::new(sample_base());
        assert_eq!(fs.eval_symlinks("/usr/bin/env").unwrap(), "usr/bin/env");
        assert_eq!(fs.eval_symlinks("/etc/").unwrap(), "etc");
        assert_eq!(fs.eval_symlinks("/").unwrap(), "");
    }

    #[test]
    fn eval_symlinks_resolves_links() {
        let fs = LayerFS::new(sample_base());
        // relative link target
        assert_eq!(fs.eval_symlinks("/bin/env").unwrap(), "usr/bin/env");
        // absolute link target
        assert_eq!(fs.eval_symlinks("/sbin/env").unwrap(), "usr/bin/env");
        // link as the final component
        assert_eq!(fs.eval_symlinks("/bin").unwrap(), "usr/bin");
    }

    #[test]
    fn eval_symlinks_is_idempotent_without_links() {
        let fs = LayerFS::new(sample_base());
        let once = fs.eval_symlinks("/usr/./bin//env").unwrap();
        let twice = fs.eval_symlinks(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn eval_symlinks_handles_dotdot() {
        let fs = LayerFS::new(sample_base());
        assert_eq!(fs.eval_symlinks("/usr/bin/../bin/env").unwrap(), "usr/bin/env");
        assert!(fs.eval_symlinks("/../etc").is_err());
    }

    #[test]
    fn eval_symlinks_detects_loops() {
        let mut base = TreeNode::empty_dir();
        base.add(symlink("a", "/b"));
        base.add(symlink("b", "/a"));
        let fs = LayerFS::new(base);
        assert!(matches!(
            fs.eval_symlinks("/a/file"),
            Err(ImageError::LoopDetected(_))
        ));
    }

    #[test]
    fn eval_symlinks_link_relative_to_parent_dir() {
        let mut base = TreeNode::empty_dir();
        base.add(dir("usr/lib"));
        base.add(file("usr/lib/libc.so", 9));
        base.add(symlink("usr/bin/ld", "../lib/libc.so"));
        let fs = LayerFS::new(base);
        assert_eq!(fs.eval_symlinks("/usr/bin/ld").unwrap(), "usr/lib/libc.so");
    }

    #[test]
    fn directory_add_merges_existing_delta_children() {
        let mut fs = LayerFS::new(TreeNode::empty_dir());
        fs.add(TreeNode::leaf(dir("app")));
        fs.add(TreeNode::leaf(file("app/one", 1)));
        let mut repeat = dir("app");
        repeat.mode = 0o750;
        fs.add(TreeNode::leaf(repeat));
        let delta = fs.delta().unwrap();
        let app = &delta.child.as_ref().unwrap()["app"];
        assert_eq!(app.header.mode, 0o750);
        assert!(app.child.as_ref().unwrap().contains_key("one"));
    }
}
