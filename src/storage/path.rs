//! Filesystem abstraction underneath the local image state directory

use crate::errors::ImageError;
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    fs::OpenOptions,
    io,
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::SystemTime,
};

/// Metadata for one entry inside a [PathStore]
#[derive(Clone, Debug)]
pub struct FileInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: SystemTime,
}

/// Storage operations the state directory needs, over relative paths
///
/// Two backends exist: [OsStore] rooted at a real directory, and
/// [OverlayStore] which layers in-memory writes over a read-only base.
/// Implementations must be safe for concurrent readers and for independent
/// writers to distinct paths; writers to the same path are serialized by
/// the atomic-write protocol in [safe_write].
pub trait PathStore: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;

    /// Create a file that must not already exist
    fn create_exclusive(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

    fn rename(&self, src: &Path, dst: &Path) -> io::Result<()>;
    fn remove(&self, path: &Path) -> io::Result<()>;
    fn stat(&self, path: &Path) -> io::Result<FileInfo>;
    fn read_dir(&self, path: &Path) -> io::Result<Vec<FileInfo>>;
    fn mkdir_all(&self, path: &Path) -> io::Result<()>;
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{:?}", path))
}

fn already_exists(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::AlreadyExists, format!("{:?}", path))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// [PathStore] rooted at a directory on the host filesystem
pub struct OsStore {
    root: PathBuf,
}

impl OsStore {
    pub fn new(root: PathBuf) -> Self {
        OsStore { root }
    }

    fn full(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

impl PathStore for OsStore {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(fs::File::open(self.full(path))?))
    }

    fn create_exclusive(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.full(path))?;
        Ok(Box::new(file))
    }

    fn rename(&self, src: &Path, dst: &Path) -> io::Result<()> {
        fs::rename(self.full(src), self.full(dst))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(self.full(path))
    }

    fn stat(&self, path: &Path) -> io::Result<FileInfo> {
        let meta = fs::metadata(self.full(path))?;
        Ok(FileInfo {
            name: file_name(path),
            is_dir: meta.is_dir(),
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        })
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<FileInfo>> {
        let mut items = Vec::new();
        for entry in fs::read_dir(self.full(path))? {
            let entry = entry?;
            let meta = entry.metadata()?;
            items.push(FileInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: meta.is_dir(),
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(self.full(path))
    }
}

#[derive(Clone)]
struct MemEntry {
    data: Arc<Vec<u8>>,
    modified: SystemTime,
}

/// [PathStore] kept entirely in memory; directories are implicit
#[derive(Clone, Default)]
pub struct MemStore {
    entries: Arc<Mutex<BTreeMap<PathBuf, MemEntry>>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, BTreeMap<PathBuf, MemEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_implicit_dir(entries: &BTreeMap<PathBuf, MemEntry>, path: &Path) -> bool {
        path.as_os_str().is_empty() || entries.keys().any(|k| k.starts_with(path) && k != path)
    }
}

struct MemWriter {
    store: MemStore,
    path: PathBuf,
    buffer: Vec<u8>,
}

impl MemWriter {
    fn publish(&mut self) {
        self.store.locked().insert(
            self.path.clone(),
            MemEntry {
                data: Arc::new(self.buffer.clone()),
                modified: SystemTime::now(),
            },
        );
    }
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.publish();
        Ok(())
    }
}

impl Drop for MemWriter {
    fn drop(&mut self) {
        self.publish();
    }
}

impl PathStore for MemStore {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        let entries = self.locked();
        match entries.get(path) {
            Some(entry) => Ok(Box::new(io::Cursor::new(entry.data.to_vec()))),
            None => Err(not_found(path)),
        }
    }

    fn create_exclusive(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let mut entries = self.locked();
        if entries.contains_key(path) {
            return Err(already_exists(path));
        }
        entries.insert(
            path.to_path_buf(),
            MemEntry {
                data: Arc::new(Vec::new()),
                modified: SystemTime::now(),
            },
        );
        Ok(Box::new(MemWriter {
            store: self.clone(),
            path: path.to_path_buf(),
            buffer: Vec::new(),
        }))
    }

    fn rename(&self, src: &Path, dst: &Path) -> io::Result<()> {
        let mut entries = self.locked();
        match entries.remove(src) {
            Some(entry) => {
                entries.insert(dst.to_path_buf(), entry);
                Ok(())
            }
            None => Err(not_found(src)),
        }
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        match self.locked().remove(path) {
            Some(_) => Ok(()),
            None => Err(not_found(path)),
        }
    }

    fn stat(&self, path: &Path) -> io::Result<FileInfo> {
        let entries = self.locked();
        if let Some(entry) = entries.get(path) {
            return Ok(FileInfo {
                name: file_name(path),
                is_dir: false,
                size: entry.data.len() as u64,
                modified: entry.modified,
            });
        }
        if MemStore::is_implicit_dir(&entries, path) {
            return Ok(FileInfo {
                name: file_name(path),
                is_dir: true,
                size: 0,
                modified: SystemTime::UNIX_EPOCH,
            });
        }
        Err(not_found(path))
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<FileInfo>> {
        let entries = self.locked();
        if !MemStore::is_implicit_dir(&entries, path) && !entries.contains_key(path) {
            return Err(not_found(path));
        }
        let mut names: BTreeMap<String, FileInfo> = BTreeMap::new();
        for (key, entry) in entries.iter() {
            let rel = match key.strip_prefix(path) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel,
                _ => continue,
            };
            let mut components = rel.components();
            let first = match components.next() {
                Some(c) => c.as_os_str().to_string_lossy().into_owned(),
                None => continue,
            };
            let is_dir = components.next().is_some();
            names
                .entry(first.clone())
                .and_modify(|info| info.is_dir |= is_dir)
                .or_insert(FileInfo {
                    name: first,
                    is_dir,
                    size: if is_dir { 0 } else { entry.data.len() as u64 },
                    modified: entry.modified,
                });
        }
        Ok(names.into_values().collect())
    }

    fn mkdir_all(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
}

/// Read-through overlay: a read-only base plus an in-memory delta
///
/// Writes land in the delta. Removing a base entry records a tombstone
/// that shadows it. Directory listings are the union by name, with the
/// delta winning on collisions.
pub struct OverlayStore {
    base: Arc<dyn PathStore>,
    delta: MemStore,
    tombstones: Mutex<HashSet<PathBuf>>,
}

impl OverlayStore {
    pub fn new(base: Arc<dyn PathStore>) -> Self {
        OverlayStore {
            base,
            delta: MemStore::new(),
            tombstones: Mutex::new(HashSet::new()),
        }
    }

    fn is_tombstoned(&self, path: &Path) -> bool {
        match self.tombstones.lock() {
            Ok(guard) => guard.contains(path),
            Err(poisoned) => poisoned.into_inner().contains(path),
        }
    }

    fn set_tombstone(&self, path: &Path, present: bool) {
        let mut guard = match self.tombstones.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if present {
            guard.insert(path.to_path_buf());
        } else {
            guard.remove(path);
        }
    }

    fn base_has(&self, path: &Path) -> bool {
        !self.is_tombstoned(path) && self.base.stat(path).is_ok()
    }
}

impl PathStore for OverlayStore {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        match self.delta.open(path) {
            Ok(reader) => Ok(reader),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if self.is_tombstoned(path) {
                    Err(not_found(path))
                } else {
                    self.base.open(path)
                }
            }
            Err(err) => Err(err),
        }
    }

    fn create_exclusive(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        if self.base_has(path) {
            return Err(already_exists(path));
        }
        let writer = self.delta.create_exclusive(path)?;
        self.set_tombstone(path, false);
        Ok(writer)
    }

    fn rename(&self, src: &Path, dst: &Path) -> io::Result<()> {
        if self.delta.stat(src).map(|info| !info.is_dir).unwrap_or(false) {
            self.delta.rename(src, dst)?;
        } else if self.base_has(src) {
            let mut data = Vec::new();
            self.base.open(src)?.read_to_end(&mut data)?;
            let mut writer = self.delta.create_exclusive(dst)?;
            writer.write_all(&data)?;
            drop(writer);
            self.set_tombstone(src, true);
        } else {
            return Err(not_found(src));
        }
        self.set_tombstone(dst, false);
        Ok(())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let in_delta = self.delta.remove(path).is_ok();
        let in_base = !self.is_tombstoned(path) && self.base.stat(path).is_ok();
        if in_base {
            self.set_tombstone(path, true);
        }
        if in_delta || in_base {
            Ok(())
        } else {
            Err(not_found(path))
        }
    }

    fn stat(&self, path: &Path) -> io::Result<FileInfo> {
        match self.delta.stat(path) {
            Ok(info) => Ok(info),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if self.is_tombstoned(path) {
                    Err(not_found(path))
                } else {
                    self.base.stat(path)
                }
            }
            Err(err) => Err(err),
        }
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<FileInfo>> {
        let delta_items = match self.delta.read_dir(path) {
            Ok(items) => items,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err),
        };
        let base_items = match self.base.read_dir(path) {
            Ok(items) => items,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if delta_items.is_empty() {
                    return Err(not_found(path));
                }
                Vec::new()
            }
            Err(err) => return Err(err),
        };

        let mut merged: BTreeMap<String, FileInfo> = BTreeMap::new();
        for item in base_items {
            if item.is_dir || !self.is_tombstoned(&path.join(&item.name)) {
                merged.insert(item.name.clone(), item);
            }
        }
        for item in delta_items {
            merged.insert(item.name.clone(), item);
        }
        Ok(merged.into_values().collect())
    }

    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        self.delta.mkdir_all(path)
    }
}

/// A temporary file created next to its final destination
///
/// The name is `<dest>~<i>` with the lowest `i` that does not already
/// exist, so concurrent writers get distinct temp files and a crash leaves
/// nothing but `~<i>` residue for the garbage collector. Dropping an
/// uncommitted TempFile removes it.
pub struct TempFile {
    store: Arc<dyn PathStore>,
    path: PathBuf,
    writer: Option<Box<dyn Write + Send>>,
    committed: bool,
}

impl TempFile {
    pub fn create(store: &Arc<dyn PathStore>, dest: &Path) -> Result<TempFile, ImageError> {
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                store.mkdir_all(parent)?;
            }
        }
        let mut name = file_name(dest);
        if name.is_empty() {
            return Err(ImageError::IllegalArgument(format!(
                "bad destination path: {:?}",
                dest
            )));
        }
        name.push('~');
        for i in 0.. {
            let temp = dest.with_file_name(format!("{}{}", name, i));
            match store.create_exclusive(&temp) {
                Ok(writer) => {
                    return Ok(TempFile {
                        store: store.clone(),
                        path: temp,
                        writer: Some(writer),
                        committed: false,
                    })
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(ImageError::Internal(format!(
                        "can't create temporary file {:?}: {}",
                        temp, err
                    )))
                }
            }
        }
        unreachable!()
    }

    /// Close the temp file and atomically rename it over `dest`
    pub fn commit(mut self, dest: &Path) -> Result<(), ImageError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        if let Err(err) = self.store.rename(&self.path, dest) {
            return Err(ImageError::Internal(format!(
                "error renaming {:?} -> {:?}: {}",
                self.path, dest, err
            )));
        }
        self.committed = true;
        Ok(())
    }
}

impl Write for TempFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.writer {
            Some(writer) => writer.write(buf),
            None => Err(not_found(&self.path)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.writer {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.writer.take();
        if let Err(err) = self.store.remove(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                log::warn!("error removing temporary file {:?}: {}", self.path, err);
            }
        }
    }
}

/// Atomically replace `path` with whatever `task` writes
///
/// Readers racing with this never observe a half-written file: the data
/// goes to a `~<i>` temp sibling first and is renamed over `path` only
/// after `task` succeeds. On error the temp file is removed.
pub fn safe_write(
    store: &Arc<dyn PathStore>,
    path: &Path,
    task: impl FnOnce(&mut dyn Write) -> Result<(), ImageError>,
) -> Result<(), ImageError> {
    let mut temp = TempFile::create(store, path)?;
    task(&mut temp)?;
    temp.commit(path)
}
