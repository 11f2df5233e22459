//! One-shot operation state: stores, config, and registry clients

use crate::{
    config::Config,
    errors::ImageError,
    image::ImageName,
    index::ImageIndex,
    registry::{HttpRegistryClient, RegistryClient},
    storage::{BlobStore, KeyValueCache, OsStore, OverlayStore, PathStore},
};
use regex::Regex;
use std::{
    collections::HashMap,
    env, fs, io,
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;

/// Where a [State] keeps its data
#[derive(Clone, Debug)]
pub struct StateSettings {
    /// State directory holding blobs and cache records
    pub cache_dir: PathBuf,
    /// YAML config file with registry credentials
    pub config_file: PathBuf,
    /// Keep all state changes in memory, reading through to the disk state
    pub memory_cache: bool,
}

impl StateSettings {
    /// Resolve default locations from `PORTER_CACHE`/`PORTER_CONFIG` or the
    /// per-user cache and config directories
    pub fn new() -> Result<Self, ImageError> {
        Ok(StateSettings {
            cache_dir: default_cache_dir()?,
            config_file: default_config_file()?,
            memory_cache: false,
        })
    }
}

/// Determine the state directory used when none is configured
pub fn default_cache_dir() -> Result<PathBuf, ImageError> {
    match env::var("PORTER_CACHE") {
        Ok(dir) if !dir.is_empty() => Ok(resolve_path(Path::new(&dir))),
        _ => match directories_next::ProjectDirs::from("", "", "porter") {
            Some(dirs) => Ok(dirs.cache_dir().to_path_buf()),
            None => Err(ImageError::IllegalState(
                "can't determine where to cache image files".to_owned(),
            )),
        },
    }
}

/// Determine the config file used when none is configured
pub fn default_config_file() -> Result<PathBuf, ImageError> {
    match env::var("PORTER_CONFIG") {
        Ok(file) if !file.is_empty() => Ok(resolve_path(Path::new(&file))),
        _ => match directories_next::ProjectDirs::from("", "", "porter") {
            Some(dirs) => Ok(dirs.config_dir().join("porter.yaml")),
            None => Err(ImageError::IllegalState(
                "can't determine a per-user config directory".to_owned(),
            )),
        },
    }
}

/// Resolve a possibly-relative path against the working directory and
/// clean out `.` and `..` components
pub fn resolve_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };
    let mut cleaned = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}

/// Everything one porter invocation operates on
///
/// Owns the path store, blob store, key-value cache, image index, loaded
/// config, and a lazily-populated cache of registry clients. Clones share
/// all of it, so concurrent download tasks can hold their own handle.
#[derive(Clone)]
pub struct State {
    config: Config,
    config_file: PathBuf,
    store: Arc<dyn PathStore>,
    blobs: BlobStore,
    cache: KeyValueCache,
    index: ImageIndex,
    registries: Arc<RwLock<HashMap<String, Arc<dyn RegistryClient>>>>,
}

impl State {
    pub fn new(settings: &StateSettings) -> Result<State, ImageError> {
        fs::create_dir_all(&settings.cache_dir)?;
        let config = match fs::File::open(&settings.config_file) {
            Ok(file) => Config::load(file)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Config::default(),
            Err(err) => return Err(err.into()),
        };

        let os_store: Arc<dyn PathStore> = Arc::new(OsStore::new(settings.cache_dir.clone()));
        let store: Arc<dyn PathStore> = if settings.memory_cache {
            Arc::new(OverlayStore::new(os_store))
        } else {
            os_store
        };

        let blobs = BlobStore::new(store.clone());
        let cache = KeyValueCache::new(store.clone());
        let index = ImageIndex::new(cache.clone());
        Ok(State {
            config,
            config_file: settings.config_file.clone(),
            store,
            blobs,
            cache,
            index,
            registries: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn index(&self) -> &ImageIndex {
        &self.index
    }

    pub(crate) fn cache(&self) -> &KeyValueCache {
        &self.cache
    }

    pub(crate) fn store(&self) -> &Arc<dyn PathStore> {
        &self.store
    }

    pub fn min_temporary_age(&self) -> Duration {
        self.config.min_temporary_age()
    }

    /// The registry client for an image's registry server
    ///
    /// Clients are created lazily and cached per registry string. Lookup
    /// takes the read lock; creation takes the write lock with a second
    /// check so racing tasks end up sharing one client.
    pub async fn registry_for(
        &self,
        image: &ImageName,
    ) -> Result<Arc<dyn RegistryClient>, ImageError> {
        let registry = image.registry_str().to_owned();
        {
            let registries = self.registries.read().await;
            if let Some(client) = registries.get(&registry) {
                return Ok(client.clone());
            }
        }

        let mut registries = self.registries.write().await;
        if let Some(client) = registries.get(&registry) {
            return Ok(client.clone());
        }
        let credentials = self.config.credentials_for(&registry).cloned();
        let client: Arc<dyn RegistryClient> =
            Arc::new(HttpRegistryClient::new(&registry, credentials)?);
        registries.insert(registry, client.clone());
        Ok(client)
    }

    /// Copy a manifest record under a new reference
    pub fn tag(&self, source: &ImageName, target: &ImageName) -> Result<(), ImageError> {
        self.index.tag(source, target)
    }

    /// Store credentials for a registry server in the config file
    pub fn login(
        &mut self,
        username: &str,
        password: &str,
        server: &str,
    ) -> Result<(), ImageError> {
        lazy_static! {
            static ref SERVER: Regex =
                Regex::new("^[a-zA-Z0-9][a-zA-Z0-9.-]*(?::[0-9]+)?$").unwrap();
        }
        if !SERVER.is_match(server) {
            return Err(ImageError::IllegalArgument(format!(
                "invalid registry server: {:?}",
                server
            )));
        }

        self.config.auths.insert(
            server.to_owned(),
            crate::config::AuthConfig {
                username: username.to_owned(),
                password: password.to_owned(),
            },
        );

        if let Some(parent) = self.config_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_yaml::to_string(&self.config)?;
        fs::write(&self.config_file, payload)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.config_file, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_path_cleans_components() {
        let cwd = env::current_dir().unwrap();
        assert_eq!(resolve_path(Path::new("x/../y")), cwd.join("y"));
        assert_eq!(resolve_path(Path::new("./z")), cwd.join("z"));
        assert_eq!(resolve_path(Path::new("/a/b/../c")), PathBuf::from("/a/c"));
    }

    #[test]
    fn login_round_trips_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let settings = StateSettings {
            cache_dir: dir.path().join("cache"),
            config_file: dir.path().join("config/porter.yaml"),
            memory_cache: false,
        };
        let mut state = State::new(&settings).unwrap();
        state.login("user", "secret", "registry.example.com").unwrap();

        let reloaded = State::new(&settings).unwrap();
        let auth = reloaded
            .config
            .credentials_for("registry.example.com")
            .unwrap();
        assert_eq!(auth.username, "user");
        assert_eq!(auth.password, "secret");

        assert!(state.login("user", "pw", "not a host").is_err());
    }
}
