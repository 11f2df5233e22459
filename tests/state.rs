use porter::{BlobStore, BuildArgs, CancelToken, ImageName, State, StateSettings};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tokio::runtime::Runtime;

fn test_state(dir: &Path) -> State {
    let _ = env_logger::builder().is_test(true).try_init();
    State::new(&StateSettings {
        cache_dir: dir.join("cache"),
        config_file: dir.join("porter.yaml"),
        memory_cache: false,
    })
    .unwrap()
}

async fn build_image(
    state: &State,
    dir: &Path,
    tag: &str,
    content: &str,
    cancel: &CancelToken,
) -> ImageName {
    let context = dir.join(format!("context-{}", content));
    fs::create_dir_all(&context).unwrap();
    fs::write(
        context.join("Dockerfile"),
        "FROM scratch\nCOPY ./payload /payload\n",
    )
    .unwrap();
    fs::write(context.join("payload"), content).unwrap();
    let args = BuildArgs {
        tag: Some(tag.to_owned()),
        ..BuildArgs::default()
    };
    state.build(&args, &context, cancel).await.unwrap();
    ImageName::parse(tag).unwrap()
}

fn blob_files(state: &State, cache_dir: &Path, image: &ImageName) -> Vec<PathBuf> {
    let manifest = state.index().load(image).unwrap().unwrap();
    manifest
        .descriptors()
        .map(|desc| cache_dir.join(BlobStore::blob_path(desc)))
        .collect()
}

#[test]
fn tag_lists_both_names_with_one_image_id() {
    Runtime::new().unwrap().block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let cancel = CancelToken::new();
        let name = build_image(&state, dir.path(), "porter-test/app:latest", "v1", &cancel).await;
        let tagged = ImageName::parse("porter-test/app:x").unwrap();
        state.tag(&name, &tagged).unwrap();

        let rows = state.images().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].short_id(), rows[1].short_id());
        assert_eq!(rows[0].size, rows[1].size);
        let tags: Vec<&str> = rows.iter().map(|row| row.name.identifier()).collect();
        assert!(tags.contains(&"latest") && tags.contains(&"x"));

        // tag copies the record byte for byte
        let a = state.index().load(&name).unwrap().unwrap();
        let b = state.index().load(&tagged).unwrap().unwrap();
        assert_eq!(a.raw(), b.raw());
    })
}

#[test]
fn inspect_merges_tags_of_one_config() {
    Runtime::new().unwrap().block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let cancel = CancelToken::new();
        let name = build_image(&state, dir.path(), "porter-test/app:latest", "v1", &cancel).await;
        let tagged = ImageName::parse("porter-test/app:x").unwrap();
        state.tag(&name, &tagged).unwrap();

        let inspected = state.inspect(&[name.clone(), tagged.clone()]).unwrap();
        assert_eq!(inspected.len(), 1);
        assert_eq!(
            inspected[0].repo_tags,
            vec![name.as_str().to_owned(), tagged.as_str().to_owned()]
        );
        assert_eq!(inspected[0].os, "linux");
        assert_eq!(inspected[0].rootfs.layers.len(), 1);
    })
}

#[test]
fn remove_collects_unreferenced_blobs() {
    Runtime::new().unwrap().block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        let state = test_state(dir.path());
        let cancel = CancelToken::new();

        let keep = build_image(&state, dir.path(), "porter-test/keep:latest", "keep", &cancel).await;
        let gone = build_image(&state, dir.path(), "porter-test/drop:latest", "drop", &cancel).await;

        let keep_blobs = blob_files(&state, &cache_dir, &keep);
        let gone_blobs = blob_files(&state, &cache_dir, &gone);
        for path in keep_blobs.iter().chain(gone_blobs.iter()) {
            assert!(path.exists(), "{:?}", path);
        }

        // an unreferenced stray file is garbage
        let stray = cache_dir.join("stray.bin");
        fs::write(&stray, b"junk").unwrap();
        // a fresh temporary file is within the grace period
        let temp = cache_dir.join("upload.tar.gz~0");
        fs::write(&temp, b"partial").unwrap();

        state.remove(&[gone.clone()], &cancel).await.unwrap();

        assert!(state.index().load(&gone).unwrap().is_none());
        assert!(state.index().load(&keep).unwrap().is_some());
        for path in &keep_blobs {
            assert!(path.exists(), "kept blob removed: {:?}", path);
        }
        for path in &gone_blobs {
            assert!(!path.exists(), "dropped blob kept: {:?}", path);
        }
        assert!(!stray.exists());
        assert!(temp.exists(), "young temp file must survive the gc");
    })
}

#[test]
fn remove_spares_blobs_still_referenced_by_another_tag() {
    Runtime::new().unwrap().block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        let state = test_state(dir.path());
        let cancel = CancelToken::new();

        let name = build_image(&state, dir.path(), "porter-test/app:latest", "v1", &cancel).await;
        let tagged = ImageName::parse("porter-test/app:x").unwrap();
        state.tag(&name, &tagged).unwrap();

        let blobs = blob_files(&state, &cache_dir, &name);
        state.remove(&[name.clone()], &cancel).await.unwrap();

        assert!(state.index().load(&name).unwrap().is_none());
        assert!(state.index().load(&tagged).unwrap().is_some());
        for path in &blobs {
            assert!(path.exists(), "shared blob removed: {:?}", path);
        }
    })
}

#[test]
fn save_then_remove_collects_unpacked_layers() {
    Runtime::new().unwrap().block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        let state = test_state(dir.path());
        let cancel = CancelToken::new();

        let name = build_image(&state, dir.path(), "porter-test/app:latest", "v1", &cancel).await;
        state
            .save(Vec::new(), vec![name.clone()], &cancel)
            .await
            .unwrap();

        // saving created an unpacked .tar sibling for the layer
        let unpacked: Vec<PathBuf> = walk_files(&cache_dir)
            .into_iter()
            .filter(|path| path.extension().map(|ext| ext == "tar").unwrap_or(false))
            .collect();
        assert!(!unpacked.is_empty());

        state.remove(&[name.clone()], &cancel).await.unwrap();
        for path in &unpacked {
            assert!(!path.exists(), "unpacked layer kept: {:?}", path);
        }
    })
}

#[test]
fn memory_cache_leaves_disk_untouched() {
    Runtime::new().unwrap().block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        fs::create_dir_all(&cache_dir).unwrap();
        let _ = env_logger::builder().is_test(true).try_init();

        let state = State::new(&StateSettings {
            cache_dir: cache_dir.clone(),
            config_file: dir.path().join("porter.yaml"),
            memory_cache: true,
        })
        .unwrap();
        let cancel = CancelToken::new();
        let name = build_image(&state, dir.path(), "porter-test/mem:latest", "v1", &cancel).await;
        assert!(state.index().load(&name).unwrap().is_some());

        // nothing was written through to the host state directory
        assert!(walk_files(&cache_dir).is_empty());
    })
}

fn walk_files(dir: &Path) -> Vec<PathBuf> {
    let mut result = Vec::new();
    let mut queue = vec![dir.to_path_buf()];
    while let Some(next) = queue.pop() {
        let entries = match fs::read_dir(&next) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                queue.push(path);
            } else {
                result.push(path);
            }
        }
    }
    result
}
