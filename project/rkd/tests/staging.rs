mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::{bundle, tool_bundle};
use rkd::assets::Assets;
use rkd::error::StagingError;
use rkd::staging::{CURRENT_LINK, PREVIOUS_LINK, StagingLock, StagingManager, verify};

struct Fixture {
    _dir: tempfile::TempDir,
    data_dir: PathBuf,
    global_dir: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self {
            data_dir: dir.path().join("data-dir"),
            global_dir: dir.path().join("global"),
            _dir: dir,
        }
    }

    fn manager(&self, payload: Vec<u8>) -> StagingManager {
        StagingManager::new(Assets::from_bundle(payload)).with_global_dir(&self.global_dir)
    }

    fn data_root(&self) -> PathBuf {
        self.data_dir.join("data")
    }

    fn link(&self, name: &str) -> Option<PathBuf> {
        fs::read_link(self.data_root().join(name)).ok()
    }

    /// Entries of `data/` other than the lock and the links.
    fn versions(&self) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(self.data_root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| ![".lock", CURRENT_LINK, PREVIOUS_LINK].contains(&n.as_str()))
            .collect();
        names.sort();
        names
    }
}

fn version_of(payload: &[u8]) -> String {
    rkd::assets::bundle_name(payload)
        .trim_end_matches(".tar.gz")
        .to_string()
}

#[test]
fn extract_is_idempotent() {
    let fx = Fixture::new();
    let payload = tool_bundle("a");
    let manager = fx.manager(payload.clone());

    let first = manager.extract(&fx.data_dir).unwrap();
    assert_eq!(first, fx.data_root().join(version_of(&payload)));
    assert_eq!(fx.link(CURRENT_LINK), Some(first.clone()));
    assert!(fx.link(PREVIOUS_LINK).is_none());
    verify(&first).unwrap();

    // the second call must not need the lock
    let _held = StagingLock::acquire(&fx.data_root().join(".lock")).unwrap();
    let (tx, rx) = mpsc::channel();
    let data_dir = fx.data_dir.clone();
    thread::spawn(move || tx.send(manager.extract(&data_dir).unwrap()).unwrap());
    let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();

    assert_eq!(second, first);
    assert_eq!(fx.link(CURRENT_LINK), Some(first));
    assert_eq!(fx.versions(), [version_of(&payload)]);
}

#[test]
fn concurrent_extracts_publish_once() {
    let fx = Fixture::new();
    let payload = tool_bundle("race");
    let manager = Arc::new(fx.manager(payload.clone()));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            let barrier = barrier.clone();
            let data_dir = fx.data_dir.clone();
            thread::spawn(move || {
                barrier.wait();
                manager.extract(&data_dir).unwrap()
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let expected = fx.data_root().join(version_of(&payload));
    assert!(results.iter().all(|r| *r == expected));
    assert_eq!(fx.link(CURRENT_LINK), Some(expected.clone()));
    assert!(fx.link(PREVIOUS_LINK).is_none());
    assert_eq!(fx.versions(), [version_of(&payload)]);
    verify(&expected).unwrap();
}

#[test]
fn new_version_rotates_current_to_previous() {
    let fx = Fixture::new();
    let (a, b) = (tool_bundle("a"), tool_bundle("b"));

    let dir_a = fx.manager(a.clone()).extract(&fx.data_dir).unwrap();
    let dir_b = fx.manager(b.clone()).extract(&fx.data_dir).unwrap();

    assert_ne!(dir_a, dir_b);
    assert_eq!(fx.link(CURRENT_LINK), Some(dir_b.clone()));
    assert_eq!(fx.link(PREVIOUS_LINK), Some(dir_a.clone()));
    assert_eq!(
        fs::read_to_string(fx.data_root().join(CURRENT_LINK).join("bin/kubectl")).unwrap(),
        "#!/bin/sh\necho b\n"
    );

    let mut expected = vec![version_of(&a), version_of(&b)];
    expected.sort();
    assert_eq!(fx.versions(), expected);
}

#[test]
fn version_dir_left_unpublished_is_republished() {
    let fx = Fixture::new();
    let (a, b) = (tool_bundle("a"), tool_bundle("b"));
    let dir_a = fx.manager(a).extract(&fx.data_dir).unwrap();

    // a run that renamed b into place and died before touching the links
    let other = Fixture::new();
    let staged = other.manager(b.clone()).extract(&other.data_dir).unwrap();
    let dir_b = fx.data_root().join(version_of(&b));
    fs::rename(&staged, &dir_b).unwrap();
    assert_eq!(fx.link(CURRENT_LINK), Some(dir_a.clone()));

    assert_eq!(fx.manager(b).extract(&fx.data_dir).unwrap(), dir_b);
    assert_eq!(fx.link(CURRENT_LINK), Some(dir_b));
    assert_eq!(fx.link(PREVIOUS_LINK), Some(dir_a));
}

#[test]
fn failed_verification_leaves_current_alone() {
    let fx = Fixture::new();
    let good = tool_bundle("good");
    let dir_good = fx.manager(good).extract(&fx.data_dir).unwrap();

    let bad = bundle(&[("bin/kubectl", b"not executable", 0o644)]);
    let err = fx.manager(bad.clone()).extract(&fx.data_dir).unwrap_err();

    assert!(matches!(err, StagingError::Verification { .. }), "{err}");
    assert_eq!(fx.link(CURRENT_LINK), Some(dir_good));
    assert!(fx.link(PREVIOUS_LINK).is_none());
    assert!(!fx.data_root().join(version_of(&bad)).exists());
    assert!(!fx.data_root().join(format!("{}-tmp", version_of(&bad))).exists());
}

#[test]
fn bundle_without_bin_is_rejected() {
    let fx = Fixture::new();
    let payload = bundle(&[("README", b"hi", 0o644)]);
    let err = fx.manager(payload).extract(&fx.data_dir).unwrap_err();
    assert!(matches!(err, StagingError::Verification { .. }));
    assert!(fx.link(CURRENT_LINK).is_none());
}

#[test]
fn stale_tmp_dir_from_a_crash_is_replaced() {
    let fx = Fixture::new();
    let payload = tool_bundle("crash");
    let version = version_of(&payload);
    let stale = fx.data_root().join(format!("{version}-tmp"));
    fs::create_dir_all(stale.join("bin")).unwrap();
    fs::write(stale.join("bin/leftover"), b"half written").unwrap();

    let target = fx.manager(payload).extract(&fx.data_dir).unwrap();

    assert!(!stale.exists());
    assert!(!target.join("bin/leftover").exists());
    assert_eq!(fx.link(CURRENT_LINK), Some(target));
}

#[test]
fn corrupt_payload_is_an_extraction_error() {
    let fx = Fixture::new();
    let err = fx.manager(vec![b'x'; 1024]).extract(&fx.data_dir).unwrap_err();
    assert!(matches!(err, StagingError::Extraction { .. }), "{err}");
    assert!(fx.link(CURRENT_LINK).is_none());
    assert_eq!(fx.versions(), Vec::<String>::new());
}

#[test]
fn missing_payload_is_a_read_error() {
    let fx = Fixture::new();
    let manager = StagingManager::new(Assets::default()).with_global_dir(&fx.global_dir);
    let err = manager.extract(&fx.data_dir).unwrap_err();
    assert!(matches!(err, StagingError::PayloadRead { .. }));
    assert!(!fx.data_dir.exists());
}

#[test]
fn system_wide_install_wins() {
    let fx = Fixture::new();
    let payload = tool_bundle("global");
    let global_version = fx.global_dir.join("data").join(version_of(&payload));
    fs::create_dir_all(global_version.join("bin")).unwrap();

    let active = fx.manager(payload).extract(&fx.data_dir).unwrap();
    assert_eq!(active, global_version);
    assert!(!Path::new(&fx.data_dir).exists());
}
