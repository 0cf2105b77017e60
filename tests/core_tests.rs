use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use tempfile::TempDir;
use tpm::config::{Arch, ColorPolicy, Config};
use tpm::github::GithubClient;
use tpm::manifest::{InstalledTool, Manifest, ToolId, ToolPatch};
use tpm::transaction::Transaction;
use tpm::TpmError;

fn test_config(dir: &TempDir) -> Config {
    let prefix = dir.path().join("prefix");
    Config {
        bin_dir: prefix.join("bin"),
        lib_dir: prefix.join("lib").join("tpm"),
        store_root: prefix.join("tpm").join("store"),
        tmp_dir: prefix.join("tpm").join("tmp"),
        manifest_file: dir.path().join("home").join(".tpm").join("manifest"),
        prefix,
        timeout: std::time::Duration::from_secs(5),
        max_retries: 0,
        color: ColorPolicy::Never,
        arch: Arch::Arm64,
    }
}

fn record(id: &str, version: &str) -> InstalledTool {
    let tool: ToolId = id.parse().unwrap();
    let name = tool.repo.clone();
    InstalledTool::new(
        tool,
        version,
        &name,
        PathBuf::from(format!("/store/{id}/1/bin/{name}")),
        PathBuf::from(format!("/prefix/bin/{name}")),
    )
}

#[test]
fn manifest_round_trips_through_save_and_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("manifest");

    let mut manifest = Manifest::load(&path).unwrap();
    manifest.add(record("example/hello", "v1.2.3")).unwrap();
    manifest.add(record("other/tool", "0.9")).unwrap();
    manifest
        .update(
            &"other/tool".parse().unwrap(),
            ToolPatch {
                version: Some("1.0".to_string()),
                checksum: Some("sha256:abcd".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    let before: Vec<InstalledTool> = manifest.records().to_vec();
    manifest.save().unwrap();
    assert!(!manifest.is_dirty());

    let reloaded = Manifest::load(&path).unwrap();
    assert_eq!(reloaded.records(), before.as_slice());
}

#[test]
fn manifest_preserves_unknown_keys() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("manifest");
    fs::write(
        &path,
        "tool=example/hello\nversion=v1.0\nbinary=hello\nstore_path=/s/bin/hello\n\
         symlink_path=/b/hello\ninstalled_at=2024-01-01T00:00:00Z\npin=true\n---\n",
    )
    .unwrap();

    let mut manifest = Manifest::load(&path).unwrap();
    let id: ToolId = "example/hello".parse().unwrap();
    assert_eq!(manifest.get(&id).unwrap().extras.get("pin").unwrap(), "true");

    manifest
        .update(
            &id,
            ToolPatch {
                version: Some("v1.1".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    manifest.save().unwrap();
    let written = fs::read_to_string(&path).unwrap();
    assert!(written.contains("pin=true"));
    assert!(written.contains("version=v1.1"));
}

#[test]
fn manifest_skips_blocks_without_tool_key() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("manifest");
    fs::write(
        &path,
        "# comment\nversion=v1.0\nbinary=ghost\n---\n\
         tool=example/hello\nversion=v1.0\nbinary=hello\nstore_path=/s\nsymlink_path=/b\n---\n",
    )
    .unwrap();
    let manifest = Manifest::load(&path).unwrap();
    assert_eq!(manifest.records().len(), 1);
}

#[test]
fn manifest_rejects_duplicates_and_id_changes() {
    let dir = TempDir::new().unwrap();
    let mut manifest = Manifest::load(dir.path().join("manifest")).unwrap();
    manifest.add(record("example/hello", "v1.0")).unwrap();
    assert!(matches!(
        manifest.add(record("example/hello", "v2.0")),
        Err(TpmError::AlreadyExists(_))
    ));
    assert!(matches!(
        manifest.update(
            &"example/hello".parse().unwrap(),
            ToolPatch {
                tool: Some("example/renamed".parse().unwrap()),
                ..Default::default()
            },
        ),
        Err(TpmError::Usage(_))
    ));
    assert!(matches!(
        manifest.remove(&"missing/tool".parse().unwrap()),
        Err(TpmError::NotFound(_))
    ));
}

#[test]
fn manifest_file_is_private() {
    use std::os::unix::fs::PermissionsExt;
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("manifest");
    let mut manifest = Manifest::load(&path).unwrap();
    manifest.add(record("example/hello", "v1.0")).unwrap();
    manifest.save().unwrap();
    let mode = fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn tool_id_validation() {
    assert!("example/hello".parse::<ToolId>().is_ok());
    assert!("ex.ample-2/he_llo".parse::<ToolId>().is_ok());
    assert!("justaname".parse::<ToolId>().is_err());
    assert!("bad owner/repo".parse::<ToolId>().is_err());
    assert!("owner/".parse::<ToolId>().is_err());
}

#[test]
fn rollback_runs_all_steps_in_reverse_and_counts_failures() {
    let dir = TempDir::new().unwrap();
    let mut tx = Transaction::new(dir.path().join("backup"));
    tx.begin("install", "example/hello").unwrap();

    let order = Rc::new(RefCell::new(Vec::new()));
    for i in 0..5 {
        let order = Rc::clone(&order);
        tx.record(&format!("step {i}"), move || {
            order.borrow_mut().push(i);
            if i == 1 || i == 3 {
                Err(std::io::Error::other("boom"))
            } else {
                Ok(())
            }
        });
    }

    let failed = tx.rollback();
    assert_eq!(failed, 2);
    assert_eq!(*order.borrow(), vec![4, 3, 2, 1, 0]);
    assert!(!tx.is_active());
}

#[test]
fn commit_discards_recorded_steps() {
    let dir = TempDir::new().unwrap();
    let mut tx = Transaction::new(dir.path().join("backup"));
    tx.begin("install", "example/hello").unwrap();
    let ran = Rc::new(RefCell::new(false));
    let flag = Rc::clone(&ran);
    tx.record("never", move || {
        *flag.borrow_mut() = true;
        Ok(())
    });
    tx.commit().unwrap();
    assert_eq!(tx.rollback(), 0);
    assert!(!*ran.borrow());
}

#[test]
fn only_one_transaction_at_a_time() {
    let dir = TempDir::new().unwrap();
    let mut tx = Transaction::new(dir.path().join("backup"));
    tx.begin("install", "a/b").unwrap();
    assert!(tx.begin("install", "c/d").is_err());
    tx.rollback();
    tx.begin("install", "c/d").unwrap();
}

#[test]
fn record_remove_restores_file_content() {
    let dir = TempDir::new().unwrap();
    let victim = dir.path().join("data.txt");
    fs::write(&victim, "important").unwrap();

    let mut tx = Transaction::new(dir.path().join("backup"));
    tx.begin("remove", "example/hello").unwrap();
    tx.record_remove(&victim).unwrap();
    fs::remove_file(&victim).unwrap();
    assert!(!victim.exists());

    assert_eq!(tx.rollback(), 0);
    assert_eq!(fs::read_to_string(&victim).unwrap(), "important");
}

#[test]
fn record_symlink_restores_previous_target() {
    let dir = TempDir::new().unwrap();
    let old_target = dir.path().join("old");
    let new_target = dir.path().join("new");
    fs::write(&old_target, "old").unwrap();
    fs::write(&new_target, "new").unwrap();
    let link = dir.path().join("link");
    std::os::unix::fs::symlink(&old_target, &link).unwrap();

    let mut tx = Transaction::new(dir.path().join("backup"));
    tx.begin("install", "example/hello").unwrap();
    tx.record_symlink(&new_target, &link).unwrap();
    fs::remove_file(&link).unwrap();
    std::os::unix::fs::symlink(&new_target, &link).unwrap();

    assert_eq!(tx.rollback(), 0);
    assert_eq!(fs::read_link(&link).unwrap(), old_target);
}

#[test]
fn record_symlink_removes_link_that_did_not_exist() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("target");
    fs::write(&target, "x").unwrap();
    let link = dir.path().join("link");

    let mut tx = Transaction::new(dir.path().join("backup"));
    tx.begin("install", "example/hello").unwrap();
    tx.record_symlink(&target, &link).unwrap();
    std::os::unix::fs::symlink(&target, &link).unwrap();

    assert_eq!(tx.rollback(), 0);
    assert!(link.symlink_metadata().is_err());
}

#[test]
fn safe_move_restores_both_sides() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src.txt");
    let dst = dir.path().join("dst.txt");
    fs::write(&src, "payload").unwrap();
    fs::write(&dst, "previous").unwrap();

    let mut tx = Transaction::new(dir.path().join("backup"));
    tx.begin("install", "example/hello").unwrap();
    tx.safe_move(&src, &dst).unwrap();
    assert!(!src.exists());
    assert_eq!(fs::read_to_string(&dst).unwrap(), "payload");

    assert_eq!(tx.rollback(), 0);
    assert_eq!(fs::read_to_string(&src).unwrap(), "payload");
    assert_eq!(fs::read_to_string(&dst).unwrap(), "previous");
}

#[test]
fn safe_copy_undoes_the_copy_and_restores_the_destination() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src.txt");
    let fresh = dir.path().join("fresh.txt");
    let occupied = dir.path().join("occupied.txt");
    fs::write(&src, "payload").unwrap();
    fs::write(&occupied, "previous").unwrap();

    let mut tx = Transaction::new(dir.path().join("backup"));
    tx.begin("install", "example/hello").unwrap();
    tx.safe_copy(&src, &fresh).unwrap();
    tx.safe_copy(&src, &occupied).unwrap();
    assert_eq!(fs::read_to_string(&occupied).unwrap(), "payload");

    assert_eq!(tx.rollback(), 0);
    assert!(src.exists());
    assert!(!fresh.exists());
    assert_eq!(fs::read_to_string(&occupied).unwrap(), "previous");
}

#[test]
fn record_mkdir_removes_only_created_directories() {
    let dir = TempDir::new().unwrap();
    let pre_existing = dir.path().join("keep");
    fs::create_dir(&pre_existing).unwrap();
    let created = pre_existing.join("a").join("b");

    let mut tx = Transaction::new(dir.path().join("backup"));
    tx.begin("install", "example/hello").unwrap();
    tx.record_mkdir(&pre_existing).unwrap();
    tx.record_mkdir(&created).unwrap();

    assert_eq!(tx.rollback(), 0);
    assert!(pre_existing.exists());
    assert!(!pre_existing.join("a").exists());
}

#[test]
fn version_compare_is_antisymmetric_and_transitive() {
    let samples = [
        "v1.2.3", "1.2.4", "1.2", "2024.05.01", "1.2.3-rc1", "1.2.3-rc2", "0.1",
        "10.0", "nightly", "v0.0.1",
    ];
    for a in samples {
        for b in samples {
            assert_eq!(
                tpm::version::compare(a, b),
                tpm::version::compare(b, a).reverse(),
                "compare({a}, {b})"
            );
            for c in samples {
                use std::cmp::Ordering::Less;
                if tpm::version::compare(a, b) == Less && tpm::version::compare(b, c) == Less {
                    assert_eq!(tpm::version::compare(a, c), Less, "{a} < {b} < {c}");
                }
            }
        }
    }
}

#[test]
fn selected_asset_matches_host_arch() {
    use tpm::github::{select_asset, Release, ReleaseAsset};
    let arches = [
        (Arch::Arm64, "arm64"),
        (Arch::Arm, "arm"),
        (Arch::I686, "i686"),
        (Arch::X86_64, "x86_64"),
    ];
    let assets: Vec<ReleaseAsset> = arches
        .iter()
        .map(|(_, token)| ReleaseAsset {
            name: format!("tool-linux-{token}.tar.gz"),
            browser_download_url: format!("https://example.invalid/tool-linux-{token}.tar.gz"),
            size: 4096,
        })
        .collect();
    let release = Release {
        tag_name: "v1.0.0".to_string(),
        body: None,
        assets,
    };
    for (arch, token) in arches {
        let picked = select_asset(&release, arch).unwrap();
        assert_eq!(picked.name, format!("tool-linux-{token}.tar.gz"));
    }
}

#[test]
fn rate_limit_gate_fails_fast_without_network() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    fs::create_dir_all(&config.tmp_dir).unwrap();

    let mut client = GithubClient::new(&config).unwrap();
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    client.note_rate_limit(0, now + 30);

    let err = client
        .api_request("repos/example/hello/releases/latest")
        .unwrap_err();
    match err {
        TpmError::RateLimited { wait_seconds } => {
            assert!((30..=40).contains(&wait_seconds), "wait was {wait_seconds}");
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}
