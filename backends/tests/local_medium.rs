use revsnap_backends::StoragePolicy;
use revsnap_core::{
    CriterionSpec, EncryptionAlgorithm, EncryptionPolicy, EntryStatus, Error, FilterSpec, IncrementalMedium,
    KdfParams, MediumConfig, MediumLayout, PayloadEncoding, RunControl,
};
use std::path::Path;

fn put(root: &Path, relative: &str, data: &[u8]) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, data).unwrap();
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31) ^ (i >> 7)) as u8).collect()
}

fn config(layout: MediumLayout) -> MediumConfig {
    MediumConfig {
        layout,
        filters: vec![FilterSpec {
            exclude: true,
            criterion: CriterionSpec::Extension {
                extensions: vec!["tmp".to_string()],
            },
        }],
        encryption: EncryptionPolicy::new(EncryptionAlgorithm::Aes256Gcm, "correct horse").unwrap(),
        kdf: KdfParams {
            memory: 1024,
            iterations: 1,
            parallelism: 1,
        },
        ..Default::default()
    }
}

async fn open(policy: &StoragePolicy, layout: MediumLayout) -> IncrementalMedium {
    let medium = IncrementalMedium::new(policy.connect().await.unwrap(), config(layout)).unwrap();
    medium.install().await.unwrap();
    medium
}

#[tokio::test]
async fn backup_and_restore_on_local_storage() {
    let workspace = tempfile::tempdir().unwrap();
    let source = workspace.path().join("source");
    let policy = StoragePolicy::Local {
        base_path: workspace.path().join("medium"),
    };

    let mut report_body = pattern(40_000);
    put(&source, "notes.txt", b"first draft");
    put(&source, "reports/q1.bin", &report_body);
    put(&source, "reports/scratch.tmp", b"ignore me");

    let medium = open(&policy, MediumLayout::Directory).await;
    let first = medium.backup(&source, &RunControl::new()).await.unwrap();
    assert_eq!(first.stored, 2);

    report_body[20_000..20_010].copy_from_slice(b"0123456789");
    report_body.extend_from_slice(b"appendix");
    put(&source, "reports/q1.bin", &report_body);
    std::fs::remove_file(source.join("notes.txt")).unwrap();
    drop(medium);

    // A fresh process sees the committed history on disk.
    let medium = open(&policy, MediumLayout::Directory).await;
    let second = medium.backup(&source, &RunControl::new()).await.unwrap();
    assert_eq!(second.version, 2);
    assert_eq!(second.delta_payloads, 1);

    let manifest = medium.manifest(2).await.unwrap();
    assert_eq!(manifest.get("notes.txt").unwrap().status, EntryStatus::Deleted);
    assert!(manifest.get("reports/scratch.tmp").is_none());
    let payload = manifest.get("reports/q1.bin").unwrap().payload.clone().unwrap();
    assert_eq!(payload.encoding, PayloadEncoding::Delta { base: 1, depth: 1 });

    let restored = workspace.path().join("restored");
    let report = medium.restore(2, &restored, None, &RunControl::new()).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(std::fs::read(restored.join("reports/q1.bin")).unwrap(), report_body);
    assert!(!restored.join("notes.txt").exists());

    let earlier = workspace.path().join("earlier");
    medium.restore(1, &earlier, Some("notes.txt"), &RunControl::new()).await.unwrap();
    assert_eq!(std::fs::read(earlier.join("notes.txt")).unwrap(), b"first draft");
}

#[tokio::test]
async fn every_layout_survives_reopen() {
    for layout in [
        MediumLayout::Directory,
        MediumLayout::Container,
        MediumLayout::Container64,
        MediumLayout::TarGz,
    ] {
        let workspace = tempfile::tempdir().unwrap();
        let source = workspace.path().join("source");
        let policy = StoragePolicy::Local {
            base_path: workspace.path().join("medium"),
        };
        put(&source, "a/b/c.txt", b"deep");
        put(&source, "big.bin", &pattern(70_000));

        open(&policy, layout).await.backup(&source, &RunControl::new()).await.unwrap();

        let medium = open(&policy, layout).await;
        let unchanged = medium.backup(&source, &RunControl::new()).await.unwrap();
        assert_eq!(unchanged.bytes_written, 0, "{layout}");

        let target = workspace.path().join("target");
        medium.restore(2, &target, None, &RunControl::new()).await.unwrap();
        assert_eq!(std::fs::read(target.join("a/b/c.txt")).unwrap(), b"deep");
        assert_eq!(std::fs::read(target.join("big.bin")).unwrap(), pattern(70_000));
    }
}

#[tokio::test]
async fn reopening_with_another_layout_is_refused() {
    let workspace = tempfile::tempdir().unwrap();
    let policy = StoragePolicy::Local {
        base_path: workspace.path().join("medium"),
    };
    open(&policy, MediumLayout::Container).await;

    let medium = IncrementalMedium::new(policy.connect().await.unwrap(), config(MediumLayout::TarGz)).unwrap();
    assert!(matches!(medium.install().await, Err(Error::Configuration(_))));
}
