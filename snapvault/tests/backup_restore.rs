use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde_json::{Value, json};
use snapvault::{prelude::*, store::StoreCall};
use tokio::io::AsyncReadExt;

struct Fixture {
    _temp: tempfile::TempDir,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().to_path_buf();
        fs::create_dir_all(root.join("uploads/avatars")).unwrap();
        fs::write(root.join("uploads/avatars/7.png"), [137u8, 80, 78, 71]).unwrap();
        fs::write(root.join("uploads/readme.txt"), b"uploaded").unwrap();
        fs::write(root.join("app-config.json"), br#"{"mail":"smtp.local"}"#).unwrap();
        Self { _temp: temp, root }
    }

    fn config(&self) -> EngineConfig {
        EngineConfig::default()
            .backup_dir(self.root.join("backups"))
            .work_dir(self.root.join("work"))
            .uploads_dir(self.root.join("uploads"))
            .config_file(self.root.join("app-config.json"))
            .dependency_order(["departments", "employees", "epf"])
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn work_is_empty(&self) -> bool {
        fs::read_dir(self.path("work")).map_or(true, |mut entries| entries.next().is_none())
    }
}

fn passphrase(text: &str) -> Passphrase {
    Passphrase::new(text).unwrap()
}

fn seeded_store() -> MemoryStore {
    MemoryStore::new()
        .with_collection(
            "departments",
            vec![json!({"_id": "hr", "name": "HR"}), json!({"_id": "ops", "name": "Ops"})],
        )
        .with_collection(
            "employees",
            vec![
                json!({"_id": 1, "name": "Ana", "dept": "hr"}),
                json!({"_id": 2, "name": "Ben", "dept": "ops"}),
            ],
        )
        .with_collection("epf", vec![json!({"_id": "e1", "employee": 1, "amount": 1200})])
        .with_collection("audit_log", vec![json!({"_id": "a1", "event": "login"})])
}

fn sorted(mut docs: Vec<Value>) -> Vec<Value> {
    docs.sort_by_key(ToString::to_string);
    docs
}

fn artifact_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

#[test_log::test(tokio::test)]
async fn round_trip_restores_collections_uploads_and_config() {
    let fx = Fixture::new();
    let source = seeded_store();
    let engine = SnapshotEngine::new(fx.config(), source.clone());
    let outcome = engine.create_backup(&passphrase("pw")).await.unwrap();
    assert_eq!(outcome.document_count(), 6);
    assert!(outcome.uploads_included && outcome.config_included);

    // restore into an empty data directory and a wiped uploads tree
    fs::remove_dir_all(fx.path("uploads")).unwrap();
    fs::write(fx.path("app-config.json"), b"{}").unwrap();
    let target_dir = fx.path("data");
    let target = JsonDirStore::new(&target_dir);
    let restore_engine = SnapshotEngine::new(fx.config(), target.clone());
    let report = restore_engine
        .restore_backup(&outcome.artifact.name, &passphrase("pw"))
        .await
        .unwrap();

    assert_eq!(report.documents_restored(), 6);
    assert_eq!(report.failed_documents(), 0);
    let conn = target.connect().await.unwrap();
    for name in ["departments", "employees", "epf", "audit_log"] {
        assert_eq!(
            sorted(conn.read_all(name).await.unwrap()),
            sorted(source.collection(name).unwrap()),
            "collection {name}"
        );
    }
    conn.close().await.unwrap();

    assert_eq!(report.uploads_restored, Some(2));
    assert_eq!(fs::read(fx.path("uploads/avatars/7.png")).unwrap(), [137u8, 80, 78, 71]);
    assert!(report.config_restored);
    assert_eq!(
        fs::read(fx.path("app-config.json")).unwrap(),
        br#"{"mail":"smtp.local"}"#
    );
    assert_eq!(fs::read(report.config_backup.unwrap()).unwrap(), b"{}");
    assert!(fx.work_is_empty());
}

#[test_log::test(tokio::test)]
async fn collections_restore_in_dependency_order_then_lexically() {
    let fx = Fixture::new();
    let store = MemoryStore::new()
        .with_collection("zz_reports", vec![json!({"_id": 1})])
        .with_collection("epf", vec![json!({"_id": 2})])
        .with_collection("audit_log", vec![json!({"_id": 3})])
        .with_collection("employees", vec![json!({"_id": 4})])
        .with_collection("departments", vec![json!({"_id": 5})]);
    let engine = SnapshotEngine::new(fx.config(), store.clone());
    let outcome = engine.create_backup(&passphrase("pw")).await.unwrap();

    store.clear_calls();
    let report = engine
        .restore_backup(&outcome.artifact.name, &passphrase("pw"))
        .await
        .unwrap();

    let order: Vec<_> = report.collections.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(
        order,
        ["departments", "employees", "epf", "audit_log", "zz_reports"]
    );
    let inserts: Vec<_> = store
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            StoreCall::InsertMany { collection, .. } => Some(collection),
            _ => None,
        })
        .collect();
    assert_eq!(
        inserts,
        ["departments", "employees", "epf", "audit_log", "zz_reports"]
    );
    // each collection is cleared immediately before its own insert
    let calls = store.calls();
    for (i, call) in calls.iter().enumerate() {
        if let StoreCall::InsertMany { collection, .. } = call {
            assert_eq!(calls[i - 1], StoreCall::DeleteAll(collection.clone()));
        }
    }
}

#[test_log::test(tokio::test)]
async fn missing_iv_fails_before_any_store_call() {
    let fx = Fixture::new();
    let store = seeded_store();
    let engine = SnapshotEngine::new(fx.config(), store.clone());
    let outcome = engine.create_backup(&passphrase("pw")).await.unwrap();
    fs::remove_file(&outcome.artifact.iv_path).unwrap();

    store.clear_calls();
    let err = engine
        .restore_backup(&outcome.artifact.name, &passphrase("pw"))
        .await
        .unwrap_err();
    assert!(matches!(err, SnapshotError::MissingIv { .. }), "{err}");
    assert!(store.calls().is_empty());
    assert_eq!(store.collection("employees").unwrap().len(), 2);
}

#[test_log::test(tokio::test)]
async fn wrong_passphrase_is_a_crypto_error_and_leaves_state_alone() {
    let fx = Fixture::new();
    let store = seeded_store();
    let engine = SnapshotEngine::new(fx.config(), store.clone());
    let outcome = engine.create_backup(&passphrase("right")).await.unwrap();

    store.clear_calls();
    let err = engine
        .restore_backup(&outcome.artifact.name, &passphrase("wrong"))
        .await
        .unwrap_err();
    assert!(err.is_crypto(), "{err}");
    assert!(store.calls().is_empty());
    assert_eq!(
        fs::read(fx.path("app-config.json")).unwrap(),
        br#"{"mail":"smtp.local"}"#
    );
    assert!(fx.work_is_empty());

    let err = engine
        .verify_backup(&outcome.artifact.name, &passphrase("wrong"))
        .await
        .unwrap_err();
    assert!(err.is_crypto());
}

#[test_log::test(tokio::test)]
async fn empty_snapshot_does_not_clear_live_collection() {
    let fx = Fixture::new();
    let store = seeded_store().with_collection("epf", vec![]);
    let engine = SnapshotEngine::new(fx.config(), store.clone());
    let outcome = engine.create_backup(&passphrase("pw")).await.unwrap();

    store.set_collection("epf", vec![json!({"_id": "added-later"})]);
    store.clear_calls();
    let report = engine
        .restore_backup(&outcome.artifact.name, &passphrase("pw"))
        .await
        .unwrap();

    let epf = report.collections.iter().find(|c| c.name == "epf").unwrap();
    assert!(epf.skipped_empty);
    assert_eq!(store.collection("epf").unwrap(), vec![json!({"_id": "added-later"})]);
    assert!(!store.calls().contains(&StoreCall::DeleteAll("epf".into())));
}

#[test_log::test(tokio::test)]
async fn delete_failure_aborts_restore_and_releases_connection() {
    let fx = Fixture::new();
    let store = seeded_store();
    let engine = SnapshotEngine::new(fx.config(), store.clone());
    let outcome = engine.create_backup(&passphrase("pw")).await.unwrap();

    store.fail_deletes_on("employees");
    store.clear_calls();
    let err = engine
        .restore_backup(&outcome.artifact.name, &passphrase("pw"))
        .await
        .unwrap_err();
    assert!(matches!(err, SnapshotError::CollectionDelete { .. }), "{err}");
    assert_eq!(store.open_connections(), 0);
    assert_eq!(store.calls().last(), Some(&StoreCall::Close));
    assert!(
        !store
            .calls()
            .contains(&StoreCall::DeleteAll("epf".into()))
    );
    // the auxiliary restore never ran
    assert_eq!(fs::read_dir(&fx.root).unwrap().count(), 4);
    assert!(fx.work_is_empty());
}

#[test_log::test(tokio::test)]
async fn rejected_documents_are_surfaced_in_the_report() {
    let fx = Fixture::new();
    // the second and third documents cannot pass the unique `_id` / object checks on insert
    let store = MemoryStore::new().with_collection(
        "employees",
        vec![json!({"_id": 1}), json!({"_id": 1}), json!(42)],
    );
    let engine = SnapshotEngine::new(fx.config(), store.clone());
    let outcome = engine.create_backup(&passphrase("pw")).await.unwrap();

    let report = engine
        .restore_backup(&outcome.artifact.name, &passphrase("pw"))
        .await
        .unwrap();
    let employees = &report.collections[0];
    assert_eq!(employees.staged, 3);
    assert_eq!(employees.deleted, 3);
    assert_eq!(employees.inserted, 1);
    let rejected: Vec<_> = employees.failures.iter().map(|f| f.index).collect();
    assert_eq!(rejected, vec![1, 2]);
    assert_eq!(report.failed_documents(), 2);
    assert_eq!(store.collection("employees").unwrap(), vec![json!({"_id": 1})]);
}

#[test_log::test(tokio::test)]
async fn retention_keeps_three_newest_with_their_ivs() {
    let fx = Fixture::new();
    let engine = SnapshotEngine::new(fx.config(), seeded_store());
    let mut names = Vec::new();
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let outcome = engine.create_backup(&passphrase("pw")).await.unwrap();
        names.push(outcome.artifact.name);
    }

    let files = artifact_files(&fx.path("backups"));
    let mut expected = Vec::new();
    for name in &names[2..] {
        expected.push(name.clone());
        expected.push(format!("{name}.iv"));
    }
    expected.sort();
    assert_eq!(files, expected);

    let listed: Vec<_> = engine
        .list_backups()
        .unwrap()
        .into_iter()
        .map(|a| a.name)
        .collect();
    assert_eq!(listed, names[2..].iter().rev().cloned().collect::<Vec<_>>());

    let report = engine.cleanup_old_backups().await.unwrap();
    assert_eq!(report.kept.len(), 3);
    assert!(report.removed.is_empty());
}

#[test_log::test(tokio::test)]
async fn download_streams_the_stored_ciphertext() {
    let fx = Fixture::new();
    let engine = SnapshotEngine::new(fx.config(), seeded_store());
    let outcome = engine.create_backup(&passphrase("pw")).await.unwrap();

    let (artifact, mut file) = engine.open_artifact(&outcome.artifact.name).await.unwrap();
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).await.unwrap();
    assert_eq!(bytes, fs::read(&artifact.path).unwrap());
    assert_eq!(bytes.len() as u64, artifact.size);

    assert!(matches!(
        engine.open_artifact("../etc/passwd.zip.enc").await,
        Err(SnapshotError::InvalidArtifactName { .. })
    ));
}

#[test_log::test(tokio::test)]
async fn verify_lists_entries_without_touching_the_store() {
    let fx = Fixture::new();
    let store = seeded_store();
    let engine = SnapshotEngine::new(fx.config(), store.clone());
    let outcome = engine.create_backup(&passphrase("pw")).await.unwrap();

    store.clear_calls();
    let report = engine
        .verify_backup(&outcome.artifact.name, &passphrase("pw"))
        .await
        .unwrap();
    assert!(store.calls().is_empty());
    let manifest = report.manifest.unwrap();
    assert_eq!(manifest.collections.len(), 4);
    assert_eq!(manifest.config_file_name.as_deref(), Some("app-config.json"));
    let paths: Vec<_> = report.entries.iter().map(|e| e.path.as_str()).collect();
    assert!(paths.contains(&"collections/employees.json"));
    assert!(paths.contains(&"uploads/avatars/7.png"));
    assert!(paths.contains(&"config/app-config.json"));
    assert!(paths.contains(&"manifest.json"));
    assert!(fx.work_is_empty());
}

#[test_log::test(tokio::test)]
async fn backup_without_uploads_or_config_still_succeeds() {
    let fx = Fixture::new();
    fs::remove_dir_all(fx.path("uploads")).unwrap();
    fs::remove_file(fx.path("app-config.json")).unwrap();
    let engine = SnapshotEngine::new(fx.config(), seeded_store());
    let outcome = engine.create_backup(&passphrase("pw")).await.unwrap();
    assert!(!outcome.uploads_included);
    assert!(!outcome.config_included);

    let report = engine
        .restore_backup(&outcome.artifact.name, &passphrase("pw"))
        .await
        .unwrap();
    assert_eq!(report.uploads_restored, None);
    assert!(!report.config_restored);
    assert!(!fx.path("app-config.json").exists());
}

#[test_log::test(tokio::test)]
async fn read_failure_aborts_backup_without_leaving_files() {
    let fx = Fixture::new();
    let store = seeded_store();
    store.fail_reads_on("epf");
    let engine = SnapshotEngine::new(fx.config(), store.clone());

    let err = engine.create_backup(&passphrase("pw")).await.unwrap_err();
    assert!(matches!(err, SnapshotError::Store { .. }), "{err}");
    assert_eq!(store.open_connections(), 0);
    assert_eq!(store.calls().last(), Some(&StoreCall::Close));

    let leftovers = fs::read_dir(fx.path("backups")).map_or(0, |entries| entries.count());
    assert_eq!(leftovers, 0);
    assert!(engine.list_backups().unwrap().is_empty());
    assert!(fx.work_is_empty());
}

#[test_log::test(tokio::test)]
async fn ids_differing_only_in_json_type_survive_round_trip() {
    let fx = Fixture::new();
    let docs = vec![json!({"_id": 1, "n": "a"}), json!({"_id": "1", "n": "b"})];
    let store = MemoryStore::new().with_collection("employees", docs.clone());
    let engine = SnapshotEngine::new(fx.config(), store.clone());
    let outcome = engine.create_backup(&passphrase("pw")).await.unwrap();

    store.set_collection("employees", vec![]);
    let report = engine
        .restore_backup(&outcome.artifact.name, &passphrase("pw"))
        .await
        .unwrap();
    assert_eq!(report.failed_documents(), 0);
    assert_eq!(sorted(store.collection("employees").unwrap()), sorted(docs));
}
