use std::fs;

use agent_gateway::sessions::SessionStore;
use agent_gateway::AppError;
use chrono::{TimeZone, Utc};

fn open_store(temp: &tempfile::TempDir) -> SessionStore {
    SessionStore::open("coder", &temp.path().join("sessions"), ".jsonl").expect("open store")
}

#[test]
fn open_creates_canonical_root() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open_store(&temp);

    assert!(store.root().is_dir());
    assert_eq!(
        store.root(),
        temp.path().join("sessions").canonicalize().expect("canonical")
    );
}

#[test]
fn sync_index_discovers_nested_files() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open_store(&temp);
    fs::write(store.root().join("top.jsonl"), "{}\n").expect("write top");
    fs::create_dir_all(store.root().join("team")).expect("mkdir");
    fs::write(store.root().join("team").join("nested.jsonl"), "{}\n{}\n").expect("write nested");
    fs::write(store.root().join("notes.txt"), "ignored").expect("write other");

    let index = store.sync_index().expect("sync");

    assert_eq!(index.agent_id, "coder");
    assert_eq!(index.sessions.len(), 2);
    let nested = index.get("nested").expect("nested indexed");
    assert_eq!(nested.path, "team/nested.jsonl");
    assert_eq!(nested.label, "nested");
    assert_eq!(nested.size_bytes, 6);
    assert!(index.get("index").is_none(), "index file is not a session");
}

#[test]
fn sync_index_keeps_vanished_entries() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open_store(&temp);
    let file = store.root().join("gone.jsonl");
    fs::write(&file, "{}\n").expect("write");
    store.sync_index().expect("first sync");

    fs::remove_file(&file).expect("remove");
    let index = store.sync_index().expect("second sync");

    assert!(index.get("gone").is_some());
}

#[test]
fn sync_index_skips_write_when_unchanged() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open_store(&temp);
    fs::write(store.root().join("a.jsonl"), "{}\n").expect("write");
    store.sync_index().expect("first sync");
    let stamped = store.load_index().updated_at;

    let again = store.sync_index().expect("second sync");

    assert_eq!(again.updated_at, stamped);
}

#[test]
fn create_path_uses_timestamp_and_random_suffix() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open_store(&temp);
    let now = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();

    let first = store.create_path(now);
    let second = store.create_path(now);

    assert!(first.session_id.starts_with("20260304-050607-"));
    assert_eq!(first.session_id.len(), "20260304-050607-".len() + 8);
    assert_eq!(first.label, "Session 2026-03-04 05:06");
    assert_eq!(
        first.session_path,
        store.root().join(format!("{}.jsonl", first.session_id))
    );
    assert_ne!(first.session_id, second.session_id);
}

#[test]
fn upsert_keeps_label_and_creation_time() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open_store(&temp);
    let file = store.root().join("s1.jsonl");
    fs::write(&file, "{}\n").expect("write");

    let first = store.upsert(&file, Some("Morning work")).expect("upsert");
    fs::write(&file, "{}\n{}\n").expect("append");
    let second = store.upsert(&file, None).expect("refresh");

    assert_eq!(second.label, "Morning work");
    assert_eq!(second.created_at, first.created_at);
    assert_eq!(second.size_bytes, 6);
}

#[test]
fn rename_moves_file_and_preserves_created_at() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open_store(&temp);
    let file = store.root().join("20260101-000000-abcdef01.jsonl");
    fs::write(&file, "transcript").expect("write");
    let original = store.upsert(&file, None).expect("upsert");

    let renamed = store.rename(&file, "  Release Plan  ").expect("rename");

    assert_eq!(renamed.entry.id, "release-plan");
    assert_eq!(renamed.entry.label, "Release Plan");
    assert_eq!(renamed.entry.created_at, original.created_at);
    assert_eq!(renamed.new_path, store.root().join("release-plan.jsonl"));
    assert!(!file.exists());
    assert_eq!(fs::read_to_string(&renamed.new_path).expect("read"), "transcript");
    let index = store.load_index();
    assert!(index.get("20260101-000000-abcdef01").is_none());
    assert!(index.get("release-plan").is_some());
}

#[test]
fn rename_collisions_get_counter_suffix() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open_store(&temp);
    let a = store.root().join("a.jsonl");
    let b = store.root().join("b.jsonl");
    fs::write(&a, "alpha").expect("write a");
    fs::write(&b, "beta").expect("write b");

    let first = store.rename(&a, "Notes").expect("rename a");
    let second = store.rename(&b, "Notes").expect("rename b");

    assert_eq!(first.entry.id, "notes");
    assert_eq!(second.entry.id, "notes-2");
    assert_eq!(fs::read_to_string(&first.new_path).expect("read a"), "alpha");
    assert_eq!(fs::read_to_string(&second.new_path).expect("read b"), "beta");
}

#[test]
fn rename_to_same_slug_keeps_path() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open_store(&temp);
    let file = store.root().join("notes.jsonl");
    fs::write(&file, "x").expect("write");

    let renamed = store.rename(&file, "Notes").expect("rename");

    assert_eq!(renamed.new_path, renamed.old_path);
    assert_eq!(renamed.entry.label, "Notes");
}

#[test]
fn rename_missing_file_is_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open_store(&temp);

    let err = store
        .rename(&store.root().join("ghost.jsonl"), "Ghost")
        .expect_err("missing file");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[test]
fn rename_outside_root_is_path_violation() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open_store(&temp);
    let outside = temp.path().join("outside.jsonl");
    fs::write(&outside, "x").expect("write");

    let err = store.rename(&outside, "Inside").expect_err("outside root");
    assert!(matches!(err, AppError::PathViolation(_)));
    assert!(outside.exists());
}

#[test]
fn delete_refuses_active_session() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open_store(&temp);
    let file = store.root().join("live.jsonl");
    fs::write(&file, "x").expect("write");

    let err = store.delete(&file, Some(&file)).expect_err("active session");
    assert!(matches!(err, AppError::InvalidRequest(_)));
    assert!(file.exists());
}

#[test]
fn delete_removes_file_and_entry() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open_store(&temp);
    let file = store.root().join("old.jsonl");
    fs::write(&file, "x").expect("write");
    store.upsert(&file, None).expect("upsert");

    store.delete(&file, None).expect("delete");

    assert!(!file.exists());
    assert!(store.load_index().get("old").is_none());
}

#[test]
fn delete_unknown_session_is_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open_store(&temp);

    let err = store
        .delete(&store.root().join("nothing.jsonl"), None)
        .expect_err("unknown");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[test]
fn corrupt_index_starts_empty() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open_store(&temp);
    fs::write(store.root().join("index.json"), "{ not json").expect("write");

    let index = store.load_index();
    assert!(index.sessions.is_empty());
}

#[test]
fn conversation_map_persists() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open_store(&temp);
    let mut map = store.load_conversation_map();
    assert!(map.entries.is_empty());

    map.entries
        .insert("room-1".into(), store.root().join("a.jsonl").display().to_string());
    store.save_conversation_map(&map).expect("save");

    assert_eq!(store.load_conversation_map(), map);
}

#[test]
fn concurrent_upserts_and_syncs_keep_every_label() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open_store(&temp);
    let files: Vec<_> = (0..8)
        .map(|i| {
            let file = store.root().join(format!("s{i}.jsonl"));
            fs::write(&file, "{}\n").expect("write");
            file
        })
        .collect();

    std::thread::scope(|scope| {
        for (i, file) in files.iter().enumerate() {
            let writer = store.clone();
            scope.spawn(move || {
                writer
                    .upsert(file, Some(&format!("label {i}")))
                    .expect("upsert");
            });
            let syncer = store.clone();
            scope.spawn(move || {
                for _ in 0..5 {
                    syncer.sync_index().expect("sync");
                }
            });
        }
    });

    let index = store.load_index();
    for i in 0..8 {
        let entry = index.get(&format!("s{i}")).expect("indexed");
        assert_eq!(entry.label, format!("label {i}"));
    }
}
