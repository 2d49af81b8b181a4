use std::fs;

use agent_gateway::sessions::relocate::copy_fallback;
use agent_gateway::sessions::{relocate, RelocateOutcome};

#[test]
fn rename_moves_bytes_and_creates_parent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let from = temp.path().join("native.jsonl");
    let to = temp.path().join("managed").join("deep").join("s.jsonl");
    fs::write(&from, "line one\nline two\n").expect("write source");

    let outcome = relocate(&from, &to);

    assert_eq!(outcome, RelocateOutcome::Moved { via_copy: false });
    assert!(!from.exists());
    assert_eq!(fs::read_to_string(&to).expect("read dest"), "line one\nline two\n");
}

#[test]
fn copy_fallback_preserves_bytes_and_removes_source() {
    let temp = tempfile::tempdir().expect("tempdir");
    let from = temp.path().join("a.jsonl");
    let to = temp.path().join("b.jsonl");
    let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    fs::write(&from, &payload).expect("write source");

    copy_fallback(&from, &to).expect("copy fallback");

    assert!(!from.exists());
    assert_eq!(fs::read(&to).expect("read dest"), payload);
}

#[test]
fn missing_source_is_reported() {
    let temp = tempfile::tempdir().expect("tempdir");
    let outcome = relocate(&temp.path().join("gone.jsonl"), &temp.path().join("x.jsonl"));

    assert_eq!(outcome, RelocateOutcome::Missing);
    assert!(!outcome.is_ok());
}

#[test]
fn same_path_is_unchanged() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("s.jsonl");
    fs::write(&path, "x").expect("write");

    let outcome = relocate(&path, &path);

    assert_eq!(outcome, RelocateOutcome::Unchanged);
    assert!(outcome.is_ok());
    assert!(path.exists());
}
