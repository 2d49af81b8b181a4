use std::fs;

use agent_gateway::sessions::resolve_session_file_path;

#[test]
fn accepts_relative_path_inside_root() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().canonicalize().expect("canonical root");

    let resolved =
        resolve_session_file_path(&root, ".jsonl", "team/a.jsonl").expect("inside root");
    assert_eq!(resolved, root.join("team").join("a.jsonl"));
}

#[test]
fn accepts_absolute_path_inside_root() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().canonicalize().expect("canonical root");
    let file = root.join("a.jsonl");
    fs::write(&file, "{}\n").expect("write session");

    assert_eq!(
        resolve_session_file_path(&root, ".jsonl", &file),
        Some(file)
    );
}

#[test]
fn rejects_parent_traversal() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("sessions");
    fs::create_dir_all(&root).expect("create root");

    assert!(resolve_session_file_path(&root, ".jsonl", "../../etc/passwd").is_none());
    assert!(resolve_session_file_path(&root, ".jsonl", "../outside.jsonl").is_none());
    assert!(resolve_session_file_path(&root, ".jsonl", "nested/../../x.jsonl").is_none());
}

#[test]
fn rejects_absolute_path_outside_root() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("sessions");
    fs::create_dir_all(&root).expect("create root");
    let outside = temp.path().join("other.jsonl");

    assert!(resolve_session_file_path(&root, ".jsonl", &outside).is_none());
}

#[test]
fn rejects_wrong_suffix_and_bare_suffix() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();

    assert!(resolve_session_file_path(root, ".jsonl", "notes.txt").is_none());
    assert!(resolve_session_file_path(root, ".jsonl", ".jsonl").is_none());
}

#[test]
fn rejects_root_itself_and_empty() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();

    assert!(resolve_session_file_path(root, ".jsonl", root).is_none());
    assert!(resolve_session_file_path(root, ".jsonl", "").is_none());
    assert!(resolve_session_file_path(root, ".jsonl", ".").is_none());
}

#[cfg(unix)]
#[test]
fn rejects_symlink_escaping_root() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("sessions");
    fs::create_dir_all(&root).expect("create root");
    let target = temp.path().join("secret.jsonl");
    fs::write(&target, "secret").expect("write target");
    std::os::unix::fs::symlink(&target, root.join("link.jsonl")).expect("symlink");

    assert!(resolve_session_file_path(&root, ".jsonl", "link.jsonl").is_none());
}
