use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn is_empty_on_a_fresh_store() {
    let dir = TempDir::new().unwrap();
    Command::cargo_bin("mindex")
        .unwrap()
        .arg(dir.path())
        .arg("is-empty")
        .assert()
        .success()
        .stdout(predicate::str::contains("true"));
}

#[test]
fn scan_reports_the_posting_count() {
    let dir = TempDir::new().unwrap();
    Command::cargo_bin("mindex")
        .unwrap()
        .arg(dir.path())
        .arg("scan")
        .assert()
        .success()
        .stdout(predicate::str::contains("0 postings"));
}

#[test]
fn compact_on_a_fresh_store_merges_nothing() {
    let dir = TempDir::new().unwrap();
    Command::cargo_bin("mindex")
        .unwrap()
        .arg(dir.path())
        .arg("compact")
        .assert()
        .success()
        .stdout(predicate::str::contains("merged 0 segments"));
}
