use std::fs;
use std::path::Path;

use assert_cmd::Command;
use tempfile::TempDir;

fn docview(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("docview").unwrap();
    cmd.arg("--config")
        .arg(home.path().join("missing-config.toml"))
        .arg("--log-dir")
        .arg(home.path().join("logs"))
        .env_remove("RUST_LOG");
    cmd
}

fn write(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn show_prints_pretty_result_without_color() {
    let home = TempDir::new().unwrap();
    let result = write(home.path(), "result.json", r#"{"summary":"ok","score":0.5}"#);

    let output = docview(&home)
        .args(["show", "--print", "--color", "never"])
        .arg(&result)
        .output()
        .unwrap();

    assert!(output.status.success(), "{:?}", output);
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(stdout, "{\n  \"summary\": \"ok\",\n  \"score\": 0.5\n}\n");
}

#[test]
fn show_lists_page_references_from_summary_text() {
    let home = TempDir::new().unwrap();
    let summary = r#"{"extracted_sections":[{"document":"b.pdf","section_title":"Intro","page_number":3}]}"#;
    let result = write(
        home.path(),
        "result.json",
        &serde_json::to_string(summary).unwrap(),
    );

    let output = docview(&home)
        .args(["show", "--print", "--color", "never"])
        .arg(&result)
        .output()
        .unwrap();

    assert!(output.status.success(), "{:?}", output);
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("\"section_title\": \"Intro\""));
    assert!(stdout.contains(" 1. b.pdf p.3  Intro"));
}

#[test]
fn show_with_download_saves_result() {
    let home = TempDir::new().unwrap();
    let result = write(home.path(), "result.json", r#"{"a":[1,2]}"#);
    let out_dir = home.path().join("out");

    docview(&home)
        .args(["show", "--print", "--color", "never", "--download"])
        .arg(&out_dir)
        .arg(&result)
        .assert()
        .success();

    let saved = fs::read_to_string(out_dir.join("analysis_result.json")).unwrap();
    assert_eq!(saved, "{\n  \"a\": [\n    1,\n    2\n  ]\n}");
}

#[test]
fn show_fails_for_missing_result() {
    let home = TempDir::new().unwrap();
    let output = docview(&home)
        .args(["show", "--print"])
        .arg(home.path().join("nope.json"))
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("failed to read result file"), "{}", stderr);
}

#[test]
fn analyze_rejects_non_pdf_input_before_uploading() {
    let home = TempDir::new().unwrap();
    let notes = write(home.path(), "notes.txt", "plain text");

    let output = docview(&home)
        .args(["analyze", "--persona", "analyst", "--job", "summarize", "--print"])
        .args(["--endpoint", "http://127.0.0.1:9/upload"])
        .arg(&notes)
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("Skipping unsupported file"), "{}", stderr);
    assert!(stderr.contains("no documents were submitted"), "{}", stderr);
}

#[test]
fn analyze_rejects_more_than_ten_documents() {
    let home = TempDir::new().unwrap();
    let files: Vec<_> = (0..11)
        .map(|i| write(home.path(), &format!("doc{i}.pdf"), "%PDF-1.4"))
        .collect();

    let output = docview(&home)
        .args(["analyze", "--persona", "analyst", "--job", "summarize", "--print"])
        .args(["--endpoint", "http://127.0.0.1:9/upload"])
        .args(&files)
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(
        stderr.contains("at most 10 documents can be submitted, got 11"),
        "{}",
        stderr
    );
}
