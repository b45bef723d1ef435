use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;

fn irec_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("irec");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/irec.sqlite"

[projects]
max_batch_size = 50

[logging]
filter = "imaging_records=warn"
"#,
        root.display()
    );

    let config_path = config_dir.join("irec.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_irec(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = irec_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run irec binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn run_irec_stdin(config_path: &Path, args: &[&str], input: &str) -> (String, String, bool) {
    let mut child = Command::new(irec_binary())
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn irec");
    child
        .stdin
        .take()
        .unwrap()
        .write_all(input.as_bytes())
        .unwrap();
    let output = child.wait_with_output().unwrap();
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

/// Pull the project id out of `irec project create` output.
fn project_id(stdout: &str) -> String {
    stdout
        .lines()
        .find_map(|l| l.strip_prefix("id:"))
        .map(|id| id.trim().to_string())
        .expect("project id in output")
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_irec(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_irec(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_irec(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_irec(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_ingest_versions_and_history() {
    let (_tmp, config_path) = setup_test_env();
    run_irec(&config_path, &["init"]);

    let (stdout, stderr, success) = run_irec_stdin(
        &config_path,
        &["ingest"],
        r#"{"uid":"r1","title":"CT chest","content":"hello","report_type":"text"}"#,
    );
    assert!(success, "ingest failed: {}", stderr);
    assert!(stdout.contains(r#""action": "create""#));
    assert!(stdout.contains(r#""version_number": 1"#));

    let (stdout, _, success) = run_irec_stdin(
        &config_path,
        &["ingest"],
        r#"{"uid":"r1","title":"CT chest","content":"hello","report_type":"text","verified_at":"2001-01-01T00:00:00Z"}"#,
    );
    assert!(success);
    assert!(stdout.contains("deduplicate_kept_existing"));

    let (stdout, _, success) = run_irec_stdin(
        &config_path,
        &["ingest"],
        r#"{"uid":"r1","title":"CT chest","content":"hello world","report_type":"text"}"#,
    );
    assert!(success);
    assert!(stdout.contains(r#""action": "update""#));
    assert!(stdout.contains(r#""version_number": 2"#));

    let (stdout, _, success) = run_irec(&config_path, &["history", "r1"]);
    assert!(success);
    assert!(stdout.contains("update"));
    assert!(stdout.contains("initial version"));

    let (stdout, _, success) = run_irec(&config_path, &["get", "r1"]);
    assert!(success);
    assert!(stdout.contains("version:      2"));
    assert!(stdout.contains("hello world"));

    let (_, stderr, success) = run_irec(&config_path, &["get", "missing"]);
    assert!(!success);
    assert!(stderr.contains("report not found"));
}

#[test]
fn test_import_jsonl_summary() {
    let (tmp, config_path) = setup_test_env();
    run_irec(&config_path, &["init"]);

    let jsonl = tmp.path().join("reports.jsonl");
    fs::write(
        &jsonl,
        concat!(
            r#"{"uid":"a","title":"A","content":"one","report_type":"text"}"#,
            "\n",
            r#"{"uid":"b","title":"B","content":"two","report_type":"text"}"#,
            "\n",
            r#"{"uid":"a","title":"A","content":"one v2","report_type":"text"}"#,
            "\n",
            "{broken\n",
        ),
    )
    .unwrap();

    let (stdout, stderr, success) =
        run_irec(&config_path, &["import", jsonl.to_str().unwrap()]);
    assert!(success, "import failed: {}", stderr);
    assert!(stdout.contains("total:     4"));
    assert!(stdout.contains("created:   2"));
    assert!(stdout.contains("updated:   1"));
    assert!(stdout.contains("failed:    1"));
    assert!(stdout.contains("line 4"));

    let (stdout, _, success) = run_irec(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Reports:      2"));
    assert!(stdout.contains("Versions:     3"));
}

#[test]
fn test_project_membership_and_studies() {
    let (_tmp, config_path) = setup_test_env();
    run_irec(&config_path, &["init"]);

    for (id, name) in [("u1", "Ada"), ("u2", "Grace")] {
        let email = format!("{id}@example.org");
        let (_, stderr, success) = run_irec(
            &config_path,
            &["user", "add", id, "--name", name, "--email", &email],
        );
        assert!(success, "user add failed: {}", stderr);
    }
    for (exam, modality) in [("E1", "CT"), ("E2", "MR")] {
        let (_, stderr, success) = run_irec(
            &config_path,
            &["study", "add", exam, "--patient", "Doe", "--mod", modality],
        );
        assert!(success, "study add failed: {}", stderr);
    }

    let (stdout, stderr, success) = run_irec(
        &config_path,
        &["project", "create", "Lung nodules", "--owner", "u1", "--tag", "lung"],
    );
    assert!(success, "project create failed: {}", stderr);
    let pid = project_id(&stdout);

    let (_, stderr, success) = run_irec(
        &config_path,
        &["member", "add", &pid, "u2", "--role", "viewer", "--actor", "u1"],
    );
    assert!(success, "member add failed: {}", stderr);

    let (stdout, _, success) = run_irec(&config_path, &["perms", &pid, "u2"]);
    assert!(success);
    assert_eq!(stdout.trim(), "view");

    let (_, stderr, success) = run_irec(
        &config_path,
        &["member", "remove", &pid, "u1", "--actor", "u1"],
    );
    assert!(!success);
    assert!(stderr.contains("cannot be removed"));

    let (stdout, stderr, success) = run_irec(
        &config_path,
        &["studies", "add", &pid, "--actor", "u1", "E1", "E1", "E2", "E9"],
    );
    assert!(success, "studies add failed: {}", stderr);
    assert!(stdout.contains("requested: 3"));
    assert!(stdout.contains("added:     2"));
    assert!(stdout.contains("E9: not_found"));

    let (_, stderr, success) = run_irec(
        &config_path,
        &["studies", "add", &pid, "--actor", "u2", "E1"],
    );
    assert!(!success);
    assert!(stderr.contains("manage_studies"));

    let (stdout, _, success) = run_irec(&config_path, &["studies", "stats", &pid]);
    assert!(success);
    assert!(stdout.contains("studies:        2"));
    assert!(stdout.contains("members:        2"));
    assert!(stdout.contains("CT"));

    let (stdout, _, success) = run_irec(
        &config_path,
        &["studies", "remove", &pid, "--actor", "u1", "E1", "E5"],
    );
    assert!(success);
    assert!(stdout.contains("removed: 1"));

    let (stdout, _, success) = run_irec(&config_path, &["project", "show", &pid]);
    assert!(success);
    assert!(stdout.contains("studies:      1"));
}

#[test]
fn test_completions_need_no_config() {
    let tmp = TempDir::new().unwrap();
    let (stdout, _, success) = run_irec(&tmp.path().join("absent.toml"), &["completions", "bash"]);
    assert!(success);
    assert!(stdout.contains("irec"));
}
