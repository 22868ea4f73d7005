use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_ak<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_ak"))
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute ak binary: {err}"))
}

fn stdout_json(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_ak(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "ak command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }
    stdout_json(&output)
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn sql(db: &Path, statements: &str) {
    let conn = rusqlite::Connection::open(db)
        .unwrap_or_else(|err| panic!("failed to open fixture db {}: {err}", db.display()));
    conn.execute_batch(statements)
        .unwrap_or_else(|err| panic!("fixture SQL failed: {err}\n{statements}"));
}

fn migrated_with_users(db: &Path) {
    let migrate = run_json(["--db", path_str(db), "db", "migrate"]);
    assert_eq!(as_i64(&migrate, "after_version"), 2);
    sql(
        db,
        "INSERT INTO users(id, name, email, password, role) VALUES
           (1, 'Site Admin', 'admin@x.com', 'sha256:a', 'Admin'),
           (42, 'Jane Doe', 'jane@x.com', 'sha256:b', 'Trainer');",
    );
}

#[test]
fn db_commands_report_and_apply_migrations() {
    let sandbox = unique_temp_dir("archivekernel-cli-db");
    let db = sandbox.join("kernel.sqlite3");

    let before = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&before, "current_version"), 0);
    assert_eq!(as_str(&before, "contract_version"), "cli.v1");

    let dry_run = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(
        dry_run.get("would_apply_versions").and_then(Value::as_array).map(Vec::len),
        Some(2)
    );
    let still_empty = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&still_empty, "current_version"), 0);

    let migrate = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(as_i64(&migrate, "after_version"), 2);
    assert_eq!(migrate.get("up_to_date").and_then(Value::as_bool), Some(true));

    let describe = run_json(["--db", path_str(&db), "schema", "describe", "users"]);
    let fields = describe
        .get("fields")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing fields in describe output: {describe}"));
    assert!(fields.iter().any(|field| {
        field.get("name").and_then(Value::as_str) == Some("email")
            && field.get("max_length").and_then(Value::as_u64) == Some(255)
    }));

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn undecodable_archive_is_recreated_from_auxiliary_columns() {
    let sandbox = unique_temp_dir("archivekernel-cli-restore");
    let db = sandbox.join("kernel.sqlite3");
    migrated_with_users(&db);

    let archived = run_json([
        "--db",
        path_str(&db),
        "archive",
        "--id",
        "42",
        "--admin-id",
        "1",
        "--admin-role",
        "Admin",
        "--reason",
        "policy violation",
    ]);
    let archival_id = as_i64(&archived, "archival_id");
    assert_eq!(as_i64(&archived, "original_id"), 42);

    sql(
        &db,
        &format!(
            "UPDATE archived_users SET snapshot = 'not-json-at-all' WHERE archival_id = {archival_id};
             DELETE FROM users WHERE id = 42;"
        ),
    );

    let archival_id_arg = archival_id.to_string();
    let restored = run_json([
        "--db",
        path_str(&db),
        "restore",
        "--archival-id",
        archival_id_arg.as_str(),
        "--admin-id",
        "1",
        "--admin-role",
        "Admin",
    ]);
    assert_eq!(as_i64(&restored, "resulting_id"), 42);
    assert_eq!(as_str(&restored, "mode"), "recreated");
    assert_eq!(as_str(&restored, "decode_quality"), "none");
    assert_eq!(restored.get("credential_reset_required").and_then(Value::as_bool), Some(true));

    let shown = run_json([
        "--db",
        path_str(&db),
        "archives",
        "show",
        "--archival-id",
        archival_id_arg.as_str(),
    ]);
    assert_eq!(as_i64(&shown, "restore_count"), 1);
    assert_eq!(as_str(&shown, "reason"), "policy violation");

    let audit = run_json(["--db", path_str(&db), "audit", "list", "--original-id", "42"]);
    let entries = audit
        .get("entries")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing entries in audit output: {audit}"));
    assert_eq!(entries.len(), 2);
    assert_eq!(as_str(&entries[0], "operation"), "restore");
    assert_eq!(
        as_str(&entries[0]["origin"], "user_agent"),
        concat!("ak/", env!("CARGO_PKG_VERSION"))
    );

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn rejected_operations_exit_nonzero_with_public_error() {
    let sandbox = unique_temp_dir("archivekernel-cli-denied");
    let db = sandbox.join("kernel.sqlite3");
    migrated_with_users(&db);

    let denied = run_ak([
        "--db",
        path_str(&db),
        "archive",
        "--id",
        "1",
        "--admin-id",
        "1",
        "--admin-role",
        "Admin",
    ]);
    assert!(!denied.status.success());
    let body = stdout_json(&denied);
    let error = body.get("error").cloned().unwrap_or_default();
    assert_eq!(as_str(&error, "code"), "self_operation_denied");
    assert_eq!(error.get("retryable").and_then(Value::as_bool), Some(false));

    let missing = run_ak([
        "--db",
        path_str(&db),
        "restore",
        "--archival-id",
        "999",
        "--admin-id",
        "1",
    ]);
    assert!(!missing.status.success());
    assert_eq!(as_str(&stdout_json(&missing)["error"], "code"), "not_found");

    let audit = run_json(["--db", path_str(&db), "audit", "list"]);
    let entries = audit.get("entries").and_then(Value::as_array).map(Vec::len);
    assert_eq!(entries, Some(2));

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn config_file_changes_which_roles_are_guarded() {
    let sandbox = unique_temp_dir("archivekernel-cli-config");
    let db = sandbox.join("kernel.sqlite3");
    let config = sandbox.join("kernel.yaml");
    fs::write(&config, "layout:\n  elevated_roles: [Owner]\n")
        .unwrap_or_else(|err| panic!("failed to write config {}: {err}", config.display()));
    migrated_with_users(&db);

    let archived = run_json([
        "--db",
        path_str(&db),
        "--config",
        path_str(&config),
        "archive",
        "--id",
        "1",
        "--admin-id",
        "1",
        "--admin-role",
        "Admin",
    ]);
    assert_eq!(as_i64(&archived, "original_id"), 1);

    let bad_config = sandbox.join("bad.yaml");
    fs::write(&bad_config, "layout:\n  live_table: \"users; --\"\n")
        .unwrap_or_else(|err| panic!("failed to write config {}: {err}", bad_config.display()));
    let rejected =
        run_ak(["--db", path_str(&db), "--config", path_str(&bad_config), "db", "schema-version"]);
    assert!(!rejected.status.success());
    assert!(String::from_utf8_lossy(&rejected.stderr).contains("invalid kernel config"));

    let _ = fs::remove_dir_all(&sandbox);
}
