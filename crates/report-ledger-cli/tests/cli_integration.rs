use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", ulid::Ulid::new()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_rl<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_rl"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute rl binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_rl(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "rl command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
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

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

struct Fixture {
    dir: PathBuf,
    db: String,
}

impl Fixture {
    fn new(prefix: &str) -> Self {
        let dir = unique_temp_dir(prefix);
        let db = path_str(&dir.join("ledger.sqlite3")).to_string();
        Self { dir, db }
    }

    fn args<'a>(&'a self, args: &[&'a str]) -> Vec<&'a str> {
        let mut all = vec!["--db", self.db.as_str()];
        all.extend_from_slice(args);
        all
    }

    fn json(&self, args: &[&str]) -> Value {
        run_json(self.args(args))
    }

    fn output(&self, args: &[&str]) -> Output {
        run_rl(self.args(args))
    }

    fn create_report(&self, label: &str) -> String {
        let report = self.json(&["report", "create", "--patient-label", label]);
        as_str(&report, "report_id").to_string()
    }

    fn create_entry(&self, kind: &str, report_id: &str, content: &str) -> String {
        let written = self.json(&[
            "entry",
            "create",
            "--kind",
            kind,
            "--report-id",
            report_id,
            "--content",
            content,
            "--actor",
            "curator",
        ]);
        assert_eq!(written.get("ledger_recorded"), Some(&Value::Bool(true)));
        let entry = written.get("entry").unwrap_or_else(|| panic!("missing entry: {written}"));
        as_str(entry, "ident").to_string()
    }

    fn events(&self, report_id: &str) -> Vec<Value> {
        as_array(&self.json(&["ledger", "list", "--report-id", report_id]), "events").clone()
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

// Test IDs: TCLI-001
#[test]
fn cli_migrate_reports_versions_with_contract_version() {
    let fixture = Fixture::new("rl-migrate");

    let planned = fixture.json(&["db", "migrate", "--dry-run"]);
    assert_eq!(as_str(&planned, "contract_version"), "cli.v1");
    assert_eq!(planned.get("would_apply_versions"), Some(&serde_json::json!([1, 2])));

    let applied = fixture.json(&["db", "migrate"]);
    assert_eq!(as_i64(&applied, "after_version"), 2);
    assert_eq!(applied.get("up_to_date"), Some(&Value::Bool(true)));

    let status = fixture.json(&["db", "schema-version"]);
    assert_eq!(as_i64(&status, "current_version"), 2);
}

// Test IDs: TCLI-002
#[test]
fn cli_update_then_revert_restores_previous_value() {
    let fixture = Fixture::new("rl-revert");
    let report_id = fixture.create_report("POG0800");
    let ident = fixture.create_entry(
        "genomic-alteration-identified",
        &report_id,
        r#"{"geneVariant": "TP53 (p.R175H)"}"#,
    );

    fixture.json(&[
        "entry",
        "update",
        "--kind",
        "genomic-alteration-identified",
        "--ident",
        &ident,
        "--field",
        "geneVariant",
        "--value",
        "TP53 (p.R248Q)",
        "--actor",
        "curator",
    ]);

    let events = fixture.events(&report_id);
    assert_eq!(events.len(), 2);
    let update_sequence = as_i64(&events[1], "sequence").to_string();
    assert_eq!(as_str(&events[1], "event_type"), "update");

    let reverted = fixture.json(&[
        "ledger",
        "revert",
        "--sequence",
        &update_sequence,
        "--actor",
        "reviewer",
        "--comment",
        "wrong variant",
    ]);
    let recorded = reverted.get("recorded").unwrap_or_else(|| panic!("missing recorded"));
    assert_eq!(as_str(recorded, "actor_id"), "reviewer");
    assert_eq!(as_str(recorded, "new_value"), "TP53 (p.R175H)");

    let entry = fixture.json(&[
        "entry",
        "get",
        "--kind",
        "genomic-alteration-identified",
        "--ident",
        &ident,
    ]);
    let content = entry.get("content").unwrap_or_else(|| panic!("missing content: {entry}"));
    assert_eq!(as_str(content, "geneVariant"), "TP53 (p.R175H)");
    assert_eq!(fixture.events(&report_id).len(), 3);
}

// Test IDs: TCLI-003
#[test]
fn cli_cascade_delete_and_revert_of_dependent() {
    let fixture = Fixture::new("rl-cascade");
    let report_id = fixture.create_report("POG0801");
    let alteration = fixture.create_entry(
        "genomic-alteration-identified",
        &report_id,
        r#"{"geneVariant": "TP53 (p.R175H)"}"#,
    );
    let therapeutic = fixture.create_entry(
        "therapeutic-event",
        &report_id,
        r#"{"genomicEvent": "TP53 (p.R175H)"}"#,
    );

    let deleted = fixture.json(&[
        "entry",
        "delete",
        "--kind",
        "genomic-alteration-identified",
        "--ident",
        &alteration,
        "--actor",
        "curator",
        "--cascade",
    ]);
    let cascade = deleted.get("cascade").unwrap_or_else(|| panic!("missing cascade: {deleted}"));
    assert_eq!(as_i64(cascade, "therapeutic_events"), 1);

    let listed = fixture.json(&[
        "entry",
        "list",
        "--kind",
        "therapeutic-event",
        "--report-id",
        &report_id,
    ]);
    assert!(as_array(&listed, "entries").is_empty());

    let therapeutic_delete = fixture
        .events(&report_id)
        .into_iter()
        .find(|event| {
            as_str(event, "event_type") == "delete" && as_str(event, "entry_ident") == therapeutic
        })
        .unwrap_or_else(|| panic!("delete event for the therapeutic event expected"));
    let sequence = as_i64(&therapeutic_delete, "sequence").to_string();

    fixture.json(&["ledger", "revert", "--sequence", &sequence, "--actor", "reviewer"]);
    let restored = fixture.json(&[
        "entry",
        "get",
        "--kind",
        "therapeutic-event",
        "--ident",
        &therapeutic,
    ]);
    assert_eq!(as_str(&restored, "ident"), therapeutic);
}

#[test]
fn cli_delete_keeps_dependents_unless_cascade_is_requested() {
    let fixture = Fixture::new("rl-no-cascade");
    let report_id = fixture.create_report("POG0806");
    let alteration = fixture.create_entry(
        "genomic-alteration-identified",
        &report_id,
        r#"{"geneVariant": "KRAS (p.G12D)"}"#,
    );
    fixture.create_entry(
        "therapeutic-event",
        &report_id,
        r#"{"genomicEvent": "KRAS (p.G12D)"}"#,
    );

    let deleted = fixture.json(&[
        "entry",
        "delete",
        "--kind",
        "genomic-alteration-identified",
        "--ident",
        &alteration,
        "--actor",
        "curator",
    ]);
    assert_eq!(deleted.get("cascade"), Some(&Value::Null));

    let listed = fixture.json(&[
        "entry",
        "list",
        "--kind",
        "therapeutic-event",
        "--report-id",
        &report_id,
    ]);
    assert_eq!(as_array(&listed, "entries").len(), 1);
}

#[test]
fn cli_revert_of_create_event_fails_without_writes() {
    let fixture = Fixture::new("rl-create-revert");
    let report_id = fixture.create_report("POG0802");
    fixture.create_entry("analyst-comment", &report_id, r#"{"comments": "Stable disease."}"#);
    let sequence = as_i64(&fixture.events(&report_id)[0], "sequence").to_string();

    let output = fixture.output(&["ledger", "revert", "--sequence", &sequence, "--actor", "x"]);
    assert!(!output.status.success());
    assert_eq!(fixture.events(&report_id).len(), 1);
}

// Test IDs: TCLI-004
#[test]
fn cli_version_update_detail_and_revert() {
    let fixture = Fixture::new("rl-data-history");
    let report_id = fixture.create_report("POG0803");
    let ident = fixture.create_entry("tumour-analysis", &report_id, r#"{"tumourContent": 60}"#);

    let outcome = fixture.json(&[
        "data-history",
        "version-update",
        "--kind",
        "tumour-analysis",
        "--ident",
        &ident,
        "--content",
        r#"{"tumourContent": 75}"#,
        "--actor",
        "pathologist",
    ]);
    let history = outcome
        .get("history_entry")
        .unwrap_or_else(|| panic!("missing history entry: {outcome}"));
    let history_ident = as_str(history, "ident").to_string();

    let detail = fixture.json(&["data-history", "detail", "--ident", &history_ident]);
    let versions = detail
        .get("versions")
        .and_then(Value::as_object)
        .unwrap_or_else(|| panic!("missing versions: {detail}"));
    assert_eq!(versions.len(), 2);

    let reverted = fixture.json(&[
        "data-history",
        "revert",
        "--ident",
        &history_ident,
        "--actor",
        "pathologist",
    ]);
    assert_eq!(as_i64(&reverted, "previous_version"), 2);
    assert_eq!(as_i64(&reverted, "new_version"), 1);

    let listed = fixture.json(&["data-history", "list", "--report-id", &report_id]);
    assert_eq!(as_array(&listed, "entries").len(), 2);
}

#[test]
fn cli_export_writes_manifest_and_integrity_check_is_clean() {
    let fixture = Fixture::new("rl-export");
    let report_id = fixture.create_report("POG0804");
    fixture.create_entry("analyst-comment", &report_id, r#"{"comments": "Reviewed."}"#);

    let out_dir = fixture.dir.join("audit");
    let exported = fixture.json(&["db", "export", "--out", path_str(&out_dir)]);
    let manifest = exported.get("manifest").unwrap_or_else(|| panic!("missing manifest"));
    assert_eq!(as_array(manifest, "files").len(), 2);
    assert!(out_dir.join("manifest.json").exists());

    let integrity = fixture.json(&["db", "integrity-check"]);
    assert_eq!(integrity.get("quick_check_ok"), Some(&Value::Bool(true)));
    assert_eq!(as_i64(&integrity, "pending_outbox_events"), 0);
}

#[test]
fn cli_rejects_blank_actor() {
    let fixture = Fixture::new("rl-actor");
    let report_id = fixture.create_report("POG0805");

    let output = fixture.output(&[
        "entry",
        "create",
        "--kind",
        "analyst-comment",
        "--report-id",
        &report_id,
        "--content",
        r#"{"comments": "x"}"#,
        "--actor",
        " ",
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("actor"), "unexpected stderr: {stderr}");
}
