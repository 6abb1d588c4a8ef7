use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use jsonschema::JSONSchema;
use serde_json::{json, Value};
use ulid::Ulid;

const PRIMARY_CATALOG: &str = "qc/TPC/MO/Clusters/c_Sides_N_Clusters.json";
const SUMMARY_CATALOG: &str = "qc/TPC/MO/Q_O_physics/QualitySummary.json";
const PRIMARY_PATH: &str = "qc/TPC/MO/Clusters/c_Sides_N_Clusters";
const SUMMARY_PATH: &str = "qc/TPC/MO/Q_O_physics/QualitySummary";
const BASE_MS: i64 = 1_700_000_000_000;

fn at_minutes(minutes: i64) -> i64 {
    BASE_MS + minutes * 60_000
}

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", Ulid::new()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_qcc<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_qcc"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute qcc binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_qcc(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "qcc command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_u64(value: &Value, key: &str) -> u64 {
    value
        .get(key)
        .and_then(Value::as_u64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
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

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json_file(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read JSON file {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse JSON file {}: {err}", path.display()))
}

fn validate_schema(schema_file: &str, instance: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_file);
    let schema_json = read_json_file(&schema_path);
    let compiled = JSONSchema::compile(&schema_json)
        .unwrap_or_else(|err| panic!("failed to compile schema {}: {err}", schema_path.display()));

    let errors = compiled
        .validate(instance)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>());
    if let Some(errors) = errors {
        panic!("schema validation failed for {}:\n{}", schema_file, errors.join("\n"));
    }
}

fn write_json(path: &Path, value: &Value) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .unwrap_or_else(|err| panic!("failed to create {}: {err}", parent.display()));
    }
    let body = serde_json::to_vec_pretty(value)
        .unwrap_or_else(|err| panic!("failed to serialize fixture {}: {err}", path.display()));
    fs::write(path, body).unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
}

fn destination_files(dir: &Path) -> Vec<String> {
    let entries = fs::read_dir(dir)
        .unwrap_or_else(|err| panic!("failed to list destination {}: {err}", dir.display()));
    let mut names = entries
        .map(|entry| {
            entry
                .unwrap_or_else(|err| panic!("failed to read destination entry: {err}"))
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect::<Vec<_>>();
    names.sort();
    names
}

struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Run 523308 holds two quality summaries and two primaries; run 523309 has a bad summary.
    fn new(prefix: &str) -> Self {
        let root = unique_temp_dir(prefix);
        let source_root = root.join("qcdb");

        write_json(
            &source_root.join(PRIMARY_CATALOG),
            &json!([
                {"RunNumber": "523308", "fileName": "c1.root", "createTime": at_minutes(5), "path": PRIMARY_PATH},
                {"RunNumber": "523308", "fileName": "c2.root", "createTime": at_minutes(45), "path": PRIMARY_PATH},
                {"RunNumber": "523309", "fileName": "c3.root", "createTime": at_minutes(0), "path": PRIMARY_PATH}
            ]),
        );
        write_json(
            &source_root.join(SUMMARY_CATALOG),
            &json!([
                {"RunNumber": "523308", "fileName": "q1.root", "createTime": at_minutes(0), "path": SUMMARY_PATH},
                {"RunNumber": "523308", "fileName": "q2.root", "createTime": at_minutes(40), "path": SUMMARY_PATH},
                {"RunNumber": "523309", "fileName": "q3.root", "createTime": at_minutes(1), "path": SUMMARY_PATH}
            ]),
        );
        write_json(
            &root.join("bkkp/runs.json"),
            &json!([{"runNumber": 523_308}, {"runNumber": 523_309}]),
        );
        write_json(
            &root.join("quality.json"),
            &json!({
                "q1.root": {"Raw occupancy quality": "Good"},
                "q2.root": {"Raw occupancy quality": "Good"},
                "q3.root": {"Raw occupancy quality": "Bad"}
            }),
        );

        let object_dir = source_root.join(PRIMARY_PATH);
        fs::create_dir_all(&object_dir)
            .unwrap_or_else(|err| panic!("failed to create {}: {err}", object_dir.display()));
        for name in ["c1.root", "c2.root", "c3.root"] {
            fs::write(object_dir.join(name), format!("object {name}"))
                .unwrap_or_else(|err| panic!("failed to write object {name}: {err}"));
        }

        Self { root }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    fn curate_args(&self) -> Vec<String> {
        vec![
            "curate".to_string(),
            "--source-root".to_string(),
            path_str(&self.path("qcdb")).to_string(),
            "--primary-catalog".to_string(),
            PRIMARY_CATALOG.to_string(),
            "--summary-catalog".to_string(),
            SUMMARY_CATALOG.to_string(),
            "--accepted-runs".to_string(),
            path_str(&self.path("bkkp/runs.json")).to_string(),
            "--quality-mapping".to_string(),
            path_str(&self.path("quality.json")).to_string(),
            "--destination".to_string(),
            path_str(&self.path("filtered_clusters")).to_string(),
        ]
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

// Test IDs: TCLI-001
#[test]
fn curate_reports_matches_and_copies_claimed_objects() {
    let sandbox = Sandbox::new("qc-curator-curate");
    let mut args = sandbox.curate_args();
    args.extend(["--predicate".to_string(), "Raw occupancy quality=Good".to_string()]);

    let report = run_json(&args);
    validate_schema("curate.response.schema.json", &report);

    assert_eq!(as_u64(&report, "primaries_total"), 3);
    assert_eq!(as_u64(&report, "summaries_quality_accepted"), 2);
    assert_eq!(as_u64(&report, "predicate_rejections"), 1);
    assert_eq!(as_u64(&report, "claimed_primaries"), 2);
    assert_eq!(as_u64(&report, "materialized"), 2);
    assert_eq!(as_array(&report, "primary_only_runs"), &vec![json!(523_309)]);

    let matches = as_array(&report, "matches");
    assert_eq!(matches.len(), 2);
    assert_eq!(matches[0]["summary_file_name"], json!("q1.root"));
    assert_eq!(matches[0]["primary_file_name"], json!("c1.root"));
    assert_eq!(matches[1]["summary_file_name"], json!("q2.root"));
    assert_eq!(matches[1]["primary_file_name"], json!("c2.root"));

    assert_eq!(
        destination_files(&sandbox.path("filtered_clusters")),
        vec!["c1.root".to_string(), "c2.root".to_string()]
    );
}

// Test IDs: TCLI-002
#[test]
fn curate_reads_yaml_config_and_flags_override_it() {
    let sandbox = Sandbox::new("qc-curator-config");
    let config_path = sandbox.path("curation.yaml");
    let config = format!(
        "source_root: {}\nprimary_catalog: {PRIMARY_CATALOG}\nsummary_catalog: {SUMMARY_CATALOG}\naccepted_runs: {}\nquality_mapping: {}\ndestination: {}\ntolerance_minutes: 1\npredicate:\n  - key: Raw occupancy quality\n    value: Bad\n",
        path_str(&sandbox.path("qcdb")),
        path_str(&sandbox.path("bkkp/runs.json")),
        path_str(&sandbox.path("quality.json")),
        path_str(&sandbox.path("from_config")),
    );
    fs::write(&config_path, config).unwrap_or_else(|err| panic!("failed to write config: {err}"));

    // 1-minute window: q3 at +1min cannot reach c3 at 0.
    let report = run_json(["curate", "--config", path_str(&config_path)]);
    assert_eq!(as_u64(&report, "tolerance_minutes"), 1);
    assert_eq!(as_u64(&report, "summaries_quality_accepted"), 1);
    assert_eq!(as_u64(&report, "claimed_primaries"), 0);

    let widened = run_json([
        "curate",
        "--config",
        path_str(&config_path),
        "--tolerance-minutes",
        "10",
        "--manifest",
        path_str(&sandbox.path("manifest.json")),
    ]);
    assert_eq!(as_u64(&widened, "claimed_primaries"), 1);
    assert_eq!(destination_files(&sandbox.path("from_config")), vec!["c3.root".to_string()]);

    let manifest = read_json_file(&sandbox.path("manifest.json"));
    assert_eq!(manifest["files"][0]["file_name"], json!("c3.root"));
    assert_eq!(manifest["files"][0]["summary_file_name"], json!("q3.root"));
    assert_eq!(manifest["pass_id"], widened["pass_id"]);
}

// Test IDs: TCLI-003
#[test]
fn incomplete_group_exits_non_zero_unless_skipped() {
    let sandbox = Sandbox::new("qc-curator-incomplete");
    write_json(
        &sandbox.path("qcdb").join(PRIMARY_CATALOG),
        &json!([
            {"RunNumber": "523308", "fileName": "c1.root", "createTime": at_minutes(5), "path": "qc/TPC/MO/Renamed"},
            {"RunNumber": "523309", "fileName": "c3.root", "createTime": at_minutes(0), "path": PRIMARY_PATH}
        ]),
    );

    let output = run_qcc(sandbox.curate_args());
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("incomplete group for run 523308"), "stderr:\n{stderr}");
    assert!(output.stdout.is_empty());
    assert!(!sandbox.path("filtered_clusters").exists());

    let mut args = sandbox.curate_args();
    args.push("--skip-incomplete-groups".to_string());
    let report = run_json(&args);
    validate_schema("curate.response.schema.json", &report);
    assert_eq!(report["incomplete_groups"], json!("skip"));
    assert_eq!(as_array(&report, "skipped_groups").len(), 1);
    assert_eq!(as_u64(&report, "unclassified_records"), 1);
    assert_eq!(destination_files(&sandbox.path("filtered_clusters")), vec!["c3.root".to_string()]);
}

// Test IDs: TCLI-004
#[test]
fn schema_error_and_bad_predicate_fail_the_pass() {
    let sandbox = Sandbox::new("qc-curator-errors");

    let mut args = sandbox.curate_args();
    args.extend(["--predicate".to_string(), "missing separator".to_string()]);
    let output = run_qcc(&args);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("key=value"));

    write_json(
        &sandbox.path("bkkp/runs.json"),
        &json!([{"runNumber": "not-a-run"}]),
    );
    let output = run_qcc(sandbox.curate_args());
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("schema error in run catalog"));
}

// Test IDs: TCLI-005
#[test]
fn dry_run_reports_plan_without_copying() {
    let sandbox = Sandbox::new("qc-curator-dry-run");
    let mut args = sandbox.curate_args();
    args.push("--dry-run".to_string());

    let report = run_json(&args);
    validate_schema("curate.response.schema.json", &report);
    assert_eq!(report["dry_run"], json!(true));
    assert_eq!(as_u64(&report, "materialized"), 3);
    assert!(!sandbox.path("filtered_clusters").exists());
}

// Test IDs: TCLI-006
#[test]
fn filter_runs_copies_every_accepted_primary() {
    let sandbox = Sandbox::new("qc-curator-filter-runs");
    write_json(&sandbox.path("bkkp/runs.json"), &json!([523_309]));

    let report = run_json([
        "filter-runs",
        "--source-root",
        path_str(&sandbox.path("qcdb")),
        "--primary-catalog",
        PRIMARY_CATALOG,
        "--accepted-runs",
        path_str(&sandbox.path("bkkp/runs.json")),
        "--destination",
        path_str(&sandbox.path("selected")),
    ]);
    validate_schema("filter-runs.response.schema.json", &report);
    assert_eq!(as_u64(&report, "accepted_runs"), 1);
    assert_eq!(as_u64(&report, "primaries_run_accepted"), 1);
    assert_eq!(as_u64(&report, "materialized"), 1);
    assert_eq!(destination_files(&sandbox.path("selected")), vec!["c3.root".to_string()]);
}

// Test IDs: TCLI-007
#[test]
fn config_show_prints_effective_configuration() {
    let sandbox = Sandbox::new("qc-curator-config-show");
    let mut args = sandbox.curate_args();
    args[0] = "show".to_string();
    args.insert(0, "config".to_string());
    args.extend([
        "--predicate".to_string(),
        "Raw occupancy quality = Good".to_string(),
        "--skip-incomplete-groups".to_string(),
    ]);

    let shown = run_json(&args);
    validate_schema("config-show.response.schema.json", &shown);
    let config = &shown["config"];
    assert_eq!(config["tolerance_minutes"], json!(10));
    assert_eq!(config["incomplete_groups"], json!("skip"));
    assert_eq!(config["primary_run_field"], json!("RunNumber"));
    assert_eq!(
        config["predicate"],
        json!([{"key": "Raw occupancy quality", "value": "Good"}])
    );
}

// Test IDs: TCLI-008
#[test]
fn log_file_receives_pass_diagnostics() {
    let sandbox = Sandbox::new("qc-curator-log-file");
    let log_path = sandbox.path("output.log");
    let mut args = vec!["--log-file".to_string(), path_str(&log_path).to_string()];
    args.extend(sandbox.curate_args());

    let report = run_json(&args);
    assert_eq!(as_u64(&report, "materialized"), 3);

    let log = fs::read_to_string(&log_path)
        .unwrap_or_else(|err| panic!("failed to read log file {}: {err}", log_path.display()));
    assert!(log.contains("starting curation pass"), "log:\n{log}");
    assert!(log.contains("incomplete_groups"), "log:\n{log}");
    assert!(log.contains("total files were kept in the destination"), "log:\n{log}");
}

// Test IDs: TCLI-009
#[test]
fn incomplete_groups_policy_flag_is_parsed() {
    let sandbox = Sandbox::new("qc-curator-policy-flag");
    let mut args = sandbox.curate_args();
    args[0] = "show".to_string();
    args.insert(0, "config".to_string());

    let mut skip = args.clone();
    skip.extend(["--incomplete-groups".to_string(), "skip".to_string()]);
    let shown = run_json(&skip);
    validate_schema("config-show.response.schema.json", &shown);
    assert_eq!(shown["config"]["incomplete_groups"], json!("skip"));

    let mut fatal = args.clone();
    fatal.extend(["--incomplete-groups".to_string(), "fatal".to_string()]);
    assert_eq!(run_json(&fatal)["config"]["incomplete_groups"], json!("fatal"));

    let mut unknown = args;
    unknown.extend(["--incomplete-groups".to_string(), "ignore".to_string()]);
    let output = run_qcc(&unknown);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("fatal"));
}
