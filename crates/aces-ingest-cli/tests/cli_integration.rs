use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

const CLEAN_DOCUMENT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ACES version="4.2">
  <Header><Company>Acme Parts</Company><TransferDate>2024-03-07</TransferDate></Header>
  <App action="A" id="1">
    <BaseVehicle id="5911"/>
    <Qty>1</Qty>
    <PartType id="1684"/>
    <Part>ABC-1</Part>
    <Note>Front</Note>
    <VendorNote>unmapped</VendorNote>
  </App>
  <App action="A" id="2">
    <BaseVehicle id="5912"/>
    <Qty>2</Qty>
    <PartType id="1684"/>
    <Part>ABC-2</Part>
    <Qualifier id="2440"><param value="4"/><text>With <p1/> Doors</text></Qualifier>
  </App>
  <Footer><RecordCount>2</RecordCount></Footer>
</ACES>
"#;

/// One scratch directory with its own store, removed when the test ends.
struct Sandbox {
    dir: PathBuf,
    db: PathBuf,
}

impl Sandbox {
    fn new(label: &str) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_else(|err| panic!("system clock before 1970: {err}"));
        let dir = std::env::temp_dir().join(format!("aces-cli-{label}-{}-{nanos}", std::process::id()));
        fs::create_dir_all(&dir).unwrap_or_else(|err| panic!("cannot create {}: {err}", dir.display()));
        let db = dir.join("aces.sqlite3");
        Self { dir, db }
    }

    fn catalog(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.join(name);
        fs::write(&path, body).unwrap_or_else(|err| panic!("cannot write catalog {}: {err}", path.display()));
        path
    }

    /// Run `aces --db <sandbox store> <args..>` with a clean ACES_* environment.
    fn aces<I, S>(&self, args: I) -> Output
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut argv: Vec<OsString> = vec!["--db".into(), self.db.clone().into_os_string()];
        argv.extend(args.into_iter().map(Into::into));
        Command::new(env!("CARGO_BIN_EXE_aces"))
            .args(argv)
            .env_remove("ACES_DB")
            .env_remove("ACES_CONFIG")
            .env("RUST_LOG", "warn")
            .output()
            .unwrap_or_else(|err| panic!("cannot spawn aces: {err}"))
    }

    /// Run and require `code`; returns the JSON document printed on stdout.
    fn expect<I, S>(&self, code: i32, args: I) -> Value
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let output = self.aces(args);
        assert_eq!(output.status.code(), Some(code), "{}", transcript(&output));
        stdout_json(&output)
    }

    fn recorded_runs(&self) -> Vec<Value> {
        let listing = self.expect(0, ["runs"]);
        listing.get("runs").and_then(Value::as_array).cloned().unwrap_or_default()
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

fn transcript(output: &Output) -> String {
    format!(
        "exit {:?}\nstdout:\n{}\nstderr:\n{}",
        output.status.code(),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout)
        .unwrap_or_else(|err| panic!("stdout is not one JSON document ({err})\n{}", transcript(output)))
}

fn num(doc: &Value, pointer: &str) -> u64 {
    doc.pointer(pointer).and_then(Value::as_u64).unwrap_or_else(|| panic!("no number at {pointer}: {doc}"))
}

fn text<'a>(doc: &'a Value, pointer: &str) -> &'a str {
    doc.pointer(pointer).and_then(Value::as_str).unwrap_or_else(|| panic!("no string at {pointer}: {doc}"))
}

fn os(path: &Path) -> OsString {
    path.as_os_str().to_owned()
}

fn abort_line(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr)
        .lines()
        .find(|line| line.starts_with("ingest aborted: "))
        .map(str::to_string)
        .unwrap_or_else(|| panic!("no abort diagnostic\n{}", transcript(output)))
}

#[test]
fn db_commands_track_schema_and_recorded_scopes() {
    let sandbox = Sandbox::new("db");

    let fresh = sandbox.expect(0, ["db", "schema-version"]);
    assert_eq!(text(&fresh, "/contract_version"), "aces.cli.v1");
    assert_eq!(text(&fresh, "/command"), "db schema-version");
    assert_eq!(num(&fresh, "/current_version"), 0);
    assert_eq!(fresh.get("ready_for_ingest"), Some(&Value::Bool(false)));
    assert_eq!(fresh.get("runs_by_status"), Some(&Value::Null));

    let planned = sandbox.expect(0, ["db", "migrate", "--dry-run"]);
    assert_eq!(planned.get("versions"), Some(&serde_json::json!([1])));
    assert_eq!(planned.get("ready_for_ingest"), Some(&Value::Bool(false)));

    let applied = sandbox.expect(0, ["db", "migrate"]);
    assert_eq!((num(&applied, "/from_version"), num(&applied, "/to_version")), (0, 1));
    assert_eq!(applied.get("ready_for_ingest"), Some(&Value::Bool(true)));

    let input = sandbox.catalog("catalog.xml", CLEAN_DOCUMENT);
    sandbox.expect(0, [OsString::from("ingest"), os(&input)]);
    let current = sandbox.expect(0, ["db", "schema-version"]);
    assert_eq!(num(&current, "/runs_by_status/committed"), 1);
    assert_eq!(num(&current, "/applications_recorded"), 2);

    let integrity = sandbox.expect(0, ["db", "integrity-check"]);
    assert_eq!(integrity.get("quick_check_ok"), Some(&Value::Bool(true)));
    assert_eq!(integrity.pointer("/foreign_key_violations").and_then(Value::as_array).map(Vec::len), Some(0));
}

#[test]
fn ingest_then_verify_then_purge() {
    let sandbox = Sandbox::new("round-trip");
    let input = sandbox.catalog("catalog.xml", CLEAN_DOCUMENT);
    let run_log = sandbox.dir.join("runs.ndjson");

    let summary = sandbox.expect(
        0,
        [
            OsString::from("ingest"),
            os(&input),
            "--batch-size".into(),
            "1".into(),
            "--run-log".into(),
            os(&run_log),
        ],
    );
    assert_eq!(text(&summary, "/command"), "ingest");
    assert_eq!(text(&summary, "/state"), "verified");
    assert_eq!(text(&summary, "/source_file"), "catalog.xml");
    assert_eq!(num(&summary, "/applications_ingested"), 2);
    assert_eq!(num(&summary, "/footer_record_count"), 2);
    assert_eq!(text(&summary, "/source_sha256").len(), 64);
    assert_eq!(text(&summary, "/verification/top_unmapped/0/attr_name"), "VendorNote");

    let report = sandbox.expect(0, ["verify", "--source-file", "catalog.xml"]);
    assert_eq!(num(&report, "/counts/applications"), 2);
    assert_eq!(num(&report, "/counts/qualifiers"), 1);
    assert_eq!(num(&report, "/counts/notes"), 1);
    assert_eq!(text(&report, "/run_status"), "committed");

    let log = fs::read_to_string(&run_log).unwrap_or_else(|err| panic!("run log missing: {err}"));
    let entry: Value = serde_json::from_str(log.trim()).unwrap_or_else(|err| panic!("bad run log line {log}: {err}"));
    assert_eq!(text(&entry, "/outcome"), "committed");

    assert_eq!(sandbox.recorded_runs().len(), 1);
    let purge = sandbox.expect(0, ["purge", "--source-file", "catalog.xml"]);
    assert_eq!(num(&purge, "/applications_removed"), 2);
    assert!(sandbox.recorded_runs().is_empty());

    let gone = sandbox.expect(2, ["verify", "--source-file", "catalog.xml"]);
    assert_eq!(gone.get("run_id"), Some(&Value::Null));
}

#[test]
fn truncated_catalog_rolls_back_and_reports_aborted_state() {
    let sandbox = Sandbox::new("truncated");
    let cut = CLEAN_DOCUMENT.find("<App action=\"A\" id=\"2\">").unwrap_or(0) + 30;
    let input = sandbox.catalog("broken.xml", &CLEAN_DOCUMENT[..cut]);
    let run_log = sandbox.dir.join("runs.ndjson");

    let output = sandbox.aces([
        OsString::from("ingest"),
        os(&input),
        "--batch-size".into(),
        "1".into(),
        "--run-log".into(),
        os(&run_log),
    ]);
    assert_eq!(output.status.code(), Some(3), "{}", transcript(&output));
    let diagnostic = abort_line(&output);
    assert!(diagnostic.contains("ParseFatal") && diagnostic.contains("last successful batch"), "{diagnostic}");

    let payload = stdout_json(&output);
    assert_eq!(text(&payload, "/state"), "aborted");
    assert_eq!(text(&payload, "/failure/class"), "ParseFatal");
    assert!(sandbox.recorded_runs().is_empty());

    let log = fs::read_to_string(&run_log).unwrap_or_else(|err| panic!("run log missing: {err}"));
    assert!(log.contains("\"outcome\":\"aborted\""), "{log}");
}

#[test]
fn non_transactional_abort_keeps_earlier_batches() {
    let sandbox = Sandbox::new("non-transactional");
    let body = CLEAN_DOCUMENT.replace("<Part>ABC-2</Part>", "");
    let input = sandbox.catalog("partial.xml", &body);

    let output = sandbox.aces([
        OsString::from("ingest"),
        os(&input),
        "--transactional".into(),
        "false".into(),
        "--batch-size".into(),
        "1".into(),
    ]);
    assert_eq!(output.status.code(), Some(3), "{}", transcript(&output));
    assert!(abort_line(&output).contains("RecordInvalid"));
    let payload = stdout_json(&output);
    assert_eq!(text(&payload, "/state"), "aborted");
    assert_eq!(num(&payload, "/failure/last_successful_batch"), 1);

    let runs = sandbox.recorded_runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(text(&runs[0], "/status"), "aborted");

    let report = sandbox.expect(2, ["verify", "--source-file", "partial.xml"]);
    assert_eq!(num(&report, "/counts/applications"), 1);
    assert_eq!(text(&report, "/run_status"), "aborted");

    let retry = sandbox.expect(3, [OsString::from("ingest"), os(&input)]);
    assert_eq!(text(&retry, "/failure/class"), "StoreFatal");
}

#[test]
fn unreadable_inputs_exit_with_bad_input_code() {
    let sandbox = Sandbox::new("bad-input");

    let absent = sandbox.aces([OsString::from("ingest"), os(&sandbox.dir.join("absent.xml"))]);
    assert_eq!(absent.status.code(), Some(4), "{}", transcript(&absent));
    assert!(String::from_utf8_lossy(&absent.stderr).contains("absent.xml"));

    let directory = sandbox.aces([OsString::from("ingest"), os(&sandbox.dir)]);
    assert_eq!(directory.status.code(), Some(4), "{}", transcript(&directory));
    assert!(String::from_utf8_lossy(&directory.stderr).contains("not a regular file"));
    assert!(sandbox.recorded_runs().is_empty());
}

#[test]
fn footer_record_count_mismatch_exits_with_issues() {
    let sandbox = Sandbox::new("footer");
    let body = CLEAN_DOCUMENT.replace("<RecordCount>2</RecordCount>", "<RecordCount>5</RecordCount>");
    let input = sandbox.catalog("short.xml", &body);

    let summary = sandbox.expect(2, [OsString::from("ingest"), os(&input)]);
    assert_eq!(text(&summary, "/state"), "verified");
    let issues = summary
        .pointer("/verification/issues")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("no issues listed: {summary}"));
    assert!(issues.iter().filter_map(Value::as_str).any(|issue| issue.contains("RecordCount")));
}

#[test]
fn reingesting_a_scope_needs_replace() {
    let sandbox = Sandbox::new("replace");
    let input = sandbox.catalog("catalog.xml", CLEAN_DOCUMENT);

    sandbox.expect(0, [OsString::from("ingest"), os(&input)]);
    let refused = sandbox.expect(3, [OsString::from("ingest"), os(&input)]);
    assert_eq!(text(&refused, "/failure/class"), "StoreFatal");

    let replaced = sandbox.expect(0, [OsString::from("ingest"), os(&input), "--replace".into()]);
    assert_eq!(num(&replaced, "/applications_ingested"), 2);
    assert_eq!(sandbox.recorded_runs().len(), 1);
}

#[test]
fn config_file_switches_to_lenient_mode() {
    let sandbox = Sandbox::new("lenient");
    let body = CLEAN_DOCUMENT
        .replace("<Part>ABC-2</Part>", "")
        .replace("<Footer><RecordCount>2</RecordCount></Footer>", "");
    let input = sandbox.catalog("partial.xml", &body);
    let config = sandbox.catalog("aces.yaml", "strict: false\nbatch_size: 10\n");

    let strict = sandbox.expect(3, [OsString::from("ingest"), os(&input), "--source-file".into(), "strict.xml".into()]);
    assert_eq!(text(&strict, "/failure/class"), "RecordInvalid");

    let lenient = sandbox.expect(0, [OsString::from("--config"), os(&config), "ingest".into(), os(&input)]);
    assert_eq!(num(&lenient, "/applications_ingested"), 1);
    assert_eq!(num(&lenient, "/applications_skipped"), 1);
}

#[test]
fn bad_options_are_operator_errors() {
    let sandbox = Sandbox::new("config");
    let input = sandbox.catalog("catalog.xml", CLEAN_DOCUMENT);
    let config = sandbox.catalog("aces.yaml", "batchsize: 10\n");

    let unknown_key = sandbox.aces([OsString::from("--config"), os(&config), "ingest".into(), os(&input)]);
    assert_eq!(unknown_key.status.code(), Some(1), "{}", transcript(&unknown_key));
    assert!(String::from_utf8_lossy(&unknown_key.stderr).contains("failed to load config"));

    let zero_batch = sandbox.aces([OsString::from("ingest"), os(&input), "--batch-size".into(), "0".into()]);
    assert_eq!(zero_batch.status.code(), Some(1), "{}", transcript(&zero_batch));
}

#[test]
fn store_path_comes_from_aces_db() {
    let sandbox = Sandbox::new("env");
    let db = sandbox.dir.join("from-env.sqlite3");

    let output = Command::new(env!("CARGO_BIN_EXE_aces"))
        .args(["db", "migrate"])
        .env("ACES_DB", &db)
        .env_remove("ACES_CONFIG")
        .output()
        .unwrap_or_else(|err| panic!("cannot spawn aces: {err}"));
    assert!(output.status.success(), "{}", transcript(&output));
    assert!(db.exists());
}
