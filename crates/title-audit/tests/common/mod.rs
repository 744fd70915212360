//! Reusable test harness for title-audit integration tests.
//!
//! Provides helpers for locating the built cdylib, running shell snippets
//! under LD_PRELOAD with the toggle set, and reading back audit records
//! for a specific child pid from the fixed log path.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

// ── Constants (must match src/lib.rs) ───────────────────────────────

pub const TOGGLE_ENV: &str = "TITLE_AUDIT_INTERCEPT";
pub const TITLE_LOG_PATH: &str = "/tmp/title_audit.log";

// ── Records ─────────────────────────────────────────────────────────

/// One parsed log line: `timestamp|pid|cwd|title`. The title keeps any
/// `|` it contains -- only the first three separators split fields.
#[derive(Debug)]
pub struct Record {
    pub timestamp: String,
    pub pid: u32,
    pub cwd: String,
    pub title: String,
}

fn parse_record(line: &str) -> Option<Record> {
    let mut fields = line.splitn(4, '|');
    Some(Record {
        timestamp: fields.next()?.to_string(),
        pid: fields.next()?.parse().ok()?,
        cwd: fields.next()?.to_string(),
        title: fields.next()?.to_string(),
    })
}

/// All records in the shared log belonging to `pid`. The log path is fixed
/// and shared across runs, so tests isolate themselves by child pid (and
/// unique title text).
pub fn records_for_pid(pid: u32) -> Vec<Record> {
    let contents = fs::read_to_string(TITLE_LOG_PATH).unwrap_or_default();
    contents
        .lines()
        .filter_map(parse_record)
        .filter(|r| r.pid == pid)
        .collect()
}

/// Records for `pid` whose title exactly matches.
pub fn records_with_title(pid: u32, title: &str) -> Vec<Record> {
    records_for_pid(pid)
        .into_iter()
        .filter(|r| r.title == title)
        .collect()
}

// ── Spawn helpers ───────────────────────────────────────────────────

/// Find the compiled cdylib.
fn preload_path() -> PathBuf {
    let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));

    // cargo test builds debug by default; the workspace target dir sits
    // two levels up from this crate.
    let candidates = [
        manifest.join("../../target/debug/libtitle_audit.so"),
        manifest.join("target/debug/libtitle_audit.so"),
    ];
    for c in &candidates {
        if c.exists() {
            return fs::canonicalize(c).unwrap_or_else(|_| c.clone());
        }
    }
    panic!(
        "libtitle_audit.so not found (looked in {:?}). Run `cargo build` first.",
        candidates
    );
}

/// A finished preloaded run. Records are tagged with `pid` -- printf is a
/// shell builtin, so the intercepted writes come from the shell itself.
pub struct RunResult {
    pub output: Output,
    pub pid: u32,
}

/// Run a shell snippet under LD_PRELOAD with the toggle set to `toggle`
/// (None leaves it unset). Blocks until the shell exits; every record the
/// shim produced is durably in the log by then, since records are written
/// before the intercepted write returns.
pub fn run_preloaded(script: &str, toggle: Option<&str>, cwd: Option<&Path>) -> RunResult {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(script);
    cmd.env("LD_PRELOAD", preload_path());
    match toggle {
        Some(v) => {
            cmd.env(TOGGLE_ENV, v);
        }
        None => {
            cmd.env_remove(TOGGLE_ENV);
        }
    }
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn shell");
    let pid = child.id();
    let output = child.wait_with_output().expect("failed to wait for shell");
    RunResult { output, pid }
}
