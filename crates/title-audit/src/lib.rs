//! LD_PRELOAD shim that audits terminal "set window title" sequences.
//!
//! Interposes write(2), forwards every call to the real primitive unchanged,
//! and -- when `TITLE_AUDIT_INTERCEPT=1` -- scans the bytes actually accepted
//! on stdout/stderr for OSC 0/2 title sequences, appending one pipe-delimited
//! record per title to the fixed log path. The observed program's behavior is
//! never altered; the shim only adds the synchronous scan/log cost.
//!
//! Usage: LD_PRELOAD=.../libtitle_audit.so TITLE_AUDIT_INTERCEPT=1 <command>

use std::env;
use std::fs::{self, OpenOptions};
use std::mem;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::process;

use chrono::{DateTime, Local};
use libc::{c_int, c_void, size_t, ssize_t};
use nix::unistd;
use once_cell::sync::OnceCell;

// ── Constants ────────────────────────────────────────────────────────

/// Environment toggle. Read fresh on every intercepted call, never cached,
/// so flipping it takes effect on the very next write.
pub const TOGGLE_ENV: &str = "TITLE_AUDIT_INTERCEPT";

/// Fixed audit log path: plain text, append-only, one record per line.
pub const TITLE_LOG_PATH: &str = "/tmp/title_audit.log";

/// Titles longer than this are truncated, not rejected.
pub const TITLE_MAX_LEN: usize = 200;

/// A formatted log line (newline included) never exceeds this; longer
/// lines are dropped whole.
const LOG_LINE_MAX: usize = 1024;

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

// ── Config ───────────────────────────────────────────────────────────

/// Active only when the toggle is exactly "1"; any other value or absence
/// disables scanning and logging (forwarding still occurs).
pub fn interception_enabled() -> bool {
    env::var(TOGGLE_ENV).map(|v| v == "1").unwrap_or(false)
}

// ── Symbol resolver ──────────────────────────────────────────────────

/// The platform output primitive: write(2)'s C signature.
pub type OutputPrimitive =
    unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;

/// Single-assignment cell for the resolved original. At most one resolution
/// attempt ever executes; concurrent first callers block until the winner
/// finishes and then observe the same function pointer.
static ORIGINAL_WRITE: OnceCell<OutputPrimitive> = OnceCell::new();

/// Locate the real write(2) through the dynamic loader. Idempotent.
///
/// Failure is fatal: without the original, transparent forwarding cannot be
/// honored. Aborts without a message -- printing to stderr here would
/// re-enter the half-initialized shim.
pub fn resolve() -> OutputPrimitive {
    *ORIGINAL_WRITE.get_or_init(|| {
        let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, c"write".as_ptr()) };
        if sym.is_null() {
            process::abort();
        }
        unsafe { mem::transmute::<*mut c_void, OutputPrimitive>(sym) }
    })
}

// ── Escape-sequence scanner ──────────────────────────────────────────

/// Lazy scan of one buffer for OSC 0/2 title payloads.
///
/// No state survives between buffers: a sequence split across two separate
/// write calls is never reassembled. Single left-to-right pass, O(n).
pub struct TitleScan<'a> {
    data: &'a [u8],
    pos: usize,
}

pub fn scan_titles(data: &[u8]) -> TitleScan<'_> {
    TitleScan { data, pos: 0 }
}

impl Iterator for TitleScan<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let data = self.data;
        let mut i = self.pos;

        while i + 4 <= data.len() {
            // Candidate start: ESC ] 0|2 ;  (OSC 0 = icon+title, OSC 2 =
            // title only -- treated identically)
            if data[i] != ESC
                || data[i + 1] != b']'
                || (data[i + 2] != b'0' && data[i + 2] != b'2')
                || data[i + 3] != b';'
            {
                i += 1;
                continue;
            }

            let start = i + 4;
            let Some((end, term_len)) = find_terminator(data, start) else {
                // Incomplete candidate: silently dropped, no wrap or retry.
                // The terminator search covered the rest of the buffer, so
                // nothing after this point can complete either.
                self.pos = data.len();
                return None;
            };

            // Terminator consumed whether the payload validates or not;
            // markers inside the consumed region are never re-examined.
            i = end + term_len;

            if let Some(title) = validate_payload(&data[start..end]) {
                self.pos = i;
                return Some(title);
            }
        }

        self.pos = data.len();
        None
    }
}

/// Next OSC terminator at or after `from`: BEL, or ESC backslash (ST).
/// Returns (payload_end, terminator_len).
fn find_terminator(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut j = from;
    while j < data.len() {
        if data[j] == BEL {
            return Some((j, 1));
        }
        if data[j] == ESC && j + 1 < data.len() && data[j + 1] == b'\\' {
            return Some((j, 2));
        }
        j += 1;
    }
    None
}

/// Truncate to TITLE_MAX_LEN, then require every retained byte to be
/// printable ASCII (32-126, space included). Empty payloads and payloads
/// with any invalid retained byte produce nothing -- a title is either
/// fully valid or not logged at all.
fn validate_payload(payload: &[u8]) -> Option<String> {
    if payload.is_empty() {
        return None;
    }
    let retained = &payload[..payload.len().min(TITLE_MAX_LEN)];
    if retained.iter().any(|&b| !(0x20..=0x7e).contains(&b)) {
        return None;
    }
    std::str::from_utf8(retained).ok().map(str::to_owned)
}

// ── Audit records ────────────────────────────────────────────────────

/// One captured title. Created, formatted, and written in a single unit of
/// work, then discarded -- nothing is retained between records.
pub struct TitleRecord {
    pub timestamp: DateTime<Local>,
    pub pid: i32,
    pub cwd: String,
    pub title: String,
}

impl TitleRecord {
    /// Capture pid and working directory at the moment the title was seen.
    pub fn capture(title: String) -> Self {
        Self {
            timestamp: Local::now(),
            pid: unistd::getpid().as_raw(),
            cwd: current_working_dir(),
            title,
        }
    }

    /// `YYYY-MM-DD HH:MM:SS|pid|cwd|title` plus newline. None when the line
    /// would exceed the bounded buffer. A `|` inside the title is written
    /// verbatim.
    fn format_line(&self) -> Option<String> {
        let line = format!(
            "{}|{}|{}|{}\n",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.pid,
            self.cwd,
            self.title
        );
        (line.len() <= LOG_LINE_MAX).then_some(line)
    }
}

/// Working directory with fallbacks: getcwd, then the process's own /proc
/// symlink, then a literal placeholder. Never fails outright.
fn current_working_dir() -> String {
    if let Ok(path) = unistd::getcwd() {
        return path.to_string_lossy().into_owned();
    }
    match fs::read_link("/proc/self/cwd") {
        Ok(path) => path.to_string_lossy().into_owned(),
        Err(_) => "/unknown".to_string(),
    }
}

// ── Audit logger ─────────────────────────────────────────────────────

/// Append one record to the fixed log path. Returns false when the record
/// was dropped (open failure, oversized line, short write); no error ever
/// reaches the caller either way.
///
/// # Safety
/// `raw` must be the resolved original primitive. Going through the public
/// write symbol here would recurse into the shim.
pub unsafe fn record(raw: OutputPrimitive, rec: &TitleRecord) -> bool {
    let Some(line) = rec.format_line() else {
        return false;
    };
    append_line(Path::new(TITLE_LOG_PATH), raw, &line)
}

unsafe fn append_line(path: &Path, raw: OutputPrimitive, line: &str) -> bool {
    let file = match OpenOptions::new().create(true).append(true).open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    // One write call for the whole line; O_APPEND atomicity is what keeps
    // concurrent writers from interleaving partial lines. The handle closes
    // on drop -- no persistent fd between records.
    let n = raw(
        file.as_raw_fd(),
        line.as_ptr() as *const c_void,
        line.len() as size_t,
    );
    n == line.len() as ssize_t
}

// ── Interception shim ────────────────────────────────────────────────

/// Forward `write(fd, buf, count)` through `original`, then -- when the call
/// targeted stdout/stderr, bytes were accepted, and the toggle is on -- scan
/// the accepted prefix for titles and log each one. The original's return
/// value is passed through unchanged in every case.
///
/// # Safety
/// `buf` and `count` must describe the caller's buffer exactly as they
/// would for write(2) itself.
pub unsafe fn intercept(
    original: OutputPrimitive,
    fd: c_int,
    buf: *const c_void,
    count: size_t,
) -> ssize_t {
    let written = original(fd, buf, count);

    if written > 0
        && (fd == libc::STDOUT_FILENO || fd == libc::STDERR_FILENO)
        && !buf.is_null()
        && count > 0
        && interception_enabled()
    {
        // Scan only what the stream actually accepted: a partial write must
        // not be scanned beyond the bytes that succeeded.
        let accepted = (written as usize).min(count);
        let data = std::slice::from_raw_parts(buf as *const u8, accepted);
        for title in scan_titles(data) {
            let _ = record(original, &TitleRecord::capture(title));
        }
    }

    written
}

// ── Exported symbol & load hook ──────────────────────────────────────

/// The interposed write(2). The dynamic loader binds callers in the observed
/// process to this symbol; the real primitive is reached through `resolve`.
#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    intercept(resolve(), fd, buf, count)
}

/// Resolve eagerly at load when the toggle is already active; otherwise the
/// first intercepted call pays for resolution.
#[ctor::ctor]
fn load_hook() {
    if interception_enabled() {
        let _ = resolve();
    }
}

// ── Unit tests ───────────────────────────────────────────────────────
