//! Stdout scanner — reads the worker's standard output line by line and
//! hands each non-empty line to the owning diagnostic.

use std::io::{BufRead, BufReader, Read};
use std::process::ChildStdout;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Anything that wants to see the worker's stdout lines. Returns `false` to
/// request the scanner stop reading (mirrors the original's "valid" flag).
pub trait LineSink: Send + Sync {
    fn process_line(&self, line: &str) -> bool;
}

/// Scans a child process's stdout on a dedicated thread, decoding bytes as
/// UTF-8 with invalid sequences replaced (never fails on binary noise from a
/// misbehaving worker).
pub struct StdoutScanner {
    kill: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StdoutScanner {
    /// Spawn the scanning thread over `stdout`, delivering lines to `sink`.
    pub fn start(stdout: ChildStdout, sink: Arc<dyn LineSink>) -> Self {
        let kill = Arc::new(AtomicBool::new(false));
        let kill_thread = kill.clone();
        let handle = thread::spawn(move || scan(stdout, sink, kill_thread));
        StdoutScanner {
            kill,
            handle: Some(handle),
        }
    }

    /// Signal the scanner to stop and wait briefly for the read loop to notice.
    pub fn wait(&mut self) {
        self.kill.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StdoutScanner {
    fn drop(&mut self) {
        self.kill.store(true, Ordering::SeqCst);
    }
}

fn scan(stdout: ChildStdout, sink: Arc<dyn LineSink>, kill: Arc<AtomicBool>) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        if kill.load(Ordering::SeqCst) {
            break;
        }
        buf.clear();
        let n = match reader.read_until(b'\n', &mut buf) {
            Ok(n) => n,
            Err(_) => break,
        };
        if n == 0 {
            break; // stream closed
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            continue;
        }
        let keep_going = sink.process_line(line);
        if kill.load(Ordering::SeqCst) || !keep_going {
            break;
        }
    }
    // drain whatever is left so the child's write end doesn't block on a full pipe
    let _ = reader.into_inner().read_to_end(&mut Vec::new());
}
