//! File follower — polls a worker's output file by mtime and feeds whole
//! lines to a [`LineProcessor`], reassembling lines split across reads and
//! recovering from truncation or file recreation.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

/// Worker output is checked for a new mtime on this cadence.
const POLL_INTERVAL: Duration = Duration::from_millis(400);
/// Backoff after a read/seek error (file briefly missing during a restart, etc).
const ERROR_BACKOFF: Duration = Duration::from_millis(700);

/// Consumer of the lines a followed file produces. Implemented by the
/// per-diagnostic parsers (e.g. the Infoli voltage-trace reader); the
/// follower itself never interprets a line's contents.
pub trait LineProcessor: Send + Sync {
    /// Validate `line`'s shape. `false` signals a malformed read that may
    /// just be a torn write and should be retried once more data arrives.
    fn assert_line(&self, line: &str) -> bool;

    /// Hand a validated line to the diagnostic.
    fn process_line(&self, line: &str);

    /// Lines past this point (e.g. past the configured step count) are read
    /// but not interpreted.
    fn break_condition(&self, line: &str) -> bool;

    /// Minimum whitespace-separated field count a complete line must have.
    fn expected_length(&self) -> usize;

    /// Simulation step to resume scanning from (used to compute the initial
    /// seek offset after a restart).
    fn sim_step(&self) -> usize;

    /// Called when the follower gives up on the stream (corruption past
    /// recovery, or an injected bit-flip landed on a blank line).
    fn fail(&self);
}

/// Spawns a thread that tails `filename`, demuxing it into lines for
/// `processor`. Exactly one follower per monitored file.
pub struct FileFollower {
    fail: Arc<AtomicBool>,
    inject: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FileFollower {
    /// Open `path` (retrying while it does not exist yet — a worker may not
    /// have created its output file the instant the supervisor starts
    /// watching it) and begin following it on a background thread.
    pub fn start(path: impl Into<PathBuf>, processor: Arc<dyn LineProcessor>) -> Self {
        let path = path.into();
        let mut file = open_with_retry(&path);
        let offsets = line_offsets(&mut file);
        seek_to_step(&mut file, &offsets, processor.sim_step());
        let mtime = mtime_of(&path);

        let fail = Arc::new(AtomicBool::new(false));
        let inject = Arc::new(AtomicBool::new(false));
        let fail_thread = fail.clone();
        let inject_thread = inject.clone();

        let handle = thread::spawn(move || {
            run(path, file, mtime, processor, fail_thread, inject_thread);
        });

        FileFollower {
            fail,
            inject,
            handle: Some(handle),
        }
    }

    /// Stop following and wait for the background thread to exit.
    pub fn wait(&mut self) {
        self.fail.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Arm a one-shot first-four-bits corruption of the next non-blank line
    /// read (silent data corruption injection).
    pub fn inject_sdc(&self) {
        self.inject.store(true, Ordering::SeqCst);
    }
}

impl Drop for FileFollower {
    fn drop(&mut self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

fn open_with_retry(path: &Path) -> File {
    loop {
        match File::open(path) {
            Ok(f) => return f,
            Err(_) => thread::sleep(Duration::from_millis(100)),
        }
    }
}

fn mtime_of(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Byte offset of the start of each line in the file, as of the last time it
/// was (re)computed. Falls back to `[0]` for an empty file.
fn line_offsets(file: &mut File) -> Vec<u64> {
    file.seek(SeekFrom::Start(0)).ok();
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok();
    let mut offsets = Vec::new();
    let mut offset = 0u64;
    for line in contents.split_inclusive('\n') {
        offsets.push(offset);
        offset += line.len() as u64;
    }
    if offsets.is_empty() {
        offsets.push(0);
    }
    file.seek(SeekFrom::Start(0)).ok();
    offsets
}

fn seek_to_step(file: &mut File, offsets: &[u64], step: usize) {
    let target = offsets.get(step).copied().unwrap_or(0);
    file.seek(SeekFrom::Start(target)).ok();
}

fn run(
    path: PathBuf,
    mut file: File,
    mut mtime: SystemTime,
    processor: Arc<dyn LineProcessor>,
    fail: Arc<AtomicBool>,
    inject: Arc<AtomicBool>,
) {
    // Give the worker a moment to produce its first write before polling.
    if mtime_of(&path) == mtime {
        thread::sleep(POLL_INTERVAL);
    }

    let mut temp_string = String::new();
    let mut temp_saved = false;

    loop {
        if fail.load(Ordering::SeqCst) {
            break;
        }

        let current_mtime = mtime_of(&path);
        if current_mtime == mtime {
            thread::sleep(Duration::from_millis(50));
            continue;
        }
        mtime = current_mtime;

        let mut text = String::new();
        if file.read_to_string(&mut text).is_err() {
            thread::sleep(ERROR_BACKOFF);
            continue;
        }

        let lines: Vec<&str> = text.lines().collect();
        if lines.is_empty() {
            // File was truncated or recreated out from under us; reopen and
            // recompute offsets rather than trust the stale file handle.
            match File::open(&path) {
                Ok(mut reopened) => {
                    let offsets = line_offsets(&mut reopened);
                    seek_to_step(&mut reopened, &offsets, processor.sim_step());
                    file = reopened;
                }
                Err(_) => thread::sleep(ERROR_BACKOFF),
            }
            continue;
        }

        process_linelist(
            &lines,
            &processor,
            &fail,
            &inject,
            &mut temp_string,
            &mut temp_saved,
        );
    }
}

fn process_linelist(
    lines: &[&str],
    processor: &Arc<dyn LineProcessor>,
    fail: &Arc<AtomicBool>,
    inject: &Arc<AtomicBool>,
    temp_string: &mut String,
    temp_saved: &mut bool,
) {
    let last_index = lines.len() - 1;
    for (counter, raw_line) in lines.iter().enumerate() {
        if fail.load(Ordering::SeqCst) {
            return;
        }

        if raw_line.split_whitespace().next().is_none() {
            if inject.load(Ordering::SeqCst) {
                processor.fail();
                return;
            }
            continue;
        }

        let mut line = raw_line.to_string();
        if inject.load(Ordering::SeqCst) && !processor.break_condition(&line) {
            inject.store(false, Ordering::SeqCst);
            line = corrupt_first_four_bits(&line);
        }

        if *temp_saved
            && counter == 0
            && temp_string.split_whitespace().count() < processor.expected_length()
        {
            line = format!("{temp_string}{line}");
            *temp_saved = false;
        }

        if fail.load(Ordering::SeqCst) {
            return;
        }

        if processor.break_condition(&line) {
            continue;
        }

        if processor.assert_line(&line) {
            processor.process_line(&line);
        } else {
            let trimmed = line.trim();
            let looks_complete = trimmed.split_whitespace().count() >= processor.expected_length()
                && !trimmed.ends_with('-');
            if looks_complete {
                processor.fail();
                fail.store(true, Ordering::SeqCst);
                return;
            } else if counter == last_index {
                *temp_string = line;
                *temp_saved = true;
            }
        }
    }
}

/// XOR-flip the first four bits of `line`'s byte representation — a silent
/// data corruption injection targeting the leading field of a voltage trace
/// row. Matches the least-significant bit of each of the line's first four
/// bytes, never a byte's top bit, so a 7-bit ASCII input stays valid UTF-8.
fn corrupt_first_four_bits(line: &str) -> String {
    let mut bytes = line.as_bytes().to_vec();
    let flip_count = bytes.len().min(4);
    for byte in bytes.iter_mut().take(flip_count) {
        *byte ^= 1;
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    struct RecordingProcessor {
        lines: Mutex<Vec<String>>,
        failed: AtomicBool,
        expected_length: usize,
    }

    impl LineProcessor for RecordingProcessor {
        fn assert_line(&self, line: &str) -> bool {
            line.split_whitespace().count() >= self.expected_length
        }
        fn process_line(&self, line: &str) {
            self.lines.lock().unwrap().push(line.to_string());
        }
        fn break_condition(&self, _line: &str) -> bool {
            false
        }
        fn expected_length(&self) -> usize {
            self.expected_length
        }
        fn sim_step(&self) -> usize {
            0
        }
        fn fail(&self) {
            self.failed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn offsets_of_empty_file_is_single_zero() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"").unwrap();
        let mut file = tmp.reopen().unwrap();
        assert_eq!(line_offsets(&mut file), vec![0]);
    }

    #[test]
    fn offsets_track_line_starts() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"abc\nde\nf\n").unwrap();
        let mut file = tmp.reopen().unwrap();
        assert_eq!(line_offsets(&mut file), vec![0, 4, 7]);
    }

    #[test]
    fn process_linelist_reassembles_a_line_split_across_two_reads() {
        let recorder = Arc::new(RecordingProcessor {
            lines: Mutex::new(Vec::new()),
            failed: AtomicBool::new(false),
            expected_length: 3,
        });
        let processor: Arc<dyn LineProcessor> = recorder.clone();
        let fail = Arc::new(AtomicBool::new(false));
        let inject = Arc::new(AtomicBool::new(false));
        let mut temp_string = String::new();
        let mut temp_saved = false;

        // First read ends mid-row: only two of three expected fields present.
        process_linelist(
            &["1 2"],
            &processor,
            &fail,
            &inject,
            &mut temp_string,
            &mut temp_saved,
        );
        assert!(temp_saved);
        assert!(recorder.lines.lock().unwrap().is_empty());

        // Second read supplies the rest on its own first line; they merge.
        process_linelist(
            &["3", "1 2 3"],
            &processor,
            &fail,
            &inject,
            &mut temp_string,
            &mut temp_saved,
        );

        // The merged line ("1 23") still falls short of expected_length and
        // isn't the batch's last line, so it is dropped; only the
        // well-formed second line survives.
        assert_eq!(*recorder.lines.lock().unwrap(), vec!["1 2 3"]);
    }

    #[test]
    fn blank_lines_are_skipped_without_injection() {
        let recorder = Arc::new(RecordingProcessor {
            lines: Mutex::new(Vec::new()),
            failed: AtomicBool::new(false),
            expected_length: 1,
        });
        let processor: Arc<dyn LineProcessor> = recorder.clone();
        let fail = Arc::new(AtomicBool::new(false));
        let inject = Arc::new(AtomicBool::new(false));
        let mut temp_string = String::new();
        let mut temp_saved = false;
        process_linelist(
            &["a", "", "b"],
            &processor,
            &fail,
            &inject,
            &mut temp_string,
            &mut temp_saved,
        );
        assert_eq!(*recorder.lines.lock().unwrap(), vec!["a", "b"]);
        assert!(!recorder.failed.load(Ordering::SeqCst));
    }

    #[test]
    fn blank_line_during_injection_fails_the_diagnostic() {
        let recorder = Arc::new(RecordingProcessor {
            lines: Mutex::new(Vec::new()),
            failed: AtomicBool::new(false),
            expected_length: 1,
        });
        let processor: Arc<dyn LineProcessor> = recorder.clone();
        let fail = Arc::new(AtomicBool::new(false));
        let inject = Arc::new(AtomicBool::new(true));
        let mut temp_string = String::new();
        let mut temp_saved = false;
        process_linelist(
            &["", "b"],
            &processor,
            &fail,
            &inject,
            &mut temp_string,
            &mut temp_saved,
        );
        assert!(recorder.failed.load(Ordering::SeqCst));
        assert!(recorder.lines.lock().unwrap().is_empty());
    }

    #[test]
    fn corrupt_first_four_bits_flips_the_low_bit_of_the_first_four_bytes() {
        let original = "12345 0.5 -70.2";
        let corrupted = corrupt_first_four_bits(original);
        assert_eq!(corrupted.as_bytes()[..4], original.as_bytes()[..4].iter().map(|b| b ^ 1).collect::<Vec<u8>>()[..]);
        assert_eq!(corrupted.as_bytes()[4..], original.as_bytes()[4..]);
        let diff: u32 = original
            .bytes()
            .zip(corrupted.bytes())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum();
        assert_eq!(diff, 4);
    }

    #[test]
    fn corrupt_first_four_bits_is_deterministic() {
        let original = "9 3.14159 -1.0";
        assert_eq!(corrupt_first_four_bits(original), corrupt_first_four_bits(original));
    }

    #[test]
    fn corrupt_first_four_bits_handles_short_lines() {
        let original = "ab";
        let corrupted = corrupt_first_four_bits(original);
        assert_eq!(corrupted.len(), 2);
        assert_ne!(corrupted, original);
    }

    #[test]
    fn follower_reads_lines_appended_after_start() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"1 0.0 -65.0\n").unwrap();
        tmp.flush().unwrap();
        let path = tmp.path().to_path_buf();

        let recorder = Arc::new(RecordingProcessor {
            lines: Mutex::new(Vec::new()),
            failed: AtomicBool::new(false),
            expected_length: 3,
        });
        let processor: Arc<dyn LineProcessor> = recorder.clone();

        let mut follower = FileFollower::start(path.clone(), processor);

        thread::sleep(Duration::from_millis(50));
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(b"2 0.1 -64.0\n").unwrap();
        }

        thread::sleep(Duration::from_millis(800));
        follower.wait();

        assert!(recorder.lines.lock().unwrap().iter().any(|l| l.starts_with('2')));
    }
}
