use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

pub const DEFAULT_TAIL_LINES: usize = 50;

const TAIL_CHUNK: u64 = 8 * 1024;

/// Last `lines` lines of a file. Missing or unreadable files yield nothing.
///
/// Reads backwards from the end in fixed chunks, so only the tail is loaded.
pub fn tail_file(path: &Path, lines: usize) -> Vec<String> {
    if lines == 0 {
        return Vec::new();
    }
    let Ok(mut file) = File::open(path) else {
        return Vec::new();
    };
    let Ok(mut start) = file.seek(SeekFrom::End(0)) else {
        return Vec::new();
    };

    let mut buf: Vec<u8> = Vec::new();
    let mut newlines = 0;
    // One newline more than wanted guarantees the partial first line is dropped.
    while start > 0 && newlines <= lines {
        let step = TAIL_CHUNK.min(start);
        start -= step;
        let mut chunk = vec![0u8; step as usize];
        if file.seek(SeekFrom::Start(start)).is_err() || file.read_exact(&mut chunk).is_err() {
            return Vec::new();
        }
        newlines += chunk.iter().filter(|&&b| b == b'\n').count();
        chunk.extend_from_slice(&buf);
        buf = chunk;
    }

    let text = String::from_utf8_lossy(&buf);
    let all: Vec<&str> = text.lines().collect();
    let first = all.len().saturating_sub(lines);
    all[first..].iter().map(|l| l.to_string()).collect()
}

/// Tails of every non-empty log, keyed by file name.
pub fn collect_tails(files: &[(String, PathBuf)], lines: usize) -> BTreeMap<String, Vec<String>> {
    files
        .iter()
        .filter_map(|(name, path)| {
            let tail = tail_file(path, lines);
            (!tail.is_empty()).then(|| (name.clone(), tail))
        })
        .collect()
}

/// Flatten tails into one block of text for error messages.
pub fn format_tails(tails: &BTreeMap<String, Vec<String>>) -> String {
    tails
        .iter()
        .map(|(name, lines)| format!("==> {} <==\n{}", name, lines.join("\n")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Error markers looked for by log analysis.
pub const ERROR_MARKERS: &[&str] = &["ERROR", "Traceback", "Exception", "panicked"];

/// Result of scanning one log for error markers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ErrorScan {
    /// Matching lines in the whole file.
    pub total: usize,
    /// The last matches, with their 1-based line number, oldest first.
    pub recent: VecDeque<(usize, String)>,
}

/// Stream `path` line by line, counting every line that contains an error
/// marker and keeping at most `keep` of the latest ones.
pub fn scan_for_errors(path: &Path, keep: usize) -> ErrorScan {
    let mut scan = ErrorScan::default();
    let Ok(file) = File::open(path) else {
        return scan;
    };
    let mut reader = BufReader::new(file);
    let mut raw = Vec::new();
    let mut number = 0;
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Stopped reading log");
                break;
            }
        }
        number += 1;
        let line = String::from_utf8_lossy(&raw);
        if !ERROR_MARKERS.iter().any(|m| line.contains(m)) {
            continue;
        }
        scan.total += 1;
        if keep == 0 {
            continue;
        }
        if scan.recent.len() == keep {
            scan.recent.pop_front();
        }
        scan.recent
            .push_back((number, line.trim_end_matches(['\r', '\n']).to_string()));
    }
    scan
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        std::fs::write(&path, "1\n2\n3\n4\n").unwrap();
        assert_eq!(tail_file(&path, 2), vec!["3", "4"]);
        assert_eq!(tail_file(&path, 10).len(), 4);
        assert!(tail_file(&dir.path().join("missing.log"), 5).is_empty());
    }

    #[test]
    fn test_collect_and_format_tails() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("backend.log");
        let empty = dir.path().join("backend.err.log");
        std::fs::write(&out, "booting\n").unwrap();
        std::fs::write(&empty, "").unwrap();
        let tails = collect_tails(
            &[
                ("backend.log".to_string(), out),
                ("backend.err.log".to_string(), empty),
            ],
            10,
        );
        assert_eq!(tails.len(), 1);
        assert_eq!(format_tails(&tails), "==> backend.log <==\nbooting");
    }

    #[test]
    fn test_tail_file_reads_only_the_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        let body: String = (1..=50_000).map(|i| format!("line {}\n", i)).collect();
        std::fs::write(&path, body).unwrap();
        assert_eq!(tail_file(&path, 3), vec!["line 49998", "line 49999", "line 50000"]);
        assert_eq!(tail_file(&path, 2_000).first().unwrap(), "line 48001");
        assert!(tail_file(&path, 0).is_empty());
    }

    #[test]
    fn test_tail_file_lines_longer_than_a_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        let long = "x".repeat(3 * TAIL_CHUNK as usize);
        std::fs::write(&path, format!("head\n{}\nlast", long)).unwrap();
        let tail = tail_file(&path, 2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0], long);
        assert_eq!(tail[1], "last");
        assert_eq!(tail_file(&path, 5), vec!["head".to_string(), long, "last".to_string()]);
    }

    #[test]
    fn test_scan_for_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.err.log");
        std::fs::write(&path, "ok\nERROR db down\nfine\r\nTraceback (most recent call last):\r\n")
            .unwrap();
        let scan = scan_for_errors(&path, 10);
        assert_eq!(scan.total, 2);
        assert_eq!(scan.recent[0], (2, "ERROR db down".to_string()));
        assert_eq!(scan.recent[1].1, "Traceback (most recent call last):");
        assert_eq!(scan_for_errors(&dir.path().join("missing.log"), 10), ErrorScan::default());
    }

    #[test]
    fn test_scan_for_errors_keeps_only_latest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.log");
        let body: String = (1..=20_000)
            .map(|i| if i % 2 == 0 { format!("ERROR {}\n", i) } else { format!("ok {}\n", i) })
            .collect();
        std::fs::write(&path, body).unwrap();

        let scan = scan_for_errors(&path, 3);
        assert_eq!(scan.total, 10_000);
        let numbers: Vec<usize> = scan.recent.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![19_996, 19_998, 20_000]);
        assert_eq!(scan.recent[2].1, "ERROR 20000");

        let counted = scan_for_errors(&path, 0);
        assert_eq!(counted.total, 10_000);
        assert!(counted.recent.is_empty());
    }
}
