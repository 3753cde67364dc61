//! Reference client: submits one file and collects the transcript.

use std::{collections::BTreeSet, sync::OnceLock, time::Duration};

use anyhow::{Context, Result};
use regex::Regex;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::timeout,
};
use tracing::debug;

use crate::protocol::{encode_request, RESULT_TERMINATOR};

pub const FALLBACK_FILENAME: &str = "untitled.kt";

/// Name sent on the wire for a buffer called `name`.
pub fn wire_filename(name: Option<&str>) -> String {
    match name.map(str::trim) {
        None | Some("") | Some("Untitled") => FALLBACK_FILENAME.to_string(),
        Some(name) => name.to_string(),
    }
}

/// Sends the request and reads lines until `END_OF_RESULT`. The returned
/// transcript is trimmed.
pub async fn submit(addr: &str, filename: &str, code: &str, wait: Duration) -> Result<String> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to {addr} (is the server running?)"))?;
    let (read_half, mut write_half) = stream.into_split();

    write_half.write_all(encode_request(filename, code).as_bytes()).await?;
    write_half.flush().await?;
    debug!(addr, filename, bytes = code.len(), "request sent");

    let collect = async {
        let mut lines = BufReader::new(read_half).lines();
        let mut result = String::new();
        while let Some(line) = lines.next_line().await? {
            if line == RESULT_TERMINATOR {
                break;
            }
            result.push_str(&line);
            result.push('\n');
        }
        anyhow::Ok(result)
    };
    let result = timeout(wait, collect)
        .await
        .with_context(|| format!("no result from {addr} within {wait:?}"))??;
    Ok(result.trim().to_string())
}

/// Heuristic used by the client to colour a transcript.
pub fn looks_failed(transcript: &str) -> bool {
    let lower = transcript.to_lowercase();
    lower.contains("failed") || lower.contains("error")
}

fn line_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)error:.* line (\d+)",
            r"(?i)(\d+):\d+: error:",
            r"(?i)line (\d+):",
            r#"(?i)File ".*?", line (\d+)"#,
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// 1-based source lines that compiler diagnostics in `transcript` point at.
pub fn error_lines(transcript: &str) -> BTreeSet<usize> {
    line_patterns()
        .iter()
        .flat_map(|re| re.captures_iter(transcript))
        .filter_map(|caps| caps.get(1)?.as_str().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_filename_falls_back_to_kotlin() {
        assert_eq!(wire_filename(None), "untitled.kt");
        assert_eq!(wire_filename(Some("")), "untitled.kt");
        assert_eq!(wire_filename(Some("Untitled")), "untitled.kt");
        assert_eq!(wire_filename(Some("Hello.java")), "Hello.java");
    }

    #[test]
    fn finds_lines_in_common_diagnostics() {
        let python = "Compilation failed!\n  File \"/tmp/relay-x/a.py\", line 3\n    print(\"x)\n";
        assert_eq!(error_lines(python), BTreeSet::from([3]));

        let kotlin = "Main.kt:2:21: error: unclosed string literal";
        assert_eq!(error_lines(kotlin), BTreeSet::from([2]));

        let generic = "syntax error: unexpected token at line 8\nline 4: warning";
        assert_eq!(error_lines(generic), BTreeSet::from([4, 8]));
    }

    #[test]
    fn ignores_line_zero_and_success() {
        assert!(error_lines("line 0: nothing").is_empty());
        assert!(error_lines("Compilation and execution successful!").is_empty());
    }

    #[test]
    fn failure_heuristic() {
        assert!(looks_failed("Compilation failed!"));
        assert!(looks_failed("Server error: boom"));
        assert!(!looks_failed("Compilation and execution successful!"));
    }
}
