//! Maps a raw sandbox outcome onto a verdict.
//!
//! | outcome                              | verdict           | status    |
//! |--------------------------------------|-------------------|-----------|
//! | exit 0, trimmed stdout == expected   | Accepted          | completed |
//! | exit 0, stdout differs               | WrongAnswer       | completed |
//! | non-zero exit or killed by a signal  | RuntimeError      | failed    |
//! | wall-clock limit exceeded            | TimeLimitExceeded | failed    |
//! | sandbox could not run the code       | InternalError     | failed    |

use crate::scheduler::{JobOutcome, Verdict};
use crate::worker::sandbox::SandboxOutcome;

/// Leading/trailing whitespace is ignored, everything else must match
/// exactly. No numeric tolerance, no partial credit.
pub fn outputs_match(actual: &str, expected: &str) -> bool {
    actual.trim() == expected.trim()
}

pub fn judge(outcome: &SandboxOutcome, expected_output: &str, stderr_tail_bytes: usize) -> JobOutcome {
    if let Some(ref error) = outcome.spawn_error {
        return JobOutcome::internal_error(format!("sandbox failure: {}", error));
    }

    let stdout = outcome.stdout.trim_end().to_string();

    if outcome.timed_out {
        return JobOutcome {
            verdict: Verdict::TimeLimitExceeded,
            actual_output: stdout,
            exit_code: None,
        };
    }

    if outcome.exit_code == Some(0) {
        let verdict = if outputs_match(&outcome.stdout, expected_output) {
            Verdict::Accepted
        } else {
            Verdict::WrongAnswer
        };
        return JobOutcome {
            verdict,
            actual_output: stdout,
            exit_code: Some(0),
        };
    }

    JobOutcome {
        verdict: Verdict::RuntimeError,
        actual_output: runtime_error_output(outcome, stdout, stderr_tail_bytes),
        exit_code: outcome.exit_code,
    }
}

fn runtime_error_output(outcome: &SandboxOutcome, stdout: String, tail_bytes: usize) -> String {
    let mut output = stdout;
    let stderr = outcome.stderr.trim();
    let detail = if !stderr.is_empty() {
        tail(stderr, tail_bytes).to_string()
    } else if let Some(signal) = outcome.signal {
        format!("killed by signal {}", signal)
    } else {
        format!("exit code {}", outcome.exit_code.unwrap_or(-1))
    };

    if !output.is_empty() {
        output.push('\n');
    }
    output.push_str(&detail);
    output
}

/// Last `max_bytes` of `text`, cut on a character boundary. Tracebacks keep
/// the useful part at the end.
fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
