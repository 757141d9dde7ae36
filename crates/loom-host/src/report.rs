//! Error Reports
//!
//! Pretty-prints uncaught errors and unhandled rejections: heading, source
//! excerpt with a caret under the failing column, then the stack.

use std::fmt::Write as _;

use loom_js::{DrainReport, ScriptError};

use crate::ops;
use crate::output::Output;

/// How an error reached the top level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Uncaught,
    UnhandledRejection,
}

/// Print every failure a drain observed to the error stream
pub fn print_drain(output: &Output, report: &DrainReport) {
    let failures = report
        .errors
        .iter()
        .map(|error| (error, ErrorKind::Uncaught))
        .chain(report.unhandled_rejections.iter().map(|error| (error, ErrorKind::UnhandledRejection)));
    for (error, kind) in failures {
        let source = error
            .location
            .as_ref()
            .and_then(|location| ops::read_text_file_sync(&location.url).ok());
        output.write_stderr(format_error(error, kind, source.as_deref()).as_bytes());
    }
}

/// Render one error. `source` is the text of the file the error points into.
pub fn format_error(error: &ScriptError, kind: ErrorKind, source: Option<&str>) -> String {
    let mut text = String::new();
    let prefix = match kind {
        ErrorKind::Uncaught => "Uncaught",
        ErrorKind::UnhandledRejection => "Uncaught (in promise)",
    };
    // Thrown non-errors are captured with the name "Uncaught"
    if error.name == "Uncaught" {
        let _ = writeln!(text, "{prefix} {}", error.message);
    } else {
        let _ = writeln!(text, "{prefix} {}: {}", error.name, error.message);
    }
    if let Some(code) = &error.code {
        let _ = writeln!(text, "  code: {code}");
    }

    if let Some(location) = &error.location {
        match location.column {
            Some(column) => {
                let _ = writeln!(text, "  at {}:{}:{}", location.url, location.line, column);
            }
            None => {
                let _ = writeln!(text, "  at {}:{}", location.url, location.line);
            }
        }
        if let Some(excerpt) = source.and_then(|source| excerpt(source, location.line, location.column)) {
            text.push_str(&excerpt);
        }
    }

    if let Some(stack) = &error.stack {
        for frame in stack.lines().filter(|line| !line.trim().is_empty()) {
            let _ = writeln!(text, "  {}", frame.trim_end());
        }
    }
    text
}

/// The numbered source line and, when the column is known, a caret under it
fn excerpt(source: &str, line: u32, column: Option<u32>) -> Option<String> {
    let index = usize::try_from(line).ok()?.checked_sub(1)?;
    let code = source.lines().nth(index)?;
    let gutter = line.to_string();

    let mut text = String::new();
    let _ = writeln!(text, "\n  {gutter} | {code}");
    if let Some(column) = column {
        // Columns are 1-based; tabs are kept so the caret lines up
        let pad: String = code
            .chars()
            .take(column.saturating_sub(1) as usize)
            .map(|c| if c == '\t' { '\t' } else { ' ' })
            .collect();
        let _ = writeln!(text, "  {} | {pad}^", " ".repeat(gutter.len()));
    }
    text.push('\n');
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_js::SourceLocation;

    fn located(line: u32, column: Option<u32>) -> ScriptError {
        let mut error = ScriptError::new("TypeError", "x is not a function");
        error.location = Some(SourceLocation {
            url: "file:///app/main.js".to_string(),
            line,
            column,
        });
        error
    }

    #[test]
    fn test_heading_and_caret() {
        let source = "let a = 1;\n\tx();\n";
        let text = format_error(&located(2, Some(2)), ErrorKind::Uncaught, Some(source));
        assert!(text.starts_with("Uncaught TypeError: x is not a function\n"));
        assert!(text.contains("  at file:///app/main.js:2:2\n"));
        assert!(text.contains("  2 | \tx();\n"));
        assert!(text.contains("    | \t^\n"));
    }

    #[test]
    fn test_rejection_heading() {
        let error = ScriptError::new("Error", "boom").with_code("ENOENT");
        let text = format_error(&error, ErrorKind::UnhandledRejection, None);
        assert_eq!(text, "Uncaught (in promise) Error: boom\n  code: ENOENT\n");
    }

    #[test]
    fn test_thrown_non_error() {
        let error = ScriptError::new("Uncaught", "42");
        assert_eq!(format_error(&error, ErrorKind::Uncaught, None), "Uncaught 42\n");
    }

    #[test]
    fn test_line_out_of_range_skips_excerpt() {
        let text = format_error(&located(9, None), ErrorKind::Uncaught, Some("one line"));
        assert!(!text.contains(" | "));
        assert!(text.contains("main.js:9\n"));
    }

    #[test]
    fn test_stack_frames_indented() {
        let mut error = ScriptError::new("Error", "deep");
        error.stack = Some("    at f (file:///a.js:1:1)\n    at g (file:///a.js:2:1)\n".to_string());
        let text = format_error(&error, ErrorKind::Uncaught, None);
        assert!(text.ends_with("      at f (file:///a.js:1:1)\n      at g (file:///a.js:2:1)\n"));
    }

    #[test]
    fn test_print_drain_writes_each_failure() {
        let (output, captured) = Output::capture();
        let report = DrainReport {
            errors: vec![ScriptError::new("Error", "first")],
            unhandled_rejections: vec![ScriptError::new("Error", "second")],
            ..DrainReport::default()
        };
        print_drain(&output, &report);
        let stderr = captured.stderr();
        assert!(stderr.contains("Uncaught Error: first"));
        assert!(stderr.contains("Uncaught (in promise) Error: second"));
    }
}
