//! Output Streams
//!
//! Where `sys.stdout`, `sys.stderr` and error reports are written. The
//! binary inherits the process streams; tests capture them.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

type Stream = Rc<RefCell<dyn Write>>;

/// Script-visible output streams
#[derive(Clone)]
pub struct Output {
    stdout: Stream,
    stderr: Stream,
}

impl Output {
    /// Write to the process's standard streams
    pub fn inherit() -> Self {
        Self {
            stdout: Rc::new(RefCell::new(io::stdout())),
            stderr: Rc::new(RefCell::new(io::stderr())),
        }
    }

    /// Collect everything written into memory
    pub fn capture() -> (Self, CapturedOutput) {
        let captured = CapturedOutput::default();
        let stdout: Stream = captured.stdout.clone();
        let stderr: Stream = captured.stderr.clone();
        (Self { stdout, stderr }, captured)
    }

    pub fn write_stdout(&self, bytes: &[u8]) {
        write_all(&self.stdout, bytes);
    }

    pub fn write_stderr(&self, bytes: &[u8]) {
        write_all(&self.stderr, bytes);
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::inherit()
    }
}

fn write_all(stream: &Stream, bytes: &[u8]) {
    let Ok(mut stream) = stream.try_borrow_mut() else {
        tracing::warn!("Dropped {} byte(s) written during a nested write", bytes.len());
        return;
    };
    if let Err(error) = stream.write_all(bytes).and_then(|()| stream.flush()) {
        tracing::debug!("Output write failed: {}", error);
    }
}

/// In-memory copy of the output streams
#[derive(Default, Clone)]
pub struct CapturedOutput {
    stdout: Rc<RefCell<Vec<u8>>>,
    stderr: Rc<RefCell<Vec<u8>>>,
}

impl CapturedOutput {
    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout.borrow()).into_owned()
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr.borrow()).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_separates_streams() {
        let (output, captured) = Output::capture();
        output.write_stdout(b"out ");
        output.write_stderr(b"err");
        output.clone().write_stdout(b"again");

        assert_eq!(captured.stdout(), "out again");
        assert_eq!(captured.stderr(), "err");
    }
}
