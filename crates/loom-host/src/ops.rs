//! Native Operations
//!
//! Asynchronous OS services run on the host executor. Each operation ends in
//! exactly one [`Completion`] sent back to the event loop; no script runs
//! inside these futures.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use loom_js::{HostError, Url};
use smol::channel::Sender;
use smol::fs::ReadDir;
use smol::process::{Child, Command};
use smol::stream::StreamExt;

/// Identifier of a pending operation
pub(crate) type OpId = u32;

/// Successful result of an operation, converted to a script value on delivery
pub(crate) enum OpValue {
    Unit,
    Text(String),
    Directory(ReadDir),
    Entries(Vec<String>),
    Exit(Option<i32>),
}

impl fmt::Debug for OpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpValue::Unit => f.write_str("Unit"),
            OpValue::Text(text) => f.debug_tuple("Text").field(&text.len()).finish(),
            OpValue::Directory(_) => f.write_str("Directory"),
            OpValue::Entries(names) => f.debug_tuple("Entries").field(names).finish(),
            OpValue::Exit(code) => f.debug_tuple("Exit").field(code).finish(),
        }
    }
}

/// Message from the executor to the event loop
pub(crate) enum Completion {
    Op {
        id: OpId,
        result: Result<OpValue, HostError>,
    },
    /// A directory read hands its stream back alongside the entries
    DirectoryRead {
        id: OpId,
        directory: u32,
        stream: ReadDir,
        result: Result<Vec<String>, HostError>,
    },
    Timer {
        timer: u32,
    },
}

fn path_error(path: &Path, error: io::Error) -> HostError {
    let mut error = HostError::from(error);
    error.message = format!("{}: {}", error.message, path.display());
    error
}

/// Map a `file:` URL to a local path
pub(crate) fn file_path(url: &str) -> Result<PathBuf, HostError> {
    let parsed = Url::parse(url).map_err(|e| HostError::new(format!("Invalid URL '{url}': {e}"), "EINVAL"))?;
    if parsed.scheme() != "file" {
        return Err(HostError::new(
            format!("Unsupported URL scheme '{}' in {url}", parsed.scheme()),
            "EINVAL",
        ));
    }
    parsed
        .to_file_path()
        .map_err(|()| HostError::new(format!("URL does not name a local file: {url}"), "EINVAL"))
}

pub(crate) fn read_text_file_sync(url: &str) -> Result<String, HostError> {
    let path = file_path(url)?;
    std::fs::read_to_string(&path).map_err(|e| path_error(&path, e))
}

pub(crate) async fn read_text_file(url: String) -> Result<OpValue, HostError> {
    let path = file_path(&url)?;
    let text = smol::fs::read_to_string(&path).await.map_err(|e| path_error(&path, e))?;
    Ok(OpValue::Text(text))
}

pub(crate) async fn open_directory(url: String) -> Result<OpValue, HostError> {
    let path = file_path(&url)?;
    let stream = smol::fs::read_dir(&path).await.map_err(|e| path_error(&path, e))?;
    Ok(OpValue::Directory(stream))
}

/// Read up to `count` entry names. Fewer than `count` means the end was reached.
pub(crate) async fn read_directory(id: OpId, directory: u32, mut stream: ReadDir, count: usize) -> Completion {
    let mut names = Vec::with_capacity(count.min(64));
    let mut failure = None;
    while names.len() < count {
        match stream.next().await {
            Some(Ok(entry)) => names.push(entry.file_name().to_string_lossy().into_owned()),
            Some(Err(error)) => {
                failure = Some(HostError::from(error));
                break;
            }
            None => break,
        }
    }
    Completion::DirectoryRead {
        id,
        directory,
        stream,
        result: failure.map_or(Ok(names), Err),
    }
}

/// Start `program` with `args`, inheriting the standard streams
pub(crate) fn spawn_process(program: &str, args: &[String]) -> Result<Child, HostError> {
    Command::new(program)
        .args(args)
        .spawn()
        .map_err(|e| path_error(Path::new(program), e))
}

pub(crate) async fn wait_process(mut child: Child) -> Result<OpValue, HostError> {
    let status = child.status().await?;
    Ok(OpValue::Exit(status.code()))
}

/// Fire once after `delay`, then every `interval` when one is given
pub(crate) async fn run_timer(timer: u32, delay: Duration, interval: Option<Duration>, sender: Sender<Completion>) {
    smol::Timer::after(delay).await;
    if sender.send(Completion::Timer { timer }).await.is_err() {
        return;
    }
    let Some(period) = interval else {
        return;
    };
    let mut ticks = smol::Timer::interval(period);
    while ticks.next().await.is_some() {
        if sender.send(Completion::Timer { timer }).await.is_err() {
            return;
        }
    }
}
