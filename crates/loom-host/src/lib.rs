//! Loom Host
//!
//! Runs an ES module program on the Loom runtime: native I/O bindings for
//! scripts, the event loop that feeds their completions back as jobs, and
//! error reporting for the command line.
//!
//! ```no_run
//! use loom_host::HostConfig;
//!
//! let report = loom_host::run(&HostConfig::new("main.js"))?;
//! std::process::exit(report.exit_code().into());
//! # Ok::<(), anyhow::Error>(())
//! ```

mod config;
mod event_loop;
mod ops;
mod output;
mod report;
mod sys;

use anyhow::{Context, anyhow};
use loom_js::{DrainReport, Engine, RuntimeError, ScriptError};

pub use config::{CONFIG_VAR, ConfigError, HostConfig, LOG_VAR, MEMORY_LIMIT_VAR};
pub use output::{CapturedOutput, Output};
pub use report::{ErrorKind, format_error, print_drain};

use event_loop::EventLoop;

const BOOTSTRAP_JS: &str = include_str!("bootstrap.js");
const BOOTSTRAP_URL: &str = "loom:bootstrap";

/// Outcome of a program run
#[derive(Debug, Default)]
pub struct RunReport {
    pub errors: Vec<ScriptError>,
    pub unhandled_rejections: Vec<ScriptError>,
    pub jobs_run: usize,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && self.unhandled_rejections.is_empty()
    }

    /// Process exit status: 1 after any uncaught error, else 0
    pub fn exit_code(&self) -> u8 {
        if self.is_success() { 0 } else { 1 }
    }
}

impl From<DrainReport> for RunReport {
    fn from(report: DrainReport) -> Self {
        Self {
            errors: report.errors,
            unhandled_rejections: report.unhandled_rejections,
            jobs_run: report.jobs_run,
        }
    }
}

/// Run `config.entry` writing to the process's standard streams
pub fn run(config: &HostConfig) -> anyhow::Result<RunReport> {
    run_with_output(config, Output::inherit())
}

/// Run `config.entry` writing script output and error reports to `output`
pub fn run_with_output(config: &HostConfig, output: Output) -> anyhow::Result<RunReport> {
    let engine = Engine::with_config(&config.engine_config()).context("failed to start the JavaScript engine")?;
    let event_loop =
        EventLoop::new(engine, output, config.script_args())?.keep_alive_on_error(config.keep_alive_on_error);

    tracing::info!("Running {}", config.entry.display());
    start(&event_loop)?;
    let report = event_loop.run().context("event loop failed")?;
    event_loop.close().context("failed to shut down the engine")?;
    Ok(report.into())
}

/// Install `sys`, evaluate the bootstrap and queue its `main`
fn start(event_loop: &EventLoop) -> anyhow::Result<()> {
    let state = event_loop.state();
    event_loop
        .realm()
        .enter(|api| -> Result<(), RuntimeError> {
            let sys = sys::create(api, state)?;
            let bootstrap = api.eval(BOOTSTRAP_JS, BOOTSTRAP_URL)?;
            let exports = api
                .call_function(&bootstrap, vec![sys.into_value()])?
                .into_object()
                .ok_or_else(|| ScriptError::new("TypeError", "bootstrap did not return an object"))?;
            let load_module = api.get_property(&exports, "loadModule")?;
            api.set_module_load_callback(load_module)?;
            let main = api.get_property(&exports, "main")?;
            api.enqueue_call(main, Vec::new());
            Ok(())
        })?
        .map_err(|error| anyhow!("bootstrap failed: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code() {
        let mut report = RunReport::default();
        assert_eq!(report.exit_code(), 0);
        report.unhandled_rejections.push(ScriptError::new("Error", "late"));
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_bootstrap_evaluates_to_function() {
        let engine = Engine::create().unwrap();
        let realm = engine.create_realm().unwrap();
        let is_function = realm
            .enter(|api| api.eval(BOOTSTRAP_JS, BOOTSTRAP_URL).unwrap().is_function())
            .unwrap();
        assert!(is_function);
    }
}
