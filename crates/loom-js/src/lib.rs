//! Loom JavaScript Runtime
//!
//! Turns the synchronous QuickJS engine into an asynchronous host runtime.
//!
//! Features:
//! - Engine and realm lifecycle with scoped context entry
//! - A single FIFO job queue for calls, module steps and rejection tracking
//! - ES module loading through a host-provided load callback
//! - Unhandled promise rejection reporting once per drain
//!
//! ```no_run
//! use loom_js::Engine;
//!
//! let engine = Engine::create()?;
//! let realm = engine.create_realm()?;
//! realm.enter(|api| api.eval("Promise.resolve(1)", "file:///main.js").map(drop))??;
//! let report = engine.flush_job_queue()?;
//! assert!(report.is_clean());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod engine;
mod error;
mod handle;
mod imports;
mod job;
mod loader;
mod module;
mod realm;
mod rejection;
pub mod specifier;

pub use engine::{DrainReport, Engine, EngineConfig};
pub use error::{ContractViolation, EngineError, HostError, RuntimeError, ScriptError, SourceLocation};
pub use handle::{Handle, HandleLedger};
pub use imports::{ModuleScan, ScanError, requested_modules, rewrite_dynamic_imports, scan_module, scan_script};
pub use job::{Job, JobKind, JobQueue};
pub use module::{ModuleId, ModuleState};
pub use realm::{Realm, RealmApi, RealmId, ScriptId, WeakRealm};
pub use rejection::{RejectionTable, UnhandledRejection};

/// Re-exported so hosts bind natives against the same engine version
pub use rquickjs;
pub use url::Url;
