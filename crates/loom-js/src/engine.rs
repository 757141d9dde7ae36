//! Engine
//!
//! Owns the QuickJS runtime and the single job queue shared by all realms.
//! [`Engine::flush_job_queue`] is the only place jobs run.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use rquickjs::{Context, Ctx, Runtime, Value};

use crate::error::{EngineError, RuntimeError, ScriptError};
use crate::handle::{Handle, HandleLedger};
use crate::job::{Job, JobQueue};
use crate::loader::{HostLoader, HostResolver};
use crate::realm::{Realm, RealmApi, RealmId, RealmShared, realm_id_of, reenter};
use crate::rejection::{RejectionTable, UnhandledRejection};

/// Runtime limits applied at engine creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Heap limit in bytes
    pub memory_limit: Option<usize>,
    /// Native stack limit in bytes
    pub max_stack_size: Option<usize>,
    /// Allocation volume between collections, in bytes
    pub gc_threshold: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_limit: Some(64 * 1024 * 1024),
            max_stack_size: Some(1024 * 1024),
            gc_threshold: None,
        }
    }
}

impl EngineConfig {
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = Some(bytes);
        self
    }

    pub fn with_gc_threshold(mut self, bytes: usize) -> Self {
        self.gc_threshold = Some(bytes);
        self
    }

    /// No limits at all
    pub fn unlimited() -> Self {
        Self {
            memory_limit: None,
            max_stack_size: None,
            gc_threshold: None,
        }
    }
}

/// What a drain pass observed
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Jobs dispatched from the queue
    pub jobs_run: usize,
    /// Promise reactions run inside the engine
    pub engine_jobs_run: usize,
    /// Uncaught script errors, contract violations and failed root modules
    pub errors: Vec<ScriptError>,
    /// Rejections still without a handler when the queue ran dry
    pub unhandled_rejections: Vec<ScriptError>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.unhandled_rejections.is_empty()
    }

    pub fn merge(&mut self, other: DrainReport) {
        self.jobs_run += other.jobs_run;
        self.engine_jobs_run += other.engine_jobs_run;
        self.errors.extend(other.errors);
        self.unhandled_rejections.extend(other.unhandled_rejections);
    }
}

/// State shared between the engine, its realms and the engine hooks
#[derive(Default)]
pub(crate) struct EngineShared {
    pub(crate) job_queue: JobQueue,
    pub(crate) ledger: Rc<HandleLedger>,
    pub(crate) current: Cell<Option<RealmId>>,
    realms: RefCell<HashMap<RealmId, Weak<RealmShared>>>,
    next_realm_id: Cell<u32>,
    uncaught: RefCell<Vec<ScriptError>>,
}

impl EngineShared {
    pub(crate) fn realm(&self, id: RealmId) -> Option<Rc<RealmShared>> {
        let weak = self.realms.borrow().get(&id).cloned()?;
        weak.upgrade()
    }

    pub(crate) fn unregister_realm(&self, id: RealmId) {
        if let Ok(mut realms) = self.realms.try_borrow_mut() {
            realms.remove(&id);
        }
    }

    fn live_realms(&self) -> usize {
        self.realms
            .borrow()
            .values()
            .filter(|realm| realm.strong_count() > 0)
            .count()
    }

    /// Record an error surfaced outside of a job, picked up by the running drain
    pub(crate) fn report_uncaught(&self, error: ScriptError) {
        self.uncaught.borrow_mut().push(error);
    }

    fn take_uncaught(&self) -> Vec<ScriptError> {
        std::mem::take(&mut *self.uncaught.borrow_mut())
    }

    fn track_rejection<'js>(&self, ctx: &Ctx<'js>, promise: Value<'js>, reason: Value<'js>, is_handled: bool) {
        let Some(realm) = realm_id_of(ctx) else {
            tracing::warn!("Promise rejection in a context without a realm");
            return;
        };
        let promise = Handle::new(&self.ledger, ctx, promise);
        let job = if is_handled {
            Job::RemoveUnhandledRejection { realm, promise }
        } else {
            Job::AddUnhandledRejection {
                realm,
                promise,
                reason: Handle::new(&self.ledger, ctx, reason),
            }
        };
        self.job_queue.enqueue(job);
    }
}

/// The embedded engine: one runtime, one job queue, any number of realms
pub struct Engine {
    shared: Rc<EngineShared>,
    runtime: Runtime,
}

impl Engine {
    /// Create an engine with default limits
    pub fn create() -> Result<Self, EngineError> {
        Self::with_config(&EngineConfig::default())
    }

    pub fn with_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let runtime = Runtime::new().map_err(|e| EngineError::Initialization(e.to_string()))?;
        if let Some(limit) = config.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(size) = config.max_stack_size {
            runtime.set_max_stack_size(size);
        }
        if let Some(threshold) = config.gc_threshold {
            runtime.set_gc_threshold(threshold);
        }

        let shared = Rc::new(EngineShared::default());
        runtime.set_loader(HostResolver::new(Rc::downgrade(&shared)), HostLoader);

        let tracker = Rc::downgrade(&shared);
        runtime.set_host_promise_rejection_tracker(Some(Box::new(
            move |ctx, promise, reason, is_handled| {
                if let Some(engine) = tracker.upgrade() {
                    engine.track_rejection(&ctx, promise, reason, is_handled);
                }
            },
        )));

        tracing::info!("Created JavaScript engine");
        Ok(Self { shared, runtime })
    }

    /// Create a realm with a fresh global context
    pub fn create_realm(&self) -> Result<Realm, EngineError> {
        let context =
            Context::full(&self.runtime).map_err(|e| EngineError::ContextCreation(e.to_string()))?;
        let id = RealmId(self.shared.next_realm_id.get());
        self.shared.next_realm_id.set(id.0 + 1);

        let inner = Rc::new(RealmShared::new(id, context, &self.shared)?);
        self.shared
            .realms
            .borrow_mut()
            .insert(id, Rc::downgrade(&inner));
        inner
            .context
            .with(|ctx| reenter(ctx, &inner, &self.shared, |api| api.install_dynamic_import()))
            .map_err(|error| EngineError::ContextCreation(error.to_string()))?;
        tracing::debug!("Created {}", id);
        Ok(Realm { inner })
    }

    pub fn realm(&self, id: RealmId) -> Option<Realm> {
        self.shared.realm(id).map(|inner| Realm { inner })
    }

    /// Realm owning a native context
    pub fn realm_of(&self, ctx: &Ctx<'_>) -> Option<Realm> {
        self.realm(realm_id_of(ctx)?)
    }

    /// Realm currently entered, if any
    pub fn current_realm(&self) -> Option<Realm> {
        self.realm(self.shared.current.get()?)
    }

    pub fn job_queue(&self) -> &JobQueue {
        &self.shared.job_queue
    }

    pub fn live_handles(&self) -> usize {
        self.shared.ledger.live()
    }

    pub fn live_realms(&self) -> usize {
        self.shared.live_realms()
    }

    pub fn run_gc(&self) {
        self.runtime.run_gc();
    }

    /// Run jobs until the queue and the engine's promise reactions are both empty
    ///
    /// Script errors and contract violations raised by a job are recorded in
    /// the report and the drain continues. Only engine failures abort it.
    pub fn flush_job_queue(&self) -> Result<DrainReport, EngineError> {
        if self.shared.current.get().is_some() {
            return Err(EngineError::Reentrant("drain"));
        }

        let mut report = DrainReport::default();
        let mut rejections = RejectionTable::new();
        loop {
            while let Some(job) = self.shared.job_queue.dequeue() {
                report.jobs_run += 1;
                self.dispatch(job, &mut rejections, &mut report)?;
                self.run_engine_jobs(&mut report);
            }
            self.run_engine_jobs(&mut report);
            if self.shared.job_queue.is_empty() {
                break;
            }
        }

        report.errors.extend(self.shared.take_uncaught());
        self.report_unhandled(rejections.finalize(), &mut report);
        if !report.is_clean() {
            tracing::debug!(
                "Drain finished with {} error(s) and {} unhandled rejection(s)",
                report.errors.len(),
                report.unhandled_rejections.len()
            );
        }
        Ok(report)
    }

    fn dispatch(
        &self,
        job: Job,
        rejections: &mut RejectionTable,
        report: &mut DrainReport,
    ) -> Result<(), EngineError> {
        let kind = job.kind();
        let realm_id = job.realm();
        let Some(realm) = self.shared.realm(realm_id) else {
            tracing::warn!("Discarding {} job for dropped {}", kind, realm_id);
            return Ok(());
        };

        let outcome = realm
            .context
            .with(|ctx| reenter(ctx, &realm, &self.shared, |api| run_job(api, job, rejections)));
        match outcome {
            Ok(()) => Ok(()),
            Err(RuntimeError::Script(error)) => {
                tracing::debug!("Uncaught error in {} job: {}", kind, error);
                report.errors.push(error);
                Ok(())
            }
            Err(RuntimeError::Contract(violation)) => {
                tracing::error!("Contract violation in {} job: {}", kind, violation);
                report.errors.push(violation.into());
                Ok(())
            }
            Err(RuntimeError::Engine(error)) => {
                tracing::error!("Engine failure in {} job: {}", kind, error);
                Err(error)
            }
        }
    }

    fn run_engine_jobs(&self, report: &mut DrainReport) {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => report.engine_jobs_run += 1,
                Ok(false) => break,
                Err(exception) => {
                    let error = exception
                        .0
                        .with(|ctx| ScriptError::from_value(&ctx, ctx.catch()));
                    tracing::debug!("Uncaught error in engine job: {}", error);
                    report.errors.push(error);
                }
            }
        }
    }

    fn report_unhandled(&self, rejections: Vec<UnhandledRejection>, report: &mut DrainReport) {
        for rejection in rejections {
            let Some(realm) = self.shared.realm(rejection.realm) else {
                continue;
            };
            let error = realm.context.with(|ctx| {
                reenter(ctx, &realm, &self.shared, |api| {
                    api.value(&rejection.reason)
                        .map(|reason| ScriptError::from_value(api.ctx(), reason))
                })
            });
            match error {
                Ok(error) => {
                    tracing::warn!("Unhandled promise rejection: {}", error);
                    report.unhandled_rejections.push(error);
                }
                Err(error) => tracing::error!("Failed to read rejection reason: {}", error),
            }
        }
    }

    /// Tear down the engine. Fails, handing the engine back, while realms are alive.
    pub fn close(self) -> Result<(), (Self, EngineError)> {
        let live = self.live_realms();
        if live > 0 {
            return Err((self, EngineError::RealmsAlive(live)));
        }
        drop(self);
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let dropped = self.shared.job_queue.clear();
        if dropped > 0 {
            tracing::debug!("Dropped {} pending job(s)", dropped);
        }
        let live = self.shared.live_realms();
        if live > 0 {
            tracing::error!("Engine dropped with {} live realm(s)", live);
        }
        self.runtime.set_host_promise_rejection_tracker(None);
        tracing::info!("Destroyed JavaScript engine");
    }
}

fn run_job(api: &RealmApi<'_, '_>, job: Job, rejections: &mut RejectionTable) -> Result<(), RuntimeError> {
    match job {
        Job::Call { target, args, .. } => {
            let target = api.value(&target)?;
            let mut values = Vec::with_capacity(args.len().max(1));
            for arg in &args {
                values.push(api.value(arg)?);
            }
            if values.is_empty() {
                values.push(api.undefined());
            }
            api.call_function(&target, values).map(drop)
        }
        Job::ParseModule { module, .. } => api.parse_module(module),
        Job::EvaluateModule { module, error, .. } => api.evaluate_module(module, error),
        Job::AddUnhandledRejection {
            realm,
            promise,
            reason,
        } => {
            rejections.add(api.ctx(), realm, promise, reason);
            Ok(())
        }
        Job::RemoveUnhandledRejection { realm, promise } => {
            rejections.remove(api.ctx(), realm, &promise);
            Ok(())
        }
    }
}
