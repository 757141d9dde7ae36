//! Deferred Jobs
//!
//! Every asynchronous stimulus (script calls, promise rejections, module
//! loading steps, native I/O completions) becomes a [`Job`] on the engine's
//! single [`JobQueue`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;

use crate::handle::Handle;
use crate::module::ModuleId;
use crate::realm::RealmId;

/// Job kind, for logging and inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Call,
    ParseModule,
    EvaluateModule,
    AddUnhandledRejection,
    RemoveUnhandledRejection,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobKind::Call => "call",
            JobKind::ParseModule => "parse_module",
            JobKind::EvaluateModule => "evaluate_module",
            JobKind::AddUnhandledRejection => "add_unhandled_rejection",
            JobKind::RemoveUnhandledRejection => "remove_unhandled_rejection",
        };
        f.write_str(name)
    }
}

/// A deferred unit of work. Owns every handle it carries.
#[derive(Debug)]
pub enum Job {
    /// Invoke `target` with `args`, or with a single `undefined` when empty
    Call {
        realm: RealmId,
        target: Handle,
        args: Vec<Handle>,
    },
    /// Advance a module out of the parsing state
    ParseModule { realm: RealmId, module: ModuleId },
    /// Advance a module out of the initializing state, or propagate `error`
    EvaluateModule {
        realm: RealmId,
        module: ModuleId,
        error: Option<Handle>,
    },
    AddUnhandledRejection {
        realm: RealmId,
        promise: Handle,
        reason: Handle,
    },
    RemoveUnhandledRejection { realm: RealmId, promise: Handle },
}

impl Job {
    /// Realm the job runs in
    pub fn realm(&self) -> RealmId {
        match self {
            Job::Call { realm, .. }
            | Job::ParseModule { realm, .. }
            | Job::EvaluateModule { realm, .. }
            | Job::AddUnhandledRejection { realm, .. }
            | Job::RemoveUnhandledRejection { realm, .. } => *realm,
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Job::Call { .. } => JobKind::Call,
            Job::ParseModule { .. } => JobKind::ParseModule,
            Job::EvaluateModule { .. } => JobKind::EvaluateModule,
            Job::AddUnhandledRejection { .. } => JobKind::AddUnhandledRejection,
            Job::RemoveUnhandledRejection { .. } => JobKind::RemoveUnhandledRejection,
        }
    }
}

/// FIFO queue shared by every realm of an engine
///
/// Jobs may be enqueued while the queue is being drained; they run in the
/// same drain pass, after everything enqueued before them.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: RefCell<VecDeque<Job>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job at the tail
    pub fn enqueue(&self, job: Job) {
        tracing::trace!("Enqueue {} job for realm {}", job.kind(), job.realm());
        self.jobs.borrow_mut().push_back(job);
    }

    /// Remove the job at the head. The queue is not borrowed once this returns.
    pub fn dequeue(&self) -> Option<Job> {
        self.jobs.borrow_mut().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.borrow().is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.borrow().len()
    }

    /// Drop every pending job, releasing its handles
    pub fn clear(&self) -> usize {
        let drained: Vec<Job> = self.jobs.borrow_mut().drain(..).collect();
        drained.len()
    }
}
