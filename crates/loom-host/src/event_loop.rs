//! Event Loop
//!
//! Alternates between draining the engine's job queue and waiting for native
//! completions. Completions are turned into `call` jobs for the script
//! callbacks waiting on them; the loop ends once no operation or timer is
//! pending and the queue is empty.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use loom_js::rquickjs::{IntoJs, Value};
use loom_js::{DrainReport, Engine, EngineError, Handle, HostError, Realm, RealmApi, RuntimeError, WeakRealm};
use smol::channel::{Receiver, Sender};
use smol::fs::ReadDir;
use smol::{LocalExecutor, Task};

use crate::ops::{self, Completion, OpId, OpValue};
use crate::output::Output;
use crate::report;

/// A script callback waiting for an operation
struct PendingOp {
    realm: WeakRealm,
    callback: Handle,
}

struct TimerEntry {
    realm: WeakRealm,
    callback: Handle,
    repeating: bool,
    _task: Task<()>,
}

/// Open directory stream. `None` while a read owns it.
type DirectorySlot = Option<ReadDir>;

/// Host tables shared with the `sys` bindings
pub(crate) struct HostState {
    executor: LocalExecutor<'static>,
    sender: Sender<Completion>,
    receiver: Receiver<Completion>,
    next_id: Cell<u32>,
    ops: RefCell<HashMap<OpId, PendingOp>>,
    timers: RefCell<HashMap<u32, TimerEntry>>,
    directories: RefCell<HashMap<u32, DirectorySlot>>,
    pub(crate) output: Output,
    pub(crate) args: Vec<String>,
}

impl HostState {
    pub(crate) fn new(output: Output, args: Vec<String>) -> Self {
        let (sender, receiver) = smol::channel::unbounded();
        Self {
            executor: LocalExecutor::new(),
            sender,
            receiver,
            next_id: Cell::new(1),
            ops: RefCell::new(HashMap::new()),
            timers: RefCell::new(HashMap::new()),
            directories: RefCell::new(HashMap::new()),
            output,
            args,
        }
    }

    fn next_id(&self) -> u32 {
        let id = self.next_id.get();
        self.next_id.set(id.wrapping_add(1).max(1));
        id
    }

    /// Run `operation` and deliver its result to `callback`
    pub(crate) fn start_op<F>(&self, realm: WeakRealm, callback: Handle, operation: F) -> OpId
    where
        F: Future<Output = Result<OpValue, HostError>> + 'static,
    {
        let id = self.next_id();
        self.ops.borrow_mut().insert(id, PendingOp { realm, callback });
        let sender = self.sender.clone();
        self.executor
            .spawn(async move {
                let result = operation.await;
                let _ = sender.send(Completion::Op { id, result }).await;
            })
            .detach();
        tracing::trace!("Started operation {}", id);
        id
    }

    /// Read up to `count` entries of an open directory
    ///
    /// Fails when the directory is unknown, closed or already being read.
    pub(crate) fn start_directory_read(
        &self,
        realm: WeakRealm,
        callback: Handle,
        directory: u32,
        count: usize,
    ) -> Result<OpId, &'static str> {
        let stream = {
            let mut directories = self.directories.borrow_mut();
            let slot = directories.get_mut(&directory).ok_or("directory is not open")?;
            slot.take().ok_or("directory already has a read in progress")?
        };
        let id = self.next_id();
        self.ops.borrow_mut().insert(id, PendingOp { realm, callback });
        let sender = self.sender.clone();
        self.executor
            .spawn(async move {
                let completion = ops::read_directory(id, directory, stream, count).await;
                let _ = sender.send(completion).await;
            })
            .detach();
        Ok(id)
    }

    fn add_directory(&self, stream: ReadDir) -> u32 {
        let id = self.next_id();
        self.directories.borrow_mut().insert(id, Some(stream));
        id
    }

    /// Forget an open directory. A read in flight drops the stream when it returns.
    pub(crate) fn close_directory(&self, directory: u32) -> bool {
        self.directories.borrow_mut().remove(&directory).is_some()
    }

    pub(crate) fn start_timer(&self, realm: WeakRealm, callback: Handle, delay: Duration, interval: Option<Duration>) -> u32 {
        let timer = self.next_id();
        let task = self
            .executor
            .spawn(ops::run_timer(timer, delay, interval, self.sender.clone()));
        self.timers.borrow_mut().insert(
            timer,
            TimerEntry {
                realm,
                callback,
                repeating: interval.is_some(),
                _task: task,
            },
        );
        tracing::trace!("Started timer {} ({:?}, repeat {:?})", timer, delay, interval);
        timer
    }

    /// Cancel a timer. Unknown ids are ignored.
    pub(crate) fn stop_timer(&self, timer: u32) {
        let entry = self.timers.borrow_mut().remove(&timer);
        if entry.is_some() {
            tracing::trace!("Stopped timer {}", timer);
        }
    }

    /// Operations and timers that will still produce callbacks
    pub(crate) fn pending(&self) -> usize {
        self.ops.borrow().len() + self.timers.borrow().len()
    }

    /// Drop every retained callback and cancel outstanding timers
    fn clear(&self) {
        let ops = std::mem::take(&mut *self.ops.borrow_mut());
        let timers = std::mem::take(&mut *self.timers.borrow_mut());
        self.directories.borrow_mut().clear();
        if !ops.is_empty() || !timers.is_empty() {
            tracing::debug!("Abandoned {} operation(s) and {} timer(s)", ops.len(), timers.len());
        }
    }
}

/// Drives one realm's scripts until no work remains
pub(crate) struct EventLoop {
    state: Rc<HostState>,
    realm: Realm,
    engine: Engine,
    keep_alive_on_error: bool,
}

impl EventLoop {
    pub(crate) fn new(engine: Engine, output: Output, args: Vec<String>) -> Result<Self, EngineError> {
        let realm = engine.create_realm()?;
        Ok(Self {
            state: Rc::new(HostState::new(output, args)),
            realm,
            engine,
            keep_alive_on_error: false,
        })
    }

    pub(crate) fn keep_alive_on_error(mut self, keep_alive: bool) -> Self {
        self.keep_alive_on_error = keep_alive;
        self
    }

    pub(crate) fn state(&self) -> &Rc<HostState> {
        &self.state
    }

    pub(crate) fn realm(&self) -> &Realm {
        &self.realm
    }

    /// Run until quiescent, or until the first uncaught error unless kept alive
    pub(crate) fn run(&self) -> Result<DrainReport, EngineError> {
        let mut total = DrainReport::default();
        loop {
            let drained = self.engine.flush_job_queue()?;
            let failed = !drained.is_clean();
            if failed {
                report::print_drain(&self.state.output, &drained);
            }
            total.merge(drained);

            if failed && !self.keep_alive_on_error {
                tracing::info!("Stopping after uncaught error");
                break;
            }
            if self.state.pending() == 0 {
                break;
            }

            let state = &self.state;
            match smol::block_on(state.executor.run(state.receiver.recv())) {
                Ok(completion) => self.deliver(completion),
                Err(_) => break,
            }
        }
        Ok(total)
    }

    fn deliver(&self, completion: Completion) {
        match completion {
            Completion::Op { id, result } => {
                let op = self.state.ops.borrow_mut().remove(&id);
                if let Some(op) = op {
                    self.dispatch(op, result);
                }
            }
            Completion::DirectoryRead {
                id,
                directory,
                stream,
                result,
            } => {
                if let Some(slot) = self.state.directories.borrow_mut().get_mut(&directory) {
                    *slot = Some(stream);
                }
                let op = self.state.ops.borrow_mut().remove(&id);
                if let Some(op) = op {
                    self.dispatch(op, result.map(OpValue::Entries));
                }
            }
            Completion::Timer { timer } => self.fire_timer(timer),
        }
    }

    fn fire_timer(&self, timer: u32) {
        let fired = {
            let mut timers = self.state.timers.borrow_mut();
            match timers.get(&timer) {
                Some(entry) if entry.repeating => Some((entry.realm.clone(), entry.callback.duplicate())),
                Some(_) => timers.remove(&timer).map(|entry| (entry.realm, entry.callback)),
                None => None,
            }
        };
        let Some((realm, callback)) = fired else {
            tracing::trace!("Timer {} fired after being stopped", timer);
            return;
        };
        let Some(realm) = realm.upgrade() else {
            return;
        };
        if let Err(error) = realm.enter(|api| api.enqueue_call_handle(callback, Vec::new())) {
            tracing::error!("Failed to deliver timer {}: {}", timer, error);
        }
    }

    fn dispatch(&self, op: PendingOp, result: Result<OpValue, HostError>) {
        let Some(realm) = op.realm.upgrade() else {
            tracing::debug!("Dropped completion for a destroyed realm");
            return;
        };
        let state = &self.state;
        let callback = op.callback;
        let delivered = realm.enter(|api| -> Result<(), RuntimeError> {
            let args = match result {
                Ok(value) => vec![api.retain(api.null()), api.retain(completion_value(api, state, value)?)],
                Err(error) => vec![api.retain(api.create_error(&error.message, Some(&error.code))?)],
            };
            api.enqueue_call_handle(callback, args);
            Ok(())
        });
        match delivered {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::error!("Failed to deliver completion: {}", error),
            Err(error) => tracing::error!("Failed to enter realm for completion: {}", error),
        }
    }

    /// Release host state, the realm and the engine, in that order
    pub(crate) fn close(self) -> Result<(), EngineError> {
        let EventLoop { state, realm, engine, .. } = self;
        state.clear();
        drop(state);
        drop(realm);
        engine.close().map_err(|(_, error)| error)
    }
}

fn completion_value<'js>(api: &RealmApi<'_, 'js>, state: &HostState, value: OpValue) -> Result<Value<'js>, RuntimeError> {
    let ctx = api.ctx();
    let value = match value {
        OpValue::Unit => return Ok(api.undefined()),
        OpValue::Text(text) => text.into_js(ctx),
        OpValue::Directory(stream) => state.add_directory(stream).into_js(ctx),
        OpValue::Entries(names) => names.into_js(ctx),
        OpValue::Exit(Some(code)) => code.into_js(ctx),
        OpValue::Exit(None) => return Ok(api.null()),
    };
    api.check(value)
}
