//! Module Loading
//!
//! Each canonical URL maps to exactly one module record per realm. A record
//! moves through
//!
//! ```text
//! loading -> parsing -> initializing -> complete
//!    \__________\____________\________-> error
//! ```
//!
//! Loading is delegated to the realm's module load callback, which receives
//! `(url, finisher)` and calls `finisher(error, source)` exactly once. Every
//! other step runs as a job on the engine queue.

use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use rquickjs::function::Opt;
use rquickjs::{Coerced, Ctx, FromJs, Function, Module, Object, Value};
use url::Url;

use crate::error::{ContractViolation, EngineError, RuntimeError, ScriptError};
use crate::handle::Handle;
use crate::imports::{self, ModuleScan};
use crate::job::Job;
use crate::realm::{DYNAMIC_IMPORT_KEY, RealmApi, ScriptId, reenter};
use crate::specifier;

/// Index of a module record within its realm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u32);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

/// Loading state of a module record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleState {
    Loading,
    Parsing,
    Initializing,
    Complete,
    Error,
}

impl ModuleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ModuleState::Complete | ModuleState::Error)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition(self, next: ModuleState) -> bool {
        use ModuleState::*;
        matches!(
            (self, next),
            (Loading, Parsing)
                | (Parsing, Initializing)
                | (Initializing, Complete)
                | (Loading | Parsing | Initializing, Error)
        )
    }

    /// State a record must be in to move to `self`
    fn predecessor(self) -> ModuleState {
        match self {
            ModuleState::Loading | ModuleState::Parsing => ModuleState::Loading,
            ModuleState::Initializing => ModuleState::Parsing,
            ModuleState::Complete | ModuleState::Error => ModuleState::Initializing,
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleState::Loading => "loading",
            ModuleState::Parsing => "parsing",
            ModuleState::Initializing => "initializing",
            ModuleState::Complete => "complete",
            ModuleState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Pending dynamic import of a record
pub(crate) struct Waiter {
    resolve: Handle,
    reject: Handle,
}

/// Host-side record of one module
pub(crate) struct ModuleInfo {
    pub(crate) url: Url,
    pub(crate) state: ModuleState,
    pub(crate) source: Option<Handle>,
    pub(crate) error: Option<Handle>,
    pub(crate) namespace: Option<Handle>,
    pub(crate) requested: Vec<ModuleId>,
    /// Requested by the host or a dynamic import rather than a static import
    pub(crate) root: bool,
    /// An evaluate job has been scheduled
    pub(crate) notified: bool,
    /// The failure has been delivered to waiters or reported
    pub(crate) settled: bool,
    pub(crate) waiters: Vec<Waiter>,
    pub(crate) trace: Vec<ModuleState>,
}

impl ModuleInfo {
    pub(crate) fn new(url: Url) -> Self {
        Self {
            url,
            state: ModuleState::Loading,
            source: None,
            error: None,
            namespace: None,
            requested: Vec::new(),
            root: false,
            notified: false,
            settled: false,
            waiters: Vec::new(),
            trace: vec![ModuleState::Loading],
        }
    }

    fn expect(&self, expected: ModuleState) -> Result<(), ContractViolation> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.violation(expected))
        }
    }

    fn violation(&self, expected: ModuleState) -> ContractViolation {
        ContractViolation::UnexpectedModuleState {
            url: self.url.to_string(),
            expected,
            actual: self.state,
        }
    }

    pub(crate) fn transition(&mut self, next: ModuleState) -> Result<(), ContractViolation> {
        if !self.state.can_transition(next) {
            return Err(self.violation(next.predecessor()));
        }
        tracing::debug!("Module {}: {} -> {}", self.url, self.state, next);
        self.state = next;
        self.trace.push(next);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    Pending,
    Ready,
    /// The record itself or a transitive dependency failed
    Failed(ModuleId),
}

/// Readiness of `id` given its transitive dependencies. Failure wins over pending.
pub(crate) fn readiness(modules: &[ModuleInfo], id: ModuleId) -> Readiness {
    let mut visited = HashSet::new();
    let mut stack = vec![id];
    let mut pending = false;

    while let Some(current) = stack.pop() {
        if !visited.insert(current) {
            continue;
        }
        let Some(info) = modules.get(current.0 as usize) else {
            continue;
        };
        match info.state {
            ModuleState::Error => return Readiness::Failed(current),
            ModuleState::Loading | ModuleState::Parsing => pending = true,
            ModuleState::Initializing | ModuleState::Complete => {}
        }
        stack.extend(info.requested.iter().copied());
    }

    if pending { Readiness::Pending } else { Readiness::Ready }
}

/// Every record, dependencies before their importers
pub(crate) fn post_order(modules: &[ModuleInfo]) -> Vec<ModuleId> {
    let mut visited = vec![false; modules.len()];
    let mut order = Vec::with_capacity(modules.len());

    for start in 0..modules.len() {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        let mut stack = vec![(start, 0usize)];
        while let Some((node, next_child)) = stack.pop() {
            match modules[node].requested.get(next_child) {
                Some(child) => {
                    stack.push((node, next_child + 1));
                    let child = child.0 as usize;
                    if child < modules.len() && !visited[child] {
                        visited[child] = true;
                        stack.push((child, 0));
                    }
                }
                None => order.push(ModuleId(node as u32)),
            }
        }
    }

    order
}

/// Code that issued an `import(...)` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Importer {
    Module,
    Script,
}

impl Importer {
    fn hook_name(self) -> &'static str {
        match self {
            Importer::Module => "module",
            Importer::Script => "script",
        }
    }
}

/// Expression that stands in for the `import` keyword of a rewritten `import(...)` call
pub(crate) fn import_callee(importer: Importer, id: u32) -> String {
    format!(
        "((specifier) => {DYNAMIC_IMPORT_KEY}.{}({id}, specifier))",
        importer.hook_name()
    )
}

impl<'a, 'js> RealmApi<'a, 'js> {
    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn module_state(&self, module: ModuleId) -> Option<ModuleState> {
        self.realm.info.borrow().module(module).map(|info| info.state)
    }

    pub fn module_url(&self, module: ModuleId) -> Option<Url> {
        self.realm.info.borrow().module(module).map(|info| info.url.clone())
    }

    /// Every state the record has been in, oldest first
    pub fn module_trace(&self, module: ModuleId) -> Vec<ModuleState> {
        self.realm
            .info
            .borrow()
            .module(module)
            .map(|info| info.trace.clone())
            .unwrap_or_default()
    }

    /// Records `module` statically imports
    pub fn module_requests(&self, module: ModuleId) -> Vec<ModuleId> {
        self.realm
            .info
            .borrow()
            .module(module)
            .map(|info| info.requested.clone())
            .unwrap_or_default()
    }

    pub fn find_module(&self, url: &str) -> Option<ModuleId> {
        self.realm.info.borrow().module_map.get(url).copied()
    }

    pub fn module_count(&self) -> usize {
        self.realm.info.borrow().modules.len()
    }

    /// Namespace object of a complete module
    pub fn module_namespace(&self, module: ModuleId) -> Option<Value<'js>> {
        let namespace = self
            .realm
            .info
            .borrow()
            .module(module)
            .and_then(|info| info.namespace.as_ref().map(Handle::duplicate))?;
        self.value(&namespace).ok()
    }

    /// Error attached to a failed module
    pub fn module_error(&self, module: ModuleId) -> Option<Value<'js>> {
        let error = self
            .realm
            .info
            .borrow()
            .module(module)
            .and_then(|info| info.error.as_ref().map(Handle::duplicate))?;
        self.value(&error).ok()
    }

    fn with_module<R>(
        &self,
        module: ModuleId,
        f: impl FnOnce(&mut ModuleInfo) -> R,
    ) -> Result<R, ContractViolation> {
        let mut info = self.realm.info.borrow_mut();
        let record = info
            .module_mut(module)
            .ok_or(ContractViolation::UnknownModule(module))?;
        Ok(f(record))
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    /// Register the function that loads module sources
    ///
    /// Called as `callback(url, finisher)`; `finisher(error, source)` must be
    /// called exactly once.
    pub fn set_module_load_callback(&self, callback: Value<'js>) -> Result<(), RuntimeError> {
        if !callback.is_function() {
            return Err(ScriptError::new("TypeError", "module load callback must be a function").into());
        }
        let handle = self.retain(callback);
        let previous = self
            .realm
            .info
            .borrow_mut()
            .module_load_callback
            .replace(handle);
        drop(previous);
        Ok(())
    }

    /// Resolve `specifier` against `base` to its module record, starting a load for new URLs
    ///
    /// The record becomes a root: its failure is reported rather than only
    /// propagated to importers.
    pub fn resolve_module_specifier(
        &self,
        specifier: &str,
        base: Option<&Url>,
    ) -> Result<ModuleId, RuntimeError> {
        let module = self.resolve_dependency(specifier, base)?;
        self.with_module(module, |info| info.root = true)?;
        Ok(module)
    }

    fn resolve_dependency(&self, specifier: &str, base: Option<&Url>) -> Result<ModuleId, RuntimeError> {
        let url = specifier::resolve(specifier, base).map_err(|error| {
            let message = match base {
                Some(base) => format!("Cannot resolve module '{specifier}' from {base}: {error}"),
                None => format!("Cannot resolve module '{specifier}': {error}"),
            };
            ScriptError::new("TypeError", message).with_code("ERR_INVALID_SPECIFIER")
        })?;
        self.resolve_url(url)
    }

    /// Resolve `specifier` as statically imported by `importer`
    pub fn resolve_module(&self, importer: ModuleId, specifier: &str) -> Result<ModuleId, RuntimeError> {
        let base = self
            .module_url(importer)
            .ok_or(ContractViolation::UnknownModule(importer))?;
        self.resolve_dependency(specifier, Some(&base))
    }

    /// Resolve `specifier` as imported by the script `script`
    pub fn resolve_module_from_script(
        &self,
        script: ScriptId,
        specifier: &str,
    ) -> Result<ModuleId, RuntimeError> {
        let base = self
            .script_url(script)
            .ok_or(ContractViolation::UnknownScript(script.0))?;
        self.resolve_module_specifier(specifier, Some(&base))
    }

    fn resolve_url(&self, url: Url) -> Result<ModuleId, RuntimeError> {
        let (existing, loader, next) = {
            let info = self.realm.info.borrow();
            (
                info.module_map.get(url.as_str()).copied(),
                info.module_load_callback.as_ref().map(Handle::duplicate),
                ModuleId(info.modules.len() as u32),
            )
        };
        if let Some(module) = existing {
            return Ok(module);
        }
        let loader = loader.ok_or(ContractViolation::NoModuleLoader)?;

        let url_value = self.create_string(url.as_str())?;
        let finisher = self.module_finisher(next)?;
        {
            let mut info = self.realm.info.borrow_mut();
            info.module_map.insert(url.to_string(), next);
            info.modules.push(ModuleInfo::new(url.clone()));
        }
        tracing::debug!("Loading {} as {}", url, next);

        let args = vec![self.retain(url_value), self.retain(finisher)];
        self.enqueue_call_handle(loader, args);
        Ok(next)
    }

    fn module_finisher(&self, module: ModuleId) -> Result<Value<'js>, RuntimeError> {
        let realm = Rc::downgrade(self.realm);
        let engine = Rc::downgrade(self.engine);
        let finisher = Function::new(
            self.ctx.clone(),
            move |ctx: Ctx<'js>, error: Opt<Value<'js>>, source: Opt<Value<'js>>| -> rquickjs::Result<()> {
                let (Some(realm), Some(engine)) = (realm.upgrade(), engine.upgrade()) else {
                    return Ok(());
                };
                reenter(ctx.clone(), &realm, &engine, |api| {
                    api.set_module_source(module, error.0, source.0)
                })
                .map_err(|error| error.throw(&ctx))
            },
        );
        Ok(self.check(finisher)?.into_value())
    }

    // ========================================================================
    // Loading state machine
    // ========================================================================

    /// Complete the load of a record in the loading state
    ///
    /// A null or undefined `error` stores `source` and schedules parsing; any
    /// other value fails the module.
    pub fn set_module_source(
        &self,
        module: ModuleId,
        error: Option<Value<'js>>,
        source: Option<Value<'js>>,
    ) -> Result<(), RuntimeError> {
        self.with_module(module, |info| info.expect(ModuleState::Loading))??;

        let error = error.filter(|error| !error.is_null() && !error.is_undefined());
        if let Some(error) = error {
            let error = self.retain(error);
            return self.fail_module(module, error);
        }

        let source = match source {
            Some(source) if !source.is_null() && !source.is_undefined() => source,
            _ => self.create_string("")?,
        };
        let source = self.retain(source);
        self.with_module(module, |info| {
            info.source = Some(source);
            info.transition(ModuleState::Parsing)
        })??;
        self.engine.job_queue.enqueue(Job::ParseModule {
            realm: self.realm.id,
            module,
        });
        Ok(())
    }

    /// Parse a record in the parsing state and start loading its dependencies
    pub fn parse_module(&self, module: ModuleId) -> Result<(), RuntimeError> {
        let (url, source) = self.with_module(module, |info| {
            info.expect(ModuleState::Parsing)?;
            Ok::<_, ContractViolation>((info.url.clone(), info.source.take()))
        })??;

        let source = match source {
            Some(source) => self.value(&source)?,
            None => self.create_string("")?,
        };
        let text = self.check(Coerced::<String>::from_js(&self.ctx, source).map(|text| text.0))?;

        let script = self.next_script_id();
        self.realm
            .info
            .borrow_mut()
            .script_urls
            .insert(script, url.clone());
        tracing::debug!("Parsing {} as {}", url, script);

        let scan = imports::scan_module(url.as_str(), &text).unwrap_or_else(|error| {
            // The engine's parser reports the syntax error below
            tracing::debug!("{}", error);
            ModuleScan::default()
        });
        let text = if scan.dynamic_imports.is_empty() {
            text
        } else {
            let callee = import_callee(Importer::Module, module.0);
            imports::rewrite_dynamic_imports(&text, &scan.dynamic_imports, &callee)
        };

        let declared = match Module::declare(self.ctx.clone(), url.as_str(), text.as_str()) {
            Ok(declared) => declared,
            Err(rquickjs::Error::Exception) => {
                let error = self.ctx.catch();
                let error = self.retain(error);
                return self.fail_module(module, error);
            }
            Err(error) => return Err(EngineError::from(error).into()),
        };
        let meta: Object = self.check(declared.meta())?;
        self.check(meta.set("url", url.as_str()))?;

        let mut requested = Vec::with_capacity(scan.requested.len());
        for specifier in scan.requested {
            match self.resolve_module(module, &specifier) {
                Ok(dependency) => requested.push(dependency),
                Err(RuntimeError::Script(error)) => {
                    let error = self.error_value(&error)?;
                    let error = self.retain(error);
                    return self.fail_module(module, error);
                }
                Err(other) => return Err(other),
            }
        }

        self.with_module(module, |info| {
            info.requested = requested;
            info.transition(ModuleState::Initializing)
        })??;
        self.notify_ready_modules();
        Ok(())
    }

    /// Evaluate a record in the initializing state, or propagate a dependency's error
    pub fn evaluate_module(&self, module: ModuleId, error: Option<Handle>) -> Result<(), RuntimeError> {
        if let Some(error) = error {
            let state = self
                .module_state(module)
                .ok_or(ContractViolation::UnknownModule(module))?;
            if state != ModuleState::Error {
                self.with_module(module, |info| info.expect(ModuleState::Initializing))??;
            }
            let error = self.value(&error)?;
            return match self.settle_failure(module, error)? {
                Some(uncaught) => Err(uncaught.into()),
                None => Ok(()),
            };
        }

        let url = self.with_module(module, |info| {
            info.expect(ModuleState::Initializing)?;
            Ok::<_, ContractViolation>(info.url.clone())
        })??;
        tracing::debug!("Evaluating {}", url);

        let import = self.helper("import")?;
        let promise: Object = self.check(import.call((url.as_str(),)))?;
        let then: Function = self.check(promise.get("then"))?;
        let on_fulfilled = self.evaluation_reaction(module, true)?;
        let on_rejected = self.evaluation_reaction(module, false)?;
        self.check(then.call::<_, Value>((
            rquickjs::function::This(promise),
            on_fulfilled,
            on_rejected,
        )))?;
        Ok(())
    }

    fn evaluation_reaction(&self, module: ModuleId, fulfilled: bool) -> Result<Function<'js>, RuntimeError> {
        let realm = Rc::downgrade(self.realm);
        let engine = Rc::downgrade(self.engine);
        let reaction = Function::new(
            self.ctx.clone(),
            move |ctx: Ctx<'js>, value: Opt<Value<'js>>| -> rquickjs::Result<()> {
                let (Some(realm), Some(engine)) = (realm.upgrade(), engine.upgrade()) else {
                    return Ok(());
                };
                let value = value.0.unwrap_or_else(|| Value::new_undefined(ctx.clone()));
                reenter(ctx.clone(), &realm, &engine, |api| {
                    if fulfilled {
                        api.finish_evaluation(module, value)
                    } else {
                        let uncaught = api.settle_failure(module, value)?;
                        if let Some(error) = uncaught {
                            tracing::debug!("Uncaught module error: {}", error);
                            api.engine.report_uncaught(error);
                        }
                        Ok(())
                    }
                })
                .map_err(|error| error.throw(&ctx))
            },
        );
        self.check(reaction)
    }

    fn finish_evaluation(&self, module: ModuleId, namespace: Value<'js>) -> Result<(), RuntimeError> {
        let stored = self.retain(namespace.clone());
        let waiters = self.with_module(module, |info| {
            if info.state == ModuleState::Initializing {
                info.transition(ModuleState::Complete)?;
                info.namespace = Some(stored);
            }
            Ok::<_, ContractViolation>(std::mem::take(&mut info.waiters))
        })??;

        for waiter in waiters {
            let resolve = self.value(&waiter.resolve)?;
            self.call_function(&resolve, vec![namespace.clone()])?;
        }
        Ok(())
    }

    /// Move a record to the error state and attach `error`, then re-check readiness
    fn fail_module(&self, module: ModuleId, error: Handle) -> Result<(), RuntimeError> {
        let outcome = self.with_module(module, |info| {
            info.transition(ModuleState::Error)?;
            Ok::<_, ContractViolation>(info.error.replace(error))
        })??;
        drop(outcome);
        self.notify_ready_modules();
        Ok(())
    }

    /// Put a failed record in the error state and reject its waiters.
    /// Returns the error when nothing else will observe it.
    fn settle_failure(&self, module: ModuleId, error: Value<'js>) -> Result<Option<ScriptError>, RuntimeError> {
        let stored = self.retain(error.clone());
        let (waiters, root) = self.with_module(module, |info| {
            if info.state != ModuleState::Error {
                info.transition(ModuleState::Error)?;
            }
            info.error = Some(stored);
            info.settled = true;
            Ok::<_, ContractViolation>((std::mem::take(&mut info.waiters), info.root))
        })??;

        if waiters.is_empty() {
            return Ok(root.then(|| ScriptError::from_value(&self.ctx, error)));
        }
        for waiter in waiters {
            let reject = self.value(&waiter.reject)?;
            self.call_function(&reject, vec![error.clone()])?;
        }
        Ok(None)
    }

    /// Schedule evaluation of every record whose dependency graph has settled
    pub(crate) fn notify_ready_modules(&self) {
        let order = post_order(&self.realm.info.borrow().modules);
        for module in order {
            let job = {
                let mut info = self.realm.info.borrow_mut();
                let eligible = info.module(module).is_some_and(|record| {
                    !record.notified
                        && matches!(record.state, ModuleState::Initializing | ModuleState::Error)
                });
                if !eligible {
                    continue;
                }
                let error = match readiness(&info.modules, module) {
                    Readiness::Pending => continue,
                    Readiness::Ready => None,
                    Readiness::Failed(source) => info
                        .module(source)
                        .and_then(|record| record.error.as_ref().map(Handle::duplicate)),
                };
                if let Some(record) = info.module_mut(module) {
                    record.notified = true;
                }
                Job::EvaluateModule {
                    realm: self.realm.id,
                    module,
                    error,
                }
            };
            self.engine.job_queue.enqueue(job);
        }
    }

    // ========================================================================
    // Dynamic import
    // ========================================================================

    /// Import `specifier` resolved against `base`, returning a promise of its namespace
    ///
    /// Resolution failures reject the promise.
    pub fn import_module(&self, specifier: &str, base: Option<&Url>) -> Result<Value<'js>, RuntimeError> {
        match self.resolve_dependency(specifier, base) {
            Ok(module) => self.import_record(module),
            Err(RuntimeError::Script(error)) => self.rejected_promise(&error),
            Err(other) => Err(other),
        }
    }

    /// Import `specifier` as requested by the script `script`
    pub fn import_from_script(&self, script: ScriptId, specifier: &str) -> Result<Value<'js>, RuntimeError> {
        let base = self
            .script_url(script)
            .ok_or(ContractViolation::UnknownScript(script.0))?;
        self.import_module(specifier, Some(&base))
    }

    /// Import `specifier` as requested by the module `importer`
    pub fn import_from_module(&self, importer: ModuleId, specifier: &str) -> Result<Value<'js>, RuntimeError> {
        let base = self
            .module_url(importer)
            .ok_or(ContractViolation::UnknownModule(importer))?;
        self.import_module(specifier, Some(&base))
    }

    /// Define the global hooks rewritten `import(...)` calls go through
    pub(crate) fn install_dynamic_import(&self) -> Result<(), RuntimeError> {
        let hooks = self.create_object()?;
        for importer in [Importer::Module, Importer::Script] {
            let hook = self.import_hook(importer)?;
            self.check(hooks.set(importer.hook_name(), hook))?;
        }
        let descriptor = self.create_object()?;
        self.check(descriptor.set("value", hooks))?;
        let object: Object = self.check(self.ctx.globals().get("Object"))?;
        let define: Function = self.check(object.get("defineProperty"))?;
        self.check(define.call::<_, Value>((self.ctx.globals(), DYNAMIC_IMPORT_KEY, descriptor)))?;
        Ok(())
    }

    fn import_hook(&self, importer: Importer) -> Result<Function<'js>, RuntimeError> {
        let realm = Rc::downgrade(self.realm);
        let engine = Rc::downgrade(self.engine);
        let hook = Function::new(
            self.ctx.clone(),
            move |ctx: Ctx<'js>, id: u32, specifier: Coerced<String>| -> rquickjs::Result<Value<'js>> {
                let (Some(realm), Some(engine)) = (realm.upgrade(), engine.upgrade()) else {
                    return Err(RuntimeError::from(EngineError::EngineDropped).throw(&ctx));
                };
                reenter(ctx.clone(), &realm, &engine, |api| {
                    api.import_from(importer, id, &specifier.0)
                })
                .map_err(|error| error.throw(&ctx))
            },
        );
        self.check(hook)
    }

    /// `import(specifier)` issued by a module or script. Only engine failures throw.
    fn import_from(&self, importer: Importer, id: u32, specifier: &str) -> Result<Value<'js>, RuntimeError> {
        let imported = match importer {
            Importer::Module => self.import_from_module(ModuleId(id), specifier),
            Importer::Script if self.script_url(ScriptId(id)).is_some() => {
                self.import_from_script(ScriptId(id), specifier)
            }
            // Scripts evaluated without a URL fall back to the running script's base
            Importer::Script => self.import_module(specifier, self.script_base().as_ref()),
        };
        match imported {
            Err(RuntimeError::Contract(violation)) => self.rejected_promise(&ScriptError::from(violation)),
            other => other,
        }
    }

    fn import_record(&self, module: ModuleId) -> Result<Value<'js>, RuntimeError> {
        let deferred: Object = self.check(self.helper("deferred")?.call(()))?;
        let promise: Value = self.check(deferred.get("promise"))?;
        let resolve: Value = self.check(deferred.get("resolve"))?;
        let reject: Value = self.check(deferred.get("reject"))?;

        let waiter = Waiter {
            resolve: self.retain(resolve.clone()),
            reject: self.retain(reject.clone()),
        };
        let settled = self.with_module(module, |info| {
            info.root = true;
            match info.state {
                ModuleState::Complete => info.namespace.as_ref().map(|ns| (true, ns.duplicate())),
                // Until the evaluate job settles the failure, waiting keeps it from being reported
                ModuleState::Error if info.settled => info.error.as_ref().map(|e| (false, e.duplicate())),
                _ => {
                    info.waiters.push(waiter);
                    None
                }
            }
        })?;

        if let Some((fulfilled, value)) = settled {
            let value = self.value(&value)?;
            let settle = if fulfilled { resolve } else { reject };
            self.call_function(&settle, vec![value])?;
        }
        Ok(promise)
    }

    fn rejected_promise(&self, error: &ScriptError) -> Result<Value<'js>, RuntimeError> {
        let deferred: Object = self.check(self.helper("deferred")?.call(()))?;
        let reject: Value = self.check(deferred.get("reject"))?;
        let error = self.error_value(error)?;
        self.call_function(&reject, vec![error])?;
        self.check(deferred.get("promise"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(state: ModuleState, requested: &[u32]) -> ModuleInfo {
        let mut info = ModuleInfo::new(Url::parse("file:///m.js").unwrap());
        info.state = state;
        info.requested = requested.iter().copied().map(ModuleId).collect();
        info
    }

    #[test]
    fn test_legal_transitions() {
        use ModuleState::*;
        assert!(Loading.can_transition(Parsing));
        assert!(Parsing.can_transition(Initializing));
        assert!(Initializing.can_transition(Complete));
        assert!(Loading.can_transition(Error));
        assert!(Parsing.can_transition(Error));
        assert!(Initializing.can_transition(Error));
    }

    #[test]
    fn test_illegal_transitions() {
        use ModuleState::*;
        assert!(!Loading.can_transition(Initializing));
        assert!(!Parsing.can_transition(Loading));
        assert!(!Complete.can_transition(Error));
        assert!(!Error.can_transition(Loading));
        assert!(!Error.can_transition(Error));
        assert!(Complete.is_terminal() && Error.is_terminal());
        assert!(!Initializing.is_terminal());
    }

    #[test]
    fn test_transition_records_trace() {
        let mut info = ModuleInfo::new(Url::parse("file:///a.js").unwrap());
        info.transition(ModuleState::Parsing).unwrap();
        info.transition(ModuleState::Initializing).unwrap();
        info.transition(ModuleState::Complete).unwrap();
        assert_eq!(
            info.trace,
            vec![
                ModuleState::Loading,
                ModuleState::Parsing,
                ModuleState::Initializing,
                ModuleState::Complete
            ]
        );
    }

    #[test]
    fn test_transition_out_of_order_is_violation() {
        let mut info = ModuleInfo::new(Url::parse("file:///a.js").unwrap());
        let violation = info.transition(ModuleState::Complete).unwrap_err();
        assert_eq!(
            violation,
            ContractViolation::UnexpectedModuleState {
                url: "file:///a.js".into(),
                expected: ModuleState::Initializing,
                actual: ModuleState::Loading,
            }
        );
        assert_eq!(info.state, ModuleState::Loading);
        assert_eq!(info.trace.len(), 1);
    }

    #[test]
    fn test_readiness_waits_for_dependencies() {
        let modules = vec![
            record(ModuleState::Initializing, &[1]),
            record(ModuleState::Loading, &[]),
        ];
        assert_eq!(readiness(&modules, ModuleId(0)), Readiness::Pending);
        assert_eq!(readiness(&modules, ModuleId(1)), Readiness::Pending);
    }

    #[test]
    fn test_readiness_ready_and_cycles() {
        let modules = vec![
            record(ModuleState::Initializing, &[1]),
            record(ModuleState::Initializing, &[0]),
        ];
        assert_eq!(readiness(&modules, ModuleId(0)), Readiness::Ready);
    }

    #[test]
    fn test_readiness_error_wins() {
        let modules = vec![
            record(ModuleState::Initializing, &[1, 2]),
            record(ModuleState::Loading, &[]),
            record(ModuleState::Error, &[]),
        ];
        assert_eq!(readiness(&modules, ModuleId(0)), Readiness::Failed(ModuleId(2)));
    }

    #[test]
    fn test_post_order_dependencies_first() {
        let modules = vec![
            record(ModuleState::Initializing, &[1, 2]),
            record(ModuleState::Initializing, &[2]),
            record(ModuleState::Initializing, &[]),
        ];
        assert_eq!(post_order(&modules), vec![ModuleId(2), ModuleId(1), ModuleId(0)]);
    }

    #[test]
    fn test_post_order_cycle_terminates() {
        let modules = vec![
            record(ModuleState::Initializing, &[1]),
            record(ModuleState::Initializing, &[0]),
        ];
        assert_eq!(post_order(&modules), vec![ModuleId(1), ModuleId(0)]);
    }
}
