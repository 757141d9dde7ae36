//! Realms
//!
//! A realm is one isolated global context of an [`Engine`](crate::Engine),
//! with its own module registry and script bookkeeping. All work inside a
//! realm goes through a [`RealmApi`], which only exists while the realm is
//! entered.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::{Rc, Weak};

use rquickjs::function::Args;
use rquickjs::{Context, Ctx, Function, IntoJs, Object, Value};
use url::Url;

use crate::engine::EngineShared;
use crate::error::{EngineError, RuntimeError, ScriptError};
use crate::handle::Handle;
use crate::imports;
use crate::job::Job;
use crate::module::{Importer, ModuleId, ModuleInfo, import_callee};
use crate::specifier;

/// Global property stamped on every realm so native callbacks can find it
pub(crate) const REALM_ID_KEY: &str = "__loom_realm__";

/// Global holding the hooks `import(...)` calls are rewritten to
pub(crate) const DYNAMIC_IMPORT_KEY: &str = "__loom_import__";

const HELPERS_JS: &str = r#"({
    import: (specifier) => import(specifier),
    deferred() {
        let resolve, reject;
        const promise = new Promise((onResolve, onReject) => {
            resolve = onResolve;
            reject = onReject;
        });
        return { promise, resolve, reject };
    },
})"#;

const ERROR_CONSTRUCTORS: &[&str] = &[
    "Error",
    "TypeError",
    "RangeError",
    "SyntaxError",
    "ReferenceError",
    "EvalError",
    "URIError",
    "InternalError",
];

/// Realm identity, unique per engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RealmId(pub u32);

impl fmt::Display for RealmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "realm#{}", self.0)
    }
}

/// Identity of an evaluated script or module source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptId(pub u32);

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "script#{}", self.0)
    }
}

/// Per-realm bookkeeping
#[derive(Default)]
pub(crate) struct RealmInfo {
    pub(crate) next_script_id: u32,
    pub(crate) module_load_callback: Option<Handle>,
    pub(crate) module_map: HashMap<String, ModuleId>,
    pub(crate) modules: Vec<ModuleInfo>,
    pub(crate) script_urls: BTreeMap<ScriptId, Url>,
    pub(crate) script_stack: Vec<ScriptId>,
}

impl RealmInfo {
    pub(crate) fn module(&self, id: ModuleId) -> Option<&ModuleInfo> {
        self.modules.get(id.0 as usize)
    }

    pub(crate) fn module_mut(&mut self, id: ModuleId) -> Option<&mut ModuleInfo> {
        self.modules.get_mut(id.0 as usize)
    }

    /// Base URL for a specifier coming from script code: the innermost
    /// running script, else the most recently evaluated one.
    pub(crate) fn script_base(&self) -> Option<Url> {
        self.script_stack
            .iter()
            .rev()
            .find_map(|id| self.script_urls.get(id))
            .or_else(|| self.script_urls.values().next_back())
            .cloned()
    }
}

pub(crate) struct RealmShared {
    pub(crate) id: RealmId,
    pub(crate) info: RefCell<RealmInfo>,
    pub(crate) helpers: Handle,
    pub(crate) engine: Weak<EngineShared>,
    pub(crate) context: Context,
}

impl RealmShared {
    pub(crate) fn new(
        id: RealmId,
        context: Context,
        engine: &Rc<EngineShared>,
    ) -> Result<Self, EngineError> {
        let helpers = context.with(|ctx| -> rquickjs::Result<Handle> {
            ctx.eval::<(), _>(format!(
                "Object.defineProperty(globalThis, '{REALM_ID_KEY}', {{ value: {} }});",
                id.0
            ))?;
            let helpers: Value = ctx.eval(HELPERS_JS)?;
            Ok(Handle::new(&engine.ledger, &ctx, helpers))
        })?;

        Ok(Self {
            id,
            info: RefCell::new(RealmInfo::default()),
            helpers,
            engine: Rc::downgrade(engine),
            context,
        })
    }
}

impl Drop for RealmShared {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.unregister_realm(self.id);
        }
        tracing::debug!("Destroyed {}", self.id);
    }
}

/// Read the realm id stamped on the context's global object
pub(crate) fn realm_id_of(ctx: &Ctx<'_>) -> Option<RealmId> {
    ctx.globals()
        .get::<_, Option<u32>>(REALM_ID_KEY)
        .ok()
        .flatten()
        .map(RealmId)
}

/// Build an `Error` object (or subclass when `name` is a builtin error) with an optional `code`
pub(crate) fn build_error<'js>(
    ctx: &Ctx<'js>,
    name: &str,
    message: &str,
    code: Option<&str>,
) -> rquickjs::Result<Value<'js>> {
    let builtin = ERROR_CONSTRUCTORS.contains(&name);
    let constructor: Function = ctx.globals().get(if builtin { name } else { "Error" })?;
    let error: Object = constructor.call((message,))?;
    if !builtin {
        error.set("name", name)?;
    }
    if let Some(code) = code {
        error.set("code", code)?;
    }
    Ok(error.into_value())
}

/// Rewrite `import(...)` calls in a classic script to go through the realm's loader
fn route_dynamic_imports<'s>(script: ScriptId, url: &str, source: &'s str) -> Cow<'s, str> {
    if !source.contains("import") {
        return Cow::Borrowed(source);
    }
    match imports::scan_script(url, source) {
        Ok(offsets) if !offsets.is_empty() => {
            let callee = import_callee(Importer::Script, script.0);
            Cow::Owned(imports::rewrite_dynamic_imports(source, &offsets, &callee))
        }
        Ok(_) => Cow::Borrowed(source),
        Err(error) => {
            tracing::debug!("{}", error);
            Cow::Borrowed(source)
        }
    }
}

/// Marks a realm as current for the guard's lifetime, restoring the previous one on drop
struct EnterGuard<'a> {
    engine: &'a EngineShared,
    previous: Option<RealmId>,
}

impl<'a> EnterGuard<'a> {
    fn new(engine: &'a EngineShared, realm: RealmId) -> Self {
        let previous = engine.current.replace(Some(realm));
        Self { engine, previous }
    }
}

impl Drop for EnterGuard<'_> {
    fn drop(&mut self) {
        self.engine.current.set(self.previous);
    }
}

/// Run `f` against a realm whose context `ctx` is already active
pub(crate) fn reenter<'js, R>(
    ctx: Ctx<'js>,
    realm: &Rc<RealmShared>,
    engine: &Rc<EngineShared>,
    f: impl FnOnce(&RealmApi<'_, 'js>) -> R,
) -> R {
    let _guard = EnterGuard::new(engine, realm.id);
    let api = RealmApi { ctx, realm, engine };
    f(&api)
}

/// An isolated global context owned by the embedder
pub struct Realm {
    pub(crate) inner: Rc<RealmShared>,
}

impl Realm {
    pub fn id(&self) -> RealmId {
        self.inner.id
    }

    /// Enter the realm for the duration of `f`
    ///
    /// The previously current realm is restored on every exit path. Entering
    /// while another realm is entered is refused: use
    /// [`enter_current`](Self::enter_current) from native callbacks.
    pub fn enter<R>(&self, f: impl for<'js> FnOnce(&RealmApi<'_, 'js>) -> R) -> Result<R, EngineError> {
        let engine = self.inner.engine.upgrade().ok_or(EngineError::EngineDropped)?;
        if engine.current.get().is_some() {
            return Err(EngineError::Reentrant("enter"));
        }
        Ok(self
            .inner
            .context
            .with(|ctx| reenter(ctx, &self.inner, &engine, f)))
    }

    /// Bookkeeping-only entry for code already running inside this realm's context
    pub fn enter_current<'js, R>(
        &self,
        ctx: &Ctx<'js>,
        f: impl FnOnce(&RealmApi<'_, 'js>) -> R,
    ) -> Result<R, EngineError> {
        let engine = self.inner.engine.upgrade().ok_or(EngineError::EngineDropped)?;
        if realm_id_of(ctx) != Some(self.inner.id) {
            return Err(EngineError::ForeignContext(self.inner.id));
        }
        Ok(reenter(ctx.clone(), &self.inner, &engine, f))
    }

    pub fn downgrade(&self) -> WeakRealm {
        WeakRealm {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realm").field("id", &self.inner.id).finish()
    }
}

/// Non-owning reference to a realm, for closures and host tables
#[derive(Clone, Default)]
pub struct WeakRealm {
    inner: Weak<RealmShared>,
}

impl WeakRealm {
    pub fn upgrade(&self) -> Option<Realm> {
        self.inner.upgrade().map(|inner| Realm { inner })
    }
}

impl fmt::Debug for WeakRealm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.inner.upgrade().map(|realm| realm.id);
        f.debug_struct("WeakRealm").field("id", &id).finish()
    }
}

/// Capability over an entered realm
pub struct RealmApi<'a, 'js> {
    pub(crate) ctx: Ctx<'js>,
    pub(crate) realm: &'a Rc<RealmShared>,
    pub(crate) engine: &'a Rc<EngineShared>,
}

impl<'a, 'js> RealmApi<'a, 'js> {
    pub fn ctx(&self) -> &Ctx<'js> {
        &self.ctx
    }

    pub fn realm_id(&self) -> RealmId {
        self.realm.id
    }

    pub fn weak_realm(&self) -> WeakRealm {
        WeakRealm {
            inner: Rc::downgrade(self.realm),
        }
    }

    // ========================================================================
    // Errors
    // ========================================================================

    /// Map an engine result, capturing a pending exception as a [`ScriptError`]
    pub fn check<T>(&self, result: rquickjs::Result<T>) -> Result<T, RuntimeError> {
        match result {
            Ok(value) => Ok(value),
            Err(rquickjs::Error::Exception) => Err(RuntimeError::Script(self.take_exception())),
            Err(error) => Err(RuntimeError::Engine(error.into())),
        }
    }

    /// Clear and capture the pending exception
    pub fn take_exception(&self) -> ScriptError {
        let exception = self.ctx.catch();
        ScriptError::from_value(&self.ctx, exception)
    }

    /// `Error` object with `message` and, when given, a `code` property
    pub fn create_error(&self, message: &str, code: Option<&str>) -> Result<Value<'js>, RuntimeError> {
        self.check(build_error(&self.ctx, "Error", message, code))
    }

    /// Rebuild a captured error as a script value
    pub fn error_value(&self, error: &ScriptError) -> Result<Value<'js>, RuntimeError> {
        let value = build_error(&self.ctx, &error.name, &error.message, error.code.as_deref());
        self.check(value)
    }

    // ========================================================================
    // Values
    // ========================================================================

    pub fn retain(&self, value: Value<'js>) -> Handle {
        Handle::new(&self.engine.ledger, &self.ctx, value)
    }

    pub fn value(&self, handle: &Handle) -> Result<Value<'js>, RuntimeError> {
        self.check(handle.value(&self.ctx))
    }

    pub fn undefined(&self) -> Value<'js> {
        Value::new_undefined(self.ctx.clone())
    }

    pub fn null(&self) -> Value<'js> {
        Value::new_null(self.ctx.clone())
    }

    pub fn global_object(&self) -> Object<'js> {
        self.ctx.globals()
    }

    pub fn create_object(&self) -> Result<Object<'js>, RuntimeError> {
        self.check(Object::new(self.ctx.clone()))
    }

    pub fn create_string(&self, text: &str) -> Result<Value<'js>, RuntimeError> {
        self.check(text.into_js(&self.ctx))
    }

    pub fn get_property(&self, object: &Object<'js>, key: &str) -> Result<Value<'js>, RuntimeError> {
        self.check(object.get(key))
    }

    pub fn set_property(&self, object: &Object<'js>, key: &str, value: Value<'js>) -> Result<(), RuntimeError> {
        self.check(object.set(key, value))
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Evaluate a classic script. `url` becomes the base for dynamic imports it makes.
    pub fn eval(&self, source: &str, url: &str) -> Result<Value<'js>, RuntimeError> {
        self.eval_script(source, url).map(|(_, value)| value)
    }

    /// Like [`eval`](Self::eval), also returning the id assigned to the script
    pub fn eval_script(&self, source: &str, url: &str) -> Result<(ScriptId, Value<'js>), RuntimeError> {
        let script = self.next_script_id();
        {
            let mut info = self.realm.info.borrow_mut();
            if let Some(base) = specifier::parse_base(url) {
                info.script_urls.insert(script, base);
            }
            info.script_stack.push(script);
        }
        tracing::debug!("Evaluating {} ({})", script, url);

        let source = route_dynamic_imports(script, url, source);
        let result = self.ctx.eval::<Value, _>(&*source);
        self.realm.info.borrow_mut().script_stack.pop();
        self.check(result).map(|value| (script, value))
    }

    /// Call `function` synchronously with `args`
    pub fn call_function(&self, function: &Value<'js>, args: Vec<Value<'js>>) -> Result<Value<'js>, RuntimeError> {
        let Some(function) = function.as_function() else {
            return Err(ScriptError::new("TypeError", "value is not a function").into());
        };
        let mut call_args = Args::new(self.ctx.clone(), args.len());
        for arg in args {
            self.check(call_args.push_arg(arg))?;
        }
        self.check(function.call_arg(call_args))
    }

    /// Defer a call to `target` onto the job queue
    pub fn enqueue_call(&self, target: Value<'js>, args: Vec<Value<'js>>) {
        let args = args.into_iter().map(|arg| self.retain(arg)).collect();
        let target = self.retain(target);
        self.enqueue_call_handle(target, args);
    }

    /// Defer a call to an already retained target
    pub fn enqueue_call_handle(&self, target: Handle, args: Vec<Handle>) {
        self.engine.job_queue.enqueue(Job::Call {
            realm: self.realm.id,
            target,
            args,
        });
    }

    pub fn next_script_id(&self) -> ScriptId {
        let mut info = self.realm.info.borrow_mut();
        let id = ScriptId(info.next_script_id);
        info.next_script_id += 1;
        id
    }

    pub fn script_url(&self, script: ScriptId) -> Option<Url> {
        self.realm.info.borrow().script_urls.get(&script).cloned()
    }

    /// Base URL dynamic imports from script code resolve against
    pub fn script_base(&self) -> Option<Url> {
        self.realm.info.borrow().script_base()
    }

    pub(crate) fn helper(&self, name: &str) -> Result<Function<'js>, RuntimeError> {
        let helpers = self.value(&self.realm.helpers)?;
        let helpers = helpers
            .into_object()
            .ok_or_else(|| EngineError::Js("realm helpers are not an object".to_string()))?;
        self.check(helpers.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_with_scripts(urls: &[(u32, &str)], stack: &[u32]) -> RealmInfo {
        let mut info = RealmInfo::default();
        for (id, url) in urls {
            info.script_urls.insert(ScriptId(*id), Url::parse(url).unwrap());
        }
        info.script_stack = stack.iter().copied().map(ScriptId).collect();
        info
    }

    #[test]
    fn test_script_base_prefers_running_script() {
        let info = info_with_scripts(&[(0, "file:///a.js"), (1, "file:///b.js")], &[0]);
        assert_eq!(info.script_base().unwrap().as_str(), "file:///a.js");
    }

    #[test]
    fn test_script_base_falls_back_to_latest() {
        let info = info_with_scripts(&[(0, "file:///a.js"), (3, "file:///c.js")], &[]);
        assert_eq!(info.script_base().unwrap().as_str(), "file:///c.js");
    }

    #[test]
    fn test_script_base_skips_unnamed_scripts() {
        let info = info_with_scripts(&[(0, "file:///a.js")], &[0, 1]);
        assert_eq!(info.script_base().unwrap().as_str(), "file:///a.js");
        assert!(RealmInfo::default().script_base().is_none());
    }

    #[test]
    fn test_realm_id_display() {
        assert_eq!(RealmId(3).to_string(), "realm#3");
        assert_eq!(ScriptId(9).to_string(), "script#9");
    }
}
