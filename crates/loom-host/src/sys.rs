//! Script Bindings
//!
//! Builds the `sys` object handed to the bootstrap script. Synchronous
//! functions return or throw directly; asynchronous ones take a callback
//! that is later invoked as `callback(null, result)` or `callback(error)`.

use std::path::Path;
use std::rc::{Rc, Weak};
use std::time::Duration;

use loom_js::rquickjs::function::{IntoJsFunc, Opt, Rest};
use loom_js::rquickjs::{self, Coerced, Ctx, FromJs, Function, IntoJs, Object, Value};
use loom_js::{EngineError, HostError, RealmApi, RuntimeError, ScriptError, Url, WeakRealm, specifier};

use crate::event_loop::HostState;
use crate::ops;

fn script_error(ctx: &Ctx<'_>, name: &str, message: impl Into<String>, code: &str) -> rquickjs::Error {
    RuntimeError::from(ScriptError::new(name, message).with_code(code)).throw(ctx)
}

fn host_error(ctx: &Ctx<'_>, error: HostError) -> rquickjs::Error {
    script_error(ctx, "Error", error.message, &error.code)
}

fn upgrade(state: &Weak<HostState>, ctx: &Ctx<'_>) -> rquickjs::Result<Rc<HostState>> {
    state
        .upgrade()
        .ok_or_else(|| RuntimeError::from(EngineError::EngineDropped).throw(ctx))
}

/// Run `f` with the API of the realm the binding belongs to
fn with_api<'js, R>(
    realm: &WeakRealm,
    ctx: &Ctx<'js>,
    f: impl FnOnce(&RealmApi<'_, 'js>) -> Result<R, RuntimeError>,
) -> rquickjs::Result<R> {
    let realm = realm
        .upgrade()
        .ok_or_else(|| RuntimeError::from(EngineError::EngineDropped).throw(ctx))?;
    match realm.enter_current(ctx, f) {
        Ok(result) => result.map_err(|error| error.throw(ctx)),
        Err(error) => Err(RuntimeError::from(error).throw(ctx)),
    }
}

fn define<'js, F, P>(api: &RealmApi<'_, 'js>, object: &Object<'js>, name: &str, f: F) -> Result<(), RuntimeError>
where
    F: IntoJsFunc<'js, P> + 'js,
{
    let function = api.check(Function::new(api.ctx().clone(), f))?;
    api.set_property(object, name, function.into_value())
}

fn base_url(ctx: &Ctx<'_>, base: &str) -> rquickjs::Result<Url> {
    specifier::parse_base(base).ok_or_else(|| script_error(ctx, "TypeError", format!("Invalid base URL '{base}'"), "ERR_INVALID_URL"))
}

fn millis(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value / 1000.0)
    } else {
        Duration::ZERO
    }
}

/// Create the `sys` object for the entered realm
pub(crate) fn create<'js>(api: &RealmApi<'_, 'js>, state: &Rc<HostState>) -> Result<Object<'js>, RuntimeError> {
    let sys = api.create_object()?;
    let args = api.check(state.args.clone().into_js(api.ctx()))?;
    api.set_property(&sys, "args", args)?;
    api.set_property(&sys, "global", api.global_object().into_value())?;

    define_output(api, &sys, state)?;
    define_paths(api, &sys)?;
    define_files(api, &sys, state)?;
    define_directories(api, &sys, state)?;
    define_timers(api, &sys, state)?;
    define_processes(api, &sys, state)?;
    define_modules(api, &sys)?;
    Ok(sys)
}

fn define_output<'js>(api: &RealmApi<'_, 'js>, sys: &Object<'js>, state: &Rc<HostState>) -> Result<(), RuntimeError> {
    for (name, to_stderr) in [("stdout", false), ("stderr", true)] {
        let output = state.output.clone();
        define(api, sys, name, move |ctx: Ctx<'js>, values: Rest<Value<'js>>| -> rquickjs::Result<()> {
            let mut text = String::new();
            for value in values.0 {
                text.push_str(&Coerced::<String>::from_js(&ctx, value)?.0);
            }
            if to_stderr {
                output.write_stderr(text.as_bytes());
            } else {
                output.write_stdout(text.as_bytes());
            }
            Ok(())
        })?;
    }
    Ok(())
}

fn define_paths<'js>(api: &RealmApi<'_, 'js>, sys: &Object<'js>) -> Result<(), RuntimeError> {
    define(api, sys, "cwd", move |ctx: Ctx<'js>| -> rquickjs::Result<String> {
        let dir = std::env::current_dir().map_err(|e| host_error(&ctx, e.into()))?;
        Url::from_directory_path(&dir)
            .map(String::from)
            .map_err(|()| script_error(&ctx, "Error", format!("Cannot express {} as a URL", dir.display()), "EINVAL"))
    })?;

    define(
        api,
        sys,
        "resolveFilePath",
        move |ctx: Ctx<'js>, path: Coerced<String>, base: Opt<Coerced<String>>| -> rquickjs::Result<String> {
            let path = path.0;
            if Path::new(&path).is_absolute() {
                return Url::from_file_path(&path)
                    .map(String::from)
                    .map_err(|()| script_error(&ctx, "TypeError", format!("Invalid file path '{path}'"), "ERR_INVALID_URL"));
            }
            let Some(base) = base.0 else {
                return Err(script_error(
                    &ctx,
                    "TypeError",
                    format!("Relative path '{path}' needs a base URL"),
                    "ERR_INVALID_URL",
                ));
            };
            let base = base_url(&ctx, &base.0)?;
            base.join(&path)
                .map(String::from)
                .map_err(|e| script_error(&ctx, "TypeError", format!("Cannot resolve '{path}': {e}"), "ERR_INVALID_URL"))
        },
    )?;

    define(
        api,
        sys,
        "resolveURL",
        move |ctx: Ctx<'js>, spec: Coerced<String>, base: Opt<Coerced<String>>| -> rquickjs::Result<String> {
            let base = match base.0 {
                Some(base) => Some(base_url(&ctx, &base.0)?),
                None => None,
            };
            specifier::resolve(&spec.0, base.as_ref())
                .map(String::from)
                .map_err(|e| script_error(&ctx, "TypeError", format!("Cannot resolve '{}': {e}", spec.0), "ERR_INVALID_URL"))
        },
    )?;
    Ok(())
}

fn define_files<'js>(api: &RealmApi<'_, 'js>, sys: &Object<'js>, state: &Rc<HostState>) -> Result<(), RuntimeError> {
    define(api, sys, "readTextFileSync", move |ctx: Ctx<'js>, url: Coerced<String>| -> rquickjs::Result<String> {
        ops::read_text_file_sync(&url.0).map_err(|e| host_error(&ctx, e))
    })?;

    let host = Rc::downgrade(state);
    let realm = api.weak_realm();
    define(
        api,
        sys,
        "readTextFile",
        move |ctx: Ctx<'js>, url: Coerced<String>, callback: Function<'js>| -> rquickjs::Result<()> {
            let state = upgrade(&host, &ctx)?;
            with_api(&realm, &ctx, |api| {
                let callback = api.retain(callback.into_value());
                state.start_op(api.weak_realm(), callback, ops::read_text_file(url.0));
                Ok(())
            })
        },
    )?;
    Ok(())
}

fn define_directories<'js>(api: &RealmApi<'_, 'js>, sys: &Object<'js>, state: &Rc<HostState>) -> Result<(), RuntimeError> {
    let host = Rc::downgrade(state);
    let realm = api.weak_realm();
    define(
        api,
        sys,
        "openDirectory",
        move |ctx: Ctx<'js>, url: Coerced<String>, callback: Function<'js>| -> rquickjs::Result<()> {
            let state = upgrade(&host, &ctx)?;
            with_api(&realm, &ctx, |api| {
                let callback = api.retain(callback.into_value());
                state.start_op(api.weak_realm(), callback, ops::open_directory(url.0));
                Ok(())
            })
        },
    )?;

    let host = Rc::downgrade(state);
    let realm = api.weak_realm();
    define(
        api,
        sys,
        "readDirectory",
        move |ctx: Ctx<'js>, directory: u32, count: u32, callback: Function<'js>| -> rquickjs::Result<()> {
            let state = upgrade(&host, &ctx)?;
            let started = with_api(&realm, &ctx, |api| {
                let callback = api.retain(callback.into_value());
                Ok(state.start_directory_read(api.weak_realm(), callback, directory, count as usize))
            })?;
            started
                .map(drop)
                .map_err(|message| script_error(&ctx, "TypeError", message, "ERR_INVALID_HANDLE"))
        },
    )?;

    let host = Rc::downgrade(state);
    let realm = api.weak_realm();
    define(
        api,
        sys,
        "closeDirectory",
        move |ctx: Ctx<'js>, directory: u32, callback: Function<'js>| -> rquickjs::Result<()> {
            let state = upgrade(&host, &ctx)?;
            if !state.close_directory(directory) {
                return Err(script_error(&ctx, "TypeError", "directory is not open", "ERR_INVALID_HANDLE"));
            }
            with_api(&realm, &ctx, |api| {
                let callback = api.retain(callback.into_value());
                state.start_op(api.weak_realm(), callback, async { Ok(ops::OpValue::Unit) });
                Ok(())
            })
        },
    )?;
    Ok(())
}

fn define_timers<'js>(api: &RealmApi<'_, 'js>, sys: &Object<'js>, state: &Rc<HostState>) -> Result<(), RuntimeError> {
    let host = Rc::downgrade(state);
    let realm = api.weak_realm();
    define(
        api,
        sys,
        "startTimer",
        move |ctx: Ctx<'js>, delay: f64, repeat: f64, callback: Function<'js>| -> rquickjs::Result<u32> {
            let state = upgrade(&host, &ctx)?;
            let interval = Some(millis(repeat)).filter(|period| !period.is_zero());
            with_api(&realm, &ctx, |api| {
                let callback = api.retain(callback.into_value());
                Ok(state.start_timer(api.weak_realm(), callback, millis(delay), interval))
            })
        },
    )?;

    let host = Rc::downgrade(state);
    define(api, sys, "stopTimer", move |ctx: Ctx<'js>, timer: u32| -> rquickjs::Result<()> {
        upgrade(&host, &ctx)?.stop_timer(timer);
        Ok(())
    })?;
    Ok(())
}

fn define_processes<'js>(api: &RealmApi<'_, 'js>, sys: &Object<'js>, state: &Rc<HostState>) -> Result<(), RuntimeError> {
    let host = Rc::downgrade(state);
    let realm = api.weak_realm();
    define(
        api,
        sys,
        "spawnProcess",
        move |ctx: Ctx<'js>, program: Coerced<String>, args: Vec<Coerced<String>>, callback: Function<'js>| -> rquickjs::Result<Option<u32>> {
            let state = upgrade(&host, &ctx)?;
            let args: Vec<String> = args.into_iter().map(|arg| arg.0).collect();
            with_api(&realm, &ctx, |api| {
                let callback = api.retain(callback.into_value());
                match ops::spawn_process(&program.0, &args) {
                    Ok(child) => {
                        let pid = child.id();
                        state.start_op(api.weak_realm(), callback, ops::wait_process(child));
                        Ok(Some(pid))
                    }
                    Err(error) => {
                        state.start_op(api.weak_realm(), callback, async move { Err(error) });
                        Ok(None)
                    }
                }
            })
        },
    )?;
    Ok(())
}

fn define_modules<'js>(api: &RealmApi<'_, 'js>, sys: &Object<'js>) -> Result<(), RuntimeError> {
    let realm = api.weak_realm();
    define(api, sys, "setModuleLoader", move |ctx: Ctx<'js>, loader: Value<'js>| -> rquickjs::Result<()> {
        with_api(&realm, &ctx, |api| api.set_module_load_callback(loader))
    })?;

    let realm = api.weak_realm();
    define(
        api,
        sys,
        "importModule",
        move |ctx: Ctx<'js>, spec: Coerced<String>, base: Opt<Coerced<String>>| -> rquickjs::Result<Value<'js>> {
            let base = match base.0 {
                Some(base) => Some(base_url(&ctx, &base.0)?),
                None => None,
            };
            with_api(&realm, &ctx, |api| {
                let base = base.or_else(|| api.script_base());
                api.import_module(&spec.0, base.as_ref())
            })
        },
    )?;
    Ok(())
}
