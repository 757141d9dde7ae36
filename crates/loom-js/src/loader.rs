//! Engine Module Hooks
//!
//! QuickJS asks the runtime to resolve every static import of a declared
//! module. The resolver maps specifiers to canonical URLs. Sources are never
//! loaded here: the host declares modules ahead of evaluation, and `import()`
//! calls in module and script sources are rewritten to the realm's own
//! loader. The engine loader only sees imports hidden from that rewrite,
//! such as an `import()` inside `eval`.

use std::rc::Weak;

use rquickjs::loader::{Loader, Resolver};
use rquickjs::{Ctx, Module};
use url::Url;

use crate::engine::EngineShared;
use crate::realm::realm_id_of;
use crate::specifier;

/// Resolves specifiers against the importing module, or the running script for classic scripts
pub(crate) struct HostResolver {
    engine: Weak<EngineShared>,
}

impl HostResolver {
    pub(crate) fn new(engine: Weak<EngineShared>) -> Self {
        Self { engine }
    }

    fn script_base(&self, ctx: &Ctx<'_>) -> Option<Url> {
        let engine = self.engine.upgrade()?;
        let realm = engine.realm(realm_id_of(ctx)?)?;
        let info = realm.info.try_borrow().ok()?;
        info.script_base()
    }
}

impl Resolver for HostResolver {
    fn resolve<'js>(&mut self, ctx: &Ctx<'js>, base: &str, name: &str) -> rquickjs::Result<String> {
        let base_url = specifier::parse_base(base).or_else(|| self.script_base(ctx));
        specifier::resolve(name, base_url.as_ref())
            .map(String::from)
            .map_err(|error| rquickjs::Error::new_resolving_message(base, name, error.to_string()))
    }
}

/// Rejects engine-level imports of modules the host has not declared
pub(crate) struct HostLoader;

impl Loader for HostLoader {
    fn load<'js>(&mut self, _ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js>> {
        tracing::debug!("Import of undeclared module {}", name);
        Err(rquickjs::Error::new_loading_message(
            name,
            "module has not been loaded by the host, import it through the host first",
        ))
    }
}
