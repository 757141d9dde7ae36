//! Unhandled Rejection Tracking
//!
//! The engine reports "rejected without handler" and "handler attached
//! later" as separate notifications. Both become jobs; this table pairs them
//! up over one drain pass so a promise rejected and then caught in the same
//! turn is never reported.

use rquickjs::{Ctx, Value};

use crate::handle::Handle;
use crate::realm::RealmId;

/// A rejection still without a handler
#[derive(Debug)]
pub struct UnhandledRejection {
    pub realm: RealmId,
    pub promise: Handle,
    pub reason: Handle,
}

/// Side table scoped to a single drain pass
#[derive(Debug, Default)]
pub struct RejectionTable {
    entries: Vec<UnhandledRejection>,
}

impl RejectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `promise` as rejected without a handler
    ///
    /// A promise already present keeps its first reason.
    pub fn add<'js>(&mut self, ctx: &Ctx<'js>, realm: RealmId, promise: Handle, reason: Handle) {
        if self.position(ctx, realm, &promise).is_some() {
            return;
        }
        self.entries.push(UnhandledRejection { realm, promise, reason });
    }

    /// Forget `promise` because a handler was attached. Returns whether it was tracked.
    pub fn remove<'js>(&mut self, ctx: &Ctx<'js>, realm: RealmId, promise: &Handle) -> bool {
        match self.position(ctx, realm, promise) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every rejection still unhandled, in the order they were recorded
    pub fn finalize(&mut self) -> Vec<UnhandledRejection> {
        std::mem::take(&mut self.entries)
    }

    fn position<'js>(&self, ctx: &Ctx<'js>, realm: RealmId, promise: &Handle) -> Option<usize> {
        let target: Value<'js> = promise.value(ctx).ok()?;
        self.entries.iter().position(|entry| {
            entry.realm == realm
                && entry
                    .promise
                    .value(ctx)
                    .map(|candidate| candidate == target)
                    .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleLedger;
    use rquickjs::{Context, Runtime};

    #[test]
    fn test_add_then_remove() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let ledger = HandleLedger::new();
        let realm = RealmId(1);

        context.with(|ctx| {
            let promise: Value = ctx.eval("({})").unwrap();
            let reason: Value = ctx.eval("new Error('x')").unwrap();

            let mut table = RejectionTable::new();
            table.add(
                &ctx,
                realm,
                Handle::new(&ledger, &ctx, promise.clone()),
                Handle::new(&ledger, &ctx, reason.clone()),
            );
            table.add(
                &ctx,
                realm,
                Handle::new(&ledger, &ctx, promise.clone()),
                Handle::new(&ledger, &ctx, reason),
            );
            assert_eq!(table.len(), 1);

            let handled = Handle::new(&ledger, &ctx, promise);
            assert!(table.remove(&ctx, realm, &handled));
            assert!(!table.remove(&ctx, realm, &handled));
            assert!(table.finalize().is_empty());
        });

        assert_eq!(ledger.live(), 0);
    }

    #[test]
    fn test_distinct_promises_kept() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let ledger = HandleLedger::new();

        context.with(|ctx| {
            let mut table = RejectionTable::new();
            for _ in 0..3 {
                let promise: Value = ctx.eval("({})").unwrap();
                let reason = Value::new_undefined(ctx.clone());
                table.add(
                    &ctx,
                    RealmId(1),
                    Handle::new(&ledger, &ctx, promise),
                    Handle::new(&ledger, &ctx, reason),
                );
            }
            assert_eq!(table.finalize().len(), 3);
            assert!(table.is_empty());
        });
    }
}
