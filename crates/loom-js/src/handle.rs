//! Engine Value Handles
//!
//! A [`Handle`] keeps one engine value alive outside of a context scope.
//! Handles are move-only: construction retains the value, drop releases it.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use rquickjs::{Ctx, Persistent, Value};

/// Counts live handles so leaks show up in tests and at teardown
#[derive(Debug, Default)]
pub struct HandleLedger {
    live: Cell<usize>,
    created: Cell<u64>,
}

impl HandleLedger {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Handles currently alive
    pub fn live(&self) -> usize {
        self.live.get()
    }

    /// Handles ever created
    pub fn created(&self) -> u64 {
        self.created.get()
    }

    fn acquire(&self) {
        self.live.set(self.live.get() + 1);
        self.created.set(self.created.get() + 1);
    }

    fn release(&self) {
        self.live.set(self.live.get().saturating_sub(1));
    }
}

/// Owned reference to an engine value
pub struct Handle {
    value: Persistent<Value<'static>>,
    ledger: Rc<HandleLedger>,
}

impl Handle {
    /// Retain `value` beyond the current context scope
    pub fn new<'js>(ledger: &Rc<HandleLedger>, ctx: &Ctx<'js>, value: Value<'js>) -> Self {
        ledger.acquire();
        Self {
            value: Persistent::save(ctx, value),
            ledger: Rc::clone(ledger),
        }
    }

    /// Borrow the value inside a context of the realm that created it
    pub fn value<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        self.value.clone().restore(ctx)
    }

    /// Another handle to the same value
    pub fn duplicate(&self) -> Self {
        self.ledger.acquire();
        Self {
            value: self.value.clone(),
            ledger: Rc::clone(&self.ledger),
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.ledger.release();
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    #[test]
    fn test_handle_balance() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let ledger = HandleLedger::new();

        context.with(|ctx| {
            let value: Value = ctx.eval("({ answer: 42 })").unwrap();
            let first = Handle::new(&ledger, &ctx, value);
            let second = first.duplicate();
            assert_eq!(ledger.live(), 2);

            drop(first);
            assert_eq!(ledger.live(), 1);

            let restored = second.value(&ctx).unwrap();
            let answer: i32 = restored.as_object().unwrap().get("answer").unwrap();
            assert_eq!(answer, 42);
        });

        assert_eq!(ledger.live(), 0);
        assert_eq!(ledger.created(), 2);
    }

    #[test]
    fn test_handle_moves_without_retaining() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let ledger = HandleLedger::new();

        context.with(|ctx| {
            let handle = Handle::new(&ledger, &ctx, Value::new_undefined(ctx.clone()));
            let moved = vec![handle];
            assert_eq!(ledger.live(), 1);
            drop(moved);
        });

        assert_eq!(ledger.live(), 0);
    }
}
