//! Chain-of-responsibility runner shared by every hook kind.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::transaction::{TransactionResult, TxContext};

/// A hook callback taking input `P` and producing `O`.
pub type HookFn<P, O> =
    Arc<dyn for<'a> Fn(&TxContext, Invocation<'a, P, O>) -> TransactionResult<O> + Send + Sync>;

/// The final step of a chain: the real operation.
pub(crate) type Terminal<'a, P, O> = &'a mut dyn FnMut(&TxContext, P) -> TransactionResult<O>;

/// One handler's view of a running chain.
///
/// Derefs to the input, so handlers can read or rewrite it before calling
/// [`Invocation::next`]. Dropping the invocation without calling `next`
/// short-circuits everything after this handler.
pub struct Invocation<'a, P, O> {
    pub input: P,
    handlers: &'a [HookFn<P, O>],
    terminal: Terminal<'a, P, O>,
}

impl<'a, P, O> Invocation<'a, P, O> {
    /// Continue with the next handler, or the operation itself.
    pub fn next(self, ctx: &TxContext) -> TransactionResult<O> {
        let Invocation {
            input,
            handlers,
            terminal,
        } = self;
        match handlers.split_first() {
            Some((head, rest)) => head(
                ctx,
                Invocation {
                    input,
                    handlers: rest,
                    terminal,
                },
            ),
            None => terminal(ctx, input),
        }
    }

    /// Number of handlers still waiting behind this one.
    pub fn remaining(&self) -> usize {
        self.handlers.len()
    }
}

impl<P, O> Deref for Invocation<'_, P, O> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.input
    }
}

impl<P, O> DerefMut for Invocation<'_, P, O> {
    fn deref_mut(&mut self) -> &mut P {
        &mut self.input
    }
}

/// Box a closure as a [`HookFn`], fixing its signature for inference.
pub fn hook_fn<P, O, F>(f: F) -> HookFn<P, O>
where
    F: for<'a> Fn(&TxContext, Invocation<'a, P, O>) -> TransactionResult<O> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Run `handlers` in order around `terminal`.
pub(crate) fn run<P, O>(
    ctx: &TxContext,
    handlers: &[HookFn<P, O>],
    input: P,
    terminal: Terminal<'_, P, O>,
) -> TransactionResult<O> {
    Invocation {
        input,
        handlers,
        terminal,
    }
    .next(ctx)
}
