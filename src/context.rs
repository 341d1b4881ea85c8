//! The call currently executing on this thread.

use crate::message::Message;
use crate::module::WasmModule;
use std::cell::{Ref, RefCell, RefMut};

/// Binds one message to the module executing it for the duration of a guest
/// call.
///
/// While [`ExecutionContext::enter`] runs, host functions on the same thread
/// can reach the binding through [`ExecutionContext::with_current`] or
/// [`current_message`]. Bindings nest; leaving one restores whatever was
/// current before, also when unwinding.
pub struct ExecutionContext<'a> {
    module: &'a WasmModule,
    msg: RefCell<Message>,
}

impl<'a> ExecutionContext<'a> {
    /// Creates a context owning `msg`.
    pub fn new(module: &'a WasmModule, msg: Message) -> Self {
        Self {
            module,
            msg: RefCell::new(msg),
        }
    }

    /// The module executing the call.
    pub fn module(&self) -> &'a WasmModule {
        self.module
    }

    /// The message being executed.
    pub fn message(&self) -> Ref<'_, Message> {
        self.msg.borrow()
    }

    /// Mutable access to the message, e.g. to record output.
    pub fn message_mut(&self) -> RefMut<'_, Message> {
        self.msg.borrow_mut()
    }

    /// Gives the message back.
    pub fn into_message(self) -> Message {
        self.msg.into_inner()
    }

    /// Makes this the current context while `f` runs.
    pub fn enter<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        tls::set(self, || f(self))
    }

    /// Calls `f` with the innermost context entered on this thread.
    pub fn with_current<R>(f: impl FnOnce(Option<&ExecutionContext<'_>>) -> R) -> R {
        tls::with(f)
    }
}

/// Copy of the message currently executing on this thread, if any.
pub fn current_message() -> Option<Message> {
    ExecutionContext::with_current(|ctx| ctx.map(|ctx| ctx.message().clone()))
}

mod tls {
    use super::ExecutionContext;
    use std::cell::Cell;
    use std::ptr;

    type Raw = *const ExecutionContext<'static>;

    thread_local!(static CURRENT: Cell<Raw> = const { Cell::new(ptr::null()) });

    /// Puts back the context that was current before an `enter`.
    struct Restore(Raw);

    impl Drop for Restore {
        fn drop(&mut self) {
            CURRENT.with(|c| c.set(self.0));
        }
    }

    /// Makes `ctx` the current context while `f` runs.
    pub fn set<R>(ctx: &ExecutionContext<'_>, f: impl FnOnce() -> R) -> R {
        // The erased lifetime never escapes: `with` hands the context out
        // only for the length of a call made from inside `f`.
        let raw: Raw = (ctx as *const ExecutionContext<'_>).cast();
        let _restore = Restore(CURRENT.with(|c| c.replace(raw)));
        f()
    }

    /// Calls `f` with the innermost context entered on this thread.
    pub fn with<R>(f: impl FnOnce(Option<&ExecutionContext<'_>>) -> R) -> R {
        let raw = CURRENT.with(|c| c.get());
        // SAFETY: a non-null pointer was installed by `set`, whose borrow of
        // the context is still live further up this thread's stack.
        f(unsafe { raw.as_ref() })
    }
}
