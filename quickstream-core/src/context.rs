//! Thread-local tracking of the block whose module callback is running.
//!
//! When a super block's `declare` loads further blocks, the runtime must
//! know the loads come from inside that callback so it can attach the new
//! blocks as children and refuse self-loading module chains. A stack keeps
//! this correct for nested declares (a super loading a super).

use crate::block::Block;
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    static CALLBACK_STACK: RefCell<Vec<Arc<Block>>> = const { RefCell::new(Vec::new()) };
}

/// RAII guard popping the callback stack on drop.
pub(crate) struct CallbackGuard {
    _private: (),
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        CALLBACK_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Mark `block` as the currently-executing module callback on this thread.
pub(crate) fn enter(block: Arc<Block>) -> CallbackGuard {
    CALLBACK_STACK.with(|stack| stack.borrow_mut().push(block));
    CallbackGuard { _private: () }
}

/// The block whose module callback is running on this thread, if any.
pub(crate) fn current() -> Option<Arc<Block>> {
    CALLBACK_STACK.with(|stack| stack.borrow().last().cloned())
}

/// Whether `block` appears anywhere in this thread's callback stack.
pub(crate) fn stack_contains(block: &Arc<Block>) -> bool {
    CALLBACK_STACK.with(|stack| stack.borrow().iter().any(|b| Arc::ptr_eq(b, block)))
}
