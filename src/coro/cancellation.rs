use std::{
    cell::{Cell, RefCell},
    fmt::Debug,
    rc::{Rc, Weak},
};

use slab::Slab;

#[derive(Default)]
struct State {
    requested: Cell<bool>,
    callbacks: RefCell<Slab<Box<dyn FnOnce()>>>,
}

/// Owner side of a cancellation signal.
#[derive(Default)]
pub struct CancellationSource {
    state: Rc<State>,
}

impl Debug for CancellationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationSource")
            .field("requested", &self.state.requested.get())
            .finish()
    }
}

impl CancellationSource {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            state: Some(self.state.clone()),
        }
    }

    /// Request cancellation and run every registered callback synchronously,
    /// in registration order. Returns `false` if it was already requested.
    pub fn request_cancellation(&self) -> bool {
        if self.state.requested.replace(true) {
            return false;
        }

        let callbacks = std::mem::take(&mut *self.state.callbacks.borrow_mut());

        log::trace!("cancellation requested, {} observers", callbacks.len());

        for (_, callback) in callbacks {
            callback();
        }

        true
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.state.requested.get()
    }
}

/// Observer side of a [`CancellationSource`]. The default token can never be
/// cancelled.
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Option<Rc<State>>,
}

impl Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("can_be_cancelled", &self.can_be_cancelled())
            .field("requested", &self.is_cancellation_requested())
            .finish()
    }
}

impl CancellationToken {
    pub fn none() -> Self {
        Default::default()
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.state
            .as_ref()
            .map(|state| state.requested.get())
            .unwrap_or(false)
    }

    pub fn can_be_cancelled(&self) -> bool {
        self.state.is_some()
    }

    /// Run `f` once cancellation is requested, or right away if it already
    /// was. Dropping the returned guard unregisters `f`.
    pub fn on_cancel<F>(&self, f: F) -> CancellationCallback
    where
        F: FnOnce() + 'static,
    {
        let Some(state) = &self.state else {
            return CancellationCallback { registration: None };
        };

        if state.requested.get() {
            f();
            return CancellationCallback { registration: None };
        }

        let key = state.callbacks.borrow_mut().insert(Box::new(f));

        CancellationCallback {
            registration: Some((Rc::downgrade(state), key)),
        }
    }
}

/// Registration guard returned by [`CancellationToken::on_cancel`].
#[must_use = "dropping the guard unregisters the callback"]
pub struct CancellationCallback {
    registration: Option<(Weak<State>, usize)>,
}

impl Debug for CancellationCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationCallback")
            .field("registered", &self.registration.is_some())
            .finish()
    }
}

impl Drop for CancellationCallback {
    fn drop(&mut self) {
        let Some((state, key)) = self.registration.take() else {
            return;
        };

        if let Some(state) = state.upgrade() {
            // may already be gone when cancellation ran it
            let removed = state.callbacks.borrow_mut().try_remove(key);

            drop(removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callbacks_run_once() {
        let source = CancellationSource::new();
        let token = source.token();

        let fired = Rc::new(Cell::new(0));

        let counter = fired.clone();
        let _first = token.on_cancel(move || counter.set(counter.get() + 1));

        let counter = fired.clone();
        let _second = token.on_cancel(move || counter.set(counter.get() + 1));

        assert!(!token.is_cancellation_requested());

        assert!(source.request_cancellation());
        assert!(!source.request_cancellation());

        assert_eq!(fired.get(), 2);
        assert!(token.is_cancellation_requested());
    }

    #[test]
    fn test_dropped_guard_unregisters() {
        let source = CancellationSource::new();

        let fired = Rc::new(Cell::new(false));

        let flag = fired.clone();

        drop(source.token().on_cancel(move || flag.set(true)));

        source.request_cancellation();

        assert!(!fired.get());
    }

    #[test]
    fn test_on_cancel_after_request() {
        let source = CancellationSource::new();

        source.request_cancellation();

        let fired = Rc::new(Cell::new(false));

        let flag = fired.clone();

        let _guard = source.token().on_cancel(move || flag.set(true));

        assert!(fired.get());
    }

    #[test]
    fn test_inert_token() {
        let token = CancellationToken::none();

        assert!(!token.can_be_cancelled());

        let _guard = token.on_cancel(|| panic!("inert token fired"));

        assert!(!token.is_cancellation_requested());
    }

    #[test]
    fn test_reentrant_registration() {
        let source = CancellationSource::new();

        let token = source.token();

        let fired = Rc::new(Cell::new(false));

        let inner_token = token.clone();
        let flag = fired.clone();

        let _guard = token.on_cancel(move || {
            // registering from inside a callback runs immediately
            let _nested = inner_token.on_cancel(move || flag.set(true));
        });

        source.request_cancellation();

        assert!(fired.get());
    }
}
