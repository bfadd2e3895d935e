use std::{
    cell::{Cell, RefCell},
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};

/// Single-threaded one-shot completion signal.
///
/// One side [`post`](Baton::post)s, the other awaits [`wait`](Baton::wait).
/// Posting more than once is a no-op, so the first terminal event of an
/// operation decides when the waiter resumes.
#[derive(Debug, Default)]
pub struct Baton {
    posted: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl Baton {
    pub fn new() -> Self {
        Default::default()
    }

    /// Signal the waiter. Returns `false` if the baton was already posted.
    pub fn post(&self) -> bool {
        if self.posted.replace(true) {
            return false;
        }

        let waker = self.waker.borrow_mut().take();

        if let Some(waker) = waker {
            waker.wake();
        }

        true
    }

    pub fn is_posted(&self) -> bool {
        self.posted.get()
    }

    /// Rearm a posted baton.
    pub fn reset(&self) {
        self.posted.set(false);
        self.waker.borrow_mut().take();
    }

    /// Resolves once the baton is posted.
    pub fn wait(&self) -> Wait<'_> {
        Wait { baton: self }
    }
}

/// Future returned by [`Baton::wait`].
#[derive(Debug)]
pub struct Wait<'a> {
    baton: &'a Baton,
}

impl<'a> Future for Wait<'a> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.baton.posted.get() {
            return Poll::Ready(());
        }

        *self.baton.waker.borrow_mut() = Some(cx.waker().clone());

        Poll::Pending
    }
}
