use std::{
    cell::RefCell,
    future::Future,
    io::Result,
    pin::Pin,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use futures::{
    future::LocalBoxFuture,
    pin_mut,
    task::{waker, ArcWake},
    FutureExt,
};

use crate::reactor::{EventBase, TimeoutCallback, TimeoutKey};

use super::{Baton, CancellationToken};

thread_local! {
    static CURRENT: RefCell<CancellationToken> = RefCell::new(CancellationToken::none());
}

/// Token of the innermost [`with_cancellation`] scope being polled, or an
/// inert token outside of any scope.
pub fn current_cancellation_token() -> CancellationToken {
    CURRENT.with(|current| current.borrow().clone())
}

/// Run `fut` with `token` as its current cancellation token.
pub fn with_cancellation<'a, F>(token: CancellationToken, fut: F) -> WithCancellation<'a, F::Output>
where
    F: Future + 'a,
{
    WithCancellation {
        token,
        fut: fut.boxed_local(),
    }
}

/// Future returned by [`with_cancellation`].
pub struct WithCancellation<'a, T> {
    token: CancellationToken,
    fut: LocalBoxFuture<'a, T>,
}

struct Restore(Option<CancellationToken>);

impl Drop for Restore {
    fn drop(&mut self) {
        if let Some(prev) = self.0.take() {
            let scoped = CURRENT.with(|current| current.replace(prev));

            drop(scoped);
        }
    }
}

impl<'a, T> Future for WithCancellation<'a, T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        let prev = CURRENT.with(|current| current.replace(this.token.clone()));

        let _restore = Restore(Some(prev));

        this.fut.poll_unpin(cx)
    }
}

struct Notified(AtomicBool);

impl ArcWake for Notified {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.store(true, Ordering::SeqCst);
    }
}

/// Drive `fut` to completion on the calling thread, running `evb` whenever
/// the future is waiting. Errors of the reactor itself are returned as is.
pub fn block_on<F>(evb: &EventBase, fut: F) -> Result<F::Output>
where
    F: Future,
{
    let notified = Arc::new(Notified(AtomicBool::new(true)));

    let waker = waker(notified.clone());

    let mut cx = Context::from_waker(&waker);

    pin_mut!(fut);

    let max_wait = evb.config().max_wait;

    loop {
        if notified.0.swap(false, Ordering::SeqCst) {
            if let Poll::Ready(output) = fut.as_mut().poll(&mut cx) {
                return Ok(output);
            }

            continue;
        }

        evb.loop_once(max_wait)?;
    }
}

struct Wakeup(Baton);

impl TimeoutCallback for Wakeup {
    fn timeout_expired(&self) {
        self.0.post();
    }
}

struct Disarm<'a> {
    evb: &'a EventBase,
    key: TimeoutKey,
}

impl<'a> Drop for Disarm<'a> {
    fn drop(&mut self) {
        self.evb.cancel_timeout(self.key);
    }
}

/// Suspend for `duration` of reactor time.
pub async fn sleep(evb: &EventBase, duration: Duration) {
    let wakeup = Rc::new(Wakeup(Baton::new()));

    let key = evb.schedule_timeout(wakeup.clone(), duration);

    let _disarm = Disarm { evb, key };

    wakeup.0.wait().await;
}
