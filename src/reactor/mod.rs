//! Single-threaded event reactor: readiness dispatch plus a timer wheel.
//!
//! Everything registered with an [`EventBase`] is invoked on the thread that
//! calls [`EventBase::loop_once`]. Handles are cheap `Rc` clones and are not
//! `Send`.

#[cfg_attr(
    any(target_os = "linux", target_os = "android"),
    path = "poller/epoll.rs"
)]
#[cfg_attr(
    not(any(target_os = "linux", target_os = "android")),
    path = "poller/kqueue.rs"
)]
mod poller;

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    fmt::Debug,
    io::Result,
    os::fd::RawFd,
    rc::{Rc, Weak},
    time::{Duration, Instant},
};

use crate::timewheel::TimeWheel;

use poller::Poller;

/// Readiness a registered handler wants to be told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        readable: false,
        writable: false,
    };

    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };

    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };

    pub fn is_none(&self) -> bool {
        !self.readable && !self.writable
    }
}

/// Readiness reported by the poller. Error and hang-up conditions set both flags
/// so the handler discovers them through its next syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

/// Receiver of readiness events for one file descriptor.
pub trait IoHandler {
    fn handle_ready(&self, readiness: Readiness);
}

/// Receiver of a timer expiration.
pub trait TimeoutCallback {
    fn timeout_expired(&self);
}

/// Handle to a scheduled timeout, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutKey(pub(crate) u64);

/// Reactor tunables.
#[derive(Debug, Clone)]
pub struct EventBaseConfig {
    /// Timer resolution.
    pub tick: Duration,
    /// Slot count of the timer wheel.
    pub wheel_slots: u64,
    /// Upper bound for a single poller wait.
    pub max_wait: Duration,
    /// Events fetched per poller wait.
    pub max_events: usize,
    /// Reads a socket performs for one readiness event before yielding.
    pub max_reads_per_event: usize,
}

impl Default for EventBaseConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(1),
            wheel_slots: 512,
            max_wait: Duration::from_millis(100),
            max_events: 64,
            max_reads_per_event: 16,
        }
    }
}

impl EventBaseConfig {
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_micros(100));
        self
    }

    pub fn with_wheel_slots(mut self, slots: u64) -> Self {
        self.wheel_slots = slots.max(1);
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events.max(1);
        self
    }

    pub fn with_max_reads_per_event(mut self, reads: usize) -> Self {
        self.max_reads_per_event = reads.max(1);
        self
    }

    /// Apply the builder bounds to a config assembled field by field.
    fn normalized(self) -> Self {
        let Self {
            tick,
            wheel_slots,
            max_wait,
            max_events,
            max_reads_per_event,
        } = self;

        Self::default()
            .with_tick(tick)
            .with_wheel_slots(wheel_slots)
            .with_max_wait(max_wait)
            .with_max_events(max_events)
            .with_max_reads_per_event(max_reads_per_event)
    }
}

struct Registration {
    interest: Interest,
    handler: Weak<dyn IoHandler>,
}

struct Inner {
    poller: Poller,
    config: EventBaseConfig,
    handlers: RefCell<HashMap<RawFd, Registration>>,
    timers: RefCell<TimeWheel<Rc<dyn TimeoutCallback>>>,
    // expired but not yet dispatched, still cancellable
    expired: RefCell<VecDeque<(u64, Rc<dyn TimeoutCallback>)>>,
    last_tick: Cell<Instant>,
}

/// Single-threaded reactor handle.
#[derive(Clone)]
pub struct EventBase {
    inner: Rc<Inner>,
}

impl Debug for EventBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBase")
            .field("handlers", &self.inner.handlers.borrow().len())
            .field("timers", &self.inner.timers.borrow().len())
            .finish()
    }
}

impl EventBase {
    /// Create reactor with default [`EventBaseConfig`].
    pub fn new() -> Result<Self> {
        Self::with_config(EventBaseConfig::default())
    }

    pub fn with_config(config: EventBaseConfig) -> Result<Self> {
        let config = config.normalized();

        Ok(Self {
            inner: Rc::new(Inner {
                poller: Poller::new()?,
                timers: RefCell::new(TimeWheel::new(config.wheel_slots)),
                config,
                handlers: Default::default(),
                expired: Default::default(),
                last_tick: Cell::new(Instant::now()),
            }),
        })
    }

    pub fn config(&self) -> &EventBaseConfig {
        &self.inner.config
    }

    /// Change the readiness `fd` is watched for. `prev` must be the interest
    /// last applied for `fd`; [`Interest::NONE`] as `next` removes the handler.
    pub fn update_interest(
        &self,
        fd: RawFd,
        prev: Interest,
        next: Interest,
        handler: Weak<dyn IoHandler>,
    ) -> Result<()> {
        self.inner.poller.update(fd, prev, next)?;

        let mut handlers = self.inner.handlers.borrow_mut();

        if next.is_none() {
            handlers.remove(&fd);
        } else {
            handlers.insert(
                fd,
                Registration {
                    interest: next,
                    handler,
                },
            );
        }

        Ok(())
    }

    /// Drop any registration for `fd`, typically right before it is closed.
    pub fn forget(&self, fd: RawFd) {
        let registration = self.inner.handlers.borrow_mut().remove(&fd);

        if let Some(registration) = registration {
            if let Err(err) = self
                .inner
                .poller
                .update(fd, registration.interest, Interest::NONE)
            {
                log::warn!("deregister fd({}) failed, {}", fd, err);
            }
        }
    }

    /// Arm a one-shot timer. The reactor keeps `callback` alive until it fires
    /// or is cancelled.
    pub fn schedule_timeout(
        &self,
        callback: Rc<dyn TimeoutCallback>,
        timeout: Duration,
    ) -> TimeoutKey {
        let tick = self.inner.config.tick;

        // ticks are counted from the last processed tick, not from now
        let since_tick = Instant::now().saturating_duration_since(self.inner.last_tick.get());

        let ticks = ((since_tick + timeout).as_nanos() + tick.as_nanos() - 1) / tick.as_nanos();

        let key = self
            .inner
            .timers
            .borrow_mut()
            .add(ticks.min(u64::MAX as u128) as u64, callback);

        log::trace!("schedule timeout({}) in {:?}", key, timeout);

        TimeoutKey(key)
    }

    /// Cancel a timer. Returns `false` if it already fired or was cancelled.
    pub fn cancel_timeout(&self, key: TimeoutKey) -> bool {
        if self.inner.timers.borrow_mut().cancel(key.0).is_some() {
            return true;
        }

        let mut expired = self.inner.expired.borrow_mut();

        if let Some(pos) = expired.iter().position(|(k, _)| *k == key.0) {
            expired.remove(pos);
            return true;
        }

        false
    }

    /// Poll io events once and fire due timers. Returns the number of
    /// dispatched handlers and timers.
    pub fn loop_once(&self, max_wait: Duration) -> Result<usize> {
        let wait = if self.inner.timers.borrow().is_empty() {
            max_wait
        } else {
            max_wait.min(self.inner.config.tick)
        };

        let mut events = Vec::new();

        self.inner
            .poller
            .wait(&mut events, self.inner.config.max_events, wait)?;

        let mut dispatched = 0;

        for (fd, readiness) in events {
            // a previous handler in this batch may have deregistered fd
            let handler = self
                .inner
                .handlers
                .borrow()
                .get(&fd)
                .and_then(|r| r.handler.upgrade());

            if let Some(handler) = handler {
                log::trace!("fd({}) ready {:?}", fd, readiness);
                handler.handle_ready(readiness);
                dispatched += 1;
            }
        }

        self.expire_timers();

        loop {
            let next = self.inner.expired.borrow_mut().pop_front();

            match next {
                Some((key, callback)) => {
                    log::trace!("timeout({}) expired", key);
                    callback.timeout_expired();
                    dispatched += 1;
                }
                None => break,
            }
        }

        log::trace!("loop_once({})", dispatched);

        Ok(dispatched)
    }

    fn expire_timers(&self) {
        let tick = self.inner.config.tick;
        let now = Instant::now();
        let last_tick = self.inner.last_tick.get();

        let mut timers = self.inner.timers.borrow_mut();

        if timers.is_empty() {
            self.inner.last_tick.set(now);
            return;
        }

        let steps = (now.saturating_duration_since(last_tick).as_nanos() / tick.as_nanos()) as u64;

        self.inner
            .last_tick
            .set(last_tick + tick * steps.min(u32::MAX as u64) as u32);

        let mut expired = self.inner.expired.borrow_mut();

        for _ in 0..steps {
            if let std::task::Poll::Ready(fired) = timers.tick() {
                expired.extend(fired);
            }

            if timers.is_empty() {
                self.inner.last_tick.set(now);
                break;
            }
        }
    }
}
