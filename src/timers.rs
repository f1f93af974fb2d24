//! Registry of pending delayed callbacks.
//!
//! Every timer set through [`Timers`] stays in [`Timers::executing`] until it
//! fires or is cleared. Timers are scheduled on a due list that is advanced with
//! [`Timers::fire_due`], or driven on the tokio clock by `Timers::run` when the
//! `async` feature is enabled.
use log::debug;
use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    fmt::Display,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant, SystemTime},
};

static TIMER_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Delays at or above this many milliseconds are tracked but never fire.
pub const MAX_DELAY: u64 = 2_147_483_647;

pub type TimerCallback = Box<dyn FnOnce()>;

/// Handle of a scheduled timer on the due list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerRef {
    due: Instant,
    sequence: u64,
}

#[derive(Debug)]
struct TimerData {
    owner: Option<String>,
    timer_id: String,
    delay: Duration,
    expire_at: SystemTime,
    timer_ref: Cell<Option<TimerRef>>,
}

/// Cheap to clone timer handle.
#[derive(Debug, Clone)]
pub struct Timer {
    data: Rc<TimerData>,
}

impl Timer {
    /// Correlation key, `None` when set on the registry itself.
    pub fn owner(&self) -> Option<&str> {
        self.data.owner.as_deref()
    }

    pub fn timer_id(&self) -> &str {
        &self.data.timer_id
    }

    pub fn delay(&self) -> Duration {
        self.data.delay
    }

    pub fn expire_at(&self) -> SystemTime {
        self.data.expire_at
    }

    /// `None` once fired or cleared, or when the delay is too large to schedule.
    pub fn timer_ref(&self) -> Option<TimerRef> {
        self.data.timer_ref.get()
    }
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }
}

impl Display for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.owner() {
            Some(owner) => write!(f, "({} {}ms {owner})", self.timer_id(), self.delay().as_millis()),
            None => write!(f, "({} {}ms)", self.timer_id(), self.delay().as_millis()),
        }
    }
}

struct Pending {
    timer: Timer,
    callback: Option<TimerCallback>,
}

#[derive(Default)]
struct Registry {
    executing: Vec<Pending>,
    scheduled: BTreeMap<TimerRef, Timer>,
}

impl Registry {
    fn take(&mut self, timer: &Timer) -> Option<Pending> {
        let position = self
            .executing
            .iter()
            .position(|pending| pending.timer == *timer)?;
        let pending = self.executing.remove(position);
        if let Some(timer_ref) = pending.timer.data.timer_ref.take() {
            self.scheduled.remove(&timer_ref);
        }
        Some(pending)
    }
}

/// Shared timer registry, cheap to clone.
#[derive(Clone, Default)]
pub struct Timers {
    registry: Rc<RefCell<Registry>>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Owner scoped view of the registry.
    pub fn register(&self, owner: impl Into<String>) -> RegisteredTimers {
        RegisteredTimers {
            timers: self.clone(),
            owner: owner.into(),
        }
    }

    pub fn set_timeout<F>(&self, callback: F, delay: Duration) -> Timer
    where
        F: FnOnce() + 'static,
    {
        self.add(None, Box::new(callback), delay)
    }

    /// Remove a pending timer. Fired, cleared and unknown timers are ignored.
    pub fn clear_timeout(&self, timer: &Timer) {
        if self.registry.borrow_mut().take(timer).is_some() {
            debug!("cleared timer {timer}");
        }
    }

    /// Pending timers in registration order.
    pub fn executing(&self) -> Vec<Timer> {
        self.registry
            .borrow()
            .executing
            .iter()
            .map(|pending| pending.timer.clone())
            .collect()
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.registry
            .borrow()
            .scheduled
            .keys()
            .next()
            .map(|timer_ref| timer_ref.due)
    }

    /// Fire every scheduled timer due at `now`, earliest first. Returns number fired.
    pub fn fire_due(&self, now: Instant) -> usize {
        let mut fired = 0;
        loop {
            let pending = {
                let mut registry = self.registry.borrow_mut();
                let due = match registry.scheduled.first_key_value() {
                    Some((timer_ref, timer)) if timer_ref.due <= now => timer.clone(),
                    _ => break,
                };
                registry.take(&due)
            };

            // Callbacks may set or clear timers, the registry is not borrowed here
            if let Some(Pending {
                timer,
                callback: Some(callback),
            }) = pending
            {
                debug!("timer {timer} fired");
                callback();
                fired += 1;
            }
        }
        fired
    }

    /// Drive the registry on the tokio clock until no scheduled timer remains.
    #[cfg(feature = "async")]
    pub async fn run(&self) {
        while let Some(due) = self.next_expiry() {
            tokio::time::sleep_until(tokio::time::Instant::from_std(due)).await;
            self.fire_due(tokio::time::Instant::now().into_std());
        }
    }

    fn add(&self, owner: Option<String>, callback: TimerCallback, delay: Duration) -> Timer {
        let mut registry = self.registry.borrow_mut();
        let sequence = TIMER_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now();

        let timer = Timer {
            data: Rc::new(TimerData {
                owner,
                timer_id: format!("timer_{sequence}"),
                delay,
                // Out of range delays expire no later than the max delay
                expire_at: now
                    .checked_add(delay)
                    .unwrap_or_else(|| now + Duration::from_millis(MAX_DELAY)),
                timer_ref: Cell::new(None),
            }),
        };

        if delay.as_millis() < u128::from(MAX_DELAY) {
            let timer_ref = TimerRef {
                due: Instant::now() + delay,
                sequence,
            };
            timer.data.timer_ref.set(Some(timer_ref));
            registry.scheduled.insert(timer_ref, timer.clone());
        } else {
            debug!("timer {timer} exceeds max delay, it will never fire");
        }

        registry.executing.push(Pending {
            timer: timer.clone(),
            callback: Some(callback),
        });
        timer
    }
}

/// Timers set through this view carry its owner.
#[derive(Clone)]
pub struct RegisteredTimers {
    timers: Timers,
    owner: String,
}

impl RegisteredTimers {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn set_timeout<F>(&self, callback: F, delay: Duration) -> Timer
    where
        F: FnOnce() + 'static,
    {
        self.timers
            .add(Some(self.owner.clone()), Box::new(callback), delay)
    }

    pub fn clear_timeout(&self, timer: &Timer) {
        self.timers.clear_timeout(timer);
    }

    /// Pending timers set by this owner.
    pub fn executing(&self) -> Vec<Timer> {
        self.timers
            .executing()
            .into_iter()
            .filter(|timer| timer.owner() == Some(self.owner.as_str()))
            .collect()
    }

    /// Clear every pending timer set by this owner.
    pub fn clear_all(&self) -> usize {
        let timers = self.executing();
        for timer in &timers {
            self.timers.clear_timeout(timer);
        }
        timers.len()
    }
}
