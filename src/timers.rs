//! Idle detection and timer bookkeeping.

use std::time::{Duration, Instant};

use calloop::timer::{TimeoutAction, Timer};
use calloop::{LoopHandle, RegistrationToken};
use tracing::{trace, warn};

use crate::backend::{DisplayServer, Lookup, PointerState, Window};
use crate::config::IdleMethod;
use crate::error::Result;

/// Strategy used for noticing user activity.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum IdleMode {
    /// The server pushes screen saver activation notifications.
    Extension,
    /// Key presses are selected on every window, the pointer is polled.
    EventSelection,
    /// Only the pointer position is polled.
    Polling,
}

impl IdleMode {
    pub fn new(method: IdleMethod, has_extension: bool) -> Self {
        match method {
            IdleMethod::Auto if has_extension => Self::Extension,
            IdleMethod::Auto | IdleMethod::Events => Self::EventSelection,
            IdleMethod::Extension if has_extension => Self::Extension,
            IdleMethod::Extension => {
                warn!("screen saver extension unavailable, selecting events instead");
                Self::EventSelection
            },
            IdleMethod::Poll => Self::Polling,
        }
    }

    /// Whether the pointer position must be polled.
    pub fn polls_pointer(&self) -> bool {
        !matches!(self, Self::Extension)
    }
}

/// Result of an idle check.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum IdleCheck {
    /// The timeout elapsed since the last check.
    BecameIdle,
    /// Time left until the timeout elapses.
    Remaining(Duration),
    /// The idle notification was already delivered.
    AlreadyIdle,
}

/// Inactivity tracking.
///
/// Reports becoming idle at most once per reset.
#[derive(Copy, Clone, Debug)]
pub struct IdleTracker {
    timeout: Duration,
    last_activity: Instant,
    notified: bool,
}

impl IdleTracker {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self { timeout, last_activity: now, notified: false }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Register user activity.
    pub fn reset(&mut self, now: Instant) {
        self.last_activity = now;
        self.notified = false;
    }

    pub fn idle_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Check the idle time since the last activity.
    pub fn poll(&mut self, now: Instant) -> IdleCheck {
        let idle = self.idle_time(now);
        self.check(idle)
    }

    /// Check an idle time reported by the display server.
    pub fn check(&mut self, idle: Duration) -> IdleCheck {
        if self.notified {
            IdleCheck::AlreadyIdle
        } else if idle >= self.timeout {
            self.notified = true;
            IdleCheck::BecameIdle
        } else {
            IdleCheck::Remaining(self.timeout - idle)
        }
    }
}

/// Pointer positions from the previous poll.
#[derive(Default, Debug)]
pub struct PointerTracker {
    last: Vec<Option<PointerState>>,
}

impl PointerTracker {
    /// Store a new pointer state, returning whether it changed.
    pub fn update(&mut self, screen: usize, state: PointerState) -> bool {
        if self.last.len() <= screen {
            self.last.resize(screen + 1, None);
        }

        let previous = self.last[screen].replace(state);
        previous.map_or(false, |previous| previous != state)
    }
}

/// Session timers.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TimerKind {
    /// Deadline for becoming idle.
    Idle,
    PointerPoll,
    /// Hack rotation while blanked.
    Cycle,
    Watchdog,
    /// Delayed locking after blanking.
    Lock,
}

impl TimerKind {
    const COUNT: usize = 5;

    fn index(&self) -> usize {
        match self {
            Self::Idle => 0,
            Self::PointerPoll => 1,
            Self::Cycle => 2,
            Self::Watchdog => 3,
            Self::Lock => 4,
        }
    }
}

/// Event loop state which owns a timer registry.
pub trait TimerOwner: Sized + 'static {
    fn timers(&mut self) -> &mut Timers<Self>;
}

/// Registry holding at most one live timer of each kind.
pub struct Timers<D: 'static> {
    handle: LoopHandle<'static, D>,
    tokens: [Option<RegistrationToken>; TimerKind::COUNT],
}

impl<D: TimerOwner> Timers<D> {
    pub fn new(handle: LoopHandle<'static, D>) -> Self {
        Self { handle, tokens: Default::default() }
    }

    pub fn handle(&self) -> &LoopHandle<'static, D> {
        &self.handle
    }

    /// Schedule a timer, replacing any live timer of the same kind.
    ///
    /// # Panics
    ///
    /// Panics when scheduling the idle timer while the cycle timer is live,
    /// or the other way around.
    pub fn schedule<F>(&mut self, kind: TimerKind, delay: Duration, mut callback: F)
    where
        F: FnMut(&mut D) -> TimeoutAction + 'static,
    {
        match kind {
            TimerKind::Idle => {
                assert!(!self.is_active(TimerKind::Cycle), "idle timer scheduled while cycling")
            },
            TimerKind::Cycle => {
                assert!(!self.is_active(TimerKind::Idle), "cycle timer scheduled while idle")
            },
            _ => (),
        }

        self.cancel(kind);

        let timer = Timer::from_duration(delay);
        let token = self
            .handle
            .insert_source(timer, move |_, _, data| {
                let action = callback(data);
                if let TimeoutAction::Drop = action {
                    data.timers().tokens[kind.index()] = None;
                }
                action
            })
            .expect("insert session timer");
        self.tokens[kind.index()] = Some(token);

        trace!("scheduled {kind:?} timer in {delay:?}");
    }

    /// Remove a live timer.
    ///
    /// Returns `false` if no timer of this kind was live.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.tokens[kind.index()].take() {
            Some(token) => {
                self.handle.remove(token);
                true
            },
            None => false,
        }
    }

    pub fn is_active(&self, kind: TimerKind) -> bool {
        self.tokens[kind.index()].is_some()
    }
}

/// Subscribe to activity events on a window tree.
///
/// Windows destroyed during the walk are skipped. Returns the number of
/// windows which were subscribed.
pub fn select_tree<B: DisplayServer>(
    backend: &mut B,
    top: Window,
    is_own: impl Fn(Window) -> bool,
) -> Result<usize> {
    let mut stack = vec![top];
    let mut count = 0;

    while let Some(window) = stack.pop() {
        if is_own(window) {
            continue;
        }

        let key_press = match backend.key_press_interest(window)? {
            Lookup::Found(key_press) => key_press,
            Lookup::Vanished => continue,
        };

        match backend.select_activity_events(window, key_press)? {
            Lookup::Found(()) => count += 1,
            Lookup::Vanished => continue,
        }

        if let Lookup::Found(children) = backend.query_children(window)? {
            stack.extend(children);
        }
    }

    Ok(count)
}
