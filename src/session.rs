//! Daemon state machine.

use std::fmt::Display;
use std::mem;
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use calloop::generic::Generic;
use calloop::signals::{Signal, Signals};
use calloop::timer::{TimeoutAction, Timer};
use calloop::{EventLoop, Interest, Mode, PostAction};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info, trace, warn};

use crate::auth::{self, Authenticator};
use crate::backend::{DisplayEvent, DisplayServer, ServerSaver, Window};
use crate::config::{ConfigFile, Preferences};
use crate::error::{Error, Result};
use crate::hack::{HackProcess, Programs, Selection};
use crate::ipc_server;
use crate::lock::{FailureLog, KeyOutcome, PasswdDialog, PasswdState, FLASH_DURATION, TICK};
use crate::timers::{
    self, IdleCheck, IdleMode, IdleTracker, PointerTracker, TimerKind, TimerOwner, Timers,
};
use crate::visual::VisualSpec;
use crate::windows::{self, Screens};

/// Delay for hack rotation while the password dialog is up.
const CYCLE_DIALOG_DELAY: Duration = Duration::from_secs(30);

/// Blank screen request.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Activation {
    /// Lock immediately, regardless of the lock timeout.
    pub lock: bool,
    /// Showcase a hack, deactivating on any click or key press.
    pub demo: bool,
    pub selection: Selection,
}

impl Default for Activation {
    fn default() -> Self {
        Self { lock: false, demo: false, selection: Selection::Random }
    }
}

/// Reason for leaving the current wait.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Wake {
    Activate(Activation),
    Deactivate,
}

/// Requested daemon termination.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Shutdown {
    Exit,
    /// Replace the process with a fresh instance.
    Restart,
}

/// What the daemon is waiting for.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Wait {
    Idle,
    Activity,
}

/// Daemon state shared with event loop callbacks.
pub struct Session<B: DisplayServer + 'static> {
    pub backend: B,
    pub preferences: Preferences,
    pub screens: Screens,
    config: Option<ConfigFile>,
    timers: Timers<Session<B>>,
    idle_mode: IdleMode,
    idle: IdleTracker,
    pointer: PointerTracker,
    programs: Programs,
    hacks: Vec<HackProcess>,
    rng: StdRng,
    authenticator: Option<Box<dyn Authenticator>>,
    user: String,
    failures: FailureLog,
    original_saver: Option<ServerSaver>,
    deferred: Vec<DisplayEvent>,
    wait: Wait,
    wake: Option<Wake>,
    shutdown: Option<Shutdown>,
    error: Option<Error>,
    locked: bool,
    demoing: bool,
    dialog_up: bool,
}

impl<B: DisplayServer + 'static> TimerOwner for Session<B> {
    fn timers(&mut self) -> &mut Timers<Self> {
        &mut self.timers
    }
}

impl<B: DisplayServer + 'static> Session<B> {
    pub fn dialog_up(&self) -> bool {
        self.dialog_up
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    pub fn demoing(&self) -> bool {
        self.demoing
    }

    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    /// Whether the current wait is about to end.
    pub fn wake_pending(&self) -> bool {
        self.wake.is_some()
    }

    /// End the current wait.
    ///
    /// The first request wins if several arrive before the wait ends.
    pub fn wake(&mut self, wake: Wake) {
        if self.wake.is_none() {
            debug!("wake requested: {wake:?}");
            self.wake = Some(wake);
        }
    }

    pub fn request_shutdown(&mut self, shutdown: Shutdown) {
        self.shutdown.get_or_insert(shutdown);
    }

    pub fn shutdown_requested(&self) -> Option<Shutdown> {
        self.shutdown
    }

    /// Restart the idle countdown, including the server's inactivity counter.
    pub fn reset_idle(&mut self) {
        self.idle.reset(Instant::now());
        if let Err(err) = self.backend.reset_idle_time() {
            warn!("unable to reset server idle time: {err}");
        }
    }

    #[cfg(test)]
    pub fn set_authenticator(&mut self, authenticator: Box<dyn Authenticator>) {
        self.authenticator = Some(authenticator);
    }

    /// Lock the blanked screen.
    pub fn lock(&mut self) -> Result<(), &'static str> {
        if self.locked {
            return Ok(());
        } else if self.preferences.debug {
            return Err("locking is disabled in debug mode");
        } else if self.authenticator.is_none() {
            return Err("no authenticator available");
        } else if !self.screens.grabs().keyboard {
            return Err("keyboard is not grabbed");
        }

        self.locked = true;
        info!("screen locked");

        Ok(())
    }

    /// Replace the running hack.
    pub fn switch_hack(&mut self, selection: Selection) -> Result<()> {
        self.spawn_hacks(selection)?;

        // Restart the countdown for the new hack.
        if self.timers.is_active(TimerKind::Cycle) {
            self.schedule_cycle();
        }

        Ok(())
    }

    /// Release every server resource before exiting.
    pub fn cleanup(&mut self) {
        self.kill_hacks();

        if let Err(err) = self.screens.destroy(&mut self.backend) {
            error!("unable to destroy overlays: {err}");
        }

        if let Some(saver) = self.original_saver.take() {
            if let Err(err) = self.backend.set_server_saver(saver) {
                error!("unable to restore server screen saver: {err}");
            }
        }

        let _ = self.backend.flush();
    }

    /// Subscribe to activity sources and start the periodic timers.
    fn start(&mut self) -> Result<()> {
        self.original_saver = Some(self.backend.server_saver()?);

        match self.idle_mode {
            IdleMode::Extension => self.backend.select_saver_notify()?,
            IdleMode::EventSelection => {
                let roots: Vec<_> = self.screens.screens().iter().map(|s| s.root).collect();
                for root in roots {
                    let screens = &self.screens;
                    let count = timers::select_tree(&mut self.backend, root, |window| {
                        screens.is_own(window)
                    })?;
                    debug!("selected events on {count} windows below 0x{root:x}");
                }
            },
            IdleMode::Polling => (),
        }

        self.reconcile_server_saver()?;

        let watchdog = self.preferences.watchdog();
        self.timers.schedule(TimerKind::Watchdog, watchdog, |session| session.watchdog());

        if self.idle_mode.polls_pointer() {
            let poll = self.preferences.pointer_poll();
            self.timers.schedule(TimerKind::PointerPoll, poll, |session| session.poll_pointer());
        }

        Ok(())
    }

    /// Handle all queued display events.
    fn process_display_events(&mut self) -> Result<()> {
        while let Some(event) = self.backend.poll_event()? {
            self.handle_event(event);

            if let Some(err) = self.error.take() {
                return Err(err);
            }
        }

        Ok(())
    }

    fn handle_event(&mut self, event: DisplayEvent) {
        trace!("display event: {event:?}");

        match event {
            DisplayEvent::Command { window, message_type, data } => {
                ipc_server::handle_command(self, window, message_type, data);
            },
            DisplayEvent::SaverNotify { active: true } if self.wait == Wait::Idle => {
                debug!("server screen saver activated");
                self.wake(Wake::Activate(Activation::default()));
            },
            DisplayEvent::WindowCreated { window } => self.notice_window(window),
            DisplayEvent::KeyPress { .. }
            | DisplayEvent::KeyRelease
            | DisplayEvent::ButtonPress
            | DisplayEvent::ButtonRelease
            | DisplayEvent::Motion => self.user_activity(event),
            DisplayEvent::SaverNotify { .. } | DisplayEvent::Expose { .. } => (),
            DisplayEvent::Other => (),
        }
    }

    fn user_activity(&mut self, event: DisplayEvent) {
        match self.wait {
            Wait::Idle => {
                debug_assert!(!self.timers.is_active(TimerKind::Cycle));
                self.screens.note_activity();
                self.idle.reset(Instant::now());
            },
            Wait::Activity => {
                // Demos survive pointer movement.
                let passive = matches!(event, DisplayEvent::Motion | DisplayEvent::KeyRelease);
                if self.demoing && passive {
                    return;
                }

                self.screens.note_activity();
                self.wake(Wake::Deactivate);
            },
        }
    }

    /// Subscribe to activity on a new window once its client had time to
    /// set up its own event mask.
    fn notice_window(&mut self, window: Window) {
        if self.idle_mode != IdleMode::EventSelection || self.screens.is_own(window) {
            return;
        }

        let timer = Timer::from_duration(self.preferences.notice_events_delay());
        let result = self.timers.handle().insert_source(timer, move |_, _, session| {
            let screens = &session.screens;
            match timers::select_tree(&mut session.backend, window, |w| screens.is_own(w)) {
                Ok(count) => trace!("selected events on {count} windows below 0x{window:x}"),
                Err(err) => session.fail(err),
            }
            TimeoutAction::Drop
        });

        if let Err(err) = result {
            warn!("unable to schedule event selection: {}", err.error);
        }
    }

    /// Schedule the idle countdown for a new idle wait.
    fn schedule_idle_timer(&mut self) {
        self.idle.set_timeout(self.preferences.timeout());
        self.idle.reset(Instant::now());

        let delay = match self.idle_mode {
            IdleMode::Extension => Duration::ZERO,
            _ => self.idle.timeout(),
        };
        self.timers.schedule(TimerKind::Idle, delay, |session| session.idle_timer());
    }

    fn idle_timer(&mut self) -> TimeoutAction {
        let check = match self.idle_mode {
            IdleMode::Extension => match self.backend.query_idle_time() {
                Ok(idle) => self.idle.check(idle),
                Err(err) => {
                    self.fail(err);
                    return TimeoutAction::Drop;
                },
            },
            _ => self.idle.poll(Instant::now()),
        };

        match check {
            IdleCheck::BecameIdle => {
                info!("idle for {:?}", self.idle.timeout());
                self.wake(Wake::Activate(Activation::default()));
                TimeoutAction::Drop
            },
            IdleCheck::Remaining(remaining) => TimeoutAction::ToDuration(remaining),
            IdleCheck::AlreadyIdle => TimeoutAction::Drop,
        }
    }

    fn poll_pointer(&mut self) -> TimeoutAction {
        for screen in 0..self.screens.screens().len() {
            match self.backend.query_pointer(screen) {
                Ok(state) if self.pointer.update(screen, state) => {
                    self.user_activity(DisplayEvent::Motion);
                },
                Ok(_) => (),
                Err(err) => {
                    self.fail(err);
                    return TimeoutAction::Drop;
                },
            }
        }

        TimeoutAction::ToDuration(self.preferences.pointer_poll())
    }

    fn watchdog(&mut self) -> TimeoutAction {
        if let Err(err) = self.check_watchdog() {
            self.fail(err);
            return TimeoutAction::Drop;
        }

        TimeoutAction::ToDuration(self.preferences.watchdog())
    }

    fn check_watchdog(&mut self) -> Result<()> {
        self.reconcile_server_saver()?;

        if self.screens.blanked() {
            self.reap_hacks();
            self.screens.reassert(&mut self.backend, !self.hacks.is_empty())?;
        }

        self.backend.flush()
    }

    /// Keep the server's own screen saver from interfering.
    ///
    /// With the extension, the server timeout matches ours so activation
    /// notifications arrive. Otherwise the server saver is disabled.
    fn reconcile_server_saver(&mut self) -> Result<()> {
        let current = self.backend.server_saver()?;
        let timeout = match self.idle_mode {
            IdleMode::Extension => self.preferences.timeout().as_secs().min(i16::MAX as u64) as i16,
            _ => 0,
        };

        let desired = ServerSaver { timeout, interval: 0, ..current };
        if desired != current {
            debug!("changing server screen saver timeout from {} to {timeout}", current.timeout);
            self.backend.set_server_saver(desired)?;
        }

        Ok(())
    }

    fn activate(&mut self, activation: Activation) -> Result<()> {
        info!("activating (demo: {})", activation.demo);

        self.demoing = activation.demo;
        self.screens.blank(&mut self.backend, &self.preferences, activation.demo)?;

        if !activation.demo {
            let lock_timeout = self.preferences.lock_timeout();
            if activation.lock || (self.preferences.lock && lock_timeout.is_zero()) {
                if let Err(reason) = self.lock() {
                    warn!("unable to lock: {reason}");
                }
            } else if self.preferences.lock {
                self.timers.schedule(TimerKind::Lock, lock_timeout, |session| {
                    if let Err(reason) = session.lock() {
                        warn!("unable to lock: {reason}");
                    }
                    TimeoutAction::Drop
                });
            }
        }

        self.spawn_hacks(activation.selection)?;
        self.schedule_cycle();

        self.backend.flush()
    }

    fn deactivate(&mut self) -> Result<()> {
        self.timers.cancel(TimerKind::Cycle);
        self.timers.cancel(TimerKind::Lock);
        self.kill_hacks();

        self.screens.unblank(&mut self.backend, &self.preferences, self.demoing)?;
        self.locked = false;
        self.demoing = false;

        // The user might still be idle after a remote deactivation.
        self.backend.reset_idle_time()?;

        info!("deactivated");

        self.backend.flush()
    }

    fn schedule_cycle(&mut self) {
        match self.preferences.cycle() {
            Some(period) if self.programs.len() > 1 && !self.demoing => {
                self.timers.schedule(TimerKind::Cycle, period, |session| session.cycle());
            },
            _ => {
                self.timers.cancel(TimerKind::Cycle);
            },
        }
    }

    fn cycle(&mut self) -> TimeoutAction {
        if self.dialog_up {
            return TimeoutAction::ToDuration(CYCLE_DIALOG_DELAY);
        }

        self.reload_config();

        if let Err(err) = self.spawn_hacks(Selection::Random) {
            self.fail(err);
            return TimeoutAction::Drop;
        }

        match self.preferences.cycle() {
            Some(period) if self.programs.len() > 1 => TimeoutAction::ToDuration(period),
            _ => TimeoutAction::Drop,
        }
    }

    /// Pick up configuration file changes.
    fn reload_config(&mut self) {
        let preferences = match self.config.as_mut().and_then(ConfigFile::reload) {
            Some(preferences) => preferences,
            None => return,
        };

        self.programs.update(preferences.programs.clone());
        self.preferences = preferences;
    }

    /// Run the selected hack on every screen.
    fn spawn_hacks(&mut self, selection: Selection) -> Result<()> {
        self.kill_hacks();

        if self.programs.is_empty() {
            debug!("no graphics hacks configured");
            return Ok(());
        }

        let program = match self.programs.select(selection, &mut self.rng) {
            Some(program) => program.clone(),
            None => {
                warn!("no graphics hack matches {selection:?}");
                return Ok(());
            },
        };

        let visual = program.visual.as_deref().unwrap_or(&self.preferences.visual);
        let spec = VisualSpec::parse_lossy(visual);
        for index in 0..self.screens.screens().len() {
            let visual = {
                let info = &self.backend.screens()[index];
                spec.resolve(&info.visuals, info.default_visual)
            };

            if self.screens.select_visual(&mut self.backend, index, visual, &self.preferences)? {
                info!("screen {index}: switched to visual {visual}");
            }
        }

        for screen in self.screens.screens() {
            match HackProcess::spawn(&program.command, screen.window, self.preferences.nice) {
                Ok(hack) => self.hacks.push(hack),
                Err(err) => warn!("unable to run {:?}: {err}", program.command),
            }
        }

        Ok(())
    }

    fn kill_hacks(&mut self) {
        for mut hack in self.hacks.drain(..) {
            debug!("stopping hack {:?} ({:?})", hack.command(), hack.pid());
            hack.terminate();
        }
    }

    /// Collect exited hacks.
    fn reap_hacks(&mut self) {
        self.hacks.retain_mut(|hack| match hack.try_reap() {
            Some(status) => {
                info!("hack {:?} exited: {status}", hack.command());
                false
            },
            None => true,
        });
    }

    /// Consume the event which ended an activity wait.
    fn swallow_activity(&mut self) -> Result<()> {
        if let Some(event) = self.backend.poll_event()? {
            if !event.is_user_activity() {
                self.handle_event(event);
            }
        }

        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Ask for the password.
    ///
    /// Returns `true` if the screen was unlocked.
    fn unlock(&mut self) -> Result<bool> {
        let mut authenticator = match self.authenticator.take() {
            Some(authenticator) => authenticator,
            None => {
                self.locked = false;
                return Ok(true);
            },
        };

        let result = self.run_dialog(authenticator.as_mut());
        self.authenticator = Some(authenticator);

        match result? {
            PasswdState::Ok => {
                self.locked = false;
                info!("screen unlocked");

                if let Some(warning) = self.failures.success() {
                    eprintln!("umbra: {warning}");
                }

                Ok(true)
            },
            PasswdState::Fail => {
                let count = self.failures.record();
                warn!("failed unlock attempt ({count} in a row)");
                auth::audit_failure(self.backend.display_name(), &self.user, count);
                Ok(false)
            },
            state => {
                debug!("password dialog closed: {state:?}");
                Ok(false)
            },
        }
    }

    /// Show the password dialog with every hack paused.
    fn run_dialog(&mut self, authenticator: &mut dyn Authenticator) -> Result<PasswdState> {
        for hack in &mut self.hacks {
            hack.suspend();
        }
        self.dialog_up = true;

        let result = self.password_loop(authenticator);

        let closed = self.backend.drain_key_events().and_then(|_| self.backend.close_dialog());
        self.dialog_up = false;
        for hack in &mut self.hacks {
            hack.resume();
        }

        let state = result?;
        closed?;

        for event in mem::take(&mut self.deferred) {
            self.handle_event(event);
        }

        Ok(state)
    }

    /// Read the password in a nested event loop.
    ///
    /// Only the dialog's countdown and the display connection are polled, so
    /// session timers cannot fire while the dialog is up.
    fn password_loop(&mut self, authenticator: &mut dyn Authenticator) -> Result<PasswdState> {
        let mut event_loop: EventLoop<'static, u32> = EventLoop::try_new().map_err(loop_error)?;
        let handle = event_loop.handle();

        let ticker = Timer::from_duration(TICK);
        handle
            .insert_source(ticker, |_, _, ticks| {
                *ticks += 1;
                TimeoutAction::ToDuration(TICK)
            })
            .map_err(|err| loop_error(err.error))?;

        if let Some(fd) = self.backend.connection_fd() {
            let source = Generic::new(fd, Interest::READ, Mode::Level);
            handle
                .insert_source(source, |_, _, _: &mut u32| Ok(PostAction::Continue))
                .map_err(|err| loop_error(err.error))?;
        }

        let mut dialog = PasswdDialog::new(self.preferences.passwd_timeout());
        self.backend.open_dialog(0)?;
        dialog.draw(&mut self.backend, &self.user)?;

        let mut ticks = 0;
        while !dialog.state().is_terminal() {
            while let Some(event) = self.backend.poll_event()? {
                match event {
                    DisplayEvent::KeyPress { key, .. } => match dialog.handle_key(key) {
                        KeyOutcome::Edited | KeyOutcome::Finished => {
                            dialog.draw(&mut self.backend, &self.user)?;
                        },
                        KeyOutcome::Bell => self.backend.bell()?,
                        KeyOutcome::Submit => {
                            dialog.draw(&mut self.backend, &self.user)?;
                            self.backend.flush()?;
                            dialog.submit(authenticator);
                            dialog.draw(&mut self.backend, &self.user)?;
                        },
                        KeyOutcome::Ignored => (),
                    },
                    DisplayEvent::Expose { .. } => dialog.draw(&mut self.backend, &self.user)?,
                    DisplayEvent::Command { window, message_type, data } => {
                        ipc_server::handle_command(self, window, message_type, data);
                    },
                    event if event.is_user_activity() => (),
                    event => self.deferred.push(event),
                }

                if dialog.state().is_terminal() {
                    break;
                }
            }

            if dialog.state().is_terminal() {
                break;
            }

            self.backend.flush()?;
            event_loop.dispatch(None, &mut ticks).map_err(loop_error)?;

            if ticks > 0 {
                for _ in 0..mem::take(&mut ticks) {
                    dialog.tick();
                }
                dialog.draw(&mut self.backend, &self.user)?;
            }
        }

        // Leave the final status up long enough to be read.
        let state = dialog.state();
        if state.message().map_or(false, |message| !message.is_empty()) {
            self.backend.flush()?;
            thread::sleep(FLASH_DURATION);
        }

        Ok(state)
    }

    /// Record an error raised inside an event loop callback.
    fn fail(&mut self, err: Error) {
        self.error.get_or_insert(err);
    }
}

/// Event loop driving a session.
pub struct Runner<B: DisplayServer + 'static> {
    event_loop: EventLoop<'static, Session<B>>,
    pub session: Session<B>,
}

impl<B: DisplayServer + 'static> Runner<B> {
    /// Set up the overlays and every activity source.
    pub fn new(
        mut backend: B,
        preferences: Preferences,
        config: Option<ConfigFile>,
    ) -> Result<Self> {
        let event_loop = EventLoop::try_new().map_err(loop_error)?;
        let handle = event_loop.handle();

        if !preferences.debug {
            windows::ensure_no_screensaver_running(&mut backend)?;
        }

        let user = auth::current_user();
        let identity = format!("{} ({user}@{})", process::id(), auth::host_name());
        let screens = Screens::new(&mut backend, &preferences, identity)?;

        // Wake up when the server sends data, events are read by the session.
        if let Some(fd) = backend.connection_fd() {
            let source = Generic::new(fd, Interest::READ, Mode::Level);
            handle
                .insert_source(source, |_, _, _: &mut Session<B>| Ok(PostAction::Continue))
                .map_err(|err| loop_error(err.error))?;
        }

        let signals = Signals::new(&[Signal::SIGCHLD]).map_err(loop_error)?;
        handle
            .insert_source(signals, |_, _, session| session.reap_hacks())
            .map_err(|err| loop_error(err.error))?;

        let idle_mode = IdleMode::new(preferences.idle_method, backend.has_idle_extension());
        info!("idle detection: {idle_mode:?}");

        let authenticator = auth::default_authenticator(&user);
        if authenticator.is_none() && preferences.lock {
            warn!("no authenticator available, the screen will not be locked");
        }

        let mut session = Session {
            idle: IdleTracker::new(preferences.timeout(), Instant::now()),
            programs: Programs::new(preferences.programs.clone()),
            timers: Timers::new(handle),
            rng: StdRng::from_entropy(),
            authenticator,
            preferences,
            idle_mode,
            backend,
            screens,
            config,
            user,
            wait: Wait::Idle,
            original_saver: Default::default(),
            failures: Default::default(),
            shutdown: Default::default(),
            dialog_up: Default::default(),
            deferred: Default::default(),
            demoing: Default::default(),
            pointer: Default::default(),
            locked: Default::default(),
            error: Default::default(),
            hacks: Default::default(),
            wake: Default::default(),
        };
        session.start()?;

        Ok(Self { event_loop, session })
    }

    /// Blank and unblank until shutdown is requested.
    pub fn run(&mut self) -> Result<Shutdown> {
        loop {
            let wake = self.wait_until(Wait::Idle)?;
            if let Some(shutdown) = self.session.shutdown_requested() {
                return Ok(shutdown);
            }

            let activation = match wake {
                Some(Wake::Activate(activation)) => activation,
                _ => continue,
            };
            self.session.activate(activation)?;

            loop {
                let wake = self.wait_until(Wait::Activity)?;
                if let Some(shutdown) = self.session.shutdown_requested() {
                    return Ok(shutdown);
                }

                self.session.swallow_activity()?;

                if wake == Some(Wake::Deactivate)
                    && (!self.session.locked() || self.session.unlock()?)
                {
                    break;
                }
            }

            self.session.deactivate()?;
        }
    }

    /// Dispatch events until the session requests a wake or shutdown.
    fn wait_until(&mut self, wait: Wait) -> Result<Option<Wake>> {
        let session = &mut self.session;
        session.wait = wait;
        session.wake = None;

        if wait == Wait::Idle {
            session.schedule_idle_timer();
        }

        let result = loop {
            if let Err(err) = session.process_display_events() {
                break Err(err);
            }

            if session.wake.is_some() || session.shutdown.is_some() {
                break Ok(());
            }

            if let Err(err) = session.backend.flush() {
                break Err(err);
            }

            if let Err(err) = self.event_loop.dispatch(None, session) {
                break Err(loop_error(err));
            }

            if let Some(err) = session.error.take() {
                break Err(err);
            }
        };

        if wait == Wait::Idle {
            session.timers.cancel(TimerKind::Idle);
        }

        result.map(|_| session.wake.take())
    }
}

fn loop_error(err: impl Display) -> Error {
    Error::EventLoop(err.to_string())
}
