//! Graphics hack subprocesses.

use std::io;
use std::mem::MaybeUninit;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use std::{ptr, thread};

use rand::Rng;
use tracing::{debug, warn};

use crate::backend::Window;
use crate::config::Program;

/// Shell used for running hack command lines.
const SHELL: &str = "/bin/sh";

/// Time a hack gets to exit after being asked to terminate.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Interval for checking whether a terminated hack has exited.
const REAP_INTERVAL: Duration = Duration::from_millis(10);

/// Hack selection request.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Selection {
    /// Any hack except the current one.
    Random,
    Next,
    Prev,
    /// One-based index into the program list.
    Index(usize),
}

/// Configured hacks and the currently running one.
#[derive(Default, Debug)]
pub struct Programs {
    programs: Vec<Program>,
    current: Option<usize>,
}

impl Programs {
    pub fn new(programs: Vec<Program>) -> Self {
        Self { programs, current: None }
    }

    /// Replace the program list after a configuration reload.
    pub fn update(&mut self, programs: Vec<Program>) {
        if self.current.map_or(false, |current| current >= programs.len()) {
            self.current = None;
        }
        self.programs = programs;
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    #[cfg(test)]
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Pick the next hack to run.
    pub fn select(&mut self, selection: Selection, rng: &mut impl Rng) -> Option<&Program> {
        let len = self.programs.len();
        if len == 0 {
            return None;
        }

        let index = match (selection, self.current) {
            (Selection::Random, _) if len == 1 => 0,
            (Selection::Random, Some(current)) => (current + rng.gen_range(1..len)) % len,
            (Selection::Random, None) => rng.gen_range(0..len),
            (Selection::Next, Some(current)) => (current + 1) % len,
            (Selection::Next, None) => 0,
            (Selection::Prev, Some(current)) => (current + len - 1) % len,
            (Selection::Prev, None) => len - 1,
            (Selection::Index(index), _) if (1..=len).contains(&index) => index - 1,
            (Selection::Index(_), _) => return None,
        };

        self.current = Some(index);
        self.programs.get(index)
    }
}

/// Running graphics hack.
///
/// The hack runs in its own process group, so signals reach every process it
/// spawned. Dropping the handle terminates the hack.
#[derive(Debug)]
pub struct HackProcess {
    child: Option<Child>,
    command: String,
    suspended: bool,
}

impl HackProcess {
    /// Run a hack command line drawing on `window`.
    pub fn spawn(command: &str, window: Window, nice: i32) -> io::Result<Self> {
        let mut process = Command::new(SHELL);
        process.arg("-c").arg(command);
        process.env("XSCREENSAVER_WINDOW", format!("0x{window:x}"));
        process.stdin(Stdio::null());

        unsafe {
            process.pre_exec(move || {
                if libc::setpgid(0, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }

                reset_signal_mask();

                // Failure to lower the priority is not worth aborting for.
                if nice != 0 {
                    libc::nice(nice);
                }

                Ok(())
            });
        }

        let child = process.spawn()?;
        debug!("spawned hack {} ({command:?})", child.id());

        Ok(Self { child: Some(child), command: command.into(), suspended: false })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|child| child.id())
    }

    #[cfg(test)]
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Pause the hack.
    pub fn suspend(&mut self) {
        if !self.suspended && self.signal(libc::SIGSTOP) {
            self.suspended = true;
        }
    }

    /// Continue a paused hack.
    pub fn resume(&mut self) {
        if self.suspended {
            self.signal(libc::SIGCONT);
            self.suspended = false;
        }
    }

    /// Collect the exit status if the hack has exited.
    pub fn try_reap(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("hack {} exited: {status}", child.id());
                self.child = None;
                Some(status)
            },
            Ok(None) => None,
            Err(err) => {
                warn!("unable to check hack status: {err}");
                None
            },
        }
    }

    /// Stop the hack, escalating to `SIGKILL` if it does not exit in time.
    pub fn terminate(&mut self) {
        if self.try_reap().is_some() || self.child.is_none() {
            return;
        }

        self.signal(libc::SIGTERM);
        if self.suspended {
            self.signal(libc::SIGCONT);
            self.suspended = false;
        }

        let deadline = Instant::now() + KILL_GRACE;
        while Instant::now() < deadline {
            if self.try_reap().is_some() {
                return;
            }
            thread::sleep(REAP_INTERVAL);
        }

        self.signal(libc::SIGKILL);
        if let Some(mut child) = self.child.take() {
            warn!("hack {} did not exit, killed it", child.id());
            let _ = child.wait();
        }
    }

    /// Send a signal to the hack's process group.
    fn signal(&self, signal: libc::c_int) -> bool {
        let pid = match self.child.as_ref() {
            Some(child) => child.id() as libc::pid_t,
            None => return false,
        };

        // The group might not exist yet if the child has not called `setpgid`.
        let result = unsafe {
            match libc::kill(-pid, signal) {
                -1 => libc::kill(pid, signal),
                result => result,
            }
        };

        result == 0
    }
}

impl Drop for HackProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Spawn an unsupervised shell command.
///
/// This double-forks to avoid zombies, so the command's output and status are
/// not available.
pub fn spawn_detached(command: &str) -> io::Result<()> {
    let mut process = Command::new(SHELL);
    process.arg("-c").arg(command);
    process.stdin(Stdio::null());
    process.stdout(Stdio::null());
    process.stderr(Stdio::null());

    unsafe {
        process.pre_exec(|| {
            match libc::fork() {
                -1 => return Err(io::Error::last_os_error()),
                0 => (),
                _ => libc::_exit(0),
            }

            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }

            reset_signal_mask();

            Ok(())
        });
    }

    process.spawn()?.wait()?;

    Ok(())
}

/// Unblock all signals inherited from the daemon.
unsafe fn reset_signal_mask() {
    let mut signal_set = MaybeUninit::uninit();
    libc::sigemptyset(signal_set.as_mut_ptr());
    libc::sigprocmask(libc::SIG_SETMASK, signal_set.as_mut_ptr(), ptr::null_mut());
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn programs(count: usize) -> Programs {
        let programs = (0..count)
            .map(|i| Program { command: format!("hack{i}"), visual: None })
            .collect();
        Programs::new(programs)
    }

    fn wait_for_exit(hack: &mut HackProcess) -> ExitStatus {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(status) = hack.try_reap() {
                return status;
            }
            thread::sleep(REAP_INTERVAL);
        }
        panic!("hack did not exit");
    }

    #[test]
    fn next_and_prev_wrap() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut programs = programs(3);

        assert_eq!(programs.select(Selection::Prev, &mut rng).unwrap().command, "hack2");
        assert_eq!(programs.select(Selection::Next, &mut rng).unwrap().command, "hack0");
        assert_eq!(programs.select(Selection::Prev, &mut rng).unwrap().command, "hack2");
        assert_eq!(programs.current(), Some(2));
    }

    #[test]
    fn index_is_one_based() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut programs = programs(3);

        assert_eq!(programs.select(Selection::Index(1), &mut rng).unwrap().command, "hack0");
        assert!(programs.select(Selection::Index(0), &mut rng).is_none());
        assert!(programs.select(Selection::Index(4), &mut rng).is_none());
        assert_eq!(programs.current(), Some(0));
    }

    #[test]
    fn random_never_repeats() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut programs = programs(4);

        let mut last = programs.select(Selection::Random, &mut rng).unwrap().command.clone();
        for _ in 0..100 {
            let next = programs.select(Selection::Random, &mut rng).unwrap().command.clone();
            assert_ne!(next, last);
            last = next;
        }
    }

    #[test]
    fn empty_list_selects_nothing() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(programs(0).select(Selection::Random, &mut rng).is_none());
    }

    #[test]
    fn reload_resets_stale_index() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut programs = programs(3);
        programs.select(Selection::Index(3), &mut rng);
        programs.update(vec![Program { command: String::from("only"), visual: None }]);
        assert_eq!(programs.current(), None);
    }

    #[test]
    fn window_is_exported() {
        let command = r#"test "$XSCREENSAVER_WINDOW" = 0x2a"#;
        let mut hack = HackProcess::spawn(command, 0x2a, 0).unwrap();
        assert!(wait_for_exit(&mut hack).success());
    }

    #[test]
    fn terminate_stops_suspended_hack() {
        let mut hack = HackProcess::spawn("sleep 30", 1, 0).unwrap();
        hack.suspend();
        assert!(hack.is_suspended());

        let start = Instant::now();
        hack.terminate();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(hack.pid(), None);
    }
}
