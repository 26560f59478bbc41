//! Crash safety for the virtual root hijack.
//!
//! While the screen is blanked, fatal signals must restore the virtual root
//! property before the process dies. Signal handlers cannot reach the session,
//! so the required state is mirrored into static atomics and the restoring
//! requests are written directly to the display connection.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::{mem, panic, ptr};

use crate::backend::Window;

/// Maximum number of screens with crash-safe restoration.
pub const MAX_SCREENS: usize = 8;

/// Signals which terminate the process.
const FATAL_SIGNALS: [libc::c_int; 13] = [
    libc::SIGHUP,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGILL,
    libc::SIGTRAP,
    libc::SIGABRT,
    libc::SIGFPE,
    libc::SIGBUS,
    libc::SIGSEGV,
    libc::SIGSYS,
    libc::SIGTERM,
    libc::SIGXCPU,
    libc::SIGXFSZ,
];

/// X11 core protocol opcodes.
const CHANGE_PROPERTY: u8 = 18;
const DELETE_PROPERTY: u8 = 19;

/// Predefined `WINDOW` atom.
const WINDOW_ATOM: u32 = 33;

static CONNECTION_FD: AtomicI32 = AtomicI32::new(-1);
static VROOT_ATOM: AtomicU32 = AtomicU32::new(0);
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Hijacked virtual root of one screen.
struct Slot {
    armed: AtomicBool,
    overlay: AtomicU32,
    window: AtomicU32,
    value: AtomicU32,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: Slot = Slot {
    armed: AtomicBool::new(false),
    overlay: AtomicU32::new(0),
    window: AtomicU32::new(0),
    value: AtomicU32::new(0),
};

static SLOTS: [Slot; MAX_SCREENS] = [EMPTY_SLOT; MAX_SCREENS];

/// Register the display connection used for emergency restoration.
pub fn set_connection(fd: RawFd, vroot_atom: u32) {
    VROOT_ATOM.store(vroot_atom, Ordering::SeqCst);
    CONNECTION_FD.store(fd, Ordering::SeqCst);
}

/// Record a hijacked virtual root and install the fatal signal handlers.
///
/// Must be called before the property is removed from its owner.
pub fn arm(screen: usize, overlay: Window, window: Window, value: Window) -> io::Result<()> {
    if let Some(slot) = SLOTS.get(screen) {
        slot.armed.store(false, Ordering::SeqCst);
        slot.overlay.store(overlay, Ordering::SeqCst);
        slot.window.store(window, Ordering::SeqCst);
        slot.value.store(value, Ordering::SeqCst);
        slot.armed.store(true, Ordering::SeqCst);
    }

    install()
}

/// Forget a virtual root after it was restored.
pub fn disarm(screen: usize) {
    if let Some(slot) = SLOTS.get(screen) {
        slot.armed.store(false, Ordering::SeqCst);
    }
}

/// Install the fatal signal handlers.
///
/// Installing handlers which are already installed is a no-op.
fn install() -> io::Result<()> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    for signal in FATAL_SIGNALS {
        unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            action.sa_sigaction = handle_signal as usize;
            action.sa_flags = libc::SA_NODEFER | libc::SA_RESETHAND;
            libc::sigemptyset(&mut action.sa_mask);

            if libc::sigaction(signal, &action, ptr::null_mut()) == -1 {
                return Err(io::Error::last_os_error());
            }
        }
    }

    Ok(())
}

/// Restore the default disposition of all fatal signals.
///
/// Removing handlers which are not installed is a no-op.
pub fn remove() -> io::Result<()> {
    if !INSTALLED.swap(false, Ordering::SeqCst) {
        return Ok(());
    }

    for signal in FATAL_SIGNALS {
        unsafe {
            if libc::signal(signal, libc::SIG_DFL) == libc::SIG_ERR {
                return Err(io::Error::last_os_error());
            }
        }
    }

    Ok(())
}

/// Restore every armed virtual root.
///
/// This is async-signal-safe. Returns the number of restored screens.
pub fn emergency_restore() -> usize {
    (0..MAX_SCREENS).filter(|screen| restore_slot(*screen)).count()
}

/// Restore a single armed virtual root, disarming it.
fn restore_slot(screen: usize) -> bool {
    let slot = &SLOTS[screen];
    if !slot.armed.swap(false, Ordering::SeqCst) {
        return false;
    }

    let fd = CONNECTION_FD.load(Ordering::SeqCst);
    let atom = VROOT_ATOM.load(Ordering::SeqCst);
    if fd < 0 {
        return false;
    }

    let overlay = slot.overlay.load(Ordering::SeqCst);
    let window = slot.window.load(Ordering::SeqCst);
    let value = slot.value.load(Ordering::SeqCst);

    write_all(fd, &delete_property_request(overlay, atom))
        && write_all(fd, &change_property_request(window, atom, value))
}

/// Install a panic hook performing the same restoration as signals.
pub fn install_panic_hook() {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        if emergency_restore() > 0 {
            write_stderr(b"umbra: panic, vroot restored.\n");
        }
        default_hook(info);
    }));
}

extern "C" fn handle_signal(signal: libc::c_int) {
    unsafe { libc::signal(signal, libc::SIG_DFL) };

    if emergency_restore() > 0 {
        write_stderr(b"umbra: ");
        write_stderr(signal_name(signal).as_bytes());
        write_stderr(b" intercepted, vroot restored.\n");
    }

    // Die with the original signal, preserving core dumps.
    unsafe { libc::raise(signal) };
}

/// Human-readable signal name.
pub fn signal_name(signal: libc::c_int) -> &'static str {
    match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGFPE => "SIGFPE",
        libc::SIGBUS => "SIGBUS",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGSYS => "SIGSYS",
        libc::SIGTERM => "SIGTERM",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        _ => "signal",
    }
}

/// Encode an X11 `DeleteProperty` request.
fn delete_property_request(window: Window, property: u32) -> [u8; 12] {
    let mut request = [0; 12];
    request[0] = DELETE_PROPERTY;
    request[2..4].copy_from_slice(&3u16.to_ne_bytes());
    request[4..8].copy_from_slice(&window.to_ne_bytes());
    request[8..12].copy_from_slice(&property.to_ne_bytes());
    request
}

/// Encode an X11 `ChangeProperty` request replacing a single `WINDOW` value.
fn change_property_request(window: Window, property: u32, value: Window) -> [u8; 28] {
    let mut request = [0; 28];
    request[0] = CHANGE_PROPERTY;
    request[2..4].copy_from_slice(&7u16.to_ne_bytes());
    request[4..8].copy_from_slice(&window.to_ne_bytes());
    request[8..12].copy_from_slice(&property.to_ne_bytes());
    request[12..16].copy_from_slice(&WINDOW_ATOM.to_ne_bytes());
    request[16] = 32;
    request[20..24].copy_from_slice(&1u32.to_ne_bytes());
    request[24..28].copy_from_slice(&value.to_ne_bytes());
    request
}

fn write_stderr(bytes: &[u8]) {
    write_all(libc::STDERR_FILENO, bytes);
}

/// Write a buffer without allocating.
fn write_all(fd: RawFd, mut bytes: &[u8]) -> bool {
    while !bytes.is_empty() {
        let written = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if written < 0 {
            if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return false;
        }
        bytes = &bytes[written as usize..];
    }
    true
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Read;
    use std::os::fd::FromRawFd;

    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }, 0);
        (fds[0], fds[1])
    }

    /// Forget state inherited from concurrently running tests.
    fn reset_globals() {
        INSTALLED.store(true, Ordering::SeqCst);
        let _ = remove();
        (0..MAX_SCREENS).for_each(disarm);
        set_connection(-1, 0);
    }

    /// Run a check in a forked child, isolated from the global state of other
    /// tests.
    fn in_child(check: impl FnOnce() -> bool) -> bool {
        match unsafe { libc::fork() } {
            -1 => panic!("fork failed"),
            0 => {
                reset_globals();
                let status = if check() { 0 } else { 1 };
                unsafe { libc::_exit(status) }
            },
            child => {
                let mut status = 0;
                assert_eq!(unsafe { libc::waitpid(child, &mut status, 0) }, child);
                libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0
            },
        }
    }

    fn handler_installed(signal: libc::c_int) -> bool {
        unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            libc::sigaction(signal, ptr::null(), &mut action) == 0
                && action.sa_sigaction == handle_signal as usize
        }
    }

    #[test]
    fn request_encoding() {
        let delete = delete_property_request(0x200, 105);
        assert_eq!(delete[0], DELETE_PROPERTY);
        assert_eq!(u16::from_ne_bytes([delete[2], delete[3]]), 3);

        let change = change_property_request(0x300, 105, 0x400);
        assert_eq!(change[0], CHANGE_PROPERTY);
        assert_eq!(u16::from_ne_bytes([change[2], change[3]]) as usize * 4, change.len());
        assert_eq!(change[16], 32);
        assert_eq!(change[24..28], 0x400u32.to_ne_bytes());
    }

    #[test]
    fn fatal_signal_restores_vroot() {
        let (read_fd, write_fd) = pipe();

        match unsafe { libc::fork() } {
            -1 => panic!("fork failed"),
            0 => unsafe {
                libc::close(read_fd);

                reset_globals();

                set_connection(write_fd, 105);
                if arm(0, 0x200, 0x300, 0x400).is_err() {
                    libc::_exit(2);
                }
                libc::raise(libc::SIGTERM);
                libc::_exit(1);
            },
            child => {
                unsafe { libc::close(write_fd) };

                let mut requests = Vec::new();
                let mut pipe = unsafe { File::from_raw_fd(read_fd) };
                pipe.read_to_end(&mut requests).unwrap();

                let mut status = 0;
                assert_eq!(unsafe { libc::waitpid(child, &mut status, 0) }, child);
                assert!(libc::WIFSIGNALED(status));
                assert_eq!(libc::WTERMSIG(status), libc::SIGTERM);

                assert_eq!(requests.len(), 40);
                assert_eq!(requests[..12], delete_property_request(0x200, 105));
                assert_eq!(requests[12..], change_property_request(0x300, 105, 0x400));
            },
        }
    }

    #[test]
    fn restore_happens_once() {
        let (read_fd, write_fd) = pipe();
        let screen = MAX_SCREENS - 1;

        let restored_once = in_child(|| {
            set_connection(write_fd, 105);
            if arm(screen, 0x200, 0x300, 0x400).is_err() {
                return false;
            }
            let first = restore_slot(screen);
            let second = restore_slot(screen);

            let mut requests = [0u8; 64];
            let read = unsafe { libc::read(read_fd, requests.as_mut_ptr().cast(), 64) };
            first && !second && read == 40
        });

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
        assert!(restored_once);
    }

    #[test]
    fn arming_installs_handlers() {
        let installed = in_child(|| {
            if handler_installed(libc::SIGTERM) || arm(0, 0x200, 0x300, 0x400).is_err() {
                return false;
            }
            let armed = FATAL_SIGNALS.iter().all(|signal| handler_installed(*signal));

            disarm(0);
            let removed = remove().is_ok() && !handler_installed(libc::SIGTERM);

            armed && removed
        });

        assert!(installed);
    }
}
