//! Display server abstraction.

use std::os::fd::{OwnedFd, RawFd};
use std::time::Duration;

use umbra_ipc::{Atoms, Response};
pub use x11rb::protocol::xproto::{Atom, Colormap, Window};

use crate::error::Result;
use crate::visual::VisualInfo;

/// Result of a lookup racing against window destruction.
///
/// Windows owned by other clients can disappear at any point, so a missing
/// window is an expected outcome rather than an error.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Lookup<T> {
    Found(T),
    Vanished,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            Self::Vanished => None,
        }
    }
}

/// Static screen description.
#[derive(Clone, Debug)]
pub struct ScreenInfo {
    pub number: usize,
    pub root: Window,
    pub width: u16,
    pub height: u16,
    pub default_visual: VisualInfo,
    pub default_colormap: Colormap,
    pub visuals: Vec<VisualInfo>,
}

/// Pointer position and button state.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct PointerState {
    pub root_x: i16,
    pub root_y: i16,
    pub child: Window,
    pub mask: u16,
}

/// The display server's built-in screen saver settings.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct ServerSaver {
    pub timeout: i16,
    pub interval: i16,
    pub prefer_blanking: bool,
    pub allow_exposures: bool,
}

/// Password dialog key input.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Key {
    Char(char),
    Backspace,
    KillLine,
    Enter,
    Escape,
    Other,
}

/// Display server events relevant to the daemon.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DisplayEvent {
    KeyPress { window: Window, key: Key },
    KeyRelease,
    ButtonPress,
    ButtonRelease,
    Motion,
    Expose { window: Window },
    WindowCreated { window: Window },
    Command { window: Window, message_type: Atom, data: [u32; 5] },
    SaverNotify { active: bool },
    Other,
}

impl DisplayEvent {
    /// Whether this event was caused by the user touching an input device.
    pub fn is_user_activity(&self) -> bool {
        matches!(
            self,
            Self::KeyPress { .. }
                | Self::KeyRelease
                | Self::ButtonPress
                | Self::ButtonRelease
                | Self::Motion
        )
    }
}

/// Content of the password dialog.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct DialogView<'a> {
    pub user: &'a str,
    pub mask: &'a str,
    pub caret: u8,
    pub ratio: f32,
    pub message: Option<&'a str>,
}

/// Requests the daemon issues to the display server.
pub trait DisplayServer {
    /// Name of the display this connection was opened on.
    fn display_name(&self) -> &str;

    fn screens(&self) -> &[ScreenInfo];

    fn atoms(&self) -> &Atoms;

    /// Connection file descriptor for the signal handler.
    fn raw_fd(&self) -> Option<RawFd>;

    /// Duplicated connection file descriptor for readiness polling.
    fn connection_fd(&self) -> Option<OwnedFd>;

    /// Next queued event, without blocking.
    ///
    /// Protocol errors on windows which have been destroyed are swallowed,
    /// every other protocol error is returned.
    fn poll_event(&mut self) -> Result<Option<DisplayEvent>>;

    fn flush(&mut self) -> Result<()>;

    /// Wait until the server has processed every request.
    fn sync(&mut self) -> Result<()>;

    fn query_children(&mut self, window: Window) -> Result<Lookup<Vec<Window>>>;

    /// Whether any client selects, or blocks propagation of, key presses on a
    /// foreign window.
    fn key_press_interest(&mut self, window: Window) -> Result<Lookup<bool>>;

    /// Subscribe to window creation on a foreign window.
    ///
    /// Key presses are only selected with `key_press`, since our selection
    /// stops their propagation to ancestor windows.
    fn select_activity_events(&mut self, window: Window, key_press: bool) -> Result<Lookup<()>>;

    fn vroot(&mut self, window: Window) -> Result<Lookup<Option<Window>>>;

    fn set_vroot(&mut self, window: Window, value: Window) -> Result<()>;

    fn delete_vroot(&mut self, window: Window) -> Result<()>;

    /// Version advertised by a screen saver overlay window.
    fn saver_version(&mut self, window: Window) -> Result<Lookup<Option<String>>>;

    /// Process identity advertised by a screen saver overlay window.
    fn saver_identity(&mut self, window: Window) -> Result<Lookup<Option<String>>>;

    fn set_identity(&mut self, window: Window, version: &str, identity: &str) -> Result<()>;

    fn set_activity_time(&mut self, window: Window, time: u32) -> Result<()>;

    fn set_response(&mut self, window: Window, response: &Response) -> Result<()>;

    /// Free the colors held by a previous `xsetroot` invocation.
    fn kill_xsetroot_data(&mut self, screen: usize) -> Result<()>;

    fn create_overlay(
        &mut self,
        screen: usize,
        visual: &VisualInfo,
        colormap: Colormap,
        cursor_visible: bool,
    ) -> Result<Window>;

    /// Resize an existing overlay to cover its screen again.
    fn reset_overlay(&mut self, window: Window, screen: usize) -> Result<()>;

    fn destroy_window(&mut self, window: Window) -> Result<()>;

    fn map_raised(&mut self, window: Window) -> Result<()>;

    fn unmap(&mut self, window: Window) -> Result<()>;

    fn clear(&mut self, window: Window) -> Result<()>;

    fn create_colormap(&mut self, screen: usize, visual: &VisualInfo) -> Result<Colormap>;

    fn free_colormap(&mut self, colormap: Colormap) -> Result<()>;

    fn install_colormap(&mut self, colormap: Colormap) -> Result<()>;

    /// Colormap of the window holding the input focus.
    fn focus_colormap(&mut self) -> Result<Option<Colormap>>;

    fn grab_keyboard(&mut self, window: Window) -> Result<bool>;

    fn grab_pointer(&mut self, window: Window) -> Result<bool>;

    fn ungrab_keyboard(&mut self) -> Result<()>;

    fn ungrab_pointer(&mut self) -> Result<()>;

    fn grab_server(&mut self) -> Result<()>;

    fn ungrab_server(&mut self) -> Result<()>;

    /// Prepare fading through the given per-screen colormaps.
    ///
    /// Returns `false` when the visuals in use do not support fading.
    fn fade_begin(&mut self, colormaps: &[Colormap]) -> Result<bool>;

    /// Scale all colors to a brightness between `0.0` and `1.0`.
    fn fade_step(&mut self, level: f32) -> Result<()>;

    fn fade_end(&mut self) -> Result<()>;

    fn has_idle_extension(&self) -> bool;

    /// Subscribe to the server's screen saver activation notifications.
    fn select_saver_notify(&mut self) -> Result<()>;

    fn query_idle_time(&mut self) -> Result<Duration>;

    /// Restart the server's inactivity counter.
    fn reset_idle_time(&mut self) -> Result<()>;

    fn query_pointer(&mut self, screen: usize) -> Result<PointerState>;

    fn server_saver(&mut self) -> Result<ServerSaver>;

    fn set_server_saver(&mut self, saver: ServerSaver) -> Result<()>;

    fn open_dialog(&mut self, screen: usize) -> Result<Window>;

    fn draw_dialog(&mut self, view: &DialogView<'_>) -> Result<()>;

    fn close_dialog(&mut self) -> Result<()>;

    /// Discard all queued key events.
    fn drain_key_events(&mut self) -> Result<()>;

    fn bell(&mut self) -> Result<()>;
}
