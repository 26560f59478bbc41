//! In-memory display server for tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::os::fd::{OwnedFd, RawFd};
use std::time::Duration;

use umbra_ipc::{Atoms, Response};

use crate::auth::Authenticator;
use crate::backend::{
    Colormap, DialogView, DisplayEvent, DisplayServer, Lookup, PointerState, ScreenInfo,
    ServerSaver, Window,
};
use crate::error::Result;
use crate::visual::{VisualClass, VisualInfo};

/// Requests recorded by the mock.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Call {
    GrabServer,
    UngrabServer,
    CreateOverlay { screen: usize, window: Window },
    ResetOverlay(Window),
    Destroy(Window),
    MapRaised(Window),
    Unmap(Window),
    Clear(Window),
    CreateColormap(Colormap),
    FreeColormap(Colormap),
    InstallColormap(Colormap),
    GrabKeyboard(Window),
    GrabPointer(Window),
    UngrabKeyboard,
    UngrabPointer,
    SetVroot(Window, Window),
    DeleteVroot(Window),
    SelectEvents { window: Window, key_press: bool },
    SetIdentity(Window),
    SetTime(Window, u32),
    SetResponse(Window, Response),
    KillXsetroot(usize),
    FadeBegin,
    FadeStep(u32),
    FadeEnd,
    SetServerSaver(ServerSaver),
    ResetIdleTime,
    OpenDialog,
    DrawDialog { mask: String, message: Option<String> },
    CloseDialog,
    DrainKeys,
    Bell,
}

/// Scriptable display server.
pub struct MockBackend {
    pub screens: Vec<ScreenInfo>,
    pub atoms: Atoms,
    pub calls: Vec<Call>,
    pub children: HashMap<Window, Vec<Window>>,
    pub vanished: HashSet<Window>,
    pub key_listeners: HashSet<Window>,
    pub vroots: HashMap<Window, Window>,
    pub versions: HashMap<Window, String>,
    pub events: VecDeque<DisplayEvent>,
    pub keyboard_grabbable: bool,
    pub pointer_grabbable: bool,
    pub fade_supported: bool,
    pub idle_extension: bool,
    pub idle_time: Duration,
    pub pointer: PointerState,
    pub server_saver: ServerSaver,
    next_id: u32,
}

impl MockBackend {
    pub fn new(screen_count: usize) -> Self {
        let default_visual = VisualInfo {
            id: 0x21,
            class: VisualClass::TrueColor,
            depth: 24,
            colormap_entries: 256,
        };
        let screens = (0..screen_count)
            .map(|number| ScreenInfo {
                number,
                root: 0x10 + number as Window,
                width: 1920,
                height: 1080,
                default_visual,
                default_colormap: 0x20,
                visuals: vec![default_visual],
            })
            .collect();

        Self {
            screens,
            atoms: atoms(),
            keyboard_grabbable: true,
            pointer_grabbable: true,
            next_id: 0x1000,
            calls: Default::default(),
            children: Default::default(),
            vanished: Default::default(),
            key_listeners: Default::default(),
            vroots: Default::default(),
            versions: Default::default(),
            events: Default::default(),
            fade_supported: Default::default(),
            idle_extension: Default::default(),
            idle_time: Default::default(),
            pointer: Default::default(),
            server_saver: Default::default(),
        }
    }

    /// Number of recorded calls matching a predicate.
    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|call| predicate(call)).count()
    }

    /// Index of the first recorded call equal to `call`.
    pub fn position(&self, call: &Call) -> Option<usize> {
        self.calls.iter().position(|recorded| recorded == call)
    }

    /// Whether every server grab was released again.
    pub fn server_grabs_balanced(&self) -> bool {
        let mut depth = 0i32;
        for call in &self.calls {
            match call {
                Call::GrabServer => depth += 1,
                Call::UngrabServer => depth -= 1,
                _ => (),
            }
            if !(0..=1).contains(&depth) {
                return false;
            }
        }
        depth == 0
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn lookup<T>(&self, window: Window, value: impl FnOnce() -> T) -> Result<Lookup<T>> {
        if self.vanished.contains(&window) {
            Ok(Lookup::Vanished)
        } else {
            Ok(Lookup::Found(value()))
        }
    }
}

/// Atom table with arbitrary distinct ids.
pub fn atoms() -> Atoms {
    Atoms {
        SCREENSAVER: 100,
        _SCREENSAVER_ID: 101,
        _SCREENSAVER_VERSION: 102,
        _SCREENSAVER_TIME: 103,
        _SCREENSAVER_RESPONSE: 104,
        __SWM_VROOT: 105,
        _XSETROOT_ID: 106,
        ACTIVATE: 107,
        DEACTIVATE: 108,
        RESTART: 109,
        CYCLE: 110,
        NEXT: 111,
        PREV: 112,
        SELECT: 113,
        EXIT: 114,
        DEMO: 115,
        PREFS: 116,
        LOCK: 117,
    }
}

impl DisplayServer for MockBackend {
    fn display_name(&self) -> &str {
        ":0"
    }

    fn screens(&self) -> &[ScreenInfo] {
        &self.screens
    }

    fn atoms(&self) -> &Atoms {
        &self.atoms
    }

    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    fn connection_fd(&self) -> Option<OwnedFd> {
        None
    }

    fn poll_event(&mut self) -> Result<Option<DisplayEvent>> {
        Ok(self.events.pop_front())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn query_children(&mut self, window: Window) -> Result<Lookup<Vec<Window>>> {
        let children = self.children.get(&window).cloned().unwrap_or_default();
        self.lookup(window, || children)
    }

    fn key_press_interest(&mut self, window: Window) -> Result<Lookup<bool>> {
        let interest = self.key_listeners.contains(&window);
        self.lookup(window, || interest)
    }

    fn select_activity_events(&mut self, window: Window, key_press: bool) -> Result<Lookup<()>> {
        let lookup = self.lookup(window, || ())?;
        if lookup == Lookup::Found(()) {
            self.calls.push(Call::SelectEvents { window, key_press });
        }
        Ok(lookup)
    }

    fn vroot(&mut self, window: Window) -> Result<Lookup<Option<Window>>> {
        let value = self.vroots.get(&window).copied();
        self.lookup(window, || value)
    }

    fn set_vroot(&mut self, window: Window, value: Window) -> Result<()> {
        self.vroots.insert(window, value);
        self.calls.push(Call::SetVroot(window, value));
        Ok(())
    }

    fn delete_vroot(&mut self, window: Window) -> Result<()> {
        self.vroots.remove(&window);
        self.calls.push(Call::DeleteVroot(window));
        Ok(())
    }

    fn saver_version(&mut self, window: Window) -> Result<Lookup<Option<String>>> {
        let version = self.versions.get(&window).cloned();
        self.lookup(window, || version)
    }

    fn saver_identity(&mut self, window: Window) -> Result<Lookup<Option<String>>> {
        let identity = self.versions.get(&window).map(|_| String::from("42 (user@host)"));
        self.lookup(window, || identity)
    }

    fn set_identity(&mut self, window: Window, _version: &str, _identity: &str) -> Result<()> {
        self.calls.push(Call::SetIdentity(window));
        Ok(())
    }

    fn set_activity_time(&mut self, window: Window, time: u32) -> Result<()> {
        self.calls.push(Call::SetTime(window, time));
        Ok(())
    }

    fn set_response(&mut self, window: Window, response: &Response) -> Result<()> {
        self.calls.push(Call::SetResponse(window, response.clone()));
        Ok(())
    }

    fn kill_xsetroot_data(&mut self, screen: usize) -> Result<()> {
        self.calls.push(Call::KillXsetroot(screen));
        Ok(())
    }

    fn create_overlay(
        &mut self,
        screen: usize,
        _visual: &VisualInfo,
        _colormap: Colormap,
        _cursor_visible: bool,
    ) -> Result<Window> {
        let window = self.next_id();
        self.calls.push(Call::CreateOverlay { screen, window });
        Ok(window)
    }

    fn reset_overlay(&mut self, window: Window, _screen: usize) -> Result<()> {
        self.calls.push(Call::ResetOverlay(window));
        Ok(())
    }

    fn destroy_window(&mut self, window: Window) -> Result<()> {
        self.calls.push(Call::Destroy(window));
        Ok(())
    }

    fn map_raised(&mut self, window: Window) -> Result<()> {
        self.calls.push(Call::MapRaised(window));
        Ok(())
    }

    fn unmap(&mut self, window: Window) -> Result<()> {
        self.calls.push(Call::Unmap(window));
        Ok(())
    }

    fn clear(&mut self, window: Window) -> Result<()> {
        self.calls.push(Call::Clear(window));
        Ok(())
    }

    fn create_colormap(&mut self, _screen: usize, _visual: &VisualInfo) -> Result<Colormap> {
        let colormap = self.next_id();
        self.calls.push(Call::CreateColormap(colormap));
        Ok(colormap)
    }

    fn free_colormap(&mut self, colormap: Colormap) -> Result<()> {
        self.calls.push(Call::FreeColormap(colormap));
        Ok(())
    }

    fn install_colormap(&mut self, colormap: Colormap) -> Result<()> {
        self.calls.push(Call::InstallColormap(colormap));
        Ok(())
    }

    fn focus_colormap(&mut self) -> Result<Option<Colormap>> {
        Ok(None)
    }

    fn grab_keyboard(&mut self, window: Window) -> Result<bool> {
        self.calls.push(Call::GrabKeyboard(window));
        Ok(self.keyboard_grabbable)
    }

    fn grab_pointer(&mut self, window: Window) -> Result<bool> {
        self.calls.push(Call::GrabPointer(window));
        Ok(self.pointer_grabbable)
    }

    fn ungrab_keyboard(&mut self) -> Result<()> {
        self.calls.push(Call::UngrabKeyboard);
        Ok(())
    }

    fn ungrab_pointer(&mut self) -> Result<()> {
        self.calls.push(Call::UngrabPointer);
        Ok(())
    }

    fn grab_server(&mut self) -> Result<()> {
        self.calls.push(Call::GrabServer);
        Ok(())
    }

    fn ungrab_server(&mut self) -> Result<()> {
        self.calls.push(Call::UngrabServer);
        Ok(())
    }

    fn fade_begin(&mut self, _colormaps: &[Colormap]) -> Result<bool> {
        self.calls.push(Call::FadeBegin);
        Ok(self.fade_supported)
    }

    fn fade_step(&mut self, level: f32) -> Result<()> {
        self.calls.push(Call::FadeStep((level * 100.).round() as u32));
        Ok(())
    }

    fn fade_end(&mut self) -> Result<()> {
        self.calls.push(Call::FadeEnd);
        Ok(())
    }

    fn has_idle_extension(&self) -> bool {
        self.idle_extension
    }

    fn select_saver_notify(&mut self) -> Result<()> {
        Ok(())
    }

    fn query_idle_time(&mut self) -> Result<Duration> {
        Ok(self.idle_time)
    }

    fn reset_idle_time(&mut self) -> Result<()> {
        self.idle_time = Duration::ZERO;
        self.calls.push(Call::ResetIdleTime);
        Ok(())
    }

    fn query_pointer(&mut self, _screen: usize) -> Result<PointerState> {
        Ok(self.pointer)
    }

    fn server_saver(&mut self) -> Result<ServerSaver> {
        Ok(self.server_saver)
    }

    fn set_server_saver(&mut self, saver: ServerSaver) -> Result<()> {
        self.server_saver = saver;
        self.calls.push(Call::SetServerSaver(saver));
        Ok(())
    }

    fn open_dialog(&mut self, _screen: usize) -> Result<Window> {
        self.calls.push(Call::OpenDialog);
        Ok(self.next_id())
    }

    fn draw_dialog(&mut self, view: &DialogView<'_>) -> Result<()> {
        let message = view.message.map(String::from);
        self.calls.push(Call::DrawDialog { mask: view.mask.into(), message });
        Ok(())
    }

    fn close_dialog(&mut self) -> Result<()> {
        self.calls.push(Call::CloseDialog);
        Ok(())
    }

    fn drain_key_events(&mut self) -> Result<()> {
        self.events.retain(|event| !matches!(event, DisplayEvent::KeyPress { .. }));
        self.calls.push(Call::DrainKeys);
        Ok(())
    }

    fn bell(&mut self) -> Result<()> {
        self.calls.push(Call::Bell);
        Ok(())
    }
}

/// Authenticator accepting a single password.
pub struct StaticAuthenticator<S: AsRef<str>>(pub S);

impl<S: AsRef<str>> Authenticator for StaticAuthenticator<S> {
    fn validate(&mut self, password: &str) -> bool {
        password == self.0.as_ref()
    }
}
