//! Overlay windows and the blank/unblank transition.

use std::ops::{Deref, DerefMut};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};

use crate::backend::{Colormap, DisplayServer, Lookup, Window};
use crate::config::Preferences;
use crate::error::{Error, Result};
use crate::signals;
use crate::visual::{VisualInfo, VisualSpec};

/// Delay before retrying a failed input grab.
pub const GRAB_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Virtual root property hijacked from a window manager.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct VrootRecord {
    /// Window which carried the property.
    pub window: Window,
    /// Original property value.
    pub value: Window,
}

/// Overlay state of one screen.
#[derive(Debug)]
pub struct SaverScreen {
    pub number: usize,
    pub root: Window,
    pub window: Window,
    pub visual: VisualInfo,
    pub colormap: Colormap,
    default_colormap: Colormap,
    own_colormap: bool,
    real_vroot: Option<VrootRecord>,
}

impl SaverScreen {
    #[cfg(test)]
    pub fn real_vroot(&self) -> Option<VrootRecord> {
        self.real_vroot
    }
}

/// Input grabs held by the overlay.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct Grabs {
    pub keyboard: bool,
    pub pointer: bool,
}

/// Exclusive server access, released on drop.
pub struct ServerGrab<'a, B: DisplayServer> {
    backend: &'a mut B,
}

impl<'a, B: DisplayServer> ServerGrab<'a, B> {
    pub fn new(backend: &'a mut B) -> Result<Self> {
        backend.grab_server()?;
        Ok(Self { backend })
    }
}

impl<B: DisplayServer> Drop for ServerGrab<'_, B> {
    fn drop(&mut self) {
        if let Err(err) = self.backend.ungrab_server().and_then(|_| self.backend.flush()) {
            error!("unable to release server grab: {err}");
        }
    }
}

impl<B: DisplayServer> Deref for ServerGrab<'_, B> {
    type Target = B;

    fn deref(&self) -> &B {
        self.backend
    }
}

impl<B: DisplayServer> DerefMut for ServerGrab<'_, B> {
    fn deref_mut(&mut self) -> &mut B {
        self.backend
    }
}

/// All overlay windows.
#[derive(Debug)]
pub struct Screens {
    screens: Vec<SaverScreen>,
    identity: String,
    grabs: Grabs,
    blanked: bool,
    last_activity: Option<u32>,
    grab_retry: Duration,
}

impl Screens {
    /// Create an overlay window on every screen.
    pub fn new<B: DisplayServer>(
        backend: &mut B,
        preferences: &Preferences,
        identity: String,
    ) -> Result<Self> {
        let spec = VisualSpec::parse_lossy(&preferences.visual);
        let infos = backend.screens().to_vec();

        let mut screens = Vec::with_capacity(infos.len());
        for info in infos {
            let visual = spec.resolve(&info.visuals, info.default_visual);
            let (colormap, own_colormap) =
                overlay_colormap(backend, info.number, &visual, preferences.install_colormap)?;
            let window = backend
                .create_overlay(info.number, &visual, colormap, false)
                .map_err(|err| Error::Overlay { screen: info.number, reason: err.to_string() })?;
            backend.set_identity(window, env!("CARGO_PKG_VERSION"), &identity)?;

            debug!("screen {}: overlay 0x{window:x} using visual {visual}", info.number);

            screens.push(SaverScreen {
                number: info.number,
                root: info.root,
                default_colormap: info.default_colormap,
                window,
                visual,
                colormap,
                own_colormap,
                real_vroot: None,
            });
        }

        let mut screens = Self {
            screens,
            identity,
            grab_retry: GRAB_RETRY_DELAY,
            grabs: Default::default(),
            blanked: Default::default(),
            last_activity: Default::default(),
        };
        screens.store_activate_time(backend, false)?;

        Ok(screens)
    }

    pub fn blanked(&self) -> bool {
        self.blanked
    }

    pub fn grabs(&self) -> Grabs {
        self.grabs
    }

    pub fn screens(&self) -> &[SaverScreen] {
        &self.screens
    }

    /// Whether a window is one of the overlays.
    pub fn is_own(&self, window: Window) -> bool {
        self.screens.iter().any(|screen| screen.window == window)
    }

    /// Overlay of the first screen, which holds the input grabs.
    pub fn primary_window(&self) -> Option<Window> {
        self.screens.first().map(|screen| screen.window)
    }

    #[cfg(test)]
    pub fn set_grab_retry(&mut self, delay: Duration) {
        self.grab_retry = delay;
    }

    /// Remember the time of the latest user activity.
    pub fn note_activity(&mut self) {
        self.last_activity = Some(unix_time());
    }

    /// Blank every screen.
    ///
    /// Input grab failures are logged but do not prevent blanking.
    pub fn blank<B: DisplayServer>(
        &mut self,
        backend: &mut B,
        preferences: &Preferences,
        demo: bool,
    ) -> Result<Grabs> {
        {
            let mut grab = ServerGrab::new(backend)?;
            for index in 0..self.screens.len() {
                self.save_real_vroot(&mut *grab, index)?;
                let window = self.screens[index].window;
                grab.set_vroot(window, window)?;
            }
        }

        self.store_activate_time(backend, false)?;
        self.raise(backend, preferences, demo)?;

        self.grabs = self.grab_input(backend)?;
        if !self.grabs.keyboard || !self.grabs.pointer {
            error!("blanking without exclusive input: {:?}", self.grabs);
        }

        self.blanked = true;

        info!("screen blanked");

        Ok(self.grabs)
    }

    /// Restore the desktop.
    pub fn unblank<B: DisplayServer>(
        &mut self,
        backend: &mut B,
        preferences: &Preferences,
        demo: bool,
    ) -> Result<()> {
        self.store_activate_time(backend, true)?;

        if preferences.unfade && !demo {
            let colormaps = self.desktop_colormaps();
            let mut grab = ServerGrab::new(backend)?;
            let fading = grab.fade_begin(&colormaps)?;
            if fading {
                grab.fade_step(0.)?;
            }

            for screen in &self.screens {
                grab.unmap(screen.window)?;
            }

            if fading {
                fade(&mut *grab, false, preferences)?;
            }
            grab.fade_end()?;
        } else {
            for screen in &self.screens {
                backend.install_colormap(screen.default_colormap)?;
                backend.clear(screen.window)?;
                backend.unmap(screen.window)?;
            }
        }

        if let Some(colormap) = backend.focus_colormap()? {
            backend.install_colormap(colormap)?;
        }

        for screen in &self.screens {
            backend.kill_xsetroot_data(screen.number)?;
        }

        self.ungrab_input(backend)?;
        self.restore_real_vroot(backend)?;
        self.blanked = false;

        if let Err(err) = signals::remove() {
            warn!("unable to remove signal handlers: {err}");
        }

        info!("screen unblanked");

        Ok(())
    }

    /// Map and raise the overlays, fading out the desktop first.
    pub fn raise<B: DisplayServer>(
        &mut self,
        backend: &mut B,
        preferences: &Preferences,
        inhibit_fade: bool,
    ) -> Result<()> {
        for screen in &self.screens {
            backend.reset_overlay(screen.window, screen.number)?;
        }

        if preferences.fade && !inhibit_fade {
            let colormaps = self.desktop_colormaps();
            let mut grab = ServerGrab::new(backend)?;
            if grab.fade_begin(&colormaps)? {
                fade(&mut *grab, true, preferences)?;
            } else {
                debug!("colormap fading unsupported on this visual");
            }

            for screen in &self.screens {
                grab.map_raised(screen.window)?;
            }
            grab.fade_end()?;

            for screen in &self.screens {
                grab.install_colormap(screen.colormap)?;
            }
        } else {
            for screen in &self.screens {
                backend.map_raised(screen.window)?;
                backend.install_colormap(screen.colormap)?;
            }
        }

        Ok(())
    }

    /// Keep the overlays on top while blanked.
    ///
    /// Overlays without a hack drawing on them are cleared, and missing input
    /// grabs are attempted again.
    pub fn reassert<B: DisplayServer>(
        &mut self,
        backend: &mut B,
        hack_running: bool,
    ) -> Result<()> {
        if !self.blanked {
            return Ok(());
        }

        for screen in &self.screens {
            backend.map_raised(screen.window)?;
            if !hack_running {
                backend.clear(screen.window)?;
            }
        }

        let window = match self.primary_window() {
            Some(window) => window,
            None => return Ok(()),
        };

        if !self.grabs.keyboard {
            self.grabs.keyboard = backend.grab_keyboard(window)?;
        }
        if !self.grabs.pointer {
            self.grabs.pointer = backend.grab_pointer(window)?;
        }

        Ok(())
    }

    /// Announce the activation time on every overlay.
    ///
    /// With `use_last`, the time of the latest user activity is used if known.
    pub fn store_activate_time<B: DisplayServer>(
        &mut self,
        backend: &mut B,
        use_last: bool,
    ) -> Result<()> {
        let time = match self.last_activity {
            Some(time) if use_last => time,
            _ => unix_time(),
        };

        for screen in &self.screens {
            backend.set_activity_time(screen.window, time)?;
        }

        Ok(())
    }

    /// Remove the virtual root property of a screen, remembering its owner.
    fn save_real_vroot<B: DisplayServer>(&mut self, backend: &mut B, index: usize) -> Result<()> {
        let screen = &mut self.screens[index];
        let children = match backend.query_children(screen.root)? {
            Lookup::Found(children) => children,
            Lookup::Vanished => return Ok(()),
        };

        let mut record = None;
        for child in children.into_iter().filter(|child| *child != screen.window) {
            if let Lookup::Found(Some(value)) = backend.vroot(child)? {
                if record.is_some() {
                    return Err(Error::MultipleVroots { screen: screen.number });
                }
                record = Some(VrootRecord { window: child, value });
            }
        }

        if let Some(record) = record {
            debug!("screen {}: hijacking virtual root 0x{:x}", screen.number, record.window);
            if let Err(err) = signals::arm(index, screen.window, record.window, record.value) {
                warn!("unable to install signal handlers: {err}");
            }
            backend.delete_vroot(record.window)?;
            screen.real_vroot = Some(record);
        }

        Ok(())
    }

    /// Put back every hijacked virtual root property.
    ///
    /// Returns `false` if there was nothing to restore.
    pub fn restore_real_vroot<B: DisplayServer>(&mut self, backend: &mut B) -> Result<bool> {
        if self.screens.iter().all(|screen| screen.real_vroot.is_none()) {
            return Ok(false);
        }

        let mut grab = ServerGrab::new(backend)?;
        for (index, screen) in self.screens.iter_mut().enumerate() {
            let record = match screen.real_vroot.take() {
                Some(record) => record,
                None => continue,
            };

            grab.delete_vroot(screen.window)?;
            grab.set_vroot(record.window, record.value)?;
            signals::disarm(index);

            debug!("screen {}: restored virtual root 0x{:x}", screen.number, record.window);
        }
        grab.sync()?;

        Ok(true)
    }

    /// Switch a screen's overlay to a different visual.
    ///
    /// The replacement window is fully set up and holds the input grabs before
    /// the old window is destroyed. Returns `false` if the visual is in use
    /// already.
    pub fn select_visual<B: DisplayServer>(
        &mut self,
        backend: &mut B,
        index: usize,
        visual: VisualInfo,
        preferences: &Preferences,
    ) -> Result<bool> {
        let (old_window, old_colormap, old_own_colormap) = match self.screens.get(index) {
            Some(screen) if screen.visual == visual => return Ok(false),
            Some(screen) => (screen.window, screen.colormap, screen.own_colormap),
            None => return Ok(false),
        };

        let mut grab = ServerGrab::new(backend)?;

        let (colormap, own_colormap) =
            overlay_colormap(&mut *grab, index, &visual, preferences.install_colormap)?;
        let window = match grab.create_overlay(index, &visual, colormap, false) {
            Ok(window) => window,
            Err(err) => {
                if own_colormap {
                    grab.free_colormap(colormap)?;
                }
                return Err(Error::Overlay { screen: index, reason: err.to_string() });
            },
        };

        grab.set_identity(window, env!("CARGO_PKG_VERSION"), &self.identity)?;
        grab.reset_overlay(window, index)?;

        if self.blanked {
            grab.set_vroot(window, window)?;
            grab.map_raised(window)?;
            grab.install_colormap(colormap)?;

            // Move input grabs before the old window disappears.
            if index == 0 {
                if self.grabs.keyboard {
                    self.grabs.keyboard = grab.grab_keyboard(window)?;
                }
                if self.grabs.pointer {
                    self.grabs.pointer = grab.grab_pointer(window)?;
                }
            }
        }

        let screen = &mut self.screens[index];
        screen.window = window;
        screen.visual = visual;
        screen.colormap = colormap;
        screen.own_colormap = own_colormap;
        if let Some(record) = screen.real_vroot {
            if let Err(err) = signals::arm(index, window, record.window, record.value) {
                warn!("unable to install signal handlers: {err}");
            }
        }

        grab.destroy_window(old_window)?;
        if old_own_colormap {
            grab.free_colormap(old_colormap)?;
        }
        drop(grab);

        self.store_activate_time(backend, false)?;

        info!("screen {index}: switched to visual {visual}");

        Ok(true)
    }

    /// Release every server resource.
    pub fn destroy<B: DisplayServer>(&mut self, backend: &mut B) -> Result<()> {
        self.restore_real_vroot(backend)?;
        self.ungrab_input(backend)?;

        for screen in self.screens.drain(..) {
            backend.destroy_window(screen.window)?;
            if screen.own_colormap {
                backend.free_colormap(screen.colormap)?;
            }
        }
        backend.flush()
    }

    /// Grab keyboard and pointer on the primary overlay.
    fn grab_input<B: DisplayServer>(&mut self, backend: &mut B) -> Result<Grabs> {
        let window = match self.primary_window() {
            Some(window) => window,
            None => return Ok(Grabs::default()),
        };

        let keyboard = grab_with_retry(backend, B::grab_keyboard, window, self.grab_retry)?;
        if !keyboard {
            error!("unable to grab keyboard");
        }

        let pointer = grab_with_retry(backend, B::grab_pointer, window, self.grab_retry)?;
        if !pointer {
            error!("unable to grab pointer");
        }

        Ok(Grabs { keyboard, pointer })
    }

    fn ungrab_input<B: DisplayServer>(&mut self, backend: &mut B) -> Result<()> {
        backend.ungrab_keyboard()?;
        backend.ungrab_pointer()?;
        self.grabs = Grabs::default();
        Ok(())
    }

    /// Colormaps currently showing the desktop.
    fn desktop_colormaps(&self) -> Vec<Colormap> {
        self.screens.iter().map(|screen| screen.default_colormap).collect()
    }
}

/// Fail if another screen saver owns an overlay on any screen.
///
/// Windows destroyed while they are inspected are skipped.
pub fn ensure_no_screensaver_running<B: DisplayServer>(backend: &mut B) -> Result<()> {
    let roots: Vec<_> = backend.screens().iter().map(|screen| screen.root).collect();

    for root in roots {
        let children = match backend.query_children(root)? {
            Lookup::Found(children) => children,
            Lookup::Vanished => continue,
        };

        for window in children {
            if !matches!(backend.saver_version(window)?, Lookup::Found(Some(_))) {
                continue;
            }

            let identity = backend.saver_identity(window)?.found().flatten();
            return Err(Error::AlreadyRunning {
                display: backend.display_name().into(),
                identity: identity.unwrap_or_else(|| String::from("unknown")),
                window,
            });
        }
    }

    Ok(())
}

/// Attempt a grab, retrying once after `delay`.
fn grab_with_retry<B: DisplayServer>(
    backend: &mut B,
    grab: fn(&mut B, Window) -> Result<bool>,
    window: Window,
    delay: Duration,
) -> Result<bool> {
    if grab(backend, window)? {
        return Ok(true);
    }

    debug!("grab failed, retrying in {delay:?}");
    thread::sleep(delay);

    grab(backend, window)
}

/// Colormap for an overlay window, and whether it must be freed.
fn overlay_colormap<B: DisplayServer>(
    backend: &mut B,
    screen: usize,
    visual: &VisualInfo,
    install_colormap: bool,
) -> Result<(Colormap, bool)> {
    let info = &backend.screens()[screen];
    if !install_colormap && info.default_visual.id == visual.id {
        return Ok((info.default_colormap, false));
    }

    Ok((backend.create_colormap(screen, visual)?, true))
}

/// Step the fade colormaps through all brightness levels.
fn fade<B: DisplayServer>(backend: &mut B, out: bool, preferences: &Preferences) -> Result<()> {
    let ticks = preferences.fade_ticks.max(1);
    let delay = preferences.fade_duration() / ticks;

    for tick in 1..=ticks {
        let progress = tick as f32 / ticks as f32;
        backend.fade_step(if out { 1. - progress } else { progress })?;
        backend.flush()?;

        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }

    Ok(())
}

/// Seconds since the Unix epoch, truncated to 32 bits.
fn unix_time() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |time| time.as_secs() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, MockBackend};
    use crate::visual::VisualClass;

    fn preferences() -> Preferences {
        Preferences { fade: false, fade_seconds: 0, fade_ticks: 4, ..Default::default() }
    }

    fn screens(backend: &mut MockBackend, preferences: &Preferences) -> Screens {
        let identity = String::from("1 (user@host)");
        let mut screens = Screens::new(backend, preferences, identity).unwrap();
        screens.set_grab_retry(Duration::ZERO);
        screens
    }

    #[test]
    fn blank_maps_and_grabs() {
        let mut backend = MockBackend::new(2);
        let preferences = preferences();
        let mut screens = screens(&mut backend, &preferences);

        let grabs = screens.blank(&mut backend, &preferences, false).unwrap();

        assert_eq!(grabs, Grabs { keyboard: true, pointer: true });
        assert!(screens.blanked());
        for screen in screens.screens() {
            assert_eq!(backend.count(|call| *call == Call::MapRaised(screen.window)), 1);
            assert_eq!(backend.vroots.get(&screen.window), Some(&screen.window));
        }
        let primary = screens.primary_window().unwrap();
        assert!(backend.position(&Call::GrabKeyboard(primary)).is_some());
        assert!(backend.server_grabs_balanced());

        screens.unblank(&mut backend, &preferences, false).unwrap();
        assert!(!screens.blanked());
        assert_eq!(screens.grabs(), Grabs::default());
        assert_eq!(backend.count(|call| matches!(call, Call::Unmap(_))), 2);
        assert_eq!(backend.count(|call| matches!(call, Call::KillXsetroot(_))), 2);
        assert!(backend.server_grabs_balanced());
    }

    #[test]
    fn vroot_is_hijacked_and_restored_once() {
        let mut backend = MockBackend::new(1);
        backend.children.insert(0x10, vec![0x500, 0x600]);
        backend.vroots.insert(0x600, 0x601);

        let preferences = preferences();
        let mut screens = screens(&mut backend, &preferences);
        screens.blank(&mut backend, &preferences, false).unwrap();

        let record = VrootRecord { window: 0x600, value: 0x601 };
        assert_eq!(screens.screens()[0].real_vroot(), Some(record));
        assert_eq!(backend.vroots.get(&0x600), None);

        assert!(screens.restore_real_vroot(&mut backend).unwrap());
        assert!(!screens.restore_real_vroot(&mut backend).unwrap());

        assert_eq!(backend.vroots.get(&0x600), Some(&0x601));
        assert_eq!(backend.count(|call| *call == Call::SetVroot(0x600, 0x601)), 1);
        assert_eq!(screens.screens()[0].real_vroot(), None);
        assert!(backend.server_grabs_balanced());
    }

    #[test]
    fn multiple_vroots_are_fatal() {
        let mut backend = MockBackend::new(1);
        backend.children.insert(0x10, vec![0x500, 0x600]);
        backend.vroots.insert(0x500, 0x501);
        backend.vroots.insert(0x600, 0x601);

        let preferences = preferences();
        let mut screens = screens(&mut backend, &preferences);
        let result = screens.blank(&mut backend, &preferences, false);

        assert!(matches!(result, Err(Error::MultipleVroots { screen: 0 })));
        assert!(!screens.blanked());
        assert!(backend.server_grabs_balanced());
    }

    #[test]
    fn vanished_vroot_candidates_are_skipped() {
        let mut backend = MockBackend::new(1);
        backend.children.insert(0x10, vec![0x500, 0x600]);
        backend.vroots.insert(0x500, 0x501);
        backend.vroots.insert(0x600, 0x601);
        backend.vanished.insert(0x500);

        let preferences = preferences();
        let mut screens = screens(&mut backend, &preferences);
        screens.blank(&mut backend, &preferences, false).unwrap();

        let record = VrootRecord { window: 0x600, value: 0x601 };
        assert_eq!(screens.screens()[0].real_vroot(), Some(record));
    }

    #[test]
    fn failed_grabs_retry_once_and_continue() {
        let mut backend = MockBackend::new(1);
        backend.keyboard_grabbable = false;

        let preferences = preferences();
        let mut screens = screens(&mut backend, &preferences);
        let grabs = screens.blank(&mut backend, &preferences, false).unwrap();

        assert_eq!(grabs, Grabs { keyboard: false, pointer: true });
        assert!(screens.blanked());
        assert_eq!(backend.count(|call| matches!(call, Call::GrabKeyboard(_))), 2);
        assert_eq!(backend.count(|call| matches!(call, Call::GrabPointer(_))), 1);

        backend.keyboard_grabbable = true;
        screens.reassert(&mut backend, true).unwrap();
        assert!(screens.grabs().keyboard);
    }

    #[test]
    fn fade_runs_under_server_grab() {
        let mut backend = MockBackend::new(1);
        backend.fade_supported = true;

        let preferences = Preferences { fade: true, unfade: true, ..preferences() };
        let mut screens = screens(&mut backend, &preferences);
        screens.blank(&mut backend, &preferences, false).unwrap();

        let window = screens.primary_window().unwrap();
        let grab = backend.position(&Call::GrabServer).unwrap();
        let steps: Vec<_> = backend
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::FadeStep(level) => Some(*level),
                _ => None,
            })
            .collect();
        assert_eq!(steps, vec![75, 50, 25, 0]);

        let map = backend.position(&Call::MapRaised(window)).unwrap();
        let end = backend.position(&Call::FadeEnd).unwrap();
        assert!(grab < map && map < end);
        assert!(backend.server_grabs_balanced());

        backend.calls.clear();
        screens.unblank(&mut backend, &preferences, false).unwrap();
        let unmap = backend.position(&Call::Unmap(window)).unwrap();
        let first_step = backend.position(&Call::FadeStep(0)).unwrap();
        let last_step = backend.position(&Call::FadeStep(100)).unwrap();
        assert!(first_step < unmap && unmap < last_step);
        assert!(backend.server_grabs_balanced());
    }

    #[test]
    fn demo_skips_fade() {
        let mut backend = MockBackend::new(1);
        backend.fade_supported = true;

        let preferences = Preferences { fade: true, unfade: true, ..preferences() };
        let mut screens = screens(&mut backend, &preferences);
        screens.blank(&mut backend, &preferences, true).unwrap();
        screens.unblank(&mut backend, &preferences, true).unwrap();

        assert_eq!(backend.count(|call| matches!(call, Call::FadeBegin)), 0);
    }

    #[test]
    fn visual_switch_transfers_grabs_before_destroy() {
        let mut backend = MockBackend::new(1);
        let pseudo = VisualInfo {
            id: 0x22,
            class: VisualClass::PseudoColor,
            depth: 8,
            colormap_entries: 256,
        };
        backend.screens[0].visuals.push(pseudo);

        let preferences = Preferences { install_colormap: false, ..preferences() };
        let mut screens = screens(&mut backend, &preferences);
        screens.blank(&mut backend, &preferences, false).unwrap();
        let old = screens.primary_window().unwrap();
        backend.calls.clear();

        assert!(screens.select_visual(&mut backend, 0, pseudo, &preferences).unwrap());
        let new = screens.primary_window().unwrap();
        assert_ne!(old, new);

        let create = backend.position(&Call::CreateOverlay { screen: 0, window: new }).unwrap();
        let keyboard = backend.position(&Call::GrabKeyboard(new)).unwrap();
        let pointer = backend.position(&Call::GrabPointer(new)).unwrap();
        let destroy = backend.position(&Call::Destroy(old)).unwrap();
        assert!(create < keyboard && keyboard < destroy && pointer < destroy);
        assert_eq!(backend.calls.first(), Some(&Call::GrabServer));
        assert!(backend.server_grabs_balanced());
        assert_eq!(backend.vroots.get(&new), Some(&new));
        assert_eq!(screens.grabs(), Grabs { keyboard: true, pointer: true });

        // Same visual again is a no-op.
        assert!(!screens.select_visual(&mut backend, 0, pseudo, &preferences).unwrap());
    }

    #[test]
    fn running_saver_is_detected() {
        let mut backend = MockBackend::new(1);
        backend.children.insert(0x10, vec![0x500, 0x600, 0x700]);
        backend.vanished.insert(0x500);
        backend.versions.insert(0x500, String::from("4.0"));
        assert!(ensure_no_screensaver_running(&mut backend).is_ok());

        backend.versions.insert(0x700, String::from("5.0"));
        match ensure_no_screensaver_running(&mut backend) {
            Err(Error::AlreadyRunning { window, identity, .. }) => {
                assert_eq!(window, 0x700);
                assert_eq!(identity, "42 (user@host)");
            },
            result => panic!("expected running saver, got {result:?}"),
        }
    }
}
