//! X11 display server connection.

use std::collections::{HashMap, VecDeque};
use std::env;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::time::Duration;

use tracing::{debug, warn};
use umbra_ipc::{Atoms, Response};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::errors::ReplyError;
use x11rb::protocol::screensaver::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{
    self, AtomEnum, BackingStore, Blanking, ChangeWindowAttributesAux, ColorFlag, Coloritem,
    ColormapAlloc, ConfigureWindowAux, ConnectionExt as _, CreateGCAux, CreateWindowAux, Cursor,
    EventMask, Exposures, Font, Gcontext, GrabMode, GrabStatus, KeyButMask, Pixmap, PropMode,
    Rectangle, Screen, ScreenSaver, StackMode, WindowClass,
};
use x11rb::protocol::{ErrorKind, Event};
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;
use x11rb::{CURRENT_TIME, NONE};

use crate::backend::{
    Colormap, DialogView, DisplayEvent, DisplayServer, Key, Lookup, PointerState, ScreenInfo,
    ServerSaver, Window,
};
use crate::error::{Error, Result};
use crate::visual::{VisualClass, VisualInfo};

/// Maximum property length read, in 32-bit units.
const PROPERTY_LENGTH: u32 = 1024;

/// Password dialog size.
const DIALOG_WIDTH: u16 = 420;
const DIALOG_HEIGHT: u16 = 170;

/// Padding between dialog border and content.
const DIALOG_MARGIN: i16 = 20;

/// Vertical distance between dialog text lines.
const LINE_HEIGHT: i16 = 18;

/// Width of the password timeout thermometer.
const THERMOMETER_WIDTH: u16 = 12;

/// Core font used for the dialog.
const DIALOG_FONT: &[u8] = b"fixed";

/// Characters of the spinning input caret.
const CARET: [char; 4] = ['|', '/', '-', '\\'];

/// Keysyms with special meaning in the password dialog.
const XK_BACKSPACE: u32 = 0xff08;
const XK_LINEFEED: u32 = 0xff0a;
const XK_RETURN: u32 = 0xff0d;
const XK_ESCAPE: u32 = 0xff1b;
const XK_KP_ENTER: u32 = 0xff8d;
const XK_DELETE: u32 = 0xffff;

/// Offset of keysyms which directly encode a Unicode code point.
const UNICODE_KEYSYM_OFFSET: u32 = 0x0100_0000;

/// Connection to an X server.
pub struct X11Backend {
    conn: RustConnection,
    display: String,
    atoms: Atoms,
    screens: Vec<ScreenInfo>,
    overlays: HashMap<usize, Window>,
    pending: VecDeque<DisplayEvent>,
    idle_extension: bool,
    keymap: Keymap,
    cursor: Option<Cursor>,
    fade: Vec<FadeMap>,
    dialog: Option<Dialog>,
}

impl X11Backend {
    /// Connect to `display`, or `$DISPLAY` if none is given.
    pub fn connect(display: Option<&str>) -> Result<Self> {
        let name = display
            .map(String::from)
            .or_else(|| env::var("DISPLAY").ok())
            .unwrap_or_default();

        let (conn, _) = RustConnection::connect(display)
            .map_err(|source| Error::OpenDisplay { display: name.clone(), source })?;

        let atoms = Atoms::new(&conn)?.reply()?;
        let screens =
            conn.setup().roots.iter().enumerate().map(|(i, s)| screen_info(i, s)).collect();
        let idle_extension = conn.extension_information(screensaver::X11_EXTENSION_NAME)?.is_some();
        let keymap = Keymap::load(&conn)?;

        debug!("connected to display {name:?} (idle extension: {idle_extension})");

        Ok(Self {
            conn,
            atoms,
            screens,
            keymap,
            idle_extension,
            display: name,
            overlays: Default::default(),
            pending: Default::default(),
            cursor: Default::default(),
            fade: Default::default(),
            dialog: Default::default(),
        })
    }

    fn root(&self, screen: usize) -> Window {
        self.screens.get(screen).map_or(NONE, |screen| screen.root)
    }

    fn setup_screen(&self, screen: usize) -> Option<&Screen> {
        self.conn.setup().roots.get(screen)
    }

    /// Convert a protocol event, skipping errors caused by destroyed windows.
    fn convert_event(&mut self, event: Event) -> Result<Option<DisplayEvent>> {
        let event = match event {
            Event::KeyPress(event) => {
                let key = self.keymap.key(event.detail, u16::from(event.state));
                DisplayEvent::KeyPress { window: event.event, key }
            },
            Event::KeyRelease(_) => DisplayEvent::KeyRelease,
            Event::ButtonPress(_) => DisplayEvent::ButtonPress,
            Event::ButtonRelease(_) => DisplayEvent::ButtonRelease,
            Event::MotionNotify(_) => DisplayEvent::Motion,
            Event::Expose(event) if event.count == 0 => {
                DisplayEvent::Expose { window: event.window }
            },
            Event::CreateNotify(event) => DisplayEvent::WindowCreated { window: event.window },
            Event::ClientMessage(event) => DisplayEvent::Command {
                window: event.window,
                message_type: event.type_,
                data: event.data.as_data32(),
            },
            Event::ScreensaverNotify(event) => {
                DisplayEvent::SaverNotify { active: event.state == screensaver::State::ON }
            },
            Event::MappingNotify(_) => {
                self.keymap = Keymap::load(&self.conn)?;
                DisplayEvent::Other
            },
            Event::Error(error) if is_vanished_kind(error.error_kind) => {
                debug!("ignoring error on vanished window: {error:?}");
                return Ok(None);
            },
            Event::Error(error) => return Err(Error::Protocol(format!("{error:?}"))),
            _ => DisplayEvent::Other,
        };

        Ok(Some(event))
    }

    /// Read a string property.
    fn string_property(
        &self,
        window: Window,
        property: u32,
        delete: bool,
    ) -> Result<Option<String>, ReplyError> {
        let reply = self
            .conn
            .get_property(delete, window, property, AtomEnum::STRING, 0, PROPERTY_LENGTH)?
            .reply()?;
        if reply.type_ == u32::from(AtomEnum::NONE) {
            return Ok(None);
        }

        Ok(Some(String::from_utf8_lossy(&reply.value).into_owned()))
    }

    fn query_tree(&self, window: Window) -> Result<Vec<Window>, ReplyError> {
        Ok(self.conn.query_tree(window)?.reply()?.children)
    }

    fn window_key_interest(&self, window: Window) -> Result<bool, ReplyError> {
        let attributes = self.conn.get_window_attributes(window)?.reply()?;
        Ok(wants_key_press(attributes.all_event_masks, attributes.do_not_propagate_mask))
    }

    fn vroot_property(&self, window: Window) -> Result<Option<Window>, ReplyError> {
        let reply = self
            .conn
            .get_property(false, window, self.atoms.__SWM_VROOT, AtomEnum::WINDOW, 0, 1)?
            .reply()?;
        Ok(reply.value32().and_then(|mut value| value.next()))
    }

    /// Cursor without any visible pixels.
    fn invisible_cursor(&mut self) -> Result<Cursor> {
        if let Some(cursor) = self.cursor {
            return Ok(cursor);
        }

        let pixmap = self.conn.generate_id()?;
        self.conn.create_pixmap(1, pixmap, self.root(0), 1, 1)?;

        let cursor = self.conn.generate_id()?;
        self.conn.create_cursor(cursor, pixmap, pixmap, 0, 0, 0, 0, 0, 0, 0, 0)?;
        self.conn.free_pixmap(pixmap)?;

        self.cursor = Some(cursor);
        Ok(cursor)
    }
}

impl DisplayServer for X11Backend {
    fn display_name(&self) -> &str {
        &self.display
    }

    fn screens(&self) -> &[ScreenInfo] {
        &self.screens
    }

    fn atoms(&self) -> &Atoms {
        &self.atoms
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.conn.stream().as_raw_fd())
    }

    fn connection_fd(&self) -> Option<OwnedFd> {
        self.conn.stream().as_fd().try_clone_to_owned().ok()
    }

    fn poll_event(&mut self) -> Result<Option<DisplayEvent>> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }

        while let Some(event) = self.conn.poll_for_event()? {
            if let Some(event) = self.convert_event(event)? {
                return Ok(Some(event));
            }
        }

        Ok(None)
    }

    fn flush(&mut self) -> Result<()> {
        self.conn.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.conn.get_input_focus()?.reply()?;
        Ok(())
    }

    fn query_children(&mut self, window: Window) -> Result<Lookup<Vec<Window>>> {
        lookup(self.query_tree(window))
    }

    fn key_press_interest(&mut self, window: Window) -> Result<Lookup<bool>> {
        lookup(self.window_key_interest(window))
    }

    fn select_activity_events(&mut self, window: Window, key_press: bool) -> Result<Lookup<()>> {
        let mut mask = EventMask::SUBSTRUCTURE_NOTIFY;
        if key_press {
            mask = mask | EventMask::KEY_PRESS;
        }
        let aux = ChangeWindowAttributesAux::new().event_mask(mask);
        lookup(self.conn.change_window_attributes(window, &aux)?.check())
    }

    fn vroot(&mut self, window: Window) -> Result<Lookup<Option<Window>>> {
        lookup(self.vroot_property(window))
    }

    fn set_vroot(&mut self, window: Window, value: Window) -> Result<()> {
        let atom = self.atoms.__SWM_VROOT;
        self.conn.change_property32(PropMode::REPLACE, window, atom, AtomEnum::WINDOW, &[value])?;
        Ok(())
    }

    fn delete_vroot(&mut self, window: Window) -> Result<()> {
        self.conn.delete_property(window, self.atoms.__SWM_VROOT)?;
        Ok(())
    }

    fn saver_version(&mut self, window: Window) -> Result<Lookup<Option<String>>> {
        lookup(self.string_property(window, self.atoms._SCREENSAVER_VERSION, false))
    }

    fn saver_identity(&mut self, window: Window) -> Result<Lookup<Option<String>>> {
        lookup(self.string_property(window, self.atoms._SCREENSAVER_ID, false))
    }

    fn set_identity(&mut self, window: Window, version: &str, identity: &str) -> Result<()> {
        let properties = [
            (self.atoms._SCREENSAVER_VERSION, version),
            (self.atoms._SCREENSAVER_ID, identity),
        ];
        for (atom, value) in properties {
            let (mode, string) = (PropMode::REPLACE, AtomEnum::STRING);
            self.conn.change_property8(mode, window, atom, string, value.as_bytes())?;
        }
        Ok(())
    }

    fn set_activity_time(&mut self, window: Window, time: u32) -> Result<()> {
        let atom = self.atoms._SCREENSAVER_TIME;
        self.conn.change_property32(PropMode::REPLACE, window, atom, AtomEnum::INTEGER, &[time])?;
        Ok(())
    }

    fn set_response(&mut self, window: Window, response: &Response) -> Result<()> {
        let atom = self.atoms._SCREENSAVER_RESPONSE;
        let value = response.encode();
        self.conn.change_property8(PropMode::REPLACE, window, atom, AtomEnum::STRING, &value)?;
        self.conn.flush()?;
        Ok(())
    }

    fn kill_xsetroot_data(&mut self, screen: usize) -> Result<()> {
        let root = self.root(screen);
        let atom = self.atoms._XSETROOT_ID;
        let reply = self.conn.get_property(true, root, atom, AtomEnum::PIXMAP, 0, 1)?.reply()?;
        if reply.type_ == u32::from(AtomEnum::NONE) {
            return Ok(());
        }

        let (kind, format) = (reply.type_, reply.format);
        let id = match xsetroot_resource(kind, format, &reply.value, reply.bytes_after) {
            Some(id) => id,
            None => {
                warn!("screen {screen}: malformed _XSETROOT_ID (type {kind}, format {format})");
                return Ok(());
            },
        };

        // Stale ids are common, failures are irrelevant.
        match self.conn.kill_client(id)?.check() {
            Ok(()) => debug!("freed xsetroot resources 0x{id:x}"),
            Err(err) => debug!("unable to free xsetroot resources 0x{id:x}: {err}"),
        }

        Ok(())
    }

    fn create_overlay(
        &mut self,
        screen: usize,
        visual: &VisualInfo,
        colormap: Colormap,
        cursor_visible: bool,
    ) -> Result<Window> {
        let cursor = if cursor_visible { None } else { Some(self.invisible_cursor()?) };
        let (root, width, height) = match self.screens.get(screen) {
            Some(info) => (info.root, info.width, info.height),
            None => return Err(Error::Protocol(format!("no screen {screen}"))),
        };
        let black = self.setup_screen(screen).map_or(0, |screen| screen.black_pixel);

        let events = EventMask::KEY_PRESS
            | EventMask::KEY_RELEASE
            | EventMask::BUTTON_PRESS
            | EventMask::BUTTON_RELEASE
            | EventMask::POINTER_MOTION
            | EventMask::EXPOSURE;
        let aux = CreateWindowAux::new()
            .override_redirect(1u32)
            .background_pixel(black)
            .border_pixel(black)
            .backing_store(BackingStore::NOT_USEFUL)
            .colormap(colormap)
            .cursor(cursor)
            .event_mask(events);

        let window = self.conn.generate_id()?;
        self.conn
            .create_window(
                visual.depth,
                window,
                root,
                0,
                0,
                width,
                height,
                0,
                WindowClass::INPUT_OUTPUT,
                visual.id,
                &aux,
            )?
            .check()?;

        self.overlays.insert(screen, window);

        Ok(window)
    }

    fn reset_overlay(&mut self, window: Window, screen: usize) -> Result<()> {
        let (width, height) = match self.screens.get(screen) {
            Some(info) => (info.width, info.height),
            None => return Ok(()),
        };

        let aux = ConfigureWindowAux::new()
            .x(0)
            .y(0)
            .width(u32::from(width))
            .height(u32::from(height))
            .stack_mode(StackMode::ABOVE);
        self.conn.configure_window(window, &aux)?;
        Ok(())
    }

    fn destroy_window(&mut self, window: Window) -> Result<()> {
        self.overlays.retain(|_, overlay| *overlay != window);
        self.conn.destroy_window(window)?;
        Ok(())
    }

    fn map_raised(&mut self, window: Window) -> Result<()> {
        let aux = ConfigureWindowAux::new().stack_mode(StackMode::ABOVE);
        self.conn.configure_window(window, &aux)?;
        self.conn.map_window(window)?;
        Ok(())
    }

    fn unmap(&mut self, window: Window) -> Result<()> {
        self.conn.unmap_window(window)?;
        Ok(())
    }

    fn clear(&mut self, window: Window) -> Result<()> {
        self.conn.clear_area(false, window, 0, 0, 0, 0)?;
        Ok(())
    }

    fn create_colormap(&mut self, screen: usize, visual: &VisualInfo) -> Result<Colormap> {
        let colormap = self.conn.generate_id()?;
        self.conn.create_colormap(ColormapAlloc::NONE, colormap, self.root(screen), visual.id)?;

        // Overlay background pixel must be black.
        if visual.class.writable() {
            self.conn.alloc_color(colormap, 0, 0, 0)?.reply()?;
        }

        Ok(colormap)
    }

    fn free_colormap(&mut self, colormap: Colormap) -> Result<()> {
        self.conn.free_colormap(colormap)?;
        Ok(())
    }

    fn install_colormap(&mut self, colormap: Colormap) -> Result<()> {
        self.conn.install_colormap(colormap)?;
        Ok(())
    }

    fn focus_colormap(&mut self) -> Result<Option<Colormap>> {
        let focus = self.conn.get_input_focus()?.reply()?.focus;

        // Focus might be `None` or `PointerRoot`.
        if focus <= 1 || self.screens.iter().any(|screen| screen.root == focus) {
            return Ok(None);
        }

        let attributes = match self.conn.get_window_attributes(focus)?.reply() {
            Ok(attributes) => attributes,
            Err(err) if is_vanished(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        Ok(Some(attributes.colormap).filter(|colormap| *colormap != NONE))
    }

    fn grab_keyboard(&mut self, window: Window) -> Result<bool> {
        let reply = self
            .conn
            .grab_keyboard(true, window, CURRENT_TIME, GrabMode::ASYNC, GrabMode::ASYNC)?
            .reply()?;

        if reply.status != GrabStatus::SUCCESS {
            debug!("keyboard grab failed: {:?}", reply.status);
        }

        Ok(reply.status == GrabStatus::SUCCESS)
    }

    fn grab_pointer(&mut self, window: Window) -> Result<bool> {
        let events =
            EventMask::BUTTON_PRESS | EventMask::BUTTON_RELEASE | EventMask::POINTER_MOTION;
        let reply = self
            .conn
            .grab_pointer(
                true,
                window,
                events,
                GrabMode::ASYNC,
                GrabMode::ASYNC,
                NONE,
                NONE,
                CURRENT_TIME,
            )?
            .reply()?;

        if reply.status != GrabStatus::SUCCESS {
            debug!("pointer grab failed: {:?}", reply.status);
        }

        Ok(reply.status == GrabStatus::SUCCESS)
    }

    fn ungrab_keyboard(&mut self) -> Result<()> {
        self.conn.ungrab_keyboard(CURRENT_TIME)?;
        Ok(())
    }

    fn ungrab_pointer(&mut self) -> Result<()> {
        self.conn.ungrab_pointer(CURRENT_TIME)?;
        Ok(())
    }

    fn grab_server(&mut self) -> Result<()> {
        self.conn.grab_server()?;
        Ok(())
    }

    fn ungrab_server(&mut self) -> Result<()> {
        self.conn.ungrab_server()?;
        Ok(())
    }

    fn fade_begin(&mut self, colormaps: &[Colormap]) -> Result<bool> {
        self.fade_end()?;

        // Only colormaps with writable cells can be faded.
        let fadable = self.screens.iter().all(|screen| {
            matches!(screen.default_visual.class, VisualClass::PseudoColor | VisualClass::GrayScale)
        });
        if !fadable {
            return Ok(false);
        }

        for (screen, &original) in colormaps.iter().enumerate() {
            let visual = match self.screens.get(screen) {
                Some(info) => info.default_visual,
                None => continue,
            };

            let pixels: Vec<u32> = (0..u32::from(visual.colormap_entries)).collect();
            let colors = self.conn.query_colors(original, &pixels)?.reply()?.colors;
            let colors = pixels
                .iter()
                .zip(colors)
                .map(|(&pixel, rgb)| Coloritem {
                    pixel,
                    red: rgb.red,
                    green: rgb.green,
                    blue: rgb.blue,
                    flags: ColorFlag::RED | ColorFlag::GREEN | ColorFlag::BLUE,
                })
                .collect::<Vec<_>>();

            let copy = self.conn.generate_id()?;
            self.conn.create_colormap(ColormapAlloc::ALL, copy, self.root(screen), visual.id)?;
            self.conn.store_colors(copy, &colors)?;
            self.conn.install_colormap(copy)?;

            self.fade.push(FadeMap { original, copy, colors });
        }

        Ok(true)
    }

    fn fade_step(&mut self, level: f32) -> Result<()> {
        let level = level.clamp(0., 1.);
        for map in &self.fade {
            let colors: Vec<_> = map
                .colors
                .iter()
                .map(|color| Coloritem {
                    red: (f32::from(color.red) * level) as u16,
                    green: (f32::from(color.green) * level) as u16,
                    blue: (f32::from(color.blue) * level) as u16,
                    ..*color
                })
                .collect();
            self.conn.store_colors(map.copy, &colors)?;
        }
        Ok(())
    }

    fn fade_end(&mut self) -> Result<()> {
        for map in self.fade.drain(..) {
            self.conn.install_colormap(map.original)?;
            self.conn.free_colormap(map.copy)?;
        }
        Ok(())
    }

    fn has_idle_extension(&self) -> bool {
        self.idle_extension
    }

    fn select_saver_notify(&mut self) -> Result<()> {
        if !self.idle_extension {
            return Ok(());
        }

        for screen in &self.screens {
            self.conn.screensaver_select_input(screen.root, screensaver::Event::NOTIFY_MASK)?;
        }
        Ok(())
    }

    fn query_idle_time(&mut self) -> Result<Duration> {
        let root = self.root(0);
        let reply = self
            .conn
            .screensaver_query_info(root)?
            .reply()
            .map_err(|err| Error::IdleQuery(err.to_string()))?;
        Ok(Duration::from_millis(u64::from(reply.ms_since_user_input)))
    }

    fn reset_idle_time(&mut self) -> Result<()> {
        self.conn.force_screen_saver(ScreenSaver::RESET)?;
        Ok(())
    }

    fn query_pointer(&mut self, screen: usize) -> Result<PointerState> {
        let reply = self.conn.query_pointer(self.root(screen))?.reply()?;
        Ok(PointerState {
            root_x: reply.root_x,
            root_y: reply.root_y,
            child: reply.child,
            mask: u16::from(reply.mask),
        })
    }

    fn server_saver(&mut self) -> Result<ServerSaver> {
        let reply = self.conn.get_screen_saver()?.reply()?;
        Ok(ServerSaver {
            timeout: reply.timeout as i16,
            interval: reply.interval as i16,
            prefer_blanking: reply.prefer_blanking == Blanking::PREFERRED,
            allow_exposures: reply.allow_exposures == Exposures::ALLOWED,
        })
    }

    fn set_server_saver(&mut self, saver: ServerSaver) -> Result<()> {
        let blanking =
            if saver.prefer_blanking { Blanking::PREFERRED } else { Blanking::NOT_PREFERRED };
        let exposures =
            if saver.allow_exposures { Exposures::ALLOWED } else { Exposures::NOT_ALLOWED };
        self.conn.set_screen_saver(saver.timeout, saver.interval, blanking, exposures)?;
        Ok(())
    }

    fn open_dialog(&mut self, screen: usize) -> Result<Window> {
        self.close_dialog()?;

        let (root, width, height) = match self.screens.get(screen) {
            Some(info) => (info.root, info.width, info.height),
            None => return Err(Error::Protocol(format!("no screen {screen}"))),
        };
        let (black, white, depth) = match self.setup_screen(screen) {
            Some(screen) => (screen.black_pixel, screen.white_pixel, screen.root_depth),
            None => (0, 1, 24),
        };
        let x = (width.saturating_sub(DIALOG_WIDTH) / 2) as i16;
        let y = (height.saturating_sub(DIALOG_HEIGHT) / 2) as i16;

        // Preserve the hack's output below the dialog.
        let overlay = self.overlays.get(&screen).copied();
        let save_under = match overlay {
            Some(overlay) => {
                let pixmap = self.conn.generate_id()?;
                self.conn.create_pixmap(depth, pixmap, root, DIALOG_WIDTH, DIALOG_HEIGHT)?;
                Some((overlay, pixmap))
            },
            None => None,
        };

        let font = self.conn.generate_id()?;
        self.conn.open_font(font, DIALOG_FONT)?;

        let window = self.conn.generate_id()?;
        let aux = CreateWindowAux::new()
            .override_redirect(1u32)
            .background_pixel(white)
            .border_pixel(black)
            .event_mask(EventMask::EXPOSURE | EventMask::KEY_PRESS);
        self.conn.create_window(
            x11rb::COPY_DEPTH_FROM_PARENT,
            window,
            root,
            x,
            y,
            DIALOG_WIDTH,
            DIALOG_HEIGHT,
            2,
            WindowClass::INPUT_OUTPUT,
            x11rb::COPY_FROM_PARENT,
            &aux,
        )?;

        let gc = self.conn.generate_id()?;
        let gc_aux = CreateGCAux::new().foreground(black).background(white).font(font);
        self.conn.create_gc(gc, window, &gc_aux)?;

        if let Some((overlay, pixmap)) = save_under {
            let copy_gc = self.conn.generate_id()?;
            self.conn.create_gc(copy_gc, overlay, &CreateGCAux::new())?;
            self.conn.copy_area(overlay, pixmap, copy_gc, x, y, 0, 0, DIALOG_WIDTH, DIALOG_HEIGHT)?;
            self.conn.free_gc(copy_gc)?;
        }

        self.map_raised(window)?;
        self.conn.flush()?;

        self.dialog = Some(Dialog { window, gc, font, origin: (x, y), save_under });

        Ok(window)
    }

    fn draw_dialog(&mut self, view: &DialogView<'_>) -> Result<()> {
        let dialog = match &self.dialog {
            Some(dialog) => dialog,
            None => return Ok(()),
        };
        let (window, gc) = (dialog.window, dialog.gc);

        self.conn.clear_area(false, window, 0, 0, 0, 0)?;

        let caret = CARET[usize::from(view.caret) % CARET.len()];
        let lines = [
            format!("umbra {}", env!("CARGO_PKG_VERSION")),
            String::from("This display is locked."),
            format!("User: {}", view.user),
            format!("Password: {}{caret}", view.mask),
            view.message.unwrap_or_default().to_owned(),
        ];

        let mut y = DIALOG_MARGIN + LINE_HEIGHT;
        for line in lines.iter().filter(|line| !line.is_empty()) {
            let bytes = latin1(line);
            self.conn.image_text8(window, gc, DIALOG_MARGIN, y, &bytes)?;
            y += LINE_HEIGHT;
        }

        // Countdown thermometer along the right edge.
        let height = DIALOG_HEIGHT - 2 * DIALOG_MARGIN as u16;
        let filled = (f32::from(height) * view.ratio.clamp(0., 1.)) as u16;
        let x = (DIALOG_WIDTH - DIALOG_MARGIN as u16 - THERMOMETER_WIDTH) as i16;
        let outline =
            Rectangle { x, y: DIALOG_MARGIN, width: THERMOMETER_WIDTH, height: height - 1 };
        let fill = Rectangle {
            x,
            y: DIALOG_MARGIN + (height - filled) as i16,
            width: THERMOMETER_WIDTH,
            height: filled,
        };
        self.conn.poly_rectangle(window, gc, &[outline])?;
        self.conn.poly_fill_rectangle(window, gc, &[fill])?;

        self.conn.flush()?;

        Ok(())
    }

    fn close_dialog(&mut self) -> Result<()> {
        let dialog = match self.dialog.take() {
            Some(dialog) => dialog,
            None => return Ok(()),
        };

        self.conn.destroy_window(dialog.window)?;
        self.conn.free_gc(dialog.gc)?;
        self.conn.close_font(dialog.font)?;

        if let Some((overlay, pixmap)) = dialog.save_under {
            let (x, y) = dialog.origin;
            let gc = self.conn.generate_id()?;
            self.conn.create_gc(gc, overlay, &CreateGCAux::new())?;
            self.conn.copy_area(pixmap, overlay, gc, 0, 0, x, y, DIALOG_WIDTH, DIALOG_HEIGHT)?;
            self.conn.free_gc(gc)?;
            self.conn.free_pixmap(pixmap)?;
        }

        self.conn.flush()?;

        Ok(())
    }

    fn drain_key_events(&mut self) -> Result<()> {
        self.sync()?;

        while let Some(event) = self.conn.poll_for_event()? {
            match self.convert_event(event)? {
                Some(DisplayEvent::KeyPress { .. } | DisplayEvent::KeyRelease) | None => (),
                Some(event) => self.pending.push_back(event),
            }
        }

        Ok(())
    }

    fn bell(&mut self) -> Result<()> {
        self.conn.bell(0)?;
        self.conn.flush()?;
        Ok(())
    }
}

/// Open password dialog resources.
struct Dialog {
    window: Window,
    gc: Gcontext,
    font: Font,
    origin: (i16, i16),
    save_under: Option<(Window, Pixmap)>,
}

/// Writable copy of a colormap used for fading.
struct FadeMap {
    original: Colormap,
    copy: Colormap,
    colors: Vec<Coloritem>,
}

/// Keycode to keysym translation table.
#[derive(Default, Debug)]
struct Keymap {
    min_keycode: u8,
    keysyms_per_keycode: usize,
    keysyms: Vec<u32>,
}

impl Keymap {
    fn load(conn: &RustConnection) -> Result<Self> {
        let setup = conn.setup();
        let min_keycode = setup.min_keycode;
        let count = setup.max_keycode - min_keycode + 1;

        let reply = conn.get_keyboard_mapping(min_keycode, count)?.reply()?;
        Ok(Self {
            min_keycode,
            keysyms_per_keycode: usize::from(reply.keysyms_per_keycode),
            keysyms: reply.keysyms,
        })
    }

    /// Keysym of a keycode, picking the shifted symbol when requested.
    fn keysym(&self, keycode: u8, shifted: bool) -> u32 {
        if self.keysyms_per_keycode == 0 || keycode < self.min_keycode {
            return 0;
        }

        let start = usize::from(keycode - self.min_keycode) * self.keysyms_per_keycode;
        let row = match self.keysyms.get(start..start + self.keysyms_per_keycode) {
            Some(row) => row,
            None => return 0,
        };

        let base = row[0];
        let upper = row.get(1).copied().filter(|keysym| *keysym != 0);
        match (shifted, upper) {
            (true, Some(upper)) => upper,
            (true, None) if (u32::from(b'a')..=u32::from(b'z')).contains(&base) => base - 0x20,
            _ => base,
        }
    }

    /// Translate a key press.
    fn key(&self, keycode: u8, state: u16) -> Key {
        let shift = state & u16::from(KeyButMask::SHIFT) != 0;
        let lock = state & u16::from(KeyButMask::LOCK) != 0;
        let control = state & u16::from(KeyButMask::CONTROL) != 0;

        translate_keysym(self.keysym(keycode, shift != lock), control)
    }
}

/// Map a keysym to a password dialog key.
fn translate_keysym(keysym: u32, control: bool) -> Key {
    let is = |c: u8| keysym == u32::from(c) || keysym == u32::from(c.to_ascii_uppercase());

    match keysym {
        XK_BACKSPACE | XK_DELETE => Key::Backspace,
        XK_RETURN | XK_KP_ENTER | XK_LINEFEED => Key::Enter,
        XK_ESCAPE => Key::Escape,
        _ if control && (is(b'u') || is(b'x')) => Key::KillLine,
        _ if control && is(b'h') => Key::Backspace,
        _ if control => Key::Other,
        0x20..=0x7e | 0xa0..=0xff => char::from_u32(keysym).map_or(Key::Other, Key::Char),
        0x0100_0100..=0x0110_ffff => {
            char::from_u32(keysym - UNICODE_KEYSYM_OFFSET).map_or(Key::Other, Key::Char)
        },
        _ => Key::Other,
    }
}

/// Client resource stored by `xsetroot`, if the property holds a single pixmap.
fn xsetroot_resource(kind: u32, format: u8, value: &[u8], bytes_after: u32) -> Option<u32> {
    if kind != u32::from(AtomEnum::PIXMAP) || format != 32 || bytes_after != 0 {
        return None;
    }

    let value: [u8; 4] = value.try_into().ok()?;
    Some(u32::from_ne_bytes(value))
}

/// Whether a window's event masks show interest in key presses.
fn wants_key_press(all_event_masks: EventMask, do_not_propagate: EventMask) -> bool {
    let masks = u32::from(all_event_masks) | u32::from(do_not_propagate);
    masks & u32::from(EventMask::KEY_PRESS) != 0
}

/// Core font encoding of a string.
fn latin1(text: &str) -> Vec<u8> {
    text.chars().map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?')).collect()
}

/// Describe a screen of the connection setup.
fn screen_info(number: usize, screen: &Screen) -> ScreenInfo {
    let visuals: Vec<VisualInfo> = screen
        .allowed_depths
        .iter()
        .flat_map(|depth| {
            depth.visuals.iter().filter_map(move |visual| {
                Some(VisualInfo {
                    id: visual.visual_id,
                    class: visual_class(visual.class)?,
                    depth: depth.depth,
                    colormap_entries: visual.colormap_entries,
                })
            })
        })
        .collect();

    let default_visual =
        visuals.iter().find(|visual| visual.id == screen.root_visual).copied().unwrap_or(
            VisualInfo {
                id: screen.root_visual,
                class: VisualClass::TrueColor,
                depth: screen.root_depth,
                colormap_entries: 256,
            },
        );

    ScreenInfo {
        number,
        root: screen.root,
        width: screen.width_in_pixels,
        height: screen.height_in_pixels,
        default_colormap: screen.default_colormap,
        default_visual,
        visuals,
    }
}

fn visual_class(class: xproto::VisualClass) -> Option<VisualClass> {
    match class {
        xproto::VisualClass::STATIC_GRAY => Some(VisualClass::StaticGray),
        xproto::VisualClass::GRAY_SCALE => Some(VisualClass::GrayScale),
        xproto::VisualClass::STATIC_COLOR => Some(VisualClass::StaticColor),
        xproto::VisualClass::PSEUDO_COLOR => Some(VisualClass::PseudoColor),
        xproto::VisualClass::TRUE_COLOR => Some(VisualClass::TrueColor),
        xproto::VisualClass::DIRECT_COLOR => Some(VisualClass::DirectColor),
        _ => None,
    }
}

/// Whether an error kind indicates a window destroyed by its owner.
fn is_vanished_kind(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::Window | ErrorKind::Match | ErrorKind::Drawable)
}

fn is_vanished(err: &ReplyError) -> bool {
    matches!(err, ReplyError::X11Error(error) if is_vanished_kind(error.error_kind))
}

/// Treat errors on destroyed windows as a lookup miss.
fn lookup<T>(result: Result<T, ReplyError>) -> Result<Lookup<T>> {
    match result {
        Ok(value) => Ok(Lookup::Found(value)),
        Err(err) if is_vanished(&err) => Ok(Lookup::Vanished),
        Err(err) => {
            warn!("window lookup failed: {err}");
            Err(err.into())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keymap() -> Keymap {
        // Keycodes 8..=11: a/A, 1/!, Return, BackSpace.
        Keymap {
            min_keycode: 8,
            keysyms_per_keycode: 2,
            keysyms: vec![0x61, 0x41, 0x31, 0x21, XK_RETURN, 0, XK_BACKSPACE, 0],
        }
    }

    #[test]
    fn shift_selects_second_symbol() {
        let keymap = keymap();
        let shift = u16::from(KeyButMask::SHIFT);
        let lock = u16::from(KeyButMask::LOCK);

        assert_eq!(keymap.key(8, 0), Key::Char('a'));
        assert_eq!(keymap.key(8, shift), Key::Char('A'));
        assert_eq!(keymap.key(8, lock), Key::Char('A'));
        assert_eq!(keymap.key(8, shift | lock), Key::Char('a'));
        assert_eq!(keymap.key(9, shift), Key::Char('!'));
        assert_eq!(keymap.key(10, shift), Key::Enter);
        assert_eq!(keymap.key(11, 0), Key::Backspace);
    }

    #[test]
    fn unknown_keycodes_are_ignored() {
        let keymap = keymap();
        assert_eq!(keymap.key(7, 0), Key::Other);
        assert_eq!(keymap.key(200, 0), Key::Other);
        assert_eq!(Keymap::default().key(8, 0), Key::Other);
    }

    #[test]
    fn control_keys() {
        assert_eq!(translate_keysym(u32::from(b'u'), true), Key::KillLine);
        assert_eq!(translate_keysym(u32::from(b'X'), true), Key::KillLine);
        assert_eq!(translate_keysym(u32::from(b'h'), true), Key::Backspace);
        assert_eq!(translate_keysym(u32::from(b'a'), true), Key::Other);
        assert_eq!(translate_keysym(XK_ESCAPE, false), Key::Escape);
        assert_eq!(translate_keysym(XK_KP_ENTER, false), Key::Enter);
        assert_eq!(translate_keysym(XK_DELETE, false), Key::Backspace);
    }

    #[test]
    fn printable_keysyms() {
        assert_eq!(translate_keysym(0xe9, false), Key::Char('é'));
        assert_eq!(translate_keysym(0x0100_20ac, false), Key::Char('€'));
        assert_eq!(translate_keysym(0xff51, false), Key::Other);
    }

    #[test]
    fn xsetroot_property_must_be_single_pixmap() {
        let pixmap = u32::from(AtomEnum::PIXMAP);
        let id = 0x0040_0001u32.to_ne_bytes();

        assert_eq!(xsetroot_resource(pixmap, 32, &id, 0), Some(0x0040_0001));
        assert_eq!(xsetroot_resource(pixmap, 32, &id, 4), None);
        assert_eq!(xsetroot_resource(pixmap, 8, &id, 0), None);
        assert_eq!(xsetroot_resource(pixmap, 32, &id[..2], 0), None);
        assert_eq!(xsetroot_resource(u32::from(AtomEnum::STRING), 32, &id, 0), None);
    }

    #[test]
    fn key_presses_selected_only_where_wanted() {
        let key_press = EventMask::KEY_PRESS | EventMask::EXPOSURE;
        assert!(wants_key_press(key_press, EventMask::NO_EVENT));
        assert!(wants_key_press(EventMask::NO_EVENT, EventMask::KEY_PRESS));
        assert!(!wants_key_press(EventMask::EXPOSURE, EventMask::BUTTON_PRESS));
    }

    #[test]
    fn dialog_text_is_latin1() {
        assert_eq!(latin1("é€"), vec![0xe9, b'?']);
    }

    #[test]
    fn visual_classes() {
        assert_eq!(visual_class(xproto::VisualClass::TRUE_COLOR), Some(VisualClass::TrueColor));
        assert_eq!(visual_class(xproto::VisualClass::GRAY_SCALE), Some(VisualClass::GrayScale));
    }

    #[test]
    fn vanished_error_kinds() {
        assert!(is_vanished_kind(ErrorKind::Window));
        assert!(is_vanished_kind(ErrorKind::Drawable));
        assert!(!is_vanished_kind(ErrorKind::Value));
        assert!(!is_vanished_kind(ErrorKind::Access));
    }
}
