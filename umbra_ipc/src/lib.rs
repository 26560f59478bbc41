//! Umbra control interface.
//!
//! This library provides the protocol spoken between the umbra daemon and its
//! control tool. Requests are delivered as client messages to the daemon's
//! overlay window, responses come back through a property on the same window.

use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::time::{Duration, Instant};
use std::{env, thread};

use chrono::{Local, TimeZone};
#[cfg(feature = "clap")]
use clap::Args;
use x11rb::connection::Connection;
use x11rb::errors::{ConnectError, ReplyError};
use x11rb::protocol::xproto::{
    Atom, AtomEnum, ChangeWindowAttributesAux, ClientMessageEvent, ConnectionExt, EventMask,
    MapState, Property, Window,
};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

/// Time the control tool waits for the daemon to respond.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before commands which activate the screen saver.
///
/// This keeps the key release of the shell's return key from immediately
/// deactivating the screen again.
const ACTIVATION_DELAY: Duration = Duration::from_secs(1);

/// Interval for polling the response property.
const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(10);

// Atoms shared by the daemon and the control tool.
x11rb::atom_manager! {
    pub Atoms: AtomsCookie {
        SCREENSAVER,
        _SCREENSAVER_ID,
        _SCREENSAVER_VERSION,
        _SCREENSAVER_TIME,
        _SCREENSAVER_RESPONSE,
        __SWM_VROOT,
        _XSETROOT_ID,
        ACTIVATE,
        DEACTIVATE,
        RESTART,
        CYCLE,
        NEXT,
        PREV,
        SELECT,
        EXIT,
        DEMO,
        PREFS,
        LOCK,
    }
}

/// Available control commands.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CommandKind {
    Activate,
    Deactivate,
    Lock,
    Cycle,
    Next,
    Prev,
    Select,
    Exit,
    Restart,
    Demo,
    Prefs,
}

impl CommandKind {
    /// All commands, in protocol order.
    pub const ALL: [CommandKind; 11] = [
        Self::Activate,
        Self::Deactivate,
        Self::Lock,
        Self::Cycle,
        Self::Next,
        Self::Prev,
        Self::Select,
        Self::Exit,
        Self::Restart,
        Self::Demo,
        Self::Prefs,
    ];

    /// Atom identifying this command on the wire.
    pub fn atom(&self, atoms: &Atoms) -> Atom {
        match self {
            Self::Activate => atoms.ACTIVATE,
            Self::Deactivate => atoms.DEACTIVATE,
            Self::Lock => atoms.LOCK,
            Self::Cycle => atoms.CYCLE,
            Self::Next => atoms.NEXT,
            Self::Prev => atoms.PREV,
            Self::Select => atoms.SELECT,
            Self::Exit => atoms.EXIT,
            Self::Restart => atoms.RESTART,
            Self::Demo => atoms.DEMO,
            Self::Prefs => atoms.PREFS,
        }
    }

    /// Look up the command for a wire atom.
    pub fn from_atom(atoms: &Atoms, atom: Atom) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.atom(atoms) == atom)
    }

    /// Whether the command activates the screen saver.
    fn activates(&self) -> bool {
        matches!(self, Self::Activate | Self::Lock | Self::Next | Self::Prev | Self::Select)
    }
}

impl Display for CommandKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
            Self::Lock => "lock",
            Self::Cycle => "cycle",
            Self::Next => "next",
            Self::Prev => "prev",
            Self::Select => "select",
            Self::Exit => "exit",
            Self::Restart => "restart",
            Self::Demo => "demo",
            Self::Prefs => "prefs",
        };
        f.write_str(name)
    }
}

/// Validated control command.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Command {
    pub kind: CommandKind,
    pub argument: u32,
}

impl Command {
    /// Validate a command and its argument.
    ///
    /// Only `select` and `demo` accept an argument, `select` requires one.
    pub fn new(kind: CommandKind, argument: i64) -> Result<Self, UsageError> {
        if argument < 0 {
            return Err(UsageError::NegativeArgument(kind, argument));
        }

        if kind == CommandKind::Select && argument == 0 {
            return Err(UsageError::MissingArgument(kind));
        }

        if argument > 0 && !matches!(kind, CommandKind::Select | CommandKind::Demo) {
            return Err(UsageError::UnexpectedArgument(kind));
        }

        let argument = u32::try_from(argument).map_err(|_| UsageError::ArgumentTooLarge(kind))?;

        Ok(Self { kind, argument })
    }

    /// Client message payload for this command.
    pub fn encode(&self, atoms: &Atoms) -> [u32; 5] {
        [self.kind.atom(atoms), self.argument, 0, 0, 0]
    }

    /// Parse a client message payload.
    pub fn decode(atoms: &Atoms, message_type: Atom, data: [u32; 5]) -> Result<Self, DecodeError> {
        if message_type != atoms.SCREENSAVER {
            return Err(DecodeError::UnknownType(message_type));
        }

        let kind = CommandKind::from_atom(atoms, data[0])
            .ok_or(DecodeError::UnknownCommand(data[0]))?;

        // Arguments are signed 32-bit values on the wire.
        Self::new(kind, i64::from(data[1] as i32)).map_err(DecodeError::Usage)
    }
}

/// Invalid command usage.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum UsageError {
    NegativeArgument(CommandKind, i64),
    MissingArgument(CommandKind),
    UnexpectedArgument(CommandKind),
    ArgumentTooLarge(CommandKind),
    NoCommand,
}

impl Display for UsageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::NegativeArgument(kind, arg) => {
                write!(f, "-{kind}: argument must be positive: {arg}")
            },
            Self::MissingArgument(kind) => write!(f, "-{kind}: requires a positive argument"),
            Self::UnexpectedArgument(kind) => write!(f, "-{kind}: does not take an argument"),
            Self::ArgumentTooLarge(kind) => write!(f, "-{kind}: argument out of range"),
            Self::NoCommand => f.write_str("no command specified"),
        }
    }
}

impl Error for UsageError {}

/// Malformed client message.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DecodeError {
    UnknownType(Atom),
    UnknownCommand(Atom),
    Usage(UsageError),
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownType(atom) => write!(f, "unrecognized message type {atom}"),
            Self::UnknownCommand(atom) => write!(f, "unrecognized command {atom}"),
            Self::Usage(err) => err.fmt(f),
        }
    }
}

impl Error for DecodeError {}

/// Daemon reply to a command.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Response {
    pub success: bool,
    pub message: String,
}

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into() }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into() }
    }

    /// Property value for this response.
    pub fn encode(&self) -> Vec<u8> {
        let prefix = if self.success { '+' } else { '-' };
        format!("{prefix}{}", self.message).into_bytes()
    }

    /// Parse a response property value.
    pub fn parse(value: &[u8]) -> Option<Self> {
        let (prefix, message) = value.split_first()?;
        let message = String::from_utf8_lossy(message).into_owned();
        match prefix {
            b'+' => Some(Self::success(message)),
            b'-' => Some(Self::failure(message)),
            _ => None,
        }
    }
}

/// Request issued by the control tool.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Request {
    Command(Command),
    Version,
    Time,
}

/// Control tool options.
#[cfg_attr(feature = "clap", derive(Args))]
#[derive(Default, Debug)]
pub struct ControlOptions {
    /// X display to connect to.
    #[cfg_attr(feature = "clap", clap(long, value_name = "DPY"))]
    pub display: Option<String>,

    #[cfg_attr(feature = "clap", clap(flatten))]
    pub request: RequestFlags,
}

/// Mutually exclusive control requests.
#[cfg_attr(feature = "clap", derive(Args))]
#[cfg_attr(feature = "clap", group(required = true, multiple = false))]
#[derive(Default, Debug)]
pub struct RequestFlags {
    /// Blank the screen immediately.
    #[cfg_attr(feature = "clap", clap(long))]
    pub activate: bool,
    /// Unblank the screen, or pop up the unlock dialog.
    #[cfg_attr(feature = "clap", clap(long))]
    pub deactivate: bool,
    /// Switch to a different graphics hack.
    #[cfg_attr(feature = "clap", clap(long))]
    pub cycle: bool,
    /// Switch to the next graphics hack.
    #[cfg_attr(feature = "clap", clap(long))]
    pub next: bool,
    /// Switch to the previous graphics hack.
    #[cfg_attr(feature = "clap", clap(long))]
    pub prev: bool,
    /// Switch to the N-th graphics hack.
    #[cfg_attr(feature = "clap", clap(long, value_name = "N", allow_negative_numbers = true))]
    pub select: Option<i64>,
    /// Shut down the running daemon.
    #[cfg_attr(feature = "clap", clap(long))]
    pub exit: bool,
    /// Restart the running daemon.
    #[cfg_attr(feature = "clap", clap(long))]
    pub restart: bool,
    /// Blank and lock the screen immediately.
    #[cfg_attr(feature = "clap", clap(long))]
    pub lock: bool,
    /// Run a graphics hack in demo mode.
    #[cfg_attr(
        feature = "clap",
        clap(
            long,
            value_name = "N",
            num_args = 0..=1,
            default_missing_value = "0",
            allow_negative_numbers = true
        )
    )]
    pub demo: Option<i64>,
    /// Launch the preferences tool.
    #[cfg_attr(feature = "clap", clap(long))]
    pub prefs: bool,
    /// Print the version of the running daemon.
    #[cfg_attr(feature = "clap", clap(long))]
    pub version: bool,
    /// Print when the screen was last blanked or unblanked.
    #[cfg_attr(feature = "clap", clap(long))]
    pub time: bool,
}

impl RequestFlags {
    /// Convert the flags to a validated request.
    pub fn request(&self) -> Result<Request, UsageError> {
        let command = |kind, argument| Command::new(kind, argument).map(Request::Command);

        match self {
            Self { version: true, .. } => Ok(Request::Version),
            Self { time: true, .. } => Ok(Request::Time),
            Self { activate: true, .. } => command(CommandKind::Activate, 0),
            Self { deactivate: true, .. } => command(CommandKind::Deactivate, 0),
            Self { cycle: true, .. } => command(CommandKind::Cycle, 0),
            Self { next: true, .. } => command(CommandKind::Next, 0),
            Self { prev: true, .. } => command(CommandKind::Prev, 0),
            Self { exit: true, .. } => command(CommandKind::Exit, 0),
            Self { restart: true, .. } => command(CommandKind::Restart, 0),
            Self { lock: true, .. } => command(CommandKind::Lock, 0),
            Self { prefs: true, .. } => command(CommandKind::Prefs, 0),
            Self { select: Some(n), .. } => command(CommandKind::Select, *n),
            Self { demo: Some(n), .. } => command(CommandKind::Demo, *n),
            _ => Err(UsageError::NoCommand),
        }
    }
}

/// Control tool failure.
#[derive(Debug)]
pub enum ControlError {
    /// Invalid command line.
    Usage(UsageError),
    /// Display could not be opened.
    Display(ConnectError),
    /// Communication with the daemon failed.
    Remote(Box<dyn Error>),
}

impl Display for ControlError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usage(err) => write!(f, "usage error: {err}"),
            Self::Display(err) => write!(f, "unable to open display: {err}"),
            Self::Remote(err) => err.fmt(f),
        }
    }
}

impl Error for ControlError {}

/// Execute a control request against the running daemon.
///
/// Returns the message which should be shown to the user.
pub fn run(options: &ControlOptions) -> Result<String, ControlError> {
    let request = options.request.request().map_err(ControlError::Usage)?;

    let (conn, screen_num) =
        x11rb::connect(options.display.as_deref()).map_err(ControlError::Display)?;
    let display_name =
        options.display.clone().unwrap_or_else(|| env::var("DISPLAY").unwrap_or_default());

    let atoms = remote(Atoms::new(&conn))?;
    let atoms = remote(atoms.reply())?;

    let root = conn.setup().roots[screen_num].root;
    let (window, version) = match remote(find_saver_window(&conn, &atoms, root))? {
        Some(saver) => saver,
        None => {
            let msg = format!("no screen saver is running on display {display_name}");
            return Err(ControlError::Remote(msg.into()));
        },
    };

    match request {
        Request::Version => {
            let id = remote(read_string(&conn, window, atoms._SCREENSAVER_ID))?;
            let id = id.unwrap_or_else(|| String::from("unknown"));
            Ok(format!("umbra {version} is running as {id} on display {display_name}"))
        },
        Request::Time => remote(query_time(&conn, &atoms, window)),
        Request::Command(command) => {
            if command.kind.activates() {
                thread::sleep(ACTIVATION_DELAY);
            }

            let response = remote(send_command(&conn, &atoms, window, command))?;
            if response.success {
                Ok(response.message)
            } else {
                Err(ControlError::Remote(response.message.into()))
            }
        },
    }
}

/// Convert any protocol error into a remote failure.
fn remote<T, E: Into<Box<dyn Error>>>(result: Result<T, E>) -> Result<T, ControlError> {
    result.map_err(|err| ControlError::Remote(err.into()))
}

/// Find the daemon's overlay window among the root's children.
///
/// Returns the window and its advertised version.
pub fn find_saver_window(
    conn: &RustConnection,
    atoms: &Atoms,
    root: Window,
) -> Result<Option<(Window, String)>, Box<dyn Error>> {
    let tree = conn.query_tree(root)?.reply()?;

    for child in tree.children {
        match read_string(conn, child, atoms._SCREENSAVER_VERSION) {
            Ok(Some(version)) => return Ok(Some((child, version))),
            Ok(None) => (),
            // Window was destroyed while iterating.
            Err(ReplyError::X11Error(_)) => (),
            Err(err) => return Err(err.into()),
        }
    }

    Ok(None)
}

/// Send a command and wait for the daemon's response.
pub fn send_command(
    conn: &RustConnection,
    atoms: &Atoms,
    window: Window,
    command: Command,
) -> Result<Response, Box<dyn Error>> {
    // Subscribe to response property changes before sending the request.
    let attributes = ChangeWindowAttributesAux::new().event_mask(EventMask::PROPERTY_CHANGE);
    conn.change_window_attributes(window, &attributes)?.check()?;
    conn.delete_property(window, atoms._SCREENSAVER_RESPONSE)?;

    let event = ClientMessageEvent::new(32, window, atoms.SCREENSAVER, command.encode(atoms));
    conn.send_event(false, window, EventMask::NO_EVENT, event)?;
    conn.flush()?;

    let deadline = Instant::now() + RESPONSE_TIMEOUT;
    while Instant::now() < deadline {
        let event = match conn.poll_for_event()? {
            Some(event) => event,
            None => {
                thread::sleep(RESPONSE_POLL_INTERVAL);
                continue;
            },
        };

        match event {
            Event::PropertyNotify(event)
                if event.window == window
                    && event.atom == atoms._SCREENSAVER_RESPONSE
                    && event.state == Property::NEW_VALUE =>
            {
                let property = atoms._SCREENSAVER_RESPONSE;
                let reply =
                    conn.get_property(true, window, property, AtomEnum::STRING, 0, 1024)?.reply()?;
                return Response::parse(&reply.value)
                    .ok_or_else(|| "malformed response from screen saver".into());
            },
            Event::DestroyNotify(event) if event.window == window => {
                return Err("screen saver window was destroyed".into());
            },
            _ => (),
        }
    }

    Err(format!("no response to {} command from screen saver", command.kind).into())
}

/// Describe the last activation or deactivation time.
fn query_time(
    conn: &RustConnection,
    atoms: &Atoms,
    window: Window,
) -> Result<String, Box<dyn Error>> {
    let reply = conn
        .get_property(false, window, atoms._SCREENSAVER_TIME, AtomEnum::INTEGER, 0, 1)?
        .reply()?;
    let time = reply.value32().and_then(|mut value| value.next());
    let time = match time.and_then(|time| Local.timestamp_opt(time as i64, 0).single()) {
        Some(time) => time,
        None => return Err("unable to determine screen saver activation time".into()),
    };

    let attributes = conn.get_window_attributes(window)?.reply()?;
    let state = if attributes.map_state == MapState::VIEWABLE { "blanked" } else { "non-blanked" };

    Ok(format!("screen {state} since {}", time.format("%a %b %e %H:%M:%S %Y")))
}

/// Read a string property.
fn read_string(
    conn: &RustConnection,
    window: Window,
    property: Atom,
) -> Result<Option<String>, ReplyError> {
    let reply = conn.get_property(false, window, property, AtomEnum::STRING, 0, 1024)?.reply()?;
    if reply.type_ == u32::from(AtomEnum::NONE) {
        return Ok(None);
    }

    Ok(Some(String::from_utf8_lossy(&reply.value).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atoms() -> Atoms {
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

    #[test]
    fn select_requires_positive_argument() {
        assert_eq!(
            Command::new(CommandKind::Select, 0),
            Err(UsageError::MissingArgument(CommandKind::Select))
        );
        assert_eq!(
            Command::new(CommandKind::Select, -2),
            Err(UsageError::NegativeArgument(CommandKind::Select, -2))
        );
        assert_eq!(
            Command::new(CommandKind::Select, 3),
            Ok(Command { kind: CommandKind::Select, argument: 3 })
        );
    }

    #[test]
    fn demo_argument_is_optional() {
        assert!(Command::new(CommandKind::Demo, 0).is_ok());
        assert!(Command::new(CommandKind::Demo, 4).is_ok());
        assert!(Command::new(CommandKind::Demo, -1).is_err());
    }

    #[test]
    fn other_commands_reject_arguments() {
        for kind in CommandKind::ALL {
            if matches!(kind, CommandKind::Select | CommandKind::Demo) {
                continue;
            }

            assert_eq!(Command::new(kind, 1), Err(UsageError::UnexpectedArgument(kind)));
            assert_eq!(Command::new(kind, -1), Err(UsageError::NegativeArgument(kind, -1)));
            assert!(Command::new(kind, 0).is_ok());
        }
    }

    #[test]
    fn decode_rejects_foreign_messages() {
        let atoms = atoms();
        let select = Command::new(CommandKind::Select, 2).unwrap();
        let data = select.encode(&atoms);

        assert_eq!(Command::decode(&atoms, atoms.SCREENSAVER, data), Ok(select));
        assert_eq!(Command::decode(&atoms, 42, data), Err(DecodeError::UnknownType(42)));
        assert_eq!(
            Command::decode(&atoms, atoms.SCREENSAVER, [7, 0, 0, 0, 0]),
            Err(DecodeError::UnknownCommand(7))
        );
        assert_eq!(
            Command::decode(&atoms, atoms.SCREENSAVER, [atoms.EXIT, 5, 0, 0, 0]),
            Err(DecodeError::Usage(UsageError::UnexpectedArgument(CommandKind::Exit)))
        );
    }

    #[test]
    fn decode_rejects_negative_arguments() {
        let atoms = atoms();
        let kind = CommandKind::Select;

        let data = [atoms.SELECT, u32::MAX, 0, 0, 0];
        let negative = DecodeError::Usage(UsageError::NegativeArgument(kind, -1));
        assert_eq!(Command::decode(&atoms, atoms.SCREENSAVER, data), Err(negative));

        let data = [atoms.SELECT, i32::MAX as u32, 0, 0, 0];
        let command = Command::decode(&atoms, atoms.SCREENSAVER, data).unwrap();
        assert_eq!(command.argument, i32::MAX as u32);
    }

    #[test]
    fn response_prefix() {
        let ok = Response::parse(b"+activating.").unwrap();
        assert!(ok.success);
        assert_eq!(ok.message, "activating.");

        let failed = Response::parse(b"-already active.").unwrap();
        assert!(!failed.success);

        assert_eq!(Response::failure("not locked.").encode(), b"-not locked.".to_vec());
        assert_eq!(Response::parse(b""), None);
        assert_eq!(Response::parse(b"?what"), None);
    }

    #[test]
    fn flags_to_request() {
        let flags = RequestFlags { select: Some(2), ..Default::default() };
        assert_eq!(
            flags.request(),
            Ok(Request::Command(Command { kind: CommandKind::Select, argument: 2 }))
        );

        let flags = RequestFlags { select: Some(0), ..Default::default() };
        assert_eq!(flags.request(), Err(UsageError::MissingArgument(CommandKind::Select)));

        let flags = RequestFlags { time: true, ..Default::default() };
        assert_eq!(flags.request(), Ok(Request::Time));

        assert_eq!(RequestFlags::default().request(), Err(UsageError::NoCommand));
    }
}
