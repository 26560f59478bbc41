//! Control command handling.

use tracing::{debug, info, warn};
use umbra_ipc::{Command, CommandKind, DecodeError, Response};

use crate::backend::{Atom, DisplayServer, Window};
use crate::hack::{self, Selection};
use crate::session::{Activation, Session, Shutdown, Wake};

/// Handle a client message sent to an overlay window.
///
/// Messages of foreign types are ignored, everything else is answered through
/// the response property of the receiving window.
pub fn handle_command<B: DisplayServer + 'static>(
    session: &mut Session<B>,
    window: Window,
    message_type: Atom,
    data: [u32; 5],
) {
    let response = match Command::decode(session.backend.atoms(), message_type, data) {
        Ok(command) => {
            debug!("received {} command", command.kind);
            execute(session, command)
        },
        Err(DecodeError::UnknownType(_)) => return,
        Err(err) => {
            warn!("ignoring invalid command: {err}");
            Response::failure(format!("{err}"))
        },
    };

    if let Err(err) = session.backend.set_response(window, &response) {
        warn!("unable to respond to command: {err}");
    }
}

/// Apply a command to the session.
fn execute<B: DisplayServer + 'static>(session: &mut Session<B>, command: Command) -> Response {
    if session.dialog_up() {
        return Response::failure("password dialog is up.");
    }

    let active = session.screens.blanked() || session.wake_pending();

    match command.kind {
        CommandKind::Activate if active => Response::failure("already active."),
        CommandKind::Activate => {
            session.wake(Wake::Activate(Activation::default()));
            Response::success("activating.")
        },
        CommandKind::Deactivate if session.screens.blanked() => {
            session.wake(Wake::Deactivate);
            Response::success("deactivating.")
        },
        CommandKind::Deactivate => {
            session.reset_idle();
            Response::success("not active: idle timer reset.")
        },
        CommandKind::Lock if session.locked() => Response::failure("already locked."),
        CommandKind::Lock if session.screens.blanked() => match session.lock() {
            Ok(()) => Response::success("locking."),
            Err(reason) => Response::failure(format!("unable to lock: {reason}.")),
        },
        CommandKind::Lock if active => Response::failure("already active."),
        CommandKind::Lock => {
            session.wake(Wake::Activate(Activation { lock: true, ..Default::default() }));
            Response::success("locking.")
        },
        CommandKind::Cycle if session.screens.blanked() => {
            switch_hack(session, Selection::Random, "cycling.")
        },
        CommandKind::Cycle => Response::failure("not active."),
        CommandKind::Next => select(session, Selection::Next, false),
        CommandKind::Prev => select(session, Selection::Prev, false),
        CommandKind::Select => select(session, Selection::Index(command.argument as usize), false),
        CommandKind::Demo => {
            let selection = match command.argument {
                0 => Selection::Random,
                index => Selection::Index(index as usize),
            };
            select(session, selection, true)
        },
        CommandKind::Exit | CommandKind::Restart if session.locked() => {
            Response::failure("screen is locked.")
        },
        CommandKind::Exit => {
            info!("exiting on request");
            session.request_shutdown(Shutdown::Exit);
            Response::success("exiting.")
        },
        CommandKind::Restart => {
            info!("restarting on request");
            session.request_shutdown(Shutdown::Restart);
            Response::success("restarting.")
        },
        CommandKind::Prefs => match session.preferences.prefs_command.as_deref() {
            Some(command) => match hack::spawn_detached(command) {
                Ok(()) => Response::success("preferences started."),
                Err(err) => Response::failure(format!("unable to run {command:?}: {err}.")),
            },
            None => Response::failure("no preferences command configured."),
        },
    }
}

/// Run a specific hack, activating the screen saver if necessary.
fn select<B: DisplayServer + 'static>(
    session: &mut Session<B>,
    selection: Selection,
    demo: bool,
) -> Response {
    if let Selection::Index(index) = selection {
        if index == 0 || index > session.program_count() {
            return Response::failure("no such hack.");
        }
    }

    if session.screens.blanked() {
        if demo && !session.demoing() {
            return Response::failure("already active.");
        }
        return switch_hack(session, selection, "activating.");
    }

    if session.wake_pending() {
        return Response::failure("already active.");
    }

    session.wake(Wake::Activate(Activation { selection, demo, lock: false }));

    match demo {
        true => Response::success("demoing."),
        false => Response::success("activating."),
    }
}

fn switch_hack<B: DisplayServer + 'static>(
    session: &mut Session<B>,
    selection: Selection,
    message: &str,
) -> Response {
    match session.switch_hack(selection) {
        Ok(()) => Response::success(message),
        Err(err) => {
            warn!("unable to switch hack: {err}");
            Response::failure(format!("unable to switch hack: {err}."))
        },
    }
}
