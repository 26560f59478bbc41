use std::env;
use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::process::{self, Command};

use clap::{Parser, Subcommand};
use tracing::{error, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use umbra_ipc::{ControlError, ControlOptions};

use crate::backend::DisplayServer;
use crate::config::{ConfigFile, DaemonOptions, Preferences};
use crate::error::{Error, Result};
use crate::session::{Runner, Shutdown};
use crate::x11::X11Backend;

mod auth;
mod backend;
mod config;
mod error;
mod hack;
mod ipc_server;
mod lock;
mod session;
mod signals;
#[cfg(test)]
mod testing;
mod timers;
mod visual;
mod windows;
mod x11;

/// Default log directives.
const LOG_DIRECTIVES: &str = "warn,umbra=info";

/// Log directives with `--verbose`.
const VERBOSE_LOG_DIRECTIVES: &str = "warn,umbra=debug";

/// Command line arguments.
#[derive(Parser, Debug)]
#[clap(author, about, version, max_term_width = 80)]
struct Options {
    #[clap(flatten)]
    daemon: DaemonOptions,

    #[clap(subcommand)]
    subcommands: Option<Subcommands>,
}

#[derive(Subcommand, Debug)]
enum Subcommands {
    /// Send a command to the running daemon.
    Command(ControlOptions),
}

pub fn main() {
    let options = Options::parse_from(normalize_args(env::args_os()));

    // Setup logging.
    let directives = env::var("RUST_LOG").ok();
    let verbose = options.subcommands.is_none() && options.daemon.verbose;
    let builder = FmtSubscriber::builder()
        .with_env_filter(log_filter(directives.as_deref(), verbose))
        .with_line_number(true)
        .with_filter_reloading();
    let filter_handle = builder.reload_handle();
    builder.init();

    let daemon_options = match options.subcommands {
        Some(Subcommands::Command(options)) => process::exit(control(&options)),
        None => options.daemon,
    };

    let mut config = ConfigFile::new(daemon_options);
    let preferences = config.load();

    // Verbosity can also be enabled by the configuration file.
    if preferences.verbose && !verbose && directives.is_none() {
        if let Err(err) = filter_handle.reload(log_filter(None, true)) {
            warn!("unable to raise log level: {err}");
        }
    }

    match daemon(config, preferences) {
        Ok(Shutdown::Exit) => (),
        Ok(Shutdown::Restart) => restart(),
        Err(err) => saver_exit(err),
    }
}

/// Run the screen saver until it is asked to exit.
fn daemon(config: ConfigFile, preferences: Preferences) -> Result<Shutdown> {
    let backend = X11Backend::connect(config.options().display.as_deref())?;

    if let Some(fd) = backend.raw_fd() {
        signals::set_connection(fd, backend.atoms().__SWM_VROOT);
    }
    signals::install_panic_hook();

    let mut runner = Runner::new(backend, preferences, Some(config))?;
    let result = runner.run();
    runner.session.cleanup();

    result
}

/// Execute a control tool request, returning the exit status.
fn control(options: &ControlOptions) -> i32 {
    match umbra_ipc::run(options) {
        Ok(message) => {
            println!("{message}");
            0
        },
        Err(err @ (ControlError::Usage(_) | ControlError::Display(_))) => {
            eprintln!("\x1b[31merror\x1b[0m: {err}");
            1
        },
        // Remote failures are reported, but never fatal to the caller.
        Err(err) => {
            eprintln!("\x1b[31merror\x1b[0m: {err}");
            0
        },
    }
}

/// Replace this process with a fresh instance.
fn restart() -> ! {
    let err = match env::current_exe() {
        Ok(executable) => Command::new(executable).args(env::args_os().skip(1)).exec(),
        Err(err) => err,
    };

    error!("unable to restart: {err}");
    process::exit(1);
}

/// Exit after an unrecoverable error.
///
/// Protocol errors indicate a bug and abort to leave a core dump behind.
fn saver_exit(err: Error) -> ! {
    error!("{err}");

    if err.is_protocol() {
        eprintln!("umbra: this is a bug, please report it with the output of `umbra --verbose`");
        process::abort();
    }

    process::exit(1);
}

fn log_filter(directives: Option<&str>, verbose: bool) -> EnvFilter {
    let directives = match (directives, verbose) {
        (Some(directives), _) => directives,
        (None, true) => VERBOSE_LOG_DIRECTIVES,
        (None, false) => LOG_DIRECTIVES,
    };
    EnvFilter::builder().parse_lossy(directives)
}

/// Accept single-dash long flags like `-activate`.
fn normalize_args(args: impl IntoIterator<Item = OsString>) -> Vec<OsString> {
    args.into_iter()
        .map(|arg| match arg.to_str() {
            Some(flag) if is_single_dash_long(flag) => OsString::from(format!("-{flag}")),
            _ => arg,
        })
        .collect()
}

fn is_single_dash_long(arg: &str) -> bool {
    let mut chars = arg.chars();
    arg.len() > 2
        && chars.next() == Some('-')
        && chars.next().map_or(false, |c| c.is_ascii_alphabetic())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use umbra_ipc::{Command as IpcCommand, CommandKind, Request};

    use super::*;

    fn parse(args: &[&str]) -> Options {
        let args = args.iter().map(OsString::from);
        Options::try_parse_from(normalize_args(args)).unwrap()
    }

    #[test]
    fn cli_is_consistent() {
        Options::command().debug_assert();
    }

    #[test]
    fn single_dash_flags() {
        let args = ["umbra", "command", "-select", "-3", "-h", "--lock"].map(OsString::from);
        let normalized = normalize_args(args);
        assert_eq!(normalized, ["umbra", "command", "--select", "-3", "-h", "--lock"]);
    }

    #[test]
    fn control_requests() {
        let options = match parse(&["umbra", "command", "-select", "2"]).subcommands {
            Some(Subcommands::Command(options)) => options,
            None => panic!("missing control command"),
        };

        let command = IpcCommand::new(CommandKind::Select, 2).unwrap();
        assert_eq!(options.request.request(), Ok(Request::Command(command)));
    }

    #[test]
    fn demo_without_argument() {
        let options = match parse(&["umbra", "command", "-demo"]).subcommands {
            Some(Subcommands::Command(options)) => options,
            None => panic!("missing control command"),
        };

        let command = IpcCommand::new(CommandKind::Demo, 0).unwrap();
        assert_eq!(options.request.request(), Ok(Request::Command(command)));
    }

    #[test]
    fn daemon_options() {
        let options = parse(&["umbra", "-timeout", "5", "--no-fade", "--idle-method", "poll"]);
        assert!(options.subcommands.is_none());
        assert_eq!(options.daemon.timeout, Some(5));
        assert!(options.daemon.no_fade);
        assert_eq!(options.daemon.idle_method, Some(config::IdleMethod::Poll));
    }

    #[test]
    fn verbose_filter() {
        assert!(log_filter(None, true).to_string().contains("umbra=debug"));
        assert!(log_filter(None, false).to_string().contains("umbra=info"));
    }
}
