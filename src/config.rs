//! Daemon configuration.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use clap::{Args, ValueEnum};
use serde::Deserialize;
use tracing::{error, info};

use crate::error::{Error, Result};

/// Configuration file name inside the config directory.
const CONFIG_FILE: &str = "umbra/umbra.toml";

/// User preferences.
#[derive(Deserialize, Clone, PartialEq, Debug)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Preferences {
    /// Idle seconds before the screen is blanked.
    pub timeout: u64,
    /// Seconds between graphics hack changes.
    pub cycle: u64,
    pub lock: bool,
    /// Seconds between blanking and locking.
    pub lock_timeout: u64,
    /// Seconds the password dialog waits for input.
    pub passwd_timeout: u64,
    pub fade: bool,
    pub unfade: bool,
    pub fade_seconds: u64,
    pub fade_ticks: u32,
    pub verbose: bool,
    pub install_colormap: bool,
    /// Seconds between pointer position checks.
    pub pointer_poll: u64,
    /// Seconds between overlay stacking checks.
    pub watchdog: u64,
    /// Seconds to wait before subscribing to events on new windows.
    pub notice_events_delay: u64,
    pub idle_method: IdleMethod,
    /// Scheduling priority adjustment for graphics hacks.
    pub nice: i32,
    pub visual: String,
    pub prefs_command: Option<String>,
    pub debug: bool,
    #[serde(rename = "program")]
    pub programs: Vec<Program>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            timeout: 600,
            cycle: 600,
            lock: false,
            lock_timeout: 0,
            passwd_timeout: 30,
            fade: true,
            unfade: false,
            fade_seconds: 3,
            fade_ticks: 20,
            verbose: false,
            install_colormap: true,
            pointer_poll: 5,
            watchdog: 60,
            notice_events_delay: 30,
            idle_method: IdleMethod::Auto,
            nice: 10,
            visual: String::from("default"),
            prefs_command: None,
            debug: false,
            programs: Vec::new(),
        }
    }
}

impl Preferences {
    /// Load preferences from a TOML file.
    ///
    /// A missing file results in the default preferences.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(err.into()),
        };

        toml::from_str(&content)
            .map_err(|err| Error::Config { path: path.into(), reason: err.to_string() })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }

    pub fn cycle(&self) -> Option<Duration> {
        (self.cycle > 0).then(|| Duration::from_secs(self.cycle))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout)
    }

    pub fn passwd_timeout(&self) -> Duration {
        Duration::from_secs(self.passwd_timeout.max(1))
    }

    pub fn fade_duration(&self) -> Duration {
        Duration::from_secs(self.fade_seconds)
    }

    pub fn pointer_poll(&self) -> Duration {
        Duration::from_secs(self.pointer_poll.max(1))
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_secs(self.watchdog.max(1))
    }

    pub fn notice_events_delay(&self) -> Duration {
        Duration::from_secs(self.notice_events_delay)
    }
}

/// Idle detection strategy.
#[derive(Deserialize, ValueEnum, Copy, Clone, PartialEq, Eq, Default, Debug)]
#[serde(rename_all = "kebab-case")]
pub enum IdleMethod {
    /// Use the server extension if available, otherwise event selection.
    #[default]
    Auto,
    /// Server screen saver extension notifications.
    Extension,
    /// Key press selection on every window.
    Events,
    /// Pointer position polling only.
    Poll,
}

/// Graphics hack definition.
#[derive(Deserialize, Clone, PartialEq, Eq, Debug)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Program {
    /// Shell command line.
    pub command: String,
    /// Visual the hack should be run on.
    #[serde(default)]
    pub visual: Option<String>,
}

/// Command line overrides for the configuration file.
#[derive(Args, Default, Clone, Debug)]
pub struct DaemonOptions {
    /// X display to connect to.
    #[clap(long, value_name = "DPY")]
    pub display: Option<String>,
    /// Configuration file path.
    #[clap(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Log state transitions.
    #[clap(long)]
    pub verbose: bool,
    /// Lock the screen when blanking.
    #[clap(long)]
    pub lock: bool,
    /// Idle seconds before the screen is blanked.
    #[clap(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,
    /// Seconds between graphics hack changes.
    #[clap(long, value_name = "SECONDS")]
    pub cycle: Option<u64>,
    /// Seconds between blanking and locking.
    #[clap(long, value_name = "SECONDS")]
    pub lock_timeout: Option<u64>,
    /// Disable colormap fading.
    #[clap(long)]
    pub no_fade: bool,
    /// Idle detection strategy.
    #[clap(long, value_enum)]
    pub idle_method: Option<IdleMethod>,
    /// Disable locking and the single instance check.
    #[clap(long)]
    pub debug: bool,
}

impl DaemonOptions {
    /// Apply the command line overrides.
    pub fn apply(&self, preferences: &mut Preferences) {
        preferences.verbose |= self.verbose;
        preferences.lock |= self.lock;
        preferences.debug |= self.debug;
        if self.no_fade {
            preferences.fade = false;
            preferences.unfade = false;
        }
        if let Some(timeout) = self.timeout {
            preferences.timeout = timeout;
        }
        if let Some(cycle) = self.cycle {
            preferences.cycle = cycle;
        }
        if let Some(lock_timeout) = self.lock_timeout {
            preferences.lock_timeout = lock_timeout;
        }
        if let Some(idle_method) = self.idle_method {
            preferences.idle_method = idle_method;
        }
    }
}

/// Configuration file tracking modifications.
#[derive(Debug)]
pub struct ConfigFile {
    path: Option<PathBuf>,
    modified: Option<SystemTime>,
    options: DaemonOptions,
}

impl ConfigFile {
    pub fn new(options: DaemonOptions) -> Self {
        let path =
            options.config.clone().or_else(|| dirs::config_dir().map(|dir| dir.join(CONFIG_FILE)));
        Self { path, options, modified: Default::default() }
    }

    pub fn options(&self) -> &DaemonOptions {
        &self.options
    }

    /// Load the preferences, logging errors and falling back to defaults.
    pub fn load(&mut self) -> Preferences {
        self.modified = self.path.as_deref().and_then(modification_time);

        let mut preferences = match &self.path {
            Some(path) => Preferences::load(path).unwrap_or_else(|err| {
                error!("{err}");
                Preferences::default()
            }),
            None => Preferences::default(),
        };
        self.options.apply(&mut preferences);

        preferences
    }

    /// Reload the preferences if the file changed since the last load.
    pub fn reload(&mut self) -> Option<Preferences> {
        let modified = self.path.as_deref().and_then(modification_time);
        if modified == self.modified {
            return None;
        }

        if let Some(path) = &self.path {
            info!("reloading {path:?}");
        }

        Some(self.load())
    }
}

fn modification_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|metadata| metadata.modified()).ok()
}
