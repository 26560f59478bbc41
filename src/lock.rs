//! Password dialog state machine.

use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{self, Ordering};
use std::time::Duration;
use std::{ptr, str};

use crate::auth::Authenticator;
use crate::backend::{DialogView, DisplayServer, Key};
use crate::error::Result;

/// Interval between countdown redraws.
pub const TICK: Duration = Duration::from_millis(166);

/// Duration the final status message stays visible.
pub const FLASH_DURATION: Duration = Duration::from_secs(1);

/// Size of the password buffer in bytes.
pub const PASSWORD_CAPACITY: usize = 80;

/// Maximum number of password bytes.
pub const MAX_PASSWORD_LEN: usize = PASSWORD_CAPACITY - 2;

/// Status shown while the authenticator is running.
const CHECKING_MESSAGE: &str = "Checking...";

/// Character used to mask typed input.
const MASK_CHAR: char = '*';

/// Fixed-size password storage which is zeroed on every clear and on drop.
pub struct PasswordBuffer {
    bytes: [u8; PASSWORD_CAPACITY],
    len: usize,
}

impl Default for PasswordBuffer {
    fn default() -> Self {
        Self { bytes: [0; PASSWORD_CAPACITY], len: 0 }
    }
}

impl Drop for PasswordBuffer {
    fn drop(&mut self) {
        self.clear();
    }
}

impl Debug for PasswordBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordBuffer").field("len", &self.len).finish_non_exhaustive()
    }
}

impl PasswordBuffer {
    /// Append a character.
    ///
    /// Returns `false` without modifying the buffer if it is full.
    pub fn push(&mut self, c: char) -> bool {
        let mut encoded = [0; 4];
        let encoded = c.encode_utf8(&mut encoded).as_bytes();
        if self.len + encoded.len() > MAX_PASSWORD_LEN {
            return false;
        }

        self.bytes[self.len..self.len + encoded.len()].copy_from_slice(encoded);
        self.len += encoded.len();

        true
    }

    /// Remove the last character.
    ///
    /// Returns `false` if the buffer was empty.
    pub fn pop(&mut self) -> bool {
        let last_len = match self.as_str().chars().next_back() {
            Some(c) => c.len_utf8(),
            None => return false,
        };

        for byte in &mut self.bytes[self.len - last_len..self.len] {
            unsafe { ptr::write_volatile(byte, 0) };
        }
        self.len -= last_len;

        true
    }

    /// Zero the entire buffer.
    pub fn clear(&mut self) {
        for byte in &mut self.bytes {
            unsafe { ptr::write_volatile(byte, 0) };
        }
        atomic::compiler_fence(Ordering::SeqCst);
        self.len = 0;
    }

    pub fn as_str(&self) -> &str {
        str::from_utf8(&self.bytes[..self.len]).unwrap_or_default()
    }

    /// Number of typed characters.
    pub fn char_count(&self) -> usize {
        self.as_str().chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether every byte of the buffer is zero.
    #[cfg(test)]
    pub fn is_zeroed(&self) -> bool {
        self.bytes.iter().all(|byte| *byte == 0)
    }
}

/// Password dialog state.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PasswdState {
    Reading,
    Ok,
    /// Empty password submitted.
    Null,
    Fail,
    Cancel,
    Timeout,
}

impl PasswdState {
    pub fn is_terminal(&self) -> bool {
        *self != Self::Reading
    }

    /// Status message flashed after leaving the reading state.
    pub fn message(&self) -> Option<&'static str> {
        match self {
            Self::Reading | Self::Ok => None,
            Self::Null => Some(""),
            Self::Timeout => Some("Timed out!"),
            Self::Fail | Self::Cancel => Some("Sorry!"),
        }
    }
}

/// Result of a key press.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum KeyOutcome {
    /// Password field changed.
    Edited,
    /// Input was rejected.
    Bell,
    /// Password should be validated.
    Submit,
    /// Dialog reached a terminal state.
    Finished,
    Ignored,
}

/// Password entry dialog.
#[derive(Debug)]
pub struct PasswdDialog {
    state: PasswdState,
    buffer: PasswordBuffer,
    message: Option<&'static str>,
    ratio: f32,
    decrement: f32,
    caret: u8,
}

impl PasswdDialog {
    pub fn new(timeout: Duration) -> Self {
        let ticks = timeout.as_secs_f32() / TICK.as_secs_f32();
        Self {
            decrement: 1. / ticks.max(1.),
            state: PasswdState::Reading,
            ratio: 1.,
            buffer: Default::default(),
            message: Default::default(),
            caret: Default::default(),
        }
    }

    pub fn state(&self) -> PasswdState {
        self.state
    }

    /// Remaining fraction of the password timeout.
    #[cfg(test)]
    pub fn ratio(&self) -> f32 {
        self.ratio
    }

    #[cfg(test)]
    pub fn buffer(&self) -> &PasswordBuffer {
        &self.buffer
    }

    /// Process a key press while reading.
    pub fn handle_key(&mut self, key: Key) -> KeyOutcome {
        if self.state != PasswdState::Reading || self.message == Some(CHECKING_MESSAGE) {
            return KeyOutcome::Ignored;
        }

        self.caret = (self.caret + 1) % 4;

        match key {
            Key::Backspace if self.buffer.pop() => KeyOutcome::Edited,
            Key::Backspace => KeyOutcome::Bell,
            Key::KillLine => {
                self.buffer.clear();
                KeyOutcome::Edited
            },
            Key::Enter if self.buffer.is_empty() => {
                self.finish(PasswdState::Null);
                KeyOutcome::Finished
            },
            Key::Enter => {
                self.message = Some(CHECKING_MESSAGE);
                KeyOutcome::Submit
            },
            Key::Escape => {
                self.finish(PasswdState::Cancel);
                KeyOutcome::Finished
            },
            Key::Char(c) if !c.is_control() => match self.buffer.push(c) {
                true => KeyOutcome::Edited,
                false => KeyOutcome::Bell,
            },
            Key::Char(_) | Key::Other => KeyOutcome::Ignored,
        }
    }

    /// Validate the typed password.
    pub fn submit(&mut self, authenticator: &mut dyn Authenticator) -> PasswdState {
        if self.state != PasswdState::Reading {
            return self.state;
        }

        let state = match authenticator.validate(self.buffer.as_str()) {
            true => PasswdState::Ok,
            false => PasswdState::Fail,
        };
        self.finish(state);

        state
    }

    /// Advance the countdown.
    ///
    /// Returns `true` if the dialog timed out.
    pub fn tick(&mut self) -> bool {
        if self.state != PasswdState::Reading {
            return false;
        }

        self.ratio -= self.decrement;
        if self.ratio < 0. {
            self.ratio = 0.;
            self.finish(PasswdState::Timeout);
            return true;
        }

        false
    }

    /// Masked representation of the password field.
    pub fn mask(&self) -> String {
        MASK_CHAR.to_string().repeat(self.buffer.char_count())
    }

    /// Render the dialog.
    pub fn draw<B: DisplayServer>(&self, backend: &mut B, user: &str) -> Result<()> {
        let mask = self.mask();
        let view = DialogView {
            user,
            mask: &mask,
            caret: self.caret,
            ratio: self.ratio,
            message: self.message,
        };
        backend.draw_dialog(&view)
    }

    fn finish(&mut self, state: PasswdState) {
        self.state = state;
        self.message = state.message();
        self.buffer.clear();
    }
}

/// Failed unlock attempts since the last successful one.
#[derive(Default, Debug)]
pub struct FailureLog {
    count: u32,
}

impl FailureLog {
    /// Record a failed attempt, returning the new count.
    pub fn record(&mut self) -> u32 {
        self.count += 1;
        self.count
    }

    #[cfg(test)]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Reset the count after a successful unlock.
    ///
    /// Returns the consolidated warning if any attempts failed.
    pub fn success(&mut self) -> Option<String> {
        let count = std::mem::take(&mut self.count);
        match count {
            0 => None,
            1 => Some(String::from("WARNING: 1 failed attempt to unlock the screen.")),
            count => Some(format!("WARNING: {count} failed attempts to unlock the screen.")),
        }
    }
}
