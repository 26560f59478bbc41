//! Credential validation and auditing.

use std::env;
use std::ffi::{CStr, CString};

#[cfg(feature = "pam")]
use tracing::error;
use tracing::{debug, warn};

/// PAM service used for unlocking.
#[cfg(feature = "pam")]
const PAM_SERVICE: &str = "login";

/// Syslog identity for audit messages.
const SYSLOG_IDENT: &[u8] = b"umbra\0";

/// Password validation backend.
pub trait Authenticator {
    /// Check whether `password` unlocks the session.
    fn validate(&mut self, password: &str) -> bool;
}

/// PAM based authenticator.
#[cfg(feature = "pam")]
pub struct PamAuthenticator {
    user: String,
}

#[cfg(feature = "pam")]
impl PamAuthenticator {
    pub fn new(user: String) -> Self {
        Self { user }
    }
}

#[cfg(feature = "pam")]
impl Authenticator for PamAuthenticator {
    fn validate(&mut self, password: &str) -> bool {
        let mut client = match pam::Client::with_password(PAM_SERVICE) {
            Ok(client) => client,
            Err(err) => {
                error!("unable to start PAM conversation: {err:?}");
                return false;
            },
        };

        client.conversation_mut().set_credentials(&self.user, password);

        match client.authenticate() {
            Ok(()) => true,
            Err(err) => {
                debug!("PAM authentication failed: {err:?}");
                false
            },
        }
    }
}

/// Password database authenticator.
///
/// The hash is read once at startup, while the shadow database might still be
/// accessible.
pub struct PasswdAuthenticator {
    hash: String,
}

impl PasswdAuthenticator {
    /// Load the password hash of `user`.
    ///
    /// Returns `None` if no usable hash could be read.
    pub fn new(user: &str) -> Option<Self> {
        let name = CString::new(user).ok()?;

        let hash = shadow_hash(&name).or_else(|| passwd_hash(&name)).filter(|hash| usable(hash));
        match hash {
            Some(hash) => Some(Self { hash }),
            None => {
                warn!("no password hash readable for {user:?}");
                None
            },
        }
    }
}

impl Authenticator for PasswdAuthenticator {
    fn validate(&mut self, password: &str) -> bool {
        let valid = pwhash::unix::verify(password, &self.hash);
        if !valid {
            debug!("password database authentication failed");
        }
        valid
    }
}

/// Hash from the shadow database, which usually requires privileges.
fn shadow_hash(name: &CStr) -> Option<String> {
    unsafe {
        let entry = libc::getspnam(name.as_ptr());
        if entry.is_null() || (*entry).sp_pwdp.is_null() {
            return None;
        }
        Some(CStr::from_ptr((*entry).sp_pwdp).to_string_lossy().into_owned())
    }
}

fn passwd_hash(name: &CStr) -> Option<String> {
    unsafe {
        let entry = libc::getpwnam(name.as_ptr());
        if entry.is_null() || (*entry).pw_passwd.is_null() {
            return None;
        }
        Some(CStr::from_ptr((*entry).pw_passwd).to_string_lossy().into_owned())
    }
}

/// Whether a hash can ever match a password.
///
/// Shadow placeholders and locked accounts cannot be used for unlocking.
fn usable(hash: &str) -> bool {
    hash.len() > 1 && !hash.starts_with(['!', '*']) && hash != "x"
}

/// Authenticator for the current user, if one is available.
pub fn default_authenticator(user: &str) -> Option<Box<dyn Authenticator>> {
    #[cfg(feature = "pam")]
    {
        Some(Box::new(PamAuthenticator::new(user.into())))
    }

    #[cfg(not(feature = "pam"))]
    {
        PasswdAuthenticator::new(user).map(|auth| Box::new(auth) as Box<dyn Authenticator>)
    }
}

/// Name of the user owning this process.
pub fn current_user() -> String {
    unsafe {
        let passwd = libc::getpwuid(libc::getuid());
        if !passwd.is_null() && !(*passwd).pw_name.is_null() {
            return CStr::from_ptr((*passwd).pw_name).to_string_lossy().into_owned();
        }
    }

    env::var("USER").or_else(|_| env::var("LOGNAME")).unwrap_or_else(|_| String::from("unknown"))
}

/// Name of this machine.
pub fn host_name() -> String {
    let mut buffer = [0u8; 256];
    let result = unsafe { libc::gethostname(buffer.as_mut_ptr().cast(), buffer.len()) };

    match CStr::from_bytes_until_nul(&buffer) {
        Ok(name) if result == 0 => name.to_string_lossy().into_owned(),
        _ => String::from("localhost"),
    }
}

/// Record a failed unlock attempt in the system log.
///
/// Missing syslog support is silently ignored.
pub fn audit_failure(display: &str, user: &str, count: u32) {
    let message = format!("FAILED LOGIN {count} ON DISPLAY \"{display}\", FOR \"{user}\"");
    let message = match CString::new(message) {
        Ok(message) => message,
        Err(_) => return,
    };

    unsafe {
        libc::openlog(SYSLOG_IDENT.as_ptr().cast(), libc::LOG_PID, libc::LOG_AUTHPRIV);
        libc::syslog(libc::LOG_NOTICE, b"%s\0".as_ptr().cast(), message.as_ptr());
        libc::closelog();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_is_known() {
        assert!(!current_user().is_empty());
    }

    #[test]
    fn password_database_hashes() {
        let hash = pwhash::sha512_crypt::hash("secret").unwrap();
        let mut authenticator = PasswdAuthenticator { hash };

        assert!(authenticator.validate("secret"));
        assert!(!authenticator.validate("secret "));
        assert!(!authenticator.validate(""));
    }

    #[test]
    fn placeholder_hashes_are_unusable() {
        for hash in ["", "x", "*", "!", "!$6$salt$hash", "*LK*"] {
            assert!(!usable(hash), "{hash:?} must not be usable");
        }
        assert!(usable("$6$salt$hash"));
        assert!(usable("abJnggxhB/yWI"));
    }

    #[test]
    fn unknown_user_has_no_hash() {
        assert!(PasswdAuthenticator::new("umbra-no-such-user").is_none());
        assert!(PasswdAuthenticator::new("nul\0byte").is_none());
    }

    #[test]
    fn audit_never_fails() {
        audit_failure(":0", "user", 1);
        audit_failure(":0", "nul\0byte", 2);
    }
}
