use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::MonitorError;

pub const ADMIN_USERNAME: &str = "admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    /// Role is presentation-level only: it gates which controls are
    /// offered, not what the broker will accept.
    pub fn from_username(username: &str) -> Self {
        if username.eq_ignore_ascii_case(ADMIN_USERNAME) {
            Self::Admin
        } else {
            Self::User
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
        }
    }
}

/// One authenticated dashboard session. A fresh login always gets a fresh
/// client id so a stale broker session cannot bleed into the new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSession {
    pub username: String,
    pub role: Role,
    pub client_id: String,
}

impl UserSession {
    pub fn login(username: &str, password: &str) -> Result<(Self, String), MonitorError> {
        let (username, password) = validate_credentials(username, password)?;
        let role = Role::from_username(&username);
        let session = Self {
            username,
            role,
            client_id: new_client_id(),
        };
        Ok((session, password))
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Trims both fields and rejects empty ones. The password is returned to
/// the caller for the broker handshake and never stored.
pub fn validate_credentials(
    username: &str,
    password: &str,
) -> Result<(String, String), MonitorError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(MonitorError::validation("username must not be empty"));
    }
    let password = password.trim();
    if password.is_empty() {
        return Err(MonitorError::validation("password must not be empty"));
    }
    Ok((username.to_string(), password.to_string()))
}

pub fn new_client_id() -> String {
    format!("env-monitor-{}", random_hex(8))
}

/// Lowercase hex string of the requested length from the OS generator.
pub fn random_hex(chars: usize) -> String {
    let mut bytes = vec![0u8; chars.div_ceil(2)];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let mut hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    hex.truncate(chars);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_trims_and_assigns_roles() {
        let (session, password) = UserSession::login("  admin  ", " hunter2 ").unwrap();
        assert_eq!(session.username, "admin");
        assert_eq!(session.role, Role::Admin);
        assert!(session.is_admin());
        assert_eq!(password, "hunter2");

        let (session, _) = UserSession::login("carol", "pw").unwrap();
        assert_eq!(session.role, Role::User);
        assert!(!session.is_admin());
    }

    #[test]
    fn admin_match_is_case_insensitive() {
        assert_eq!(Role::from_username("Admin"), Role::Admin);
        assert_eq!(Role::from_username("ADMIN"), Role::Admin);
        assert_eq!(Role::from_username("administrator"), Role::User);
    }

    #[test]
    fn blank_credentials_are_rejected() {
        assert!(UserSession::login("", "pw").is_err());
        assert!(UserSession::login("   ", "pw").is_err());
        assert!(UserSession::login("user", "").is_err());
        assert!(UserSession::login("user", "  ").is_err());
    }

    #[test]
    fn client_ids_have_the_expected_shape() {
        let id = new_client_id();
        let suffix = id.strip_prefix("env-monitor-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fresh_logins_get_fresh_client_ids() {
        let (first, _) = UserSession::login("admin", "pw").unwrap();
        let (second, _) = UserSession::login("admin", "pw").unwrap();
        assert_ne!(first.client_id, second.client_id);
    }

    #[test]
    fn random_hex_handles_odd_lengths() {
        assert_eq!(random_hex(9).len(), 9);
        assert_eq!(random_hex(0).len(), 0);
    }
}
