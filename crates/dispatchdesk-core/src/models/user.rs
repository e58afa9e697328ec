use serde::{Deserialize, Serialize};

/// Role name the backend assigns to administrators.
pub const ROLE_ADMIN: &str = "admin";

/// Role name the backend assigns to dispatchers.
pub const ROLE_DISPATCHER: &str = "dispatcher";

/// Profile of the authenticated caller.
///
/// `role` is kept verbatim: deployments add roles (e.g. `driver`) that the
/// client has no reason to reject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct User {
    pub id: i64,
    pub username: String,
    pub role: String,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role.eq_ignore_ascii_case(ROLE_ADMIN)
    }

    pub fn is_dispatcher(&self) -> bool {
        self.role.eq_ignore_ascii_case(ROLE_DISPATCHER)
    }

    /// Short label for status lines, e.g. `alice (driver)`.
    pub fn display_name(&self) -> String {
        format!("{} ({})", self.username, self.role)
    }
}
