//! Caller identity and the posting rules derived from it.
//!
//! Authentication happens upstream; the core receives an already verified
//! [`Actor`] and only decides what that actor may do.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role of an authenticated caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Moderator,
    System,
    #[default]
    User,
}

impl Role {
    /// Privileged roles may post into any room and notify any user.
    #[must_use]
    pub fn is_privileged(self) -> bool {
        matches!(self, Role::Admin | Role::Moderator | Role::System)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Moderator => "moderator",
            Role::System => "system",
            Role::User => "user",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "moderator" => Ok(Role::Moderator),
            "system" => Ok(Role::System),
            "user" | "" => Ok(Role::User),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    #[must_use]
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: id.into(), role }
    }

    /// A regular user.
    #[must_use]
    pub fn user(id: impl Into<String>) -> Self {
        Self::new(id, Role::User)
    }

    /// Check whether a room identifier embeds this actor's identity.
    ///
    /// Room ids are split on `:` and `_`; any segment equal to the actor id
    /// counts (`dm:alice_bob` embeds both `alice` and `bob`).
    #[must_use]
    pub fn is_named_in(&self, room_id: &str) -> bool {
        room_id
            .split([':', '_'])
            .any(|segment| !segment.is_empty() && segment == self.id)
    }

    /// Whether this actor may post into `room_id`, optionally addressing
    /// `receiver_id`.
    #[must_use]
    pub fn can_post(&self, room_id: &str, receiver_id: Option<&str>) -> bool {
        self.role.is_privileged()
            || self.is_named_in(room_id)
            || receiver_id.is_some_and(|r| r == self.id)
    }

    /// Whether this actor may publish a notification to `user_id`.
    #[must_use]
    pub fn can_notify(&self, user_id: &str) -> bool {
        self.role.is_privileged() || self.id == user_id
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.role)
    }
}
