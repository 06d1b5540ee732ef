/// Session context handed to the chat engines
///
/// Holds the authenticated user's identity and bearer token. The engines
/// never read ambient storage; whoever constructs them passes this in.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the trainer/member relationship this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Member,
    Trainer,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Session {
    pub user_id: i64,
    pub role: Role,
    pub bearer_token: String,
}

impl Session {
    pub fn new(user_id: i64, role: Role, bearer_token: impl Into<String>) -> Self {
        Self {
            user_id,
            role,
            bearer_token: bearer_token.into(),
        }
    }

    /// Value for the Authorization header
    pub fn auth_header(&self) -> String {
        format!("Bearer {}", self.bearer_token)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Token stays out of logs
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .field("bearer_token", &"<redacted>")
            .finish()
    }
}
