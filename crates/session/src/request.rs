//! Search request, identity and credential types

use common::Secret;
use serde::{Deserialize, Serialize};

use crate::Mode;

/// Cookie credential pair for one upstream account.
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub csrf_token: Secret<String>,
    pub session_token: Secret<String>,
}

impl Credentials {
    pub fn new(csrf_token: impl Into<String>, session_token: impl Into<String>) -> Self {
        Self {
            csrf_token: Secret::new(csrf_token.into()),
            session_token: Secret::new(session_token.into()),
        }
    }

    /// Both tokens present and non-blank.
    pub fn is_complete(&self) -> bool {
        !self.csrf_token.is_blank() && !self.session_token.is_blank()
    }
}

/// File sent along with a query.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub filename: String,
    pub data: Vec<u8>,
}

/// One upstream query.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub mode: Mode,
    pub model: Option<String>,
    pub sources: Vec<String>,
    pub attachments: Vec<Attachment>,
    pub language: String,
    pub incognito: bool,
    /// Opaque follow-up context from a previous answer.
    pub follow_up: Option<serde_json::Value>,
}

/// Result of the identity check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub user: Option<serde_json::Value>,
}

impl UserInfo {
    /// Whether the session maps to a signed-in user.
    pub fn is_authenticated(&self) -> bool {
        match &self.user {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::Object(fields)) => !fields.is_empty(),
            Some(serde_json::Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }
}
