//! JSON chat protocol served by the `taskwire-server` binary.
//!
//! Requests and responses are JSON objects tagged by `type`:
//!
//! | request                                   | response                                            |
//! |-------------------------------------------|-----------------------------------------------------|
//! | `{"type":"message","user":..,"text":..}`  | the same message, echoed back                       |
//! | `{"type":"username_validity","value":..}` | `{"type":"username_validity_response","value":b}`   |
//! | anything else                             | `{"type":"error","text":..}`                        |

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dispatch::RequestProcessor;

/// Default port of the chat server.
pub const DEFAULT_PORT: u16 = 39722;

/// Usernames are at least three word characters.
pub const USERNAME_PATTERN: &str = r"^\w{3,}$";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatRequest {
    Message { user: String, text: String },
    UsernameValidity { value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatResponse {
    Message { user: String, text: String },
    UsernameValidityResponse { value: bool },
    Error { text: String },
}

/// Answers chat requests.
#[derive(Debug, Clone)]
pub struct ChatProcessor {
    username: Regex,
}

impl ChatProcessor {
    /// # Errors
    ///
    /// Returns an error if the username pattern fails to compile.
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            username: Regex::new(USERNAME_PATTERN)?,
        })
    }

    #[must_use]
    pub fn is_valid_username(&self, name: &str) -> bool {
        self.username.is_match(name)
    }

    #[must_use]
    pub fn respond(&self, request: ChatRequest) -> ChatResponse {
        match request {
            ChatRequest::Message { user, text } => ChatResponse::Message { user, text },
            ChatRequest::UsernameValidity { value } => ChatResponse::UsernameValidityResponse {
                value: self.is_valid_username(&value),
            },
        }
    }
}

#[async_trait]
impl RequestProcessor for ChatProcessor {
    async fn process(&self, request: Bytes) -> Bytes {
        let response = match serde_json::from_slice::<ChatRequest>(&request) {
            Ok(request) => self.respond(request),
            Err(e) => {
                warn!("malformed chat request: {e}");
                ChatResponse::Error {
                    text: format!("malformed request: {e}"),
                }
            }
        };
        match serde_json::to_vec(&response) {
            Ok(encoded) => Bytes::from(encoded),
            Err(e) => {
                warn!("failed to encode chat response: {e}");
                Bytes::new()
            }
        }
    }
}
