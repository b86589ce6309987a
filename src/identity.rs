use crate::config::CHANNEL_PREFIX;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Идентификатор пользователя; стабилен на время сессии приложения
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Identity(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Детерминированное имя rendezvous-канала: `user-<identity>`
    pub fn channel(&self) -> String {
        format!("{}{}", CHANNEL_PREFIX, self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Identity(s.to_owned())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Identity(s)
    }
}
