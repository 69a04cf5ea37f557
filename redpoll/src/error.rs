// Copyright (c) 2020-present, UMD Database Group.
//
// This program is free software: you can use, redistribute, and/or modify
// it under the terms of the GNU Affero General Public License, version 3
// or later ("AGPL"), as published by the Free Software Foundation.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

//! Redpoll error types

use std::error;
use std::fmt::{Display, Formatter};
use std::result;

/// Result type for operations that could result in an [RedpollError]
pub type Result<T> = result::Result<T, RedpollError>;

/// Redpoll error
#[derive(Debug)]
pub enum RedpollError {
    /// Error returned when a backend call fails outright, before any response
    /// could be decoded. Examples include connection resets and non-2xx
    /// status codes.
    Transport(String),
    /// Error associated to the underlying HTTP client.
    Http(reqwest::Error),
    /// Error returned when serde_json failed to serialize or deserialize data.
    SerdeJson(serde_json::Error),
    /// Error reported by the backend for a query that reached the warehouse
    /// but failed there.
    Backend(String),
    /// Error returned when the best-effort cancel notification fails.
    Cancel {
        /// The server-side identifier of the query we tried to cancel.
        query_id: String,
        /// The reason the notification failed.
        reason:   String,
    },
    /// Error returned when a configuration value is missing or malformed.
    Config(String),
    /// Error returned as a consequence of an error in Redpoll.
    /// This error should not happen in normal usage of Redpoll.
    Internal(String),
    /// An error that has already been dealt with and must not be shown to the
    /// user again.
    Handled(Box<RedpollError>),
}

impl RedpollError {
    /// Marks the error as handled, so that the host suppresses any popup.
    pub fn handled(self) -> Self {
        match self {
            RedpollError::Handled(_) => self,
            e => RedpollError::Handled(Box::new(e)),
        }
    }

    /// Returns true if the error has already been reported.
    pub fn is_handled(&self) -> bool {
        matches!(self, RedpollError::Handled(_))
    }
}

impl From<reqwest::Error> for RedpollError {
    fn from(e: reqwest::Error) -> Self {
        RedpollError::Http(e)
    }
}

impl From<serde_json::Error> for RedpollError {
    fn from(e: serde_json::Error) -> Self {
        RedpollError::SerdeJson(e)
    }
}

impl Display for RedpollError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            RedpollError::Transport(ref desc) => write!(f, "Transport error: {}", desc),
            RedpollError::Http(ref desc) => write!(f, "HTTP error: {}", desc),
            RedpollError::SerdeJson(ref desc) => write!(f, "serde_json error: {:?}", desc),
            RedpollError::Backend(ref desc) => write!(f, "Query error: {}", desc),
            RedpollError::Cancel {
                ref query_id,
                ref reason,
            } => write!(f, "error cancelling query ID: {}: {}", query_id, reason),
            RedpollError::Config(ref desc) => write!(f, "Configuration error: {}", desc),
            RedpollError::Internal(ref desc) => write!(
                f,
                "Internal error: {}. This was likely caused by a bug in Redpoll's \
                    code and we would welcome that you file a bug report in our issue tracker",
                desc
            ),
            RedpollError::Handled(ref inner) => write!(f, "{}", inner),
        }
    }
}

impl error::Error for RedpollError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handled_wraps_once() {
        let err = RedpollError::Cancel {
            query_id: "q1".to_string(),
            reason:   "timeout".to_string(),
        };
        assert!(!err.is_handled());

        let err = err.handled().handled();
        assert!(err.is_handled());
        match err {
            RedpollError::Handled(inner) => assert!(!inner.is_handled()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn handled_displays_inner() {
        let err = RedpollError::Backend("relation \"foo\" does not exist".to_string()).handled();
        assert_eq!(
            err.to_string(),
            "Query error: relation \"foo\" does not exist"
        );
    }
}
