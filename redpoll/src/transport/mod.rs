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

//! The backend transport executes one query attempt against the remote
//! query endpoint, and notifies the backend when a running statement should
//! be aborted.

mod http;
pub use http::HttpTransport;

use crate::error::Result;
use crate::frame::{Frame, WireFrame};
use crate::query::{DataQueryResponse, TimeRange};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// The body of a backend query call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendQueryBody {
    /// The queries with template variables applied. There is exactly one
    /// query per polled session.
    pub queries: Vec<Value>,
    /// The time range.
    pub range:   TimeRange,
    /// Start of the range in epoch milliseconds.
    pub from:    String,
    /// End of the range in epoch milliseconds.
    pub to:      String,
}

impl BackendQueryBody {
    /// Creates a body for the given queries and range.
    pub fn new(queries: Vec<Value>, range: TimeRange) -> Self {
        Self {
            queries,
            from: range.from_millis().to_string(),
            to: range.to_millis().to_string(),
            range,
        }
    }
}

/// Per-call options of a backend query call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// The unique id of this call.
    pub request_id: String,
    /// Bypass the host's response cache.
    pub skip_cache: bool,
}

/// The result of one query inside a backend response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataResponse {
    /// The frames produced by the query.
    #[serde(default)]
    pub frames: Vec<WireFrame>,
    /// The error message, when the query failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error:  Option<String>,
    /// The HTTP-like status of the query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

/// A backend response: results keyed by reference id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendDataSourceResponse {
    /// Results keyed by reference id.
    #[serde(default)]
    pub results: BTreeMap<String, DataResponse>,
}

impl BackendDataSourceResponse {
    /// Converts the backend response into frames. Any per-query error turns
    /// the whole response into an error response that still carries the
    /// frames that came back.
    pub fn into_response(self) -> DataQueryResponse {
        let mut frames = vec![];
        let mut errors = vec![];
        for (ref_id, result) in self.results {
            if let Some(error) = result.error {
                errors.push(error);
            }
            frames.extend(result.frames.into_iter().map(|wire| {
                let mut frame = Frame::from(wire);
                frame.ref_id.get_or_insert_with(|| ref_id.clone());
                frame
            }));
        }

        if errors.is_empty() {
            DataQueryResponse::new(frames)
        } else {
            DataQueryResponse::error(errors.join("; "), frames)
        }
    }
}

/// A single request/response cycle against the query endpoint.
#[async_trait]
pub trait BackendTransport: Debug + Send + Sync {
    /// Issues one query call and returns its frames.
    async fn query(&self, body: BackendQueryBody, options: CallOptions)
        -> Result<DataQueryResponse>;

    /// Asks the backend to abort the statement with the given id.
    async fn cancel(&self, query_id: &str) -> Result<()>;
}
