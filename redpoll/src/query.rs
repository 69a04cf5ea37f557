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

//! The query interface shared with the host: the user-authored query target,
//! the request envelope that carries a batch of targets, and the response
//! emitted back to the host.

use crate::error::{RedpollError, Result};
use crate::frame::Frame;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::convert::TryFrom;

/// How the user has chosen to represent the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum FormatOptions {
    /// Long-to-wide time series.
    TimeSeries,
    /// A plain table.
    Table,
    /// Log lines.
    Logs,
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions::Table
    }
}

impl From<FormatOptions> for u32 {
    fn from(format: FormatOptions) -> u32 {
        match format {
            FormatOptions::TimeSeries => 0,
            FormatOptions::Table => 1,
            FormatOptions::Logs => 2,
        }
    }
}

impl TryFrom<u32> for FormatOptions {
    type Error = RedpollError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(FormatOptions::TimeSeries),
            1 => Ok(FormatOptions::Table),
            2 => Ok(FormatOptions::Logs),
            v => Err(RedpollError::Internal(format!("unknown format option {}", v))),
        }
    }
}

/// How missing points of a time series are filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum FillValueOptions {
    /// Repeat the previous value.
    Previous,
    /// Insert nulls.
    Null,
    /// Insert a fixed value.
    Value,
}

impl From<FillValueOptions> for u32 {
    fn from(mode: FillValueOptions) -> u32 {
        match mode {
            FillValueOptions::Previous => 0,
            FillValueOptions::Null => 1,
            FillValueOptions::Value => 2,
        }
    }
}

impl TryFrom<u32> for FillValueOptions {
    type Error = RedpollError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(FillValueOptions::Previous),
            1 => Ok(FillValueOptions::Null),
            2 => Ok(FillValueOptions::Value),
            v => Err(RedpollError::Internal(format!("unknown fill mode {}", v))),
        }
    }
}

/// The fill-mode selector of a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillMode {
    /// The fill strategy.
    pub mode:  FillValueOptions,
    /// The value used by [`FillValueOptions::Value`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl Default for FillMode {
    fn default() -> Self {
        FillMode {
            mode:  FillValueOptions::Previous,
            value: None,
        }
    }
}

/// A reference to a datasource instance on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceRef {
    /// The datasource plugin type.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub ds_type: Option<String>,
    /// The datasource unique id.
    pub uid:     String,
}

/// A user-authored query unit.
///
/// The core never mutates a target in place: polling produces a copy carrying
/// the backend's query id (see [`DataQuery::with_query_id`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQuery {
    /// Identifies the query inside a panel.
    #[serde(default)]
    pub ref_id:     String,
    /// The SQL statement.
    #[serde(rename = "rawSQL", default)]
    pub raw_sql:    String,
    /// The output format.
    #[serde(default)]
    pub format:     FormatOptions,
    /// Schema hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema:     Option<String>,
    /// Table hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table:      Option<String>,
    /// Column hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column:     Option<String>,
    /// The fill-mode selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_mode:  Option<FillMode>,
    /// Hidden targets are never executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hide:       Option<bool>,
    /// The backend statement id, set on re-polls of a running query.
    #[serde(rename = "queryID", default, skip_serializing_if = "Option::is_none")]
    pub query_id:   Option<String>,
    /// The datasource the target belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource: Option<DataSourceRef>,
    /// Any other field the host attached to the target.
    #[serde(flatten)]
    pub extra:      BTreeMap<String, Value>,
}

impl DataQuery {
    /// Creates a new target.
    pub fn new<T>(ref_id: T, raw_sql: T) -> Self
    where
        T: Into<String>,
    {
        Self {
            ref_id: ref_id.into(),
            raw_sql: raw_sql.into(),
            ..Default::default()
        }
    }

    /// Returns true if the target has a statement to run.
    pub fn is_runnable(&self) -> bool {
        !self.raw_sql.is_empty()
    }

    /// Returns true if the target is hidden.
    pub fn is_hidden(&self) -> bool {
        self.hide.unwrap_or(false)
    }

    /// Returns a copy of the target that re-polls the given statement.
    pub fn with_query_id(&self, query_id: &str) -> Self {
        Self {
            query_id: Some(query_id.to_owned()),
            ..self.clone()
        }
    }

    /// Returns the canonical string identity of the target.
    ///
    /// Two targets with the same fields yield the same fingerprint regardless
    /// of the order the fields were declared or received in. No normalization
    /// of the SQL text takes place.
    pub fn fingerprint(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        Ok(canonical_json(&value))
    }
}

/// Serializes a JSON value with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            let body = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{}}}", body)
        }
        Value::Array(values) => format!(
            "[{}]",
            values
                .iter()
                .map(canonical_json)
                .collect::<Vec<_>>()
                .join(",")
        ),
        other => other.to_string(),
    }
}

/// The time range of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive start.
    pub from: DateTime<Utc>,
    /// Inclusive end.
    pub to:   DateTime<Utc>,
}

impl TimeRange {
    /// Creates a new time range.
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// Returns the range ending now and spanning `span`.
    pub fn last(span: std::time::Duration) -> Result<Self> {
        let to = Utc::now();
        let span = chrono::Duration::from_std(span)
            .map_err(|e| RedpollError::Internal(format!("invalid time span: {}", e)))?;
        Ok(Self { from: to - span, to })
    }

    /// The start as epoch milliseconds.
    pub fn from_millis(&self) -> i64 {
        self.from.timestamp_millis()
    }

    /// The end as epoch milliseconds.
    pub fn to_millis(&self) -> i64 {
        self.to.timestamp_millis()
    }
}

/// A batch query request issued by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQueryRequest {
    /// Unique identifier of the request.
    pub request_id:      String,
    /// The time range to query.
    pub range:           TimeRange,
    /// The suggested interval between two points.
    #[serde(default)]
    pub interval_ms:     u64,
    /// The maximum number of points the panel can render.
    #[serde(default)]
    pub max_data_points: u64,
    /// The targets to run.
    pub targets:         Vec<DataQuery>,
    /// Template variables scoped to this request.
    #[serde(default)]
    pub scoped_vars:     HashMap<String, String>,
}

impl DataQueryRequest {
    /// Creates a new request.
    pub fn new<T>(request_id: T, range: TimeRange, targets: Vec<DataQuery>) -> Self
    where
        T: Into<String>,
    {
        Self {
            request_id: request_id.into(),
            range,
            interval_ms: 0,
            max_data_points: 0,
            targets,
            scoped_vars: HashMap::new(),
        }
    }

    /// Returns a copy of the request narrowed to one target and tagged with a
    /// new request id.
    pub fn narrowed<T>(&self, request_id: T, target: DataQuery) -> Self
    where
        T: Into<String>,
    {
        Self {
            request_id: request_id.into(),
            targets: vec![target],
            ..self.clone()
        }
    }
}

/// The loading state of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadingState {
    /// Nothing has been requested yet.
    NotStarted,
    /// A request is in flight and nothing can be shown.
    Loading,
    /// Partial results are available and more are coming.
    Streaming,
    /// The final result.
    Done,
    /// The query failed.
    Error,
}

/// One emission of a query stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQueryResponse {
    /// The frames accumulated so far.
    pub data:  Vec<Frame>,
    /// The loading state.
    pub state: LoadingState,
    /// The id of the request that produced the emission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key:   Option<String>,
    /// The error message when `state` is [`LoadingState::Error`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DataQueryResponse {
    /// Creates a completed response.
    pub fn new(data: Vec<Frame>) -> Self {
        Self {
            data,
            state: LoadingState::Done,
            key: None,
            error: None,
        }
    }

    /// Creates a completed response without frames.
    pub fn empty() -> Self {
        Self::new(vec![])
    }

    /// Creates a failed response.
    pub fn error<T>(message: T, data: Vec<Frame>) -> Self
    where
        T: Into<String>,
    {
        Self {
            data,
            state: LoadingState::Error,
            key: None,
            error: Some(message.into()),
        }
    }

    /// Returns true if the response reports a failure.
    pub fn is_error(&self) -> bool {
        self.state == LoadingState::Error
    }

    /// Turns a failed response into a backend error.
    pub fn into_result(self) -> Result<Self> {
        if self.is_error() {
            let message = self
                .error
                .unwrap_or_else(|| "query failed without a message".to_owned());
            return Err(RedpollError::Backend(message));
        }
        Ok(self)
    }
}
