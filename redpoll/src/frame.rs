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

//! A [`Frame`] is a single result table returned by a query execution. Frames
//! travel from the backend to the host in the data-plane wire shape
//! ([`WireFrame`]): a schema describing the fields and a column-major matrix of
//! values.

use crate::registry::QueryStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Statuses reported by the backend while a statement is still executing.
pub const RUNNING_STATUSES: [&str; 3] = ["started", "submitted", "running"];

/// Returns true if the backend status is non-terminal.
pub fn is_running(status: Option<&str>) -> bool {
    status.map_or(false, |s| RUNNING_STATUSES.contains(&s))
}

/// A named column of values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// The column name.
    pub name:       String,
    /// The column type as reported by the backend, e.g. `time` or `number`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<String>,
    /// The column values.
    #[serde(default)]
    pub values:     Vec<Value>,
}

impl Field {
    /// Creates a new field.
    pub fn new<T>(name: T, values: Vec<Value>) -> Self
    where
        T: Into<String>,
    {
        Self {
            name: name.into(),
            field_type: None,
            values,
        }
    }
}

/// Metadata attached to a frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMeta {
    /// The statement the backend actually ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_query_string:        Option<String>,
    /// Visualization hint: `graph`, `table` or `logs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_visualisation_type: Option<String>,
    /// Datasource specific metadata. For long-running queries this holds a
    /// [`CustomMeta`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom:                       Option<Value>,
}

/// The custom metadata of a frame whose query may still be executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomMeta {
    /// The server-side identifier of the statement.
    #[serde(rename = "queryID")]
    pub query_id: String,
    /// The backend status string, e.g. `submitted` or `finished`.
    pub status:   String,
}

impl CustomMeta {
    /// Extracts the custom metadata from an opaque value. Both `queryID` and
    /// `status` must be present.
    pub fn from_value(value: &Value) -> Option<CustomMeta> {
        let obj = value.as_object()?;
        match (obj.get("queryID"), obj.get("status")) {
            (Some(query_id), Some(status)) => Some(CustomMeta {
                query_id: json_to_string(query_id),
                status:   json_to_string(status),
            }),
            _ => None,
        }
    }

    /// Returns true if the statement has not reached a terminal status.
    pub fn is_running(&self) -> bool {
        is_running(Some(&self.status))
    }

    /// Returns the status in the registry's vocabulary.
    pub fn query_status(&self) -> QueryStatus {
        QueryStatus::from_backend(&self.status)
    }
}

fn json_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// An immutable result table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    /// The frame name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name:   Option<String>,
    /// The reference id of the query that produced the frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
    /// The columns.
    #[serde(default)]
    pub fields: Vec<Field>,
    /// Optional metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta:   Option<FrameMeta>,
}

impl Frame {
    /// Creates an empty frame with the given name.
    pub fn new<T>(name: T) -> Self
    where
        T: Into<String>,
    {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Appends a column.
    pub fn with_field<T>(mut self, name: T, values: Vec<Value>) -> Self
    where
        T: Into<String>,
    {
        self.fields.push(Field::new(name, values));
        self
    }

    /// Sets the custom metadata of a long-running query.
    pub fn with_custom_meta(mut self, query_id: &str, status: &str) -> Self {
        let custom = serde_json::json!({ "queryID": query_id, "status": status });
        self.meta.get_or_insert_with(FrameMeta::default).custom = Some(custom);
        self
    }

    /// Returns the number of columns.
    pub fn num_columns(&self) -> usize {
        self.fields.len()
    }

    /// Returns the number of rows, i.e. the length of the first column.
    pub fn num_rows(&self) -> usize {
        self.fields.first().map_or(0, |f| f.values.len())
    }

    /// Returns the long-running query metadata, if the backend attached any.
    pub fn custom_meta(&self) -> Option<CustomMeta> {
        self.meta
            .as_ref()
            .and_then(|m| m.custom.as_ref())
            .and_then(CustomMeta::from_value)
    }
}

/// A field description inside a [`WireSchema`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireField {
    /// The column name.
    #[serde(default)]
    pub name:       String,
    /// The column type.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<String>,
}

/// The schema half of a data-plane frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireSchema {
    /// The frame name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name:   Option<String>,
    /// The reference id of the producing query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
    /// Column descriptions, in column order.
    #[serde(default)]
    pub fields: Vec<WireField>,
    /// Frame metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta:   Option<FrameMeta>,
}

/// The data half of a data-plane frame: one vector per column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireData {
    /// Column-major values.
    #[serde(default)]
    pub values: Vec<Vec<Value>>,
}

/// A frame as it is encoded on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireFrame {
    /// Field names, types and metadata.
    #[serde(default)]
    pub schema: WireSchema,
    /// Values; absent when the frame only carries metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data:   Option<WireData>,
}

impl From<WireFrame> for Frame {
    fn from(wire: WireFrame) -> Self {
        let mut columns = wire.data.map(|d| d.values).unwrap_or_default().into_iter();
        let fields = wire
            .schema
            .fields
            .into_iter()
            .map(|f| Field {
                name:       f.name,
                field_type: f.field_type,
                values:     columns.next().unwrap_or_default(),
            })
            .collect();
        Frame {
            name: wire.schema.name,
            ref_id: wire.schema.ref_id,
            fields,
            meta: wire.schema.meta,
        }
    }
}

impl From<&Frame> for WireFrame {
    fn from(frame: &Frame) -> Self {
        WireFrame {
            schema: WireSchema {
                name:   frame.name.clone(),
                ref_id: frame.ref_id.clone(),
                fields: frame
                    .fields
                    .iter()
                    .map(|f| WireField {
                        name:       f.name.clone(),
                        field_type: f.field_type.clone(),
                    })
                    .collect(),
                meta:   frame.meta.clone(),
            },
            data:   Some(WireData {
                values: frame.fields.iter().map(|f| f.values.clone()).collect(),
            }),
        }
    }
}
