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

//! Utils for testing: a scripted backend transport and frame builders.

use crate::error::{RedpollError, Result};
use crate::frame::Frame;
use crate::query::DataQueryResponse;
use crate::transport::{BackendQueryBody, BackendTransport, CallOptions};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A backend transport that replays scripted responses per reference id and
/// records every call it receives.
#[derive(Debug, Default)]
pub struct MockTransport {
    script:      Mutex<HashMap<String, VecDeque<Result<DataQueryResponse>>>>,
    calls:       Mutex<Vec<(BackendQueryBody, CallOptions)>>,
    cancels:     Mutex<Vec<String>>,
    fail_cancel: AtomicBool,
}

impl MockTransport {
    /// Creates a transport without any scripted response.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends responses for the query with the given reference id.
    pub fn script(&self, ref_id: &str, responses: Vec<Result<DataQueryResponse>>) {
        lock(&self.script)
            .entry(ref_id.to_owned())
            .or_default()
            .extend(responses);
    }

    /// Makes every cancel notification fail.
    pub fn fail_cancels(&self) {
        self.fail_cancel.store(true, Ordering::SeqCst);
    }

    /// Every query call received so far.
    pub fn calls(&self) -> Vec<(BackendQueryBody, CallOptions)> {
        lock(&self.calls).clone()
    }

    /// The query calls issued for the given reference id.
    pub fn calls_for(&self, ref_id: &str) -> Vec<(BackendQueryBody, CallOptions)> {
        self.calls()
            .into_iter()
            .filter(|(body, _)| first_ref_id(body).as_deref() == Some(ref_id))
            .collect()
    }

    /// The number of query calls received so far.
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// The query ids of every cancel notification received so far.
    pub fn cancels(&self) -> Vec<String> {
        lock(&self.cancels).clone()
    }
}

fn first_ref_id(body: &BackendQueryBody) -> Option<String> {
    body.queries
        .first()
        .and_then(|q| q.get("refId"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

#[async_trait]
impl BackendTransport for MockTransport {
    async fn query(
        &self,
        body: BackendQueryBody,
        options: CallOptions,
    ) -> Result<DataQueryResponse> {
        let ref_id = first_ref_id(&body).unwrap_or_default();
        lock(&self.calls).push((body, options));
        lock(&self.script)
            .get_mut(&ref_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Err(RedpollError::Internal(format!(
                    "no scripted response left for {}",
                    ref_id
                )))
            })
    }

    async fn cancel(&self, query_id: &str) -> Result<()> {
        lock(&self.cancels).push(query_id.to_owned());
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Err(RedpollError::Cancel {
                query_id: query_id.to_owned(),
                reason:   "scripted failure".to_owned(),
            });
        }
        Ok(())
    }
}

/// A frame of the given reference id reporting `status` for `query_id`.
/// Without `rows` the frame has no column at all, otherwise a single column
/// with `rows` values.
pub fn status_frame(ref_id: &str, query_id: &str, status: &str, rows: Option<usize>) -> Frame {
    let mut frame = Frame::new(ref_id);
    frame.ref_id = Some(ref_id.to_owned());
    if let Some(rows) = rows {
        frame = frame.with_field("value", (0..rows).map(|i| json!(i)).collect());
    }
    frame.with_custom_meta(query_id, status)
}

/// A successful response carrying the given frames.
pub fn respond(frames: Vec<Frame>) -> Result<DataQueryResponse> {
    Ok(DataQueryResponse::new(frames))
}

/// A successful response with a single `running` frame without columns.
pub fn running(ref_id: &str, query_id: &str) -> Result<DataQueryResponse> {
    respond(vec![status_frame(ref_id, query_id, "running", None)])
}

/// A successful response with a single `finished` frame of `rows` rows.
pub fn finished(ref_id: &str, query_id: &str, rows: usize) -> Result<DataQueryResponse> {
    respond(vec![status_frame(ref_id, query_id, "finished", Some(rows))])
}
