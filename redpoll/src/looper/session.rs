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

//! The state machine of one looper session.
//!
//! ```text
//! Idle -> Requesting -> Evaluating -> Requesting   (next query, no cancel)
//!                                  -> Done         (no next query)
//!                                  -> Cancelled    (next query, cancel requested)
//!                                  -> Errored      (failed response)
//! Requesting -> Errored                            (transport failure)
//! any non-terminal state -> TornDown               (consumer went away)
//! ```

use super::backoff::Backoff;
use crate::configs::LooperConfig;
use crate::frame::Frame;
use crate::query::{DataQuery, LoadingState};
use std::time::Duration;

/// The state of a looper session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nothing sent yet.
    Idle,
    /// A backend call is in flight, or about to be issued.
    Requesting,
    /// A response arrived and is being inspected.
    Evaluating,
    /// No further request is needed.
    Done,
    /// Another request was warranted but cancellation was requested.
    Cancelled,
    /// The backend call failed or the response reported an error.
    Errored,
    /// The consumer dropped the stream before a terminal state.
    TornDown,
}

impl SessionState {
    /// Returns true for states a session never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Done
                | SessionState::Cancelled
                | SessionState::Errored
                | SessionState::TornDown
        )
    }
}

/// Bookkeeping of one session: state, pending query, iteration count and
/// backoff.
#[derive(Debug)]
pub struct LoopSession {
    request_id: String,
    separator:  String,
    state:      SessionState,
    iteration:  u32,
    next:       Option<DataQuery>,
    pending:    bool,
    backoff:    Backoff,
}

impl LoopSession {
    /// Creates an idle session for the request with the given id.
    pub fn new(request_id: &str, conf: &LooperConfig) -> Self {
        LoopSession {
            request_id: request_id.to_owned(),
            separator:  conf.iteration_separator.clone(),
            state:      SessionState::Idle,
            iteration:  0,
            next:       None,
            pending:    false,
            backoff:    Backoff::new(conf),
        }
    }

    /// The current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The id of the request that started the session.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// The number of backend calls issued so far.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// `Idle -> Requesting`, or `Evaluating -> Requesting` once the backoff
    /// delay has elapsed. Returns the request id of the call to issue.
    pub fn request(&mut self) -> String {
        debug_assert!(matches!(
            self.state,
            SessionState::Idle | SessionState::Evaluating
        ));
        self.state = SessionState::Requesting;
        self.iteration += 1;
        if self.iteration == 1 {
            self.request_id.clone()
        } else {
            format!("{}{}{}", self.request_id, self.separator, self.iteration)
        }
    }

    /// `Requesting -> Errored` on a transport failure.
    pub fn fail(&mut self) {
        self.pending = false;
        self.next = None;
        self.state = SessionState::Errored;
    }

    /// `Requesting -> Evaluating -> {Evaluating, Done, Cancelled, Errored}`.
    ///
    /// `failed` is true if the response reported an error, `next` is the
    /// query the callbacks asked for, `cancel` the answer of the cancellation
    /// check. A session only stays in `Evaluating` when a next query is
    /// warranted and no cancellation was requested.
    pub fn evaluate(&mut self, failed: bool, next: Option<DataQuery>, cancel: bool) {
        debug_assert_eq!(self.state, SessionState::Requesting);
        self.state = SessionState::Evaluating;

        if failed {
            self.fail();
            return;
        }

        match next {
            Some(_) if cancel => {
                self.pending = false;
                self.next = None;
                self.state = SessionState::Cancelled;
            }
            Some(query) => {
                self.pending = true;
                self.next = Some(query);
                self.backoff.advance();
            }
            None => {
                self.pending = false;
                self.next = None;
                self.state = SessionState::Done;
            }
        }
    }

    /// The loading state of the emission that follows an evaluation.
    /// `Streaming` as soon as any accumulated frame carries rows.
    pub fn loading_state(&self, data: &[Frame]) -> LoadingState {
        match self.state {
            SessionState::Errored => LoadingState::Error,
            SessionState::Evaluating if data.iter().any(|f| f.num_rows() > 0) => {
                LoadingState::Streaming
            }
            SessionState::Evaluating => LoadingState::Loading,
            _ => LoadingState::Done,
        }
    }

    /// Takes the next query and the delay to wait before sending it.
    pub fn take_next(&mut self) -> Option<(DataQuery, Duration)> {
        if self.state != SessionState::Evaluating {
            return None;
        }
        self.next.take().map(|q| (q, self.backoff.current()))
    }

    /// Moves a session that is not terminal yet to `TornDown`.
    pub fn tear_down(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::TornDown;
        }
    }

    /// Returns true if the cancel callback must run: the session was
    /// cancelled, or torn down while another iteration was warranted.
    pub fn needs_cancel(&self) -> bool {
        match self.state {
            SessionState::Cancelled => true,
            SessionState::TornDown => self.pending,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> LoopSession {
        LoopSession::new("SQR100_100", &LooperConfig::new())
    }

    fn target() -> DataQuery {
        DataQuery::new("A", "select 1")
    }

    #[test]
    fn completes_without_next_query() {
        let mut s = session();
        assert_eq!(s.request(), "SQR100_100");
        s.evaluate(false, None, false);
        assert_eq!(s.state(), SessionState::Done);
        assert_eq!(s.loading_state(&[]), LoadingState::Done);
        assert!(s.take_next().is_none());
        assert!(!s.needs_cancel());
    }

    #[test]
    fn continues_with_backoff() {
        let mut s = session();
        s.request();
        s.evaluate(false, Some(target().with_query_id("q1")), false);
        assert_eq!(s.state(), SessionState::Evaluating);
        assert_eq!(s.loading_state(&[]), LoadingState::Loading);

        let rows = Frame::new("A").with_field("v", vec![json!(1)]);
        assert_eq!(s.loading_state(&[rows]), LoadingState::Streaming);
        let cols_only = Frame::new("A").with_field("v", vec![]);
        assert_eq!(s.loading_state(&[cols_only]), LoadingState::Loading);

        let (next, delay) = s.take_next().unwrap();
        assert_eq!(next.query_id.as_deref(), Some("q1"));
        assert_eq!(delay, Duration::from_secs(2));
        assert_eq!(s.request(), "SQR100_100.2");

        s.evaluate(false, Some(target().with_query_id("q1")), false);
        assert_eq!(s.take_next().unwrap().1, Duration::from_secs(4));
        assert_eq!(s.request(), "SQR100_100.3");
        assert_eq!(s.iteration(), 3);
    }

    #[test]
    fn cancel_only_applies_with_next_query() {
        let mut s = session();
        s.request();
        s.evaluate(false, None, true);
        assert_eq!(s.state(), SessionState::Done);
        assert!(!s.needs_cancel());

        let mut s = session();
        s.request();
        s.evaluate(false, Some(target()), true);
        assert_eq!(s.state(), SessionState::Cancelled);
        assert_eq!(s.loading_state(&[]), LoadingState::Done);
        assert!(s.take_next().is_none());
        assert!(s.needs_cancel());
    }

    #[test]
    fn error_is_terminal() {
        let mut s = session();
        s.request();
        s.evaluate(true, Some(target()), false);
        assert_eq!(s.state(), SessionState::Errored);
        assert_eq!(s.loading_state(&[]), LoadingState::Error);
        assert!(s.take_next().is_none());
        assert!(!s.needs_cancel());

        let mut s = session();
        s.request();
        s.fail();
        s.tear_down();
        assert_eq!(s.state(), SessionState::Errored);
    }

    #[test]
    fn tear_down_while_pending() {
        let mut s = session();
        s.request();
        s.tear_down();
        assert_eq!(s.state(), SessionState::TornDown);
        assert!(!s.needs_cancel());

        let mut s = session();
        s.request();
        s.evaluate(false, Some(target()), false);
        s.take_next();
        s.tear_down();
        assert!(s.needs_cancel());
    }
}
