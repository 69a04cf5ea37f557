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

//! The request looper keeps executing requests as long as the callbacks ask
//! for another one.
//!
//! A session is driven by a background task. Each backend response is
//! inspected ([`LoopCallbacks::next_query`]), folded into the accumulated
//! frames ([`LoopCallbacks::process`]) and emitted on the [`LoopStream`]. When
//! another request is warranted, the task waits for the backoff delay and
//! polls again. Cancellation requested through
//! [`LoopCallbacks::should_cancel`] is only observed between two iterations.
//! Dropping the stream tears the session down at once.

mod backoff;
mod session;

pub use backoff::Backoff;
pub use session::{LoopSession, SessionState};

use crate::configs::LooperConfig;
use crate::error::Result;
use crate::frame::Frame;
use crate::query::{DataQuery, DataQueryRequest, DataQueryResponse};
use async_trait::async_trait;
use futures::Stream;
use log::{debug, info};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

/// The hooks a looper session calls into.
#[async_trait]
pub trait LoopCallbacks: Send + 'static {
    /// If the response needs an additional request to execute, return it
    /// here.
    fn next_query(&mut self, response: &DataQueryResponse) -> Option<DataQuery>;

    /// Executes exactly one backend call.
    async fn query(&mut self, request: DataQueryRequest) -> Result<DataQueryResponse>;

    /// Merges new frames into the accumulated ones and returns everything
    /// accumulated so far.
    fn process(&mut self, frames: Vec<Frame>) -> Vec<Frame>;

    /// Checks whether the query should be cancelled.
    fn should_cancel(&self) -> bool;

    /// Executed when the session is cancelled, or torn down while another
    /// iteration was warranted.
    fn on_cancel(&mut self);

    /// Executed once when the session reaches its terminal state.
    fn on_finish(&mut self, _state: SessionState) {}
}

/// The incremental results of one looper session.
///
/// Dropping the stream tears the session down.
pub struct LoopStream {
    rx:     mpsc::UnboundedReceiver<Result<DataQueryResponse>>,
    _guard: DropGuard,
}

impl Stream for LoopStream {
    type Item = Result<DataQueryResponse>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Drives looper sessions.
#[derive(Debug, Clone, Default)]
pub struct RequestLooper {
    conf: LooperConfig,
}

impl RequestLooper {
    /// Creates a new looper. Fails on settings that cannot back off.
    pub fn try_new(conf: LooperConfig) -> Result<Self> {
        conf.validate()?;
        Ok(RequestLooper { conf })
    }

    /// Returns the looper settings.
    pub fn config(&self) -> &LooperConfig {
        &self.conf
    }

    /// Starts a session for `request` and returns its result stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run<C>(&self, request: DataQueryRequest, callbacks: C) -> LoopStream
    where
        C: LoopCallbacks,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let session = LoopSession::new(&request.request_id, &self.conf);
        tokio::spawn(drive(session, request, callbacks, tx, token.clone()));
        LoopStream {
            rx,
            _guard: token.drop_guard(),
        }
    }
}

async fn drive<C>(
    mut session: LoopSession,
    request: DataQueryRequest,
    mut callbacks: C,
    tx: mpsc::UnboundedSender<Result<DataQueryResponse>>,
    token: CancellationToken,
) where
    C: LoopCallbacks,
{
    debug!("Starting session {}", session.request_id());
    let mut current = request.clone();
    current.request_id = session.request();

    loop {
        let response = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            response = callbacks.query(current) => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                session.fail();
                let _ = tx.send(Err(e));
                break;
            }
        };

        let failed = response.is_error();
        let (next, cancel) = if failed {
            (None, false)
        } else {
            let next = callbacks.next_query(&response);
            (next, callbacks.should_cancel())
        };
        session.evaluate(failed, next, cancel);

        let data = callbacks.process(response.data);
        let emission = DataQueryResponse {
            state: session.loading_state(&data),
            key: Some(session.request_id().to_owned()),
            error: response.error,
            data,
        };
        if tx.send(Ok(emission)).is_err() {
            break;
        }

        let (next, delay) = match session.take_next() {
            Some(next) => next,
            None => break,
        };
        debug!(
            "Session {} polls again in {:?}",
            session.request_id(),
            delay
        );

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        current = request.narrowed(session.request(), next);
    }

    session.tear_down();
    if session.needs_cancel() {
        callbacks.on_cancel();
    }
    info!(
        "Session {} finished as {:?} after {} request(s)",
        session.request_id(),
        session.state(),
        session.iteration()
    );
    callbacks.on_finish(session.state());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RedpollError;
    use crate::query::{LoadingState, TimeRange};
    use futures::StreamExt;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::Instant;

    /// Replays canned responses and records what the looper did.
    #[derive(Clone, Default)]
    struct Probe {
        responses: Arc<Mutex<VecDeque<Result<DataQueryResponse>>>>,
        requests:  Arc<Mutex<Vec<(String, Instant)>>>,
        frames:    Arc<Mutex<Vec<Frame>>>,
        cancel:    Arc<AtomicBool>,
        cancels:   Arc<AtomicUsize>,
        finished:  Arc<Mutex<Option<SessionState>>>,
    }

    impl Probe {
        fn new(responses: Vec<Result<DataQueryResponse>>) -> Self {
            let probe = Probe::default();
            probe.responses.lock().unwrap().extend(responses);
            probe
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LoopCallbacks for Probe {
        fn next_query(&mut self, response: &DataQueryResponse) -> Option<DataQuery> {
            let meta = response.data.first()?.custom_meta()?;
            if meta.is_running() {
                Some(DataQuery::new("A", "select 1").with_query_id(&meta.query_id))
            } else {
                None
            }
        }

        async fn query(&mut self, request: DataQueryRequest) -> Result<DataQueryResponse> {
            self.requests
                .lock()
                .unwrap()
                .push((request.request_id.clone(), Instant::now()));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(RedpollError::Internal("script exhausted".to_string())))
        }

        fn process(&mut self, frames: Vec<Frame>) -> Vec<Frame> {
            let mut all = self.frames.lock().unwrap();
            all.extend(frames.into_iter().filter(|f| f.num_columns() > 0));
            all.clone()
        }

        fn should_cancel(&self) -> bool {
            self.cancel.load(Ordering::SeqCst)
        }

        fn on_cancel(&mut self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }

        fn on_finish(&mut self, state: SessionState) {
            *self.finished.lock().unwrap() = Some(state);
        }
    }

    fn running(query_id: &str, rows: usize) -> Result<DataQueryResponse> {
        let values = (0..rows).map(|i| json!(i)).collect();
        Ok(DataQueryResponse::new(vec![Frame::new("A")
            .with_field("v", values)
            .with_custom_meta(query_id, "running")]))
    }

    fn finished(query_id: &str) -> Result<DataQueryResponse> {
        Ok(DataQueryResponse::new(vec![Frame::new("A")
            .with_field("v", vec![json!(42)])
            .with_custom_meta(query_id, "finished")]))
    }

    fn request() -> DataQueryRequest {
        DataQueryRequest::new(
            "SQR100_100",
            TimeRange::new(chrono::Utc::now(), chrono::Utc::now()),
            vec![DataQuery::new("A", "select 1")],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_finished() -> Result<()> {
        let probe = Probe::new(vec![running("q1", 0), running("q1", 1), finished("q1")]);
        let looper = RequestLooper::default();
        let stream = looper.run(request(), probe.clone());

        let emissions = stream.collect::<Vec<_>>().await;
        let states = emissions
            .into_iter()
            .map(|r| r.map(|r| (r.state, r.key.unwrap(), r.data.len())))
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(
            states,
            vec![
                (LoadingState::Loading, "SQR100_100".to_string(), 1),
                (LoadingState::Streaming, "SQR100_100".to_string(), 2),
                (LoadingState::Done, "SQR100_100".to_string(), 3),
            ]
        );

        let requests = probe.requests.lock().unwrap().clone();
        let ids = requests.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["SQR100_100", "SQR100_100.2", "SQR100_100.3"]);
        assert_eq!(requests[1].1 - requests[0].1, Duration::from_secs(2));
        assert_eq!(requests[2].1 - requests[1].1, Duration::from_secs(4));

        assert_eq!(probe.cancels.load(Ordering::SeqCst), 0);
        assert_eq!(*probe.finished.lock().unwrap(), Some(SessionState::Done));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_saturates_at_ceiling() -> Result<()> {
        let mut script = (0..7).map(|_| running("q1", 0)).collect::<Vec<_>>();
        script.push(finished("q1"));
        let probe = Probe::new(script);
        let stream = RequestLooper::default().run(request(), probe.clone());
        let _ = stream.collect::<Vec<_>>().await;

        let requests = probe.requests.lock().unwrap().clone();
        let gaps = requests
            .windows(2)
            .map(|w| (w[1].1 - w[0].1).as_secs())
            .collect::<Vec<_>>();
        assert_eq!(gaps, vec![2, 4, 8, 10, 10, 10, 10]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_is_terminal() -> Result<()> {
        let probe = Probe::new(vec![
            running("q1", 0),
            Err(RedpollError::Transport("connection reset".to_string())),
            finished("q1"),
        ]);
        let mut stream = RequestLooper::default().run(request(), probe.clone());

        assert_eq!(stream.next().await.unwrap()?.state, LoadingState::Loading);
        assert!(matches!(
            stream.next().await,
            Some(Err(RedpollError::Transport(_)))
        ));
        assert!(stream.next().await.is_none());
        assert_eq!(probe.calls(), 2);
        assert_eq!(probe.cancels.load(Ordering::SeqCst), 0);
        assert_eq!(*probe.finished.lock().unwrap(), Some(SessionState::Errored));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn error_response_is_terminal() -> Result<()> {
        let failed = DataQueryResponse::error(
            "relation does not exist",
            vec![Frame::new("A").with_custom_meta("q1", "running")],
        );
        let probe = Probe::new(vec![Ok(failed), finished("q1")]);
        let emissions = RequestLooper::default()
            .run(request(), probe.clone())
            .collect::<Vec<_>>()
            .await;

        assert_eq!(emissions.len(), 1);
        let rsp = emissions.into_iter().next().unwrap()?;
        assert_eq!(rsp.state, LoadingState::Error);
        assert_eq!(rsp.error.as_deref(), Some("relation does not exist"));
        assert_eq!(probe.calls(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_at_iteration_boundary() -> Result<()> {
        let probe = Probe::new(vec![running("q1", 0), running("q1", 0), finished("q1")]);
        let mut stream = RequestLooper::default().run(request(), probe.clone());

        assert_eq!(stream.next().await.unwrap()?.state, LoadingState::Loading);
        probe.cancel.store(true, Ordering::SeqCst);

        let last = stream.next().await.unwrap()?;
        assert_eq!(last.state, LoadingState::Done);
        assert!(stream.next().await.is_none());

        assert_eq!(probe.calls(), 2);
        assert_eq!(probe.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(
            *probe.finished.lock().unwrap(),
            Some(SessionState::Cancelled)
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_last_iteration_is_ignored() -> Result<()> {
        let probe = Probe::new(vec![finished("q1")]);
        probe.cancel.store(true, Ordering::SeqCst);
        let emissions = RequestLooper::default()
            .run(request(), probe.clone())
            .collect::<Vec<_>>()
            .await;

        assert_eq!(emissions.len(), 1);
        assert_eq!(probe.cancels.load(Ordering::SeqCst), 0);
        assert_eq!(*probe.finished.lock().unwrap(), Some(SessionState::Done));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_stream_tears_down() -> Result<()> {
        let probe = Probe::new(vec![running("q1", 0), running("q1", 0), finished("q1")]);
        let mut stream = RequestLooper::default().run(request(), probe.clone());
        assert_eq!(stream.next().await.unwrap()?.state, LoadingState::Loading);
        drop(stream);

        // Let the session task observe the cancelled token.
        for _ in 0..10 {
            if probe.finished.lock().unwrap().is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(probe.calls(), 1);
        assert_eq!(probe.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(
            *probe.finished.lock().unwrap(),
            Some(SessionState::TornDown)
        );
        Ok(())
    }
}
