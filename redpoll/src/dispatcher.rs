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

//! The dispatcher is the datasource-facing entry point. It fans a batch of
//! targets out into one looper session per target and merges the sessions
//! into a single result stream.

use crate::configs::DispatcherConfig;
use crate::error::{RedpollError, Result};
use crate::frame::{CustomMeta, Frame};
use crate::looper::{LoopCallbacks, RequestLooper, SessionState};
use crate::query::{DataQuery, DataQueryRequest, DataQueryResponse, DataSourceRef};
use crate::registry::{QueryRegistry, QueryStatus, RunningQueryPatch};
use crate::transport::{BackendQueryBody, BackendTransport, CallOptions};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use log::{debug, error, info};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The merged result stream of a batch.
pub type ResponseStream = BoxStream<'static, Result<DataQueryResponse>>;

/// Interpolates template variables into the SQL text of a target.
pub trait TemplateSrv: Debug + Send + Sync {
    /// Returns `text` with the variables of `scoped_vars` applied.
    fn replace(&self, text: &str, scoped_vars: &HashMap<String, String>) -> String;
}

/// Leaves the SQL text untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughTemplateSrv;

impl TemplateSrv for PassthroughTemplateSrv {
    fn replace(&self, text: &str, _: &HashMap<String, String>) -> String {
        text.to_owned()
    }
}

/// Replaces `${name}` and `$name` with the single-quoted value of the scoped
/// variable `name`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScopedVarsTemplateSrv;

impl TemplateSrv for ScopedVarsTemplateSrv {
    fn replace(&self, text: &str, scoped_vars: &HashMap<String, String>) -> String {
        // Longest names first, so that `$ab` is not consumed by `$a`.
        let mut names = scoped_vars.keys().collect::<Vec<_>>();
        names.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        let mut text = text.to_owned();
        for name in names {
            let value = format!("'{}'", scoped_vars[name].replace('\'', "''"));
            text = text
                .replace(&format!("${{{}}}", name), &value)
                .replace(&format!("${}", name), &value);
        }
        text
    }
}

/// Everything a session needs to turn a target into a backend query.
#[derive(Debug, Clone)]
struct QueryContext {
    templates:     Arc<dyn TemplateSrv>,
    datasource:    Option<DataSourceRef>,
    datasource_id: Option<i64>,
}

impl QueryContext {
    /// The backend representation of `target` within `request`.
    fn backend_query(
        &self,
        target: &DataQuery,
        request: &DataQueryRequest,
        query_flow: Option<&str>,
    ) -> Result<Value> {
        let mut query = target.clone();
        query.raw_sql = self.templates.replace(&query.raw_sql, &request.scoped_vars);
        if query.datasource.is_none() {
            query.datasource = self.datasource.clone();
        }

        let mut value = serde_json::to_value(&query)?;
        if let Value::Object(map) = &mut value {
            if let Some(flow) = query_flow {
                map.insert("meta".to_owned(), json!({ "queryFlow": flow }));
            }
            map.insert("intervalMs".to_owned(), json!(request.interval_ms));
            map.insert("maxDataPoints".to_owned(), json!(request.max_data_points));
            if let Some(id) = self.datasource_id {
                map.insert("datasourceId".to_owned(), json!(id));
            }
        }
        Ok(value)
    }
}

/// A datasource that polls long-running warehouse queries.
#[derive(Debug)]
pub struct AsyncDataSource {
    conf:      DispatcherConfig,
    transport: Arc<dyn BackendTransport>,
    registry:  Arc<QueryRegistry>,
    looper:    RequestLooper,
    context:   QueryContext,
    counter:   AtomicU64,
}

impl AsyncDataSource {
    /// Creates a datasource on top of the given transport.
    pub fn try_new(transport: Arc<dyn BackendTransport>, conf: DispatcherConfig) -> Result<Self> {
        conf.validate()?;
        Ok(AsyncDataSource {
            looper: RequestLooper::try_new(conf.looper.clone())?,
            counter: AtomicU64::new(conf.request_counter_start),
            registry: Arc::new(QueryRegistry::new()),
            context: QueryContext {
                templates:     Arc::new(PassthroughTemplateSrv),
                datasource:    None,
                datasource_id: None,
            },
            transport,
            conf,
        })
    }

    /// Sets the template interpolation used for the SQL text.
    pub fn with_template_srv(mut self, templates: Arc<dyn TemplateSrv>) -> Self {
        self.context.templates = templates;
        self
    }

    /// Sets the datasource reference attached to every backend query.
    pub fn with_datasource(mut self, datasource: DataSourceRef, id: Option<i64>) -> Self {
        self.context.datasource = Some(datasource);
        self.context.datasource_id = id;
        self
    }

    /// Returns the dispatcher settings.
    pub fn config(&self) -> &DispatcherConfig {
        &self.conf
    }

    /// Returns the registry of in-flight queries.
    pub fn registry(&self) -> &Arc<QueryRegistry> {
        &self.registry
    }

    /// Executes a batch and returns the merged stream of all its sessions.
    ///
    /// Must be called from within a tokio runtime.
    pub fn query(&self, request: DataQueryRequest) -> ResponseStream {
        let mut request = request;
        request.targets = request
            .targets
            .into_iter()
            .map(|mut target| {
                if target.ref_id.is_empty() {
                    target.ref_id = self.conf.default_ref_id.clone();
                }
                target
            })
            .filter(|target| target.is_runnable() && !target.is_hidden())
            .collect();

        if request.targets.is_empty() {
            debug!("Request {} has no runnable target", request.request_id);
            return stream::iter(vec![Ok(DataQueryResponse::empty())]).boxed();
        }

        if !self.conf.async_query_data_support {
            return self.query_sync(request);
        }

        let sessions = request
            .targets
            .iter()
            .map(|target| self.do_single(target, &request))
            .collect::<Vec<_>>();
        stream::select_all(sessions).boxed()
    }

    /// Requests cancellation of the query polled for `target`. Does nothing
    /// if no session polls it; repeated calls are equivalent to one.
    pub fn cancel(&self, target: &DataQuery) {
        let mut target = target.clone();
        if target.ref_id.is_empty() {
            target.ref_id = self.conf.default_ref_id.clone();
        }
        if self.registry.mark_cancelled(&target) {
            info!("Cancellation requested for {}", target.ref_id);
        } else {
            debug!("No running query to cancel for {}", target.ref_id);
        }
    }

    /// Starts a looper session for a single target.
    pub fn do_single(&self, target: &DataQuery, request: &DataQueryRequest) -> ResponseStream {
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        let request_id = format!(
            "{}{}{}",
            request.request_id, self.conf.request_id_separator, seq
        );
        self.registry.claim(target, &request_id);

        let callbacks = SingleQuery {
            session:    request_id.clone(),
            target:     target.clone(),
            transport:  self.transport.clone(),
            registry:   self.registry.clone(),
            context:    self.context.clone(),
            query_flow: self.conf.query_flow.clone(),
            query_id:   None,
            status:     None,
            frames:     vec![],
        };
        self.looper
            .run(request.narrowed(request_id, target.clone()), callbacks)
            .boxed()
    }

    fn query_sync(&self, request: DataQueryRequest) -> ResponseStream {
        let body = request
            .targets
            .iter()
            .map(|target| self.context.backend_query(target, &request, None))
            .collect::<Result<Vec<_>>>()
            .map(|queries| BackendQueryBody::new(queries, request.range));
        let transport = self.transport.clone();
        let options = CallOptions {
            request_id: request.request_id.clone(),
            skip_cache: false,
        };

        stream::once(async move {
            let mut response = transport.query(body?, options.clone()).await?;
            response.data.retain(|f| f.num_columns() > 0);
            response.key = Some(options.request_id);
            Ok::<_, RedpollError>(response)
        })
        .boxed()
    }
}

/// The callbacks of the session polling one target.
#[derive(Debug)]
struct SingleQuery {
    session:    String,
    target:     DataQuery,
    transport:  Arc<dyn BackendTransport>,
    registry:   Arc<QueryRegistry>,
    context:    QueryContext,
    query_flow: String,
    query_id:   Option<String>,
    status:     Option<QueryStatus>,
    frames:     Vec<Frame>,
}

#[async_trait]
impl LoopCallbacks for SingleQuery {
    fn next_query(&mut self, response: &DataQueryResponse) -> Option<DataQuery> {
        let meta = response.data.first().and_then(Frame::custom_meta);
        self.status = meta.as_ref().map(CustomMeta::query_status);
        match meta {
            Some(meta) if meta.is_running() => {
                let status = meta.query_status();
                self.registry.store(
                    &self.target,
                    &self.session,
                    RunningQueryPatch::query_id(&meta.query_id).with_status(status),
                );
                self.query_id = Some(meta.query_id.clone());
                Some(self.target.with_query_id(&meta.query_id))
            }
            _ => {
                self.registry.remove(&self.target, &self.session);
                None
            }
        }
    }

    async fn query(&mut self, request: DataQueryRequest) -> Result<DataQueryResponse> {
        let skip_cache = self.status.map_or(false, |status| status.is_active());
        let queries = request
            .targets
            .iter()
            .map(|target| {
                self.context
                    .backend_query(target, &request, Some(&self.query_flow))
            })
            .collect::<Result<Vec<_>>>()?;

        let options = CallOptions {
            request_id: request.request_id.clone(),
            skip_cache,
        };
        self.transport
            .query(BackendQueryBody::new(queries, request.range), options)
            .await
    }

    fn process(&mut self, frames: Vec<Frame>) -> Vec<Frame> {
        self.frames
            .extend(frames.into_iter().filter(|f| f.num_columns() > 0));
        self.frames.clone()
    }

    fn should_cancel(&self) -> bool {
        self.registry.is_cancel_requested(&self.target, &self.session)
    }

    fn on_cancel(&mut self) {
        let query_id = match self.query_id.clone() {
            Some(query_id) => query_id,
            None => return,
        };

        self.registry.remove(&self.target, &self.session);
        let transport = self.transport.clone();
        tokio::spawn(async move {
            info!("Cancelling backend query {}", query_id);
            if let Err(e) = transport.cancel(&query_id).await {
                let e = e.handled();
                error!("Failed to cancel query {}: {}", query_id, e);
            }
        });
    }

    fn on_finish(&mut self, state: SessionState) {
        debug!("Releasing {} after {:?}", self.session, state);
        self.registry.remove(&self.target, &self.session);
    }
}
