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

//! Typed settings for the looper, the dispatcher and the HTTP transport.
//!
//! Every setting defaults to the value found in `config.toml`, and can be
//! overridden per instance.

use super::*;
use crate::error::{RedpollError, Result};
use std::time::Duration;

/// Request looper configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LooperConfig {
    /// The delay before the first re-poll. It doubles after every iteration
    /// that still reports a running query.
    pub base_delay:          Duration,
    /// The delay ceiling, expressed in multiples of `base_delay`.
    pub max_delay_factor:    u32,
    /// Separator used to derive per-iteration request ids.
    pub iteration_separator: String,
}

impl Default for LooperConfig {
    fn default() -> Self {
        LooperConfig {
            base_delay:          *REDPOLL_BASE_DELAY,
            max_delay_factor:    *REDPOLL_MAX_DELAY_FACTOR,
            iteration_separator: REDPOLL_ITERATION_SEPARATOR.clone(),
        }
    }
}

impl LooperConfig {
    /// Creates a new looper configuration from the global settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base re-poll delay.
    pub fn set_base_delay(&mut self, base_delay: Duration) -> &mut Self {
        self.base_delay = base_delay;
        self
    }

    /// Sets the delay ceiling factor.
    pub fn set_max_delay_factor(&mut self, factor: u32) -> &mut Self {
        self.max_delay_factor = factor;
        self
    }

    /// Returns the longest delay between two polls of the same session.
    pub fn max_delay(&self) -> Duration {
        self.base_delay.saturating_mul(self.max_delay_factor)
    }

    /// Checks that the backoff parameters can make progress.
    pub fn validate(&self) -> Result<()> {
        if self.base_delay.is_zero() {
            return Err(RedpollError::Config(
                "looper base delay must be positive".to_string(),
            ));
        }
        if self.max_delay_factor == 0 {
            return Err(RedpollError::Config(
                "looper max delay factor must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Query dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// When false, every batch is executed with a single backend call and no
    /// polling takes place.
    pub async_query_data_support: bool,
    /// First value of the dispatcher-global request sequence.
    pub request_counter_start:    u64,
    /// Separator between the batch request id and the session sequence.
    pub request_id_separator:     String,
    /// Reference id given to targets that arrive without one.
    pub default_ref_id:           String,
    /// Query flow marker sent to the backend with every polled target.
    pub query_flow:               String,
    /// Settings handed to every looper session.
    pub looper:                   LooperConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            async_query_data_support: *REDPOLL_ASYNC_SUPPORT,
            request_counter_start:    *REDPOLL_REQUEST_COUNTER_START,
            request_id_separator:     REDPOLL_REQUEST_ID_SEPARATOR.clone(),
            default_ref_id:           REDPOLL_DEFAULT_REF_ID.clone(),
            query_flow:               REDPOLL_QUERY_FLOW.clone(),
            looper:                   LooperConfig::default(),
        }
    }
}

impl DispatcherConfig {
    /// Creates a new dispatcher configuration from the global settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables long-running query polling.
    pub fn set_async_query_data_support(&mut self, enabled: bool) -> &mut Self {
        self.async_query_data_support = enabled;
        self
    }

    /// Sets the first value of the request sequence.
    pub fn set_request_counter_start(&mut self, start: u64) -> &mut Self {
        self.request_counter_start = start;
        self
    }

    /// Sets the looper settings used by every session.
    pub fn set_looper(&mut self, looper: LooperConfig) -> &mut Self {
        self.looper = looper;
        self
    }

    /// Checks the dispatcher and looper settings.
    pub fn validate(&self) -> Result<()> {
        if self.request_id_separator.is_empty() {
            return Err(RedpollError::Config(
                "request id separator must not be empty".to_string(),
            ));
        }
        self.looper.validate()
    }
}

/// HTTP transport configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Base URL of the host, e.g. `http://localhost:3000`.
    pub base_url:          String,
    /// Unique id of the datasource instance on the host.
    pub datasource_uid:    String,
    /// Numeric id of the datasource instance, if known.
    pub datasource_id:     Option<i64>,
    /// Path of the query endpoint.
    pub query_path:        String,
    /// Path prefix of the datasource resource endpoints.
    pub resource_path:     String,
    /// Name of the cancel resource.
    pub cancel_resource:   String,
    /// Header that bypasses the host's response cache.
    pub cache_skip_header: String,
    /// Header carrying the per-call request id.
    pub request_id_header: String,
    /// Timeout of a single HTTP call.
    pub timeout:           Duration,
    /// Optional bearer token or API key.
    pub api_key:           Option<String>,
}

impl TransportConfig {
    /// Creates a new transport configuration for the given host and
    /// datasource.
    pub fn new<T>(base_url: T, datasource_uid: T) -> Self
    where
        T: Into<String>,
    {
        TransportConfig {
            base_url:          base_url.into().trim_end_matches('/').to_string(),
            datasource_uid:    datasource_uid.into(),
            datasource_id:     None,
            query_path:        REDPOLL_QUERY_PATH.clone(),
            resource_path:     REDPOLL_RESOURCE_PATH.clone(),
            cancel_resource:   REDPOLL_CANCEL_RESOURCE.clone(),
            cache_skip_header: REDPOLL_CACHE_SKIP_HEADER.clone(),
            request_id_header: REDPOLL_REQUEST_ID_HEADER.clone(),
            timeout:           *REDPOLL_HTTP_TIMEOUT,
            api_key:           None,
        }
    }

    /// Sets the numeric datasource id.
    pub fn set_datasource_id(&mut self, id: i64) -> &mut Self {
        self.datasource_id = Some(id);
        self
    }

    /// Sets the HTTP timeout.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    /// Sets the API key sent as a bearer token.
    pub fn set_api_key(&mut self, api_key: &str) -> &mut Self {
        self.api_key = Some(api_key.to_owned());
        self
    }

    /// Returns the URL of the query endpoint.
    pub fn query_url(&self) -> String {
        format!("{}{}", self.base_url, self.query_path)
    }

    /// Returns the URL of the cancel resource.
    pub fn cancel_url(&self) -> String {
        format!(
            "{}{}/{}/resources/{}",
            self.base_url, self.resource_path, self.datasource_uid, self.cancel_resource
        )
    }
}
