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

//! This module provides various default configurations for Redpoll.

pub mod settings;
pub use settings::{DispatcherConfig, LooperConfig, TransportConfig};

mod redpoll;
pub use self::redpoll::REDPOLL_CONF;

use humantime::parse_duration;
use lazy_static::lazy_static;
use std::time::Duration;

lazy_static! {
    /// Delay before the first re-poll of a running query.
    pub static ref REDPOLL_BASE_DELAY: Duration = parse_duration(&REDPOLL_CONF["looper"]["base_delay"]).unwrap();
    /// Re-poll delay ceiling, in multiples of the base delay.
    pub static ref REDPOLL_MAX_DELAY_FACTOR: u32 = REDPOLL_CONF["looper"]["max_delay_factor"].parse::<u32>().unwrap();
    /// Separator between a session request id and its iteration number.
    pub static ref REDPOLL_ITERATION_SEPARATOR: String = REDPOLL_CONF["looper"]["iteration_separator"].to_string();

    /// Whether the dispatcher polls long-running queries at all.
    pub static ref REDPOLL_ASYNC_SUPPORT: bool = REDPOLL_CONF["dispatcher"]["async_query_data_support"].parse::<bool>().unwrap();
    /// First value of the dispatcher-global request sequence.
    pub static ref REDPOLL_REQUEST_COUNTER_START: u64 = REDPOLL_CONF["dispatcher"]["request_counter_start"].parse::<u64>().unwrap();
    /// Separator between a batch request id and the session sequence number.
    pub static ref REDPOLL_REQUEST_ID_SEPARATOR: String = REDPOLL_CONF["dispatcher"]["request_id_separator"].to_string();
    /// Reference id given to targets that arrive without one.
    pub static ref REDPOLL_DEFAULT_REF_ID: String = REDPOLL_CONF["dispatcher"]["default_ref_id"].to_string();
    /// Query flow marker attached to every polled target.
    pub static ref REDPOLL_QUERY_FLOW: String = REDPOLL_CONF["dispatcher"]["query_flow"].to_string();

    /// Path of the host's query endpoint.
    pub static ref REDPOLL_QUERY_PATH: String = REDPOLL_CONF["transport"]["query_path"].to_string();
    /// Path prefix of the datasource resource endpoints.
    pub static ref REDPOLL_RESOURCE_PATH: String = REDPOLL_CONF["transport"]["resource_path"].to_string();
    /// Name of the cancel resource.
    pub static ref REDPOLL_CANCEL_RESOURCE: String = REDPOLL_CONF["transport"]["cancel_resource"].to_string();
    /// Header that makes the host bypass its response cache.
    pub static ref REDPOLL_CACHE_SKIP_HEADER: String = REDPOLL_CONF["transport"]["cache_skip_header"].to_string();
    /// Header carrying the per-call request id.
    pub static ref REDPOLL_REQUEST_ID_HEADER: String = REDPOLL_CONF["transport"]["request_id_header"].to_string();
    /// HTTP timeout of a single backend call.
    pub static ref REDPOLL_HTTP_TIMEOUT: Duration = parse_duration(&REDPOLL_CONF["transport"]["timeout"]).unwrap();
}
