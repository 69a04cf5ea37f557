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

//! The HTTP transport talks to the host's query and resource endpoints.

use super::{BackendDataSourceResponse, BackendQueryBody, BackendTransport, CallOptions};
use crate::configs::TransportConfig;
use crate::error::{RedpollError, Result};
use crate::query::{DataQueryResponse, DataSourceRef};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, RequestBuilder};

/// Backend transport over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    conf:   TransportConfig,
    client: Client,
}

impl HttpTransport {
    /// Creates a new HTTP transport.
    pub fn try_new(conf: TransportConfig) -> Result<Self> {
        let client = Client::builder().timeout(conf.timeout).build()?;
        Ok(HttpTransport { conf, client })
    }

    /// Returns the transport settings.
    pub fn config(&self) -> &TransportConfig {
        &self.conf
    }

    /// The reference attached to every query sent through this transport.
    pub fn datasource_ref(&self) -> DataSourceRef {
        DataSourceRef {
            ds_type: None,
            uid:     self.conf.datasource_uid.clone(),
        }
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.conf.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl BackendTransport for HttpTransport {
    async fn query(
        &self,
        body: BackendQueryBody,
        options: CallOptions,
    ) -> Result<DataQueryResponse> {
        let mut builder = self
            .client
            .post(self.conf.query_url())
            .header(self.conf.request_id_header.as_str(), options.request_id.as_str())
            .json(&body);
        if options.skip_cache {
            builder = builder.header(self.conf.cache_skip_header.as_str(), "true");
        }

        debug!("POST {} ({})", self.conf.query_url(), options.request_id);
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(|e| RedpollError::Transport(e.to_string()))?;
        let status = response.status();
        let text = response.text().await?;

        match serde_json::from_str::<BackendDataSourceResponse>(&text) {
            Ok(body) if status.is_success() || !body.results.is_empty() => {
                Ok(body.into_response())
            }
            Ok(_) => Err(RedpollError::Transport(format!("{}: {}", status, text))),
            Err(e) if status.is_success() => Err(RedpollError::SerdeJson(e)),
            Err(_) => Err(RedpollError::Transport(format!("{}: {}", status, text))),
        }
    }

    async fn cancel(&self, query_id: &str) -> Result<()> {
        let builder = self
            .client
            .post(self.conf.cancel_url())
            .json(&serde_json::json!({ "queryId": query_id }));

        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(|e| RedpollError::Cancel {
                query_id: query_id.to_owned(),
                reason:   e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let reason = response.text().await.unwrap_or_default();
            warn!("Cancel of {} answered {}", query_id, status);
            return Err(RedpollError::Cancel {
                query_id: query_id.to_owned(),
                reason:   format!("{}: {}", status, reason),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn builds_with_config() -> Result<()> {
        let mut conf = TransportConfig::new("http://localhost:3000", "redshift-uid");
        conf.set_timeout(Duration::from_secs(5)).set_api_key("glsa_token");
        let transport = HttpTransport::try_new(conf)?;
        assert_eq!(transport.config().timeout, Duration::from_secs(5));
        assert_eq!(transport.datasource_ref().uid, "redshift-uid");
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_host_is_a_transport_error() -> Result<()> {
        let mut conf = TransportConfig::new("http://127.0.0.1:9", "redshift-uid");
        conf.set_timeout(Duration::from_millis(500));
        let transport = HttpTransport::try_new(conf)?;

        let range = crate::query::TimeRange::new(chrono::Utc::now(), chrono::Utc::now());
        let result = transport
            .query(BackendQueryBody::new(vec![], range), CallOptions::default())
            .await;
        assert!(matches!(result, Err(RedpollError::Transport(_))));

        let result = transport.cancel("q1").await;
        assert!(matches!(result, Err(RedpollError::Cancel { .. })));
        Ok(())
    }
}
