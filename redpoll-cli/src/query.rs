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

//! Runs one query through the polling datasource and prints every emission.

use anyhow::{anyhow, Context, Result};
use clap::{App, Arg, ArgMatches};
use futures::StreamExt;
use humantime::parse_duration;
use log::{info, warn};
use redpoll::frame::WireFrame;
use redpoll::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub fn command_args() -> App<'static> {
    App::new("query")
        .about("Runs a SQL query and polls it until it finishes")
        .arg(
            Arg::new("url")
                .short('u')
                .long("url")
                .value_name("URL")
                .help("Sets the base URL of the dashboarding host")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::new("uid")
                .long("uid")
                .value_name("UID")
                .help("Sets the uid of the warehouse datasource")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::new("datasource id")
                .long("datasource-id")
                .value_name("ID")
                .help("Sets the numeric id of the warehouse datasource")
                .takes_value(true),
        )
        .arg(
            Arg::new("sql")
                .short('s')
                .long("sql")
                .value_name("SQL")
                .help("Sets the SQL text to run")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::new("ref id")
                .long("ref-id")
                .value_name("REF_ID")
                .help("Sets the reference id of the query")
                .default_value("A")
                .takes_value(true),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .possible_values(&["time_series", "table", "logs"])
                .help("Sets the result format")
                .default_value("table")
                .takes_value(true),
        )
        .arg(
            Arg::new("range")
                .short('r')
                .long("range")
                .value_name("DURATION")
                .help("Queries the last DURATION, e.g. 6h or 30min")
                .default_value("6h")
                .takes_value(true),
        )
        .arg(
            Arg::new("max points")
                .long("max-points")
                .value_name("N")
                .help("Sets the maximum number of data points")
                .default_value("1000")
                .takes_value(true),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("DURATION")
                .help("Sets the timeout of a single HTTP call")
                .takes_value(true),
        )
        .arg(
            Arg::new("api key")
                .long("api-key")
                .value_name("KEY")
                .env("REDPOLL_API_KEY")
                .help("Sets the bearer token sent to the host")
                .takes_value(true),
        )
}

fn parse_format(format: &str) -> Result<FormatOptions> {
    match format {
        "time_series" => Ok(FormatOptions::TimeSeries),
        "table" => Ok(FormatOptions::Table),
        "logs" => Ok(FormatOptions::Logs),
        f => Err(anyhow!("unknown format: {}", f)),
    }
}

fn transport_config(matches: &ArgMatches) -> Result<TransportConfig> {
    let url = matches.value_of("url").context("no host URL provided")?;
    let uid = matches.value_of("uid").context("no datasource uid provided")?;
    let mut conf = TransportConfig::new(url, uid);
    if let Some(id) = matches.value_of("datasource id") {
        conf.set_datasource_id(id.parse().context("invalid datasource id")?);
    }
    if let Some(timeout) = matches.value_of("timeout") {
        conf.set_timeout(parse_duration(timeout)?);
    }
    if let Some(key) = matches.value_of("api key") {
        conf.set_api_key(key);
    }
    Ok(conf)
}

fn target(matches: &ArgMatches) -> Result<DataQuery> {
    let ref_id = matches.value_of("ref id").unwrap_or("A");
    let sql = matches.value_of("sql").context("no SQL provided")?;
    let mut target = DataQuery::new(ref_id, sql);
    target.format = parse_format(matches.value_of("format").unwrap_or("table"))?;
    Ok(target)
}

fn request(matches: &ArgMatches, target: DataQuery) -> Result<DataQueryRequest> {
    let range = parse_duration(matches.value_of("range").unwrap_or("6h"))?;
    let mut request = DataQueryRequest::new("cli", TimeRange::last(range)?, vec![target]);
    request.max_data_points = matches
        .value_of("max points")
        .unwrap_or("1000")
        .parse()
        .context("invalid number of data points")?;
    Ok(request)
}

pub async fn command(matches: &ArgMatches) -> Result<()> {
    let conf = transport_config(matches)?;
    let datasource_id = conf.datasource_id;
    let transport = HttpTransport::try_new(conf)?;
    let datasource_ref = transport.datasource_ref();
    let datasource = Arc::new(
        AsyncDataSource::try_new(Arc::new(transport), DispatcherConfig::new())?
            .with_datasource(datasource_ref, datasource_id),
    );

    let target = target(matches)?;
    let request = request(matches, target.clone())?;

    // The first Ctrl-C cancels the query, the second one exits.
    let interrupted = AtomicBool::new(false);
    let ds = datasource.clone();
    let cancelled = target.clone();
    ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        warn!("Cancelling {}, press Ctrl-C again to exit", cancelled.ref_id);
        ds.cancel(&cancelled);
    })?;

    info!("Running {}: {}", target.ref_id, target.raw_sql);
    let mut stream = datasource.query(request);
    while let Some(response) = stream.next().await {
        let response = response?.into_result()?;
        let frames = response.data.iter().map(WireFrame::from).collect::<Vec<_>>();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "key": response.key,
                "state": response.state,
                "frames": frames,
            }))?
        );
    }

    Ok(())
}
