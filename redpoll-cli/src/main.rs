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

mod args;
mod query;

use anyhow::Result;
use clap::{crate_version, App, AppSettings};

#[tokio::main]
pub async fn main() -> Result<()> {
    let matches = app().get_matches();

    match matches.subcommand() {
        Some(("query", query_matches)) => {
            args::get_logging(&matches, query_matches)?.init();
            query::command(query_matches).await?;
        }
        _ => unreachable!("a subcommand is required"),
    }

    Ok(())
}

fn app() -> App<'static> {
    App::new("Redpoll")
        .version(crate_version!())
        .about("Runs long-running warehouse queries and polls them to completion")
        .author("UMD Database Group")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .args(args::get_args())
        .subcommand(query::command_args())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_levels() -> Result<()> {
        let matches = app().try_get_matches_from(vec![
            "redpoll-cli",
            "query",
            "--url",
            "http://localhost:3000",
            "--uid",
            "redshift",
            "--sql",
            "select 1",
            "--trace",
        ])?;
        let (_, sub) = matches.subcommand().unwrap();
        assert!(sub.is_present("trace"));
        assert!(args::get_logging(&matches, sub).is_ok());

        let missing = app().try_get_matches_from(vec!["redpoll-cli", "-L", "loud", "query"]);
        assert!(missing.is_err());
        Ok(())
    }
}
