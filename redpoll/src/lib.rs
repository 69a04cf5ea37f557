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

#![warn(missing_docs, clippy::needless_borrow)]
// Clippy lints, some should be disabled incrementally
#![allow(
    clippy::module_inception,
    clippy::new_without_default,
    clippy::type_complexity,
    clippy::upper_case_acronyms
)]

//! Redpoll lets a dashboarding host query a cloud data warehouse as a
//! time-series or table data source. Statements that outlive a single
//! request/response cycle are polled with exponential backoff, their partial
//! results are merged into one stream, and they can be cancelled
//! cooperatively.

pub mod configs;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod looper;
pub mod prelude;
pub mod query;
pub mod registry;
pub mod test_util;
pub mod transport;

#[cfg(test)]
mod tests;
