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

//! Exponential backoff between two polls of the same session.

use crate::configs::LooperConfig;
use std::cmp::min;
use std::time::Duration;

/// The delay before iteration `k + 1` of a session is
/// `min(base * 2^k, max)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    delay: Duration,
    max:   Duration,
}

impl Backoff {
    /// Creates a fresh backoff starting at the base delay.
    pub fn new(conf: &LooperConfig) -> Self {
        Backoff {
            delay: conf.base_delay,
            max:   conf.max_delay(),
        }
    }

    /// Doubles the delay, clamps it to the ceiling and returns it.
    pub fn advance(&mut self) -> Duration {
        self.delay = min(self.delay.saturating_mul(2), self.max);
        self.delay
    }

    /// The delay returned by the last call to [`Backoff::advance`].
    pub fn current(&self) -> Duration {
        self.delay
    }
}
