// Copyright 2025 The dcSCTP Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;

/// The routing key of the association table: a (local port, remote port) pair packed
/// into one 32-bit value as `(local_port << 16) | remote_port`.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct TupleId(pub u32);

impl TupleId {
    pub fn from_ports(local_port: u16, remote_port: u16) -> TupleId {
        TupleId(((local_port as u32) << 16) | remote_port as u32)
    }

    pub fn local_port(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn remote_port(&self) -> u16 {
        self.0 as u16
    }
}

impl fmt::Debug for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local_port(), self.remote_port())
    }
}
