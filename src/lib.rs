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

//! A listener that multiplexes many SCTP associations over one secure (DTLS) transport.
//!
//! SCTP-over-DTLS delivers every association's packets through the same datagram
//! stream. The [`api::AssociationListener`] reads the port pair from each packet's
//! common header, routes the packet to the owning association (creating one when the
//! pair is unknown), hands out ephemeral local ports for outbound associations, and
//! announces passively created associations to subscribers. The SCTP protocol engine
//! itself, and the DTLS transport below it, are reached only through the traits in
//! [`api`].

pub mod api;

pub(crate) mod listener;
pub(crate) mod packet;
pub(crate) mod types;

#[cfg(test)]
pub(crate) mod testing;

/// Returns the version of this crate.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
