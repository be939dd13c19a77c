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

use crate::packet::ensure;
use crate::packet::read_u16_be;
use crate::types::TupleId;
use thiserror::Error;

/// Size of the part of the SCTP common header the listener cares about: the source and
/// destination port fields. The verification tag and checksum that follow, and all
/// chunks, are opaque here and interpreted by the association itself.
pub(crate) const PORT_HEADER_SIZE: usize = 4;

/// Leading port fields of the SCTP common header
///
/// See <https://datatracker.ietf.org/doc/html/rfc9260#section-3.1>.
///
/// ```txt
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |      Source Port Number       |    Destination Port Number    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
pub(crate) struct PortHeader {
    pub source_port: u16,
    pub destination_port: u16,
}

/// Which way a datagram is traveling relative to this endpoint. Decides which of the
/// two header ports is the local one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub(crate) enum PacketParseError {
    #[error("Packet is too short to carry an SCTP port header")]
    PacketTooShort,
}

impl PortHeader {
    pub fn from_bytes(data: &[u8]) -> Result<PortHeader, PacketParseError> {
        ensure!(data.len() >= PORT_HEADER_SIZE, PacketParseError::PacketTooShort);
        Ok(PortHeader {
            source_port: read_u16_be!(&data[0..2]),
            destination_port: read_u16_be!(&data[2..4]),
        })
    }
}

/// Extracts the routing tuple from a datagram, or rejects it as too short.
pub(crate) fn classify(data: &[u8], direction: Direction) -> Result<TupleId, PacketParseError> {
    let header = match PortHeader::from_bytes(data) {
        Ok(header) => header,
        Err(e) => {
            log::trace!("packet of {} bytes is too small to be an SCTP packet", data.len());
            return Err(e);
        }
    };
    let (local_port, remote_port) = match direction {
        Direction::Inbound => (header.destination_port, header.source_port),
        Direction::Outbound => (header.source_port, header.destination_port),
    };
    Ok(TupleId::from_ports(local_port, remote_port))
}
