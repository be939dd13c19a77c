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
use std::sync::Arc;
use thiserror::Error;

pub use crate::listener::fanout::Subscription;
pub use crate::listener::AssociationListener;
pub use crate::listener::Registration;

/// Identifier of an SCTP association.
///
/// Assigned by the association implementation, stable for its lifetime, and strictly
/// increasing in creation order, so iterating a map keyed by it replays associations in
/// the order they came into existence.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AssociationId(pub u64);

impl fmt::Debug for AssociationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for AssociationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a secure (DTLS) transport, used to correlate log lines.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TransportId(pub u64);

impl fmt::Debug for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What one side of the data transport supports. Local capabilities are derived from
/// [`ListenerOptions`]; remote capabilities arrive out-of-band (e.g. via signaling) and
/// are installed with [`AssociationListener::listen`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Capabilities {
    /// The largest user message either side is willing to handle.
    pub max_message_size: usize,

    /// Lowest SCTP port number in the usable range.
    pub min_port: u16,

    /// Highest SCTP port number in the usable range.
    pub max_port: u16,

    /// How many ports out of the range may be in use simultaneously.
    pub max_usable_ports: usize,

    /// How many sessions may share a single port. Informational; the listener does not
    /// enforce it.
    pub max_sessions_per_port: usize,
}

/// User configurable options, read once at listener construction.
#[derive(Clone, Debug)]
pub struct ListenerOptions {
    /// The largest user message to advertise in [`Capabilities`]. The default follows
    /// <https://datatracker.ietf.org/doc/html/draft-ietf-rtcweb-data-channel-13#section-6.6>.
    pub max_message_size: usize,

    /// Hard cap on simultaneously open associations. The default allows a quarter of
    /// the port range to be filled, keeping ephemeral allocation cheap.
    pub max_ports: usize,

    /// Lowest local port the allocator will hand out.
    pub min_port: u16,

    /// Highest local port the allocator will hand out.
    pub max_port: u16,

    /// Where the allocation cursor starts. Must lie within `min_port..=max_port`.
    pub default_port: u16,

    /// Advertised number of sessions that may share one port. Never enforced by the
    /// listener itself.
    pub max_sessions_per_port: usize,

    /// How far the allocation cursor advances after a rejected candidate. Deployments
    /// that reserve even or odd ports for one role set this to 2; the cursor keeps its
    /// parity when wrapping as long as `min_port` is even.
    pub port_allocation_increment: u16,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            max_message_size: 16 * 1024,
            max_ports: (65535 - 5000) / 4,
            min_port: 5000,
            max_port: 65535,
            default_port: 5000,
            max_sessions_per_port: 65535,
            port_allocation_increment: 1,
        }
    }
}

#[derive(Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ListenerError {
    /// A constructor or registration argument is unusable, e.g. an options struct with
    /// an inverted port range.
    #[error("Invalid parameters")]
    InvalidParameters,

    /// The operation needs a running listener, but this one is shutting down or shut
    /// down, or the supplied secure transport belongs to a different listener.
    #[error("Invalid state")]
    InvalidState,
}

/// An SCTP association: one logical connection identified by a (local port, remote
/// port) pair on a shared secure transport.
///
/// Implemented by the external SCTP protocol engine. The listener holds a strong
/// reference while the association occupies any of its tables and itself hands out
/// only weak back-references, so dropping the listener's tables releases the
/// association unless its DTLS owner still holds it.
///
/// Implementations must not call back into the listener synchronously from [`start`]
/// (they are invoked under the listener lock); shutdown notification callbacks may
/// re-enter freely.
///
/// [`start`]: Association::start
pub trait Association: Send + Sync {
    /// Stable identifier, strictly increasing in creation order.
    fn id(&self) -> AssociationId;

    /// Begins operating against the peer described by `remote_capabilities`. Called
    /// once, either at creation (when the remote capabilities are already known) or
    /// when they are later installed via [`AssociationListener::listen`].
    fn start(&self, remote_capabilities: &Capabilities);

    /// Delivers one datagram that was routed to this association. Returns whether the
    /// packet was consumed.
    fn handle_data_packet(&self, data: &[u8]) -> bool;

    /// Asks the association to begin shutting down.
    fn notify_shutdown(&self);

    fn is_shutting_down(&self) -> bool;

    fn is_shutdown(&self) -> bool;
}

/// The secure (DTLS) transport the listener sits on.
///
/// The transport owns its listener strongly (it is the transport's factory-created
/// "data transport"); the listener refers back weakly. That asymmetry breaks the
/// reference cycle between the two.
pub trait SecureTransport: Send + Sync {
    /// Stable identifier, used to correlate log lines.
    fn id(&self) -> TransportId;

    /// The listener bound to this transport, if one has been created.
    fn data_transport(&self) -> Option<Arc<AssociationListener>>;
}

/// Creates association objects for inbound packets that match no existing tuple.
///
/// Implementations must not call back into the listener synchronously from
/// [`create`]; it runs under the listener lock. The produced association typically
/// keeps a `Weak` reference to the listener for its later `announce`/`notify_shutdown`
/// calls.
///
/// [`create`]: AssociationFactory::create
pub trait AssociationFactory: Send + Sync {
    fn create(
        &self,
        listener: &Arc<AssociationListener>,
        secure_transport: &Arc<dyn SecureTransport>,
        local_port: u16,
        remote_port: u16,
    ) -> Option<Arc<dyn Association>>;
}

/// Receives announcements of inbound associations. Invoked on the listener's delegate
/// queue, one call at a time, in the order the triggering events happened; never while
/// the listener lock is held.
pub trait ListenerDelegate: Send + Sync {
    fn on_association(&self, association: Arc<dyn Association>);
}

/// A point-in-time snapshot of the listener's tables, for logging and diagnostics.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ListenerMetrics {
    /// Open associations, keyed by port tuple.
    pub association_count: usize,

    /// Associations created before the remote capabilities were known, not yet started.
    pub pending_count: usize,

    /// Associations that have been surfaced to subscribers.
    pub announced_count: usize,

    /// Distinct local ports with at least one reference.
    pub allocated_local_ports: usize,

    /// Distinct remote ports with at least one reference.
    pub allocated_remote_ports: usize,

    /// Currently registered delegates.
    pub subscriber_count: usize,

    pub is_shutting_down: bool,

    pub is_shutdown: bool,
}
