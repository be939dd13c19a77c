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

use crate::api::Association;
use crate::api::AssociationFactory;
use crate::api::AssociationId;
use crate::api::Capabilities;
use crate::api::ListenerDelegate;
use crate::api::ListenerError;
use crate::api::ListenerMetrics;
use crate::api::ListenerOptions;
use crate::api::SecureTransport;
use crate::listener::fanout::DelegateQueue;
use crate::listener::fanout::Subscribers;
use crate::listener::fanout::Subscription;
use crate::listener::fanout::SubscriptionId;
use crate::listener::ports::PortAllocator;
use crate::packet::port_header::classify;
use crate::packet::port_header::Direction;
use crate::types::TupleId;
#[cfg(not(test))]
use log::warn;
use std::collections::BTreeMap;
use std::collections::HashMap;
#[cfg(test)]
use std::println as warn;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;

pub(crate) mod fanout;
pub(crate) mod ports;


/// Outcome of a successful outbound registration: the association now routed under
/// `(local_port, remote_port)`.
///
/// When the tuple was already occupied by a live association, that existing
/// association is adopted and returned in place of the one passed in; callers must
/// continue with [`Registration::association`], not with their own instance.
pub struct Registration {
    pub association: Arc<dyn Association>,
    pub local_port: u16,
    pub remote_port: u16,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("association_id", &self.association.id())
            .field("local_port", &self.local_port)
            .field("remote_port", &self.remote_port)
            .finish()
    }
}

/// Demultiplexes one secure (DTLS) transport into many SCTP associations.
///
/// One listener exists per secure transport (it is the transport's "data transport").
/// Inbound datagrams are routed by the (local port, remote port) pair in their common
/// header: packets for a known pair go to its association, packets for an unknown pair
/// create one through the [`AssociationFactory`]. Outbound associations register their
/// port pair through [`Self::register_association`], drawing an ephemeral local port
/// from the listener when they do not insist on one.
///
/// Associations created for inbound packets before the peer's capabilities are known
/// are parked as *pending* and started when [`Self::listen`] installs the
/// capabilities. Once an association is ready to be seen it is *announced* to every
/// subscribed delegate; late subscribers are replayed all previously announced
/// associations in creation order.
///
/// A single mutex guards all tables. It is not held across calls into associations'
/// packet handling or shutdown paths, nor across delegate callbacks, so those may
/// re-enter the listener.
pub struct AssociationListener {
    name: String,
    options: ListenerOptions,
    secure_transport: Weak<dyn SecureTransport>,
    factory: Arc<dyn AssociationFactory>,
    delegate_queue: DelegateQueue,
    inner: Mutex<Inner>,
}

struct Inner {
    /// The authoritative routing table.
    associations: HashMap<TupleId, Arc<dyn Association>>,

    /// Created before the remote capabilities were known; started on `subscribe`.
    /// Ordered so a restart walks them in creation order.
    pending: BTreeMap<AssociationId, Arc<dyn Association>>,

    /// Already surfaced to delegates; replayed, in creation order, to late
    /// subscribers.
    announced: BTreeMap<AssociationId, Arc<dyn Association>>,

    ports: PortAllocator,
    remote_capabilities: Option<Capabilities>,
    subscribers: Subscribers,

    /// Held from the first `cancel()` until the last child has drained, so the
    /// listener outlives external references dropped mid-shutdown.
    graceful_shutdown_ref: Option<Arc<AssociationListener>>,

    /// Terminal. Never unset.
    shutdown: bool,
}

impl AssociationListener {
    /// Creates the listener for `secure_transport`. Called by the secure transport
    /// itself when it sets up its data transport; everyone else discovers the listener
    /// through [`SecureTransport::data_transport`].
    ///
    /// The `name` is only used to identify this listener in log output.
    pub fn create(
        name: &str,
        secure_transport: &Arc<dyn SecureTransport>,
        factory: Arc<dyn AssociationFactory>,
        options: ListenerOptions,
    ) -> Result<Arc<AssociationListener>, ListenerError> {
        if options.min_port > options.max_port
            || options.default_port < options.min_port
            || options.default_port > options.max_port
            || options.port_allocation_increment == 0
        {
            return Err(ListenerError::InvalidParameters);
        }

        log::debug!(
            "[{}] created for transport {}, ports {}..={}, at most {} associations",
            name,
            secure_transport.id(),
            options.min_port,
            options.max_port,
            options.max_ports
        );
        Ok(Arc::new(AssociationListener {
            name: name.to_string(),
            secure_transport: Arc::downgrade(secure_transport),
            factory,
            delegate_queue: DelegateQueue::new(),
            inner: Mutex::new(Inner {
                associations: HashMap::new(),
                pending: BTreeMap::new(),
                announced: BTreeMap::new(),
                ports: PortAllocator::new(&options),
                remote_capabilities: None,
                subscribers: Subscribers::new(),
                graceful_shutdown_ref: None,
                shutdown: false,
            }),
            options,
        }))
    }

    /// Installs a delegate and the peer's capabilities on the listener bound to
    /// `transport`, starting any associations that were waiting for them. Fails with
    /// [`ListenerError::InvalidState`] when the transport has no data transport yet.
    pub fn listen(
        delegate: Arc<dyn ListenerDelegate>,
        transport: &Arc<dyn SecureTransport>,
        remote_capabilities: &Capabilities,
    ) -> Result<Subscription, ListenerError> {
        let listener = transport.data_transport().ok_or(ListenerError::InvalidState)?;
        Ok(listener.subscribe(delegate, remote_capabilities))
    }

    /// The local capabilities, straight from configuration.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_message_size: self.options.max_message_size,
            min_port: self.options.min_port,
            max_port: self.options.max_port,
            max_usable_ports: self.options.max_ports,
            max_sessions_per_port: self.options.max_sessions_per_port,
        }
    }

    /// Registers `delegate` and records `remote_capabilities`, overwriting any
    /// previously recorded ones. Still-pending associations are started with the new
    /// capabilities, and everything already announced is replayed to the new delegate
    /// in creation order.
    pub fn subscribe(
        self: &Arc<Self>,
        delegate: Arc<dyn ListenerDelegate>,
        remote_capabilities: &Capabilities,
    ) -> Subscription {
        log::debug!("[{}] subscribing a delegate", self.name);

        let (id, replay) = {
            let mut inner = self.locked();
            let id = inner.subscribers.add(delegate.clone());
            inner.remote_capabilities = Some(remote_capabilities.clone());

            let pending = std::mem::take(&mut inner.pending);
            for association in pending.values() {
                association.start(remote_capabilities);
            }

            let replay: Vec<Arc<dyn Association>> = inner.announced.values().cloned().collect();
            if inner.shutdown {
                inner.subscribers.clear();
            }
            (id, replay)
        };

        for association in replay {
            let delegate = delegate.clone();
            self.delegate_queue.post(Box::new(move || delegate.on_association(association)));
        }
        Subscription::new(Arc::downgrade(self), id)
    }

    /// Routes one inbound datagram to its association, creating the association when
    /// the port pair is new. Returns `false` for packets too short to carry a port
    /// header, when no association could be produced, or whatever the association's
    /// own packet handling returns.
    pub fn handle_data_packet(self: &Arc<Self>, data: &[u8]) -> bool {
        let Ok(tuple) = classify(data, Direction::Inbound) else {
            return false;
        };

        let association = {
            let mut inner = self.locked();
            match inner.associations.get(&tuple) {
                Some(association) => association.clone(),
                None => {
                    if inner.shutdown || inner.graceful_shutdown_ref.is_some() {
                        log::debug!(
                            "[{}] dropping packet for unknown pair {} while shutting down",
                            self.name,
                            tuple
                        );
                        return false;
                    }
                    if inner.associations.len() + 1 > self.options.max_ports {
                        warn!(
                            "[{}] too many ports already in use: {}",
                            self.name,
                            inner.associations.len()
                        );
                        return false;
                    }
                    let Some(secure_transport) = self.secure_transport.upgrade() else {
                        warn!("[{}] secure transport is gone", self.name);
                        return false;
                    };
                    let Some(association) = self.factory.create(
                        self,
                        &secure_transport,
                        tuple.local_port(),
                        tuple.remote_port(),
                    ) else {
                        warn!("[{}] unable to create an association for {}", self.name, tuple);
                        return false;
                    };
                    log::debug!(
                        "[{}] created association {} for {}",
                        self.name,
                        association.id(),
                        tuple
                    );

                    let remote_capabilities = inner.remote_capabilities.clone();
                    match remote_capabilities {
                        Some(capabilities) => association.start(&capabilities),
                        None => {
                            inner.pending.insert(association.id(), association.clone());
                        }
                    }
                    inner.ports.allocate_local(tuple.local_port());
                    inner.ports.allocate_remote(tuple.remote_port());
                    inner.associations.insert(tuple, association.clone());
                    association
                }
            }
        };

        // The association's own packet handling runs with the listener lock released.
        association.handle_data_packet(data)
    }

    /// Routes an association being opened from this side.
    ///
    /// With an explicit `local_port`, the pair either adopts an already registered
    /// live association, or claims the pair if the local port is entirely unused.
    /// With `local_port` of zero an ephemeral local port is drawn from the allocator.
    /// A `remote_port` of zero means "same as local". Returns `Ok(None)` when the pair
    /// is unavailable (the port is bound to a different remote, the table is full, the
    /// range is exhausted, or the occupying association is going away).
    pub fn register_association(
        self: &Arc<Self>,
        transport: &Arc<dyn SecureTransport>,
        association: Arc<dyn Association>,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Option<Registration>, ListenerError> {
        let data_transport = transport.data_transport().ok_or(ListenerError::InvalidState)?;
        if !Arc::ptr_eq(&data_transport, self) {
            warn!(
                "[{}] transport {} is bound to a different listener",
                self.name,
                transport.id()
            );
            return Err(ListenerError::InvalidState);
        }

        let remote_port = if remote_port == 0 { local_port } else { remote_port };

        let mut inner = self.locked();
        if inner.shutdown || inner.graceful_shutdown_ref.is_some() {
            warn!("[{}] unable to register an association while shutting down", self.name);
            return Err(ListenerError::InvalidState);
        }

        if local_port != 0 {
            let tuple = TupleId::from_ports(local_port, remote_port);
            if let Some(existing) = inner.associations.get(&tuple) {
                if existing.is_shutting_down() || existing.is_shutdown() {
                    warn!("[{}] pair {} is in use and shutting down", self.name, tuple);
                    return Ok(None);
                }
                log::debug!(
                    "[{}] adopting existing association {} for {}",
                    self.name,
                    existing.id(),
                    tuple
                );
                return Ok(Some(Registration {
                    association: existing.clone(),
                    local_port,
                    remote_port,
                }));
            }
            if inner.ports.is_local_allocated(local_port) {
                warn!(
                    "[{}] local port {} is already mapped to a different remote port",
                    self.name, local_port
                );
                return Ok(None);
            }
            if inner.associations.len() + 1 > self.options.max_ports {
                warn!(
                    "[{}] too many ports already in use: {}",
                    self.name,
                    inner.associations.len()
                );
                return Ok(None);
            }

            inner.ports.allocate_local(local_port);
            inner.ports.allocate_remote(remote_port);
            inner.associations.insert(tuple, association.clone());
            log::debug!(
                "[{}] registered association {} under {}",
                self.name,
                association.id(),
                tuple
            );
            return Ok(Some(Registration { association, local_port, remote_port }));
        }

        if inner.associations.len() + 1 > self.options.max_ports {
            warn!(
                "[{}] too many ports already in use: {}",
                self.name,
                inner.associations.len()
            );
            return Ok(None);
        }
        let Some((local_port, remote_port)) = inner.ports.allocate_local_port(remote_port) else {
            warn!("[{}] unable to find an unused local port", self.name);
            return Ok(None);
        };

        let tuple = TupleId::from_ports(local_port, remote_port);
        inner.associations.insert(tuple, association.clone());
        log::debug!(
            "[{}] registered association {} under ephemeral {}",
            self.name,
            association.id(),
            tuple
        );
        Ok(Some(Registration { association, local_port, remote_port }))
    }

    /// Called by an association once it is ready to be surfaced: fans it out to every
    /// subscribed delegate and records it as announced. Ignored when the pair is no
    /// longer registered (e.g. the association shut down in the meantime).
    pub fn announce_association(
        &self,
        association: &Arc<dyn Association>,
        local_port: u16,
        remote_port: u16,
    ) {
        let delegates = {
            let mut inner = self.locked();
            if inner.shutdown && inner.graceful_shutdown_ref.is_none() {
                warn!("[{}] cannot announce an association once shut down", self.name);
                return;
            }
            let tuple = TupleId::from_ports(local_port, remote_port);
            if !inner.associations.contains_key(&tuple) {
                warn!(
                    "[{}] cannot announce association {}: {} is not registered",
                    self.name,
                    association.id(),
                    tuple
                );
                return;
            }
            log::debug!("[{}] announcing association {}", self.name, association.id());

            let id = association.id();
            inner.pending.remove(&id);
            inner.announced.insert(id, association.clone());
            inner.subscribers.delegates()
        };

        // Delegates run on the delegate queue, never under the listener lock.
        for delegate in delegates {
            let association = association.clone();
            self.delegate_queue.post(Box::new(move || delegate.on_association(association)));
        }
    }

    /// Called by an association that has entered a shutdown state: drops it from all
    /// tables, releases its port references, and lets a draining listener finish when
    /// this was the last child.
    pub fn notify_shutdown(&self, association: &dyn Association, local_port: u16, remote_port: u16) {
        let finished = {
            let mut inner = self.locked();
            if inner.shutdown && inner.graceful_shutdown_ref.is_none() {
                log::trace!("[{}] ignoring a shutdown notification once shut down", self.name);
                return;
            }

            let tuple = TupleId::from_ports(local_port, remote_port);
            log::debug!(
                "[{}] association {} under {} reported shutdown",
                self.name,
                association.id(),
                tuple
            );
            Self::remove_association_locked(&mut inner, tuple, association.id());

            if inner.graceful_shutdown_ref.is_some() && inner.associations.is_empty() {
                self.finish_shutdown_locked(&mut inner)
            } else {
                None
            }
        };
        // Dropped only now, with the lock released: this may be the self-reference
        // taken by `cancel`.
        drop(finished);
    }

    /// Begins a graceful shutdown. Children are asked to shut down; the listener stays
    /// in the shutting-down state until the last of them reports back through
    /// [`Self::notify_shutdown`], then clears every table and its subscriber set.
    /// Idempotent.
    pub fn cancel(self: &Arc<Self>) {
        let snapshot: Vec<(TupleId, Arc<dyn Association>)> = {
            let mut inner = self.locked();
            if inner.shutdown && inner.graceful_shutdown_ref.is_none() {
                log::trace!("[{}] already shut down", self.name);
                return;
            }
            if inner.graceful_shutdown_ref.is_none() {
                inner.graceful_shutdown_ref = Some(Arc::clone(self));
            }
            inner.associations.iter().map(|(tuple, a)| (*tuple, a.clone())).collect()
        };

        // Children are notified with the listener lock released: an association that
        // reaches its shutdown state synchronously calls `notify_shutdown` right back.
        for (_, association) in &snapshot {
            association.notify_shutdown();
        }

        let finished = {
            let mut inner = self.locked();
            for (tuple, association) in &snapshot {
                if association.is_shutdown() {
                    Self::remove_association_locked(&mut inner, *tuple, association.id());
                }
            }

            if !inner.associations.is_empty() {
                log::trace!(
                    "[{}] waiting for {} associations to shut down",
                    self.name,
                    inner.associations.len()
                );
                None
            } else if inner.graceful_shutdown_ref.is_some() {
                self.finish_shutdown_locked(&mut inner)
            } else {
                // A re-entrant shutdown notification already finished the job.
                None
            }
        };
        drop(finished);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.locked().graceful_shutdown_ref.is_some()
    }

    pub fn is_shutdown(&self) -> bool {
        let inner = self.locked();
        inner.shutdown && inner.graceful_shutdown_ref.is_none()
    }

    /// A snapshot of the table sizes and lifecycle flags, for diagnostics.
    pub fn metrics(&self) -> ListenerMetrics {
        let inner = self.locked();
        ListenerMetrics {
            association_count: inner.associations.len(),
            pending_count: inner.pending.len(),
            announced_count: inner.announced.len(),
            allocated_local_ports: inner.ports.local_port_count(),
            allocated_remote_ports: inner.ports.remote_port_count(),
            subscriber_count: inner.subscribers.len(),
            is_shutting_down: inner.graceful_shutdown_ref.is_some(),
            is_shutdown: inner.shutdown && inner.graceful_shutdown_ref.is_none(),
        }
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) {
        self.locked().subscribers.remove(id);
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drops the association from the routing table (only if it still owns the pair)
    /// and from the pending and announced maps.
    fn remove_association_locked(inner: &mut Inner, tuple: TupleId, id: AssociationId) {
        if let Some(found) = inner.associations.get(&tuple) {
            if found.id() == id {
                inner.ports.deallocate_local(tuple.local_port());
                inner.ports.deallocate_remote(tuple.remote_port());
                inner.associations.remove(&tuple);
            }
        }
        inner.pending.remove(&id);
        inner.announced.remove(&id);
    }

    /// Final cleanup once the table has drained. Returns the self-reference so the
    /// caller can drop it after releasing the lock.
    fn finish_shutdown_locked(&self, inner: &mut Inner) -> Option<Arc<AssociationListener>> {
        debug_assert!(inner.associations.is_empty());
        inner.shutdown = true;
        inner.subscribers.clear();
        inner.pending.clear();
        inner.announced.clear();
        log::debug!("[{}] shutdown complete", self.name);
        inner.graceful_shutdown_ref.take()
    }
}

impl Drop for AssociationListener {
    fn drop(&mut self) {
        // No `Arc` to this listener exists anymore, so no graceful pass can run and
        // children's weak back-references are already dead. Tell any remaining
        // children to shut down and let the tables go.
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        inner.shutdown = true;
        inner.subscribers.clear();
        for association in inner.associations.values() {
            association.notify_shutdown();
        }
        inner.associations.clear();
        inner.pending.clear();
        inner.announced.clear();
    }
}
