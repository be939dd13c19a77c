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

//! In-memory stand-ins for the listener's external collaborators: the SCTP protocol
//! engine, its factory, the DTLS transport, and a subscriber delegate.

use crate::api::Association;
use crate::api::AssociationFactory;
use crate::api::AssociationId;
use crate::api::AssociationListener;
use crate::api::Capabilities;
use crate::api::ListenerDelegate;
use crate::api::SecureTransport;
use crate::api::TransportId;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

static NEXT_ASSOCIATION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// An association whose shutdown behavior the test controls.
///
/// With `auto_shutdown`, a shutdown request completes immediately and is reported back
/// to the listener from within the call, the way a real association with nothing in
/// flight behaves. Without it, the association only flags itself as shutting down and
/// stays put until the test calls [`FakeAssociation::complete_shutdown`].
pub(crate) struct FakeAssociation {
    id: AssociationId,
    auto_shutdown: bool,
    listener: Mutex<Weak<AssociationListener>>,
    ports: Mutex<Option<(u16, u16)>>,
    started_with: Mutex<Option<Capabilities>>,
    packets: Mutex<Vec<Vec<u8>>>,
    shutting_down: AtomicBool,
    shutdown: AtomicBool,
}

impl FakeAssociation {
    pub fn new(auto_shutdown: bool) -> Arc<FakeAssociation> {
        Arc::new(FakeAssociation {
            id: AssociationId(NEXT_ASSOCIATION_ID.fetch_add(1, Ordering::Relaxed)),
            auto_shutdown,
            listener: Mutex::new(Weak::new()),
            ports: Mutex::new(None),
            started_with: Mutex::new(None),
            packets: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Records which listener and port pair this association belongs to, so shutdown
    /// can be reported back.
    pub fn bind(&self, listener: &Arc<AssociationListener>, local_port: u16, remote_port: u16) {
        *self.listener.lock().unwrap() = Arc::downgrade(listener);
        *self.ports.lock().unwrap() = Some((local_port, remote_port));
    }

    pub fn ports(&self) -> Option<(u16, u16)> {
        *self.ports.lock().unwrap()
    }

    pub fn started_with(&self) -> Option<Capabilities> {
        self.started_with.lock().unwrap().clone()
    }

    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.packets.lock().unwrap().clone()
    }

    /// Finishes a shutdown that `notify_shutdown` left hanging.
    pub fn complete_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        self.shutdown.store(true, Ordering::Relaxed);
        self.report_shutdown();
    }

    fn report_shutdown(&self) {
        let listener = self.listener.lock().unwrap().upgrade();
        let ports = *self.ports.lock().unwrap();
        if let (Some(listener), Some((local_port, remote_port))) = (listener, ports) {
            listener.notify_shutdown(self, local_port, remote_port);
        }
    }
}

impl Association for FakeAssociation {
    fn id(&self) -> AssociationId {
        self.id
    }

    fn start(&self, remote_capabilities: &Capabilities) {
        *self.started_with.lock().unwrap() = Some(remote_capabilities.clone());
    }

    fn handle_data_packet(&self, data: &[u8]) -> bool {
        self.packets.lock().unwrap().push(data.to_vec());
        true
    }

    fn notify_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        if self.auto_shutdown {
            self.shutdown.store(true, Ordering::Relaxed);
            self.report_shutdown();
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed) && !self.shutdown.load(Ordering::Relaxed)
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// Produces [`FakeAssociation`]s and remembers them in creation order.
pub(crate) struct FakeFactory {
    auto_shutdown: bool,
    fail_creation: AtomicBool,
    created: Mutex<Vec<Arc<FakeAssociation>>>,
}

impl FakeFactory {
    pub fn new(auto_shutdown: bool) -> Arc<FakeFactory> {
        Arc::new(FakeFactory {
            auto_shutdown,
            fail_creation: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_creation(&self) {
        self.fail_creation.store(true, Ordering::Relaxed);
    }

    pub fn created(&self) -> Vec<Arc<FakeAssociation>> {
        self.created.lock().unwrap().clone()
    }
}

impl AssociationFactory for FakeFactory {
    fn create(
        &self,
        listener: &Arc<AssociationListener>,
        _secure_transport: &Arc<dyn SecureTransport>,
        local_port: u16,
        remote_port: u16,
    ) -> Option<Arc<dyn Association>> {
        if self.fail_creation.load(Ordering::Relaxed) {
            return None;
        }
        let association = FakeAssociation::new(self.auto_shutdown);
        association.bind(listener, local_port, remote_port);
        self.created.lock().unwrap().push(association.clone());
        Some(association)
    }
}

/// A DTLS transport that does nothing but own its listener.
pub(crate) struct FakeSecureTransport {
    id: TransportId,
    listener: Mutex<Option<Arc<AssociationListener>>>,
}

impl FakeSecureTransport {
    pub fn new() -> Arc<FakeSecureTransport> {
        Arc::new(FakeSecureTransport {
            id: TransportId(NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed)),
            listener: Mutex::new(None),
        })
    }

    pub fn attach(&self, listener: Arc<AssociationListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    /// Releases the transport's strong reference, as a real transport does when it is
    /// torn down.
    pub fn detach(&self) {
        *self.listener.lock().unwrap() = None;
    }
}

impl SecureTransport for FakeSecureTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn data_transport(&self) -> Option<Arc<AssociationListener>> {
        self.listener.lock().unwrap().clone()
    }
}

/// Records every announced association id, in delivery order.
#[derive(Default)]
pub(crate) struct RecordingDelegate {
    seen: Mutex<Vec<AssociationId>>,
}

impl RecordingDelegate {
    pub fn new() -> Arc<RecordingDelegate> {
        Arc::new(RecordingDelegate::default())
    }

    pub fn seen(&self) -> Vec<AssociationId> {
        self.seen.lock().unwrap().clone()
    }
}

impl ListenerDelegate for RecordingDelegate {
    fn on_association(&self, association: Arc<dyn Association>) {
        self.seen.lock().unwrap().push(association.id());
    }
}
