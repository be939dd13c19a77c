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

use crate::api::ListenerDelegate;
use crate::listener::AssociationListener;
use std::sync::mpsc;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::sync::Weak;
use std::thread::JoinHandle;

pub(crate) type DelegateTask = Box<dyn FnOnce() + Send>;

/// Runs delegate callbacks on one dedicated thread, in posting order.
///
/// Listener code posts here after releasing the listener lock, so a delegate that
/// re-enters the listener can never deadlock against it.
pub(crate) struct DelegateQueue {
    sender: Option<Sender<DelegateTask>>,
    worker: Option<JoinHandle<()>>,
}

impl DelegateQueue {
    pub fn new() -> DelegateQueue {
        let (sender, receiver) = mpsc::channel::<DelegateTask>();
        let worker = std::thread::spawn(move || {
            for task in receiver {
                task();
            }
        });
        DelegateQueue { sender: Some(sender), worker: Some(worker) }
    }

    pub fn post(&self, task: DelegateTask) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(task);
        }
    }

    /// Blocks until every previously posted task has run.
    #[cfg(test)]
    pub fn flush(&self) {
        let (done_tx, done_rx) = mpsc::channel();
        self.post(Box::new(move || {
            let _ = done_tx.send(());
        }));
        let _ = done_rx.recv();
    }
}

impl Drop for DelegateQueue {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop once the backlog has drained.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct SubscriptionId(u64);

/// The set of delegates announcements fan out to.
pub(crate) struct Subscribers {
    next_id: u64,
    entries: Vec<(SubscriptionId, Arc<dyn ListenerDelegate>)>,
}

impl Subscribers {
    pub fn new() -> Subscribers {
        Subscribers { next_id: 1, entries: Vec::new() }
    }

    pub fn add(&mut self, delegate: Arc<dyn ListenerDelegate>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, delegate));
        id
    }

    pub fn remove(&mut self, id: SubscriptionId) {
        self.entries.retain(|(entry_id, _)| *entry_id != id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Snapshot of the delegates, taken under the listener lock so the fan-out itself
    /// can happen without it.
    pub fn delegates(&self) -> Vec<Arc<dyn ListenerDelegate>> {
        self.entries.iter().map(|(_, delegate)| delegate.clone()).collect()
    }
}

/// Handle returned from [`AssociationListener::listen`]. Cancelling it (or dropping
/// it) stops delivery to the delegate it registered.
pub struct Subscription {
    listener: Weak<AssociationListener>,
    id: SubscriptionId,
}

impl Subscription {
    pub(crate) fn new(listener: Weak<AssociationListener>, id: SubscriptionId) -> Subscription {
        Subscription { listener, id }
    }

    pub fn cancel(&self) {
        if let Some(listener) = self.listener.upgrade() {
            listener.unsubscribe(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
