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

use crate::api::ListenerOptions;
use std::collections::HashMap;

/// Tracks which SCTP ports are in use underneath the listener.
///
/// Ports are a shared finite resource: several tuples may refer to the same local or
/// remote port, so both sides are reference-counted multisets. An entry with count
/// zero is never stored. Ephemeral allocation walks a cursor through
/// `min..=max`, advancing by `increment` and keeping the cursor's parity on wrap (the
/// wrap lands on `min + (cursor % 2)`, so parity is preserved when `min` is even).
pub(crate) struct PortAllocator {
    allocated_local: HashMap<u16, usize>,
    allocated_remote: HashMap<u16, usize>,
    current: u16,
    min: u16,
    max: u16,
    increment: u16,
}

impl PortAllocator {
    pub fn new(options: &ListenerOptions) -> PortAllocator {
        PortAllocator {
            allocated_local: HashMap::new(),
            allocated_remote: HashMap::new(),
            current: options.default_port,
            min: options.min_port,
            max: options.max_port,
            increment: options.port_allocation_increment,
        }
    }

    pub fn allocate_local(&mut self, port: u16) {
        Self::allocate(&mut self.allocated_local, port);
    }

    pub fn allocate_remote(&mut self, port: u16) {
        Self::allocate(&mut self.allocated_remote, port);
    }

    pub fn deallocate_local(&mut self, port: u16) {
        Self::deallocate(&mut self.allocated_local, port);
    }

    pub fn deallocate_remote(&mut self, port: u16) {
        Self::deallocate(&mut self.allocated_remote, port);
    }

    pub fn is_local_allocated(&self, port: u16) -> bool {
        self.allocated_local.contains_key(&port)
    }

    /// Distinct local ports with at least one reference.
    pub fn local_port_count(&self) -> usize {
        self.allocated_local.len()
    }

    /// Distinct remote ports with at least one reference.
    pub fn remote_port_count(&self) -> usize {
        self.allocated_remote.len()
    }

    /// Finds an unused local port and reference-counts it, together with the remote
    /// port it will be paired with. When `remote_port` is zero the remote side is not
    /// decided yet and will become the same number as the local port, so the candidate
    /// must be free in both multisets. Returns `(local, effective remote)`, or `None`
    /// when every candidate in the range was probed without success.
    pub fn allocate_local_port(&mut self, remote_port: u16) -> Option<(u16, u16)> {
        let mut remaining = self.max - self.min;

        loop {
            let candidate = self.current;
            let acceptable = !self.allocated_local.contains_key(&candidate)
                && (remote_port != 0 || !self.allocated_remote.contains_key(&candidate));
            if acceptable {
                Self::allocate(&mut self.allocated_local, candidate);
                let remote = if remote_port == 0 { candidate } else { remote_port };
                Self::allocate(&mut self.allocated_remote, remote);
                return Some((candidate, remote));
            }

            self.current = self.current.wrapping_add(self.increment);
            if self.current < self.min || self.current > self.max {
                self.current = self.min.wrapping_add(self.current % 2);
            }

            if remaining == 0 {
                return None;
            }
            remaining -= 1;
        }
    }

    fn allocate(map: &mut HashMap<u16, usize>, port: u16) {
        *map.entry(port).or_insert(0) += 1;
    }

    fn deallocate(map: &mut HashMap<u16, usize>, port: u16) {
        let Some(count) = map.get_mut(&port) else {
            log::error!("deallocating port {} that has no allocation", port);
            return;
        };
        *count -= 1;
        if *count == 0 {
            map.remove(&port);
        }
    }

    #[cfg(test)]
    pub fn local_refcount(&self, port: u16) -> usize {
        self.allocated_local.get(&port).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub fn remote_refcount(&self, port: u16) -> usize {
        self.allocated_remote.get(&port).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(min: u16, max: u16, default: u16, increment: u16) -> PortAllocator {
        PortAllocator::new(&ListenerOptions {
            min_port: min,
            max_port: max,
            default_port: default,
            port_allocation_increment: increment,
            ..Default::default()
        })
    }

    #[test]
    fn reference_counts_stack() {
        let mut ports = allocator(5000, 65535, 5000, 1);

        ports.allocate_local(7000);
        ports.allocate_local(7000);
        assert_eq!(ports.local_refcount(7000), 2);

        ports.deallocate_local(7000);
        assert_eq!(ports.local_refcount(7000), 1);
        assert!(ports.is_local_allocated(7000));

        ports.deallocate_local(7000);
        assert_eq!(ports.local_refcount(7000), 0);
        assert!(!ports.is_local_allocated(7000));
        assert_eq!(ports.local_port_count(), 0);
    }

    #[test]
    fn matched_allocate_and_deallocate_leave_multiset_unchanged() {
        let mut ports = allocator(5000, 65535, 5000, 1);
        ports.allocate_remote(6000);
        ports.allocate_remote(6001);

        ports.allocate_remote(6000);
        ports.deallocate_remote(6000);

        assert_eq!(ports.remote_refcount(6000), 1);
        assert_eq!(ports.remote_refcount(6001), 1);
        assert_eq!(ports.remote_port_count(), 2);
    }

    #[test]
    fn deallocating_unknown_port_is_ignored() {
        let mut ports = allocator(5000, 65535, 5000, 1);
        ports.deallocate_local(1234);
        assert_eq!(ports.local_port_count(), 0);
    }

    #[test]
    fn allocates_from_the_cursor_and_counts_both_sides() {
        let mut ports = allocator(5000, 65535, 5000, 1);

        assert_eq!(ports.allocate_local_port(0), Some((5000, 5000)));
        assert_eq!(ports.local_refcount(5000), 1);
        assert_eq!(ports.remote_refcount(5000), 1);
    }

    #[test]
    fn counts_the_supplied_remote_port() {
        let mut ports = allocator(5000, 65535, 5000, 1);

        assert_eq!(ports.allocate_local_port(9000), Some((5000, 9000)));
        assert_eq!(ports.local_refcount(5000), 1);
        assert_eq!(ports.remote_refcount(9000), 1);
        assert_eq!(ports.remote_refcount(5000), 0);
    }

    #[test]
    fn undecided_remote_skips_candidates_taken_on_the_remote_side() {
        let mut ports = allocator(5000, 65535, 5000, 1);
        ports.allocate_remote(5000);

        // With no remote decided the local port doubles as the remote one, so 5000
        // must be passed over even though it is free locally.
        assert_eq!(ports.allocate_local_port(0), Some((5001, 5001)));

        // With an explicit remote the remote multiset is not consulted; the cursor
        // continues from where it stopped.
        assert_eq!(ports.allocate_local_port(9000), Some((5002, 9000)));
    }

    #[test]
    fn wrap_keeps_parity_and_exhausts() {
        let mut ports = allocator(5000, 5003, 5002, 2);

        // Cursor starts at 5002; after it is taken the next probe is 5004, which wraps
        // to 5000 + (5004 % 2) = 5000. A third request probes the whole range without
        // finding a free candidate.
        assert_eq!(ports.allocate_local_port(0), Some((5002, 5002)));
        assert_eq!(ports.allocate_local_port(0), Some((5000, 5000)));
        assert_eq!(ports.allocate_local_port(0), None);
    }

    #[test]
    fn failed_allocation_counts_nothing() {
        let mut ports = allocator(5000, 5001, 5000, 1);
        assert_eq!(ports.allocate_local_port(0), Some((5000, 5000)));
        assert_eq!(ports.allocate_local_port(0), Some((5001, 5001)));
        assert_eq!(ports.allocate_local_port(0), None);

        assert_eq!(ports.local_port_count(), 2);
        assert_eq!(ports.remote_port_count(), 2);
    }
}
