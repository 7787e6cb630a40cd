//! Scheduler-owned port allocation.
//!
//! Ports are handed out as [`PortLease`]s that give the port back when
//! dropped, so a cancelled or panicking worker cannot leak one. Candidate
//! ports are bind-checked on 127.0.0.1 before being leased.

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("no free port in {first}..{last}")]
    Exhausted { first: u16, last: u16 },
}

#[derive(Debug, Default)]
struct PortState {
    leased: HashSet<u16>,
}

/// Leases ports from `base .. base + span`.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    span: u16,
    state: Mutex<PortState>,
}

impl PortAllocator {
    pub fn new(base: u16, span: u16) -> Arc<Self> {
        Arc::new(Self {
            base,
            span: span.max(1),
            state: Mutex::new(PortState::default()),
        })
    }

    /// Lease the lowest port in range that is neither leased nor bound.
    pub fn acquire(self: &Arc<Self>) -> Result<PortLease, PortError> {
        let mut state = self.state.lock();
        for offset in 0..self.span {
            let Some(port) = self.base.checked_add(offset) else {
                break;
            };
            if state.leased.contains(&port) {
                continue;
            }
            if TcpListener::bind(("127.0.0.1", port)).is_err() {
                debug!(port, "port in use, skipping");
                continue;
            }
            state.leased.insert(port);
            return Ok(PortLease {
                port,
                allocator: Arc::clone(self),
            });
        }
        Err(PortError::Exhausted {
            first: self.base,
            last: self.base.saturating_add(self.span - 1),
        })
    }

    pub fn leased_count(&self) -> usize {
        self.state.lock().leased.len()
    }

    fn release(&self, port: u16) {
        self.state.lock().leased.remove(&port);
    }
}

/// A leased port, returned to its allocator on drop.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    allocator: Arc<PortAllocator>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.allocator.release(self.port);
    }
}
