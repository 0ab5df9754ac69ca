//! Exclusive leasing of host TCP ports.
//!
//! Each port has at most one live lease. Callers that want a busy port
//! enqueue as FIFO waiters and get a handle that resolves when the port
//! is handed over. Hand-off happens inside the registry lock, so no other
//! caller can observe an intermediate free state.

use std::collections::{HashMap, VecDeque};
use std::ops::RangeInclusive;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{HubError, Result};
use crate::event::{EventSink, HubEvent};

/// Smallest leasable port; everything below is privileged.
pub const PORT_MIN: u16 = 1024;

/// Default range scanned when the caller has no preference.
pub const DEFAULT_SCAN_RANGE: RangeInclusive<u16> = 3000..=3999;

/// An exclusive reservation of one port by one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortLease {
    pub port: u16,
    pub agent_id: Uuid,
    pub purpose: String,
    pub acquired_at: DateTime<Utc>,
    /// Advisory lifetime in seconds; the registry records it but does not
    /// reap expired leases itself.
    pub ttl_secs: Option<u64>,
}

/// Snapshot view of one queued waiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortWaiter {
    pub agent_id: Uuid,
    pub port: u16,
    pub requested_at: DateTime<Utc>,
}

/// Outcome of a lease request.
#[derive(Debug)]
pub enum LeaseOutcome {
    /// The port was free and is now held by the caller.
    Granted(PortLease),
    /// The port is busy; the handle resolves when it is handed over.
    Wait(PortWaitHandle),
}

/// Resolves to a [`PortLease`] once the awaited port is released.
///
/// Dropping the handle withdraws the waiter: a hand-off to a dropped
/// handle falls through to the next waiter in line.
#[derive(Debug)]
pub struct PortWaitHandle {
    port: u16,
    rx: oneshot::Receiver<PortLease>,
}

impl PortWaitHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Block until the port is handed over. Callers bound the wait with
    /// their own timeout.
    pub async fn wait(self) -> Result<PortLease> {
        self.rx.await.map_err(|_| {
            HubError::Cancelled(format!("wait for port {} abandoned", self.port))
        })
    }
}

struct WaiterSlot {
    agent_id: Uuid,
    purpose: String,
    requested_at: DateTime<Utc>,
    tx: oneshot::Sender<PortLease>,
}

#[derive(Default)]
struct RegistryState {
    leases: HashMap<u16, PortLease>,
    waiters: HashMap<u16, VecDeque<WaiterSlot>>,
    /// Who last held each freed port, so a duplicate release by the prior
    /// holder stays idempotent.
    prior_holders: HashMap<u16, Uuid>,
}

/// In-process port lease registry.
pub struct PortRegistry {
    state: Mutex<RegistryState>,
    scan_range: RangeInclusive<u16>,
    events: EventSink,
}

impl PortRegistry {
    pub fn new(scan_range: RangeInclusive<u16>, events: EventSink) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            scan_range,
            events,
        }
    }

    /// Acquire a port for `agent_id`.
    ///
    /// With `preferred` set: grant it when free, otherwise return a wait
    /// handle queued FIFO behind earlier waiters. With no preference: scan
    /// the configured range and grant the first free port, or fail with
    /// `Unavailable` when the range is exhausted (no waiting on "any
    /// port").
    pub fn lease(
        &self,
        agent_id: Uuid,
        purpose: impl Into<String>,
        preferred: Option<u16>,
        ttl_secs: Option<u64>,
    ) -> Result<LeaseOutcome> {
        let purpose = purpose.into();
        if let Some(port) = preferred {
            validate_port(port)?;
            let (outcome, event) = {
                let mut state = self.state.lock().expect("port registry lock poisoned");
                if state.leases.contains_key(&port) {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.entry(port).or_default().push_back(WaiterSlot {
                        agent_id,
                        purpose,
                        requested_at: Utc::now(),
                        tx,
                    });
                    (LeaseOutcome::Wait(PortWaitHandle { port, rx }), None)
                } else {
                    let lease = new_lease(port, agent_id, purpose, ttl_secs);
                    state.leases.insert(port, lease.clone());
                    state.prior_holders.remove(&port);
                    let event = lease_event(&lease);
                    (LeaseOutcome::Granted(lease), Some(event))
                }
            };
            if let Some(event) = event {
                self.events.emit(event);
            }
            return Ok(outcome);
        }

        // No preference: first free port in the scan range.
        let (lease, event) = {
            let mut state = self.state.lock().expect("port registry lock poisoned");
            let port = self
                .scan_range
                .clone()
                .find(|p| !state.leases.contains_key(p))
                .ok_or_else(|| {
                    HubError::Unavailable(format!(
                        "no free ports in {}-{}",
                        self.scan_range.start(),
                        self.scan_range.end()
                    ))
                })?;
            let lease = new_lease(port, agent_id, purpose, ttl_secs);
            state.leases.insert(port, lease.clone());
            state.prior_holders.remove(&port);
            let event = lease_event(&lease);
            (lease, event)
        };
        self.events.emit(event);
        Ok(LeaseOutcome::Granted(lease))
    }

    /// Release a port held by `agent_id`.
    ///
    /// Fails with `Conflict` when the live lease belongs to someone else
    /// and with `NotFound` when the port is free and `agent_id` was not
    /// its previous holder (a repeat release by the previous holder is
    /// accepted). When waiters are queued, the head waiter receives the
    /// port in the same critical section.
    pub fn release(&self, port: u16, agent_id: Uuid) -> Result<()> {
        let events = {
            let mut state = self.state.lock().expect("port registry lock poisoned");
            match state.leases.get(&port) {
                None => {
                    if state.prior_holders.get(&port) == Some(&agent_id) {
                        return Ok(());
                    }
                    return Err(HubError::NotFound(format!("port {port} is not leased")));
                }
                Some(lease) if lease.agent_id != agent_id => {
                    return Err(HubError::Conflict(format!(
                        "port {port} is leased to another agent"
                    )));
                }
                Some(_) => {}
            }
            self.release_locked(&mut state, port)
        };
        for event in events {
            self.events.emit(event);
        }
        Ok(())
    }

    /// Administrative release that bypasses the holder check. Hands the
    /// port to the head waiter if one is queued. Idempotent.
    pub fn force_release(&self, port: u16) -> Result<()> {
        validate_port(port)?;
        let events = {
            let mut state = self.state.lock().expect("port registry lock poisoned");
            if !state.leases.contains_key(&port) {
                return Ok(());
            }
            self.release_locked(&mut state, port)
        };
        for event in events {
            self.events.emit(event);
        }
        Ok(())
    }

    /// Release every lease held by `agent_id`, handing ports to waiters.
    /// Returns the ports that were released.
    pub fn release_all_for_agent(&self, agent_id: Uuid) -> Vec<u16> {
        let (ports, events) = {
            let mut state = self.state.lock().expect("port registry lock poisoned");
            let ports: Vec<u16> = state
                .leases
                .values()
                .filter(|l| l.agent_id == agent_id)
                .map(|l| l.port)
                .collect();
            let mut events = Vec::new();
            for port in &ports {
                events.extend(self.release_locked(&mut state, *port));
            }
            (ports, events)
        };
        for event in events {
            self.events.emit(event);
        }
        ports
    }

    /// Remove the lease on `port` and hand it to the first waiter whose
    /// handle is still alive. Must be called with the lock held; returns
    /// the events to emit after the lock is dropped.
    fn release_locked(&self, state: &mut RegistryState, port: u16) -> Vec<HubEvent> {
        let mut events = Vec::new();
        let Some(old) = state.leases.remove(&port) else {
            return events;
        };
        state.prior_holders.insert(port, old.agent_id);
        events.push(HubEvent::PortReleased {
            at: Utc::now(),
            port,
            agent_id: old.agent_id,
        });

        if let Some(queue) = state.waiters.get_mut(&port) {
            while let Some(slot) = queue.pop_front() {
                let lease = new_lease(port, slot.agent_id, slot.purpose, None);
                // A dropped handle means the waiter gave up; fall through
                // to the next in line.
                if slot.tx.send(lease.clone()).is_ok() {
                    state.leases.insert(port, lease.clone());
                    state.prior_holders.remove(&port);
                    events.push(lease_event(&lease));
                    break;
                }
            }
            if queue.is_empty() {
                state.waiters.remove(&port);
            }
        }
        events
    }

    /// Snapshot of all live leases, ordered by port.
    pub fn leases(&self) -> Vec<PortLease> {
        let state = self.state.lock().expect("port registry lock poisoned");
        let mut leases: Vec<PortLease> = state.leases.values().cloned().collect();
        leases.sort_by_key(|l| l.port);
        leases
    }

    /// Snapshot of all queued waiters, FIFO within each port.
    pub fn waiters(&self) -> Vec<PortWaiter> {
        let state = self.state.lock().expect("port registry lock poisoned");
        let mut ports: Vec<&u16> = state.waiters.keys().collect();
        ports.sort();
        ports
            .into_iter()
            .flat_map(|port| {
                state.waiters[port].iter().map(|slot| PortWaiter {
                    agent_id: slot.agent_id,
                    port: *port,
                    requested_at: slot.requested_at,
                })
            })
            .collect()
    }

    pub fn lease_count(&self) -> usize {
        let state = self.state.lock().expect("port registry lock poisoned");
        state.leases.len()
    }
}

fn new_lease(port: u16, agent_id: Uuid, purpose: String, ttl_secs: Option<u64>) -> PortLease {
    PortLease {
        port,
        agent_id,
        purpose,
        acquired_at: Utc::now(),
        ttl_secs,
    }
}

fn lease_event(lease: &PortLease) -> HubEvent {
    HubEvent::PortLeased {
        at: lease.acquired_at,
        port: lease.port,
        agent_id: lease.agent_id,
        purpose: lease.purpose.clone(),
    }
}

fn validate_port(port: u16) -> Result<()> {
    if port < PORT_MIN {
        return Err(HubError::InvalidArgument(format!(
            "port {port} is below {PORT_MIN}"
        )));
    }
    Ok(())
}
