//! Connection supervision: one session per device, bounded retries.
//!
//! The [`Supervisor`] owns every open session.  Callers never hold a session
//! across calls; they hand an operation to [`Supervisor::execute`], which
//! makes sure a session exists, runs the operation against it and recovers
//! from dropped links.
//!
//! Each top-level call gets a fresh [`RetryBudget`] of `max_attempts`
//! connection attempts.  Re-connecting after a dropped link draws from the
//! same budget, so a call makes at most `max_attempts` connection attempts in
//! total.
//!
//! Devices come in two flavours:
//!
//! | Flavour | How | After each call |
//! |---|---|---|
//! | requested | [`Supervisor::connect`] succeeded | session kept open |
//! | transient | anything else | session closed |

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::protocol::DeviceFamily;
use crate::session::{Connector, GattSession};
use crate::types::{ConnectReport, ConnectionState, DeviceId};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Connection attempts per top-level call. Clamped to at least 1. Default: 5.
    pub max_attempts: u32,
    /// Pause before every connection attempt but the first. Default: none.
    pub retry_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::ZERO,
        }
    }
}

/// Connection attempts left for one top-level call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    max: u32,
    remaining: u32,
}

impl RetryBudget {
    pub fn new(max_attempts: u32) -> Self {
        let max = max_attempts.max(1);
        Self {
            max,
            remaining: max,
        }
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Attempts consumed so far.
    pub fn used(&self) -> u32 {
        self.max - self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// Take one attempt from the budget; `false` if none was left.
    pub fn consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

fn retries_text(remaining: u32) -> &'static str {
    if remaining == 1 {
        "retry remains"
    } else {
        "retries remaining"
    }
}

/// Whether an operation may safely be issued again after a dropped link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    /// Reads, and downloads that are re-run from scratch.
    Idempotent,
    /// Device-mutating writes.  If the link drops mid-call the write may or
    /// may not have landed, so it is not re-issued and the caller receives
    /// [`Error::Unconfirmed`] naming the operation.
    AtMostOnce(&'static str),
}

// ── Supervisor ────────────────────────────────────────────────────────────────

pub struct Supervisor<C: Connector> {
    connector: C,
    config: SupervisorConfig,
    sessions: HashMap<DeviceId, C::Session>,
    states: HashMap<DeviceId, ConnectionState>,
    requested: HashSet<DeviceId>,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(connector: C, config: SupervisorConfig) -> Self {
        let mut config = config;
        config.max_attempts = config.max_attempts.max(1);
        Self {
            connector,
            config,
            sessions: HashMap::new(),
            states: HashMap::new(),
            requested: HashSet::new(),
        }
    }

    pub fn family(&self) -> DeviceFamily {
        self.connector.family()
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn set_max_attempts(&mut self, max_attempts: u32) {
        self.config.max_attempts = max_attempts.max(1);
        debug!("The maximum number of attempts has been set to {}", self.config.max_attempts);
    }

    /// Lifecycle state of `id`.
    ///
    /// `FailedPermanently` only records that the last call gave up; the next
    /// call starts over with a fresh budget.
    pub fn state(&self, id: DeviceId) -> ConnectionState {
        self.states.get(&id).copied().unwrap_or_default()
    }

    /// Devices with an open session, in address order.
    pub fn connected_devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.sessions.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Open a session to `id` and keep it open across calls.
    ///
    /// Returns `Ok(false)` if every attempt failed and `strict` is off.
    pub async fn connect(&mut self, id: DeviceId, strict: bool) -> Result<bool> {
        let mut budget = RetryBudget::new(self.config.max_attempts);
        match self.ensure_session(id, &mut budget).await {
            Ok(()) => {
                self.requested.insert(id);
                Ok(true)
            }
            Err(e @ Error::ConnectFailed { .. }) if !strict => {
                warn!("Could not connect to {id}: {e}");
                Ok(false)
            }
            Err(e) => {
                error!("{e}");
                Err(e)
            }
        }
    }

    /// [`Supervisor::connect`] for several devices, each with its own budget.
    pub async fn connect_many(&mut self, ids: &[DeviceId], strict: bool) -> Result<ConnectReport> {
        let mut report = ConnectReport::default();
        for &id in ids {
            if self.connect(id, strict).await? {
                report.connected.push(id);
            } else {
                report.failed.push(id);
            }
        }
        Ok(report)
    }

    /// Close the session to `id`, if any.  Teardown errors are ignored.
    pub async fn disconnect(&mut self, id: DeviceId) {
        self.requested.remove(&id);
        self.close(id).await;
    }

    pub async fn disconnect_all(&mut self) {
        let ids: Vec<DeviceId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.close(id).await;
        }
        self.requested.clear();
        info!("Disconnected from all Smart Gadgets");
    }

    /// Run `op` against the session of `id`, connecting first if needed.
    ///
    /// A transient failure discards the session.  Idempotent operations are
    /// then re-run on a fresh session while the budget lasts; at-most-once
    /// operations fail with [`Error::Unconfirmed`].  Non-transient errors are
    /// returned as they are.
    pub async fn execute<T, F>(&mut self, id: DeviceId, idempotency: Idempotency, op: F) -> Result<T>
    where
        F: AsyncFnMut(&mut C::Session) -> Result<T>,
    {
        let mut budget = RetryBudget::new(self.config.max_attempts);
        let result = self.run(id, idempotency, &mut budget, op).await;
        if !self.requested.contains(&id) {
            self.close(id).await;
        }
        result
    }

    async fn run<T, F>(
        &mut self,
        id: DeviceId,
        idempotency: Idempotency,
        budget: &mut RetryBudget,
        mut op: F,
    ) -> Result<T>
    where
        F: AsyncFnMut(&mut C::Session) -> Result<T>,
    {
        loop {
            self.ensure_session(id, budget).await?;
            let Some(session) = self.sessions.get_mut(&id) else {
                return Err(Error::Disconnected {
                    device: id.to_string(),
                    reason: "session vanished".into(),
                });
            };

            let err = match op(session).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            self.invalidate(id).await;
            match idempotency {
                Idempotency::AtMostOnce(operation) => {
                    warn!("{id}: {operation} interrupted by {err}; not re-issuing");
                    return Err(Error::Unconfirmed {
                        device: id.to_string(),
                        operation,
                        source: Box::new(err),
                    });
                }
                Idempotency::Idempotent if budget.is_exhausted() => {
                    error!("{id}: {err}");
                    return Err(err);
                }
                Idempotency::Idempotent => {
                    let remaining = budget.remaining();
                    warn!("{id}: {err} -- {remaining} {}", retries_text(remaining));
                }
            }
        }
    }

    /// Make sure `id` has a session, spending connection attempts from `budget`.
    async fn ensure_session(&mut self, id: DeviceId, budget: &mut RetryBudget) -> Result<()> {
        if self.sessions.contains_key(&id) {
            return Ok(());
        }
        let verb = if self.requested.contains(&id) {
            "Re-connecting"
        } else {
            "Connecting"
        };

        let mut first = true;
        loop {
            if !first && !self.config.retry_delay.is_zero() {
                tokio::time::sleep(self.config.retry_delay).await;
            }
            first = false;

            budget.consume();
            self.states.insert(id, ConnectionState::Connecting);
            info!("{verb} to {id} (attempt {}/{}) …", budget.used(), budget.max());

            match self.connector.open(id).await {
                Ok(session) => {
                    self.sessions.insert(id, session);
                    self.states.insert(id, ConnectionState::Connected);
                    return Ok(());
                }
                Err(e) if e.is_transient() && !budget.is_exhausted() => {
                    let remaining = budget.remaining();
                    warn!("{id}: {e} -- {remaining} {}", retries_text(remaining));
                }
                Err(e) if e.is_transient() => {
                    self.states.insert(id, ConnectionState::FailedPermanently);
                    return Err(Error::ConnectFailed {
                        device: id.to_string(),
                        attempts: budget.used(),
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    self.states.insert(id, ConnectionState::Disconnected);
                    return Err(e);
                }
            }
        }
    }

    /// Drop a session that is known to be broken.
    async fn invalidate(&mut self, id: DeviceId) {
        if let Some(mut session) = self.sessions.remove(&id) {
            if let Err(e) = session.disconnect().await {
                debug!("{id}: teardown of broken session failed: {e}");
            }
        }
        self.states.insert(id, ConnectionState::Disconnected);
    }

    async fn close(&mut self, id: DeviceId) {
        if let Some(mut session) = self.sessions.remove(&id) {
            info!("Disconnecting from {id} …");
            if let Err(e) = session.disconnect().await {
                debug!("{id}: disconnect failed: {e}");
            }
            self.states.insert(id, ConnectionState::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Characteristic;
    use crate::registers;
    use crate::sim::{SimConfig, SimulatedGadget};

    fn id() -> DeviceId {
        "C4:A1:2F:00:9E:31".parse().unwrap()
    }

    fn supervisor(config: SimConfig, max_attempts: u32) -> (Supervisor<SimulatedGadget>, SimulatedGadget) {
        let gadget = SimulatedGadget::new(config);
        let supervisor = Supervisor::new(
            gadget.clone(),
            SupervisorConfig {
                max_attempts,
                ..SupervisorConfig::default()
            },
        );
        (supervisor, gadget)
    }

    fn unreachable() -> SimConfig {
        SimConfig {
            failing_connects: u32::MAX,
            ..SimConfig::default()
        }
    }

    #[test]
    fn budget_is_clamped_and_counts_down() {
        let mut budget = RetryBudget::new(0);
        assert_eq!(budget.max(), 1);
        assert!(budget.consume());
        assert!(budget.is_exhausted());
        assert!(!budget.consume());
        assert_eq!(budget.used(), 1);
    }

    #[tokio::test]
    async fn strict_connect_makes_exactly_max_attempts() {
        for k in 1..=4 {
            let (mut sup, gadget) = supervisor(unreachable(), k);
            match sup.connect(id(), true).await {
                Err(Error::ConnectFailed { attempts, .. }) => assert_eq!(attempts, k),
                other => panic!("expected ConnectFailed, got {other:?}"),
            }
            assert_eq!(gadget.open_attempts(), k);
            assert_eq!(sup.state(id()), ConnectionState::FailedPermanently);
        }
    }

    #[tokio::test]
    async fn lenient_connect_reports_failure() {
        let (mut sup, gadget) = supervisor(unreachable(), 3);
        assert!(!sup.connect(id(), false).await.unwrap());
        assert_eq!(gadget.open_attempts(), 3);
        assert!(sup.connected_devices().is_empty());

        let report = sup.connect_many(&[id()], false).await.unwrap();
        assert_eq!(report.failed, vec![id()]);
        assert!(report.connected.is_empty());
    }

    #[tokio::test]
    async fn connect_recovers_within_budget() {
        let (mut sup, gadget) = supervisor(
            SimConfig {
                failing_connects: 2,
                ..SimConfig::default()
            },
            3,
        );
        assert!(sup.connect(id(), true).await.unwrap());
        assert_eq!(gadget.open_attempts(), 3);
        assert_eq!(sup.state(id()), ConnectionState::Connected);
        assert_eq!(sup.connected_devices(), vec![id()]);
    }

    #[tokio::test]
    async fn transient_devices_are_closed_after_each_call() {
        let (mut sup, gadget) = supervisor(SimConfig::default(), 1);
        let level = sup
            .execute(id(), Idempotency::Idempotent, async |s| registers::battery(s).await)
            .await
            .unwrap();
        assert_eq!(level, 87);
        assert!(!gadget.is_connected());
        assert!(sup.connected_devices().is_empty());
        assert_eq!(sup.state(id()), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn requested_devices_stay_connected_until_disconnected() {
        let (mut sup, gadget) = supervisor(SimConfig::default(), 1);
        sup.connect(id(), true).await.unwrap();
        sup.execute(id(), Idempotency::Idempotent, async |s| registers::battery(s).await)
            .await
            .unwrap();
        assert!(gadget.is_connected());
        assert_eq!(gadget.open_attempts(), 1);

        sup.disconnect(id()).await;
        assert!(!gadget.is_connected());
        assert!(sup.connected_devices().is_empty());
        assert_eq!(sup.state(id()), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn idempotent_operations_survive_a_dropped_link() {
        let (mut sup, gadget) = supervisor(
            SimConfig {
                drop_link_after: Some(0),
                ..SimConfig::default()
            },
            2,
        );
        let mut calls = 0;
        let level = sup
            .execute(id(), Idempotency::Idempotent, async |s| {
                calls += 1;
                registers::battery(s).await
            })
            .await
            .unwrap();
        assert_eq!(level, 87);
        assert_eq!(calls, 2);
        assert_eq!(gadget.open_attempts(), 2);
    }

    #[tokio::test]
    async fn dropped_link_with_exhausted_budget_is_reported() {
        let (mut sup, _gadget) = supervisor(
            SimConfig {
                drop_link_after: Some(0),
                ..SimConfig::default()
            },
            1,
        );
        let err = sup
            .execute(id(), Idempotency::Idempotent, async |s| registers::battery(s).await)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Disconnected { .. }));
    }

    #[tokio::test]
    async fn at_most_once_writes_are_not_reissued() {
        let (mut sup, gadget) = supervisor(
            SimConfig {
                drop_link_after: Some(0),
                ..SimConfig::default()
            },
            5,
        );
        let err = sup
            .execute(id(), Idempotency::AtMostOnce("set_logger_interval"), async |s| {
                registers::set_logger_interval(s, 60_000).await
            })
            .await
            .unwrap_err();
        match err {
            Error::Unconfirmed { operation, source, .. } => {
                assert_eq!(operation, "set_logger_interval");
                assert!(source.is_transient());
            }
            other => panic!("expected Unconfirmed, got {other:?}"),
        }
        assert_eq!(gadget.open_attempts(), 1);
        assert!(gadget.writes_to(Characteristic::LoggerInterval).is_empty());
    }

    #[tokio::test]
    async fn integrity_errors_are_not_retried() {
        let (mut sup, gadget) = supervisor(SimConfig::default(), 5);
        let mut calls = 0;
        let err = sup
            .execute(id(), Idempotency::Idempotent, async |_s| {
                calls += 1;
                Err::<(), _>(Error::Integrity("slot mismatch".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
        assert_eq!(calls, 1);
        assert_eq!(gadget.open_attempts(), 1);
    }

    #[test]
    fn max_attempts_is_clamped() {
        let (mut sup, _) = supervisor(SimConfig::default(), 0);
        assert_eq!(sup.max_attempts(), 1);
        sup.set_max_attempts(7);
        assert_eq!(sup.max_attempts(), 7);
        sup.set_max_attempts(0);
        assert_eq!(sup.max_attempts(), 1);
    }
}
