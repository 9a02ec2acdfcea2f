//! Lock state resolution.
//!
//! After a restart the bolt position may be unknown. The sequence below
//! drives the lock into a known state:
//!
//! 1. unlock, wait for the echo (reconnect and stop if none)
//! 2. wait for the state datapoint to report unlocked
//! 3. unlock again, wait for the echo (continue if none)
//! 4. let the mechanism settle
//! 5. if the target is locked: lock, wait for the state to report locked

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::device::GimdowDevice;
use super::observer::Subscription;
use crate::catalog::LockMapping;
use crate::core::{GimdowError, Result, Transport};
use crate::datapoint::DatapointType;

/// Desired end state of a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTarget {
    /// End unlocked.
    Unlocked,
    /// End locked.
    Locked,
}

/// Datapoints driven by a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionPlan {
    /// Datapoint written to unlock.
    pub unlock_dp: u8,
    /// Value written to `unlock_dp`.
    pub unlock_value: bool,
    /// Datapoint reporting the bolt state (true = unlocked).
    pub state_dp: u8,
    /// Datapoint written to lock, if the product has one.
    pub lock_dp: Option<u8>,
    /// Value written to `lock_dp`.
    pub lock_value: bool,
    /// Desired end state.
    pub target: LockTarget,
}

impl ResolutionPlan {
    /// Plan for a product's lock mapping.
    pub fn from_mapping(mapping: &LockMapping, target: LockTarget) -> Self {
        Self {
            unlock_dp: mapping.unlock_dp,
            unlock_value: mapping.unlock_value,
            state_dp: mapping.state_dp,
            lock_dp: Some(mapping.lock_dp),
            lock_value: mapping.lock_value,
            target,
        }
    }
}

struct ResolvingFlag<'a>(&'a AtomicBool);

impl Drop for ResolvingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Waits for reports touching one datapoint.
struct DatapointWatch {
    rx: mpsc::UnboundedReceiver<()>,
    _subscription: Subscription,
}

impl DatapointWatch {
    async fn wait(&mut self, timeout: Duration) -> bool {
        matches!(tokio::time::timeout(timeout, self.rx.recv()).await, Ok(Some(())))
    }
}

impl<T: Transport> GimdowDevice<T> {
    /// Drive a lock with an unknown bolt position into `target`.
    ///
    /// Uses the product's lock mapping.
    pub async fn resolve_lock_state(&self, target: LockTarget) -> Result<()> {
        let mapping = self.lock_mapping().ok_or_else(|| {
            GimdowError::Config(format!("{} has no lock datapoints", self.address()))
        })?;
        self.resolve_unknown_state(ResolutionPlan::from_mapping(&mapping, target))
            .await
    }

    /// Run the resolution sequence for `plan`.
    ///
    /// A call made while another resolution runs is ignored. While running,
    /// [`lock_state`](Self::lock_state) reports `None`.
    ///
    /// Missing echoes and confirmations are logged, not returned; errors
    /// only come from a failed connect or a [`stop`](Self::stop).
    pub async fn resolve_unknown_state(&self, plan: ResolutionPlan) -> Result<()> {
        let address = self.address();
        if self.inner.resolving.swap(true, Ordering::AcqRel) {
            debug!(%address, "resolution already running, ignoring");
            return Ok(());
        }
        let _flag = ResolvingFlag(&self.inner.resolving);
        let config = &self.inner.config;
        debug!(%address, target = ?plan.target, "resolving lock state");

        if !self
            .send_and_wait_for_echo(plan.unlock_dp, plan.unlock_value)
            .await?
        {
            warn!(%address, "first unlock not echoed, aborting");
            return Ok(());
        }

        let mut unlocked = self.watch_state(plan.state_dp, true);
        if self.state_is(plan.state_dp, true) {
            debug!(%address, "already unlocked");
        } else if unlocked.wait(config.unlock_confirm_timeout).await {
            debug!(%address, "unlocked state confirmed");
        } else {
            warn!(%address, "timed out waiting for unlocked state");
        }
        drop(unlocked);
        self.check_running()?;

        if !self
            .send_and_wait_for_echo(plan.unlock_dp, plan.unlock_value)
            .await?
        {
            warn!(%address, "second unlock not echoed, continuing");
        }

        debug!(%address, delay = ?config.settle_delay, "waiting for the mechanism to settle");
        tokio::time::sleep(config.settle_delay).await;
        self.check_running()?;

        if plan.target == LockTarget::Locked {
            if let Some(lock_dp) = plan.lock_dp {
                let mut locked = self.watch_state(plan.state_dp, false);
                if let Err(e) = self
                    .set_datapoint(lock_dp, DatapointType::Bool, plan.lock_value)
                    .await
                {
                    warn!(%address, error = %e, "lock command failed");
                } else if locked.wait(config.lock_confirm_timeout).await {
                    debug!(%address, "locked state confirmed");
                } else {
                    warn!(%address, "timed out waiting for locked state");
                }
            }
        }

        debug!(%address, "resolution finished");
        Ok(())
    }

    /// Send a control datapoint and wait until a report echoes it.
    ///
    /// Without an echo the link is dropped so that it gets rebuilt.
    async fn send_and_wait_for_echo(&self, id: u8, value: bool) -> Result<bool> {
        let mut echo = self.watch(id, |_| true);
        if let Err(e) = self.set_datapoint(id, DatapointType::Bool, value).await {
            warn!(address = %self.address(), id, error = %e, "control datapoint failed");
            return Ok(false);
        }
        if echo.wait(self.inner.config.echo_timeout).await {
            debug!(address = %self.address(), id, "control datapoint echoed");
            return Ok(true);
        }
        self.check_running()?;
        warn!(address = %self.address(), id, "timed out waiting for echo");
        self.force_reconnect().await;
        Ok(false)
    }

    fn watch_state(&self, state_dp: u8, unlocked: bool) -> DatapointWatch {
        self.watch(state_dp, move |value| value == unlocked)
    }

    fn state_is(&self, state_dp: u8, unlocked: bool) -> bool {
        self.datapoint(state_dp)
            .is_some_and(|dp| dp.value().as_bool() == unlocked)
    }

    fn watch<P>(&self, id: u8, predicate: P) -> DatapointWatch
    where
        P: Fn(bool) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.on_datapoints(move |datapoints| {
            if datapoints
                .iter()
                .any(|dp| dp.id() == id && predicate(dp.value().as_bool()))
            {
                let _ = tx.send(());
            }
        });
        DatapointWatch {
            rx,
            _subscription: subscription,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::device::mock::{ADDRESS, FakeLock, credentials};
    use crate::transport::Opcode;
    use tokio::time::Instant;

    fn device(fake: &FakeLock) -> GimdowDevice<FakeLock> {
        GimdowDevice::new(ADDRESS, fake.clone(), credentials(), DeviceConfig::default()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolves_to_locked() {
        let fake = FakeLock::new().with_echo();
        let device = device(&fake);
        device.connect().await.unwrap();

        let task = tokio::spawn({
            let device = device.clone();
            async move { device.resolve_lock_state(LockTarget::Locked).await }
        });

        fake.wait_for(Opcode::DatapointSet, 1).await;
        assert!(device.is_resolving());
        assert_eq!(device.lock_state(), None);

        fake.push(Opcode::DatapointReport, &[47, 1, 1, 1]);
        fake.wait_for(Opcode::DatapointSet, 3).await;
        fake.push(Opcode::DatapointReport, &[47, 1, 1, 0]);
        task.await.unwrap().unwrap();

        let sets = fake.received(Opcode::DatapointSet);
        assert_eq!(sets.len(), 3);
        assert_eq!(sets[0].payload, vec![6, 1, 1, 1]);
        assert_eq!(sets[1].payload, vec![6, 1, 1, 1]);
        assert_eq!(sets[2].payload, vec![46, 1, 1, 1]);
        assert!(!device.is_resolving());
        assert_eq!(device.lock_state(), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_resolution_ignored() {
        let fake = FakeLock::new().with_echo();
        let device = device(&fake);
        device.connect().await.unwrap();

        let task = tokio::spawn({
            let device = device.clone();
            async move { device.resolve_lock_state(LockTarget::Unlocked).await }
        });
        fake.wait_for(Opcode::DatapointSet, 1).await;

        device
            .resolve_lock_state(LockTarget::Locked)
            .await
            .unwrap();
        assert_eq!(fake.received(Opcode::DatapointSet).len(), 1);

        fake.push(Opcode::DatapointReport, &[47, 1, 1, 1]);
        task.await.unwrap().unwrap();

        // Unlocked target: two unlocks, no lock.
        assert_eq!(fake.received(Opcode::DatapointSet).len(), 2);
        assert_eq!(device.lock_state(), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_echo_aborts_and_reconnects() {
        let fake = FakeLock::new();
        let device = device(&fake);
        device.connect().await.unwrap();

        device
            .resolve_lock_state(LockTarget::Locked)
            .await
            .unwrap();
        assert!(!device.is_resolving());
        assert_eq!(fake.received(Opcode::DatapointSet).len(), 1);

        tokio::time::timeout(Duration::from_secs(30), async {
            while !(fake.connects() == 2 && device.is_paired()) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_states_are_not_fatal() {
        let fake = FakeLock::new().with_echo();
        let device = device(&fake);
        device.connect().await.unwrap();
        let config = device.config().clone();

        device
            .resolve_lock_state(LockTarget::Locked)
            .await
            .unwrap();
        let finished = Instant::now();

        let sets = fake.received_at(Opcode::DatapointSet);
        assert_eq!(sets.len(), 3);
        // No unlocked report: the second unlock waits out the confirmation.
        assert!(sets[1] - sets[0] >= config.unlock_confirm_timeout);
        assert!(sets[2] - sets[1] >= config.settle_delay);
        // No locked report either.
        assert!(finished - sets[2] >= config.lock_confirm_timeout);
        assert_eq!(fake.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_second_echo_reconnects_and_continues() {
        let fake = FakeLock::new().with_echo();
        let device = device(&fake);
        device.connect().await.unwrap();
        let config = device.config().clone();

        let task = tokio::spawn({
            let device = device.clone();
            async move {
                let result = device.resolve_lock_state(LockTarget::Locked).await;
                (result, Instant::now())
            }
        });

        fake.wait_for(Opcode::DatapointSet, 1).await;
        fake.set_echo(false);
        fake.push(Opcode::DatapointReport, &[47, 1, 1, 1]);

        let (result, finished) = task.await.unwrap();
        result.unwrap();

        let sets = fake.received(Opcode::DatapointSet);
        assert_eq!(sets.len(), 3);
        assert_eq!(sets[1].payload, vec![6, 1, 1, 1]);
        assert_eq!(sets[2].payload, vec![46, 1, 1, 1]);
        assert_eq!(fake.connects(), 2);

        let at = fake.received_at(Opcode::DatapointSet);
        assert!(at[2] - at[1] >= config.echo_timeout + config.settle_delay);
        assert!(finished - at[2] >= config.lock_confirm_timeout);
        assert!(!device.is_resolving());
    }

    #[test]
    fn test_plan_from_mapping() {
        let mapping = crate::catalog::product_info("jtmspro", "rlyxv7pe")
            .and_then(|p| p.lock)
            .unwrap();
        let plan = ResolutionPlan::from_mapping(&mapping, LockTarget::Locked);
        assert_eq!(plan.unlock_dp, 6);
        assert_eq!(plan.state_dp, 47);
        assert_eq!(plan.lock_dp, Some(46));
    }
}
