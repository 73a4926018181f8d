//! Checkpoint manager
//!
//! Drivers depend on three calls only: [`CheckpointManager::save`],
//! [`CheckpointManager::reached_preemption`] and
//! [`CheckpointManager::wait_until_finished`]. Writes run on the blocking
//! pool; at most one is in flight and its failure is reported by the next
//! `save` or `wait_until_finished`.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::CheckpointBackend;
use crate::error::{CheckpointError, Result};
use crate::preemption::PreemptionSignal;
use crate::state::TrainState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointOptions {
    /// Write checkpoints at all
    pub enabled: bool,
    /// Return from `save` before the write is durable
    pub async_writes: bool,
    /// Save only steps divisible by this (a preempted run saves any step)
    pub save_interval_steps: u64,
    /// Committed steps to retain, oldest deleted first
    pub max_to_keep: Option<usize>,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            async_writes: true,
            save_interval_steps: 1,
            max_to_keep: None,
        }
    }
}

/// Lifecycle of the manager's writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointPhase {
    /// Nothing dispatched yet, or the last write failed
    Idle,
    /// A write is in flight
    Saving,
    /// A write is in flight and preemption was signaled
    Draining,
    /// Every dispatched write is durable
    Committed,
}

struct InFlight {
    step: u64,
    handle: JoinHandle<Result<()>>,
}

pub struct CheckpointManager<B: CheckpointBackend> {
    backend: Arc<B>,
    options: CheckpointOptions,
    preemption: PreemptionSignal,
    phase: Mutex<CheckpointPhase>,
    in_flight: Mutex<Option<InFlight>>,
    committed: Mutex<BTreeSet<u64>>,
}

impl<B: CheckpointBackend> CheckpointManager<B> {
    pub fn new(backend: B, options: CheckpointOptions) -> Result<Self> {
        if options.save_interval_steps == 0 {
            return Err(CheckpointError::InvalidLayout(
                "save_interval_steps must be at least 1".to_string(),
            ));
        }
        let committed: BTreeSet<u64> = backend.all_steps()?.into_iter().collect();
        debug!(existing = committed.len(), "Opened checkpoint store");
        Ok(Self {
            backend: Arc::new(backend),
            options,
            preemption: PreemptionSignal::new(),
            phase: Mutex::new(CheckpointPhase::Idle),
            in_flight: Mutex::new(None),
            committed: Mutex::new(committed),
        })
    }

    /// Share an externally owned preemption signal
    pub fn with_preemption(mut self, signal: PreemptionSignal) -> Self {
        self.preemption = signal;
        self
    }

    pub fn preemption(&self) -> &PreemptionSignal {
        &self.preemption
    }

    pub fn phase(&self) -> CheckpointPhase {
        *self.phase.lock()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Dispatch a checkpoint for `step`
    ///
    /// Returns `true` iff a new checkpoint was dispatched. Skips when
    /// checkpointing is disabled, when the step is already committed, or when
    /// the step is off-interval and no preemption was signaled.
    pub async fn save(&self, step: u64, mut state: TrainState) -> Result<bool> {
        if !self.options.enabled {
            debug!(step, "Checkpointing disabled, skipping save");
            return Ok(false);
        }
        if step % self.options.save_interval_steps != 0 && !self.preemption.is_triggered() {
            debug!(step, interval = self.options.save_interval_steps, "Off-interval step, skipping save");
            return Ok(false);
        }

        self.finish_in_flight().await?;

        if self.committed.lock().contains(&step) {
            warn!(step, "Checkpoint for step already committed, skipping save");
            return Ok(false);
        }

        state.step = step;
        let num_parameters = state.params.num_parameters();
        *self.phase.lock() = if self.preemption.is_triggered() {
            CheckpointPhase::Draining
        } else {
            CheckpointPhase::Saving
        };

        let backend = Arc::clone(&self.backend);
        let handle = tokio::task::spawn_blocking(move || backend.write(&state));
        *self.in_flight.lock() = Some(InFlight { step, handle });

        info!(
            step,
            params_billions = num_parameters as f64 / 1e9,
            async_writes = self.options.async_writes,
            "Checkpoint dispatched"
        );

        if !self.options.async_writes {
            self.finish_in_flight().await?;
        }
        Ok(true)
    }

    /// Whether the host signaled termination
    ///
    /// A `true` result must be followed by [`Self::wait_until_finished`]
    /// before the process exits.
    pub fn reached_preemption(&self, step: u64) -> bool {
        if !self.preemption.is_triggered() {
            return false;
        }
        let mut phase = self.phase.lock();
        if *phase == CheckpointPhase::Saving {
            *phase = CheckpointPhase::Draining;
        }
        info!(step, phase = ?*phase, "Preemption reached");
        true
    }

    /// Wait for every outstanding write, surfacing the first failure
    pub async fn wait_until_finished(&self) -> Result<()> {
        self.finish_in_flight().await
    }

    /// Most recent committed step
    pub fn latest_step(&self) -> Result<Option<u64>> {
        Ok(self.backend.all_steps()?.last().copied())
    }

    pub fn restore(&self, step: u64) -> Result<TrainState> {
        let state = self.backend.read(step)?;
        info!(
            step,
            leaves = state.params.num_leaves(),
            params_billions = state.params.num_parameters() as f64 / 1e9,
            "Restored checkpoint"
        );
        Ok(state)
    }

    pub fn restore_latest(&self) -> Result<Option<TrainState>> {
        match self.latest_step()? {
            Some(step) => self.restore(step).map(Some),
            None => Ok(None),
        }
    }

    async fn finish_in_flight(&self) -> Result<()> {
        let pending = self.in_flight.lock().take();
        let Some(InFlight { step, handle }) = pending else {
            return Ok(());
        };

        let outcome = match handle.await {
            Ok(result) => result.map_err(|e| CheckpointError::WriteFailed {
                step,
                reason: e.to_string(),
            }),
            Err(e) => Err(CheckpointError::TaskJoin(e.to_string())),
        };
        if let Err(e) = outcome {
            *self.phase.lock() = CheckpointPhase::Idle;
            return Err(e);
        }

        self.committed.lock().insert(step);
        *self.phase.lock() = CheckpointPhase::Committed;
        info!(step, "Checkpoint committed");
        self.apply_retention()
    }

    fn apply_retention(&self) -> Result<()> {
        let Some(keep) = self.options.max_to_keep else {
            return Ok(());
        };
        let steps = self.backend.all_steps()?;
        if steps.len() <= keep {
            return Ok(());
        }
        for &step in &steps[..steps.len() - keep] {
            self.backend.delete(step)?;
            self.committed.lock().remove(&step);
            debug!(step, "Removed checkpoint beyond retention");
        }
        Ok(())
    }
}

impl<B: CheckpointBackend> Drop for CheckpointManager<B> {
    fn drop(&mut self) {
        if let Some(pending) = self.in_flight.get_mut().as_ref() {
            warn!(
                step = pending.step,
                "Checkpoint manager dropped with a write in flight; call wait_until_finished first"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use shardconv_core::{ParameterTree, Tensor};

    use super::*;
    use crate::backend::LocalCheckpointBackend;

    fn state() -> TrainState {
        let params = ParameterTree::from_flat(vec![(
            "decoder/decoder_norm/scale",
            Tensor::from_f32(vec![2], &[0.5, 1.5]).unwrap(),
        )])
        .unwrap();
        TrainState::inference(0, params)
    }

    fn manager(dir: &std::path::Path, options: CheckpointOptions) -> CheckpointManager<LocalCheckpointBackend> {
        CheckpointManager::new(LocalCheckpointBackend::new(dir).unwrap(), options).unwrap()
    }

    /// Fails every write after counting it
    #[derive(Default)]
    struct FailingBackend {
        writes: AtomicUsize,
    }

    impl CheckpointBackend for FailingBackend {
        fn write(&self, _: &TrainState) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Err(CheckpointError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }

        fn all_steps(&self) -> Result<Vec<u64>> {
            Ok(Vec::new())
        }

        fn read(&self, step: u64) -> Result<TrainState> {
            Err(CheckpointError::StepNotFound(step))
        }

        fn delete(&self, step: u64) -> Result<()> {
            Err(CheckpointError::StepNotFound(step))
        }
    }

    #[tokio::test]
    async fn test_save_then_wait_commits() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), CheckpointOptions::default());
        assert_eq!(manager.phase(), CheckpointPhase::Idle);

        assert!(manager.save(0, state()).await.unwrap());
        manager.wait_until_finished().await.unwrap();
        assert_eq!(manager.phase(), CheckpointPhase::Committed);
        assert_eq!(manager.latest_step().unwrap(), Some(0));

        let restored = manager.restore(0).unwrap();
        assert_eq!(restored.params.flatten().unwrap(), state().params.flatten().unwrap());
    }

    #[tokio::test]
    async fn test_committed_step_is_not_saved_twice() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), CheckpointOptions::default());
        assert!(manager.save(3, state()).await.unwrap());
        assert!(!manager.save(3, state()).await.unwrap());
        manager.wait_until_finished().await.unwrap();

        // A fresh manager sees the step already on disk
        let reopened = self::manager(dir.path(), CheckpointOptions::default());
        assert!(!reopened.save(3, state()).await.unwrap());
    }

    #[tokio::test]
    async fn test_off_interval_step_skipped_unless_preempted() {
        let dir = tempfile::tempdir().unwrap();
        let options = CheckpointOptions {
            save_interval_steps: 10,
            ..Default::default()
        };
        let manager = manager(dir.path(), options);
        assert!(!manager.save(5, state()).await.unwrap());
        assert!(!manager.reached_preemption(5));

        manager.preemption().trigger();
        assert!(manager.save(5, state()).await.unwrap());
        assert!(manager.reached_preemption(5));
        assert_eq!(manager.phase(), CheckpointPhase::Draining);

        manager.wait_until_finished().await.unwrap();
        assert_eq!(manager.phase(), CheckpointPhase::Committed);
        assert_eq!(manager.backend().all_steps().unwrap(), vec![5]);
    }

    #[tokio::test]
    async fn test_failed_write_surfaces_on_wait() {
        let manager = CheckpointManager::new(FailingBackend::default(), CheckpointOptions::default()).unwrap();
        assert!(manager.save(0, state()).await.unwrap());

        let err = manager.wait_until_finished().await.unwrap_err();
        assert!(matches!(err, CheckpointError::WriteFailed { step: 0, .. }));
        assert_eq!(manager.phase(), CheckpointPhase::Idle);
        assert_eq!(manager.backend().writes.load(Ordering::SeqCst), 1);

        // Reported once
        manager.wait_until_finished().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_write_surfaces_on_next_save() {
        let manager = CheckpointManager::new(FailingBackend::default(), CheckpointOptions::default()).unwrap();
        assert!(manager.save(1, state()).await.unwrap());
        assert!(matches!(
            manager.save(2, state()).await,
            Err(CheckpointError::WriteFailed { step: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_sync_writes_are_durable_on_return() {
        let dir = tempfile::tempdir().unwrap();
        let options = CheckpointOptions {
            async_writes: false,
            ..Default::default()
        };
        let manager = manager(dir.path(), options);
        assert!(manager.save(0, state()).await.unwrap());
        assert_eq!(manager.phase(), CheckpointPhase::Committed);
        assert!(dir.path().join("0").join(crate::backend::PARAMS_FILE).is_file());
    }

    #[tokio::test]
    async fn test_retention_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let options = CheckpointOptions {
            max_to_keep: Some(2),
            ..Default::default()
        };
        let manager = manager(dir.path(), options);
        for step in [1, 2, 3, 4] {
            assert!(manager.save(step, state()).await.unwrap());
        }
        manager.wait_until_finished().await.unwrap();
        assert_eq!(manager.backend().all_steps().unwrap(), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_disabled_never_writes() {
        let dir = tempfile::tempdir().unwrap();
        let options = CheckpointOptions {
            enabled: false,
            ..Default::default()
        };
        let manager = manager(dir.path(), options);
        assert!(!manager.save(0, state()).await.unwrap());
        manager.wait_until_finished().await.unwrap();
        assert_eq!(manager.phase(), CheckpointPhase::Idle);
        assert!(manager.latest_step().unwrap().is_none());
    }
}
