//! Driver-side contract: save, check preemption, drain, then exit

use shardconv_checkpoint::{
    CheckpointBackend, CheckpointError, CheckpointManager, CheckpointOptions, CheckpointPhase,
    LocalCheckpointBackend, OptimizerState, PreemptionSignal, Result, TrainState,
};
use shardconv_core::{narrow_tree, DType, ParameterTree, Precision, Tensor};

fn params() -> ParameterTree {
    let kernel: Vec<f32> = (0..64).map(|v| v as f32 * 0.75 - 20.0).collect();
    ParameterTree::from_flat(vec![
        ("decoder/layers/mlp/wo/kernel", Tensor::from_f32(vec![2, 4, 8], &kernel).unwrap()),
        ("token_embedder/embedding", Tensor::from_f32(vec![4, 2], &[1.0; 8]).unwrap()),
    ])
    .unwrap()
}

/// Store whose writes always fail
struct FailingBackend;

impl CheckpointBackend for FailingBackend {
    fn write(&self, _: &TrainState) -> Result<()> {
        Err(CheckpointError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "volume detached",
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

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_preempted_run_drains_narrowed_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let signal = PreemptionSignal::new();
    let manager = CheckpointManager::new(
        LocalCheckpointBackend::new(dir.path()).unwrap(),
        CheckpointOptions::default(),
    )
    .unwrap()
    .with_preemption(signal.clone());

    let narrowed = narrow_tree(&params(), Precision::Int8).unwrap();
    assert!(manager.save(0, TrainState::inference(0, narrowed)).await.unwrap());

    signal.trigger();
    assert!(manager.reached_preemption(0));
    manager.wait_until_finished().await.unwrap();
    assert_eq!(manager.phase(), CheckpointPhase::Committed);

    let restored = manager.restore(0).unwrap();
    assert_eq!(restored.opt_state, OptimizerState::Empty);
    for (_, tensor) in restored.params.flatten().unwrap() {
        assert_eq!(tensor.dtype(), DType::I8);
    }
}

#[tokio::test]
async fn test_restore_latest_picks_highest_step() {
    let dir = tempfile::tempdir().unwrap();
    let backend = LocalCheckpointBackend::new(dir.path()).unwrap();
    backend.write(&TrainState::inference(7, params())).unwrap();
    backend.write(&TrainState::inference(12, params())).unwrap();

    let manager = CheckpointManager::new(backend, CheckpointOptions::default()).unwrap();
    let latest = manager.restore_latest().unwrap().unwrap();
    assert_eq!(latest.step, 12);
    assert_eq!(latest.params.num_parameters(), 64 + 8);
}

#[tokio::test]
async fn test_failed_drain_returns_to_idle() {
    let signal = PreemptionSignal::new();
    let manager = CheckpointManager::new(FailingBackend, CheckpointOptions::default())
        .unwrap()
        .with_preemption(signal.clone());

    assert!(manager.save(4, TrainState::inference(4, params())).await.unwrap());
    signal.trigger();
    assert!(manager.reached_preemption(4));
    assert_eq!(manager.phase(), CheckpointPhase::Draining);

    let err = manager.wait_until_finished().await.unwrap_err();
    assert!(matches!(err, CheckpointError::WriteFailed { step: 4, .. }));
    assert_eq!(manager.phase(), CheckpointPhase::Idle);
    assert_eq!(manager.latest_step().unwrap(), None);
}
