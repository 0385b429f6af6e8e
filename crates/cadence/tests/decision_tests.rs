// Decision tests — stop rule, snapshot policy, per-class accounting, resume

use std::sync::Arc;

use cadence::checkpoint::MemoryCheckpointWriter;
use cadence::metrics::{fold_error, MIN_SENTINEL};
use cadence::prelude::*;
use cadence::{Bindings, DeviceRef, HostDevice, MinibatchState, MirrorDevice};

// Harness: drives a Decision the way the scheduler would, with the
// evaluator's accumulation done by hand.

struct Harness {
    decision: Decision,
    minibatch: Minibatch,
    n_err: Buffer,
    metrics: Option<Buffer>,
    writer: MemoryCheckpointWriter,
}

fn harness(config: DecisionConfig, samples: ClassSamples) -> Harness {
    harness_with(config, samples, false, Vec::new())
}

fn harness_with(
    config: DecisionConfig,
    samples: ClassSamples,
    with_metrics: bool,
    params: Vec<(String, Buffer)>,
) -> Harness {
    let minibatch = Minibatch::new();
    let n_err = Buffer::zeros("minibatch_n_err", [1]);
    let writer = MemoryCheckpointWriter::new();
    let mut decision = Decision::new(config, minibatch.clone(), samples)
        .with_parameters(params)
        .with_writer(Box::new(writer.clone()));

    let mut bindings = Bindings::new();
    bindings.insert("minibatch_n_err", n_err.clone(), Access::ReadWrite);
    let metrics = with_metrics.then(|| {
        let m = Buffer::from_vec("minibatch_metrics", [3], vec![0.0, 0.0, MIN_SENTINEL]).unwrap();
        bindings.insert("minibatch_metrics", m.clone(), Access::ReadWrite);
        m
    });
    let dev = HostDevice::shared();
    decision
        .initialize(&InitContext::new("decision", &bindings, &dev))
        .unwrap();
    Harness {
        decision,
        minibatch,
        n_err,
        metrics,
        writer,
    }
}

impl Harness {
    /// One minibatch of `class` with `errors` misclassified samples.
    fn tick(&mut self, class: MinibatchClass, last: bool, errors: u64) {
        let so_far = self.n_err.get(0).unwrap();
        self.n_err.set(0, so_far + errors as f64).unwrap();
        self.minibatch.set(MinibatchState {
            class,
            last,
            size: 1,
            offset: 0,
        });
        self.decision
            .run(&RunContext::new("decision", 0))
            .unwrap();
    }

    /// A whole class served as a single minibatch.
    fn pass(&mut self, class: MinibatchClass, errors: u64) {
        self.tick(class, true, errors);
    }

    /// Validation then train, one minibatch each.
    fn epoch(&mut self, validation_errors: u64) {
        self.pass(MinibatchClass::Validation, validation_errors);
        self.pass(MinibatchClass::Train, 0);
    }

    fn complete(&self) -> bool {
        self.decision.is_complete()
    }

    fn snapshot_epochs(&self) -> Vec<u64> {
        self.writer
            .snapshots()
            .iter()
            .map(|s| s.epoch_number)
            .collect()
    }
}

fn accept_all() -> DecisionConfig {
    DecisionConfig::default().snapshot_threshold(f64::INFINITY)
}

// Gates

#[test]
fn test_gd_skip_tracks_class_every_tick() {
    let mut h = harness(DecisionConfig::default(), ClassSamples::new(5, 5, 10));
    let gd_skip = h.decision.gd_skip();

    h.tick(MinibatchClass::Test, false, 0);
    assert!(gd_skip.get());
    h.tick(MinibatchClass::Validation, false, 0);
    assert!(gd_skip.get());
    h.tick(MinibatchClass::Train, false, 0);
    assert!(!gd_skip.get());
}

#[test]
fn test_epoch_ended_is_set_for_one_tick() {
    let mut h = harness(DecisionConfig::default(), ClassSamples::new(0, 10, 10));
    let ended = h.decision.epoch_ended();
    h.tick(MinibatchClass::Train, false, 0);
    assert!(!ended.get());
    h.tick(MinibatchClass::Train, true, 0);
    assert!(ended.get());
    assert_eq!(h.decision.epoch_number(), 1);
    h.tick(MinibatchClass::Validation, false, 0);
    assert!(!ended.get());
}

// Stop rule

#[test]
fn test_stops_after_exactly_n_plus_one_non_improving_epochs() {
    let n = 3;
    let mut h = harness(
        DecisionConfig::default().fail_iterations(n),
        ClassSamples::new(0, 100, 100),
    );
    h.epoch(10);
    for _ in 0..n {
        h.epoch(10);
        assert!(!h.complete());
    }
    h.pass(MinibatchClass::Validation, 10);
    assert!(h.complete());
    assert_eq!(h.decision.best_epoch(), Some(0));
    assert_eq!(h.decision.epoch_number(), n + 1);
}

#[test]
fn test_ties_do_not_count_as_improvement() {
    let mut h = harness(
        DecisionConfig::default().fail_iterations(1),
        ClassSamples::new(0, 100, 100),
    );
    h.epoch(7);
    h.epoch(7);
    h.pass(MinibatchClass::Validation, 7);
    assert!(h.complete());
    assert_eq!(h.decision.best_epoch(), Some(0));
}

#[test]
fn test_complete_is_a_latch() {
    let mut h = harness(
        DecisionConfig::default().fail_iterations(0),
        ClassSamples::new(0, 100, 100),
    );
    h.epoch(5);
    h.epoch(5);
    assert!(h.complete());
    h.epoch(1);
    assert!(h.complete());
}

#[test]
fn test_scenario_validation_1000_train_5000() {
    // 100-sample minibatches: 10 validation ticks, then 50 train ticks.
    let mut h = harness(
        DecisionConfig::default().fail_iterations(2),
        ClassSamples::new(0, 1000, 5000),
    );
    let gd_skip = h.decision.gd_skip();
    let validation_errors = [300u64, 250, 260, 255, 270];

    for (epoch, &errors) in validation_errors.iter().enumerate() {
        for i in 0..10 {
            // Spread the errors over the minibatches.
            let e = if i == 0 { errors - 9 * (errors / 10) } else { errors / 10 };
            h.tick(MinibatchClass::Validation, i == 9, e);
            assert!(gd_skip.get());
        }
        let state = h.decision.state();
        assert_eq!(state.epoch_n_err[1], errors);
        assert_eq!(state.epoch_n_err_pt[1], errors as f64 / 10.0);

        if epoch < 4 {
            assert!(!h.complete(), "stopped early at epoch {epoch}");
        } else {
            assert!(h.complete());
        }
        for i in 0..50 {
            h.tick(MinibatchClass::Train, i == 49, 1);
            assert!(!gd_skip.get());
        }
        assert_eq!(h.decision.epoch_number(), epoch as u64 + 1);
    }
    // Best at epoch 1; 4 - 1 > 2.
    assert_eq!(h.decision.best_epoch(), Some(1));
    assert_eq!(h.decision.state().epoch_n_err_pt[2], 1.0);
}

#[test]
fn test_max_epochs_latches_complete() {
    let mut h = harness(
        DecisionConfig::default().max_epochs(2),
        ClassSamples::new(0, 10, 10),
    );
    h.epoch(5);
    assert!(!h.complete());
    h.epoch(4);
    assert!(h.complete());
}

// Snapshots

#[test]
fn test_snapshots_only_on_strict_improvement() {
    let mut h = harness(accept_all(), ClassSamples::new(0, 100, 100));
    let just = h.decision.just_snapshotted();
    let mut flags = Vec::new();
    for errors in [10, 10, 9, 9, 11] {
        h.pass(MinibatchClass::Validation, errors);
        flags.push(just.get());
        h.pass(MinibatchClass::Train, 0);
    }
    assert_eq!(h.snapshot_epochs(), vec![0, 2]);
    assert_eq!(flags, vec![true, false, true, false, false]);
    assert_eq!(h.decision.snapshots_written(), 2);
}

#[test]
fn test_threshold_filters_snapshots_not_improvement() {
    let mut h = harness(
        DecisionConfig::default().snapshot_threshold(5.0),
        ClassSamples::new(0, 100, 100),
    );
    h.epoch(10);
    assert!(h.writer.is_empty());
    assert_eq!(h.decision.best_epoch(), Some(0));
    h.epoch(4);
    assert_eq!(h.snapshot_epochs(), vec![1]);
    assert_eq!(h.writer.latest().unwrap().score, 4.0);
}

#[test]
fn test_snapshot_carries_parameters() {
    let w = Buffer::from_vec("w", [2], vec![0.5, -0.5]).unwrap();
    let mut h = harness_with(
        accept_all(),
        ClassSamples::new(0, 10, 10),
        false,
        vec![("w".to_string(), w.clone())],
    );
    h.epoch(3);
    let snap = h.writer.latest().unwrap();
    assert_eq!(snap.parameter("w").unwrap().data, vec![0.5, -0.5]);
    assert_eq!(snap.score, 30.0);
    assert_eq!(snap.decision.best_epoch, Some(0));
}

// Class accounting

#[test]
fn test_counters_accumulate_per_class_and_reset() {
    let mut h = harness(DecisionConfig::default(), ClassSamples::new(20, 40, 100));
    h.tick(MinibatchClass::Test, false, 1);
    h.tick(MinibatchClass::Test, true, 2);
    assert_eq!(h.n_err.get(0).unwrap(), 0.0);
    h.tick(MinibatchClass::Validation, true, 4);
    h.tick(MinibatchClass::Train, false, 10);
    h.tick(MinibatchClass::Train, true, 15);

    let s = h.decision.state();
    assert_eq!(s.epoch_n_err, [3, 4, 25]);
    assert_eq!(s.epoch_n_err_pt, [15.0, 10.0, 25.0]);
    // Running counters restart with the next epoch.
    assert_eq!(s.n_err, [0, 0, 0]);
    assert_eq!(s.epoch_number, 1);
}

#[test]
fn test_validation_role_falls_back_to_train() {
    let mut h = harness(
        accept_all().fail_iterations(1),
        ClassSamples::new(0, 0, 100),
    );
    for errors in [5, 6, 7] {
        h.pass(MinibatchClass::Train, errors);
    }
    assert_eq!(h.snapshot_epochs(), vec![0]);
    assert!(h.complete());
    assert_eq!(h.decision.epoch_number(), 3);
}

#[test]
fn test_last_minibatch_of_empty_class_is_an_error() {
    let mut h = harness(DecisionConfig::default(), ClassSamples::new(0, 10, 10));
    h.minibatch.set(MinibatchState {
        class: MinibatchClass::Test,
        last: true,
        size: 1,
        offset: 0,
    });
    let err = h
        .decision
        .run(&RunContext::new("decision", 0))
        .unwrap_err();
    assert!(matches!(err, Error::EmptyClass { ref class } if class == "test"));
}

#[test]
fn test_epoch_metrics_and_sentinel_reset() {
    let mut h = harness_with(
        DecisionConfig::default(),
        ClassSamples::new(0, 4, 4),
        true,
        Vec::new(),
    );
    let metrics = h.metrics.clone().unwrap();
    for err in [0.5, 0.25, 1.0, 0.25] {
        fold_error(&mut metrics.write().unwrap(), err);
    }
    h.pass(MinibatchClass::Validation, 1);

    let s = h.decision.state();
    assert_eq!(s.epoch_metrics[1], [0.5, 1.0, 0.25]);
    assert_eq!(s.epoch_min_mse[1], 0.5);
    assert_eq!(metrics.to_vec().unwrap(), vec![0.0, 0.0, MIN_SENTINEL]);
}

#[test]
fn test_confusion_matrix_is_collected_per_class() {
    let minibatch = Minibatch::new();
    let n_err = Buffer::zeros("minibatch_n_err", [1]);
    let confusion = Buffer::from_vec("minibatch_confusion_matrix", [2, 2], vec![3.0, 1.0, 0.0, 4.0])
        .unwrap();
    let mut decision = Decision::new(
        DecisionConfig::default(),
        minibatch.clone(),
        ClassSamples::new(0, 8, 8),
    );
    let mut bindings = Bindings::new();
    bindings.insert("minibatch_n_err", n_err, Access::ReadWrite);
    bindings.insert("minibatch_confusion_matrix", confusion.clone(), Access::ReadWrite);
    let dev = HostDevice::shared();
    decision
        .initialize(&InitContext::new("decision", &bindings, &dev))
        .unwrap();

    minibatch.set(MinibatchState {
        class: MinibatchClass::Validation,
        last: true,
        size: 8,
        offset: 0,
    });
    decision.run(&RunContext::new("decision", 1)).unwrap();

    let cm = decision
        .confusion_matrix(MinibatchClass::Validation)
        .unwrap();
    assert_eq!(cm.total(), 8);
    assert_eq!(cm.errors(), 1);
    assert!(decision.confusion_matrix(MinibatchClass::Train).is_none());
    assert_eq!(confusion.to_vec().unwrap(), vec![0.0; 4]);
}

// Replay and resume

#[test]
fn test_replay_is_deterministic() {
    let run = || {
        let mut h = harness(
            accept_all().fail_iterations(2),
            ClassSamples::new(10, 100, 100),
        );
        for (i, errors) in [40u64, 35, 35, 36, 33, 34, 34, 34].into_iter().enumerate() {
            h.pass(MinibatchClass::Test, i as u64);
            h.epoch(errors);
        }
        (h.decision.state().clone(), h.writer.snapshots(), h.complete())
    };
    let (state_a, snaps_a, done_a) = run();
    let (state_b, snaps_b, done_b) = run();
    assert_eq!(state_a, state_b);
    assert_eq!(snaps_a, snaps_b);
    assert_eq!(done_a, done_b);
}

#[test]
fn test_restore_and_continue_past_max_epochs() {
    let w = Buffer::from_vec("w", [1], vec![2.0]).unwrap();
    let mut h = harness_with(
        accept_all().max_epochs(2),
        ClassSamples::new(0, 10, 10),
        false,
        vec![("w".to_string(), w.clone())],
    );
    h.epoch(5);
    h.epoch(4);
    assert!(h.complete());
    let snap = h.writer.latest().unwrap();

    // Fresh decision and parameters, resumed from the snapshot.
    let w2 = Buffer::zeros("w", [1]);
    let mut resumed = harness_with(
        accept_all().max_epochs(2),
        ClassSamples::new(0, 10, 10),
        false,
        vec![("w".to_string(), w2.clone())],
    );
    assert_eq!(resumed.decision.restore_snapshot(&snap).unwrap(), 1);
    assert_eq!(w2.to_vec().unwrap(), vec![2.0]);
    let state = resumed.decision.state();
    assert_eq!(state.epoch_number, 1);
    assert_eq!(state.best_n_err, Some(4));
    assert_eq!(state.epoch_n_err, snap.decision.epoch_n_err);
    assert_eq!(state.n_err, [0; 3]);

    // Replaying epoch 1 counts its validation pass once.
    resumed.decision.config_mut().max_epochs = Some(3);
    resumed.decision.reset_complete();
    resumed.epoch(4);
    assert!(!resumed.complete());
    assert_eq!(resumed.decision.state().epoch_n_err[1], 4);
    resumed.epoch(3);
    assert!(resumed.complete());
    assert_eq!(resumed.decision.best_epoch(), Some(2));
    assert_eq!(resumed.decision.epoch_number(), 3);
}

#[test]
fn test_parameters_synced_at_epoch_end() {
    let device: DeviceRef = Arc::new(MirrorDevice::new(0));
    let w = Buffer::zeros("w", [2]);
    w.attach(&device).unwrap();
    let mut h = harness_with(
        DecisionConfig::default().sync_parameters_on_epoch(true),
        ClassSamples::new(0, 10, 10),
        false,
        vec![("w".to_string(), w.clone())],
    );
    w.device_write().unwrap().fill(1.5);
    h.pass(MinibatchClass::Validation, 1);
    assert!(w.is_device_dirty());
    h.pass(MinibatchClass::Train, 1);
    assert!(!w.is_device_dirty());
    assert_eq!(w.to_vec().unwrap(), vec![1.5, 1.5]);
}

// Configuration errors

#[test]
fn test_missing_n_err_binding() {
    let mut decision = Decision::new(
        DecisionConfig::default(),
        Minibatch::new(),
        ClassSamples::new(0, 1, 1),
    );
    let bindings = Bindings::new();
    let dev = HostDevice::shared();
    let err = decision
        .initialize(&InitContext::new("decision", &bindings, &dev))
        .unwrap_err();
    assert!(matches!(err, Error::MissingBinding { ref binding, .. } if binding == "minibatch_n_err"));
}

#[test]
fn test_non_square_confusion_binding() {
    let mut decision = Decision::new(
        DecisionConfig::default(),
        Minibatch::new(),
        ClassSamples::new(0, 1, 1),
    );
    let mut bindings = Bindings::new();
    bindings.insert("minibatch_n_err", Buffer::zeros("n", [1]), Access::ReadWrite);
    bindings.insert(
        "minibatch_confusion_matrix",
        Buffer::zeros("cm", [2, 3]),
        Access::ReadWrite,
    );
    let dev = HostDevice::shared();
    let err = decision
        .initialize(&InitContext::new("decision", &bindings, &dev))
        .unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
}

#[test]
fn test_config_round_trips_through_json() {
    let config = DecisionConfig::default().fail_iterations(7).max_epochs(30);
    let json = serde_json::to_string(&config).unwrap();
    let back: DecisionConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, config);
    let partial: DecisionConfig = serde_json::from_str(r#"{"fail_iterations": 3}"#).unwrap();
    assert_eq!(partial.fail_iterations, 3);
    assert_eq!(partial.snapshot_threshold, 100.0);
}

// Evaluator contract

/// A decision without a writer, with `minibatch_n_err` plus `extra` bound.
fn bare_decision(
    config: DecisionConfig,
    samples: ClassSamples,
    extra: &[(&str, &Buffer)],
) -> (Decision, Minibatch, Buffer) {
    let minibatch = Minibatch::new();
    let n_err = Buffer::zeros("minibatch_n_err", [1]);
    let mut decision = Decision::new(config, minibatch.clone(), samples);
    let mut bindings = Bindings::new();
    bindings.insert("minibatch_n_err", n_err.clone(), Access::ReadWrite);
    for &(name, buf) in extra {
        bindings.insert(name, buf.clone(), Access::Read);
    }
    let dev = HostDevice::shared();
    decision
        .initialize(&InitContext::new("decision", &bindings, &dev))
        .unwrap();
    (decision, minibatch, n_err)
}

fn serve(
    decision: &mut Decision,
    minibatch: &Minibatch,
    class: MinibatchClass,
    offset: usize,
    size: usize,
    last: bool,
) -> Result<()> {
    minibatch.set(MinibatchState {
        class,
        last,
        size,
        offset,
    });
    decision.run(&RunContext::new("decision", 0))
}

#[test]
fn test_error_count_beyond_class_size_is_rejected() {
    for bad in [11.0, -1.0, f64::NAN] {
        let (mut decision, minibatch, n_err) = bare_decision(
            DecisionConfig::default(),
            ClassSamples::new(0, 10, 10),
            &[],
        );
        n_err.set(0, bad).unwrap();
        let err = serve(&mut decision, &minibatch, MinibatchClass::Validation, 0, 10, true)
            .unwrap_err();
        match err {
            Error::ErrorCountOutOfRange { class, samples, .. } => {
                assert_eq!(class, "validation");
                assert_eq!(samples, 10);
            }
            other => panic!("unexpected error for {bad}: {other}"),
        }
        assert_eq!(decision.state().epoch_n_err, [0; 3]);
    }
}

#[test]
fn test_error_count_equal_to_class_size_is_accepted() {
    let (mut decision, minibatch, n_err) = bare_decision(
        DecisionConfig::default(),
        ClassSamples::new(0, 10, 10),
        &[],
    );
    n_err.set(0, 10.0).unwrap();
    serve(&mut decision, &minibatch, MinibatchClass::Validation, 0, 10, true).unwrap();
    assert_eq!(decision.state().epoch_n_err_pt[1], 100.0);
}

#[test]
fn test_snapshot_without_writer_still_raises_flag() {
    let (mut decision, minibatch, n_err) = bare_decision(
        accept_all(),
        ClassSamples::new(0, 10, 10),
        &[],
    );
    let just = decision.just_snapshotted();
    n_err.set(0, 2.0).unwrap();
    serve(&mut decision, &minibatch, MinibatchClass::Validation, 0, 10, true).unwrap();
    assert!(just.get());
    assert_eq!(decision.snapshots_written(), 0);
    assert!(!decision.save_snapshot().unwrap());
}

// Per-sample errors and sample rows

#[test]
fn test_per_sample_errors_follow_class_positions() {
    let mse = Buffer::zeros("minibatch_mse", [3]);
    let (mut decision, minibatch, _) = bare_decision(
        DecisionConfig::default(),
        ClassSamples::new(2, 4, 6),
        &[("minibatch_mse", &mse)],
    );
    let validation = MinibatchClass::Validation;

    mse.load_host(&[0.1, 0.2, 0.3]).unwrap();
    serve(&mut decision, &minibatch, validation, 2, 3, false).unwrap();
    mse.load_host(&[0.4, 9.0, 9.0]).unwrap();
    serve(&mut decision, &minibatch, validation, 5, 1, true).unwrap();
    assert_eq!(decision.all_mse(validation).unwrap(), [0.1, 0.2, 0.3, 0.4]);
    assert_eq!(decision.all_mse(MinibatchClass::Train).unwrap(), [0.0; 6]);

    // A pass in progress does not touch the published vector.
    mse.load_host(&[1.0, 1.0, 1.0]).unwrap();
    serve(&mut decision, &minibatch, validation, 2, 3, false).unwrap();
    assert_eq!(decision.all_mse(validation).unwrap(), [0.1, 0.2, 0.3, 0.4]);
    mse.load_host(&[0.5, 0.0, 0.0]).unwrap();
    serve(&mut decision, &minibatch, validation, 5, 1, true).unwrap();
    assert_eq!(decision.all_mse(validation).unwrap(), [1.0, 1.0, 1.0, 0.5]);
}

#[test]
fn test_per_sample_errors_need_the_binding() {
    let (mut decision, minibatch, _) = bare_decision(
        DecisionConfig::default(),
        ClassSamples::new(0, 4, 4),
        &[],
    );
    serve(&mut decision, &minibatch, MinibatchClass::Validation, 0, 4, true).unwrap();
    assert!(decision.all_mse(MinibatchClass::Validation).is_none());
}

#[test]
fn test_minibatch_outside_its_class_range_is_rejected() {
    let mse = Buffer::zeros("minibatch_mse", [4]);
    let (mut decision, minibatch, _) = bare_decision(
        DecisionConfig::default(),
        ClassSamples::new(2, 4, 6),
        &[("minibatch_mse", &mse)],
    );
    let err = serve(&mut decision, &minibatch, MinibatchClass::Validation, 4, 4, false)
        .unwrap_err();
    assert!(matches!(err, Error::UnclassifiedMinibatch { offset: 4, total: 12 }));
}

#[test]
fn test_sample_rows_are_kept_at_train_end() {
    let input = Buffer::from_vec("input", [2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    let output = Buffer::from_vec("output", [2, 2], vec![0.25, 0.75, 0.5, 0.5]).unwrap();
    let (mut decision, minibatch, _) = bare_decision(
        DecisionConfig::default(),
        ClassSamples::new(0, 2, 2),
        &[("sample_input", &input), ("sample_output", &output)],
    );
    serve(&mut decision, &minibatch, MinibatchClass::Validation, 0, 2, true).unwrap();
    assert!(decision.sample_input().is_none());

    serve(&mut decision, &minibatch, MinibatchClass::Train, 2, 2, true).unwrap();
    assert_eq!(decision.sample_input().unwrap(), [1.0, 2.0, 3.0]);
    assert_eq!(decision.sample_output().unwrap(), [0.25, 0.75]);
}
