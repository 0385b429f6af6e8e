// Tests for cadence-data: datasets and the class-partitioned loader

use cadence_core::{
    Bindings, Error, HostDevice, InitContext, MinibatchClass, MinibatchState, RunContext, Unit,
};
use cadence_data::{ClassLoader, Dataset, LoaderConfig, SyntheticBlobs, VecDataset};

// Dataset whose single feature is the sample's own position.

fn counting(n: usize) -> VecDataset {
    let features: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let labels: Vec<usize> = (0..n).map(|i| i % 3).collect();
    VecDataset::from_flat(&features, &[1], &labels, "counting").unwrap()
}

fn init(loader: &mut ClassLoader) -> cadence_core::Result<()> {
    let bindings = Bindings::new();
    let dev = HostDevice::shared();
    let ctx = InitContext::new("loader", &bindings, &dev);
    loader.initialize(&ctx)
}

fn step(loader: &mut ClassLoader) -> MinibatchState {
    loader.run(&RunContext::new("loader", 0)).unwrap();
    loader.minibatch().get()
}

// Datasets

#[test]
fn test_vec_dataset_from_flat() {
    let ds = VecDataset::from_flat(&[1.0, 2.0, 3.0, 4.0], &[2], &[0, 1], "pairs").unwrap();
    assert_eq!(ds.len(), 2);
    assert_eq!(ds.get(1).features, vec![3.0, 4.0]);
    assert_eq!(ds.num_labels(), 2);
    assert!(VecDataset::from_flat(&[1.0, 2.0, 3.0], &[2], &[0, 1], "bad").is_err());
}

#[test]
fn test_synthetic_blobs_are_seeded() {
    let a = SyntheticBlobs::new(20, 3, 4, 5.0, 9).unwrap();
    let b = SyntheticBlobs::new(20, 3, 4, 5.0, 9).unwrap();
    assert_eq!(a.len(), 20);
    assert_eq!(a.feature_shape(), &[3]);
    assert_eq!(a.num_labels(), 4);
    for i in 0..20 {
        assert_eq!(a.get(i), b.get(i));
    }
}

// Class partitioning

#[test]
fn test_minibatches_follow_class_layout() {
    let config = LoaderConfig::default()
        .minibatch_size(2)
        .class_samples(2, 3, 5)
        .shuffle(false);
    let mut loader = ClassLoader::new(Box::new(counting(10)), config);
    init(&mut loader).unwrap();

    let expected = [
        (MinibatchClass::Test, 0, 2, true),
        (MinibatchClass::Validation, 2, 2, false),
        (MinibatchClass::Validation, 4, 1, true),
        (MinibatchClass::Train, 5, 2, false),
        (MinibatchClass::Train, 7, 2, false),
        (MinibatchClass::Train, 9, 1, true),
        (MinibatchClass::Test, 0, 2, true),
    ];
    for (class, offset, size, last) in expected {
        let mb = step(&mut loader);
        assert_eq!(
            mb,
            MinibatchState {
                class,
                last,
                size,
                offset
            }
        );
    }
    assert_eq!(loader.passes(), 2);
}

#[test]
fn test_last_flag_once_per_class_per_pass() {
    let config = LoaderConfig::default()
        .minibatch_size(7)
        .class_samples(0, 10, 40)
        .seed(3);
    let mut loader = ClassLoader::new(Box::new(counting(50)), config);
    init(&mut loader).unwrap();

    let mut served = [0usize; 3];
    let mut lasts = [0usize; 3];
    // Two full passes: validation takes 2 minibatches, train 6.
    for _ in 0..16 {
        let mb = step(&mut loader);
        served[mb.class.index()] += mb.size;
        if mb.last {
            lasts[mb.class.index()] += 1;
        }
    }
    assert_eq!(served, [0, 20, 80]);
    assert_eq!(lasts, [0, 2, 2]);
}

#[test]
fn test_unused_rows_are_cleared() {
    let config = LoaderConfig::default()
        .minibatch_size(4)
        .class_samples(0, 2, 4)
        .shuffle(false);
    let mut loader = ClassLoader::new(Box::new(counting(6)), config);
    init(&mut loader).unwrap();

    step(&mut loader);
    step(&mut loader);
    let mb = step(&mut loader);
    // Validation again after wrap-around: two rows used, two cleared.
    assert_eq!(mb.class, MinibatchClass::Validation);
    assert_eq!(mb.size, 2);
    assert_eq!(loader.data().to_vec().unwrap(), vec![0.0, 1.0, 0.0, 0.0]);
    assert_eq!(
        loader.labels().to_vec().unwrap(),
        vec![0.0, 1.0, -1.0, -1.0]
    );
    assert_eq!(
        loader.indexes().to_vec().unwrap(),
        vec![0.0, 1.0, -1.0, -1.0]
    );
}

// Shuffling

#[test]
fn test_shuffle_keeps_test_range_and_permutes_rest() {
    let config = LoaderConfig::default()
        .minibatch_size(5)
        .class_samples(5, 10, 25)
        .seed(11);
    let mut loader = ClassLoader::new(Box::new(counting(40)), config);
    init(&mut loader).unwrap();

    let order = loader.order().to_vec();
    assert_eq!(&order[..5], &[0, 1, 2, 3, 4]);
    let mut rest = order[5..].to_vec();
    rest.sort_unstable();
    assert_eq!(rest, (5..40).collect::<Vec<_>>());
}

#[test]
fn test_same_seed_replays_same_minibatches() {
    let make = || {
        let config = LoaderConfig::default()
            .minibatch_size(3)
            .class_samples(0, 6, 12)
            .seed(42);
        let mut loader = ClassLoader::new(Box::new(counting(18)), config);
        init(&mut loader).unwrap();
        loader
    };
    let mut a = make();
    let mut b = make();
    for _ in 0..20 {
        assert_eq!(step(&mut a), step(&mut b));
        assert_eq!(a.indexes().to_vec().unwrap(), b.indexes().to_vec().unwrap());
    }
}

#[test]
fn test_parallel_fetch_matches_sequential() {
    let make = |workers| {
        let config = LoaderConfig::default()
            .minibatch_size(8)
            .class_samples(0, 8, 24)
            .seed(5)
            .num_workers(workers);
        let mut loader = ClassLoader::new(Box::new(counting(32)), config);
        init(&mut loader).unwrap();
        loader
    };
    let mut seq = make(0);
    let mut par = make(4);
    for _ in 0..6 {
        step(&mut seq);
        step(&mut par);
        assert_eq!(seq.data().to_vec().unwrap(), par.data().to_vec().unwrap());
    }
}

#[test]
fn test_reinitialize_keeps_position() {
    let config = LoaderConfig::default()
        .minibatch_size(2)
        .class_samples(0, 2, 6);
    let mut loader = ClassLoader::new(Box::new(counting(8)), config);
    init(&mut loader).unwrap();
    step(&mut loader);
    let before = step(&mut loader);
    let order = loader.order().to_vec();

    init(&mut loader).unwrap();
    assert_eq!(loader.order(), &order[..]);
    let after = step(&mut loader);
    assert_eq!(after.offset, before.offset + before.size);
}

// Configuration errors

#[test]
fn test_class_samples_must_match_dataset() {
    let config = LoaderConfig::default().class_samples(1, 2, 3);
    let mut loader = ClassLoader::new(Box::new(counting(10)), config);
    match init(&mut loader).unwrap_err() {
        Error::ClassSamplesMismatch { sum, total } => {
            assert_eq!(sum, 6);
            assert_eq!(total, 10);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_zero_minibatch_size_is_rejected() {
    let config = LoaderConfig::default()
        .minibatch_size(0)
        .class_samples(0, 0, 4);
    let mut loader = ClassLoader::new(Box::new(counting(4)), config);
    assert!(init(&mut loader).is_err());
}

#[test]
fn test_config_from_defaults() {
    let config = LoaderConfig::default();
    assert_eq!(config.minibatch_size, 100);
    assert!(config.shuffle);
    assert_eq!(config.class_samples.total(), 0);
}
