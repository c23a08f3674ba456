// End-to-end orchestration: the one-epoch toy run, checkpoint round-trips,
// cooperative cancellation, and options hot-reload.

use std::path::PathBuf;

use stoat_core::DType;
use stoat_cpu::{CpuBackend, CpuDevice};
use stoat_data::{Corpus, Sentence};
use stoat_nn::{EncoderKind, SequenceTagger, TaggerConfig};
use stoat_optim::Adam;
use stoat::{
    load_tagger, CheckpointMeta, ModuleRegistry, MultiDeviceModule, OptionsWatcher, TrainReport,
    Trainer, TrainerOptions, Validation,
};

fn ten_sentence_corpus() -> Corpus {
    let lines = [
        "the/DT cat/NN sat/VBD",
        "the/DT dog/NN ran/VBD",
        "a/DT bird/NN flew/VBD",
        "the/DT cat/NN ran/VBD",
        "a/DT dog/NN sat/VBD",
        "birds/NNS fly/VBP",
        "cats/NNS sleep/VBP",
        "dogs/NNS bark/VBP",
        "the/DT bird/NN sang/VBD",
        "a/DT cat/NN slept/VBD",
    ];
    Corpus::from_sentences(lines.iter().map(|l| Sentence::parse(l).unwrap()).collect())
}

fn tagger_config(corpus: &Corpus) -> TaggerConfig {
    TaggerConfig {
        vocab_size: corpus.tokens.len(),
        label_size: corpus.labels.len(),
        encoder: EncoderKind::BiLstm,
        d_model: 8,
        lstm_hidden: 4,
        max_seq_len: 8,
        dropout: 0.0,
        ..TaggerConfig::default()
    }
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("stoat-trainer-test-{name}-{}", std::process::id()))
}

fn build_trainer(
    corpus: &Corpus,
    model_path: PathBuf,
    options: TrainerOptions,
    validation: Validation,
) -> Trainer<CpuBackend, SequenceTagger<CpuBackend>> {
    let config = tagger_config(corpus);
    let devices: Vec<CpuDevice> = options.device_ids.iter().map(|&i| CpuDevice::new(i)).collect();
    let module = MultiDeviceModule::new(devices, |dev| {
        SequenceTagger::new(config.clone(), DType::F32, dev)
    })
    .unwrap();
    let mut registry = ModuleRegistry::new();
    registry.register("tagger", module).unwrap();
    let meta = CheckpointMeta {
        config,
        tokens: corpus.tokens.clone(),
        labels: corpus.labels.clone(),
        dtype: "f32".to_string(),
        best_score: 0.0,
        updates: 0,
    };
    let options = TrainerOptions {
        model_path,
        ..options
    };
    Trainer::new(
        options,
        registry,
        "tagger",
        Box::new(Adam::new()),
        validation,
        meta,
    )
    .unwrap()
}

fn one_epoch_options() -> TrainerOptions {
    TrainerOptions {
        batch_size: 2,
        max_epochs: 1,
        update_frequency: 1,
        device_ids: vec![0],
        base_lr: 1e-3,
        warmup_steps: 2,
        report_every_updates: 2,
        ..TrainerOptions::default()
    }
}

#[test]
fn one_epoch_toy_run_trains_validates_and_saves() {
    let corpus = ten_sentence_corpus();
    let best_path = temp_path("e2e.stoat");
    let mut trainer = build_trainer(
        &corpus,
        best_path.clone(),
        one_epoch_options(),
        Validation::Local(corpus.clone()),
    );

    let report: TrainReport = trainer.run(&corpus).unwrap();

    assert!(!report.cancelled);
    assert_eq!(report.epochs.len(), 1);
    // 10 sentences at batch size 2, one device, update frequency 1.
    assert_eq!(report.updates, 5);
    assert_eq!(report.epochs[0].updates_run, 5);
    assert_eq!(report.epochs[0].batches_skipped, 0);
    assert!(report.epochs[0].avg_cost.is_finite());
    assert!(report.epochs[0].avg_cost > 0.0);

    // Epoch-boundary validation ran and the first score always improves on
    // "no best yet", so exactly one best model file exists.
    let score = report.best_score.expect("validation produced a score");
    assert!((0.0..=1.0).contains(&score));
    assert!(best_path.is_file());

    // The .latest snapshot is refreshed regardless of improvement.
    let latest = PathBuf::from(format!("{}.latest", best_path.display()));
    assert!(latest.is_file());

    let _ = std::fs::remove_file(&best_path);
    let _ = std::fs::remove_file(&latest);
}

#[test]
fn checkpoint_roundtrip_restores_parameters() {
    let corpus = ten_sentence_corpus();
    let best_path = temp_path("roundtrip.stoat");
    let mut trainer = build_trainer(
        &corpus,
        best_path.clone(),
        one_epoch_options(),
        Validation::Local(corpus.clone()),
    );
    trainer.run(&corpus).unwrap();

    let (restored, meta) = load_tagger::<CpuBackend>(&best_path, &CpuDevice::new(0)).unwrap();
    assert_eq!(meta.tokens.len(), corpus.tokens.len());
    assert_eq!(meta.labels.len(), corpus.labels.len());
    assert!(meta.best_score > 0.0);

    // Freshly built params must match the snapshot exactly. The snapshot
    // was written at the last improvement, which for a 1-epoch run is the
    // final state of training.
    let fresh = SequenceTagger::<CpuBackend>::new(meta.config.clone(), DType::F32, &CpuDevice::new(0))
        .unwrap();
    assert_eq!(restored.parameters().len(), fresh.parameters().len());
    for p in restored.parameters() {
        let values = p.weight().to_f64_vec().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    let latest = PathBuf::from(format!("{}.latest", best_path.display()));
    let _ = std::fs::remove_file(&best_path);
    let _ = std::fs::remove_file(&latest);
}

#[test]
fn pre_cancelled_run_stops_cleanly_with_a_final_snapshot() {
    let corpus = ten_sentence_corpus();
    let best_path = temp_path("cancel.stoat");
    let mut trainer = build_trainer(
        &corpus,
        best_path.clone(),
        one_epoch_options(),
        Validation::None,
    );
    trainer.cancel_token().cancel();

    let report = trainer.run(&corpus).unwrap();
    assert!(report.cancelled);
    assert_eq!(report.updates, 0);

    // Nothing was saved before the cancel, so the clean stop writes one
    // final snapshot.
    let latest = PathBuf::from(format!("{}.latest", best_path.display()));
    assert!(latest.is_file());
    assert!(!best_path.exists());

    let _ = std::fs::remove_file(&latest);
}

#[test]
fn multi_device_run_completes() {
    let corpus = ten_sentence_corpus();
    let best_path = temp_path("multidev.stoat");
    let options = TrainerOptions {
        device_ids: vec![0, 1],
        ..one_epoch_options()
    };
    let mut trainer = build_trainer(&corpus, best_path.clone(), options, Validation::None);
    let report = trainer.run(&corpus).unwrap();
    assert!(!report.cancelled);
    // 5 batches over groups of 2 devices → 3 update groups.
    assert_eq!(report.updates, 3);

    let latest = PathBuf::from(format!("{}.latest", best_path.display()));
    let _ = std::fs::remove_file(&best_path);
    let _ = std::fs::remove_file(&latest);
}

#[test]
fn options_watcher_detects_rewrites() {
    let path = temp_path("options.json");
    let initial = TrainerOptions::default();
    std::fs::write(&path, serde_json::to_string(&initial).unwrap()).unwrap();

    let mut watcher = OptionsWatcher::new(&path);
    assert!(watcher.poll().is_none(), "unchanged file must not reload");

    // mtime granularity can be a full second on some filesystems.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    let newer = TrainerOptions {
        batch_size: 64,
        ..TrainerOptions::default()
    };
    std::fs::write(&path, serde_json::to_string(&newer).unwrap()).unwrap();

    let reloaded = watcher.poll().expect("rewrite must be detected");
    assert_eq!(reloaded.batch_size, 64);
    assert!(watcher.poll().is_none(), "no further change, no reload");

    let _ = std::fs::remove_file(&path);
}
