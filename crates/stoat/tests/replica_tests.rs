// Device replication: weight sync bit-identity, gradient reduction
// additivity, and registry discipline.

use stoat_core::{DType, Tensor};
use stoat_cpu::{CpuBackend, CpuDevice};
use stoat_data::{Corpus, Sentence};
use stoat_nn::{EncoderKind, SequenceTagger, TaggerConfig};
use stoat::{ModuleRegistry, MultiDeviceModule};

fn toy_corpus() -> Corpus {
    let lines = [
        "the/DT cat/NN sat/VBD",
        "a/DT dog/NN ran/VBD",
        "birds/NNS fly/VBP",
    ];
    Corpus::from_sentences(lines.iter().map(|l| Sentence::parse(l).unwrap()).collect())
}

fn build_module(device_count: usize) -> MultiDeviceModule<CpuBackend, SequenceTagger<CpuBackend>> {
    let corpus = toy_corpus();
    let config = TaggerConfig {
        vocab_size: corpus.tokens.len(),
        label_size: corpus.labels.len(),
        encoder: EncoderKind::BiLstm,
        d_model: 8,
        lstm_hidden: 4,
        max_seq_len: 8,
        dropout: 0.0,
        ..TaggerConfig::default()
    };
    let devices: Vec<CpuDevice> = (0..device_count).map(CpuDevice::new).collect();
    MultiDeviceModule::new(devices, |dev| {
        SequenceTagger::new(config.clone(), DType::F32, dev)
    })
    .unwrap()
}

fn perturb(params: &[stoat_core::WeightTensor<CpuBackend>], offset: f64) {
    for p in params {
        let mut data = p.weight().to_f64_vec().unwrap();
        for v in &mut data {
            *v += offset;
        }
        p.weight().update_data_inplace(&data).unwrap();
    }
}

#[test]
fn sync_weights_makes_replicas_bit_identical() {
    let module = build_module(3);
    // Drive the replicas apart first; sync must repair any divergence.
    perturb(&module.replica(1).parameters(), 0.25);
    perturb(&module.replica(2).parameters(), -1.5);

    module.sync_weights().unwrap();

    let canon: Vec<Vec<f64>> = module
        .params_on_default_device()
        .iter()
        .map(|p| p.weight().to_f64_vec().unwrap())
        .collect();
    for r in 1..3 {
        for (p, expected) in module.replica(r).parameters().iter().zip(canon.iter()) {
            assert_eq!(&p.weight().to_f64_vec().unwrap(), expected);
        }
    }
}

#[test]
fn sync_is_idempotent() {
    let module = build_module(2);
    module.sync_weights().unwrap();
    let snapshot: Vec<Vec<f64>> = module
        .replica(1)
        .parameters()
        .iter()
        .map(|p| p.weight().to_f64_vec().unwrap())
        .collect();
    module.sync_weights().unwrap();
    for (p, expected) in module.replica(1).parameters().iter().zip(snapshot.iter()) {
        assert_eq!(&p.weight().to_f64_vec().unwrap(), expected);
    }
}

#[test]
fn gradient_reduction_sums_all_replicas() {
    let module = build_module(3);

    // Give replica r gradient (r+1) on every parameter element.
    for r in 0..3 {
        let dev = CpuDevice::new(r);
        for p in module.replica(r).parameters() {
            let fill = (r + 1) as f64;
            let n = p.weight().elem_count();
            p.accumulate_grad(
                Tensor::from_f64_slice(&vec![fill; n], p.weight().shape().clone(), DType::F32, &dev)
                    .unwrap(),
            )
            .unwrap();
        }
    }

    module.sum_gradients_to_default_device().unwrap();

    // Canonical gradient = 1 + 2 + 3 everywhere, independent of order.
    for p in module.params_on_default_device() {
        let grad = p.grad().expect("canonical grad present");
        assert!(grad.to_f64_vec().unwrap().iter().all(|&v| v == 6.0));
    }
    // Non-canonical replica gradients are cleared by the reduction.
    for r in 1..3 {
        for p in module.replica(r).parameters() {
            assert!(p.grad().is_none());
        }
    }
}

#[test]
fn zero_and_release_gradients() {
    let module = build_module(2);
    for p in module.params_on_default_device() {
        let n = p.weight().elem_count();
        p.accumulate_grad(
            Tensor::from_f64_slice(
                &vec![3.0; n],
                p.weight().shape().clone(),
                DType::F32,
                &CpuDevice::new(0),
            )
            .unwrap(),
        )
        .unwrap();
    }
    module.zero_gradients_on_all_devices().unwrap();
    for p in module.params_on_default_device() {
        let grad = p.grad().expect("zeroed, not released");
        assert!(grad.to_f64_vec().unwrap().iter().all(|&v| v == 0.0));
    }
    module.release_gradients_on_all_devices();
    for p in module.params_on_default_device() {
        assert!(p.grad().is_none());
    }
}

#[test]
fn duplicate_module_registration_is_fatal() {
    let mut registry = ModuleRegistry::new();
    registry.register("tagger", build_module(1)).unwrap();
    match registry.register("tagger", build_module(1)) {
        Err(stoat_core::Error::DuplicateModule(name)) => assert_eq!(name, "tagger"),
        other => panic!("expected DuplicateModule, got {other:?}"),
    }
}
