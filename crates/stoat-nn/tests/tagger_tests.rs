// SequenceTagger: shapes, losses, decoding, and a tiny overfit run for
// both encoder types.

use stoat_core::{ComputeGraph, DType};
use stoat_cpu::{CpuBackend, CpuDevice};
use stoat_data::{Corpus, Sentence, PAD_ID};
use stoat_nn::{EncoderKind, NetModule, SequenceTagger, TaggerConfig};

fn toy_corpus() -> Corpus {
    let lines = [
        "the/DT cat/NN sat/VBD",
        "the/DT dog/NN ran/VBD",
        "a/DT bird/NN flew/VBD away/RB",
        "cats/NNS sleep/VBP",
    ];
    Corpus::from_sentences(lines.iter().map(|l| Sentence::parse(l).unwrap()).collect())
}

fn config(corpus: &Corpus, encoder: EncoderKind) -> TaggerConfig {
    TaggerConfig {
        vocab_size: corpus.tokens.len(),
        label_size: corpus.labels.len(),
        encoder,
        d_model: 16,
        num_heads: 2,
        num_layers: 1,
        d_ff: 32,
        lstm_hidden: 8,
        max_seq_len: 16,
        dropout: 0.0,
        label_smoothing: 0.0,
    }
}

#[test]
fn loss_and_predictions_have_expected_shapes() {
    let corpus = toy_corpus();
    let dev = CpuDevice::new(0);
    for encoder in [EncoderKind::Transformer, EncoderKind::BiLstm] {
        let tagger =
            SequenceTagger::<CpuBackend>::new(config(&corpus, encoder), DType::F32, &dev).unwrap();
        let mut rng = rand::thread_rng();
        let batch = corpus.batches(2, &mut rng).remove(0);

        let g = ComputeGraph::<CpuBackend>::new(dev.clone(), true);
        let (loss, n_valid) = tagger.loss(&g, &batch).unwrap();
        assert_eq!(loss.weight().dims(), &[] as &[usize]);
        assert_eq!(n_valid, batch.token_count());
        let value = loss.weight().to_scalar_f64().unwrap();
        assert!(value.is_finite() && value > 0.0);
        g.backward_from(&loss).unwrap();
        for p in tagger.parameters() {
            assert!(p.grad().is_some(), "missing grad for {}", p.name());
        }

        let g = ComputeGraph::<CpuBackend>::new(dev.clone(), false);
        let preds = tagger.predict(&g, &batch).unwrap();
        assert_eq!(preds.len(), batch.batch_size * batch.seq_len);
        for (row, &len) in batch.lengths.iter().enumerate() {
            for col in len..batch.seq_len {
                assert_eq!(preds[row * batch.seq_len + col], PAD_ID);
            }
        }
    }
}

#[test]
fn parameter_order_is_stable_across_instances() {
    let corpus = toy_corpus();
    let dev = CpuDevice::new(0);
    let cfg = config(&corpus, EncoderKind::Transformer);
    let a = SequenceTagger::<CpuBackend>::new(cfg.clone(), DType::F32, &dev).unwrap();
    let b = SequenceTagger::<CpuBackend>::new(cfg, DType::F32, &dev).unwrap();
    let names_a: Vec<_> = a.parameters().iter().map(|p| p.name().to_string()).collect();
    let names_b: Vec<_> = b.parameters().iter().map(|p| p.name().to_string()).collect();
    assert_eq!(names_a, names_b);
    assert!(!names_a.is_empty());
}

#[test]
fn tiny_overfit_reduces_loss() {
    // A few SGD-by-hand steps on one batch must reduce the loss for both
    // encoders; this catches sign errors anywhere in the backward rules.
    let corpus = toy_corpus();
    let dev = CpuDevice::new(0);
    for encoder in [EncoderKind::BiLstm, EncoderKind::Transformer] {
        let tagger =
            SequenceTagger::<CpuBackend>::new(config(&corpus, encoder), DType::F32, &dev).unwrap();
        let mut rng = rand::thread_rng();
        let batch = corpus.batches(4, &mut rng).remove(0);

        let mut first = f64::NAN;
        let mut last = f64::NAN;
        for step in 0..30 {
            let g = ComputeGraph::<CpuBackend>::new(dev.clone(), true);
            let (loss, _) = tagger.loss(&g, &batch).unwrap();
            let value = loss.weight().to_scalar_f64().unwrap();
            if step == 0 {
                first = value;
            }
            last = value;
            g.backward_from(&loss).unwrap();
            for p in tagger.parameters() {
                if let Some(grad) = p.grad() {
                    p.weight().add_assign(&grad.affine(-0.1, 0.0).unwrap()).unwrap();
                }
                p.release_grad();
            }
        }
        assert!(
            last < first * 0.8,
            "{encoder:?}: loss did not drop ({first} → {last})"
        );
    }
}

#[test]
fn sequence_longer_than_max_is_rejected() {
    let corpus = toy_corpus();
    let dev = CpuDevice::new(0);
    let mut cfg = config(&corpus, EncoderKind::Transformer);
    cfg.max_seq_len = 2;
    let tagger = SequenceTagger::<CpuBackend>::new(cfg, DType::F32, &dev).unwrap();
    let mut rng = rand::thread_rng();
    let batch = corpus.batches(4, &mut rng).pop().unwrap();
    let g = ComputeGraph::<CpuBackend>::new(dev.clone(), true);
    assert!(tagger.loss(&g, &batch).is_err());
}

#[test]
fn label_smoothing_keeps_gradients_flowing() {
    let corpus = toy_corpus();
    let dev = CpuDevice::new(0);
    let mut cfg = config(&corpus, EncoderKind::BiLstm);
    cfg.label_smoothing = 0.1;
    let tagger = SequenceTagger::<CpuBackend>::new(cfg, DType::F32, &dev).unwrap();
    let mut rng = rand::thread_rng();
    let batch = corpus.batches(2, &mut rng).remove(0);
    let g = ComputeGraph::<CpuBackend>::new(dev.clone(), true);
    let (loss, _) = tagger.loss(&g, &batch).unwrap();
    assert!(loss.weight().to_scalar_f64().unwrap().is_finite());
    g.backward_from(&loss).unwrap();
}

#[test]
fn dropout_module_is_identity_on_inference_graphs() {
    use stoat_core::{Tensor, WeightTensor};
    let dev = CpuDevice::new(0);
    let g = ComputeGraph::<CpuBackend>::new(dev.clone(), false);
    let x = WeightTensor::input(
        "x",
        Tensor::<CpuBackend>::from_f64_slice(&[1.0, 2.0], 2, DType::F32, &dev).unwrap(),
    );
    let drop = stoat_nn::Dropout::new(0.9);
    let y = NetModule::<CpuBackend>::forward(&drop, &g, &x).unwrap();
    assert_eq!(y.weight().to_f64_vec().unwrap(), vec![1.0, 2.0]);
}
