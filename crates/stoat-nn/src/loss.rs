use stoat_core::{Backend, ComputeGraph, Error, Result, Tensor, WeightTensor};

// Sequence cross-entropy
//
// loss = −(1/n_valid) Σ_i Σ_c target[i,c] · log_softmax(logits)[i,c]
//
// Targets arrive as flat label ids; padded positions (label == pad_id) get
// an all-zero target row, dropping them from both the numerator and
// n_valid. With label smoothing ε, the target row puts 1−ε on the gold
// label and ε/(C−1) on every other class.
//
// The target matrix is a constant — only the logits need gradients — so
// the whole loss reduces to log_softmax → mul → sum, all ops the tape
// already knows how to reverse.

/// Scalar cross-entropy over `[n, classes]` logits with flat `targets`
/// (padded positions carry `pad_id`). Returns the loss node and the number
/// of real (unpadded) positions it averaged over.
pub fn sequence_cross_entropy<B: Backend>(
    g: &ComputeGraph<B>,
    logits: &WeightTensor<B>,
    targets: &[u32],
    pad_id: u32,
    label_smoothing: f64,
) -> Result<(WeightTensor<B>, usize)> {
    let dims = logits.weight().dims();
    let (n, classes) = (dims[0], dims[1]);
    if targets.len() != n {
        return Err(Error::msg(format!(
            "cross entropy: {n} logit rows but {} targets",
            targets.len()
        )));
    }

    let mut target_rows = vec![0.0f64; n * classes];
    let mut n_valid = 0usize;
    let on = 1.0 - label_smoothing;
    let off = if classes > 1 {
        label_smoothing / (classes - 1) as f64
    } else {
        0.0
    };
    for (i, &t) in targets.iter().enumerate() {
        if t == pad_id {
            continue;
        }
        if t as usize >= classes {
            return Err(Error::msg(format!(
                "cross entropy: target {t} out of range for {classes} classes"
            )));
        }
        n_valid += 1;
        let row = &mut target_rows[i * classes..(i + 1) * classes];
        for v in row.iter_mut() {
            *v = off;
        }
        row[t as usize] = on;
    }
    if n_valid == 0 {
        return Err(Error::msg("cross entropy: batch contains only padding"));
    }

    let target = g.constant(
        "loss.targets",
        Tensor::<B>::from_f64_slice(
            &target_rows,
            (n, classes),
            logits.weight().dtype(),
            g.device(),
        )?,
    )?;

    let log_probs = g.log_softmax(logits)?;
    let picked = g.mul(&log_probs, &target)?;
    let total = g.sum_all(&picked)?;
    let loss = g.mul_scalar(&total, -1.0 / n_valid as f64)?;
    Ok((loss, n_valid))
}

/// Token accuracy over flat predictions/targets, ignoring padded
/// positions. Returns (correct, total).
pub fn token_accuracy(predictions: &[u32], targets: &[u32], pad_id: u32) -> (usize, usize) {
    let mut correct = 0;
    let mut total = 0;
    for (&p, &t) in predictions.iter().zip(targets.iter()) {
        if t == pad_id {
            continue;
        }
        total += 1;
        if p == t {
            correct += 1;
        }
    }
    (correct, total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accuracy_ignores_padding() {
        let pred = [1, 2, 3, 9];
        let gold = [1, 2, 4, 0]; // last is pad
        let (correct, total) = token_accuracy(&pred, &gold, 0);
        assert_eq!((correct, total), (2, 3));
    }
}
