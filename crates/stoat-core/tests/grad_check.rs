// Gradient correctness: analytic gradients from the tape vs central finite
// differences, per differentiable op, on small random f64 tensors.

use stoat_core::check::max_grad_divergence;
use stoat_core::{ComputeGraph, DType, Result, Tensor, WeightTensor};
use stoat_cpu::{CpuBackend, CpuDevice};

type G = ComputeGraph<CpuBackend>;
type W = WeightTensor<CpuBackend>;

const EPS: f64 = 1e-5;
const TOL: f64 = 1e-6;

fn dev() -> CpuDevice {
    CpuDevice::new(0)
}

fn check<F>(shape: &[usize], f: F) -> f64
where
    F: Fn(&G, &W) -> Result<W>,
{
    max_grad_divergence::<CpuBackend, _>(&dev(), shape, EPS, f).unwrap()
}

/// A fixed random weighting so reductions don't cancel gradients.
fn weights(g: &G, shape: &[usize]) -> W {
    let n: usize = shape.iter().product();
    let data: Vec<f64> = (0..n).map(|i| ((i * 7 + 3) % 11) as f64 / 5.0 - 1.0).collect();
    g.constant(
        "w",
        Tensor::from_f64_slice(&data, shape.to_vec(), DType::F64, g.device()).unwrap(),
    )
    .unwrap()
}

#[test]
fn grad_add_mul_sub() {
    let d = check(&[2, 3], |g, x| {
        let w = weights(g, &[2, 3]);
        let a = g.add(x, &w)?;
        let b = g.mul(&a, x)?;
        let c = g.sub(&b, &w)?;
        g.sum_all(&c)
    });
    assert!(d < TOL, "divergence {d}");
}

#[test]
fn grad_div() {
    // Denominator kept away from zero: x² + 2.
    let d = check(&[2, 2], |g, x| {
        let denom = g.affine(&g.mul(x, x)?, 1.0, 2.0)?;
        let q = g.div(x, &denom)?;
        let w = weights(g, &[2, 2]);
        g.sum_all(&g.mul(&q, &w)?)
    });
    assert!(d < TOL, "divergence {d}");
}

#[test]
fn grad_unary_activations() {
    for (name, f) in [
        ("tanh", (|g: &G, x: &W| g.tanh(x)) as fn(&G, &W) -> Result<W>),
        ("sigmoid", |g, x| g.sigmoid(x)),
        ("exp", |g, x| g.exp(x)),
    ] {
        let d = check(&[3, 2], |g, x| {
            let y = f(g, x)?;
            let w = weights(g, &[3, 2]);
            g.sum_all(&g.mul(&y, &w)?)
        });
        assert!(d < TOL, "{name} divergence {d}");
    }
}

#[test]
fn grad_relu() {
    // Shift inputs away from the kink at zero before relu.
    let d = check(&[8], |g, x| {
        let y = g.relu(&g.affine(x, 1.0, 0.35)?)?;
        let w = weights(g, &[8]);
        g.sum_all(&g.mul(&y, &w)?)
    });
    assert!(d < 1e-5, "relu divergence {d}");
}

#[test]
fn grad_log_and_sqrt() {
    // Positive domain via exp.
    let d = check(&[4], |g, x| {
        let pos = g.affine(&g.exp(x)?, 1.0, 0.5)?;
        let y = g.add(&g.log(&pos)?, &g.sqrt(&pos)?)?;
        g.sum_all(&y)
    });
    assert!(d < TOL, "divergence {d}");
}

#[test]
fn grad_matmul_both_sides() {
    let d = check(&[2, 3], |g, x| {
        let c = weights(g, &[3, 2]);
        let left = g.matmul(x, &c)?; // x @ c : [2,2]
        let right = g.matmul(&c, x)?; // c @ x : [3,3]
        let l = g.sum_all(&left)?;
        let r = g.sum_all(&right)?;
        g.add(&l, &r)
    });
    assert!(d < TOL, "divergence {d}");
}

#[test]
fn grad_batched_matmul() {
    let d = check(&[2, 2, 3], |g, x| {
        let c = weights(g, &[2, 3, 2]);
        let y = g.mul_batch(x, &c)?;
        let w = weights(g, &[2, 2, 2]);
        g.sum_all(&g.mul(&y, &w)?)
    });
    assert!(d < TOL, "divergence {d}");
}

#[test]
fn grad_softmax_and_log_softmax() {
    let d = check(&[2, 4], |g, x| {
        let y = g.softmax(x)?;
        let w = weights(g, &[2, 4]);
        g.sum_all(&g.mul(&y, &w)?)
    });
    assert!(d < TOL, "softmax divergence {d}");

    let d = check(&[2, 4], |g, x| {
        let y = g.log_softmax(x)?;
        let w = weights(g, &[2, 4]);
        g.sum_all(&g.mul(&y, &w)?)
    });
    assert!(d < TOL, "log_softmax divergence {d}");
}

#[test]
fn grad_layer_norm() {
    let d = check(&[3, 4], |g, x| {
        let gamma = g.constant(
            "gamma",
            Tensor::from_f64_slice(&[1.1, 0.9, 1.3, 0.7], 4, DType::F64, g.device()).unwrap(),
        )?;
        let beta = g.constant(
            "beta",
            Tensor::from_f64_slice(&[0.1, -0.2, 0.0, 0.3], 4, DType::F64, g.device()).unwrap(),
        )?;
        let y = g.layer_norm(x, &gamma, &beta, 1e-5)?;
        let w = weights(g, &[3, 4]);
        g.sum_all(&g.mul(&y, &w)?)
    });
    assert!(d < 1e-5, "layer_norm divergence {d}");
}

#[test]
fn grad_layer_norm_gain_and_bias() {
    // Check the gamma/beta gradients too: treat gamma as the checked
    // input and the activations as a constant.
    let d = check(&[4], |g, gamma| {
        let x = weights(g, &[3, 4]);
        let beta = g.constant(
            "beta",
            Tensor::zeros(4usize, DType::F64, g.device()).unwrap(),
        )?;
        let y = g.layer_norm(&x, gamma, &beta, 1e-5)?;
        let w = weights(g, &[3, 4]);
        g.sum_all(&g.mul(&y, &w)?)
    });
    assert!(d < 1e-5, "gamma divergence {d}");
}

#[test]
fn grad_shape_ops() {
    // transpose → reshape → narrow → expand chained.
    let d = check(&[2, 6], |g, x| {
        let t = g.transpose(x, 0, 1)?; // [6,2]
        let r = g.reshape(&t, vec![3, 4])?;
        let n = g.narrow(&r, 1, 1, 2)?; // [3,2]
        let e = g.expand(&g.reshape(&n, vec![3, 1, 2])?, vec![3, 5, 2])?;
        let w = weights(g, &[3, 5, 2]);
        g.sum_all(&g.mul(&e, &w)?)
    });
    assert!(d < TOL, "divergence {d}");
}

#[test]
fn grad_concat() {
    let d = check(&[2, 3], |g, x| {
        let w = weights(g, &[2, 2]);
        let y = g.concat(&[x, &g.mul(x, x)?], 1)?; // [2,6]
        let n = g.narrow(&y, 1, 2, 2)?;
        g.sum_all(&g.mul(&n, &w)?)
    });
    assert!(d < TOL, "divergence {d}");
}

#[test]
fn grad_index_select() {
    // Repeated ids: the scatter-add backward must accumulate.
    let ids: Vec<u32> = vec![1, 0, 1, 2];
    let d = check(&[3, 2], |g, table| {
        let ids = Tensor::from_u32_slice(&ids, 4, g.device()).unwrap();
        let rows = g.index_select(table, &ids)?;
        let w = weights(g, &[4, 2]);
        g.sum_all(&g.mul(&rows, &w)?)
    });
    assert!(d < TOL, "divergence {d}");
}

#[test]
fn grad_mean_all_and_affine() {
    let d = check(&[5], |g, x| {
        let y = g.affine(x, 2.5, -0.5)?;
        g.mean_all(&y)
    });
    assert!(d < TOL, "divergence {d}");
}
