// Tape discipline: recording, strict-reverse replay, drain-once, and the
// aliasing rules of the in-place variants.

use stoat_core::{ComputeGraph, DType, Tensor, WeightTensor};
use stoat_cpu::{CpuBackend, CpuDevice};

type W = WeightTensor<CpuBackend>;

fn dev() -> CpuDevice {
    CpuDevice::new(0)
}

fn param(name: &str, data: &[f64], shape: &[usize]) -> W {
    W::parameter(
        name,
        Tensor::from_f64_slice(data, shape.to_vec(), DType::F64, &dev()).unwrap(),
    )
}

#[test]
fn tape_records_one_entry_per_op_and_drains_once() {
    let g = ComputeGraph::<CpuBackend>::new(dev(), true);
    let x = param("x", &[1.0, 2.0], &[2]);
    let y = param("y", &[3.0, 4.0], &[2]);

    let a = g.add(&x, &y).unwrap();
    let b = g.mul(&a, &x).unwrap();
    let loss = g.sum_all(&b).unwrap();
    assert_eq!(g.tape_len(), 3);

    g.backward_from(&loss).unwrap();
    assert_eq!(g.tape_len(), 0, "tape must be empty after backward");

    // Gradients arrived: d/dx (x+y)*x = 2x + y, d/dy = x.
    assert_eq!(x.grad().unwrap().to_f64_vec().unwrap(), vec![5.0, 8.0]);
    assert_eq!(y.grad().unwrap().to_f64_vec().unwrap(), vec![1.0, 2.0]);

    // Backward again with no new ops: a no-op, not a crash, and no
    // double-accumulation.
    g.backward().unwrap();
    assert_eq!(x.grad().unwrap().to_f64_vec().unwrap(), vec![5.0, 8.0]);
}

#[test]
fn no_recording_when_backprop_disabled() {
    let g = ComputeGraph::<CpuBackend>::new(dev(), false);
    let x = param("x", &[1.0, 2.0], &[2]);
    let y = g.tanh(&x).unwrap();
    assert_eq!(g.tape_len(), 0);
    assert!(y.grad().is_none());
    g.backward().unwrap();
}

#[test]
fn shared_parameter_accumulates_additively() {
    // x enters the loss through two positions (tied usage); its gradient
    // must be the sum of both contributions, never the last one.
    let g = ComputeGraph::<CpuBackend>::new(dev(), true);
    let x = param("x", &[1.0, -2.0, 3.0], &[3]);
    let doubled = g.add(&x, &x).unwrap();
    let loss = g.sum_all(&doubled).unwrap();
    g.backward_from(&loss).unwrap();
    assert_eq!(x.grad().unwrap().to_f64_vec().unwrap(), vec![2.0, 2.0, 2.0]);
}

#[test]
fn chain_replays_in_reverse_order() {
    // If the tape replayed out of order, tanh's entry would see no output
    // gradient yet and x's gradient would come out zero.
    let g = ComputeGraph::<CpuBackend>::new(dev(), true);
    let x = param("x", &[0.5], &[1]);
    let h = g.tanh(&x).unwrap();
    let s = g.mul_scalar(&h, 3.0).unwrap();
    let loss = g.sum_all(&s).unwrap();
    g.backward_from(&loss).unwrap();

    let t = 0.5f64.tanh();
    let expected = 3.0 * (1.0 - t * t);
    let got = x.grad().unwrap().to_scalar_f64().unwrap();
    assert!((got - expected).abs() < 1e-12, "{got} vs {expected}");
}

#[test]
fn device_mismatch_is_fatal() {
    let g = ComputeGraph::<CpuBackend>::new(CpuDevice::new(0), true);
    let x = param("x", &[1.0], &[1]);
    let other = W::parameter(
        "other",
        Tensor::from_f64_slice(&[1.0], 1, DType::F64, &CpuDevice::new(1)).unwrap(),
    );
    match g.add(&x, &other) {
        Err(stoat_core::Error::DeviceMismatch { .. }) => {}
        other => panic!("expected DeviceMismatch, got {other:?}"),
    }
}

// Dropout

#[test]
fn dropout_identity_at_p_zero() {
    let g = ComputeGraph::<CpuBackend>::new(dev(), true);
    let x = param("x", &[1.0, 2.0, 3.0], &[3]);
    let before = x.weight().to_f64_vec().unwrap();
    let y = g.dropout(&x, 0.0).unwrap();
    assert_eq!(g.tape_len(), 0, "identity path must not record");
    assert_eq!(y.weight().to_f64_vec().unwrap(), before);
    assert_eq!(x.weight().to_f64_vec().unwrap(), before, "input not mutated");
}

#[test]
fn dropout_identity_when_backprop_disabled() {
    let g = ComputeGraph::<CpuBackend>::new(dev(), false);
    let x = param("x", &[1.0, 2.0, 3.0, 4.0], &[4]);
    let before = x.weight().to_f64_vec().unwrap();
    let y = g.dropout(&x, 0.9).unwrap();
    assert_eq!(y.weight().to_f64_vec().unwrap(), before);
    assert_eq!(g.tape_len(), 0);
}

#[test]
fn dropout_backward_reuses_the_forward_mask() {
    // grad/output ratio must match exactly: both used the same mask.
    let g = ComputeGraph::<CpuBackend>::new(dev(), true);
    let x = param("x", &[1.0; 64], &[64]);
    let y = g.dropout(&x, 0.5).unwrap();
    let loss = g.sum_all(&y).unwrap();
    let forward = y.weight().to_f64_vec().unwrap();
    g.backward_from(&loss).unwrap();
    let grad = x.grad().unwrap().to_f64_vec().unwrap();
    // With x = 1, the forward output IS the mask, and d(sum)/dx is the
    // mask again.
    assert_eq!(forward, grad);
    assert!(grad.iter().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-12));
}

// In-place variants

#[test]
fn add_inplace_matches_add() {
    let run = |inplace: bool| -> (Vec<f64>, Vec<f64>) {
        let g = ComputeGraph::<CpuBackend>::new(dev(), true);
        let x = param("x", &[1.0, 2.0, 3.0], &[3]);
        let y = param("y", &[10.0, 20.0, 30.0], &[3]);
        let out = if inplace {
            g.add_(&x, &y).unwrap()
        } else {
            g.add(&x, &y).unwrap()
        };
        let loss = g.sum_all(&g.mul(&out, &out).unwrap()).unwrap();
        g.backward_from(&loss).unwrap();
        (
            out.weight().to_f64_vec().unwrap(),
            y.grad().unwrap().to_f64_vec().unwrap(),
        )
    };
    let (out_regular, grad_regular) = run(false);
    let (out_inplace, grad_inplace) = run(true);
    assert_eq!(out_regular, out_inplace);
    assert_eq!(grad_regular, grad_inplace);
}

#[test]
fn add_inplace_reuses_exclusively_owned_buffer() {
    let g = ComputeGraph::<CpuBackend>::new(dev(), true);
    let x = param("x", &[1.0, 2.0], &[2]);
    let y = param("y", &[5.0, 5.0], &[2]);
    let out = g.add_(&x, &y).unwrap();
    // The caller held the only handle to x, so the op wrote into x's
    // buffer and the output aliases it.
    assert_eq!(x.weight().to_f64_vec().unwrap(), vec![6.0, 7.0]);
    assert_eq!(out.weight().to_f64_vec().unwrap(), vec![6.0, 7.0]);
}

#[test]
fn add_inplace_falls_back_when_buffer_is_shared() {
    let g = ComputeGraph::<CpuBackend>::new(dev(), true);
    let x = param("x", &[1.0, 2.0], &[2]);
    let _second_handle = x.clone();
    let y = param("y", &[5.0, 5.0], &[2]);
    let out = g.add_(&x, &y).unwrap();
    // Shared handle → copying path; x is untouched.
    assert_eq!(x.weight().to_f64_vec().unwrap(), vec![1.0, 2.0]);
    assert_eq!(out.weight().to_f64_vec().unwrap(), vec![6.0, 7.0]);
}

#[test]
fn softmax_inplace_matches_softmax() {
    let data = [0.3, -1.2, 2.0, 0.0, 1.0, -0.5];
    let run = |inplace: bool| -> Vec<f64> {
        let g = ComputeGraph::<CpuBackend>::new(dev(), true);
        let x = param("x", &data, &[2, 3]);
        let out = if inplace {
            g.softmax_(&x).unwrap()
        } else {
            g.softmax(&x).unwrap()
        };
        out.weight().to_f64_vec().unwrap()
    };
    let a = run(false);
    let b = run(true);
    for (u, v) in a.iter().zip(b.iter()) {
        assert!((u - v).abs() < 1e-12);
    }
}

// Sub-graphs

#[test]
fn sub_graph_shares_the_tape() {
    let g = ComputeGraph::<CpuBackend>::new(dev(), true);
    let x = param("x", &[2.0], &[1]);
    let y = {
        let sg = g.sub_graph("block");
        let h = sg.tanh(&x).unwrap();
        sg.mul_scalar(&h, 2.0).unwrap()
        // sg drops here; its entries stay on the shared tape
    };
    assert_eq!(g.tape_len(), 2);
    let loss = g.sum_all(&y).unwrap();
    g.backward_from(&loss).unwrap();
    assert_eq!(g.tape_len(), 0);
    assert!(x.grad().is_some());
}
