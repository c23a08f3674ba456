use crate::backend::Backend;
use crate::dtype::DType;
use crate::error::Result;
use crate::graph::ComputeGraph;
use crate::tensor::Tensor;
use crate::weight::WeightTensor;

// Gradient checking — compare analytic gradients against finite differences
//
// For a scalar function L(x) built from graph ops, the tape's gradient for
// x must match (L(x + εe_i) - L(x - εe_i)) / 2ε in every coordinate. This
// is the ground truth every backward rule is tested against.
//
// Everything runs in F64: central differences in f32 lose most of their
// significant digits.

/// Maximum absolute difference between the analytic gradient of
/// `f(graph, x)` and its central finite-difference estimate, over a random
/// input of the given shape.
///
/// `f` must build a scalar loss from graph ops only — any computation done
/// outside the graph is invisible to the tape and will show up as a
/// mismatch here.
pub fn max_grad_divergence<B, F>(
    device: &B::Device,
    shape: &[usize],
    eps: f64,
    f: F,
) -> Result<f64>
where
    B: Backend,
    F: Fn(&ComputeGraph<B>, &WeightTensor<B>) -> Result<WeightTensor<B>>,
{
    let base = Tensor::<B>::rand_normal(shape.to_vec(), DType::F64, device)?;
    let base_data = base.to_f64_vec()?;

    // Analytic gradient from the tape.
    let graph = ComputeGraph::<B>::new(device.clone(), true);
    let x = WeightTensor::parameter("gradcheck.x", base.clone());
    let loss = f(&graph, &x)?;
    graph.backward_from(&loss)?;
    let analytic = x
        .grad()
        .ok_or_else(|| crate::Error::msg("gradcheck: no gradient accumulated"))?
        .to_f64_vec()?;

    // Finite differences, one coordinate at a time, with backprop off.
    let mut worst: f64 = 0.0;
    for i in 0..base_data.len() {
        let mut bumped = base_data.clone();
        bumped[i] += eps;
        let up = eval_scalar::<B, F>(device, &bumped, shape, &f)?;
        bumped[i] = base_data[i] - eps;
        let down = eval_scalar::<B, F>(device, &bumped, shape, &f)?;
        let numeric = (up - down) / (2.0 * eps);
        worst = worst.max((numeric - analytic[i]).abs());
    }
    Ok(worst)
}

fn eval_scalar<B, F>(device: &B::Device, data: &[f64], shape: &[usize], f: &F) -> Result<f64>
where
    B: Backend,
    F: Fn(&ComputeGraph<B>, &WeightTensor<B>) -> Result<WeightTensor<B>>,
{
    let graph = ComputeGraph::<B>::new(device.clone(), false);
    let t = Tensor::<B>::from_f64_slice(data, shape.to_vec(), DType::F64, device)?;
    let x = WeightTensor::parameter("gradcheck.x", t);
    let loss = f(&graph, &x)?;
    loss.weight().to_scalar_f64()
}
