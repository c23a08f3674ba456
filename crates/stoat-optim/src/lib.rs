//! # stoat-optim
//!
//! Optimizers for the canonical device's parameters: [`Adam`] (the default
//! for both encoder types), global-norm gradient clipping, and the warmup
//! + inverse-sqrt LR schedule transformer training expects.
//!
//! Optimizers mutate parameter storage in place through the tensor's
//! interior-mutability path, so every replica view of a parameter sees the
//! update after the next weight sync.

use stoat_core::{Backend, Error, Result, Tensor, WeightTensor};

/// An optimizer over a fixed, ordered parameter list.
pub trait Optimizer<B: Backend> {
    /// Apply one update step using each parameter's accumulated gradient.
    /// Parameters whose gradient slot is empty are skipped.
    fn step(&mut self, params: &[WeightTensor<B>], lr: f64) -> Result<()>;

    /// Number of steps taken so far.
    fn steps(&self) -> usize;
}

// Adam — adaptive moments (Kingma & Ba, 2015)
//
//   m = β1·m + (1−β1)·g
//   v = β2·v + (1−β2)·g²
//   θ = θ − lr · m̂ / (√v̂ + ε),  with bias-corrected m̂, v̂
//
// Moment buffers are allocated lazily per parameter on the first step, on
// the parameter's own device.

/// Adam optimizer.
pub struct Adam<B: Backend> {
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    steps: usize,
    moments: Vec<Option<(Tensor<B>, Tensor<B>)>>,
}

impl<B: Backend> Adam<B> {
    pub fn new() -> Self {
        Adam {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            steps: 0,
            moments: Vec::new(),
        }
    }

    pub fn with_weight_decay(mut self, wd: f64) -> Self {
        self.weight_decay = wd;
        self
    }
}

impl<B: Backend> Default for Adam<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Optimizer<B> for Adam<B> {
    fn step(&mut self, params: &[WeightTensor<B>], lr: f64) -> Result<()> {
        if self.moments.len() < params.len() {
            self.moments.resize_with(params.len(), || None);
        }
        self.steps += 1;
        let t = self.steps as f64;
        let bc1 = 1.0 - self.beta1.powf(t);
        let bc2 = 1.0 - self.beta2.powf(t);

        for (i, param) in params.iter().enumerate() {
            let Some(grad) = param.grad() else { continue };
            let mut grad = grad;
            if self.weight_decay > 0.0 {
                grad = grad.add(&param.weight().affine(self.weight_decay, 0.0)?)?;
            }

            let slot = &mut self.moments[i];
            if slot.is_none() {
                let zeros_m = Tensor::<B>::zeros(
                    grad.shape().clone(),
                    grad.dtype(),
                    grad.device(),
                )?;
                let zeros_v = zeros_m.duplicate()?;
                *slot = Some((zeros_m, zeros_v));
            }
            let (m, v) = slot.as_ref().expect("moment slot just filled");

            // m = β1·m + (1−β1)·g
            m.affine_assign(self.beta1, 0.0)?;
            m.add_assign(&grad.affine(1.0 - self.beta1, 0.0)?)?;
            // v = β2·v + (1−β2)·g²
            v.affine_assign(self.beta2, 0.0)?;
            v.add_assign(&grad.square()?.affine(1.0 - self.beta2, 0.0)?)?;

            let m_hat = m.affine(1.0 / bc1, 0.0)?;
            let v_hat = v.affine(1.0 / bc2, 0.0)?;
            let update = m_hat.div(&v_hat.sqrt()?.affine(1.0, self.eps)?)?;
            param.weight().add_assign(&update.affine(-lr, 0.0)?)?;
        }
        Ok(())
    }

    fn steps(&self) -> usize {
        self.steps
    }
}

/// Scale all gradients so their global L2 norm is at most `max_norm`.
/// Returns the pre-clip norm.
pub fn clip_grad_norm<B: Backend>(params: &[WeightTensor<B>], max_norm: f64) -> Result<f64> {
    if max_norm <= 0.0 {
        return Err(Error::msg("max_norm must be positive"));
    }
    let mut total = 0.0f64;
    for param in params {
        if let Some(grad) = param.grad() {
            total += grad.square()?.sum_all()?.to_scalar_f64()?;
        }
    }
    let norm = total.sqrt();
    if norm > max_norm {
        let scale = max_norm / norm;
        for param in params {
            if let Some(grad) = param.grad() {
                grad.affine_assign(scale, 0.0)?;
            }
        }
    }
    Ok(norm)
}

// LR schedule — linear warmup, then inverse-sqrt decay
//
//   lr(step) = base · min(step/warmup, √(warmup/step))
//
// The standard shape for training transformer encoders from scratch;
// harmless for the BiLSTM as well.

/// Warmup + inverse-square-root learning-rate schedule.
#[derive(Debug, Clone)]
pub struct WarmupInvSqrt {
    base_lr: f64,
    warmup_steps: usize,
}

impl WarmupInvSqrt {
    pub fn new(base_lr: f64, warmup_steps: usize) -> Self {
        WarmupInvSqrt {
            base_lr,
            warmup_steps: warmup_steps.max(1),
        }
    }

    pub fn lr_at(&self, step: usize) -> f64 {
        let step = step.max(1) as f64;
        let warmup = self.warmup_steps as f64;
        if step < warmup {
            self.base_lr * step / warmup
        } else {
            self.base_lr * (warmup / step).sqrt()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoat_core::DType;
    use stoat_cpu::{CpuBackend, CpuDevice};

    #[test]
    fn adam_descends_a_quadratic() {
        // Minimize f(x) = x² from x = 3; Adam should move toward 0.
        let dev = CpuDevice::new(0);
        let x = WeightTensor::<CpuBackend>::parameter(
            "x",
            Tensor::from_f64_slice(&[3.0], 1, DType::F64, &dev).unwrap(),
        );
        let mut opt = Adam::new();
        for _ in 0..200 {
            // grad of x² is 2x
            let g = x.weight().affine(2.0, 0.0).unwrap();
            x.accumulate_grad(g).unwrap();
            opt.step(std::slice::from_ref(&x), 0.05).unwrap();
            x.release_grad();
        }
        let v = x.weight().to_scalar_f64().unwrap();
        assert!(v.abs() < 0.5, "x did not descend: {v}");
    }

    #[test]
    fn clipping_caps_global_norm() {
        let dev = CpuDevice::new(0);
        let p = WeightTensor::<CpuBackend>::parameter(
            "p",
            Tensor::zeros(4, DType::F64, &dev).unwrap(),
        );
        p.accumulate_grad(Tensor::from_f64_slice(&[3.0, 0.0, 4.0, 0.0], 4, DType::F64, &dev).unwrap())
            .unwrap();
        let norm = clip_grad_norm(std::slice::from_ref(&p), 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-9);
        let clipped = p.grad().unwrap().to_f64_vec().unwrap();
        let new_norm: f64 = clipped.iter().map(|v| v * v).sum::<f64>().sqrt();
        assert!((new_norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn schedule_warms_up_then_decays() {
        let s = WarmupInvSqrt::new(1e-3, 100);
        assert!(s.lr_at(10) < s.lr_at(100));
        assert!((s.lr_at(100) - 1e-3).abs() < 1e-9);
        assert!(s.lr_at(400) < s.lr_at(100));
        assert!((s.lr_at(400) - 5e-4).abs() < 1e-9);
    }
}
