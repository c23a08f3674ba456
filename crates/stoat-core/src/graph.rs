use std::cell::RefCell;
use std::rc::Rc;

use crate::backend::{Backend, BackendDevice, UnaryOp};
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::weight::WeightTensor;

// ComputeGraph — the reverse-mode autodiff tape
//
// Every differentiable operation runs its forward computation eagerly and,
// when backprop is enabled, appends exactly one BackwardStep to the tape.
// backward() drains the tape back-to-front, invoking each step once; the
// chain rule emerges from the strict reversal of recording order.
//
// TAPE DISCIPLINE:
//
//   - append-only during forward, single-threaded per graph
//   - drained exactly once by backward(); the tape is empty afterwards
//   - a step accumulates (adds) into its inputs' gradients, never assigns;
//     a parameter read at ten graph positions gets ten contributions summed
//   - dropping a replayed step releases its handles, so an intermediate's
//     forward buffer frees as soon as the steps that read it have run
//
// Each BackwardStep is a tagged record, not a boxed closure: the enum names
// which gradient rule applies and carries the handles + saved values
// (dropout mask, softmax output, layer-norm statistics) that rule needs.
//
// SUB-GRAPHS:
//
//   sub_graph(name) shares the parent's tape and device. Intermediates
//   created inside the sub-graph's scope are owned by the caller's
//   bindings (plus the tape entries that reference them); when the
//   sub-graph's block ends, those bindings drop and the temporaries of one
//   composite operation (an attention block, one LSTM step) release
//   without touching the parent's tensors.
//
// A graph is bound to one device. Mixing devices in one operation is a
// caller bug and fails fast with DeviceMismatch.

type Tape<B> = Rc<RefCell<Vec<BackwardStep<B>>>>;

/// Records which gradient rule to replay for one forward op, together with
/// the node handles and saved values the rule reads.
enum BackwardStep<B: Backend> {
    Add {
        lhs: WeightTensor<B>,
        rhs: WeightTensor<B>,
        out: WeightTensor<B>,
    },
    Sub {
        lhs: WeightTensor<B>,
        rhs: WeightTensor<B>,
        out: WeightTensor<B>,
    },
    Mul {
        lhs: WeightTensor<B>,
        rhs: WeightTensor<B>,
        out: WeightTensor<B>,
    },
    Div {
        lhs: WeightTensor<B>,
        rhs: WeightTensor<B>,
        out: WeightTensor<B>,
    },
    Affine {
        input: WeightTensor<B>,
        mul: f64,
        out: WeightTensor<B>,
    },
    Unary {
        op: UnaryOp,
        input: WeightTensor<B>,
        out: WeightTensor<B>,
    },
    Matmul {
        lhs: WeightTensor<B>,
        rhs: WeightTensor<B>,
        out: WeightTensor<B>,
    },
    Transpose {
        input: WeightTensor<B>,
        dim0: usize,
        dim1: usize,
        out: WeightTensor<B>,
    },
    Reshape {
        input: WeightTensor<B>,
        out: WeightTensor<B>,
    },
    Expand {
        input: WeightTensor<B>,
        out: WeightTensor<B>,
    },
    Narrow {
        input: WeightTensor<B>,
        dim: usize,
        start: usize,
        out: WeightTensor<B>,
    },
    Concat {
        inputs: Vec<WeightTensor<B>>,
        dim: usize,
        out: WeightTensor<B>,
    },
    Softmax {
        input: WeightTensor<B>,
        out: WeightTensor<B>,
    },
    LogSoftmax {
        input: WeightTensor<B>,
        out: WeightTensor<B>,
    },
    LayerNorm {
        input: WeightTensor<B>,
        gamma: WeightTensor<B>,
        beta: WeightTensor<B>,
        x_hat: Tensor<B>,
        inv_std: Tensor<B>,
        out: WeightTensor<B>,
    },
    Dropout {
        input: WeightTensor<B>,
        mask: Tensor<B>,
        out: WeightTensor<B>,
    },
    IndexSelect {
        table: WeightTensor<B>,
        ids: Tensor<B>,
        out: WeightTensor<B>,
    },
    SumAll {
        input: WeightTensor<B>,
        out: WeightTensor<B>,
    },
    MeanAll {
        input: WeightTensor<B>,
        out: WeightTensor<B>,
    },
}

impl<B: Backend> BackwardStep<B> {
    /// Replay this step once: read the output's gradient, apply the op's
    /// chain rule, accumulate into each input that wants a gradient.
    /// An output with no gradient (a branch that never reached the loss)
    /// contributes nothing.
    fn run(self) -> Result<()> {
        match self {
            BackwardStep::Add { lhs, rhs, out } => {
                let Some(g) = out.grad() else { return Ok(()) };
                if lhs.need_gradient() {
                    lhs.accumulate_grad(g.sum_to_shape(lhs.weight().shape())?)?;
                }
                if rhs.need_gradient() {
                    rhs.accumulate_grad(g.sum_to_shape(rhs.weight().shape())?)?;
                }
                Ok(())
            }
            BackwardStep::Sub { lhs, rhs, out } => {
                let Some(g) = out.grad() else { return Ok(()) };
                if lhs.need_gradient() {
                    lhs.accumulate_grad(g.sum_to_shape(lhs.weight().shape())?)?;
                }
                if rhs.need_gradient() {
                    rhs.accumulate_grad(g.neg()?.sum_to_shape(rhs.weight().shape())?)?;
                }
                Ok(())
            }
            BackwardStep::Mul { lhs, rhs, out } => {
                let Some(g) = out.grad() else { return Ok(()) };
                if lhs.need_gradient() {
                    let d = g.mul(rhs.weight())?;
                    lhs.accumulate_grad(d.sum_to_shape(lhs.weight().shape())?)?;
                }
                if rhs.need_gradient() {
                    let d = g.mul(lhs.weight())?;
                    rhs.accumulate_grad(d.sum_to_shape(rhs.weight().shape())?)?;
                }
                Ok(())
            }
            BackwardStep::Div { lhs, rhs, out } => {
                let Some(g) = out.grad() else { return Ok(()) };
                if lhs.need_gradient() {
                    let d = g.div(rhs.weight())?;
                    lhs.accumulate_grad(d.sum_to_shape(lhs.weight().shape())?)?;
                }
                if rhs.need_gradient() {
                    // d/db (a/b) = -a / b²
                    let d = g
                        .mul(lhs.weight())?
                        .div(&rhs.weight().square()?)?
                        .neg()?;
                    rhs.accumulate_grad(d.sum_to_shape(rhs.weight().shape())?)?;
                }
                Ok(())
            }
            BackwardStep::Affine { input, mul, out } => {
                let Some(g) = out.grad() else { return Ok(()) };
                input.accumulate_grad(g.affine(mul, 0.0)?)
            }
            BackwardStep::Unary { op, input, out } => {
                let Some(g) = out.grad() else { return Ok(()) };
                let y = out.weight();
                let d = match op {
                    UnaryOp::Neg => g.neg()?,
                    // exp' = exp(x) = y
                    UnaryOp::Exp => g.mul(y)?,
                    // log' = 1/x
                    UnaryOp::Log => g.div(input.weight())?,
                    // sqrt' = 1/(2·sqrt(x)) = 1/(2y)
                    UnaryOp::Sqrt => g.affine(0.5, 0.0)?.div(y)?,
                    // relu' = [y > 0]; works after in-place reuse because
                    // the sign of the output matches the sign of the input
                    UnaryOp::Relu => {
                        let zeros = Tensor::zeros(y.shape().clone(), y.dtype(), y.device())?;
                        let keep = zeros.lt_mask(y)?.to_dtype(y.dtype())?;
                        g.mul(&keep)?
                    }
                    // sigmoid' = y(1-y)
                    UnaryOp::Sigmoid => g.mul(&y.mul(&y.affine(-1.0, 1.0)?)?)?,
                    // tanh' = 1 - y²
                    UnaryOp::Tanh => g.mul(&y.square()?.affine(-1.0, 1.0)?)?,
                    // (x²)' = 2x
                    UnaryOp::Square => g.mul(&input.weight().affine(2.0, 0.0)?)?,
                };
                input.accumulate_grad(d)
            }
            BackwardStep::Matmul { lhs, rhs, out } => {
                let Some(g) = out.grad() else { return Ok(()) };
                let rank = g.rank();
                let (td0, td1) = (rank - 2, rank - 1);
                if lhs.need_gradient() {
                    // dL/dA = G @ Bᵀ
                    let d = g.matmul(&rhs.weight().transpose(td0, td1)?)?;
                    lhs.accumulate_grad(d)?;
                }
                if rhs.need_gradient() {
                    // dL/dB = Aᵀ @ G
                    let d = lhs.weight().transpose(td0, td1)?.matmul(&g)?;
                    rhs.accumulate_grad(d)?;
                }
                Ok(())
            }
            BackwardStep::Transpose {
                input,
                dim0,
                dim1,
                out,
            } => {
                let Some(g) = out.grad() else { return Ok(()) };
                input.accumulate_grad(g.transpose(dim0, dim1)?)
            }
            BackwardStep::Reshape { input, out } => {
                let Some(g) = out.grad() else { return Ok(()) };
                input.accumulate_grad(g.reshape(input.weight().shape().clone())?)
            }
            BackwardStep::Expand { input, out } => {
                let Some(g) = out.grad() else { return Ok(()) };
                input.accumulate_grad(g.sum_to_shape(input.weight().shape())?)
            }
            BackwardStep::Narrow {
                input,
                dim,
                start,
                out,
            } => {
                let Some(g) = out.grad() else { return Ok(()) };
                let full = Tensor::zeros(
                    input.weight().shape().clone(),
                    g.dtype(),
                    g.device(),
                )?;
                {
                    let slice = full.narrow(dim, start, g.dims()[dim])?;
                    slice.copy_from(&g)?;
                }
                input.accumulate_grad(full)
            }
            BackwardStep::Concat { inputs, dim, out } => {
                let Some(g) = out.grad() else { return Ok(()) };
                let mut offset = 0;
                for input in inputs {
                    let len = input.weight().dims()[dim];
                    let slice = g.narrow(dim, offset, len)?;
                    offset += len;
                    if input.need_gradient() {
                        input.accumulate_grad(slice.contiguous()?)?;
                    }
                }
                Ok(())
            }
            BackwardStep::Softmax { input, out } => {
                let Some(g) = out.grad() else { return Ok(()) };
                // dx = y ⊙ (g - Σ_last(g ⊙ y))
                let y = out.weight();
                let dim = y.rank() - 1;
                let dot = g.mul(y)?.sum_dim(dim, true)?;
                input.accumulate_grad(g.sub(&dot)?.mul(y)?)
            }
            BackwardStep::LogSoftmax { input, out } => {
                let Some(g) = out.grad() else { return Ok(()) };
                // dx = g - softmax(x) ⊙ Σ_last(g)
                let y = out.weight();
                let dim = y.rank() - 1;
                let sum_g = g.sum_dim(dim, true)?;
                input.accumulate_grad(g.sub(&y.exp()?.mul(&sum_g)?)?)
            }
            BackwardStep::LayerNorm {
                input,
                gamma,
                beta,
                x_hat,
                inv_std,
                out,
            } => {
                let Some(g) = out.grad() else { return Ok(()) };
                let dim = g.rank() - 1;
                let d = g.dims()[dim] as f64;
                if beta.need_gradient() {
                    beta.accumulate_grad(g.sum_to_shape(beta.weight().shape())?)?;
                }
                if gamma.need_gradient() {
                    let dg = g.mul(&x_hat)?;
                    gamma.accumulate_grad(dg.sum_to_shape(gamma.weight().shape())?)?;
                }
                if input.need_gradient() {
                    // dx = inv_std ⊙ (dxh - mean(dxh) - xh ⊙ mean(dxh ⊙ xh))
                    let dxh = g.mul(gamma.weight())?;
                    let mean_dxh = dxh.sum_dim(dim, true)?.affine(1.0 / d, 0.0)?;
                    let mean_dxh_xh = dxh
                        .mul(&x_hat)?
                        .sum_dim(dim, true)?
                        .affine(1.0 / d, 0.0)?;
                    let dx = dxh
                        .sub(&mean_dxh)?
                        .sub(&x_hat.mul(&mean_dxh_xh)?)?
                        .mul(&inv_std)?;
                    input.accumulate_grad(dx)?;
                }
                Ok(())
            }
            BackwardStep::Dropout { input, mask, out } => {
                let Some(g) = out.grad() else { return Ok(()) };
                // Same mask instance the forward used — consistency matters
                // more than freshness here.
                input.accumulate_grad(g.mul(&mask)?)
            }
            BackwardStep::IndexSelect { table, ids, out } => {
                let Some(g) = out.grad() else { return Ok(()) };
                let full = Tensor::zeros(
                    table.weight().shape().clone(),
                    g.dtype(),
                    g.device(),
                )?;
                full.index_add(&ids, &g.contiguous()?)?;
                table.accumulate_grad(full)
            }
            BackwardStep::SumAll { input, out } => {
                let Some(g) = out.grad() else { return Ok(()) };
                let shape = input.weight().shape().clone();
                input.accumulate_grad(g.expand(shape)?.contiguous()?)
            }
            BackwardStep::MeanAll { input, out } => {
                let Some(g) = out.grad() else { return Ok(()) };
                let shape = input.weight().shape().clone();
                let n = shape.elem_count() as f64;
                input.accumulate_grad(g.expand(shape)?.affine(1.0 / n, 0.0)?)
            }
        }
    }
}

/// The autodiff tape plus the factory for everything recorded on it.
///
/// One graph per device per forward pass; create, build the loss, call
/// [`ComputeGraph::backward_from`], drop. Graphs are deliberately not
/// `Send`: they live and die on the worker thread that owns their device.
pub struct ComputeGraph<B: Backend> {
    device: B::Device,
    needs_backprop: bool,
    tape: Tape<B>,
    name: String,
}

impl<B: Backend> ComputeGraph<B> {
    pub fn new(device: B::Device, needs_backprop: bool) -> Self {
        ComputeGraph {
            device,
            needs_backprop,
            tape: Rc::new(RefCell::new(Vec::new())),
            name: String::new(),
        }
    }

    /// A nested graph sharing this graph's tape and device. Use one per
    /// composite block so the block's intermediates release when its scope
    /// ends, independent of the parent's.
    pub fn sub_graph(&self, name: impl Into<String>) -> ComputeGraph<B> {
        ComputeGraph {
            device: self.device.clone(),
            needs_backprop: self.needs_backprop,
            tape: Rc::clone(&self.tape),
            name: name.into(),
        }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn needs_backprop(&self) -> bool {
        self.needs_backprop
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of backward steps currently recorded.
    pub fn tape_len(&self) -> usize {
        self.tape.borrow().len()
    }

    /// Wrap a constant tensor (batch data, masks) for use in this graph.
    pub fn constant(&self, name: impl Into<String>, t: Tensor<B>) -> Result<WeightTensor<B>> {
        self.check_tensor_device(&t)?;
        Ok(WeightTensor::input(name, t))
    }

    // Internal plumbing

    fn check_device(&self, w: &WeightTensor<B>) -> Result<()> {
        self.check_tensor_device(w.weight())
    }

    fn check_tensor_device(&self, t: &Tensor<B>) -> Result<()> {
        if t.device() != &self.device {
            return Err(Error::DeviceMismatch {
                lhs: self.device.name(),
                rhs: t.device().name(),
            });
        }
        Ok(())
    }

    fn out_needs_grad(&self, inputs: &[&WeightTensor<B>]) -> bool {
        self.needs_backprop && inputs.iter().any(|w| w.need_gradient())
    }

    fn emit(&self, t: Tensor<B>, need_gradient: bool) -> WeightTensor<B> {
        WeightTensor::intermediate(t, need_gradient)
    }

    fn record(&self, step: BackwardStep<B>) {
        self.tape.borrow_mut().push(step);
    }

    /// Whether an in-place op may overwrite `w`'s buffer: the caller's
    /// handle must be the only one (no tape entry, no module holds it) and
    /// the buffer must not be shared with views.
    fn reusable_in_place(&self, w: &WeightTensor<B>) -> bool {
        w.handle_count() == 1 && w.weight().is_exclusively_owned()
    }

    // Backward

    /// Seed the loss gradient with ones, then replay the tape.
    pub fn backward_from(&self, loss: &WeightTensor<B>) -> Result<()> {
        let ones = Tensor::full(
            loss.weight().shape().clone(),
            1.0,
            loss.weight().dtype(),
            &self.device,
        )?;
        loss.accumulate_grad(ones)?;
        self.backward()
    }

    /// Replay the tape in exact reverse recording order, invoking every
    /// step exactly once, then leave the tape empty. Calling again without
    /// new forward ops is a no-op.
    pub fn backward(&self) -> Result<()> {
        let steps: Vec<BackwardStep<B>> = {
            let mut tape = self.tape.borrow_mut();
            tape.drain(..).collect()
        };
        for step in steps.into_iter().rev() {
            step.run()?;
        }
        Ok(())
    }

    // Differentiable operations
    //
    // Each op: validate devices → forward eagerly → wrap output (gradient
    // flag = OR of inputs) → append one tape entry.

    pub fn add(&self, lhs: &WeightTensor<B>, rhs: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.check_device(lhs)?;
        self.check_device(rhs)?;
        let need = self.out_needs_grad(&[lhs, rhs]);
        let out = self.emit(lhs.weight().add(rhs.weight())?, need);
        if need {
            self.record(BackwardStep::Add {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
                out: out.clone(),
            });
        }
        Ok(out)
    }

    /// In-place add: overwrites `lhs`'s buffer when it is exclusively
    /// owned and shapes match; falls back to [`ComputeGraph::add`]
    /// otherwise. Identical results either way.
    pub fn add_(&self, lhs: &WeightTensor<B>, rhs: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.check_device(lhs)?;
        self.check_device(rhs)?;
        if self.reusable_in_place(lhs) && lhs.weight().shape() == rhs.weight().shape() {
            lhs.weight().add_assign(rhs.weight())?;
            let need = self.out_needs_grad(&[lhs, rhs]);
            let out = self.emit(lhs.weight().clone(), need);
            if need {
                self.record(BackwardStep::Add {
                    lhs: lhs.clone(),
                    rhs: rhs.clone(),
                    out: out.clone(),
                });
            }
            return Ok(out);
        }
        self.add(lhs, rhs)
    }

    pub fn sub(&self, lhs: &WeightTensor<B>, rhs: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.check_device(lhs)?;
        self.check_device(rhs)?;
        let need = self.out_needs_grad(&[lhs, rhs]);
        let out = self.emit(lhs.weight().sub(rhs.weight())?, need);
        if need {
            self.record(BackwardStep::Sub {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
                out: out.clone(),
            });
        }
        Ok(out)
    }

    pub fn mul(&self, lhs: &WeightTensor<B>, rhs: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.check_device(lhs)?;
        self.check_device(rhs)?;
        let need = self.out_needs_grad(&[lhs, rhs]);
        let out = self.emit(lhs.weight().mul(rhs.weight())?, need);
        if need {
            self.record(BackwardStep::Mul {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
                out: out.clone(),
            });
        }
        Ok(out)
    }

    /// In-place multiply. The multiply rule needs the original operand
    /// values for backward, so the buffer is only reused when gradients
    /// are off; with backprop on this is exactly [`ComputeGraph::mul`].
    pub fn mul_(&self, lhs: &WeightTensor<B>, rhs: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.check_device(lhs)?;
        self.check_device(rhs)?;
        if !self.needs_backprop
            && self.reusable_in_place(lhs)
            && lhs.weight().shape() == rhs.weight().shape()
        {
            let rhs_t = rhs.weight().clone();
            let lhs_t = lhs.weight();
            // dst *= rhs through the storage lock
            let tmp = lhs_t.mul(&rhs_t)?;
            lhs_t.copy_from(&tmp)?;
            return Ok(self.emit(lhs_t.clone(), false));
        }
        self.mul(lhs, rhs)
    }

    pub fn div(&self, lhs: &WeightTensor<B>, rhs: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.check_device(lhs)?;
        self.check_device(rhs)?;
        let need = self.out_needs_grad(&[lhs, rhs]);
        let out = self.emit(lhs.weight().div(rhs.weight())?, need);
        if need {
            self.record(BackwardStep::Div {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
                out: out.clone(),
            });
        }
        Ok(out)
    }

    /// out = input * mul + add, element-wise.
    pub fn affine(&self, input: &WeightTensor<B>, mul: f64, add: f64) -> Result<WeightTensor<B>> {
        self.check_device(input)?;
        let need = self.out_needs_grad(&[input]);
        let out = self.emit(input.weight().affine(mul, add)?, need);
        if need {
            self.record(BackwardStep::Affine {
                input: input.clone(),
                mul,
                out: out.clone(),
            });
        }
        Ok(out)
    }

    pub fn mul_scalar(&self, input: &WeightTensor<B>, s: f64) -> Result<WeightTensor<B>> {
        self.affine(input, s, 0.0)
    }

    fn unary(&self, op: UnaryOp, input: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.check_device(input)?;
        let t = match op {
            UnaryOp::Neg => input.weight().neg()?,
            UnaryOp::Exp => input.weight().exp()?,
            UnaryOp::Log => input.weight().log()?,
            UnaryOp::Sqrt => input.weight().sqrt()?,
            UnaryOp::Relu => input.weight().relu()?,
            UnaryOp::Sigmoid => input.weight().sigmoid()?,
            UnaryOp::Tanh => input.weight().tanh()?,
            UnaryOp::Square => input.weight().square()?,
        };
        let need = self.out_needs_grad(&[input]);
        let out = self.emit(t, need);
        if need {
            self.record(BackwardStep::Unary {
                op,
                input: input.clone(),
                out: out.clone(),
            });
        }
        Ok(out)
    }

    pub fn relu(&self, input: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.unary(UnaryOp::Relu, input)
    }

    /// In-place relu; safe because the backward rule only reads the
    /// output's sign.
    pub fn relu_(&self, input: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.check_device(input)?;
        if self.reusable_in_place(input) {
            let computed = input.weight().relu()?;
            input.weight().copy_from(&computed)?;
            let need = self.out_needs_grad(&[input]);
            let out = self.emit(input.weight().clone(), need);
            if need {
                self.record(BackwardStep::Unary {
                    op: UnaryOp::Relu,
                    input: input.clone(),
                    out: out.clone(),
                });
            }
            return Ok(out);
        }
        self.relu(input)
    }

    pub fn tanh(&self, input: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.unary(UnaryOp::Tanh, input)
    }

    pub fn sigmoid(&self, input: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.unary(UnaryOp::Sigmoid, input)
    }

    pub fn exp(&self, input: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.unary(UnaryOp::Exp, input)
    }

    pub fn log(&self, input: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.unary(UnaryOp::Log, input)
    }

    pub fn sqrt(&self, input: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.unary(UnaryOp::Sqrt, input)
    }

    /// 2-D matmul: [m,k] @ [k,n] → [m,n].
    pub fn matmul(&self, lhs: &WeightTensor<B>, rhs: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.check_device(lhs)?;
        self.check_device(rhs)?;
        let need = self.out_needs_grad(&[lhs, rhs]);
        let out = self.emit(lhs.weight().matmul(rhs.weight())?, need);
        if need {
            self.record(BackwardStep::Matmul {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
                out: out.clone(),
            });
        }
        Ok(out)
    }

    /// Batched matmul: [b,m,k] @ [b,k,n] → [b,m,n]. Same gradient rule as
    /// matmul with the transpose applied to the trailing two dims.
    pub fn mul_batch(&self, lhs: &WeightTensor<B>, rhs: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.matmul(lhs, rhs)
    }

    /// Affine layer primitive: x @ w + b (bias broadcasts over rows).
    pub fn affine_transform(
        &self,
        x: &WeightTensor<B>,
        w: &WeightTensor<B>,
        b: &WeightTensor<B>,
    ) -> Result<WeightTensor<B>> {
        let xw = self.matmul(x, w)?;
        self.add(&xw, b)
    }

    pub fn transpose(
        &self,
        input: &WeightTensor<B>,
        dim0: usize,
        dim1: usize,
    ) -> Result<WeightTensor<B>> {
        self.check_device(input)?;
        let need = self.out_needs_grad(&[input]);
        let out = self.emit(input.weight().transpose(dim0, dim1)?.contiguous()?, need);
        if need {
            self.record(BackwardStep::Transpose {
                input: input.clone(),
                dim0,
                dim1,
                out: out.clone(),
            });
        }
        Ok(out)
    }

    pub fn reshape(
        &self,
        input: &WeightTensor<B>,
        shape: impl Into<Shape>,
    ) -> Result<WeightTensor<B>> {
        self.check_device(input)?;
        let need = self.out_needs_grad(&[input]);
        let out = self.emit(input.weight().reshape(shape)?, need);
        if need {
            self.record(BackwardStep::Reshape {
                input: input.clone(),
                out: out.clone(),
            });
        }
        Ok(out)
    }

    /// Alias for reshape, PyTorch naming.
    pub fn view(
        &self,
        input: &WeightTensor<B>,
        shape: impl Into<Shape>,
    ) -> Result<WeightTensor<B>> {
        self.reshape(input, shape)
    }

    pub fn expand(
        &self,
        input: &WeightTensor<B>,
        shape: impl Into<Shape>,
    ) -> Result<WeightTensor<B>> {
        self.check_device(input)?;
        let need = self.out_needs_grad(&[input]);
        let out = self.emit(input.weight().expand(shape)?, need);
        if need {
            self.record(BackwardStep::Expand {
                input: input.clone(),
                out: out.clone(),
            });
        }
        Ok(out)
    }

    pub fn narrow(
        &self,
        input: &WeightTensor<B>,
        dim: usize,
        start: usize,
        len: usize,
    ) -> Result<WeightTensor<B>> {
        self.check_device(input)?;
        let need = self.out_needs_grad(&[input]);
        let out = self.emit(input.weight().narrow(dim, start, len)?.contiguous()?, need);
        if need {
            self.record(BackwardStep::Narrow {
                input: input.clone(),
                dim,
                start,
                out: out.clone(),
            });
        }
        Ok(out)
    }

    pub fn concat(&self, inputs: &[&WeightTensor<B>], dim: usize) -> Result<WeightTensor<B>> {
        if inputs.is_empty() {
            return Err(Error::msg("concat needs at least one input"));
        }
        for w in inputs {
            self.check_device(w)?;
        }
        let first = inputs[0].weight();
        let mut dims = first.dims().to_vec();
        if dim >= dims.len() {
            return Err(Error::DimOutOfRange {
                dim,
                rank: dims.len(),
            });
        }
        dims[dim] = inputs.iter().map(|w| w.weight().dims()[dim]).sum();
        let out_t = Tensor::zeros(Shape::new(dims), first.dtype(), first.device())?;
        let mut offset = 0;
        for w in inputs {
            let len = w.weight().dims()[dim];
            let slice = out_t.narrow(dim, offset, len)?;
            slice.copy_from(w.weight())?;
            offset += len;
        }
        let refs: Vec<&WeightTensor<B>> = inputs.to_vec();
        let need = self.out_needs_grad(&refs);
        let out = self.emit(out_t, need);
        if need {
            self.record(BackwardStep::Concat {
                inputs: inputs.iter().map(|w| (*w).clone()).collect(),
                dim,
                out: out.clone(),
            });
        }
        Ok(out)
    }

    /// Numerically-stable softmax over the last dimension.
    pub fn softmax(&self, input: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.check_device(input)?;
        let x = input.weight();
        let dim = x.rank() - 1;
        let m = x.max_dim(dim, true)?;
        let e = x.sub(&m)?.exp()?;
        let s = e.sum_dim(dim, true)?;
        let y = e.div(&s)?;
        let need = self.out_needs_grad(&[input]);
        let out = self.emit(y, need);
        if need {
            self.record(BackwardStep::Softmax {
                input: input.clone(),
                out: out.clone(),
            });
        }
        Ok(out)
    }

    /// In-place softmax: writes the result back into the input's buffer
    /// when exclusively owned. The backward rule only reads the output.
    pub fn softmax_(&self, input: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.check_device(input)?;
        if self.reusable_in_place(input) {
            let x = input.weight();
            let dim = x.rank() - 1;
            let m = x.max_dim(dim, true)?;
            let e = x.sub(&m)?.exp()?;
            let s = e.sum_dim(dim, true)?;
            let y = e.div(&s)?;
            x.copy_from(&y)?;
            let need = self.out_needs_grad(&[input]);
            let out = self.emit(x.clone(), need);
            if need {
                self.record(BackwardStep::Softmax {
                    input: input.clone(),
                    out: out.clone(),
                });
            }
            return Ok(out);
        }
        self.softmax(input)
    }

    /// Log-softmax over the last dimension (stable: x - m - log Σ exp).
    pub fn log_softmax(&self, input: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.check_device(input)?;
        let x = input.weight();
        let dim = x.rank() - 1;
        let m = x.max_dim(dim, true)?;
        let shifted = x.sub(&m)?;
        let lse = shifted.exp()?.sum_dim(dim, true)?.log()?;
        let y = shifted.sub(&lse)?;
        let need = self.out_needs_grad(&[input]);
        let out = self.emit(y, need);
        if need {
            self.record(BackwardStep::LogSoftmax {
                input: input.clone(),
                out: out.clone(),
            });
        }
        Ok(out)
    }

    /// Layer normalization over the last dimension with learned gain/bias.
    pub fn layer_norm(
        &self,
        input: &WeightTensor<B>,
        gamma: &WeightTensor<B>,
        beta: &WeightTensor<B>,
        eps: f64,
    ) -> Result<WeightTensor<B>> {
        self.check_device(input)?;
        self.check_device(gamma)?;
        self.check_device(beta)?;
        let x = input.weight();
        let dim = x.rank() - 1;
        let d = x.dims()[dim] as f64;
        let mean = x.sum_dim(dim, true)?.affine(1.0 / d, 0.0)?;
        let centered = x.sub(&mean)?;
        let var = centered.square()?.sum_dim(dim, true)?.affine(1.0 / d, 0.0)?;
        let ones = Tensor::full(var.shape().clone(), 1.0, var.dtype(), var.device())?;
        let inv_std = ones.div(&var.affine(1.0, eps)?.sqrt()?)?;
        let x_hat = centered.mul(&inv_std)?;
        let y = x_hat.mul(gamma.weight())?.add(beta.weight())?;
        let need = self.out_needs_grad(&[input, gamma, beta]);
        let out = self.emit(y, need);
        if need {
            self.record(BackwardStep::LayerNorm {
                input: input.clone(),
                gamma: gamma.clone(),
                beta: beta.clone(),
                x_hat,
                inv_std,
                out: out.clone(),
            });
        }
        Ok(out)
    }

    /// Inverted dropout. `p == 0` or backprop disabled returns the input
    /// node unchanged — the no-op path mutates nothing. Otherwise one
    /// Bernoulli mask (scaled by 1/(1-p)) is drawn for the whole batch and
    /// captured on the tape so backward applies the very same mask.
    pub fn dropout(&self, input: &WeightTensor<B>, p: f64) -> Result<WeightTensor<B>> {
        self.check_device(input)?;
        if p <= 0.0 || !self.needs_backprop {
            return Ok(input.clone());
        }
        if p >= 1.0 {
            return Err(Error::msg(format!("dropout probability {p} must be < 1")));
        }
        let x = input.weight();
        let mask = self.draw_dropout_mask(x, p)?;
        let need = self.out_needs_grad(&[input]);
        let out = self.emit(x.mul(&mask)?, need);
        if need {
            self.record(BackwardStep::Dropout {
                input: input.clone(),
                mask,
                out: out.clone(),
            });
        }
        Ok(out)
    }

    /// In-place dropout (same identity short-circuits as `dropout`).
    pub fn dropout_(&self, input: &WeightTensor<B>, p: f64) -> Result<WeightTensor<B>> {
        self.check_device(input)?;
        if p <= 0.0 || !self.needs_backprop {
            return Ok(input.clone());
        }
        if p >= 1.0 {
            return Err(Error::msg(format!("dropout probability {p} must be < 1")));
        }
        if self.reusable_in_place(input) {
            let x = input.weight();
            let mask = self.draw_dropout_mask(x, p)?;
            let masked = x.mul(&mask)?;
            x.copy_from(&masked)?;
            let need = self.out_needs_grad(&[input]);
            let out = self.emit(x.clone(), need);
            if need {
                self.record(BackwardStep::Dropout {
                    input: input.clone(),
                    mask,
                    out: out.clone(),
                });
            }
            return Ok(out);
        }
        self.dropout(input, p)
    }

    fn draw_dropout_mask(&self, x: &Tensor<B>, p: f64) -> Result<Tensor<B>> {
        let u = Tensor::rand_uniform(x.shape().clone(), x.dtype(), x.device())?;
        let threshold = Tensor::full(x.shape().clone(), p, x.dtype(), x.device())?;
        let keep = u.ge_mask(&threshold)?.to_dtype(x.dtype())?;
        keep.affine(1.0 / (1.0 - p), 0.0)
    }

    /// Embedding lookup: rows of `table` selected by U32 `ids`. Backward
    /// scatter-adds into the table's gradient, so repeated ids (tied
    /// embeddings) accumulate.
    pub fn index_select(
        &self,
        table: &WeightTensor<B>,
        ids: &Tensor<B>,
    ) -> Result<WeightTensor<B>> {
        self.check_device(table)?;
        self.check_tensor_device(ids)?;
        let need = self.out_needs_grad(&[table]);
        let out = self.emit(table.weight().index_select(ids)?, need);
        if need {
            self.record(BackwardStep::IndexSelect {
                table: table.clone(),
                ids: ids.clone(),
                out: out.clone(),
            });
        }
        Ok(out)
    }

    /// Sum of all elements, as a scalar node.
    pub fn sum_all(&self, input: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.check_device(input)?;
        let need = self.out_needs_grad(&[input]);
        let out = self.emit(input.weight().sum_all()?, need);
        if need {
            self.record(BackwardStep::SumAll {
                input: input.clone(),
                out: out.clone(),
            });
        }
        Ok(out)
    }

    /// Mean of all elements, as a scalar node.
    pub fn mean_all(&self, input: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        self.check_device(input)?;
        let need = self.out_needs_grad(&[input]);
        let out = self.emit(input.weight().mean_all()?, need);
        if need {
            self.record(BackwardStep::MeanAll {
                input: input.clone(),
                out: out.clone(),
            });
        }
        Ok(out)
    }
}
