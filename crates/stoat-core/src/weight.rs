use std::sync::{Arc, Mutex};

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::tensor::Tensor;

// WeightTensor — a graph node's value: weight + (lazy) gradient
//
// Everything the ComputeGraph touches is a WeightTensor: trainable
// parameters, batch inputs, and the intermediates ops produce. The weight
// is the forward value; the gradient cell starts empty and is only ever
// filled for tensors that need one.
//
// The handle is an Arc so tape entries, modules, and callers can all hold
// the same node cheaply. The gradient sits behind a Mutex because gradient
// reduction across device replicas is the one place Stoat crosses threads
// with these (spec'd in the trainer); the weight itself is interior-mutable
// through the tensor's own storage lock.

struct WeightInner<B: Backend> {
    name: String,
    weight: Tensor<B>,
    grad: Mutex<Option<Tensor<B>>>,
    need_gradient: bool,
    trainable: bool,
}

/// A named weight with an optional, lazily allocated gradient.
pub struct WeightTensor<B: Backend> {
    inner: Arc<WeightInner<B>>,
}

impl<B: Backend> Clone for WeightTensor<B> {
    fn clone(&self) -> Self {
        WeightTensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for WeightTensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "WeightTensor(name={:?}, shape={}, need_gradient={}, trainable={})",
            self.inner.name,
            self.inner.weight.shape(),
            self.inner.need_gradient,
            self.inner.trainable
        )
    }
}

impl<B: Backend> WeightTensor<B> {
    fn new(name: String, weight: Tensor<B>, need_gradient: bool, trainable: bool) -> Self {
        WeightTensor {
            inner: Arc::new(WeightInner {
                name,
                weight,
                grad: Mutex::new(None),
                need_gradient,
                trainable,
            }),
        }
    }

    /// A trainable parameter: gets gradients, updated by the optimizer.
    pub fn parameter(name: impl Into<String>, weight: Tensor<B>) -> Self {
        Self::new(name.into(), weight, true, true)
    }

    /// A constant input (batch data, masks): no gradient ever.
    pub fn input(name: impl Into<String>, weight: Tensor<B>) -> Self {
        Self::new(name.into(), weight, false, false)
    }

    /// An intermediate produced by a graph op. `need_gradient` is the OR
    /// of the op's inputs.
    pub(crate) fn intermediate(weight: Tensor<B>, need_gradient: bool) -> Self {
        Self::new(String::new(), weight, need_gradient, false)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn weight(&self) -> &Tensor<B> {
        &self.inner.weight
    }

    pub fn need_gradient(&self) -> bool {
        self.inner.need_gradient
    }

    pub fn is_trainable(&self) -> bool {
        self.inner.trainable
    }

    /// How many handles reach this node. 1 means only the caller holds it
    /// (no tape entry, no module), which is what the in-place graph ops
    /// require before reusing the buffer.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// The current gradient, if one has been accumulated.
    pub fn grad(&self) -> Option<Tensor<B>> {
        self.inner.grad.lock().expect("grad lock poisoned").clone()
    }

    /// Add `delta` into the gradient buffer. Allocation is lazy: the first
    /// contribution becomes the buffer. When that first contribution is
    /// exclusively owned, contiguous, and shaped right, the buffer is
    /// *moved* in rather than copied — an optimization that must not (and
    /// does not) change the accumulated value.
    ///
    /// Contributions after the first always add element-wise; a parameter
    /// read at several graph positions (tied embeddings, reused layers)
    /// receives the sum of all of them.
    pub fn accumulate_grad(&self, delta: Tensor<B>) -> Result<()> {
        if !self.inner.need_gradient {
            return Ok(());
        }
        let expected = self.inner.weight.shape();
        if delta.shape() != expected {
            return Err(Error::ShapeMismatch {
                expected: expected.clone(),
                got: delta.shape().clone(),
            });
        }
        let mut slot = self
            .inner
            .grad
            .lock()
            .map_err(|_| Error::msg("grad lock poisoned"))?;
        match slot.as_ref() {
            None => {
                let owned = if delta.is_exclusively_owned() && delta.is_contiguous() {
                    delta
                } else {
                    delta.duplicate()?
                };
                *slot = Some(owned);
            }
            Some(grad) => {
                grad.add_assign(&delta)?;
            }
        }
        Ok(())
    }

    /// Reset the gradient buffer to zero (keeping the allocation).
    /// No-op when no gradient has been allocated yet.
    pub fn zero_grad(&self) -> Result<()> {
        let slot = self
            .inner
            .grad
            .lock()
            .map_err(|_| Error::msg("grad lock poisoned"))?;
        if let Some(grad) = slot.as_ref() {
            grad.affine_assign(0.0, 0.0)?;
        }
        Ok(())
    }

    /// Free the gradient buffer entirely.
    pub fn release_grad(&self) {
        let mut slot = self.inner.grad.lock().expect("grad lock poisoned");
        *slot = None;
    }

    /// Move the gradient buffer out, leaving the slot empty.
    pub fn take_grad(&self) -> Option<Tensor<B>> {
        self.inner.grad.lock().expect("grad lock poisoned").take()
    }
}

#[cfg(test)]
mod tests {
    // Exercised end-to-end through the graph tests (tape_tests.rs) and the
    // CPU backend's tensor tests; accumulate semantics are covered there.
}
