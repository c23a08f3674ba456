use stoat_core::{Backend, ComputeGraph, Error, Result, Tensor, WeightTensor};
use stoat_data::CorpusBatch;
use stoat_nn::SequenceTagger;

// MultiDeviceModule — replicate one network across N devices
//
// Device 0 is canonical: its parameter values are authoritative between
// synchronization points, the optimizer only ever touches them, and the
// other replicas are write-only targets of sync_weights().
//
// The per-step cycle the trainer drives:
//
//   sync_weights()                       canonical → replicas (bit-identical)
//   zero_gradients_on_all_devices()
//   …parallel forward/backward per device…
//   sum_gradients_to_default_device()    Σ replica grads → canonical grads
//   optimizer step on canonical params
//   release_gradients_on_all_devices()
//
// Parameter lists must be stable and identically ordered across replicas;
// sync and reduction match parameters by position.

/// The model interface the trainer drives, per device replica.
pub trait TaggingModel<B: Backend>: Send + Sync {
    /// Ordered, stable trainable parameter list.
    fn parameters(&self) -> Vec<WeightTensor<B>>;

    /// Build the scalar loss for one batch on the given graph. Returns the
    /// loss node and the number of real tokens it averages over.
    fn batch_loss(&self, g: &ComputeGraph<B>, batch: &CorpusBatch)
        -> Result<(WeightTensor<B>, usize)>;

    /// Greedy per-position label predictions, flat `[batch*seq]`.
    fn predict(&self, g: &ComputeGraph<B>, batch: &CorpusBatch) -> Result<Vec<u32>>;
}

impl<B: Backend> TaggingModel<B> for SequenceTagger<B> {
    fn parameters(&self) -> Vec<WeightTensor<B>> {
        SequenceTagger::parameters(self)
    }

    fn batch_loss(
        &self,
        g: &ComputeGraph<B>,
        batch: &CorpusBatch,
    ) -> Result<(WeightTensor<B>, usize)> {
        self.loss(g, batch)
    }

    fn predict(&self, g: &ComputeGraph<B>, batch: &CorpusBatch) -> Result<Vec<u32>> {
        SequenceTagger::predict(self, g, batch)
    }
}

/// One logical network replicated across devices.
pub struct MultiDeviceModule<B: Backend, M> {
    replicas: Vec<M>,
    devices: Vec<B::Device>,
}

impl<B: Backend, M: TaggingModel<B>> MultiDeviceModule<B, M> {
    /// Build one replica per device via `build`; device 0 is canonical.
    /// Replica parameter lists must agree in length and shapes — anything
    /// else is a configuration error of the builder.
    pub fn new(
        devices: Vec<B::Device>,
        build: impl Fn(&B::Device) -> Result<M>,
    ) -> Result<Self> {
        if devices.is_empty() {
            return Err(Error::msg("at least one device is required"));
        }
        let replicas = devices.iter().map(&build).collect::<Result<Vec<_>>>()?;
        let canon = replicas[0].parameters();
        for (i, replica) in replicas.iter().enumerate().skip(1) {
            let params = replica.parameters();
            if params.len() != canon.len() {
                return Err(Error::msg(format!(
                    "replica {i} declares {} parameters, canonical has {}",
                    params.len(),
                    canon.len()
                )));
            }
            for (a, b) in canon.iter().zip(params.iter()) {
                if a.weight().shape() != b.weight().shape() {
                    return Err(Error::ShapeMismatch {
                        expected: a.weight().shape().clone(),
                        got: b.weight().shape().clone(),
                    });
                }
            }
        }
        Ok(MultiDeviceModule { replicas, devices })
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> &[B::Device] {
        &self.devices
    }

    /// The canonical replica (device 0).
    pub fn default_module(&self) -> &M {
        &self.replicas[0]
    }

    pub fn replica(&self, idx: usize) -> &M {
        &self.replicas[idx]
    }

    /// The canonical replica's parameters, for the optimizer.
    pub fn params_on_default_device(&self) -> Vec<WeightTensor<B>> {
        self.replicas[0].parameters()
    }

    /// Copy canonical parameter values to every other replica. Values are
    /// ferried through f64, which represents every stored f32/u32 exactly,
    /// so replicas end up bit-identical to the canonical device.
    pub fn sync_weights(&self) -> Result<()> {
        if self.replicas.len() == 1 {
            return Ok(());
        }
        let canon = self.replicas[0].parameters();
        for replica in &self.replicas[1..] {
            for (src, dst) in canon.iter().zip(replica.parameters().iter()) {
                dst.weight().update_data_inplace(&src.weight().to_f64_vec()?)?;
            }
        }
        Ok(())
    }

    /// Zero every replica's gradient buffers (keeping allocations).
    pub fn zero_gradients_on_all_devices(&self) -> Result<()> {
        for replica in &self.replicas {
            for param in replica.parameters() {
                param.zero_grad()?;
            }
        }
        Ok(())
    }

    /// Free every replica's gradient buffers.
    pub fn release_gradients_on_all_devices(&self) {
        for replica in &self.replicas {
            for param in replica.parameters() {
                param.release_grad();
            }
        }
    }

    /// Add every non-canonical replica's gradients into the canonical
    /// replica's, element-wise, matched by parameter position. Replica
    /// gradients are cleared afterwards; the sum is independent of device
    /// iteration order because addition is the only combining op.
    pub fn sum_gradients_to_default_device(&self) -> Result<()> {
        if self.replicas.len() == 1 {
            return Ok(());
        }
        let canon = self.replicas[0].parameters();
        let canon_device = &self.devices[0];
        for replica in &self.replicas[1..] {
            for (dst, src) in canon.iter().zip(replica.parameters().iter()) {
                if let Some(grad) = src.take_grad() {
                    let ferried = Tensor::<B>::from_f64_slice(
                        &grad.to_f64_vec()?,
                        grad.shape().clone(),
                        grad.dtype(),
                        canon_device,
                    )?;
                    dst.accumulate_grad(ferried)?;
                }
            }
        }
        Ok(())
    }
}
