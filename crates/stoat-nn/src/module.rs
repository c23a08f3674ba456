use stoat_core::{Backend, ComputeGraph, Result, WeightTensor};

// NetModule — the interface every layer implements
//
// A layer's forward pass takes the graph it should record onto; the same
// layer code serves training (backprop graph) and inference (recording
// off). parameters() must return a STABLE, identically-ordered list on
// every call and on every replica of the module — weight sync, gradient
// reduction, and checkpointing all match parameters by position.

/// A neural network layer over Stoat's compute graph.
pub trait NetModule<B: Backend> {
    /// Compute the output from the input, recording onto `graph`.
    fn forward(&self, graph: &ComputeGraph<B>, x: &WeightTensor<B>) -> Result<WeightTensor<B>>;

    /// All trainable parameters, in a stable order.
    fn parameters(&self) -> Vec<WeightTensor<B>>;

    /// Total number of scalar parameters.
    fn num_parameters(&self) -> usize {
        self.parameters()
            .iter()
            .map(|p| p.weight().elem_count())
            .sum()
    }
}
