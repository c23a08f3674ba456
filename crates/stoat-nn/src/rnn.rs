use stoat_core::{Backend, ComputeGraph, DType, Result, Tensor, WeightTensor};

use crate::init;
use crate::module::NetModule;

// LSTM — cell plus bidirectional sequence encoder
//
// The cell computes one timestep; the encoder unrolls it over the
// sequence in both directions and concatenates the two hidden states per
// position. Unrolling through graph ops is all it takes for
// backpropagation-through-time: every step lands on the same tape and
// replays in reverse.
//
// Gate layout in the fused projection, chunked along the feature axis:
//   [input | forget | cell-candidate | output]
//
//   gates = x @ W_ih + h @ W_hh + b            [batch, 4*hidden]
//   c' = σ(f)·c + σ(i)·tanh(g)
//   h' = σ(o)·tanh(c')

/// One LSTM timestep.
pub struct LstmCell<B: Backend> {
    w_ih: WeightTensor<B>,
    w_hh: WeightTensor<B>,
    bias: WeightTensor<B>,
    hidden: usize,
}

impl<B: Backend> LstmCell<B> {
    pub fn new(
        name: &str,
        input: usize,
        hidden: usize,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let k = (1.0 / hidden as f64).sqrt();
        Ok(LstmCell {
            w_ih: WeightTensor::parameter(
                format!("{name}.w_ih"),
                init::uniform::<B>((input, 4 * hidden), k, dtype, device)?,
            ),
            w_hh: WeightTensor::parameter(
                format!("{name}.w_hh"),
                init::uniform::<B>((hidden, 4 * hidden), k, dtype, device)?,
            ),
            bias: WeightTensor::parameter(
                format!("{name}.bias"),
                Tensor::<B>::zeros(4 * hidden, dtype, device)?,
            ),
            hidden,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden
    }

    /// One step: ([batch, input], h, c) → (h', c').
    pub fn step(
        &self,
        g: &ComputeGraph<B>,
        x: &WeightTensor<B>,
        h: &WeightTensor<B>,
        c: &WeightTensor<B>,
    ) -> Result<(WeightTensor<B>, WeightTensor<B>)> {
        let xw = g.matmul(x, &self.w_ih)?;
        let hw = g.matmul(h, &self.w_hh)?;
        let gates = g.add(&g.add(&xw, &hw)?, &self.bias)?;

        let hsz = self.hidden;
        let i = g.sigmoid(&g.narrow(&gates, 1, 0, hsz)?)?;
        let f = g.sigmoid(&g.narrow(&gates, 1, hsz, hsz)?)?;
        let cand = g.tanh(&g.narrow(&gates, 1, 2 * hsz, hsz)?)?;
        let o = g.sigmoid(&g.narrow(&gates, 1, 3 * hsz, hsz)?)?;

        let c_next = g.add(&g.mul(&f, c)?, &g.mul(&i, &cand)?)?;
        let h_next = g.mul(&o, &g.tanh(&c_next)?)?;
        Ok((h_next, c_next))
    }

    pub fn parameters(&self) -> Vec<WeightTensor<B>> {
        vec![self.w_ih.clone(), self.w_hh.clone(), self.bias.clone()]
    }
}

/// Bidirectional LSTM encoder: [batch, seq, input] → [batch, seq, 2*hidden].
pub struct BiLstmEncoder<B: Backend> {
    forward_cell: LstmCell<B>,
    backward_cell: LstmCell<B>,
    hidden: usize,
}

impl<B: Backend> BiLstmEncoder<B> {
    pub fn new(
        name: &str,
        input: usize,
        hidden: usize,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        Ok(BiLstmEncoder {
            forward_cell: LstmCell::new(&format!("{name}.fwd"), input, hidden, dtype, device)?,
            backward_cell: LstmCell::new(&format!("{name}.bwd"), input, hidden, dtype, device)?,
            hidden,
        })
    }

    pub fn output_size(&self) -> usize {
        2 * self.hidden
    }

    /// Run one direction, returning the hidden state per timestep in
    /// forward temporal order.
    fn run_direction(
        &self,
        g: &ComputeGraph<B>,
        cell: &LstmCell<B>,
        x: &WeightTensor<B>,
        reverse: bool,
    ) -> Result<Vec<WeightTensor<B>>> {
        let dims = x.weight().dims().to_vec();
        let (batch, seq, input) = (dims[0], dims[1], dims[2]);
        let dtype = x.weight().dtype();

        let zeros = Tensor::<B>::zeros((batch, self.hidden), dtype, g.device())?;
        let mut h = g.constant("lstm.h0", zeros.duplicate()?)?;
        let mut c = g.constant("lstm.c0", zeros)?;

        let mut states = vec![None; seq];
        for step in 0..seq {
            let t = if reverse { seq - 1 - step } else { step };
            let sg = g.sub_graph("lstm_step");
            let xt = sg.narrow(x, 1, t, 1)?;
            let xt = sg.reshape(&xt, (batch, input))?;
            let (h_next, c_next) = cell.step(&sg, &xt, &h, &c)?;
            h = h_next;
            c = c_next;
            states[t] = Some(h.clone());
        }
        Ok(states.into_iter().map(|s| s.expect("all steps visited")).collect())
    }
}

impl<B: Backend> NetModule<B> for BiLstmEncoder<B> {
    fn forward(&self, graph: &ComputeGraph<B>, x: &WeightTensor<B>) -> Result<WeightTensor<B>> {
        let dims = x.weight().dims().to_vec();
        let (batch, seq) = (dims[0], dims[1]);

        let fwd = self.run_direction(graph, &self.forward_cell, x, false)?;
        let bwd = self.run_direction(graph, &self.backward_cell, x, true)?;

        // Per timestep: [batch, 2*hidden] → [batch, 1, 2*hidden], then
        // concatenate along the sequence axis.
        let mut steps = Vec::with_capacity(seq);
        for t in 0..seq {
            let joined = graph.concat(&[&fwd[t], &bwd[t]], 1)?;
            steps.push(graph.reshape(&joined, (batch, 1, 2 * self.hidden))?);
        }
        let refs: Vec<&WeightTensor<B>> = steps.iter().collect();
        graph.concat(&refs, 1)
    }

    fn parameters(&self) -> Vec<WeightTensor<B>> {
        let mut params = self.forward_cell.parameters();
        params.extend(self.backward_cell.parameters());
        params
    }
}
