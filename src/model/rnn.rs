//! Length-aware recurrent sweeps.
//!
//! Sequences in a batch are right-padded. A sweep runs the cell over every
//! time step but, per batch row, only advances the state while `t < len`:
//!
//! ```text
//! output[b, t] = dropout(cell_out)   if t < len[b]
//!              = 0                   otherwise
//! state[b]     = state after step len[b] - 1 (zero state if len[b] == 0)
//! ```
//!
//! The backward direction of a bidirectional sweep reverses each row within
//! its own length, runs the same forward sweep, then reverses the outputs
//! back, so padding never leaks into the first valid step.
//!
//! - [`gru_cell`] — GRU cell
//! - [`lstm_cell`] — LSTM cell family (basic, peephole/clip/projection, block)

pub mod gru_cell;
pub mod lstm_cell;

use candle_core::{D, DType, Device, IndexOp, Tensor};

use crate::model::layers::dropout;
use crate::{Error, Result};

/// Recurrent state that can be carried through padded steps.
pub trait CellState: Clone {
    /// Take `self` where `mask` is 1 and `previous` where it is 0.
    ///
    /// `mask` is `[B, 1]` with values in {0, 1}.
    fn carry(&self, previous: &Self, mask: &Tensor) -> Result<Self>;
}

impl CellState for Tensor {
    fn carry(&self, previous: &Self, mask: &Tensor) -> Result<Self> {
        Ok((previous + (self - previous)?.broadcast_mul(mask)?)?)
    }
}

/// A single recurrent cell.
///
/// The input-side affine transform is split from the per-step recurrence so
/// it runs once over the whole `[B, T, input]` sequence.
pub trait RecurrentCell {
    type State: CellState;

    /// Width of each step's output.
    fn output_size(&self) -> usize;

    fn zero_state(&self, batch: usize, dtype: DType, device: &Device) -> Result<Self::State>;

    /// `[B, T, input]` → `[B, T, K]`, consumed one step at a time by [`Self::step`].
    fn project_inputs(&self, inputs: &Tensor) -> Result<Tensor>;

    /// One step: `x_t` is `[B, K]` from [`Self::project_inputs`].
    fn step(&self, x_t: &Tensor, state: &Self::State) -> Result<(Tensor, Self::State)>;
}

/// Host-side copy of the per-row valid lengths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceLengths {
    lengths: Vec<usize>,
    max_time: usize,
}

impl SequenceLengths {
    pub fn new(lengths: Vec<usize>, max_time: usize) -> Result<Self> {
        if let Some((row, &len)) = lengths.iter().enumerate().find(|(_, l)| **l > max_time) {
            return Err(Error::Shape(format!(
                "sequence length {len} at row {row} exceeds max time {max_time}"
            )));
        }
        Ok(Self { lengths, max_time })
    }

    /// Read a `[B]` integer or float tensor and check it against the batch.
    pub fn from_tensor(lengths: &Tensor, batch: usize, max_time: usize) -> Result<Self> {
        let n = lengths.dims1()?;
        if n != batch {
            return Err(Error::Shape(format!(
                "inputs_seq_len has {n} entries for a batch of {batch}"
            )));
        }
        let raw: Vec<i64> = lengths.to_dtype(DType::I64)?.to_vec1()?;
        let lengths = raw
            .into_iter()
            .map(|len| {
                usize::try_from(len)
                    .map_err(|_| Error::Shape(format!("negative sequence length {len}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(lengths, max_time)
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.lengths
    }

    pub fn batch(&self) -> usize {
        self.lengths.len()
    }

    pub fn max_time(&self) -> usize {
        self.max_time
    }

    /// Longest valid length in the batch.
    pub fn longest(&self) -> usize {
        self.lengths.iter().copied().max().unwrap_or(0)
    }

    /// `[B, T]` mask, 1.0 at valid steps.
    pub fn mask(&self, dtype: DType, device: &Device) -> Result<Tensor> {
        let t = self.max_time;
        let data: Vec<f32> = self
            .lengths
            .iter()
            .flat_map(|&len| (0..t).map(move |step| if step < len { 1.0 } else { 0.0 }))
            .collect();
        Ok(Tensor::from_vec(data, (self.batch(), t), device)?.to_dtype(dtype)?)
    }

    /// `[B, T]` gather indices reversing each row within its length.
    fn reverse_indices(&self, device: &Device) -> Result<Tensor> {
        let t = self.max_time;
        let data: Vec<u32> = self
            .lengths
            .iter()
            .flat_map(|&len| {
                (0..t).map(move |step| (if step < len { len - 1 - step } else { step }) as u32)
            })
            .collect();
        Ok(Tensor::from_vec(data, (self.batch(), t), device)?)
    }
}

/// Reverse each row of `[B, T, D]` within its own length; padding stays put.
pub fn reverse_sequence(inputs: &Tensor, lengths: &SequenceLengths) -> Result<Tensor> {
    let (b, t, d) = inputs.dims3()?;
    let idx = lengths
        .reverse_indices(inputs.device())?
        .unsqueeze(2)?
        .expand((b, t, d))?
        .contiguous()?;
    Ok(inputs.contiguous()?.gather(&idx, 1)?)
}

/// Run `cell` over `[B, T, input]`, returning `[B, T, output]` and the final state.
///
/// `keep_hidden` is the keep-probability of the dropout applied to each
/// step's output before it is emitted.
pub fn dynamic_rnn<C: RecurrentCell>(
    cell: &C,
    inputs: &Tensor,
    lengths: &SequenceLengths,
    keep_hidden: f64,
) -> Result<(Tensor, C::State)> {
    let (batch, max_time, _) = inputs.dims3()?;
    if max_time == 0 {
        return Err(Error::Shape("inputs have an empty time axis".to_string()));
    }
    let (dtype, device) = (inputs.dtype(), inputs.device());

    let projected = cell.project_inputs(inputs)?;
    let mask = lengths.mask(dtype, device)?;
    let mut state = cell.zero_state(batch, dtype, device)?;

    // Steps past the longest row only ever emit zeros.
    let active = lengths.longest().min(max_time);
    let mut outputs = Vec::with_capacity(max_time);
    for t in 0..active {
        let x_t = projected.i((.., t, ..))?;
        let m_t = mask.i((.., t..t + 1))?;
        let (out, next) = cell.step(&x_t, &state)?;
        let out = dropout(&out, keep_hidden)?;
        outputs.push(out.broadcast_mul(&m_t)?);
        state = next.carry(&state, &m_t)?;
    }
    if active < max_time {
        let padding = Tensor::zeros((batch, cell.output_size()), dtype, device)?;
        outputs.extend(std::iter::repeat_n(padding, max_time - active));
    }

    Ok((Tensor::stack(&outputs, 1)?, state))
}

/// Outputs of a bidirectional sweep, both `[B, T, output]` in input order.
#[derive(Debug, Clone)]
pub struct BidirectionalOutput<S> {
    pub forward: Tensor,
    pub backward: Tensor,
    pub forward_state: S,
    pub backward_state: S,
}

impl<S> BidirectionalOutput<S> {
    /// Forward and backward outputs concatenated on the feature axis.
    pub fn concat(&self) -> Result<Tensor> {
        Ok(Tensor::cat(&[&self.forward, &self.backward], D::Minus1)?)
    }
}

pub fn bidirectional_dynamic_rnn<C: RecurrentCell>(
    cell_fw: &C,
    cell_bw: &C,
    inputs: &Tensor,
    lengths: &SequenceLengths,
    keep_hidden: f64,
) -> Result<BidirectionalOutput<C::State>> {
    let (forward, forward_state) = dynamic_rnn(cell_fw, inputs, lengths, keep_hidden)?;

    let reversed = reverse_sequence(inputs, lengths)?;
    let (backward_rev, backward_state) = dynamic_rnn(cell_bw, &reversed, lengths, keep_hidden)?;
    let backward = reverse_sequence(&backward_rev, lengths)?;

    Ok(BidirectionalOutput {
        forward,
        backward,
        forward_state,
        backward_state,
    })
}
