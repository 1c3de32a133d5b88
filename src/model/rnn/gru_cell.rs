//! GRU cell.
//!
//! ```text
//! r, u = σ([x, h] · W_gates + b_gates)
//! c    = tanh([x, r ⊙ h] · W_candidate + b_candidate)
//! h'   = u ⊙ h + (1 − u) ⊙ c
//! ```
//!
//! Parameters (under the cell path):
//!
//! ```text
//! gates/kernel      [input + units, 2 * units]   U(-init, +init)
//! gates/bias        [2 * units]                  1.0
//! candidate/kernel  [input + units, units]       U(-init, +init)
//! candidate/bias    [units]                      0.0
//! ```

use candle_core::{DType, Device, Tensor};

use super::RecurrentCell;
use crate::params::{Init, ParamPath, ParamStore};
use crate::Result;

#[derive(Debug, Clone)]
pub struct GruCell {
    num_units: usize,
    gates_x: Tensor,
    gates_h: Tensor,
    gates_bias: Tensor,
    candidate_x: Tensor,
    candidate_h: Tensor,
    candidate_bias: Tensor,
}

impl GruCell {
    pub fn new(
        store: &ParamStore,
        path: &ParamPath,
        input_size: usize,
        num_units: usize,
        parameter_init: f64,
    ) -> Result<Self> {
        let uniform = Init::Uniform {
            range: parameter_init,
        };
        let gates = path.pp("gates");
        let gates_kernel =
            store.create(&gates.pp("kernel"), (input_size + num_units, 2 * num_units), uniform)?;
        let gates_bias = store.create(&gates.pp("bias"), 2 * num_units, Init::Const(1.0))?;

        let candidate = path.pp("candidate");
        let candidate_kernel =
            store.create(&candidate.pp("kernel"), (input_size + num_units, num_units), uniform)?;
        let candidate_bias =
            store.create(&candidate.pp("bias"), num_units, Init::Const(0.0))?;

        Ok(Self {
            num_units,
            gates_x: gates_kernel.narrow(0, 0, input_size)?,
            gates_h: gates_kernel.narrow(0, input_size, num_units)?,
            gates_bias,
            candidate_x: candidate_kernel.narrow(0, 0, input_size)?,
            candidate_h: candidate_kernel.narrow(0, input_size, num_units)?,
            candidate_bias,
        })
    }
}

impl RecurrentCell for GruCell {
    type State = Tensor;

    fn output_size(&self) -> usize {
        self.num_units
    }

    fn zero_state(&self, batch: usize, dtype: DType, device: &Device) -> Result<Tensor> {
        Ok(Tensor::zeros((batch, self.num_units), dtype, device)?)
    }

    /// `[B, T, input]` → `[B, T, 3 * units]`: gate pre-activations then candidate.
    fn project_inputs(&self, inputs: &Tensor) -> Result<Tensor> {
        let gates = inputs
            .broadcast_matmul(&self.gates_x)?
            .broadcast_add(&self.gates_bias)?;
        let candidate = inputs
            .broadcast_matmul(&self.candidate_x)?
            .broadcast_add(&self.candidate_bias)?;
        Ok(Tensor::cat(&[&gates, &candidate], 2)?)
    }

    fn step(&self, x_t: &Tensor, h: &Tensor) -> Result<(Tensor, Tensor)> {
        let u = self.num_units;
        let gates = (x_t.narrow(1, 0, 2 * u)? + h.matmul(&self.gates_h)?)?;
        let gates = candle_nn::ops::sigmoid(&gates)?;
        let r = gates.narrow(1, 0, u)?;
        let update = gates.narrow(1, u, u)?;

        let c = (x_t.narrow(1, 2 * u, u)? + (r * h)?.matmul(&self.candidate_h)?)?.tanh()?;

        // u ⊙ h + (1 − u) ⊙ c == c + u ⊙ (h − c)
        let new_h = (&c + update.mul(&(h - &c)?)?)?;
        Ok((new_h.clone(), new_h))
    }
}
