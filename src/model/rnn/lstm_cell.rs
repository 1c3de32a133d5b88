//! LSTM cell family.
//!
//! One implementation covers the three buildable variants; the variant only
//! decides which options are switched on:
//!
//! | variant       | peepholes | cell clip | projection | scope             |
//! |---------------|-----------|-----------|------------|-------------------|
//! | basic         | no        | no        | no         | `basic_lstm_cell` |
//! | full          | optional  | optional  | optional   | `lstm_cell`       |
//! | block         | optional  | no        | no         | `lstm_block_cell` |
//!
//! ```text
//! i, j, f, o = [x, m] · W + b
//! c' = σ(f + forget_bias + p_f ⊙ c) ⊙ c + σ(i + p_i ⊙ c) ⊙ tanh(j)
//! c' = clip(c', ±cell_clip)                      (if cell_clip)
//! m' = σ(o + p_o ⊙ c') ⊙ tanh(c')
//! m' = m' · W_proj                               (if num_proj)
//! ```

use candle_core::{DType, Device, Tensor};

use super::{CellState, RecurrentCell};
use crate::params::{Init, ParamPath, ParamStore};
use crate::Result;

pub const DEFAULT_FORGET_BIAS: f64 = 1.0;

/// Options of one LSTM cell.
#[derive(Debug, Clone, PartialEq)]
pub struct LstmCellConfig {
    pub input_size: usize,
    pub num_units: usize,
    pub use_peephole: bool,
    pub cell_clip: Option<f64>,
    pub num_proj: Option<usize>,
    pub forget_bias: f64,
    /// Scope segment the cell's parameters live under.
    pub scope: &'static str,
}

impl LstmCellConfig {
    /// Plain LSTM with forget bias and tanh activation.
    pub fn basic(input_size: usize, num_units: usize) -> Self {
        Self {
            input_size,
            num_units,
            use_peephole: false,
            cell_clip: None,
            num_proj: None,
            forget_bias: DEFAULT_FORGET_BIAS,
            scope: "basic_lstm_cell",
        }
    }

    /// LSTM with optional peepholes, cell clipping and output projection.
    pub fn full(
        input_size: usize,
        num_units: usize,
        use_peephole: bool,
        cell_clip: Option<f64>,
        num_proj: Option<usize>,
    ) -> Self {
        Self {
            input_size,
            num_units,
            use_peephole,
            cell_clip,
            num_proj,
            forget_bias: DEFAULT_FORGET_BIAS,
            scope: "lstm_cell",
        }
    }

    /// Block LSTM with optional peepholes.
    pub fn block(input_size: usize, num_units: usize, use_peephole: bool) -> Self {
        Self {
            input_size,
            num_units,
            use_peephole,
            cell_clip: None,
            num_proj: None,
            forget_bias: DEFAULT_FORGET_BIAS,
            scope: "lstm_block_cell",
        }
    }

    /// Width of `m`, the step output.
    pub fn output_size(&self) -> usize {
        self.num_proj.unwrap_or(self.num_units)
    }
}

/// LSTM state: memory `c` is `[B, units]`, output `h` is `[B, output_size]`.
#[derive(Debug, Clone)]
pub struct LstmState {
    pub c: Tensor,
    pub h: Tensor,
}

impl CellState for LstmState {
    fn carry(&self, previous: &Self, mask: &Tensor) -> Result<Self> {
        Ok(Self {
            c: self.c.carry(&previous.c, mask)?,
            h: self.h.carry(&previous.h, mask)?,
        })
    }
}

#[derive(Debug, Clone)]
struct Peepholes {
    w_i: Tensor,
    w_f: Tensor,
    w_o: Tensor,
}

#[derive(Debug, Clone)]
pub struct LstmCell {
    cfg: LstmCellConfig,
    kernel_x: Tensor,
    kernel_h: Tensor,
    bias: Tensor,
    peepholes: Option<Peepholes>,
    projection: Option<Tensor>,
}

impl LstmCell {
    /// Create the cell's parameters under `path / cfg.scope`.
    pub fn new(
        store: &ParamStore,
        path: &ParamPath,
        cfg: LstmCellConfig,
        parameter_init: f64,
    ) -> Result<Self> {
        let uniform = Init::Uniform {
            range: parameter_init,
        };
        let path = path.pp(cfg.scope);
        let units = cfg.num_units;
        let out = cfg.output_size();

        let kernel = store.create(&path.pp("kernel"), (cfg.input_size + out, 4 * units), uniform)?;
        let bias = store.create(&path.pp("bias"), 4 * units, Init::Const(0.0))?;

        let peepholes = if cfg.use_peephole {
            Some(Peepholes {
                w_i: store.create(&path.pp("w_i_diag"), units, uniform)?,
                w_f: store.create(&path.pp("w_f_diag"), units, uniform)?,
                w_o: store.create(&path.pp("w_o_diag"), units, uniform)?,
            })
        } else {
            None
        };

        let projection = cfg
            .num_proj
            .map(|proj| store.create(&path.pp("projection").pp("kernel"), (units, proj), uniform))
            .transpose()?;

        Ok(Self {
            kernel_x: kernel.narrow(0, 0, cfg.input_size)?,
            kernel_h: kernel.narrow(0, cfg.input_size, out)?,
            bias,
            peepholes,
            projection,
            cfg,
        })
    }

    pub fn config(&self) -> &LstmCellConfig {
        &self.cfg
    }
}

impl RecurrentCell for LstmCell {
    type State = LstmState;

    fn output_size(&self) -> usize {
        self.cfg.output_size()
    }

    fn zero_state(&self, batch: usize, dtype: DType, device: &Device) -> Result<LstmState> {
        Ok(LstmState {
            c: Tensor::zeros((batch, self.cfg.num_units), dtype, device)?,
            h: Tensor::zeros((batch, self.output_size()), dtype, device)?,
        })
    }

    /// `[B, T, input]` → `[B, T, 4 * units]` gate pre-activations (i, j, f, o).
    fn project_inputs(&self, inputs: &Tensor) -> Result<Tensor> {
        Ok(inputs
            .broadcast_matmul(&self.kernel_x)?
            .broadcast_add(&self.bias)?)
    }

    fn step(&self, x_t: &Tensor, state: &LstmState) -> Result<(Tensor, LstmState)> {
        let u = self.cfg.num_units;
        let z = (x_t + state.h.matmul(&self.kernel_h)?)?;
        let i = z.narrow(1, 0, u)?;
        let j = z.narrow(1, u, u)?;
        let f = z.narrow(1, 2 * u, u)?;
        let o = z.narrow(1, 3 * u, u)?;

        let (i, f) = match &self.peepholes {
            Some(p) => (
                (i + state.c.broadcast_mul(&p.w_i)?)?,
                (f + state.c.broadcast_mul(&p.w_f)?)?,
            ),
            None => (i, f),
        };

        let forget = candle_nn::ops::sigmoid(&(f + self.cfg.forget_bias)?)?;
        let input = candle_nn::ops::sigmoid(&i)?;
        let mut c = ((forget * &state.c)? + (input * j.tanh()?)?)?;
        if let Some(clip) = self.cfg.cell_clip {
            c = c.clamp(-clip, clip)?;
        }

        let o = match &self.peepholes {
            Some(p) => (o + c.broadcast_mul(&p.w_o)?)?,
            None => o,
        };
        let mut m = (candle_nn::ops::sigmoid(&o)? * c.tanh()?)?;
        if let Some(w_proj) = &self.projection {
            m = m.matmul(w_proj)?;
        }

        Ok((m.clone(), LstmState { c, h: m }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::rnn::{dynamic_rnn, SequenceLengths};

    fn store() -> ParamStore {
        ParamStore::new(&Device::Cpu, DType::F32, 11)
    }

    fn run(cell: &LstmCell, b: usize, t: usize) -> (Tensor, LstmState) {
        let x = Tensor::randn(0f32, 1.0, (b, t, cell.config().input_size), &Device::Cpu).unwrap();
        let lengths = SequenceLengths::new(vec![t; b], t).unwrap();
        dynamic_rnn(cell, &x, &lengths, 1.0).unwrap()
    }

    #[test]
    fn basic_cell_params() {
        let store = store();
        let root = ParamPath::root("fw");
        let cell = LstmCell::new(&store, &root, LstmCellConfig::basic(5, 8), 0.1).unwrap();
        let cell_root = root.pp("basic_lstm_cell");
        assert_eq!(store.get(&cell_root.pp("kernel")).unwrap().dims(), &[13, 32]);
        assert_eq!(store.get(&cell_root.pp("bias")).unwrap().dims(), &[32]);
        assert!(!store.contains(&cell_root.pp("w_i_diag")));
        let (out, state) = run(&cell, 2, 6);
        assert_eq!(out.dims(), &[2, 6, 8]);
        assert_eq!(state.c.dims(), &[2, 8]);
        assert_eq!(state.h.dims(), &[2, 8]);
    }

    #[test]
    fn full_cell_with_projection() {
        let store = store();
        let root = ParamPath::root("bw");
        let cfg = LstmCellConfig::full(5, 8, true, Some(3.0), Some(4));
        let cell = LstmCell::new(&store, &root, cfg, 0.1).unwrap();
        let cell_root = root.pp("lstm_cell");
        // recurrent input is the projected output
        assert_eq!(store.get(&cell_root.pp("kernel")).unwrap().dims(), &[9, 32]);
        assert_eq!(
            store
                .get(&cell_root.pp("projection").pp("kernel"))
                .unwrap()
                .dims(),
            &[8, 4]
        );
        assert!(store.contains(&cell_root.pp("w_o_diag")));
        let (out, state) = run(&cell, 3, 4);
        assert_eq!(out.dims(), &[3, 4, 4]);
        assert_eq!(state.c.dims(), &[3, 8]);
        assert_eq!(state.h.dims(), &[3, 4]);
    }

    #[test]
    fn block_cell_peepholes() {
        let store = store();
        let root = ParamPath::root("fw");
        let cell = LstmCell::new(&store, &root, LstmCellConfig::block(5, 8, true), 0.1).unwrap();
        let cell_root = root.pp("lstm_block_cell");
        for name in ["w_i_diag", "w_f_diag", "w_o_diag"] {
            assert_eq!(store.get(&cell_root.pp(name)).unwrap().dims(), &[8]);
        }
        let (out, _) = run(&cell, 2, 3);
        assert_eq!(out.dims(), &[2, 3, 8]);
    }

    #[test]
    fn cell_clip_bounds_memory() {
        let store = store();
        let cfg = LstmCellConfig::full(4, 6, false, Some(0.5), None);
        let cell = LstmCell::new(&store, &ParamPath::root("c"), cfg, 1.0).unwrap();
        let x = Tensor::randn(0f32, 10.0, (2, 20, 4), &Device::Cpu).unwrap();
        let lengths = SequenceLengths::new(vec![20, 20], 20).unwrap();
        let (_, state) = dynamic_rnn(&cell, &x, &lengths, 1.0).unwrap();
        let max: f32 = state
            .c
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(max <= 0.5 + 1e-6, "max = {max}");
    }

    #[test]
    fn zero_weights_match_closed_form() {
        // x = 0, zero kernel/bias: f = σ(1), i = o = σ(0) = 0.5, j = 0.
        // c' = σ(1)·c, m' = 0.5·tanh(c').
        let dev = Device::Cpu;
        let cell = LstmCell {
            cfg: LstmCellConfig::basic(1, 1),
            kernel_x: Tensor::zeros((1, 4), DType::F32, &dev).unwrap(),
            kernel_h: Tensor::zeros((1, 4), DType::F32, &dev).unwrap(),
            bias: Tensor::zeros(4, DType::F32, &dev).unwrap(),
            peepholes: None,
            projection: None,
        };
        let state = LstmState {
            c: Tensor::new(&[[2f32]], &dev).unwrap(),
            h: Tensor::zeros((1, 1), DType::F32, &dev).unwrap(),
        };
        let x_t = Tensor::zeros((1, 4), DType::F32, &dev).unwrap();
        let (m, next) = cell.step(&x_t, &state).unwrap();
        let c: f32 = next.c.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0];
        let m: f32 = m.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0];
        let sig1 = 1.0 / (1.0 + (-1.0f32).exp());
        assert!((c - 2.0 * sig1).abs() < 1e-5);
        assert!((m - 0.5 * c.tanh()).abs() < 1e-5);
    }
}
