//! Unidirectional GRU encoder.
//!
//! ```text
//! [B, T, F] ─→ dropout(keep_input)
//!   ─→ N × GRU (each output → dropout(keep_hidden))    [B, T, units]
//!   ─→ OutputHead (bottleneck?, output, time-major)     [T, B, classes]
//! ```
//!
//! ## Parameter paths (under the encoder name)
//!
//! ```text
//! gru_hidden{i}/gru_cell/gates/{kernel,bias}
//! gru_hidden{i}/gru_cell/candidate/{kernel,bias}
//! bottleneck/{weights,biases}          (if bottleneck_dim)
//! output/{weights,biases}
//! ```

use candle_core::Tensor;

use super::{Encoder, EncoderOutput};
use crate::config::{GruEncoderConfig, KeepProbs};
use crate::model::layers::{dropout, OutputHead};
use crate::model::rnn::gru_cell::GruCell;
use crate::model::rnn::{dynamic_rnn, SequenceLengths};
use crate::params::{ParamPath, ParamStore};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct GruEncoder {
    cells: Vec<GruCell>,
    head: OutputHead,
    cfg: GruEncoderConfig,
}

impl GruEncoder {
    /// Create every parameter under `cfg.name` in `store`.
    pub fn new(cfg: &GruEncoderConfig, store: &ParamStore) -> Result<Self> {
        cfg.validate()?;
        let root = ParamPath::root(cfg.name.as_str());

        let mut cells = Vec::with_capacity(cfg.num_layers);
        for layer in 1..=cfg.num_layers {
            let input_size = if layer == 1 {
                cfg.input_size
            } else {
                cfg.num_units
            };
            cells.push(GruCell::new(
                store,
                &root.pp(format!("gru_hidden{layer}")).pp("gru_cell"),
                input_size,
                cfg.num_units,
                cfg.parameter_init,
            )?);
        }

        let head = OutputHead::new(
            store,
            &root,
            cfg.num_units,
            cfg.bottleneck(),
            cfg.num_classes,
            cfg.final_output_dropout,
        )?;

        tracing::info!(
            name = %cfg.name,
            layers = cfg.num_layers,
            units = cfg.num_units,
            bottleneck = ?cfg.bottleneck(),
            params = store.num_elements_under(&root),
            "built GRU encoder"
        );

        Ok(Self {
            cells,
            head,
            cfg: cfg.clone(),
        })
    }

    pub fn config(&self) -> &GruEncoderConfig {
        &self.cfg
    }

    pub fn has_bottleneck(&self) -> bool {
        self.head.has_bottleneck()
    }

    /// Forward pass.
    ///
    /// - `inputs`: `[B, T, input_size]`
    /// - `inputs_seq_len`: `[B]` valid lengths
    ///
    /// Returns logits `[T, B, num_classes]` and the final state of every layer (`[B, units]` each).
    pub fn forward(
        &self,
        inputs: &Tensor,
        inputs_seq_len: &Tensor,
        keep: KeepProbs,
    ) -> Result<EncoderOutput<Vec<Tensor>>> {
        keep.validate()?;
        let (batch, max_time, features) = inputs.dims3()?;
        if features != self.cfg.input_size {
            return Err(Error::Shape(format!(
                "expected {} input features, got {features}",
                self.cfg.input_size
            )));
        }
        let lengths = SequenceLengths::from_tensor(inputs_seq_len, batch, max_time)?;

        let mut outputs = dropout(inputs, keep.input)?;
        let mut final_state = Vec::with_capacity(self.cells.len());
        for cell in &self.cells {
            let (layer_out, state) = dynamic_rnn(cell, &outputs, &lengths, keep.hidden)?;
            outputs = layer_out;
            final_state.push(state);
        }

        let logits = self.head.forward(&outputs, keep.output)?;
        Ok(EncoderOutput {
            logits,
            final_state,
        })
    }
}

impl Encoder for GruEncoder {
    type State = Vec<Tensor>;

    fn encode(
        &self,
        inputs: &Tensor,
        inputs_seq_len: &Tensor,
        keep: KeepProbs,
    ) -> Result<EncoderOutput<Vec<Tensor>>> {
        self.forward(inputs, inputs_seq_len, keep)
    }

    fn num_classes(&self) -> usize {
        self.cfg.num_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn small_cfg() -> GruEncoderConfig {
        GruEncoderConfig {
            input_size: 6,
            num_units: 8,
            num_layers: 2,
            num_classes: 5,
            parameter_init: 0.1,
            ..GruEncoderConfig::default()
        }
    }

    fn batch(b: usize, t: usize, f: usize) -> (Tensor, Tensor) {
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (b, t, f), &dev).unwrap();
        let lens: Vec<u32> = (0..b).map(|i| (t - i.min(t - 1)) as u32).collect();
        (x, Tensor::new(lens.as_slice(), &dev).unwrap())
    }

    #[test]
    fn test_gru_encoder_shape() {
        let store = ParamStore::new(&Device::Cpu, DType::F32, 0);
        let enc = GruEncoder::new(&small_cfg(), &store).unwrap();
        let (x, lens) = batch(3, 7, 6);
        let out = enc.forward(&x, &lens, KeepProbs::inference()).unwrap();
        assert_eq!(out.logits.dims(), &[7, 3, 5]);
        assert_eq!(out.final_state.len(), 2);
        assert_eq!(out.final_state[1].dims(), &[3, 8]);
    }

    #[test]
    fn test_gru_encoder_reference_shape() {
        // 256 units, 2 layers, 30 classes, batch 4, time 50, 40 features
        let cfg = GruEncoderConfig {
            input_size: 40,
            num_units: 256,
            num_layers: 2,
            num_classes: 30,
            parameter_init: 0.1,
            ..GruEncoderConfig::default()
        };
        let store = ParamStore::new(&Device::Cpu, DType::F32, 0);
        let enc = GruEncoder::new(&cfg, &store).unwrap();
        let x = Tensor::randn(0f32, 1.0, (4, 50, 40), &Device::Cpu).unwrap();
        let lens = Tensor::new(&[50u32, 45, 30, 12], &Device::Cpu).unwrap();
        let out = enc.forward(&x, &lens, KeepProbs::inference()).unwrap();
        assert_eq!(out.logits.dims(), &[50, 4, 30]);
    }

    #[test]
    fn test_gru_encoder_param_paths() {
        let store = ParamStore::new(&Device::Cpu, DType::F32, 0);
        let cfg = GruEncoderConfig {
            bottleneck_dim: Some(4),
            ..small_cfg()
        };
        let enc = GruEncoder::new(&cfg, &store).unwrap();
        assert!(enc.has_bottleneck());
        let root = ParamPath::root("gru_encoder");
        let l2 = root.pp("gru_hidden2").pp("gru_cell");
        assert_eq!(store.get(&l2.pp("gates").pp("kernel")).unwrap().dims(), &[16, 16]);
        assert_eq!(store.get(&root.pp("bottleneck").pp("weights")).unwrap().dims(), &[4, 8]);
        assert_eq!(store.get(&root.pp("output").pp("weights")).unwrap().dims(), &[5, 4]);
    }

    #[test]
    fn test_gru_encoder_no_bottleneck_when_zero() {
        let store = ParamStore::new(&Device::Cpu, DType::F32, 0);
        let cfg = GruEncoderConfig {
            bottleneck_dim: Some(0),
            ..small_cfg()
        };
        let enc = GruEncoder::new(&cfg, &store).unwrap();
        assert!(!enc.has_bottleneck());
        let root = ParamPath::root("gru_encoder");
        assert!(!store.contains(&root.pp("bottleneck").pp("weights")));
    }

    #[test]
    fn test_gru_encoder_deterministic_without_dropout() {
        let (x, lens) = batch(2, 5, 6);
        let run = |seed| {
            let store = ParamStore::new(&Device::Cpu, DType::F32, seed);
            let enc = GruEncoder::new(&small_cfg(), &store).unwrap();
            let a = enc.forward(&x, &lens, KeepProbs::inference()).unwrap().logits;
            let b = enc.forward(&x, &lens, KeepProbs::inference()).unwrap().logits;
            let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(a, b);
            a
        };
        assert_eq!(run(42), run(42));
        assert_ne!(run(42), run(43));
    }

    #[test]
    fn test_gru_encoder_rejects_wrong_width() {
        let store = ParamStore::new(&Device::Cpu, DType::F32, 0);
        let enc = GruEncoder::new(&small_cfg(), &store).unwrap();
        let (x, lens) = batch(2, 5, 7);
        let err = enc.forward(&x, &lens, KeepProbs::inference()).unwrap_err();
        assert!(matches!(err, Error::Shape(_)));
    }

    #[test]
    fn test_gru_encoder_rejects_bad_keep_prob() {
        let store = ParamStore::new(&Device::Cpu, DType::F32, 0);
        let enc = GruEncoder::new(&small_cfg(), &store).unwrap();
        let (x, lens) = batch(2, 5, 6);
        let err = enc
            .forward(&x, &lens, KeepProbs::new(1.0, 0.0, 1.0))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_gru_encoder_same_name_collides() {
        let store = ParamStore::new(&Device::Cpu, DType::F32, 0);
        GruEncoder::new(&small_cfg(), &store).unwrap();
        let err = GruEncoder::new(&small_cfg(), &store).unwrap_err();
        assert!(matches!(err, Error::DuplicateParam(_)));
        let other = GruEncoderConfig {
            name: "gru_encoder_2".to_string(),
            ..small_cfg()
        };
        assert!(GruEncoder::new(&other, &store).is_ok());
    }

    #[test]
    fn test_gru_encoder_with_dropout_runs() {
        let store = ParamStore::new(&Device::Cpu, DType::F32, 0);
        let cfg = GruEncoderConfig {
            bottleneck_dim: Some(4),
            ..small_cfg()
        };
        let enc = GruEncoder::new(&cfg, &store).unwrap();
        let (x, lens) = batch(2, 5, 6);
        let out = enc
            .encode(&x, &lens, KeepProbs::new(0.9, 0.8, 0.7))
            .unwrap();
        assert_eq!(out.logits.dims(), &[5, 2, 5]);
        assert_eq!(enc.num_classes(), 5);
    }

    fn logits(enc: &GruEncoder, x: &Tensor, lens: &Tensor, keep: KeepProbs) -> Vec<f32> {
        let out = enc.forward(x, lens, keep).unwrap().logits;
        out.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_gru_encoder_input_dropout_applied() {
        let store = ParamStore::new(&Device::Cpu, DType::F32, 0);
        let enc = GruEncoder::new(&small_cfg(), &store).unwrap();
        let (x, lens) = batch(2, 5, 6);
        let clean = logits(&enc, &x, &lens, KeepProbs::inference());
        assert_ne!(clean, logits(&enc, &x, &lens, KeepProbs::new(0.5, 1.0, 1.0)));
    }

    #[test]
    fn test_gru_encoder_hidden_dropout_applied() {
        let store = ParamStore::new(&Device::Cpu, DType::F32, 0);
        let enc = GruEncoder::new(&small_cfg(), &store).unwrap();
        let (x, lens) = batch(2, 5, 6);
        let clean = logits(&enc, &x, &lens, KeepProbs::inference());
        assert_ne!(clean, logits(&enc, &x, &lens, KeepProbs::new(1.0, 0.5, 1.0)));
    }

    #[test]
    fn test_gru_encoder_output_dropout_zeroes_logits() {
        let store = ParamStore::new(&Device::Cpu, DType::F32, 0);
        let enc = GruEncoder::new(&small_cfg(), &store).unwrap();
        // full-length rows, so no padded step contributes a zero logit
        let x = Tensor::randn(0f32, 1.0, (4, 8, 6), &Device::Cpu).unwrap();
        let lens = Tensor::new(&[8u32; 4], &Device::Cpu).unwrap();
        let clean = logits(&enc, &x, &lens, KeepProbs::inference());
        assert!(clean.iter().all(|&v| v != 0.0));
        let dropped = logits(&enc, &x, &lens, KeepProbs::new(1.0, 1.0, 0.5));
        assert!(dropped.iter().any(|&v| v == 0.0));

        let cfg = GruEncoderConfig {
            final_output_dropout: false,
            name: "gru_no_final_dropout".to_string(),
            ..small_cfg()
        };
        let enc = GruEncoder::new(&cfg, &store).unwrap();
        let clean = logits(&enc, &x, &lens, KeepProbs::inference());
        assert_eq!(clean, logits(&enc, &x, &lens, KeepProbs::new(1.0, 1.0, 0.5)));
    }
}
