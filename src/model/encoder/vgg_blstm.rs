//! VGG convolutional front-end followed by a bidirectional LSTM stack.
//!
//! Each input vector is feature-major with the splice axis minor: element
//! `f * splice + s` is feature `f` of spliced frame `s`. Features come in
//! `input_size / 3` groups of (static, Δ, ΔΔ), so feature `f = h * 3 + c`
//! maps to image row `h`, channel `c`, and the frame `s` is the column.
//! One vector is thus an image of height `input_size / 3`, width `splice`
//! and 3 channels.
//!
//! ```text
//! [B, T, F]
//!   → [B·T, 3, H, W]                      (H = input_size/3, W = splice)
//!   → vgg1 (3→64), vgg2 (64→128)          [B·T, 128, ⌈H/4⌉, ⌈W/4⌉]
//!   → [B, T, ⌈H/4⌉·⌈W/4⌉·128]             (flattened in h, w, c order)
//!   → linear → 256 → dropout(keep_input)
//!   → N × BLSTM                           [B, T, 2·out]
//!   → OutputHead                          [T, B, classes]
//! ```

use candle_core::{Module, Tensor};

use super::{Encoder, EncoderOutput};
use crate::config::{KeepProbs, LstmImpl, VggBlstmEncoderConfig, VGG_PROJECTION_DIM};
use crate::model::layers::{dropout, Dense, OutputHead, VggBlock};
use crate::model::rnn::lstm_cell::{LstmCell, LstmCellConfig, LstmState};
use crate::model::rnn::{bidirectional_dynamic_rnn, SequenceLengths};
use crate::params::{Init, ParamPath, ParamStore};
use crate::{Error, Result};

/// Final `(c, h)` of both directions of the top layer.
#[derive(Debug, Clone)]
pub struct BlstmState {
    pub forward: LstmState,
    pub backward: LstmState,
}

#[derive(Debug, Clone)]
struct BlstmLayer {
    fw: LstmCell,
    bw: LstmCell,
}

#[derive(Debug, Clone)]
pub struct VggBlstmEncoder {
    vgg1: VggBlock,
    vgg2: VggBlock,
    linear: Dense,
    layers: Vec<BlstmLayer>,
    head: OutputHead,
    cfg: VggBlstmEncoderConfig,
}

impl VggBlstmEncoder {
    /// Create every parameter under `cfg.name` in `store`.
    pub fn new(cfg: &VggBlstmEncoderConfig, store: &ParamStore) -> Result<Self> {
        cfg.validate()?;
        if cfg.lstm_impl == LstmImpl::LstmBlockFusedCell {
            return Err(Error::NotImplemented(format!(
                "{} is not supported",
                cfg.lstm_impl
            )));
        }
        if cfg.num_proj.is_some_and(|p| p > 0) && cfg.projection().is_none() {
            tracing::debug!(lstm_impl = %cfg.lstm_impl, "num_proj ignored by this cell");
        }

        let root = ParamPath::root(cfg.name.as_str());
        let stddev = cfg.parameter_init;
        let vgg1 = VggBlock::new(store, &root.pp("vgg1"), 3, 64, stddev)?;
        let vgg2 = VggBlock::new(store, &root.pp("vgg2"), 64, 128, stddev)?;
        let linear = Dense::new(
            store,
            &root.pp("linear"),
            cfg.conv_output_dim(),
            VGG_PROJECTION_DIM,
            Init::XavierUniform,
            None,
        )?;

        let mut layers = Vec::with_capacity(cfg.num_layers);
        for layer in 1..=cfg.num_layers {
            let input_size = if layer == 1 {
                VGG_PROJECTION_DIM
            } else {
                cfg.bidirectional_output_dim()
            };
            let scope = root.pp(format!("blstm_hidden{layer}"));
            layers.push(BlstmLayer {
                fw: LstmCell::new(store, &scope.pp("fw"), cell_config(cfg, input_size), stddev)?,
                bw: LstmCell::new(store, &scope.pp("bw"), cell_config(cfg, input_size), stddev)?,
            });
        }

        let head = OutputHead::new(
            store,
            &root,
            cfg.bidirectional_output_dim(),
            cfg.bottleneck(),
            cfg.num_classes,
            cfg.final_output_dropout,
        )?;

        tracing::info!(
            name = %cfg.name,
            lstm_impl = %cfg.lstm_impl,
            layers = cfg.num_layers,
            units = cfg.num_units,
            pooled = ?cfg.pooled_dims(),
            params = store.num_elements_under(&root),
            "built VGG-BLSTM encoder"
        );

        Ok(Self {
            vgg1,
            vgg2,
            linear,
            layers,
            head,
            cfg: cfg.clone(),
        })
    }

    pub fn config(&self) -> &VggBlstmEncoderConfig {
        &self.cfg
    }

    pub fn has_bottleneck(&self) -> bool {
        self.head.has_bottleneck()
    }

    /// Convolutional front-end: `[B, T, input_size·splice]` → `[B, T, 256]`.
    fn front_end(&self, inputs: &Tensor, batch: usize, max_time: usize) -> Result<Tensor> {
        let x = to_image(inputs, self.cfg.image_height(), self.cfg.splice)?;
        let x = self.vgg1.forward(&x)?;
        let x = self.vgg2.forward(&x)?;
        let x = flatten_image(&x, batch, max_time)?;
        Ok(self.linear.forward(&x)?)
    }

    /// Forward pass.
    ///
    /// - `inputs`: `[B, T, input_size * splice]`
    /// - `inputs_seq_len`: `[B]` valid lengths
    pub fn forward(
        &self,
        inputs: &Tensor,
        inputs_seq_len: &Tensor,
        keep: KeepProbs,
    ) -> Result<EncoderOutput<BlstmState>> {
        keep.validate()?;
        let (batch, max_time, features) = inputs.dims3()?;
        if features != self.cfg.spliced_input_size() {
            return Err(Error::Shape(format!(
                "expected {} features ({} x {} spliced frames), got {features}",
                self.cfg.spliced_input_size(),
                self.cfg.input_size,
                self.cfg.splice
            )));
        }
        let lengths = SequenceLengths::from_tensor(inputs_seq_len, batch, max_time)?;

        let projected = self.front_end(inputs, batch, max_time)?;
        let mut outputs = dropout(&projected, keep.input)?;
        tracing::trace!(shape = ?outputs.dims(), "front-end done");

        let mut final_state = None;
        for layer in &self.layers {
            let sweep = bidirectional_dynamic_rnn(
                &layer.fw,
                &layer.bw,
                &outputs,
                &lengths,
                keep.hidden,
            )?;
            outputs = sweep.concat()?;
            final_state = Some(BlstmState {
                forward: sweep.forward_state,
                backward: sweep.backward_state,
            });
        }
        let final_state =
            final_state.ok_or_else(|| Error::Config("encoder has no recurrent layers".into()))?;

        let logits = self.head.forward(&outputs, keep.output)?;
        Ok(EncoderOutput {
            logits,
            final_state,
        })
    }
}

impl Encoder for VggBlstmEncoder {
    type State = BlstmState;

    fn encode(
        &self,
        inputs: &Tensor,
        inputs_seq_len: &Tensor,
        keep: KeepProbs,
    ) -> Result<EncoderOutput<BlstmState>> {
        self.forward(inputs, inputs_seq_len, keep)
    }

    fn num_classes(&self) -> usize {
        self.cfg.num_classes
    }
}

/// `[B, T, H·3·W]` → `[B·T, 3, H, W]`.
///
/// Element `(h·3 + c)·W + w` of a vector lands at channel `c`, row `h`, column `w`.
fn to_image(inputs: &Tensor, height: usize, splice: usize) -> Result<Tensor> {
    let (batch, max_time, _) = inputs.dims3()?;
    Ok(inputs
        .reshape((batch * max_time, height, 3, splice))?
        .permute((0, 2, 1, 3))?
        .contiguous()?)
}

/// `[B·T, C, H, W]` → `[B, T, H·W·C]`, flattened channels-last.
fn flatten_image(x: &Tensor, batch: usize, max_time: usize) -> Result<Tensor> {
    let (_, c, h, w) = x.dims4()?;
    Ok(x.permute((0, 2, 3, 1))?
        .contiguous()?
        .reshape((batch, max_time, h * w * c))?)
}

fn cell_config(cfg: &VggBlstmEncoderConfig, input_size: usize) -> LstmCellConfig {
    match cfg.lstm_impl {
        LstmImpl::BasicLstmCell => LstmCellConfig::basic(input_size, cfg.num_units),
        LstmImpl::LstmBlockCell => {
            LstmCellConfig::block(input_size, cfg.num_units, cfg.use_peephole)
        }
        // fused is rejected before any cell is built
        LstmImpl::LstmCell | LstmImpl::LstmBlockFusedCell => LstmCellConfig::full(
            input_size,
            cfg.num_units,
            cfg.use_peephole,
            cfg.cell_clip(),
            cfg.projection(),
        ),
    }
}
