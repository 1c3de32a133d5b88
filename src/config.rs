//! Encoder configuration.
//!
//! Both encoders are configured once and then invoked many times. Optional
//! widths use `Option<usize>`; `Some(0)` is accepted from serialized configs
//! and treated the same as `None` (stage disabled).

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Width of the linear projection between the VGG front-end and the BLSTM stack.
pub const VGG_PROJECTION_DIM: usize = 256;

/// Output channels of the second VGG block.
pub const VGG_OUTPUT_CHANNELS: usize = 128;

/// Number of stacked features per frame (static, delta, delta-delta).
pub const FEATURE_TRIPLE: usize = 3;

/// Recurrent cell implementation used by the BLSTM stack.
///
/// Serialized with the cell names used by existing training configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LstmImpl {
    /// Plain LSTM: no peepholes, no clipping, no projection.
    BasicLstmCell,
    /// Full LSTM with optional peepholes, cell clipping and output projection.
    LstmCell,
    /// Block LSTM with optional peepholes.
    LstmBlockCell,
    /// Fused block LSTM. Accepted by the parser, rejected at construction.
    LstmBlockFusedCell,
}

impl LstmImpl {
    pub const ALL: [Self; 4] = [
        Self::BasicLstmCell,
        Self::LstmCell,
        Self::LstmBlockCell,
        Self::LstmBlockFusedCell,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BasicLstmCell => "BasicLSTMCell",
            Self::LstmCell => "LSTMCell",
            Self::LstmBlockCell => "LSTMBlockCell",
            Self::LstmBlockFusedCell => "LSTMBlockFusedCell",
        }
    }

    /// Whether this implementation honors `use_peephole`.
    pub fn supports_peephole(self) -> bool {
        !matches!(self, Self::BasicLstmCell)
    }

    /// Whether this implementation honors `num_proj`.
    pub fn supports_projection(self) -> bool {
        matches!(self, Self::LstmCell)
    }

    /// Whether this implementation honors `clip_activation`.
    pub fn supports_cell_clip(self) -> bool {
        matches!(self, Self::LstmCell)
    }
}

impl fmt::Display for LstmImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LstmImpl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|variant| variant.as_str() == s)
            .ok_or_else(|| {
                let choices: Vec<&str> = Self::ALL.iter().map(|v| v.as_str()).collect();
                Error::Config(format!(
                    "unknown lstm_impl {s:?}; expected one of {}",
                    choices.join(", ")
                ))
            })
    }
}

impl TryFrom<String> for LstmImpl {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<LstmImpl> for String {
    fn from(value: LstmImpl) -> Self {
        value.as_str().to_string()
    }
}

/// Dropout keep-probabilities for one forward pass.
///
/// Each value must lie in `(0, 1]`; `1.0` disables dropout for that connection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeepProbs {
    /// Input-to-hidden connection.
    pub input: f64,
    /// Hidden-to-hidden connection (applied to every recurrent layer's output).
    pub hidden: f64,
    /// Hidden-to-output connection.
    pub output: f64,
}

impl KeepProbs {
    pub fn new(input: f64, hidden: f64, output: f64) -> Self {
        Self {
            input,
            hidden,
            output,
        }
    }

    /// All connections kept.
    pub fn inference() -> Self {
        Self::new(1.0, 1.0, 1.0)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, p) in [
            ("input", self.input),
            ("hidden", self.hidden),
            ("output", self.output),
        ] {
            if !(p > 0.0 && p <= 1.0) {
                return Err(Error::Config(format!(
                    "keep_prob_{name} must be in (0, 1], got {p}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for KeepProbs {
    fn default() -> Self {
        Self::inference()
    }
}

/// Unidirectional GRU encoder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GruEncoderConfig {
    /// Feature width of each input frame.
    pub input_size: usize,
    /// Units per GRU layer.
    pub num_units: usize,
    pub num_layers: usize,
    /// Output classes (the blank label is not counted).
    pub num_classes: usize,
    /// Recurrent weights are drawn from `U(-parameter_init, +parameter_init)`.
    pub parameter_init: f64,
    #[serde(default)]
    pub bottleneck_dim: Option<usize>,
    /// Apply output dropout again after the time-major transpose.
    #[serde(default = "default_final_output_dropout")]
    pub final_output_dropout: bool,
    /// Root scope of every parameter this encoder creates.
    #[serde(default = "default_gru_name")]
    pub name: String,
}

impl Default for GruEncoderConfig {
    fn default() -> Self {
        Self {
            input_size: 123,
            num_units: 256,
            num_layers: 5,
            num_classes: 28,
            parameter_init: 0.1,
            bottleneck_dim: None,
            final_output_dropout: default_final_output_dropout(),
            name: default_gru_name(),
        }
    }
}

impl GruEncoderConfig {
    /// Parse and validate. Bad values (unknown cell name, wrong types) are
    /// [`Error::Config`]; malformed JSON is [`Error::Json`].
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = parse_json(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Bottleneck width, `None` when disabled.
    pub fn bottleneck(&self) -> Option<usize> {
        self.bottleneck_dim.filter(|&d| d > 0)
    }

    pub fn validate(&self) -> Result<()> {
        require_positive("input_size", self.input_size)?;
        require_positive("num_units", self.num_units)?;
        require_positive("num_layers", self.num_layers)?;
        require_positive("num_classes", self.num_classes)?;
        require_init_range(self.parameter_init)
    }
}

/// VGG front-end + bidirectional LSTM encoder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VggBlstmEncoderConfig {
    /// Feature width of a single (unspliced) frame; must be a multiple of 3.
    pub input_size: usize,
    /// Number of spliced frames per input vector.
    pub splice: usize,
    /// Units per LSTM direction.
    pub num_units: usize,
    pub num_layers: usize,
    pub num_classes: usize,
    pub lstm_impl: LstmImpl,
    #[serde(default)]
    pub use_peephole: bool,
    /// Recurrent weights are drawn from `U(-parameter_init, +parameter_init)`;
    /// convolution kernels use it as truncated-normal stddev.
    pub parameter_init: f64,
    /// Cell state clipping bound. Values `<= 0` disable clipping.
    #[serde(default)]
    pub clip_activation: f64,
    /// Recurrent output projection width (`LSTMCell` only).
    #[serde(default)]
    pub num_proj: Option<usize>,
    #[serde(default)]
    pub bottleneck_dim: Option<usize>,
    /// Apply output dropout again after the time-major transpose.
    #[serde(default = "default_final_output_dropout")]
    pub final_output_dropout: bool,
    /// Root scope of every parameter this encoder creates.
    #[serde(default = "default_vgg_blstm_name")]
    pub name: String,
}

impl Default for VggBlstmEncoderConfig {
    fn default() -> Self {
        Self {
            input_size: 123,
            splice: 11,
            num_units: 256,
            num_layers: 5,
            num_classes: 28,
            lstm_impl: LstmImpl::LstmBlockCell,
            use_peephole: true,
            parameter_init: 0.1,
            clip_activation: 50.0,
            num_proj: None,
            bottleneck_dim: None,
            final_output_dropout: default_final_output_dropout(),
            name: default_vgg_blstm_name(),
        }
    }
}

impl VggBlstmEncoderConfig {
    /// Parse and validate. Bad values (unknown cell name, wrong types) are
    /// [`Error::Config`]; malformed JSON is [`Error::Json`].
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = parse_json(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Expected feature width of one spliced input vector.
    pub fn spliced_input_size(&self) -> usize {
        self.input_size * self.splice
    }

    /// Image height seen by the VGG blocks.
    pub fn image_height(&self) -> usize {
        self.input_size / FEATURE_TRIPLE
    }

    /// Spatial size `(new_h, new_w)` after both 2×2 pools.
    pub fn pooled_dims(&self) -> (usize, usize) {
        (self.image_height().div_ceil(4), self.splice.div_ceil(4))
    }

    /// Flattened VGG output width fed to the linear projection.
    pub fn conv_output_dim(&self) -> usize {
        let (h, w) = self.pooled_dims();
        h * w * VGG_OUTPUT_CHANNELS
    }

    /// Projection width, `None` unless the cell implementation supports it.
    pub fn projection(&self) -> Option<usize> {
        if !self.lstm_impl.supports_projection() {
            return None;
        }
        self.num_proj.filter(|&p| p > 0)
    }

    /// Cell clipping bound, `None` when disabled.
    pub fn cell_clip(&self) -> Option<f64> {
        (self.lstm_impl.supports_cell_clip() && self.clip_activation > 0.0)
            .then_some(self.clip_activation)
    }

    /// Width of one direction's output.
    pub fn direction_output_dim(&self) -> usize {
        self.projection().unwrap_or(self.num_units)
    }

    /// Width of the concatenated forward/backward output.
    pub fn bidirectional_output_dim(&self) -> usize {
        2 * self.direction_output_dim()
    }

    pub fn bottleneck(&self) -> Option<usize> {
        self.bottleneck_dim.filter(|&d| d > 0)
    }

    pub fn validate(&self) -> Result<()> {
        require_positive("input_size", self.input_size)?;
        require_positive("splice", self.splice)?;
        require_positive("num_units", self.num_units)?;
        require_positive("num_layers", self.num_layers)?;
        require_positive("num_classes", self.num_classes)?;
        require_init_range(self.parameter_init)?;
        if self.input_size % FEATURE_TRIPLE != 0 {
            return Err(Error::Config(format!(
                "input_size must be a multiple of {FEATURE_TRIPLE}, got {}",
                self.input_size
            )));
        }
        if !self.clip_activation.is_finite() {
            return Err(Error::Config(format!(
                "clip_activation must be finite, got {}",
                self.clip_activation
            )));
        }
        Ok(())
    }
}

fn require_positive(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(Error::Config(format!("{name} must be positive")));
    }
    Ok(())
}

fn require_init_range(parameter_init: f64) -> Result<()> {
    if !(parameter_init.is_finite() && parameter_init > 0.0) {
        return Err(Error::Config(format!(
            "parameter_init must be a positive finite number, got {parameter_init}"
        )));
    }
    Ok(())
}

fn parse_json<T: DeserializeOwned>(json: &str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| {
        if e.is_data() {
            Error::Config(e.to_string())
        } else {
            Error::Json(e)
        }
    })
}

fn default_final_output_dropout() -> bool {
    true
}

fn default_gru_name() -> String {
    "gru_encoder".to_string()
}

fn default_vgg_blstm_name() -> String {
    "vgg_blstm_encoder".to_string()
}
