//! Feed-forward building blocks shared by both encoders.
//!
//! - [`dropout`] — keep-probability dropout (no-op at 1.0)
//! - [`Dense`] — fully-connected layer with optional activation
//! - [`VggBlock`] — two 3×3 conv + ReLU, then 2×2 max-pool
//! - [`OutputHead`] — optional bottleneck + class projection + time-major reshape

use candle_core::{Module, Tensor};
use candle_nn::{Activation, Conv2d, Conv2dConfig, Linear};

use crate::params::{Init, ParamPath, ParamStore};
use crate::Result;

/// Stddev of the truncated-normal init used by the bottleneck and output layers.
pub const DENSE_INIT_STDDEV: f64 = 0.1;

/// Dropout with a keep-probability; `keep_prob >= 1.0` returns the input unchanged.
pub fn dropout(xs: &Tensor, keep_prob: f64) -> Result<Tensor> {
    if keep_prob >= 1.0 {
        return Ok(xs.clone());
    }
    Ok(candle_nn::ops::dropout(xs, (1.0 - keep_prob) as f32)?)
}

// ---------------------------------------------------------------------------
// Dense
// ---------------------------------------------------------------------------

/// Fully-connected layer: `act(x · Wᵀ + b)`, parameters `weights` / `biases`.
#[derive(Debug, Clone)]
pub struct Dense {
    linear: Linear,
    activation: Option<Activation>,
    out_dim: usize,
}

impl Dense {
    pub fn new(
        store: &ParamStore,
        path: &ParamPath,
        in_dim: usize,
        out_dim: usize,
        weight_init: Init,
        activation: Option<Activation>,
    ) -> Result<Self> {
        let weight = store.create(&path.pp("weights"), (out_dim, in_dim), weight_init)?;
        let bias = store.create(&path.pp("biases"), out_dim, Init::Const(0.0))?;
        Ok(Self {
            linear: Linear::new(weight, Some(bias)),
            activation,
            out_dim,
        })
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }
}

impl Module for Dense {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = self.linear.forward(xs)?;
        match &self.activation {
            Some(act) => xs.apply(act),
            None => Ok(xs),
        }
    }
}

// ---------------------------------------------------------------------------
// VGG block
// ---------------------------------------------------------------------------

/// 3×3 convolution, stride 1, "same" padding, followed by ReLU.
#[derive(Debug, Clone)]
struct ConvRelu {
    conv: Conv2d,
}

impl ConvRelu {
    fn new(
        store: &ParamStore,
        path: &ParamPath,
        in_channels: usize,
        out_channels: usize,
        stddev: f64,
    ) -> Result<Self> {
        let weight = store.create(
            &path.pp("weight"),
            (out_channels, in_channels, 3, 3),
            Init::TruncatedNormal { stddev },
        )?;
        let bias = store.create(&path.pp("bias"), out_channels, Init::Const(0.0))?;
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            conv: Conv2d::new(weight, Some(bias), cfg),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.conv.forward(x)?.relu()?)
    }
}

/// 2×2 max-pool, stride 2, "same" padding: odd extents gain one trailing row/column.
///
/// Input must be non-negative (it always follows a ReLU), so zero padding
/// never wins the max.
fn max_pool_same(x: &Tensor) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    let x = if h % 2 == 1 {
        x.pad_with_zeros(2, 0, 1)?
    } else {
        x.clone()
    };
    let x = if w % 2 == 1 {
        x.pad_with_zeros(3, 0, 1)?
    } else {
        x
    };
    Ok(x.max_pool2d(2)?)
}

/// VGG block on NCHW input: conv1 → ReLU → conv2 → ReLU → pool.
///
/// `[N, C_in, H, W]` → `[N, C_out, ceil(H/2), ceil(W/2)]`
#[derive(Debug, Clone)]
pub struct VggBlock {
    conv1: ConvRelu,
    conv2: ConvRelu,
}

impl VggBlock {
    pub fn new(
        store: &ParamStore,
        path: &ParamPath,
        in_channels: usize,
        out_channels: usize,
        stddev: f64,
    ) -> Result<Self> {
        Ok(Self {
            conv1: ConvRelu::new(store, &path.pp("conv1"), in_channels, out_channels, stddev)?,
            conv2: ConvRelu::new(store, &path.pp("conv2"), out_channels, out_channels, stddev)?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.conv1.forward(x)?;
        let x = self.conv2.forward(&x)?;
        max_pool_same(&x)
    }
}

// ---------------------------------------------------------------------------
// Output head
// ---------------------------------------------------------------------------

/// Post-recurrent projection to class logits.
///
/// ```text
/// [B, T, D] → [B*T, D]
///   → bottleneck (ReLU) → dropout(keep_output)     (if configured)
///   → output (linear)   → [B, T, C] → [T, B, C]
///   → dropout(keep_output)                         (if final_output_dropout)
/// ```
#[derive(Debug, Clone)]
pub struct OutputHead {
    bottleneck: Option<Dense>,
    output: Dense,
    num_classes: usize,
    final_output_dropout: bool,
}

impl OutputHead {
    pub fn new(
        store: &ParamStore,
        root: &ParamPath,
        input_dim: usize,
        bottleneck_dim: Option<usize>,
        num_classes: usize,
        final_output_dropout: bool,
    ) -> Result<Self> {
        let init = Init::TruncatedNormal {
            stddev: DENSE_INIT_STDDEV,
        };
        let bottleneck = bottleneck_dim
            .map(|dim| {
                Dense::new(
                    store,
                    &root.pp("bottleneck"),
                    input_dim,
                    dim,
                    init,
                    Some(Activation::Relu),
                )
            })
            .transpose()?;
        let output_in = bottleneck_dim.unwrap_or(input_dim);
        let output = Dense::new(store, &root.pp("output"), output_in, num_classes, init, None)?;
        Ok(Self {
            bottleneck,
            output,
            num_classes,
            final_output_dropout,
        })
    }

    pub fn has_bottleneck(&self) -> bool {
        self.bottleneck.is_some()
    }

    /// `[B, T, D]` batch-major recurrent outputs → `[T, B, C]` logits.
    pub fn forward(&self, outputs: &Tensor, keep_output: f64) -> Result<Tensor> {
        let (b, t, d) = outputs.dims3()?;
        let mut x = outputs.reshape((b * t, d))?;
        if let Some(bottleneck) = &self.bottleneck {
            x = bottleneck.forward(&x)?;
            x = dropout(&x, keep_output)?;
        }
        let logits = self
            .output
            .forward(&x)?
            .reshape((b, t, self.num_classes))?
            .transpose(0, 1)?
            .contiguous()?;
        if self.final_output_dropout {
            dropout(&logits, keep_output)
        } else {
            Ok(logits)
        }
    }
}
