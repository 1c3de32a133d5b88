//! Acoustic encoders producing time-major CTC logits.
//!
//! - [`gru`] — unidirectional stacked GRU
//! - [`vgg_blstm`] — VGG convolutional front-end + bidirectional LSTM stack

pub mod gru;
pub mod vgg_blstm;

use candle_core::Tensor;

use crate::config::KeepProbs;
use crate::Result;

/// Logits and final recurrent state of one encoder pass.
#[derive(Debug, Clone)]
pub struct EncoderOutput<S> {
    /// `[T, B, num_classes]`.
    pub logits: Tensor,
    pub final_state: S,
}

/// Common interface of the encoders.
pub trait Encoder {
    type State;

    /// Encode `inputs` (`[B, T, F]`) with valid lengths `inputs_seq_len` (`[B]`).
    fn encode(
        &self,
        inputs: &Tensor,
        inputs_seq_len: &Tensor,
        keep: KeepProbs,
    ) -> Result<EncoderOutput<Self::State>>;

    fn num_classes(&self) -> usize;
}
