//! Acoustic encoders for CTC speech recognition in pure Rust.
//!
//! Two candle-based encoders map padded feature sequences to time-major
//! per-frame class logits suitable for a CTC loss:
//!
//! ```text
//! features [B, T, F] + lengths [B]
//!        │
//!        ├─ GruEncoder:       N × GRU ─────────────────────┐
//!        │                                                 ├→ bottleneck? → output → [T, B, C]
//!        └─ VggBlstmEncoder:  VGG ×2 → linear → N × BLSTM ─┘
//! ```
//!
//! Parameters live in a [`ParamStore`] under hierarchical paths rooted at
//! the encoder's name, so two encoders with different names can share one
//! store while a name collision is reported as [`Error::DuplicateParam`].
//!
//! ## Modules
//!
//! - [`config`] — encoder configurations, cell variants, dropout keep-probabilities
//! - [`params`] — parameter store with deterministic initializers
//! - [`model`] — recurrent cells, shared layers and the encoders

pub mod config;
pub mod model;
pub mod params;

mod error;

pub use config::{GruEncoderConfig, KeepProbs, LstmImpl, VggBlstmEncoderConfig};
pub use error::{Error, Result};
pub use model::encoder::gru::GruEncoder;
pub use model::encoder::vgg_blstm::{BlstmState, VggBlstmEncoder};
pub use model::encoder::{Encoder, EncoderOutput};
pub use params::{ParamPath, ParamStore};
