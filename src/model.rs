//! Model components.
//!
//! - [`rnn`] — recurrent cells and the length-aware unrolling loops
//! - [`layers`] — dropout, dense, VGG block and the shared output head
//! - [`encoder`] — the GRU and VGG-BLSTM encoders

pub mod encoder;
pub mod layers;
pub mod rnn;
