//! Global Style Token (GST) encoder in pure Rust.
//!
//! A candle-based implementation of the Tacotron-GST style encoder: turns a
//! variable-length log-mel spectrogram into a fixed-size style embedding for
//! conditioning a speech synthesis model.
//!
//! ## Architecture
//!
//! ```text
//! mel [N, T, n_mels]
//!        ↓
//!   K × (Conv2d stride 2 → BatchNorm → ReLU)   time and mel axes halve per stage
//!        ↓
//!   GRU (length-aware, final state)            [N, ref_enc_gru_size]
//!        ↓
//!   multi-head attention over tanh(token bank) [N, token_embedding_size]
//! ```
//!
//! ## Modules
//!
//! - [`config`] — hyperparameters ([`GstConfig`])
//! - [`model`] — reference encoder, attention, style token layer, full encoder
//!
//! ## Example
//!
//! ```rust,ignore
//! use candle_core::{DType, Device, Tensor};
//! use candle_nn::{VarBuilder, VarMap};
//! use gst_rs::{GstConfig, StyleEncoder};
//!
//! let dev = Device::Cpu;
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
//! let gst = StyleEncoder::new(&GstConfig::default(), vb)?;
//!
//! let mel = Tensor::zeros((2, 120, 80), DType::F32, &dev)?;
//! let style = gst.forward(&mel, Some(&[120, 96]))?; // [2, 256]
//! ```

pub mod config;
pub mod model;

mod error;

pub use config::GstConfig;
pub use error::{Error, Result};
pub use model::gst::StyleEncoder;
