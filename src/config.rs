//! Configuration for the GST style encoder.
//!
//! Defaults match the reference Tacotron-GST hyperparameters.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Hyperparameters for [`StyleEncoder`](crate::model::gst::StyleEncoder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GstConfig {
    /// Output channels of each reference-encoder conv stage.
    #[serde(default = "default_ref_enc_filters")]
    pub ref_enc_filters: Vec<usize>,

    /// Mel bins per input frame.
    #[serde(default = "default_n_mel_channels")]
    pub n_mel_channels: usize,

    /// GRU hidden size (reference embedding width).
    #[serde(default = "default_ref_enc_gru_size")]
    pub ref_enc_gru_size: usize,

    /// Number of style tokens in the bank.
    #[serde(default = "default_token_num")]
    pub token_num: usize,

    /// Style embedding width. Must be divisible by `num_heads`.
    #[serde(default = "default_token_embedding_size")]
    pub token_embedding_size: usize,

    /// Attention heads over the token bank.
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,

    /// Standard deviation of the token bank initializer.
    #[serde(default = "default_token_init_std")]
    pub token_init_std: f64,

    #[serde(default = "default_batch_norm_eps")]
    pub batch_norm_eps: f64,

    #[serde(default = "default_batch_norm_momentum")]
    pub batch_norm_momentum: f64,
}

impl Default for GstConfig {
    fn default() -> Self {
        Self {
            ref_enc_filters: default_ref_enc_filters(),
            n_mel_channels: default_n_mel_channels(),
            ref_enc_gru_size: default_ref_enc_gru_size(),
            token_num: default_token_num(),
            token_embedding_size: default_token_embedding_size(),
            num_heads: default_num_heads(),
            token_init_std: default_token_init_std(),
            batch_norm_eps: default_batch_norm_eps(),
            batch_norm_momentum: default_batch_norm_momentum(),
        }
    }
}

fn default_ref_enc_filters() -> Vec<usize> {
    vec![32, 32, 64, 64, 128, 128]
}
fn default_n_mel_channels() -> usize {
    80
}
fn default_ref_enc_gru_size() -> usize {
    128
}
fn default_token_num() -> usize {
    10
}
fn default_token_embedding_size() -> usize {
    256
}
fn default_num_heads() -> usize {
    8
}
fn default_token_init_std() -> f64 {
    0.5
}
fn default_batch_norm_eps() -> f64 {
    1e-5
}
fn default_batch_norm_momentum() -> f64 {
    0.1
}

impl GstConfig {
    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Check the invariants every component relies on.
    pub fn validate(&self) -> Result<()> {
        if self.ref_enc_filters.is_empty() {
            return Err(Error::Config(
                "ref_enc_filters must name at least one conv stage".into(),
            ));
        }
        if let Some(pos) = self.ref_enc_filters.iter().position(|&c| c == 0) {
            return Err(Error::Config(format!(
                "ref_enc_filters[{pos}] must be positive"
            )));
        }
        for (name, value) in [
            ("n_mel_channels", self.n_mel_channels),
            ("ref_enc_gru_size", self.ref_enc_gru_size),
            ("token_num", self.token_num),
            ("token_embedding_size", self.token_embedding_size),
            ("num_heads", self.num_heads),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        if self.token_embedding_size % self.num_heads != 0 {
            return Err(Error::Config(format!(
                "token_embedding_size ({}) must be divisible by num_heads ({})",
                self.token_embedding_size, self.num_heads
            )));
        }
        if !(self.token_init_std.is_finite() && self.token_init_std > 0.0) {
            return Err(Error::Config(format!(
                "token_init_std must be a positive finite value, got {}",
                self.token_init_std
            )));
        }
        if !(self.batch_norm_eps.is_finite() && self.batch_norm_eps > 0.0) {
            return Err(Error::Config(format!(
                "batch_norm_eps must be a positive finite value, got {}",
                self.batch_norm_eps
            )));
        }
        Ok(())
    }

    /// Width of one style token: `token_embedding_size / num_heads`.
    pub fn token_dim(&self) -> usize {
        self.token_embedding_size / self.num_heads
    }

    /// Number of stride-2 conv stages (K).
    pub fn num_stages(&self) -> usize {
        self.ref_enc_filters.len()
    }

    /// Mel axis width left after every conv stage.
    pub fn reduced_mel_channels(&self) -> usize {
        conv_output_len(self.n_mel_channels, 3, 2, 1, self.num_stages())
    }
}

/// Length of an axis after `n_convs` convolutions with the same geometry.
pub fn conv_output_len(
    mut len: usize,
    kernel_size: usize,
    stride: usize,
    pad: usize,
    n_convs: usize,
) -> usize {
    for _ in 0..n_convs {
        len = (len + 2 * pad - kernel_size) / stride + 1;
    }
    len
}
