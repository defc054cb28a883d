//! Global Style Token encoder.
//!
//! Composes the reference encoder with the style token layer:
//!
//! ```text
//! mel [N, T, n_mels] ─→ SequenceEncoder ─→ [N, ref_enc_gru_size]
//!                    ─→ StyleTokenLayer ─→ [N, token_embedding_size]
//! ```

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::GstConfig;
use crate::model::reference::SequenceEncoder;
use crate::model::style_tokens::StyleTokenLayer;
use crate::{Error, Result};

/// Spectrogram → style embedding.
#[derive(Debug, Clone)]
pub struct StyleEncoder {
    encoder: SequenceEncoder,
    stl: StyleTokenLayer,
    cfg: GstConfig,
}

impl StyleEncoder {
    /// Parameters live under `encoder.*` and `stl.*`.
    pub fn new(cfg: &GstConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let encoder = SequenceEncoder::new(cfg, vb.pp("encoder"))?;
        let stl = StyleTokenLayer::new(cfg, vb.pp("stl"))?;
        Self::from_parts(encoder, stl, cfg)
    }

    /// Assemble separately built components. The reference embedding width
    /// must match the style token query width.
    pub fn from_parts(
        encoder: SequenceEncoder,
        stl: StyleTokenLayer,
        cfg: &GstConfig,
    ) -> Result<Self> {
        if encoder.output_size() != stl.query_dim() {
            return Err(Error::Config(format!(
                "reference embedding width {} does not match style token query width {}",
                encoder.output_size(),
                stl.query_dim()
            )));
        }
        tracing::info!(
            tokens = cfg.token_num,
            heads = cfg.num_heads,
            embedding = cfg.token_embedding_size,
            "style encoder ready"
        );
        Ok(Self {
            encoder,
            stl,
            cfg: cfg.clone(),
        })
    }

    pub fn config(&self) -> &GstConfig {
        &self.cfg
    }

    pub fn encoder(&self) -> &SequenceEncoder {
        &self.encoder
    }

    pub fn style_tokens(&self) -> &StyleTokenLayer {
        &self.stl
    }

    pub fn style_tokens_mut(&mut self) -> &mut StyleTokenLayer {
        &mut self.stl
    }

    /// Style embedding `[N, token_embedding_size]` (inference mode).
    pub fn forward(&self, mel: &Tensor, lengths: Option<&[usize]>) -> Result<Tensor> {
        self.forward_t(mel, lengths, false)
    }

    pub fn forward_t(&self, mel: &Tensor, lengths: Option<&[usize]>, train: bool) -> Result<Tensor> {
        let reference = self.encoder.forward_t(mel, lengths, train)?;
        self.stl.tokenize(&reference)
    }

    /// Style embedding plus token weights `[N, num_heads, token_num]`.
    pub fn forward_with_weights(
        &self,
        mel: &Tensor,
        lengths: Option<&[usize]>,
    ) -> Result<(Tensor, Tensor)> {
        let reference = self.encoder.encode(mel, lengths)?;
        self.stl.tokenize_with_weights(&reference)
    }
}
