//! Reference encoder — spectrogram to a fixed-size reference embedding.
//!
//! ```text
//! [N, T, n_mels] → [N, 1, T, n_mels]
//!   ─→ K × (Conv2d 3×3 stride 2 pad 1 → BatchNorm2d → ReLU)   [N, C_K, ⌈T/2^K⌉, L_K]
//!   ─→ [N, ⌈T/2^K⌉, C_K · L_K]
//!   ─→ GRU (final hidden state)                              [N, ref_enc_gru_size]
//! ```
//!
//! When per-example lengths are given, frames past the valid length of each
//! stage are zeroed before every convolution and the GRU stops at
//! `⌈length / 2^K⌉`, so nothing in the padding reaches the output.

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, VarBuilder};

use crate::config::GstConfig;
use crate::model::ensure_finite;
use crate::model::packed_gru::PackedGru;
use crate::{Error, Result};

/// Convolutional-recurrent reference encoder.
#[derive(Debug, Clone)]
pub struct SequenceEncoder {
    convs: Vec<Conv2d>,
    bns: Vec<BatchNorm>,
    gru: PackedGru,
    n_mel_channels: usize,
    reduced_mel_channels: usize,
    final_channels: usize,
}

impl SequenceEncoder {
    /// Parameters live under `convs.{i}`, `bns.{i}` and `gru`.
    pub fn new(cfg: &GstConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;

        let conv_cfg = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let bn_cfg = BatchNormConfig {
            eps: cfg.batch_norm_eps,
            momentum: cfg.batch_norm_momentum,
            ..Default::default()
        };

        let num_stages = cfg.num_stages();
        let mut convs = Vec::with_capacity(num_stages);
        let mut bns = Vec::with_capacity(num_stages);
        let mut in_channels = 1;
        for (i, &out_channels) in cfg.ref_enc_filters.iter().enumerate() {
            convs.push(candle_nn::conv2d(
                in_channels,
                out_channels,
                3,
                conv_cfg,
                vb.pp(format!("convs.{i}")),
            )?);
            bns.push(candle_nn::batch_norm(
                out_channels,
                bn_cfg,
                vb.pp(format!("bns.{i}")),
            )?);
            in_channels = out_channels;
        }

        // Computed once; the GRU width depends on it.
        let reduced_mel_channels = cfg.reduced_mel_channels();
        let gru = PackedGru::new(
            in_channels * reduced_mel_channels,
            cfg.ref_enc_gru_size,
            vb.pp("gru"),
        )?;

        tracing::info!(
            stages = num_stages,
            n_mels = cfg.n_mel_channels,
            reduced_mels = reduced_mel_channels,
            gru_input = gru.input_size(),
            gru_hidden = gru.hidden_size(),
            "reference encoder ready"
        );

        Ok(Self {
            convs,
            bns,
            gru,
            n_mel_channels: cfg.n_mel_channels,
            reduced_mel_channels,
            final_channels: in_channels,
        })
    }

    /// Number of stride-2 stages (K).
    pub fn num_stages(&self) -> usize {
        self.convs.len()
    }

    pub fn n_mel_channels(&self) -> usize {
        self.n_mel_channels
    }

    /// Mel axis width after all stages.
    pub fn reduced_mel_channels(&self) -> usize {
        self.reduced_mel_channels
    }

    /// GRU input width: `final_channels × reduced_mel_channels`.
    pub fn gru_input_size(&self) -> usize {
        self.final_channels * self.reduced_mel_channels
    }

    /// Width of the reference embedding.
    pub fn output_size(&self) -> usize {
        self.gru.hidden_size()
    }

    /// GRU step counts for input lengths: `⌈length / 2^K⌉`.
    pub fn output_lengths(&self, lengths: &[usize]) -> Vec<usize> {
        let factor = 1usize << self.num_stages();
        lengths.iter().map(|&l| l.div_ceil(factor)).collect()
    }

    /// Inference forward pass (batch norm uses running statistics).
    ///
    /// - `mel`: `[N, T, n_mel_channels]`
    /// - `lengths`: valid frames per example, each in `1..=T`
    ///
    /// Returns `[N, ref_enc_gru_size]`.
    pub fn encode(&self, mel: &Tensor, lengths: Option<&[usize]>) -> Result<Tensor> {
        self.forward_t(mel, lengths, false)
    }

    /// Forward pass. With `train` the batch norms normalize with the
    /// statistics of the current batch.
    pub fn forward_t(&self, mel: &Tensor, lengths: Option<&[usize]>, train: bool) -> Result<Tensor> {
        let (batch, frames) = self.check_input(mel, lengths)?;

        let mut xs = mel.reshape((batch, 1, frames, self.n_mel_channels))?;
        let mut valid = lengths.map(<[usize]>::to_vec);

        for (stage, (conv, bn)) in self.convs.iter().zip(&self.bns).enumerate() {
            if let Some(valid) = &valid {
                xs = mask_frames(&xs, valid)?;
            }
            xs = conv.forward(&xs)?;
            xs = bn.forward_t(&xs, train)?;
            ensure_finite(&xs, &format!("batch norm in stage {stage}"))?;
            xs = xs.relu()?;
            if let Some(valid) = valid.as_mut() {
                valid.iter_mut().for_each(|l| *l = l.div_ceil(2));
            }
        }

        // [N, C, T', L] → [N, T', C·L]
        let (_, channels, reduced_frames, reduced_mels) = xs.dims4()?;
        debug_assert_eq!(reduced_mels, self.reduced_mel_channels);
        let xs = xs
            .transpose(1, 2)?
            .reshape((batch, reduced_frames, channels * reduced_mels))?;

        tracing::debug!(
            batch,
            frames,
            reduced_frames,
            packed = valid.is_some(),
            "reference encoder forward"
        );

        self.gru.forward(&xs, valid.as_deref())
    }

    /// Validate shapes at call entry; returns (N, T).
    fn check_input(&self, mel: &Tensor, lengths: Option<&[usize]>) -> Result<(usize, usize)> {
        if mel.rank() != 3 {
            return Err(Error::Shape(format!(
                "spectrogram must be [N, T, n_mels], got {:?}",
                mel.dims()
            )));
        }
        let (batch, frames, n_mels) = mel.dims3()?;
        if n_mels != self.n_mel_channels {
            return Err(Error::Config(format!(
                "encoder was built for {} mel channels, input has {n_mels}",
                self.n_mel_channels
            )));
        }
        if batch == 0 || frames == 0 {
            return Err(Error::Shape(format!(
                "spectrogram batch is empty: {:?}",
                mel.dims()
            )));
        }
        if let Some(lengths) = lengths {
            if lengths.len() != batch {
                return Err(Error::Shape(format!(
                    "{} lengths given for a batch of {batch}",
                    lengths.len()
                )));
            }
            if let Some((i, &l)) = lengths
                .iter()
                .enumerate()
                .find(|&(_, &l)| l == 0 || l > frames)
            {
                return Err(Error::Shape(format!(
                    "length {l} of example {i} outside 1..={frames}"
                )));
            }
        }
        Ok((batch, frames))
    }
}

/// Zero every frame at or past `valid[n]` in `[N, C, T, L]`.
fn mask_frames(xs: &Tensor, valid: &[usize]) -> Result<Tensor> {
    let (batch, _, frames, _) = xs.dims4()?;
    let mask: Vec<f32> = (0..batch)
        .flat_map(|n| (0..frames).map(move |t| if t < valid[n] { 1.0 } else { 0.0 }))
        .collect();
    let mask = Tensor::from_vec(mask, (batch, 1, frames, 1), xs.device())?.to_dtype(xs.dtype())?;
    Ok(xs.broadcast_mul(&mask)?)
}
