//! Style token layer.
//!
//! A small bank of learned token embeddings `[token_num, token_embedding_size / num_heads]`
//! is squashed with tanh and attended to by the reference embedding. The
//! attention output is the style embedding.

use candle_core::{Tensor, Var};
use candle_nn::{Init, VarBuilder};

use crate::config::GstConfig;
use crate::model::attention::MultiHeadAttention;
use crate::model::ensure_finite;
use crate::{Error, Result};

/// Learned style token embeddings.
///
/// Backed by a [`Var`] so an optimizer can update it in place; the shape is
/// fixed at construction.
#[derive(Debug, Clone)]
pub struct TokenBank {
    embed: Var,
    token_count: usize,
    token_dim: usize,
}

impl TokenBank {
    /// Loads `embed`, initializing fresh parameters from `N(0, init_std²)`.
    pub fn new(token_count: usize, token_dim: usize, init_std: f64, vb: VarBuilder) -> Result<Self> {
        let embed = vb.get_with_hints(
            (token_count, token_dim),
            "embed",
            Init::Randn {
                mean: 0.0,
                stdev: init_std,
            },
        )?;
        Ok(Self {
            embed: Var::from_tensor(&embed)?,
            token_count,
            token_dim,
        })
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn token_dim(&self) -> usize {
        self.token_dim
    }

    /// Parameter handle for optimizers.
    pub fn var(&self) -> &Var {
        &self.embed
    }

    /// Raw (pre-tanh) token embeddings `[token_count, token_dim]`.
    pub fn as_tensor(&self) -> &Tensor {
        self.embed.as_tensor()
    }

    /// Overwrite the bank in place. `values` must be `[token_count, token_dim]`.
    pub fn assign(&mut self, values: &Tensor) -> Result<()> {
        if values.dims() != [self.token_count, self.token_dim] {
            return Err(Error::Shape(format!(
                "token bank is [{}, {}], replacement is {:?}",
                self.token_count,
                self.token_dim,
                values.dims()
            )));
        }
        self.embed.set(&values.to_dtype(self.embed.dtype())?)?;
        Ok(())
    }

    /// `tanh(bank)` broadcast to `[batch, token_count, token_dim]`.
    fn keys(&self, batch: usize) -> Result<Tensor> {
        Ok(self
            .embed
            .as_tensor()
            .tanh()?
            .unsqueeze(0)?
            .broadcast_as((batch, self.token_count, self.token_dim))?
            .contiguous()?)
    }
}

/// Style token layer: reference embedding → style embedding.
#[derive(Debug, Clone)]
pub struct StyleTokenLayer {
    bank: TokenBank,
    attention: MultiHeadAttention,
}

impl StyleTokenLayer {
    /// Parameters: `embed` and `attention.W_{query,key,value}.weight`.
    pub fn new(cfg: &GstConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let token_dim = cfg.token_dim();
        let bank = TokenBank::new(cfg.token_num, token_dim, cfg.token_init_std, vb.clone())?;
        let attention = MultiHeadAttention::new(
            cfg.ref_enc_gru_size,
            token_dim,
            cfg.token_embedding_size,
            cfg.num_heads,
            vb.pp("attention"),
        )?;
        Ok(Self { bank, attention })
    }

    /// Expected reference embedding width.
    pub fn query_dim(&self) -> usize {
        self.attention.query_dim()
    }

    /// Style embedding width.
    pub fn embedding_size(&self) -> usize {
        self.attention.num_units()
    }

    pub fn num_heads(&self) -> usize {
        self.attention.num_heads()
    }

    pub fn token_bank(&self) -> &TokenBank {
        &self.bank
    }

    pub fn token_bank_mut(&mut self) -> &mut TokenBank {
        &mut self.bank
    }

    /// `[N, query_dim]` → `[N, token_embedding_size]`.
    pub fn tokenize(&self, query: &Tensor) -> Result<Tensor> {
        self.tokenize_with_weights(query).map(|(embed, _)| embed)
    }

    /// Style embedding plus each head's distribution over the tokens
    /// (`[N, num_heads, token_num]`).
    pub fn tokenize_with_weights(&self, query: &Tensor) -> Result<(Tensor, Tensor)> {
        let batch = self.check_rows(query, self.query_dim(), "reference embedding")?;
        let query = query.unsqueeze(1)?; // [N, 1, D]
        let keys = self.bank.keys(batch)?;
        let (out, weights) = self.attention.forward_with_weights(&query, &keys)?;
        Ok((out.squeeze(1)?, weights.squeeze(2)?))
    }

    /// Style embedding from hand-picked token weights `[N, token_num]`.
    ///
    /// Every head uses the same weights, so the result is the weighted sum of
    /// the value projections of `tanh(bank)`.
    pub fn embed_from_weights(&self, weights: &Tensor) -> Result<Tensor> {
        let batch = self.check_rows(weights, self.bank.token_count(), "token weights")?;
        ensure_finite(weights, "token weight selection")?;
        let values = self.attention.project_values(&self.bank.keys(batch)?)?; // [N, T, E]
        let weights = weights.to_dtype(values.dtype())?.unsqueeze(1)?; // [N, 1, T]
        Ok(weights.matmul(&values)?.squeeze(1)?)
    }

    fn check_rows(&self, xs: &Tensor, width: usize, name: &str) -> Result<usize> {
        match xs.dims() {
            &[batch, w] if w == width => Ok(batch),
            dims => Err(Error::Shape(format!(
                "{name} must be [N, {width}], got {dims:?}"
            ))),
        }
    }
}
