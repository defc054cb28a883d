//! Multi-head scaled dot-product attention.
//!
//! Query and key/value come from different sources (in GST: a reference
//! embedding against the style token bank). There is no masking: every key
//! position is always attended to.

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::model::ensure_finite;
use crate::{Error, Result};

/// Multi-head attention with bias-free Q/K/V projections.
///
/// ```text
/// Q = W_q · query            [N, T_q, num_units]
/// K = W_k · keys, V = W_v · keys   [N, T_k, num_units]
/// head_h = softmax(Q_h K_hᵀ / sqrt(key_dim)) V_h
/// out = concat(head_0 .. head_{H-1})
/// ```
///
/// The scores are scaled by the *input* key width `key_dim`, not by the
/// per-head width `num_units / num_heads`.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    w_query: Linear,
    w_key: Linear,
    w_value: Linear,
    query_dim: usize,
    key_dim: usize,
    num_units: usize,
    num_heads: usize,
}

impl MultiHeadAttention {
    pub fn new(
        query_dim: usize,
        key_dim: usize,
        num_units: usize,
        num_heads: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if num_heads == 0 || num_units % num_heads != 0 {
            return Err(Error::Config(format!(
                "num_units ({num_units}) must be divisible by num_heads ({num_heads})"
            )));
        }
        let w_query = candle_nn::linear_no_bias(query_dim, num_units, vb.pp("W_query"))?;
        let w_key = candle_nn::linear_no_bias(key_dim, num_units, vb.pp("W_key"))?;
        let w_value = candle_nn::linear_no_bias(key_dim, num_units, vb.pp("W_value"))?;
        Ok(Self {
            w_query,
            w_key,
            w_value,
            query_dim,
            key_dim,
            num_units,
            num_heads,
        })
    }

    pub fn query_dim(&self) -> usize {
        self.query_dim
    }

    pub fn key_dim(&self) -> usize {
        self.key_dim
    }

    pub fn num_units(&self) -> usize {
        self.num_units
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn head_dim(&self) -> usize {
        self.num_units / self.num_heads
    }

    /// Attention output `[N, T_q, num_units]`.
    pub fn forward(&self, query: &Tensor, keys: &Tensor) -> Result<Tensor> {
        self.forward_with_weights(query, keys).map(|(out, _)| out)
    }

    /// Attention output plus the per-head weights.
    ///
    /// - `query`: `[N, T_q, query_dim]`
    /// - `keys`: `[N, T_k, key_dim]` — used for both keys and values
    ///
    /// Returns (`[N, T_q, num_units]`, `[N, num_heads, T_q, T_k]`).
    pub fn forward_with_weights(&self, query: &Tensor, keys: &Tensor) -> Result<(Tensor, Tensor)> {
        let (batch, q_len) = check_input(query, self.query_dim, "query")?;
        let (k_batch, k_len) = check_input(keys, self.key_dim, "keys")?;
        if batch != k_batch {
            return Err(Error::Shape(format!(
                "query batch {batch} does not match keys batch {k_batch}"
            )));
        }
        if k_len == 0 {
            return Err(Error::Shape("keys must hold at least one position".into()));
        }

        let q = self.split_heads(&self.w_query.forward(query)?, batch, q_len)?;
        let k = self.split_heads(&self.w_key.forward(keys)?, batch, k_len)?;
        let v = self.split_heads(&self.w_value.forward(keys)?, batch, k_len)?;

        let scale = (self.key_dim as f64).sqrt();

        // Scores: [N, H, T_q, T_k]
        let scores = (q.matmul(&k.t()?)? / scale)?;
        ensure_finite(&scores, "attention scores")?;

        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        ensure_finite(&weights, "attention softmax")?;

        let out = weights.matmul(&v)?; // [N, H, T_q, D]

        // Concatenate heads in order: [N, T_q, H*D]
        let out = out
            .transpose(1, 2)?
            .reshape((batch, q_len, self.num_units))?;

        tracing::debug!(batch, q_len, k_len, heads = self.num_heads, "multi-head attention");
        Ok((out, weights))
    }

    /// Value projection of `keys`: `[N, T_k, num_units]`.
    pub(crate) fn project_values(&self, keys: &Tensor) -> Result<Tensor> {
        check_input(keys, self.key_dim, "keys")?;
        Ok(self.w_value.forward(keys)?)
    }

    /// `[N, T, num_units]` → `[N, H, T, D]`, head h covering units `h*D..(h+1)*D`.
    fn split_heads(&self, xs: &Tensor, batch: usize, len: usize) -> Result<Tensor> {
        Ok(xs
            .reshape((batch, len, self.num_heads, self.head_dim()))?
            .transpose(1, 2)?
            .contiguous()?)
    }
}

fn check_input(xs: &Tensor, width: usize, name: &str) -> Result<(usize, usize)> {
    if xs.rank() != 3 {
        return Err(Error::Shape(format!(
            "{name} must be [N, T, {width}], got {:?}",
            xs.dims()
        )));
    }
    let (n, t, d) = xs.dims3()?;
    if d != width {
        return Err(Error::Shape(format!(
            "{name} must be [N, T, {width}], got {:?}",
            xs.dims()
        )));
    }
    Ok((n, t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp, D};
    use candle_nn::VarMap;
    use std::collections::HashMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    #[test]
    fn output_shape() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let attn = MultiHeadAttention::new(128, 32, 256, 8, vb).unwrap();

        let q = Tensor::randn(0f32, 1.0, (2, 3, 128), &device).unwrap();
        let k = Tensor::randn(0f32, 1.0, (2, 10, 32), &device).unwrap();
        let (out, weights) = attn.forward_with_weights(&q, &k).unwrap();
        assert_eq!(out.dims(), &[2, 3, 256]);
        assert_eq!(weights.dims(), &[2, 8, 3, 10]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let attn = MultiHeadAttention::new(16, 8, 32, 4, vb).unwrap();

        let q = Tensor::randn(0f32, 3.0, (3, 5, 16), &device).unwrap();
        let k = Tensor::randn(0f32, 3.0, (3, 7, 8), &device).unwrap();
        let (_, weights) = attn.forward_with_weights(&q, &k).unwrap();

        let sums = weights
            .sum(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(sums.len(), 3 * 4 * 5);
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5, "row sums to {s}");
        }
    }

    #[test]
    fn indivisible_units_rejected() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let err = MultiHeadAttention::new(128, 31, 250, 8, vb).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn wrong_key_width_rejected() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let attn = MultiHeadAttention::new(4, 2, 4, 2, vb).unwrap();
        let q = Tensor::zeros((1, 1, 4), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 3, 5), DType::F32, &device).unwrap();
        assert!(matches!(attn.forward(&q, &k), Err(Error::Shape(_))));

        let k2 = Tensor::zeros((3, 2), DType::F32, &device).unwrap();
        assert!(matches!(attn.forward(&q, &k2), Err(Error::Shape(_))));
    }

    /// Scores are divided by sqrt(key_dim) = 2, not sqrt(head_dim) = 1.
    #[test]
    fn scores_scale_with_input_key_width() {
        let device = Device::Cpu;
        let mut ts = HashMap::new();
        // query_dim=1, key_dim=4, num_units=2, num_heads=2 → head_dim=1
        ts.insert(
            "W_query.weight".to_string(),
            Tensor::new(&[[1f32], [1.]], &device).unwrap(),
        );
        ts.insert(
            "W_key.weight".to_string(),
            Tensor::new(&[[1f32, 0., 0., 0.], [1., 0., 0., 0.]], &device).unwrap(),
        );
        ts.insert(
            "W_value.weight".to_string(),
            Tensor::new(&[[1f32, 0., 0., 0.], [2., 0., 0., 0.]], &device).unwrap(),
        );
        let vb = VarBuilder::from_tensors(ts, DType::F32, &device);
        let attn = MultiHeadAttention::new(1, 4, 2, 2, vb).unwrap();

        let q = Tensor::new(&[[[2f32]]], &device).unwrap();
        let k = Tensor::new(&[[[0f32, 0., 0., 0.], [1., 0., 0., 0.]]], &device).unwrap();
        let (out, weights) = attn.forward_with_weights(&q, &k).unwrap();

        // Raw scores per head are [0, 2]; scaled → [0, 1].
        let e = std::f32::consts::E;
        let expected = e / (1.0 + e);
        for h in 0..2 {
            let w = weights.i((0, h, 0, 1)).unwrap().to_scalar::<f32>().unwrap();
            assert!((w - expected).abs() < 1e-5, "head {h}: {w} vs {expected}");
        }

        // Head order is preserved in the concatenation.
        let out = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((out[0] - expected).abs() < 1e-5);
        assert!((out[1] - 2.0 * expected).abs() < 1e-5);
    }

    #[test]
    fn batch_rows_are_independent() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let attn = MultiHeadAttention::new(6, 4, 8, 2, vb).unwrap();

        let q = Tensor::randn(0f32, 1.0, (3, 1, 6), &device).unwrap();
        let k = Tensor::randn(0f32, 1.0, (3, 5, 4), &device).unwrap();
        let out = attn.forward(&q, &k).unwrap();

        let perm = Tensor::new(&[2u32, 0, 1], &device).unwrap();
        let out_perm = attn
            .forward(
                &q.index_select(&perm, 0).unwrap(),
                &k.index_select(&perm, 0).unwrap(),
            )
            .unwrap();
        let expected = out.index_select(&perm, 0).unwrap();
        let diff = (out_perm - expected)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }
}
