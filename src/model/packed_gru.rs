//! Length-aware GRU summarizer.
//!
//! Runs a single-layer GRU over `[N, T, D]` and keeps only the final hidden
//! state of every sequence. With per-example lengths the batch is sorted by
//! length (descending), each timestep only advances the prefix of sequences
//! still active, and the final states are scattered back to batch order. The
//! batch does not need to be sorted on input.

use candle_core::{IndexOp, Tensor};
use candle_nn::rnn::{GRUConfig, GRUState, RNN};
use candle_nn::{GRU, VarBuilder};

use crate::{Error, Result};

/// GRU returning one hidden state per sequence.
#[derive(Debug, Clone)]
pub struct PackedGru {
    gru: GRU,
    input_size: usize,
    hidden_size: usize,
}

impl PackedGru {
    /// Weights follow the PyTorch layout: `weight_ih_l0`, `weight_hh_l0`,
    /// `bias_ih_l0`, `bias_hh_l0`.
    pub fn new(input_size: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let gru = candle_nn::gru(input_size, hidden_size, GRUConfig::default(), vb)?;
        Ok(Self {
            gru,
            input_size,
            hidden_size,
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Final hidden state for each sequence.
    ///
    /// - `xs`: `[N, T, input_size]`
    /// - `lengths`: valid steps per example, each in `1..=T`. `None` runs all
    ///   `T` steps for every example.
    ///
    /// Returns `[N, hidden_size]`.
    pub fn forward(&self, xs: &Tensor, lengths: Option<&[usize]>) -> Result<Tensor> {
        let (batch, seq_len, input_size) = xs.dims3()?;
        if input_size != self.input_size {
            return Err(Error::Shape(format!(
                "GRU expects {} input features, got {input_size}",
                self.input_size
            )));
        }
        if batch == 0 {
            return Err(Error::Shape("GRU input batch is empty".into()));
        }

        let Some(lengths) = lengths else {
            let mut state = self.gru.zero_state(batch)?;
            for t in 0..seq_len {
                let x_t = xs.i((.., t, ..))?.contiguous()?;
                state = self.gru.step(&x_t, &state)?;
            }
            return Ok(state.h().clone());
        };

        if lengths.len() != batch {
            return Err(Error::Shape(format!(
                "{} lengths given for a batch of {batch}",
                lengths.len()
            )));
        }
        if let Some(&bad) = lengths.iter().find(|&&l| l == 0 || l > seq_len) {
            return Err(Error::Shape(format!(
                "sequence length {bad} outside 1..={seq_len}"
            )));
        }

        // Stable sort keeps equal-length examples in batch order.
        let mut order: Vec<usize> = (0..batch).collect();
        order.sort_by(|&a, &b| lengths[b].cmp(&lengths[a]));
        let sorted_lengths: Vec<usize> = order.iter().map(|&i| lengths[i]).collect();

        let dev = xs.device();
        let order_idx: Vec<u32> = order.iter().map(|&i| i as u32).collect();
        let order_idx = Tensor::new(order_idx.as_slice(), dev)?;
        let xs = xs.index_select(&order_idx, 0)?;

        let mut h = self.gru.zero_state(batch)?.h().clone();
        for t in 0..sorted_lengths[0] {
            let active = sorted_lengths.iter().take_while(|&&l| l > t).count();
            let x_t = xs.i((..active, t, ..))?.contiguous()?;
            let prev = GRUState {
                h: h.narrow(0, 0, active)?,
            };
            let next = self.gru.step(&x_t, &prev)?;
            h = if active < batch {
                let done = h.narrow(0, active, batch - active)?;
                Tensor::cat(&[next.h(), &done], 0)?
            } else {
                next.h().clone()
            };
        }

        // Inverse permutation: sorted position of each original example.
        let mut inverse = vec![0u32; batch];
        for (sorted_pos, &orig) in order.iter().enumerate() {
            inverse[orig] = sorted_pos as u32;
        }
        let inverse = Tensor::new(inverse.as_slice(), dev)?;
        Ok(h.index_select(&inverse, 0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn output_is_final_state() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let gru = PackedGru::new(4, 6, vb).unwrap();

        let xs = Tensor::randn(0f32, 1.0, (2, 7, 4), &dev).unwrap();
        let out = gru.forward(&xs, None).unwrap();
        assert_eq!(out.dims(), &[2, 6]);
    }

    #[test]
    fn unsorted_lengths_match_truncated_runs() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let gru = PackedGru::new(4, 5, vb).unwrap();

        let xs = Tensor::randn(0f32, 1.0, (3, 6, 4), &dev).unwrap();
        let lengths = [2usize, 6, 3];
        let packed = gru.forward(&xs, Some(&lengths)).unwrap();

        for (i, &len) in lengths.iter().enumerate() {
            let single = xs.narrow(0, i, 1).unwrap().narrow(1, 0, len).unwrap();
            let expected = gru.forward(&single, None).unwrap();
            let got = packed.narrow(0, i, 1).unwrap();
            assert!(
                max_abs_diff(&got, &expected) < 1e-5,
                "example {i} (len {len}) diverged from its truncated run"
            );
        }
    }

    #[test]
    fn full_lengths_equal_unpacked() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let gru = PackedGru::new(3, 4, vb).unwrap();

        let xs = Tensor::randn(0f32, 1.0, (2, 5, 3), &dev).unwrap();
        let a = gru.forward(&xs, None).unwrap();
        let b = gru.forward(&xs, Some(&[5, 5])).unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-6);
    }

    #[test]
    fn rejects_bad_lengths() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let gru = PackedGru::new(3, 4, vb).unwrap();
        let xs = Tensor::zeros((2, 5, 3), DType::F32, &dev).unwrap();

        assert!(matches!(gru.forward(&xs, Some(&[5])), Err(Error::Shape(_))));
        assert!(matches!(
            gru.forward(&xs, Some(&[0, 5])),
            Err(Error::Shape(_))
        ));
        assert!(matches!(
            gru.forward(&xs, Some(&[6, 5])),
            Err(Error::Shape(_))
        ));

        let empty = Tensor::zeros((0, 5, 3), DType::F32, &dev).unwrap();
        assert!(matches!(gru.forward(&empty, Some(&[])), Err(Error::Shape(_))));
        assert!(matches!(gru.forward(&empty, None), Err(Error::Shape(_))));
    }
}
