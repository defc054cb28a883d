//! Model components for the GST style encoder.
//!
//! ## Components
//!
//! - [`reference`] — strided conv stack + GRU reference encoder (spectrogram → vector)
//! - [`packed_gru`] — GRU summarizer that honors per-example lengths
//! - [`attention`] — multi-head scaled dot-product attention
//! - [`style_tokens`] — learned token bank and the style token layer
//! - [`gst`] — the full style encoder

pub mod attention;
pub mod gst;
pub mod packed_gru;
pub mod reference;
pub mod style_tokens;

use candle_core::{DType, Tensor};

use crate::{Error, Result};

/// Fail with [`Error::Numeric`] if `xs` holds any NaN or infinity.
///
/// The sum is reduced on the device; the host copy only happens when it is
/// not finite (a NaN/inf input, or an overflowing sum of finite values).
pub(crate) fn ensure_finite(xs: &Tensor, what: &str) -> Result<()> {
    let total = xs.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
    if total.is_finite() {
        return Ok(());
    }
    let values = xs.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    let bad = values.iter().filter(|v| !v.is_finite()).count();
    if bad > 0 {
        return Err(Error::Numeric(format!(
            "{bad} non-finite values after {what}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn finite_check() {
        let dev = Device::Cpu;
        let ok = Tensor::new(&[0.0f32, -1.5, 3.0], &dev).unwrap();
        ensure_finite(&ok, "test").unwrap();

        let bad = Tensor::new(&[0.0f32, f32::NAN, f32::INFINITY], &dev).unwrap();
        match ensure_finite(&bad, "softmax") {
            Err(Error::Numeric(msg)) => assert!(msg.contains("2 non-finite")),
            other => panic!("expected numeric error, got {other:?}"),
        }
    }

    #[test]
    fn overflowing_sum_of_finite_values_passes() {
        let dev = Device::Cpu;
        let big = Tensor::new(&[3.0e38f32, 3.0e38, 3.0e38], &dev).unwrap();
        ensure_finite(&big, "batch norm").unwrap();
    }
}
