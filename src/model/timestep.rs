//! Sinusoidal timestep embedding for diffusion conditioning.
//!
//! `t → [cos(t·f_i), sin(t·f_i)] → Linear → SiLU → Linear`, with
//! `f_i = exp(-ln(10000) · i / half)`.

use candle_core::{D, DType, Tensor};
use candle_nn::{self as nn, Module, VarBuilder};

use crate::Result;

/// Default maximum period of the sinusoids.
pub const MAX_PERIOD: f64 = 10000.0;

/// Sinusoidal embedding of `[B]` timesteps into `[B, dim]`.
///
/// An odd `dim` gets a trailing zero column.
pub fn timestep_embedding(timesteps: &Tensor, dim: usize, max_period: f64) -> Result<Tensor> {
    let dev = timesteps.device();
    let half = dim / 2;
    let freqs: Vec<f32> = (0..half)
        .map(|i| (-(max_period.ln()) * i as f64 / half as f64).exp() as f32)
        .collect();
    let freqs = Tensor::new(freqs.as_slice(), dev)?;

    // args = t[:, None] * freqs[None, :]
    let args = timesteps
        .to_dtype(DType::F32)?
        .unsqueeze(1)?
        .broadcast_mul(&freqs.unsqueeze(0)?)?;
    let emb = Tensor::cat(&[&args.cos()?, &args.sin()?], D::Minus1)?;
    if dim % 2 == 1 {
        let pad = Tensor::zeros((emb.dim(0)?, 1), DType::F32, dev)?;
        return Ok(Tensor::cat(&[&emb, &pad], D::Minus1)?);
    }
    Ok(emb)
}

/// `time_embed`: two linears around a SiLU, `model_channels → 4·model_channels`.
#[derive(Debug, Clone)]
pub struct TimeEmbed {
    linear_1: nn::Linear,
    linear_2: nn::Linear,
    model_channels: usize,
}

impl TimeEmbed {
    pub fn load(vb: VarBuilder, model_channels: usize, time_embed_dim: usize) -> Result<Self> {
        let linear_1 = nn::linear(model_channels, time_embed_dim, vb.pp("0"))?;
        let linear_2 = nn::linear(time_embed_dim, time_embed_dim, vb.pp("2"))?;
        Ok(Self {
            linear_1,
            linear_2,
            model_channels,
        })
    }

    /// `[B]` timesteps → `[B, time_embed_dim]`.
    pub fn forward(&self, timesteps: &Tensor) -> Result<Tensor> {
        let emb = timestep_embedding(timesteps, self.model_channels, MAX_PERIOD)?;
        let emb = self.linear_1.forward(&emb)?.silu()?;
        Ok(self.linear_2.forward(&emb)?)
    }
}
