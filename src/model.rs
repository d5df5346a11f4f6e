//! ADM ("guided diffusion") UNet.
//!
//! ## Components
//!
//! - [`timestep`]: sinusoidal timestep embedding + MLP
//! - [`blocks`]: GroupNorm32, ResBlock (scale-shift norm, up/down), resamplers
//! - [`attention`]: spatial self-attention with legacy or split QKV order
//! - [`unet`]: the encoder / middle / decoder stack
//!
//! Parameter names match the PyTorch `state_dict` so the published
//! checkpoints load without renaming.

pub mod attention;
pub mod blocks;
pub mod timestep;
pub mod unet;

use candle_core::Tensor;

use crate::Result;

pub use unet::UNetModel;

/// A network predicting the reverse-process parameters from `(x_t, t)`.
///
/// `timesteps` is a `[B]` f32 tensor of (possibly rescaled) training
/// timesteps. The output has `C` channels for the mean parameterization,
/// or `2C` when the variance is learned.
pub trait DenoiseModel {
    fn forward(&self, x: &Tensor, timesteps: &Tensor) -> Result<Tensor>;
}

impl<M: DenoiseModel + ?Sized> DenoiseModel for Box<M> {
    fn forward(&self, x: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        (**self).forward(x, timesteps)
    }
}
