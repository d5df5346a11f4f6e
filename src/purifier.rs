//! Diffusion purification.
//!
//! One [`DiffusionPurifier::denoise`] call:
//!
//! ```text
//! x ──q_sample(t)──▶ x_t' ──p_sample──▶ x_pre                     → no_guide_output
//!                                        │
//! ε: x_t = q_sample(x, ε), x_0_t = q_sample(x_pre, ε)
//!    grad = ∂/∂x_t Σ (x_t - x_0_t)²
//!    S = s · sqrt(1 - ᾱ_t) / sqrt(ᾱ_t)
//!    p(x_t) = N(μ, σ²) ──▶ μ - S·σ²·grad + σ·ε'
//!                           ──p_sample──▶ pred_xstart              → guide_output
//! ```
//!
//! The first pass reconstructs a clean estimate without guidance; the second
//! pulls the noised input toward it before the final denoise.

use std::time::Instant;

use candle_core::{Device, Tensor};

use crate::Result;
use crate::config::PurifierConfig;
use crate::diffusion::GaussianDiffusion;
use crate::guidance::{GradContext, guidance_gradient};
use crate::imaging::{save_image, to_unit_range};
use crate::model::{DenoiseModel, UNetModel};

/// A loaded model and schedule applying guided purification.
pub struct DiffusionPurifier {
    model: Box<dyn DenoiseModel>,
    diffusion: GaussianDiffusion,
    config: PurifierConfig,
    device: Device,
    grad: GradContext,
}

impl DiffusionPurifier {
    /// Open the configured device and load the UNet checkpoint.
    pub fn new(config: PurifierConfig) -> Result<Self> {
        config.validate()?;
        let device = config.device.open()?;
        tracing::info!(
            device = ?device,
            checkpoint = %config.checkpoint.display(),
            image_size = config.unet.image_size,
            channels = config.unet.num_channels,
            learn_sigma = config.unet.learn_sigma,
            "loading diffusion purifier"
        );

        let start = Instant::now();
        let model = UNetModel::load(&config.unet, &config.checkpoint, &device)?;
        let diffusion = GaussianDiffusion::from_config(&config.diffusion)?;
        tracing::info!(
            num_timesteps = diffusion.num_timesteps(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "purifier ready"
        );

        Ok(Self::from_parts(Box::new(model), diffusion, config, device))
    }

    /// Assemble a purifier around an already built model and schedule.
    ///
    /// The schedule is reseeded when `config.seed` is set.
    pub fn from_parts(
        model: Box<dyn DenoiseModel>,
        mut diffusion: GaussianDiffusion,
        config: PurifierConfig,
        device: Device,
    ) -> Self {
        if let Some(seed) = config.seed {
            diffusion.seed(seed);
        }
        Self {
            model,
            diffusion,
            config,
            device,
            grad: GradContext::new(),
        }
    }

    pub fn config(&self) -> &PurifierConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn diffusion(&self) -> &GaussianDiffusion {
        &self.diffusion
    }

    pub fn grad_context(&self) -> &GradContext {
        &self.grad
    }

    /// Reset the noise RNG.
    pub fn reseed(&mut self, seed: u64) {
        self.diffusion.seed(seed);
    }

    /// Guidance gradient `2 (x_t - x_0_t)`, obtained by backpropagation.
    pub fn guide(&self, x_t: &Tensor, x_0_t: &Tensor) -> Result<Tensor> {
        guidance_gradient(&self.grad, x_t, x_0_t)
    }

    /// Purify `x` (`[B, C, H, W]` in `[-1, 1]`) at timestep `t` with guidance
    /// scale `s` (absent means no guidance).
    ///
    /// Overwrites the two configured debug images on every call.
    pub fn denoise(&mut self, x: &Tensor, t: usize, s: Option<f64>) -> Result<Tensor> {
        let start = Instant::now();
        let x = x.to_device(&self.device)?;
        let t_batch = vec![t; x.dim(0)?];
        let clip = self.config.diffusion.clip_denoised;

        // Unguided first pass.
        let x_t_ = self.diffusion.q_sample(&x, &t_batch, None)?;
        let x_pre = self
            .diffusion
            .p_sample(&*self.model, &x_t_, &t_batch, clip, None)?
            .pred_xstart;
        save_image(&to_unit_range(&x_pre)?, &self.config.no_guide_output)?;

        // Noise the input and the reconstruction identically.
        let noise = self.diffusion.randn_like(&x)?;
        let x_t = self.diffusion.q_sample(&x, &t_batch, Some(&noise))?;
        let x_0_t = self.diffusion.q_sample(&x_pre, &t_batch, Some(&noise))?;
        let grad = self.guide(&x_t, &x_0_t)?;

        let scale = s.unwrap_or(0.0);
        let scale_factor = (self.diffusion.sqrt_one_minus_alphas_cumprod_at(&x, &t_batch)?
            / self.diffusion.sqrt_alphas_cumprod_at(&x, &t_batch)?)?
            .affine(scale, 0.0)?;

        let out = self
            .diffusion
            .p_mean_variance(&*self.model, &x_t, &t_batch, clip, None)?;
        let step_noise = self.diffusion.randn_like(&x)?;
        let sample = guided_sample(&out.mean, &out.log_variance, &grad, &scale_factor, &step_noise)?;

        let result = self
            .diffusion
            .p_sample(&*self.model, &sample, &t_batch, clip, None)?
            .pred_xstart;
        save_image(&to_unit_range(&result)?, &self.config.guide_output)?;

        tracing::debug!(
            timestep = t,
            scale,
            batch = t_batch.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "denoised"
        );
        Ok(result)
    }
}

/// `mean - S·exp(log_var)·grad + exp(log_var / 2)·noise`.
pub fn guided_sample(
    mean: &Tensor,
    log_variance: &Tensor,
    grad: &Tensor,
    scale_factor: &Tensor,
    noise: &Tensor,
) -> Result<Tensor> {
    let shift = scale_factor
        .broadcast_mul(&log_variance.exp()?)?
        .broadcast_mul(grad)?;
    let std = (log_variance * 0.5)?.exp()?;
    Ok(((mean - shift)? + std.broadcast_mul(noise)?)?)
}
