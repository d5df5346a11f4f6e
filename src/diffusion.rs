//! Gaussian diffusion (DDPM) forward and reverse processes.
//!
//! - [`betas`]: named beta schedules (linear, cosine)
//! - [`spacing`]: timestep respacing (`"ddimN"` and per-section counts)
//! - [`gaussian`]: [`GaussianDiffusion`]: `q_sample`, `p_mean_variance`,
//!   `p_sample`, `p_sample_loop`
//!
//! ## Formulation
//!
//! Forward: `x_t = sqrt(ᾱ_t) · x_0 + sqrt(1 - ᾱ_t) · ε`
//!
//! Reverse: `p(x_{t-1} | x_t) = N(μ_θ(x_t, t), Σ_θ(x_t, t))`, with the mean
//! taken from the posterior `q(x_{t-1} | x_t, x̂_0)` of the model's predicted
//! clean image.

pub mod betas;
pub mod gaussian;
pub mod spacing;

use serde::{Deserialize, Serialize};

use crate::config::DiffusionConfig;

pub use betas::{betas_for_alpha_bar, named_beta_schedule};
pub use gaussian::{GaussianDiffusion, MeanVariance, Posterior, SampleOutput};
pub use spacing::space_timesteps;

/// What the model's (first `C` output channels) predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelMeanType {
    /// `x_{t-1}`
    PreviousX,
    /// `x_0`
    StartX,
    /// The noise `ε`.
    #[default]
    Epsilon,
}

/// How the reverse-process variance is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVarType {
    /// Model outputs the log-variance directly.
    Learned,
    /// Posterior variance β̃_t.
    FixedSmall,
    /// β_t (with β̃_1 at t = 0).
    #[default]
    FixedLarge,
    /// Model outputs `v ∈ [-1, 1]` interpolating between log β̃_t and log β_t.
    LearnedRange,
}

impl DiffusionConfig {
    /// Mean parameterization implied by the config.
    pub fn mean_type(&self) -> ModelMeanType {
        if self.predict_xstart {
            ModelMeanType::StartX
        } else {
            ModelMeanType::Epsilon
        }
    }

    /// Variance parameterization implied by the config.
    pub fn var_type(&self) -> ModelVarType {
        match (self.learn_sigma, self.sigma_small) {
            (true, _) => ModelVarType::LearnedRange,
            (false, true) => ModelVarType::FixedSmall,
            (false, false) => ModelVarType::FixedLarge,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imagenet_preset_types() {
        let cfg = DiffusionConfig::imagenet_256_uncond();
        assert_eq!(cfg.mean_type(), ModelMeanType::Epsilon);
        assert_eq!(cfg.var_type(), ModelVarType::LearnedRange);
    }

    #[test]
    fn fixed_variance_types() {
        let small = DiffusionConfig {
            sigma_small: true,
            ..Default::default()
        };
        assert_eq!(small.var_type(), ModelVarType::FixedSmall);
        assert_eq!(DiffusionConfig::default().var_type(), ModelVarType::FixedLarge);

        let xstart = DiffusionConfig {
            predict_xstart: true,
            ..Default::default()
        };
        assert_eq!(xstart.mean_type(), ModelMeanType::StartX);
    }
}
