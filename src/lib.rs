//! Diffusion-guided image purification in pure Rust.
//!
//! A candle-based implementation of the ADM ("guided diffusion") UNet and
//! DDPM sampler, used to wash perturbations out of an image: noise it to a
//! chosen timestep, then denoise it while steering toward an unguided
//! reconstruction. Loads the published PyTorch checkpoints directly.
//!
//! ## Architecture
//!
//! ```text
//! image ──load_image──▶ [B, 3, H, W] in [-1, 1]
//!                            ↓
//!              q_sample (forward noising to t)
//!                            ↓
//!        p_sample → x_pre (unguided reconstruction)
//!                            ↓
//!     guidance gradient 2(x_t - x_0_t) → guided reverse step
//!                            ↓
//!              p_sample → purified image
//! ```
//!
//! ## Modules
//!
//! - [`config`]: UNet, diffusion and purifier configuration with presets
//! - [`model`]: the ADM UNet and checkpoint loading
//! - [`diffusion`]: beta schedules, respacing, `GaussianDiffusion`
//! - [`guidance`]: scoped gradient context and the guidance gradient
//! - [`imaging`]: PNG/JPEG I/O and batch grids
//! - [`purifier`]: the end-to-end purification step

pub mod config;
pub mod diffusion;
pub mod guidance;
pub mod imaging;
pub mod model;
pub mod purifier;

mod error;

pub use error::{Error, Result};
