//! Configuration for the ADM UNet, the diffusion schedule and the purifier.
//!
//! Field names and defaults match `guided_diffusion.script_util`'s
//! `model_and_diffusion_defaults()`. [`UNetConfig::imagenet_256_uncond`] and
//! [`DiffusionConfig::imagenet_256_uncond`] reproduce the settings used with
//! the public `256x256_diffusion_uncond.pt` checkpoint.

use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Number of ImageNet classes for class-conditional checkpoints.
pub const NUM_CLASSES: usize = 1000;

// ---------------------------------------------------------------------------
// UNet
// ---------------------------------------------------------------------------

/// ADM UNet hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UNetConfig {
    pub image_size: usize,
    pub in_channels: usize,
    /// Base channel count (`model_channels` in the UNet).
    pub num_channels: usize,
    pub num_res_blocks: usize,
    pub num_heads: usize,
    /// Heads in the decoder attention blocks; `-1` means `num_heads`.
    pub num_heads_upsample: i64,
    /// Channels per head; `-1` means "use `num_heads`".
    pub num_head_channels: i64,
    /// Comma separated resolutions at which attention is applied.
    pub attention_resolutions: String,
    /// Comma separated channel multipliers; empty derives them from `image_size`.
    pub channel_mult: String,
    /// Training-only; ignored at inference.
    pub dropout: f64,
    pub class_cond: bool,
    /// Gradient checkpointing; training-only, ignored.
    pub use_checkpoint: bool,
    pub use_scale_shift_norm: bool,
    pub resblock_updown: bool,
    pub use_fp16: bool,
    pub use_new_attention_order: bool,
    pub learn_sigma: bool,
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            image_size: 64,
            in_channels: 3,
            num_channels: 128,
            num_res_blocks: 2,
            num_heads: 4,
            num_heads_upsample: -1,
            num_head_channels: -1,
            attention_resolutions: "16,8".to_string(),
            channel_mult: String::new(),
            dropout: 0.0,
            class_cond: false,
            use_checkpoint: false,
            use_scale_shift_norm: true,
            resblock_updown: false,
            use_fp16: false,
            use_new_attention_order: false,
            learn_sigma: false,
        }
    }
}

impl UNetConfig {
    /// Unconditional 256×256 ImageNet model.
    pub fn imagenet_256_uncond() -> Self {
        Self {
            image_size: 256,
            num_channels: 256,
            num_res_blocks: 2,
            num_heads: 4,
            num_heads_upsample: -1,
            num_head_channels: 64,
            attention_resolutions: "32,16,8".to_string(),
            channel_mult: String::new(),
            dropout: 0.0,
            class_cond: false,
            use_checkpoint: false,
            use_scale_shift_norm: true,
            resblock_updown: true,
            use_fp16: false,
            use_new_attention_order: false,
            learn_sigma: true,
            ..Self::default()
        }
    }

    /// Output channels: doubled when the model also predicts the variance.
    pub fn out_channels(&self) -> usize {
        if self.learn_sigma {
            self.in_channels * 2
        } else {
            self.in_channels
        }
    }

    /// Number of classes for the label embedding, if class conditional.
    pub fn num_classes(&self) -> Option<usize> {
        self.class_cond.then_some(NUM_CLASSES)
    }

    /// Effective head count for decoder attention blocks.
    pub fn heads_upsample(&self) -> usize {
        if self.num_heads_upsample < 0 {
            self.num_heads
        } else {
            self.num_heads_upsample as usize
        }
    }

    /// Channel multipliers per resolution level.
    pub fn channel_multipliers(&self) -> Result<Vec<f64>> {
        if self.channel_mult.trim().is_empty() {
            return match self.image_size {
                512 => Ok(vec![0.5, 1.0, 1.0, 2.0, 2.0, 4.0, 4.0]),
                256 => Ok(vec![1.0, 1.0, 2.0, 2.0, 4.0, 4.0]),
                128 => Ok(vec![1.0, 1.0, 2.0, 3.0, 4.0]),
                64 => Ok(vec![1.0, 2.0, 3.0, 4.0]),
                other => Err(Error::Config(format!(
                    "no default channel_mult for image size {other}"
                ))),
            };
        }
        self.channel_mult
            .split(',')
            .map(|m| {
                m.trim()
                    .parse::<f64>()
                    .map_err(|e| Error::Config(format!("channel_mult entry {m:?}: {e}")))
            })
            .collect()
    }

    /// Downsample factors (`image_size / resolution`) at which attention is used.
    pub fn attention_downsample_rates(&self) -> Result<Vec<usize>> {
        if self.attention_resolutions.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.attention_resolutions
            .split(',')
            .map(|r| {
                let res = r.trim().parse::<usize>().map_err(|e| {
                    Error::Config(format!("attention_resolutions entry {r:?}: {e}"))
                })?;
                if res == 0 || self.image_size % res != 0 {
                    return Err(Error::Config(format!(
                        "attention resolution {res} does not divide image size {}",
                        self.image_size
                    )));
                }
                Ok(self.image_size / res)
            })
            .collect()
    }

    /// Reject settings this implementation cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.use_fp16 {
            return Err(Error::Config(
                "use_fp16 is not supported; convert the checkpoint to f32".into(),
            ));
        }
        if self.num_head_channels == -1 && self.num_heads == 0 {
            return Err(Error::Config(
                "either num_heads or num_head_channels must be set".into(),
            ));
        }
        let mults = self.channel_multipliers()?;
        if mults.is_empty() {
            return Err(Error::Config("channel_mult is empty".into()));
        }
        self.attention_downsample_rates()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Diffusion
// ---------------------------------------------------------------------------

/// Named beta schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseSchedule {
    #[default]
    Linear,
    Cosine,
}

/// Gaussian diffusion hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionConfig {
    pub diffusion_steps: usize,
    pub noise_schedule: NoiseSchedule,
    /// `None` or `""` keeps every step; `"ddimN"` or `"a,b,c"` respaces.
    pub timestep_respacing: Option<String>,
    pub learn_sigma: bool,
    /// With fixed variance, use the posterior variance instead of beta.
    pub sigma_small: bool,
    pub predict_xstart: bool,
    pub rescale_timesteps: bool,
    pub clip_denoised: bool,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            diffusion_steps: 1000,
            noise_schedule: NoiseSchedule::Linear,
            timestep_respacing: None,
            learn_sigma: false,
            sigma_small: false,
            predict_xstart: false,
            rescale_timesteps: false,
            clip_denoised: true,
        }
    }
}

impl DiffusionConfig {
    /// Schedule paired with [`UNetConfig::imagenet_256_uncond`].
    pub fn imagenet_256_uncond() -> Self {
        Self {
            diffusion_steps: 1000,
            noise_schedule: NoiseSchedule::Linear,
            timestep_respacing: None,
            learn_sigma: true,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// Where tensors and weights live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceSpec {
    /// CUDA 0 when compiled in and present, otherwise CPU.
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceSpec {
    /// Parse `auto`, `cpu`, `cuda`, `cuda:N`, `metal`, `metal:N`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match s.split_once(':') {
            Some((kind, n)) => {
                let n = n
                    .parse::<usize>()
                    .map_err(|e| Error::Config(format!("device ordinal {n:?}: {e}")))?;
                (kind.to_string(), n)
            }
            None => (s.clone(), 0),
        };
        match kind.as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(ordinal)),
            "metal" => Ok(Self::Metal(ordinal)),
            other => Err(Error::Config(format!("unknown device {other:?}"))),
        }
    }

    /// Open the device.
    pub fn open(self) -> Result<Device> {
        Ok(match self {
            Self::Auto => Device::cuda_if_available(0).unwrap_or(Device::Cpu),
            Self::Cpu => Device::Cpu,
            Self::Cuda(n) => Device::new_cuda(n)?,
            Self::Metal(n) => Device::new_metal(n)?,
        })
    }
}

impl std::fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(n) => write!(f, "cuda:{n}"),
            Self::Metal(n) => write!(f, "metal:{n}"),
        }
    }
}

impl Serialize for DeviceSpec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceSpec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Purifier
// ---------------------------------------------------------------------------

/// Everything needed to build a [`crate::purifier::DiffusionPurifier`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurifierConfig {
    #[serde(default = "default_checkpoint")]
    pub checkpoint: PathBuf,

    /// Written with the unguided first-pass reconstruction on every call.
    #[serde(default = "default_no_guide_output")]
    pub no_guide_output: PathBuf,

    /// Written with the purified result on every call.
    #[serde(default = "default_guide_output")]
    pub guide_output: PathBuf,

    #[serde(default)]
    pub device: DeviceSpec,

    /// Seed for the schedule's noise RNG; random when absent.
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default = "UNetConfig::imagenet_256_uncond")]
    pub unet: UNetConfig,

    #[serde(default = "DiffusionConfig::imagenet_256_uncond")]
    pub diffusion: DiffusionConfig,
}

fn default_checkpoint() -> PathBuf {
    PathBuf::from("256x256_diffusion_uncond.pt")
}

fn default_no_guide_output() -> PathBuf {
    PathBuf::from("./no_guide_sample.png")
}

fn default_guide_output() -> PathBuf {
    PathBuf::from("./guide_sample.png")
}

impl Default for PurifierConfig {
    fn default() -> Self {
        Self {
            checkpoint: default_checkpoint(),
            no_guide_output: default_no_guide_output(),
            guide_output: default_guide_output(),
            device: DeviceSpec::default(),
            seed: None,
            unet: UNetConfig::imagenet_256_uncond(),
            diffusion: DiffusionConfig::imagenet_256_uncond(),
        }
    }
}

impl PurifierConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Put both debug images under `dir`, keeping their file names.
    pub fn with_output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        for path in [&mut self.no_guide_output, &mut self.guide_output] {
            if let Some(name) = path.file_name() {
                *path = dir.join(name);
            }
        }
        self
    }

    /// Check that the UNet and the schedule agree and can be built.
    pub fn validate(&self) -> Result<()> {
        self.unet.validate()?;
        if self.unet.learn_sigma != self.diffusion.learn_sigma {
            return Err(Error::Config(format!(
                "learn_sigma mismatch: unet={}, diffusion={}",
                self.unet.learn_sigma, self.diffusion.learn_sigma
            )));
        }
        Ok(())
    }
}
