//! UNet building blocks: normalization, resamplers and the residual block.
//!
//! ```text
//! ResBlock(x, emb):
//!   h = conv3x3(SiLU(GN(x)))                 (resampled between SiLU and conv when up/down)
//!   scale, shift = Linear(SiLU(emb)).chunk(2)
//!   h = conv3x3(SiLU(GN(h) · (1 + scale) + shift))
//!   return skip(x) + h
//! ```

use candle_core::{DType, Module, Tensor};
use candle_nn::{self as nn, VarBuilder};

use crate::Result;

/// Groups used by every normalization layer.
pub const NORM_GROUPS: usize = 32;
const NORM_EPS: f64 = 1e-5;

fn conv3x3(vb: VarBuilder, in_channels: usize, out_channels: usize, stride: usize) -> Result<nn::Conv2d> {
    let cfg = nn::Conv2dConfig {
        padding: 1,
        stride,
        ..Default::default()
    };
    Ok(nn::conv2d(in_channels, out_channels, 3, cfg, vb)?)
}

// ---------------------------------------------------------------------------
// GroupNorm32
// ---------------------------------------------------------------------------

/// GroupNorm(32) evaluated in f32 regardless of the activation dtype.
#[derive(Debug, Clone)]
pub struct GroupNorm32 {
    inner: nn::GroupNorm,
}

impl GroupNorm32 {
    pub fn load(vb: VarBuilder, channels: usize) -> Result<Self> {
        let inner = nn::group_norm(NORM_GROUPS, channels, NORM_EPS, vb)?;
        Ok(Self { inner })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let out = self.inner.forward(&x.to_dtype(DType::F32)?)?;
        Ok(out.to_dtype(x.dtype())?)
    }
}

// ---------------------------------------------------------------------------
// Upsample / Downsample
// ---------------------------------------------------------------------------

/// Nearest-neighbour 2× upsampling, optionally followed by a 3×3 conv.
#[derive(Debug, Clone)]
pub struct Upsample {
    conv: Option<nn::Conv2d>,
}

impl Upsample {
    pub fn load(vb: VarBuilder, channels: usize, use_conv: bool, out_channels: usize) -> Result<Self> {
        let conv = if use_conv {
            Some(conv3x3(vb.pp("conv"), channels, out_channels, 1)?)
        } else {
            None
        };
        Ok(Self { conv })
    }

    /// Parameter-free variant used inside up-sampling ResBlocks.
    pub fn plain() -> Self {
        Self { conv: None }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_b, _c, h, w) = x.dims4()?;
        let x = x.upsample_nearest2d(h * 2, w * 2)?;
        match &self.conv {
            Some(conv) => Ok(conv.forward(&x)?),
            None => Ok(x),
        }
    }
}

/// 2× downsampling: strided 3×3 conv, or 2×2 average pooling.
#[derive(Debug, Clone)]
pub struct Downsample {
    op: Option<nn::Conv2d>,
}

impl Downsample {
    pub fn load(vb: VarBuilder, channels: usize, use_conv: bool, out_channels: usize) -> Result<Self> {
        let op = if use_conv {
            Some(conv3x3(vb.pp("op"), channels, out_channels, 2)?)
        } else {
            None
        };
        Ok(Self { op })
    }

    /// Parameter-free variant used inside down-sampling ResBlocks.
    pub fn plain() -> Self {
        Self { op: None }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match &self.op {
            Some(op) => Ok(op.forward(x)?),
            None => Ok(x.avg_pool2d(2)?),
        }
    }
}

// ---------------------------------------------------------------------------
// ResBlock
// ---------------------------------------------------------------------------

/// Resolution change applied inside a ResBlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resample {
    None,
    Up,
    Down,
}

#[derive(Debug, Clone)]
enum ResampleOp {
    Up(Upsample),
    Down(Downsample),
}

impl ResampleOp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Up(up) => up.forward(x),
            Self::Down(down) => down.forward(x),
        }
    }
}

/// Construction parameters for [`ResBlock`].
#[derive(Debug, Clone, Copy)]
pub struct ResBlockConfig {
    pub channels: usize,
    pub emb_channels: usize,
    pub out_channels: usize,
    pub use_scale_shift_norm: bool,
    pub resample: Resample,
}

/// Residual block conditioned on the timestep embedding.
#[derive(Debug, Clone)]
pub struct ResBlock {
    in_norm: GroupNorm32,
    in_conv: nn::Conv2d,
    resample: Option<ResampleOp>,
    emb_linear: nn::Linear,
    out_norm: GroupNorm32,
    out_conv: nn::Conv2d,
    skip: Option<nn::Conv2d>,
    use_scale_shift_norm: bool,
}

impl ResBlock {
    pub fn load(vb: VarBuilder, cfg: ResBlockConfig) -> Result<Self> {
        let in_norm = GroupNorm32::load(vb.pp("in_layers.0"), cfg.channels)?;
        let in_conv = conv3x3(vb.pp("in_layers.2"), cfg.channels, cfg.out_channels, 1)?;
        let resample = match cfg.resample {
            Resample::None => None,
            Resample::Up => Some(ResampleOp::Up(Upsample::plain())),
            Resample::Down => Some(ResampleOp::Down(Downsample::plain())),
        };
        let emb_out = if cfg.use_scale_shift_norm {
            2 * cfg.out_channels
        } else {
            cfg.out_channels
        };
        let emb_linear = nn::linear(cfg.emb_channels, emb_out, vb.pp("emb_layers.1"))?;
        let out_norm = GroupNorm32::load(vb.pp("out_layers.0"), cfg.out_channels)?;
        let out_conv = conv3x3(vb.pp("out_layers.3"), cfg.out_channels, cfg.out_channels, 1)?;
        let skip = if cfg.out_channels == cfg.channels {
            None
        } else {
            Some(nn::conv2d(
                cfg.channels,
                cfg.out_channels,
                1,
                Default::default(),
                vb.pp("skip_connection"),
            )?)
        };
        Ok(Self {
            in_norm,
            in_conv,
            resample,
            emb_linear,
            out_norm,
            out_conv,
            skip,
            use_scale_shift_norm: cfg.use_scale_shift_norm,
        })
    }

    /// `x`: `[B, C, H, W]`, `emb`: `[B, E]`.
    pub fn forward(&self, x: &Tensor, emb: &Tensor) -> Result<Tensor> {
        let h = self.in_norm.forward(x)?.silu()?;
        let (h, x) = match &self.resample {
            Some(op) => (op.forward(&h)?, op.forward(x)?),
            None => (h, x.clone()),
        };
        let h = self.in_conv.forward(&h)?;

        // [B, E'] → [B, E', 1, 1]
        let emb_out = self
            .emb_linear
            .forward(&emb.silu()?)?
            .to_dtype(h.dtype())?
            .unsqueeze(2)?
            .unsqueeze(3)?;

        let h = if self.use_scale_shift_norm {
            let parts = emb_out.chunk(2, 1)?;
            let (scale, shift) = (&parts[0], &parts[1]);
            self.out_norm
                .forward(&h)?
                .broadcast_mul(&(scale + 1.0)?)?
                .broadcast_add(shift)?
        } else {
            self.out_norm.forward(&h.broadcast_add(&emb_out)?)?
        };
        // Dropout sits here during training.
        let h = self.out_conv.forward(&h.silu()?)?;

        let x = match &self.skip {
            Some(conv) => conv.forward(&x)?,
            None => x,
        };
        Ok((x + h)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    fn block(resample: Resample, channels: usize, out_channels: usize, scale_shift: bool) -> ResBlockConfig {
        ResBlockConfig {
            channels,
            emb_channels: 16,
            out_channels,
            use_scale_shift_norm: scale_shift,
            resample,
        }
    }

    #[test]
    fn resblock_preserves_shape() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let rb = ResBlock::load(vb, block(Resample::None, 32, 32, true)).unwrap();
        assert!(rb.skip.is_none());
        let x = Tensor::randn(0f32, 1.0, (2, 32, 8, 8), &device).unwrap();
        let emb = Tensor::randn(0f32, 1.0, (2, 16), &device).unwrap();
        assert_eq!(rb.forward(&x, &emb).unwrap().dims(), &[2, 32, 8, 8]);
    }

    #[test]
    fn resblock_changes_channels_through_skip() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let rb = ResBlock::load(vb, block(Resample::None, 32, 64, false)).unwrap();
        assert!(rb.skip.is_some());
        let x = Tensor::randn(0f32, 1.0, (1, 32, 4, 4), &device).unwrap();
        let emb = Tensor::randn(0f32, 1.0, (1, 16), &device).unwrap();
        assert_eq!(rb.forward(&x, &emb).unwrap().dims(), &[1, 64, 4, 4]);
    }

    #[test]
    fn resblock_up_and_down() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let up = ResBlock::load(vb.pp("up"), block(Resample::Up, 32, 32, true)).unwrap();
        let down = ResBlock::load(vb.pp("down"), block(Resample::Down, 32, 32, true)).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 32, 4, 4), &device).unwrap();
        let emb = Tensor::randn(0f32, 1.0, (1, 16), &device).unwrap();
        assert_eq!(up.forward(&x, &emb).unwrap().dims(), &[1, 32, 8, 8]);
        assert_eq!(down.forward(&x, &emb).unwrap().dims(), &[1, 32, 2, 2]);
    }

    #[test]
    fn zero_weights_make_resblock_identity() {
        // out_layers.3 is zero-initialized in training; with zero weights the
        // block reduces to its skip connection.
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let rb = ResBlock::load(vb, block(Resample::None, 32, 32, true)).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 32, 4, 4), &device).unwrap();
        let emb = Tensor::randn(0f32, 1.0, (1, 16), &device).unwrap();
        let out = rb.forward(&x, &emb).unwrap();
        let diff: f32 = (out - &x)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6, "diff={diff}");
    }

    #[test]
    fn resamplers() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let x = Tensor::randn(0f32, 1.0, (1, 32, 8, 8), &device).unwrap();
        let up = Upsample::load(vb.pp("up"), 32, true, 32).unwrap();
        let down = Downsample::load(vb.pp("down"), 32, true, 32).unwrap();
        assert_eq!(up.forward(&x).unwrap().dims(), &[1, 32, 16, 16]);
        assert_eq!(down.forward(&x).unwrap().dims(), &[1, 32, 4, 4]);

        let ones = Tensor::ones((1, 1, 4, 4), DType::F32, &device).unwrap();
        let pooled = Downsample::plain().forward(&ones).unwrap();
        let v: Vec<f32> = pooled.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(v, vec![1.0; 4]);
    }

    #[test]
    fn group_norm_normalizes() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let gn = GroupNorm32::load(vb, 32).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 32, 4, 4), &device)
            .unwrap()
            .affine(5.0, 3.0)
            .unwrap();
        let out = gn.forward(&x).unwrap();
        let mean: f32 = out.mean_all().unwrap().to_scalar().unwrap();
        assert!(mean.abs() < 1e-3, "mean={mean}");
    }
}
