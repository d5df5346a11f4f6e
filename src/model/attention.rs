//! Spatial self-attention block.
//!
//! Flattens `[B, C, H, W]` to `[B, C, H·W]`, projects to QKV with a 1×1
//! conv, attends over the spatial positions and adds a projected residual.
//!
//! Two QKV layouts exist in the published checkpoints:
//! - legacy: heads are split first, then Q/K/V (`[B·H, 3·ch, L]`)
//! - split order: Q/K/V are split first, then heads

use candle_core::{DType, Module, Tensor};
use candle_nn::{self as nn, VarBuilder};

use super::blocks::GroupNorm32;
use crate::Result;

/// How the fused QKV projection is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QkvOrder {
    Legacy,
    Split,
}

/// Self-attention over spatial positions.
#[derive(Debug, Clone)]
pub struct AttentionBlock {
    norm: GroupNorm32,
    qkv: nn::Conv1d,
    proj_out: nn::Conv1d,
    num_heads: usize,
    order: QkvOrder,
}

impl AttentionBlock {
    /// `num_head_channels == -1` uses `num_heads`; otherwise the head count
    /// is `channels / num_head_channels`.
    pub fn load(
        vb: VarBuilder,
        channels: usize,
        num_heads: usize,
        num_head_channels: i64,
        order: QkvOrder,
    ) -> Result<Self> {
        let num_heads = if num_head_channels == -1 {
            num_heads
        } else {
            let head_channels = num_head_channels as usize;
            if head_channels == 0 || channels % head_channels != 0 {
                return Err(crate::Error::Config(format!(
                    "{channels} channels not divisible by num_head_channels {head_channels}"
                )));
            }
            channels / head_channels
        };
        let norm = GroupNorm32::load(vb.pp("norm"), channels)?;
        let qkv = nn::conv1d(channels, channels * 3, 1, Default::default(), vb.pp("qkv"))?;
        let proj_out = nn::conv1d(channels, channels, 1, Default::default(), vb.pp("proj_out"))?;
        Ok(Self {
            norm,
            qkv,
            proj_out,
            num_heads,
            order,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = x.dims4()?;
        let x = x.reshape((b, c, h * w))?;
        let qkv = self.qkv.forward(&self.norm.forward(&x)?)?;
        let attended = self.attend(&qkv)?;
        let out = (x + self.proj_out.forward(&attended)?)?;
        Ok(out.reshape((b, c, h, w))?)
    }

    /// `[B, 3·H·ch, L]` → `[B, H·ch, L]`.
    fn attend(&self, qkv: &Tensor) -> Result<Tensor> {
        let (bs, width, length) = qkv.dims3()?;
        let heads = self.num_heads;
        let ch = width / (3 * heads);

        let (q, k, v) = match self.order {
            QkvOrder::Legacy => {
                let qkv = qkv.reshape((bs * heads, ch * 3, length))?;
                (
                    qkv.narrow(1, 0, ch)?,
                    qkv.narrow(1, ch, ch)?,
                    qkv.narrow(1, 2 * ch, ch)?,
                )
            }
            QkvOrder::Split => {
                let inner = heads * ch;
                let split = |i: usize| -> Result<Tensor> {
                    Ok(qkv
                        .narrow(1, i * inner, inner)?
                        .contiguous()?
                        .reshape((bs * heads, ch, length))?)
                };
                (split(0)?, split(1)?, split(2)?)
            }
        };

        // ch^-1/4 on each side, ch^-1/2 overall.
        let scale = 1.0 / (ch as f64).sqrt().sqrt();
        let q = (q * scale)?;
        let k = (k * scale)?;

        // weight[b, t, s] = Σ_c q[b, c, t] · k[b, c, s]
        let weight = q.transpose(1, 2)?.contiguous()?.matmul(&k.contiguous()?)?;
        let weight = candle_nn::ops::softmax_last_dim(&weight.to_dtype(DType::F32)?)?
            .to_dtype(qkv.dtype())?;

        // a[b, c, t] = Σ_s weight[b, t, s] · v[b, c, s]
        let a = v
            .contiguous()?
            .matmul(&weight.transpose(1, 2)?.contiguous()?)?;
        Ok(a.reshape((bs, heads * ch, length))?)
    }
}
