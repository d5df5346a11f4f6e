//! The ADM UNet.
//!
//! ## Architecture (256×256 unconditional preset)
//!
//! ```text
//! [B, 3, 256, 256] ─→ conv3x3(3, 256)                         input_blocks.0
//!   ─→ per level (mult 1,1,2,2,4,4):
//!        2× ResBlock (+ Attention at 32², 16², 8²)            input_blocks.1..
//!        down-ResBlock between levels
//!   ─→ ResBlock, Attention, ResBlock                          middle_block
//!   ─→ per level, reversed: 3× ResBlock(cat skip)
//!        (+ Attention) + up-ResBlock                          output_blocks
//!   ─→ GN + SiLU + conv3x3(256, 6)                            out
//! ```
//!
//! Timesteps go through the sinusoidal embedding and `time_embed` MLP and
//! condition every ResBlock.

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{self as nn, VarBuilder};

use super::DenoiseModel;
use super::attention::{AttentionBlock, QkvOrder};
use super::blocks::{Downsample, GroupNorm32, ResBlock, ResBlockConfig, Resample, Upsample};
use super::timestep::TimeEmbed;
use crate::config::UNetConfig;
use crate::{Error, Result};

/// One layer of a `TimestepEmbedSequential`.
#[derive(Debug, Clone)]
enum Layer {
    Conv(nn::Conv2d),
    Res(ResBlock),
    Attn(AttentionBlock),
    Up(Upsample),
    Down(Downsample),
}

/// Layers applied in order; ResBlocks also receive the embedding.
#[derive(Debug, Clone)]
struct EmbedSequential {
    layers: Vec<Layer>,
}

impl EmbedSequential {
    fn forward(&self, x: &Tensor, emb: &Tensor) -> Result<Tensor> {
        let mut h = x.clone();
        for layer in &self.layers {
            h = match layer {
                Layer::Conv(conv) => conv.forward(&h)?,
                Layer::Res(block) => block.forward(&h, emb)?,
                Layer::Attn(block) => block.forward(&h)?,
                Layer::Up(up) => up.forward(&h)?,
                Layer::Down(down) => down.forward(&h)?,
            };
        }
        Ok(h)
    }
}

/// ADM UNet predicting `ε` (and the variance interpolation when
/// `learn_sigma`).
#[derive(Debug, Clone)]
pub struct UNetModel {
    time_embed: TimeEmbed,
    label_emb: Option<nn::Embedding>,
    input_blocks: Vec<EmbedSequential>,
    middle_block: EmbedSequential,
    output_blocks: Vec<EmbedSequential>,
    out_norm: GroupNorm32,
    out_conv: nn::Conv2d,
    config: UNetConfig,
}

impl UNetModel {
    pub fn new(config: &UNetConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let model_channels = config.num_channels;
        let time_embed_dim = model_channels * 4;
        let mults = config.channel_multipliers()?;
        let attention_ds = config.attention_downsample_rates()?;
        let qkv_order = if config.use_new_attention_order {
            QkvOrder::Split
        } else {
            QkvOrder::Legacy
        };
        let conv_cfg = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let res = |channels: usize, out_channels: usize, resample: Resample| ResBlockConfig {
            channels,
            emb_channels: time_embed_dim,
            out_channels,
            use_scale_shift_norm: config.use_scale_shift_norm,
            resample,
        };
        let level_channels = |mult: f64| (mult * model_channels as f64) as usize;

        let time_embed = TimeEmbed::load(vb.pp("time_embed"), model_channels, time_embed_dim)?;
        let label_emb = match config.num_classes() {
            Some(n) => Some(nn::embedding(n, time_embed_dim, vb.pp("label_emb"))?),
            None => None,
        };

        // --- Encoder ---
        let vb_in = vb.pp("input_blocks");
        let mut ch = level_channels(mults[0]);
        let input_ch = ch;
        let mut input_blocks = vec![EmbedSequential {
            layers: vec![Layer::Conv(nn::conv2d(
                config.in_channels,
                ch,
                3,
                conv_cfg,
                vb_in.pp("0").pp("0"),
            )?)],
        }];
        let mut input_block_chans = vec![ch];
        let mut ds = 1;
        for (level, &mult) in mults.iter().enumerate() {
            for _ in 0..config.num_res_blocks {
                let vb_block = vb_in.pp(input_blocks.len().to_string());
                let out_ch = level_channels(mult);
                let mut layers = vec![Layer::Res(ResBlock::load(
                    vb_block.pp("0"),
                    res(ch, out_ch, Resample::None),
                )?)];
                ch = out_ch;
                if attention_ds.contains(&ds) {
                    layers.push(Layer::Attn(AttentionBlock::load(
                        vb_block.pp("1"),
                        ch,
                        config.num_heads,
                        config.num_head_channels,
                        qkv_order,
                    )?));
                }
                input_blocks.push(EmbedSequential { layers });
                input_block_chans.push(ch);
            }
            if level != mults.len() - 1 {
                let vb_block = vb_in.pp(input_blocks.len().to_string()).pp("0");
                let layer = if config.resblock_updown {
                    Layer::Res(ResBlock::load(vb_block, res(ch, ch, Resample::Down))?)
                } else {
                    Layer::Down(Downsample::load(vb_block, ch, true, ch)?)
                };
                input_blocks.push(EmbedSequential {
                    layers: vec![layer],
                });
                input_block_chans.push(ch);
                ds *= 2;
            }
        }

        // --- Middle ---
        let vb_mid = vb.pp("middle_block");
        let middle_block = EmbedSequential {
            layers: vec![
                Layer::Res(ResBlock::load(vb_mid.pp("0"), res(ch, ch, Resample::None))?),
                Layer::Attn(AttentionBlock::load(
                    vb_mid.pp("1"),
                    ch,
                    config.num_heads,
                    config.num_head_channels,
                    qkv_order,
                )?),
                Layer::Res(ResBlock::load(vb_mid.pp("2"), res(ch, ch, Resample::None))?),
            ],
        };

        // --- Decoder ---
        let vb_out = vb.pp("output_blocks");
        let mut output_blocks = Vec::new();
        for (level, &mult) in mults.iter().enumerate().rev() {
            for i in 0..=config.num_res_blocks {
                let vb_block = vb_out.pp(output_blocks.len().to_string());
                let ich = input_block_chans.pop().ok_or_else(|| {
                    Error::Config("decoder consumed more skips than the encoder produced".into())
                })?;
                let out_ch = level_channels(mult);
                let mut layers = vec![Layer::Res(ResBlock::load(
                    vb_block.pp("0"),
                    res(ch + ich, out_ch, Resample::None),
                )?)];
                ch = out_ch;
                if attention_ds.contains(&ds) {
                    layers.push(Layer::Attn(AttentionBlock::load(
                        vb_block.pp(layers.len().to_string()),
                        ch,
                        config.heads_upsample(),
                        config.num_head_channels,
                        qkv_order,
                    )?));
                }
                if level > 0 && i == config.num_res_blocks {
                    let vb_up = vb_block.pp(layers.len().to_string());
                    layers.push(if config.resblock_updown {
                        Layer::Res(ResBlock::load(vb_up, res(ch, ch, Resample::Up))?)
                    } else {
                        Layer::Up(Upsample::load(vb_up, ch, true, ch)?)
                    });
                    ds /= 2;
                }
                output_blocks.push(EmbedSequential { layers });
            }
        }

        let vb_final = vb.pp("out");
        let out_norm = GroupNorm32::load(vb_final.pp("0"), ch)?;
        let out_conv = nn::conv2d(input_ch, config.out_channels(), 3, conv_cfg, vb_final.pp("2"))?;

        Ok(Self {
            time_embed,
            label_emb,
            input_blocks,
            middle_block,
            output_blocks,
            out_norm,
            out_conv,
            config: config.clone(),
        })
    }

    /// Build the model and load weights from a checkpoint.
    ///
    /// `.safetensors` files are memory-mapped; anything else is read as a
    /// PyTorch pickle (`torch.save(model.state_dict())`).
    pub fn load(config: &UNetConfig, checkpoint: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let path = checkpoint.as_ref();
        if !path.is_file() {
            return Err(Error::WeightLoad(format!(
                "checkpoint not found: {}",
                path.display()
            )));
        }
        let is_safetensors = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors"));

        tracing::info!(checkpoint = %path.display(), safetensors = is_safetensors, "loading UNet weights");
        let vb = if is_safetensors {
            // SAFETY: the file is not modified while mapped.
            unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device) }
        } else {
            VarBuilder::from_pth(path, DType::F32, device)
        }
        .map_err(|e| Error::WeightLoad(format!("{}: {e}", path.display())))?;

        Self::new(config, vb).map_err(|e| match e {
            Error::Candle(inner) => {
                Error::WeightLoad(format!("{} does not match the model: {inner}", path.display()))
            }
            other => other,
        })
    }

    pub fn config(&self) -> &UNetConfig {
        &self.config
    }

    /// Forward pass with optional class labels `y: [B]` (u32).
    pub fn forward_with_labels(&self, x: &Tensor, timesteps: &Tensor, y: Option<&Tensor>) -> Result<Tensor> {
        let mut emb = self.time_embed.forward(timesteps)?;
        match (&self.label_emb, y) {
            (Some(label_emb), Some(y)) => emb = (emb + label_emb.forward(y)?)?,
            (Some(_), None) => {
                return Err(Error::Config("class-conditional model needs labels".into()));
            }
            (None, Some(_)) => {
                return Err(Error::Config("labels given to an unconditional model".into()));
            }
            (None, None) => {}
        }

        let mut hs = Vec::with_capacity(self.input_blocks.len());
        let mut h = x.clone();
        for block in &self.input_blocks {
            h = block.forward(&h, &emb)?;
            hs.push(h.clone());
        }
        h = self.middle_block.forward(&h, &emb)?;
        for block in &self.output_blocks {
            let skip = hs
                .pop()
                .ok_or_else(|| Error::Config("skip connection stack exhausted".into()))?;
            h = block.forward(&Tensor::cat(&[&h, &skip], 1)?, &emb)?;
        }

        let h = self.out_norm.forward(&h)?.silu()?;
        Ok(self.out_conv.forward(&h)?)
    }
}

impl DenoiseModel for UNetModel {
    fn forward(&self, x: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        self.forward_with_labels(x, timesteps, None)
    }
}
