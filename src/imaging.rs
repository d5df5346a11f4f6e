//! Image file I/O for `[B, C, H, W]` tensors.
//!
//! Saving tiles a batch into one grid (8 per row, 2 px of black padding
//! between tiles); a single image is written as-is. Values are expected in
//! `[0, 1]` and quantized as `x·255 + 0.5`, clamped, then truncated.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::{ImageBuffer, Luma, Rgb};

use crate::{Error, Result};

/// Tiles per grid row.
pub const GRID_NROW: usize = 8;
/// Padding between and around tiles, in pixels.
pub const GRID_PADDING: usize = 2;

/// Placement of `count` tiles of `height × width` in a padded grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridLayout {
    pub cols: usize,
    pub rows: usize,
    pub tile_height: usize,
    pub tile_width: usize,
    pub padding: usize,
}

impl GridLayout {
    pub fn new(count: usize, tile_height: usize, tile_width: usize, nrow: usize, padding: usize) -> Self {
        // A lone image is written without any padding.
        if count == 1 {
            return Self {
                cols: 1,
                rows: 1,
                tile_height,
                tile_width,
                padding: 0,
            };
        }
        let cols = nrow.min(count).max(1);
        Self {
            cols,
            rows: count.div_ceil(cols),
            tile_height,
            tile_width,
            padding,
        }
    }

    pub fn width(&self) -> usize {
        self.cols * (self.tile_width + self.padding) + self.padding
    }

    pub fn height(&self) -> usize {
        self.rows * (self.tile_height + self.padding) + self.padding
    }

    /// Top-left pixel `(y, x)` of tile `index`.
    pub fn origin(&self, index: usize) -> (usize, usize) {
        let (row, col) = (index / self.cols, index % self.cols);
        (
            row * (self.tile_height + self.padding) + self.padding,
            col * (self.tile_width + self.padding) + self.padding,
        )
    }
}

/// Map `[-1, 1]` model space to `[0, 1]`, clamping overshoot.
pub fn to_unit_range(x: &Tensor) -> Result<Tensor> {
    Ok(x.affine(0.5, 0.5)?.clamp(0f32, 1f32)?)
}

/// Write `[B, C, H, W]` (or `[C, H, W]`) values in `[0, 1]` to `path`.
///
/// One channel is written as grayscale, three as RGB. The format follows the
/// file extension.
pub fn save_image(images: &Tensor, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let images = match images.rank() {
        3 => images.unsqueeze(0)?,
        4 => images.clone(),
        rank => {
            return Err(Error::Config(format!(
                "save_image expects [B, C, H, W] or [C, H, W], got rank {rank}"
            )));
        }
    };
    let (count, channels, height, width) = images.dims4()?;
    if channels != 1 && channels != 3 {
        return Err(Error::Config(format!(
            "save_image supports 1 or 3 channels, got {channels}"
        )));
    }

    // [B, C, H, W] f32 → [B, H, W, C] u8 on the host
    let pixels: Vec<u8> = images
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .affine(255.0, 0.5)?
        .clamp(0f32, 255f32)?
        .to_dtype(DType::U8)?
        .permute((0, 2, 3, 1))?
        .flatten_all()?
        .to_vec1()?;

    let layout = GridLayout::new(count, height, width, GRID_NROW, GRID_PADDING);
    let (grid_w, grid_h) = (layout.width(), layout.height());
    let mut grid = vec![0u8; grid_w * grid_h * channels];
    let row_len = width * channels;
    for index in 0..count {
        let (oy, ox) = layout.origin(index);
        let tile = &pixels[index * height * row_len..(index + 1) * height * row_len];
        for y in 0..height {
            let dst = ((oy + y) * grid_w + ox) * channels;
            grid[dst..dst + row_len].copy_from_slice(&tile[y * row_len..(y + 1) * row_len]);
        }
    }

    let (gw, gh) = (grid_w as u32, grid_h as u32);
    let invalid = || Error::Config(format!("{grid_w}x{grid_h} grid buffer has the wrong length"));
    if channels == 1 {
        let img: ImageBuffer<Luma<u8>, Vec<u8>> = ImageBuffer::from_raw(gw, gh, grid).ok_or_else(invalid)?;
        img.save(path)?;
    } else {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_raw(gw, gh, grid).ok_or_else(invalid)?;
        img.save(path)?;
    }
    tracing::debug!(path = %path.display(), count, width = grid_w, height = grid_h, "saved image");
    Ok(())
}

/// Decode an image, convert it to RGB, resize it to `size × size` and return
/// `[1, 3, size, size]` in `[-1, 1]` on `device`.
pub fn load_image(path: impl AsRef<Path>, size: usize, device: &Device) -> Result<Tensor> {
    let path = path.as_ref();
    let mut img = image::open(path)?;
    let side = size as u32;
    if img.width() != side || img.height() != side {
        tracing::debug!(
            path = %path.display(),
            from_width = img.width(),
            from_height = img.height(),
            size,
            "resizing input image"
        );
        img = img.resize_exact(side, side, FilterType::Lanczos3);
    }
    let rgb = img.to_rgb8().into_raw();
    let x = Tensor::from_vec(rgb, (size, size, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2.0 / 255.0, -1.0)?
        .unsqueeze(0)?;
    Ok(x.to_device(device)?)
}
