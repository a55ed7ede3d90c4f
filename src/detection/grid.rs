use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops::sigmoid;
use tracing::debug;

use crate::config::AnchorSet;
use crate::error::{Error, Result};

/// Offsets and anchor sizes for one grid resolution.
#[derive(Debug, Clone)]
struct GridOffsets {
    grid_size: usize,
    device: Device,
    dtype: DType,
    stride: f32,
    /// `(1, 1, g, g)` column index of every cell.
    grid_x: Tensor,
    /// `(1, 1, g, g)` row index of every cell.
    grid_y: Tensor,
    /// `(1, A, 1, 1)` anchor widths in grid units.
    anchor_w: Tensor,
    /// `(1, A, 1, 1)` anchor heights in grid units.
    anchor_h: Tensor,
    scaled_anchors: Vec<[f32; 2]>,
}

/// Maps raw head output for one scale onto boxes, given a fixed anchor set.
///
/// The offsets are cached per grid size and only rebuilt when an incoming
/// feature map has a different resolution, device or dtype.
#[derive(Debug, Clone)]
pub struct GridGeometry {
    anchors: AnchorSet,
    image_size: usize,
    num_classes: usize,
    offsets: Option<GridOffsets>,
}

/// Every intermediate the loss needs, all shaped `(B, A, g, g)` unless noted.
#[derive(Debug, Clone)]
pub struct ScaleDecode {
    pub objectness: Tensor,
    /// `(B, A, g, g, C)` independent class probabilities.
    pub class_probs: Tensor,
    /// `(B, A, g, g, 4)` centre-format boxes in grid units.
    pub pred_boxes: Tensor,
    /// `(B, A·g·g, 5 + C)` boxes in pixels, objectness, class probabilities.
    pub output: Tensor,
}

impl GridGeometry {
    pub fn new(anchors: AnchorSet, image_size: usize, num_classes: usize) -> Self {
        Self {
            anchors,
            image_size,
            num_classes,
            offsets: None,
        }
    }

    pub fn num_anchors(&self) -> usize {
        self.anchors.len()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn grid_size(&self) -> Option<usize> {
        self.offsets.as_ref().map(|offsets| offsets.grid_size)
    }

    pub fn stride(&self) -> Option<f32> {
        self.offsets.as_ref().map(|offsets| offsets.stride)
    }

    /// Anchor sizes divided by the current stride.
    pub fn scaled_anchors(&self) -> &[[f32; 2]] {
        match &self.offsets {
            Some(offsets) => &offsets.scaled_anchors,
            None => &[],
        }
    }

    /// Rebuilds the offsets for `grid_size`; a no-op when nothing changed.
    pub fn recompute_offsets(&mut self, grid_size: usize, device: &Device, dtype: DType) -> Result<()> {
        if let Some(offsets) = &self.offsets {
            if offsets.grid_size == grid_size
                && offsets.device.same_device(device)
                && offsets.dtype == dtype
            {
                return Ok(());
            }
        }

        let stride = self.image_size as f32 / grid_size as f32;
        let columns: Vec<f32> = (0..grid_size * grid_size)
            .map(|index| (index % grid_size) as f32)
            .collect();
        let grid_x =
            Tensor::from_vec(columns, (1, 1, grid_size, grid_size), device)?.to_dtype(dtype)?;
        let grid_y = grid_x.transpose(2, 3)?.contiguous()?;

        let scaled_anchors: Vec<[f32; 2]> = self
            .anchors
            .iter()
            .map(|&[w, h]| [w / stride, h / stride])
            .collect();
        let num_anchors = scaled_anchors.len();
        let widths: Vec<f32> = scaled_anchors.iter().map(|anchor| anchor[0]).collect();
        let heights: Vec<f32> = scaled_anchors.iter().map(|anchor| anchor[1]).collect();
        let anchor_w = Tensor::from_vec(widths, (1, num_anchors, 1, 1), device)?.to_dtype(dtype)?;
        let anchor_h = Tensor::from_vec(heights, (1, num_anchors, 1, 1), device)?.to_dtype(dtype)?;

        debug!(grid_size, stride, ?dtype, "recomputed grid offsets");

        self.offsets = Some(GridOffsets {
            grid_size,
            device: device.clone(),
            dtype,
            stride,
            grid_x,
            grid_y,
            anchor_w,
            anchor_h,
            scaled_anchors,
        });
        Ok(())
    }

    /// Decodes a raw `(B, A·(5+C), g, g)` map. Offsets must already match `g`.
    pub fn decode(&self, raw: &Tensor) -> Result<ScaleDecode> {
        let offsets = self.offsets.as_ref().ok_or_else(|| {
            Error::InvalidConfig("grid offsets used before recompute".into())
        })?;
        let (batch, _, rows, cols) = raw.dims4()?;
        let num_anchors = self.num_anchors();
        let attrs = 5 + self.num_classes;
        let grid = offsets.grid_size;
        if rows != grid || cols != grid {
            return Err(Error::InvalidConfig(format!(
                "decode got a {rows}x{cols} map but offsets were built for {grid}x{grid}"
            )));
        }

        // (B, A, attrs, g, g) -> (B, A, g, g, attrs)
        let prediction = raw
            .reshape((batch, num_anchors, attrs, grid, grid))?
            .permute((0, 1, 3, 4, 2))?
            .contiguous()?;
        let field = |index: usize| -> candle_core::Result<Tensor> {
            prediction.narrow(D::Minus1, index, 1)?.squeeze(D::Minus1)
        };

        let x = sigmoid(&field(0)?)?;
        let y = sigmoid(&field(1)?)?;
        let w = field(2)?;
        let h = field(3)?;
        let objectness = sigmoid(&field(4)?)?;
        let class_probs = sigmoid(&prediction.narrow(D::Minus1, 5, self.num_classes)?)?;

        let pred_boxes = Tensor::stack(
            &[
                x.broadcast_add(&offsets.grid_x)?,
                y.broadcast_add(&offsets.grid_y)?,
                w.exp()?.broadcast_mul(&offsets.anchor_w)?,
                h.exp()?.broadcast_mul(&offsets.anchor_h)?,
            ],
            D::Minus1,
        )?;

        let cells = num_anchors * grid * grid;
        let output = Tensor::cat(
            &[
                (pred_boxes.reshape((batch, cells, 4))? * f64::from(offsets.stride))?,
                objectness.reshape((batch, cells, 1))?,
                class_probs.reshape((batch, cells, self.num_classes))?,
            ],
            D::Minus1,
        )?;

        Ok(ScaleDecode {
            objectness,
            class_probs,
            pred_boxes,
            output,
        })
    }
}
