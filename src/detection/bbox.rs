use candle_core::{Result, Tensor};

/// Floor added to unions so degenerate zero-area boxes do not divide by zero.
pub const IOU_EPS: f32 = 1e-16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxFormat {
    /// `[x1, y1, x2, y2]`
    Corners,
    /// `[cx, cy, w, h]`
    Center,
}

pub fn to_corners(bbox: [f32; 4], format: BoxFormat) -> [f32; 4] {
    match format {
        BoxFormat::Corners => bbox,
        BoxFormat::Center => {
            let [cx, cy, w, h] = bbox;
            [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
        }
    }
}

/// IoU of two boxes that share a centre, compared by width and height only.
pub fn wh_iou(wh1: [f32; 2], wh2: [f32; 2]) -> f32 {
    let intersection = wh1[0].min(wh2[0]) * wh1[1].min(wh2[1]);
    let union = wh1[0] * wh1[1] + wh2[0] * wh2[1] - intersection + IOU_EPS;
    intersection / union
}

/// Raw areas behind an IoU, for callers that need more than the ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Overlap {
    pub intersection: f32,
    pub area1: f32,
    pub area2: f32,
}

impl Overlap {
    pub fn union(&self) -> f32 {
        self.area1 + self.area2 - self.intersection + IOU_EPS
    }

    pub fn iou(&self) -> f32 {
        self.intersection / self.union()
    }
}

/// Overlap of two boxes counted in whole pixels: both edges are inclusive, so
/// every width and height carries a `+ 1`.
pub fn box_overlap(box1: [f32; 4], box2: [f32; 4], format: BoxFormat) -> Overlap {
    let [b1_x1, b1_y1, b1_x2, b1_y2] = to_corners(box1, format);
    let [b2_x1, b2_y1, b2_x2, b2_y2] = to_corners(box2, format);

    let inter_x1 = b1_x1.max(b2_x1);
    let inter_y1 = b1_y1.max(b2_y1);
    let inter_x2 = b1_x2.min(b2_x2);
    let inter_y2 = b1_y2.min(b2_y2);
    let intersection =
        (inter_x2 - inter_x1 + 1.0).max(0.0) * (inter_y2 - inter_y1 + 1.0).max(0.0);

    Overlap {
        intersection,
        area1: (b1_x2 - b1_x1 + 1.0) * (b1_y2 - b1_y1 + 1.0),
        area2: (b2_x2 - b2_x1 + 1.0) * (b2_y2 - b2_y1 + 1.0),
    }
}

pub fn box_iou(box1: [f32; 4], box2: [f32; 4], format: BoxFormat) -> f32 {
    box_overlap(box1, box2, format).iou()
}

/// Converts `(N, 4)` centre-format boxes to corner format.
pub fn center_to_corners(boxes: &Tensor) -> Result<Tensor> {
    let center = boxes.narrow(1, 0, 2)?;
    let half_size = (boxes.narrow(1, 2, 2)? * 0.5)?;
    Tensor::cat(&[center.sub(&half_size)?, center.add(&half_size)?], 1)
}

/// Corners `(N, 4)` of the smallest axis-aligned box containing each pair of
/// centre-format boxes.
pub fn smallest_enclosing_box(pred_boxes: &Tensor, target_boxes: &Tensor) -> Result<Tensor> {
    let pred = center_to_corners(pred_boxes)?;
    let target = center_to_corners(target_boxes)?;
    let top_left = pred.narrow(1, 0, 2)?.minimum(&target.narrow(1, 0, 2)?)?;
    let bottom_right = pred.narrow(1, 2, 2)?.maximum(&target.narrow(1, 2, 2)?)?;
    Tensor::cat(&[top_left, bottom_right], 1)
}
