pub mod bbox;
pub mod detector;
pub mod grid;
pub mod head;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod target;

use candle_core::{DType, Tensor};

use crate::detection::bbox::{to_corners, BoxFormat};
use crate::error::{Error, Result};

/// One decoded prediction, in input pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// `[cx, cy, w, h]`
    pub bbox: [f32; 4],
    pub objectness: f32,
    pub class_probs: Vec<f32>,
}

impl Detection {
    /// `[x1, y1, x2, y2]`
    pub fn corners(&self) -> [f32; 4] {
        to_corners(self.bbox, BoxFormat::Center)
    }

    /// Most probable class and its probability; ties keep the lower index.
    pub fn best_class(&self) -> Option<(usize, f32)> {
        self.class_probs
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best, (index, prob)| match best {
                Some((_, best_prob)) if best_prob >= prob => best,
                _ => Some((index, prob)),
            })
    }
}

/// Splits a `(B, N, 5 + C)` decoded tensor into per-image detections whose
/// objectness is above `confidence_threshold`. No suppression is applied.
pub fn process_detections(
    output: &Tensor,
    confidence_threshold: f32,
) -> Result<Vec<Vec<Detection>>> {
    let (_, _, width) = output.dims3()?;
    if width < 6 {
        return Err(Error::FeatureMapShape {
            scale: 0,
            shape: output.dims().to_vec(),
            expected: "(batch, boxes, 5 + classes)".into(),
        });
    }
    let rows = output.detach().to_dtype(DType::F32)?.to_vec3::<f32>()?;

    let detections = rows
        .into_iter()
        .map(|image| {
            image
                .into_iter()
                .filter(|row| row[4] > confidence_threshold)
                .map(|row| Detection {
                    bbox: [row[0], row[1], row[2], row[3]],
                    objectness: row[4],
                    class_probs: row[5..].to_vec(),
                })
                .collect()
        })
        .collect();
    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn filters_by_objectness_per_image() {
        let rows = [
            [100.0f32, 50.0, 20.0, 10.0, 0.9, 0.1, 0.8],
            [10.0, 10.0, 4.0, 4.0, 0.2, 0.5, 0.5],
            [30.0, 40.0, 8.0, 8.0, 0.6, 0.7, 0.3],
            [0.0, 0.0, 1.0, 1.0, 0.5, 0.5, 0.5],
        ];
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        let output = Tensor::from_vec(flat, (2, 2, 7), &Device::Cpu).unwrap();

        let detections = process_detections(&output, 0.5).unwrap();
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].len(), 1);
        assert_eq!(detections[1].len(), 1);

        let first = &detections[0][0];
        assert_eq!(first.corners(), [90.0, 45.0, 110.0, 55.0]);
        assert_eq!(first.best_class(), Some((1, 0.8)));
        assert_eq!(detections[1][0].best_class(), Some((0, 0.7)));
    }

    #[test]
    fn rejects_rows_without_classes() {
        let output = Tensor::zeros((1, 3, 5), DType::F32, &Device::Cpu).unwrap();
        assert!(process_detections(&output, 0.5).is_err());
    }
}
