use candle_core::{DType, Device, Tensor};
use ndarray::{s, Array, ArrayView5, Dimension, Ix4, Ix5, IxDyn};
use tracing::trace;

use crate::config::HeadConfig;
use crate::detection::grid::{GridGeometry, ScaleDecode};
use crate::detection::loss::{binary_cross_entropy, ciou_penalty, HeadLoss};
use crate::detection::metrics::HeadMetrics;
use crate::detection::target::{GroundTruth, TargetAssigner, Targets};
use crate::error::{Error, Result};

/// Everything one scale produces on the training path.
#[derive(Debug, Clone)]
pub struct ScaleOutput {
    /// `(B, A·g·g, 5 + C)`, still attached to the graph.
    pub output: Tensor,
    pub loss: HeadLoss,
    pub metrics: HeadMetrics,
}

/// Decoding and loss for a single detection scale.
#[derive(Debug, Clone)]
pub struct DetectionHead {
    scale: usize,
    geometry: GridGeometry,
    assigner: TargetAssigner,
    obj_scale: f64,
    noobj_scale: f64,
}

impl DetectionHead {
    pub fn new(scale: usize, config: HeadConfig) -> Self {
        Self {
            scale,
            geometry: GridGeometry::new(config.anchors, config.image_size, config.num_classes),
            assigner: TargetAssigner::new(config.ignore_threshold, config.label_smoothing),
            obj_scale: config.obj_scale,
            noobj_scale: config.noobj_scale,
        }
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    /// Decoded detections in pixels, detached from the graph.
    pub fn infer(&mut self, features: &Tensor) -> Result<Tensor> {
        Ok(self.decode(features)?.output.detach())
    }

    /// Decodes `features` and scores them against `truth`.
    pub fn compute_loss(&mut self, features: &Tensor, truth: &GroundTruth) -> Result<ScaleOutput> {
        let decoded = self.decode(features)?;
        let device = features.device();
        let batch = features.dim(0)?;

        let pred_boxes = to_host::<Ix5>(&decoded.pred_boxes)?;
        let pred_cls = to_host::<Ix5>(&decoded.class_probs)?;
        let targets = self.assigner.assign(
            pred_boxes.view(),
            pred_cls.view(),
            truth,
            self.geometry.scaled_anchors(),
        )?;

        let loss = self.loss(&decoded, &targets, batch, device)?;
        let objectness = to_host::<Ix4>(&decoded.objectness)?;
        let metrics = HeadMetrics::new(&targets, objectness.view());
        trace!(scale = self.scale, ?metrics, "scale metrics");

        Ok(ScaleOutput {
            output: decoded.output,
            loss,
            metrics,
        })
    }

    fn decode(&mut self, features: &Tensor) -> Result<ScaleDecode> {
        let (_, channels, rows, cols) = features.dims4()?;
        let expected = self.geometry.num_anchors() * (5 + self.geometry.num_classes());
        if channels != expected || rows != cols || rows == 0 {
            return Err(Error::FeatureMapShape {
                scale: self.scale,
                shape: features.dims().to_vec(),
                expected: format!("(batch, {expected}, g, g)"),
            });
        }
        self.geometry
            .recompute_offsets(rows, features.device(), features.dtype())?;
        self.geometry.decode(features)
    }

    fn loss(
        &self,
        decoded: &ScaleDecode,
        targets: &Targets,
        batch: usize,
        device: &Device,
    ) -> Result<HeadLoss> {
        let dtype = decoded.objectness.dtype();
        let batch = batch as f64;
        let positives = targets.positive_cells();

        let (box_loss, cls_loss) = if positives.is_empty() {
            let zero = Tensor::zeros((), dtype, device)?;
            (zero.clone(), zero)
        } else {
            let (_, num_anchors, grid, _) = targets.obj_mask.dim();
            let flat: Vec<u32> = positives
                .iter()
                .map(|&[b, a, j, i]| (((b * num_anchors + a) * grid + j) * grid + i) as u32)
                .collect();
            let count = flat.len();
            let index = Tensor::from_vec(flat, count, device)?;
            let cells = targets.obj_mask.len();
            let num_classes = targets.tcls.dim().4;

            let pred_boxes = decoded.pred_boxes.reshape((cells, 4))?.index_select(&index, 0)?;
            let truth_boxes = gather(targets.tbox.view(), &positives);
            let truth_boxes = Tensor::from_vec(truth_boxes, (count, 4), device)?.to_dtype(dtype)?;
            let box_loss = (ciou_penalty(&pred_boxes, &truth_boxes)?.sum_all()? / batch)?;

            let pred_cls = decoded
                .class_probs
                .reshape((cells, num_classes))?
                .index_select(&index, 0)?;
            let truth_cls = gather(targets.tcls.view(), &positives);
            let truth_cls =
                Tensor::from_vec(truth_cls, (count, num_classes), device)?.to_dtype(dtype)?;
            let cls_loss = (binary_cross_entropy(&pred_cls, &truth_cls)?.sum_all()? / batch)?;
            (box_loss, cls_loss)
        };

        let obj_mask = upload(&targets.tconf(), dtype, device)?;
        let noobj_mask = upload(&targets.noobj_mask.mapv(f32::from), dtype, device)?;
        let bce = binary_cross_entropy(&decoded.objectness, &obj_mask)?;
        let obj_loss = (bce.mul(&obj_mask)?.sum_all()? / batch)?;
        let noobj_loss = (bce.mul(&noobj_mask)?.sum_all()? / batch)?;
        let obj_loss = ((obj_loss * self.obj_scale)? + (noobj_loss * self.noobj_scale)?)?;

        let total = box_loss.add(&cls_loss)?.add(&obj_loss)?;
        Ok(HeadLoss {
            total,
            box_loss,
            obj_loss,
            cls_loss,
        })
    }
}

/// Copies a tensor to the host as an `f32` array, outside the graph.
fn to_host<D: Dimension>(tensor: &Tensor) -> Result<Array<f32, D>> {
    let shape = tensor.dims().to_vec();
    let values = tensor
        .detach()
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    Ok(Array::from_shape_vec(IxDyn(&shape), values)?.into_dimensionality::<D>()?)
}

fn upload<D: Dimension>(array: &Array<f32, D>, dtype: DType, device: &Device) -> Result<Tensor> {
    let values: Vec<f32> = array.iter().copied().collect();
    Ok(Tensor::from_vec(values, array.shape(), device)?.to_dtype(dtype)?)
}

/// Trailing-axis rows of `array` at each `[b, a, row, col]` cell.
fn gather(array: ArrayView5<f32>, cells: &[[usize; 4]]) -> Vec<f32> {
    cells
        .iter()
        .flat_map(|&[b, a, j, i]| {
            array
                .slice(s![b, a, j, i, ..])
                .iter()
                .copied()
                .collect::<Vec<_>>()
        })
        .collect()
}
