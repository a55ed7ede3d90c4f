use candle_core::{DType, Tensor};
use ndarray::{s, Array2, Array4, Array5, ArrayView2, ArrayView5};

use crate::detection::bbox::{box_iou, wh_iou, BoxFormat, IOU_EPS};
use crate::error::{Error, Result};

/// One labelled box; the spatial fields are fractions of the image extent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundTruthBox {
    pub batch_index: usize,
    pub class_label: usize,
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

/// Every ground-truth box of a batch, in row order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroundTruth {
    boxes: Vec<GroundTruthBox>,
}

impl GroundTruth {
    pub fn new(boxes: Vec<GroundTruthBox>) -> Self {
        Self { boxes }
    }

    /// Parses `[batch_index, class_label, cx, cy, w, h]` rows.
    pub fn from_rows(rows: ArrayView2<f32>) -> Result<Self> {
        if rows.ncols() != 6 {
            return Err(Error::ground_truth(
                0,
                format!("expected 6 columns, got {}", rows.ncols()),
            ));
        }

        let mut boxes = Vec::with_capacity(rows.nrows());
        for (row, values) in rows.outer_iter().enumerate() {
            if values.iter().any(|value| !value.is_finite()) {
                return Err(Error::ground_truth(row, "non-finite value"));
            }
            let index = |value: f32, what: &str| {
                if value < 0.0 || value.fract() != 0.0 {
                    Err(Error::ground_truth(
                        row,
                        format!("{what} must be a non-negative integer, got {value}"),
                    ))
                } else {
                    Ok(value as usize)
                }
            };
            let gt = GroundTruthBox {
                batch_index: index(values[0], "batch index")?,
                class_label: index(values[1], "class label")?,
                cx: values[2],
                cy: values[3],
                w: values[4],
                h: values[5],
            };
            if !(0.0..=1.0).contains(&gt.cx) || !(0.0..=1.0).contains(&gt.cy) {
                return Err(Error::ground_truth(row, "centre must lie within [0, 1]"));
            }
            if gt.w < 0.0 || gt.h < 0.0 {
                return Err(Error::ground_truth(row, "size must be non-negative"));
            }
            boxes.push(gt);
        }
        Ok(Self { boxes })
    }

    /// Reads an `(n, 6)` tensor in the same layout as [`GroundTruth::from_rows`].
    pub fn from_tensor(rows: &Tensor) -> Result<Self> {
        let (count, columns) = rows.dims2()?;
        let values = rows.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let rows = Array2::from_shape_vec((count, columns), values)?;
        Self::from_rows(rows.view())
    }

    pub fn boxes(&self) -> &[GroundTruthBox] {
        &self.boxes
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}

/// Per-cell training targets for one scale, indexed `[b, a, row, col]`.
#[derive(Debug, Clone)]
pub struct Targets {
    pub obj_mask: Array4<bool>,
    /// Cells trained as background: neither positive nor ignored.
    pub noobj_mask: Array4<bool>,
    /// Positive cells whose arg-max predicted class matches the truth.
    pub class_mask: Array4<bool>,
    /// Pixel-convention IoU between prediction and truth at positive cells.
    pub iou_scores: Array4<f32>,
    pub tx: Array4<f32>,
    pub ty: Array4<f32>,
    pub tw: Array4<f32>,
    pub th: Array4<f32>,
    /// `[b, a, row, col, class]` smoothed one-hot.
    pub tcls: Array5<f32>,
    /// `[b, a, row, col, 4]` truth box in grid units, centre format.
    pub tbox: Array5<f32>,
}

impl Targets {
    fn zeros(batch: usize, anchors: usize, grid: usize, num_classes: usize) -> Self {
        let cells = (batch, anchors, grid, grid);
        Self {
            obj_mask: Array4::from_elem(cells, false),
            noobj_mask: Array4::from_elem(cells, true),
            class_mask: Array4::from_elem(cells, false),
            iou_scores: Array4::zeros(cells),
            tx: Array4::zeros(cells),
            ty: Array4::zeros(cells),
            tw: Array4::zeros(cells),
            th: Array4::zeros(cells),
            tcls: Array5::zeros((batch, anchors, grid, grid, num_classes)),
            tbox: Array5::zeros((batch, anchors, grid, grid, 4)),
        }
    }

    /// Positive `[b, a, row, col]` cells in row-major order.
    pub fn positive_cells(&self) -> Vec<[usize; 4]> {
        self.obj_mask
            .indexed_iter()
            .filter(|(_, positive)| **positive)
            .map(|((b, a, j, i), _)| [b, a, j, i])
            .collect()
    }

    pub fn num_positive(&self) -> usize {
        self.obj_mask.iter().filter(|&&positive| positive).count()
    }

    /// Objectness target: 1 on positive cells, 0 elsewhere.
    pub fn tconf(&self) -> Array4<f32> {
        self.obj_mask.mapv(f32::from)
    }
}

/// Assigns each ground-truth box to the best-matching anchor of a grid cell.
#[derive(Debug, Clone)]
pub struct TargetAssigner {
    pub ignore_threshold: f32,
    pub label_smoothing: f32,
}

impl Default for TargetAssigner {
    fn default() -> Self {
        Self {
            ignore_threshold: 0.5,
            label_smoothing: 0.9,
        }
    }
}

impl TargetAssigner {
    pub fn new(ignore_threshold: f32, label_smoothing: f32) -> Self {
        Self {
            ignore_threshold,
            label_smoothing,
        }
    }

    /// Builds targets for one scale.
    ///
    /// `pred_boxes` is `(B, A, g, g, 4)` in grid units and `pred_cls` is
    /// `(B, A, g, g, C)`; both only feed the diagnostic outputs. `anchors` are
    /// in grid units. Boxes landing on an already assigned `(anchor, cell)`
    /// overwrite the earlier box.
    pub fn assign(
        &self,
        pred_boxes: ArrayView5<f32>,
        pred_cls: ArrayView5<f32>,
        truth: &GroundTruth,
        anchors: &[[f32; 2]],
    ) -> Result<Targets> {
        let (batch, num_anchors, grid, _, _) = pred_boxes.dim();
        let num_classes = pred_cls.dim().4;
        if num_anchors != anchors.len() {
            return Err(Error::InvalidConfig(format!(
                "predictions carry {num_anchors} anchors but {} were given",
                anchors.len()
            )));
        }
        let mut targets = Targets::zeros(batch, num_anchors, grid, num_classes);

        for (row, gt) in truth.boxes().iter().enumerate() {
            if gt.batch_index >= batch {
                return Err(Error::ground_truth(
                    row,
                    format!("batch index {} exceeds batch size {batch}", gt.batch_index),
                ));
            }
            if gt.class_label >= num_classes {
                return Err(Error::ground_truth(
                    row,
                    format!("class {} exceeds class count {num_classes}", gt.class_label),
                ));
            }

            let scale = grid as f32;
            let (gx, gy, gw, gh) = (gt.cx * scale, gt.cy * scale, gt.w * scale, gt.h * scale);

            let ious: Vec<f32> = anchors.iter().map(|&anchor| wh_iou(anchor, [gw, gh])).collect();
            let best = stable_argmax(ious.iter().copied());
            let gi = cell_index(gx, grid);
            let gj = cell_index(gy, grid);
            let b = gt.batch_index;
            let cell = [b, best, gj, gi];

            targets.obj_mask[cell] = true;
            targets.noobj_mask[cell] = false;
            for (anchor, &iou) in ious.iter().enumerate() {
                if iou > self.ignore_threshold {
                    targets.noobj_mask[[b, anchor, gj, gi]] = false;
                }
            }

            targets.tx[cell] = gx - gi as f32;
            targets.ty[cell] = gy - gj as f32;
            targets.tw[cell] = (gw / anchors[best][0] + IOU_EPS).ln();
            targets.th[cell] = (gh / anchors[best][1] + IOU_EPS).ln();

            let mut classes = targets.tcls.slice_mut(s![b, best, gj, gi, ..]);
            classes.fill(0.0);
            classes[gt.class_label] = self.label_smoothing;

            let truth_box = [gx, gy, gw, gh];
            for (k, &value) in truth_box.iter().enumerate() {
                targets.tbox[[b, best, gj, gi, k]] = value;
            }

            let predicted_class =
                stable_argmax(pred_cls.slice(s![b, best, gj, gi, ..]).iter().copied());
            targets.class_mask[cell] = predicted_class == gt.class_label;

            let pred = pred_boxes.slice(s![b, best, gj, gi, ..]);
            targets.iou_scores[cell] =
                box_iou([pred[0], pred[1], pred[2], pred[3]], truth_box, BoxFormat::Center);
        }

        Ok(targets)
    }
}

/// Index of the first maximum.
fn stable_argmax(values: impl IntoIterator<Item = f32>) -> usize {
    let mut best = (0, f32::NEG_INFINITY);
    for (index, value) in values.into_iter().enumerate() {
        if value > best.1 {
            best = (index, value);
        }
    }
    best.0
}

/// A centre exactly on the far edge belongs to the last cell.
fn cell_index(position: f32, grid: usize) -> usize {
    (position.floor().max(0.0) as usize).min(grid - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::grid::GridGeometry;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use ndarray::array;

    fn empty_predictions(
        batch: usize,
        grid: usize,
        num_classes: usize,
    ) -> (Array5<f32>, Array5<f32>) {
        (
            Array5::zeros((batch, 3, grid, grid, 4)),
            Array5::zeros((batch, 3, grid, grid, num_classes)),
        )
    }

    fn single_box(class_label: usize, cx: f32, cy: f32, w: f32, h: f32) -> GroundTruth {
        GroundTruth::new(vec![GroundTruthBox {
            batch_index: 0,
            class_label,
            cx,
            cy,
            w,
            h,
        }])
    }

    #[test]
    fn parses_rows() {
        let rows = array![[0.0, 1.0, 0.5, 0.5, 0.3, 0.3], [1.0, 0.0, 0.1, 0.9, 0.05, 0.2]];
        let truth = GroundTruth::from_rows(rows.view()).unwrap();
        assert_eq!(truth.len(), 2);
        assert_eq!(truth.boxes()[1].batch_index, 1);
        assert_eq!(truth.boxes()[1].cy, 0.9);
    }

    #[test]
    fn rejects_malformed_rows() {
        let fractional_class = array![[0.0, 1.5, 0.5, 0.5, 0.3, 0.3]];
        assert!(GroundTruth::from_rows(fractional_class.view()).is_err());

        let outside = array![[0.0, 1.0, 1.5, 0.5, 0.3, 0.3]];
        assert!(GroundTruth::from_rows(outside.view()).is_err());

        let short = array![[0.0, 1.0, 0.5, 0.5, 0.3]];
        assert!(GroundTruth::from_rows(short.view()).is_err());
    }

    #[test]
    fn centred_box_lands_in_middle_cell() {
        let mut geometry = GridGeometry::new([[10.0, 13.0], [16.0, 30.0], [33.0, 23.0]], 608, 2);
        geometry.recompute_offsets(19, &Device::Cpu, DType::F32).unwrap();
        let anchors = geometry.scaled_anchors();

        let (boxes, classes) = empty_predictions(1, 19, 2);
        let truth = single_box(1, 0.5, 0.5, 0.3, 0.3);
        let targets = TargetAssigner::default()
            .assign(boxes.view(), classes.view(), &truth, anchors)
            .unwrap();

        let ious: Vec<f32> = anchors.iter().map(|&a| wh_iou(a, [5.7, 5.7])).collect();
        let expected_anchor = stable_argmax(ious.iter().copied());
        assert_eq!(expected_anchor, 2);

        assert_eq!(targets.positive_cells(), vec![[0, expected_anchor, 9, 9]]);
        assert_abs_diff_eq!(targets.tx[[0, 2, 9, 9]], 0.5, epsilon = 1e-5);
        assert_abs_diff_eq!(targets.tcls[[0, 2, 9, 9, 1]], 0.9);
        assert_abs_diff_eq!(targets.tcls[[0, 2, 9, 9, 0]], 0.0);
        assert!(!targets.noobj_mask[[0, 2, 9, 9]]);
        assert_eq!(targets.noobj_mask.iter().filter(|&&v| !v).count(), 1);
    }

    #[test]
    fn regression_targets_round_trip_through_decode() {
        let device = Device::Cpu;
        let (image_size, grid, num_classes) = (416, 13, 3);
        let mut geometry =
            GridGeometry::new([[30.0, 61.0], [62.0, 45.0], [59.0, 119.0]], image_size, num_classes);
        geometry.recompute_offsets(grid, &device, DType::F32).unwrap();

        let (boxes, classes) = empty_predictions(1, grid, num_classes);
        let truth = single_box(2, 0.37, 0.61, 0.14, 0.22);
        let targets = TargetAssigner::default()
            .assign(boxes.view(), classes.view(), &truth, geometry.scaled_anchors())
            .unwrap();

        let positives = targets.positive_cells();
        assert_eq!(positives.len(), 1);
        let cell = positives[0];
        let [_, a, j, i] = cell;

        let attrs = 5 + num_classes;
        let logit = |p: f32| (p / (1.0 - p)).ln();
        let mut raw = Array4::<f32>::zeros((1, 3 * attrs, grid, grid));
        raw[[0, a * attrs, j, i]] = logit(targets.tx[cell]);
        raw[[0, a * attrs + 1, j, i]] = logit(targets.ty[cell]);
        raw[[0, a * attrs + 2, j, i]] = targets.tw[cell];
        raw[[0, a * attrs + 3, j, i]] = targets.th[cell];
        let raw = Tensor::from_vec(raw.into_raw_vec_and_offset().0, (1, 3 * attrs, grid, grid), &device)
            .unwrap();

        let output = geometry.decode(&raw).unwrap().output.squeeze(0).unwrap();
        let decoded = output.get(a * grid * grid + j * grid + i).unwrap().to_vec1::<f32>().unwrap();
        let expected = [0.37, 0.61, 0.14, 0.22].map(|v| v * image_size as f32);
        for k in 0..4 {
            assert_abs_diff_eq!(decoded[k], expected[k], epsilon = 1e-2);
        }
    }

    #[test]
    fn near_miss_anchor_is_ignored_not_positive() {
        let anchors = [[1.0, 1.0], [1.1, 1.1], [5.0, 5.0]];
        let grid = 10;
        let (boxes, classes) = empty_predictions(1, grid, 1);
        // 1.05 grid units wide: anchors 0 and 1 both clear the threshold, 1 wins.
        let truth = single_box(0, 0.42, 0.77, 0.105, 0.105);
        let targets = TargetAssigner::default()
            .assign(boxes.view(), classes.view(), &truth, &anchors)
            .unwrap();

        assert!(targets.obj_mask[[0, 1, 7, 4]]);
        assert!(!targets.obj_mask[[0, 0, 7, 4]]);
        assert!(!targets.noobj_mask[[0, 0, 7, 4]]);
        assert!(targets.noobj_mask[[0, 2, 7, 4]]);
        assert_eq!(targets.num_positive(), 1);
    }

    #[test]
    fn later_box_overwrites_shared_cell() {
        let anchors = [[1.0, 1.0], [3.0, 3.0], [6.0, 6.0]];
        let grid = 8;
        let (boxes, classes) = empty_predictions(1, grid, 4);
        let truth = GroundTruth::new(vec![
            GroundTruthBox {
                batch_index: 0,
                class_label: 0,
                cx: 0.51,
                cy: 0.52,
                w: 0.125,
                h: 0.125,
            },
            GroundTruthBox {
                batch_index: 0,
                class_label: 3,
                cx: 0.56,
                cy: 0.6,
                w: 0.13,
                h: 0.12,
            },
        ]);
        let targets = TargetAssigner::default()
            .assign(boxes.view(), classes.view(), &truth, &anchors)
            .unwrap();

        let cell = [0, 0, 4, 4];
        assert_eq!(targets.positive_cells(), vec![cell]);
        assert_abs_diff_eq!(targets.tx[cell], 0.56 * 8.0 - 4.0, epsilon = 1e-5);
        assert_abs_diff_eq!(targets.ty[cell], 0.6 * 8.0 - 4.0, epsilon = 1e-5);
        assert_abs_diff_eq!(targets.tw[cell], (0.13f32 * 8.0).ln(), epsilon = 1e-5);
        assert_eq!(targets.tcls[[0, 0, 4, 4, 0]], 0.0);
        assert_eq!(targets.tcls[[0, 0, 4, 4, 3]], 0.9);
    }

    #[test]
    fn class_mask_tracks_predicted_argmax() {
        let anchors = [[1.0, 1.0], [3.0, 3.0], [6.0, 6.0]];
        let (boxes, mut classes) = empty_predictions(1, 4, 3);
        classes[[0, 1, 2, 1, 2]] = 0.8;
        let truth = single_box(2, 0.3, 0.6, 0.75, 0.75);
        let targets = TargetAssigner::default()
            .assign(boxes.view(), classes.view(), &truth, &anchors)
            .unwrap();
        assert!(targets.obj_mask[[0, 1, 2, 1]]);
        assert!(targets.class_mask[[0, 1, 2, 1]]);
    }

    #[test]
    fn out_of_range_batch_index_is_reported() {
        let anchors = [[1.0, 1.0], [3.0, 3.0], [6.0, 6.0]];
        let (boxes, classes) = empty_predictions(1, 4, 3);
        let truth = GroundTruth::new(vec![GroundTruthBox {
            batch_index: 2,
            class_label: 0,
            cx: 0.5,
            cy: 0.5,
            w: 0.1,
            h: 0.1,
        }]);
        let err = TargetAssigner::default()
            .assign(boxes.view(), classes.view(), &truth, &anchors)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidGroundTruth { row: 0, .. }));
    }
}
