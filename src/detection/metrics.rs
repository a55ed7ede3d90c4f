use ndarray::{ArrayView4, Zip};

use crate::detection::target::Targets;

/// Training diagnostics for one scale. Ratios are in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HeadMetrics {
    pub grid_size: usize,
    pub num_targets: usize,
    pub cls_acc: f32,
    pub recall50: f32,
    pub recall75: f32,
    pub precision: f32,
    pub conf_obj: f32,
    pub conf_noobj: f32,
}

impl HeadMetrics {
    /// `objectness` is the detached `(B, A, g, g)` prediction.
    pub fn new(targets: &Targets, objectness: ArrayView4<f32>) -> Self {
        let grid_size = targets.obj_mask.dim().2;
        let num_targets = targets.num_positive();

        let mut class_hits = 0usize;
        let mut conf_obj = 0.0f32;
        let mut conf_noobj = 0.0f32;
        let mut num_noobj = 0usize;
        let mut num_confident = 0usize;
        let mut detected50 = 0usize;
        let mut detected75 = 0usize;

        Zip::from(&targets.obj_mask)
            .and(&targets.noobj_mask)
            .and(&targets.class_mask)
            .and(&targets.iou_scores)
            .and(objectness)
            .for_each(|&positive, &negative, &class_ok, &iou, &conf| {
                if positive {
                    conf_obj += conf;
                    class_hits += usize::from(class_ok);
                }
                if negative {
                    conf_noobj += conf;
                    num_noobj += 1;
                }
                let confident = conf > 0.5;
                num_confident += usize::from(confident);
                if positive && confident && class_ok {
                    detected50 += usize::from(iou > 0.5);
                    detected75 += usize::from(iou > 0.75);
                }
            });

        let ratio = |count: f32, total: usize| {
            if total == 0 {
                0.0
            } else {
                count / total as f32
            }
        };

        Self {
            grid_size,
            num_targets,
            cls_acc: ratio(class_hits as f32, num_targets),
            recall50: ratio(detected50 as f32, num_targets),
            recall75: ratio(detected75 as f32, num_targets),
            precision: ratio(detected50 as f32, num_confident),
            conf_obj: ratio(conf_obj, num_targets),
            conf_noobj: ratio(conf_noobj, num_noobj),
        }
    }

    /// Mean of each field over the scales; `grid_size` keeps the finest grid.
    pub fn mean(scales: &[HeadMetrics]) -> Self {
        if scales.is_empty() {
            return Self::default();
        }
        let count = scales.len() as f32;
        let mean = |field: fn(&HeadMetrics) -> f32| scales.iter().map(field).sum::<f32>() / count;
        Self {
            grid_size: scales.iter().map(|m| m.grid_size).max().unwrap_or_default(),
            num_targets: scales.iter().map(|m| m.num_targets).sum(),
            cls_acc: mean(|m| m.cls_acc),
            recall50: mean(|m| m.recall50),
            recall75: mean(|m| m.recall75),
            precision: mean(|m| m.precision),
            conf_obj: mean(|m| m.conf_obj),
            conf_noobj: mean(|m| m.conf_noobj),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::target::{GroundTruth, GroundTruthBox, TargetAssigner};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array4, Array5};

    #[test]
    fn perfect_prediction_scores_full_recall() {
        let anchors = [[1.0, 1.0], [2.0, 2.0], [4.0, 4.0]];
        let mut boxes = Array5::<f32>::zeros((1, 3, 4, 4, 4));
        let mut classes = Array5::<f32>::zeros((1, 3, 4, 4, 2));
        // Truth: centre (1.5, 2.5), size 2x2 in grid units, anchor 1.
        for (k, value) in [1.5, 2.5, 2.0, 2.0].into_iter().enumerate() {
            boxes[[0, 1, 2, 1, k]] = value;
        }
        classes[[0, 1, 2, 1, 1]] = 0.9;
        let truth = GroundTruth::new(vec![GroundTruthBox {
            batch_index: 0,
            class_label: 1,
            cx: 0.375,
            cy: 0.625,
            w: 0.5,
            h: 0.5,
        }]);
        let targets = TargetAssigner::default()
            .assign(boxes.view(), classes.view(), &truth, &anchors)
            .unwrap();

        let mut objectness = Array4::<f32>::from_elem((1, 3, 4, 4), 0.1);
        objectness[[0, 1, 2, 1]] = 0.8;
        let metrics = HeadMetrics::new(&targets, objectness.view());

        assert_eq!(metrics.num_targets, 1);
        assert_eq!(metrics.grid_size, 4);
        assert_abs_diff_eq!(metrics.cls_acc, 1.0);
        assert_abs_diff_eq!(metrics.recall50, 1.0);
        assert_abs_diff_eq!(metrics.recall75, 1.0);
        assert_abs_diff_eq!(metrics.precision, 1.0);
        assert_abs_diff_eq!(metrics.conf_obj, 0.8, epsilon = 1e-6);
        assert_abs_diff_eq!(metrics.conf_noobj, 0.1, epsilon = 1e-6);
    }

    #[test]
    fn empty_targets_report_zero() {
        let anchors = [[1.0, 1.0], [2.0, 2.0], [4.0, 4.0]];
        let boxes = Array5::<f32>::zeros((2, 3, 4, 4, 4));
        let classes = Array5::<f32>::zeros((2, 3, 4, 4, 2));
        let targets = TargetAssigner::default()
            .assign(boxes.view(), classes.view(), &GroundTruth::default(), &anchors)
            .unwrap();
        let objectness = Array4::<f32>::from_elem((2, 3, 4, 4), 0.7);
        let metrics = HeadMetrics::new(&targets, objectness.view());
        assert_eq!(metrics.num_targets, 0);
        assert_eq!(metrics.recall50, 0.0);
        assert_eq!(metrics.precision, 0.0);
        assert_abs_diff_eq!(metrics.conf_noobj, 0.7, epsilon = 1e-6);
    }
}
