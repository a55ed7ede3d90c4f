use crate::error::{Error, Result};

/// Anchor `(width, height)` pairs in input pixels, one triple per detection scale.
pub type AnchorSet = [[f32; 2]; 3];

pub const NUM_SCALES: usize = 3;
pub const ANCHORS_PER_SCALE: usize = 3;

#[derive(Debug, Clone)]
pub struct Config {
    pub image_size: usize,
    pub num_classes: usize,
    /// Finest scale first.
    pub anchors: [AnchorSet; NUM_SCALES],
    /// Channel count of each external feature map feeding the output projections.
    pub feature_channels: [usize; NUM_SCALES],
    pub ignore_threshold: f32,
    pub obj_scale: f64,
    pub noobj_scale: f64,
    pub label_smoothing: f32,
    pub confidence_threshold: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_size: 608,
            num_classes: 80,
            anchors: [
                [[10.0, 13.0], [16.0, 30.0], [33.0, 23.0]],
                [[30.0, 61.0], [62.0, 45.0], [59.0, 119.0]],
                [[116.0, 90.0], [156.0, 198.0], [373.0, 326.0]],
            ],
            feature_channels: [128, 256, 512],
            ignore_threshold: 0.5,
            obj_scale: 1.0,
            noobj_scale: 100.0,
            label_smoothing: 0.9,
            confidence_threshold: 0.5,
        }
    }
}

impl Config {
    /// Channels of a raw head output: `anchors * (x, y, w, h, obj, classes...)`.
    pub fn output_channels(&self) -> usize {
        ANCHORS_PER_SCALE * (5 + self.num_classes)
    }

    pub fn validate(&self) -> Result<()> {
        if self.image_size == 0 {
            return Err(Error::InvalidConfig("image_size must be positive".into()));
        }
        if self.num_classes == 0 {
            return Err(Error::InvalidConfig("num_classes must be positive".into()));
        }
        let bad_anchor = self
            .anchors
            .iter()
            .flatten()
            .any(|&[w, h]| !(w.is_finite() && h.is_finite() && w > 0.0 && h > 0.0));
        if bad_anchor {
            return Err(Error::InvalidConfig(
                "anchor sizes must be finite and positive".into(),
            ));
        }
        if self.feature_channels.contains(&0) {
            return Err(Error::InvalidConfig(
                "feature channel counts must be positive".into(),
            ));
        }
        for (name, value) in [
            ("ignore_threshold", self.ignore_threshold),
            ("label_smoothing", self.label_smoothing),
            ("confidence_threshold", self.confidence_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidConfig(format!(
                    "{name} must be in [0, 1], got {value}"
                )));
            }
        }
        if self.obj_scale < 0.0 || self.noobj_scale < 0.0 {
            return Err(Error::InvalidConfig(
                "objectness loss weights must be non-negative".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn head_config(&self, scale: usize) -> HeadConfig {
        HeadConfig {
            anchors: self.anchors[scale],
            image_size: self.image_size,
            num_classes: self.num_classes,
            ignore_threshold: self.ignore_threshold,
            obj_scale: self.obj_scale,
            noobj_scale: self.noobj_scale,
            label_smoothing: self.label_smoothing,
        }
    }
}

/// The slice of [`Config`] a single detection scale needs.
#[derive(Debug, Clone)]
pub struct HeadConfig {
    pub anchors: AnchorSet,
    pub image_size: usize,
    pub num_classes: usize,
    pub ignore_threshold: f32,
    pub obj_scale: f64,
    pub noobj_scale: f64,
    pub label_smoothing: f32,
}

impl HeadConfig {
    pub fn new(anchors: AnchorSet, image_size: usize, num_classes: usize) -> Self {
        let defaults = Config::default();
        Self {
            anchors,
            image_size,
            num_classes,
            ignore_threshold: defaults.ignore_threshold,
            obj_scale: defaults.obj_scale,
            noobj_scale: defaults.noobj_scale,
            label_smoothing: defaults.label_smoothing,
        }
    }
}
