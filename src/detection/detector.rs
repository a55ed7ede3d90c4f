use candle_core::Tensor;
use tracing::debug;

use crate::config::{Config, NUM_SCALES};
use crate::detection::head::DetectionHead;
use crate::detection::loss::HeadLoss;
use crate::detection::metrics::HeadMetrics;
use crate::detection::target::GroundTruth;
use crate::error::Result;

/// Result of a training forward pass.
#[derive(Debug, Clone)]
pub struct TrainingOutput {
    /// `(B, N, 5 + C)` over all scales, detached from the graph.
    pub detections: Tensor,
    /// Mean of the per-scale totals; the only tensor carrying gradients back.
    pub loss: Tensor,
    pub scale_losses: [HeadLoss; NUM_SCALES],
    pub scale_metrics: [HeadMetrics; NUM_SCALES],
}

/// Three detection heads, finest scale first.
#[derive(Debug, Clone)]
pub struct MultiScaleDetector {
    heads: [DetectionHead; NUM_SCALES],
}

impl MultiScaleDetector {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let heads = [0, 1, 2].map(|scale| DetectionHead::new(scale, config.head_config(scale)));
        Ok(Self { heads })
    }

    pub fn heads(&self) -> &[DetectionHead; NUM_SCALES] {
        &self.heads
    }

    /// Decoded detections of all scales, concatenated per image.
    pub fn infer(&mut self, features: &[Tensor; NUM_SCALES]) -> Result<Tensor> {
        let mut outputs = Vec::with_capacity(NUM_SCALES);
        for (head, features) in self.heads.iter_mut().zip(features) {
            outputs.push(head.infer(features)?);
        }
        Ok(Tensor::cat(&outputs, 1)?)
    }

    /// Detections plus the mean loss over the three scales.
    pub fn compute_loss(
        &mut self,
        features: &[Tensor; NUM_SCALES],
        truth: &GroundTruth,
    ) -> Result<TrainingOutput> {
        let mut outputs = Vec::with_capacity(NUM_SCALES);
        for (head, features) in self.heads.iter_mut().zip(features) {
            outputs.push(head.compute_loss(features, truth)?);
        }

        let detections = outputs
            .iter()
            .map(|output| output.output.detach())
            .collect::<Vec<_>>();
        let detections = Tensor::cat(&detections, 1)?;

        let totals = outputs
            .iter()
            .map(|output| output.loss.total.clone())
            .collect::<Vec<_>>();
        let loss = Tensor::stack(&totals, 0)?.mean_all()?;

        let scale_losses = [0, 1, 2].map(|scale| outputs[scale].loss.clone());
        let scale_metrics = [0, 1, 2].map(|scale| outputs[scale].metrics);
        debug!(
            targets = truth.len(),
            positives = scale_metrics.iter().map(|m| m.num_targets).sum::<usize>(),
            "computed multi-scale loss"
        );

        Ok(TrainingOutput {
            detections,
            loss,
            scale_losses,
            scale_metrics,
        })
    }
}
