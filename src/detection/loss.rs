use std::f64::consts::PI;

use candle_core::{Result, Tensor};

use crate::detection::bbox::smallest_enclosing_box;

/// Stability floor used throughout the box loss.
pub const CIOU_EPS: f64 = 1e-7;
/// Probabilities are kept this far from 0 and 1 before taking logs.
const BCE_EPS: f32 = 1e-7;

/// Loss terms of one detection scale, each a scalar tensor.
#[derive(Debug, Clone)]
pub struct HeadLoss {
    pub total: Tensor,
    pub box_loss: Tensor,
    pub obj_loss: Tensor,
    pub cls_loss: Tensor,
}

/// `tan(π/8)`: above it the series argument is shifted by `π/4`.
const TAN_PI_8: f64 = 0.414_213_562_373_095_1;
/// Odd Taylor coefficients of `atan` up to `t^17`; on `|t| <= tan(π/8)` the
/// truncation error stays below `1e-8`.
const ATAN_SERIES: [f64; 9] = [
    1.0,
    -1.0 / 3.0,
    1.0 / 5.0,
    -1.0 / 7.0,
    1.0 / 9.0,
    -1.0 / 11.0,
    1.0 / 13.0,
    -1.0 / 15.0,
    1.0 / 17.0,
];

/// 0/1 float mask of a comparison, kept out of the graph.
fn mask(condition: &Tensor, dtype: candle_core::DType) -> Result<Tensor> {
    Ok(condition.to_dtype(dtype)?.detach())
}

/// `m * a + (1 - m) * b`
fn blend(m: &Tensor, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    m.mul(a)?.add(&m.affine(-1.0, 1.0)?.mul(b)?)
}

/// Element-wise arctangent from basic tensor ops, so it runs and
/// differentiates on every device.
///
/// `|x| > 1` is folded onto `1 / |x|`, values above `tan(π/8)` are shifted
/// by `π/4`, and the rest goes through a short odd series.
pub fn atan(xs: &Tensor) -> Result<Tensor> {
    let dtype = xs.dtype();
    let sign = mask(&xs.ge(0.0)?, dtype)?.affine(2.0, -1.0)?;
    let magnitude = xs.abs()?;

    let outside = mask(&magnitude.gt(1.0)?, dtype)?;
    let folded = blend(&outside, &magnitude.maximum(1.0)?.recip()?, &magnitude)?;

    let shifted = mask(&folded.gt(TAN_PI_8)?, dtype)?;
    let reduced = (folded.affine(1.0, -1.0)? / folded.affine(1.0, 1.0)?)?;
    let t = blend(&shifted, &reduced, &folded)?;

    let t2 = t.sqr()?;
    let mut series = t2.affine(0.0, ATAN_SERIES[ATAN_SERIES.len() - 1])?;
    for &coefficient in ATAN_SERIES.iter().rev().skip(1) {
        series = (series.mul(&t2)? + coefficient)?;
    }
    let folded_atan = (t.mul(&series)? + (shifted * (PI / 4.0))?)?;

    let unfolded = folded_atan.affine(-1.0, PI / 2.0)?;
    sign.mul(&blend(&outside, &unfolded, &folded_atan)?)
}

/// Element-wise binary cross-entropy between probabilities and targets.
pub fn binary_cross_entropy(probs: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let probs = probs.clamp(BCE_EPS, 1.0 - BCE_EPS)?;
    let positive = targets.mul(&probs.log()?)?;
    let negative = targets
        .affine(-1.0, 1.0)?
        .mul(&probs.affine(-1.0, 1.0)?.log()?)?;
    positive.add(&negative)?.neg()
}

/// Complete-IoU penalty per box pair, `(N, 4)` centre-format boxes in.
///
/// `1 - IoU + d² / c² + α·v`, where `d` is the centre distance, `c` the
/// diagonal of the enclosing box and `v` the aspect-ratio disagreement.
/// `α` is a constant weight and carries no gradient.
pub fn ciou_penalty(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let column = |boxes: &Tensor, index: usize| -> Result<Tensor> {
        boxes.narrow(1, index, 1)?.squeeze(1)
    };
    let (px, py, pw, ph) = (column(pred, 0)?, column(pred, 1)?, column(pred, 2)?, column(pred, 3)?);
    let (tx, ty, tw, th) = (
        column(target, 0)?,
        column(target, 1)?,
        column(target, 2)?,
        column(target, 3)?,
    );

    let overlap = |pc: &Tensor, ps: &Tensor, tc: &Tensor, ts: &Tensor| -> Result<Tensor> {
        let p_half = (ps * 0.5)?;
        let t_half = (ts * 0.5)?;
        let low = pc.sub(&p_half)?.maximum(&tc.sub(&t_half)?)?;
        let high = pc.add(&p_half)?.minimum(&tc.add(&t_half)?)?;
        high.sub(&low)?.relu()
    };
    let intersection = overlap(&px, &pw, &tx, &tw)?.mul(&overlap(&py, &ph, &ty, &th)?)?;
    let union = ((pw.mul(&ph)? + tw.mul(&th)?)?.sub(&intersection)? + CIOU_EPS)?;
    let iou = intersection.div(&union)?;

    let center_distance = (px.sub(&tx)?.sqr()? + py.sub(&ty)?.sqr()?)?;
    let enclosing = smallest_enclosing_box(pred, target)?;
    let enclosing_w = enclosing.narrow(1, 2, 1)?.sub(&enclosing.narrow(1, 0, 1)?)?.squeeze(1)?;
    let enclosing_h = enclosing.narrow(1, 3, 1)?.sub(&enclosing.narrow(1, 1, 1)?)?.squeeze(1)?;
    let diagonal = ((enclosing_w.sqr()? + enclosing_h.sqr()?)? + CIOU_EPS)?;

    let target_angle = atan(&tw.div(&(&th + CIOU_EPS)?)?)?;
    let pred_angle = atan(&pw.div(&(&ph + CIOU_EPS)?)?)?;
    let v = (target_angle.sub(&pred_angle)?.sqr()? * (4.0 / (PI * PI)))?;
    let alpha = v
        .div(&((iou.affine(-1.0, 1.0)? + &v)? + CIOU_EPS)?)?
        .detach();

    let penalty = (iou.affine(-1.0, 1.0)? + center_distance.div(&diagonal)?)?;
    penalty.add(&alpha.mul(&v)?)
}
