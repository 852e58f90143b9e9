use log::*;

use super::*;

pub const DEFAULT_MAX_FRAMES_MODELLED: usize = 20;

pub(crate) const MAX_ACTIVE_FRAMES: usize = 16;
pub(crate) const MIN_FRAMES_FOR_QUAD_MODEL: usize = 5;
pub(crate) const MIN_FRAMES_FOR_LIN_MODEL: usize = 3;
// a sample whose bits are already stored this many times is dropped
const MAX_SAME_BITS_SAMPLES: usize = 3;

const REFINE_UPPER_THR: f64 = 0.0625;
const REFINE_LOWER_THR: f64 = 0.0225;
const QUAD_DEV_THR: f64 = 0.25;
const LIN_DEV_THR: f64 = 0.25;

// qp spread (Q4) the active samples need for each model
const QUAD_QP_SPREAD_Q4: i32 = 21;
const LIN_QP_SPREAD_Q4: i32 = 19;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct RdSample {
    res_bits: u32,
    sad: u64,
    qp_q6: i32,
    num_skips: u32,
}

impl RdSample {
    fn x(&self) -> f64 {
        sad_over_qp(self.sad, self.qp_q6)
    }
}

fn sad_over_qp(sad: u64, qp_q6: i32) -> f64 {
    sad as f64 * (1 << QSCALE_Q_FAC) as f64 / qp_q6.max(1) as f64
}

/// Bits as a function of `x = SAD / qscale`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RdModelKind {
    // bits = a*x + b*x^2 + c
    Quadratic { a: f64, b: f64, c: f64 },
    // bits = a*x + c
    Linear { a: f64, c: f64 },
    // bits = a*x, slope of the newest sample
    PreviousFrame { a: f64 },
}

impl RdModelKind {
    pub fn evaluate(&self, x: f64) -> f64 {
        match *self {
            RdModelKind::Quadratic { a, b, c } => {
                // left of the vertex the curve would fall again
                let x = if b > 0.0 { x.max(-a / (2.0 * b)) } else { x };
                a * x + b * x * x + c
            }
            RdModelKind::Linear { a, c } => a * x + c,
            RdModelKind::PreviousFrame { a } => a * x,
        }
    }

    /// x producing `bits`, None when the model cannot reach it.
    pub fn invert(&self, bits: f64) -> Option<f64> {
        let x = match *self {
            RdModelKind::Quadratic { a, b, c } => {
                if b == 0.0 {
                    if a <= 0.0 {
                        return None;
                    }
                    (bits - c) / a
                } else {
                    let det = a * a - 4.0 * b * (c - bits);
                    if det < 0.0 {
                        return None;
                    }
                    (det.sqrt() - a) / (2.0 * b)
                }
            }
            RdModelKind::Linear { a, c } => {
                if a <= 0.0 {
                    return None;
                }
                (bits - c) / a
            }
            RdModelKind::PreviousFrame { a } => {
                if a <= 0.0 {
                    return None;
                }
                bits / a
            }
        };
        if x < 0.0 || !x.is_finite() {
            None
        } else {
            Some(x)
        }
    }
}

impl Default for RdModelKind {
    fn default() -> Self {
        RdModelKind::PreviousFrame { a: 0.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Want {
    Quad,
    Lin,
    Prev,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refine {
    Reject,
    Refit,
    Accept,
}

#[derive(Debug, Default)]
struct FitStats {
    n: usize,
    sy: f64,
    sxy: f64,
    sx2y: f64,
    sx: f64,
    sx2: f64,
    sx3: f64,
    sx4: f64,
}

impl FitStats {
    fn accumulate<'a>(samples: impl Iterator<Item = &'a RdSample>) -> Self {
        let mut st = FitStats::default();
        for s in samples {
            let x = s.x();
            let y = s.res_bits as f64;
            st.n += 1;
            st.sy += y;
            st.sxy += x * y;
            st.sx2y += x * x * y;
            st.sx += x;
            st.sx2 += x * x;
            st.sx3 += x * x * x;
            st.sx4 += x * x * x * x;
        }
        if st.n > 0 {
            let n = st.n as f64;
            st.sy /= n;
            st.sxy /= n;
            st.sx2y /= n;
            st.sx /= n;
            st.sx2 /= n;
            st.sx3 /= n;
            st.sx4 /= n;
        }
        st
    }

    // (a, b, c) of a*x + b*x^2 + c
    fn quadratic(&self) -> Option<(f64, f64, f64)> {
        if self.n < MIN_FRAMES_FOR_QUAD_MODEL {
            return None;
        }
        let vx2y = self.sx2y - self.sx2 * self.sy;
        let vxy = self.sxy - self.sx * self.sy;
        let vx2x = self.sx3 - self.sx2 * self.sx;
        let vx2x2 = self.sx4 - self.sx2 * self.sx2;
        let vxx = self.sx2 - self.sx * self.sx;

        let den = vx2x * vx2x - vx2x2 * vxx;
        if den == 0.0 || !den.is_finite() {
            return None;
        }
        let b = (vxy * vx2x - vx2y * vxx) / den;
        let a = (vx2y * vx2x - vxy * vx2x2) / den;
        let c = self.sy - a * self.sx - b * self.sx2;
        Some((a, b, c))
    }

    // (a, c) of a*x + c
    fn linear(&self) -> Option<(f64, f64)> {
        if self.n <= 1 {
            return None;
        }
        let vxx = self.sx2 - self.sx * self.sx;
        // all x equal up to rounding
        if vxx <= self.sx2 * f64::EPSILON * 16.0 {
            return None;
        }
        let vxy = self.sxy - self.sx * self.sy;
        let a = vxy / vxx;
        Some((a, self.sy - a * self.sx))
    }
}

/// Rate-distortion model of one picture type.
///
/// Keeps the last `max_frames` (bits, SAD, qscale) samples and fits the
/// best supported model over a recent, QP-diverse subset of them.
#[derive(Debug, Clone)]
pub struct RdModel {
    samples: Vec<RdSample>,
    curr: usize,
    num_frames: usize,
    kind: RdModelKind,
    prev_frame_a: f64,
}

impl RdModel {
    pub fn new(max_frames: usize) -> Self {
        let max_frames = max_frames.max(1);
        RdModel {
            samples: vec![RdSample::default(); max_frames],
            curr: 0,
            num_frames: 0,
            kind: RdModelKind::default(),
            prev_frame_a: 0.0,
        }
    }

    pub fn reset(&mut self) {
        for s in self.samples.iter_mut() {
            *s = RdSample::default();
        }
        self.curr = 0;
        self.num_frames = 0;
        self.kind = RdModelKind::default();
        self.prev_frame_a = 0.0;
    }

    pub fn is_valid(&self) -> bool {
        self.num_frames > 0
    }

    pub fn model(&self) -> RdModelKind {
        self.kind
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    pub fn max_frames(&self) -> usize {
        self.samples.len()
    }

    /// Slope of the previous-frame model, also the fallback of every query.
    pub fn linear_coefficient(&self) -> f64 {
        self.prev_frame_a
    }

    pub fn set_linear_coefficient(&mut self, a: f64) {
        self.prev_frame_a = a;
        self.kind = RdModelKind::PreviousFrame { a };
    }

    fn prev_index(&self, idx: usize) -> usize {
        (idx + self.samples.len() - 1) % self.samples.len()
    }

    fn newest(&self) -> usize {
        self.prev_index(self.curr)
    }

    // stored samples from the newest to the oldest
    fn history(&self) -> impl Iterator<Item = &RdSample> + '_ {
        let len = self.samples.len();
        let newest = self.newest();
        (0..self.num_frames).map(move |k| &self.samples[(newest + len - k) % len])
    }

    pub fn add_frame(&mut self, res_bits: u32, avg_qp_q6: i32, sad: u64, num_skips: u32) {
        let repeats = self.history().filter(|s| s.res_bits == res_bits).count();
        if repeats >= MAX_SAME_BITS_SAMPLES {
            debug!("rd model: dropping repeated sample of {} bits", res_bits);
            return;
        }

        self.samples[self.curr] = RdSample {
            res_bits,
            sad,
            qp_q6: avg_qp_q6,
            num_skips,
        };
        self.curr = (self.curr + 1) % self.samples.len();
        self.num_frames = (self.num_frames + 1).min(self.samples.len());

        self.update_model();
    }

    // true if the qp of sample `idx` appears twice among the `count`
    // samples newer than it
    fn qp_seen_twice(&self, idx: usize, count: usize) -> bool {
        let qp = self.samples[idx].qp_q6;
        let mut j = idx;
        let mut seen = 0;
        for _ in 0..count {
            j = (j + 1) % self.samples.len();
            if self.samples[j].qp_q6 == qp {
                seen += 1;
                if seen >= 2 {
                    return true;
                }
            }
        }
        false
    }

    fn select_points(&self) -> (Vec<usize>, i32, i32) {
        let mut points = Vec::with_capacity(MAX_ACTIVE_FRAMES + 2);
        let mut min_qp = MAX_MPEG2_QP << QSCALE_Q_FAC;
        let mut max_qp = 0;

        let active = self.num_frames.min(MAX_ACTIVE_FRAMES);
        let mut idx = self.newest();
        for i in 0..active {
            let s = &self.samples[idx];
            let reject = i != 0 && (s.num_skips != 0 || self.qp_seen_twice(idx, i));
            if !reject {
                points.push(idx);
                min_qp = min_qp.min(s.qp_q6);
                max_qp = max_qp.max(s.qp_q6);
            }
            idx = self.prev_index(idx);
        }

        // older samples may still extend the qp range
        let (mut lo, mut hi) = (min_qp, max_qp);
        let (mut lo_idx, mut hi_idx) = (None, None);
        for _ in active..self.num_frames {
            let s = &self.samples[idx];
            if s.num_skips == 0 {
                if s.qp_q6 < lo {
                    lo = s.qp_q6;
                    lo_idx = Some(idx);
                }
                if s.qp_q6 > hi {
                    hi = s.qp_q6;
                    hi_idx = Some(idx);
                }
            }
            idx = self.prev_index(idx);
        }
        points.extend(lo_idx);
        points.extend(hi_idx);

        (points, min_qp, max_qp)
    }

    fn avg_sqr_dev(&self, points: &[usize], mask: &[bool], f: impl Fn(f64) -> f64) -> (f64, Vec<f64>) {
        let mut sum = 0.0;
        let mut count = 0;
        let mut devs = vec![0.0; points.len()];
        for (k, &idx) in points.iter().enumerate() {
            if !mask[k] {
                continue;
            }
            let s = &self.samples[idx];
            let y = (s.res_bits as f64).max(1.0);
            let d = (y - f(s.x())) / y;
            devs[k] = d * d;
            sum += devs[k];
            count += 1;
        }
        let avg = if count > 0 { sum / count as f64 } else { 0.0 };
        (avg, devs)
    }

    // drops points deviating more than average and judges the fit
    fn refine(&self, points: &[usize], mask: &mut [bool], q: (f64, f64, f64)) -> (Refine, f64) {
        let (a, b, c) = q;
        let (avg, devs) = self.avg_sqr_dev(points, mask, |x| a * x + b * x * x + c);
        for (k, dev) in devs.iter().enumerate() {
            if mask[k] && *dev > avg {
                mask[k] = false;
            }
        }
        let check = if avg > REFINE_UPPER_THR {
            Refine::Reject
        } else if avg < REFINE_LOWER_THR {
            Refine::Accept
        } else {
            Refine::Refit
        };
        (check, avg)
    }

    fn update_model(&mut self) {
        let (points, min_qp, max_qp) = self.select_points();
        let n = points.len();

        let mut want = Want::Quad;
        if n < MIN_FRAMES_FOR_QUAD_MODEL || max_qp < (QUAD_QP_SPREAD_Q4 * min_qp) >> 4 {
            want = Want::Lin;
        }
        if want == Want::Lin && (n < MIN_FRAMES_FOR_LIN_MODEL || max_qp < (LIN_QP_SPREAD_Q4 * min_qp) >> 4)
        {
            want = Want::Prev;
        }

        let stats = FitStats::accumulate(points.iter().map(|&i| &self.samples[i]));
        let mut quad = None;
        if want == Want::Quad {
            quad = stats.quadratic();
            if quad.is_none() {
                want = Want::Lin;
            }
        }

        let all = vec![true; n];
        let lin = stats.linear().filter(|&(a, c)| c <= 0.0 && a >= 0.0);
        let lin_dev = lin.map(|(a, c)| self.avg_sqr_dev(&points, &all, |x| a * x + c).0);

        let newest = &self.samples[self.newest()];
        self.prev_frame_a = if newest.sad == 0 {
            0.0
        } else {
            newest.res_bits as f64 / newest.x()
        };

        let mut quad_dev = 0.0;
        if let Some(q) = quad {
            let mut mask = all.clone();
            let (check, dev) = self.refine(&points, &mut mask, q);
            quad_dev = dev;
            if check != Refine::Accept {
                let stats = FitStats::accumulate(
                    points
                        .iter()
                        .zip(mask.iter())
                        .filter(|(_, keep)| **keep)
                        .map(|(&i, _)| &self.samples[i]),
                );
                match stats.quadratic() {
                    Some(q2) => {
                        quad = Some(q2);
                        let (check, dev) = self.refine(&points, &mut mask, q2);
                        quad_dev = dev;
                        if check == Refine::Reject && lin_dev.map_or(false, |d| d < dev) {
                            want = Want::Lin;
                        }
                    }
                    None => want = Want::Lin,
                }
            }
        }

        if want == Want::Quad && quad.map_or(true, |(_, b, _)| !(b > 0.0)) {
            want = Want::Lin;
        }
        if want == Want::Lin && lin.is_none() {
            want = Want::Prev;
        }
        if want == Want::Quad && quad_dev > QUAD_DEV_THR {
            want = Want::Prev;
        }
        if want == Want::Lin && lin_dev.map_or(true, |d| d > LIN_DEV_THR) {
            want = Want::Prev;
        }

        self.kind = match (want, quad, lin) {
            (Want::Quad, Some((a, b, c)), _) => RdModelKind::Quadratic { a, b, c },
            (Want::Lin, _, Some((a, c))) => RdModelKind::Linear { a, c },
            _ => RdModelKind::PreviousFrame {
                a: self.prev_frame_a,
            },
        };
        debug!("rd model: {} points -> {:?}", n, self.kind);
    }

    /// Bits the selected model predicts for `sad` coded at `qp_q6`.
    pub fn estimate_bits(&self, sad: u64, qp_q6: i32) -> u32 {
        let bits = self.kind.evaluate(sad_over_qp(sad, qp_q6)).max(0.0).round();
        bits.min(u32::MAX as f64) as u32
    }

    /// Q6 qscale expected to produce `target_bits` for `sad`, clipped to
    /// `[min_qp_q6, max_qp_q6]`.
    pub fn find_qp_for_target_bits(
        &self,
        target_bits: u32,
        sad: u64,
        min_qp_q6: i32,
        max_qp_q6: i32,
    ) -> i32 {
        let bits = target_bits as f64;
        let x = self
            .kind
            .invert(bits)
            .or_else(|| {
                RdModelKind::PreviousFrame {
                    a: self.prev_frame_a,
                }
                .invert(bits)
            })
            .unwrap_or(0.0);

        let max_q6 = MAX_MPEG2_QP << QSCALE_Q_FAC;
        let qp = if x > 0.0 {
            let qp = (sad as f64 * (1 << QSCALE_Q_FAC) as f64 / x).round();
            if qp > max_q6 as f64 {
                max_q6
            } else {
                qp as i32
            }
        } else {
            max_q6
        };

        if qp > max_qp_q6 {
            max_qp_q6
        } else if qp < min_qp_q6 {
            min_qp_q6
        } else {
            qp
        }
    }
}

impl Default for RdModel {
    fn default() -> Self {
        RdModel::new(DEFAULT_MAX_FRAMES_MODELLED)
    }
}
