use super::QSCALE_Q_FAC;
use crate::api::*;

// qscale of each picture type relative to I, Q4
const KP_KB_Q4: [i64; MAX_PIC_TYPE] = [16, 18, 20];
// at high bitrates B pictures stay at the P quantizer
const KP_KB_HIGH_BITRATE_Q4: [i64; MAX_PIC_TYPE] = [16, 18, 18];

// allowed swing against the previous reference picture, Q4
const HI_DEV_Q4: i64 = 26;
const LO_DEV_Q4: i64 = 14;
const LO_DEV_LAYERED_Q4: i64 = 12;

/// Quantizers of the pictures coded so far, used to keep the next
/// picture's quantizer close to its reference.
#[derive(Debug, Clone, Copy)]
pub struct PrevFrameQp {
    qp_q6: [Option<i32>; MAX_PIC_TYPE],
    ref_type: Option<PictureType>,
    high_bitrate: bool,
    num_b_layers: i32,
}

impl PrevFrameQp {
    pub fn new(high_bitrate: bool, num_b_layers: i32) -> Self {
        PrevFrameQp {
            qp_q6: [None; MAX_PIC_TYPE],
            ref_type: None,
            high_bitrate,
            num_b_layers,
        }
    }

    pub fn update(&mut self, pic_type: PictureType, qp_q6: i32, is_ref: bool) {
        if qp_q6 <= 0 {
            return;
        }
        self.qp_q6[pic_type.idx()] = Some(qp_q6);
        if is_ref {
            self.ref_type = Some(pic_type);
        }
    }

    pub fn qp_q6(&self, pic_type: PictureType) -> Option<i32> {
        self.qp_q6[pic_type.idx()]
    }

    pub fn ref_type(&self) -> Option<PictureType> {
        self.ref_type
    }

    fn kp_kb(&self, pic_type: PictureType) -> i64 {
        if self.high_bitrate {
            KP_KB_HIGH_BITRATE_Q4[pic_type.idx()]
        } else {
            KP_KB_Q4[pic_type.idx()]
        }
    }

    /// Quantizer for a picture type that has no RD model yet. I pictures
    /// repeat the last I quantizer; P and B pictures scale the last
    /// reference quantizer by the Kp/Kb ratio, never going below it.
    pub fn ratio_qp_q6(&self, pic_type: PictureType) -> Option<i32> {
        if pic_type == PictureType::I {
            return self.qp_q6[PictureType::I.idx()];
        }
        let ref_type = self.ref_type?;
        let prev = self.qp_q6[ref_type.idx()]? as i64;
        let k_cur = self.kp_kb(pic_type);
        let k_ref = self.kp_kb(ref_type).min(k_cur);
        Some((prev * k_cur / k_ref) as i32)
    }

    /// `(lo, hi)` Q6 qscale range `pic_type` may take relative to the last
    /// reference picture. `None` until a reference picture was coded.
    pub fn swing_range(&self, pic_type: PictureType) -> Option<(i32, i32)> {
        let ref_type = self.ref_type?;
        let prev = self.qp_q6[ref_type.idx()]? as i64;
        let scaled = if ref_type == pic_type {
            prev
        } else {
            prev * self.kp_kb(pic_type) / self.kp_kb(ref_type)
        };

        // a P picture may rise from the I quantizer itself, not from Kp times it
        let hi_base = if pic_type == PictureType::P && ref_type == PictureType::I {
            prev
        } else {
            scaled
        };
        let mut hi = (hi_base * HI_DEV_Q4) >> 4;

        let lo_dev = if pic_type == PictureType::B || self.num_b_layers > 1 {
            LO_DEV_LAYERED_Q4
        } else {
            LO_DEV_Q4
        };
        let mut lo = (scaled * lo_dev) >> 4;

        // small quantizers must still be able to move
        if hi == scaled {
            hi = (hi * 18) >> 4;
        }
        if lo == scaled && lo > 1 << QSCALE_Q_FAC {
            lo = (lo * 14) >> 4;
        }
        Some((lo as i32, hi as i32))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn nothing_before_the_first_reference() {
        let mut prev = PrevFrameQp::new(false, 1);
        assert_eq!(prev.swing_range(PictureType::P), None);
        assert_eq!(prev.ratio_qp_q6(PictureType::P), None);

        // B pictures are no reference
        prev.update(PictureType::B, 640, false);
        assert_eq!(prev.ref_type(), None);
        assert_eq!(prev.qp_q6(PictureType::B), Some(640));
        assert_eq!(prev.ratio_qp_q6(PictureType::I), None);
    }

    #[test]
    fn ratio_follows_kp_kb() {
        let mut prev = PrevFrameQp::new(false, 1);
        prev.update(PictureType::I, 1600, true);
        assert_eq!(prev.ratio_qp_q6(PictureType::I), Some(1600));
        assert_eq!(prev.ratio_qp_q6(PictureType::P), Some(1800));
        assert_eq!(prev.ratio_qp_q6(PictureType::B), Some(2000));

        prev.update(PictureType::P, 1800, true);
        assert_eq!(prev.ratio_qp_q6(PictureType::B), Some(2000));
        assert_eq!(prev.ratio_qp_q6(PictureType::I), Some(1600));

        let mut hbr = PrevFrameQp::new(true, 1);
        hbr.update(PictureType::P, 1800, true);
        assert_eq!(hbr.ratio_qp_q6(PictureType::B), Some(1800));
    }

    #[test]
    fn swing_around_previous_reference() {
        let mut prev = PrevFrameQp::new(false, 1);
        prev.update(PictureType::P, 1600, true);
        assert_eq!(prev.swing_range(PictureType::P), Some((1400, 2600)));
        // 1600 * 20 / 18 = 1777
        assert_eq!(prev.swing_range(PictureType::B), Some((1332, 2887)));
        // 1600 * 16 / 18 = 1422
        assert_eq!(prev.swing_range(PictureType::I), Some((1244, 2310)));

        let layered = {
            let mut p = PrevFrameQp::new(false, 2);
            p.update(PictureType::P, 1600, true);
            p
        };
        assert_eq!(layered.swing_range(PictureType::P), Some((1200, 2600)));
    }

    #[test]
    fn p_after_i_rises_from_the_i_quantizer() {
        let mut prev = PrevFrameQp::new(false, 1);
        prev.update(PictureType::I, 1600, true);
        // lo from 1800, hi from 1600
        assert_eq!(prev.swing_range(PictureType::P), Some((1575, 2600)));
    }

    #[test]
    fn tiny_quantizers_still_move() {
        let mut prev = PrevFrameQp::new(false, 1);
        prev.update(PictureType::P, 1, true);
        let (lo, hi) = prev.swing_range(PictureType::P).unwrap();
        assert!(lo <= 1 && hi >= 1);

        prev.update(PictureType::P, 0, true);
        assert_eq!(prev.qp_q6(PictureType::P), Some(1));
    }
}
