use crate::api::*;

// qscale reached at one bit per pixel
const QP_FOR_ONE_BPP: i64 = 10;
const QP_FOR_ONE_BPP_HIGH_BITRATE: i64 = 6;

// P and B qscale relative to I, Q4
const PIC_TYPE_QSCALE_RATIO_Q4: [i64; MAX_PIC_TYPE] = [16, 18, 20];

const BPP_Q_FAC: u32 = 10;

/// First-frame quantizer estimate from the available bits per pixel.
///
/// Returned values are in the qscale domain, clamped to `[1, max_qp]`.
#[derive(Debug, Clone, Copy)]
pub struct InitQp {
    max_qp: i32,
    pels_ref: i64,
    high_bitrate: bool,
}

impl InitQp {
    pub fn new(max_qp: i32, pels_ref: i64, high_bitrate: bool) -> Self {
        InitQp {
            max_qp: max_qp.max(1),
            pels_ref,
            high_bitrate,
        }
    }

    pub fn estimate(&self, pic_type: PictureType, bits: i64, pels: i64) -> i32 {
        let pels = if pels > 0 { pels } else { self.pels_ref };
        if bits <= 0 || pels <= 0 {
            return self.max_qp;
        }

        let bpp_q10 = (bits << BPP_Q_FAC) / pels;
        if bpp_q10 == 0 {
            return self.max_qp;
        }

        let one_bpp = if self.high_bitrate {
            QP_FOR_ONE_BPP_HIGH_BITRATE
        } else {
            QP_FOR_ONE_BPP
        };
        let qscale_q4 = (one_bpp << (4 + BPP_Q_FAC)) / bpp_q10;
        let qscale = (qscale_q4 * PIC_TYPE_QSCALE_RATIO_Q4[pic_type.idx()] + 128) >> 8;

        qscale.max(1).min(self.max_qp as i64) as i32
    }

    pub fn change_max_qp(&mut self, max_qp: i32) {
        self.max_qp = max_qp.max(1);
    }

    pub fn max_qp(&self) -> i32 {
        self.max_qp
    }
}
