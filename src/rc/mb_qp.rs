use super::qscale::*;

/// Quantizer of one block after activity modulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MbQp {
    // unclamped value used to update the rate model
    pub model_qp: i32,
    // value clamped to the codec range, used for coding
    pub applied_qp: i32,
}

/// Scales the picture quantizer (Q6 qscale) per block by relative spatial
/// activity.
#[derive(Debug, Clone, Copy)]
pub struct MbQpModulator {
    frame_qp: i32,
    avg_activity: u32,
    min_qp: i32,
    max_qp: i32,
}

impl MbQpModulator {
    pub fn new(frame_qp: i32) -> Self {
        MbQpModulator {
            frame_qp,
            avg_activity: 0,
            min_qp: qp_to_qscale_q6(0),
            max_qp: qp_to_qscale_q6(MAX_CODEC_QP),
        }
    }

    pub fn set_frame_qp(&mut self, frame_qp: i32) {
        self.frame_qp = frame_qp;
    }

    pub fn set_avg_activity(&mut self, avg_activity: u32) {
        self.avg_activity = avg_activity;
    }

    pub fn set_qp_range(&mut self, min_qp: i32, max_qp: i32) {
        self.min_qp = min_qp;
        self.max_qp = max_qp;
    }

    pub fn modulate(&self, block_activity: u32) -> MbQp {
        let model_qp = modulate_by_activity(self.frame_qp, block_activity, self.avg_activity);
        let applied_qp = if model_qp > self.max_qp {
            self.max_qp
        } else if model_qp < self.min_qp {
            self.min_qp
        } else {
            model_qp
        };
        MbQp {
            model_qp,
            applied_qp,
        }
    }

    pub fn frame_qp(&self) -> i32 {
        self.frame_qp
    }

    pub fn avg_activity(&self) -> u32 {
        self.avg_activity
    }
}

/// `qp * (2a + A) / (a + 2A)` for block activity `a` and average `A`,
/// capped at 1.5x the picture quantizer.
pub fn modulate_by_activity(frame_qp: i32, block_activity: u32, avg_activity: u32) -> i32 {
    if avg_activity == 0 {
        return frame_qp;
    }
    let a = block_activity as i64;
    let avg = avg_activity as i64;
    let num = 2 * a + avg;
    let den = a + 2 * avg;
    let qp = (frame_qp as i64 * num + den / 2) / den;
    qp.min(frame_qp as i64 * 3 / 2) as i32
}
