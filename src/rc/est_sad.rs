use crate::api::*;

/// Predicts the SAD of the next picture of a given type from the SADs
/// observed so far.
#[derive(Debug, Clone, Default)]
pub struct EstSad {
    use_est_intra_sad: bool,
    prev_frm_sad: [u32; MAX_PIC_TYPE],
    prev_frm_intra_sad: u32,

    // P SAD accumulated over the current intra interval
    p_frm_ifi_sad: u64,
    num_p_frm_in_cur_ifi: u32,
    // average P SAD of the last and the second last intra intervals
    n1_p_frm_ifi_avg_sad: u32,
    n2_p_frm_ifi_avg_sad: u32,
    num_i_frames: u32,
}

impl EstSad {
    pub fn new(use_est_intra_sad: bool) -> Self {
        EstSad {
            use_est_intra_sad,
            ..Default::default()
        }
    }

    pub fn reset(&mut self) {
        *self = EstSad::new(self.use_est_intra_sad);
    }

    pub fn get_est_sad(&self, pic_type: PictureType) -> u32 {
        if pic_type == PictureType::I && self.use_est_intra_sad && self.num_i_frames >= 2 {
            if self.n2_p_frm_ifi_avg_sad == 0 {
                return self.prev_frm_sad[PictureType::I.idx()];
            }
            // scale the last intra SAD by how much the P content has changed
            let est = self.prev_frm_sad[PictureType::I.idx()] as u64
                * self.n1_p_frm_ifi_avg_sad as u64
                / self.n2_p_frm_ifi_avg_sad as u64;
            return est.min(u32::MAX as u64) as u32;
        }
        self.prev_frm_sad[pic_type.idx()]
    }

    pub fn update_actual_sad(&mut self, actual_sad: u32, pic_type: PictureType) {
        match pic_type {
            PictureType::I => {
                self.prev_frm_intra_sad = actual_sad;
                self.num_i_frames = (self.num_i_frames + 1).min(2);

                let avg = if self.num_p_frm_in_cur_ifi == 0 {
                    0
                } else {
                    (self.p_frm_ifi_sad / self.num_p_frm_in_cur_ifi as u64) as u32
                };
                self.n2_p_frm_ifi_avg_sad = self.n1_p_frm_ifi_avg_sad;
                self.n1_p_frm_ifi_avg_sad = avg;
                self.p_frm_ifi_sad = 0;
                self.num_p_frm_in_cur_ifi = 0;
            }
            PictureType::P => {
                self.p_frm_ifi_sad += actual_sad as u64;
                self.num_p_frm_in_cur_ifi += 1;
            }
            PictureType::B => {}
        }
        self.prev_frm_sad[pic_type.idx()] = actual_sad;
    }

    /// Folds an intra-cost based estimate into the P SAD prediction.
    ///
    /// The stored P SAD is scaled by `est / prev_p_sad` (Q4), averaged with
    /// its old value and clipped to 5/4 of it. A zero `prev_p_sad` leaves
    /// the state untouched.
    pub fn update_p_pic_sad(&mut self, est_sad: u32, prev_p_sad: u32) {
        if prev_p_sad == 0 {
            return;
        }
        let prev = self.prev_frm_sad[PictureType::P.idx()] as u64;
        let ratio_q4 = ((est_sad as u64) << 4) / prev_p_sad as u64;
        let scaled = (prev * ratio_q4 + 8) >> 4;
        let damped = (prev + scaled) / 2;
        let clipped = damped.min(prev * 5 / 4);
        self.prev_frm_sad[PictureType::P.idx()] = clipped.min(u32::MAX as u64) as u32;
    }

    pub fn prev_frame_sad(&self, pic_type: PictureType) -> u32 {
        self.prev_frm_sad[pic_type.idx()]
    }

    pub fn set_prev_frame_sad(&mut self, sad: u32, pic_type: PictureType) {
        self.prev_frm_sad[pic_type.idx()] = sad;
    }

    pub fn prev_frame_intra_sad(&self) -> u32 {
        self.prev_frm_intra_sad
    }

    pub fn set_prev_frame_intra_sad(&mut self, sad: u32) {
        self.prev_frm_intra_sad = sad;
    }
}
