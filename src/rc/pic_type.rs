use log::*;

use super::ring::*;
use crate::api::*;

pub const MAX_INTER_FRM_INT: i32 = 10;

const I: usize = 0;
const P: usize = 1;
const B: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GopParams {
    pub intra_frame_interval: i32,
    // number of B pictures in a sub-GOP plus one
    pub inter_frame_interval: i32,
    pub max_inter_frame_interval: i32,
    pub idr_period: i32,
    pub closed_gop: bool,
    pub num_b_layers: i32,
}

impl GopParams {
    pub fn validate(&self) -> Result<(), RcError> {
        let (intra, inter, max_inter) = (
            self.intra_frame_interval,
            self.inter_frame_interval,
            self.max_inter_frame_interval,
        );
        if intra < 1 {
            return Err(RcError::InvalidConfig(format!(
                "intra frame interval {} must be at least 1",
                intra
            )));
        }
        if inter < 1 || inter > max_inter || max_inter > MAX_INTER_FRM_INT {
            return Err(RcError::InvalidConfig(format!(
                "inter frame interval {} outside 1..={} (limit {})",
                inter, max_inter, MAX_INTER_FRM_INT
            )));
        }
        // the stack starts releasing pictures inside the first GOP
        if intra != 1 && (intra < max_inter || (self.closed_gop && intra - 1 < inter)) {
            return Err(RcError::InvalidConfig(format!(
                "intra frame interval {} too short for inter frame interval {} (max {})",
                intra, inter, max_inter
            )));
        }
        Ok(())
    }
}

/// Picture type counts of one GOP in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GopDistribution {
    pub frms: [i32; MAX_PIC_TYPE],
    // B pictures in the trailing sub-GOP shorter than the inter interval
    pub b_in_incomp_subgop: i32,
    // closed GOPs may end with two back to back P pictures
    pub extra_p: i32,
}

pub fn find_pic_distbn(intra: i32, inter: i32, closed_gop: bool) -> GopDistribution {
    let mut dist = GopDistribution {
        frms: [1, 0, 0],
        ..Default::default()
    };
    if intra <= 1 || inter < 1 {
        return dist;
    }

    let n = intra - 1;
    if closed_gop {
        let rem = n % inter;
        dist.frms[P] = n / inter + (rem > 0) as i32;
        dist.b_in_incomp_subgop = if rem > 0 { rem - 1 } else { 0 };
        dist.extra_p = (rem == 1) as i32;
    } else {
        dist.frms[P] = n / inter;
        dist.b_in_incomp_subgop = n - dist.frms[P] * inter;
    }
    dist.frms[B] = n - dist.frms[P];
    dist
}

#[derive(Debug, Clone, Copy, Default)]
struct PicSlot {
    pic_id: i32,
    disp_order_no: i32,
    // None marks the end of the stream
    pic_type: Option<PictureType>,
    is_scd: bool,
    filled: bool,
}

impl PicSlot {
    fn end_of_stream() -> Self {
        PicSlot {
            pic_id: -1,
            disp_order_no: -1,
            pic_type: None,
            is_scd: false,
            filled: true,
        }
    }
}

/// A picture released in encode order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PicDetails {
    pub pic_id: i32,
    // temporal reference inside the GOP
    pub disp_order_no: i32,
    pub pic_type: PictureType,
    pub is_scd: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    // the next picture in encode order has not arrived yet
    Buffering,
    Picture(PicDetails),
    EndOfStream,
}

/// Assigns picture types and reorders display order input into encode order.
///
/// Pictures are stored in a ring of `max_inter_frame_interval + 1` slots at
/// their encode position, so reading the ring sequentially yields encode
/// order. A reference picture is written `inter` slots ahead of the previous
/// one and the B pictures fill the slots in between.
#[derive(Debug, Clone)]
pub struct PicHandling {
    intra_frm_int: i32,
    inter_frm_int: i32,
    max_inter_frm_int: i32,
    idr_period: i32,
    is_gop_closed: bool,
    num_gop_in_idr_period: i32,
    num_b_layers: i32,

    stack: Ring<PicSlot>,

    // input side
    buf_pic_no: i32,
    pic_disp_order_no: i32,
    p_count_in_gop: i32,
    b_count_in_gop: i32,
    b_count_in_subgop: i32,
    b_pic_idx: RingIndex,
    ref_pic_idx: RingIndex,
    prev_b_pic_idx: RingIndex,
    is_first_gop: bool,
    b_in_incomp_subgop: i32,
    extra_p: i32,
    b_in_incomp_subgop_mix_gop: i32,
    extra_p_mix_gop: i32,
    frms_in_gop: [i32; MAX_PIC_TYPE],
    frms_in_cur_gop: [i32; MAX_PIC_TYPE],
    actual_frms_in_gop: [i32; MAX_PIC_TYPE],
    prev_pic: Option<PicSlot>,
    previous_pic_type: PictureType,

    // output side
    stack_count: Option<RingIndex>,
    rem_frms_in_gop: [i32; MAX_PIC_TYPE],
    last_frm_in_gop: bool,
    first_gop_encoded: bool,

    // pending reconfiguration
    change_in_inter_frm_int: bool,
    new_inter_frm_int: i32,
    change_in_intra_frm_int: bool,
    new_intra_frm_int: i32,

    force_i_frame: bool,
    // a GOP was cut short, picked up when its I picture leaves the stack
    forced_i_pending: bool,
    sum_remaining_frm_in_gop: i32,
    frames_in_fif_gop: i32,

    // temporal reference renumbering of open GOPs
    mod_temp_ref_cnt: i32,
    prev_intra_frame_interval: i32,
    pic_order_cnt_base_offset: i32,
    enable_modulo: bool,
    change_inter_frm_interval_correction: i32,
}

impl PicHandling {
    pub fn new(params: &GopParams) -> Result<Self, RcError> {
        params.validate()?;

        let intra = params.intra_frame_interval;
        let inter = params.inter_frame_interval;
        let max_inter = params.max_inter_frame_interval;
        let dist = find_pic_distbn(intra, inter, params.closed_gop);

        let num_gop_in_idr_period = if intra == params.idr_period || params.idr_period <= 0 {
            1
        } else {
            (params.idr_period + max_inter - 1) / intra
        };

        let stack: Ring<PicSlot> = Ring::new((max_inter + 1) as usize);
        let mut pic = PicHandling {
            intra_frm_int: intra,
            inter_frm_int: inter,
            max_inter_frm_int: max_inter,
            idr_period: params.idr_period,
            is_gop_closed: params.closed_gop,
            num_gop_in_idr_period,
            num_b_layers: params.num_b_layers,

            b_pic_idx: stack.at(2),
            ref_pic_idx: stack.start(),
            prev_b_pic_idx: stack.at(2),
            stack,

            buf_pic_no: 0,
            pic_disp_order_no: 0,
            p_count_in_gop: 0,
            b_count_in_gop: 0,
            b_count_in_subgop: 0,
            is_first_gop: true,
            b_in_incomp_subgop: dist.b_in_incomp_subgop,
            extra_p: dist.extra_p,
            b_in_incomp_subgop_mix_gop: dist.b_in_incomp_subgop,
            extra_p_mix_gop: dist.extra_p,
            frms_in_gop: dist.frms,
            frms_in_cur_gop: dist.frms,
            actual_frms_in_gop: dist.frms,
            prev_pic: None,
            previous_pic_type: PictureType::I,

            stack_count: None,
            rem_frms_in_gop: [0; MAX_PIC_TYPE],
            last_frm_in_gop: false,
            first_gop_encoded: false,

            change_in_inter_frm_int: false,
            new_inter_frm_int: inter,
            change_in_intra_frm_int: false,
            new_intra_frm_int: intra,

            force_i_frame: false,
            forced_i_pending: false,
            sum_remaining_frm_in_gop: 0,
            frames_in_fif_gop: 0,

            mod_temp_ref_cnt: 0,
            prev_intra_frame_interval: intra,
            pic_order_cnt_base_offset: 0,
            enable_modulo: false,
            change_inter_frm_interval_correction: 0,
        };
        pic.rem_frms_in_gop = pic.gop_remaining_template();

        debug!(
            "pic handling: intra {} inter {} max inter {} {} gop {:?}",
            intra,
            inter,
            max_inter,
            if params.closed_gop { "closed" } else { "open" },
            dist.frms
        );
        Ok(pic)
    }

    // The first open GOP leaves its trailing B pictures to the next GOP.
    fn gop_remaining_template(&self) -> [i32; MAX_PIC_TYPE] {
        let mut rem = self.actual_frms_in_gop;
        if !self.first_gop_encoded && !self.is_gop_closed && self.intra_frm_int != 1 {
            rem[B] = (rem[B] - self.b_in_incomp_subgop).max(0);
        }
        rem
    }

    fn next_pic_type(&self) -> PictureType {
        if self.buf_pic_no % self.inter_frm_int != 0
            && !(self.is_gop_closed && self.b_count_in_gop == self.frms_in_cur_gop[B])
        {
            PictureType::B
        } else if self.pic_disp_order_no == 0 {
            PictureType::I
        } else {
            PictureType::P
        }
    }

    pub fn register_new_intra_frame_interval(&mut self, intra_frame_interval: i32) {
        if intra_frame_interval < 1 {
            warn!("ignoring intra frame interval {}", intra_frame_interval);
            return;
        }
        self.change_in_intra_frm_int = true;
        self.new_intra_frm_int = intra_frame_interval;
    }

    pub fn register_new_inter_frame_interval(&mut self, inter_frame_interval: i32) {
        if inter_frame_interval < 1 || inter_frame_interval > self.max_inter_frm_int {
            warn!(
                "ignoring inter frame interval {} (max {})",
                inter_frame_interval, self.max_inter_frm_int
            );
            return;
        }
        self.change_in_inter_frm_int = true;
        self.new_inter_frm_int = inter_frame_interval;
    }

    fn start_new_gop(&mut self) {
        self.pic_disp_order_no = 0;
        self.buf_pic_no = 0;
        self.is_first_gop = false;
        self.extra_p_mix_gop = self.extra_p;
        if self.is_gop_closed {
            self.b_in_incomp_subgop_mix_gop = self.b_in_incomp_subgop;
        }

        // pictures of the interrupted GOP, up to the forced I picture
        self.frames_in_fif_gop = self.b_count_in_gop + self.p_count_in_gop + 1;
        self.sum_remaining_frm_in_gop = self.rem_frms_in_gop.iter().sum();
        self.frms_in_cur_gop = self.frms_in_gop;

        if self.stack_count.is_none() {
            self.stack_count = Some(self.stack.start());
        }
    }

    fn update_pic_distbn(&mut self, intra: i32, inter: i32, gop_boundary: bool) {
        let prev_inter = self.inter_frm_int;
        let pb_frms_till_prev_p = self.p_count_in_gop * prev_inter;

        let intra = if intra <= 0 { self.intra_frm_int } else { intra };
        let inter = if inter > self.max_inter_frm_int || inter <= 0 {
            self.inter_frm_int
        } else {
            inter
        };

        let old_cur_gop = self.frms_in_cur_gop;
        let dist = find_pic_distbn(intra, inter, self.is_gop_closed);
        self.frms_in_gop = dist.frms;
        self.actual_frms_in_gop = dist.frms;

        let (b_mix, extra_p_mix) = if gop_boundary {
            self.frms_in_cur_gop = dist.frms;
            (dist.b_in_incomp_subgop, dist.extra_p)
        } else {
            // the rest of the current GOP continues with the new interval
            let mix = find_pic_distbn(intra - pb_frms_till_prev_p, inter, self.is_gop_closed);
            self.frms_in_cur_gop = mix.frms;
            self.frms_in_cur_gop[P] += self.p_count_in_gop;
            self.frms_in_cur_gop[B] += self.b_count_in_gop;
            (mix.b_in_incomp_subgop, mix.extra_p)
        };

        // the GOP being encoded is the one being buffered
        let open_tail = if self.is_gop_closed {
            0
        } else {
            self.b_in_incomp_subgop_mix_gop
        };
        if self.pic_disp_order_no >= self.max_inter_frm_int - 1 - open_tail {
            for i in 0..MAX_PIC_TYPE {
                self.rem_frms_in_gop[i] =
                    (self.rem_frms_in_gop[i] + self.frms_in_cur_gop[i] - old_cur_gop[i]).max(0);
            }
            if !self.is_gop_closed {
                self.rem_frms_in_gop[B] = (self.rem_frms_in_gop[B] + prev_inter - inter).max(0);
            }
        }

        self.buf_pic_no = if self.pic_disp_order_no == 0 { 0 } else { 1 };
        self.b_count_in_subgop = 0;

        self.inter_frm_int = inter;
        self.intra_frm_int = intra;
        self.b_in_incomp_subgop = dist.b_in_incomp_subgop;
        self.extra_p = dist.extra_p;
        self.b_in_incomp_subgop_mix_gop = b_mix;
        self.extra_p_mix_gop = extra_p_mix;

        debug!(
            "pic handling: intra {} inter {} gop {:?} current gop {:?}",
            intra, inter, self.frms_in_gop, self.frms_in_cur_gop
        );
    }

    /// Stores a picture arriving in display order at its encode position.
    pub fn add_picture(&mut self, pic_id: i32, hint: PicHint) {
        if hint != PicHint::Auto {
            self.force_i_frame = true;
        }

        let mut is_scd = false;
        let mut gop_cut = false;
        if self.force_i_frame {
            let intra = self.intra_frm_int;
            let inter = self.inter_frm_int;
            // an open GOP with no trailing B pictures behaves as closed
            let temp_closed = intra % inter == 1 || self.is_gop_closed;
            let cur_type = self.next_pic_type();
            let at_boundary = if intra % inter == 0 {
                cur_type == PictureType::P
            } else {
                self.b_count_in_subgop == self.b_in_incomp_subgop
            };

            if cur_type == PictureType::I {
                self.force_i_frame = false;
            } else if inter == 1 {
                self.start_new_gop();
                gop_cut = true;
            } else if !temp_closed && at_boundary {
                self.start_new_gop();
                if self.b_count_in_subgop > 0 {
                    self.b_pic_idx = self.b_pic_idx.next();
                }
                gop_cut = true;
            } else if temp_closed
                && self.previous_pic_type == PictureType::P
                && cur_type != PictureType::P
            {
                self.start_new_gop();
                self.b_pic_idx = self.b_pic_idx.next();
                gop_cut = true;
            }

            if (cur_type != PictureType::I && hint == PicHint::Intra) || hint == PicHint::SceneCut {
                is_scd = true;
            }
        }

        if self.change_in_intra_frm_int && self.pic_disp_order_no == 1 {
            self.update_pic_distbn(self.new_intra_frm_int, self.inter_frm_int, true);
            self.change_in_intra_frm_int = false;
            if self.new_intra_frm_int == 1 {
                self.pic_disp_order_no = 0;
            }
        }

        // applied on the first picture after a GOP or sub-GOP start, and only
        // if the new sub-GOP still ends before the next I picture
        if self.change_in_inter_frm_int
            && (self.buf_pic_no % self.inter_frm_int == 1
                || self.pic_disp_order_no == 1
                || self.inter_frm_int == 1)
        {
            let new_inter = self.new_inter_frm_int;
            if self.pic_disp_order_no + new_inter - 1 < self.intra_frm_int {
                if self.inter_frm_int == 1 {
                    // leave room for the next reference picture
                    let gap = if self.pic_disp_order_no == 0 { 2 } else { 1 };
                    self.b_pic_idx = self.ref_pic_idx.advance(gap);
                }
                if self.inter_frm_int != new_inter {
                    self.change_inter_frm_interval_correction = self.inter_frm_int - new_inter;
                }
                let gop_boundary = self.pic_disp_order_no == 1;
                self.update_pic_distbn(self.intra_frm_int, new_inter, gop_boundary);
                self.change_in_inter_frm_int = false;
                self.new_inter_frm_int = self.inter_frm_int;
            }
        }

        let disp_in = self.pic_disp_order_no;
        let first_gop_in = self.is_first_gop;
        let inter = self.inter_frm_int;
        let num_b_in_subgop = inter - 1;
        let p_frms = self.frms_in_cur_gop[P];
        let b_frms = self.frms_in_cur_gop[B];
        let b_incomp = self.b_in_incomp_subgop_mix_gop;
        let extra_p = self.extra_p_mix_gop;

        self.prev_b_pic_idx = self.b_pic_idx;
        if self.intra_frm_int == 1 {
            self.ref_pic_idx = self.stack.start();
            self.b_pic_idx = self.stack.start();
        }

        let pic_type = self.next_pic_type();
        let mut slot = PicSlot {
            pic_id,
            disp_order_no: disp_in,
            pic_type: Some(pic_type),
            is_scd: false,
            filled: true,
        };

        let placed_at;
        if pic_type == PictureType::B {
            placed_at = self.b_pic_idx;
            self.stack[placed_at] = slot;
            self.prev_pic = Some(slot);
            self.previous_pic_type = PictureType::B;
            self.b_count_in_gop += 1;
            self.b_count_in_subgop += 1;

            let step = if !self.is_gop_closed {
                if self.b_count_in_subgop < num_b_in_subgop && self.b_count_in_gop != b_frms {
                    1
                } else {
                    let step = if self.b_count_in_gop == b_frms {
                        // only I, or I and P, before the next B picture
                        self.b_count_in_gop = 0;
                        2 + (b_incomp == 0) as usize
                    } else {
                        2
                    };
                    self.b_count_in_subgop = 0;
                    step
                }
            } else if self.b_count_in_gop == b_frms {
                // P, I and P before the next B picture unless the GOP has a
                // single P or ends with the extra P
                self.b_count_in_subgop = 0;
                3 + (b_incomp == 0 && p_frms > 1 && disp_in != p_frms + b_frms - 1) as usize
            } else if self.b_count_in_subgop < num_b_in_subgop {
                1
            } else {
                self.b_count_in_subgop = 0;
                2
            };
            self.b_pic_idx = self.b_pic_idx.advance(step);
        } else {
            placed_at = self.ref_pic_idx;
            slot.is_scd = is_scd;

            let step = if pic_type == PictureType::I {
                self.previous_pic_type = PictureType::I;
                let step = if !self.is_gop_closed && !self.is_first_gop {
                    self.b_in_incomp_subgop_mix_gop = self.b_in_incomp_subgop;
                    if p_frms <= 1 && b_incomp == 0 {
                        1
                    } else {
                        // the trailing B pictures of the last GOP come between
                        (b_incomp + 1) as usize
                    }
                } else {
                    1
                };
                self.b_count_in_gop = 0;
                self.p_count_in_gop = 0;
                self.b_count_in_subgop = 0;

                if self.force_i_frame {
                    self.force_i_frame = false;
                }
                if gop_cut {
                    self.forced_i_pending = true;
                }
                step
            } else {
                self.previous_pic_type = PictureType::P;
                self.p_count_in_gop += 1;
                self.prev_intra_frame_interval = self.intra_frm_int;
                if self.is_gop_closed
                    && self.p_count_in_gop == p_frms
                    && self.p_count_in_gop > 1
                    && (b_incomp > 0 || extra_p > 0)
                {
                    (b_incomp + 1) as usize
                } else {
                    inter as usize
                }
            };

            self.stack[placed_at] = slot;
            self.prev_pic = Some(slot);
            self.ref_pic_idx = self.ref_pic_idx.advance(step);
        }

        self.pic_disp_order_no += 1;
        self.buf_pic_no += 1;

        if self.pic_disp_order_no == p_frms + b_frms + 1 {
            self.pic_disp_order_no = 0;
            self.buf_pic_no = 0;
            self.is_first_gop = false;
            self.extra_p_mix_gop = self.extra_p;
            if self.is_gop_closed {
                self.b_in_incomp_subgop_mix_gop = self.b_in_incomp_subgop;
            }
            self.frms_in_cur_gop = self.frms_in_gop;
        }

        if self.intra_frm_int == 1
            || (first_gop_in && disp_in == self.max_inter_frm_int - 1 && self.stack_count.is_none())
        {
            self.stack_count = Some(self.stack.start());
        }

        debug!(
            "pic {} disp {} -> {} slot {}{}",
            pic_id,
            disp_in,
            pic_type,
            placed_at.get(),
            if is_scd { " scd" } else { "" }
        );
    }

    /// Next picture in encode order.
    pub fn get_picture(&mut self) -> Scheduled {
        let idx = match self.stack_count {
            Some(idx) => idx,
            None => return Scheduled::Buffering,
        };
        let slot = self.stack[idx];
        if !slot.filled {
            return Scheduled::Buffering;
        }
        let pic_type = match slot.pic_type {
            Some(pic_type) => pic_type,
            None => return Scheduled::EndOfStream,
        };

        if self.forced_i_pending && pic_type == PictureType::I {
            self.forced_i_pending = false;
            self.mod_temp_ref_cnt = self.b_in_incomp_subgop + 1;
            self.first_gop_encoded = true;
        }

        // trailing B pictures of an open GOP are coded after the next I
        // picture, their temporal reference restarts with that GOP
        let mut disp_order_no = slot.disp_order_no;
        if !self.is_gop_closed && self.first_gop_encoded && self.intra_frm_int != 1 {
            match pic_type {
                PictureType::I => {
                    self.pic_order_cnt_base_offset = self.b_in_incomp_subgop;
                    self.enable_modulo = true;
                }
                PictureType::P => {
                    self.enable_modulo = false;
                    self.change_inter_frm_interval_correction = 0;
                }
                PictureType::B => {}
            }

            disp_order_no += self.pic_order_cnt_base_offset;
            if self.enable_modulo {
                if self.mod_temp_ref_cnt == 0 {
                    let period =
                        self.prev_intra_frame_interval + self.change_inter_frm_interval_correction;
                    if period > 0 {
                        disp_order_no %= period;
                    }
                } else {
                    // the GOP cut by a forced I picture was shorter
                    if self.frames_in_fif_gop > 0 {
                        disp_order_no %= self.frames_in_fif_gop;
                    }
                    self.mod_temp_ref_cnt -= 1;
                }
            }
        }

        Scheduled::Picture(PicDetails {
            pic_id: slot.pic_id,
            disp_order_no,
            pic_type,
            is_scd: slot.is_scd,
        })
    }

    /// Called once per picture taken from the stack, after it is coded.
    pub fn update(&mut self, pic_type: PictureType, is_non_ref_pic: bool, is_scd_i_frame: bool) {
        if let Some(idx) = self.stack_count {
            self.stack[idx].filled = false;
            let next = idx.next();
            self.stack_count = Some(if self.intra_frm_int == 1 && !self.stack[next].filled {
                self.stack.start()
            } else {
                next
            });
        }

        if is_scd_i_frame || pic_type == PictureType::I {
            self.rem_frms_in_gop = self.gop_remaining_template();
        }

        let t = pic_type.idx();
        if self.rem_frms_in_gop[t] > 0 {
            self.rem_frms_in_gop[t] -= 1;
        } else if let Some(rem) = self.rem_frms_in_gop.iter_mut().find(|rem| **rem > 0) {
            // a promoted picture counts against the type still pending
            *rem -= 1;
        }

        self.last_frm_in_gop = false;
        if self.rem_frms_in_gop.iter().sum::<i32>() == 0 {
            self.first_gop_encoded = true;
            self.rem_frms_in_gop = self.gop_remaining_template();
            self.last_frm_in_gop = true;
        }

        trace!(
            "pic handling: coded {}{} remaining {:?}",
            pic_type,
            if is_non_ref_pic { " non-ref" } else { "" },
            self.rem_frms_in_gop
        );
    }

    /// Repairs the stack after the current picture was dropped. If it was a
    /// reference picture the last B picture before the next reference is
    /// promoted to P and moved right behind it.
    pub fn skip_encoded_frame(&mut self, pic_type: PictureType) {
        let stack_count = match self.stack_count {
            Some(idx) => idx,
            None => return,
        };
        let next_ref_pic_idx = self.ref_pic_idx;
        let first_b_pic_idx = stack_count.next();
        if pic_type == PictureType::B || first_b_pic_idx == next_ref_pic_idx {
            return;
        }

        let last_b_pic_idx = next_ref_pic_idx.prev();
        let last_b = self.stack[last_b_pic_idx];
        if last_b.pic_type != Some(PictureType::B) || !last_b.filled {
            return;
        }

        let mut pic_idx = last_b_pic_idx;
        while pic_idx != stack_count && first_b_pic_idx != last_b_pic_idx {
            pic_idx = pic_idx.prev();
            self.stack[pic_idx.next()] = self.stack[pic_idx];
        }

        self.stack[first_b_pic_idx] = PicSlot {
            pic_type: Some(PictureType::P),
            is_scd: false,
            filled: true,
            ..last_b
        };
        debug!(
            "pic handling: skipped {}, pic {} promoted to P",
            pic_type, last_b.pic_id
        );
    }

    /// Ends the stream. A trailing B picture has no backward reference, it
    /// becomes a P picture; the slot after the last picture marks the end.
    pub fn flush(&mut self) {
        match self.prev_pic {
            Some(prev) if prev.pic_type == Some(PictureType::B) => {
                self.stack[self.ref_pic_idx] = PicSlot {
                    pic_type: Some(PictureType::P),
                    is_scd: false,
                    filled: true,
                    ..prev
                };
                self.stack[self.prev_b_pic_idx] = PicSlot::end_of_stream();
            }
            _ => {
                let mut end = self.ref_pic_idx;
                // intra only streams read every picture from the first slot
                if self.intra_frm_int == 1 && !self.stack[self.stack.start()].filled {
                    end = self.stack.start();
                }
                self.stack[end] = PicSlot::end_of_stream();
                if self.inter_frm_int != 1 && !self.stack[self.b_pic_idx].filled {
                    self.stack[self.b_pic_idx] = PicSlot::end_of_stream();
                }
            }
        }

        if self.stack_count.is_none() {
            self.stack_count = Some(self.stack.start());
        }
        debug!("pic handling: flushed");
    }

    /// Adds a picture whose type is already known, arriving in encode order.
    /// The inter frame interval is learnt from the observed B runs.
    pub fn add_picture_re_enc(&mut self, pic_id: i32, pic_type: PictureType) -> Result<(), RcError> {
        if self.change_in_intra_frm_int {
            self.update_pic_distbn(self.new_intra_frm_int, self.inter_frm_int, true);
            self.change_in_intra_frm_int = false;
        }
        if self.change_in_inter_frm_int {
            self.update_pic_distbn(self.intra_frm_int, self.new_inter_frm_int, true);
            self.change_in_inter_frm_int = false;
        }

        let mut b_count_in_subgop = self.b_count_in_subgop;
        let inter = self.inter_frm_int;
        let intra = self.intra_frm_int;
        let disp = self.pic_disp_order_no;

        if pic_type == PictureType::B {
            b_count_in_subgop += 1;
            if b_count_in_subgop > self.max_inter_frm_int {
                warn!(
                    "pic handling: {} B pictures in a row, stack holds {}",
                    b_count_in_subgop, self.max_inter_frm_int
                );
                return Err(RcError::StackOverflow(b_count_in_subgop));
            }
            if b_count_in_subgop > inter - 1 {
                self.update_pic_distbn(intra, b_count_in_subgop + 1, false);
            }
        } else {
            // a shorter B run means a smaller interval, unless the GOP ends
            // or an open GOP starts
            if b_count_in_subgop < inter - 1
                && !(!self.is_gop_closed && b_count_in_subgop >= self.b_in_incomp_subgop)
                && disp + (inter - 1 - b_count_in_subgop) <= intra
            {
                self.update_pic_distbn(intra, b_count_in_subgop + 1, false);
            }
            b_count_in_subgop = 0;
        }

        let mut next_disp = disp + 1;
        let out_type = if next_disp >= intra {
            if pic_type != PictureType::B {
                PictureType::I
            } else {
                self.frms_in_cur_gop[B] += 1;
                self.frms_in_gop[B] += 1;
                self.rem_frms_in_gop[B] += 1;
                PictureType::B
            }
        } else if pic_type == PictureType::I && !self.is_first_gop {
            self.frms_in_cur_gop[P] += 1;
            self.frms_in_gop[P] += 1;
            self.rem_frms_in_gop[P] += 1;
            PictureType::P
        } else {
            pic_type
        };

        if next_disp == self.frms_in_cur_gop[P] + self.frms_in_cur_gop[B] + 1 {
            next_disp = 0;
            self.is_first_gop = false;
        }

        let idx = match self.stack_count {
            Some(idx) => idx,
            None => {
                let start = self.stack.start();
                self.stack_count = Some(start);
                start
            }
        };
        self.stack[idx] = PicSlot {
            pic_id,
            disp_order_no: disp,
            pic_type: Some(out_type),
            is_scd: false,
            filled: true,
        };

        self.pic_disp_order_no = next_disp;
        self.b_count_in_subgop = b_count_in_subgop;
        Ok(())
    }

    /// Replaces the current GOP distribution with one measured by look-ahead.
    pub fn update_frames_in_gop(&mut self, frms_in_gop: [i32; MAX_PIC_TYPE]) {
        self.frms_in_cur_gop = frms_in_gop;
        self.actual_frms_in_gop = frms_in_gop;
    }

    pub fn set_force_i_frame(&mut self) {
        self.force_i_frame = true;
    }

    /// B pictures per temporal layer, doubling with each layer.
    pub fn b_layer_distribution(&self, num_layers: i32) -> Vec<i32> {
        if self.frms_in_gop[B] == 0 {
            return vec![0; num_layers.max(0) as usize];
        }
        let first_layer = if self.is_gop_closed {
            self.frms_in_gop[P] - 1 + self.frms_in_gop[I]
        } else {
            self.frms_in_gop[P] + self.frms_in_gop[I]
        };
        (0..num_layers.max(0)).map(|layer| first_layer << layer).collect()
    }

    pub fn intra_frame_interval(&self) -> i32 {
        self.intra_frm_int
    }

    pub fn actual_intra_frame_interval(&self) -> i32 {
        self.actual_frms_in_gop.iter().sum()
    }

    pub fn inter_frame_interval(&self) -> i32 {
        self.inter_frm_int
    }

    pub fn max_inter_frame_interval(&self) -> i32 {
        self.max_inter_frm_int
    }

    pub fn is_gop_closed(&self) -> bool {
        self.is_gop_closed
    }

    pub fn rem_frames_in_gop(&self) -> i32 {
        self.rem_frms_in_gop.iter().sum()
    }

    pub fn rem_frames_in_gop_by_type(&self) -> [i32; MAX_PIC_TYPE] {
        self.rem_frms_in_gop
    }

    pub fn frames_in_gop_force_i(&self) -> i32 {
        self.frames_in_fif_gop
    }

    pub fn sum_remaining_frames_at_force_i(&self) -> i32 {
        self.sum_remaining_frm_in_gop
    }

    pub fn frames_in_gop(&self) -> [i32; MAX_PIC_TYPE] {
        self.frms_in_cur_gop
    }

    pub fn steady_frames_in_gop(&self) -> [i32; MAX_PIC_TYPE] {
        self.frms_in_gop
    }

    pub fn actual_frames_in_gop(&self) -> [i32; MAX_PIC_TYPE] {
        self.actual_frms_in_gop
    }

    pub fn disp_order_no(&self) -> i32 {
        self.pic_disp_order_no
    }

    pub fn is_scd(&self) -> bool {
        match self.stack_count {
            Some(idx) => self.stack[idx].is_scd,
            None => false,
        }
    }

    pub fn is_last_frame_in_gop(&self) -> bool {
        self.last_frm_in_gop
    }

    pub fn num_gop_in_idr_period(&self) -> i32 {
        self.num_gop_in_idr_period
    }

    pub fn idr_period(&self) -> i32 {
        self.idr_period
    }

    pub fn num_b_layers(&self) -> i32 {
        self.num_b_layers
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use interpolate_name::interpolate_test;
    use pretty_assertions::assert_eq;

    fn gop(intra: i32, inter: i32, max_inter: i32, closed_gop: bool) -> GopParams {
        GopParams {
            intra_frame_interval: intra,
            inter_frame_interval: inter,
            max_inter_frame_interval: max_inter,
            idr_period: 0,
            closed_gop,
            num_b_layers: 1,
        }
    }

    fn take(pic: &mut PicHandling, out: &mut Vec<PicDetails>) -> bool {
        match pic.get_picture() {
            Scheduled::Picture(p) => {
                pic.update(p.pic_type, p.pic_type == PictureType::B, p.is_scd);
                out.push(p);
                true
            }
            Scheduled::Buffering => false,
            Scheduled::EndOfStream => false,
        }
    }

    fn run(pic: &mut PicHandling, from: i32, to: i32, hints: &[(i32, PicHint)]) -> Vec<PicDetails> {
        let mut out = Vec::new();
        for id in from..to {
            let hint = hints
                .iter()
                .find(|(at, _)| *at == id)
                .map(|(_, hint)| *hint)
                .unwrap_or_default();
            pic.add_picture(id, hint);
            take(pic, &mut out);
        }
        out
    }

    fn drain(pic: &mut PicHandling) -> Vec<PicDetails> {
        pic.flush();
        let mut out = Vec::new();
        for _ in 0..(MAX_INTER_FRM_INT + 2) {
            match pic.get_picture() {
                Scheduled::Picture(p) => {
                    pic.update(p.pic_type, false, p.is_scd);
                    out.push(p);
                }
                Scheduled::EndOfStream => return out,
                Scheduled::Buffering => panic!("stack stalled after flush"),
            }
        }
        panic!("no end of stream after flush");
    }

    fn ids(pics: &[PicDetails]) -> Vec<i32> {
        pics.iter().map(|p| p.pic_id).collect()
    }

    fn types(pics: &[PicDetails]) -> String {
        pics.iter().map(|p| p.pic_type.to_string()).collect()
    }

    fn assert_each_once(pics: &[PicDetails], n: i32) {
        let mut seen = ids(pics);
        seen.sort();
        assert_eq!(seen, (0..n).collect::<Vec<_>>());
    }

    #[test]
    fn distribution() {
        assert_eq!(find_pic_distbn(8, 3, true).frms, [1, 3, 4]);
        assert_eq!(find_pic_distbn(8, 3, true).extra_p, 1);
        assert_eq!(find_pic_distbn(9, 3, true).frms, [1, 3, 5]);
        assert_eq!(find_pic_distbn(9, 3, true).b_in_incomp_subgop, 1);
        assert_eq!(find_pic_distbn(9, 3, false).frms, [1, 2, 6]);
        assert_eq!(find_pic_distbn(9, 3, false).b_in_incomp_subgop, 2);
        assert_eq!(find_pic_distbn(30, 1, false).frms, [1, 29, 0]);
        assert_eq!(find_pic_distbn(1, 3, true).frms, [1, 0, 0]);
    }

    #[test]
    fn rejects_short_gops() {
        assert!(PicHandling::new(&gop(3, 3, 3, true)).is_err());
        assert!(PicHandling::new(&gop(2, 1, 3, false)).is_err());
        assert!(PicHandling::new(&gop(30, 4, 3, false)).is_err());
        assert!(PicHandling::new(&gop(30, 3, 11, false)).is_err());
        assert!(PicHandling::new(&gop(1, 1, 3, true)).is_ok());
    }

    #[test]
    fn closed_gop_encode_order() {
        let mut pic = PicHandling::new(&gop(8, 3, 3, true)).unwrap();
        let mut out = run(&mut pic, 0, 8, &[]);
        out.extend(drain(&mut pic));
        assert_eq!(ids(&out), vec![0, 3, 1, 2, 6, 4, 5, 7]);
        assert_eq!(types(&out), "IPBBPBBP");

        let mut pic = PicHandling::new(&gop(9, 3, 3, true)).unwrap();
        let out = run(&mut pic, 0, 18, &[]);
        assert_eq!(&ids(&out)[..14], &[0, 3, 1, 2, 6, 4, 5, 8, 7, 9, 12, 10, 11, 15]);
        assert_eq!(&types(&out)[..10], "IPBBPBBPBI");
    }

    #[test]
    fn short_sub_gops_in_a_larger_stack() {
        let mut pic = PicHandling::new(&gop(12, 2, 3, true)).unwrap();
        assert_eq!(pic.max_inter_frame_interval(), 3);
        assert_eq!(pic.frames_in_gop(), [1, 6, 5]);
        let out = run(&mut pic, 0, 24, &[]);
        assert_eq!(
            &ids(&out)[..15],
            &[0, 2, 1, 4, 3, 6, 5, 8, 7, 10, 9, 11, 12, 14, 13]
        );
        assert_eq!(&types(&out)[..15], "IPBPBPBPBPBPIPB");
    }

    #[test]
    fn open_gop_temporal_reference() {
        let mut pic = PicHandling::new(&gop(9, 3, 3, false)).unwrap();
        let out = run(&mut pic, 0, 18, &[]);
        assert_eq!(&ids(&out)[..14], &[0, 3, 1, 2, 6, 4, 5, 9, 7, 8, 12, 10, 11, 15]);

        let refs: Vec<(i32, i32)> = out[7..12].iter().map(|p| (p.pic_id, p.disp_order_no)).collect();
        assert_eq!(refs, vec![(9, 2), (7, 0), (8, 1), (12, 5), (10, 3)]);
    }

    #[interpolate_test(closed_8_3, 8, 3, 3, true)]
    #[interpolate_test(closed_9_3, 9, 3, 3, true)]
    #[interpolate_test(closed_12_3, 12, 3, 3, true)]
    #[interpolate_test(open_9_3, 9, 3, 3, false)]
    #[interpolate_test(ipp_30, 30, 1, 1, false)]
    #[interpolate_test(intra_only, 1, 1, 1, true)]
    #[interpolate_test(closed_12_2_of_3, 12, 2, 3, true)]
    #[interpolate_test(ipp_12_of_3, 12, 1, 3, false)]
    fn gop_conservation(intra: i32, inter: i32, max_inter: i32, closed: bool) {
        let mut pic = PicHandling::new(&gop(intra, inter, max_inter, closed)).unwrap();
        let n = intra * 5;
        let mut out = run(&mut pic, 0, n, &[]);
        out.extend(drain(&mut pic));
        assert_each_once(&out, n);
        assert_eq!(out[0].pic_type, PictureType::I);
        assert_eq!(out[0].pic_id, 0);

        let starts: Vec<usize> = (0..out.len())
            .filter(|&i| out[i].pic_type == PictureType::I)
            .collect();
        assert_eq!(starts.len(), 5);

        // the first open GOP lends its trailing B pictures, the last one is
        // cut by the flush
        let first = if closed { 0 } else { 1 };
        for w in starts[first..].windows(2) {
            let group = &out[w[0]..w[1]];
            let mut counts = [0; MAX_PIC_TYPE];
            for p in group {
                counts[p.pic_type.idx()] += 1;
            }
            assert_eq!(counts, pic.steady_frames_in_gop());

            let mut disp: Vec<i32> = group.iter().map(|p| p.disp_order_no).collect();
            disp.sort();
            disp.dedup();
            assert_eq!(disp.len(), group.len());
        }
    }

    #[test]
    fn remaining_frames_track_the_gop() {
        let mut pic = PicHandling::new(&gop(8, 3, 3, true)).unwrap();
        assert_eq!(pic.rem_frames_in_gop(), 8);
        let out = run(&mut pic, 0, 10, &[]);
        // I0 P3 B1 B2 P6 B4 B5 P7
        assert_eq!(out.len(), 8);
        assert!(pic.is_last_frame_in_gop());
        assert_eq!(pic.rem_frames_in_gop_by_type(), [1, 3, 4]);

        let mut pic = PicHandling::new(&gop(9, 3, 3, false)).unwrap();
        assert_eq!(pic.rem_frames_in_gop(), 7);
        let out = run(&mut pic, 0, 9, &[]);
        assert_eq!(out.len(), 7);
        assert!(pic.is_last_frame_in_gop());
        assert_eq!(pic.rem_frames_in_gop(), 9);
    }

    #[interpolate_test(closed_8_3, 8, 3, 3, true, 13)]
    #[interpolate_test(open_9_3, 9, 3, 3, false, 13)]
    #[interpolate_test(ipp_10, 10, 1, 1, true, 25)]
    fn flush_at_any_point(intra: i32, inter: i32, max_inter: i32, closed: bool, stops: i32) {
        for n in 1..=stops {
            let mut pic = PicHandling::new(&gop(intra, inter, max_inter, closed)).unwrap();
            let mut out = run(&mut pic, 0, n, &[]);
            out.extend(drain(&mut pic));
            assert_each_once(&out, n);
            assert_eq!(out[0].pic_type, PictureType::I, "stop {}", n);
        }
    }

    #[test]
    fn flush_promotes_trailing_b() {
        let mut pic = PicHandling::new(&gop(8, 3, 3, true)).unwrap();
        let mut out = run(&mut pic, 0, 5, &[]);
        out.extend(drain(&mut pic));
        assert_eq!(ids(&out), vec![0, 3, 1, 2, 4]);
        assert_eq!(types(&out), "IPBBP");
    }

    #[test]
    fn flush_before_release() {
        let mut pic = PicHandling::new(&gop(8, 3, 3, true)).unwrap();
        pic.add_picture(0, PicHint::Auto);
        assert_eq!(pic.get_picture(), Scheduled::Buffering);
        let out = drain(&mut pic);
        assert_eq!(ids(&out), vec![0]);
    }

    #[test]
    fn forced_intra_in_ipp() {
        let mut pic = PicHandling::new(&gop(30, 1, 1, true)).unwrap();
        let out = run(&mut pic, 0, 50, &[(10, PicHint::Intra)]);
        let intra: Vec<i32> = out
            .iter()
            .filter(|p| p.pic_type == PictureType::I)
            .map(|p| p.pic_id)
            .collect();
        assert_eq!(intra, vec![0, 10, 40]);
        assert!(out[10].is_scd);
        assert!(!out[40].is_scd);
        assert_eq!(pic.frames_in_gop_force_i(), 10);
    }

    #[test]
    fn forced_intra_in_closed_gop() {
        let mut pic = PicHandling::new(&gop(30, 3, 3, true)).unwrap();
        let out = run(&mut pic, 0, 12, &[(4, PicHint::SceneCut)]);
        assert_eq!(&ids(&out)[..6], &[0, 3, 1, 2, 4, 7]);
        assert_eq!(&types(&out)[..6], "IPBBIP");
        assert!(out[4].is_scd);
    }

    #[test]
    fn natural_intra_hint_is_not_a_scene_cut() {
        let mut pic = PicHandling::new(&gop(10, 1, 1, true)).unwrap();
        let out = run(&mut pic, 0, 12, &[(10, PicHint::Intra)]);
        assert_eq!(out[10].pic_type, PictureType::I);
        assert!(!out[10].is_scd);
        assert_eq!(out[11].pic_type, PictureType::P);
    }

    #[test]
    fn inter_interval_change_from_ipp() {
        let mut pic = PicHandling::new(&gop(12, 1, 3, true)).unwrap();
        pic.register_new_inter_frame_interval(3);
        pic.add_picture(0, PicHint::Auto);
        assert_eq!(pic.frames_in_gop(), [1, 4, 7]);
        assert_eq!(pic.inter_frame_interval(), 3);

        let mut out = Vec::new();
        take(&mut pic, &mut out);
        out.extend(run(&mut pic, 1, 24, &[]));
        assert_eq!(&ids(&out)[..12], &[0, 3, 1, 2, 6, 4, 5, 9, 7, 8, 11, 10]);
        assert_eq!(&types(&out)[..13], "IPBBPBBPBBPBI");
    }

    #[test]
    fn intra_interval_change() {
        let mut pic = PicHandling::new(&gop(10, 1, 1, true)).unwrap();
        let mut out = run(&mut pic, 0, 3, &[]);
        pic.register_new_intra_frame_interval(5);
        out.extend(run(&mut pic, 3, 25, &[]));
        let intra: Vec<i32> = out
            .iter()
            .filter(|p| p.pic_type == PictureType::I)
            .map(|p| p.pic_id)
            .collect();
        assert_eq!(intra, vec![0, 10, 15, 20]);
        assert_eq!(pic.intra_frame_interval(), 5);
    }

    #[test]
    fn skipped_reference_promotes_b() {
        let mut pic = PicHandling::new(&gop(30, 3, 3, true)).unwrap();
        let mut out = run(&mut pic, 0, 3, &[]);
        pic.add_picture(3, PicHint::Auto);
        match pic.get_picture() {
            Scheduled::Picture(p) => {
                assert_eq!(p.pic_id, 3);
                pic.skip_encoded_frame(p.pic_type);
                pic.update(p.pic_type, false, false);
            }
            other => panic!("unexpected {:?}", other),
        }
        out.extend(run(&mut pic, 4, 8, &[]));
        assert_eq!(&ids(&out)[..5], &[0, 2, 1, 6, 4]);
        assert_eq!(&types(&out)[..5], "IPBPB");
    }

    #[test]
    fn re_encode_learns_inter_interval() {
        let mut pic = PicHandling::new(&gop(30, 1, 3, true)).unwrap();
        let input = [
            PictureType::I,
            PictureType::P,
            PictureType::B,
            PictureType::B,
            PictureType::P,
        ];
        let mut out = Vec::new();
        for (id, &t) in input.iter().enumerate() {
            pic.add_picture_re_enc(id as i32, t).unwrap();
            assert!(take(&mut pic, &mut out));
        }
        assert_eq!(types(&out), "IPBBP");
        assert_eq!(pic.inter_frame_interval(), 3);

        let mut result = Ok(());
        for id in 5..9 {
            result = pic.add_picture_re_enc(id, PictureType::B);
            if result.is_err() {
                break;
            }
            take(&mut pic, &mut out);
        }
        match result {
            Err(RcError::StackOverflow(4)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn queries() {
        let pic = PicHandling::new(&GopParams {
            idr_period: 90,
            ..gop(30, 3, 3, true)
        })
        .unwrap();
        assert_eq!(pic.num_gop_in_idr_period(), 3);
        assert_eq!(pic.actual_intra_frame_interval(), 30);
        assert!(pic.is_gop_closed());
        assert_eq!(pic.b_layer_distribution(2), vec![10, 20]);

        let pic = PicHandling::new(&gop(30, 1, 1, false)).unwrap();
        assert_eq!(pic.num_gop_in_idr_period(), 1);
        assert_eq!(pic.b_layer_distribution(2), vec![0, 0]);
    }
}
