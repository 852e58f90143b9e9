use log::*;

use super::*;
use crate::api::*;

// a VBR stream may deviate from the average by at most this many seconds
pub const VBR_MAX_BIT_DEV_SEC: i64 = 50;
pub const UPPER_THRESHOLD_EBF_Q4: i64 = 15;

const MAX_BUFFER_LEVEL_RATIO: f32 = 0.8;
const MAX_BITS_COMPLEXITY: f32 = 0.9;
const MIN_BITS_COMPLEXITY: f32 = 0.1;
const LOW_LAP_COMPLEXITY: f32 = 0.2;
const FULL_BUFFER_RATIO: f64 = 0.75;
const MIN_ALLOC_RATIO: f32 = 0.6;
const CREDIT_HIGH_RATIO: f32 = 0.8;
const CREDIT_LOW_RATIO: f32 = 0.2;

// desired buffer level for a look-ahead complexity `x`
fn comp_to_bits_map(x: f32, level: f32) -> f32 {
    (-1.7561 * x * x + 2.5547 * x - 0.0323) * level
}

// how far one allocation period may lend to / borrow from the buffer:
// 12/4096 and 8/4096 of the level per frame, at least 10/128 of it
fn buf_based_limits(level: i64, period: i64) -> (i64, i64) {
    let floor = (level * 10) >> 7;
    let red = ((level * period * 12) >> 12).max(floor);
    let inc = ((level * period * 8) >> 12).max(floor);
    (red, inc)
}

fn bits_per_frame(bitrate: i64, frame_rate: i32) -> i32 {
    (bitrate * 1000 / frame_rate.max(1) as i64) as i32
}

#[derive(Debug, Clone, Copy)]
pub struct VbvParams {
    // decoder buffer delay in ms
    pub buffer_delay: u32,
    // frames per 1000 s
    pub frame_rate: u32,
    pub bitrate: u32,
    pub pics_in_delay_period: [u32; MAX_PIC_TYPE],
    pub vbv_buffer_size: u32,
    pub intra_frame_interval: i32,
    pub rc_mode: RcMode,
    pub peak_bitrate: u32,
    pub frames_in_delay: u32,
    // seconds the peak rate may be sustained, negative is unlimited
    pub max_peak_rate_duration: f32,
    // negative when unknown
    pub total_frames: i64,
    pub inter_frame_interval: i32,
    pub capped_vbr: bool,
}

/// A bit target clipped into the range the buffer can absorb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BitBounds {
    pub target: i32,
    pub min_bits: i32,
    pub max_bits: i32,
}

/// Encoder side mirror of the decoder's VBV/HRD buffer.
#[derive(Debug, Clone)]
pub struct VbvBuffer {
    buffer_size: i32,
    drain_bits_per_frame: [i32; MAX_NUM_DRAIN_RATES],
    ebf: i32,
    ebf_estimate: i32,
    // fullness that is never truncated at the buffer bounds
    ebf_bit_alloc: i64,
    credit_level: i64,
    upr_thr: [i32; MAX_PIC_TYPE],
    low_thr: [i32; MAX_PIC_TYPE],
    error_bits: [ErrorBits; MAX_NUM_DRAIN_RATES],
    is_cbr: bool,

    bit_rate: [i32; MAX_NUM_DRAIN_RATES],
    max_delay: i32,
    pics_in_delay_period: [u32; MAX_PIC_TYPE],
    frame_rate: i32,
    max_vbv_buf_size: i32,
    peak_drain_rate_frame: i32,
    frames_in_delay: u32,
    vbr_max_bit_deviation: i64,
    rc_mode: RcMode,
    vbr_no_peak_rate_duration_limit: bool,
    total_frames: i64,
    frames_encoded: i64,
    inter_frame_interval: i32,
    intra_frame_interval: i32,
    capped_vbr: bool,
    max_peak_rate_duration: f32,
}

impl VbvBuffer {
    pub fn new(p: &VbvParams) -> Result<Self, RcError> {
        if p.frame_rate == 0 {
            return Err(RcError::InvalidConfig("frame rate must be positive".into()));
        }
        if p.rc_mode != RcMode::ConstQp && p.bitrate == 0 {
            return Err(RcError::InvalidConfig("bitrate must be positive".into()));
        }

        let frame_rate = p.frame_rate as i32;
        let bpf = bits_per_frame(p.bitrate as i64, frame_rate);
        let vbv_size = p.vbv_buffer_size.min(i32::MAX as u32) as i32;

        let mut vbv = VbvBuffer {
            buffer_size: vbv_size,
            drain_bits_per_frame: [bpf; MAX_NUM_DRAIN_RATES],
            ebf: 0,
            ebf_estimate: 0,
            ebf_bit_alloc: 0,
            credit_level: 0,
            upr_thr: [0; MAX_PIC_TYPE],
            low_thr: [0; MAX_PIC_TYPE],
            error_bits: [ErrorBits::new(p.frame_rate, p.bitrate); MAX_NUM_DRAIN_RATES],
            is_cbr: false,
            bit_rate: [p.bitrate as i32; MAX_NUM_DRAIN_RATES],
            max_delay: p.buffer_delay as i32,
            pics_in_delay_period: p.pics_in_delay_period,
            frame_rate,
            max_vbv_buf_size: vbv_size,
            peak_drain_rate_frame: bpf,
            frames_in_delay: p.frames_in_delay,
            vbr_max_bit_deviation: vbv_size as i64,
            rc_mode: p.rc_mode,
            vbr_no_peak_rate_duration_limit: false,
            total_frames: p.total_frames,
            frames_encoded: 0,
            inter_frame_interval: p.inter_frame_interval,
            intra_frame_interval: p.intra_frame_interval,
            capped_vbr: p.capped_vbr,
            max_peak_rate_duration: p.max_peak_rate_duration,
        };

        match p.rc_mode {
            RcMode::Cbr => {
                vbv.is_cbr = true;
            }
            RcMode::VbrStreaming => {
                vbv.vbr_no_peak_rate_duration_limit = p.max_peak_rate_duration < 0.0;
                vbv.vbr_max_bit_deviation = vbv.initial_vbr_max_bit_deviation();
                vbv.peak_drain_rate_frame = bits_per_frame(p.peak_bitrate as i64, frame_rate);
            }
            RcMode::ConstQp => {}
        }

        vbv.set_thresholds(bpf);
        if let Err(err) = vbv.check_thresholds() {
            error!("vbv buffer of {} bits too small: {}", vbv.buffer_size, err);
            return Err(err);
        }

        debug!(
            "vbv: {} mode size {} drain {} upper {:?} lower {:?}",
            vbv.rc_mode, vbv.buffer_size, bpf, vbv.upr_thr, vbv.low_thr
        );
        Ok(vbv)
    }

    fn initial_vbr_max_bit_deviation(&self) -> i64 {
        let bitrate = self.bit_rate[0] as i64;
        let file_size = (bitrate * 1000 / self.frame_rate as i64) * self.total_frames;

        let mut dev = if self.max_peak_rate_duration > 0.0 {
            (self.max_peak_rate_duration * bitrate as f32) as i64
        } else {
            VBR_MAX_BIT_DEV_SEC * bitrate
        };

        if self.total_frames > 0 {
            // at least one second, at most 1/8 of the file
            if dev > file_size >> 3 {
                dev = file_size >> 3;
            }
            if dev < bitrate {
                dev = bitrate;
            }
        } else {
            // live encoding starts at one second, widened in update()
            dev = bitrate;
        }
        dev
    }

    fn set_thresholds(&mut self, bpf: i32) {
        for i in 0..MAX_PIC_TYPE {
            self.upr_thr[i] = ((self.buffer_size as i64 >> 4) * UPPER_THRESHOLD_EBF_Q4) as i32;
            self.low_thr[i] = if self.rc_mode == RcMode::VbrStreaming {
                if self.vbr_no_peak_rate_duration_limit {
                    0
                } else {
                    self.inter_frame_interval * bpf
                }
            } else if self.inter_frame_interval == 1 {
                0
            } else {
                self.inter_frame_interval * bpf
            };
        }
        self.clamp_lower_thresholds();
    }

    fn clamp_lower_thresholds(&mut self) {
        for i in 0..MAX_PIC_TYPE {
            if self.low_thr[i] < self.buffer_size >> 6 {
                self.low_thr[i] = self.buffer_size >> 6;
            }
            if self.low_thr[i] > self.buffer_size >> 3 {
                self.low_thr[i] = self.buffer_size >> 3;
            }
        }
    }

    fn check_thresholds(&self) -> Result<(), RcError> {
        for &pic_type in PictureType::ALL.iter() {
            let (upper, lower) = (self.upr_thr[pic_type.idx()], self.low_thr[pic_type.idx()]);
            if upper <= lower {
                return Err(RcError::ThresholdOrder {
                    pic_type,
                    upper,
                    lower,
                });
            }
        }
        Ok(())
    }

    // applies a live change, or leaves the buffer untouched when the
    // resulting thresholds would collapse
    fn reconfigure<F: FnOnce(&mut Self)>(&mut self, change: F) -> Result<(), RcError> {
        let prev = self.clone();
        change(self);
        if let Err(err) = self.check_thresholds() {
            warn!("vbv: change rejected, {}", err);
            *self = prev;
            return Err(err);
        }
        Ok(())
    }

    fn clamp_ebf(&mut self) {
        if self.ebf < 0 {
            self.ebf = 0;
        }
        if self.ebf > self.buffer_size {
            self.ebf = self.buffer_size;
        }
    }

    fn drain_and_error(&self, pic_type: PictureType) -> (i64, i64) {
        let d = pic_type.drain_idx();
        (
            self.drain_bits_per_frame[d] as i64,
            self.error_bits[d].get_error_bits() as i64,
        )
    }

    /// Clips a CBR bit target so the buffer stays between its thresholds.
    pub fn constraint_check(&self, target_bits: i32, pic_type: PictureType) -> BitBounds {
        let (drain, error) = self.drain_and_error(pic_type);
        let ebf = self.ebf_estimate as i64;

        let max_bits = (self.upr_thr[pic_type.idx()] as i64 - ebf).max(0);
        let min_bits = (self.low_thr[pic_type.idx()] as i64 - (ebf - drain - error)).max(0);

        let target = target_bits as i64;
        let target = if target > max_bits {
            max_bits
        } else if target < min_bits {
            min_bits
        } else {
            target
        };

        BitBounds {
            target: target as i32,
            min_bits: min_bits as i32,
            max_bits: max_bits as i32,
        }
    }

    /// Clips a VBR streaming bit target by what the peak rate can drain
    /// within the delay window and by the minimum consumption rate.
    pub fn vbr_stream_constraint_check(&self, target_bits: i32, pic_type: PictureType) -> BitBounds {
        let ebf = self.ebf_estimate as i64;
        let upper = self.upr_thr[pic_type.idx()] as i64 - ebf;
        let mut max_bits =
            self.frames_in_delay as i64 * self.peak_drain_rate_frame as i64 - ebf;
        // a single frame must still fit into the buffer
        if max_bits > upper {
            max_bits = upper;
        }

        // unlimited peak duration lets the stream bank any underconsumption
        let min_bits = if self.vbr_no_peak_rate_duration_limit {
            0
        } else {
            (self.low_thr[0] as i64 - self.ebf_bit_alloc).max(0)
        };
        let max_bits = max_bits.max(0);
        let mut target = target_bits as i64;
        if target < min_bits {
            target = min_bits;
        }
        if target > max_bits {
            target = max_bits;
        }

        BitBounds {
            target: target as i32,
            min_bits: min_bits as i32,
            max_bits: max_bits as i32,
        }
    }

    /// Mode dependent constraint; constant QP leaves the target untouched.
    /// Capped VBR only bounds a picture from above.
    pub fn constrain(&self, target_bits: i32, pic_type: PictureType) -> BitBounds {
        let bounds = match self.rc_mode {
            RcMode::Cbr => self.constraint_check(target_bits, pic_type),
            RcMode::VbrStreaming => self.vbr_stream_constraint_check(target_bits, pic_type),
            RcMode::ConstQp => {
                return BitBounds {
                    target: target_bits,
                    min_bits: 0,
                    max_bits: i32::MAX,
                }
            }
        };
        if !self.capped_vbr {
            return bounds;
        }
        BitBounds {
            target: target_bits.max(0).min(bounds.max_bits),
            min_bits: 0,
            max_bits: bounds.max_bits,
        }
    }

    /// Classifies the buffer as if `consumed_bits` were committed, without
    /// changing any state. Also returns the room left before overflow.
    pub fn status(&self, consumed_bits: i32, pic_type: PictureType) -> (VbvStatus, i32) {
        let (drain, error) = self.drain_and_error(pic_type);
        let size = self.buffer_size as i64;

        let mut cur = self.ebf as i64 + consumed_bits as i64;
        let internal = if cur > size {
            cur = size;
            VbvStatus::Overflow
        } else {
            cur -= drain + error;
            if self.rc_mode == RcMode::VbrStreaming && cur < 0 {
                cur = 0;
            }
            let status = if cur < 0 {
                VbvStatus::Underflow
            } else {
                VbvStatus::Normal
            };
            if cur < 0 {
                cur = 0;
            }
            status
        };

        // the caller sees the decoder buffer: encoder overflow starves it
        let reported = match internal {
            VbvStatus::Overflow => VbvStatus::Underflow,
            VbvStatus::Underflow => VbvStatus::Overflow,
            VbvStatus::Normal => VbvStatus::Normal,
        };
        (reported, (size - cur) as i32)
    }

    /// Commits the bits of an encoded picture.
    pub fn update(&mut self, consumed_bits: i32, pic_type: PictureType) {
        let (drain, error) = self.drain_and_error(pic_type);
        let consumed = consumed_bits as i64;

        self.frames_encoded += 1;
        if self.rc_mode == RcMode::VbrStreaming && self.total_frames < 0 {
            let bitrate = self.bit_rate[0] as i64;
            let approx_file_size =
                self.frames_encoded * bitrate * 1000 / self.frame_rate as i64;
            let mut dev = bitrate;
            if dev < approx_file_size >> 4 {
                dev = approx_file_size >> 4;
            }
            if dev > VBR_MAX_BIT_DEV_SEC * bitrate {
                dev = VBR_MAX_BIT_DEV_SEC * bitrate;
            }
            self.vbr_max_bit_deviation = dev;
        }

        let mut ebf = self.ebf as i64 + consumed;
        if self.is_cbr {
            ebf -= drain + error;
            self.ebf_bit_alloc += consumed - (drain + error);
        } else {
            ebf -= (self.peak_drain_rate_frame as i64).min(ebf) + error;
            let avg_drain = self.drain_bits_per_frame[0] as i64 + error;
            self.ebf_bit_alloc += consumed - avg_drain;
            self.credit_level += consumed - avg_drain;
            // with a bounded peak duration unused bits are lost
            if !self.vbr_no_peak_rate_duration_limit && self.ebf_bit_alloc < 0 {
                self.ebf_bit_alloc = 0;
            }
        }

        if ebf < 0 {
            debug!("vbv: fullness {} below empty, needs stuffing", ebf);
        } else if ebf > self.buffer_size as i64 {
            warn!("vbv: fullness {} above buffer size, frame should be skipped", ebf);
        }
        self.ebf = ebf.max(0).min(self.buffer_size as i64) as i32;
        self.ebf_estimate = self.ebf;

        for e in self.error_bits.iter_mut() {
            e.update();
        }
    }

    /// Padding bits that bring the fullness after draining back to the
    /// lower threshold. Negative when no stuffing is needed.
    pub fn bits_to_stuff(&self, consumed_bits: i32, pic_type: PictureType) -> i32 {
        let (drain, error) = self.drain_and_error(pic_type);
        (self.low_thr[pic_type.idx()] as i64 + drain + error
            - (self.ebf as i64 + consumed_bits as i64)) as i32
    }

    /// Resizes the buffer for a new bitrate at constant delay, within the
    /// configured buffer size.
    pub fn change_bitrate(
        &mut self,
        bit_rate: [u32; MAX_NUM_DRAIN_RATES],
        peak_bitrate: u32,
    ) -> Result<(), RcError> {
        self.reconfigure(|vbv| {
            let mut bpf = [0; MAX_NUM_DRAIN_RATES];
            for i in 0..MAX_NUM_DRAIN_RATES {
                bpf[i] = bits_per_frame(bit_rate[i] as i64, vbv.frame_rate);
                vbv.drain_bits_per_frame[i] = bpf[i];
                vbv.error_bits[i].change_bitrate(bit_rate[i]);
            }
            vbv.peak_drain_rate_frame = bits_per_frame(peak_bitrate as i64, vbv.frame_rate);

            let size = bit_rate[0] as i64 * vbv.max_delay as i64 / 1000;
            vbv.buffer_size = size.min(vbv.max_vbv_buf_size as i64) as i32;
            vbv.set_thresholds(bpf[0]);

            let bitrate = bit_rate[0] as i64;
            if vbv.rc_mode == RcMode::Cbr {
                vbv.vbr_max_bit_deviation = vbv.buffer_size as i64;
            } else {
                let file_size = (bitrate * 1000 / vbv.frame_rate as i64)
                    * (vbv.total_frames - vbv.frames_encoded);
                let mut dev = if vbv.max_peak_rate_duration > 0.0 {
                    (vbv.max_peak_rate_duration * bitrate as f32) as i64
                } else {
                    VBR_MAX_BIT_DEV_SEC * bitrate
                };
                if vbv.total_frames <= 0 || dev > file_size >> 3 {
                    dev = file_size >> 3;
                }
                if dev < bitrate {
                    dev = bitrate;
                }
                vbv.vbr_max_bit_deviation = dev;
            }

            for i in 0..MAX_NUM_DRAIN_RATES {
                vbv.bit_rate[i] = bit_rate[i] as i32;
            }
            vbv.clamp_ebf();
        })?;
        debug!(
            "vbv: bitrate {:?} peak {} size {}",
            bit_rate, peak_bitrate, self.buffer_size
        );
        Ok(())
    }

    pub fn change_pics_in_delay(
        &mut self,
        pics_in_delay_period: [u32; MAX_PIC_TYPE],
    ) -> Result<(), RcError> {
        if self.is_cbr {
            return Ok(());
        }
        self.reconfigure(|vbv| {
            let size = pics_in_delay_period[0] as i64 * vbv.drain_bits_per_frame[0] as i64
                + pics_in_delay_period[1] as i64 * vbv.drain_bits_per_frame[1] as i64;
            vbv.buffer_size = size.min(vbv.max_vbv_buf_size as i64) as i32;
            for i in 0..MAX_PIC_TYPE {
                vbv.upr_thr[i] = vbv.buffer_size - (vbv.buffer_size >> 3);
            }
            vbv.pics_in_delay_period = pics_in_delay_period;
            vbv.clamp_lower_thresholds();
            vbv.clamp_ebf();
        })
    }

    pub fn change_frame_rate(&mut self, frame_rate: u32) -> Result<(), RcError> {
        if frame_rate == 0 {
            return Err(RcError::InvalidConfig("frame rate must be positive".into()));
        }
        self.reconfigure(|vbv| {
            let frame_rate = frame_rate as i32;
            let mut bpf = [0; MAX_NUM_DRAIN_RATES];
            for i in 0..MAX_NUM_DRAIN_RATES {
                bpf[i] = bits_per_frame(vbv.bit_rate[i] as i64, frame_rate);
                vbv.drain_bits_per_frame[i] = bpf[i];
                vbv.error_bits[i].change_frame_rate(frame_rate as u32);
            }

            if !vbv.is_cbr {
                let size = vbv.pics_in_delay_period[0] as i64 * bpf[0] as i64
                    + vbv.pics_in_delay_period[1] as i64 * bpf[1] as i64;
                vbv.buffer_size = size.min(i32::MAX as i64) as i32;
            }
            if vbv.buffer_size > vbv.max_vbv_buf_size {
                vbv.buffer_size = vbv.max_vbv_buf_size;
            }

            for (i, &pic_type) in PictureType::ALL.iter().enumerate() {
                vbv.upr_thr[i] = vbv.buffer_size - (vbv.buffer_size >> 3);
                // even an empty picture must have enough bits to drain
                vbv.low_thr[i] = bpf[pic_type.drain_idx()];
            }
            vbv.frame_rate = frame_rate;
            vbv.clamp_lower_thresholds();
            vbv.clamp_ebf();
        })
    }

    pub fn change_delay(&mut self, buffer_delay: u32) -> Result<(), RcError> {
        self.reconfigure(|vbv| {
            if vbv.is_cbr {
                vbv.buffer_size = (vbv.bit_rate[0] as i64 * buffer_delay as i64 / 1000)
                    .min(vbv.max_vbv_buf_size as i64) as i32;
            }
            for i in 0..MAX_PIC_TYPE {
                vbv.upr_thr[i] = vbv.buffer_size - (vbv.buffer_size >> 3);
            }
            vbv.max_delay = buffer_delay as i32;
            vbv.clamp_lower_thresholds();
            vbv.clamp_ebf();
        })
    }

    /// Moves the estimated fullness away from the committed one by a
    /// known bit error, e.g. bits of a picture still in flight.
    pub fn modify_ebf_estimate(&mut self, bit_error: i32) {
        let est = self.ebf as i64 + bit_error as i64;
        self.ebf_estimate = est.max(0).min(self.buffer_size as i64) as i32;
    }

    pub fn update_buf_mismatch_bit(&mut self, error_bits: i32) {
        self.ebf -= error_bits;
        self.ebf_bit_alloc -= error_bits as i64;
        self.credit_level -= error_bits as i64;
        self.clamp_ebf();
    }

    pub fn set_ebf(&mut self, ebf: i32) {
        self.ebf = ebf;
        self.clamp_ebf();
    }

    pub fn buffer_size(&self) -> i32 {
        self.buffer_size
    }

    pub fn delay(&self) -> i32 {
        self.max_delay
    }

    pub fn ebf(&self) -> i32 {
        self.ebf
    }

    pub fn ebf_estimate(&self) -> i32 {
        self.ebf_estimate
    }

    pub fn max_ebf(&self) -> i32 {
        self.upr_thr[0]
    }

    pub fn ebf_bit_alloc(&self) -> i64 {
        self.ebf_bit_alloc
    }

    pub fn credit_level(&self) -> i64 {
        self.credit_level
    }

    pub fn upper_threshold(&self, pic_type: PictureType) -> i32 {
        self.upr_thr[pic_type.idx()]
    }

    pub fn lower_threshold(&self, pic_type: PictureType) -> i32 {
        self.low_thr[pic_type.idx()]
    }

    pub fn drain_bits_per_frame(&self, pic_type: PictureType) -> i32 {
        self.drain_bits_per_frame[pic_type.drain_idx()]
    }

    pub fn num_frames_encoded(&self) -> i64 {
        self.frames_encoded
    }

    pub fn num_frames_to_encode(&self) -> i64 {
        self.total_frames
    }

    pub fn rc_mode(&self) -> RcMode {
        self.rc_mode
    }

    pub fn delay_frames(&self) -> u32 {
        self.frames_in_delay
    }

    pub fn vbr_max_bit_deviation(&self) -> i64 {
        self.vbr_max_bit_deviation
    }

    pub fn buf_max_drain_rate(&self) -> i32 {
        if self.rc_mode == RcMode::VbrStreaming {
            self.peak_drain_rate_frame
        } else {
            self.drain_bits_per_frame[0]
        }
    }

    /// Extra bits a very complex stretch may take out of the buffer headroom,
    /// spread over `bit_alloc_period` frames.
    pub fn vbv_buffer_based_excess(
        &self,
        complexity_peak_rate: f32,
        cur_bits_complexity: f32,
        bit_alloc_period: i32,
        num_gops_for_excess: i32,
    ) -> i32 {
        let bitrate = self.bit_rate[0];
        let peak_level = (self.peak_drain_rate_frame as f32
            * self.frames_in_delay as f32
            * MAX_BUFFER_LEVEL_RATIO) as i64;

        let mut max_buffer_level = (self.buffer_size as f32 * MAX_BUFFER_LEVEL_RATIO) as i64;
        if (self.upr_thr[0] as i64) < max_buffer_level {
            max_buffer_level = self.upr_thr[0] as i64;
        }
        if self.rc_mode == RcMode::VbrStreaming {
            max_buffer_level = peak_level;
        }

        let cur_bits_complexity = cur_bits_complexity.min(MAX_BITS_COMPLEXITY);
        // buffers shorter than one second never lend bits
        if cur_bits_complexity < complexity_peak_rate
            || cur_bits_complexity < MIN_BITS_COMPLEXITY
            || bitrate <= 0
            || self.buffer_size < bitrate
        {
            return 0;
        }

        let ratio = (cur_bits_complexity - complexity_peak_rate)
            / (MAX_BITS_COMPLEXITY - complexity_peak_rate);
        let mut excess = (ratio * (max_buffer_level - self.ebf as i64) as f32) as i64;
        if excess < 0 {
            excess = 0;
        }

        let frames_to_distribute = (self.buffer_size as f32 / bitrate as f32
            * self.frame_rate as f32
            / 1000.0
            + 0.5) as i32;
        if bit_alloc_period < frames_to_distribute {
            excess = (excess as f32 * bit_alloc_period as f32 / frames_to_distribute as f32) as i64;
        }

        if self.rc_mode == RcMode::VbrStreaming {
            if num_gops_for_excess > 1 {
                excess *= num_gops_for_excess as i64;
            }
            if excess > peak_level {
                excess = peak_level;
            }
        }
        debug!(
            "vbv: excess bits {} complexity {} peak {} gops {}",
            excess, cur_bits_complexity, complexity_peak_rate, num_gops_for_excess
        );
        excess as i32
    }

    /// Correction to the bits of the next allocation period that moves the
    /// buffer towards the level matching the look-ahead complexity (Q7).
    pub fn error_bits_for_desired_buffer(&self, lap_complexity_q7: i32, bit_alloc_period: i32) -> i32 {
        let period = bit_alloc_period.max(1) as i64;
        let x = lap_complexity_q7 as f32 / 128.0;
        match self.rc_mode {
            RcMode::Cbr => self.cbr_error_bits_for_desired_buffer(x, period),
            RcMode::VbrStreaming => self.vbr_error_bits_for_desired_buffer(x, period),
            RcMode::ConstQp => 0,
        }
    }

    fn cbr_error_bits_for_desired_buffer(&self, x: f32, period: i64) -> i32 {
        let default_bits = self.bit_rate[0] as i64 * 1000 * period / self.frame_rate as i64;
        let max_additional = default_bits;
        let level = self.upr_thr[0] as i64;
        if level <= 0 {
            return 0;
        }

        let desired = comp_to_bits_map(x, level as f32).max(0.0);
        let mut error_bits = (desired - self.ebf_bit_alloc as f32) as i64;
        let diff_bits = error_bits;
        let buf_diff = error_bits as f32 / level as f32;
        let (limit_red, limit_inc) = buf_based_limits(level, period);

        if error_bits > 0 {
            error_bits = (x * max_additional as f32) as i64;
            if x < LOW_LAP_COMPLEXITY && self.ebf_bit_alloc >= 0 {
                error_bits = 0;
            }
            error_bits = error_bits.min(diff_bits).min(limit_inc);
            // a buffer three quarters full only gets half
            if self.ebf_bit_alloc > (self.buffer_size as f64 * FULL_BUFFER_RATIO) as i64 {
                error_bits = error_bits.min(max_additional >> 1);
            } else {
                error_bits = error_bits.min(max_additional);
            }
        } else {
            error_bits = (buf_diff * (default_bits >> 1) as f32) as i64;
            error_bits = error_bits.max(-limit_red);
            if self.ebf_bit_alloc > (self.buffer_size >> 1) as i64 {
                error_bits = error_bits.max(-(default_bits >> 1));
            } else {
                error_bits = error_bits.max(-((default_bits * 5) >> 4));
            }
        }
        error_bits as i32
    }

    fn vbr_error_bits_for_desired_buffer(&self, x: f32, period: i64) -> i32 {
        let drain = self.drain_bits_per_frame[0] as i64;
        if drain <= 0 {
            return 0;
        }
        let default_alloc = drain * period;
        let dev = self.vbr_max_bit_deviation;
        let credit = self.credit_level;

        // window over which the average rate has to be met
        let mut ravg_dur = dev * 5 / drain;
        if ravg_dur > 20 * self.total_frames / 100 {
            ravg_dur = 20 * self.total_frames / 100;
        }
        if ravg_dur <= 0 {
            ravg_dur = 1;
        }
        let mut periods_in_ravg = ravg_dur / period;
        if self.total_frames < period || periods_in_ravg <= 0 {
            periods_in_ravg = 1;
        }

        // mapped to the absolute peak bitrate
        let comp = comp_to_bits_map(x, 1.0) * 10.0;

        let mut max_excess = (self.peak_drain_rate_frame as i64 - drain) * period;
        if (self.ebf as i64) > self.upr_thr[0] as i64 - (max_excess as f64 * 0.2) as i64 {
            max_excess = (max_excess as f64 * 0.8) as i64;
        }

        let (limit_red, limit_inc) = buf_based_limits(dev, period);
        let mut excess: i64 = 0;
        let mut comp_excess = ((comp - 1.0) * default_alloc as f32) as i64;

        if !self.capped_vbr {
            // overconsumption so far reduces the allocation
            excess -= self.ebf_bit_alloc / periods_in_ravg;

            if comp_excess > limit_inc {
                comp_excess = limit_inc;
            } else if comp_excess < -limit_red {
                comp_excess = -limit_red;
            }

            let devf = dev as f32;
            if credit > dev {
                if comp_excess < 0 {
                    excess += comp_excess;
                }
            } else if credit > (devf * CREDIT_HIGH_RATIO) as i64 {
                if comp_excess > 0 {
                    let room = (dev - credit) as f32 / (CREDIT_LOW_RATIO * devf);
                    excess += (room * comp_excess as f32) as i64;
                } else {
                    excess += comp_excess;
                }
            } else if credit > (devf * CREDIT_LOW_RATIO) as i64 {
                excess += comp_excess;
            } else if credit > 0 {
                if comp_excess < 0 {
                    let room = credit as f32 / (CREDIT_LOW_RATIO * devf);
                    excess += (room * comp_excess as f32) as i64;
                } else {
                    excess += comp_excess;
                }
            } else if comp_excess > 0 {
                excess += comp_excess;
            }
        } else {
            excess = comp_excess;
        }

        if excess > max_excess {
            excess = max_excess;
        }
        let floor = -(default_alloc as f32 * MIN_ALLOC_RATIO) as i64;
        if excess < floor {
            excess = floor;
        }
        excess as i32
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaChaRng;

    fn cbr_params() -> VbvParams {
        VbvParams {
            buffer_delay: 2000,
            frame_rate: 30000,
            bitrate: 2_000_000,
            pics_in_delay_period: [2, 58, 0],
            vbv_buffer_size: 4_000_000,
            intra_frame_interval: 30,
            rc_mode: RcMode::Cbr,
            peak_bitrate: 2_000_000,
            frames_in_delay: 60,
            max_peak_rate_duration: -1.0,
            total_frames: -1,
            inter_frame_interval: 1,
            capped_vbr: false,
        }
    }

    fn vbr_params() -> VbvParams {
        VbvParams {
            bitrate: 1_000_000,
            peak_bitrate: 2_000_000,
            vbv_buffer_size: 2_000_000,
            rc_mode: RcMode::VbrStreaming,
            total_frames: 300,
            ..cbr_params()
        }
    }

    fn assert_thresholds(vbv: &VbvBuffer) {
        for &t in PictureType::ALL.iter() {
            assert!(
                vbv.upper_threshold(t) > vbv.lower_threshold(t),
                "{} upper {} lower {}",
                t,
                vbv.upper_threshold(t),
                vbv.lower_threshold(t)
            );
        }
    }

    #[test]
    fn cbr_thresholds() {
        let vbv = VbvBuffer::new(&cbr_params()).unwrap();
        assert_eq!(vbv.upper_threshold(PictureType::I), 3_750_000);
        assert_eq!(vbv.lower_threshold(PictureType::P), 62_500);
        assert_eq!(vbv.drain_bits_per_frame(PictureType::P), 66_666);
    }

    #[test]
    fn tiny_buffer_is_rejected() {
        let p = VbvParams {
            vbv_buffer_size: 8,
            ..cbr_params()
        };
        match VbvBuffer::new(&p) {
            Err(RcError::ThresholdOrder { .. }) => {}
            other => panic!("unexpected {:?}", other.map(|v| v.buffer_size())),
        }
    }

    #[test]
    fn cbr_steady_stream_stays_near_empty() {
        let mut vbv = VbvBuffer::new(&cbr_params()).unwrap();
        for _ in 0..300 {
            vbv.update(66_667, PictureType::I);
            assert!(vbv.ebf() >= 0 && vbv.ebf() <= 4_000_000);
        }
        assert!(vbv.ebf() < 1000, "ebf {}", vbv.ebf());
    }

    #[test]
    fn status_reports_decoder_view() {
        let vbv = VbvBuffer::new(&cbr_params()).unwrap();
        assert_eq!(vbv.status(4_000_001, PictureType::P), (VbvStatus::Underflow, 0));
        assert_eq!(vbv.status(0, PictureType::P), (VbvStatus::Overflow, 4_000_000));
        assert_eq!(
            vbv.status(100_000, PictureType::P),
            (VbvStatus::Normal, 4_000_000 - 33_334)
        );
        assert_eq!(vbv.status(0, PictureType::P), vbv.status(0, PictureType::P));

        let vbr = VbvBuffer::new(&vbr_params()).unwrap();
        assert_eq!(vbr.status(0, PictureType::P).0, VbvStatus::Normal);
    }

    #[test]
    fn cbr_constraint_and_stuffing() {
        let vbv = VbvBuffer::new(&cbr_params()).unwrap();
        assert_eq!(
            vbv.constraint_check(5_000_000, PictureType::I),
            BitBounds {
                target: 3_750_000,
                min_bits: 129_166,
                max_bits: 3_750_000,
            }
        );
        assert_eq!(vbv.constraint_check(1000, PictureType::P).target, 129_166);
        assert_eq!(vbv.bits_to_stuff(0, PictureType::P), 129_166);
        assert_eq!(vbv.bits_to_stuff(200_000, PictureType::P), -70_834);
    }

    #[test]
    fn vbr_deviation_and_constraint() {
        let vbv = VbvBuffer::new(&vbr_params()).unwrap();
        assert_eq!(vbv.vbr_max_bit_deviation(), 1_249_987);
        assert_eq!(
            vbv.vbr_stream_constraint_check(50_000, PictureType::P),
            BitBounds {
                target: 50_000,
                min_bits: 0,
                max_bits: 1_875_000,
            }
        );

        let mut live = VbvBuffer::new(&VbvParams {
            total_frames: -1,
            ..vbr_params()
        })
        .unwrap();
        assert_eq!(live.vbr_max_bit_deviation(), 1_000_000);
        live.update(0, PictureType::P);
        assert_eq!(live.ebf_bit_alloc(), -33_333);
        assert_eq!(live.credit_level(), -33_333);
        // unlimited peak duration banks the underconsumption instead
        assert_eq!(live.vbr_stream_constraint_check(0, PictureType::P).min_bits, 0);
        assert_eq!(live.constrain(0, PictureType::P).min_bits, 0);
    }

    #[test]
    fn bounded_peak_duration_forgets_underconsumption() {
        let mut vbv = VbvBuffer::new(&VbvParams {
            max_peak_rate_duration: 5.0,
            ..vbr_params()
        })
        .unwrap();
        vbv.update(0, PictureType::P);
        assert_eq!(vbv.ebf_bit_alloc(), 0);
        assert_eq!(vbv.credit_level(), -33_333);
        assert_eq!(vbv.vbr_stream_constraint_check(0, PictureType::P).min_bits, 33_333);
    }

    #[test]
    fn capped_vbr_has_no_floor() {
        let bounded = VbvParams {
            max_peak_rate_duration: 5.0,
            ..vbr_params()
        };
        let vbv = VbvBuffer::new(&bounded).unwrap();
        assert_eq!(
            vbv.constrain(0, PictureType::P),
            BitBounds {
                target: 33_333,
                min_bits: 33_333,
                max_bits: 1_875_000,
            }
        );

        let capped = VbvBuffer::new(&VbvParams {
            capped_vbr: true,
            ..bounded
        })
        .unwrap();
        assert_eq!(
            capped.constrain(0, PictureType::P),
            BitBounds {
                target: 0,
                min_bits: 0,
                max_bits: 1_875_000,
            }
        );
        assert_eq!(capped.constrain(5_000_000, PictureType::P).target, 1_875_000);
    }

    #[test]
    fn ebf_estimate_moves_cbr_bounds() {
        let mut vbv = VbvBuffer::new(&cbr_params()).unwrap();
        let idle = vbv.constraint_check(0, PictureType::P);
        assert_eq!((idle.min_bits, idle.max_bits), (129_166, 3_750_000));

        vbv.modify_ebf_estimate(1_000_000);
        assert_eq!(vbv.ebf_estimate(), 1_000_000);
        assert_eq!(vbv.ebf(), 0);
        let busy = vbv.constraint_check(0, PictureType::P);
        assert_eq!((busy.min_bits, busy.max_bits), (0, 2_750_000));

        vbv.modify_ebf_estimate(-5);
        assert_eq!(vbv.ebf_estimate(), 0);
        assert_eq!(vbv.constraint_check(0, PictureType::P), idle);
    }

    #[test]
    fn fullness_stays_in_bounds() {
        let mut rng = ChaChaRng::from_seed([0; 32]);
        for &params in &[cbr_params(), vbr_params()] {
            let mut vbv = VbvBuffer::new(&params).unwrap();
            for i in 0..1000 {
                let pic_type = PictureType::ALL[i % 3];
                let consumed = rng.gen_range(0, vbv.buffer_size() * 3 / 2);
                let before = vbv.status(consumed, pic_type);
                assert_eq!(before, vbv.status(consumed, pic_type));
                vbv.update(consumed, pic_type);
                assert!(vbv.ebf() >= 0 && vbv.ebf() <= vbv.buffer_size());
            }
        }
    }

    #[test]
    fn thresholds_hold_after_changes() {
        let mut rng = ChaChaRng::from_seed([1; 32]);
        for &params in &[cbr_params(), vbr_params()] {
            let mut vbv = VbvBuffer::new(&params).unwrap();
            assert_thresholds(&vbv);
            for _ in 0..50 {
                let size = vbv.buffer_size();
                let res = match rng.gen_range(0, 4) {
                    0 => {
                        let br = rng.gen_range(1, 20_000_000);
                        vbv.change_bitrate([br, br], br * 2)
                    }
                    1 => vbv.change_frame_rate(rng.gen_range(1000, 120_000)),
                    2 => vbv.change_delay(rng.gen_range(1, 4000)),
                    _ => {
                        let n = rng.gen_range(1, 100);
                        vbv.change_pics_in_delay([1, n, 0])
                    }
                };
                match res {
                    Ok(()) => {}
                    Err(RcError::ThresholdOrder { .. }) => assert_eq!(vbv.buffer_size(), size),
                    Err(err) => panic!("unexpected {}", err),
                }
                assert_thresholds(&vbv);
                assert!(vbv.buffer_size() <= params.vbv_buffer_size as i32);
                assert!(vbv.ebf() <= vbv.buffer_size());
            }
        }
    }

    #[test]
    fn cbr_bitrate_change_resizes_buffer() {
        let mut vbv = VbvBuffer::new(&cbr_params()).unwrap();
        // never grows past the configured size
        vbv.change_bitrate([4_000_000, 4_000_000], 4_000_000).unwrap();
        assert_eq!(vbv.buffer_size(), 4_000_000);
        assert_eq!(vbv.drain_bits_per_frame(PictureType::I), 133_333);
        assert_eq!(vbv.max_ebf(), 3_750_000);
        assert_thresholds(&vbv);

        vbv.change_bitrate([1_000_000, 1_000_000], 1_000_000).unwrap();
        assert_eq!(vbv.buffer_size(), 2_000_000);
        assert_eq!(vbv.max_ebf(), 1_875_000);
        assert_eq!(vbv.lower_threshold(PictureType::P), 31_250);

        vbv.change_bitrate([3_000_000, 3_000_000], 3_000_000).unwrap();
        assert_eq!(vbv.buffer_size(), 4_000_000);
    }

    #[test]
    fn collapsing_change_is_rolled_back() {
        let mut vbv = VbvBuffer::new(&cbr_params()).unwrap();
        match vbv.change_bitrate([5, 5], 5) {
            Err(RcError::ThresholdOrder { .. }) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(vbv.buffer_size(), 4_000_000);
        assert_eq!(vbv.drain_bits_per_frame(PictureType::P), 66_666);
        assert_eq!(vbv.max_ebf(), 3_750_000);

        assert!(vbv.change_delay(0).is_err());
        assert_eq!(vbv.delay(), 2000);
        assert!(vbv.change_frame_rate(0).is_err());
        assert_thresholds(&vbv);
    }

    #[test]
    fn desired_buffer_correction() {
        let vbv = VbvBuffer::new(&cbr_params()).unwrap();
        assert_eq!(vbv.error_bits_for_desired_buffer(64, 30), 292_968);

        let vbr = VbvBuffer::new(&vbr_params()).unwrap();
        let bits = vbr.error_bits_for_desired_buffer(128, 30);
        assert!(bits > 0 && bits <= (66_666 - 33_333) * 30, "bits {}", bits);
    }

    #[test]
    fn buffer_based_excess_needs_complex_content() {
        let vbv = VbvBuffer::new(&cbr_params()).unwrap();
        assert_eq!(vbv.vbv_buffer_based_excess(0.5, 0.3, 30, 1), 0);
        let excess = vbv.vbv_buffer_based_excess(0.5, 0.9, 30, 1);
        assert!(excess > 0 && excess <= 3_200_000, "excess {}", excess);
    }
}
