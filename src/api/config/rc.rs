use crate::api::*;
use crate::rc::*;

// Rate control settings of one encoding session.
#[derive(Clone, Copy, Debug)]
pub struct RcConfig {
    pub rc_mode: RcMode,
    // bits per second
    pub bitrate: u32,
    pub peak_bitrate: u32,
    // frames per 1000 seconds, 30000 is 30 fps
    pub frame_rate: u32,

    // VBV buffer size in bits
    pub vbv_buffer_size: u32,
    // VBV buffer delay in ms
    pub buffer_delay: u32,
    // zero derives the counts from the delay and the GOP
    pub pics_in_delay_period: [u32; MAX_PIC_TYPE],
    pub frames_in_delay: u32,
    // seconds, negative is unlimited
    pub max_peak_rate_duration: f32,
    // negative when unknown
    pub total_frames: i64,
    pub pass: u8,
    pub capped_vbr: bool,

    // GOP structure
    pub intra_frame_interval: i32,
    pub inter_frame_interval: i32,
    pub max_inter_frame_interval: i32,
    pub idr_period: i32,
    pub closed_gop: bool,
    pub num_b_layers: i32,

    // codec QP range and first-picture QP per picture type
    pub min_qp: [u8; MAX_PIC_TYPE],
    pub max_qp: [u8; MAX_PIC_TYPE],
    pub init_qp: [u8; MAX_PIC_TYPE],
    pub use_est_intra_sad: bool,
    pub high_bitrate: bool,

    pub width: usize,
    pub height: usize,
    // pictures kept per RD model
    pub rd_window: usize,
}

impl Default for RcConfig {
    fn default() -> Self {
        RcConfig {
            rc_mode: RcMode::Cbr,
            bitrate: 2_000_000,
            peak_bitrate: 2_000_000,
            frame_rate: 30000,
            vbv_buffer_size: 4_000_000,
            buffer_delay: 2000,
            pics_in_delay_period: [0; MAX_PIC_TYPE],
            frames_in_delay: 0,
            max_peak_rate_duration: -1.0,
            total_frames: -1,
            pass: 1,
            capped_vbr: false,
            intra_frame_interval: 30,
            inter_frame_interval: 1,
            max_inter_frame_interval: 1,
            idr_period: 0,
            closed_gop: true,
            num_b_layers: 1,
            min_qp: [1; MAX_PIC_TYPE],
            max_qp: [MAX_CODEC_QP; MAX_PIC_TYPE],
            init_qp: [27, 29, 31],
            use_est_intra_sad: false,
            high_bitrate: false,
            width: 1920,
            height: 1080,
            rd_window: DEFAULT_MAX_FRAMES_MODELLED,
        }
    }
}

pub(crate) fn valid_qp_range(min_qp: u8, max_qp: u8) -> bool {
    min_qp > 0 && max_qp <= MAX_CODEC_QP && min_qp <= max_qp
}

impl RcConfig {
    pub fn validate(&self) -> Result<(), RcError> {
        let invalid = |msg: String| Err(RcError::InvalidConfig(msg));

        if self.frame_rate == 0 {
            return invalid("frame rate must be positive".into());
        }
        if self.rc_mode != RcMode::ConstQp {
            if self.bitrate == 0 {
                return invalid("bitrate must be positive".into());
            }
            if self.buffer_delay == 0 || self.vbv_buffer_size == 0 {
                return invalid("vbv buffer size and delay must be positive".into());
            }
        }
        if self.rc_mode == RcMode::VbrStreaming && self.peak_bitrate < self.bitrate {
            return invalid(format!(
                "peak bitrate {} below bitrate {}",
                self.peak_bitrate, self.bitrate
            ));
        }
        for &pic_type in PictureType::ALL.iter() {
            let (min, max) = (self.min_qp[pic_type.idx()], self.max_qp[pic_type.idx()]);
            if !valid_qp_range(min, max) {
                return invalid(format!(
                    "{} qp range {}..={} outside 1..={}",
                    pic_type, min, max, MAX_CODEC_QP
                ));
            }
        }
        if self.init_qp.iter().any(|&qp| qp > MAX_CODEC_QP) {
            return invalid(format!("initial qp {:?} above {}", self.init_qp, MAX_CODEC_QP));
        }
        if self.pass != 1 && self.pass != 2 {
            return invalid(format!("pass {} is neither 1 nor 2", self.pass));
        }
        if self.rd_window == 0 {
            return invalid("rd model window must hold at least one picture".into());
        }
        self.gop_params().validate()
    }

    pub fn gop_params(&self) -> GopParams {
        GopParams {
            intra_frame_interval: self.intra_frame_interval,
            inter_frame_interval: self.inter_frame_interval,
            max_inter_frame_interval: self.max_inter_frame_interval,
            idr_period: self.idr_period,
            closed_gop: self.closed_gop,
            num_b_layers: self.num_b_layers,
        }
    }

    pub fn frames_in_delay(&self) -> u32 {
        if self.frames_in_delay > 0 {
            return self.frames_in_delay;
        }
        (self.buffer_delay as u64 * self.frame_rate as u64 / 1_000_000) as u32
    }

    // I pictures drain at their own rate, P and B share one
    pub fn pics_in_delay_period(&self) -> [u32; MAX_PIC_TYPE] {
        if self.pics_in_delay_period.iter().any(|&n| n > 0) {
            return self.pics_in_delay_period;
        }
        let frames = self.frames_in_delay();
        let intra = self.intra_frame_interval.max(1) as u32;
        let i_pics = ((frames + intra - 1) / intra).min(frames);
        [i_pics, frames - i_pics, 0]
    }

    pub fn vbv_params(&self) -> VbvParams {
        VbvParams {
            buffer_delay: self.buffer_delay,
            frame_rate: self.frame_rate,
            bitrate: self.bitrate,
            pics_in_delay_period: self.pics_in_delay_period(),
            vbv_buffer_size: self.vbv_buffer_size,
            intra_frame_interval: self.intra_frame_interval,
            rc_mode: self.rc_mode,
            peak_bitrate: self.peak_bitrate.max(self.bitrate),
            frames_in_delay: self.frames_in_delay(),
            max_peak_rate_duration: self.max_peak_rate_duration,
            total_frames: self.total_frames,
            inter_frame_interval: self.inter_frame_interval,
            capped_vbr: self.capped_vbr,
        }
    }

    pub fn pels_in_frame(&self) -> i64 {
        self.width as i64 * self.height as i64
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_is_valid() {
        let cfg = RcConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.frames_in_delay(), 60);
        assert_eq!(cfg.pics_in_delay_period(), [2, 58, 0]);
    }

    #[test]
    fn rejects_bad_settings() {
        let bad = [
            RcConfig {
                frame_rate: 0,
                ..Default::default()
            },
            RcConfig {
                bitrate: 0,
                ..Default::default()
            },
            RcConfig {
                buffer_delay: 0,
                ..Default::default()
            },
            RcConfig {
                rc_mode: RcMode::VbrStreaming,
                peak_bitrate: 1_000_000,
                ..Default::default()
            },
            RcConfig {
                min_qp: [1, 40, 1],
                max_qp: [51, 30, 51],
                ..Default::default()
            },
            RcConfig {
                inter_frame_interval: 4,
                max_inter_frame_interval: 3,
                ..Default::default()
            },
            RcConfig {
                rd_window: 0,
                ..Default::default()
            },
        ];
        for cfg in bad.iter() {
            assert!(cfg.validate().is_err(), "{:?}", cfg);
        }
    }

    #[test]
    fn const_qp_needs_no_bitrate() {
        let cfg = RcConfig {
            rc_mode: RcMode::ConstQp,
            bitrate: 0,
            ..Default::default()
        };
        cfg.validate().unwrap();
    }

    #[test]
    fn explicit_delay_counts_win() {
        let cfg = RcConfig {
            pics_in_delay_period: [1, 20, 9],
            frames_in_delay: 30,
            ..Default::default()
        };
        assert_eq!(cfg.vbv_params().pics_in_delay_period, [1, 20, 9]);
        assert_eq!(cfg.vbv_params().frames_in_delay, 30);
    }
}
