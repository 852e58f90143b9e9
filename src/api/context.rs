use log::*;

use super::*;
use crate::rc::*;
use crate::tracer::*;

// share of the GOP bits per picture type, in pictures of weight one
const PIC_TYPE_WEIGHT: [i64; MAX_PIC_TYPE] = [4, 2, 1];

// I and P pictures may fill the buffer up to this share
const MAX_EBF_RATIO: f32 = 0.9;

/// Quantizer decision for one picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameQp {
    pub target_bits: i32,
    pub min_bits: i32,
    pub max_bits: i32,
    pub qscale_q6: i32,
    pub qp: u8,
}

/// What the encoder reports back after coding a picture.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    pub pic_type: PictureType,
    pub consumed_bits: i32,
    pub sad: u64,
    // average Q6 qscale the picture was coded with
    pub avg_qp_q6: i32,
    pub num_skips: u32,
    pub is_scd: bool,
    pub is_non_ref: bool,
}

pub struct Context {
    cfg: RcConfig,

    pic_handling: PicHandling,
    vbv: VbvBuffer,
    est_sad: EstSad,
    rd_model: [RdModel; MAX_PIC_TYPE],
    init_qp: InitQp,
    mb_qp: MbQpModulator,
    prev_qp: PrevFrameQp,

    min_qscale_q6: [i32; MAX_PIC_TYPE],
    max_qscale_q6: [i32; MAX_PIC_TYPE],
    // the swing limit is skipped once per type after a bitrate change
    bitrate_changed: [bool; MAX_PIC_TYPE],
    frames_coded: u64,

    tracer: Option<Tracer>,
}

impl Context {
    pub fn new(cfg: &RcConfig) -> Result<Self, RcError> {
        if let Err(err) = cfg.validate() {
            error!("rate control: {}", err);
            return Err(err);
        }

        let pic_handling = PicHandling::new(&cfg.gop_params())?;
        let vbv = VbvBuffer::new(&cfg.vbv_params())?;

        let mut min_qscale_q6 = [0; MAX_PIC_TYPE];
        let mut max_qscale_q6 = [0; MAX_PIC_TYPE];
        for t in 0..MAX_PIC_TYPE {
            min_qscale_q6[t] = qp_to_qscale_q6(cfg.min_qp[t]);
            max_qscale_q6[t] = qp_to_qscale_q6(cfg.max_qp[t]);
        }
        let mut mb_qp = MbQpModulator::new(qp_to_qscale_q6(cfg.init_qp[PictureType::I.idx()]));
        mb_qp.set_qp_range(qp_to_qscale_q6(0), qp_to_qscale_q6(MAX_CODEC_QP));

        debug!(
            "rate control: {} {} bps, vbv {} bits / {} ms, gop {}/{}",
            cfg.rc_mode,
            cfg.bitrate,
            cfg.vbv_buffer_size,
            cfg.buffer_delay,
            cfg.intra_frame_interval,
            cfg.inter_frame_interval
        );

        Ok(Context {
            pic_handling,
            vbv,
            est_sad: EstSad::new(cfg.use_est_intra_sad),
            rd_model: [
                RdModel::new(cfg.rd_window),
                RdModel::new(cfg.rd_window),
                RdModel::new(cfg.rd_window),
            ],
            init_qp: InitQp::new(
                max_qscale_q6[PictureType::I.idx()] >> QSCALE_Q_FAC,
                cfg.pels_in_frame(),
                cfg.high_bitrate,
            ),
            mb_qp,
            prev_qp: PrevFrameQp::new(cfg.high_bitrate, cfg.num_b_layers),
            min_qscale_q6,
            max_qscale_q6,
            bitrate_changed: [false; MAX_PIC_TYPE],
            frames_coded: 0,
            tracer: OPEN_TRACE(),
            cfg: *cfg,
        })
    }

    pub fn add_picture(&mut self, pic_id: i32, hint: PicHint) {
        self.pic_handling.add_picture(pic_id, hint);
    }

    pub fn add_picture_re_enc(&mut self, pic_id: i32, pic_type: PictureType) -> Result<(), RcError> {
        self.pic_handling.add_picture_re_enc(pic_id, pic_type)
    }

    pub fn get_picture(&mut self) -> Scheduled {
        let scheduled = self.pic_handling.get_picture();
        if let Scheduled::Picture(pic) = &scheduled {
            TRACE_PIC(&mut self.tracer, pic, self.pic_handling.rem_frames_in_gop());
        }
        scheduled
    }

    pub fn flush(&mut self) {
        self.pic_handling.flush();
    }

    /// Uniform per-type share of the GOP bits at the average drain rate.
    pub fn target_bits(&self, pic_type: PictureType) -> i32 {
        let frms = self.pic_handling.actual_frames_in_gop();
        let num_frames: i64 = frms.iter().map(|&n| n as i64).sum();
        let gop_bits = self.vbv.drain_bits_per_frame(PictureType::I) as i64 * num_frames;
        let weighted: i64 = frms
            .iter()
            .zip(PIC_TYPE_WEIGHT.iter())
            .map(|(&n, &w)| n as i64 * w)
            .sum();
        (gop_bits * PIC_TYPE_WEIGHT[pic_type.idx()] / weighted.max(1)) as i32
    }

    /// Frame quantizer for `target_bits`. The target is clipped to the
    /// buffer, inverted through the RD model and kept within the swing
    /// allowed around the previous reference picture. Types without a model
    /// derive their quantizer from the reference picture, or from the bits
    /// per pixel for the very first picture.
    pub fn frame_qp(&mut self, pic_type: PictureType, target_bits: i32) -> FrameQp {
        let t = pic_type.idx();

        if self.cfg.rc_mode == RcMode::ConstQp {
            let qp = self.cfg.init_qp[t];
            let qscale_q6 = qp_to_qscale_q6(qp);
            self.mb_qp.set_frame_qp(qscale_q6);
            return FrameQp {
                target_bits,
                min_bits: 0,
                max_bits: i32::MAX,
                qscale_q6,
                qp,
            };
        }

        let (min_q6, max_q6) = (self.min_qscale_q6[t], self.max_qscale_q6[t]);
        let sad = self.est_sad.get_est_sad(pic_type) as u64;
        let model_valid = sad > 0 && self.rd_model[t].is_valid();

        let target = if model_valid {
            self.cap_target_by_ebf(pic_type, target_bits)
        } else {
            target_bits
        };
        let bounds = self.vbv.constrain(target, pic_type);

        let qscale_q6 = if model_valid {
            let model = &self.rd_model[t];
            let mut q =
                model.find_qp_for_target_bits(bounds.target.max(1) as u32, sad, min_q6, max_q6);
            if !self.bitrate_changed[t] {
                if let Some((lo, hi)) = self.prev_qp.swing_range(pic_type) {
                    if q < lo {
                        q = lo;
                    }
                    if q > hi {
                        // never above what the buffer forces
                        let buf_q = model.find_qp_for_target_bits(
                            bounds.max_bits.max(1) as u32,
                            sad,
                            min_q6,
                            max_q6,
                        );
                        q = hi.max(buf_q);
                    }
                }
            }
            q
        } else {
            match self.prev_qp.ratio_qp_q6(pic_type) {
                Some(q) => q,
                None => {
                    self.init_qp
                        .estimate(pic_type, bounds.target as i64, self.cfg.pels_in_frame())
                        << QSCALE_Q_FAC
                }
            }
        };
        let qscale_q6 = qscale_q6.max(min_q6).min(max_q6);
        self.bitrate_changed[t] = false;
        self.mb_qp.set_frame_qp(qscale_q6);

        debug!(
            "rate control: {} target {} [{}, {}] sad {} qscale_q6 {}",
            pic_type, bounds.target, bounds.min_bits, bounds.max_bits, sad, qscale_q6
        );
        TRACE_RD(
            &mut self.tracer,
            pic_type,
            bounds.target,
            sad,
            qscale_q6,
            &self.rd_model[t],
        );

        FrameQp {
            target_bits: bounds.target,
            min_bits: bounds.min_bits,
            max_bits: bounds.max_bits,
            qscale_q6,
            qp: qscale_q6_to_qp(qscale_q6),
        }
    }

    // I and P pictures give back what would lift the buffer past its
    // margin, but always keep one frame's drain
    fn cap_target_by_ebf(&self, pic_type: PictureType, target_bits: i32) -> i32 {
        if pic_type == PictureType::B {
            return target_bits;
        }
        let max_ebf = (self.vbv.buffer_size() as f32 * MAX_EBF_RATIO) as i64;
        let drain = self.vbv.buf_max_drain_rate() as i64;
        let target = target_bits as i64;
        let expected = self.vbv.ebf() as i64 + target - drain;
        if expected > max_ebf {
            drain.max(target - (expected - max_ebf)) as i32
        } else {
            target_bits
        }
    }

    pub fn set_avg_activity(&mut self, avg_activity: u32) {
        self.mb_qp.set_avg_activity(avg_activity);
    }

    pub fn mb_qp(&self, block_activity: u32) -> MbQp {
        self.mb_qp.modulate(block_activity)
    }

    /// Buffer status if `consumed_bits` were committed, with the free space
    /// left in the buffer.
    pub fn buffer_status(&self, consumed_bits: i32, pic_type: PictureType) -> (VbvStatus, i32) {
        self.vbv.status(consumed_bits, pic_type)
    }

    pub fn bits_to_stuff(&self, consumed_bits: i32, pic_type: PictureType) -> i32 {
        self.vbv.bits_to_stuff(consumed_bits, pic_type)
    }

    /// Commits a coded picture to the buffer, the models and the scheduler.
    pub fn update(&mut self, stats: &FrameStats) -> VbvStatus {
        let pic_type = stats.pic_type;
        let (status, _) = self.vbv.status(stats.consumed_bits, pic_type);
        if status != VbvStatus::Normal {
            warn!(
                "rate control: {} picture of {} bits, buffer {}",
                pic_type, stats.consumed_bits, status
            );
        }

        self.vbv.update(stats.consumed_bits, pic_type);
        TRACE_VBV(
            &mut self.tracer,
            pic_type,
            stats.consumed_bits,
            status,
            &self.vbv,
        );

        if self.cfg.rc_mode != RcMode::ConstQp && stats.sad > 0 {
            self.rd_model[pic_type.idx()].add_frame(
                stats.consumed_bits.max(0) as u32,
                stats.avg_qp_q6,
                stats.sad,
                stats.num_skips,
            );
        }
        if self.cfg.rc_mode != RcMode::ConstQp {
            self.prev_qp
                .update(pic_type, stats.avg_qp_q6, !stats.is_non_ref);
        }
        self.est_sad
            .update_actual_sad(stats.sad.min(u32::MAX as u64) as u32, pic_type);
        self.pic_handling.update(
            pic_type,
            stats.is_non_ref,
            stats.is_scd && pic_type == PictureType::I,
        );
        self.frames_coded += 1;
        status
    }

    /// Drops the current picture. The buffer still drains for it.
    pub fn skip(&mut self, pic_type: PictureType) {
        self.pic_handling.skip_encoded_frame(pic_type);
        self.vbv.update(0, pic_type);
        self.pic_handling.update(pic_type, false, false);
        self.frames_coded += 1;
    }

    /// Live bitrate change. The buffer keeps its delay; a change that would
    /// leave it without room between its thresholds is rejected.
    pub fn change_bitrate(&mut self, bitrate: u32, peak_bitrate: u32) -> Result<(), RcError> {
        if bitrate == 0 && self.cfg.rc_mode != RcMode::ConstQp {
            return Err(RcError::InvalidConfig("bitrate must be positive".into()));
        }
        let peak_bitrate = peak_bitrate.max(bitrate);
        self.vbv
            .change_bitrate([bitrate; MAX_NUM_DRAIN_RATES], peak_bitrate)?;
        self.cfg.bitrate = bitrate;
        self.cfg.peak_bitrate = peak_bitrate;
        self.bitrate_changed = [true; MAX_PIC_TYPE];
        Ok(())
    }

    pub fn change_frame_rate(&mut self, frame_rate: u32) -> Result<(), RcError> {
        self.vbv.change_frame_rate(frame_rate)?;
        self.cfg.frame_rate = frame_rate;
        Ok(())
    }

    pub fn change_delay(&mut self, buffer_delay: u32) -> Result<(), RcError> {
        if buffer_delay == 0 && self.cfg.rc_mode != RcMode::ConstQp {
            return Err(RcError::InvalidConfig("buffer delay must be positive".into()));
        }
        self.vbv.change_delay(buffer_delay)?;
        self.cfg.buffer_delay = buffer_delay;
        Ok(())
    }

    /// New codec QP bounds for one picture type.
    pub fn change_min_max_qp(
        &mut self,
        pic_type: PictureType,
        min_qp: u8,
        max_qp: u8,
    ) -> Result<(), RcError> {
        if !valid_qp_range(min_qp, max_qp) {
            return Err(RcError::InvalidConfig(format!(
                "{} qp range {}..={} outside 1..={}",
                pic_type, min_qp, max_qp, MAX_CODEC_QP
            )));
        }
        let t = pic_type.idx();
        self.cfg.min_qp[t] = min_qp;
        self.cfg.max_qp[t] = max_qp;
        self.min_qscale_q6[t] = qp_to_qscale_q6(min_qp);
        self.max_qscale_q6[t] = qp_to_qscale_q6(max_qp);
        if pic_type == PictureType::I {
            self.init_qp
                .change_max_qp(self.max_qscale_q6[t] >> QSCALE_Q_FAC);
        }
        Ok(())
    }

    pub fn change_inter_frame_interval(&mut self, inter_frame_interval: i32) {
        self.pic_handling
            .register_new_inter_frame_interval(inter_frame_interval);
    }

    pub fn change_intra_frame_interval(&mut self, intra_frame_interval: i32) {
        self.pic_handling
            .register_new_intra_frame_interval(intra_frame_interval);
    }

    pub fn config(&self) -> &RcConfig {
        &self.cfg
    }

    pub fn vbv(&self) -> &VbvBuffer {
        &self.vbv
    }

    pub fn pic_handling(&self) -> &PicHandling {
        &self.pic_handling
    }

    pub fn rd_model(&self, pic_type: PictureType) -> &RdModel {
        &self.rd_model[pic_type.idx()]
    }

    pub fn frames_coded(&self) -> u64 {
        self.frames_coded
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SAD: u64 = 1_000_000;

    // bits = k * SAD / qscale
    fn synthetic_bits(sad: u64, qscale_q6: i32) -> i32 {
        (2 * sad * (1 << QSCALE_Q_FAC) / qscale_q6.max(1) as u64) as i32
    }

    fn encode(ctx: &mut Context, pic_type: PictureType) -> (FrameQp, i32, VbvStatus) {
        let target = ctx.target_bits(pic_type);
        let qp = ctx.frame_qp(pic_type, target);
        let bits = synthetic_bits(SAD, qp.qscale_q6);
        let status = ctx.update(&FrameStats {
            pic_type,
            consumed_bits: bits,
            sad: SAD,
            avg_qp_q6: qp.qscale_q6,
            ..Default::default()
        });
        (qp, bits, status)
    }

    fn run(ctx: &mut Context, frames: i32) -> Vec<(FrameQp, i32, VbvStatus)> {
        let mut out = Vec::new();
        for id in 0..frames {
            ctx.add_picture(id, PicHint::Auto);
            while let Scheduled::Picture(pic) = ctx.get_picture() {
                out.push(encode(ctx, pic.pic_type));
            }
        }
        ctx.flush();
        while let Scheduled::Picture(pic) = ctx.get_picture() {
            out.push(encode(ctx, pic.pic_type));
        }
        out
    }

    #[test]
    fn rejects_invalid_config() {
        let cfg = RcConfig {
            frame_rate: 0,
            ..Default::default()
        };
        assert!(Context::new(&cfg).is_err());

        let cfg = RcConfig {
            intra_frame_interval: 2,
            inter_frame_interval: 3,
            max_inter_frame_interval: 3,
            ..Default::default()
        };
        assert!(Context::new(&cfg).is_err());
    }

    #[test]
    fn per_type_targets_fill_the_gop() {
        let ctx = Context::new(&RcConfig::default()).unwrap();
        let i = ctx.target_bits(PictureType::I);
        let p = ctx.target_bits(PictureType::P);
        assert!((i - 2 * p).abs() <= 1);
        let gop = i as i64 + 29 * p as i64;
        assert!((gop - 2_000_000).abs() < 100);
    }

    #[test]
    fn cbr_tracks_bitrate() {
        let mut ctx = Context::new(&RcConfig::default()).unwrap();
        let out = run(&mut ctx, 300);
        assert_eq!(out.len(), 300);
        assert_eq!(ctx.frames_coded(), 300);

        let total: i64 = out.iter().map(|(_, bits, _)| *bits as i64).sum();
        let expected = 300 * 2_000_000 / 30;
        assert!((total - expected).abs() < expected / 10, "total {}", total);

        // the decoder buffer never underflows
        assert!(out.iter().all(|(_, _, status)| *status != VbvStatus::Underflow));
        assert!(ctx.vbv().ebf() <= ctx.vbv().buffer_size());
        assert!(ctx.rd_model(PictureType::P).is_valid());
    }

    #[test]
    fn p_quantizer_swing_is_limited() {
        let mut ctx = Context::new(&RcConfig::default()).unwrap();
        let out = run(&mut ctx, 60);

        // the first P picture has no model, it scales the I quantizer
        let ratio = (out[0].0.qscale_q6 as i64 * 18 / 16).min(ctx.max_qscale_q6[1] as i64);
        assert_eq!(out[1].0.qscale_q6 as i64, ratio);

        // P after P; every 30th picture is an I picture
        for k in (2..out.len()).filter(|k| k % 30 >= 2) {
            let (prev, cur) = (out[k - 1].0, out[k].0);
            assert!(
                cur.qscale_q6 >= (prev.qscale_q6 * 14) >> 4,
                "frame {} qscale {} after {}",
                k,
                cur.qscale_q6,
                prev.qscale_q6
            );
            assert!(
                cur.qscale_q6 <= (prev.qscale_q6 * 26) >> 4,
                "frame {} qscale {} after {}",
                k,
                cur.qscale_q6,
                prev.qscale_q6
            );
        }
    }

    #[test]
    fn vbr_streaming_without_peak_limit() {
        let cfg = RcConfig {
            rc_mode: RcMode::VbrStreaming,
            bitrate: 1_000_000,
            peak_bitrate: 2_000_000,
            vbv_buffer_size: 2_000_000,
            max_peak_rate_duration: -1.0,
            total_frames: 300,
            ..Default::default()
        };
        let mut ctx = Context::new(&cfg).unwrap();
        let out = run(&mut ctx, 300);
        assert_eq!(out.len(), 300);

        assert!(out.iter().all(|(qp, _, _)| qp.min_bits == 0));
        assert!(out
            .iter()
            .all(|(qp, _, _)| qp.target_bits >= 0 && qp.target_bits <= qp.max_bits));
        assert!(out.iter().all(|(_, _, status)| *status != VbvStatus::Underflow));

        let total: i64 = out.iter().map(|(_, bits, _)| *bits as i64).sum();
        let expected = 300 * 1_000_000 / 30;
        assert!((total - expected).abs() < expected / 10, "total {}", total);
    }

    #[test]
    fn cbr_with_b_pictures() {
        let cfg = RcConfig {
            inter_frame_interval: 3,
            max_inter_frame_interval: 3,
            ..Default::default()
        };
        let mut ctx = Context::new(&cfg).unwrap();
        let out = run(&mut ctx, 120);
        assert_eq!(out.len(), 120);
        assert!(ctx.rd_model(PictureType::B).is_valid());
        assert!(out
            .iter()
            .all(|(qp, _, _)| qp.qp >= cfg.min_qp[2] && qp.qp <= cfg.max_qp[0]));
    }

    #[test]
    fn const_qp_uses_configured_qp() {
        let cfg = RcConfig {
            rc_mode: RcMode::ConstQp,
            ..Default::default()
        };
        let mut ctx = Context::new(&cfg).unwrap();
        let out = run(&mut ctx, 40);
        assert_eq!(out[0].0.qp, 27);
        assert_eq!(out[30].0.qp, 27);
        assert!(out[1..30].iter().all(|(qp, _, _)| qp.qp == 29));
        assert!(!ctx.rd_model(PictureType::P).is_valid());
    }

    #[test]
    fn bitrate_change_raises_targets() {
        let mut ctx = Context::new(&RcConfig::default()).unwrap();
        let before = ctx.target_bits(PictureType::P);
        ctx.change_bitrate(4_000_000, 4_000_000).unwrap();
        let after = ctx.target_bits(PictureType::P);
        assert!(after > before * 19 / 10, "{} -> {}", before, after);
        assert_eq!(ctx.config().bitrate, 4_000_000);
    }

    #[test]
    fn rejected_changes_keep_the_session() {
        let mut ctx = Context::new(&RcConfig::default()).unwrap();
        assert!(ctx.change_bitrate(0, 0).is_err());
        assert!(ctx.change_delay(0).is_err());
        assert!(ctx.change_frame_rate(0).is_err());

        match ctx.change_bitrate(5, 5) {
            Err(RcError::ThresholdOrder { .. }) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ctx.config().bitrate, 2_000_000);
        assert_eq!(ctx.config().buffer_delay, 2000);
        assert_eq!(ctx.vbv().buffer_size(), 4_000_000);
        assert_eq!(ctx.bitrate_changed, [false; MAX_PIC_TYPE]);

        // the rejected session still codes
        let out = run(&mut ctx, 30);
        assert_eq!(out.len(), 30);
    }

    #[test]
    fn per_type_qp_range() {
        let mut ctx = Context::new(&RcConfig::default()).unwrap();
        assert!(ctx.change_min_max_qp(PictureType::P, 0, 10).is_err());
        assert!(ctx.change_min_max_qp(PictureType::P, 40, 30).is_err());
        assert!(ctx.change_min_max_qp(PictureType::P, 1, MAX_CODEC_QP + 1).is_err());
        assert_eq!(ctx.config().min_qp, [1; MAX_PIC_TYPE]);

        ctx.change_min_max_qp(PictureType::P, 30, 32).unwrap();
        assert_eq!(ctx.config().min_qp[PictureType::P.idx()], 30);
        assert_eq!(ctx.config().max_qp[PictureType::P.idx()], 32);

        let out = run(&mut ctx, 60);
        for (k, (qp, _, _)) in out.iter().enumerate() {
            if k % 30 != 0 {
                assert!(qp.qp >= 30 && qp.qp <= 32, "frame {} qp {}", k, qp.qp);
            }
        }
    }

    #[test]
    fn block_qp_follows_frame_qp() {
        let mut ctx = Context::new(&RcConfig::default()).unwrap();
        ctx.add_picture(0, PicHint::Auto);
        let qp = ctx.frame_qp(PictureType::I, ctx.target_bits(PictureType::I));
        ctx.set_avg_activity(100);
        assert_eq!(ctx.mb_qp(100).applied_qp, qp.qscale_q6);
        assert!(ctx.mb_qp(0).applied_qp < qp.qscale_q6);
    }
}
