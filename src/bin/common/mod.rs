use clap::ArgMatches;

use revrc::api::*;

use std::convert::TryFrom;
use std::fmt;
use std::io;
use std::time::Instant;

pub trait MatchGet {
    fn value_of_int(&self, name: &str) -> Option<io::Result<i32>>;
}

impl MatchGet for ArgMatches<'_> {
    fn value_of_int(&self, name: &str) -> Option<io::Result<i32>> {
        self.value_of(name).map(|v| {
            v.parse().map_err(|e: std::num::ParseIntError| {
                io::Error::new(io::ErrorKind::InvalidInput, e)
            })
        })
    }
}

fn invalid_input<E: fmt::Display>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
}

pub fn parse_config(
    matches: &ArgMatches<'_>,
    frame_rate: Rational,
    width: usize,
    height: usize,
) -> io::Result<RcConfig> {
    let mut cfg = RcConfig::default();

    if let Some(mode) = matches.value_of("MODE") {
        cfg.rc_mode = mode.parse().map_err(invalid_input)?;
    }

    // kbps on the command line
    let bitrate = matches.value_of_int("BITRATE").unwrap_or(Ok(2000))?;
    let peak = matches.value_of_int("PEAK_BITRATE").unwrap_or(Ok(bitrate))?;
    cfg.bitrate = (bitrate.max(0) as u32)
        .checked_mul(1000)
        .ok_or_else(|| invalid_input("Bitrate too high"))?;
    cfg.peak_bitrate = (peak.max(0) as u32)
        .checked_mul(1000)
        .ok_or_else(|| invalid_input("Peak bitrate too high"))?;

    cfg.buffer_delay = matches.value_of_int("DELAY").unwrap_or(Ok(2000))?.max(0) as u32;
    cfg.vbv_buffer_size = match matches.value_of_int("VBV") {
        Some(kbits) => (kbits?.max(0) as u32).saturating_mul(1000),
        // buffer holding the delay at the peak rate
        None => (cfg.peak_bitrate as u64 * cfg.buffer_delay as u64 / 1000)
            .min(u32::MAX as u64) as u32,
    };

    cfg.frame_rate = match matches.value_of("FRAME_RATE") {
        Some(fps) => {
            let fps: f64 = fps.parse().map_err(invalid_input)?;
            (fps * 1000.0).round() as u32
        }
        None => frame_rate.to_q1000(),
    };

    cfg.intra_frame_interval = matches.value_of_int("KEYFRAME_INTERVAL").unwrap_or(Ok(30))?;
    cfg.inter_frame_interval = matches.value_of_int("INTER_INTERVAL").unwrap_or(Ok(1))?;
    cfg.max_inter_frame_interval = matches
        .value_of_int("MAX_INTER_INTERVAL")
        .unwrap_or(Ok(cfg.inter_frame_interval))?;
    cfg.idr_period = matches.value_of_int("IDR_PERIOD").unwrap_or(Ok(0))?;
    cfg.closed_gop = matches.is_present("CLOSED_GOP");

    let min_qp = matches.value_of_int("MINQP").unwrap_or(Ok(1))?;
    let max_qp = matches.value_of_int("MAXQP").unwrap_or(Ok(51))?;
    cfg.min_qp = [u8::try_from(min_qp).map_err(invalid_input)?; MAX_PIC_TYPE];
    cfg.max_qp = [u8::try_from(max_qp).map_err(invalid_input)?; MAX_PIC_TYPE];
    if let Some(qp) = matches.value_of_int("QP") {
        let qp = qp?;
        if qp < 0 || qp > 51 {
            return Err(invalid_input("Quantizer must be between 0-51"));
        }
        let qp = qp as u8;
        cfg.init_qp = [qp, (qp + 2).min(51), (qp + 4).min(51)];
    }

    if let Some(frames) = matches.value_of("FRAMES") {
        let frames: i64 = frames.parse().map_err(invalid_input)?;
        cfg.total_frames = if frames > 0 { frames } else { -1 };
    }

    cfg.width = width;
    cfg.height = height;

    cfg.validate().map_err(invalid_input)?;
    Ok(cfg)
}

#[derive(Debug, Clone, Copy)]
pub struct FrameSummary {
    pub pic_id: i32,
    pub pic_type: PictureType,
    pub qp: u8,
    pub target_bits: i32,
    pub bits: i32,
    pub status: VbvStatus,
}

impl fmt::Display for FrameSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame {} - {} - qp {:2} - {:>8} bits (target {:>8}) - {}",
            self.pic_id, self.pic_type, self.qp, self.bits, self.target_bits, self.status
        )
    }
}

#[derive(Debug, Clone)]
pub struct ProgressInfo {
    // Frame rate of the video
    frame_rate: Rational,
    // The length of the whole video, in frames, if known
    total_frames: Option<usize>,
    // The time the simulation was started
    time_started: Instant,
    // List of frames coded so far
    frame_info: Vec<FrameSummary>,
    // Bits of all frames so far
    coded_bits: u64,
}

impl ProgressInfo {
    pub fn new(frame_rate: Rational, total_frames: Option<usize>) -> Self {
        Self {
            frame_rate,
            total_frames,
            time_started: Instant::now(),
            frame_info: Vec::with_capacity(total_frames.unwrap_or_default()),
            coded_bits: 0,
        }
    }

    pub fn add_frame(&mut self, frame: FrameSummary) {
        self.coded_bits += frame.bits.max(0) as u64;
        self.frame_info.push(frame);
    }

    pub fn frames_coded(&self) -> usize {
        self.frame_info.len()
    }

    pub fn coding_fps(&self) -> f64 {
        let duration = Instant::now().duration_since(self.time_started);
        self.frame_info.len() as f64
            / (duration.as_secs() as f64 + duration.subsec_millis() as f64 / 1000f64)
    }

    pub fn video_fps(&self) -> f64 {
        self.frame_rate.num as f64 / self.frame_rate.den as f64
    }

    // Returns the bitrate of the frames so far, in bits/second
    pub fn bitrate(&self) -> u64 {
        if self.frame_info.is_empty() {
            return 0;
        }
        let seconds = self.frame_info.len() as f64 / self.video_fps();
        (self.coded_bits as f64 / seconds) as u64
    }

    // Number of frames of given type which appear in the video
    pub fn get_frame_type_count(&self, pic_type: PictureType) -> usize {
        self.frame_info
            .iter()
            .filter(|frame| frame.pic_type == pic_type)
            .count()
    }

    pub fn get_status_count(&self, status: VbvStatus) -> usize {
        self.frame_info
            .iter()
            .filter(|frame| frame.status == status)
            .count()
    }

    pub fn print_summary(&self) -> String {
        format!(
            "I: {:>6}, P: {:>6}, B: {:>6}, bitrate: {} bps, underflow: {}, overflow: {}",
            self.get_frame_type_count(PictureType::I),
            self.get_frame_type_count(PictureType::P),
            self.get_frame_type_count(PictureType::B),
            self.bitrate(),
            self.get_status_count(VbvStatus::Underflow),
            self.get_status_count(VbvStatus::Overflow),
        )
    }
}

impl fmt::Display for ProgressInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(total_frames) = self.total_frames {
            write!(
                f,
                "coded {}/{} frames, {:.3} fps, {} bps",
                self.frames_coded(),
                total_frames,
                self.coding_fps(),
                self.bitrate()
            )
        } else {
            write!(
                f,
                "coded {} frames, {:.3} fps, {} bps",
                self.frames_coded(),
                self.coding_fps(),
                self.bitrate()
            )
        }
    }
}
