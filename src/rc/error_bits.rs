use log::*;

// frame rates are carried as frames per 1000 seconds
const FRM_RATE_INCREMENT: i64 = 1000;

/// Tracks the truncation error of integer bits-per-frame drains.
///
/// Every frame drains `bitrate * 1000 / frame_rate` bits (truncated). Once a
/// second's worth of frames has been drained, `get_error_bits` reports the
/// difference between the exact bits for the elapsed time and what was
/// actually drained, so the caller can correct the buffer level.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorBits {
    frame_rate: i64,
    bitrate: i64,
    bits_per_frame: i64,
    accum_bits: i64,
    accum_frame_units: i64,
    elapsed_units: i64,
    second_elapsed: bool,
}

impl ErrorBits {
    pub fn new(frame_rate: u32, bitrate: u32) -> Self {
        let frame_rate = (frame_rate as i64).max(1);
        let bitrate = bitrate as i64;
        ErrorBits {
            frame_rate,
            bitrate,
            bits_per_frame: bitrate * FRM_RATE_INCREMENT / frame_rate,
            ..Default::default()
        }
    }

    /// Called once per encoded frame.
    pub fn update(&mut self) {
        if self.second_elapsed {
            self.accum_bits = 0;
            self.second_elapsed = false;
        }

        self.accum_bits += self.bits_per_frame;
        self.accum_frame_units += FRM_RATE_INCREMENT;

        if self.accum_frame_units >= self.frame_rate {
            self.elapsed_units = self.accum_frame_units;
            self.accum_frame_units = 0;
            self.second_elapsed = true;
        }
    }

    /// Bits to add to the drain of the current frame. Non-zero only right
    /// after a second boundary.
    pub fn get_error_bits(&self) -> i32 {
        if !self.second_elapsed {
            return 0;
        }
        let exact = self.bitrate * self.elapsed_units / self.frame_rate;
        (exact - self.accum_bits) as i32
    }

    pub fn change_bitrate(&mut self, bitrate: u32) {
        let bitrate = bitrate as i64;
        if self.bitrate > 0 {
            self.accum_bits = self.accum_bits * bitrate / self.bitrate;
        }
        self.bitrate = bitrate;
        self.bits_per_frame = bitrate * FRM_RATE_INCREMENT / self.frame_rate;
        debug!(
            "error bits: bitrate {} bits per frame {}",
            bitrate, self.bits_per_frame
        );
    }

    pub fn change_frame_rate(&mut self, frame_rate: u32) {
        let frame_rate = (frame_rate as i64).max(1);
        self.accum_frame_units = self.accum_frame_units * frame_rate / self.frame_rate;
        self.elapsed_units = self.elapsed_units * frame_rate / self.frame_rate;
        self.frame_rate = frame_rate;
        self.bits_per_frame = self.bitrate * FRM_RATE_INCREMENT / frame_rate;
        debug!(
            "error bits: frame rate {} bits per frame {}",
            frame_rate, self.bits_per_frame
        );
    }

    pub fn bits_per_frame(&self) -> i32 {
        self.bits_per_frame as i32
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate as u32
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate as u32
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_reported_once_per_second() {
        let mut eb = ErrorBits::new(30000, 2_000_000);
        assert_eq!(eb.bits_per_frame(), 66666);

        for _ in 0..29 {
            eb.update();
            assert_eq!(eb.get_error_bits(), 0);
        }
        eb.update();
        assert_eq!(eb.get_error_bits(), 2_000_000 - 30 * 66666);

        eb.update();
        assert_eq!(eb.get_error_bits(), 0);
    }

    #[test]
    fn fractional_frame_rate() {
        let mut eb = ErrorBits::new(29970, 1_000_000);
        assert_eq!(eb.bits_per_frame(), 33366);
        for _ in 0..30 {
            eb.update();
        }
        assert_eq!(eb.get_error_bits(), 21);
    }

    #[test]
    fn bitrate_change_mid_second_stays_small() {
        let mut eb = ErrorBits::new(30000, 1_000_000);
        for _ in 0..15 {
            eb.update();
        }
        eb.change_bitrate(2_000_000);
        for _ in 0..15 {
            eb.update();
        }
        let err = eb.get_error_bits();
        assert!(err >= 0 && err < 100, "error bits {}", err);
    }

    #[test]
    fn low_frame_rate_has_no_error() {
        let mut eb = ErrorBits::new(500, 1_000_000);
        for _ in 0..4 {
            eb.update();
            assert_eq!(eb.get_error_bits(), 0);
        }
    }
}
