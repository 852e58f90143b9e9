use std::io;

pub mod demuxer;

// Luma plane of one input picture, samples widened to 16 bits.
pub struct LumaFrame {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u16>,
}

impl LumaFrame {
    pub fn mean(&self) -> u64 {
        if self.data.is_empty() {
            return 0;
        }
        self.data.iter().map(|&v| v as u64).sum::<u64>() / self.data.len() as u64
    }

    // deviation from the mean, the SAD of an intra picture
    pub fn intra_sad(&self) -> u64 {
        let mean = self.mean() as i64;
        self.data
            .iter()
            .map(|&v| (v as i64 - mean).abs() as u64)
            .sum()
    }

    // difference to the previous picture in display order
    pub fn inter_sad(&self, prev: &LumaFrame) -> u64 {
        self.data
            .iter()
            .zip(prev.data.iter())
            .map(|(&a, &b)| (a as i64 - b as i64).abs() as u64)
            .sum()
    }
}

pub fn map_y4m_error(e: y4m::Error) -> io::Error {
    match e {
        y4m::Error::EOF => io::Error::new(io::ErrorKind::UnexpectedEof, "end of input"),
        y4m::Error::IoError(e) => e,
        e => io::Error::new(io::ErrorKind::InvalidData, format!("{:?}", e)),
    }
}
