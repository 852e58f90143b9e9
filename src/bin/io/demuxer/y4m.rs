use super::Demuxer;
use crate::io::{map_y4m_error, LumaFrame};

use std::fs::File;
use std::io;
use std::io::Read;

use revrc::api::*;

pub struct Y4mDemuxer {
    reader: y4m::Decoder<Box<dyn Read>>,
}

impl Y4mDemuxer {
    pub fn new(path: &str) -> io::Result<Box<dyn Demuxer>> {
        let reader: Box<dyn Read> = match path {
            "-" => Box::new(io::stdin()),
            f => Box::new(File::open(&f)?),
        };

        Ok(Box::new(Y4mDemuxer {
            reader: y4m::Decoder::new(reader).map_err(|e| map_y4m_error(e))?,
        }))
    }
}

impl Demuxer for Y4mDemuxer {
    fn read(&mut self) -> io::Result<LumaFrame> {
        let width = self.reader.get_width();
        let height = self.reader.get_height();
        let bytes = self.reader.get_bytes_per_sample();
        let frame = self
            .reader
            .read_frame()
            .map(|frame| {
                let y = frame.get_y_plane();
                let data = if bytes == 1 {
                    y.iter().map(|&v| v as u16).collect()
                } else {
                    y.chunks_exact(2)
                        .map(|v| u16::from_le_bytes([v[0], v[1]]))
                        .collect()
                };
                LumaFrame {
                    width,
                    height,
                    data,
                }
            })
            .map_err(|e| map_y4m_error(e))?;

        Ok(frame)
    }

    fn frame_rate(&self) -> Rational {
        let fps = self.reader.get_framerate();
        Rational::new(fps.num as u64, fps.den as u64)
    }

    fn size(&self) -> (usize, usize) {
        (self.reader.get_width(), self.reader.get_height())
    }
}
