use std::io;

mod y4m;

use self::y4m::Y4mDemuxer;
use super::LumaFrame;
use revrc::api::Rational;

pub trait Demuxer {
    fn read(&mut self) -> io::Result<LumaFrame>;
    fn frame_rate(&self) -> Rational;
    fn size(&self) -> (usize, usize);
}

pub fn new(filename: &str) -> io::Result<Box<dyn Demuxer>> {
    Y4mDemuxer::new(filename)
}
