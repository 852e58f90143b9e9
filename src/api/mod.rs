use std::{fmt, io, str::FromStr};

use num_traits::FromPrimitive;
use thiserror::Error;

pub mod config;
mod context;

pub use config::*;
pub use context::*;

/*****************************************************************************
 * return values and error code
 *****************************************************************************/
#[derive(Debug, Error)]
pub enum RcError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{pic_type} upper threshold {upper} is not above lower threshold {lower}")]
    ThresholdOrder {
        pic_type: PictureType,
        upper: i32,
        lower: i32,
    },
    #[error("run of {0} B pictures exceeds the picture stack")]
    StackOverflow(i32),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub const MAX_PIC_TYPE: usize = 3;
pub const MAX_NUM_DRAIN_RATES: usize = 2;

#[derive(Debug, FromPrimitive, ToPrimitive, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
#[repr(C)]
pub enum PictureType {
    I = 0,
    P = 1,
    B = 2,
}

impl PictureType {
    pub const ALL: [PictureType; MAX_PIC_TYPE] = [PictureType::I, PictureType::P, PictureType::B];

    pub fn idx(self) -> usize {
        self as usize
    }

    // I pictures drain at the intra rate, P and B share the inter rate.
    pub fn drain_idx(self) -> usize {
        if self == PictureType::I {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for PictureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::PictureType::*;
        match self {
            I => write!(f, "I"),
            P => write!(f, "P"),
            B => write!(f, "B"),
        }
    }
}

impl Default for PictureType {
    fn default() -> Self {
        PictureType::I
    }
}

/// Caller hint attached to an incoming picture.
#[derive(Debug, FromPrimitive, ToPrimitive, PartialEq, Eq, Clone, Copy)]
pub enum PicHint {
    Auto,
    // caller requests an intra picture
    Intra,
    // scene change detected upstream
    SceneCut,
}

impl Default for PicHint {
    fn default() -> Self {
        PicHint::Auto
    }
}

#[derive(Debug, FromPrimitive, ToPrimitive, PartialEq, Eq, Clone, Copy)]
#[repr(C)]
pub enum RcMode {
    ConstQp = 0,
    Cbr = 1,
    VbrStreaming = 2,
}

impl fmt::Display for RcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::RcMode::*;
        match self {
            ConstQp => write!(f, "cqp"),
            Cbr => write!(f, "cbr"),
            VbrStreaming => write!(f, "vbr"),
        }
    }
}

impl FromStr for RcMode {
    type Err = RcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cqp" | "const_qp" => Ok(RcMode::ConstQp),
            "cbr" => Ok(RcMode::Cbr),
            "vbr" | "vbr_streaming" => Ok(RcMode::VbrStreaming),
            _ => match s.parse::<u8>().ok().and_then(RcMode::from_u8) {
                Some(mode) => Ok(mode),
                None => Err(RcError::InvalidConfig(format!("unknown rc mode {}", s))),
            },
        }
    }
}

impl Default for RcMode {
    fn default() -> Self {
        RcMode::Cbr
    }
}

/// Buffer status as seen by the caller. Internal overflow and underflow are
/// reported swapped, i.e. from the decoder buffer's point of view.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum VbvStatus {
    Normal,
    Underflow,
    Overflow,
}

impl fmt::Display for VbvStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::VbvStatus::*;
        match self {
            Normal => write!(f, "normal"),
            Underflow => write!(f, "underflow"),
            Overflow => write!(f, "overflow"),
        }
    }
}

impl Default for VbvStatus {
    fn default() -> Self {
        VbvStatus::Normal
    }
}

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Rational {
    pub num: u64,
    pub den: u64,
}

impl Rational {
    pub fn new(num: u64, den: u64) -> Self {
        Rational { num, den }
    }

    // frames per 1000 seconds
    pub fn to_q1000(self) -> u32 {
        if self.den == 0 {
            0
        } else {
            (self.num * 1000 / self.den) as u32
        }
    }
}
