pub mod error_bits;
pub mod est_sad;
pub mod init_qp;
pub mod mb_qp;
pub mod pic_type;
pub mod prev_qp;
pub mod qscale;
pub mod rd_model;
pub(crate) mod ring;
pub mod vbv;

pub use error_bits::*;
pub use est_sad::*;
pub use init_qp::*;
pub use mb_qp::*;
pub use pic_type::*;
pub use prev_qp::*;
pub use qscale::*;
pub use rd_model::*;
pub use vbv::*;

// quantizer scales are carried in Q6
pub const QSCALE_Q_FAC: u32 = 6;
pub const MAX_MPEG2_QP: i32 = 255;
