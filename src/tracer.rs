use std::fmt::Display;
use std::fs::OpenOptions;
use std::io::Write;

use crate::api::*;
use crate::rc::*;

pub(crate) type Tracer = (Box<dyn Write>, isize);

////////////////////////////////////////////////////////////////////////////////////////////////////
#[cfg(feature = "trace")]
pub(crate) fn OPEN_TRACE() -> Option<Tracer> {
    let fp_trace = OpenOptions::new()
        .append(true)
        .create(true)
        .open("rc_trace.txt");
    if let Ok(fp) = fp_trace {
        Some((Box::new(fp), 0))
    } else {
        None
    }
}

#[cfg(feature = "trace")]
pub(crate) fn RC_TRACE_COUNTER(tracer: &mut Option<Tracer>) {
    if let Some((writer, counter)) = tracer {
        writer.write_fmt(format_args!("{} \t", *counter));
        *counter += 1;
    }
}

#[cfg(feature = "trace")]
pub(crate) fn RC_TRACE<T: Display>(tracer: &mut Option<Tracer>, name: T) {
    if let Some((writer, _)) = tracer {
        writer.write_fmt(format_args!("{}", name));
    }
}

#[cfg(feature = "trace_vbv")]
pub(crate) fn TRACE_VBV(
    tracer: &mut Option<Tracer>,
    pic_type: PictureType,
    consumed_bits: i32,
    status: VbvStatus,
    vbv: &VbvBuffer,
) {
    RC_TRACE_COUNTER(tracer);
    RC_TRACE(tracer, "vbv ");
    RC_TRACE(tracer, pic_type);
    RC_TRACE(tracer, " bits ");
    RC_TRACE(tracer, consumed_bits);
    RC_TRACE(tracer, " ");
    RC_TRACE(tracer, status);
    RC_TRACE(tracer, " ebf ");
    RC_TRACE(tracer, vbv.ebf());
    RC_TRACE(tracer, " bit_alloc ");
    RC_TRACE(tracer, vbv.ebf_bit_alloc());
    RC_TRACE(tracer, " \n");
}

#[cfg(feature = "trace_rd")]
pub(crate) fn TRACE_RD(
    tracer: &mut Option<Tracer>,
    pic_type: PictureType,
    target_bits: i32,
    sad: u64,
    qscale_q6: i32,
    model: &RdModel,
) {
    RC_TRACE_COUNTER(tracer);
    RC_TRACE(tracer, "rd ");
    RC_TRACE(tracer, pic_type);
    RC_TRACE(tracer, " target ");
    RC_TRACE(tracer, target_bits);
    RC_TRACE(tracer, " sad ");
    RC_TRACE(tracer, sad);
    RC_TRACE(tracer, " qscale_q6 ");
    RC_TRACE(tracer, qscale_q6);
    RC_TRACE(tracer, " points ");
    RC_TRACE(tracer, model.num_frames());
    RC_TRACE(tracer, format_args!(" {:?}", model.model()));
    RC_TRACE(tracer, " \n");
}

#[cfg(feature = "trace_pic")]
pub(crate) fn TRACE_PIC(tracer: &mut Option<Tracer>, pic: &PicDetails, rem_frames_in_gop: i32) {
    RC_TRACE_COUNTER(tracer);
    RC_TRACE(tracer, "pic ");
    RC_TRACE(tracer, pic.pic_id);
    RC_TRACE(tracer, " ");
    RC_TRACE(tracer, pic.pic_type);
    RC_TRACE(tracer, " disp ");
    RC_TRACE(tracer, pic.disp_order_no);
    if pic.is_scd {
        RC_TRACE(tracer, " scd");
    }
    RC_TRACE(tracer, " remaining ");
    RC_TRACE(tracer, rem_frames_in_gop);
    RC_TRACE(tracer, " \n");
}

////////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(not(feature = "trace"))]
pub(crate) fn OPEN_TRACE() -> Option<Tracer> {
    None
}

#[cfg(not(feature = "trace"))]
pub(crate) fn RC_TRACE_COUNTER(tracer: &mut Option<Tracer>) {}

#[cfg(not(feature = "trace"))]
pub(crate) fn RC_TRACE<T: Display>(tracer: &mut Option<Tracer>, name: T) {}

#[cfg(not(feature = "trace_vbv"))]
pub(crate) fn TRACE_VBV(
    tracer: &mut Option<Tracer>,
    pic_type: PictureType,
    consumed_bits: i32,
    status: VbvStatus,
    vbv: &VbvBuffer,
) {
}

#[cfg(not(feature = "trace_rd"))]
pub(crate) fn TRACE_RD(
    tracer: &mut Option<Tracer>,
    pic_type: PictureType,
    target_bits: i32,
    sad: u64,
    qscale_q6: i32,
    model: &RdModel,
) {
}

#[cfg(not(feature = "trace_pic"))]
pub(crate) fn TRACE_PIC(tracer: &mut Option<Tracer>, pic: &PicDetails, rem_frames_in_gop: i32) {}
