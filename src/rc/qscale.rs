use super::QSCALE_Q_FAC;

pub const MAX_CODEC_QP: u8 = 51;

lazy_static! {
    // qscale doubles every 6 QP steps and is 1.0 at QP 4
    pub(crate) static ref QP_TO_QSCALE_Q6: Box<[i32]> = {
        (0..=MAX_CODEC_QP as i32)
            .map(|qp| {
                let qscale = 2f64.powf((qp - 4) as f64 / 6.0);
                (qscale * (1 << QSCALE_Q_FAC) as f64).round() as i32
            })
            .collect::<Vec<_>>()
            .into_boxed_slice()
    };
}

pub fn qp_to_qscale_q6(qp: u8) -> i32 {
    QP_TO_QSCALE_Q6[qp.min(MAX_CODEC_QP) as usize]
}

/// Nearest codec QP for a Q6 qscale.
pub fn qscale_q6_to_qp(qscale_q6: i32) -> u8 {
    let table: &[i32] = &QP_TO_QSCALE_Q6;
    let pos = table.partition_point(|&q| q < qscale_q6);
    if pos == 0 {
        return 0;
    }
    if pos == table.len() {
        return MAX_CODEC_QP;
    }
    if qscale_q6 - table[pos - 1] <= table[pos] - qscale_q6 {
        (pos - 1) as u8
    } else {
        pos as u8
    }
}
