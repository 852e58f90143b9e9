use criterion::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaChaRng;
use revrc::rc::*;

criterion_group!(
    rd_model,
    bench_rd_add_frame,
    bench_rd_find_qp,
);

fn samples(n: usize) -> Vec<(u32, i32, u64)> {
    let mut ra = ChaChaRng::from_seed([0; 32]);
    (0..n)
        .map(|_| {
            let sad: u64 = ra.gen_range(100_000, 2_000_000);
            let qp_q6: i32 = ra.gen_range(256, 4096);
            let bits = (3 * sad * 64 / qp_q6 as u64) as u32 + ra.gen_range(0, 1000);
            (bits, qp_q6, sad)
        })
        .collect()
}

fn bench_rd_add_frame(c: &mut Criterion) {
    let input = samples(64);
    let mut model = RdModel::new(DEFAULT_MAX_FRAMES_MODELLED);
    let mut k = 0;

    c.bench_function("bench_rd_add_frame", move |b| {
        b.iter(|| {
            let (bits, qp_q6, sad) = input[k % input.len()];
            model.add_frame(bits, qp_q6, sad, 0);
            k += 1;
        })
    });
}

fn bench_rd_find_qp(c: &mut Criterion) {
    let mut model = RdModel::new(DEFAULT_MAX_FRAMES_MODELLED);
    for (bits, qp_q6, sad) in samples(DEFAULT_MAX_FRAMES_MODELLED) {
        model.add_frame(bits, qp_q6, sad, 0);
    }

    c.bench_function("bench_rd_find_qp", move |b| {
        b.iter(|| model.find_qp_for_target_bits(black_box(60_000), 1_000_000, 64, 14_000))
    });
}
