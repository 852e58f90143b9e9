use criterion::*;

cfg_if::cfg_if! {
    if #[cfg(feature="bench")] {
        mod rd_model;

        criterion_main!(rd_model::rd_model, pic_type::pic_type);
    } else {
        fn bench_no_op(_: &mut Criterion) {
        }
        criterion_group!(
            no_op,
            bench_no_op,
        );
        criterion_main!(no_op);
    }
}
