use criterion::{Criterion, criterion_group, criterion_main};
use optkit::{
    QuantSimConfig, QuantizationSimModel, equalize_model,
    graph::ConnectedGraph,
    model::Model,
    tensor::Tensor,
    testing::depthwise_separable_block,
};

const INPUT_SHAPE: [usize; 4] = [4, 3, 6, 6];

fn calibrate(model: &Model) {
    let config = QuantSimConfig::default();
    let mut sim = QuantizationSimModel::new(model.clone(), config).expect("failed to wrap model");
    let batch = Tensor::random_seeded(INPUT_SHAPE.to_vec(), 11);
    sim.compute_encodings(|sim| sim.forward(&[batch]).map(|_| ()))
        .expect("failed to compute encodings");
    sim.forward(&[Tensor::random_seeded(INPUT_SHAPE.to_vec(), 12)])
        .expect("quantized forward failed");
}

fn criterion_benchmark(c: &mut Criterion) {
    let model = depthwise_separable_block(7);
    c.bench_function("connected_graph", |b| {
        b.iter(|| {
            ConnectedGraph::build(&model, &[INPUT_SHAPE.to_vec()]).expect("graph build failed")
        })
    });
    c.bench_function("equalize", |b| {
        b.iter(|| equalize_model(&model, &[INPUT_SHAPE.to_vec()]).expect("equalization failed"))
    });
    c.bench_function("quantsim_calibrate", |b| b.iter(|| calibrate(&model)));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
