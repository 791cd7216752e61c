#[macro_use]
extern crate criterion;

use criterion::Criterion;

use sbr_serving::artifact;
use sbr_serving::batch::Batch;
use sbr_serving::data::Instance;
use sbr_serving::models::attention::Hyperparameters;
use sbr_serving::models::{Scorer, ScoringContext};
use sbr_serving::vocabulary::Vocabularies;

fn synthetic_log(num_users: usize, history_length: usize) -> Vec<Instance> {
    let mut instances = Vec::new();

    for user in 0..num_users {
        let history: Vec<String> = (0..history_length)
            .map(|idx| format!("I{}", (user * 7 + idx * 3) % 500))
            .collect();
        let categories: Vec<String> = (0..history_length)
            .map(|idx| format!("C{}", (user + idx) % 20))
            .collect();
        let timestamps: Vec<String> = (0..history_length)
            .map(|idx| (idx * 600).to_string())
            .collect();

        for member in 0..5 {
            let line = format!(
                "{}\tU{}\tI{}\tC{}\t{}\t{}\t{}\t{}",
                if member == 0 { 1 } else { 0 },
                user,
                (user * 13 + member * 17) % 500,
                (user + member) % 20,
                history_length * 600,
                history.join(","),
                categories.join(","),
                timestamps.join(",")
            );
            instances.push(line.parse().unwrap());
        }
    }

    instances
}

fn setup() -> (Hyperparameters, Vec<Batch>) {
    let instances = synthetic_log(200, 50);
    let vocabularies = Vocabularies::build(&instances);

    let hyper = Hyperparameters::new(vocabularies.items().len(), vocabularies.categories().len())
        .embedding_dim(32)
        .num_epochs(1);
    let mapped = vocabularies.map_all(&instances);
    let batches = hyper
        .assembler()
        .minibatches(&mapped, hyper.get_batch_size())
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    (hyper, batches)
}

fn bench_fit(c: &mut Criterion) {
    c.bench_function("fit", |b| {
        let (hyper, batches) = setup();
        let mut model = hyper.build();

        b.iter(|| {
            model.fit(&batches).unwrap();
        })
    });
}

fn bench_scoring(c: &mut Criterion) {
    let (hyper, batches) = setup();
    let model = hyper.build();
    let frozen = artifact::load(artifact::export(&model)).unwrap();

    c.bench_function("score_trainable", |b| {
        b.iter(|| model.score(&mut ScoringContext::new(), &batches[0]).unwrap())
    });
    c.bench_function("score_frozen", |b| {
        b.iter(|| frozen.score(&mut ScoringContext::new(), &batches[0]).unwrap())
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_fit, bench_scoring
}
criterion_main!(benches);
