//! Split a single interaction log by user, train on one side and check
//! serving consistency on the other.
//!
//! Usage: `cargo run --release --example split_and_check -- log.tsv`
use std::env;

use sbr_serving::artifact;
use sbr_serving::consistency::{check, score_all};
use sbr_serving::data::{read_instances, user_based_split};
use sbr_serving::evaluation::{predictions, Auc, Metric};
use sbr_serving::models::attention::Hyperparameters;
use sbr_serving::vocabulary::Vocabularies;

fn main() {
    tracing_subscriber::fmt::init();

    let path = env::args().nth(1).unwrap_or_else(|| "data.tsv".to_owned());
    let instances = read_instances(&path).unwrap();
    let (train, test) = user_based_split(&instances, 0.2, (42, 42));

    let vocabularies = Vocabularies::build(&train);
    let hyper = Hyperparameters::new(vocabularies.items().len(), vocabularies.categories().len())
        .embedding_dim(16)
        .num_epochs(3);
    let assembler = hyper.assembler();

    let train = vocabularies.map_all(&train);
    let test = vocabularies.map_all(&test);
    let train_batches: Vec<_> = assembler
        .minibatches(&train, hyper.get_batch_size())
        .collect::<Result<_, _>>()
        .unwrap();
    let test_batches: Vec<_> = assembler
        .minibatches(&test, hyper.get_batch_size())
        .collect::<Result<_, _>>()
        .unwrap();

    let mut model = hyper.build();
    model.fit(&train_batches).unwrap();

    let frozen = artifact::load(artifact::export(&model)).unwrap();
    let report = check(&model, &frozen, &test_batches, 1e-4).unwrap();
    let scores = score_all(&frozen, &test_batches).unwrap();

    println!(
        "Test AUC {:?}, {:#?}",
        Auc.evaluate(&predictions(&test_batches, &scores)),
        report
    );
}
