//! Trains a fully-connected classifier on MNIST-style images
//! using the library provided by `fcnet`
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run -- -h
//! RUST_LOG=info cargo run -- --dataset synthetic
//! RUST_LOG=info cargo run -- --dataset mnist --data-dir data/mnist --save checkpoint.json
//! RUST_LOG=info cargo run -- --dataset mnist --data-dir data/mnist --load checkpoint.json
//! ```
//!
//! Reads IDX files (`train-images-idx3-ubyte`, `t10k-labels-idx1-ubyte`, ...) from the data
//! directory, or generates a synthetic dataset of the same shape when no download is at hand.

use std::{error::Error, path::PathBuf};

use fcnet::{
    checkpoint,
    dataloader::DataLoader,
    datasets::{Dataset, load_dataset, plot_losses},
    nn::{Classifier, Module, NetworkConfig},
    optim::OptimizerKind,
    train::{EvalSchedule, TrainConfig, Trainer, evaluate},
};

use clap::Parser;

#[derive(Parser)]
struct Args {
    #[clap(short, long, default_value_t = Dataset::Synthetic)]
    dataset: Dataset,
    /// Directory holding the IDX files of MNIST or Fashion-MNIST
    #[clap(long, default_value = "data")]
    data_dir: PathBuf,
    /// Number of training samples generated for the synthetic dataset
    #[clap(long, default_value_t = 6000)]
    synthetic_samples: usize,
    /// Comma separated widths of the hidden layers
    #[clap(long, value_delimiter = ',', default_value = "512,256,128")]
    hidden: Vec<usize>,
    #[clap(long, default_value_t = 0.5)]
    dropout: f32,
    #[clap(short, long, default_value_t = OptimizerKind::Adam)]
    optimizer: OptimizerKind,
    #[clap(short, long, default_value_t = 0.001)]
    lr: f32,
    /// Only used by SGD
    #[clap(short, long, default_value_t = 0.9)]
    momentum: f32,
    #[clap(short, long, default_value_t = 64)]
    batch_size: usize,
    #[clap(short, long, default_value_t = 2)]
    epochs: usize,
    /// Evaluate on the test set every this many steps, 0 evaluates once per epoch
    #[clap(short, long, default_value_t = 40)]
    print_every: usize,
    #[clap(long, default_value_t = 42)]
    seed: u64,
    /// Where to write the trained checkpoint
    #[clap(long)]
    save: Option<PathBuf>,
    /// Evaluate a saved checkpoint instead of training
    #[clap(long)]
    load: Option<PathBuf>,
    /// Where to draw the loss curves
    #[clap(long)]
    plot: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let (train, test) = load_dataset(
        args.dataset,
        &args.data_dir,
        args.synthetic_samples,
        args.seed,
    )?;
    let test_loader = DataLoader::new(test.0, test.1, args.batch_size, false)?;

    if let Some(path) = &args.load {
        let model = checkpoint::load(path)?;
        log::info!("Loaded model from '{}'\n{}", path.display(), model);
        let eval = evaluate(&model, &test_loader)?;
        log::info!(
            "Test Loss: {:.3}.. Test Accuracy: {:.3}",
            eval.loss,
            eval.accuracy
        );
        return Ok(());
    }

    let train_loader =
        DataLoader::new(train.0, train.1, args.batch_size, true)?.with_seed(args.seed);
    let config = NetworkConfig::new(args.dataset.input_size(), args.dataset.n_classes())
        .with_hidden_layers(&args.hidden)
        .with_dropout(args.dropout);
    let model = Classifier::with_seed(config, args.seed)?;
    log::info!("{}", model);

    let optim = args
        .optimizer
        .build(model.parameters(), args.lr, args.momentum);
    log::info!(
        "Training with {} (lr {}) on {} samples of {} features in {} batches of {}",
        args.optimizer,
        args.lr,
        train_loader.n_samples(),
        train_loader.input_dim(),
        train_loader.n_batches(),
        train_loader.batch_size()
    );

    let train_config = TrainConfig {
        epochs: args.epochs,
        eval_schedule: match args.print_every {
            0 => EvalSchedule::EveryEpoch,
            n => EvalSchedule::EverySteps(n),
        },
    };
    let mut trainer = Trainer::new(&model, optim);
    let history = trainer.fit(&train_loader, Some(&test_loader), &train_config)?;

    for unit in model.hidden_units() {
        log::debug!(
            "Hidden layer {} -> {}: {} dead ReLU activations, {} NaN outputs",
            unit.linear.n_inputs(),
            unit.linear.n_outputs(),
            unit.relu.n_dead_neurons(),
            unit.linear.n_output_nans()
        );
    }

    if let Some(path) = &args.save {
        checkpoint::save(&model, path)?;
    }
    if let Some(path) = &args.plot {
        plot_losses(&history, path)?;
    }
    Ok(())
}
