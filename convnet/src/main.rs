//! Command line interface to train networks on JSON datasets, to predict with trained
//! networks and to inspect them.

use convnet::{
    Activation, CliError, ConfigOverrides, ConvolutionalArchitecture,
    ConvnetResult, FeedForwardArchitecture, LossChoice,
};
use env_logger::Builder;
use log::info;
use nn::{
    dataset::{self, Dataset},
    init, ConvolutionalNetwork, FeedForwardNetwork, Model, Persist, TrainingConfig,
};
use quicli::prelude::{CliResult, Verbosity};
use rand::{rngs::StdRng, SeedableRng};
use serde_derive::Serialize;
use std::{
    fmt::Display,
    fs::File,
    io::{self, BufWriter, Write},
    path::PathBuf,
};
use structopt::StructOpt;

/// Options shared by all training subcommands
#[derive(Debug, StructOpt)]
struct TrainingOpts {
    /// JSON dataset with "inputs" and "targets" rows
    #[structopt(parse(from_os_str))]
    dataset: Option<PathBuf>,
    /// JSON training config, command line values take precedence
    #[structopt(long = "config", parse(from_os_str))]
    config: Option<PathBuf>,
    #[structopt(long = "learning-rate")]
    learning_rate: Option<f64>,
    #[structopt(long = "batch-size")]
    batch_size: Option<usize>,
    #[structopt(long = "epochs")]
    epochs: Option<usize>,
    /// Log progress every n epochs, 0 disables progress logs
    #[structopt(long = "log-interval")]
    log_interval: Option<usize>,
    /// Seed for the weight initialization, random if not given
    #[structopt(long = "seed")]
    seed: Option<u64>,
    /// Saves the trained model here, as JSON if the extension is .json
    #[structopt(short = "o", long = "output", parse(from_os_str))]
    output: Option<PathBuf>,
}

impl TrainingOpts {
    fn training_config(&self) -> ConvnetResult<TrainingConfig> {
        let base = match &self.config {
            Some(path) => TrainingConfig::from_json_file(path)?,
            None => TrainingConfig::default(),
        };
        let overrides = ConfigOverrides {
            learning_rate: self.learning_rate,
            batch_size: self.batch_size,
            epochs: self.epochs,
            log_interval: self.log_interval,
        };
        Ok(overrides.apply(base)?)
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => init::entropy_rng(),
        }
    }

    fn load_dataset(&self, xor: bool) -> ConvnetResult<Dataset> {
        match (&self.dataset, xor) {
            (Some(path), _) => Ok(Dataset::from_json_file(path)?),
            (None, true) => Ok(Dataset::xor()),
            (None, false) => Err(CliError::MissingDatasetError),
        }
    }

    /// Trains the model and saves it if an output path was given.
    fn train<M: Model + Persist + Display>(
        &self,
        model: &mut M,
        dataset: &Dataset,
    ) -> ConvnetResult<()> {
        info!("Training network\n{}", model);
        let history = model.fit(dataset.inputs().view(), dataset.targets().view())?;
        if let Some(loss) = history.final_loss() {
            println!("Final loss: {:.6}", loss);
        }
        match &self.output {
            Some(path) => {
                model.save_to_file(path)?;
                info!("Saved model to {}", path.display());
            }
            None => info!("No output path given, the trained model is discarded"),
        }
        Ok(())
    }
}

/// Trains a multilayer perceptron
#[derive(Debug, StructOpt)]
struct TrainMlpOpts {
    #[structopt(flatten)]
    training: TrainingOpts,
    /// Trains on the four XOR samples if no dataset is given
    #[structopt(long = "xor")]
    xor: bool,
    /// Sizes of the hidden layers
    #[structopt(long = "hidden")]
    hidden: Vec<usize>,
    /// tanh or relu
    #[structopt(long = "activation", default_value = "tanh")]
    activation: Activation,
    /// mse or cross-entropy
    #[structopt(long = "loss", default_value = "mse")]
    loss: LossChoice,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Trains a convolutional network on flattened images
#[derive(Debug, StructOpt)]
struct TrainCnnOpts {
    #[structopt(flatten)]
    training: TrainingOpts,
    #[structopt(long = "channels", default_value = "1")]
    channels: usize,
    /// Image height in pixels
    #[structopt(long = "rows")]
    rows: usize,
    /// Image width in pixels
    #[structopt(long = "cols")]
    cols: usize,
    #[structopt(long = "kernel-size", default_value = "3")]
    kernel_size: usize,
    #[structopt(long = "kernels", default_value = "8")]
    num_kernels: usize,
    #[structopt(long = "pool-size", default_value = "2")]
    pool_size: usize,
    #[structopt(long = "pool-stride", default_value = "2")]
    pool_stride: usize,
    /// Sizes of the hidden classifier layers
    #[structopt(long = "hidden")]
    hidden: Vec<usize>,
    /// tanh or relu
    #[structopt(long = "activation", default_value = "relu")]
    activation: Activation,
    /// mse or cross-entropy
    #[structopt(long = "loss", default_value = "cross-entropy")]
    loss: LossChoice,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Predicts with a trained model
#[derive(Debug, StructOpt)]
struct PredictOpts {
    /// Model written by one of the train commands
    #[structopt(parse(from_os_str))]
    model: PathBuf,
    /// JSON file with "inputs" rows
    #[structopt(parse(from_os_str))]
    inputs: PathBuf,
    /// The model is a convolutional network
    #[structopt(long = "convolutional")]
    convolutional: bool,
    /// Writes the predictions to this file instead of stdout
    #[structopt(short = "o", long = "output", parse(from_os_str))]
    output: Option<PathBuf>,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Prints the layers and parameters of a trained model
#[derive(Debug, StructOpt)]
struct DescribeOpts {
    #[structopt(parse(from_os_str))]
    model: PathBuf,
    /// The model is a convolutional network
    #[structopt(long = "convolutional")]
    convolutional: bool,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Train and run small neural networks.
#[derive(Debug, StructOpt)]
#[structopt(name = "convnet")]
enum Convnet {
    #[structopt(name = "train-mlp", about = "Trains a multilayer perceptron.")]
    TrainMlp(TrainMlpOpts),
    #[structopt(
        name = "train-cnn",
        about = "Trains a convolutional network on flattened images."
    )]
    TrainCnn(TrainCnnOpts),
    #[structopt(
        name = "predict",
        about = "Writes the predictions of a trained model as JSON."
    )]
    Predict(PredictOpts),
    #[structopt(name = "describe", about = "Prints the layers of a trained model.")]
    Describe(DescribeOpts),
}

#[derive(Serialize)]
struct Predictions {
    predictions: Vec<Vec<f64>>,
}

/// Trait for the subcommands that convnet uses
trait ConvnetOpts {
    /// Performs the subcommand
    fn run(&self) -> ConvnetResult<()>;
    /// Returns the verbosity command
    fn get_verbosity(&self) -> &Verbosity;
    /// Sets up logging
    fn setup_env_logger(&self) -> CliResult {
        let mut builder = Builder::from_default_env();

        builder
            .filter(None, self.get_verbosity().log_level().to_level_filter())
            .init();

        Ok(())
    }
}

impl ConvnetOpts for TrainMlpOpts {
    fn run(&self) -> ConvnetResult<()> {
        let dataset = self.training.load_dataset(self.xor)?;
        let architecture = FeedForwardArchitecture {
            inputs: dataset.inputs().ncols(),
            hidden: self.hidden.clone(),
            outputs: dataset.targets().ncols(),
            activation: self.activation,
        };
        let mut network = architecture.build(
            self.loss.kind(),
            self.training.training_config()?,
            &mut self.training.rng(),
        )?;
        self.training.train(&mut network, &dataset)
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl ConvnetOpts for TrainCnnOpts {
    fn run(&self) -> ConvnetResult<()> {
        let dataset = self.training.load_dataset(false)?;
        let architecture = ConvolutionalArchitecture {
            channels: self.channels,
            rows: self.rows,
            cols: self.cols,
            kernel_size: self.kernel_size,
            num_kernels: self.num_kernels,
            pool_size: self.pool_size,
            pool_stride: self.pool_stride,
            hidden: self.hidden.clone(),
            outputs: dataset.targets().ncols(),
            activation: self.activation,
        };
        let mut network = architecture.build(
            self.loss.kind(),
            self.training.training_config()?,
            &mut self.training.rng(),
        )?;
        self.training.train(&mut network, &dataset)
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl ConvnetOpts for PredictOpts {
    fn run(&self) -> ConvnetResult<()> {
        let inputs = dataset::inputs_from_json_file(&self.inputs)?;
        let predictions = if self.convolutional {
            ConvolutionalNetwork::load_from_file(&self.model)?.predict(inputs.view())?
        } else {
            FeedForwardNetwork::load_from_file(&self.model)?.predict(inputs.view())?
        };
        let predictions = Predictions {
            predictions: dataset::tensor_to_rows(&predictions),
        };

        match &self.output {
            Some(path) => {
                let mut writer = BufWriter::new(File::create(path)?);
                serde_json::to_writer_pretty(&mut writer, &predictions)?;
                writer.flush()?;
                info!("Wrote {} predictions to {}", predictions.predictions.len(), path.display());
            }
            None => {
                let stdout = io::stdout();
                let mut handle = stdout.lock();
                serde_json::to_writer_pretty(&mut handle, &predictions)?;
                writeln!(handle)?;
            }
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl ConvnetOpts for DescribeOpts {
    fn run(&self) -> ConvnetResult<()> {
        if self.convolutional {
            print!("{}", ConvolutionalNetwork::load_from_file(&self.model)?);
        } else {
            print!("{}", FeedForwardNetwork::load_from_file(&self.model)?);
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl ConvnetOpts for Convnet {
    fn run(&self) -> ConvnetResult<()> {
        match self {
            Convnet::TrainMlp(c) => c.run(),
            Convnet::TrainCnn(c) => c.run(),
            Convnet::Predict(c) => c.run(),
            Convnet::Describe(c) => c.run(),
        }
    }

    fn get_verbosity(&self) -> &Verbosity {
        match self {
            Convnet::TrainMlp(c) => c.get_verbosity(),
            Convnet::TrainCnn(c) => c.get_verbosity(),
            Convnet::Predict(c) => c.get_verbosity(),
            Convnet::Describe(c) => c.get_verbosity(),
        }
    }
}

fn main() -> CliResult {
    let args = Convnet::from_args();
    args.setup_env_logger()?;
    args.run()?;
    Ok(())
}
