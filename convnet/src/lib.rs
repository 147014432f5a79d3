//! Network construction for the convnet command line tool.
//!
//! Layer stacks are described by small architecture structs that the CLI fills from
//! its arguments, so that every network the tool trains can also be built in code.
use nn::{
    activation_functions::{ReluLayer, TanhLayer},
    convolutions::ConvolutionLayer,
    fully_connected::DenseLayer,
    pooling::MaxPoolLayer,
    ConvolutionalNetwork, FeedForwardNetwork, LayerKind, LossKind, NnError, NnResult,
    Precision, TrainingConfig,
};
use rand::Rng;
use std::str::FromStr;
use thiserror::Error;

pub type ConvnetResult<T> = Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Unknown {kind} '{value}', expected one of: {expected}.")]
    ParseError {
        kind: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("No training data given, pass a dataset file or --xor.")]
    MissingDatasetError,
    #[error(transparent)]
    NetworkError(#[from] NnError),
    #[error("Output could not be written. Filesystem reported error\n {0}.")]
    IoError(#[from] std::io::Error),
    #[error("Predictions could not be encoded:\n {0}.")]
    JsonError(#[from] serde_json::Error),
}

/// Nonlinearity placed after every dense and convolution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Tanh,
    Relu,
}

impl Activation {
    pub fn layer(self) -> LayerKind {
        match self {
            Activation::Tanh => TanhLayer::new().into(),
            Activation::Relu => ReluLayer::new().into(),
        }
    }
}

impl FromStr for Activation {
    type Err = CliError;

    fn from_str(s: &str) -> ConvnetResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tanh" => Ok(Activation::Tanh),
            "relu" => Ok(Activation::Relu),
            _ => Err(CliError::ParseError {
                kind: "activation",
                value: s.to_string(),
                expected: "tanh, relu",
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossChoice {
    MeanSquaredError,
    CrossEntropy,
}

impl LossChoice {
    pub fn kind(self) -> LossKind {
        match self {
            LossChoice::MeanSquaredError => LossKind::mean_squared_error(),
            LossChoice::CrossEntropy => LossKind::softmax_cross_entropy(),
        }
    }
}

impl FromStr for LossChoice {
    type Err = CliError;

    fn from_str(s: &str) -> ConvnetResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mse" => Ok(LossChoice::MeanSquaredError),
            "cross-entropy" | "crossentropy" => Ok(LossChoice::CrossEntropy),
            _ => Err(CliError::ParseError {
                kind: "loss",
                value: s.to_string(),
                expected: "mse, cross-entropy",
            }),
        }
    }
}

/// Command line values that replace fields of a loaded or default config.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConfigOverrides {
    pub learning_rate: Option<Precision>,
    pub batch_size: Option<usize>,
    pub epochs: Option<usize>,
    pub log_interval: Option<usize>,
}

impl ConfigOverrides {
    pub fn apply(&self, base: TrainingConfig) -> NnResult<TrainingConfig> {
        let config = TrainingConfig {
            learning_rate: self.learning_rate.unwrap_or(base.learning_rate),
            batch_size: self.batch_size.unwrap_or(base.batch_size),
            epochs: self.epochs.unwrap_or(base.epochs),
            log_interval: self.log_interval.unwrap_or(base.log_interval),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Dense layers of the given hidden sizes, each followed by the activation.
///
/// Networks trained with mean squared error apply the activation to the output layer
/// as well, cross entropy networks output raw logits.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedForwardArchitecture {
    pub inputs: usize,
    pub hidden: Vec<usize>,
    pub outputs: usize,
    pub activation: Activation,
}

impl FeedForwardArchitecture {
    pub fn build<R: Rng + ?Sized>(
        &self,
        loss: LossKind,
        config: TrainingConfig,
        rng: &mut R,
    ) -> NnResult<FeedForwardNetwork> {
        let layers = dense_stack(self.inputs, &self.hidden, self.outputs, self.activation, loss, rng);
        FeedForwardNetwork::new(layers, loss, config)
    }
}

/// One convolution with its activation and a max pooling layer as the feature stage,
/// a dense stack as the classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvolutionalArchitecture {
    pub channels: usize,
    pub rows: usize,
    pub cols: usize,
    pub kernel_size: usize,
    pub num_kernels: usize,
    pub pool_size: usize,
    pub pool_stride: usize,
    pub hidden: Vec<usize>,
    pub outputs: usize,
    pub activation: Activation,
}

impl ConvolutionalArchitecture {
    pub fn build<R: Rng + ?Sized>(
        &self,
        loss: LossKind,
        config: TrainingConfig,
        rng: &mut R,
    ) -> NnResult<ConvolutionalNetwork> {
        let convolution = ConvolutionLayer::from_rng(
            self.kernel_size,
            self.num_kernels,
            self.channels,
            self.rows,
            self.cols,
            rng,
        )?;
        let geometry = *convolution.geometry();
        let pool = MaxPoolLayer::new(
            self.pool_size,
            self.pool_stride,
            self.num_kernels,
            geometry.out_rows(),
            geometry.out_cols(),
        )?;
        let features = pool.output_len();

        let feature_layers = vec![convolution.into(), self.activation.layer(), pool.into()];
        let classifier_layers =
            dense_stack(features, &self.hidden, self.outputs, self.activation, loss, rng);
        ConvolutionalNetwork::new(feature_layers, classifier_layers, loss, config)
    }
}

fn dense_stack<R: Rng + ?Sized>(
    inputs: usize,
    hidden: &[usize],
    outputs: usize,
    activation: Activation,
    loss: LossKind,
    rng: &mut R,
) -> Vec<LayerKind> {
    let mut layers = Vec::with_capacity(2 * hidden.len() + 2);
    let mut previous = inputs;
    for &units in hidden {
        layers.push(DenseLayer::from_rng(previous, units, rng).into());
        layers.push(activation.layer());
        previous = units;
    }
    layers.push(DenseLayer::from_rng(previous, outputs, rng).into());
    if let LossKind::MeanSquaredError(_) = loss {
        layers.push(activation.layer());
    }
    layers
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use nn::{dataset::Dataset, Model, Persist};
    use rand::{rngs::StdRng, SeedableRng};
    use tempfile::tempdir;

    #[test]
    fn test_parse_options() {
        assert_eq!("tanh".parse::<Activation>().unwrap(), Activation::Tanh);
        assert_eq!("ReLU".parse::<Activation>().unwrap(), Activation::Relu);
        assert!(matches!(
            "sigmoid".parse::<Activation>(),
            Err(CliError::ParseError { kind: "activation", .. })
        ));

        assert_eq!(
            "cross-entropy".parse::<LossChoice>().unwrap().kind(),
            LossKind::softmax_cross_entropy()
        );
        assert_eq!(
            "mse".parse::<LossChoice>().unwrap().kind(),
            LossKind::mean_squared_error()
        );
        assert!("hinge".parse::<LossChoice>().is_err());
    }

    #[test]
    fn test_config_overrides() {
        let overrides = ConfigOverrides {
            learning_rate: Some(0.5),
            epochs: Some(20),
            ..ConfigOverrides::default()
        };
        let config = overrides.apply(TrainingConfig::default()).unwrap();
        assert_eq!(
            config,
            TrainingConfig {
                learning_rate: 0.5,
                epochs: 20,
                ..TrainingConfig::default()
            }
        );

        let invalid = ConfigOverrides {
            batch_size: Some(0),
            ..ConfigOverrides::default()
        };
        assert!(matches!(
            invalid.apply(TrainingConfig::default()),
            Err(NnError::ConfigError(_))
        ));
    }

    #[test]
    fn test_feed_forward_layers() {
        let architecture = FeedForwardArchitecture {
            inputs: 2,
            hidden: vec![4, 3],
            outputs: 1,
            activation: Activation::Tanh,
        };
        let mut rng = StdRng::seed_from_u64(0);

        let regression = architecture
            .build(LossKind::mean_squared_error(), TrainingConfig::default(), &mut rng)
            .unwrap();
        assert_eq!(regression.layers().len(), 6);
        assert!(matches!(regression.layers()[5], LayerKind::Tanh(_)));

        let classifier = architecture
            .build(LossKind::softmax_cross_entropy(), TrainingConfig::default(), &mut rng)
            .unwrap();
        assert_eq!(classifier.layers().len(), 5);
        match &classifier.layers()[4] {
            LayerKind::Dense(dense) => assert_eq!((dense.input_len(), dense.output_len()), (3, 1)),
            _ => panic!("classifier should end with a dense layer"),
        }
    }

    #[test]
    fn test_convolutional_shapes() {
        let architecture = ConvolutionalArchitecture {
            channels: 1,
            rows: 6,
            cols: 6,
            kernel_size: 3,
            num_kernels: 2,
            pool_size: 2,
            pool_stride: 2,
            hidden: vec![],
            outputs: 3,
            activation: Activation::Relu,
        };
        let mut rng = StdRng::seed_from_u64(1);
        let network = architecture
            .build(LossKind::softmax_cross_entropy(), TrainingConfig::default(), &mut rng)
            .unwrap();

        // 6x6 -> 4x4 convolution -> 2x2 pooling, 2 kernels
        match &network.classifier_layers()[0] {
            LayerKind::Dense(dense) => assert_eq!(dense.input_len(), 8),
            _ => panic!("classifier should start with a dense layer"),
        }
        let predictions = network.predict(Array2::zeros((5, 36)).view()).unwrap();
        assert_eq!(predictions.dim(), (5, 3));
    }

    #[test]
    fn test_invalid_convolution() {
        let architecture = ConvolutionalArchitecture {
            channels: 1,
            rows: 3,
            cols: 3,
            kernel_size: 2,
            num_kernels: 2,
            pool_size: 3,
            pool_stride: 1,
            hidden: vec![],
            outputs: 2,
            activation: Activation::Relu,
        };
        let mut rng = StdRng::seed_from_u64(2);
        assert!(matches!(
            architecture.build(LossKind::softmax_cross_entropy(), TrainingConfig::default(), &mut rng),
            Err(NnError::GeometryError(_))
        ));
    }

    #[test]
    fn test_trained_network_survives_saving() {
        let dataset = Dataset::xor();
        let architecture = FeedForwardArchitecture {
            inputs: 2,
            hidden: vec![4],
            outputs: 1,
            activation: Activation::Tanh,
        };
        let config = TrainingConfig {
            learning_rate: 1.0,
            batch_size: 4,
            epochs: 100,
            log_interval: 0,
        };
        let mut rng = StdRng::seed_from_u64(3);
        let mut network = architecture
            .build(LossKind::mean_squared_error(), config, &mut rng)
            .unwrap();
        network
            .fit(dataset.inputs().view(), dataset.targets().view())
            .unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("xor.bin");
        network.save_to_file(&path).unwrap();
        let loaded = FeedForwardNetwork::load_from_file(&path).unwrap();
        assert_eq!(
            loaded.predict(dataset.inputs().view()).unwrap(),
            network.predict(dataset.inputs().view()).unwrap()
        );
        dir.close().unwrap();
    }
}
