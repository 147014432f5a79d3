//! Saving and loading trained networks.
//!
//! Networks are stored with all their parameters, their loss and their training
//! config. Forward contexts are never stored, a loaded network starts idle.
use crate::{
    errors::NnResult,
    models::{ConvolutionalNetwork, FeedForwardNetwork},
};
use log::debug;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

pub trait Persist: Serialize + DeserializeOwned {
    /// Writes the bincode encoding of `self`.
    fn save<W: Write>(&self, writer: W) -> NnResult<()> {
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    fn load<R: Read>(reader: R) -> NnResult<Self> {
        Ok(bincode::deserialize_from(reader)?)
    }

    /// Files with a `.json` extension are written as JSON, everything else as bincode.
    fn save_to_file<P: AsRef<Path>>(&self, path: P) -> NnResult<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        if is_json(path) {
            serde_json::to_writer_pretty(&mut writer, self)?;
        } else {
            self.save(&mut writer)?;
        }
        writer.flush()?;
        debug!("Saved model to {}", path.display());
        Ok(())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> NnResult<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let model = if is_json(path) {
            serde_json::from_reader(reader)?
        } else {
            Self::load(reader)?
        };
        debug!("Loaded model from {}", path.display());
        Ok(model)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .map_or(false, |extension| extension.eq_ignore_ascii_case("json"))
}

impl Persist for FeedForwardNetwork {}

impl Persist for ConvolutionalNetwork {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        activation_functions::{ReluLayer, TanhLayer},
        convolutions::ConvolutionLayer,
        errors::NnError,
        fully_connected::{BiasNormalization, DenseLayer},
        layer::LayerKind,
        loss::LossKind,
        models::Model,
        pooling::MaxPoolLayer,
        TrainingConfig,
    };
    use ndarray::{array, Array2};
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use tempfile::tempdir;

    fn feed_forward() -> FeedForwardNetwork {
        let mut rng = StdRng::seed_from_u64(3);
        FeedForwardNetwork::new(
            vec![
                DenseLayer::from_rng(3, 5, &mut rng)
                    .with_bias_normalization(BiasNormalization::Single)
                    .into(),
                TanhLayer::new().into(),
                DenseLayer::from_rng(5, 2, &mut rng).into(),
            ],
            LossKind::softmax_cross_entropy(),
            TrainingConfig {
                learning_rate: 0.05,
                batch_size: 2,
                epochs: 4,
                log_interval: 0,
            },
        )
        .unwrap()
    }

    fn convolutional() -> ConvolutionalNetwork {
        let mut rng = StdRng::seed_from_u64(4);
        ConvolutionalNetwork::new(
            vec![
                ConvolutionLayer::from_rng(2, 3, 2, 4, 4, &mut rng)
                    .unwrap()
                    .into(),
                ReluLayer::new().into(),
                MaxPoolLayer::new(3, 3, 3, 3, 3).unwrap().into(),
            ],
            vec![DenseLayer::from_rng(3, 2, &mut rng).into()],
            LossKind::softmax_cross_entropy(),
            TrainingConfig::default(),
        )
        .unwrap()
    }

    fn random_inputs(rows: usize, cols: usize) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(5);
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
    }

    #[test]
    fn test_bincode_roundtrip() {
        let mut network = feed_forward();
        let inputs = random_inputs(4, 3);
        network
            .fit(inputs.view(), array![[1., 0.], [0., 1.], [1., 0.], [0., 1.]].view())
            .unwrap();

        let mut bytes = Vec::new();
        network.save(&mut bytes).unwrap();
        let loaded = FeedForwardNetwork::load(&bytes[..]).unwrap();

        assert_eq!(
            loaded.predict(inputs.view()).unwrap(),
            network.predict(inputs.view()).unwrap()
        );
        assert_eq!(loaded.config(), network.config());
        assert_eq!(loaded.loss(), network.loss());
        match &loaded.layers()[0] {
            LayerKind::Dense(dense) => {
                assert_eq!(dense.bias_normalization(), BiasNormalization::Single)
            }
            _ => panic!("first layer should be dense"),
        }
    }

    #[test]
    fn test_pending_context_is_not_saved() {
        let mut network = convolutional();
        let inputs = random_inputs(2, 32);
        network.train_forward(inputs.view()).unwrap();

        let mut bytes = Vec::new();
        network.save(&mut bytes).unwrap();
        let mut loaded = ConvolutionalNetwork::load(&bytes[..]).unwrap();

        assert_eq!(loaded.discard_pending(), 0);
        assert!(loaded.train_forward(inputs.view()).is_ok());
        assert_eq!(network.discard_pending(), 4);
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempdir().unwrap();
        let network = convolutional();
        let inputs = random_inputs(3, 32);
        let expected = network.predict(inputs.view()).unwrap();

        for name in &["model.bin", "model.json"] {
            let path = dir.path().join(name);
            network.save_to_file(&path).unwrap();
            let loaded = ConvolutionalNetwork::load_from_file(&path).unwrap();
            assert_eq!(loaded.predict(inputs.view()).unwrap(), expected);
        }

        let json = std::fs::read_to_string(dir.path().join("model.json")).unwrap();
        assert!(json.contains("classifier_layers"));

        dir.close().unwrap();
    }

    #[test]
    fn test_load_errors() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            FeedForwardNetwork::load_from_file(dir.path().join("missing.bin")),
            Err(NnError::IoError(_))
        ));

        let garbage = dir.path().join("garbage.json");
        std::fs::write(&garbage, "{ \"layers\": 3 }").unwrap();
        assert!(matches!(
            FeedForwardNetwork::load_from_file(&garbage),
            Err(NnError::JsonError(_))
        ));

        assert!(matches!(
            FeedForwardNetwork::load(&[1u8, 2, 3][..]),
            Err(NnError::EncodingError(_))
        ));
        dir.close().unwrap();
    }

    #[test]
    fn test_malformed_files_are_rejected() {
        let dir = tempdir().unwrap();
        let network = convolutional();
        let valid = serde_json::to_value(&network).unwrap();

        let mut zero_stride = valid.clone();
        zero_stride["feature_layers"][2]["MaxPool"]["stride"] = serde_json::json!(0);
        let mut large_kernel = valid.clone();
        large_kernel["feature_layers"][0]["Convolution"]["geometry"]["kernel_size"] =
            serde_json::json!(9);
        let mut no_classifier = valid;
        no_classifier["classifier_layers"] = serde_json::json!([]);

        let cases = vec![
            ("stride.json", zero_stride, "stride 0"),
            ("kernel.json", large_kernel, "does not fit"),
            ("classifier.json", no_classifier, "at least one layer"),
        ];
        for (name, value, message) in cases {
            let path = dir.path().join(name);
            std::fs::write(&path, value.to_string()).unwrap();
            match ConvolutionalNetwork::load_from_file(&path) {
                Err(NnError::JsonError(e)) => assert!(e.to_string().contains(message)),
                other => panic!("{} should not load: {:?}", name, other.map(|_| ())),
            }
        }

        let mut mismatched = serde_json::to_value(&feed_forward()).unwrap();
        mismatched["layers"][2]["Dense"]["biases"] =
            serde_json::to_value(array![0., 0., 0.]).unwrap();
        let path = dir.path().join("dense.json");
        std::fs::write(&path, mismatched.to_string()).unwrap();
        assert!(matches!(
            FeedForwardNetwork::load_from_file(&path),
            Err(NnError::JsonError(_))
        ));
        dir.close().unwrap();
    }
}
