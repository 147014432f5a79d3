use crate::{
    errors::{NnError, NnResult},
    Precision,
};
use serde_derive::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Hyperparameters of one training run.
///
/// Missing fields in a JSON config fall back to the defaults:
/// learning rate 0.01, batch size 1, 10 epochs, progress logged every 100 epochs.
/// A log interval of 0 disables progress logging.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub learning_rate: Precision,
    pub batch_size: usize,
    pub epochs: usize,
    pub log_interval: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            learning_rate: 0.01,
            batch_size: 1,
            epochs: 10,
            log_interval: 100,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> NnResult<()> {
        if self.batch_size == 0 {
            return Err(NnError::ConfigError(
                "batch size has to be at least 1".to_string(),
            ));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0. {
            return Err(NnError::ConfigError(format!(
                "learning rate has to be a positive number, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }

    /// Reads and validates a config from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> NnResult<TrainingConfig> {
        let raw_file = fs::read_to_string(path)?;
        let config: TrainingConfig = serde_json::from_str(&raw_file)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = TrainingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.epochs, 10);
    }

    #[test]
    fn test_invalid_configs() {
        let zero_batch = TrainingConfig {
            batch_size: 0,
            ..TrainingConfig::default()
        };
        assert!(matches!(zero_batch.validate(), Err(NnError::ConfigError(_))));

        for &learning_rate in &[0., -1., Precision::NAN, Precision::INFINITY] {
            let config = TrainingConfig {
                learning_rate,
                ..TrainingConfig::default()
            };
            assert!(matches!(config.validate(), Err(NnError::ConfigError(_))));
        }
    }

    #[test]
    fn test_json_config() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("config.json");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "{{ \"learning_rate\": 0.5, \"epochs\": 3000 }}").unwrap();

        let config = TrainingConfig::from_json_file(&file_path).unwrap();
        assert_eq!(
            config,
            TrainingConfig {
                learning_rate: 0.5,
                epochs: 3000,
                ..TrainingConfig::default()
            }
        );

        drop(file);
        dir.close().unwrap();
    }

    #[test]
    fn test_json_config_is_validated() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("config.json");
        fs::write(&file_path, "{ \"batch_size\": 0 }").unwrap();

        assert!(matches!(
            TrainingConfig::from_json_file(&file_path),
            Err(NnError::ConfigError(_))
        ));
    }
}
