//! Networks that chain layers and train them with mini-batch SGD.
//!
//! A [`FeedForwardNetwork`] hands every layer the learning rate divided by the
//! number of rows in the batch. A [`ConvolutionalNetwork`] splits its layers into a
//! feature stage and a classifier stage: the classifier stage is treated like a
//! feed forward network, the feature stage gets the raw learning rate, since its
//! convolutions average their gradients over the batch themselves.
use crate::{
    config::TrainingConfig,
    errors::{NnError, NnResult},
    layer::{Layer, LayerKind},
    loss::{Loss, LossKind},
    Precision, Tensor, TensorView,
};
use log::{info, warn};
use ndarray::s;
use serde_derive::{Deserialize, Serialize};
use std::{convert::TryFrom, fmt};

const SEPARATOR: &str = "==========================================";
const LAYER_SEPARATOR: &str = "------------------------------------------";

/// Mean batch loss of every epoch of one [`Model::fit`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingHistory {
    epoch_losses: Vec<Precision>,
}

impl TrainingHistory {
    pub fn epoch_losses(&self) -> &[Precision] {
        &self.epoch_losses
    }

    /// `None` if no epoch was run.
    pub fn final_loss(&self) -> Option<Precision> {
        self.epoch_losses.last().copied()
    }
}

pub trait Model {
    fn config(&self) -> &TrainingConfig;

    fn loss(&self) -> &LossKind;

    /// Raw network output, no layer remembers anything.
    fn forward_pass(&self, input: TensorView) -> NnResult<Tensor>;

    /// Raw network output, every layer keeps the context for [`Model::train_backward`].
    fn train_forward(&mut self, input: TensorView) -> NnResult<Tensor>;

    /// Propagates the loss gradient of the last [`Model::train_forward`] back through
    /// all layers and updates them. The batch size is the number of gradient rows.
    fn train_backward(&mut self, gradient: Tensor) -> NnResult<()>;

    /// Drops the forward contexts of all layers. Returns how many were pending.
    fn discard_pending(&mut self) -> usize;

    /// Network output mapped through the loss transform, e.g. class probabilities
    /// for a softmax cross entropy network. Does not modify the network.
    fn predict(&self, input: TensorView) -> NnResult<Tensor> {
        let output = self.forward_pass(input)?;
        Ok(self.loss().transform(output.view()))
    }

    /// One SGD step on a single batch. Returns the loss of the batch before the update.
    ///
    /// A non-finite batch loss is an error and leaves all parameters untouched.
    /// If the step fails, pending forward contexts are discarded, so the network
    /// can be trained again.
    fn train_batch(&mut self, inputs: TensorView, targets: TensorView) -> NnResult<Precision> {
        let result = sgd_step(self, inputs, targets);
        if result.is_err() {
            let discarded = self.discard_pending();
            if discarded > 0 {
                warn!(
                    "Discarded {} pending forward contexts after a failed batch",
                    discarded
                );
            }
        }
        result
    }

    /// Trains on contiguous batches of `batch_size` rows for `epochs` epochs, the last
    /// batch of an epoch may be smaller. Samples are never shuffled.
    fn fit(&mut self, inputs: TensorView, targets: TensorView) -> NnResult<TrainingHistory> {
        let config = *self.config();
        config.validate()?;
        if inputs.nrows() != targets.nrows() {
            return Err(NnError::SampleCountError {
                inputs: inputs.nrows(),
                targets: targets.nrows(),
            });
        }
        let samples = inputs.nrows();
        if samples == 0 {
            return Err(NnError::EmptyBatchError);
        }

        info!(
            "Starting training: epochs={}, samples={}, batch_size={}, learning_rate={}",
            config.epochs, samples, config.batch_size, config.learning_rate
        );
        let mut history = TrainingHistory::default();
        for epoch in 0..config.epochs {
            let mut total_loss = 0.;
            let mut batches = 0;
            for (batch, start) in (0..samples).step_by(config.batch_size).enumerate() {
                let end = (start + config.batch_size).min(samples);
                let loss = match self.train_batch(
                    inputs.slice(s![start..end, ..]),
                    targets.slice(s![start..end, ..]),
                ) {
                    Err(NnError::NonFiniteBatchLossError(_)) => {
                        return Err(NnError::NonFiniteLossError { epoch, batch })
                    }
                    result => result?,
                };
                total_loss += loss;
                batches += 1;
            }

            let average_loss = total_loss / batches as Precision;
            history.epoch_losses.push(average_loss);
            if config.log_interval > 0 && epoch % config.log_interval == 0 {
                info!(
                    "Training progress: epoch={}, avg_batch_loss={:.6}",
                    epoch, average_loss
                );
            }
        }
        info!("Training complete");
        Ok(history)
    }
}

fn sgd_step<M: Model + ?Sized>(
    model: &mut M,
    inputs: TensorView,
    targets: TensorView,
) -> NnResult<Precision> {
    let loss = *model.loss();
    let output = model.train_forward(inputs)?;
    let batch_loss = loss.calculate(output.view(), targets)?;
    if !batch_loss.is_finite() {
        return Err(NnError::NonFiniteBatchLossError(batch_loss));
    }
    let gradient = loss.derivative(output.view(), targets)?;
    model.train_backward(gradient)?;
    Ok(batch_loss)
}

fn infer_layers(layers: &[LayerKind], input: TensorView) -> NnResult<Tensor> {
    let mut remaining = layers.iter();
    let first = match remaining.next() {
        Some(layer) => layer.infer(input)?,
        None => return Ok(input.to_owned()),
    };
    remaining.try_fold(first, |activation, layer| layer.infer(activation.view()))
}

fn forward_layers(layers: &mut [LayerKind], input: TensorView) -> NnResult<Tensor> {
    let mut remaining = layers.iter_mut();
    let first = match remaining.next() {
        Some(layer) => layer.forward(input)?,
        None => return Ok(input.to_owned()),
    };
    remaining.try_fold(first, |activation, layer| layer.forward(activation.view()))
}

fn backward_layers(
    layers: &mut [LayerKind],
    gradient: Tensor,
    learning_rate: Precision,
) -> NnResult<Tensor> {
    layers
        .iter_mut()
        .rev()
        .try_fold(gradient, |gradient, layer| {
            layer.backward(gradient.view(), learning_rate)
        })
}

fn discard_layers(layers: &mut [LayerKind]) -> usize {
    layers
        .iter_mut()
        .map(|layer| layer.discard_pending())
        .filter(|&discarded| discarded)
        .count()
}

fn write_layers(f: &mut fmt::Formatter<'_>, layers: &[LayerKind], first_index: usize) -> fmt::Result {
    for (i, layer) in layers.iter().enumerate() {
        writeln!(f, "Layer #{} {}", first_index + i, layer)?;
        writeln!(f, "{}", LAYER_SEPARATOR)?;
    }
    Ok(())
}

fn check_network(config: &TrainingConfig, stage: &str, layers: &[LayerKind]) -> NnResult<()> {
    config.validate()?;
    if layers.is_empty() {
        return Err(NnError::ConfigError(format!(
            "the {} needs at least one layer",
            stage
        )));
    }
    Ok(())
}

/// Plain stack of layers, e.g. a multilayer perceptron.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawFeedForwardNetwork")]
pub struct FeedForwardNetwork {
    layers: Vec<LayerKind>,
    loss: LossKind,
    config: TrainingConfig,
}

#[derive(Deserialize)]
struct RawFeedForwardNetwork {
    layers: Vec<LayerKind>,
    loss: LossKind,
    config: TrainingConfig,
}

impl TryFrom<RawFeedForwardNetwork> for FeedForwardNetwork {
    type Error = NnError;

    fn try_from(raw: RawFeedForwardNetwork) -> NnResult<Self> {
        FeedForwardNetwork::new(raw.layers, raw.loss, raw.config)
    }
}

impl FeedForwardNetwork {
    pub fn new(layers: Vec<LayerKind>, loss: LossKind, config: TrainingConfig) -> NnResult<Self> {
        check_network(&config, "network", &layers)?;
        Ok(FeedForwardNetwork {
            layers,
            loss,
            config,
        })
    }

    pub fn layers(&self) -> &[LayerKind] {
        &self.layers
    }
}

impl Model for FeedForwardNetwork {
    fn config(&self) -> &TrainingConfig {
        &self.config
    }

    fn loss(&self) -> &LossKind {
        &self.loss
    }

    fn forward_pass(&self, input: TensorView) -> NnResult<Tensor> {
        infer_layers(&self.layers, input)
    }

    fn train_forward(&mut self, input: TensorView) -> NnResult<Tensor> {
        forward_layers(&mut self.layers, input)
    }

    fn train_backward(&mut self, gradient: Tensor) -> NnResult<()> {
        let learning_rate = self.config.learning_rate / gradient.nrows() as Precision;
        backward_layers(&mut self.layers, gradient, learning_rate)?;
        Ok(())
    }

    fn discard_pending(&mut self) -> usize {
        discard_layers(&mut self.layers)
    }
}

impl fmt::Display for FeedForwardNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", SEPARATOR)?;
        writeln!(
            f,
            "Neural Network (Learning Rate: {:.4})",
            self.config.learning_rate
        )?;
        writeln!(f, "Total Layers: {}", self.layers.len())?;
        writeln!(f, "{}", SEPARATOR)?;
        write_layers(f, &self.layers, 1)
    }
}

/// Convolutional feature extractor followed by a classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawConvolutionalNetwork")]
pub struct ConvolutionalNetwork {
    feature_layers: Vec<LayerKind>,
    classifier_layers: Vec<LayerKind>,
    loss: LossKind,
    config: TrainingConfig,
}

#[derive(Deserialize)]
struct RawConvolutionalNetwork {
    feature_layers: Vec<LayerKind>,
    classifier_layers: Vec<LayerKind>,
    loss: LossKind,
    config: TrainingConfig,
}

impl TryFrom<RawConvolutionalNetwork> for ConvolutionalNetwork {
    type Error = NnError;

    fn try_from(raw: RawConvolutionalNetwork) -> NnResult<Self> {
        ConvolutionalNetwork::new(
            raw.feature_layers,
            raw.classifier_layers,
            raw.loss,
            raw.config,
        )
    }
}

impl ConvolutionalNetwork {
    pub fn new(
        feature_layers: Vec<LayerKind>,
        classifier_layers: Vec<LayerKind>,
        loss: LossKind,
        config: TrainingConfig,
    ) -> NnResult<Self> {
        check_network(&config, "feature stage", &feature_layers)?;
        check_network(&config, "classifier", &classifier_layers)?;
        Ok(ConvolutionalNetwork {
            feature_layers,
            classifier_layers,
            loss,
            config,
        })
    }

    pub fn feature_layers(&self) -> &[LayerKind] {
        &self.feature_layers
    }

    pub fn classifier_layers(&self) -> &[LayerKind] {
        &self.classifier_layers
    }
}

impl Model for ConvolutionalNetwork {
    fn config(&self) -> &TrainingConfig {
        &self.config
    }

    fn loss(&self) -> &LossKind {
        &self.loss
    }

    fn forward_pass(&self, input: TensorView) -> NnResult<Tensor> {
        let features = infer_layers(&self.feature_layers, input)?;
        infer_layers(&self.classifier_layers, features.view())
    }

    fn train_forward(&mut self, input: TensorView) -> NnResult<Tensor> {
        let features = forward_layers(&mut self.feature_layers, input)?;
        forward_layers(&mut self.classifier_layers, features.view())
    }

    fn train_backward(&mut self, gradient: Tensor) -> NnResult<()> {
        let learning_rate = self.config.learning_rate;
        let classifier_learning_rate = learning_rate / gradient.nrows() as Precision;
        let feature_gradient =
            backward_layers(&mut self.classifier_layers, gradient, classifier_learning_rate)?;
        backward_layers(&mut self.feature_layers, feature_gradient, learning_rate)?;
        Ok(())
    }

    fn discard_pending(&mut self) -> usize {
        discard_layers(&mut self.feature_layers) + discard_layers(&mut self.classifier_layers)
    }
}

impl fmt::Display for ConvolutionalNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", SEPARATOR)?;
        writeln!(
            f,
            "Convolutional Network (Learning Rate: {:.4})",
            self.config.learning_rate
        )?;
        writeln!(
            f,
            "Total Layers: {} ({} feature, {} classifier)",
            self.feature_layers.len() + self.classifier_layers.len(),
            self.feature_layers.len(),
            self.classifier_layers.len()
        )?;
        writeln!(f, "{}", SEPARATOR)?;
        write_layers(f, &self.feature_layers, 1)?;
        write_layers(
            f,
            &self.classifier_layers,
            self.feature_layers.len() + 1,
        )
    }
}
