//! Components to build a feed-forward classifier

use std::{
    cell::RefCell,
    collections::BTreeMap,
    fmt::{self, Display},
    sync::atomic::{self, AtomicUsize},
};

use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64Mcg;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tensor::{Shape, Tensor, TensorError};

/// Dropout probability used when none is configured
pub const DEFAULT_DROPOUT: f32 = 0.5;

/// Errors for the neural network
#[derive(Debug, Error)]
pub enum NNError {
    #[error("Invalid network configuration: {0}")]
    InvalidConfig(String),
    #[error("Input size mismatch: expected {expected} features, got {got}")]
    InputSizeMismatch { expected: usize, got: usize },
    #[error("Shape mismatch for parameter '{name}': model expects {expected}, got {got}")]
    ShapeMismatch {
        name: String,
        expected: Shape,
        got: Shape,
    },
    #[error("Parameter '{0}' is missing from the state dict")]
    MissingParameter(String),
    #[error("State dict contains unexpected parameter '{0}'")]
    UnexpectedParameter(String),
    #[error("Got {targets} targets for a batch of {batch}")]
    TargetCountMismatch { batch: usize, targets: usize },
    #[error("Target class {class} is out of range for {n_classes} classes")]
    ClassOutOfRange { class: usize, n_classes: usize },
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Whether a forward pass belongs to training or evaluation. Dropout is only
/// applied in `Train`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// Represents the torch.nn.Module. NNs should implement this trait.
/// <https://github.com/pytorch/pytorch/blob/v2.6.0/torch/nn/modules/module.py#L402>
pub trait Module {
    fn zero_grad(&mut self) {
        for p in self.parameters().iter_mut() {
            p.zero_grad();
        }
    }

    fn parameters(&self) -> Vec<Tensor>;
    fn forward(&self, input: &Tensor, mode: Mode) -> Result<Tensor, NNError>;
}

/// A fully-connected layer holding a `[out, in]` weight and a `[1, out]` bias
pub struct Linear {
    pub weight: Tensor,
    pub bias: Tensor,
    n_output_nans: AtomicUsize,
}

impl Linear {
    /// Creates a new layer with the given number of inputs and outputs
    pub fn new<R: Rng>(
        n_inputs: usize,
        n_outputs: usize,
        rng: &mut R,
    ) -> Result<Self, NNError> {
        // He initialization to ensure the variance of the output is the same as the input
        // and keep weights relatively small to avoid exploding or vanishing gradients
        let std = (2.0 / n_inputs as f32).sqrt();
        let normal = Normal::new(0.0, std).map_err(|e| NNError::InvalidConfig(e.to_string()))?;
        let weight = (0..n_inputs * n_outputs)
            .map(|_| normal.sample(rng))
            .collect();
        let bias = (0..n_outputs).map(|_| normal.sample(rng)).collect();
        Ok(Self {
            weight: Tensor::parameter(weight, Shape::new(n_outputs, n_inputs))?,
            bias: Tensor::parameter(bias, Shape::new(1, n_outputs))?,
            n_output_nans: AtomicUsize::new(0),
        })
    }

    // Testing utility for a deterministic and simple layer
    #[cfg(test)]
    fn new_ones(n_inputs: usize, n_outputs: usize) -> Self {
        Self {
            weight: Tensor::parameter(
                vec![1.0; n_inputs * n_outputs],
                Shape::new(n_outputs, n_inputs),
            )
            .unwrap(),
            bias: Tensor::parameter(vec![1.0; n_outputs], Shape::new(1, n_outputs)).unwrap(),
            n_output_nans: AtomicUsize::new(0),
        }
    }

    pub fn n_inputs(&self) -> usize {
        self.weight.shape().cols
    }

    pub fn n_outputs(&self) -> usize {
        self.weight.shape().rows
    }

    /// Returns all the parameters in the layer
    pub fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone(), self.bias.clone()]
    }

    /// Computes forward pass for a layer
    pub fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        let got = input.shape().cols;
        if got != self.n_inputs() {
            return Err(NNError::InputSizeMismatch {
                expected: self.n_inputs(),
                got,
            });
        }
        let output = input.linear(&self.weight, &self.bias)?;
        let n_output_nans = output.data().iter().filter(|v| v.is_nan()).count();
        self.n_output_nans
            .store(n_output_nans, atomic::Ordering::Relaxed);
        if n_output_nans > 0 {
            log::debug!("n_output_nans: {}", n_output_nans);
        }
        Ok(output)
    }

    /// Number of NaN outputs in the most recent forward pass (used for debugging)
    pub fn n_output_nans(&self) -> usize {
        self.n_output_nans.load(atomic::Ordering::Relaxed)
    }
}

/// Applies ReLU element-wise
#[derive(Default)]
pub struct ReLU {
    n_dead_neurons: AtomicUsize,
}

impl ReLU {
    pub fn new() -> Self {
        Self {
            n_dead_neurons: AtomicUsize::new(0),
        }
    }

    pub fn forward(&self, input: &Tensor) -> Tensor {
        let n_dead_neurons = input.data().iter().filter(|v| **v <= 0.0).count();
        self.n_dead_neurons
            .store(n_dead_neurons, atomic::Ordering::Relaxed);
        input.relu()
    }

    /// Returns the number of zeroed activations in the most recent batch (used for debugging)
    pub fn n_dead_neurons(&self) -> usize {
        self.n_dead_neurons.load(atomic::Ordering::Relaxed)
    }
}

/// Zeroes each activation with probability `p` while training and scales the
/// survivors by `1 / (1 - p)`, so evaluation needs no rescaling
pub struct Dropout {
    p: f32,
    rng: RefCell<Pcg64Mcg>,
}

impl Dropout {
    pub fn new(p: f32, seed: u64) -> Self {
        Self {
            p,
            rng: RefCell::new(Pcg64Mcg::seed_from_u64(seed)),
        }
    }

    pub fn p(&self) -> f32 {
        self.p
    }

    pub fn forward(&self, input: &Tensor, mode: Mode) -> Result<Tensor, NNError> {
        if mode == Mode::Eval || self.p == 0.0 {
            return Ok(input.clone());
        }
        let keep = 1.0 - self.p;
        let shape = input.shape();
        let mask = {
            let mut rng = self.rng.borrow_mut();
            (0..shape.len())
                .map(|_| {
                    if rng.random::<f32>() < keep {
                        1.0 / keep
                    } else {
                        0.0
                    }
                })
                .collect()
        };
        Ok(input.mul(&Tensor::new(mask, shape)?)?)
    }
}

/// One hidden block of the classifier: affine map, ReLU, dropout
pub struct HiddenUnit {
    pub linear: Linear,
    pub relu: ReLU,
    pub dropout: Dropout,
}

impl HiddenUnit {
    fn new<R: Rng>(
        n_inputs: usize,
        n_outputs: usize,
        dropout: f32,
        rng: &mut R,
    ) -> Result<Self, NNError> {
        Ok(Self {
            linear: Linear::new(n_inputs, n_outputs, rng)?,
            relu: ReLU::new(),
            dropout: Dropout::new(dropout, rng.random()),
        })
    }

    pub fn forward(&self, input: &Tensor, mode: Mode) -> Result<Tensor, NNError> {
        let out = self.linear.forward(input)?;
        let out = self.relu.forward(&out);
        self.dropout.forward(&out, mode)
    }
}

/// Architecture of a [`Classifier`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub input_size: usize,
    pub output_size: usize,
    /// Widths of the hidden layers in order, may be empty
    pub hidden_layers: Vec<usize>,
    pub dropout: f32,
}

impl NetworkConfig {
    pub fn new(input_size: usize, output_size: usize) -> Self {
        Self {
            input_size,
            output_size,
            hidden_layers: vec![],
            dropout: DEFAULT_DROPOUT,
        }
    }

    pub fn with_hidden_layers(mut self, hidden_layers: &[usize]) -> Self {
        self.hidden_layers = hidden_layers.to_vec();
        self
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn validate(&self) -> Result<(), NNError> {
        if self.input_size == 0 {
            return Err(NNError::InvalidConfig("input_size must be positive".into()));
        }
        if self.output_size == 0 {
            return Err(NNError::InvalidConfig("output_size must be positive".into()));
        }
        if let Some(i) = self.hidden_layers.iter().position(|&w| w == 0) {
            return Err(NNError::InvalidConfig(format!(
                "hidden layer {i} has zero width"
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(NNError::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }
}

/// Serialized values of a single parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTensor {
    pub shape: Shape,
    pub data: Vec<f32>,
}

/// Parameter name to stored values
pub type StateDict = BTreeMap<String, StoredTensor>;

/// Multi-layer perceptron producing unnormalized class scores (logits)
pub struct Classifier {
    config: NetworkConfig,
    hidden_layers: Vec<HiddenUnit>,
    output: Linear,
}

impl Classifier {
    /// Builds a classifier with randomly seeded weights
    pub fn new(config: NetworkConfig) -> Result<Self, NNError> {
        Self::with_seed(config, rand::rng().random())
    }

    /// Builds a classifier whose weights and dropout masks are reproducible from `seed`
    pub fn with_seed(config: NetworkConfig, seed: u64) -> Result<Self, NNError> {
        config.validate()?;
        let mut rng = Pcg64Mcg::seed_from_u64(seed);

        let mut n_inputs = config.input_size;
        let mut hidden_layers = Vec::with_capacity(config.hidden_layers.len());
        for &width in &config.hidden_layers {
            hidden_layers.push(HiddenUnit::new(n_inputs, width, config.dropout, &mut rng)?);
            n_inputs = width;
        }
        let output = Linear::new(n_inputs, config.output_size, &mut rng)?;

        Ok(Self {
            config,
            hidden_layers,
            output,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn hidden_units(&self) -> &[HiddenUnit] {
        &self.hidden_layers
    }

    /// Parameters paired with their state dict names
    pub fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut named = Vec::with_capacity(2 * (self.hidden_layers.len() + 1));
        for (i, unit) in self.hidden_layers.iter().enumerate() {
            named.push((format!("hidden_layers.{i}.weight"), unit.linear.weight.clone()));
            named.push((format!("hidden_layers.{i}.bias"), unit.linear.bias.clone()));
        }
        named.push(("output.weight".to_string(), self.output.weight.clone()));
        named.push(("output.bias".to_string(), self.output.bias.clone()));
        named
    }

    pub fn state_dict(&self) -> StateDict {
        self.named_parameters()
            .into_iter()
            .map(|(name, p)| {
                let stored = StoredTensor {
                    shape: p.shape(),
                    data: p.data(),
                };
                (name, stored)
            })
            .collect()
    }

    /// Copies stored values into the parameters. Every entry is validated before
    /// anything is written, so a failed load leaves the model untouched.
    pub fn load_state_dict(&mut self, state_dict: &StateDict) -> Result<(), NNError> {
        let named = self.named_parameters();

        for (name, param) in &named {
            if let Some(stored) = state_dict.get(name) {
                if stored.shape != param.shape() {
                    return Err(NNError::ShapeMismatch {
                        name: name.clone(),
                        expected: param.shape(),
                        got: stored.shape,
                    });
                }
                if stored.data.len() != stored.shape.len() {
                    return Err(TensorError::DataLength {
                        shape: stored.shape,
                        expected: stored.shape.len(),
                        got: stored.data.len(),
                    }
                    .into());
                }
            }
        }
        if let Some((name, _)) = named.iter().find(|(n, _)| !state_dict.contains_key(n)) {
            return Err(NNError::MissingParameter(name.clone()));
        }
        if let Some(name) = state_dict
            .keys()
            .find(|k| !named.iter().any(|(n, _)| n == *k))
        {
            return Err(NNError::UnexpectedParameter(name.clone()));
        }

        for (name, mut param) in named {
            if let Some(stored) = state_dict.get(&name) {
                param.set_data(stored.data.clone())?;
            }
        }
        Ok(())
    }

    /// Class probabilities per row, computed in evaluation mode
    pub fn probabilities(&self, input: &Tensor) -> Result<Vec<Vec<f32>>, NNError> {
        let probs = self.forward(input, Mode::Eval)?.log_softmax().exp();
        Ok((0..probs.shape().rows).map(|r| probs.row(r)).collect())
    }

    /// Most likely class per row, computed in evaluation mode
    pub fn predict(&self, input: &Tensor) -> Result<Vec<usize>, NNError> {
        Ok(self.forward(input, Mode::Eval)?.argmax_rows())
    }
}

impl Module for Classifier {
    fn forward(&self, input: &Tensor, mode: Mode) -> Result<Tensor, NNError> {
        let mut x = input.clone();
        for unit in &self.hidden_layers {
            x = unit.forward(&x, mode)?;
        }
        self.output.forward(&x)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.hidden_layers
            .iter()
            .flat_map(|unit| unit.linear.parameters())
            .chain(self.output.parameters())
            .collect()
    }
}

// mirrors the layout of PyTorch's module printout
impl Display for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Classifier(")?;
        for (i, unit) in self.hidden_layers.iter().enumerate() {
            writeln!(
                f,
                "  (hidden_layers.{i}): Linear(in_features={}, out_features={}) -> ReLU -> Dropout(p={})",
                unit.linear.n_inputs(),
                unit.linear.n_outputs(),
                unit.dropout.p()
            )?;
        }
        writeln!(
            f,
            "  (output): Linear(in_features={}, out_features={})",
            self.output.n_inputs(),
            self.output.n_outputs()
        )?;
        write!(f, ")")
    }
}
