//! Loss function(s)

use crate::{
    nn::NNError,
    tensor::{Shape, Tensor},
};

/// Negative log likelihood of the target classes, averaged over the batch.
/// Expects log-probabilities, e.g. the output of [`Tensor::log_softmax`].
pub struct NLLLoss;

impl NLLLoss {
    pub fn call(log_probs: &Tensor, targets: &[usize]) -> Result<Tensor, NNError> {
        let Shape { rows, cols } = log_probs.shape();
        if targets.len() != rows || rows == 0 {
            return Err(NNError::TargetCountMismatch {
                batch: rows,
                targets: targets.len(),
            });
        }
        let mut one_hot = vec![0.0; rows * cols];
        for (row, &class) in targets.iter().enumerate() {
            if class >= cols {
                return Err(NNError::ClassOutOfRange {
                    class,
                    n_classes: cols,
                });
            }
            one_hot[row * cols + class] = 1.0;
        }
        let one_hot = Tensor::new(one_hot, Shape::new(rows, cols))?;
        let picked = log_probs.mul(&one_hot)?.sum();
        Ok(picked.scale(-1.0 / rows as f32))
    }
}

/// Cross entropy between logits and target classes. Applies `log_softmax`
/// itself, so the classifier can output raw scores.
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn call(logits: &Tensor, targets: &[usize]) -> Result<Tensor, NNError> {
        NLLLoss::call(&logits.log_softmax(), targets)
    }
}
