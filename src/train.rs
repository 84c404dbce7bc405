//! Training and evaluation loop
//!
//! A [`Trainer`] walks every mini-batch through
//! `Idle -> ForwardPass -> LossComputed -> BackwardPass -> ParametersUpdated -> Idle`
//! and periodically pauses updates for an `EvaluationPass` over held-out data.

use crate::{
    dataloader::{Batch, DataLoader},
    loss::CrossEntropyLoss,
    nn::{Mode, Module, NNError},
    optim::Optim,
};

/// Where the trainer is within a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainState {
    Idle,
    ForwardPass,
    LossComputed,
    BackwardPass,
    ParametersUpdated,
    EvaluationPass,
}

impl TrainState {
    pub fn can_transition_to(self, next: TrainState) -> bool {
        use TrainState::*;
        matches!(
            (self, next),
            (Idle, ForwardPass)
                | (ForwardPass, LossComputed)
                | (LossComputed, BackwardPass)
                | (BackwardPass, ParametersUpdated)
                | (ParametersUpdated, Idle)
                | (Idle, EvaluationPass)
                | (EvaluationPass, Idle)
        )
    }
}

/// When to pause training and evaluate on the validation set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalSchedule {
    EveryEpoch,
    /// Every `n` optimizer steps, counted across epochs
    EverySteps(usize),
}

#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub epochs: usize,
    pub eval_schedule: EvalSchedule,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 2,
            eval_schedule: EvalSchedule::EverySteps(40),
        }
    }
}

/// Mean loss and accuracy over a dataset
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub loss: f32,
    /// Fraction of samples whose highest scoring class is the label
    pub accuracy: f32,
}

/// A progress report emitted by the training loop
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub epoch: usize,
    pub step: usize,
    /// Mean training loss over the steps since the previous report
    pub train_loss: f32,
    pub validation: Option<Evaluation>,
}

#[derive(Debug, Clone, Default)]
pub struct History {
    /// Sample-weighted mean training loss of every epoch
    pub epoch_losses: Vec<f32>,
    pub reports: Vec<Report>,
}

/// Runs forward passes in evaluation mode over `loader` without touching any parameter
pub fn evaluate<M: Module + ?Sized>(model: &M, loader: &DataLoader) -> Result<Evaluation, NNError> {
    let mut total_loss = 0.0;
    let mut correct = 0;
    let mut n_samples = 0;
    for batch in loader {
        let logits = model.forward(&batch.inputs, Mode::Eval)?;
        let loss = CrossEntropyLoss::call(&logits, &batch.labels)?;
        total_loss += loss.item() * batch.len() as f32;
        correct += logits
            .argmax_rows()
            .iter()
            .zip(batch.labels.iter())
            .filter(|(predicted, label)| predicted == label)
            .count();
        n_samples += batch.len();
    }
    let n_samples = n_samples.max(1) as f32;
    Ok(Evaluation {
        loss: total_loss / n_samples,
        accuracy: correct as f32 / n_samples,
    })
}

/// Drives a model and its optimizer through training steps and evaluations
pub struct Trainer<'m, M: Module, O: Optim> {
    model: &'m M,
    optim: O,
    state: TrainState,
    steps: usize,
}

impl<'m, M: Module, O: Optim> Trainer<'m, M, O> {
    /// `optim` must have been built over `model.parameters()`
    pub fn new(model: &'m M, optim: O) -> Self {
        Self {
            model,
            optim,
            state: TrainState::Idle,
            steps: 0,
        }
    }

    pub fn state(&self) -> TrainState {
        self.state
    }

    /// Optimizer steps taken so far
    pub fn steps(&self) -> usize {
        self.steps
    }

    fn transition(&mut self, next: TrainState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        log::trace!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Runs one forward/backward/update cycle and returns the batch loss
    pub fn train_step(&mut self, batch: &Batch) -> Result<f32, NNError> {
        let result = self.run_step(batch);
        if result.is_err() {
            // failures happen before backward, so no gradient was accumulated
            self.state = TrainState::Idle;
        }
        result
    }

    fn run_step(&mut self, batch: &Batch) -> Result<f32, NNError> {
        self.transition(TrainState::ForwardPass);
        let logits = self.model.forward(&batch.inputs, Mode::Train)?;

        let loss = CrossEntropyLoss::call(&logits, &batch.labels)?;
        self.transition(TrainState::LossComputed);

        self.transition(TrainState::BackwardPass);
        loss.backward();

        self.transition(TrainState::ParametersUpdated);
        self.optim.step();
        self.optim.zero_grad();

        self.transition(TrainState::Idle);
        self.steps += 1;
        Ok(loss.item())
    }

    /// Evaluates on `loader` between steps
    pub fn evaluate(&mut self, loader: &DataLoader) -> Result<Evaluation, NNError> {
        self.transition(TrainState::EvaluationPass);
        let result = evaluate(self.model, loader);
        self.transition(TrainState::Idle);
        result
    }

    /// Trains for `config.epochs` passes over `train_loader`, reporting on `validation`
    /// according to the schedule. The first error aborts training.
    pub fn fit(
        &mut self,
        train_loader: &DataLoader,
        validation: Option<&DataLoader>,
        config: &TrainConfig,
    ) -> Result<History, NNError> {
        let mut history = History::default();
        for epoch in 1..=config.epochs {
            let mut epoch_loss = 0.0;
            let mut epoch_samples = 0;
            let mut running_loss = 0.0;
            let mut running_steps = 0;

            for batch in train_loader {
                let loss = self.train_step(&batch)?;
                epoch_loss += loss * batch.len() as f32;
                epoch_samples += batch.len();
                running_loss += loss;
                running_steps += 1;

                let due = match config.eval_schedule {
                    EvalSchedule::EverySteps(n) => n > 0 && self.steps % n == 0,
                    EvalSchedule::EveryEpoch => false,
                };
                if due {
                    let train_loss = running_loss / running_steps as f32;
                    history
                        .reports
                        .push(self.report(epoch, config.epochs, train_loss, validation)?);
                    running_loss = 0.0;
                    running_steps = 0;
                }
            }

            if config.eval_schedule == EvalSchedule::EveryEpoch && running_steps > 0 {
                let train_loss = running_loss / running_steps as f32;
                history
                    .reports
                    .push(self.report(epoch, config.epochs, train_loss, validation)?);
            }

            let mean_loss = epoch_loss / epoch_samples.max(1) as f32;
            log::debug!(
                "Epoch {}/{} finished after {} steps, mean training loss {:.4}",
                epoch,
                config.epochs,
                self.steps,
                mean_loss
            );
            history.epoch_losses.push(mean_loss);
        }
        Ok(history)
    }

    fn report(
        &mut self,
        epoch: usize,
        epochs: usize,
        train_loss: f32,
        validation: Option<&DataLoader>,
    ) -> Result<Report, NNError> {
        let validation = validation.map(|l| self.evaluate(l)).transpose()?;
        match validation {
            Some(eval) => log::info!(
                "Epoch: {}/{}.. Training Loss: {:.3}.. Test Loss: {:.3}.. Test Accuracy: {:.3}",
                epoch,
                epochs,
                train_loss,
                eval.loss,
                eval.accuracy
            ),
            None => log::info!(
                "Epoch: {}/{}.. Training Loss: {:.3}",
                epoch,
                epochs,
                train_loss
            ),
        }
        Ok(Report {
            epoch,
            step: self.steps,
            train_loss,
            validation,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        datasets::gen_prototype_data,
        nn::{Classifier, NetworkConfig},
        optim::{Adam, SGD},
        tensor::{Shape, Tensor},
    };

    use super::*;

    fn small_loader(n: usize, batch_size: usize) -> DataLoader {
        let (data, labels) = gen_prototype_data(n, 20, 4, 0.3, 9).unwrap();
        DataLoader::new(data, labels, batch_size, false).unwrap()
    }

    fn small_model(dropout: f32) -> Classifier {
        let config = NetworkConfig::new(20, 4)
            .with_hidden_layers(&[16])
            .with_dropout(dropout);
        Classifier::with_seed(config, 4).unwrap()
    }

    #[test]
    fn test_transitions() {
        use TrainState::*;
        let cycle = [
            Idle,
            ForwardPass,
            LossComputed,
            BackwardPass,
            ParametersUpdated,
            Idle,
        ];
        for pair in cycle.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]));
        }
        assert!(Idle.can_transition_to(EvaluationPass));
        assert!(EvaluationPass.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(BackwardPass));
        assert!(!ForwardPass.can_transition_to(EvaluationPass));
        assert!(!ParametersUpdated.can_transition_to(ForwardPass));
    }

    #[test]
    fn test_train_step_updates_and_zeroes() {
        let model = small_model(0.5);
        let before = model.state_dict();
        let optim = SGD::new(model.parameters(), 0.05, 0.9);
        let mut trainer = Trainer::new(&model, optim);
        let batch = small_loader(8, 8).iter().next().unwrap();

        let loss = trainer.train_step(&batch).unwrap();
        assert!(loss.is_finite());
        assert_eq!(trainer.state(), TrainState::Idle);
        assert_eq!(trainer.steps(), 1);
        assert_ne!(model.state_dict(), before);
        for p in model.parameters() {
            assert!(p.grad().iter().all(|g| *g == 0.0));
        }
    }

    #[test]
    fn test_sgd_step_decreases_loss() {
        let model = small_model(0.0);
        let batch = small_loader(16, 16).iter().next().unwrap();
        let loss_on_batch = |model: &Classifier| {
            let logits = model.forward(&batch.inputs, Mode::Eval).unwrap();
            CrossEntropyLoss::call(&logits, &batch.labels).unwrap().item()
        };

        let before = loss_on_batch(&model);
        let optim = SGD::new(model.parameters(), 0.01, 0.0);
        let mut trainer = Trainer::new(&model, optim);
        let step_loss = trainer.train_step(&batch).unwrap();
        crate::assert_eq_float!(step_loss, before, 1e-5);
        assert!(loss_on_batch(&model) < before);
    }

    #[test]
    fn test_step_error_is_returned() {
        let model = small_model(0.0);
        let optim = SGD::new(model.parameters(), 0.01, 0.0);
        let mut trainer = Trainer::new(&model, optim);
        let batch = Batch {
            inputs: Tensor::zeros(Shape::new(2, 7)),
            labels: vec![0, 1],
        };
        assert!(matches!(
            trainer.train_step(&batch),
            Err(NNError::InputSizeMismatch {
                expected: 20,
                got: 7
            })
        ));
        assert_eq!(trainer.state(), TrainState::Idle);
        assert_eq!(trainer.steps(), 0);
    }

    #[test]
    fn test_evaluate_leaves_parameters() {
        let model = small_model(0.5);
        let loader = small_loader(30, 7);
        let before = model.state_dict();
        let first = evaluate(&model, &loader).unwrap();
        let second = evaluate(&model, &loader).unwrap();
        assert_eq!(first, second);
        assert!((0.0..=1.0).contains(&first.accuracy));
        assert!(first.loss > 0.0);
        assert_eq!(model.state_dict(), before);
    }

    #[test]
    fn test_fit_reports() {
        let model = small_model(0.0);
        let train_loader = small_loader(40, 10);
        let validation = small_loader(12, 5);
        let optim = Adam::new(model.parameters(), 0.01);
        let mut trainer = Trainer::new(&model, optim);

        let config = TrainConfig {
            epochs: 2,
            eval_schedule: EvalSchedule::EverySteps(3),
        };
        let history = trainer.fit(&train_loader, Some(&validation), &config).unwrap();
        // 4 batches per epoch, 8 steps in total
        assert_eq!(trainer.steps(), 8);
        assert_eq!(history.epoch_losses.len(), 2);
        let steps = history.reports.iter().map(|r| r.step).collect::<Vec<_>>();
        assert_eq!(steps, vec![3, 6]);
        assert_eq!(history.reports[1].epoch, 2);
        assert!(history.reports.iter().all(|r| r.validation.is_some()));

        let config = TrainConfig {
            epochs: 1,
            eval_schedule: EvalSchedule::EveryEpoch,
        };
        let history = trainer.fit(&train_loader, None, &config).unwrap();
        assert_eq!(history.reports.len(), 1);
        assert_eq!(history.reports[0].step, 12);
        assert_eq!(history.reports[0].validation, None);
    }

    #[test]
    fn test_one_epoch_on_mnist_sized_data() {
        let (data, labels) = gen_prototype_data(640, 784, 10, 0.5, 21).unwrap();
        let loader = DataLoader::new(data, labels, 64, true)
            .unwrap()
            .with_seed(21);
        let config = NetworkConfig::new(784, 10)
            .with_hidden_layers(&[128, 64])
            .with_dropout(0.2);
        let model = Classifier::with_seed(config, 21).unwrap();

        let before = evaluate(&model, &loader).unwrap();
        let optim = Adam::new(model.parameters(), 0.001);
        let mut trainer = Trainer::new(&model, optim);
        let history = trainer
            .fit(
                &loader,
                None,
                &TrainConfig {
                    epochs: 1,
                    eval_schedule: EvalSchedule::EveryEpoch,
                },
            )
            .unwrap();
        let after = evaluate(&model, &loader).unwrap();

        assert_eq!(trainer.steps(), 10);
        assert_eq!(history.epoch_losses.len(), 1);
        assert!(
            after.loss < before.loss,
            "loss did not decrease: {} -> {}",
            before.loss,
            after.loss
        );
    }
}
