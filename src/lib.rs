//! A small library for training fully-connected image classifiers
//! using a PyTorch-like API.
//!
//! Tensors record the operations applied to them so gradients can be
//! backpropagated into the parameters of a [`nn::Classifier`], which is
//! trained by [`train::Trainer`] and persisted through [`checkpoint`].

pub mod backprop_fns;
pub mod checkpoint;
pub mod dataloader;
pub mod datasets;
pub mod loss;
pub mod nn;
pub mod optim;
pub mod tensor;
pub mod train;
