//! Saving and restoring trained classifiers
//!
//! A checkpoint is a JSON document holding the architecture next to the learned
//! parameters, so a model can be rebuilt without knowing how it was configured.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::nn::{Classifier, DEFAULT_DROPOUT, NNError, NetworkConfig, StateDict};

/// Format version written by [`save`]
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed checkpoint: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Checkpoint does not match its architecture: {0}")]
    Model(#[from] NNError),
    #[error("Checkpoint version {found} is newer than the supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("Parameter '{name}' holds {count} non-finite values and cannot be stored")]
    NonFiniteParameter { name: String, count: usize },
}

// files written before versioning have no version field
fn legacy_version() -> u32 {
    1
}

fn default_dropout() -> f32 {
    DEFAULT_DROPOUT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default = "legacy_version")]
    pub version: u32,
    pub input_size: usize,
    pub output_size: usize,
    pub hidden_layers: Vec<usize>,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    pub state_dict: StateDict,
}

impl Checkpoint {
    pub fn from_model(model: &Classifier) -> Self {
        let config = model.config();
        Self {
            version: CHECKPOINT_VERSION,
            input_size: config.input_size,
            output_size: config.output_size,
            hidden_layers: config.hidden_layers.clone(),
            dropout: config.dropout,
            state_dict: model.state_dict(),
        }
    }

    pub fn config(&self) -> NetworkConfig {
        NetworkConfig::new(self.input_size, self.output_size)
            .with_hidden_layers(&self.hidden_layers)
            .with_dropout(self.dropout)
    }

    /// JSON has no encoding for NaN or infinity, so a diverged model cannot be stored
    pub fn check_finite(&self) -> Result<(), CheckpointError> {
        for (name, stored) in &self.state_dict {
            let count = stored.data.iter().filter(|v| !v.is_finite()).count();
            if count > 0 {
                return Err(CheckpointError::NonFiniteParameter {
                    name: name.clone(),
                    count,
                });
            }
        }
        Ok(())
    }

    /// Rebuilds the architecture and loads the stored parameters into it
    pub fn into_model(self) -> Result<Classifier, CheckpointError> {
        if self.version > CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: self.version,
                supported: CHECKPOINT_VERSION,
            });
        }
        let mut model = Classifier::new(self.config())?;
        model.load_state_dict(&self.state_dict)?;
        Ok(model)
    }
}

/// Writes `model` to `path`, replacing any existing file.
///
/// The document is written to a temporary file next to `path` and renamed over it,
/// so a failed save leaves a previous checkpoint intact.
pub fn save(model: &Classifier, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
    let path = path.as_ref();
    let checkpoint = Checkpoint::from_model(model);
    checkpoint.check_finite()?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        serde_json::to_writer(&mut writer, &checkpoint)?;
        writer.flush()?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    log::info!("Saved checkpoint to '{}'", path.display());
    Ok(())
}

/// Reads a checkpoint written by [`save`] and rebuilds the classifier
pub fn load(path: impl AsRef<Path>) -> Result<Classifier, CheckpointError> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let checkpoint: Checkpoint = serde_json::from_reader(reader)?;
    log::debug!(
        "Read checkpoint version {} with hidden layers {:?}",
        checkpoint.version,
        checkpoint.hidden_layers
    );
    checkpoint.into_model()
}
