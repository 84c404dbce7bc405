//! Image classification datasets and a plot of the training curves
//!
//! MNIST and Fashion-MNIST are read from the IDX files they are distributed as. A
//! synthetic dataset of the same dimensions is available for offline runs and tests.

use std::{
    error::Error,
    fmt::{self, Display},
    fs,
    path::Path,
};

use clap::ValueEnum;
use plotters::{
    chart::ChartBuilder,
    prelude::{BitMapBackend, IntoDrawingArea, LineSeries, PathElement},
    style::{BLACK, BLUE, Color, RED, WHITE},
};
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::train::History;

/// Flattened samples and their class labels
pub type LabeledData = (Vec<Vec<f32>>, Vec<usize>);

const IMAGE_MAGIC: u32 = 2051;
const LABEL_MAGIC: u32 = 2049;

/// Side length of the 28x28 images in both datasets
pub const IMAGE_SIDE: usize = 28;

const DIGIT_CLASSES: [&str; 10] = ["0", "1", "2", "3", "4", "5", "6", "7", "8", "9"];
const FASHION_CLASSES: [&str; 10] = [
    "T-shirt/top",
    "Trouser",
    "Pullover",
    "Dress",
    "Coat",
    "Sandal",
    "Shirt",
    "Sneaker",
    "Bag",
    "Ankle boot",
];

/// Errors while reading or generating datasets
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Bad IDX magic number: expected {expected}, got {got}")]
    BadMagic { expected: u32, got: u32 },
    #[error("IDX file is truncated: expected at least {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("IDX images have zero pixels")]
    EmptyImages,
    #[error("IDX header describes more bytes than fit in memory: {count} images of {rows}x{cols}")]
    HeaderOverflow { count: usize, rows: usize, cols: usize },
    #[error("Found {images} images but {labels} labels")]
    CountMismatch { images: usize, labels: usize },
    #[error("Invalid dataset parameter: {0}")]
    InvalidParameter(String),
}

/// Toggles between dataset types
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    Synthetic,
    Mnist,
    FashionMnist,
}

impl Dataset {
    /// Number of features of a flattened sample
    pub fn input_size(&self) -> usize {
        IMAGE_SIDE * IMAGE_SIDE
    }

    pub fn class_names(&self) -> &'static [&'static str] {
        match self {
            Dataset::Synthetic | Dataset::Mnist => &DIGIT_CLASSES,
            Dataset::FashionMnist => &FASHION_CLASSES,
        }
    }

    pub fn n_classes(&self) -> usize {
        self.class_names().len()
    }
}

impl Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dataset::Synthetic => write!(f, "synthetic"),
            Dataset::Mnist => write!(f, "mnist"),
            Dataset::FashionMnist => write!(f, "fashion-mnist"),
        }
    }
}

/// Which half of an IDX dataset to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    fn file_prefix(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "t10k",
        }
    }
}

/// Loads the train and test halves of a dataset.
///
/// IDX datasets are read from `data_dir`; the synthetic dataset generates
/// `synthetic_samples` training samples plus a fifth as many test samples from `seed`.
pub fn load_dataset(
    dataset: Dataset,
    data_dir: &Path,
    synthetic_samples: usize,
    seed: u64,
) -> Result<(LabeledData, LabeledData), DatasetError> {
    match dataset {
        Dataset::Synthetic => {
            let n_test = (synthetic_samples / 5).max(1);
            let (mut data, mut labels) = gen_prototype_data(
                synthetic_samples + n_test,
                dataset.input_size(),
                dataset.n_classes(),
                0.5,
                seed,
            )?;
            let test_data = data.split_off(synthetic_samples);
            let test_labels = labels.split_off(synthetic_samples);
            Ok(((data, labels), (test_data, test_labels)))
        }
        Dataset::Mnist | Dataset::FashionMnist => {
            let train = load_idx_split(data_dir, Split::Train)?;
            let test = load_idx_split(data_dir, Split::Test)?;
            log::info!(
                "Loaded {} from '{}': {} training and {} test samples",
                dataset,
                data_dir.display(),
                train.1.len(),
                test.1.len()
            );
            Ok((train, test))
        }
    }
}

/// Reads `<prefix>-images-idx3-ubyte` and `<prefix>-labels-idx1-ubyte` from `dir`
/// and normalizes the pixels into `[-1, 1]`
pub fn load_idx_split(dir: &Path, split: Split) -> Result<LabeledData, DatasetError> {
    let prefix = split.file_prefix();
    let images = read_idx_images(&dir.join(format!("{prefix}-images-idx3-ubyte")))?;
    let labels = read_idx_labels(&dir.join(format!("{prefix}-labels-idx1-ubyte")))?;
    if images.len() != labels.len() {
        return Err(DatasetError::CountMismatch {
            images: images.len(),
            labels: labels.len(),
        });
    }
    let data = images
        .iter()
        .map(|image| image.iter().map(|&p| normalize_pixel(p)).collect())
        .collect();
    let labels = labels.into_iter().map(usize::from).collect();
    Ok((data, labels))
}

/// Scales a pixel to `[0, 1]` then normalizes it with mean 0.5 and std 0.5
pub fn normalize_pixel(pixel: u8) -> f32 {
    (pixel as f32 / 255.0 - 0.5) / 0.5
}

pub fn read_idx_images(path: &Path) -> Result<Vec<Vec<u8>>, DatasetError> {
    parse_idx_images(&fs::read(path)?)
}

pub fn read_idx_labels(path: &Path) -> Result<Vec<u8>, DatasetError> {
    parse_idx_labels(&fs::read(path)?)
}

/// Big-endian header: magic, image count, rows, cols; followed by one byte per pixel
fn parse_idx_images(bytes: &[u8]) -> Result<Vec<Vec<u8>>, DatasetError> {
    check_magic(bytes, IMAGE_MAGIC)?;
    let count = read_u32(bytes, 4)? as usize;
    let rows = read_u32(bytes, 8)? as usize;
    let cols = read_u32(bytes, 12)? as usize;
    let overflow = || DatasetError::HeaderOverflow { count, rows, cols };
    let pixels = rows.checked_mul(cols).ok_or_else(overflow)?;
    if pixels == 0 {
        return Err(DatasetError::EmptyImages);
    }
    let body_len = count.checked_mul(pixels).ok_or_else(overflow)?;
    check_body(bytes, 16, body_len)?;
    let body = &bytes[16..];
    Ok(body
        .chunks_exact(pixels)
        .take(count)
        .map(|image| image.to_vec())
        .collect())
}

/// Big-endian header: magic, label count; followed by one byte per label
fn parse_idx_labels(bytes: &[u8]) -> Result<Vec<u8>, DatasetError> {
    check_magic(bytes, LABEL_MAGIC)?;
    let count = read_u32(bytes, 4)? as usize;
    check_body(bytes, 8, count)?;
    Ok(bytes[8..8 + count].to_vec())
}

fn check_magic(bytes: &[u8], expected: u32) -> Result<(), DatasetError> {
    let got = read_u32(bytes, 0)?;
    if got != expected {
        return Err(DatasetError::BadMagic { expected, got });
    }
    Ok(())
}

fn check_body(bytes: &[u8], header: usize, body: usize) -> Result<(), DatasetError> {
    let expected = header.saturating_add(body);
    if bytes.len() < expected {
        return Err(DatasetError::Truncated {
            expected,
            got: bytes.len(),
        });
    }
    Ok(())
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, DatasetError> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(DatasetError::Truncated {
            expected: offset + 4,
            got: bytes.len(),
        })
}

/// Generates a separable classification dataset: every class gets a random prototype in
/// `[-1, 1]^input_size` and each sample is its class prototype plus gaussian noise.
/// Labels cycle through the classes so every class is equally represented.
pub fn gen_prototype_data(
    n_samples: usize,
    input_size: usize,
    n_classes: usize,
    noise_std: f32,
    seed: u64,
) -> Result<LabeledData, DatasetError> {
    if n_classes == 0 {
        return Err(DatasetError::InvalidParameter(
            "n_classes must be positive".into(),
        ));
    }
    let noise =
        Normal::new(0.0, noise_std).map_err(|e| DatasetError::InvalidParameter(e.to_string()))?;
    let mut rng = Pcg64Mcg::seed_from_u64(seed);

    let prototypes = (0..n_classes)
        .map(|_| {
            (0..input_size)
                .map(|_| rng.random_range(-1.0..1.0))
                .collect::<Vec<f32>>()
        })
        .collect::<Vec<_>>();

    let mut data = Vec::with_capacity(n_samples);
    let mut labels = Vec::with_capacity(n_samples);
    for i in 0..n_samples {
        let class = i % n_classes;
        data.push(
            prototypes[class]
                .iter()
                .map(|v| v + noise.sample(&mut rng))
                .collect(),
        );
        labels.push(class);
    }

    Ok((data, labels))
}

/// Plots the training loss and, when recorded, the validation loss of every report
pub fn plot_losses(history: &History, file_name: &Path) -> Result<(), Box<dyn Error>> {
    if history.reports.is_empty() {
        return Err("no training reports to plot".into());
    }

    let train = history
        .reports
        .iter()
        .enumerate()
        .map(|(i, r)| (i as f32, r.train_loss))
        .collect::<Vec<_>>();
    let validation = history
        .reports
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.validation.map(|v| (i as f32, v.loss)))
        .collect::<Vec<_>>();

    let max_loss = train
        .iter()
        .chain(validation.iter())
        .map(|(_, l)| *l)
        .filter(|l| l.is_finite())
        .fold(0.0f32, f32::max);
    let y_max = if max_loss > 0.0 { max_loss * 1.1 } else { 1.0 };
    let x_max = (history.reports.len().max(2) - 1) as f32;

    let root_area = BitMapBackend::new(file_name, (640, 480)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root_area)
        .caption("Loss per report", ("sans-serif", 40))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(40)
        .build_cartesian_2d(0.0f32..x_max, 0.0f32..y_max)?;

    chart.configure_mesh().draw()?;

    chart
        .draw_series(LineSeries::new(train, &RED))?
        .label("Training loss")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &RED));

    if !validation.is_empty() {
        chart
            .draw_series(LineSeries::new(validation, &BLUE))?
            .label("Validation loss")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &BLUE));
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;

    root_area.present()?;
    log::info!("Loss plot saved to '{}'.", file_name.display());
    Ok(())
}
