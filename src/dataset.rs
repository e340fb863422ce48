//! Dataset loading, batching and batch counting.
//!
//! # On-disk layout
//!
//! ```text
//! <dataset_dir>/train/<category>/<subset>.safetensors
//! <dataset_dir>/val/<category>/<subset>.safetensors
//! <test_dataset_dir>/<category>.safetensors            (or <category>/<subset>.safetensors)
//! ```
//!
//! Every file holds three aligned tensors:
//!
//! | name       | shape               | meaning                      |
//! |------------|---------------------|------------------------------|
//! | `inputs`   | `[S, 1, H+2k, W+2k]`| block plus reference border  |
//! | `labels`   | `[S, 1, H, W]`      | block to predict             |
//! | `baseline` | `[S]`               | cost of the baseline decision|
//!
//! Categories and subsets are iterated in sorted name order; the position of
//! a subset in that order is the branch it trains during the targeted phase.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};

use crate::error::{CompeteError, Result};

const SAMPLE_EXTENSION: &str = "safetensors";

/// Aligned input/label/baseline tensors for one set of samples.
#[derive(Debug, Clone)]
pub struct BlockSamples {
    inputs: Tensor,
    labels: Tensor,
    baseline: Tensor,
}

/// One batch, materialized per iteration and dropped afterwards.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[B, 1, H+2k, W+2k]`
    pub inputs: Tensor,
    /// `[B, 1, H, W]`
    pub labels: Tensor,
    /// `[B]`
    pub baseline: Tensor,
}

impl Batch {
    /// Number of samples in the batch.
    pub fn len(&self) -> usize {
        self.baseline.dims().first().copied().unwrap_or(0)
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockSamples {
    /// Build from tensors, checking that they are aligned by sample index.
    pub fn new(inputs: Tensor, labels: Tensor, baseline: Tensor) -> Result<Self> {
        let (n_in, c_in, _, _) = inputs.dims4()?;
        let (n_lbl, c_lbl, _, _) = labels.dims4()?;
        let n_base = baseline.dims1()?;
        if n_in != n_lbl || n_in != n_base {
            return Err(CompeteError::dataset(format!(
                "misaligned samples: {n_in} inputs, {n_lbl} labels, {n_base} baseline costs"
            )));
        }
        if c_in != 1 || c_lbl != 1 {
            return Err(CompeteError::dataset(format!(
                "expected single-channel blocks, got {c_in} input and {c_lbl} label channels"
            )));
        }
        Ok(Self {
            inputs: inputs.to_dtype(DType::F32)?,
            labels: labels.to_dtype(DType::F32)?,
            baseline: baseline.to_dtype(DType::F32)?,
        })
    }

    /// Load a sample file.
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let mut tensors = candle_core::safetensors::load(path, device)?;
        let mut take = |name: &str| {
            tensors.remove(name).ok_or_else(|| {
                CompeteError::dataset(format!("{} has no `{name}` tensor", path.display()))
            })
        };
        let inputs = take("inputs")?;
        let labels = take("labels")?;
        let baseline = take("baseline")?;
        Self::new(inputs, labels, baseline)
    }

    /// Write a sample file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tensors = HashMap::from([
            ("inputs".to_string(), self.inputs.clone()),
            ("labels".to_string(), self.labels.clone()),
            ("baseline".to_string(), self.baseline.clone()),
        ]);
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    /// Concatenate sample sets along the sample axis, in order.
    pub fn concat(parts: &[&BlockSamples]) -> Result<Self> {
        if parts.is_empty() {
            return Err(CompeteError::dataset("cannot concatenate zero sample sets"));
        }
        let inputs: Vec<&Tensor> = parts.iter().map(|p| &p.inputs).collect();
        let labels: Vec<&Tensor> = parts.iter().map(|p| &p.labels).collect();
        let baseline: Vec<&Tensor> = parts.iter().map(|p| &p.baseline).collect();
        Self::new(
            Tensor::cat(&inputs, 0)?,
            Tensor::cat(&labels, 0)?,
            Tensor::cat(&baseline, 0)?,
        )
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.baseline.dims()[0]
    }

    /// Whether there are no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of batches of `batch_size`, the last one possibly partial.
    pub fn num_batches(&self, batch_size: usize) -> usize {
        if batch_size == 0 {
            return 0;
        }
        self.len().div_ceil(batch_size)
    }

    /// Batch `index` of size `batch_size`, or `None` past the end.
    pub fn batch(&self, index: usize, batch_size: usize) -> Result<Option<Batch>> {
        let start = index.saturating_mul(batch_size);
        if batch_size == 0 || start >= self.len() {
            return Ok(None);
        }
        let len = batch_size.min(self.len() - start);
        Ok(Some(Batch {
            inputs: self.inputs.narrow(0, start, len)?,
            labels: self.labels.narrow(0, start, len)?,
            baseline: self.baseline.narrow(0, start, len)?,
        }))
    }

    /// Baseline costs as host values.
    pub fn baseline_costs(&self) -> Result<Vec<f32>> {
        Ok(self.baseline.to_vec1::<f32>()?)
    }
}

/// Fractional subsets of one category, by subset name.
pub type Subsets = BTreeMap<String, BlockSamples>;

/// Category -> subset -> samples.
pub type SharedSplit = BTreeMap<String, Subsets>;

/// Category -> samples, all subsets merged.
pub type CombinedSplit = BTreeMap<String, BlockSamples>;

/// Training and validation data keyed by category then fractional subset.
#[derive(Debug, Clone, Default)]
pub struct SharedData {
    /// Training split.
    pub train: SharedSplit,
    /// Validation split.
    pub val: SharedSplit,
}

/// Training and validation data keyed by category only.
#[derive(Debug, Clone, Default)]
pub struct CombinedData {
    /// Training split.
    pub train: CombinedSplit,
    /// Validation split.
    pub val: CombinedSplit,
}

/// Read the `train/` and `val/` splits, keyed by category then subset.
pub fn read_shared_data(dataset_dir: &Path, batch_size: usize, device: &Device) -> Result<SharedData> {
    if !dataset_dir.is_dir() {
        return Err(CompeteError::dataset(format!(
            "dataset not found: {}",
            dataset_dir.display()
        )));
    }
    let train = read_split(&dataset_dir.join("train"), device)?;
    let val = read_split(&dataset_dir.join("val"), device)?;

    for (category, subsets) in &train {
        let samples: usize = subsets.values().map(BlockSamples::len).sum();
        tracing::info!(
            "Category {}: {} subsets, {} training samples, up to {} batches per subset",
            category,
            subsets.len(),
            samples,
            subsets.batch_count(batch_size)
        );
    }

    Ok(SharedData { train, val })
}

/// Merge every category's subsets into one sample set, in subset order.
pub fn read_combined_data(shared: &SharedData) -> Result<CombinedData> {
    Ok(CombinedData {
        train: combine_split(&shared.train)?,
        val: combine_split(&shared.val)?,
    })
}

/// Read the test split, keyed by category.
///
/// A category is either a single `<category>.safetensors` file or a
/// directory of subset files that get merged.
pub fn read_combined_testdata(test_dataset_dir: &Path, device: &Device) -> Result<CombinedSplit> {
    if !test_dataset_dir.is_dir() {
        return Err(CompeteError::dataset(format!(
            "test dataset not found: {}",
            test_dataset_dir.display()
        )));
    }

    let mut out = CombinedSplit::new();
    for path in sorted_entries(test_dataset_dir)? {
        if path.is_dir() {
            let subsets = read_subsets(&path, device)?;
            if subsets.is_empty() {
                continue;
            }
            let parts: Vec<&BlockSamples> = subsets.values().collect();
            out.insert(entry_name(&path)?, BlockSamples::concat(&parts)?);
        } else if is_sample_file(&path) {
            out.insert(entry_name(&path)?, BlockSamples::load(&path, device)?);
        }
    }

    if out.is_empty() {
        return Err(CompeteError::dataset(format!(
            "no test samples in {}",
            test_dataset_dir.display()
        )));
    }
    Ok(out)
}

/// Anything that can report how many batches it yields.
pub trait BatchCount {
    /// Number of batches of `batch_size`.
    fn batch_count(&self, batch_size: usize) -> usize;
}

impl BatchCount for BlockSamples {
    fn batch_count(&self, batch_size: usize) -> usize {
        self.num_batches(batch_size)
    }
}

/// Nested: batch indices run up to the largest subset; smaller subsets
/// simply have no batch at the higher indices.
impl BatchCount for Subsets {
    fn batch_count(&self, batch_size: usize) -> usize {
        self.values()
            .map(|s| s.num_batches(batch_size))
            .max()
            .unwrap_or(0)
    }
}

/// Batch counts per category for the training and validation splits.
///
/// With nested splits ([`SharedSplit`]) the count is per subset.
pub fn calculate_batch_number<T: BatchCount>(
    train: &BTreeMap<String, T>,
    val: &BTreeMap<String, T>,
    batch_size: usize,
) -> (BTreeMap<String, usize>, BTreeMap<String, usize>) {
    let count = |split: &BTreeMap<String, T>| {
        split
            .iter()
            .map(|(k, v)| (k.clone(), v.batch_count(batch_size)))
            .collect()
    };
    (count(train), count(val))
}

fn combine_split(split: &SharedSplit) -> Result<CombinedSplit> {
    split
        .iter()
        .filter(|(_, subsets)| !subsets.is_empty())
        .map(|(category, subsets)| {
            let parts: Vec<&BlockSamples> = subsets.values().collect();
            Ok((category.clone(), BlockSamples::concat(&parts)?))
        })
        .collect()
}

fn read_split(dir: &Path, device: &Device) -> Result<SharedSplit> {
    if !dir.is_dir() {
        return Err(CompeteError::dataset(format!(
            "split directory not found: {}",
            dir.display()
        )));
    }
    let mut split = SharedSplit::new();
    for path in sorted_entries(dir)? {
        if !path.is_dir() {
            continue;
        }
        let subsets = read_subsets(&path, device)?;
        if subsets.is_empty() {
            tracing::warn!("Skipping empty category directory {}", path.display());
            continue;
        }
        split.insert(entry_name(&path)?, subsets);
    }
    if split.is_empty() {
        return Err(CompeteError::dataset(format!(
            "no categories in {}",
            dir.display()
        )));
    }
    Ok(split)
}

fn read_subsets(dir: &Path, device: &Device) -> Result<Subsets> {
    let mut subsets = Subsets::new();
    for path in sorted_entries(dir)? {
        if is_sample_file(&path) {
            subsets.insert(entry_name(&path)?, BlockSamples::load(&path, device)?);
        }
    }
    Ok(subsets)
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

fn is_sample_file(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|e| e == SAMPLE_EXTENSION)
}

fn entry_name(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_owned)
        .ok_or_else(|| CompeteError::dataset(format!("bad entry name: {}", path.display())))
}
