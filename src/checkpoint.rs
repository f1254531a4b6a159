//! Raw little-endian f32 parameter dumps and safetensors archives.
//!
//! A raw dump is twelve files named `<prefix>.<key>.bin`, one per entry of
//! [`PARAMETER_FILES`]. Query, key and value projections are stored fused as
//! `attn.qkv.*` and split by contiguous row ranges on load.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use num_traits::Float;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tensor_core::Tensor;

use crate::attention::SelfAttention;
use crate::block::Block;
use crate::config::ModelConfig;
use crate::error::{BlockError, Result};
use crate::mlp::FeedForward;
use crate::nn::{LayerNorm, Linear};
use crate::params::Parameter;

/// Parameter keys in checkpoint read order.
pub const PARAMETER_FILES: [&str; 12] = [
    "mlp.fc1.weight",
    "mlp.fc1.bias",
    "mlp.fc2.weight",
    "mlp.fc2.bias",
    "attn.qkv.weight",
    "attn.qkv.bias",
    "attn.proj.weight",
    "attn.proj.bias",
    "norm1.weight",
    "norm1.bias",
    "norm2.weight",
    "norm2.bias",
];

/// Expected shape of every checkpoint entry, in [`PARAMETER_FILES`] order.
pub fn checkpoint_layout(config: &ModelConfig) -> Vec<(&'static str, Vec<usize>)> {
    let (d, inner, m) = (config.model_dim, config.inner_dim(), config.mlp_dim);
    let shapes = [
        vec![m, d],
        vec![m],
        vec![d, m],
        vec![d],
        vec![3 * inner, d],
        vec![3 * inner],
        vec![d, inner],
        vec![d],
        vec![d],
        vec![d],
        vec![d],
        vec![d],
    ];
    PARAMETER_FILES.into_iter().zip(shapes).collect()
}

/// `<prefix>.<key>.bin`
pub fn parameter_path(prefix: &Path, key: &str) -> PathBuf {
    let mut path = OsString::from(prefix.as_os_str());
    path.push(format!(".{}.bin", key));
    PathBuf::from(path)
}

/// Reads exactly `expected` little-endian f32 values from `path`. The
/// length is checked against the file metadata before anything is read.
pub fn read_floats(path: &Path, expected: usize) -> Result<Vec<f32>> {
    let io_err = |source| BlockError::Io { path: path.to_path_buf(), source };
    let element_count = |actual_bytes| BlockError::ElementCount {
        file: path.display().to_string(),
        expected,
        actual_bytes,
    };
    let file_len = std::fs::metadata(path).map_err(io_err)?.len();
    if file_len != expected as u64 * 4 {
        return Err(element_count(usize::try_from(file_len).unwrap_or(usize::MAX)));
    }
    let bytes = std::fs::read(path).map_err(io_err)?;
    if bytes.len() != expected * 4 {
        return Err(element_count(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

pub fn write_floats(path: &Path, values: &[f32]) -> Result<()> {
    std::fs::write(path, le_bytes(values))
        .map_err(|source| BlockError::Io { path: path.to_path_buf(), source })
}

fn le_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn get_weight(
    weights: &mut HashMap<String, Tensor<f32>>,
    name: &str,
    expected_shape: &[usize],
) -> Result<Tensor<f32>> {
    let weight = weights.remove(name).ok_or_else(|| BlockError::WeightNotFound(name.to_string()))?;
    if weight.shape != expected_shape {
        return Err(BlockError::InvalidWeightShape(format!(
            "Weight {} shape mismatch: expected {:?}, got {:?}",
            name, expected_shape, weight.shape
        )));
    }
    Ok(weight)
}

/// Stacks the parameters' rows into one f32 tensor of `shape`.
fn fuse_rows<T: Float>(parts: [&Parameter<T>; 3], shape: Vec<usize>) -> Result<Tensor<f32>> {
    let mut data = Vec::with_capacity(shape.iter().product());
    for part in parts {
        data.extend(part.tensor().cast::<f32>()?.data);
    }
    Ok(Tensor::new(data, shape)?)
}

fn qualified(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

impl Block<f32> {
    /// Loads a ViT-Base block from a raw dump at `prefix`.
    pub fn from_checkpoint(prefix: impl AsRef<Path>) -> Result<Self> {
        Block::from_checkpoint_with_config(prefix, ModelConfig::vit_base())
    }

    /// Loads a raw dump whose expected element counts follow `config`.
    /// Files are read and validated in [`PARAMETER_FILES`] order; the first
    /// failure aborts the load.
    pub fn from_checkpoint_with_config(prefix: impl AsRef<Path>, config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let prefix = prefix.as_ref();
        let mut weights = HashMap::new();
        for (key, shape) in checkpoint_layout(&config) {
            let path = parameter_path(prefix, key);
            let values = read_floats(&path, shape.iter().product())?;
            debug!("read {} ({} values)", path.display(), values.len());
            weights.insert(key.to_string(), Tensor::new(values, shape)?);
        }
        let block = Block::from_weights(config, weights)?;
        info!("loaded checkpoint {} ({} parameters)", prefix.display(), block.num_parameters());
        Ok(block)
    }

    /// Builds a frozen block from checkpoint-keyed tensors
    /// (`mlp.fc1.weight`, `attn.qkv.bias`, ...). Entries are removed by name
    /// and shape-checked; leftovers are logged and ignored.
    pub fn from_weights(config: ModelConfig, mut weights: HashMap<String, Tensor<f32>>) -> Result<Self> {
        config.validate()?;
        let (d, inner, m) = (config.model_dim, config.inner_dim(), config.mlp_dim);
        let w = &mut weights;

        let w1 = Linear::new(
            "w1",
            get_weight(w, "mlp.fc1.weight", &[m, d])?,
            get_weight(w, "mlp.fc1.bias", &[m])?,
            false,
        )?;
        let w2 = Linear::new(
            "w2",
            get_weight(w, "mlp.fc2.weight", &[d, m])?,
            get_weight(w, "mlp.fc2.bias", &[d])?,
            false,
        )?;

        let qkv_weight = get_weight(w, "attn.qkv.weight", &[3 * inner, d])?;
        let qkv_bias = get_weight(w, "attn.qkv.bias", &[3 * inner])?;
        let split = |name: &str, part: usize| -> Result<Linear<f32>> {
            let rows = (part * inner, (part + 1) * inner);
            Linear::new(
                name,
                qkv_weight.slice_rows(rows.0, rows.1)?,
                qkv_bias.slice_rows(rows.0, rows.1)?,
                false,
            )
        };
        let (wq, wk, wv) = (split("wq", 0)?, split("wk", 1)?, split("wv", 2)?);
        let wf = Linear::new(
            "wf",
            get_weight(w, "attn.proj.weight", &[d, inner])?,
            get_weight(w, "attn.proj.bias", &[d])?,
            false,
        )?;

        let mut norm1 = LayerNorm::new("norm1", d);
        norm1.set_param(0, get_weight(w, "norm1.weight", &[d])?, false)?;
        norm1.set_param(1, get_weight(w, "norm1.bias", &[d])?, false)?;
        let mut norm2 = LayerNorm::new("norm2", d);
        norm2.set_param(0, get_weight(w, "norm2.weight", &[d])?, false)?;
        norm2.set_param(1, get_weight(w, "norm2.bias", &[d])?, false)?;

        if !weights.is_empty() {
            let mut unused: Vec<&String> = weights.keys().collect();
            unused.sort();
            warn!("ignoring {} unused weights: {:?}", unused.len(), unused);
        }

        let attn = SelfAttention::from_parts(wq, wk, wv, wf, &config)?;
        let mlp = FeedForward::from_parts(w1, w2, &config)?;
        Ok(Block::from_parts(config, attn, mlp, norm1, norm2))
    }

    /// Loads the entries named `<prefix>.<key>` from a safetensors file.
    /// An empty prefix matches bare keys.
    pub fn load_safetensors(path: impl AsRef<Path>, prefix: &str, config: ModelConfig) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            std::fs::read(path).map_err(|source| BlockError::Io { path: path.to_path_buf(), source })?;
        let archive = SafeTensors::deserialize(&bytes)
            .map_err(|e| BlockError::Safetensors(format!("{}: {:?}", path.display(), e)))?;

        let mut weights = HashMap::new();
        for (name, view) in archive.tensors() {
            let key = if prefix.is_empty() {
                name.as_str()
            } else {
                match name.strip_prefix(prefix).and_then(|rest| rest.strip_prefix('.')) {
                    Some(key) => key,
                    None => {
                        debug!("skipping {} (outside prefix {})", name, prefix);
                        continue;
                    }
                }
            };
            if view.dtype() != Dtype::F32 {
                return Err(BlockError::Safetensors(format!(
                    "{} has dtype {:?}, only F32 is supported",
                    name,
                    view.dtype()
                )));
            }
            let values: Vec<f32> = view
                .data()
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            weights.insert(key.to_string(), Tensor::new(values, view.shape().to_vec())?);
        }

        let block = Block::from_weights(config, weights)?;
        info!("loaded {} from {}", if prefix.is_empty() { "block" } else { prefix }, path.display());
        Ok(block)
    }
}

impl<T: Float> Block<T> {
    /// Parameters as f32 checkpoint entries in [`PARAMETER_FILES`] order,
    /// with wq/wk/wv fused back into `attn.qkv.*`.
    pub fn checkpoint_tensors(&self) -> Result<Vec<(&'static str, Tensor<f32>)>> {
        let (d, inner) = (self.config().model_dim, self.config().inner_dim());
        let attn = &self.attn;
        let [norm1_weight, norm1_bias] = self.norm1.params();
        let [norm2_weight, norm2_bias] = self.norm2.params();
        let tensors = vec![
            self.mlp.w1.weight().tensor().cast()?,
            self.mlp.w1.bias().tensor().cast()?,
            self.mlp.w2.weight().tensor().cast()?,
            self.mlp.w2.bias().tensor().cast()?,
            fuse_rows([attn.wq.weight(), attn.wk.weight(), attn.wv.weight()], vec![3 * inner, d])?,
            fuse_rows([attn.wq.bias(), attn.wk.bias(), attn.wv.bias()], vec![3 * inner])?,
            attn.wf.weight().tensor().cast()?,
            attn.wf.bias().tensor().cast()?,
            norm1_weight.tensor().cast()?,
            norm1_bias.tensor().cast()?,
            norm2_weight.tensor().cast()?,
            norm2_bias.tensor().cast()?,
        ];
        Ok(PARAMETER_FILES.into_iter().zip(tensors).collect())
    }

    /// Writes the twelve raw files for `prefix`. Parent directories must exist.
    pub fn save_checkpoint(&self, prefix: impl AsRef<Path>) -> Result<()> {
        let prefix = prefix.as_ref();
        for (key, tensor) in self.checkpoint_tensors()? {
            let path = parameter_path(prefix, key);
            write_floats(&path, &tensor.data)?;
            debug!("wrote {} ({} values)", path.display(), tensor.data.len());
        }
        info!("saved checkpoint {}", prefix.display());
        Ok(())
    }

    /// Writes every checkpoint entry as `<prefix>.<key>` (F32) to one
    /// safetensors file.
    pub fn save_safetensors(&self, path: impl AsRef<Path>, prefix: &str) -> Result<()> {
        let path = path.as_ref();
        let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = self
            .checkpoint_tensors()?
            .into_iter()
            .map(|(key, tensor)| (qualified(prefix, key), tensor.shape, le_bytes(&tensor.data)))
            .collect();

        let mut views = Vec::with_capacity(buffers.len());
        for (name, shape, bytes) in &buffers {
            let view = TensorView::new(Dtype::F32, shape.clone(), bytes)
                .map_err(|e| BlockError::Safetensors(format!("{}: {:?}", name, e)))?;
            views.push((name.as_str(), view));
        }
        let serialized = safetensors::serialize(views, &None)
            .map_err(|e| BlockError::Safetensors(format!("{}: {:?}", path.display(), e)))?;
        std::fs::write(path, serialized)
            .map_err(|source| BlockError::Io { path: path.to_path_buf(), source })?;
        info!("saved {} tensors to {}", buffers.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::seeded;

    fn tiny() -> ModelConfig {
        ModelConfig::new(4, 2, 8, 2, 0.0, 0.0)
    }

    #[test]
    fn layout_matches_vit_base_counts() {
        let counts: Vec<usize> = checkpoint_layout(&ModelConfig::vit_base())
            .into_iter()
            .map(|(_, s)| s.iter().product())
            .collect();
        assert_eq!(
            counts,
            vec![3072 * 768, 3072, 768 * 3072, 768, 2304 * 768, 2304, 768 * 768, 768, 768, 768, 768, 768]
        );
    }

    #[test]
    fn parameter_path_appends_key() {
        let p = parameter_path(Path::new("/tmp/ckpt/blocks.0"), "attn.qkv.weight");
        assert_eq!(p, PathBuf::from("/tmp/ckpt/blocks.0.attn.qkv.weight.bin"));
    }

    #[test]
    fn read_floats_decodes_little_endian() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bin");
        std::fs::write(&path, [0x00, 0x00, 0x80, 0x3f, 0x00, 0x00, 0x00, 0xc0]).unwrap();
        assert_eq!(read_floats(&path, 2).unwrap(), vec![1.0, -2.0]);
    }

    #[test]
    fn read_floats_rejects_wrong_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bin");
        write_floats(&path, &[1.0, 2.0, 3.0]).unwrap();
        match read_floats(&path, 4).unwrap_err() {
            BlockError::ElementCount { file, expected, actual_bytes } => {
                assert!(file.ends_with("x.bin"));
                assert_eq!((expected, actual_bytes), (4, 12));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn read_floats_rejects_oversized_file_from_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let file = std::fs::File::create(&path).unwrap();
        // sparse 1 GiB file; only its metadata is consulted
        file.set_len(1 << 30).unwrap();
        match read_floats(&path, 16).unwrap_err() {
            BlockError::ElementCount { expected, actual_bytes, .. } => {
                assert_eq!((expected, actual_bytes), (16, 1 << 30));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn read_floats_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_floats(&dir.path().join("absent.bin"), 4).unwrap_err();
        assert!(matches!(err, BlockError::Io { .. }));
    }

    #[test]
    fn from_weights_reports_missing_entry() {
        let block = Block::<f32>::new(tiny(), &mut seeded(61)).unwrap();
        let mut weights: HashMap<String, Tensor<f32>> = block
            .checkpoint_tensors()
            .unwrap()
            .into_iter()
            .map(|(k, t)| (k.to_string(), t))
            .collect();
        weights.remove("norm2.bias");
        let err = Block::from_weights(tiny(), weights).unwrap_err();
        assert!(matches!(err, BlockError::WeightNotFound(ref n) if n == "norm2.bias"));
    }

    #[test]
    fn from_weights_rejects_transposed_projection() {
        let block = Block::<f32>::new(tiny(), &mut seeded(62)).unwrap();
        let mut weights: HashMap<String, Tensor<f32>> = block
            .checkpoint_tensors()
            .unwrap()
            .into_iter()
            .map(|(k, t)| (k.to_string(), t))
            .collect();
        let fc1 = weights.remove("mlp.fc1.weight").unwrap();
        weights.insert("mlp.fc1.weight".into(), fc1.transpose().unwrap());
        let err = Block::from_weights(tiny(), weights).unwrap_err();
        assert!(matches!(err, BlockError::InvalidWeightShape(_)));
    }

    #[test]
    fn checkpoint_tensors_fuse_qkv_rows() {
        let block = Block::<f32>::new(tiny(), &mut seeded(63)).unwrap();
        let tensors = block.checkpoint_tensors().unwrap();
        let names: Vec<&str> = tensors.iter().map(|(k, _)| *k).collect();
        assert_eq!(names, PARAMETER_FILES);
        let (_, qkv) = &tensors[4];
        assert_eq!(qkv.shape, vec![12, 4]);
        assert_eq!(&qkv.slice_rows(4, 8).unwrap(), block.attention().wk.weight().tensor());
    }
}
