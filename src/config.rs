use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BlockError, Result};

/// Element type used for parameters and activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelDataType {
    #[default]
    F32,
    F16,
    BF16,
}

impl std::str::FromStr for ModelDataType {
    type Err = BlockError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "f32" => Ok(ModelDataType::F32),
            "f16" => Ok(ModelDataType::F16),
            "bf16" => Ok(ModelDataType::BF16),
            other => Err(BlockError::Config(format!("unknown dtype '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_dim: usize,
    pub head_dim: usize,
    pub mlp_dim: usize,
    pub n_heads: usize,
    pub p_dropout: f32,
    pub p_layerdrop: f32,
    #[serde(default)]
    pub dtype: ModelDataType,
}

impl ModelConfig {
    pub fn new(
        model_dim: usize,
        head_dim: usize,
        mlp_dim: usize,
        n_heads: usize,
        p_dropout: f32,
        p_layerdrop: f32,
    ) -> Self {
        ModelConfig {
            model_dim,
            head_dim,
            mlp_dim,
            n_heads,
            p_dropout,
            p_layerdrop,
            dtype: ModelDataType::F32,
        }
    }

    /// ViT-Base geometry expected by raw checkpoint dumps.
    pub fn vit_base() -> Self {
        ModelConfig::new(768, 768 / 12, 768 * 4, 12, 0.0, 0.0)
    }

    /// Width of the concatenated attention heads.
    pub fn inner_dim(&self) -> usize {
        self.head_dim * self.n_heads
    }

    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("model_dim", self.model_dim),
            ("head_dim", self.head_dim),
            ("mlp_dim", self.mlp_dim),
            ("n_heads", self.n_heads),
        ];
        for (name, value) in dims {
            if value == 0 {
                return Err(BlockError::Config(format!("{} must be non-zero", name)));
            }
        }
        for (name, p) in [("p_dropout", self.p_dropout), ("p_layerdrop", self.p_layerdrop)] {
            if !(0.0..=1.0).contains(&p) {
                return Err(BlockError::Config(format!("{} must be in [0, 1], got {}", name, p)));
            }
        }
        Ok(())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| BlockError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ModelConfig = serde_json::from_str(&text)
            .map_err(|e| BlockError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }
}
