//! Bridge configuration and model path resolution.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::error::BridgeError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const INPUT_FACE_SIZE: u32 = 160;
pub const EMBEDDING_DIM: usize = 128;

pub const FACENET_MODEL_ENV: &str = "FACENET_MODEL";
pub const MTCNN_MODEL_ENV: &str = "MTCNN_MODEL";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub models: ModelsConfig,
    pub mtcnn: MtcnnConfig,
    pub inference: InferenceConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub facenet: Option<PathBuf>,
    pub mtcnn: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MtcnnConfig {
    /// minimum size of face
    pub min_size: f32,
    /// per stage thresholds
    pub thresholds: [f32; 3],
    /// scale factor of the image pyramid
    pub factor: f32,
}

impl Default for MtcnnConfig {
    fn default() -> Self {
        Self {
            min_size: 20.,
            thresholds: [0.6, 0.7, 0.7],
            factor: 0.709,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub threads: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            threads: num_cpus::get(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Facenet,
    Mtcnn,
}

impl ModelKind {
    pub fn env_var(self) -> &'static str {
        match self {
            ModelKind::Facenet => FACENET_MODEL_ENV,
            ModelKind::Mtcnn => MTCNN_MODEL_ENV,
        }
    }

    fn metadata_key(self) -> &'static str {
        match self {
            ModelKind::Facenet => "model-path",
            ModelKind::Mtcnn => "mtcnn-model-path",
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).with_context(|| format!("reading config {path:?}"))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn model_path(&self, kind: ModelKind) -> Result<PathBuf> {
        let configured = match kind {
            ModelKind::Facenet => self.models.facenet.as_deref(),
            ModelKind::Mtcnn => self.models.mtcnn.as_deref(),
        };
        resolve_model_path(
            kind,
            env::var(kind.env_var()).ok(),
            configured,
            &module_root(),
        )
    }
}

/// Env override first, then the config file, then the crate manifest metadata.
pub fn resolve_model_path(
    kind: ModelKind,
    env_value: Option<String>,
    configured: Option<&Path>,
    root: &Path,
) -> Result<PathBuf> {
    if let Some(v) = env_value.filter(|v| !v.is_empty()) {
        debug!("{} from env: {v}", kind.env_var());
        return Ok(PathBuf::from(v));
    }

    let model_path = match configured {
        Some(p) => root.join(p),
        None => {
            let relative = manifest_model_path(root, kind)?;
            root.join(relative)
        }
    };

    if !model_path.exists() {
        return Err(BridgeError::ModelNotFound(model_path).into());
    }

    Ok(model_path)
}

fn manifest_model_path(root: &Path, kind: ModelKind) -> Result<PathBuf> {
    let manifest = root.join("Cargo.toml");
    let content =
        fs::read_to_string(&manifest).with_context(|| format!("reading {manifest:?}"))?;
    let doc: toml::Table = toml::from_str(&content)?;

    let value = doc
        .get("package")
        .and_then(|p| p.get("metadata"))
        .and_then(|m| m.get("facenet"))
        .and_then(|f| f.get(kind.metadata_key()))
        .and_then(|v| v.as_str())
        .with_context(|| {
            format!(
                "{manifest:?} has no package.metadata.facenet.{}",
                kind.metadata_key()
            )
        })?;

    Ok(PathBuf::from(value))
}

/// Directory holding the crate manifest and `models/`.
pub fn module_root() -> PathBuf {
    let from_exe = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(module_root_from));

    match from_exe {
        Some(root) if root.join("Cargo.toml").exists() => root,
        _ => PathBuf::from(env!("CARGO_MANIFEST_DIR")),
    }
}

/// Binaries live under `<root>/target/<profile>[/deps]`.
pub fn module_root_from(dir: &Path) -> PathBuf {
    dir.ancestors()
        .find(|a| a.file_name().is_some_and(|n| n == "target"))
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| dir.to_path_buf())
}
