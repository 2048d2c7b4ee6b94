use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::{Array4, ArrayD};
use ort::execution_providers;
use ort::session::builder::GraphOptimizationLevel;
pub use ort::session::Session;
use ort::value::Tensor;
use tracing::debug;

use crate::config::{Config, ModelKind};
use crate::error::BridgeError;

/// A loaded network: a batch of `f32` images in, its outputs in declared
/// order out.
pub trait Network {
    fn forward(&mut self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>>;
}

/// An ONNX graph fed through its first input.
pub struct OnnxNet {
    model: Session,
    io: IoNames,
}

impl OnnxNet {
    pub fn load(path: &Path, threads: usize, outputs: usize) -> Result<OnnxNet> {
        if !path.exists() {
            return Err(BridgeError::ModelNotFound(path.to_path_buf()).into());
        }
        let model = initialize_model(path, threads)?;
        let io = IoNames::of(&model, outputs)?;
        Ok(OnnxNet { model, io })
    }
}

impl Network for OnnxNet {
    fn forward(&mut self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>> {
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .model
            .run(ort::inputs![self.io.input.as_str() => tensor]?)?;

        let mut result = Vec::with_capacity(self.io.outputs.len());
        for name in &self.io.outputs {
            result.push(outputs[name.as_str()].try_extract_tensor::<f32>()?.into_owned());
        }
        Ok(result)
    }
}

/// Where a bridge finds its model. Configured locations are looked up at
/// `init`, so a missing model only fails the bridge that needs it.
#[derive(Debug, Clone)]
pub enum ModelLocation {
    Path(PathBuf),
    Configured(Config),
}

impl ModelLocation {
    pub fn resolve(&self, kind: ModelKind) -> Result<PathBuf> {
        match self {
            ModelLocation::Path(path) => Ok(path.clone()),
            ModelLocation::Configured(config) => config.model_path(kind),
        }
    }
}

pub fn initialize_model(model_file_path: &Path, threads: usize) -> Result<Session> {
    ort::init()
        .with_execution_providers([execution_providers::XNNPACKExecutionProvider::default()
            .build()
            .error_on_failure()])
        .commit()?;

    let model = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(threads.max(1))?
        .commit_from_file(model_file_path)
        .with_context(|| format!("loading model {model_file_path:?}"))?;

    debug!(
        "loaded {model_file_path:?}: inputs {:?}, outputs {:?}",
        model.inputs.iter().map(|i| &i.name).collect::<Vec<_>>(),
        model.outputs.iter().map(|o| &o.name).collect::<Vec<_>>()
    );

    Ok(model)
}

/// A file path is used as is, a directory must hold exactly one `.onnx` model.
pub fn resolve_model_file(path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        return Err(BridgeError::ModelNotFound(path.to_path_buf()).into());
    }
    if path.is_file() {
        return Ok(path.to_path_buf());
    }

    let mut candidates: Vec<PathBuf> = fs::read_dir(path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "onnx"))
        .collect();

    match candidates.len() {
        0 => Err(BridgeError::ModelFile {
            dir: path.to_path_buf(),
            reason: "no .onnx file found".into(),
        }
        .into()),
        1 => Ok(candidates.remove(0)),
        n => Err(BridgeError::ModelFile {
            dir: path.to_path_buf(),
            reason: format!("there should not be more than one .onnx file (found {n})"),
        }
        .into()),
    }
}

/// Input name and ordered output names of a loaded session.
#[derive(Debug, Clone)]
pub struct IoNames {
    pub input: String,
    pub outputs: Vec<String>,
}

impl IoNames {
    pub fn of(model: &Session, expected_outputs: usize) -> Result<IoNames> {
        let input = model
            .inputs
            .first()
            .map(|i| i.name.clone())
            .context("model has no inputs")?;
        let outputs: Vec<String> = model.outputs.iter().map(|o| o.name.clone()).collect();
        if outputs.len() < expected_outputs {
            anyhow::bail!(
                "model has {} outputs, expected {expected_outputs}",
                outputs.len()
            );
        }
        Ok(IoNames { input, outputs })
    }
}

/// Records its inputs and answers with whatever `respond` builds from the
/// input shape.
#[cfg(test)]
pub(crate) struct FakeNet {
    pub inputs: Vec<Array4<f32>>,
    respond: fn(&[usize]) -> Vec<ArrayD<f32>>,
}

#[cfg(test)]
impl FakeNet {
    pub fn new(respond: fn(&[usize]) -> Vec<ArrayD<f32>>) -> FakeNet {
        FakeNet {
            inputs: Vec::new(),
            respond,
        }
    }

    pub fn shapes(&self) -> Vec<Vec<usize>> {
        self.inputs.iter().map(|i| i.shape().to_vec()).collect()
    }
}

#[cfg(test)]
impl Network for FakeNet {
    fn forward(&mut self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>> {
        let out = (self.respond)(input.shape());
        self.inputs.push(input);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn directory_with_single_model() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("20180402-114759.onnx"), b"").unwrap();
        fs::write(dir.path().join("README.txt"), b"").unwrap();
        let file = resolve_model_file(dir.path()).unwrap();
        assert_eq!(file, dir.path().join("20180402-114759.onnx"));
    }

    #[test]
    fn directory_without_or_with_many_models() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            resolve_model_file(dir.path()).unwrap_err().downcast_ref::<BridgeError>(),
            Some(BridgeError::ModelFile { .. })
        ));

        fs::write(dir.path().join("a.onnx"), b"").unwrap();
        fs::write(dir.path().join("b.onnx"), b"").unwrap();
        assert!(matches!(
            resolve_model_file(dir.path()).unwrap_err().downcast_ref::<BridgeError>(),
            Some(BridgeError::ModelFile { .. })
        ));
    }

    #[test]
    fn explicit_location_is_not_checked_until_load() {
        let location = ModelLocation::Path("/not/yet/there".into());
        assert_eq!(
            location.resolve(ModelKind::Facenet).unwrap(),
            PathBuf::from("/not/yet/there")
        );
        let err = OnnxNet::load(Path::new("/not/yet/there"), 1, 1).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<BridgeError>(),
            Some(BridgeError::ModelNotFound(_))
        ));
    }

    #[test]
    fn configured_location_resolves_lazily() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.models.facenet = Some(dir.path().join("facenet.onnx"));
        let location = ModelLocation::Configured(config);

        // unset env only; a set FACENET_MODEL wins over the config file
        if std::env::var(ModelKind::Facenet.env_var()).is_err() {
            assert!(location.resolve(ModelKind::Facenet).is_err());
            fs::write(dir.path().join("facenet.onnx"), b"").unwrap();
            assert_eq!(
                location.resolve(ModelKind::Facenet).unwrap(),
                dir.path().join("facenet.onnx")
            );
        }
    }

    #[test]
    fn missing_path() {
        let err = resolve_model_file(Path::new("/definitely/not/here.onnx")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BridgeError>(),
            Some(BridgeError::ModelNotFound(_))
        ));
    }
}
