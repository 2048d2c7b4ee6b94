use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use ndarray::{Array3, Axis};
use tracing::{Level, debug, info, span};

use super::model::{ModelLocation, Network, OnnxNet, resolve_model_file};
use crate::config::{Config, ModelKind};
use crate::error::BridgeError;
use crate::marshal::{self, PixelArray};

/// FaceNet embedding extraction over serialized pixel buffers.
pub struct FacenetBridge {
    location: ModelLocation,
    threads: usize,
    net: Option<Box<dyn Network>>,
}

impl FacenetBridge {
    /// The model path is looked up by `init`, not here.
    pub fn new(config: &Config) -> FacenetBridge {
        FacenetBridge {
            location: ModelLocation::Configured(config.clone()),
            threads: config.inference.threads,
            net: None,
        }
    }

    pub fn with_model_path(model_path: impl Into<PathBuf>, threads: usize) -> FacenetBridge {
        FacenetBridge {
            location: ModelLocation::Path(model_path.into()),
            threads,
            net: None,
        }
    }

    /// An already initialized bridge over any network.
    pub fn with_net(net: Box<dyn Network>) -> FacenetBridge {
        FacenetBridge {
            location: ModelLocation::Path(PathBuf::new()),
            threads: 1,
            net: Some(net),
        }
    }

    pub fn model_path(&self) -> Result<PathBuf> {
        self.location.resolve(ModelKind::Facenet)
    }

    pub fn is_initialized(&self) -> bool {
        self.net.is_some()
    }

    pub fn init(&mut self) -> Result<()> {
        if self.net.is_some() {
            return Ok(());
        }

        let start = Instant::now();
        let file = resolve_model_file(&self.model_path()?)?;
        self.net = Some(Box::new(OnnxNet::load(&file, self.threads, 1)?));

        info!("facenet init() cost {} milliseconds", start.elapsed().as_millis());
        Ok(())
    }

    pub fn close(&mut self) {
        self.net = None;
    }

    pub fn embedding(
        &mut self,
        image_base64: &str,
        row: usize,
        col: usize,
        depth: usize,
    ) -> Result<Vec<f32>> {
        let image = marshal::base64_to_image(image_base64, row, col, depth)?;
        self.embedding_image(&image)
    }

    pub fn embedding_image(&mut self, image: &PixelArray) -> Result<Vec<f32>> {
        let span = span!(Level::DEBUG, "facenet_bridge");
        let _guard = span.enter();

        let net = self
            .net
            .as_deref_mut()
            .ok_or(BridgeError::NotInitialized("FacenetBridge"))?;
        embed(net, image)
    }
}

/// Feeds one prewhitened RGB image as a batch of one and returns the first
/// row of the first output.
pub fn embed(net: &mut dyn Network, image: &PixelArray) -> Result<Vec<f32>> {
    // gray to rgb, get rid of an alpha channel if any
    let rgb = marshal::to_rgb(image)?;
    let whitened = prewhiten(&rgb.mapv(f32::from));
    let input = whitened.insert_axis(Axis(0));
    debug!("embedding input {:?}", input.shape());

    let outputs = net.forward(input)?;
    let embeddings = outputs.first().context("network returned no output")?;

    let dim = *embeddings.shape().last().context("scalar embedding output")?;
    // the only row
    Ok(embeddings.iter().take(dim).copied().collect())
}

/// Zero mean, unit variance, with the deviation floored at `1/sqrt(n)`.
pub fn prewhiten(x: &Array3<f32>) -> Array3<f32> {
    let n = x.len().max(1) as f32;
    let mean = x.sum() / n;
    let variance = x.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    let std_adj = variance.sqrt().max(1. / n.sqrt());
    x.mapv(|v| (v - mean) / std_adj)
}
