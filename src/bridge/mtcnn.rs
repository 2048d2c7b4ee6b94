use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use boxes::{Candidate, NmsMethod, nms, pad, scale_pyramid, select};
use image::RgbImage;
use image::imageops::{self, FilterType};
use ndarray::{Array4, ArrayD, ArrayView2, Ix2, Ix4, s};
use tracing::{Level, debug, info, span, trace};

use super::model::{ModelLocation, Network, OnnxNet};
use crate::config::{Config, ModelKind, MtcnnConfig};
use crate::error::BridgeError;
use crate::marshal::{self, PixelArray};

pub mod boxes;

const PNET_FILE: &str = "det1.onnx";
const RNET_FILE: &str = "det2.onnx";
const ONET_FILE: &str = "det3.onnx";

const RNET_SIZE: u32 = 24;
const ONET_SIZE: u32 = 48;

/// The three cascade networks. Each takes a batch of transposed
/// `[n, x, y, c]` images.
pub struct Nets {
    pub pnet: Box<dyn Network>,
    pub rnet: Box<dyn Network>,
    pub onet: Box<dyn Network>,
}

/// Faces found by the cascade.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    /// `[x0, y0, x1, y1, score]`
    pub boxes: Vec<[f32; 5]>,
    /// per face: 5 x coordinates then 5 y coordinates
    pub points: Vec<[f32; 10]>,
}

impl Detection {
    /// Landmarks as 10 rows with one column per face.
    pub fn landmark_rows(&self) -> Vec<Vec<f32>> {
        (0..10)
            .map(|row| self.points.iter().map(|p| p[row]).collect())
            .collect()
    }
}

/// MTCNN face alignment over serialized pixel buffers.
pub struct MtcnnBridge {
    location: ModelLocation,
    threads: usize,
    pub config: MtcnnConfig,
    nets: Option<Nets>,
}

impl MtcnnBridge {
    /// The model directory is looked up by `init`, not here.
    pub fn new(config: &Config) -> MtcnnBridge {
        MtcnnBridge {
            location: ModelLocation::Configured(config.clone()),
            threads: config.inference.threads,
            config: config.mtcnn.clone(),
            nets: None,
        }
    }

    pub fn with_model_dir(model_dir: impl Into<PathBuf>, threads: usize) -> MtcnnBridge {
        MtcnnBridge {
            location: ModelLocation::Path(model_dir.into()),
            threads,
            config: MtcnnConfig::default(),
            nets: None,
        }
    }

    /// An already initialized bridge over any three networks.
    pub fn with_nets(nets: Nets, config: MtcnnConfig) -> MtcnnBridge {
        MtcnnBridge {
            location: ModelLocation::Path(PathBuf::new()),
            threads: 1,
            config,
            nets: Some(nets),
        }
    }

    pub fn model_dir(&self) -> Result<PathBuf> {
        self.location.resolve(ModelKind::Mtcnn)
    }

    pub fn is_initialized(&self) -> bool {
        self.nets.is_some()
    }

    pub fn init(&mut self) -> Result<()> {
        if self.nets.is_some() {
            return Ok(());
        }

        let start = Instant::now();
        let dir = self.model_dir()?;
        let nets = Nets {
            pnet: Box::new(OnnxNet::load(&dir.join(PNET_FILE), self.threads, 2)?),
            rnet: Box::new(OnnxNet::load(&dir.join(RNET_FILE), self.threads, 2)?),
            onet: Box::new(OnnxNet::load(&dir.join(ONET_FILE), self.threads, 3)?),
        };
        self.nets = Some(nets);

        info!("mtcnn init() cost {} milliseconds", start.elapsed().as_millis());
        Ok(())
    }

    pub fn close(&mut self) {
        self.nets = None;
    }

    /// Bounding boxes and the 10 x N landmark matrix, unrounded.
    pub fn align(
        &mut self,
        image_base64: &str,
        row: usize,
        col: usize,
        depth: usize,
    ) -> Result<(Vec<[f32; 5]>, Vec<Vec<f32>>)> {
        let image = marshal::base64_to_image(image_base64, row, col, depth)?;
        let detection = self.align_image(&image)?;
        let rows = detection.landmark_rows();
        Ok((detection.boxes, rows))
    }

    pub fn align_image(&mut self, image: &PixelArray) -> Result<Detection> {
        let span = span!(Level::DEBUG, "mtcnn_bridge");
        let _guard = span.enter();

        let nets = self
            .nets
            .as_mut()
            .ok_or(BridgeError::NotInitialized("MtcnnBridge"))?;

        // get rid of alpha channel (if any)
        let img = marshal::array_to_rgb(image)?;
        detect_face(
            &img,
            &self.config,
            &mut *nets.pnet,
            &mut *nets.rnet,
            &mut *nets.onet,
        )
    }
}

fn normalize(v: u8) -> f32 {
    (v as f32 - 127.5) * 0.0078125
}

fn output(outputs: &[ArrayD<f32>], idx: usize) -> Result<&ArrayD<f32>> {
    outputs
        .get(idx)
        .with_context(|| format!("missing network output {idx}"))
}

fn rows(outputs: &[ArrayD<f32>], idx: usize) -> Result<ArrayView2<'_, f32>> {
    Ok(output(outputs, idx)?.view().into_dimensionality::<Ix2>()?)
}

/// Runs the three stage cascade on an RGB image.
pub fn detect_face(
    img: &RgbImage,
    config: &MtcnnConfig,
    pnet: &mut dyn Network,
    rnet: &mut dyn Network,
    onet: &mut dyn Network,
) -> Result<Detection> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let [t0, t1, t2] = config.thresholds;

    // first stage
    let mut total: Vec<Candidate> = Vec::new();
    for scale in scale_pyramid(h, w, config.min_size, config.factor) {
        let hs = (h as f32 * scale).ceil() as u32;
        let ws = (w as f32 * scale).ceil() as u32;
        let resized = imageops::resize(img, ws, hs, FilterType::Triangle);
        let input = Array4::from_shape_fn((1, ws as usize, hs as usize, 3), |(_, x, y, c)| {
            normalize(resized.get_pixel(x as u32, y as u32)[c])
        });

        let out = pnet.forward(input)?;
        let reg = output(&out, 0)?.view().into_dimensionality::<Ix4>()?;
        let prob = output(&out, 1)?.view().into_dimensionality::<Ix4>()?;

        let found = boxes::generate_bounding_boxes(
            prob.slice(s![0, .., .., 1]),
            reg.slice(s![0, .., .., ..]),
            scale,
            t0,
        );
        let pick = nms(&found, 0.5, NmsMethod::Union);
        trace!("scale {scale}: {} candidates, {} kept", found.len(), pick.len());
        total.extend(select(&found, &pick));
    }

    if total.is_empty() {
        return Ok(Detection::default());
    }

    let pick = nms(&total, 0.7, NmsMethod::Union);
    let mut total = select(&total, &pick);
    for b in total.iter_mut() {
        b.regress(b.reg, 0.);
        b.rerec();
        b.fix();
    }
    debug!("stage 1: {} boxes", total.len());

    // second stage
    let (input, total) = crop_batch(img, &total, RNET_SIZE);
    if total.is_empty() {
        return Ok(Detection::default());
    }
    let out = rnet.forward(input)?;
    let reg = rows(&out, 0)?;
    let prob = rows(&out, 1)?;

    let mut passed = Vec::new();
    for (k, b) in total.iter().enumerate() {
        let score = prob[[k, 1]];
        if score > t1 {
            let mut c = Candidate::new(b.x1, b.y1, b.x2, b.y2, score);
            c.reg = [reg[[k, 0]], reg[[k, 1]], reg[[k, 2]], reg[[k, 3]]];
            passed.push(c);
        }
    }
    if passed.is_empty() {
        return Ok(Detection::default());
    }

    let pick = nms(&passed, 0.7, NmsMethod::Union);
    let mut total = select(&passed, &pick);
    for b in total.iter_mut() {
        b.regress(b.reg, 1.);
        b.rerec();
    }
    debug!("stage 2: {} boxes", total.len());

    // third stage
    for b in total.iter_mut() {
        b.fix();
    }
    let (input, total) = crop_batch(img, &total, ONET_SIZE);
    if total.is_empty() {
        return Ok(Detection::default());
    }
    let out = onet.forward(input)?;
    let reg = rows(&out, 0)?;
    let landmarks = rows(&out, 1)?;
    let prob = rows(&out, 2)?;

    let mut passed = Vec::new();
    let mut points = Vec::new();
    for (k, b) in total.iter().enumerate() {
        let score = prob[[k, 1]];
        if score <= t2 {
            continue;
        }

        let bw = b.x2 - b.x1 + 1.;
        let bh = b.y2 - b.y1 + 1.;
        let mut p = [0f32; 10];
        for i in 0..5 {
            p[i] = bw * landmarks[[k, i]] + b.x1 - 1.;
            p[i + 5] = bh * landmarks[[k, i + 5]] + b.y1 - 1.;
        }

        let mut c = Candidate::new(b.x1, b.y1, b.x2, b.y2, score);
        c.regress([reg[[k, 0]], reg[[k, 1]], reg[[k, 2]], reg[[k, 3]]], 1.);
        passed.push(c);
        points.push(p);
    }

    let pick = nms(&passed, 0.7, NmsMethod::Min);
    debug!("stage 3: {} faces", pick.len());

    Ok(Detection {
        boxes: pick.iter().map(|&i| passed[i].to_array()).collect(),
        points: pick.iter().map(|&i| points[i]).collect(),
    })
}

/// Crops every box (zero padded outside the image), resizes to `size` and
/// stacks the transposed batch. Boxes with no area are dropped.
fn crop_batch(img: &RgbImage, boxes: &[Candidate], size: u32) -> (Array4<f32>, Vec<Candidate>) {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let mut crops = Vec::with_capacity(boxes.len());
    let mut kept = Vec::with_capacity(boxes.len());

    for b in boxes {
        let p = pad(b, w, h);
        if p.tmpw <= 0 || p.tmph <= 0 {
            trace!("skipping empty box {b:?}");
            continue;
        }

        let mut tmp = RgbImage::new(p.tmpw as u32, p.tmph as u32);
        for sy in p.y..=p.ey {
            for sx in p.x..=p.ex {
                let (tx, ty) = (p.dx - 1 + sx - p.x, p.dy - 1 + sy - p.y);
                let inside_src = sx >= 1 && sy >= 1 && sx as usize <= w && sy as usize <= h;
                let inside_tmp = tx >= 0 && ty >= 0 && tx < p.tmpw && ty < p.tmph;
                if inside_src && inside_tmp {
                    tmp.put_pixel(tx as u32, ty as u32, *img.get_pixel(sx as u32 - 1, sy as u32 - 1));
                }
            }
        }

        crops.push(imageops::resize(&tmp, size, size, FilterType::Triangle));
        kept.push(*b);
    }

    let n = crops.len();
    let batch = Array4::from_shape_fn((n, size as usize, size as usize, 3), |(k, x, y, c)| {
        normalize(crops[k].get_pixel(x as u32, y as u32)[c])
    });

    (batch, kept)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bridge::model::FakeNet;
    use ndarray::{Array2, IxDyn};

    fn batch_rows(n: usize, row: &[f32]) -> ArrayD<f32> {
        Array2::from_shape_fn((n, row.len()), |(_, j)| row[j]).into_dyn()
    }

    // fires a single cell, only on the 20 pixel wide pyramid level
    fn pnet(shape: &[usize]) -> Vec<ArrayD<f32>> {
        let face = if shape[1] == 20 { 0.9 } else { 0.1 };
        let reg = ArrayD::zeros(IxDyn(&[1, 1, 1, 4]));
        let mut prob = ArrayD::zeros(IxDyn(&[1, 1, 1, 2]));
        prob[[0, 0, 0, 0]] = 1. - face;
        prob[[0, 0, 0, 1]] = face;
        vec![reg, prob]
    }

    fn rnet_pass(shape: &[usize]) -> Vec<ArrayD<f32>> {
        vec![batch_rows(shape[0], &[0.; 4]), batch_rows(shape[0], &[0., 1.])]
    }

    fn rnet_reject(shape: &[usize]) -> Vec<ArrayD<f32>> {
        vec![batch_rows(shape[0], &[0.; 4]), batch_rows(shape[0], &[0.5, 0.5])]
    }

    fn onet(shape: &[usize]) -> Vec<ArrayD<f32>> {
        vec![
            batch_rows(shape[0], &[0.1; 4]),
            batch_rows(shape[0], &[0.5; 10]),
            batch_rows(shape[0], &[0.05, 0.95]),
        ]
    }

    pub(crate) fn gray(size: u32) -> RgbImage {
        RgbImage::from_pixel(size, size, image::Rgb([128, 128, 128]))
    }

    // min_size 24 keeps the first scale at exactly 0.5
    fn config() -> MtcnnConfig {
        MtcnnConfig {
            min_size: 24.,
            ..MtcnnConfig::default()
        }
    }

    #[test]
    fn cascade_end_to_end() {
        let (mut p, mut r, mut o) = (FakeNet::new(pnet), FakeNet::new(rnet_pass), FakeNet::new(onet));
        let detection =
            detect_face(&gray(40), &config(), &mut p, &mut r, &mut o).unwrap();

        // pyramid of a 40px image: 20 and 15 pixels wide
        assert_eq!(p.shapes(), vec![vec![1, 20, 20, 3], vec![1, 15, 15, 3]]);
        assert_eq!(r.shapes(), vec![vec![1, 24, 24, 3]]);
        assert_eq!(o.shapes(), vec![vec![1, 48, 48, 3]]);

        // cell (0, 0) at scale 0.5 spans 2..24, bbreg shifts it by 0.1 * 23
        assert_eq!(detection.boxes.len(), 1);
        let [x0, y0, x1, y1, score] = detection.boxes[0];
        assert!((x0 - 4.3).abs() < 1e-4);
        assert!((y0 - 4.3).abs() < 1e-4);
        assert!((x1 - 26.3).abs() < 1e-4);
        assert!((y1 - 26.3).abs() < 1e-4);
        assert!((score - 0.95).abs() < 1e-6);

        let rows = detection.landmark_rows();
        assert_eq!(rows.len(), 10);
        assert!(rows.iter().all(|r| r.len() == 1 && (r[0] - 12.5).abs() < 1e-4));
    }

    #[test]
    fn cascade_stops_when_refinement_rejects() {
        let (mut p, mut r, mut o) = (
            FakeNet::new(pnet),
            FakeNet::new(rnet_reject),
            FakeNet::new(onet),
        );
        let detection =
            detect_face(&gray(40), &config(), &mut p, &mut r, &mut o).unwrap();
        assert!(detection.boxes.is_empty());
        assert!(o.inputs.is_empty());
        assert_eq!(detection.landmark_rows(), vec![Vec::<f32>::new(); 10]);
    }

    #[test]
    fn tiny_images_skip_the_networks() {
        let (mut p, mut r, mut o) = (FakeNet::new(pnet), FakeNet::new(rnet_pass), FakeNet::new(onet));
        let detection =
            detect_face(&gray(10), &config(), &mut p, &mut r, &mut o).unwrap();
        assert_eq!(detection, Detection::default());
        assert!(p.inputs.is_empty());
    }

    #[test]
    fn crops_are_zero_padded() {
        let img = RgbImage::from_pixel(10, 10, image::Rgb([255, 255, 255]));
        let b = Candidate::new(-9., -9., 10., 10., 1.);
        let (batch, kept) = crop_batch(&img, &[b], 20);
        assert_eq!(kept.len(), 1);
        assert_eq!(batch.shape(), &[1, 20, 20, 3]);
        // top left quadrant lies outside the image
        assert!((batch[[0, 0, 0, 0]] - normalize(0)).abs() < 1e-6);
        assert!((batch[[0, 19, 19, 0]] - normalize(255)).abs() < 1e-6);
    }

    #[test]
    fn align_requires_init() {
        let mut bridge = MtcnnBridge::with_model_dir("/nowhere", 1);
        let text = marshal::image_to_base64(&PixelArray::zeros((4, 4, 3)));
        let err = bridge.align(&text, 4, 4, 3).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BridgeError>(),
            Some(BridgeError::NotInitialized(_))
        ));
    }

    #[test]
    fn init_reports_missing_networks() {
        let mut bridge = MtcnnBridge::with_model_dir("/nowhere", 1);
        let err = bridge.init().unwrap_err();
        match err.downcast_ref::<BridgeError>() {
            Some(BridgeError::ModelNotFound(p)) => assert!(p.ends_with(PNET_FILE)),
            other => panic!("unexpected error {other:?}"),
        }
    }

    /// A bridge whose cascade finds the single face of [`gray`]`(40)`.
    pub(crate) fn fake_bridge() -> MtcnnBridge {
        let nets = Nets {
            pnet: Box::new(FakeNet::new(pnet)),
            rnet: Box::new(FakeNet::new(rnet_pass)),
            onet: Box::new(FakeNet::new(onet)),
        };
        MtcnnBridge::with_nets(nets, config())
    }

    #[test]
    fn bridge_runs_injected_nets() {
        let mut bridge = fake_bridge();
        assert!(bridge.is_initialized());
        let pixels = marshal::rgb_to_array(&gray(40));
        let text = marshal::image_to_base64(&pixels);
        let (boxes, rows) = bridge.align(&text, 40, 40, 3).unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!(rows.len(), 10);
    }

    #[test]
    fn construction_does_not_need_the_models() {
        let mut config = Config::default();
        config.models.mtcnn = Some("/nowhere/mtcnn".into());
        let mut bridge = MtcnnBridge::new(&config);
        assert!(!bridge.is_initialized());
        assert!(bridge.init().is_err());
    }
}
