//! High level face API on top of the two bridges.
//!
//! [`Facenet::align`] turns an image into [`Face`]s, and [`Facenet::embedding`]
//! computes the 128 dimension descriptor of one face. Distances between
//! descriptors of the same person are small (below about 0.75).

use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use image::RgbaImage;
use ndarray::{Array1, Array2};
use tracing::{debug, info, trace};

use crate::bridge::{FacenetBridge, MtcnnBridge};
use crate::config::{Config, INPUT_FACE_SIZE, VERSION};
use crate::error::BridgeError;
pub use crate::face::FaceEmbedding;
use crate::face::Face;
use crate::image_utils::{load_image, resize_image};
use crate::marshal;

/// Finds faces in an image.
pub trait Aligner {
    fn align(&mut self, image: &RgbaImage) -> Result<Vec<Face>>;
}

/// Computes the embedding of a face and stores it on the face.
pub trait Embedder {
    fn embedding(&mut self, face: &mut Face) -> Result<FaceEmbedding>;
}

pub struct Facenet {
    facenet: FacenetBridge,
    mtcnn: MtcnnBridge,
}

impl Facenet {
    /// Models are looked up when each bridge is initialized.
    pub fn new(config: &Config) -> Facenet {
        info!("Facenet v{VERSION}");
        Facenet {
            facenet: FacenetBridge::new(config),
            mtcnn: MtcnnBridge::new(config),
        }
    }

    pub fn from_bridges(facenet: FacenetBridge, mtcnn: MtcnnBridge) -> Facenet {
        Facenet { facenet, mtcnn }
    }

    pub fn init(&mut self) -> Result<()> {
        self.init_facenet()?;
        self.init_mtcnn()
    }

    pub fn init_facenet(&mut self) -> Result<()> {
        let start = Instant::now();
        self.facenet.init()?;
        info!("init_facenet() cost {} milliseconds", start.elapsed().as_millis());
        Ok(())
    }

    pub fn init_mtcnn(&mut self) -> Result<()> {
        let start = Instant::now();
        self.mtcnn.init()?;
        info!("init_mtcnn() cost {} milliseconds", start.elapsed().as_millis());
        Ok(())
    }

    pub fn quit(&mut self) {
        info!("quit()");
        self.facenet.close();
        self.mtcnn.close();
    }

    pub fn align_file(&mut self, path: impl AsRef<Path>) -> Result<Vec<Face>> {
        let image = load_image(path)?;
        self.align(&image)
    }

    pub fn align(&mut self, image: &RgbaImage) -> Result<Vec<Face>> {
        debug!("align({}x{})", image.width(), image.height());

        let detection = self.mtcnn.align_image(&marshal::rgba_to_array(image))?;
        let marks = Facenet::transform_mtcnn_landmarks(&detection.landmark_rows())?;

        let faces = detection
            .boxes
            .iter()
            .zip(marks.iter())
            .map(|(&[x0, y0, x1, y1, score], marks)| {
                let mut face = Face::new(image, &[x0, y0, x1, y1]);
                face.init(marks, score);
                face
            })
            .collect::<Vec<_>>();

        trace!("align() found {} faces", faces.len());
        Ok(faces)
    }

    /// The face is resized to the network input size, so it must be square.
    pub fn embedding(&mut self, face: &mut Face) -> Result<FaceEmbedding> {
        debug!("embedding({face})");

        let (width, height) = face.image.dimensions();
        if width != height {
            return Err(BridgeError::NotSquare { width, height }.into());
        }

        let pixels = if width != INPUT_FACE_SIZE {
            let resized = resize_image(&face.image, INPUT_FACE_SIZE, INPUT_FACE_SIZE);
            marshal::rgba_to_array(&resized)
        } else {
            marshal::rgba_to_array(&face.image)
        };

        let embedding = Array1::from(self.facenet.embedding_image(&pixels)?);
        face.set_embedding(embedding.clone())?;
        Ok(embedding)
    }

    /// Euclidean distance.
    pub fn distance(a: &FaceEmbedding, b: &FaceEmbedding) -> f32 {
        (a - b).mapv(|v| v * v).sum().sqrt()
    }

    /// Pairs MTCNN landmarks per face.
    ///
    /// MTCNN reports them as 10 rows (5 x then 5 y) with one column per
    /// face; the result holds `[x, y]` for each of the 5 marks of each face.
    pub fn transform_mtcnn_landmarks(landmarks: &[Vec<f32>]) -> Result<Vec<[[f32; 2]; 5]>> {
        let flat: Vec<f32> = landmarks.iter().flatten().copied().collect();
        if flat.len() % 10 != 0 {
            return Err(BridgeError::Shape {
                expected: (10, flat.len() / 10, 1),
                actual: flat.len(),
            }
            .into());
        }

        let faces = flat.len() / 10;
        let by_face = Array2::from_shape_vec((10, faces), flat)?.reversed_axes();

        Ok(by_face
            .rows()
            .into_iter()
            .map(|row| std::array::from_fn(|i| [row[i], row[i + 5]]))
            .collect())
    }
}

impl Aligner for Facenet {
    fn align(&mut self, image: &RgbaImage) -> Result<Vec<Face>> {
        Facenet::align(self, image)
    }
}

impl Embedder for Facenet {
    fn embedding(&mut self, face: &mut Face) -> Result<FaceEmbedding> {
        Facenet::embedding(self, face)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::mtcnn::tests::{fake_bridge, gray};
    use image::Rgba;

    fn offline() -> Facenet {
        Facenet::from_bridges(
            FacenetBridge::with_model_path("/nowhere/facenet", 1),
            MtcnnBridge::with_model_dir("/nowhere/mtcnn", 1),
        )
    }

    #[test]
    fn landmarks_are_paired_per_face() {
        // two faces: x0..x4 then y0..y4, one column per face
        let rows: Vec<Vec<f32>> = (0..10)
            .map(|r| vec![r as f32, 100. + r as f32])
            .collect();
        let marks = Facenet::transform_mtcnn_landmarks(&rows).unwrap();
        assert_eq!(marks.len(), 2);
        assert_eq!(marks[0][0], [0., 5.]);
        assert_eq!(marks[0][4], [4., 9.]);
        assert_eq!(marks[1][2], [102., 107.]);
    }

    #[test]
    fn landmarks_of_no_face() {
        let rows: Vec<Vec<f32>> = vec![Vec::new(); 10];
        assert!(Facenet::transform_mtcnn_landmarks(&rows).unwrap().is_empty());
        assert!(Facenet::transform_mtcnn_landmarks(&[vec![1., 2., 3.]]).is_err());
    }

    #[test]
    fn distance_is_euclidean() {
        let a = Array1::from(vec![0., 3., 0.]);
        let b = Array1::from(vec![4., 0., 0.]);
        assert_eq!(Facenet::distance(&a, &b), 5.);
        assert_eq!(Facenet::distance(&a, &a), 0.);
    }

    #[test]
    fn embedding_rejects_non_square_face() {
        let mut facenet = offline();
        let mut face = Face::new(&RgbaImage::new(10, 6), &[0., 0., 10., 6.]);
        face.image = RgbaImage::from_pixel(10, 6, Rgba([1, 2, 3, 255]));
        let err = facenet.embedding(&mut face).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BridgeError>(),
            Some(BridgeError::NotSquare { width: 10, height: 6 })
        ));
    }

    #[test]
    fn align_requires_mtcnn() {
        let mut facenet = offline();
        let err = facenet.align(&RgbaImage::new(8, 8)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BridgeError>(),
            Some(BridgeError::NotInitialized("MtcnnBridge"))
        ));
    }

    #[test]
    fn init_surfaces_missing_models() {
        let mut facenet = offline();
        assert!(facenet.init_facenet().is_err());
        assert!(facenet.init_mtcnn().is_err());
        facenet.quit();
    }

    #[test]
    fn alignment_works_without_a_facenet_model() {
        let mut config = Config::default();
        config.models.facenet = Some("/nowhere/facenet.onnx".into());
        config.models.mtcnn = Some("/nowhere/mtcnn".into());
        let mut facenet = Facenet::new(&config);
        assert!(facenet.init_facenet().is_err());

        let mut facenet = Facenet::from_bridges(FacenetBridge::new(&config), fake_bridge());
        facenet.init_mtcnn().unwrap();
        let photo = image::DynamicImage::ImageRgb8(gray(40)).to_rgba8();
        let faces = facenet.align(&photo).unwrap();
        assert_eq!(faces.len(), 1);
        assert!((faces[0].confidence - 0.95).abs() < 1e-6);
        assert!(!faces[0].has_embedding());
    }
}
