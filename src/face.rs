use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use image::RgbaImage;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::EMBEDDING_DIM;
use crate::error::BridgeError;
use crate::image_utils::{crop_image, image_digest};
use crate::marshal;
use crate::shapes::rect::round_half_up;
use crate::shapes::{Point, Rect};

pub type FaceEmbedding = Array1<f32>;

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacialLandmark {
    pub left_eye: Point,
    pub right_eye: Point,
    pub nose: Point,
    pub left_mouth_corner: Point,
    pub right_mouth_corner: Point,
}

impl FacialLandmark {
    /// Marks in MTCNN order: eyes, nose, then mouth corners (left before right).
    pub fn from_marks(marks: &[[f32; 2]; 5]) -> FacialLandmark {
        let p = |m: [f32; 2]| Point::new(round_half_up(m[0]), round_half_up(m[1]));
        FacialLandmark {
            left_eye: p(marks[0]),
            right_eye: p(marks[1]),
            nose: p(marks[2]),
            left_mouth_corner: p(marks[3]),
            right_mouth_corner: p(marks[4]),
        }
    }

    pub fn points(&self) -> [Point; 5] {
        [
            self.left_eye,
            self.right_eye,
            self.nose,
            self.left_mouth_corner,
            self.right_mouth_corner,
        ]
    }
}

/// Persisted form of a [`Face`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceJson {
    #[serde(rename = "_embedding", default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub bounding_box: Rect,
    pub confidence: f32,
    /// Base64 of the RGBA bytes.
    pub image_data: String,
    #[serde(default)]
    pub facial_landmark: FacialLandmark,
}

/// A face cut out of a larger image.
#[derive(Debug, Clone)]
pub struct Face {
    pub id: usize,
    pub digest: String,
    pub image: RgbaImage,
    pub bounding_box: Rect,
    pub confidence: f32,
    pub facial_landmark: FacialLandmark,
    embedding: Option<FaceEmbedding>,
}

impl Face {
    /// `corners` is `[x0, y0, x1, y1]` in `image` coordinates. The box is
    /// squared, and the image cropped to it unless it already has the box size.
    pub fn new(image: &RgbaImage, corners: &[f32; 4]) -> Face {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let bounding_box = Rect::square_box(corners);

        trace!(
            "Face#{id} from {}x{} image, box {:?}",
            image.width(),
            image.height(),
            bounding_box
        );

        let image = if bounding_box.w as u32 != image.width()
            || bounding_box.h as u32 != image.height()
        {
            crop_image(
                image,
                bounding_box.x,
                bounding_box.y,
                bounding_box.w,
                bounding_box.h,
            )
        } else {
            image.clone()
        };
        // of the face pixels, not the source photo
        let digest = image_digest(&image);

        Face {
            id,
            digest,
            image,
            bounding_box,
            confidence: 0.,
            facial_landmark: FacialLandmark::default(),
            embedding: None,
        }
    }

    pub fn init(&mut self, marks: &[[f32; 2]; 5], confidence: f32) {
        self.confidence = confidence;
        self.facial_landmark = FacialLandmark::from_marks(marks);
    }

    pub fn embedding(&self) -> Result<&FaceEmbedding> {
        Ok(self.embedding.as_ref().ok_or(BridgeError::EmbeddingMissing)?)
    }

    pub fn has_embedding(&self) -> bool {
        self.embedding.is_some()
    }

    pub fn set_embedding(&mut self, embedding: FaceEmbedding) -> Result<()> {
        if self.embedding.is_some() {
            return Err(BridgeError::EmbeddingAlreadySet.into());
        }
        if embedding.len() != EMBEDDING_DIM {
            return Err(BridgeError::EmbeddingDim(embedding.len()).into());
        }
        self.embedding = Some(embedding);
        Ok(())
    }

    /// Center of the face in the source image.
    pub fn center(&self) -> Point {
        Point::new(
            round_half_up(self.bounding_box.x as f32 + self.width() as f32 / 2.),
            round_half_up(self.bounding_box.y as f32 + self.height() as f32 / 2.),
        )
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn depth(&self) -> usize {
        let pixels = (self.width() * self.height()).max(1) as usize;
        self.image.as_raw().len() / pixels
    }

    pub fn to_json(&self) -> FaceJson {
        FaceJson {
            embedding: self.embedding.as_ref().map(|e| e.to_vec()),
            bounding_box: self.bounding_box,
            confidence: self.confidence,
            image_data: marshal::image_to_base64(&marshal::rgba_to_array(&self.image)),
            facial_landmark: self.facial_landmark,
        }
    }

    /// Rebuilds a face, the stored box gives the image size.
    pub fn from_json(json: FaceJson) -> Result<Face> {
        let b = json.bounding_box;
        let (Ok(w), Ok(h)) = (usize::try_from(b.w), usize::try_from(b.h)) else {
            return Err(BridgeError::InvalidBox(format!("{b:?}")).into());
        };
        let pixels = marshal::base64_to_image(&json.image_data, h, w, 4)?;
        let image = marshal::array_to_rgba(&pixels)?;

        let (x, y) = (b.x as f32, b.y as f32);
        let corners = [x, y, x + b.w as f32, y + b.h as f32];
        let mut face = Face::new(&image, &corners);
        face.bounding_box = b;
        face.confidence = json.confidence;
        face.facial_landmark = json.facial_landmark;
        face.embedding = json.embedding.map(Array1::from);
        Ok(face)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_json())?)
    }

    pub fn from_json_str(text: &str) -> Result<Face> {
        let json: FaceJson = serde_json::from_str(text)?;
        Face::from_json(json)
    }
}

/// `Face#<id>#<digest>`. The alternate form `{:#}` appends the embedding
/// as `<v0,v1,..>`, empty when there is none yet.
impl fmt::Display for Face {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Face#{}#{}", self.id, self.digest)?;
        if f.alternate() {
            f.write_str("<")?;
            if let Some(embedding) = &self.embedding {
                for (i, v) in embedding.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{v}")?;
                }
            }
            f.write_str(">")?;
        }
        Ok(())
    }
}
