//! Adapters exposing the pretrained networks to a caller through
//! serialized image buffers.

pub mod facenet;
pub mod model;
pub mod mtcnn;

pub use facenet::FacenetBridge;
pub use model::{ModelLocation, Network, resolve_model_file};
pub use mtcnn::{Detection, MtcnnBridge};
