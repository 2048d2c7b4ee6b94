#![warn(unused_extern_crates)]

pub mod bridge;
pub mod cache;
pub mod config;
pub mod error;
pub mod face;
pub mod facenet;
pub mod image_utils;
pub mod marshal;
pub mod serve;
pub mod shapes;

pub use bridge::{FacenetBridge, MtcnnBridge};
pub use config::Config;
pub use error::BridgeError;
pub use face::{Face, FaceEmbedding};
pub use facenet::{Aligner, Embedder, Facenet};
