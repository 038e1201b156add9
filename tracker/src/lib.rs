use std::path::Path;

use thiserror::Error;

mod config;
mod embed;
mod flow;
mod grid;
mod matcher;
mod session;
mod smooth;
mod worker;

pub use {
    config::{Device, TrackerConfig},
    embed::{Embedder, OnnxEmbedder, PatchEmbeddings},
    flow::{FarnebackFlow, FlowEstimator},
    grid::{PatchGrid, center, recenter},
    matcher::best_match,
    session::TrackingSession,
    smooth::Smoother,
    worker::{TrackerEvent, TrackerWorker},
};

pub type Result<T> = core::result::Result<T, Error>;

/// Tracker error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("feature extractor model could not be loaded: {0}")]
    Model(String),
    #[error("onnx runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("opencv error: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("configuration file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration format error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("tracking session is not initialized, call init_from_bbox first")]
    NotInitialized,
    #[error("frame is empty")]
    EmptyFrame,
    #[error("frame type {0} is not supported, expected 8-bit BGR or BGRA")]
    UnsupportedFrame(i32),
    #[error("bounding box must have a positive width and height")]
    InvalidBox,
    #[error("bounding box center ({0}, {1}) is outside of the frame")]
    CenterOutOfFrame(i32, i32),

    #[error("unexpected embedding output: {0}")]
    Embedding(String),
    #[error("optical flow failed: {0}")]
    Flow(String),
}

/// Loads the ONNX Runtime shared library from `dylib`.
///
/// Must be called once before any [`OnnxEmbedder`] is built unless the runtime can be found
/// through `ORT_DYLIB_PATH`.
pub fn init_runtime(dylib: impl AsRef<Path>) -> Result<()> {
    let dylib = dylib.as_ref();
    let path = dylib
        .to_str()
        .ok_or_else(|| Error::Model(format!("invalid runtime path {}", dylib.display())))?;
    ort::init_from(path).commit()?;
    Ok(())
}
