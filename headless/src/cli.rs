use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use opencv::core::Rect;
use tracker::{Device, TrackerConfig};

/// Plays a video file through the point tracker and prints the tracked box of every frame.
#[derive(Parser, Debug)]
#[command(name = "headless", about = "Track a selected object through a video file")]
pub struct Cli {
    /// Video file to play.
    pub video: PathBuf,

    /// Initial bounding box as `x,y,w,h` in video pixels.
    #[arg(long, value_parser = parse_bbox)]
    pub bbox: Rect,

    /// Frame the bounding box is selected on.
    #[arg(long, default_value_t = 0)]
    pub start: u64,

    /// Pace playback at the video frame rate and let the tracker drop frames it cannot keep
    /// up with.
    #[arg(long)]
    pub realtime: bool,

    /// JSON tracker configuration, flags below override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// ONNX export of the feature extractor.
    #[arg(long)]
    pub model: Option<String>,

    /// Inference device, `cuda` or `cpu`.
    #[arg(long)]
    pub device: Option<Device>,

    /// Working square resolution.
    #[arg(long)]
    pub side: Option<i32>,

    /// Frames between full re-embedding matches.
    #[arg(long)]
    pub stride: Option<u64>,

    /// Smoothing window, `0` for exponential smoothing.
    #[arg(long)]
    pub window: Option<usize>,

    /// Exponential smoothing factor in `[0, 1]`.
    #[arg(long)]
    pub alpha: Option<f32>,

    /// ONNX Runtime shared library, `ORT_DYLIB_PATH` is used when omitted.
    #[arg(long)]
    pub runtime: Option<PathBuf>,

    /// Also write logs to this file.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    /// Builds the tracker configuration from the config file and flag overrides.
    pub fn tracker_config(&self) -> Result<TrackerConfig> {
        let mut config = match &self.config {
            Some(path) => TrackerConfig::load(path)?,
            None => TrackerConfig::default(),
        };
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(device) = self.device {
            config.device = device;
        }
        if let Some(side) = self.side {
            config.side = side;
        }
        if let Some(stride) = self.stride {
            config.stride = stride;
        }
        if let Some(window) = self.window {
            config.window = window;
        }
        if let Some(alpha) = self.alpha {
            config.alpha = alpha;
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_bbox(value: &str) -> Result<Rect, String> {
    let parts = value
        .split(',')
        .map(|part| part.trim().parse::<i32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| format!("invalid number in bounding box: {err}"))?;
    let &[x, y, width, height] = parts.as_slice() else {
        return Err(format!("expected x,y,w,h but got {} values", parts.len()));
    };
    if width <= 0 || height <= 0 {
        return Err("bounding box width and height must be positive".to_string());
    }
    Ok(Rect::new(x, y, width, height))
}
