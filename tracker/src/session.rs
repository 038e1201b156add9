use log::{debug, trace, warn};
use nalgebra::DVector;
use opencv::{
    core::{CV_8UC3, CV_8UC4, Mat, MatTraitConst, Point, Rect, Size},
    imgproc::{COLOR_BGRA2BGR, INTER_LINEAR, cvt_color_def, resize},
};

use crate::{
    Embedder, Error, FarnebackFlow, FlowEstimator, OnnxEmbedder, PatchEmbeddings, PatchGrid,
    Result, Smoother, TrackerConfig, flow, grid, matcher,
};

/// A single-object point tracking session.
///
/// The session is seeded with [`Self::init_from_bbox`] and then follows the selected patch
/// with [`Self::track`]. Every `stride` calls the whole frame is embedded and matched against
/// the reference patch. Calls in between propagate the last point with optical flow.
#[derive(Debug)]
pub struct TrackingSession {
    config: TrackerConfig,
    grid: PatchGrid,
    embedder: Box<dyn Embedder>,
    flow: Box<dyn FlowEstimator>,
    reference: Option<DVector<f32>>,
    frame_index: u64,
    smoother: Smoother,
    alpha: f32,
    /// The last working resolution frame and raw point.
    previous: Option<(Mat, Point)>,
}

impl TrackingSession {
    /// Creates a session using the ONNX feature extractor and Farneback optical flow.
    pub fn new(config: TrackerConfig) -> Result<Self> {
        let embedder = OnnxEmbedder::new(&config)?;
        Self::with_embedder(config, Box::new(embedder))
    }

    /// Creates a session using `embedder` and Farneback optical flow.
    pub fn with_embedder(config: TrackerConfig, embedder: Box<dyn Embedder>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            grid: PatchGrid::new(config.side, config.patch_size),
            embedder,
            flow: Box::new(FarnebackFlow::default()),
            reference: None,
            frame_index: 0,
            smoother: Smoother::new(config.window),
            alpha: config.alpha,
            previous: None,
            config,
        })
    }

    /// Replaces the optical flow estimator.
    pub fn with_flow(mut self, flow: Box<dyn FlowEstimator>) -> Self {
        self.flow = flow;
        self
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn grid(&self) -> PatchGrid {
        self.grid
    }

    /// Whether [`Self::init_from_bbox`] has succeeded at least once.
    pub fn is_tracking(&self) -> bool {
        self.reference.is_some()
    }

    /// Number of [`Self::track`] calls since the last initialization.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn smoother(&self) -> &Smoother {
        &self.smoother
    }

    /// The last raw point in working resolution.
    pub fn previous_point(&self) -> Option<Point> {
        self.previous.as_ref().map(|(_, point)| *point)
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Sets the exponential smoothing factor, clamped to `[0, 1]`.
    ///
    /// Takes effect on the next [`Self::track`].
    pub fn set_alpha(&mut self, alpha: f32) {
        self.alpha = if alpha.is_nan() {
            self.alpha
        } else {
            alpha.clamp(0.0, 1.0)
        };
    }

    /// Selects the patch under the center of `bbox` as the tracking reference.
    ///
    /// `bbox` is in `frame` pixels. The session restarts from scratch on success and is left
    /// untouched on failure.
    pub fn init_from_bbox(&mut self, frame: &Mat, bbox: Rect) -> Result<()> {
        if frame.empty() {
            return Err(Error::EmptyFrame);
        }
        if bbox.width <= 0 || bbox.height <= 0 {
            return Err(Error::InvalidBox);
        }

        let size = frame.size()?;
        let center = grid::center(bbox);
        if !(0..size.width).contains(&center.x) || !(0..size.height).contains(&center.y) {
            return Err(Error::CenterOutOfFrame(center.x, center.y));
        }
        let index = self
            .grid
            .index_of(self.grid.to_working(center, size))
            .ok_or(Error::CenterOutOfFrame(center.x, center.y))?;

        let small = to_working_frame(frame, self.grid.side())?;
        let embeddings = self.embed(&small)?;

        self.reference = Some(embeddings.row(index));
        self.frame_index = 0;
        self.smoother.reset();
        self.previous = None;
        debug!(
            "tracking reference set to patch {index} from box {bbox:?} in {}x{} frame",
            size.width, size.height
        );
        Ok(())
    }

    /// Tracks the reference in `frame`.
    ///
    /// Returns the smoothed point in `frame` pixels.
    pub fn track(&mut self, frame: &Mat) -> Result<Point> {
        let point = self.track_working(frame)?;
        Ok(self.grid.to_frame(point, frame.size()?))
    }

    /// Tracks the reference in `frame`.
    ///
    /// Returns the smoothed point in working resolution pixels.
    pub fn track_working(&mut self, frame: &Mat) -> Result<Point> {
        let Some(reference) = self.reference.as_ref() else {
            return Err(Error::NotInitialized);
        };
        let small = to_working_frame(frame, self.grid.side())?;

        let raw = match &self.previous {
            Some((previous, point)) if self.frame_index % self.config.stride != 0 => {
                trace!("frame {} propagated with optical flow", self.frame_index);
                match self.flow.flow_at(previous, &small, *point) {
                    Ok(flow) => flow::propagate(self.grid, *point, flow),
                    Err(Error::OpenCv(err)) => {
                        warn!("optical flow failed, keeping previous point: {err}");
                        *point
                    }
                    Err(err) => return Err(err),
                }
            }
            previous => {
                trace!("frame {} matched against reference", self.frame_index);
                let embeddings = self.embed(&small)?;
                match matcher::match_patch(self.grid, &embeddings, reference) {
                    Some((point, similarity)) => {
                        trace!("best patch at {point:?} with similarity {similarity}");
                        point
                    }
                    None => match previous {
                        Some((_, point)) => {
                            warn!("no finite patch similarity, keeping previous point");
                            *point
                        }
                        None => {
                            return Err(Error::Embedding(
                                "no finite patch similarity".to_string(),
                            ));
                        }
                    },
                }
            }
        };

        self.previous = Some((small, raw));
        self.frame_index += 1;
        Ok(self.smoother.smooth(raw, self.alpha))
    }

    fn embed(&self, small: &Mat) -> Result<PatchEmbeddings> {
        let embeddings = self.embedder.embed(small)?;
        if embeddings.len() != self.grid.len() {
            return Err(Error::Embedding(format!(
                "expected {} patches, got {}",
                self.grid.len(),
                embeddings.len()
            )));
        }
        Ok(embeddings)
    }
}

/// Resizes an 8-bit BGR or BGRA `frame` to a `side x side` BGR `Mat`.
fn to_working_frame(frame: &Mat, side: i32) -> Result<Mat> {
    if frame.empty() {
        return Err(Error::EmptyFrame);
    }
    let typ = frame.typ();
    if typ != CV_8UC3 && typ != CV_8UC4 {
        return Err(Error::UnsupportedFrame(typ));
    }

    let mut small = Mat::default();
    resize(frame, &mut small, Size::new(side, side), 0.0, 0.0, INTER_LINEAR)?;
    if typ == CV_8UC4 {
        let mut bgr = Mat::default();
        cvt_color_def(&small, &mut bgr, COLOR_BGRA2BGR)?;
        return Ok(bgr);
    }
    Ok(small)
}
