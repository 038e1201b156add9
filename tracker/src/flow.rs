use std::fmt::Debug;

use log::debug;
#[cfg(test)]
use mockall::automock;
use opencv::{
    core::{Mat, MatTraitConst, ModifyInplace, Point, Point2f, Vec2f},
    imgproc::{COLOR_BGR2GRAY, cvt_color_def},
    video::calc_optical_flow_farneback,
};

use crate::{Error, PatchGrid, Result};

/// A trait for estimating the motion of a single point between two frames.
#[cfg_attr(test, automock)]
pub trait FlowEstimator: Debug + Send {
    /// Estimates the displacement at `point` going from the BGR `previous` frame to the BGR
    /// `current` frame.
    ///
    /// Both frames have the same size and `point` must lie inside them.
    fn flow_at(&mut self, previous: &Mat, current: &Mat, point: Point) -> Result<Point2f>;
}

/// Dense Farneback optical flow sampled at one point.
#[derive(Clone, Debug)]
pub struct FarnebackFlow {
    pub pyr_scale: f64,
    pub levels: i32,
    pub win_size: i32,
    pub iterations: i32,
    pub poly_n: i32,
    pub poly_sigma: f64,
}

impl Default for FarnebackFlow {
    fn default() -> Self {
        Self {
            pyr_scale: 0.5,
            levels: 3,
            win_size: 15,
            iterations: 3,
            poly_n: 5,
            poly_sigma: 1.2,
        }
    }
}

impl FlowEstimator for FarnebackFlow {
    fn flow_at(&mut self, previous: &Mat, current: &Mat, point: Point) -> Result<Point2f> {
        let previous = to_grayscale(previous)?;
        let current = to_grayscale(current)?;
        let mut flow = Mat::default();
        calc_optical_flow_farneback(
            &previous,
            &current,
            &mut flow,
            self.pyr_scale,
            self.levels,
            self.win_size,
            self.iterations,
            self.poly_n,
            self.poly_sigma,
            0,
        )?;

        if !(0..flow.cols()).contains(&point.x) || !(0..flow.rows()).contains(&point.y) {
            return Err(Error::Flow(format!(
                "point ({}, {}) is outside of the {}x{} flow field",
                point.x,
                point.y,
                flow.cols(),
                flow.rows()
            )));
        }
        let vector = *flow.at_2d::<Vec2f>(point.y, point.x)?;
        Ok(Point2f::new(vector[0], vector[1]))
    }
}

/// Moves `point` by `flow`, rounding to integer pixels.
///
/// A non-finite `flow` keeps `point` and a result outside of the working resolution is clamped
/// back into it.
pub(crate) fn propagate(grid: PatchGrid, point: Point, flow: Point2f) -> Point {
    if !flow.x.is_finite() || !flow.y.is_finite() {
        debug!("non-finite flow ({}, {}), keeping previous point", flow.x, flow.y);
        return point;
    }

    let next = Point::new(
        (point.x as f32 + flow.x).round() as i32,
        (point.y as f32 + flow.y).round() as i32,
    );
    if grid.contains(next) {
        next
    } else {
        debug!("flow moved point to ({}, {}), clamping", next.x, next.y);
        grid.clamp(next)
    }
}

/// Converts a BGR `Mat` image to grayscale.
#[inline]
fn to_grayscale(mat: &impl MatTraitConst) -> Result<Mat> {
    let mut mat = mat.try_clone()?;
    // SAFETY: can be modified inplace
    unsafe {
        mat.modify_inplace(|mat, mat_mut| cvt_color_def(mat, mat_mut, COLOR_BGR2GRAY))?;
    }
    Ok(mat)
}
