use std::collections::VecDeque;

use opencv::core::Point;

/// Temporal smoothing of the raw tracked point.
#[derive(Clone, Debug, PartialEq)]
pub enum Smoother {
    /// Coordinate-wise mean of the last `capacity` raw points.
    Window {
        points: VecDeque<Point>,
        capacity: usize,
    },
    /// `alpha * raw + (1 - alpha) * previous`, seeded by the first raw point.
    Exponential { previous: Option<Point> },
}

impl Smoother {
    /// Creates a window smoother when `window > 0`, otherwise an exponential one.
    pub fn new(window: usize) -> Self {
        if window > 0 {
            Smoother::Window {
                points: VecDeque::with_capacity(window),
                capacity: window,
            }
        } else {
            Smoother::Exponential { previous: None }
        }
    }

    /// Smooths `raw` and updates the smoothing state.
    ///
    /// `alpha` is only used in exponential mode. Results are truncated toward zero.
    pub fn smooth(&mut self, raw: Point, alpha: f32) -> Point {
        match self {
            Smoother::Window { points, capacity } => {
                points.push_back(raw);
                while points.len() > *capacity {
                    points.pop_front();
                }
                let count = points.len() as f64;
                let (sum_x, sum_y) = points.iter().fold((0.0, 0.0), |(x, y), point| {
                    (x + point.x as f64, y + point.y as f64)
                });
                Point::new((sum_x / count) as i32, (sum_y / count) as i32)
            }
            Smoother::Exponential { previous } => {
                let smoothed = match previous {
                    Some(previous) => {
                        let alpha = alpha as f64;
                        Point::new(
                            (alpha * raw.x as f64 + (1.0 - alpha) * previous.x as f64) as i32,
                            (alpha * raw.y as f64 + (1.0 - alpha) * previous.y as f64) as i32,
                        )
                    }
                    None => raw,
                };
                *previous = Some(smoothed);
                smoothed
            }
        }
    }

    /// Clears the smoothing state.
    pub fn reset(&mut self) {
        match self {
            Smoother::Window { points, .. } => points.clear(),
            Smoother::Exponential { previous } => *previous = None,
        }
    }

    /// Whether no point has been smoothed since creation or the last [`Self::reset`].
    pub fn is_empty(&self) -> bool {
        match self {
            Smoother::Window { points, .. } => points.is_empty(),
            Smoother::Exponential { previous } => previous.is_none(),
        }
    }
}
