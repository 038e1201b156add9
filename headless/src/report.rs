use log::warn;
use opencv::core::Rect;
use tracker::{TrackerEvent, recenter};

/// Turns worker events into `frame x y w h` lines.
///
/// Frames are labeled with the id they were submitted with. Events for frames at or before
/// the last reported one are ignored, so re-reading an unchanged event prints nothing.
#[derive(Debug)]
pub struct Reporter {
    bbox: Rect,
    last: Option<u64>,
    tracked: u64,
}

impl Reporter {
    pub fn new(bbox: Rect) -> Self {
        Self {
            bbox,
            last: None,
            tracked: 0,
        }
    }

    /// Records `event` and returns the line to print for a newly tracked frame.
    pub fn report(&mut self, event: &TrackerEvent) -> Option<String> {
        let id = event.id().filter(|&id| self.is_new(id))?;
        self.last = Some(id);
        match event {
            TrackerEvent::Tracked { point, .. } => {
                self.tracked += 1;
                self.bbox = recenter(self.bbox, *point);
                Some(format!(
                    "{id} {} {} {} {}",
                    self.bbox.x, self.bbox.y, self.bbox.width, self.bbox.height
                ))
            }
            TrackerEvent::Failed { error, .. } => {
                warn!("frame {id} was not tracked: {error}");
                None
            }
            TrackerEvent::Idle | TrackerEvent::Initialized => None,
        }
    }

    /// Whether the result of frame `id` or a later one has been reported.
    pub fn reached(&self, id: u64) -> bool {
        self.last.is_some_and(|last| last >= id)
    }

    /// Number of tracked frames reported.
    pub fn tracked(&self) -> u64 {
        self.tracked
    }

    fn is_new(&self, id: u64) -> bool {
        self.last.is_none_or(|last| id > last)
    }
}
