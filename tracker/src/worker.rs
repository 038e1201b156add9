use std::{
    mem,
    sync::{Arc, Mutex},
};

use log::{debug, error, warn};
use opencv::core::{Mat, Point, Rect};
use tokio::{
    spawn,
    sync::{Notify, watch},
    task::{JoinHandle, spawn_blocking},
};

use crate::TrackingSession;

/// The latest outcome published by a [`TrackerWorker`].
#[derive(Clone, Debug, PartialEq)]
pub enum TrackerEvent {
    /// Nothing has been processed yet.
    Idle,
    /// The session has been (re)initialized from a bounding box.
    Initialized,
    /// A frame has been tracked.
    ///
    /// `id` is the id the frame was submitted with, `frame_index` is the session's frame
    /// index before tracking it and `point` is in that frame's pixels.
    Tracked {
        id: u64,
        frame_index: u64,
        point: Point,
    },
    /// The last request failed.
    ///
    /// `id` is the id of the failed frame or `None` when initialization failed.
    Failed { id: Option<u64>, error: String },
}

impl TrackerEvent {
    /// The id of the frame this event is about.
    pub fn id(&self) -> Option<u64> {
        match self {
            TrackerEvent::Tracked { id, .. } => Some(*id),
            TrackerEvent::Failed { id, .. } => *id,
            TrackerEvent::Idle | TrackerEvent::Initialized => None,
        }
    }
}

/// Pending requests, each slot holds only the latest value.
#[derive(Debug, Default)]
struct Mail {
    init: Option<(Mat, Rect)>,
    frame: Option<(u64, Mat)>,
    alpha: Option<f32>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Mailbox {
    mail: Mutex<Mail>,
    notify: Notify,
}

impl Mailbox {
    fn post(&self, f: impl FnOnce(&mut Mail)) {
        f(&mut self.mail.lock().unwrap());
        self.notify.notify_one();
    }

    fn take(&self) -> Mail {
        mem::take(&mut *self.mail.lock().unwrap())
    }

    fn close(&self) {
        self.post(|mail| mail.closed = true);
    }
}

/// Runs a [`TrackingSession`] on a background task.
///
/// Frames are handed over through a single-slot mailbox so a frame that has not been picked
/// up yet is replaced by a newer one. Results are published on a [`watch`] channel. None of
/// the methods block on inference.
#[derive(Debug)]
pub struct TrackerWorker {
    mailbox: Arc<Mailbox>,
    events: watch::Receiver<TrackerEvent>,
    handle: Option<JoinHandle<()>>,
}

impl TrackerWorker {
    /// Moves `session` to a background task.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn(session: TrackingSession) -> Self {
        let mailbox = Arc::new(Mailbox::default());
        let (events_tx, events_rx) = watch::channel(TrackerEvent::Idle);
        let handle = spawn(run(
            mailbox.clone(),
            Arc::new(Mutex::new(session)),
            events_tx,
        ));

        Self {
            mailbox,
            events: events_rx,
            handle: Some(handle),
        }
    }

    /// Requests re-initialization from `bbox` in `frame`.
    ///
    /// Frames submitted before this call and not yet picked up are discarded.
    pub fn init(&self, frame: Mat, bbox: Rect) {
        self.mailbox.post(|mail| {
            mail.frame = None;
            mail.init = Some((frame, bbox));
        });
    }

    /// Submits `frame` for tracking, replacing any frame not yet picked up.
    ///
    /// `id` is echoed back in the resulting event so callers can tell which frames were
    /// dropped.
    pub fn submit(&self, id: u64, frame: Mat) {
        self.mailbox.post(|mail| mail.frame = Some((id, frame)));
    }

    /// Updates the exponential smoothing factor before the next frame.
    pub fn set_alpha(&self, alpha: f32) {
        self.mailbox.post(|mail| mail.alpha = Some(alpha));
    }

    pub fn subscribe(&self) -> watch::Receiver<TrackerEvent> {
        self.events.clone()
    }

    /// Stops the background task and waits for the in-flight request to finish.
    pub async fn stop(mut self) {
        self.mailbox.close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TrackerWorker {
    fn drop(&mut self) {
        self.mailbox.close();
    }
}

async fn run(
    mailbox: Arc<Mailbox>,
    session: Arc<Mutex<TrackingSession>>,
    events: watch::Sender<TrackerEvent>,
) {
    loop {
        mailbox.notify.notified().await;
        let mail = mailbox.take();
        if mail.closed {
            break;
        }

        let session = session.clone();
        match spawn_blocking(move || process(&session, mail)).await {
            Ok(processed) => {
                for event in processed {
                    events.send_replace(event);
                }
            }
            Err(err) => {
                error!("tracker worker request panicked: {err}");
                events.send_replace(TrackerEvent::Failed {
                    id: None,
                    error: err.to_string(),
                });
                break;
            }
        }
    }
    debug!("tracker worker stopped");
}

fn process(session: &Mutex<TrackingSession>, mail: Mail) -> Vec<TrackerEvent> {
    let mut session = session.lock().unwrap();
    let mut events = Vec::new();

    if let Some(alpha) = mail.alpha {
        session.set_alpha(alpha);
    }
    if let Some((frame, bbox)) = mail.init {
        match session.init_from_bbox(&frame, bbox) {
            Ok(()) => events.push(TrackerEvent::Initialized),
            Err(err) => {
                warn!("tracker initialization failed: {err}");
                events.push(TrackerEvent::Failed {
                    id: None,
                    error: err.to_string(),
                });
                return events;
            }
        }
    }
    if let Some((id, frame)) = mail.frame {
        let frame_index = session.frame_index();
        match session.track(&frame) {
            Ok(point) => events.push(TrackerEvent::Tracked {
                id,
                frame_index,
                point,
            }),
            Err(err) => {
                warn!("tracking frame {id} failed: {err}");
                events.push(TrackerEvent::Failed {
                    id: Some(id),
                    error: err.to_string(),
                });
            }
        }
    }
    events
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use opencv::core::{CV_8UC3, MatTraitConst, Scalar};
    use tokio::time::timeout;

    use super::*;
    use crate::{
        TrackerConfig,
        session::tests::{marker_config, marker_frame, marker_frame_at, marker_session},
    };

    async fn wait_for(
        events: &mut watch::Receiver<TrackerEvent>,
        f: impl FnMut(&TrackerEvent) -> bool,
    ) -> TrackerEvent {
        timeout(Duration::from_secs(30), events.wait_for(f))
            .await
            .expect("event in time")
            .expect("worker alive")
            .clone()
    }

    fn idle_worker() -> TrackerWorker {
        TrackerWorker {
            mailbox: Arc::new(Mailbox::default()),
            events: watch::channel(TrackerEvent::Idle).1,
            handle: None,
        }
    }

    #[test]
    fn mailbox_keeps_latest_frame() {
        let mailbox = Mailbox::default();
        let older = Mat::new_rows_cols_with_default(1, 1, CV_8UC3, Scalar::all(0.0)).unwrap();
        let newer = Mat::new_rows_cols_with_default(2, 2, CV_8UC3, Scalar::all(0.0)).unwrap();

        mailbox.post(|mail| mail.frame = Some((1, older)));
        mailbox.post(|mail| mail.frame = Some((2, newer)));
        let (id, frame) = mailbox.take().frame.unwrap();

        assert_eq!(id, 2);
        assert_eq!(frame.rows(), 2);
        assert!(mailbox.take().frame.is_none());
    }

    #[test]
    fn init_discards_older_frames() {
        let (frame, marker) = marker_frame(336);
        let worker = idle_worker();

        worker.submit(1, frame.clone());
        worker.init(frame.clone(), marker);
        let mail = worker.mailbox.take();
        assert!(mail.init.is_some());
        assert!(mail.frame.is_none());

        worker.init(frame.clone(), marker);
        worker.submit(2, frame);
        worker.set_alpha(0.5);
        let mail = worker.mailbox.take();
        assert!(mail.init.is_some());
        assert_eq!(mail.frame.map(|(id, _)| id), Some(2));
        assert_eq!(mail.alpha, Some(0.5));
    }

    #[test]
    fn events_carry_submitted_ids() {
        let session = Mutex::new(marker_session(marker_config()));
        let worker = idle_worker();
        let (frame, marker) = marker_frame(336);

        worker.init(frame.clone(), marker);
        assert_eq!(
            process(&session, worker.mailbox.take()),
            vec![TrackerEvent::Initialized]
        );

        // frame 1 is replaced before the worker picks it up
        worker.submit(1, frame.clone());
        worker.submit(2, frame.clone());
        assert_eq!(
            process(&session, worker.mailbox.take()),
            vec![TrackerEvent::Tracked {
                id: 2,
                frame_index: 0,
                point: Point::new(180, 132)
            }]
        );

        worker.submit(3, Mat::default());
        assert!(matches!(
            process(&session, worker.mailbox.take()).as_slice(),
            [TrackerEvent::Failed { id: Some(3), .. }]
        ));

        worker.submit(4, frame);
        assert_eq!(
            process(&session, worker.mailbox.take()),
            vec![TrackerEvent::Tracked {
                id: 4,
                frame_index: 1,
                point: Point::new(180, 132)
            }]
        );
    }

    #[tokio::test]
    async fn tracks_submitted_frames() {
        let worker = TrackerWorker::spawn(marker_session(marker_config()));
        let mut events = worker.subscribe();
        let (frame, marker) = marker_frame(336);

        worker.init(frame.clone(), marker);
        worker.submit(10, frame.clone());
        let event = wait_for(&mut events, |event| {
            matches!(event, TrackerEvent::Tracked { .. })
        })
        .await;
        assert_eq!(
            event,
            TrackerEvent::Tracked {
                id: 10,
                frame_index: 0,
                point: Point::new(180, 132)
            }
        );

        worker.submit(11, frame);
        let event = wait_for(&mut events, |event| {
            matches!(event, TrackerEvent::Tracked { id: 11, .. })
        })
        .await;
        assert_eq!(
            event,
            TrackerEvent::Tracked {
                id: 11,
                frame_index: 1,
                point: Point::new(180, 132)
            }
        );
        worker.stop().await;
    }

    #[tokio::test]
    async fn alpha_applies_to_next_frame() {
        let worker = TrackerWorker::spawn(marker_session(TrackerConfig {
            stride: 1,
            window: 0,
            ..marker_config()
        }));
        let mut events = worker.subscribe();
        let (frame, marker) = marker_frame(336);
        let (moved, _) = marker_frame_at(336, 2, 3);

        worker.init(frame.clone(), marker);
        worker.submit(1, frame);
        let event = wait_for(&mut events, |event| {
            matches!(event, TrackerEvent::Tracked { id: 1, .. })
        })
        .await;
        assert!(matches!(
            event,
            TrackerEvent::Tracked { point, .. } if point == Point::new(180, 132)
        ));

        worker.set_alpha(1.0);
        worker.submit(2, moved);
        let event = wait_for(&mut events, |event| {
            matches!(event, TrackerEvent::Tracked { id: 2, .. })
        })
        .await;
        // with the configured alpha of 0.3 the point would be (151, 110)
        assert!(matches!(
            event,
            TrackerEvent::Tracked { point, .. } if point == Point::new(84, 60)
        ));
        worker.stop().await;
    }

    #[tokio::test]
    async fn track_before_init_publishes_failure() {
        let worker = TrackerWorker::spawn(marker_session(marker_config()));
        let mut events = worker.subscribe();
        let (frame, _) = marker_frame(336);

        worker.submit(7, frame);
        let event = wait_for(&mut events, |event| {
            matches!(event, TrackerEvent::Failed { .. })
        })
        .await;
        assert!(matches!(
            event,
            TrackerEvent::Failed { id: Some(7), error } if error.contains("not initialized")
        ));
        worker.stop().await;
    }

    #[tokio::test]
    async fn bad_init_publishes_failure() {
        let worker = TrackerWorker::spawn(marker_session(marker_config()));
        let mut events = worker.subscribe();
        let (frame, _) = marker_frame(336);

        worker.init(frame, Rect::new(500, 500, 10, 10));
        let event = wait_for(&mut events, |event| {
            matches!(event, TrackerEvent::Failed { .. })
        })
        .await;
        assert!(matches!(
            event,
            TrackerEvent::Failed { id: None, error } if error.contains("outside")
        ));
        worker.stop().await;
    }

    #[tokio::test]
    async fn stop_finishes_idle_worker() {
        let worker = TrackerWorker::spawn(marker_session(marker_config()));

        timeout(Duration::from_secs(5), worker.stop())
            .await
            .expect("worker stopped");
    }
}
