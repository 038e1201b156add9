use std::{io::stderr, path::Path, time::Duration};

use anyhow::{Context, Result, bail};
use clap::Parser;
use fern::Dispatch;
use log::{LevelFilter, info};
use opencv::{
    core::{Mat, MatTraitConst},
    videoio::{CAP_ANY, CAP_PROP_FPS, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use tokio::{sync::watch, time::Instant};
use tracker::{TrackerEvent, TrackerWorker, TrackingSession};

use crate::{cli::Cli, report::Reporter};

mod cli;
mod report;

const FALLBACK_FPS: f64 = 30.0;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;
    log_panics::init();

    let config = cli.tracker_config().context("invalid tracker configuration")?;
    if let Some(runtime) = &cli.runtime {
        tracker::init_runtime(runtime)
            .with_context(|| format!("failed to load onnx runtime from {}", runtime.display()))?;
    }
    info!("tracker configuration {config:?}");
    let session = TrackingSession::new(config).context("failed to create tracking session")?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(play(cli, session))
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let level = if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut dispatch = Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(stderr());
    if let Some(path) = log_file {
        dispatch = dispatch.chain(
            fern::log_file(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?,
        );
    }
    dispatch.apply()?;
    Ok(())
}

async fn play(cli: Cli, session: TrackingSession) -> Result<()> {
    let video = cli
        .video
        .to_str()
        .with_context(|| format!("invalid video path {}", cli.video.display()))?;
    let mut capture = VideoCapture::from_file(video, CAP_ANY)?;
    if !capture.is_opened()? {
        bail!("failed to open video {video}");
    }
    let fps = capture.get(CAP_PROP_FPS)?;
    let fps = if fps > 0.0 { fps } else { FALLBACK_FPS };

    let mut frame = Mat::default();
    let mut video_index = 0;
    loop {
        if !capture.read(&mut frame)? || frame.empty() {
            bail!("video ended before frame {}", cli.start);
        }
        if video_index == cli.start {
            break;
        }
        video_index += 1;
    }

    let worker = TrackerWorker::spawn(session);
    let mut events = worker.subscribe();
    worker.init(frame.try_clone()?, cli.bbox);
    if let TrackerEvent::Failed { error, .. } = next_event(&mut events).await? {
        bail!("failed to initialize tracker on frame {video_index}: {error}");
    }
    info!("tracking from frame {video_index} with box {:?}", cli.bbox);

    let mut reporter = Reporter::new(cli.bbox);
    let mut interval = cli
        .realtime
        .then(|| tokio::time::interval(Duration::from_secs_f64(1.0 / fps)));
    let started = Instant::now();
    loop {
        if !capture.read(&mut frame)? || frame.empty() {
            break;
        }
        video_index += 1;
        worker.submit(video_index, frame.try_clone()?);

        let event = match interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
                if !events.has_changed()? {
                    continue;
                }
                events.borrow_and_update().clone()
            }
            None => next_event(&mut events).await?,
        };
        print_report(&mut reporter, &event);
    }
    // the last submitted frame is never replaced so its result always arrives
    if video_index > cli.start && !reporter.reached(video_index) {
        let event = events
            .wait_for(|event| event.id() == Some(video_index))
            .await
            .context("tracker worker stopped unexpectedly")?
            .clone();
        print_report(&mut reporter, &event);
    }
    worker.stop().await;

    let elapsed = started.elapsed();
    let tracked = reporter.tracked();
    let skipped = video_index - cli.start - tracked;
    info!(
        "tracked {tracked} frames, skipped {skipped}, in {} ({:.1} fps)",
        humantime::format_duration(Duration::from_millis(elapsed.as_millis() as u64)),
        tracked as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    Ok(())
}

async fn next_event(events: &mut watch::Receiver<TrackerEvent>) -> Result<TrackerEvent> {
    events
        .changed()
        .await
        .context("tracker worker stopped unexpectedly")?;
    Ok(events.borrow_and_update().clone())
}

fn print_report(reporter: &mut Reporter, event: &TrackerEvent) {
    if let Some(line) = reporter.report(event) {
        println!("{line}");
    }
}
