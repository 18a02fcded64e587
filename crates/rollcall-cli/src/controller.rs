//! Session controller: drives one attendance run from frame source to report.

use chrono::NaiveDate;
use rollcall_core::{
    AnalyzerError, AttendanceSession, BoundingBox, FaceAnalyzer, Headcount, Identity,
    MatchDecision, PresenceEvent,
};
use rollcall_hw::{downsample, CameraError, FrameSource};
use rollcall_report::{daily_report_title, ReportEmitter, ReportError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("recognition error: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("report error: {0}")]
    Report(#[from] ReportError),
    #[error("frame source already released")]
    Closed,
}

impl ControllerError {
    /// Errors after which further ticks cannot succeed.
    pub fn is_fatal(&self) -> bool {
        match self {
            ControllerError::Camera(e) => e.is_unavailable(),
            ControllerError::Closed => true,
            _ => false,
        }
    }
}

/// A matched face to draw over the full-size frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    /// Region in full-frame coordinates.
    pub region: BoundingBox,
    pub identity: Identity,
    pub distance: f32,
}

/// What one tick produced.
#[derive(Debug, Default)]
pub struct Tick {
    pub overlays: Vec<Overlay>,
    pub events: Vec<PresenceEvent>,
    /// True when the frame was skipped without running recognition.
    pub skipped: bool,
}

/// Outcome of a completed session.
#[derive(Debug)]
pub struct Completion {
    pub report: PathBuf,
    pub present: Vec<Identity>,
    pub headcount: Headcount,
}

pub struct SessionController<S: FrameSource, A: FaceAnalyzer> {
    source: Option<S>,
    analyzer: A,
    session: AttendanceSession,
    downsample_factor: f32,
}

impl<S: FrameSource, A: FaceAnalyzer> SessionController<S, A> {
    pub fn new(source: S, analyzer: A, session: AttendanceSession, downsample_factor: f32) -> Self {
        Self {
            source: Some(source),
            analyzer,
            session,
            downsample_factor,
        }
    }

    /// Grab one frame, recognize faces on a downsampled copy and feed the
    /// session.
    pub fn tick(&mut self) -> Result<Tick, ControllerError> {
        let source = self.source.as_mut().ok_or(ControllerError::Closed)?;
        let frame = source.grab()?;

        if frame.is_dark {
            tracing::debug!(sequence = frame.sequence, "dark frame skipped");
            return Ok(Tick {
                skipped: true,
                ..Tick::default()
            });
        }

        let small = downsample(&frame.image, self.downsample_factor);
        let results = self.analyzer.detect_and_encode(&small)?;
        let observation = self.session.observe(&results);

        let upscale = 1.0 / self.downsample_factor;
        let overlays: Vec<Overlay> = results
            .iter()
            .zip(observation.decisions)
            .filter_map(|(result, decision)| match decision {
                MatchDecision::Matched { identity, distance } => Some(Overlay {
                    region: result.region.scaled(upscale),
                    identity,
                    distance,
                }),
                MatchDecision::NoMatch => None,
            })
            .collect();

        for overlay in &overlays {
            tracing::debug!(
                identity = %overlay.identity,
                distance = overlay.distance,
                x = overlay.region.x,
                y = overlay.region.y,
                width = overlay.region.width,
                height = overlay.region.height,
                "face matched"
            );
        }
        if !observation.events.is_empty() {
            tracing::info!(headcount = %self.session.current_count(), "attendance updated");
        }

        Ok(Tick {
            overlays,
            events: observation.events,
            skipped: false,
        })
    }

    /// Release the frame source. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(source) = self.source.take() {
            drop(source);
            tracing::info!("frame source released");
        }
    }

    /// Release the source, write the report for `date` and finalize the
    /// session.
    ///
    /// The session is only finalized once the report is written; on error
    /// the attendance is still available from [`present`](Self::present)
    /// and `complete` can be retried.
    pub fn complete(
        &mut self,
        emitter: &impl ReportEmitter,
        date: NaiveDate,
    ) -> Result<Completion, ControllerError> {
        self.close();

        let headcount = self.session.current_count();
        let entries: Vec<String> = self.session.present_sorted().iter().map(|id| id.to_string()).collect();
        let report = emitter.emit(&daily_report_title(date), &entries)?;
        let present = self.session.finalize();

        Ok(Completion {
            report,
            present,
            headcount,
        })
    }

    pub fn headcount(&self) -> Headcount {
        self.session.current_count()
    }

    /// Identities seen so far, sorted.
    pub fn present(&self) -> Vec<Identity> {
        self.session.present_sorted()
    }
}

impl<S: FrameSource, A: FaceAnalyzer> Drop for SessionController<S, A> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use rollcall_core::{FaceEmbedding, RecognitionResult, Roster, DEFAULT_TOLERANCE};
    use rollcall_hw::Frame;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    struct ScriptedSource {
        frames: VecDeque<Frame>,
        dropped: Rc<RefCell<bool>>,
    }

    impl FrameSource for ScriptedSource {
        fn grab(&mut self) -> Result<Frame, CameraError> {
            self.frames
                .pop_front()
                .ok_or_else(|| CameraError::CaptureFailed("no more frames".into()))
        }
    }

    impl Drop for ScriptedSource {
        fn drop(&mut self) {
            *self.dropped.borrow_mut() = true;
        }
    }

    /// Returns the same faces for every image and records the sizes it saw.
    struct ScriptedAnalyzer {
        faces: Vec<RecognitionResult>,
        seen: Vec<(u32, u32)>,
    }

    impl FaceAnalyzer for ScriptedAnalyzer {
        fn detect_and_encode(&mut self, image: &RgbImage) -> Result<Vec<RecognitionResult>, AnalyzerError> {
            self.seen.push(image.dimensions());
            Ok(self.faces.clone())
        }
    }

    #[derive(Default)]
    struct RecordingEmitter {
        emitted: RefCell<Vec<(String, Vec<String>)>>,
    }

    impl ReportEmitter for RecordingEmitter {
        fn emit(&self, title: &str, entries: &[String]) -> Result<PathBuf, ReportError> {
            self.emitted.borrow_mut().push((title.to_string(), entries.to_vec()));
            Ok(PathBuf::from("report.pdf"))
        }
    }

    struct FailingEmitter;

    impl ReportEmitter for FailingEmitter {
        fn emit(&self, _title: &str, _entries: &[String]) -> Result<PathBuf, ReportError> {
            Err(ReportError::Io {
                path: PathBuf::from("/missing/report.pdf"),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        }
    }

    fn bright_frame(seq: u32) -> Frame {
        Frame::new(RgbImage::from_pixel(640, 480, Rgb([180, 170, 160])), seq)
    }

    fn face(embedding: &[f32], x: f32) -> RecognitionResult {
        RecognitionResult {
            region: BoundingBox {
                x,
                y: 10.0,
                width: 20.0,
                height: 25.0,
                confidence: 0.9,
                landmarks: None,
            },
            embedding: FaceEmbedding::new(embedding.to_vec()),
        }
    }

    fn roster() -> Roster {
        let mut roster = Roster::default();
        for (name, v) in [("zoe", [1.0, 0.0]), ("amy", [0.0, 1.0]), ("bob", [-1.0, 0.0])] {
            assert!(roster.insert(Identity::new(name).unwrap(), FaceEmbedding::new(v.to_vec())));
        }
        roster
    }

    fn controller(
        frames: Vec<Frame>,
        faces: Vec<RecognitionResult>,
    ) -> (SessionController<ScriptedSource, ScriptedAnalyzer>, Rc<RefCell<bool>>) {
        let dropped = Rc::new(RefCell::new(false));
        let source = ScriptedSource {
            frames: frames.into(),
            dropped: Rc::clone(&dropped),
        };
        let analyzer = ScriptedAnalyzer { faces, seen: Vec::new() };
        let session = AttendanceSession::new(roster(), DEFAULT_TOLERANCE);
        (SessionController::new(source, analyzer, session, 0.25), dropped)
    }

    #[test]
    fn test_tick_downsamples_and_scales_overlays() {
        let (mut ctl, _) = controller(vec![bright_frame(0)], vec![face(&[1.0, 0.0], 40.0)]);

        let tick = ctl.tick().unwrap();

        assert_eq!(ctl.analyzer.seen, vec![(160, 120)]);
        assert_eq!(tick.overlays.len(), 1);
        let overlay = &tick.overlays[0];
        assert_eq!(overlay.identity.as_str(), "zoe");
        assert_eq!(overlay.region.x, 160.0);
        assert_eq!(overlay.region.y, 40.0);
        assert_eq!(overlay.region.width, 80.0);
        assert_eq!(overlay.region.height, 100.0);
        assert_eq!(tick.events.len(), 1);
        assert_eq!(ctl.headcount(), Headcount { present: 1, total: 3 });
    }

    #[test]
    fn test_unmatched_faces_get_no_overlay() {
        let (mut ctl, _) = controller(vec![bright_frame(0)], vec![face(&[5.0, 5.0], 0.0)]);
        let tick = ctl.tick().unwrap();
        assert!(tick.overlays.is_empty());
        assert!(tick.events.is_empty());
    }

    #[test]
    fn test_dark_frame_skips_recognition() {
        let dark = Frame::new(RgbImage::new(640, 480), 0);
        let (mut ctl, _) = controller(vec![dark], vec![face(&[1.0, 0.0], 0.0)]);

        let tick = ctl.tick().unwrap();
        assert!(tick.skipped);
        assert!(ctl.analyzer.seen.is_empty());
        assert_eq!(ctl.headcount().present, 0);
    }

    #[test]
    fn test_repeat_sightings_emit_once() {
        let (mut ctl, _) = controller(
            vec![bright_frame(0), bright_frame(1)],
            vec![face(&[1.0, 0.0], 0.0)],
        );
        assert_eq!(ctl.tick().unwrap().events.len(), 1);
        let second = ctl.tick().unwrap();
        assert!(second.events.is_empty());
        assert_eq!(second.overlays.len(), 1);
    }

    #[test]
    fn test_capture_failure_is_not_fatal() {
        let (mut ctl, _) = controller(vec![], vec![]);
        let err = ctl.tick().unwrap_err();
        assert!(matches!(err, ControllerError::Camera(CameraError::CaptureFailed(_))));
        assert!(!err.is_fatal());
        assert!(ControllerError::Camera(CameraError::DeviceBusy).is_fatal());
    }

    #[test]
    fn test_close_releases_source_once() {
        let (mut ctl, dropped) = controller(vec![bright_frame(0)], vec![]);
        ctl.close();
        assert!(*dropped.borrow());
        ctl.close();
        assert!(matches!(ctl.tick(), Err(ControllerError::Closed)));
    }

    #[test]
    fn test_complete_writes_sorted_report() {
        let (mut ctl, dropped) = controller(
            vec![bright_frame(0)],
            vec![face(&[1.0, 0.0], 0.0), face(&[0.0, 1.0], 30.0)],
        );
        ctl.tick().unwrap();

        let emitter = RecordingEmitter::default();
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        let done = ctl.complete(&emitter, date).unwrap();

        assert!(*dropped.borrow());
        assert_eq!(done.report, PathBuf::from("report.pdf"));
        assert_eq!(done.headcount, Headcount { present: 2, total: 3 });
        let names: Vec<&str> = done.present.iter().map(Identity::as_str).collect();
        assert_eq!(names, ["amy", "zoe"]);

        let emitted = emitter.emitted.borrow();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].0, "Attendance Report - 2024-03-07");
        assert_eq!(emitted[0].1, vec!["amy".to_string(), "zoe".to_string()]);
    }

    #[test]
    fn test_complete_with_nobody_present() {
        let (mut ctl, _) = controller(vec![], vec![]);
        let emitter = RecordingEmitter::default();
        let done = ctl
            .complete(&emitter, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
            .unwrap();
        assert!(done.present.is_empty());
        assert!(emitter.emitted.borrow()[0].1.is_empty());
    }

    #[test]
    fn test_failed_report_keeps_attendance() {
        let (mut ctl, dropped) = controller(vec![bright_frame(0)], vec![face(&[0.0, 1.0], 0.0)]);
        ctl.tick().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();

        let err = ctl.complete(&FailingEmitter, date).unwrap_err();
        assert!(matches!(err, ControllerError::Report(_)));
        assert!(*dropped.borrow());
        assert_eq!(ctl.headcount(), Headcount { present: 1, total: 3 });
        assert_eq!(ctl.present(), vec![Identity::new("amy").unwrap()]);

        let emitter = RecordingEmitter::default();
        let done = ctl.complete(&emitter, date).unwrap();
        assert_eq!(done.present, vec![Identity::new("amy").unwrap()]);
        assert_eq!(emitter.emitted.borrow()[0].1, vec!["amy".to_string()]);
        assert_eq!(ctl.headcount().present, 0);
    }
}
