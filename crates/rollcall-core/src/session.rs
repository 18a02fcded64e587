//! Attendance session: one-shot presence marking over a stream of frames.

use crate::matcher::{EuclideanMatcher, Matcher};
use crate::roster::Roster;
use crate::types::{Headcount, Identity, MatchDecision, PresenceEvent, RecognitionResult};
use chrono::{DateTime, Local};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting frames; the present set only grows.
    Open,
    /// `finalize` has drained the present set.
    Finalized,
}

/// Everything learned from one frame.
#[derive(Debug, Clone, Default)]
pub struct FrameObservation {
    /// One decision per input result, in input order.
    pub decisions: Vec<MatchDecision>,
    /// Identities marked present by this frame.
    pub events: Vec<PresenceEvent>,
}

/// Tracks who has been seen during one attendance run.
///
/// Holds a snapshot of the roster taken at session start; enrollments made
/// while the session runs are not visible to it.
pub struct AttendanceSession {
    roster: Roster,
    matcher: EuclideanMatcher,
    present: HashSet<Identity>,
    state: SessionState,
    warned_after_finalize: bool,
}

impl AttendanceSession {
    pub fn new(roster: Roster, tolerance: f32) -> Self {
        tracing::info!(enrolled = roster.len(), tolerance, "attendance session opened");
        Self {
            roster,
            matcher: EuclideanMatcher { tolerance },
            present: HashSet::new(),
            state: SessionState::Open,
            warned_after_finalize: false,
        }
    }

    /// Match every face of a frame and return the newly present identities.
    pub fn process_frame(&mut self, results: &[RecognitionResult]) -> Vec<PresenceEvent> {
        self.observe(results).events
    }

    /// Like [`process_frame`](Self::process_frame), also returning the match
    /// decision for each face.
    pub fn observe(&mut self, results: &[RecognitionResult]) -> FrameObservation {
        self.observe_at(results, Local::now())
    }

    /// Observe a frame with an explicit event timestamp.
    pub fn observe_at(&mut self, results: &[RecognitionResult], at: DateTime<Local>) -> FrameObservation {
        if self.state == SessionState::Finalized && !self.warned_after_finalize {
            tracing::warn!("frame processed after the session was finalized");
            self.warned_after_finalize = true;
        }

        let mut observation = FrameObservation::default();

        for result in results {
            let decision = self.matcher.decide(&result.embedding, &self.roster);

            if let MatchDecision::Matched { identity, distance } = &decision {
                // The set check also suppresses a second face matching the
                // same identity within this frame.
                if self.present.insert(identity.clone()) {
                    tracing::info!(%identity, distance, headcount = %self.current_count(), "marked present");
                    observation.events.push(PresenceEvent {
                        identity: identity.clone(),
                        at,
                    });
                }
            }

            observation.decisions.push(decision);
        }

        observation
    }

    pub fn current_count(&self) -> Headcount {
        Headcount {
            present: self.present.len(),
            total: self.roster.len(),
        }
    }

    /// Present identities sorted lexicographically, leaving the session as is.
    pub fn present_sorted(&self) -> Vec<Identity> {
        let mut present: Vec<Identity> = self.present.iter().cloned().collect();
        present.sort();
        present
    }

    /// Drain the present set, sorted lexicographically, and close the session.
    ///
    /// A second call without new frames returns an empty list.
    pub fn finalize(&mut self) -> Vec<Identity> {
        let mut present: Vec<Identity> = self.present.drain().collect();
        present.sort();
        self.state = SessionState::Finalized;
        tracing::info!(present = present.len(), total = self.roster.len(), "attendance session finalized");
        present
    }

    pub fn is_present(&self, identity: &Identity) -> bool {
        self.present.contains(identity)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::DEFAULT_TOLERANCE;
    use crate::types::{BoundingBox, FaceEmbedding};

    fn id(name: &str) -> Identity {
        Identity::new(name).unwrap()
    }

    fn face(values: &[f32]) -> RecognitionResult {
        RecognitionResult {
            region: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 10.0,
                height: 10.0,
                confidence: 0.9,
                landmarks: None,
            },
            embedding: FaceEmbedding::new(values.to_vec()),
        }
    }

    /// alice at the origin, bob one unit away on the x axis.
    fn alice_and_bob() -> Roster {
        let mut roster = Roster::default();
        assert!(roster.insert(id("alice"), FaceEmbedding::new(vec![0.0, 0.0])));
        assert!(roster.insert(id("bob"), FaceEmbedding::new(vec![1.0, 0.0])));
        roster
    }

    fn count(session: &AttendanceSession) -> (usize, usize) {
        let h = session.current_count();
        (h.present, h.total)
    }

    #[test]
    fn test_scenario_alice_marked_once() {
        let mut session = AttendanceSession::new(alice_and_bob(), DEFAULT_TOLERANCE);
        // 0.1 from alice, 0.9 from bob.
        let frame = [face(&[0.1, 0.0])];

        let events = session.process_frame(&frame);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].identity, id("alice"));
        assert_eq!(count(&session), (1, 2));

        assert!(session.process_frame(&frame).is_empty());
        assert_eq!(count(&session), (1, 2));

        assert_eq!(session.finalize(), vec![id("alice")]);
    }

    #[test]
    fn test_scenario_outside_tolerance() {
        let mut roster = Roster::default();
        assert!(roster.insert(id("alice"), FaceEmbedding::new(vec![0.0, 0.0])));
        let mut session = AttendanceSession::new(roster, 0.6);

        let events = session.process_frame(&[face(&[0.65, 0.0])]);
        assert!(events.is_empty());
        assert_eq!(count(&session), (0, 1));
    }

    #[test]
    fn test_duplicate_faces_in_one_frame() {
        let mut session = AttendanceSession::new(alice_and_bob(), DEFAULT_TOLERANCE);
        let frame = [face(&[0.05, 0.0]), face(&[0.0, 0.05]), face(&[0.95, 0.0])];

        let observation = session.observe(&frame);
        let marked: Vec<&str> = observation.events.iter().map(|e| e.identity.as_str()).collect();
        assert_eq!(marked, ["alice", "bob"]);
        // Both alice faces are still reported as matched for display.
        assert_eq!(observation.decisions.len(), 3);
        assert_eq!(observation.decisions[1].identity(), Some(&id("alice")));
        assert_eq!(count(&session), (2, 2));
    }

    #[test]
    fn test_unmatched_face_decision() {
        let mut session = AttendanceSession::new(alice_and_bob(), DEFAULT_TOLERANCE);
        let observation = session.observe(&[face(&[5.0, 5.0])]);
        assert_eq!(observation.decisions, vec![MatchDecision::NoMatch]);
        assert!(observation.events.is_empty());
    }

    #[test]
    fn test_present_count_is_monotonic() {
        let mut session = AttendanceSession::new(alice_and_bob(), DEFAULT_TOLERANCE);
        let frames = [
            vec![],
            vec![face(&[1.0, 0.1])],
            vec![face(&[9.0, 9.0])],
            vec![face(&[0.0, 0.0]), face(&[1.0, 0.0])],
            vec![],
        ];

        let mut last = 0;
        for frame in &frames {
            session.process_frame(frame);
            let present = session.current_count().present;
            assert!(present >= last);
            last = present;
        }
        assert_eq!(last, 2);
    }

    #[test]
    fn test_finalize_sorted_and_drains() {
        let mut roster = Roster::default();
        for (name, x) in [("zoe", 0.0), ("Mia", 10.0), ("adam", 20.0)] {
            assert!(roster.insert(id(name), FaceEmbedding::new(vec![x])));
        }
        let mut session = AttendanceSession::new(roster, DEFAULT_TOLERANCE);
        session.process_frame(&[face(&[20.0]), face(&[0.0])]);
        session.process_frame(&[face(&[10.0]), face(&[20.0])]);

        assert_eq!(session.finalize(), vec![id("Mia"), id("adam"), id("zoe")]);
        assert_eq!(session.state(), SessionState::Finalized);
        assert!(session.finalize().is_empty());
        assert_eq!(count(&session), (0, 3));
    }

    #[test]
    fn test_present_sorted_does_not_drain() {
        let mut session = AttendanceSession::new(alice_and_bob(), DEFAULT_TOLERANCE);
        session.process_frame(&[face(&[0.0, 0.0])]);

        assert_eq!(session.present_sorted(), vec![id("alice")]);
        assert_eq!(session.present_sorted(), vec![id("alice")]);
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(count(&session), (1, 2));
    }

    #[test]
    fn test_frames_after_finalize_are_accepted() {
        let mut session = AttendanceSession::new(alice_and_bob(), DEFAULT_TOLERANCE);
        session.process_frame(&[face(&[0.0, 0.0])]);
        session.finalize();

        let events = session.process_frame(&[face(&[0.0, 0.0])]);
        assert_eq!(events.len(), 1);
        assert!(session.is_present(&id("alice")));
        assert_eq!(session.finalize(), vec![id("alice")]);
    }

    #[test]
    fn test_empty_roster_never_matches() {
        let mut session = AttendanceSession::new(Roster::default(), DEFAULT_TOLERANCE);
        assert!(session.process_frame(&[face(&[0.0])]).is_empty());
        assert_eq!(count(&session), (0, 0));
        assert!(session.finalize().is_empty());
    }

    #[test]
    fn test_event_timestamp_is_observation_time() {
        let mut session = AttendanceSession::new(alice_and_bob(), DEFAULT_TOLERANCE);
        let at = Local::now();
        let observation = session.observe_at(&[face(&[0.0, 0.0])], at);
        assert_eq!(observation.events[0].at, at);
    }
}
