//! rollcall-core — Face roster, matching and attendance session.
//!
//! Face detection (SCRFD) and embedding (ArcFace) run via ONNX Runtime
//! behind the [`FaceAnalyzer`] trait; everything else is plain data and
//! can be exercised without a camera or models.

pub mod analyzer;
pub mod detector;
pub mod matcher;
pub mod recognizer;
pub mod roster;
pub mod session;
pub mod types;

use std::path::PathBuf;

pub use analyzer::{AnalyzerError, FaceAnalyzer, OnnxAnalyzer};
pub use matcher::{best_match, EuclideanMatcher, Matcher, DEFAULT_TOLERANCE};
pub use roster::{EnrollError, Roster, RosterError, RosterStore};
pub use session::{AttendanceSession, FrameObservation, SessionState};
pub use types::{
    BoundingBox, FaceEmbedding, Headcount, Identity, IdentityError, MatchDecision, PresenceEvent,
    RecognitionResult,
};

/// SCRFD detection model file name inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name inside the model directory.
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// `$XDG_DATA_HOME/rollcall/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
        .join("models")
}
