use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity is empty")]
    Empty,
    #[error("identity {0:?} contains a path separator or NUL")]
    IllegalCharacter(String),
    #[error("identity {0:?} must not start with '.'")]
    Hidden(String),
    #[error("identity {name:?} contains {ch:?}, which reports cannot print")]
    Unprintable { name: String, ch: char },
}

/// Characters outside Latin-1 that Windows-1252 still encodes.
const CP1252_EXTRAS: &str = "\u{20AC}\u{201A}\u{0192}\u{201E}\u{2026}\u{2020}\u{2021}\u{02C6}\u{2030}\u{0160}\u{2039}\u{0152}\u{017D}\u{2018}\u{2019}\u{201C}\u{201D}\u{2022}\u{2013}\u{2014}\u{02DC}\u{2122}\u{0161}\u{203A}\u{0153}\u{017E}\u{0178}";

/// Reports are set in a built-in PDF font, which only covers Windows-1252.
fn is_printable(c: char) -> bool {
    matches!(c as u32, 0x20..=0x7E | 0xA0..=0xFF) || CP1252_EXTRAS.contains(c)
}

/// Human-readable name of an enrolled person. Primary key of the roster and
/// the stem of the reference image file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Validate and construct an identity. Surrounding whitespace is trimmed.
    pub fn new(name: &str) -> Result<Self, IdentityError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(IdentityError::Empty);
        }
        if name.contains(['/', '\\', '\0']) {
            return Err(IdentityError::IllegalCharacter(name.to_string()));
        }
        if name.starts_with('.') {
            return Err(IdentityError::Hidden(name.to_string()));
        }
        if let Some(ch) = name.chars().find(|&c| !is_printable(c)) {
            return Err(IdentityError::Unprintable {
                name: name.to_string(),
                ch,
            });
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Identity::new(&value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

/// Bounding box for a detected face, with optional facial landmarks.
///
/// Coordinates are pixels in the image the face was detected on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Map the box into an image resized by `factor` (e.g. `4.0` to undo a
    /// quarter-size downsample). Confidence is unchanged.
    pub fn scaled(&self, factor: f32) -> BoundingBox {
        BoundingBox {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
            confidence: self.confidence,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(lx, ly)| (lx * factor, ly * factor))),
        }
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEmbedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl FaceEmbedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Euclidean distance between two embeddings. Symmetric and non-negative;
    /// smaller means more similar.
    pub fn distance(&self, other: &FaceEmbedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One face found in a frame: where it is and what it looks like.
#[derive(Debug, Clone)]
pub struct RecognitionResult {
    pub region: BoundingBox,
    pub embedding: FaceEmbedding,
}

/// Outcome of matching a single face against the roster.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    NoMatch,
    Matched { identity: Identity, distance: f32 },
}

impl MatchDecision {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            MatchDecision::Matched { identity, .. } => Some(identity),
            MatchDecision::NoMatch => None,
        }
    }
}

/// Emitted the first time an identity is marked present in a session.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEvent {
    pub identity: Identity,
    pub at: DateTime<Local>,
}

/// Running attendance count: present identities out of the whole roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Headcount {
    pub present: usize,
    pub total: usize,
}

impl fmt::Display for Headcount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.present, self.total)
    }
}
