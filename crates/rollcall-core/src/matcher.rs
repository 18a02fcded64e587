//! Nearest-neighbour matching of probe embeddings against the roster.

use crate::roster::Roster;
use crate::types::{FaceEmbedding, MatchDecision};

/// Maximum Euclidean distance accepted as the same person.
pub const DEFAULT_TOLERANCE: f32 = 0.6;

/// Index of the candidate closest to `probe`, if its distance is within
/// `tolerance` (inclusive).
///
/// Empty candidates never match. On equal distances the lowest index wins.
pub fn best_match(candidates: &[&FaceEmbedding], probe: &FaceEmbedding, tolerance: f32) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;

    for (i, candidate) in candidates.iter().enumerate() {
        let d = probe.distance(candidate);
        // Strict `<` keeps the earliest of equal minima.
        if best.map_or(true, |(_, best_d)| d < best_d) {
            best = Some((i, d));
        }
    }

    match best {
        Some((idx, d)) if d <= tolerance => Some(idx),
        _ => None,
    }
}

/// Strategy for deciding which roster identity, if any, a probe belongs to.
pub trait Matcher {
    fn decide(&self, probe: &FaceEmbedding, roster: &Roster) -> MatchDecision;
}

/// Euclidean nearest-neighbour matcher with a fixed tolerance.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub tolerance: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl Matcher for EuclideanMatcher {
    fn decide(&self, probe: &FaceEmbedding, roster: &Roster) -> MatchDecision {
        let candidates: Vec<&FaceEmbedding> = roster.iter().map(|(_, e)| e).collect();
        best_match(&candidates, probe, self.tolerance)
            .and_then(|idx| roster.get_index(idx))
            .map_or(MatchDecision::NoMatch, |(identity, embedding)| {
                MatchDecision::Matched {
                    identity: identity.clone(),
                    distance: probe.distance(embedding),
                }
            })
    }
}
