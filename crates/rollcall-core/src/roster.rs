//! Roster of enrolled identities, persisted as one reference image per person.
//!
//! The image directory is the only durable state. Embeddings are recomputed
//! from the images on every load.

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::types::{FaceEmbedding, Identity, IdentityError};
use image::{ImageFormat, RgbImage};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Extensions recognized as reference images (compared case-insensitively).
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
/// Extension used when writing new reference images.
const ENROLL_EXTENSION: &str = "jpg";

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("roster directory {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("invalid identity: {0}")]
    InvalidIdentity(#[from] IdentityError),
    #[error("identity already enrolled: {0}")]
    IdentityExists(Identity),
    #[error("no face detected in reference image")]
    NoFaceDetected,
    #[error("failed to persist reference image {path}: {reason}")]
    PersistenceFailure { path: PathBuf, reason: String },
    #[error("face analysis failed: {0}")]
    Analyzer(#[from] AnalyzerError),
}

/// Why a reference image was left out of the roster during load.
#[derive(Error, Debug)]
pub enum SkipReason {
    #[error("file name is not a valid identity: {0}")]
    InvalidName(IdentityError),
    #[error("image could not be read: {0}")]
    Unreadable(String),
    #[error("no face detected")]
    NoFace,
    #[error("face analysis failed: {0}")]
    Analyzer(AnalyzerError),
    #[error("identity {0} already loaded from another file")]
    Duplicate(Identity),
}

#[derive(Debug)]
pub struct SkippedImage {
    pub path: PathBuf,
    pub reason: SkipReason,
}

/// Insertion-ordered identity → embedding map with unique identities.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    entries: Vec<(Identity, FaceEmbedding)>,
}

impl Roster {
    /// Append an entry. Returns `false` (and leaves the roster untouched)
    /// if the identity is already present.
    pub fn insert(&mut self, identity: Identity, embedding: FaceEmbedding) -> bool {
        if self.contains(&identity) {
            return false;
        }
        self.entries.push((identity, embedding));
        true
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entries.iter().any(|(id, _)| id == identity)
    }

    pub fn get(&self, identity: &Identity) -> Option<&FaceEmbedding> {
        self.entries.iter().find(|(id, _)| id == identity).map(|(_, e)| e)
    }

    pub fn get_index(&self, idx: usize) -> Option<(&Identity, &FaceEmbedding)> {
        self.entries.get(idx).map(|(id, e)| (id, e))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Identity, &FaceEmbedding)> {
        self.entries.iter().map(|(id, e)| (id, e))
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.entries.iter().map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Roster backed by a directory of reference images.
pub struct RosterStore {
    dir: PathBuf,
    roster: Roster,
    skipped: Vec<SkippedImage>,
}

impl RosterStore {
    /// Load every reference image in `dir`, creating the directory if needed.
    ///
    /// Images that cannot be used are skipped and logged; only an unusable
    /// directory fails the load.
    pub fn load<A>(dir: impl Into<PathBuf>, analyzer: &mut A) -> Result<Self, RosterError>
    where
        A: FaceAnalyzer + ?Sized,
    {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| RosterError::Persistence {
            path: dir.clone(),
            source,
        })?;

        let mut roster = Roster::default();
        let mut skipped = Vec::new();

        for path in scan_images(&dir)? {
            let loaded = load_reference(&path, analyzer).and_then(|(identity, embedding)| {
                if roster.insert(identity.clone(), embedding) {
                    Ok(identity)
                } else {
                    Err(SkipReason::Duplicate(identity))
                }
            });

            match loaded {
                Ok(identity) => tracing::debug!(%identity, path = %path.display(), "loaded reference image"),
                Err(reason) => {
                    tracing::warn!(path = %path.display(), %reason, "skipping reference image");
                    skipped.push(SkippedImage { path, reason });
                }
            }
        }

        tracing::info!(
            dir = %dir.display(),
            enrolled = roster.len(),
            skipped = skipped.len(),
            "roster loaded"
        );

        Ok(Self { dir, roster, skipped })
    }

    /// Enroll `name` from a reference image.
    ///
    /// The image is written to the roster directory before the in-memory
    /// roster is updated. Any failure after the write removes the file again.
    pub fn enroll<A>(&mut self, name: &str, reference: &RgbImage, analyzer: &mut A) -> Result<FaceEmbedding, EnrollError>
    where
        A: FaceAnalyzer + ?Sized,
    {
        let identity = Identity::new(name)?;
        let path = self.dir.join(format!("{identity}.{ENROLL_EXTENSION}"));
        if self.roster.contains(&identity) || path.exists() {
            return Err(EnrollError::IdentityExists(identity));
        }

        let faces = analyzer.detect_and_encode(reference)?;
        if faces.is_empty() {
            return Err(EnrollError::NoFaceDetected);
        }
        if faces.len() > 1 {
            tracing::warn!(%identity, faces = faces.len(), "multiple faces in reference image; using the first");
        }

        let pending = PendingFile::new(path.clone());
        reference
            .save_with_format(&path, ImageFormat::Jpeg)
            .map_err(|e| EnrollError::PersistenceFailure {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        // Re-encode from the durable copy so the in-memory embedding matches
        // what the next load will compute.
        let stored = image::open(&path)
            .map_err(|e| EnrollError::PersistenceFailure {
                path: path.clone(),
                reason: e.to_string(),
            })?
            .to_rgb8();
        let embedding = analyzer
            .detect_and_encode(&stored)?
            .into_iter()
            .next()
            .map(|face| face.embedding)
            .ok_or(EnrollError::NoFaceDetected)?;

        pending.commit();
        self.roster.insert(identity.clone(), embedding.clone());
        tracing::info!(%identity, path = %path.display(), "enrolled");

        Ok(embedding)
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reference images left out by the last load.
    pub fn skipped(&self) -> &[SkippedImage] {
        &self.skipped
    }
}

/// List `(identity, path)` for every reference image in `dir` without
/// computing embeddings. Files whose name is not a valid identity are omitted.
pub fn reference_images(dir: &Path) -> Result<Vec<(Identity, PathBuf)>, RosterError> {
    Ok(scan_images(dir)?
        .into_iter()
        .filter_map(|path| identity_from_path(&path).ok().map(|id| (id, path)))
        .collect())
}

/// Reference image paths in `dir`, sorted by file name.
fn scan_images(dir: &Path) -> Result<Vec<PathBuf>, RosterError> {
    let persistence = |source: io::Error| RosterError::Persistence {
        path: dir.to_path_buf(),
        source,
    };

    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(persistence)? {
        let path = entry.map_err(persistence)?.path();
        if path.is_file() && is_reference_image(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn is_reference_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

fn identity_from_path(path: &Path) -> Result<Identity, IdentityError> {
    let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    Identity::new(&stem)
}

fn load_reference<A>(path: &Path, analyzer: &mut A) -> Result<(Identity, FaceEmbedding), SkipReason>
where
    A: FaceAnalyzer + ?Sized,
{
    let identity = identity_from_path(path).map_err(SkipReason::InvalidName)?;
    let decoded = image::open(path)
        .map_err(|e| SkipReason::Unreadable(e.to_string()))?
        .to_rgb8();
    let face = analyzer
        .detect_and_encode(&decoded)
        .map_err(SkipReason::Analyzer)?
        .into_iter()
        .next()
        .ok_or(SkipReason::NoFace)?;
    Ok((identity, face.embedding))
}

/// A freshly written file that is deleted on drop unless committed.
struct PendingFile {
    path: PathBuf,
    committed: bool,
}

impl PendingFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PendingFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "removed unfinished reference image"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!(path = %self.path.display(), error = %e, "failed to remove unfinished reference image"),
        }
    }
}
