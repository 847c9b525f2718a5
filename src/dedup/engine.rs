//! Content-hash clustering with minimal-lineage retention.
use crate::{
    error::{Error, Result},
    name::{ArtifactKind, ArtifactName, Siblings},
    util::{epoch_secs, remove_if_exists, sha256sum},
};
use rustc_hash::FxHashMap;
use std::{
    fs,
    path::{Path, PathBuf},
};

type Checker<'a> = Box<dyn Fn(&Path) -> bool + 'a>;
type Digest<'a> = Box<dyn Fn(&Path) -> Result<Option<String>> + 'a>;

#[derive(Debug, Default)]
pub struct DedupReport {
    /// Distinct hashes seen.
    pub clusters: usize,
    pub survivors: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

/// One dedup pass over a list of candidate artifacts.
///
/// Candidates sharing a digest form a cluster. The member with the fewest ancestors survives,
/// ties go to whichever came first in the candidate list. Every other member is replaced by a
/// tombstone and all of its sibling artifacts are removed, in its own directory and in every
/// extra sibling directory. Running the pass again over its own output removes nothing.
pub struct DedupEngine<'a> {
    candidates: Vec<PathBuf>,
    checker: Checker<'a>,
    digest: Digest<'a>,
    sibling_dirs: Vec<PathBuf>,
}

impl<'a> DedupEngine<'a> {
    pub fn new(candidates: Vec<PathBuf>) -> Self {
        Self {
            candidates,
            checker: Box::new(|_| true),
            digest: Box::new(|p| sha256sum(p).map(Some)),
            sibling_dirs: Vec::new(),
        }
    }

    pub fn checker<F: Fn(&Path) -> bool + 'a>(mut self, f: F) -> Self {
        self.checker = Box::new(f);
        self
    }

    /// Replaces the full-file sha256. `None` leaves the candidate out of every cluster.
    pub fn digest<F: Fn(&Path) -> Result<Option<String>> + 'a>(mut self, f: F) -> Self {
        self.digest = Box::new(f);
        self
    }

    pub fn sibling_dir(mut self, dir: &Path) -> Self {
        self.sibling_dirs.push(dir.to_path_buf());
        self
    }

    pub fn run(self) -> Result<DedupReport> {
        let mut index: FxHashMap<String, usize> = FxHashMap::default();
        let mut clusters: Vec<Vec<(PathBuf, usize)>> = Vec::new();

        for path in self.candidates.iter() {
            if !(self.checker)(path) {
                continue;
            }
            let name = ArtifactName::from_path(path)?;
            if name.kind == ArtifactKind::Deleted {
                continue;
            }
            let hash = match (self.digest)(path)? {
                Some(h) => h,
                None => {
                    log::debug!("dedup: no digest for {}, skipped", path.display());
                    continue;
                }
            };
            let member = (path.clone(), name.lineage.ancestor_count());
            if let Some(&i) = index.get(&hash) {
                clusters[i].push(member);
            } else {
                index.insert(hash, clusters.len());
                clusters.push(vec![member]);
            }
        }

        let mut report = DedupReport {
            clusters: clusters.len(),
            ..DedupReport::default()
        };
        for members in clusters {
            // min_by_key keeps the first of equal minimums
            let keep = members
                .iter()
                .enumerate()
                .min_by_key(|(_, (_, ancestors))| *ancestors)
                .map(|(i, _)| i)
                .unwrap_or(0);
            for (i, (path, _)) in members.into_iter().enumerate() {
                if i == keep {
                    report.survivors.push(path);
                } else {
                    delete_cascade(&path, &self.sibling_dirs)?;
                    report.removed.push(path);
                }
            }
        }
        if !report.removed.is_empty() {
            log::debug!(
                "dedup: {} clusters, {} removed",
                report.clusters,
                report.removed.len()
            );
        }
        Ok(report)
    }
}

/// Replaces `path` by a tombstone and removes every artifact sharing its lineage.
pub fn delete_cascade(path: &Path, sibling_dirs: &[PathBuf]) -> Result<()> {
    let siblings = Siblings::of(path)?;
    let tombstone = siblings.path(ArtifactKind::Deleted);
    fs::write(&tombstone, format!("Deleted at epoch={}", epoch_secs()))
        .map_err(|e| Error::io(&tombstone, e))?;

    let mut all = vec![siblings.clone()];
    all.extend(sibling_dirs.iter().map(|d| siblings.in_dir(d)));
    for s in all.iter() {
        for p in s.derived() {
            remove_if_exists(&p)?;
        }
    }
    Ok(())
}
