//! Local (per stage iteration) and global dedup stores.
use super::engine::{DedupEngine, DedupReport};
use crate::{
    cshash::{key_of, CrashSiteHashes},
    error::{Error, Result},
    layout::{Layout, StageDirs},
    name::{ArtifactKind, ArtifactName, Lineage, Siblings},
    ptimer::TIMER_EXT,
    util::{copy_if_absent, PART_EXT},
};
use anyhow::Context;
use std::{
    fs::{self, create_dir_all},
    io::ErrorKind,
    path::{Path, PathBuf},
};

/// Artifacts of `kinds` in `dir`, in listing order. A missing directory is empty.
///
/// Timer files, partial writes and hidden entries are not artifacts. Any other name that does
/// not parse is an error.
pub fn list_artifacts(dir: &Path, kinds: &[ArtifactKind]) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(dir, e)),
    };
    let mut ret = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| Error::io(dir, e))?.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name.starts_with('.') || name.ends_with(TIMER_EXT) || name.ends_with(PART_EXT) {
            continue;
        }
        if kinds.contains(&ArtifactName::parse(name)?.kind) {
            ret.push(path);
        }
    }
    Ok(ret)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedKind {
    Testcase,
    CrashSite,
}

/// Input of one Stage 2 worker.
#[derive(Debug, Clone)]
pub struct Seed {
    pub lineage: Lineage,
    pub kind: SeedKind,
    /// Compressed image or crash site the worker starts from.
    pub image: PathBuf,
}

impl Seed {
    pub fn name(&self) -> String {
        self.lineage.to_string()
    }
}

pub struct DedupStore<'a> {
    layout: &'a Layout,
    dirs: StageDirs,
}

impl<'a> DedupStore<'a> {
    pub fn new(layout: &'a Layout, dirs: StageDirs) -> Self {
        Self { layout, dirs }
    }

    pub fn dirs(&self) -> &StageDirs {
        &self.dirs
    }

    /// Dedups the stage's test cases, cascading into its images, then collapses its crash sites.
    pub fn run_local(&self) -> anyhow::Result<DedupReport> {
        let candidates = list_artifacts(&self.dirs.testcases, &[ArtifactKind::Testcase])?;
        let report = DedupEngine::new(candidates)
            .sibling_dir(&self.dirs.images)
            .run()
            .with_context(|| format!("local dedup of {} failed", self.dirs.root.display()))?;
        self.collapse_crash_sites(&self.dirs.images)?;
        Ok(report)
    }

    /// Imports the stage's artifacts into the global store and dedups it.
    ///
    /// Lineages tombstoned in the global store are never imported again.
    pub fn update_global(&self) -> anyhow::Result<usize> {
        let global = self.layout.global_dedup();
        create_dir_all(&global).with_context(|| format!("failed to create {}", global.display()))?;

        let mut sources = list_artifacts(
            &self.dirs.testcases,
            &[
                ArtifactKind::Testcase,
                ArtifactKind::MinTestcase,
                ArtifactKind::Map,
                ArtifactKind::PmMap,
            ],
        )?;
        sources.extend(list_artifacts(
            &self.dirs.images,
            &[ArtifactKind::ImageCmpr, ArtifactKind::CrashSiteCmpr],
        )?);

        let mut imported = 0;
        for src in sources {
            let name = ArtifactName::from_path(&src)?;
            let tombstone = Siblings::new(&global, name.lineage.clone()).path(ArtifactKind::Deleted);
            if tombstone.exists() {
                continue;
            }
            if copy_if_absent(&src, &global.join(name.file_name()))? {
                imported += 1;
            }
        }

        let candidates = list_artifacts(&global, &[ArtifactKind::Testcase])?;
        let report = DedupEngine::new(candidates)
            .run()
            .context("global dedup failed")?;
        let collapsed = self.collapse_crash_sites(&global)?;
        log::info!(
            "global dedup: {} imported, {} test cases removed, {} crash sites collapsed",
            imported,
            report.removed.len(),
            collapsed
        );
        Ok(imported)
    }

    /// Crash sites in `dir` sharing a recorded hash collapse into the shallowest one.
    fn collapse_crash_sites(&self, dir: &Path) -> anyhow::Result<usize> {
        let mut db = CrashSiteHashes::load(&self.layout.crash_site_db())?;
        let candidates = list_artifacts(dir, &[ArtifactKind::CrashSiteCmpr])?;
        if candidates.len() < 2 {
            return Ok(0);
        }
        let report = {
            let db = &db;
            DedupEngine::new(candidates)
                .digest(move |p| {
                    let name = ArtifactName::from_path(p)?;
                    Ok(db.get(&key_of(&name)).map(|h| h.to_string()))
                })
                .run()
                .with_context(|| format!("crash-site collapse in {} failed", dir.display()))?
        };
        let mut keys = Vec::with_capacity(report.removed.len());
        for p in report.removed.iter() {
            keys.push(key_of(&ArtifactName::from_path(p)?));
        }
        db.remove_keys(keys.iter().map(|k| &k[..]))?;
        Ok(keys.len())
    }

    /// Copies this iteration's seeds from the global store into the local one.
    ///
    /// Seeds of iteration N are the global images and crash sites N - 1 stage joins away from
    /// Stage 1. Without any, the deepest generation not beyond that is used, then the shallowest.
    pub fn update_local(&self) -> anyhow::Result<usize> {
        let global = self.layout.global_dedup();
        let mut candidates = Vec::new();
        for p in list_artifacts(
            &global,
            &[ArtifactKind::ImageCmpr, ArtifactKind::CrashSiteCmpr],
        )? {
            let name = ArtifactName::from_path(&p)?;
            if name.kind == ArtifactKind::ImageCmpr
                && !Siblings::new(&global, name.lineage.clone())
                    .path(ArtifactKind::Testcase)
                    .exists()
            {
                continue;
            }
            candidates.push(name);
        }
        if candidates.is_empty() {
            return Ok(0);
        }

        let want = self.dirs.iter.saturating_sub(1) as usize;
        let depths = candidates
            .iter()
            .map(|n| n.lineage.stage_depth())
            .collect::<Vec<_>>();
        let depth = depths
            .iter()
            .copied()
            .filter(|d| *d <= want)
            .max()
            .or_else(|| depths.iter().copied().min())
            .unwrap_or(want);
        if depth != want {
            log::info!(
                "no seeds of depth {} for iteration {}, using depth {}",
                want,
                self.dirs.iter,
                depth
            );
        }

        let local = &self.dirs.dedup_sync;
        create_dir_all(local).with_context(|| format!("failed to create {}", local.display()))?;
        let mut copied = 0;
        for name in candidates
            .into_iter()
            .filter(|n| n.lineage.stage_depth() == depth)
        {
            let from = Siblings::new(&global, name.lineage.clone());
            let to = from.in_dir(local);
            if name.kind == ArtifactKind::ImageCmpr {
                copy_if_absent(
                    &from.path(ArtifactKind::Testcase),
                    &to.path(ArtifactKind::Testcase),
                )?;
            }
            if copy_if_absent(&from.path(name.kind), &to.path(name.kind))? {
                copied += 1;
            }
        }
        Ok(copied)
    }

    pub fn local_seeds(&self) -> anyhow::Result<Vec<Seed>> {
        let local = &self.dirs.dedup_sync;
        let mut seeds = Vec::new();
        for image in list_artifacts(local, &[ArtifactKind::ImageCmpr, ArtifactKind::CrashSiteCmpr])? {
            let name = ArtifactName::from_path(&image)?;
            let kind = if name.kind == ArtifactKind::ImageCmpr {
                let tc = Siblings::new(local, name.lineage.clone()).path(ArtifactKind::Testcase);
                if !tc.exists() {
                    return Err(Error::Corruption(format!(
                        "seed image without test case: {}",
                        image.display()
                    ))
                    .into());
                }
                SeedKind::Testcase
            } else {
                SeedKind::CrashSite
            };
            seeds.push(Seed {
                lineage: name.lineage,
                kind,
                image,
            });
        }
        Ok(seeds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cshash::write_sidecar, ptimer::PTimer};

    const H: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn touch(dir: &Path, name: &str, content: &[u8]) {
        fs::write(dir.join(name), content).unwrap();
    }

    fn sorted(dir: &Path, kinds: &[ArtifactKind]) -> Vec<String> {
        let mut v = list_artifacts(dir, kinds)
            .unwrap()
            .into_iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect::<Vec<_>>();
        v.sort();
        v
    }

    #[test]
    fn listing_skips_timers_and_rejects_strangers() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "id=1.testcase", b"");
        touch(dir.path(), "id=1.ptimer", b"{}");
        touch(dir.path(), "id=2.testcase.part", b"");
        touch(dir.path(), ".state", b"");
        assert_eq!(
            sorted(dir.path(), &[ArtifactKind::Testcase]),
            vec!["id=1.testcase"]
        );
        touch(dir.path(), "core", b"");
        assert!(list_artifacts(dir.path(), &[ArtifactKind::Testcase]).is_err());
        assert!(list_artifacts(&dir.path().join("none"), &[]).unwrap().is_empty());
    }

    #[test]
    fn interrupted_timer_write_does_not_block_listing() {
        let out = tempfile::tempdir().unwrap();
        let layout = Layout::new(out.path());
        let global = layout.global_dedup();
        fs::create_dir_all(&global).unwrap();
        touch(&global, "id=000001.testcase", b"a");
        touch(&global, "id=000001.pm_pool.tar.gz", b"i");

        let dirs = layout.stage(2, 1);
        let store = DedupStore::new(&layout, dirs.clone());
        assert_eq!(store.update_local().unwrap(), 1);
        let mut timer = PTimer::open(&dirs.dedup_sync, "id=000001").unwrap();
        timer.start_new(60).unwrap();
        // killed between writing the new state and renaming it into place
        fs::write(crate::util::part_path(timer.path()), b"{\"start\":1.0,").unwrap();

        assert_eq!(store.update_local().unwrap(), 0);
        assert_eq!(store.local_seeds().unwrap().len(), 1);
        assert!(!PTimer::open(&dirs.dedup_sync, "id=000001").unwrap().is_new());
    }

    #[test]
    fn global_import_respects_tombstones() {
        let out = tempfile::tempdir().unwrap();
        let layout = Layout::new(out.path());
        let dirs = layout.stage(1, 1);
        dirs.create().unwrap();
        touch(&dirs.testcases, "id=000001.testcase", b"a");
        touch(&dirs.testcases, "map_id=000001.testcase", b"m");
        touch(&dirs.images, "id=000001.pm_pool.tar.gz", b"i");
        touch(&dirs.testcases, "id=000002.testcase", b"b");
        touch(&dirs.images, "id=000002.pm_pool.tar.gz", b"i2");

        let store = DedupStore::new(&layout, dirs.clone());
        assert_eq!(store.update_global().unwrap(), 5);
        let global = layout.global_dedup();
        assert_eq!(
            sorted(&global, &[ArtifactKind::Testcase]),
            vec!["id=000001.testcase", "id=000002.testcase"]
        );
        assert_eq!(store.update_global().unwrap(), 0);

        fs::remove_file(global.join("id=000002.testcase")).unwrap();
        fs::remove_file(global.join("id=000002.pm_pool.tar.gz")).unwrap();
        touch(&global, "id=000002.deleted", b"Deleted at epoch=1");
        assert_eq!(store.update_global().unwrap(), 0);
        assert!(!global.join("id=000002.testcase").exists());
    }

    #[test]
    fn local_dedup_cascades_into_images() {
        let out = tempfile::tempdir().unwrap();
        let layout = Layout::new(out.path());
        let dirs = layout.stage(2, 1);
        dirs.create().unwrap();
        touch(&dirs.testcases, "id=000001,id=000002.testcase", b"same");
        touch(&dirs.testcases, "id=000001,id=000002,id=000003.testcase", b"same");
        touch(&dirs.images, "id=000001,id=000002,id=000003.pm_pool.tar.gz", b"i");
        let store = DedupStore::new(&layout, dirs.clone());
        let report = store.run_local().unwrap();
        assert_eq!(report.removed.len(), 1);
        assert!(sorted(&dirs.images, &[ArtifactKind::ImageCmpr]).is_empty());
    }

    #[test]
    fn crash_sites_collapse_by_recorded_hash() {
        let out = tempfile::tempdir().unwrap();
        let layout = Layout::new(out.path());
        let dirs = layout.stage(1, 1);
        dirs.create().unwrap();
        for n in &["id=1.id=000001", "id=1,id=2.id=000001"] {
            let name = ArtifactName::parse(&format!("{}.crash_site.tar.gz", n)).unwrap();
            touch(&dirs.images, &name.file_name(), n.as_bytes());
            write_sidecar(&dirs.images, &name, H).unwrap();
        }
        let mut db = CrashSiteHashes::load(&layout.crash_site_db()).unwrap();
        assert_eq!(db.absorb_sidecars(&dirs.images).unwrap(), 2);

        let store = DedupStore::new(&layout, dirs.clone());
        store.run_local().unwrap();
        assert_eq!(
            sorted(&dirs.images, &[ArtifactKind::CrashSiteCmpr]),
            vec!["id=1.id=000001.crash_site.tar.gz"]
        );
        let db = CrashSiteHashes::load(&layout.crash_site_db()).unwrap();
        assert_eq!(db.len(), 1);
        assert_eq!(db.get("id=1.id=000001.crash_site"), Some(H));
    }

    #[test]
    fn seeds_follow_stage_depth() {
        let out = tempfile::tempdir().unwrap();
        let layout = Layout::new(out.path());
        let global = layout.global_dedup();
        fs::create_dir_all(&global).unwrap();
        for l in &["id=1", "id=2", "id=1,id=5"] {
            touch(&global, &format!("{}.testcase", l), l.as_bytes());
            touch(&global, &format!("{}.pm_pool.tar.gz", l), b"i");
        }
        touch(&global, "id=1.id=000003.crash_site.tar.gz", b"c");
        // image without its test case is not a seed
        touch(&global, "id=9.pm_pool.tar.gz", b"i");

        let first = DedupStore::new(&layout, layout.stage(2, 1));
        assert_eq!(first.update_local().unwrap(), 3);
        let mut names = first
            .local_seeds()
            .unwrap()
            .into_iter()
            .map(|s| (s.name(), s.kind))
            .collect::<Vec<_>>();
        names.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            names,
            vec![
                ("id=1".to_string(), SeedKind::Testcase),
                ("id=1.id=000003".to_string(), SeedKind::CrashSite),
                ("id=2".to_string(), SeedKind::Testcase),
            ]
        );
        assert_eq!(first.update_local().unwrap(), 0);

        let second = DedupStore::new(&layout, layout.stage(2, 2));
        second.update_local().unwrap();
        let seeds = second.local_seeds().unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].name(), "id=1,id=5");

        // nothing of depth 3 or 2, falls back to depth 1
        let fourth = DedupStore::new(&layout, layout.stage(2, 4));
        fourth.update_local().unwrap();
        assert_eq!(fourth.local_seeds().unwrap()[0].name(), "id=1,id=5");
    }
}
