//! On-disk layout of a campaign output directory.
use crate::name::stage_dir_name;
use anyhow::Context;
use std::{
    fs::{self, create_dir_all},
    path::{Path, PathBuf},
};

pub const INFO_DIR: &str = "@info";
pub const GLOBAL_DEDUP_DIR: &str = "@dedup";
pub const LOCAL_DEDUP_DIR: &str = "@dedup_sync";
pub const BUGS_DB: &str = "@bugs.db";
pub const BUGS_HUMAN: &str = "@bugs.human_readable";
pub const BUG_SITES_DIR: &str = "@bugs";
pub const CRASH_SITE_DB: &str = "@crashsitehashes.db";
pub const AFL_DIR: &str = ".afl-results";
pub const TESTCASE_DIR: &str = "testcases";
pub const IMAGE_DIR: &str = "pm_images";

#[derive(Debug, Clone)]
pub struct Layout {
    outdir: PathBuf,
}

impl Layout {
    pub fn new(outdir: &Path) -> Self {
        Self {
            outdir: outdir.to_path_buf(),
        }
    }

    pub fn outdir(&self) -> &Path {
        &self.outdir
    }

    pub fn global_dedup(&self) -> PathBuf {
        self.outdir.join(GLOBAL_DEDUP_DIR)
    }

    pub fn bugs_db(&self) -> PathBuf {
        self.outdir.join(BUGS_DB)
    }

    pub fn bugs_human(&self) -> PathBuf {
        self.outdir.join(BUGS_HUMAN)
    }

    /// Crash sites kept only because the tester found a bug on them.
    pub fn bug_sites(&self) -> PathBuf {
        self.outdir.join(BUG_SITES_DIR)
    }

    pub fn crash_site_db(&self) -> PathBuf {
        self.outdir.join(CRASH_SITE_DB)
    }

    pub fn stage(&self, stage: u32, iter: u32) -> StageDirs {
        let root = self.outdir.join(stage_dir_name(stage, iter));
        StageDirs {
            stage,
            iter,
            afl: root.join(AFL_DIR),
            testcases: root.join(TESTCASE_DIR),
            images: root.join(IMAGE_DIR),
            dedup_sync: root.join(LOCAL_DEDUP_DIR),
            root,
        }
    }

    /// Records start time (first start only) and the command line of this invocation.
    pub fn update_info(&self, cmdline: &str) -> anyhow::Result<()> {
        let info = self.outdir.join(INFO_DIR);
        create_dir_all(&info).with_context(|| format!("failed to create {}", info.display()))?;
        let starttime = info.join("starttime");
        if !starttime.exists() {
            fs::write(&starttime, crate::util::epoch_secs().to_string())
                .context("failed to write starttime")?;
        }
        fs::write(info.join("cmd"), cmdline).context("failed to write cmd")
    }

    pub fn write_state(&self, stage: u32, iter: u32) -> anyhow::Result<()> {
        let info = self.outdir.join(INFO_DIR);
        create_dir_all(&info).with_context(|| format!("failed to create {}", info.display()))?;
        fs::write(info.join("currentstate"), stage_dir_name(stage, iter))
            .context("failed to write current state")
    }
}

#[derive(Debug, Clone)]
pub struct StageDirs {
    pub stage: u32,
    pub iter: u32,
    pub root: PathBuf,
    pub afl: PathBuf,
    pub testcases: PathBuf,
    pub images: PathBuf,
    pub dedup_sync: PathBuf,
}

impl StageDirs {
    pub fn create(&self) -> anyhow::Result<()> {
        for d in [&self.afl, &self.testcases, &self.images, &self.dedup_sync].iter() {
            if d.is_file() {
                anyhow::bail!("{} is not a directory", d.display());
            }
            create_dir_all(d).with_context(|| format!("failed to create {}", d.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_dirs_and_info() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let s = layout.stage(2, 3);
        assert!(s.root.ends_with("stage=2,iter=3"));
        s.create().unwrap();
        assert!(s.dedup_sync.is_dir() && s.testcases.is_dir() && s.images.is_dir());

        layout.update_info("pmcampaign in out cfg.yml").unwrap();
        let start = fs::read_to_string(dir.path().join("@info/starttime")).unwrap();
        layout.update_info("pmcampaign again").unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("@info/starttime")).unwrap(),
            start
        );
        layout.write_state(2, 3).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("@info/currentstate")).unwrap(),
            "stage=2,iter=3"
        );
    }
}
