//! Stage 1: whole-program fuzzing from the campaign's input corpus.
use super::{
    absorb_hashes, collect_testcase, gen_crash_sites, merge_global, minimize_testcases,
    queue_entries, sample, Ctx,
};
use crate::{
    afl::{self, MASTER},
    archive,
    cshash::CrashSiteHashes,
    dedup::DedupStore,
    layout::StageDirs,
    name::{clean_queue_name, ArtifactKind, Generation, Lineage},
    pool::{FailurePolicy, Pool},
    stage_log::set_stage,
    util::remove_if_exists,
};
use anyhow::Context;
use std::{fs, path::PathBuf};

pub struct Stage1<'a> {
    ctx: &'a Ctx,
    dirs: StageDirs,
    cores: usize,
}

impl<'a> Stage1<'a> {
    pub fn new(ctx: &'a Ctx) -> anyhow::Result<Self> {
        let dirs = ctx.layout.stage(1, 1);
        dirs.create()?;
        Ok(Self {
            ctx,
            dirs,
            cores: ctx.config.campaign.stage1.cores,
        })
    }

    pub fn dirs(&self) -> &StageDirs {
        &self.dirs
    }

    /// Starts the workers, each on its own empty image with persistence disabled.
    pub fn run(&self) -> anyhow::Result<()> {
        set_stage(1, 1);
        let target = &self.ctx.target;
        let mut cmds = Vec::with_capacity(self.cores);
        for k in 0..self.cores {
            let img = target.img_loc().join(format!("stage1-{}.pm_pool", k));
            remove_if_exists(&img)?;
            target.gen_empty_img(&img)?;
            cmds.push(target.cmd_with_image(&img)?);
        }
        let pids = self
            .ctx
            .afl
            .launch(&self.ctx.indir, &self.dirs.afl, &cmds, &target.fuzz_env())?;
        crate::stage_info!("{} workers launched: {:?}", pids.len(), pids);

        if self.ctx.fi_enabled() {
            self.test_image_creation()?;
        }
        Ok(())
    }

    /// Fault-injects the creation of an empty image and checks every crash site for bugs.
    pub fn test_image_creation(&self) -> anyhow::Result<usize> {
        let target = &self.ctx.target;
        let scratch = target.scratch_dir("pmcampaign-img-creation-")?;
        let img = scratch.path().join("creation.pm_pool");
        let stdin = match self.ctx.config.target.empty_img_stdin.as_ref() {
            Some(p) => p.clone(),
            None => {
                let p = scratch.path().join("empty.input");
                fs::write(&p, b"")?;
                p
            }
        };
        let suffix = Lineage::root(Generation::new(0));
        let sites = target.inject_failures(&img, Some(&stdin), &suffix, true)?;
        let kept = self.ctx.layout.bug_sites();
        let mut bugs = 0;
        for (raw, name) in sites.iter() {
            let dest = kept.join(name.with_kind(ArtifactKind::CrashSiteCmpr).file_name());
            if let Some(evidence) = target.test_crash_site(raw, &dest)? {
                fs::create_dir_all(&kept)
                    .with_context(|| format!("failed to create {}", kept.display()))?;
                archive::compress(raw, &dest)?;
                crate::bugreport::BugReport::new(&dest, &evidence).save(&self.ctx.layout)?;
                bugs += 1;
            }
        }
        crate::stage_info!(
            "image creation tested: {} crash sites, {} possible bugs",
            sites.len(),
            bugs
        );
        Ok(bugs)
    }

    /// Harvests the master's queue into the stage. Returns the number of new test cases.
    pub fn collect(&self) -> anyhow::Result<usize> {
        set_stage(1, 1);
        let ctx = self.ctx;
        let queue = afl::queue_dir(&self.dirs.afl, MASTER);
        let entries = queue_entries(&queue)?;
        let known = CrashSiteHashes::load(&ctx.layout.crash_site_db())?;
        let images = &self.dirs.images;
        let rate = ctx.config.campaign.stage1.crash_site_rate;

        let mut collected = 0;
        {
            let mut cs_pool = Pool::new(
                "stage1-crash-sites",
                self.cores,
                FailurePolicy::ExitOnFailure,
                |(tc, lineage): (PathBuf, Lineage)| {
                    gen_crash_sites(ctx, &known, &tc, None, &lineage, images).map(|_| ())
                },
            );
            for entry in entries.iter() {
                let lineage = Lineage::root(clean_queue_name(entry)?);
                if !collect_testcase(ctx, &queue, entry, &lineage, &self.dirs, None, true)? {
                    continue;
                }
                collected += 1;
                if ctx.fi_enabled() && sample(rate) {
                    cs_pool.submit((queue.join(entry), lineage))?;
                }
            }
            cs_pool.wait()?;
        }
        let hashes = absorb_hashes(&ctx.layout, images)?;
        if collected != 0 {
            crate::stage_info!(
                "{} new test cases ({} in queue), {} crash-site hashes",
                collected,
                entries.len(),
                hashes
            );
        }
        Ok(collected)
    }

    /// Harvest, then dedup locally and merge into the global store.
    ///
    /// Without Stage 2 the global corpus is minimized whenever it grows.
    pub fn collect_and_dedup(&self) -> anyhow::Result<usize> {
        let collected = self.collect()?;
        let store = DedupStore::new(&self.ctx.layout, self.dirs.clone());
        let report = store.run_local()?;
        if !report.removed.is_empty() {
            crate::stage_info!("local dedup removed {}", report.removed.len());
        }
        if self.ctx.config.campaign.dedup.local.minimize_tc {
            minimize_testcases(self.ctx, &self.dirs.testcases, &self.dirs.images, self.cores)?;
        }
        let corpus = !self.ctx.config.campaign.stage2.enable;
        merge_global(self.ctx, &store, self.cores, corpus)?;
        Ok(collected)
    }
}
