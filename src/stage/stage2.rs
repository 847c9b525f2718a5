//! Stage 2: one worker per seed image, each fuzzing the program state the seed left behind.
use super::{
    absorb_hashes, clean_up_uncompressed, collect_testcase, collected, gen_crash_sites,
    minimize_corpus, minimize_testcases, queue_entries, sample, Ctx,
};
use crate::{
    afl::{self, MASTER},
    archive,
    cshash::CrashSiteHashes,
    dedup::{DedupStore, Seed, SeedKind},
    error::Error,
    layout::StageDirs,
    name::{clean_queue_name, existing_image, ArtifactKind, ArtifactName, Join, Lineage, Siblings},
    pool::{FailurePolicy, Pool},
    ptimer::PTimer,
    stage_log::set_stage,
    util::remove_if_exists,
};
use anyhow::Context;
use std::{
    fs,
    path::{Path, PathBuf},
};

pub struct Stage2<'a> {
    ctx: &'a Ctx,
    store: DedupStore<'a>,
    iter: u32,
    cores: usize,
}

impl<'a> Stage2<'a> {
    pub fn new(ctx: &'a Ctx, iter: u32) -> anyhow::Result<Self> {
        let dirs = ctx.layout.stage(2, iter);
        dirs.create()?;
        Ok(Self {
            ctx,
            store: DedupStore::new(&ctx.layout, dirs),
            iter,
            cores: ctx.config.campaign.stage2.cores,
        })
    }

    pub fn dirs(&self) -> &StageDirs {
        self.store.dirs()
    }

    pub fn store(&self) -> &DedupStore<'a> {
        &self.store
    }

    fn worker_dir(&self, seed: &str) -> PathBuf {
        self.dirs().afl.join(seed)
    }

    fn scratch_dir(&self, seed: &str) -> PathBuf {
        self.ctx
            .target
            .img_loc()
            .join(format!("stage2-input-{}", seed))
    }

    fn timer(&self, seed: &Seed) -> anyhow::Result<PTimer> {
        Ok(PTimer::open(&self.dirs().dedup_sync, &seed.name())?)
    }

    fn harvest_cores(&self) -> usize {
        (self.cores / 2).max(1)
    }

    /// Seeds this iteration runs. Crash sites only run with failure injection enabled.
    fn seeds(&self) -> anyhow::Result<Vec<Seed>> {
        let fi = self.ctx.fi_enabled();
        Ok(self
            .store
            .local_seeds()?
            .into_iter()
            .filter(|s| fi || s.kind == SeedKind::Testcase)
            .collect())
    }

    /// Worker slots for test-case seeds and crash-site seeds.
    fn capacity(&self) -> (usize, usize) {
        if self.ctx.fi_enabled() {
            let half = (self.cores / 2).max(1);
            (half, half)
        } else {
            (self.cores, 0)
        }
    }

    /// Pulls in new seeds, retires expired ones and starts new ones while slots are free.
    pub fn resume(&self) -> anyhow::Result<()> {
        set_stage(2, self.iter);
        let copied = self.store.update_local()?;
        if copied != 0 {
            crate::stage_info!("{} new seeds", copied);
        }
        let seeds = self.seeds()?;

        let mut pending = Vec::new();
        for seed in seeds.iter() {
            let timer = self.timer(seed)?;
            if timer.is_new() {
                pending.push(seed);
            } else if timer.expired() {
                self.terminate_seed(seed)?;
            } else {
                self.check_alive(seed)?;
            }
        }

        let (cap_tc, cap_cs) = self.capacity();
        let (mut running_tc, mut running_cs) = (0, 0);
        for seed in seeds.iter() {
            if afl::pid_file(&self.worker_dir(&seed.name()), MASTER).exists() {
                match seed.kind {
                    SeedKind::Testcase => running_tc += 1,
                    SeedKind::CrashSite => running_cs += 1,
                }
            }
        }
        for seed in pending {
            let (running, cap) = match seed.kind {
                SeedKind::Testcase => (&mut running_tc, cap_tc),
                SeedKind::CrashSite => (&mut running_cs, cap_cs),
            };
            if *running >= cap {
                continue;
            }
            let mut timer = self.timer(seed)?;
            timer.start_new(self.ctx.config.campaign.stage2.tc_timeout)?;
            self.run_seed(seed)?;
            *running += 1;
        }
        crate::stage_debug!(
            "workers: {}/{} test cases, {}/{} crash sites, {} seeds",
            running_tc,
            cap_tc,
            running_cs,
            cap_cs,
            seeds.len()
        );
        Ok(())
    }

    /// A started, unexpired seed must have a live worker.
    fn check_alive(&self, seed: &Seed) -> anyhow::Result<()> {
        let pf = afl::pid_file(&self.worker_dir(&seed.name()), MASTER);
        match afl::read_pid(&pf)? {
            Some(pid) if !afl::worker_alive(pid) => Err(Error::WorkerFailure {
                pool: format!("stage2.{}", self.iter),
                job: seed.name(),
                pid: pid.as_raw(),
                status: "worker died before its timer expired".to_string(),
            }
            .into()),
            Some(_) => Ok(()),
            None => {
                // interrupted between starting the timer and the worker
                crate::stage_warn!("worker of {} missing, restarting", seed.name());
                self.run_seed(seed)
            }
        }
    }

    /// Unpacks the seed into its scratch dir and starts its worker there.
    pub fn run_seed(&self, seed: &Seed) -> anyhow::Result<()> {
        let name = seed.name();
        let scratch = self.scratch_dir(&name);
        remove_if_exists(&scratch)?;
        fs::create_dir_all(&scratch)
            .with_context(|| format!("failed to create {}", scratch.display()))?;
        let raw = match seed.kind {
            SeedKind::Testcase => ArtifactKind::Image,
            SeedKind::CrashSite => ArtifactKind::CrashSite,
        };
        let img = scratch.join(ArtifactName::new(seed.lineage.clone(), raw).file_name());
        archive::unpack_to(&seed.image, &img)?;

        let target = &self.ctx.target;
        let cmd = target.cmd_with_image(&img)?;
        let pids = self.ctx.afl.launch(
            &self.ctx.indir,
            &self.worker_dir(&name),
            &[cmd],
            &target.fuzz_env(),
        )?;
        crate::stage_info!("seed {} started, pid {:?}", name, pids);
        Ok(())
    }

    /// Stops the seed's worker and harvests its queue. Does nothing for a stopped worker.
    pub fn terminate_seed(&self, seed: &Seed) -> anyhow::Result<()> {
        let name = seed.name();
        let pf = afl::pid_file(&self.worker_dir(&name), MASTER);
        let pid = match afl::stop_worker(&pf)? {
            Some(pid) => pid,
            None => return Ok(()),
        };
        remove_if_exists(&self.scratch_dir(&name))?;
        let n = self.harvest(&seed.lineage, &seed.image)?;
        self.finish_harvest()?;
        crate::stage_info!("seed {} (pid {}) retired, {} test cases", name, pid, n);
        Ok(())
    }

    /// Collects the queue of `parent`'s worker. Children replay onto `parent_img`.
    fn harvest(&self, parent: &Lineage, parent_img: &Path) -> anyhow::Result<usize> {
        let ctx = self.ctx;
        let dirs = self.dirs();
        let queue = afl::queue_dir(&self.worker_dir(&parent.to_string()), MASTER);
        let entries = queue_entries(&queue)?;
        let known = CrashSiteHashes::load(&ctx.layout.crash_site_db())?;
        let rate = ctx.config.campaign.stage2.crash_site_rate;
        let cores = self.harvest_cores();

        let mut todo = Vec::new();
        for entry in entries {
            let child = parent.child(clean_queue_name(&entry)?, Join::Stage);
            if !collected(&Siblings::new(&dirs.testcases, child.clone())) {
                todo.push((entry, child));
            }
        }
        if todo.is_empty() {
            return Ok(0);
        }

        let mut tc_pool = Pool::new(
            "stage2-collect",
            cores,
            FailurePolicy::ExitOnFailure,
            |(entry, child): (String, Lineage)| {
                collect_testcase(ctx, &queue, &entry, &child, dirs, Some(parent_img), false)
                    .map(|_| ())
            },
        );
        let mut cs_pool = Pool::new(
            "stage2-crash-sites",
            cores,
            FailurePolicy::ExitOnFailure,
            |(tc, child): (PathBuf, Lineage)| {
                gen_crash_sites(ctx, &known, &tc, Some(parent_img), &child, &dirs.images)
                    .map(|_| ())
            },
        );
        let n = todo.len();
        for (entry, child) in todo {
            if ctx.fi_enabled() && sample(rate) {
                cs_pool.submit((queue.join(&entry), child.clone()))?;
            }
            tc_pool.submit((entry, child))?;
        }
        tc_pool.wait()?;
        cs_pool.wait()?;
        Ok(n)
    }

    /// Post-harvest upkeep of the iteration's image and test-case dirs.
    fn finish_harvest(&self) -> anyhow::Result<()> {
        let dirs = self.dirs();
        let cleaned = clean_up_uncompressed(&dirs.images)?;
        if cleaned != 0 {
            crate::stage_warn!("{} uncompressed leftovers removed", cleaned);
        }
        absorb_hashes(&self.ctx.layout, &dirs.images)?;
        let report = self.store.run_local()?;
        if !report.removed.is_empty() {
            crate::stage_info!("local dedup removed {}", report.removed.len());
        }
        let local = &self.ctx.config.campaign.dedup.local;
        if local.minimize_corpus {
            let n = minimize_corpus(self.ctx, &dirs.testcases, &[dirs.images.clone()])?;
            if n != 0 {
                crate::stage_info!("corpus minimization removed {}", n);
            }
        }
        if local.minimize_tc {
            minimize_testcases(self.ctx, &dirs.testcases, &dirs.images, self.harvest_cores())?;
        }
        Ok(())
    }

    /// Harvests the queues of workers that are not running any more, e.g. from a previous run.
    pub fn collect(&self) -> anyhow::Result<usize> {
        set_stage(2, self.iter);
        let dirs = self.dirs();
        let entries = match fs::read_dir(&dirs.afl) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", dirs.afl.display())),
        };
        let mut worker_dirs = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) if path.is_dir() && !n.starts_with('.') => n.to_string(),
                _ => continue,
            };
            if afl::pid_file(&path, MASTER).exists() {
                continue;
            }
            worker_dirs.push(name);
        }
        worker_dirs.sort();

        let mut n = 0;
        for name in worker_dirs {
            let lineage = Lineage::parse(&name)?;
            let parent_img = match existing_image(&lineage, &dirs.dedup_sync) {
                Ok(p) => p,
                Err(e) => {
                    crate::stage_warn!("skipping orphaned worker {}: {}", name, e);
                    continue;
                }
            };
            n += self.harvest(&lineage, &parent_img)?;
        }
        if n != 0 {
            self.finish_harvest()?;
            crate::stage_info!("{} orphaned test cases collected", n);
        }
        Ok(n)
    }

    /// True once every seed ran for its full time slice.
    ///
    /// An iteration without seeds is never completed. It waits for Stage 1 to deliver some
    /// instead of advancing to further empty iterations.
    pub fn completed(&self) -> anyhow::Result<bool> {
        let seeds = self.seeds()?;
        if seeds.is_empty() {
            crate::stage_debug!("no seeds yet, {}", self.dirs().dedup_sync.display());
            return Ok(false);
        }
        for seed in seeds.iter() {
            let timer = self.timer(seed)?;
            if timer.is_new() || !timer.expired() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Retires every expired seed, then picks up orphaned queues.
    pub fn terminate(&self) -> anyhow::Result<()> {
        set_stage(2, self.iter);
        for seed in self.seeds()?.iter() {
            let timer = self.timer(seed)?;
            if !timer.is_new() && timer.expired() {
                self.terminate_seed(seed)?;
            }
        }
        self.collect()?;
        Ok(())
    }

    /// Removes the iteration with its scratch images.
    pub fn clear(self) -> anyhow::Result<()> {
        for seed in self.store.local_seeds()?.iter() {
            remove_if_exists(&self.scratch_dir(&seed.name()))?;
        }
        let root = &self.dirs().root;
        remove_if_exists(root)?;
        crate::stage_info!("{} cleared", root.display());
        Ok(())
    }
}
