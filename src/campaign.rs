//! Campaign state machine, rebuilt from the output directory on every pass.
use crate::{
    error::{Error, Result},
    layout::GLOBAL_DEDUP_DIR,
    name::parse_stage_dir,
    ptimer::PTimer,
    stage::{merge_global, Ctx, Stage1, Stage2},
    util::stop_soon,
};
use std::{fmt, fs, io::ErrorKind, path::Path, thread::sleep, time::Duration};

/// Where a campaign stands, `stage == 0` before anything started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CampaignState {
    pub stage: u32,
    pub iter: u32,
    pub dedup_exists: bool,
}

impl CampaignState {
    /// Latest stage directory of `outdir`. Entries starting with '@' are campaign-wide state.
    pub fn reconstruct(outdir: &Path) -> Result<Self> {
        let mut state = CampaignState::default();
        let entries = match fs::read_dir(outdir) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(state),
            Err(e) => return Err(Error::io(outdir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(outdir, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('@') {
                continue;
            }
            let (stage, iter) = parse_stage_dir(&name)?;
            if (stage, iter) > (state.stage, state.iter) {
                state.stage = stage;
                state.iter = iter;
            }
        }
        state.dedup_exists = outdir.join(GLOBAL_DEDUP_DIR).is_dir();
        Ok(state)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stage > 2 {
            return Err(Error::Corruption(format!("unknown stage in {}", self)));
        }
        if self.stage > 1 && !self.dedup_exists {
            return Err(Error::Corruption(format!(
                "{} reached without a global dedup store",
                self
            )));
        }
        Ok(())
    }

    pub fn started(&self) -> bool {
        self.stage != 0
    }
}

impl fmt::Display for CampaignState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.started() {
            write!(f, "stage {} iteration {}", self.stage, self.iter)
        } else {
            write!(f, "no stage")
        }
    }
}

pub struct Campaign<'a> {
    ctx: &'a Ctx,
    disable_stage2: bool,
}

impl<'a> Campaign<'a> {
    pub fn new(ctx: &'a Ctx) -> Self {
        Self {
            ctx,
            disable_stage2: !ctx.config.campaign.stage2.enable,
        }
    }

    pub fn state(&self) -> anyhow::Result<CampaignState> {
        let state = CampaignState::reconstruct(self.ctx.layout.outdir())?;
        state.validate()?;
        Ok(state)
    }

    /// Polls until a termination signal is received.
    pub fn run(&self) -> anyhow::Result<()> {
        let poll = Duration::from_secs(self.ctx.config.campaign.poll_interval_secs);
        while !stop_soon() {
            let state = self.step()?;
            log::debug!("pass done, {}", state);
            let mut slept = Duration::from_secs(0);
            while slept < poll && !stop_soon() {
                sleep(Duration::from_millis(100));
                slept += Duration::from_millis(100);
            }
        }
        log::info!("campaign stopped, workers keep running until the next start");
        Ok(())
    }

    /// One pass of the state machine. Returns the state it started from.
    pub fn step(&self) -> anyhow::Result<CampaignState> {
        let state = self.state()?;
        if state.started() {
            self.collect_stage1()?;
        }
        match state.stage {
            0 => self.start_stage1()?,
            1 if !self.disable_stage2 => {
                let mut grace = self.grace_timer()?;
                if grace.is_new() {
                    grace.start_new(self.ctx.config.campaign.stage1.grace_period_secs)?;
                } else if grace.expired() {
                    self.start_stage2(1)?;
                }
            }
            2 if !self.disable_stage2 => self.step_stage2(state.iter)?,
            1 | 2 => (),
            s => anyhow::bail!("stage {} not implemented", s),
        }
        Ok(state)
    }

    fn collect_stage1(&self) -> anyhow::Result<()> {
        Stage1::new(self.ctx)?.collect_and_dedup()?;
        Ok(())
    }

    fn grace_timer(&self) -> anyhow::Result<PTimer> {
        let dirs = self.ctx.layout.stage(1, 1);
        Ok(PTimer::open(&dirs.root, "")?)
    }

    fn start_stage1(&self) -> anyhow::Result<()> {
        log::info!("starting stage 1");
        let s1 = Stage1::new(self.ctx)?;
        s1.run()?;
        self.grace_timer()?
            .start_new(self.ctx.config.campaign.stage1.grace_period_secs)?;
        self.ctx.layout.write_state(1, 1)
    }

    fn start_stage2(&self, iter: u32) -> anyhow::Result<()> {
        log::info!("starting stage 2 iteration {}", iter);
        Stage2::new(self.ctx, iter)?.resume()?;
        self.ctx.layout.write_state(2, iter)
    }

    fn step_stage2(&self, iter: u32) -> anyhow::Result<()> {
        let s2 = Stage2::new(self.ctx, iter)?;
        // an iteration without seeds keeps resuming until some arrive
        if !s2.completed()? {
            return s2.resume();
        }
        log::info!("stage 2 iteration {} completed", iter);
        s2.terminate()?;
        s2.store().run_local()?;
        let campaign = &self.ctx.config.campaign;
        merge_global(
            self.ctx,
            s2.store(),
            campaign.stage2.cores,
            campaign.dedup.global.minimize_corpus,
        )?;
        // next iteration is created before this one is cleared
        let next = Stage2::new(self.ctx, iter + 1)?;
        s2.clear()?;
        next.resume()?;
        self.ctx.layout.write_state(2, iter + 1)
    }
}
