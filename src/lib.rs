//! Multi-stage fuzzing campaigns for persistent-memory programs.

#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod stage_log;
pub mod afl;
pub mod archive;
pub mod bugreport;
pub mod campaign;
pub mod config;
pub mod cshash;
pub mod dedup;
pub mod error;
pub mod layout;
pub mod name;
pub mod pool;
pub mod preflight;
pub mod ptimer;
pub mod stage;
pub mod target;
pub mod util;

pub use error::{Error, Result};

use crate::{
    campaign::{Campaign, CampaignState},
    config::Config,
    stage::Ctx,
    util::stop_req,
};
use anyhow::Context;
use std::{
    fs::create_dir_all,
    io::{self, BufRead, Write},
    os::raw::c_int,
    path::Path,
};

pub fn boot(
    config: Config,
    indir: &Path,
    outdir: &Path,
    force_resp: Option<bool>,
    cmdline: &str,
) -> anyhow::Result<()> {
    config.check().context("config error")?;
    if !indir.is_dir() {
        anyhow::bail!("input directory not found: {}", indir.display());
    }

    let state = CampaignState::reconstruct(outdir).context("failed to inspect output directory")?;
    state.validate()?;
    if state.started() {
        log::info!("existing campaign found at {}: {}", outdir.display(), state);
        if !confirm_resume(force_resp)? {
            anyhow::bail!("not resuming, pass --overwrite to start over");
        }
    }

    create_dir_all(outdir)
        .with_context(|| format!("failed to create output directory {}", outdir.display()))?;
    let ctx = Ctx::new(config, indir, outdir);
    ctx.layout.update_info(cmdline)?;
    log::info!(
        "campaign: stage1 cores {}, stage2 {}, failure injection {}",
        ctx.config.campaign.stage1.cores,
        if ctx.config.campaign.stage2.enable {
            format!("cores {}", ctx.config.campaign.stage2.cores)
        } else {
            "disabled".to_string()
        },
        ctx.fi_enabled()
    );

    setup_signal_handler();
    Campaign::new(&ctx).run()
}

fn confirm_resume(force_resp: Option<bool>) -> anyhow::Result<bool> {
    if let Some(resp) = force_resp {
        return Ok(resp);
    }
    print!("resume the campaign? [y/n] ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read response")?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

fn setup_signal_handler() {
    use signal_hook::consts::*;
    use signal_hook::iterator::exfiltrator::WithOrigin;
    use signal_hook::iterator::SignalsInfo;

    fn named_signal(sig: c_int) -> String {
        signal_hook::low_level::signal_name(sig)
            .map(|n| format!("{}({})", n, sig))
            .unwrap_or_else(|| sig.to_string())
    }

    let mut signals = match SignalsInfo::<WithOrigin>::new(TERM_SIGNALS) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("failed to install signal handler: {}", e);
            return;
        }
    };
    std::thread::spawn(move || {
        if let Some(info) = signals.into_iter().next() {
            let from = if let Some(p) = info.process {
                format!("(pid: {}, uid: {})", p.pid, p.uid)
            } else {
                "unknown".to_string()
            };
            log::info!(
                "{} recved, from: {}, cause: {:?}",
                named_signal(info.signal),
                from,
                info.cause
            );
            println!("please wait for the current pass to finish...");
            stop_req();
        }
    });
}
