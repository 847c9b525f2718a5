use anyhow::Context;
use env_logger::{Env, TimestampPrecision};
use pmcampaign::{boot, config::Config, preflight, util::remove_if_exists};
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "pmcampaign",
    about = "Multi-stage fuzzing campaigns for persistent-memory programs."
)]
struct Settings {
    /// Directory of initial test cases.
    indir: PathBuf,
    /// Output directory of the campaign, resumed if it exists.
    outdir: PathBuf,
    /// Campaign configuration in YAML.
    config: PathBuf,
    /// Fuzzing workers of stage 1, overrides the config.
    #[structopt(long)]
    cores_stage1: Option<usize>,
    /// Fuzzing workers of stage 2, overrides the config.
    #[structopt(long)]
    cores_stage2: Option<usize>,
    /// Run stage 1 only.
    #[structopt(long)]
    disable_stage2: bool,
    /// Remove the output directory before starting.
    #[structopt(long)]
    overwrite: bool,
    /// Run the host checks and exit.
    #[structopt(long)]
    checks_only: bool,
    /// Answer to the resume prompt, y or n.
    #[structopt(long, parse(try_from_str = parse_resp))]
    force_resp: Option<bool>,
    /// Verbose logging.
    #[structopt(short, long)]
    verbose: bool,
}

fn parse_resp(s: &str) -> Result<bool, String> {
    match s {
        "y" | "Y" => Ok(true),
        "n" | "N" => Ok(false),
        _ => Err(format!("expected y or n, got '{}'", s)),
    }
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::from_args();

    let log_env = Env::new()
        .filter_or("PMCAMPAIGN_LOG", if settings.verbose { "debug" } else { "info" })
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    preflight::check().context("preflight checks failed")?;
    if settings.checks_only {
        return Ok(());
    }

    let mut config = Config::load(&settings.config)?;
    if let Some(n) = settings.cores_stage1 {
        config.campaign.stage1.cores = n;
    }
    if let Some(n) = settings.cores_stage2 {
        config.campaign.stage2.cores = n;
    }
    if settings.disable_stage2 {
        config.campaign.stage2.enable = false;
    }

    if settings.overwrite && remove_if_exists(&settings.outdir)? {
        log::warn!("removed {}", settings.outdir.display());
    }

    let cmdline = std::env::args().collect::<Vec<_>>().join(" ");
    boot(
        config,
        &settings.indir,
        &settings.outdir,
        settings.force_resp,
        &cmdline,
    )
}
