use crate::name::IMG_PLACEHOLDER;
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub type Env = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{}': {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("bad config '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub target: TargetConfig,
    pub campaign: CampaignConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// Target command line, one token containing the image placeholder.
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: Env,
    pub persist_enable_env: Env,
    pub persist_disable_env: Env,
    /// Per-execution timeout handed to the fuzzing worker, e.g. "1000+".
    #[serde(default = "default_tmout")]
    pub tmout: String,
    #[serde(default = "default_mlimit")]
    pub mlimit: String,
    /// Fed as stdin when creating an empty image.
    #[serde(default)]
    pub empty_img_stdin: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CampaignConfig {
    /// Directory holding afl-fuzz and afl-tmin.
    pub bin_dir: PathBuf,
    /// Scratch directory for images, usually on a persistent-memory mount.
    pub img_loc: PathBuf,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub stage1: Stage1Config,
    #[serde(default)]
    pub stage2: Stage2Config,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub failure_injection: FailureInjectionConfig,
    #[serde(default)]
    pub prioritize_pm_path: PmPathConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Stage1Config {
    pub cores: usize,
    pub grace_period_secs: u64,
    pub crash_site_rate: f64,
}

impl Default for Stage1Config {
    fn default() -> Self {
        Self {
            cores: 1,
            grace_period_secs: 5,
            crash_site_rate: 0.05,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Stage2Config {
    pub enable: bool,
    pub cores: usize,
    /// Seconds each seed's worker runs before it is harvested.
    pub tc_timeout: u64,
    pub crash_site_rate: f64,
}

impl Default for Stage2Config {
    fn default() -> Self {
        Self {
            enable: true,
            cores: 1,
            tc_timeout: 600,
            crash_site_rate: 0.02,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DedupConfig {
    pub local: MinimizeConfig,
    pub global: MinimizeConfig,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MinimizeConfig {
    /// Minimize each test case with afl-tmin.
    pub minimize_tc: bool,
    /// Drop test cases adding no coverage with afl-cmin.
    pub minimize_corpus: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FailureInjectionConfig {
    pub enable: bool,
    /// Failure-injection build of the target, defaults to the target command.
    pub cmd: Option<Vec<String>>,
    /// Recovery tester run against every crash site.
    pub test_with: Option<Vec<String>>,
    /// Env of fault injection while the image is being created.
    pub create_env: Env,
    /// Env of fault injection on an existing image.
    pub dont_create_env: Env,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PmPathConfig {
    pub enable: bool,
    pub enable_env: Env,
    pub disable_env: Env,
}

fn default_tmout() -> String {
    "1000+".to_string()
}

fn default_mlimit() -> String {
    "none".to_string()
}

fn default_poll_interval() -> u64 {
    2
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn check(&self) -> anyhow::Result<()> {
        let campaign = &self.campaign;
        if !campaign.bin_dir.join("afl-fuzz").is_file() {
            anyhow::bail!("afl-fuzz not found in bin_dir: {}", campaign.bin_dir.display());
        }
        if !campaign.img_loc.is_dir() {
            anyhow::bail!("bad img_loc: {}", campaign.img_loc.display());
        }
        check_cmd("target", &self.target.cmd)?;
        if let Some(stdin) = self.target.empty_img_stdin.as_ref() {
            if !stdin.is_file() {
                anyhow::bail!("bad empty_img_stdin: {}", stdin.display());
            }
        }
        if campaign.stage1.cores == 0 || campaign.stage2.cores == 0 {
            anyhow::bail!("cores of each stage should be at least 1");
        }
        for (name, rate) in &[
            ("stage1.crash_site_rate", campaign.stage1.crash_site_rate),
            ("stage2.crash_site_rate", campaign.stage2.crash_site_rate),
        ] {
            if !(0.0..=1.0).contains(rate) {
                anyhow::bail!("{} should be in range [0-1]: {}", name, rate);
            }
        }
        if campaign.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs should be at least 1");
        }
        let fi = &campaign.failure_injection;
        if fi.enable {
            if let Some(cmd) = fi.cmd.as_ref() {
                check_cmd("failure_injection.cmd", cmd)?;
            }
            match fi.test_with.as_ref() {
                Some(cmd) => check_cmd("failure_injection.test_with", cmd)?,
                None => anyhow::bail!("failure injection enabled without failure_injection.test_with"),
            }
        }
        Ok(())
    }
}

fn check_cmd(what: &str, cmd: &[String]) -> anyhow::Result<()> {
    let bin = match cmd.first() {
        Some(b) => Path::new(b),
        None => anyhow::bail!("empty {} command", what),
    };
    if !bin.is_file() {
        anyhow::bail!("bad {} binary: {}", what, bin.display());
    }
    if !cmd.iter().any(|a| a.contains(IMG_PLACEHOLDER)) {
        anyhow::bail!("{} command has no '{}': {:?}", what, IMG_PLACEHOLDER, cmd);
    }
    Ok(())
}
