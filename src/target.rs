//! One-shot invocations of the target program: image generation, failure injection and
//! crash-site testing.
use crate::{
    archive,
    config::{Config, Env},
    name::{substitute_image, ArtifactKind, ArtifactName, Lineage},
};
use anyhow::Context;
use nix::{
    sys::signal::{killpg, Signal},
    unistd::{setsid, Pid},
};
use std::{
    fmt,
    fs::{self, File},
    os::unix::{prelude::CommandExt, process::ExitStatusExt},
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    thread::sleep,
    time::{Duration, Instant},
};

/// Generous bound for one-shot target runs. Hitting it counts as success.
pub const ONESHOT_TIMEOUT: Duration = Duration::from_secs(30);

/// Env telling the failure-injection build how to name its crash sites.
pub const FI_SUFFIX_ENV: &str = "FI_IMG_SUFFIX";

// signals of a tester that point at a bug in recovery code
const BUG_SIGNALS: [Signal; 5] = [
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGBUS,
    Signal::SIGSEGV,
    Signal::SIGSYS,
];

#[derive(Debug, Clone, Copy)]
pub enum RunOutcome {
    Exited(ExitStatus),
    TimedOut,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        match self {
            RunOutcome::Exited(s) => s.success(),
            RunOutcome::TimedOut => true,
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            RunOutcome::Exited(s) => s.signal(),
            RunOutcome::TimedOut => None,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Exited(s) => write!(f, "{}", s),
            RunOutcome::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Runs `cmd` in its own session, killing the whole session after `timeout`.
pub fn run_oneshot(
    cmd: &[String],
    env: &Env,
    stdin: Option<&Path>,
    timeout: Duration,
) -> anyhow::Result<RunOutcome> {
    let (bin, args) = cmd.split_first().context("empty command")?;
    let mut c = Command::new(bin);
    c.args(args)
        .envs(env)
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    match stdin {
        Some(p) => {
            let f = File::open(p).with_context(|| format!("failed to open {}", p.display()))?;
            c.stdin(f);
        }
        None => {
            c.stdin(Stdio::null());
        }
    }
    unsafe {
        c.pre_exec(|| {
            let _ = setsid();
            Ok(())
        });
    }
    log::debug!("run: {:?}", c);

    let mut child = c
        .spawn()
        .with_context(|| format!("failed to spawn {:?}", cmd))?;
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().context("failed to wait child")? {
            return Ok(RunOutcome::Exited(status));
        }
        if Instant::now() >= deadline {
            let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
            let _ = child.kill();
            let _ = child.wait();
            log::warn!(
                "{:?} timed out after {}s, treated as success",
                cmd,
                timeout.as_secs()
            );
            return Ok(RunOutcome::TimedOut);
        }
        sleep(Duration::from_millis(10));
    }
}

/// Evidence of a tester dying on a crash site.
#[derive(Debug, Clone)]
pub struct BugEvidence {
    pub signal: i32,
    pub cmd: Vec<String>,
    pub env: Env,
}

#[derive(Debug, Clone)]
pub struct Target {
    cmd: Vec<String>,
    env: Env,
    persist_enable: Env,
    persist_disable: Env,
    empty_img_stdin: Option<PathBuf>,
    img_loc: PathBuf,
    fi_cmd: Vec<String>,
    fi_create_env: Env,
    fi_dont_create_env: Env,
    tester: Option<Vec<String>>,
}

impl Target {
    pub fn new(config: &Config) -> Self {
        let fi = &config.campaign.failure_injection;
        Self {
            cmd: config.target.cmd.clone(),
            env: config.target.env.clone(),
            persist_enable: config.target.persist_enable_env.clone(),
            persist_disable: config.target.persist_disable_env.clone(),
            empty_img_stdin: config.target.empty_img_stdin.clone(),
            img_loc: config.campaign.img_loc.clone(),
            fi_cmd: fi.cmd.clone().unwrap_or_else(|| config.target.cmd.clone()),
            fi_create_env: fi.create_env.clone(),
            fi_dont_create_env: fi.dont_create_env.clone(),
            tester: fi.test_with.clone(),
        }
    }

    pub fn img_loc(&self) -> &Path {
        &self.img_loc
    }

    pub fn cmd_with_image(&self, img: &Path) -> anyhow::Result<Vec<String>> {
        Ok(substitute_image(&self.cmd, img)?)
    }

    /// Target env with the target's writes to the image disabled.
    pub fn fuzz_env(&self) -> Env {
        merge(&self.env, &self.persist_disable)
    }

    pub fn scratch_dir(&self, prefix: &str) -> anyhow::Result<tempfile::TempDir> {
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.img_loc)
            .with_context(|| format!("failed to create scratch dir in {}", self.img_loc.display()))
    }

    /// Creates an empty image at `img` by running the target without input.
    pub fn gen_empty_img(&self, img: &Path) -> anyhow::Result<()> {
        let cmd = self.cmd_with_image(img)?;
        let env = merge(&self.env, &self.persist_enable);
        let outcome = run_oneshot(&cmd, &env, self.empty_img_stdin.as_deref(), ONESHOT_TIMEOUT)?;
        if !outcome.success() {
            anyhow::bail!("empty image generation failed ({}): {:?}", outcome, cmd);
        }
        if !img.exists() {
            anyhow::bail!("target did not create an image at {}", img.display());
        }
        Ok(())
    }

    /// Replays `testcase` onto `base` (or a new image) and stores the result compressed in
    /// `dest_dir` under `lineage`.
    pub fn gen_img(
        &self,
        testcase: &Path,
        base: Option<&Path>,
        lineage: &Lineage,
        dest_dir: &Path,
    ) -> anyhow::Result<PathBuf> {
        let scratch = self.scratch_dir("pmcampaign-img-")?;
        let name = ArtifactName::new(lineage.clone(), ArtifactKind::Image);
        let img = scratch.path().join(name.file_name());
        if let Some(base) = base {
            archive::unpack_to(base, &img)?;
        }
        let cmd = self.cmd_with_image(&img)?;
        let env = merge(&self.env, &self.persist_enable);
        let outcome = run_oneshot(&cmd, &env, Some(testcase), ONESHOT_TIMEOUT)?;
        if !outcome.success() {
            anyhow::bail!(
                "image generation for {} failed ({}): {:?}",
                testcase.display(),
                outcome,
                cmd
            );
        }
        if !img.exists() {
            anyhow::bail!(
                "image generation for {} produced no image at {}",
                testcase.display(),
                img.display()
            );
        }
        let dest = dest_dir.join(name.with_kind(ArtifactKind::ImageCmpr).file_name());
        archive::compress(&img, &dest)?;
        Ok(dest)
    }

    /// Runs the failure-injection build on `img` and returns the raw crash sites it left next
    /// to `img`, renamed into `suffix`'s lineage.
    ///
    /// With `create`, faults are injected while the image is being created, `img` must not
    /// exist yet.
    pub fn inject_failures(
        &self,
        img: &Path,
        testcase: Option<&Path>,
        suffix: &Lineage,
        create: bool,
    ) -> anyhow::Result<Vec<(PathBuf, ArtifactName)>> {
        let cmd = substitute_image(&self.fi_cmd, img)?;
        let mut env = merge(&self.env, &self.persist_enable);
        env.extend(if create {
            self.fi_create_env.clone()
        } else {
            self.fi_dont_create_env.clone()
        });
        env.insert(FI_SUFFIX_ENV.to_string(), suffix.to_string());
        let outcome = run_oneshot(&cmd, &env, testcase, ONESHOT_TIMEOUT)?;
        if !outcome.success() {
            log::debug!("failure injection run ended with {}: {:?}", outcome, cmd);
        }

        let dir = img.parent().context("image path without parent")?;
        let stem = img
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.trim_end_matches(ArtifactKind::Image.suffix()))
            .context("bad image path")?;
        let prefix = format!("{}.", stem);
        let mut sites = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
            let path = entry?.path();
            let raw = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if !raw.ends_with(ArtifactKind::CrashSite.suffix()) {
                continue;
            }
            let clean = raw.strip_prefix(&prefix).unwrap_or(raw);
            let name = ArtifactName::parse(clean)
                .with_context(|| format!("unexpected crash site {}", path.display()))?;
            if name.kind != ArtifactKind::CrashSite {
                anyhow::bail!("unexpected crash site {}", path.display());
            }
            sites.push((path, name));
        }
        Ok(sites)
    }

    pub fn has_tester(&self) -> bool {
        self.tester.is_some()
    }

    /// Runs the tester on a copy of `crash_site`, `Some` if it died of a bug signal.
    ///
    /// The evidence names `kept_at`, where the crash site is stored once testing is done.
    pub fn test_crash_site(
        &self,
        crash_site: &Path,
        kept_at: &Path,
    ) -> anyhow::Result<Option<BugEvidence>> {
        let tester = match self.tester.as_ref() {
            Some(t) => t,
            None => return Ok(None),
        };
        let scratch = self.scratch_dir("pmcampaign-test-")?;
        let name = crash_site.file_name().context("bad crash site path")?;
        let copy = scratch.path().join(name);
        if crash_site.is_dir() {
            copy_dir(crash_site, &copy)?;
        } else {
            fs::copy(crash_site, &copy)
                .with_context(|| format!("failed to copy {}", crash_site.display()))?;
        }
        let cmd = substitute_image(tester, &copy)?;
        let outcome = run_oneshot(&cmd, &self.env, None, ONESHOT_TIMEOUT)?;
        let signal = match outcome.signal() {
            Some(s) => s,
            None => return Ok(None),
        };
        if BUG_SIGNALS.iter().any(|s| *s as i32 == signal) {
            let cmd = substitute_image(tester, kept_at)?;
            Ok(Some(BugEvidence {
                signal,
                cmd,
                env: self.env.clone(),
            }))
        } else {
            Ok(None)
        }
    }
}

fn merge(base: &Env, extra: &Env) -> Env {
    let mut env = base.clone();
    env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

fn copy_dir(src: &Path, dest: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("failed to read {}", src.display()))? {
        let path = entry?.path();
        let to = dest.join(path.file_name().context("bad path")?);
        if path.is_dir() {
            copy_dir(&path, &to)?;
        } else {
            fs::copy(&path, &to).with_context(|| format!("failed to copy {}", path.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{CampaignConfig, TargetConfig};

    pub(crate) fn sh_config(img_loc: &Path, script: &str) -> Config {
        Config {
            target: TargetConfig {
                cmd: vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    script.to_string(),
                    "target".to_string(),
                    "__POOL_IMAGE__".to_string(),
                ],
                env: Env::new(),
                persist_enable_env: vec![("PERSIST".to_string(), "1".to_string())]
                    .into_iter()
                    .collect(),
                persist_disable_env: vec![("PERSIST".to_string(), "0".to_string())]
                    .into_iter()
                    .collect(),
                tmout: "1000+".to_string(),
                mlimit: "none".to_string(),
                empty_img_stdin: None,
            },
            campaign: CampaignConfig {
                bin_dir: PathBuf::from("/nonexistent"),
                img_loc: img_loc.to_path_buf(),
                poll_interval_secs: 1,
                stage1: Default::default(),
                stage2: Default::default(),
                dedup: Default::default(),
                failure_injection: Default::default(),
                prioritize_pm_path: Default::default(),
            },
        }
    }

    // appends stdin to the image when persistence is on
    pub(crate) const APPEND: &str = r#"if [ "$PERSIST" = 1 ]; then cat >> "$1"; else cat > /dev/null; fi"#;

    #[test]
    fn gen_img_replays_onto_base() {
        let dir = tempfile::tempdir().unwrap();
        let target = Target::new(&sh_config(dir.path(), APPEND));
        let out = dir.path().join("pm_images");
        fs::create_dir_all(&out).unwrap();
        let tc1 = dir.path().join("id=000001.testcase");
        fs::write(&tc1, b"hello ").unwrap();
        let l1 = Lineage::parse("id=000001").unwrap();
        let img1 = target.gen_img(&tc1, None, &l1, &out).unwrap();
        assert!(img1.ends_with("id=000001.pm_pool.tar.gz"));

        let tc2 = dir.path().join("id=000001,id=000002.testcase");
        fs::write(&tc2, b"world").unwrap();
        let l2 = Lineage::parse("id=000001,id=000002").unwrap();
        let img2 = target.gen_img(&tc2, Some(&img1), &l2, &out).unwrap();

        let check = dir.path().join("check.pm_pool");
        archive::unpack_to(&img2, &check).unwrap();
        assert_eq!(fs::read(&check).unwrap(), b"hello world");
    }

    #[test]
    fn failed_generation_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let target = Target::new(&sh_config(dir.path(), "exit 3"));
        let tc = dir.path().join("id=000001.testcase");
        fs::write(&tc, b"x").unwrap();
        let l = Lineage::parse("id=000001").unwrap();
        assert!(target.gen_img(&tc, None, &l, dir.path()).is_err());

        let target = Target::new(&sh_config(dir.path(), "true"));
        let err = target.gen_img(&tc, None, &l, dir.path()).unwrap_err();
        assert!(err.to_string().contains("produced no image"));
    }

    #[test]
    fn timeout_counts_as_success() {
        let cmd = vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 5".to_string()];
        let outcome = run_oneshot(&cmd, &Env::new(), None, Duration::from_millis(200)).unwrap();
        assert!(matches!(outcome, RunOutcome::TimedOut));
        assert!(outcome.success());
    }

    #[test]
    fn injected_crash_sites_are_renamed() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"for i in 000001 000002; do echo "$i" > "${1%.pm_pool}.$FI_IMG_SUFFIX.id=$i.crash_site"; done"#;
        let target = Target::new(&sh_config(dir.path(), script));
        let scratch = dir.path().join("fi");
        fs::create_dir_all(&scratch).unwrap();
        let img = scratch.join("fi.pm_pool");
        let suffix = Lineage::parse("id=000007,id=000003").unwrap();
        let mut sites = target.inject_failures(&img, None, &suffix, true).unwrap();
        sites.sort_by(|a, b| a.0.cmp(&b.0));
        let names = sites
            .iter()
            .map(|(_, n)| n.file_name())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "id=000007,id=000003.id=000001.crash_site",
                "id=000007,id=000003.id=000002.crash_site"
            ]
        );
        assert_eq!(sites[0].1.lineage.parent().unwrap(), suffix);
    }

    #[test]
    fn tester_signal_is_a_bug() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sh_config(dir.path(), APPEND);
        config.campaign.failure_injection.test_with = Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "kill -SEGV $$".to_string(),
            "tester".to_string(),
            "__POOL_IMAGE__".to_string(),
        ]);
        let target = Target::new(&config);
        let cs = dir.path().join("id=1.id=000001.crash_site");
        fs::write(&cs, b"img").unwrap();
        let kept = dir.path().join("id=1.id=000001.crash_site.tar.gz");
        let bug = target.test_crash_site(&cs, &kept).unwrap().unwrap();
        assert_eq!(bug.signal, Signal::SIGSEGV as i32);
        assert_eq!(bug.cmd.last().unwrap(), &kept.display().to_string());

        config.campaign.failure_injection.test_with = Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "exit 1".to_string(),
            "tester".to_string(),
            "__POOL_IMAGE__".to_string(),
        ]);
        let target = Target::new(&config);
        assert!(target.test_crash_site(&cs, &kept).unwrap().is_none());
    }
}
