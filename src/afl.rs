//! Fuzzing workers (`afl-fuzz`) and the test-case minimizer (`afl-tmin`).
use crate::config::{Config, Env};
use anyhow::Context;
use nix::{
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag},
    },
    unistd::{setsid, Pid},
};
use std::{
    fs::{self, File},
    io::ErrorKind,
    os::unix::prelude::CommandExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

pub const MASTER: &str = "master_fuzzer";
pub const QUEUE_DIR: &str = "queue";
const PID_EXT: &str = ".pid";

#[derive(Debug, Clone)]
pub struct Afl {
    bin_dir: PathBuf,
    tmout: String,
    mlimit: String,
    pm_path_env: Option<Env>,
}

impl Afl {
    pub fn new(config: &Config) -> Self {
        let pm = &config.campaign.prioritize_pm_path;
        Self {
            bin_dir: config.campaign.bin_dir.clone(),
            tmout: config.target.tmout.clone(),
            mlimit: config.target.mlimit.clone(),
            pm_path_env: Some(if pm.enable {
                pm.enable_env.clone()
            } else {
                pm.disable_env.clone()
            })
            .filter(|e| !e.is_empty()),
        }
    }

    /// Starts one detached worker per command, syncing through `outdir`. The first is the master.
    ///
    /// The pid of each worker is recorded in `<outdir>/<worker>.pid`, outside of the worker's
    /// own directory which it may wipe while starting up.
    pub fn launch(
        &self,
        indir: &Path,
        outdir: &Path,
        cmds: &[Vec<String>],
        env: &Env,
    ) -> anyhow::Result<Vec<Pid>> {
        fs::create_dir_all(outdir)
            .with_context(|| format!("failed to create {}", outdir.display()))?;
        let mut pids = Vec::with_capacity(cmds.len());
        for (k, cmd) in cmds.iter().enumerate() {
            let (role, name) = if k == 0 {
                ("-M", MASTER.to_string())
            } else {
                ("-S", format!("slave_fuzzer{}", k))
            };
            let log = outdir.join(format!(".{}.log", name));
            let log = File::create(&log)
                .with_context(|| format!("failed to create {}", log.display()))?;
            let mut c = Command::new(self.bin_dir.join("afl-fuzz"));
            c.arg("-i")
                .arg(indir)
                .arg("-o")
                .arg(outdir)
                .args(&[
                    "-s",
                    "1024",
                    "-t",
                    self.tmout.as_str(),
                    "-m",
                    self.mlimit.as_str(),
                    role,
                    name.as_str(),
                    "--",
                ])
                .args(cmd)
                .envs(env)
                .envs(self.pm_path_env.iter().flatten())
                .env("AFL_NO_UI", "1")
                .stdin(Stdio::null())
                .stdout(log.try_clone()?)
                .stderr(log);
            unsafe {
                c.pre_exec(|| {
                    let _ = setsid();
                    Ok(())
                });
            }
            log::debug!("afl cmd: {:?}", c);
            let child = c
                .spawn()
                .with_context(|| format!("failed to spawn worker {}", name))?;
            let pid = Pid::from_raw(child.id() as i32);

            let pid_file = pid_file(outdir, &name);
            fs::write(&pid_file, pid.to_string())
                .with_context(|| format!("failed to write {}", pid_file.display()))?;
            log::info!("worker {} started, pid {}", name, pid);
            pids.push(pid);
        }
        Ok(pids)
    }

    /// Minimizes `input` into `output`.
    pub fn tmin(&self, input: &Path, output: &Path, cmd: &[String], env: &Env) -> anyhow::Result<()> {
        self.run_tool("afl-tmin", input, output, cmd, env)
    }

    /// Copies the smallest subset of corpus `indir` with the same coverage into `outdir`.
    pub fn cmin(&self, indir: &Path, outdir: &Path, cmd: &[String], env: &Env) -> anyhow::Result<()> {
        self.run_tool("afl-cmin", indir, outdir, cmd, env)
    }

    fn run_tool(
        &self,
        tool: &str,
        input: &Path,
        output: &Path,
        cmd: &[String],
        env: &Env,
    ) -> anyhow::Result<()> {
        let status = Command::new(self.bin_dir.join(tool))
            .arg("-i")
            .arg(input)
            .arg("-o")
            .arg(output)
            .args(&["-t", self.tmout.as_str(), "-m", self.mlimit.as_str(), "--"])
            .args(cmd)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("failed to spawn {}", tool))?;
        if !status.success() {
            anyhow::bail!("{} failed on {}: {}", tool, input.display(), status);
        }
        Ok(())
    }
}

pub fn pid_file(outdir: &Path, worker: &str) -> PathBuf {
    outdir.join(format!("{}{}", worker, PID_EXT))
}

pub fn queue_dir(outdir: &Path, worker: &str) -> PathBuf {
    outdir.join(worker).join(QUEUE_DIR)
}

pub fn read_pid(pid_file: &Path) -> anyhow::Result<Option<Pid>> {
    let content = match fs::read_to_string(pid_file) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", pid_file.display())),
    };
    let pid = content
        .trim()
        .parse::<i32>()
        .with_context(|| format!("bad pid file {}: {:?}", pid_file.display(), content))?;
    Ok(Some(Pid::from_raw(pid)))
}

/// Sends SIGTERM to the worker recorded in `pid_file` and forgets it.
///
/// A missing pid file means the worker is already stopped.
pub fn stop_worker(pid_file: &Path) -> anyhow::Result<Option<Pid>> {
    let pid = match read_pid(pid_file)? {
        Some(p) => p,
        None => return Ok(None),
    };
    if let Err(e) = kill(pid, Signal::SIGTERM) {
        if worker_alive(pid) {
            anyhow::bail!("failed to stop worker {}: {}", pid, e);
        }
    }
    reap(pid);
    fs::remove_file(pid_file)
        .with_context(|| format!("failed to remove {}", pid_file.display()))?;
    Ok(Some(pid))
}

/// Collects `pid` if it is an exited child of ours.
pub fn reap(pid: Pid) {
    let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
}

pub fn worker_alive(pid: Pid) -> bool {
    reap(pid);
    if kill(pid, None).is_err() {
        return false;
    }
    // a zombie of someone else's still accepts signals
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .map(|rest| !rest.trim_start().starts_with('Z'))
            .unwrap_or(true),
        Err(_) => true,
    }
}
