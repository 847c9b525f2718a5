//! Bounded pool of forked job processes.
use crate::error::{Error, Result};
use nix::{
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{dup2, fork, ForkResult, Pid},
};
use std::{
    fmt::Debug,
    io::Write,
    os::unix::io::AsRawFd,
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
    thread::sleep,
    time::Duration,
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// First failed job fails the pool.
    ExitOnFailure,
    /// Failed jobs are logged and counted.
    ContinueOnFailure,
}

struct Job {
    pid: Pid,
    label: String,
}

pub struct Pool<'a, A> {
    name: String,
    cores: usize,
    policy: FailurePolicy,
    transparent_io: bool,
    func: Box<dyn Fn(A) -> anyhow::Result<()> + 'a>,
    jobs: Vec<Job>,
    failures: usize,
}

impl<'a, A: Debug> Pool<'a, A> {
    pub fn new<F>(name: &str, cores: usize, policy: FailurePolicy, func: F) -> Self
    where
        F: Fn(A) -> anyhow::Result<()> + 'a,
    {
        Self {
            name: name.to_string(),
            cores: cores.max(1),
            policy,
            transparent_io: false,
            func: Box::new(func),
            jobs: Vec::new(),
            failures: 0,
        }
    }

    /// Keep the job's stdout and stderr attached to ours.
    pub fn transparent_io(mut self, yes: bool) -> Self {
        self.transparent_io = yes;
        self
    }

    pub fn cores(&self) -> usize {
        self.cores
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Blocks until a slot is free, then forks a job running `args`.
    pub fn submit(&mut self, args: A) -> Result<()> {
        while self.alive_cnt()? >= self.cores {
            sleep(POLL_INTERVAL);
        }
        let label = format!("{:?}", args);
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();

        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let code = self.run_child(args);
                let _ = std::io::stdout().flush();
                let _ = std::io::stderr().flush();
                std::process::exit(code);
            }
            Ok(ForkResult::Parent { child }) => {
                log::debug!("{}: job '{}' started, pid {}", self.name, label, child);
                self.jobs.push(Job { pid: child, label });
                Ok(())
            }
            Err(e) => Err(Error::WorkerFailure {
                pool: self.name.clone(),
                job: label,
                pid: -1,
                status: format!("fork failed: {}", e),
            }),
        }
    }

    fn run_child(&self, args: A) -> i32 {
        if !self.transparent_io {
            if let Err(e) = redirect_output() {
                log::warn!("{}: failed to redirect job output: {}", self.name, e);
            }
        }
        match catch_unwind(AssertUnwindSafe(|| (self.func)(args))) {
            Ok(Ok(())) => 0,
            Ok(Err(e)) => {
                log::error!("{}: job failed: {:?}", self.name, e);
                1
            }
            Err(_) => 101,
        }
    }

    /// Number of live jobs, reaping the finished ones.
    pub fn alive_cnt(&mut self) -> Result<usize> {
        let mut i = 0;
        while i < self.jobs.len() {
            let pid = self.jobs[i].pid;
            let status = match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    i += 1;
                    continue;
                }
                Ok(WaitStatus::Exited(_, 0)) => None,
                Ok(WaitStatus::Exited(_, code)) => Some(format!("exit code {}", code)),
                Ok(WaitStatus::Signaled(_, sig, _)) => Some(format!("killed by {:?}", sig)),
                Ok(_) => {
                    // stopped or continued, still alive
                    i += 1;
                    continue;
                }
                Err(e) => Some(format!("waitpid failed: {}", e)),
            };
            let job = self.jobs.swap_remove(i);
            if let Some(status) = status {
                self.failures += 1;
                match self.policy {
                    FailurePolicy::ExitOnFailure => {
                        return Err(Error::WorkerFailure {
                            pool: self.name.clone(),
                            job: job.label,
                            pid: job.pid.as_raw(),
                            status,
                        });
                    }
                    FailurePolicy::ContinueOnFailure => {
                        log::warn!(
                            "{}: job '{}' (pid {}) failed: {}",
                            self.name,
                            job.label,
                            job.pid,
                            status
                        );
                    }
                }
            }
        }
        Ok(self.jobs.len())
    }

    /// Blocks until every submitted job finished.
    pub fn wait(&mut self) -> Result<()> {
        while self.alive_cnt()? != 0 {
            sleep(POLL_INTERVAL);
        }
        if self.failures != 0 {
            log::info!("{}: {} job(s) failed", self.name, self.failures);
        }
        Ok(())
    }
}

impl<'a, A> Drop for Pool<'a, A> {
    fn drop(&mut self) {
        for job in self.jobs.drain(..) {
            let _ = kill(job.pid, Signal::SIGKILL);
            let _ = waitpid(job.pid, None);
        }
    }
}

fn redirect_output() -> anyhow::Result<PathBuf> {
    let prefix = format!("pmcampaign-job-{}.out.", std::process::id());
    let (f, path) = tempfile::Builder::new()
        .prefix(&prefix)
        .tempfile()?
        .keep()?;
    dup2(f.as_raw_fd(), 1)?;
    dup2(f.as_raw_fd(), 2)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn capacity_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().to_path_buf();
        let mut pool = Pool::new("sleepers", 2, FailurePolicy::ExitOnFailure, |i: usize| {
            sleep(Duration::from_millis(100));
            fs::write(out.join(i.to_string()), b"done")?;
            Ok(())
        });
        for i in 0..6 {
            pool.submit(i).unwrap();
            assert!(pool.alive_cnt().unwrap() <= 2);
        }
        pool.wait().unwrap();
        assert_eq!(pool.alive_cnt().unwrap(), 0);
        for i in 0..6 {
            assert!(out.join(i.to_string()).is_file());
        }
    }

    #[test]
    fn exit_on_failure_names_the_job() {
        let mut pool = Pool::new("failing", 1, FailurePolicy::ExitOnFailure, |p: PathBuf| {
            anyhow::bail!("cannot handle {}", p.display())
        });
        pool.submit(PathBuf::from("id=1.testcase")).unwrap();
        match pool.wait() {
            Err(Error::WorkerFailure { pool, job, .. }) => {
                assert_eq!(pool, "failing");
                assert!(job.contains("id=1.testcase"));
            }
            r => panic!("unexpected: {:?}", r),
        }
    }

    #[test]
    fn continue_on_failure_counts() {
        let mut pool = Pool::new("lenient", 3, FailurePolicy::ContinueOnFailure, |i: u32| {
            if i % 2 == 0 {
                anyhow::bail!("even");
            }
            Ok(())
        });
        for i in 0..4 {
            pool.submit(i).unwrap();
        }
        pool.wait().unwrap();
        assert_eq!(pool.failures(), 2);
    }

    #[test]
    fn panicking_job_is_a_failure() {
        let mut pool = Pool::new("panics", 1, FailurePolicy::ExitOnFailure, |_: ()| {
            panic!("boom")
        });
        pool.submit(()).unwrap();
        assert!(pool.wait().is_err());
    }
}
