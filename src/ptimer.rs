//! Countdown timers that survive restarts of the campaign process.
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

pub const TIMER_EXT: &str = ".ptimer";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
struct TimerState {
    /// Epoch seconds, 0 if never started.
    start: f64,
    /// Seconds.
    length: u64,
}

/// Timer persisted as `<dir>/<prefix>.ptimer`.
///
/// Every mutation is written through before returning, so a restarted campaign never sees an
/// expired timer as a new one. A single writer per file is assumed.
#[derive(Debug)]
pub struct PTimer {
    path: PathBuf,
    state: TimerState,
}

impl PTimer {
    pub fn open(dir: &Path, prefix: &str) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::Corruption(format!(
                "timer directory missing: {}",
                dir.display()
            )));
        }
        let path = dir.join(format!("{}{}", prefix, TIMER_EXT));
        let state = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                Error::Corruption(format!("bad timer file {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => TimerState::default(),
            Err(e) => return Err(Error::io(&path, e)),
        };
        Ok(Self { path, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_new(&self) -> bool {
        self.state.start == 0.0
    }

    pub fn length(&self) -> Duration {
        Duration::from_secs(self.state.length)
    }

    pub fn set(&mut self, length: u64) -> Result<()> {
        self.state.length = length;
        self.sync()
    }

    pub fn start(&mut self) -> Result<()> {
        self.state.start = now();
        self.sync()
    }

    pub fn clear(&mut self) -> Result<()> {
        self.state = TimerState::default();
        self.sync()
    }

    pub fn start_new(&mut self, length: u64) -> Result<()> {
        self.state = TimerState {
            start: now(),
            length,
        };
        self.sync()
    }

    pub fn elapsed(&self) -> Duration {
        if self.is_new() {
            return Duration::from_secs(0);
        }
        Duration::from_secs_f64((now() - self.state.start).max(0.0))
    }

    /// Elapsed time as `HH:MM:SS`.
    pub fn elapsed_hr(&self) -> String {
        let secs = self.elapsed().as_secs();
        format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
    }

    pub fn expired(&self) -> bool {
        if self.is_new() {
            return false;
        }
        self.elapsed() >= self.length()
    }

    fn sync(&self) -> Result<()> {
        let content = serde_json::to_string(&self.state)
            .map_err(|e| Error::Corruption(format!("failed to encode timer: {}", e)))?;
        let tmp = crate::util::part_path(&self.path);
        fs::write(&tmp, content).map_err(|e| Error::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| Error::io(&self.path, e))
    }
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
