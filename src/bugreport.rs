//! Append-only records of possible bugs found by the recovery tester.
use crate::{config::Env, layout::Layout, target::BugEvidence};
use anyhow::Context;
use std::{
    fmt::Write as _,
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

#[derive(Debug, Clone)]
pub struct BugReport {
    pub tester_file: String,
    pub img_path: PathBuf,
    pub cmd: Vec<String>,
    pub env: Env,
    pub reason: String,
}

impl BugReport {
    pub fn new(img_path: &Path, evidence: &BugEvidence) -> Self {
        let reason = signal_hook::low_level::signal_name(evidence.signal)
            .map(|n| format!("{}({})", n, evidence.signal))
            .unwrap_or_else(|| format!("signal {}", evidence.signal));
        Self {
            tester_file: evidence.cmd.first().cloned().unwrap_or_default(),
            img_path: img_path.to_path_buf(),
            cmd: evidence.cmd.clone(),
            env: evidence.env.clone(),
            reason,
        }
    }

    /// Machine readable `[record]` block.
    pub fn record(&self, timestamp: f64) -> String {
        let mut r = String::new();
        writeln!(r, "[record]").unwrap();
        writeln!(r, "timestamp={}", timestamp).unwrap();
        writeln!(r, "testerfile={}", self.tester_file).unwrap();
        writeln!(r, "imgpath={}", self.img_path.display()).unwrap();
        writeln!(r, "cmd={}", self.cmd.join(" ")).unwrap();
        writeln!(r, "env={:?}", self.env).unwrap();
        writeln!(r).unwrap();
        r
    }

    pub fn human_readable(&self) -> String {
        let at = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let mut r = String::new();
        writeln!(r, "=== Possible bug report ===").unwrap();
        writeln!(r, "\tAt:            {}", at).unwrap();
        writeln!(r, "\tReason:        {}", self.reason).unwrap();
        writeln!(r, "\tUsing image:   {}", self.img_path.display()).unwrap();
        writeln!(r, "\tWith tester:   {}", self.tester_file).unwrap();
        writeln!(r, "\tCmd:           {}", self.cmd.join(" ")).unwrap();
        writeln!(r, "\tEnv:           {:?}", self.env).unwrap();
        writeln!(r).unwrap();
        r
    }

    /// Appends the report to both bug files of the campaign.
    ///
    /// Each block goes out in a single append, pool children may report concurrently.
    pub fn save(&self, layout: &Layout) -> anyhow::Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        append(&layout.bugs_db(), &self.record(now))?;
        append(&layout.bugs_human(), &self.human_readable())?;
        log::warn!(
            "possible bug: tester died of {} on {}",
            self.reason,
            self.img_path.display()
        );
        Ok(())
    }
}

fn append(path: &Path, block: &str) -> anyhow::Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    f.write_all(block.as_bytes())
        .with_context(|| format!("failed to append to {}", path.display()))
}
