//! Host settings the fuzzing workers depend on.
use anyhow::Context;
use std::{fs, path::Path};

const CORE_PATTERN: &str = "/proc/sys/kernel/core_pattern";
const RANDOMIZE_VA_SPACE: &str = "/proc/sys/kernel/randomize_va_space";

pub fn check() -> anyhow::Result<()> {
    check_core_pattern(Path::new(CORE_PATTERN))?;
    check_aslr(Path::new(RANDOMIZE_VA_SPACE))?;
    log::info!("preflight checks passed");
    Ok(())
}

fn read(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .with_context(|| format!("failed to read {}", path.display()))
}

/// Crashes must not be piped to an external handler.
fn check_core_pattern(path: &Path) -> anyhow::Result<()> {
    let pattern = read(path)?;
    if !pattern.starts_with("core") {
        anyhow::bail!(
            "core dumps are piped to '{}', run: echo core | sudo tee {}",
            pattern,
            path.display()
        );
    }
    Ok(())
}

/// Images map at fixed addresses only with ASLR off.
fn check_aslr(path: &Path) -> anyhow::Result<()> {
    let value = read(path)?;
    if value != "0" {
        anyhow::bail!(
            "ASLR is enabled ({}), run: echo 0 | sudo tee {}",
            value,
            path.display()
        );
    }
    Ok(())
}
