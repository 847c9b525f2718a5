//! Stage controllers and the harvesting steps they share.
pub mod stage1;
pub mod stage2;

pub use stage1::Stage1;
pub use stage2::Stage2;

use crate::{
    afl::Afl,
    archive,
    bugreport::BugReport,
    config::Config,
    cshash::{write_sidecar, CrashSiteHashes},
    dedup::DedupStore,
    error::Error,
    layout::{Layout, StageDirs},
    name::{existing_image, ArtifactKind, ArtifactName, Lineage, Siblings},
    pool::{FailurePolicy, Pool},
    target::Target,
    util::{part_path, remove_if_exists, sha256sum},
};
use anyhow::Context;
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

/// Everything a stage controller works with.
pub struct Ctx {
    pub layout: Layout,
    pub config: Config,
    pub target: Target,
    pub afl: Afl,
    pub indir: PathBuf,
}

impl Ctx {
    pub fn new(config: Config, indir: &Path, outdir: &Path) -> Self {
        Self {
            layout: Layout::new(outdir),
            target: Target::new(&config),
            afl: Afl::new(&config),
            indir: indir.to_path_buf(),
            config,
        }
    }

    pub fn fi_enabled(&self) -> bool {
        self.config.campaign.failure_injection.enable
    }
}

/// True with probability `rate`.
pub(crate) fn sample(rate: f64) -> bool {
    rate > 0.0 && rand::random::<f64>() < rate
}

/// Names of the queue entries of a worker, sorted. A missing queue is empty.
pub(crate) fn queue_entries(queue: &Path) -> anyhow::Result<Vec<String>> {
    let entries = match fs::read_dir(queue) {
        Ok(e) => e,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", queue.display())),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", queue.display()))?;
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with("id") && entry.path().is_file() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Test case collected before, possibly deduped away since.
pub(crate) fn collected(siblings: &Siblings) -> bool {
    siblings.path(ArtifactKind::Testcase).exists() || siblings.path(ArtifactKind::Deleted).exists()
}

/// Copies queue entry `entry` with its maps into the stage as `lineage` and generates its image
/// on top of `base`. Returns false if the test case was collected before.
///
/// The test case lands last, so an interrupted collection is redone from scratch.
pub(crate) fn collect_testcase(
    ctx: &Ctx,
    queue: &Path,
    entry: &str,
    lineage: &Lineage,
    dirs: &StageDirs,
    base: Option<&Path>,
    map_required: bool,
) -> anyhow::Result<bool> {
    let siblings = Siblings::new(&dirs.testcases, lineage.clone());
    let dest = siblings.path(ArtifactKind::Testcase);
    if collected(&siblings) {
        return Ok(false);
    }
    crate::stage_debug!("collecting {} as {}", entry, lineage);

    let src = queue.join(entry);
    let part = part_path(&dest);
    fs::copy(&src, &part).with_context(|| format!("failed to copy {}", src.display()))?;

    let map = queue.join(format!("{}{}", ArtifactKind::Map.prefix(), entry));
    if map.is_file() {
        fs::copy(&map, siblings.path(ArtifactKind::Map))
            .with_context(|| format!("failed to copy {}", map.display()))?;
    } else if map_required {
        let e = Error::io(&map, std::io::Error::from(ErrorKind::NotFound));
        return Err(e).with_context(|| format!("execution map of {} missing", src.display()));
    } else {
        crate::stage_warn!("execution map missing: {}", map.display());
    }
    let pm_map = queue.join(format!("{}{}", ArtifactKind::PmMap.prefix(), entry));
    if pm_map.is_file() {
        fs::copy(&pm_map, siblings.path(ArtifactKind::PmMap))
            .with_context(|| format!("failed to copy {}", pm_map.display()))?;
    } else {
        crate::stage_warn!("pm map missing: {}", pm_map.display());
    }

    ctx.target.gen_img(&part, base, lineage, &dirs.images)?;
    fs::rename(&part, &dest).with_context(|| format!("failed to rename {}", part.display()))?;
    Ok(true)
}

/// Fault-injects the replay of `testcase` on `base` (an empty image without one) and keeps the
/// crash sites not seen before in `dest_dir`. Returns the number kept.
pub(crate) fn gen_crash_sites(
    ctx: &Ctx,
    known: &CrashSiteHashes,
    testcase: &Path,
    base: Option<&Path>,
    lineage: &Lineage,
    dest_dir: &Path,
) -> anyhow::Result<usize> {
    let scratch = ctx.target.scratch_dir("pmcampaign-cs-")?;
    let img = scratch.path().join("fi.pm_pool");
    match base {
        Some(base) => archive::unpack_to(base, &img)?,
        None => ctx.target.gen_empty_img(&img)?,
    }
    let sites = ctx
        .target
        .inject_failures(&img, Some(testcase), lineage, false)?;
    crate::stage_debug!("{} crash sites generated for {}", sites.len(), lineage);
    let mut kept = 0;
    for (raw, name) in sites {
        if process_crash_site(ctx, known, &raw, &name, dest_dir)? {
            kept += 1;
        }
    }
    Ok(kept)
}

/// Tests, hashes and stores one raw crash site, then removes the raw file.
///
/// Crash sites whose hash is already known are dropped unless the tester found a bug on them.
pub(crate) fn process_crash_site(
    ctx: &Ctx,
    known: &CrashSiteHashes,
    raw: &Path,
    name: &ArtifactName,
    dest_dir: &Path,
) -> anyhow::Result<bool> {
    let dest = dest_dir.join(name.with_kind(ArtifactKind::CrashSiteCmpr).file_name());
    let bug = ctx.target.test_crash_site(raw, &dest)?;
    if let Some(evidence) = bug.as_ref() {
        BugReport::new(&dest, evidence).save(&ctx.layout)?;
    }
    let hash = sha256sum(raw)?;
    let keep = bug.is_some() || !known.contains_hash(&hash);
    if keep {
        archive::compress(raw, &dest)?;
        write_sidecar(dest_dir, name, &hash)?;
    } else {
        crate::stage_debug!("crash site {} already known", name);
    }
    remove_if_exists(raw)?;
    Ok(keep)
}

/// Removes raw images and crash sites left in `dir` by interrupted jobs.
pub(crate) fn clean_up_uncompressed(dir: &Path) -> anyhow::Result<usize> {
    let mut n = 0;
    for p in crate::dedup::list_artifacts(dir, &[ArtifactKind::Image, ArtifactKind::CrashSite])? {
        if remove_if_exists(&p)? {
            n += 1;
        }
    }
    Ok(n)
}

/// Moves the hash sidecars of `dir` into the campaign's hash store.
pub(crate) fn absorb_hashes(layout: &Layout, dir: &Path) -> anyhow::Result<usize> {
    let mut db = CrashSiteHashes::load(&layout.crash_site_db())?;
    Ok(db.absorb_sidecars(dir)?)
}

/// Merges the stage into the global store, minimizing global test cases when configured.
///
/// With `corpus`, the global corpus is minimized whenever new artifacts arrived.
pub(crate) fn merge_global(
    ctx: &Ctx,
    store: &DedupStore,
    cores: usize,
    corpus: bool,
) -> anyhow::Result<usize> {
    let imported = store.update_global()?;
    let global = ctx.layout.global_dedup();
    if corpus && imported != 0 {
        let n = minimize_corpus(ctx, &global, &[])?;
        if n != 0 {
            log::info!("global: corpus minimization removed {} test cases", n);
        }
    }
    if ctx.config.campaign.dedup.global.minimize_tc {
        let n = minimize_testcases(ctx, &global, &global, cores)?;
        if n != 0 {
            log::info!("global: {} test cases minimized", n);
        }
    }
    Ok(imported)
}

/// Runs afl-cmin over the test cases of `dir` and removes the ones it drops, along with their
/// artifacts in `sibling_dirs`. Returns the number removed.
///
/// Every test case runs against one empty image. An empty result keeps the corpus untouched.
pub(crate) fn minimize_corpus(
    ctx: &Ctx,
    dir: &Path,
    sibling_dirs: &[PathBuf],
) -> anyhow::Result<usize> {
    let testcases = crate::dedup::list_artifacts(dir, &[ArtifactKind::Testcase])?;
    if testcases.len() < 2 {
        return Ok(0);
    }
    let scratch = ctx.target.scratch_dir("pmcampaign-cmin-")?;
    let indir = scratch.path().join("in");
    let outdir = scratch.path().join("out");
    fs::create_dir_all(&indir).with_context(|| format!("failed to create {}", indir.display()))?;
    for tc in testcases.iter() {
        let name = tc.file_name().context("bad test case path")?;
        fs::copy(tc, indir.join(name)).with_context(|| format!("failed to copy {}", tc.display()))?;
    }
    let img = scratch.path().join("cmin.pm_pool");
    ctx.target.gen_empty_img(&img)?;
    let cmd = ctx.target.cmd_with_image(&img)?;
    ctx.afl.cmin(&indir, &outdir, &cmd, &ctx.target.fuzz_env())?;

    let mut kept = Vec::new();
    if outdir.is_dir() {
        for entry in fs::read_dir(&outdir).with_context(|| format!("failed to read {}", outdir.display()))? {
            kept.push(entry?.file_name());
        }
    }
    if kept.is_empty() {
        log::warn!("afl-cmin kept nothing of {}, corpus left as is", dir.display());
        return Ok(0);
    }
    let mut removed = 0;
    for tc in testcases.iter() {
        if !kept.iter().any(|k| Some(k.as_os_str()) == tc.file_name()) {
            crate::dedup::delete_cascade(tc, sibling_dirs)?;
            removed += 1;
        }
    }
    log::debug!("{}: corpus of {} minimized to {}", dir.display(), testcases.len(), kept.len());
    Ok(removed)
}

/// Minimizes every test case in `dir` that has no minimized sibling yet.
///
/// A test case replays onto its parent's image when `images` holds one, onto an empty image
/// otherwise. Failed minimizations are logged and skipped.
pub(crate) fn minimize_testcases(
    ctx: &Ctx,
    dir: &Path,
    images: &Path,
    cores: usize,
) -> anyhow::Result<usize> {
    let mut todo = Vec::new();
    for tc in crate::dedup::list_artifacts(dir, &[ArtifactKind::Testcase])? {
        let name = ArtifactName::from_path(&tc)?;
        if !Siblings::new(dir, name.lineage).path(ArtifactKind::MinTestcase).exists() {
            todo.push(tc);
        }
    }
    if todo.is_empty() {
        return Ok(0);
    }
    let n = todo.len();
    let mut pool = Pool::new(
        "minimize",
        cores,
        FailurePolicy::ContinueOnFailure,
        |tc: PathBuf| minimize_one(ctx, images, &tc),
    );
    for tc in todo {
        pool.submit(tc)?;
    }
    pool.wait()?;
    Ok(n - pool.failures())
}

fn minimize_one(ctx: &Ctx, images: &Path, tc: &Path) -> anyhow::Result<()> {
    let name = ArtifactName::from_path(tc)?;
    let scratch = ctx.target.scratch_dir("pmcampaign-tmin-")?;
    let img = scratch.path().join("tmin.pm_pool");
    match name.lineage.parent().map(|p| existing_image(&p, images)) {
        Some(Ok(base)) => archive::unpack_to(&base, &img)?,
        _ => ctx.target.gen_empty_img(&img)?,
    }
    let dest = Siblings::of(tc)?.path(ArtifactKind::MinTestcase);
    let part = part_path(&dest);
    let cmd = ctx.target.cmd_with_image(&img)?;
    ctx.afl.tmin(tc, &part, &cmd, &ctx.target.fuzz_env())?;
    fs::rename(&part, &dest).with_context(|| format!("failed to rename {}", part.display()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::target::tests::{sh_config, APPEND};

    pub(crate) fn ctx(root: &Path, script: &str) -> Ctx {
        let img_loc = root.join("pmem");
        let indir = root.join("in");
        let outdir = root.join("out");
        for d in [&img_loc, &indir, &outdir].iter() {
            fs::create_dir_all(d).unwrap();
        }
        Ctx::new(sh_config(&img_loc, script), &indir, &outdir)
    }

    /// Fake worker queue holding `entries` with their execution maps.
    pub(crate) fn fake_queue(dir: &Path, entries: &[(&str, &str)]) {
        fs::create_dir_all(dir).unwrap();
        fs::create_dir_all(dir.join(".state")).unwrap();
        for (name, content) in entries {
            fs::write(dir.join(name), content).unwrap();
            fs::write(dir.join(format!("map_{}", name)), b"map").unwrap();
        }
    }

    #[test]
    fn sampling_bounds() {
        assert!(!sample(0.0));
        assert!(sample(1.0));
    }

    #[test]
    fn queue_listing_keeps_entries_only() {
        let dir = tempfile::tempdir().unwrap();
        let q = dir.path().join("queue");
        fake_queue(&q, &[("id:000001,orig:a", "a"), ("id:000000,orig:b", "b")]);
        assert_eq!(
            queue_entries(&q).unwrap(),
            vec!["id:000000,orig:b", "id:000001,orig:a"]
        );
        assert!(queue_entries(&dir.path().join("none")).unwrap().is_empty());
    }

    #[test]
    fn collection_is_idempotent_and_needs_the_map() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path(), APPEND);
        let dirs = ctx.layout.stage(1, 1);
        dirs.create().unwrap();
        let q = dir.path().join("queue");
        fake_queue(&q, &[("id:000001,orig:a", "abc")]);
        let l = Lineage::parse("id=000001").unwrap();

        assert!(collect_testcase(&ctx, &q, "id:000001,orig:a", &l, &dirs, None, true).unwrap());
        assert!(dirs.testcases.join("id=000001.testcase").is_file());
        assert!(dirs.testcases.join("map_id=000001.testcase").is_file());
        assert!(dirs.images.join("id=000001.pm_pool.tar.gz").is_file());
        assert!(!collect_testcase(&ctx, &q, "id:000001,orig:a", &l, &dirs, None, true).unwrap());
        fs::remove_file(dirs.testcases.join("id=000001.testcase")).unwrap();
        fs::write(dirs.testcases.join("id=000001.deleted"), b"Deleted at epoch=1").unwrap();
        assert!(!collect_testcase(&ctx, &q, "id:000001,orig:a", &l, &dirs, None, true).unwrap());

        fs::write(q.join("id:000002,orig:b"), b"x").unwrap();
        let l = Lineage::parse("id=000002").unwrap();
        assert!(collect_testcase(&ctx, &q, "id:000002,orig:b", &l, &dirs, None, true).is_err());
        assert!(!dirs.testcases.join("id=000002.testcase").exists());
        assert!(collect_testcase(&ctx, &q, "id:000002,orig:b", &l, &dirs, None, false).unwrap());
    }

    #[test]
    fn known_crash_sites_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path(), APPEND);
        let dirs = ctx.layout.stage(1, 1);
        dirs.create().unwrap();
        let scratch = dir.path().join("raw");
        fs::create_dir_all(&scratch).unwrap();
        let mut db = CrashSiteHashes::load(&ctx.layout.crash_site_db()).unwrap();

        let raw = scratch.join("a.crash_site");
        fs::write(&raw, b"state").unwrap();
        let name = ArtifactName::parse("id=000001.id=000001.crash_site").unwrap();
        assert!(process_crash_site(&ctx, &db, &raw, &name, &dirs.images).unwrap());
        assert!(!raw.exists());
        assert!(dirs.images.join("id=000001.id=000001.crash_site.tar.gz").is_file());
        assert_eq!(absorb_hashes(&ctx.layout, &dirs.images).unwrap(), 1);

        db = CrashSiteHashes::load(&ctx.layout.crash_site_db()).unwrap();
        fs::write(&raw, b"state").unwrap();
        let name = ArtifactName::parse("id=000002.id=000001.crash_site").unwrap();
        assert!(!process_crash_site(&ctx, &db, &raw, &name, &dirs.images).unwrap());
        assert!(!raw.exists());
        assert!(!dirs.images.join("id=000002.id=000001.crash_site.tar.gz").exists());
    }

    #[test]
    fn bug_reports_name_the_kept_crash_site() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(dir.path(), APPEND);
        ctx.config.campaign.failure_injection.test_with = Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "kill -BUS $$".to_string(),
            "tester".to_string(),
            "__POOL_IMAGE__".to_string(),
        ]);
        ctx.target = Target::new(&ctx.config);
        let dirs = ctx.layout.stage(1, 1);
        dirs.create().unwrap();
        let raw = dir.path().join("fi.id=000003.id=000001.crash_site");
        fs::write(&raw, b"state").unwrap();
        let name = ArtifactName::parse("id=000003.id=000001.crash_site").unwrap();
        let db = CrashSiteHashes::load(&ctx.layout.crash_site_db()).unwrap();

        assert!(process_crash_site(&ctx, &db, &raw, &name, &dirs.images).unwrap());
        let kept = dirs.images.join("id=000003.id=000001.crash_site.tar.gz");
        assert!(kept.is_file());
        assert!(!raw.exists());
        let record = fs::read_to_string(ctx.layout.bugs_db()).unwrap();
        assert!(record.contains(&format!("imgpath={}\n", kept.display())));
        assert!(record.contains(&format!("tester {}\n", kept.display())));
    }

    #[test]
    fn crash_sites_from_failure_injection() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"
if [ -n "$FI_IMG_SUFFIX" ]; then
    for i in 000001 000002; do cat "$1" > "${1%.pm_pool}.$FI_IMG_SUFFIX.id=$i.crash_site"; echo "$i" >> "${1%.pm_pool}.$FI_IMG_SUFFIX.id=$i.crash_site"; done
elif [ "$PERSIST" = 1 ]; then cat >> "$1"; fi"#;
        let ctx = ctx(dir.path(), script);
        let dirs = ctx.layout.stage(1, 1);
        dirs.create().unwrap();
        let tc = dir.path().join("tc");
        fs::write(&tc, b"x").unwrap();
        let l = Lineage::parse("id=000004").unwrap();
        let db = CrashSiteHashes::load(&ctx.layout.crash_site_db()).unwrap();
        assert_eq!(gen_crash_sites(&ctx, &db, &tc, None, &l, &dirs.images).unwrap(), 2);
        let mut names = crate::dedup::list_artifacts(&dirs.images, &[ArtifactKind::CrashSiteCmpr])
            .unwrap()
            .into_iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect::<Vec<_>>();
        names.sort();
        assert_eq!(
            names,
            vec![
                "id=000004.id=000001.crash_site.tar.gz",
                "id=000004.id=000002.crash_site.tar.gz"
            ]
        );
        assert_eq!(absorb_hashes(&ctx.layout, &dirs.images).unwrap(), 2);
    }

    /// Installs `script` as an executable `name` in the config's bin_dir.
    pub(crate) fn fake_tool(ctx: &mut Ctx, root: &Path, name: &str, script: &str) {
        use std::os::unix::fs::PermissionsExt;
        let bin = root.join("bin");
        fs::create_dir_all(&bin).unwrap();
        let tool = bin.join(name);
        fs::write(&tool, format!("#!/bin/sh\n{}\n", script)).unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        ctx.config.campaign.bin_dir = bin;
        ctx.afl = Afl::new(&ctx.config);
    }

    #[test]
    fn minimization_skips_done_and_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(dir.path(), APPEND);
        // afl-tmin -i <in> -o <out> ..., fails on inputs holding "bad"
        fake_tool(&mut ctx, dir.path(), "afl-tmin", r#"grep -q bad "$2" && exit 1; head -c 1 "$2" > "$4""#);
        let global = ctx.layout.global_dedup();
        fs::create_dir_all(&global).unwrap();
        fs::write(global.join("id=000001.testcase"), b"abc").unwrap();
        fs::write(global.join("id=000002.testcase"), b"bad").unwrap();
        fs::write(global.join("id=000003.testcase"), b"xyz").unwrap();
        fs::write(global.join("id=000003.min.testcase"), b"x").unwrap();

        assert_eq!(minimize_testcases(&ctx, &global, &global, 2).unwrap(), 1);
        assert_eq!(fs::read(global.join("id=000001.min.testcase")).unwrap(), b"a");
        assert!(!global.join("id=000002.min.testcase").exists());
    }

    #[test]
    fn corpus_minimization_tombstones_dropped_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(dir.path(), APPEND);
        // afl-cmin -i <in> -o <out> ..., keeps inputs not holding "dup"
        fake_tool(
            &mut ctx,
            dir.path(),
            "afl-cmin",
            r#"mkdir -p "$4"; for f in "$2"/*; do grep -q dup "$f" || cp "$f" "$4"/; done"#,
        );
        let dirs = ctx.layout.stage(2, 1);
        dirs.create().unwrap();
        for (l, content) in &[("id=000001,id=000001", "a"), ("id=000001,id=000002", "dup"), ("id=000001,id=000003", "c")] {
            fs::write(dirs.testcases.join(format!("{}.testcase", l)), content).unwrap();
            fs::write(dirs.testcases.join(format!("map_{}.testcase", l)), b"map").unwrap();
            fs::write(dirs.images.join(format!("{}.pm_pool.tar.gz", l)), b"img").unwrap();
        }

        let removed = minimize_corpus(&ctx, &dirs.testcases, &[dirs.images.clone()]).unwrap();
        assert_eq!(removed, 1);
        assert!(dirs.testcases.join("id=000001,id=000001.testcase").is_file());
        assert!(dirs.testcases.join("id=000001,id=000003.testcase").is_file());
        assert!(!dirs.testcases.join("id=000001,id=000002.testcase").exists());
        assert!(!dirs.testcases.join("map_id=000001,id=000002.testcase").exists());
        assert!(!dirs.images.join("id=000001,id=000002.pm_pool.tar.gz").exists());
        assert!(dirs.testcases.join("id=000001,id=000002.deleted").is_file());
        assert!(collected(&Siblings::new(
            &dirs.testcases,
            Lineage::parse("id=000001,id=000002").unwrap()
        )));
    }

    #[test]
    fn corpus_minimization_keeps_corpus_on_empty_result() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(dir.path(), APPEND);
        fake_tool(&mut ctx, dir.path(), "afl-cmin", r#"mkdir -p "$4""#);
        let global = ctx.layout.global_dedup();
        fs::create_dir_all(&global).unwrap();
        fs::write(global.join("id=000001.testcase"), b"a").unwrap();
        fs::write(global.join("id=000002.testcase"), b"b").unwrap();
        assert_eq!(minimize_corpus(&ctx, &global, &[]).unwrap(), 0);
        assert!(global.join("id=000001.testcase").is_file());
        assert!(global.join("id=000002.testcase").is_file());

        fake_tool(&mut ctx, dir.path(), "afl-cmin", "exit 1");
        assert!(minimize_corpus(&ctx, &global, &[]).is_err());
    }

    #[test]
    fn leftovers_are_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("id=1.pm_pool"), b"").unwrap();
        fs::write(dir.path().join("id=1.id=000001.crash_site"), b"").unwrap();
        fs::write(dir.path().join("id=1.pm_pool.tar.gz"), b"").unwrap();
        assert_eq!(clean_up_uncompressed(dir.path()).unwrap(), 2);
        assert!(dir.path().join("id=1.pm_pool.tar.gz").exists());
    }
}
