//! Lineage-encoded artifact names.
//!
//! Every artifact of the campaign is named after its lineage, the chain of generation ids
//! from the Stage 1 ancestor down to the artifact itself, e.g. `id=000001,id=000007.id=000003`.
//! `,` joins a Stage 2 child to its seed, `.` joins a crash-site variant to the test case it
//! was injected into. Both extend the lineage by one generation.
use crate::error::{Error, Result};
use regex::Regex;
use std::{
    fmt,
    path::{Path, PathBuf},
};

/// Literal token in the target command line replaced by the image path.
pub const IMG_PLACEHOLDER: &str = "__POOL_IMAGE__";

lazy_static! {
    static ref STAGE_DIR_RE: Regex = Regex::new(r"^stage=(\d+),iter=(\d+)$").unwrap();
    static ref QUEUE_NAME_RE: Regex = Regex::new(r"^id[:=](\d+)").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Join {
    /// `,`, child of a Stage 2 seed.
    Stage,
    /// `.`, crash-site variant within a stage.
    Local,
}

impl Join {
    pub fn delim(self) -> char {
        match self {
            Join::Stage => ',',
            Join::Local => '.',
        }
    }

    fn from_delim(c: char) -> Option<Self> {
        match c {
            ',' => Some(Join::Stage),
            '.' => Some(Join::Local),
            _ => None,
        }
    }
}

/// One generation id, keeping the zero padding it was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Generation {
    id: u64,
    width: usize,
}

impl Generation {
    /// Generation padded to six digits, as the fuzzing worker writes them.
    pub fn new(id: u64) -> Self {
        Self { id, width: 6 }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn parse_token(tok: &str) -> Result<Self> {
        let digits = tok
            .strip_prefix("id=")
            .ok_or_else(|| Error::Naming(format!("bad generation token '{}'", tok)))?;
        Self::from_digits(digits).ok_or_else(|| Error::Naming(format!("bad generation token '{}'", tok)))
    }

    fn from_digits(digits: &str) -> Option<Self> {
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let id = digits.parse::<u64>().ok()?;
        Some(Self {
            id,
            width: digits.len(),
        })
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id={:0width$}", self.id, width = self.width)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Lineage {
    gens: Vec<Generation>,
    // joins[i] sits between gens[i] and gens[i + 1]
    joins: Vec<Join>,
}

impl Lineage {
    pub fn root(gen: Generation) -> Self {
        Self {
            gens: vec![gen],
            joins: Vec::new(),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let mut gens = Vec::new();
        let mut joins = Vec::new();
        let mut start = 0;
        for (i, c) in s.char_indices() {
            if let Some(join) = Join::from_delim(c) {
                gens.push(Generation::parse_token(&s[start..i])?);
                joins.push(join);
                start = i + 1;
            }
        }
        gens.push(Generation::parse_token(&s[start..])?);
        Ok(Self { gens, joins })
    }

    pub fn ids(&self) -> Vec<u64> {
        self.gens.iter().map(|g| g.id).collect()
    }

    pub fn len(&self) -> usize {
        self.gens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gens.is_empty()
    }

    pub fn ancestor_count(&self) -> usize {
        self.gens.len() - 1
    }

    /// Number of Stage 2 iterations between this lineage and its Stage 1 ancestor.
    pub fn stage_depth(&self) -> usize {
        self.joins.iter().filter(|j| **j == Join::Stage).count()
    }

    pub fn last(&self) -> Generation {
        self.gens[self.gens.len() - 1]
    }

    pub fn parent(&self) -> Option<Lineage> {
        if self.gens.len() == 1 {
            return None;
        }
        let mut parent = self.clone();
        parent.gens.pop();
        parent.joins.pop();
        Some(parent)
    }

    pub fn child(&self, gen: Generation, join: Join) -> Lineage {
        let mut child = self.clone();
        child.gens.push(gen);
        child.joins.push(join);
        child
    }
}

impl fmt::Display for Lineage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.gens[0])?;
        for (join, gen) in self.joins.iter().zip(&self.gens[1..]) {
            write!(f, "{}{}", join.delim(), gen)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Testcase,
    MinTestcase,
    Map,
    PmMap,
    CrashSite,
    CrashSiteCmpr,
    Image,
    ImageCmpr,
    Hash,
    Deleted,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 10] = [
        ArtifactKind::Testcase,
        ArtifactKind::MinTestcase,
        ArtifactKind::Map,
        ArtifactKind::PmMap,
        ArtifactKind::CrashSite,
        ArtifactKind::CrashSiteCmpr,
        ArtifactKind::Image,
        ArtifactKind::ImageCmpr,
        ArtifactKind::Hash,
        ArtifactKind::Deleted,
    ];

    // longer suffixes first, so that `.min.testcase` never parses as `.testcase`
    const BY_SUFFIX: [ArtifactKind; 8] = [
        ArtifactKind::MinTestcase,
        ArtifactKind::CrashSiteCmpr,
        ArtifactKind::Hash,
        ArtifactKind::ImageCmpr,
        ArtifactKind::Testcase,
        ArtifactKind::CrashSite,
        ArtifactKind::Image,
        ArtifactKind::Deleted,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            ArtifactKind::Map => "map_",
            ArtifactKind::PmMap => "pm_map_",
            _ => "",
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            ArtifactKind::Testcase | ArtifactKind::Map | ArtifactKind::PmMap => ".testcase",
            ArtifactKind::MinTestcase => ".min.testcase",
            ArtifactKind::CrashSite => ".crash_site",
            ArtifactKind::CrashSiteCmpr => ".crash_site.tar.gz",
            ArtifactKind::Image => ".pm_pool",
            ArtifactKind::ImageCmpr => ".pm_pool.tar.gz",
            ArtifactKind::Hash => ".crash_site.hash",
            ArtifactKind::Deleted => ".deleted",
        }
    }

    /// Kinds owned by an artifact and removed along with it.
    pub fn is_derived(self) -> bool {
        !matches!(self, ArtifactKind::Deleted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactName {
    pub lineage: Lineage,
    pub kind: ArtifactKind,
}

impl ArtifactName {
    pub fn new(lineage: Lineage, kind: ArtifactKind) -> Self {
        Self { lineage, kind }
    }

    pub fn parse(name: &str) -> Result<Self> {
        let (rest, map_kind) = if let Some(r) = name.strip_prefix(ArtifactKind::PmMap.prefix()) {
            (r, Some(ArtifactKind::PmMap))
        } else if let Some(r) = name.strip_prefix(ArtifactKind::Map.prefix()) {
            (r, Some(ArtifactKind::Map))
        } else {
            (name, None)
        };

        if let Some(kind) = map_kind {
            let lineage = rest
                .strip_suffix(kind.suffix())
                .ok_or_else(|| Error::Naming(format!("bad map name '{}'", name)))
                .and_then(Lineage::parse)?;
            return Ok(Self { lineage, kind });
        }
        for kind in ArtifactKind::BY_SUFFIX.iter().copied() {
            if let Some(l) = rest.strip_suffix(kind.suffix()) {
                if let Ok(lineage) = Lineage::parse(l) {
                    return Ok(Self { lineage, kind });
                }
            }
        }
        Err(Error::Naming(format!("unknown artifact '{}'", name)))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Naming(format!("bad artifact path '{}'", path.display())))?;
        Self::parse(name)
    }

    pub fn with_kind(&self, kind: ArtifactKind) -> Self {
        Self {
            lineage: self.lineage.clone(),
            kind,
        }
    }

    pub fn file_name(&self) -> String {
        self.to_string()
    }

    pub fn extension(&self) -> &'static str {
        self.kind.suffix()
    }

    pub fn parent(&self) -> Option<Self> {
        self.lineage.parent().map(|lineage| Self {
            lineage,
            kind: self.kind,
        })
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.kind.prefix(), self.lineage, self.kind.suffix())
    }
}

/// Paths of every artifact kind sharing one lineage in one directory.
#[derive(Debug, Clone)]
pub struct Siblings {
    dir: PathBuf,
    lineage: Lineage,
}

impl Siblings {
    pub fn of(path: &Path) -> Result<Self> {
        let name = ArtifactName::from_path(path)?;
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(Self {
            dir,
            lineage: name.lineage,
        })
    }

    pub fn new(dir: &Path, lineage: Lineage) -> Self {
        Self {
            dir: dir.to_path_buf(),
            lineage,
        }
    }

    pub fn lineage(&self) -> &Lineage {
        &self.lineage
    }

    pub fn path(&self, kind: ArtifactKind) -> PathBuf {
        self.dir
            .join(ArtifactName::new(self.lineage.clone(), kind).file_name())
    }

    /// Same lineage, rooted in another directory.
    pub fn in_dir(&self, dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            lineage: self.lineage.clone(),
        }
    }

    pub fn derived(&self) -> impl Iterator<Item = PathBuf> + '_ {
        ArtifactKind::ALL
            .iter()
            .copied()
            .filter(|k| k.is_derived())
            .map(move |k| self.path(k))
    }
}

pub fn get_extension(name: &str) -> Result<&'static str> {
    ArtifactName::parse(name).map(|n| n.extension())
}

/// Name of the immediate parent with the same kind, `None` for a first generation.
pub fn get_testcase_parent(name: &str) -> Result<Option<String>> {
    Ok(ArtifactName::parse(name)?.parent().map(|p| p.file_name()))
}

pub fn stage_dir_name(stage: u32, iter: u32) -> String {
    format!("stage={},iter={}", stage, iter)
}

pub fn parse_stage_dir(name: &str) -> Result<(u32, u32)> {
    let bad = || Error::Naming(format!("bad stage directory '{}'", name));
    let caps = STAGE_DIR_RE.captures(name).ok_or_else(bad)?;
    let stage = caps[1].parse::<u32>().map_err(|_| bad())?;
    let iter = caps[2].parse::<u32>().map_err(|_| bad())?;
    Ok((stage, iter))
}

/// Generation of a worker queue entry, e.g. `id:000123,src:000001,op:havoc`.
pub fn clean_queue_name(name: &str) -> Result<Generation> {
    QUEUE_NAME_RE
        .captures(name)
        .and_then(|c| Generation::from_digits(&c[1]))
        .ok_or_else(|| Error::Naming(format!("bad queue entry '{}'", name)))
}

/// Existing snapshot of `lineage` in `dir`, either a compressed crash site or a compressed image.
pub fn existing_image(lineage: &Lineage, dir: &Path) -> Result<PathBuf> {
    let siblings = Siblings::new(dir, lineage.clone());
    let crash_site = siblings.path(ArtifactKind::CrashSiteCmpr);
    let image = siblings.path(ArtifactKind::ImageCmpr);
    match (crash_site.exists(), image.exists()) {
        (true, true) => Err(Error::Corruption(format!(
            "both crash site and image exist: {}, {}",
            crash_site.display(),
            image.display()
        ))),
        (true, false) => Ok(crash_site),
        (false, true) => Ok(image),
        (false, false) => Err(Error::Naming(format!(
            "no image for '{}' in {}",
            lineage,
            dir.display()
        ))),
    }
}

pub fn substitute_image(cmd: &[String], img: &Path) -> Result<Vec<String>> {
    if !cmd.iter().any(|a| a.contains(IMG_PLACEHOLDER)) {
        return Err(Error::Naming(format!(
            "no '{}' in target command: {:?}",
            IMG_PLACEHOLDER, cmd
        )));
    }
    let img = img.to_string_lossy();
    Ok(cmd
        .iter()
        .map(|a| a.replace(IMG_PLACEHOLDER, &img))
        .collect())
}
