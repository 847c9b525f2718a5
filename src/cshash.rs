//! Durable crash-site basename -> content hash table.
use crate::{
    error::{Error, Result},
    name::{ArtifactKind, ArtifactName},
};
use rustc_hash::FxHashSet;
use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

const SIDECAR_EXT: &str = ".hash";

#[derive(Debug)]
pub struct CrashSiteHashes {
    path: PathBuf,
    entries: BTreeMap<String, String>,
    known: FxHashSet<String>,
}

impl CrashSiteHashes {
    pub fn load(path: &Path) -> Result<Self> {
        let entries: BTreeMap<String, String> = match fs::read_to_string(path) {
            Ok(c) => serde_json::from_str(&c).map_err(|e| {
                Error::Corruption(format!("bad crash-site hash db {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(Error::io(path, e)),
        };
        let known = entries.values().cloned().collect();
        Ok(Self {
            path: path.to_path_buf(),
            entries,
            known,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|s| &s[..])
    }

    pub fn contains_hash(&self, hash: &str) -> bool {
        self.known.contains(hash)
    }

    pub fn set(&mut self, key: &str, hash: &str) -> Result<()> {
        let hash = check_hash(hash, key)?;
        self.known.insert(hash.clone());
        self.entries.insert(key.to_string(), hash);
        self.dump()
    }

    /// Drops the entries of collapsed crash sites.
    pub fn remove_keys<'k, I: IntoIterator<Item = &'k str>>(&mut self, keys: I) -> Result<usize> {
        let mut n = 0;
        for k in keys {
            if self.entries.remove(k).is_some() {
                n += 1;
            }
        }
        if n != 0 {
            self.known = self.entries.values().cloned().collect();
            self.dump()?;
        }
        Ok(n)
    }

    /// Moves the hash sidecars found in `dir` into the table.
    pub fn absorb_sidecars(&mut self, dir: &Path) -> Result<usize> {
        let mut absorbed = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
            let path = entry.map_err(|e| Error::io(dir, e))?.path();
            let is_sidecar = ArtifactName::from_path(&path)
                .map(|n| n.kind == ArtifactKind::Hash)
                .unwrap_or(false);
            if !is_sidecar {
                continue;
            }
            let key = sidecar_key(&path)?;
            let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
            let hash = check_hash(&content, &path.display().to_string())?;
            self.known.insert(hash.clone());
            self.entries.insert(key, hash);
            absorbed.push(path);
        }
        if absorbed.is_empty() {
            return Ok(0);
        }
        self.dump()?;
        for p in absorbed.iter() {
            fs::remove_file(p).map_err(|e| Error::io(p, e))?;
        }
        Ok(absorbed.len())
    }

    fn dump(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| Error::Corruption(format!("failed to encode hash db: {}", e)))?;
        let tmp = crate::util::part_path(&self.path);
        fs::write(&tmp, content).map_err(|e| Error::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| Error::io(&self.path, e))
    }
}

/// Writes the sidecar of a crash site, named after the uncompressed crash site.
pub fn write_sidecar(dir: &Path, crash_site: &ArtifactName, hash: &str) -> Result<PathBuf> {
    let key = crash_site.with_kind(ArtifactKind::CrashSite).file_name();
    let hash = check_hash(hash, &key)?;
    let path = dir.join(crash_site.with_kind(ArtifactKind::Hash).file_name());
    fs::write(&path, hash).map_err(|e| Error::io(&path, e))?;
    Ok(path)
}

/// Table key of a crash site in any of its forms.
pub fn key_of(name: &ArtifactName) -> String {
    name.with_kind(ArtifactKind::CrashSite).file_name()
}

fn sidecar_key(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(SIDECAR_EXT))
        .map(|n| n.to_string())
        .ok_or_else(|| Error::Naming(format!("bad hash sidecar {}", path.display())))
}

fn check_hash(value: &str, origin: &str) -> Result<String> {
    if value.contains('\n') {
        return Err(Error::Corruption(format!(
            "hash of {} contains a newline: {:?}",
            origin, value
        )));
    }
    if value.len() != 64 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::Corruption(format!(
            "hash of {} is not a sha256 digest: {:?}",
            origin, value
        )));
    }
    Ok(value.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    const H1: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
    const H2: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn set_persists() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("@crashsitehashes.db");
        let mut h = CrashSiteHashes::load(&db).unwrap();
        assert!(h.is_empty());
        h.set("id=1.id=000001.crash_site", H1).unwrap();

        let h = CrashSiteHashes::load(&db).unwrap();
        assert_eq!(h.get("id=1.id=000001.crash_site"), Some(H1));
        assert!(h.contains_hash(H1));
        assert!(!h.contains_hash(H2));
    }

    #[test]
    fn sidecars_are_absorbed_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("db");
        let img = dir.path().join("pm_images");
        fs::create_dir_all(&img).unwrap();
        let cs = ArtifactName::parse("id=2.id=000004.crash_site.tar.gz").unwrap();
        let sidecar = write_sidecar(&img, &cs, H2).unwrap();
        assert!(sidecar.ends_with("id=2.id=000004.crash_site.hash"));
        fs::write(img.join("id=2.pm_pool.tar.gz"), b"").unwrap();

        let mut h = CrashSiteHashes::load(&db).unwrap();
        assert_eq!(h.absorb_sidecars(&img).unwrap(), 1);
        assert!(!sidecar.exists());
        assert_eq!(h.get(&key_of(&cs)), Some(H2));
        assert_eq!(h.absorb_sidecars(&img).unwrap(), 0);
    }

    #[test]
    fn newline_in_sidecar_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("id=3.crash_site.hash"),
            format!("{}\n{}", H1, H2),
        )
        .unwrap();
        let mut h = CrashSiteHashes::load(&dir.path().join("db")).unwrap();
        assert!(matches!(
            h.absorb_sidecars(dir.path()),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn collapse_removes_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = CrashSiteHashes::load(&dir.path().join("db")).unwrap();
        h.set("id=1.crash_site", H1).unwrap();
        h.set("id=2.crash_site", H1).unwrap();
        assert_eq!(h.remove_keys(vec!["id=2.crash_site", "id=9.crash_site"]).unwrap(), 1);
        assert_eq!(h.len(), 1);
        assert!(h.contains_hash(H1));
    }
}
