//! Archive-wide Contents index, filtered to icon-relevant paths.
//!
//! The `Contents-<arch>.gz` file maps every shipped file to its owning
//! package. We only ever ask it icon questions, so everything outside
//! `usr/share/icons/` and `usr/share/pixmaps/` is discarded while loading.
//! The retained map is kept in sorted order so lookups are deterministic.

use indexmap::IndexMap;
use regex::Regex;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use tracing::debug;

use super::ReadError;
use crate::model::Package;

const ICON_PREFIXES: [&str; 2] = ["usr/share/icons/", "usr/share/pixmaps/"];

/// Icon-relevant slice of one or more Contents indices.
pub struct ContentsIndex {
    archive_root: PathBuf,
    files: BTreeMap<String, Package>,
}

impl ContentsIndex {
    pub fn new(archive_root: impl Into<PathBuf>) -> Self {
        ContentsIndex {
            archive_root: archive_root.into(),
            files: BTreeMap::new(),
        }
    }

    /// Loads the Contents file for one (suite, component, architecture),
    /// merging into the existing map. Falls back to the suite-global
    /// location used by Ubuntu-style archives.
    pub fn load(
        &mut self,
        suite: &str,
        component: &str,
        arch: &str,
        packages: &IndexMap<String, Package>,
    ) -> Result<(), ReadError> {
        let basename = format!("Contents-{arch}.gz");
        let mut path = self
            .archive_root
            .join("dists")
            .join(suite)
            .join(component)
            .join(&basename);
        if !path.is_file() {
            let global = self.archive_root.join("dists").join(suite).join(&basename);
            if global.is_file() {
                path = global;
            } else {
                return Err(ReadError::ContentsMissing(path));
            }
        }

        let mut raw = Vec::new();
        let file = std::fs::File::open(&path)?;
        flate2::read::MultiGzDecoder::new(file).read_to_end(&mut raw)?;

        let mut kept = 0usize;
        for line in raw.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let line = decode_contents_line(line);
            let Some((file_path, pkgname)) = split_contents_line(&line) else {
                continue;
            };
            if !ICON_PREFIXES.iter().any(|p| file_path.starts_with(p)) {
                continue;
            }
            // paths not resolving to a known package are discarded
            if let Some(pkg) = packages.get(pkgname) {
                self.files.insert(file_path.to_string(), pkg.clone());
                kept += 1;
            }
        }
        debug!(path = %path.display(), kept, "loaded contents index");
        Ok(())
    }

    /// Which package ships this exact path?
    pub fn package_for_path(&self, path: &str) -> Option<&Package> {
        self.files.get(path)
    }

    /// First retained line matching the regex, in sorted path order,
    /// together with the absolute location of the owning package.
    pub fn find_first(&self, re: &Regex) -> Option<(String, PathBuf)> {
        self.files.iter().find_map(|(path, pkg)| {
            if re.is_match(path) {
                Some((path.clone(), self.archive_root.join(&pkg.filename)))
            } else {
                None
            }
        })
    }

    /// Absolute path of the package shipping `path`, if any.
    pub fn deb_path_for(&self, path: &str) -> Option<PathBuf> {
        self.files
            .get(path)
            .map(|pkg| self.archive_root.join(&pkg.filename))
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Contents lines are usually UTF-8; a few old packages carry ISO-8859-1
/// file names, which decode 1:1 to code points.
fn decode_contents_line(line: &[u8]) -> String {
    match std::str::from_utf8(line) {
        Ok(s) => s.to_string(),
        Err(_) => line.iter().map(|b| *b as char).collect(),
    }
}

/// Splits a line into (path, package name). The second field is a
/// comma-separated list of `section/package` tuples; the first tuple's
/// package wins.
fn split_contents_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end();
    let split_at = line.find([' ', '\t'])?;
    let path = line[..split_at].trim_end();
    let groups = line[split_at..].trim_start();
    let first = groups.split(',').next()?;
    let pkgname = match first.rsplit_once('/') {
        Some((_, pkg)) => pkg,
        None => first,
    };
    Some((path, pkgname.trim()))
}
