//! Package index access.
//!
//! Reads the per-(suite, component, architecture) `Packages.gz` index into
//! a name → [`Package`] map where the highest version wins, optionally
//! merging the English translation index for short descriptions.

use indexmap::IndexMap;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use tracing::warn;

use super::ReadError;
use crate::model::Package;
use crate::version::compare_versions;

/// One RFC-822-style paragraph: field name → value with continuation lines
/// joined by newlines.
type Paragraph = HashMap<String, String>;

fn parse_paragraphs(text: &str) -> Vec<Paragraph> {
    let mut paragraphs = Vec::new();
    let mut current: Paragraph = HashMap::new();
    let mut last_field: Option<String> = None;

    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
            last_field = None;
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // continuation of the previous field
            if let Some(field) = &last_field {
                if let Some(value) = current.get_mut(field) {
                    value.push('\n');
                    value.push_str(line.trim_start());
                }
            }
            continue;
        }
        match line.split_once(':') {
            Some((field, value)) => {
                current.insert(field.trim().to_string(), value.trim().to_string());
                last_field = Some(field.trim().to_string());
            }
            None => {
                warn!(line, "skipping malformed index line");
            }
        }
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }
    paragraphs
}

/// Converts a Debian package description to the HTML-fragment form used in
/// component descriptions: the synopsis and each `.`-separated block become
/// `<p>` paragraphs.
fn description_to_html(desc: &str) -> String {
    if desc.starts_with("<p>") {
        return desc.to_string();
    }
    let mut html = String::from("<p>");
    let mut first = true;
    for line in desc.lines() {
        let line = line.trim();
        if line == "." {
            html.push_str("</p><p>");
            first = true;
            continue;
        }
        if !first {
            html.push(' ');
        }
        html.push_str(&quick_xml::escape::escape(line));
        first = false;
    }
    html.push_str("</p>");
    html
}

/// Reads the gzip-compressed `Packages` index for one
/// (suite, component, architecture) and returns the newest-version map.
///
/// When `with_description` is set, the bzip2-compressed `Translation-en`
/// index is merged to fill the untranslated short description, falling back
/// to the `Description` field of the package paragraph.
pub fn read_packages_index(
    archive_root: &Path,
    suite: &str,
    component: &str,
    arch: &str,
    with_description: bool,
) -> Result<IndexMap<String, Package>, ReadError> {
    let index_path = archive_root
        .join("dists")
        .join(suite)
        .join(component)
        .join(format!("binary-{arch}"))
        .join("Packages.gz");
    if !index_path.is_file() {
        return Err(ReadError::IndexMissing(index_path));
    }

    let mut translations: HashMap<String, String> = HashMap::new();
    if with_description {
        let l10n_path = archive_root
            .join("dists")
            .join(suite)
            .join(component)
            .join("i18n")
            .join("Translation-en.bz2");
        if l10n_path.is_file() {
            match read_translations(&l10n_path) {
                Ok(map) => translations = map,
                Err(e) => {
                    warn!(path = %l10n_path.display(), error = %e, "could not use i18n index");
                }
            }
        }
    }

    let mut text = String::new();
    let file = std::fs::File::open(&index_path)?;
    flate2::read::MultiGzDecoder::new(file).read_to_string(&mut text)?;

    let mut packages: IndexMap<String, Package> = IndexMap::new();
    for paragraph in parse_paragraphs(&text) {
        let Some(name) = paragraph.get("Package") else {
            warn!("skipping index paragraph without a Package field");
            continue;
        };
        let Some(version) = paragraph.get("Version") else {
            warn!(package = %name, "skipping index paragraph without a Version field");
            continue;
        };
        let Some(filename) = paragraph.get("Filename") else {
            warn!(package = %name, version = %version, "package has no filename specified");
            continue;
        };

        let mut pkg = Package {
            name: name.clone(),
            version: version.clone(),
            arch: paragraph
                .get("Architecture")
                .cloned()
                .unwrap_or_else(|| arch.to_string()),
            filename: filename.clone(),
            maintainer: paragraph.get("Maintainer").cloned(),
            description: IndexMap::new(),
        };

        if with_description {
            let desc = translations
                .get(&pkg.name)
                .or_else(|| paragraph.get("Description"));
            if let Some(desc) = desc {
                if !desc.is_empty() {
                    pkg.description
                        .insert("C".to_string(), description_to_html(desc));
                }
            }
        }

        // keep the newer (or equal) version we already have
        let keep_existing = packages
            .get(&pkg.name)
            .is_some_and(|existing| compare_versions(&existing.version, &pkg.version) != Ordering::Less);
        if !keep_existing {
            packages.insert(pkg.name.clone(), pkg);
        }
    }

    Ok(packages)
}

fn read_translations(path: &Path) -> Result<HashMap<String, String>, ReadError> {
    let mut text = String::new();
    let file = std::fs::File::open(path)?;
    bzip2::read::MultiBzDecoder::new(file).read_to_string(&mut text)?;

    let mut map = HashMap::new();
    for paragraph in parse_paragraphs(&text) {
        let Some(name) = paragraph.get("Package") else {
            continue;
        };
        if let Some(desc) = paragraph.get("Description-en") {
            map.insert(name.clone(), desc.clone());
        }
    }
    Ok(map)
}
