//! Icon lookup across the archive.
//!
//! The [`IconFinder`] trait is the seam between the icon handler and the
//! archive: the contents-driven implementation resolves stock icons via
//! the Contents index and the loaded theme indexes, while the no-op
//! implementation is used when no Contents data is available, limiting
//! lookups to the package itself.

use regex::Regex;
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::theme::Theme;
use crate::archive::contents::ContentsIndex;
use crate::model::IconSize;

/// Extensions tried under `usr/share/pixmaps/`, in preference order.
pub(crate) const PIXMAP_EXTENSIONS: [&str; 7] =
    ["png", "jpg", "svgz", "svg", "gif", "ico", "xpm"];

/// Where an icon file can be found.
#[derive(Debug, Clone)]
pub struct IconLocation {
    /// Payload path of the icon file.
    pub icon_path: String,
    /// Absolute path of the package shipping it; `None` means the
    /// originating package itself.
    pub deb_path: Option<PathBuf>,
}

/// Finds icons in the archive when the originating package does not ship
/// them itself.
pub trait IconFinder: Send + Sync {
    /// Exact candidate payload paths for `icon` at `size`, themes first,
    /// then the pixmaps fallbacks.
    fn candidate_filenames(&self, icon: &str, size: IconSize) -> Vec<String>;

    /// Archive-wide lookup: best location per requested size, never
    /// upscaling.
    fn find_icons(&self, icon: &str, sizes: &[IconSize]) -> BTreeMap<IconSize, IconLocation>;
}

/// Finder used when no Contents index is available.
pub struct NoopIconFinder;

impl IconFinder for NoopIconFinder {
    fn candidate_filenames(&self, icon: &str, _size: IconSize) -> Vec<String> {
        PIXMAP_EXTENSIONS
            .iter()
            .map(|ext| format!("usr/share/pixmaps/{icon}.{ext}"))
            .collect()
    }

    fn find_icons(&self, _icon: &str, _sizes: &[IconSize]) -> BTreeMap<IconSize, IconLocation> {
        BTreeMap::new()
    }
}

/// Contents-index-driven finder honoring the configured theme order.
pub struct ContentsIconFinder {
    contents: ContentsIndex,
    themes: Vec<Theme>,
}

impl ContentsIconFinder {
    /// `themes` must already be ordered by lookup priority
    /// (hicolor, configured theme, Adwaita, breeze).
    pub fn new(contents: ContentsIndex, themes: Vec<Theme>) -> Self {
        ContentsIconFinder { contents, themes }
    }

    pub fn themes(&self) -> &[Theme] {
        &self.themes
    }

    /// One-size lookup: theme candidates first, then the generic sized
    /// directory pattern for themes without an index, then pixmaps.
    fn search_icon(&self, icon: &str, size: IconSize) -> Option<IconLocation> {
        for theme in &self.themes {
            for candidate in theme.matching_icon_filenames(icon, size.pixels()) {
                if let Some(deb_path) = self.contents.deb_path_for(&candidate) {
                    return Some(IconLocation {
                        icon_path: candidate,
                        deb_path: Some(deb_path),
                    });
                }
            }
        }

        if let Ok(re) = sized_dir_regex(icon, size) {
            if let Some((icon_path, deb_path)) = self.contents.find_first(&re) {
                return Some(IconLocation {
                    icon_path,
                    deb_path: Some(deb_path),
                });
            }
        }

        for ext in PIXMAP_EXTENSIONS {
            let candidate = format!("usr/share/pixmaps/{icon}.{ext}");
            if let Some(deb_path) = self.contents.deb_path_for(&candidate) {
                return Some(IconLocation {
                    icon_path: candidate,
                    deb_path: Some(deb_path),
                });
            }
        }

        None
    }
}

impl IconFinder for ContentsIconFinder {
    fn candidate_filenames(&self, icon: &str, size: IconSize) -> Vec<String> {
        let mut candidates = Vec::new();
        for theme in &self.themes {
            candidates.extend(theme.matching_icon_filenames(icon, size.pixels()));
        }
        for ext in PIXMAP_EXTENSIONS {
            candidates.push(format!("usr/share/pixmaps/{icon}.{ext}"));
        }
        candidates
    }

    fn find_icons(&self, icon: &str, sizes: &[IconSize]) -> BTreeMap<IconSize, IconLocation> {
        let mut found = BTreeMap::new();
        for &size in sizes {
            if let Some(location) = self.search_icon(icon, size) {
                found.insert(size, location);
            }
        }

        // never upscale: a missing size may reuse the source found for a
        // strictly larger one and be downscaled later
        let missing: Vec<IconSize> = sizes
            .iter()
            .copied()
            .filter(|s| !found.contains_key(s))
            .collect();
        for size in missing {
            let larger = found
                .range((
                    std::ops::Bound::Excluded(size),
                    std::ops::Bound::Unbounded,
                ))
                .next()
                .map(|(_, location)| location.clone());
            if let Some(location) = larger {
                found.insert(size, location);
            }
        }

        found
    }
}

/// `usr/share/icons/<any theme>/<S>x<S>/apps/<icon>.<raster or vector>`
pub(crate) fn sized_dir_regex(icon: &str, size: IconSize) -> Result<Regex, regex::Error> {
    Regex::new(&format!(
        r"^usr/share/icons/[^/]+/{0}x{0}/apps/{1}\.(png|svgz|svg|xpm)$",
        size.pixels(),
        regex::escape(icon)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Package;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use indexmap::IndexMap;
    use std::io::Write;
    use std::path::Path;

    fn test_package(name: &str) -> Package {
        Package {
            name: name.to_string(),
            version: "1.0".to_string(),
            arch: "amd64".to_string(),
            filename: format!("pool/main/{name}_1.0_amd64.deb"),
            maintainer: None,
            description: IndexMap::new(),
        }
    }

    fn contents_with(root: &Path, lines: &str) -> ContentsIndex {
        let dir = root.join("dists/stable/main");
        std::fs::create_dir_all(&dir).unwrap();
        let file = std::fs::File::create(dir.join("Contents-amd64.gz")).unwrap();
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(lines.as_bytes()).unwrap();
        enc.finish().unwrap();

        let mut packages = IndexMap::new();
        packages.insert("icons-pkg".to_string(), test_package("icons-pkg"));
        packages.insert("pixmaps-pkg".to_string(), test_package("pixmaps-pkg"));

        let mut contents = ContentsIndex::new(root);
        contents
            .load("stable", "main", "amd64", &packages)
            .unwrap();
        contents
    }

    fn hicolor() -> Theme {
        Theme::from_index_data(
            "hicolor",
            "[64x64/apps]\nSize=64\nType=Fixed\n\n[128x128/apps]\nSize=128\nType=Fixed\n",
        )
        .unwrap()
    }

    #[test]
    fn theme_candidates_win_over_pixmaps() {
        let dir = tempfile::tempdir().unwrap();
        let contents = contents_with(
            dir.path(),
            "usr/share/icons/hicolor/64x64/apps/foo.png graphics/icons-pkg\n\
             usr/share/pixmaps/foo.png graphics/pixmaps-pkg\n",
        );
        let finder = ContentsIconFinder::new(contents, vec![hicolor()]);

        let found = finder.find_icons("foo", &[IconSize(64)]);
        let location = found.get(&IconSize(64)).unwrap();
        assert_eq!(
            location.icon_path,
            "usr/share/icons/hicolor/64x64/apps/foo.png"
        );
        assert!(location
            .deb_path
            .as_ref()
            .unwrap()
            .ends_with("pool/main/icons-pkg_1.0_amd64.deb"));
    }

    #[test]
    fn pixmaps_are_the_last_resort() {
        let dir = tempfile::tempdir().unwrap();
        let contents = contents_with(
            dir.path(),
            "usr/share/pixmaps/foo.png graphics/pixmaps-pkg\n",
        );
        let finder = ContentsIconFinder::new(contents, vec![hicolor()]);

        let found = finder.find_icons("foo", &[IconSize(64)]);
        assert_eq!(
            found.get(&IconSize(64)).unwrap().icon_path,
            "usr/share/pixmaps/foo.png"
        );
    }

    #[test]
    fn missing_sizes_fall_back_to_larger_sources_only() {
        let dir = tempfile::tempdir().unwrap();
        let contents = contents_with(
            dir.path(),
            "usr/share/icons/hicolor/128x128/apps/foo.png graphics/icons-pkg\n",
        );
        let finder = ContentsIconFinder::new(contents, vec![hicolor()]);

        let found = finder.find_icons("foo", &[IconSize(64), IconSize(128)]);
        // 64 reuses the 128 source for downscaling
        assert_eq!(
            found.get(&IconSize(64)).unwrap().icon_path,
            "usr/share/icons/hicolor/128x128/apps/foo.png"
        );

        // but a 256 request must not be upscaled from 128
        let found = finder.find_icons("foo", &[IconSize(256)]);
        assert!(found.is_empty());
    }

    #[test]
    fn sized_dirs_match_unindexed_themes() {
        let dir = tempfile::tempdir().unwrap();
        let contents = contents_with(
            dir.path(),
            "usr/share/icons/Numix/64x64/apps/foo.png graphics/icons-pkg\n",
        );
        // no theme indexes loaded at all
        let finder = ContentsIconFinder::new(contents, Vec::new());

        let found = finder.find_icons("foo", &[IconSize(64)]);
        assert_eq!(
            found.get(&IconSize(64)).unwrap().icon_path,
            "usr/share/icons/Numix/64x64/apps/foo.png"
        );
    }

    #[test]
    fn noop_finder_finds_nothing_archive_wide() {
        let finder = NoopIconFinder;
        assert!(finder.find_icons("foo", &[IconSize(64)]).is_empty());
        let candidates = finder.candidate_filenames("foo", IconSize(64));
        assert_eq!(candidates[0], "usr/share/pixmaps/foo.png");
    }
}
