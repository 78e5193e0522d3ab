//! XDG icon-theme index.
//!
//! A theme package ships `usr/share/icons/<name>/index.theme`, an INI file
//! whose sections describe icon directories with size and scaling rules.
//! The parsed index answers which candidate file paths could hold an icon
//! of a given name at a given size.

use configparser::ini::Ini;
use thiserror::Error;

use crate::archive::deb::DebReader;
use crate::archive::ReadError;

/// Extensions considered when enumerating theme candidates, in preference
/// order.
const THEME_EXTENSIONS: [&str; 4] = ["png", "svgz", "svg", "xpm"];

#[derive(Error, Debug)]
pub enum ThemeError {
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error("invalid theme index for '{theme}': {reason}")]
    Parse { theme: String, reason: String },
}

/// How a theme directory matches requested sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryType {
    Fixed,
    Scalable,
    Threshold,
}

/// One directory entry of a theme index.
#[derive(Debug, Clone)]
pub struct ThemeDirectory {
    pub path: String,
    pub dir_type: DirectoryType,
    pub size: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub threshold: u32,
}

impl ThemeDirectory {
    /// Size matching per the XDG icon-theme specification.
    pub fn matches_size(&self, size: u32) -> bool {
        match self.dir_type {
            DirectoryType::Fixed => size == self.size,
            DirectoryType::Scalable => self.min_size <= size && size <= self.max_size,
            DirectoryType::Threshold => {
                self.size.saturating_sub(self.threshold) <= size
                    && size <= self.size + self.threshold
            }
        }
    }
}

/// Parsed form of one icon theme.
#[derive(Debug, Clone)]
pub struct Theme {
    pub name: String,
    pub directories: Vec<ThemeDirectory>,
}

impl Theme {
    /// Extracts and parses the index from the theme's owning package.
    pub fn from_package(name: &str, deb_path: &std::path::Path) -> Result<Self, ThemeError> {
        let mut deb = DebReader::new(deb_path);
        let index_path = format!("usr/share/icons/{name}/index.theme");
        let data = deb.read_file(&index_path)?;
        let data = String::from_utf8_lossy(&data);
        Self::from_index_data(name, &data)
    }

    pub fn from_index_data(name: &str, data: &str) -> Result<Self, ThemeError> {
        let mut ini = Ini::new_cs();
        ini.read(data.to_string()).map_err(|e| ThemeError::Parse {
            theme: name.to_string(),
            reason: e,
        })?;

        let get = |section: &str, key: &str| -> Option<String> {
            ini.get(section, key).map(|v| v.trim().to_string())
        };
        let get_u32 = |section: &str, key: &str| -> Option<u32> {
            get(section, key).and_then(|v| v.parse().ok())
        };

        let mut directories = Vec::new();
        for section in ini.sections() {
            // only sections with a valid Size describe icon directories
            let Some(size) = get_u32(&section, "Size") else {
                continue;
            };
            let dir_type = match get(&section, "Type").as_deref() {
                Some("Fixed") => DirectoryType::Fixed,
                Some("Scalable") => DirectoryType::Scalable,
                _ => DirectoryType::Threshold,
            };
            directories.push(ThemeDirectory {
                path: section.clone(),
                dir_type,
                size,
                min_size: get_u32(&section, "MinSize").unwrap_or(size),
                max_size: get_u32(&section, "MaxSize").unwrap_or(size),
                threshold: get_u32(&section, "Threshold").unwrap_or(2),
            });
        }

        Ok(Theme {
            name: name.to_string(),
            directories,
        })
    }

    /// Candidate file paths for `icon` at `size`, walking matching
    /// directories in index order.
    pub fn matching_icon_filenames(&self, icon: &str, size: u32) -> Vec<String> {
        let mut candidates = Vec::new();
        for dir in &self.directories {
            if !dir.matches_size(size) {
                continue;
            }
            for ext in THEME_EXTENSIONS {
                candidates.push(format!(
                    "usr/share/icons/{}/{}/{}.{}",
                    self.name, dir.path, icon, ext
                ));
            }
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = "\
[Icon Theme]
Name=hicolor
Comment=Fallback icon theme
Directories=48x48/apps,64x64/apps,scalable/apps

[48x48/apps]
Size=48
Context=Applications
Type=Fixed

[64x64/apps]
Size=64
Context=Applications
Type=Threshold

[scalable/apps]
Size=128
Context=Applications
Type=Scalable
MinSize=8
MaxSize=512
";

    #[test]
    fn parses_directory_sections() {
        let theme = Theme::from_index_data("hicolor", INDEX).unwrap();
        // the [Icon Theme] section has no Size and is skipped
        assert_eq!(theme.directories.len(), 3);
        let fixed = &theme.directories[0];
        assert_eq!(fixed.dir_type, DirectoryType::Fixed);
        assert_eq!(fixed.size, 48);
        let threshold = &theme.directories[1];
        assert_eq!(threshold.dir_type, DirectoryType::Threshold);
        assert_eq!(threshold.threshold, 2);
        let scalable = &theme.directories[2];
        assert_eq!(scalable.dir_type, DirectoryType::Scalable);
        assert_eq!(scalable.min_size, 8);
        assert_eq!(scalable.max_size, 512);
    }

    #[test]
    fn size_matching_follows_the_xdg_rules() {
        let theme = Theme::from_index_data("hicolor", INDEX).unwrap();
        let fixed = &theme.directories[0];
        assert!(fixed.matches_size(48));
        assert!(!fixed.matches_size(47));

        let threshold = &theme.directories[1];
        assert!(threshold.matches_size(62));
        assert!(threshold.matches_size(66));
        assert!(!threshold.matches_size(61));
        assert!(!threshold.matches_size(67));

        let scalable = &theme.directories[2];
        assert!(scalable.matches_size(8));
        assert!(scalable.matches_size(512));
        assert!(!scalable.matches_size(513));
    }

    #[test]
    fn candidates_walk_matching_directories_in_order() {
        let theme = Theme::from_index_data("hicolor", INDEX).unwrap();
        let candidates = theme.matching_icon_filenames("foo", 64);
        assert_eq!(
            candidates,
            vec![
                "usr/share/icons/hicolor/64x64/apps/foo.png",
                "usr/share/icons/hicolor/64x64/apps/foo.svgz",
                "usr/share/icons/hicolor/64x64/apps/foo.svg",
                "usr/share/icons/hicolor/64x64/apps/foo.xpm",
                "usr/share/icons/hicolor/scalable/apps/foo.png",
                "usr/share/icons/hicolor/scalable/apps/foo.svgz",
                "usr/share/icons/hicolor/scalable/apps/foo.svg",
                "usr/share/icons/hicolor/scalable/apps/foo.xpm",
            ]
        );
    }

    #[test]
    fn reads_the_index_from_a_theme_package() {
        use crate::archive::deb::testing::{write_deb, PayloadEntry};

        let dir = tempfile::tempdir().unwrap();
        let deb = dir.path().join("hicolor-icon-theme_1.0_all.deb");
        write_deb(
            &deb,
            &[PayloadEntry::File(
                "usr/share/icons/hicolor/index.theme",
                INDEX.as_bytes(),
            )],
        );

        let theme = Theme::from_package("hicolor", &deb).unwrap();
        assert_eq!(theme.name, "hicolor");
        assert_eq!(theme.directories.len(), 3);
    }
}
