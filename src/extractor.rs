//! Per-package metadata extraction.
//!
//! One extractor invocation handles one binary package end to end: open
//! the payload, find metainfo candidates, parse them, correlate XML with
//! desktop entries, consult the cache, fetch media and finalize. The
//! extractor never writes to the cache itself; results travel back to the
//! master, which owns all cache writes.

use indexmap::IndexMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::archive::deb::DebReader;
use crate::cache::Cache;
use crate::hints::Hint;
use crate::icons::IconHandler;
use crate::model::{Component, ComponentKind, Package};
use crate::parsers::{read_appstream_upstream_xml, read_desktop_data, DesktopStatus};
use crate::screenshots::ScreenshotHandler;

/// Pre-read desktop entry, or the reason it could not be read.
struct RawDesktopEntry {
    error: Option<Hint>,
    data: Option<String>,
}

/// Extracts component metadata from binary packages.
pub struct Extractor {
    suite: String,
    archive_component: String,
    archive_root: PathBuf,
    media_root: PathBuf,
    cache: Arc<Cache>,
    icon_handler: IconHandler,
}

impl Extractor {
    pub fn new(
        suite: impl Into<String>,
        archive_component: impl Into<String>,
        archive_root: impl Into<PathBuf>,
        media_root: impl Into<PathBuf>,
        cache: Arc<Cache>,
        icon_handler: IconHandler,
    ) -> Self {
        Extractor {
            suite: suite.into(),
            archive_component: archive_component.into(),
            archive_root: archive_root.into(),
            media_root: media_root.into(),
            cache,
            icon_handler,
        }
    }

    pub fn suite(&self) -> &str {
        &self.suite
    }

    /// Processes one package and returns its components, hints included.
    pub fn process(&self, pkg: &Package) -> Vec<Component> {
        let deb_path = self.archive_root.join(&pkg.filename);
        let mut deb = DebReader::new(&deb_path);

        let file_list: Vec<String> = match deb.file_list() {
            Ok(list) if !list.is_empty() => list.to_vec(),
            Ok(_) | Err(_) => {
                error!(package = %pkg.name, path = %deb_path.display(), "file list could not be read");
                let mut cpt = Component::new(pkg.clone());
                cpt.add_hint(Hint::new(
                    "deb-filelist-error",
                    [("pkg_fname", file_name_of(&pkg.filename))],
                ));
                return vec![cpt];
            }
        };

        // cache all .desktop candidates up front, tagged by basename
        let mut desktop_entries: IndexMap<String, RawDesktopEntry> = IndexMap::new();
        for path in &file_list {
            if !path.starts_with("usr/share/applications/") || !path.ends_with(".desktop") {
                continue;
            }
            let basename = file_name_of(path).to_string();
            let entry = match deb.read_file(path) {
                Ok(data) if data.is_empty() => RawDesktopEntry {
                    error: Some(Hint::new(
                        "deb-empty-file",
                        [
                            ("fname", basename.as_str()),
                            ("pkg_fname", file_name_of(&pkg.filename)),
                        ],
                    )),
                    data: None,
                },
                Ok(data) => RawDesktopEntry {
                    error: None,
                    data: Some(String::from_utf8_lossy(&data).to_string()),
                },
                Err(e) => {
                    let err = e.to_string();
                    RawDesktopEntry {
                        error: Some(Hint::new(
                            "deb-extract-error",
                            [
                                ("fname", basename.as_str()),
                                ("pkg_fname", file_name_of(&pkg.filename)),
                                ("error", err.as_str()),
                            ],
                        )),
                        data: None,
                    }
                }
            };
            desktop_entries.insert(basename, entry);
        }

        let mut components: IndexMap<String, Component> = IndexMap::new();

        // process all AppStream XML files first
        for path in &file_list {
            if !path.starts_with("usr/share/appdata/") || !path.ends_with(".xml") {
                continue;
            }
            let mut cpt = Component::new(pkg.clone());
            let xml_content = match deb.read_file(path) {
                Ok(data) if data.is_empty() => continue,
                Ok(data) => String::from_utf8_lossy(&data).to_string(),
                Err(e) => {
                    // an unreadable metainfo file invalidates the package
                    let err = e.to_string();
                    cpt.add_hint(Hint::new(
                        "deb-extract-error",
                        [
                            ("fname", path.as_str()),
                            ("pkg_fname", file_name_of(&pkg.filename)),
                            ("error", err.as_str()),
                        ],
                    ));
                    return vec![cpt];
                }
            };

            if let Err(e) = read_appstream_upstream_xml(&mut cpt, &xml_content) {
                let err = e.to_string();
                cpt.add_hint(Hint::new(
                    "metainfo-parse-error",
                    [("fname", path.as_str()), ("error", err.as_str())],
                ));
                components.insert(path.clone(), cpt);
                continue;
            }

            let Some(cid) = cpt.cid.clone().filter(|cid| !cid.is_empty()) else {
                cpt.add_hint(Hint::tag_only("metainfo-no-id"));
                components.insert(path.clone(), cpt);
                continue;
            };

            cpt.set_srcdata_checksum(&[xml_content.as_str()]);

            if cpt.kind == Some(ComponentKind::DesktopApp) {
                match take_paired_desktop(&mut desktop_entries, &cid) {
                    None => {
                        cpt.add_hint(Hint::new("missing-desktop-file", [("cid", cid.as_str())]));
                    }
                    Some(raw) => {
                        if let Some(hint) = raw.error {
                            cpt.add_hint(hint);
                        } else if let Some(data) = raw.data {
                            // the metainfo file exists, so NoDisplay is void
                            match read_desktop_data(&mut cpt, &data, true) {
                                Ok(_) => {
                                    cpt.set_srcdata_checksum(&[xml_content.as_str(), data.as_str()]);
                                }
                                Err(e) => {
                                    let err = e.to_string();
                                    cpt.add_hint(Hint::new(
                                        "desktop-file-error",
                                        [("cid", cid.as_str()), ("error", err.as_str())],
                                    ));
                                }
                            }
                        }
                    }
                }
            }

            components.insert(cid, cpt);
        }

        // leftover desktop entries not paired with any XML
        for (basename, raw) in desktop_entries {
            let mut cpt = Component::new(pkg.clone());
            cpt.cid = Some(basename.clone());

            if let Some(hint) = raw.error {
                cpt.add_hint(hint);
                components.insert(basename, cpt);
                continue;
            }
            let Some(data) = raw.data else { continue };
            match read_desktop_data(&mut cpt, &data, false) {
                Ok(DesktopStatus::Ok) => {
                    cpt.set_srcdata_checksum(&[data.as_str()]);
                    components.insert(basename, cpt);
                }
                Ok(DesktopStatus::Invisible) => {
                    // marked invisible on purpose: drop silently
                    debug!(desktop = %basename, "skipping invisible desktop entry");
                }
                Err(e) => {
                    let err = e.to_string();
                    cpt.add_hint(Hint::new(
                        "desktop-file-error",
                        [("fname", basename.as_str()), ("error", err.as_str())],
                    ));
                    components.insert(basename, cpt);
                }
            }
        }

        // media pass for everything that survived so far
        for cpt in components.values_mut() {
            if cpt.is_ignored() {
                continue;
            }
            let Some(gid) = cpt.global_id() else {
                error!(
                    cid = ?cpt.cid,
                    package = %pkg.name,
                    "component has no source-data checksum / global id"
                );
                continue;
            };

            // a cached entry for this gid means the media work is done,
            // unless a different package claimed the id first
            match self.cache.get_metadata(&gid) {
                Ok(Some(existing)) => {
                    let marker = format!("Package: {}\n", pkg.name);
                    if existing.contains(&marker) {
                        continue;
                    }
                    let other = existing
                        .lines()
                        .find_map(|l| l.strip_prefix("Package: "))
                        .unwrap_or_default()
                        .to_string();
                    cpt.add_hint(Hint::new(
                        "metainfo-duplicate-id",
                        [
                            ("cid", cpt.cid.clone().unwrap_or_default().as_str()),
                            ("pkgname", other.as_str()),
                        ],
                    ));
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(gid = %gid, error = %e, "cache lookup failed, refetching media");
                }
            }

            let has_icon =
                self.icon_handler
                    .fetch_icon(cpt, &mut deb, &self.media_root, &self.archive_component);
            if cpt.kind == Some(ComponentKind::DesktopApp) && !has_icon {
                if !cpt.is_ignored() {
                    cpt.add_hint(Hint::new(
                        "gui-app-without-icon",
                        [("cid", cpt.cid.clone().unwrap_or_default().as_str())],
                    ));
                }
            } else if !cpt.screenshots.is_empty() {
                match ScreenshotHandler::new() {
                    Ok(handler) => {
                        handler.fetch_screenshots(cpt, &self.media_root, &self.archive_component);
                    }
                    Err(e) => {
                        warn!(error = %e, "could not set up screenshot downloads");
                    }
                }
            }

            // packages without metainfo descriptions still deserve an entry
            // in software centers
            if cpt.kind == Some(ComponentKind::DesktopApp)
                && cpt.description.is_empty()
                && !cpt.is_ignored()
                && pkg.has_description()
            {
                cpt.description = pkg.description.clone();
                cpt.add_hint(Hint::tag_only("description-from-package"));
            }
        }

        let mut result: Vec<Component> = components.into_values().collect();
        for cpt in &mut result {
            cpt.finalize();
        }
        result
    }
}

/// Finds the desktop entry paired with a component id: either the id
/// itself is the file name (legacy `foo.desktop` ids) or the file is
/// `<cid>.desktop`.
fn take_paired_desktop(
    entries: &mut IndexMap<String, RawDesktopEntry>,
    cid: &str,
) -> Option<RawDesktopEntry> {
    if let Some(entry) = entries.shift_remove(cid) {
        return Some(entry);
    }
    entries.shift_remove(&format!("{cid}.desktop"))
}

fn file_name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::deb::testing::{write_deb, PayloadEntry};
    use crate::icons::finder::NoopIconFinder;
    use crate::model::IconSize;
    use std::io::Cursor;
    use std::path::Path;

    const METAINFO: &str = r#"<?xml version="1.0"?>
<component type="desktop">
  <id>org.example.Foo</id>
  <name>Foo</name>
  <summary>Fooify your bars</summary>
</component>
"#;

    const DESKTOP: &str = "\
[Desktop Entry]
Type=Application
Name=Foo
Comment=Fooify your bars
Icon=foo
Categories=Graphics;
";

    fn png_bytes(size: u32) -> Vec<u8> {
        let img = image::DynamicImage::new_rgba8(size, size);
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn test_package(name: &str) -> Package {
        let mut description = IndexMap::new();
        description.insert("C".to_string(), "<p>From the package</p>".to_string());
        Package {
            name: name.to_string(),
            version: "1.0-1".to_string(),
            arch: "amd64".to_string(),
            filename: format!("pool/main/{name}_1.0-1_amd64.deb"),
            maintainer: Some("Jane Doe <jane@example.org>".to_string()),
            description,
        }
    }

    fn extractor_for(root: &Path) -> Extractor {
        let cache = Arc::new(
            Cache::open(&root.join("cache"), &root.join("export/media")).unwrap(),
        );
        Extractor::new(
            "stable",
            "main",
            root,
            root.join("export/media"),
            cache,
            IconHandler::new(
                vec![IconSize(64), IconSize(128)],
                Arc::new(NoopIconFinder),
            ),
        )
    }

    fn write_package_deb(root: &Path, pkg: &Package, entries: &[PayloadEntry<'_>]) {
        let deb_path = root.join(&pkg.filename);
        std::fs::create_dir_all(deb_path.parent().unwrap()).unwrap();
        write_deb(&deb_path, entries);
    }

    #[test]
    fn pairs_metainfo_with_desktop_file() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = test_package("foo");
        let png = png_bytes(64);
        write_package_deb(
            dir.path(),
            &pkg,
            &[
                PayloadEntry::File("usr/share/appdata/org.example.Foo.xml", METAINFO.as_bytes()),
                PayloadEntry::File(
                    "usr/share/applications/org.example.Foo.desktop",
                    DESKTOP.as_bytes(),
                ),
                PayloadEntry::File("usr/share/icons/hicolor/64x64/apps/foo.png", &png),
            ],
        );

        let cpts = extractor_for(dir.path()).process(&pkg);
        assert_eq!(cpts.len(), 1);
        let cpt = &cpts[0];
        assert_eq!(cpt.cid.as_deref(), Some("org.example.Foo"));
        assert_eq!(cpt.kind, Some(ComponentKind::DesktopApp));
        assert!(!cpt.is_ignored(), "hints: {:?}", cpt.hints);
        assert_eq!(cpt.icons.cached.as_deref(), Some("foo_foo.png"));
        assert_eq!(cpt.categories, vec!["Graphics"]);
        // gid carries the reverse-DNS prefix form
        assert!(cpt.global_id().unwrap().starts_with("org/example/Foo/"));
        // description was filled in from the package
        assert!(cpt
            .hints
            .iter()
            .any(|h| h.tag == "description-from-package"));
        assert_eq!(
            cpt.description.get("C").map(String::as_str),
            Some("<p>From the package</p>")
        );
    }

    #[test]
    fn missing_desktop_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = test_package("foo");
        write_package_deb(
            dir.path(),
            &pkg,
            &[PayloadEntry::File(
                "usr/share/appdata/org.example.Foo.xml",
                METAINFO.as_bytes(),
            )],
        );

        let cpts = extractor_for(dir.path()).process(&pkg);
        assert_eq!(cpts.len(), 1);
        assert!(cpts[0]
            .hints
            .iter()
            .any(|h| h.tag == "missing-desktop-file"));
        assert!(cpts[0].is_ignored());
    }

    #[test]
    fn nodisplay_entry_without_xml_disappears_silently() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = test_package("bar");
        write_package_deb(
            dir.path(),
            &pkg,
            &[PayloadEntry::File(
                "usr/share/applications/bar.desktop",
                b"[Desktop Entry]\nType=Application\nName=Bar\nNoDisplay=true\n",
            )],
        );

        let cpts = extractor_for(dir.path()).process(&pkg);
        assert!(cpts.is_empty());
    }

    #[test]
    fn desktop_only_components_use_the_basename_id() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = test_package("bar");
        let png = png_bytes(64);
        write_package_deb(
            dir.path(),
            &pkg,
            &[
                PayloadEntry::File("usr/share/applications/bar.desktop", DESKTOP.as_bytes()),
                PayloadEntry::File("usr/share/icons/hicolor/64x64/apps/foo.png", &png),
            ],
        );

        let cpts = extractor_for(dir.path()).process(&pkg);
        assert_eq!(cpts.len(), 1);
        assert_eq!(cpts[0].cid.as_deref(), Some("bar.desktop"));
        assert!(cpts[0]
            .global_id()
            .unwrap()
            .starts_with("b/ba/bar.desktop/"));
    }

    #[test]
    fn unreadable_payload_yields_filelist_error() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = test_package("foo");
        let deb_path = dir.path().join(&pkg.filename);
        std::fs::create_dir_all(deb_path.parent().unwrap()).unwrap();
        std::fs::write(&deb_path, b"garbage").unwrap();

        let cpts = extractor_for(dir.path()).process(&pkg);
        assert_eq!(cpts.len(), 1);
        assert!(cpts[0].hints.iter().any(|h| h.tag == "deb-filelist-error"));
        assert!(cpts[0].is_ignored());
    }

    #[test]
    fn desktop_app_without_icon_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = test_package("foo");
        write_package_deb(
            dir.path(),
            &pkg,
            &[
                PayloadEntry::File("usr/share/appdata/org.example.Foo.xml", METAINFO.as_bytes()),
                PayloadEntry::File(
                    "usr/share/applications/org.example.Foo.desktop",
                    DESKTOP.as_bytes(),
                ),
            ],
        );

        let cpts = extractor_for(dir.path()).process(&pkg);
        assert_eq!(cpts.len(), 1);
        assert!(cpts[0]
            .hints
            .iter()
            .any(|h| h.tag == "gui-app-without-icon"));
        assert!(cpts[0].is_ignored());
    }

    #[test]
    fn duplicate_global_ids_lose_to_the_first_package() {
        let dir = tempfile::tempdir().unwrap();

        let pkg_a = test_package("foo");
        let png = png_bytes(64);
        let entries = [
            PayloadEntry::File("usr/share/appdata/org.example.Foo.xml", METAINFO.as_bytes()),
            PayloadEntry::File(
                "usr/share/applications/org.example.Foo.desktop",
                DESKTOP.as_bytes(),
            ),
            PayloadEntry::File("usr/share/icons/hicolor/64x64/apps/foo.png", &png),
        ];
        write_package_deb(dir.path(), &pkg_a, &entries);

        // same metainfo content and version in a differently-named package
        let mut pkg_b = test_package("foo-ng");
        pkg_b.filename = "pool/main/foo-ng_1.0-1_amd64.deb".to_string();
        write_package_deb(dir.path(), &pkg_b, &entries);

        let extractor = extractor_for(dir.path());
        let cpts_a = extractor.process(&pkg_a);
        assert!(!cpts_a[0].is_ignored());
        // the master persists the first result before the second package
        // is looked at
        extractor
            .cache
            .put_components(&pkg_a.pkid(), &cpts_a)
            .unwrap();

        let cpts_b = extractor.process(&pkg_b);
        assert_eq!(cpts_b.len(), 1);
        assert!(cpts_b[0]
            .hints
            .iter()
            .any(|h| h.tag == "metainfo-duplicate-id"));
        assert!(cpts_b[0].is_ignored());
    }
}
