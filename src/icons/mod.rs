//! Icon resolution, rendering and storage.
//!
//! For every component with an icon reference the handler produces PNG
//! files at the configured target sizes in the media pool. Lookup tries
//! the originating package first and falls back to the whole archive via
//! the [`finder::IconFinder`]. Vector sources are rasterized, raster
//! sources are resampled to the exact target geometry; upstream sizes are
//! never trusted.

pub mod finder;
pub mod theme;

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::archive::deb::DebReader;
use crate::hints::Hint;
use crate::model::{Component, IconSize};
use finder::{IconFinder, IconLocation, PIXMAP_EXTENSIONS};

/// Source formats we can turn into PNGs.
const ALLOWED_ICON_EXTENSIONS: [&str; 5] = ["png", "svg", "svgz", "gif", "jpg"];

/// Upstream image dimensions are untrusted; anything above this on either
/// axis is rejected before decoding continues.
const MAX_IMAGE_AXIS: u32 = 16384;

/// Image or vector decoding failure.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("could not decompress svgz data: {0}")]
    SvgzDecompress(String),
    #[error("could not decode image: {0}")]
    Decode(String),
    #[error("image dimensions {0}x{1} exceed the sanity limit")]
    TooLarge(u32, u32),
    #[error("could not encode png: {0}")]
    Encode(String),
}

/// Resolves, renders and stores component icons.
pub struct IconHandler {
    /// Requested sizes, ascending; 64 is mandatory in the output.
    sizes: Vec<IconSize>,
    finder: Arc<dyn IconFinder>,
}

impl IconHandler {
    pub fn new(mut sizes: Vec<IconSize>, finder: Arc<dyn IconFinder>) -> Self {
        if !sizes.contains(&IconSize(64)) {
            sizes.push(IconSize(64));
        }
        sizes.sort();
        sizes.dedup();
        IconHandler { sizes, finder }
    }

    pub fn sizes(&self) -> &[IconSize] {
        &self.sizes
    }

    /// Resolves the component's icon reference into cached PNGs under
    /// `<media_root>/<archive_component>/<gid>/icons/<WxH>/`.
    ///
    /// Returns whether a 64×64 icon ended up in the pool. Failure reasons
    /// are reported as hints on the component.
    pub fn fetch_icon(
        &self,
        cpt: &mut Component,
        deb: &mut DebReader,
        media_root: &Path,
        archive_component: &str,
    ) -> bool {
        let Some(icon_ref) = cpt.icon_name.clone().filter(|name| !name.is_empty()) else {
            return false;
        };
        let Some(gid) = cpt.global_id() else {
            warn!(cid = ?cpt.cid, "component without global id, skipping icon lookup");
            return false;
        };
        let Some(pkg_name) = cpt.package.as_ref().map(|p| p.name.clone()) else {
            return false;
        };
        let icons_dir = media_root.join(archive_component).join(&gid).join("icons");

        let file_list: Vec<String> = match deb.file_list() {
            Ok(list) => list.to_vec(),
            Err(_) => Vec::new(),
        };

        // an absolute reference names one file inside this very package
        if icon_ref.starts_with('/') {
            let stripped = icon_ref.trim_start_matches('/');
            if file_list.iter().any(|f| f == stripped) {
                let base = file_base_name(stripped);
                let cached_name = format!("{pkg_name}_{base}.png");
                match deb.read_file(stripped) {
                    Ok(data) => match render_icon_png(&data, stripped, IconSize(64)) {
                        Ok(png) => {
                            if store_icon(&icons_dir, IconSize(64), &cached_name, &png).is_ok() {
                                cpt.icons.cached = Some(cached_name);
                                return true;
                            }
                        }
                        Err(e) => {
                            add_render_hint(cpt, stripped, &e);
                            return false;
                        }
                    },
                    Err(e) => {
                        debug!(icon = stripped, error = %e, "could not extract absolute icon");
                    }
                }
            }
        }

        // strip directory components and check the format
        let name = icon_ref.rsplit('/').next().unwrap_or(&icon_ref).to_string();
        let (base, ext) = split_extension(&name);
        if let Some(ext) = &ext {
            if !ALLOWED_ICON_EXTENSIONS.contains(&ext.as_str()) {
                cpt.add_hint(Hint::new(
                    "icon-format-unsupported",
                    [("icon_fname", name.as_str())],
                ));
                return false;
            }
        }
        let cached_name = format!("{pkg_name}_{base}.png");

        // pass one: the originating package
        let local = self.search_in_package(&base, &file_list);
        let mut stored: BTreeMap<IconSize, ()> = BTreeMap::new();
        for (size, path) in &local {
            match deb.read_file(path) {
                Ok(data) => match render_icon_png(&data, path, *size) {
                    Ok(png) => {
                        if store_icon(&icons_dir, *size, &cached_name, &png).is_ok() {
                            stored.insert(*size, ());
                        }
                    }
                    Err(e) => {
                        add_render_hint(cpt, path, &e);
                        return false;
                    }
                },
                Err(e) => {
                    debug!(icon = %path, error = %e, "could not extract icon from package");
                }
            }
        }

        if !stored.contains_key(&IconSize(64)) {
            // a pixmap in an unusable format stops the lookup entirely
            if let Some(bad) = disallowed_pixmap(&base, &file_list) {
                cpt.add_hint(Hint::new(
                    "icon-format-unsupported",
                    [("icon_fname", bad.as_str())],
                ));
                return false;
            }

            // pass two: the whole archive, making this a stock icon too
            let missing: Vec<IconSize> = self
                .sizes
                .iter()
                .copied()
                .filter(|s| !stored.contains_key(s))
                .collect();
            let archive_found = self.finder.find_icons(&base, &missing);
            if !archive_found.is_empty() {
                cpt.icons.stock = Some(base.clone());
            }
            for (size, location) in archive_found {
                if self.store_from_location(&location, size, &icons_dir, &cached_name, cpt) {
                    stored.insert(size, ());
                } else if cpt.is_ignored() {
                    return false;
                }
            }
        }

        if stored.contains_key(&IconSize(64)) {
            cpt.icons.cached = Some(cached_name);
            return true;
        }

        cpt.add_hint(Hint::new("icon-not-found", [("icon_fname", name.as_str())]));
        false
    }

    /// Candidate lookup against the package's own file list, with
    /// downscale fallback for missing sizes.
    fn search_in_package(&self, base: &str, file_list: &[String]) -> BTreeMap<IconSize, String> {
        let mut found: BTreeMap<IconSize, String> = BTreeMap::new();
        for &size in &self.sizes {
            let hit = self
                .finder
                .candidate_filenames(base, size)
                .into_iter()
                .find(|candidate| file_list.iter().any(|f| f == candidate))
                .or_else(|| {
                    finder::sized_dir_regex(base, size).ok().and_then(|re| {
                        file_list.iter().find(|f| re.is_match(f)).cloned()
                    })
                })
                .or_else(|| {
                    scalable_regex(base).ok().and_then(|re| {
                        file_list.iter().find(|f| re.is_match(f)).cloned()
                    })
                });
            if let Some(path) = hit {
                found.insert(size, path);
            }
        }

        // never upscale, but larger sources may serve smaller sizes
        let missing: Vec<IconSize> = self
            .sizes
            .iter()
            .copied()
            .filter(|s| !found.contains_key(s))
            .collect();
        for size in missing {
            let larger = found
                .range((std::ops::Bound::Excluded(size), std::ops::Bound::Unbounded))
                .next()
                .map(|(_, path)| path.clone());
            if let Some(path) = larger {
                found.insert(size, path);
            }
        }
        found
    }

    fn store_from_location(
        &self,
        location: &IconLocation,
        size: IconSize,
        icons_dir: &Path,
        cached_name: &str,
        cpt: &mut Component,
    ) -> bool {
        let Some(deb_path) = &location.deb_path else {
            return false;
        };
        let mut other = DebReader::new(deb_path);
        match other.read_file(&location.icon_path) {
            Ok(data) => match render_icon_png(&data, &location.icon_path, size) {
                Ok(png) => store_icon(icons_dir, size, cached_name, &png).is_ok(),
                Err(e) => {
                    add_render_hint(cpt, &location.icon_path, &e);
                    false
                }
            },
            Err(e) => {
                debug!(icon = %location.icon_path, error = %e, "could not extract stock icon");
                false
            }
        }
    }
}

fn add_render_hint(cpt: &mut Component, path: &str, error: &RenderError) {
    let tag = match error {
        RenderError::SvgzDecompress(_) => "svgz-decompress-error",
        _ => "icon-format-unsupported",
    };
    let err = error.to_string();
    cpt.add_hint(Hint::new(tag, [("icon_fname", path), ("error", err.as_str())]));
}

/// Is there a pixmap for this icon in a format outside the allowed set?
fn disallowed_pixmap(base: &str, file_list: &[String]) -> Option<String> {
    for ext in PIXMAP_EXTENSIONS {
        if ALLOWED_ICON_EXTENSIONS.contains(&ext) {
            continue;
        }
        let candidate = format!("usr/share/pixmaps/{base}.{ext}");
        if file_list.iter().any(|f| *f == candidate) {
            return Some(candidate);
        }
    }
    None
}

/// `usr/share/icons/<any theme>/scalable/apps/<icon>.svg[z]`
fn scalable_regex(icon: &str) -> Result<regex::Regex, regex::Error> {
    regex::Regex::new(&format!(
        r"^usr/share/icons/[^/]+/scalable/apps/{}\.(svg|svgz)$",
        regex::escape(icon)
    ))
}

fn file_base_name(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    split_extension(name).0
}

/// Image suffixes we recognize at all; dotted icon names like
/// "org.gnome.Maps" must keep their dots.
const KNOWN_IMAGE_EXTENSIONS: [&str; 12] = [
    "png", "svg", "svgz", "gif", "jpg", "jpeg", "xpm", "ico", "bmp", "tif", "tiff", "webp",
];

/// Splits a known image extension off an icon file name.
fn split_extension(name: &str) -> (String, Option<String>) {
    match name.rsplit_once('.') {
        Some((base, ext)) if !base.is_empty() => {
            let ext = ext.to_ascii_lowercase();
            if KNOWN_IMAGE_EXTENSIONS.contains(&ext.as_str()) {
                (base.to_string(), Some(ext))
            } else {
                (name.to_string(), None)
            }
        }
        _ => (name.to_string(), None),
    }
}

/// Writes one icon PNG, skipping the write when the destination exists.
fn store_icon(
    icons_dir: &Path,
    size: IconSize,
    name: &str,
    data: &[u8],
) -> std::io::Result<()> {
    let dir = icons_dir.join(size.to_string());
    std::fs::create_dir_all(&dir)?;
    let dest = dir.join(name);
    if dest.exists() {
        return Ok(());
    }
    std::fs::write(dest, data)
}

/// Renders icon source data to a PNG of exactly `size`.
pub fn render_icon_png(
    data: &[u8],
    source_path: &str,
    size: IconSize,
) -> Result<Vec<u8>, RenderError> {
    let ext = source_path
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "svgz" => {
            let svg = inflate_svgz(data)?;
            rasterize_svg(&svg, size)
        }
        "svg" => rasterize_svg(data, size),
        _ => resample_raster(data, size),
    }
}

/// Inflates an svgz stream; gzip framing is the norm but bare zlib
/// streams exist in the wild.
fn inflate_svgz(data: &[u8]) -> Result<Vec<u8>, RenderError> {
    let mut out = Vec::new();
    if flate2::read::GzDecoder::new(data)
        .read_to_end(&mut out)
        .is_ok()
    {
        return Ok(out);
    }
    out.clear();
    flate2::read::ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| RenderError::SvgzDecompress(e.to_string()))?;
    Ok(out)
}

fn rasterize_svg(data: &[u8], size: IconSize) -> Result<Vec<u8>, RenderError> {
    let tree = usvg::Tree::from_data(data, &usvg::Options::default())
        .map_err(|e| RenderError::Decode(e.to_string()))?;
    let px = size.pixels();
    let mut pixmap = tiny_skia::Pixmap::new(px, px)
        .ok_or_else(|| RenderError::Encode("could not allocate pixmap".to_string()))?;
    let tree_size = tree.size();
    let transform = tiny_skia::Transform::from_scale(
        px as f32 / tree_size.width(),
        px as f32 / tree_size.height(),
    );
    resvg::render(&tree, transform, &mut pixmap.as_mut());
    pixmap
        .encode_png()
        .map_err(|e| RenderError::Encode(e.to_string()))
}

/// Decodes a raster image and resamples it to the exact target size.
/// The source geometry is never kept: upstream sizes are untrusted.
fn resample_raster(data: &[u8], size: IconSize) -> Result<Vec<u8>, RenderError> {
    let img = image::load_from_memory(data).map_err(|e| RenderError::Decode(e.to_string()))?;
    if img.width() > MAX_IMAGE_AXIS || img.height() > MAX_IMAGE_AXIS {
        return Err(RenderError::TooLarge(img.width(), img.height()));
    }
    let px = size.pixels();
    let resized = img.resize_exact(px, px, image::imageops::FilterType::Lanczos3);
    let mut buf = Vec::new();
    resized
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| RenderError::Encode(e.to_string()))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::finder::NoopIconFinder;
    use super::*;
    use crate::archive::deb::testing::{write_deb, PayloadEntry};
    use crate::hints::Hint;
    use crate::model::{Component, ComponentKind, Package};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::DynamicImage::new_rgba8(width, height);
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    const SVG: &[u8] =
        b"<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"32\" height=\"32\">\
          <rect width=\"32\" height=\"32\" fill=\"#336699\"/></svg>";

    fn test_component(icon: &str) -> Component {
        let mut cpt = Component::new(Package {
            name: "foo".to_string(),
            version: "1.0".to_string(),
            arch: "amd64".to_string(),
            filename: "pool/main/f/foo/foo_1.0_amd64.deb".to_string(),
            maintainer: None,
            description: Default::default(),
        });
        cpt.cid = Some("org.example.Foo".to_string());
        cpt.kind = Some(ComponentKind::DesktopApp);
        cpt.icon_name = Some(icon.to_string());
        cpt.set_srcdata_checksum(&["<component/>"]);
        cpt
    }

    fn handler() -> IconHandler {
        IconHandler::new(
            vec![IconSize(64), IconSize(128)],
            Arc::new(NoopIconFinder),
        )
    }

    #[test]
    fn raster_icons_are_resampled_to_exact_sizes() {
        let png = png_bytes(48, 48);
        let out = render_icon_png(&png, "foo.png", IconSize(64)).unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 64));
    }

    #[test]
    fn svg_icons_are_rasterized() {
        let out = render_icon_png(SVG, "foo.svg", IconSize(64)).unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 64));
    }

    #[test]
    fn svgz_icons_are_inflated_first() {
        use flate2::write::GzEncoder;
        use std::io::Write;
        let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(SVG).unwrap();
        let svgz = enc.finish().unwrap();

        let out = render_icon_png(&svgz, "foo.svgz", IconSize(128)).unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (128, 128));
    }

    #[test]
    fn corrupt_svgz_is_a_decompress_error() {
        let result = render_icon_png(b"not compressed at all", "foo.svgz", IconSize(64));
        assert!(matches!(result, Err(RenderError::SvgzDecompress(_))));
    }

    #[test]
    fn fetches_icon_from_the_package_itself() {
        let dir = tempfile::tempdir().unwrap();
        let deb = dir.path().join("foo.deb");
        let png = png_bytes(64, 64);
        write_deb(
            &deb,
            &[PayloadEntry::File(
                "usr/share/icons/hicolor/64x64/apps/foo.png",
                &png,
            )],
        );
        let media = dir.path().join("media");

        let mut cpt = test_component("foo");
        let mut reader = DebReader::new(&deb);
        let ok = handler().fetch_icon(&mut cpt, &mut reader, &media, "main");
        assert!(ok);
        assert_eq!(cpt.icons.cached.as_deref(), Some("foo_foo.png"));
        assert!(cpt.icons.stock.is_none());

        let gid = cpt.global_id().unwrap();
        let icon_path = media
            .join("main")
            .join(&gid)
            .join("icons/64x64/foo_foo.png");
        assert!(icon_path.is_file());
    }

    #[test]
    fn larger_icons_are_downscaled_for_missing_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let deb = dir.path().join("foo.deb");
        let png = png_bytes(128, 128);
        write_deb(
            &deb,
            &[PayloadEntry::File(
                "usr/share/icons/hicolor/128x128/apps/foo.png",
                &png,
            )],
        );
        let media = dir.path().join("media");

        let mut cpt = test_component("foo");
        let mut reader = DebReader::new(&deb);
        assert!(handler().fetch_icon(&mut cpt, &mut reader, &media, "main"));

        let gid = cpt.global_id().unwrap();
        let base = media.join("main").join(&gid).join("icons");
        for size in ["64x64", "128x128"] {
            let path = base.join(size).join("foo_foo.png");
            assert!(path.is_file(), "missing {size}");
            let img = image::open(&path).unwrap();
            let expect: u32 = size.split('x').next().unwrap().parse().unwrap();
            assert_eq!(img.width(), expect);
        }
    }

    #[test]
    fn scalable_vector_icons_serve_all_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let deb = dir.path().join("foo.deb");
        write_deb(
            &deb,
            &[PayloadEntry::File(
                "usr/share/icons/hicolor/scalable/apps/foo.svg",
                SVG,
            )],
        );
        let media = dir.path().join("media");

        let mut cpt = test_component("foo");
        let mut reader = DebReader::new(&deb);
        assert!(handler().fetch_icon(&mut cpt, &mut reader, &media, "main"));
        assert_eq!(cpt.icons.cached.as_deref(), Some("foo_foo.png"));
    }

    #[test]
    fn falls_back_to_stock_icons_across_the_archive() {
        use crate::archive::contents::ContentsIndex;
        use crate::icons::finder::ContentsIconFinder;
        use flate2::write::GzEncoder;
        use indexmap::IndexMap;
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();

        // the application package itself ships no icon
        let app_deb = dir.path().join("foo.deb");
        write_deb(&app_deb, &[PayloadEntry::File("usr/bin/foo", b"x")]);

        // a separate package provides the icon, known via the contents index
        let icons_deb = dir.path().join("pool/main/foo-icons_1.0_all.deb");
        std::fs::create_dir_all(icons_deb.parent().unwrap()).unwrap();
        let png = png_bytes(64, 64);
        write_deb(
            &icons_deb,
            &[PayloadEntry::File(
                "usr/share/icons/hicolor/64x64/apps/foo.png",
                &png,
            )],
        );

        let contents_dir = dir.path().join("dists/stable/main");
        std::fs::create_dir_all(&contents_dir).unwrap();
        let file = std::fs::File::create(contents_dir.join("Contents-amd64.gz")).unwrap();
        let mut enc = GzEncoder::new(file, flate2::Compression::default());
        enc.write_all(b"usr/share/icons/hicolor/64x64/apps/foo.png graphics/foo-icons\n")
            .unwrap();
        enc.finish().unwrap();

        let mut packages = IndexMap::new();
        packages.insert(
            "foo-icons".to_string(),
            Package {
                name: "foo-icons".to_string(),
                version: "1.0".to_string(),
                arch: "all".to_string(),
                filename: "pool/main/foo-icons_1.0_all.deb".to_string(),
                maintainer: None,
                description: Default::default(),
            },
        );
        let mut contents = ContentsIndex::new(dir.path());
        contents.load("stable", "main", "amd64", &packages).unwrap();
        let handler = IconHandler::new(
            vec![IconSize(64)],
            Arc::new(ContentsIconFinder::new(contents, Vec::new())),
        );

        let media = dir.path().join("media");
        let mut cpt = test_component("foo");
        let mut reader = DebReader::new(&app_deb);
        assert!(handler.fetch_icon(&mut cpt, &mut reader, &media, "main"));
        assert_eq!(cpt.icons.cached.as_deref(), Some("foo_foo.png"));
        // the icon also counts as a stock icon now
        assert_eq!(cpt.icons.stock.as_deref(), Some("foo"));
        assert!(cpt.hints.is_empty());

        let gid = cpt.global_id().unwrap();
        assert!(media
            .join("main")
            .join(&gid)
            .join("icons/64x64/foo_foo.png")
            .is_file());
    }

    #[test]
    fn disallowed_suffix_is_rejected_without_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let deb = dir.path().join("foo.deb");
        write_deb(&deb, &[PayloadEntry::File("usr/bin/foo", b"x")]);
        let media = dir.path().join("media");

        let mut cpt = test_component("foo.ico");
        let mut reader = DebReader::new(&deb);
        assert!(!handler().fetch_icon(&mut cpt, &mut reader, &media, "main"));
        assert!(cpt
            .hints
            .iter()
            .any(|h: &Hint| h.tag == "icon-format-unsupported"));
    }

    #[test]
    fn disallowed_pixmap_stops_the_global_search() {
        let dir = tempfile::tempdir().unwrap();
        let deb = dir.path().join("foo.deb");
        write_deb(
            &deb,
            &[PayloadEntry::File("usr/share/pixmaps/foo.xpm", b"xpm-data")],
        );
        let media = dir.path().join("media");

        let mut cpt = test_component("foo");
        let mut reader = DebReader::new(&deb);
        assert!(!handler().fetch_icon(&mut cpt, &mut reader, &media, "main"));
        assert!(cpt
            .hints
            .iter()
            .any(|h: &Hint| h.tag == "icon-format-unsupported"));
    }

    #[test]
    fn missing_icons_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let deb = dir.path().join("foo.deb");
        write_deb(&deb, &[PayloadEntry::File("usr/bin/foo", b"x")]);
        let media = dir.path().join("media");

        let mut cpt = test_component("foo");
        let mut reader = DebReader::new(&deb);
        assert!(!handler().fetch_icon(&mut cpt, &mut reader, &media, "main"));
        assert!(cpt.hints.iter().any(|h: &Hint| h.tag == "icon-not-found"));
    }

    #[test]
    fn icon_writes_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let icons_dir = dir.path().join("icons");
        store_icon(&icons_dir, IconSize(64), "foo.png", b"first").unwrap();
        store_icon(&icons_dir, IconSize(64), "foo.png", b"second").unwrap();
        let content = std::fs::read(icons_dir.join("64x64/foo.png")).unwrap();
        assert_eq!(content, b"first");
    }

    #[test]
    fn dotted_icon_names_keep_their_dots() {
        assert_eq!(
            split_extension("org.gnome.Maps"),
            ("org.gnome.Maps".to_string(), None)
        );
        assert_eq!(
            split_extension("foo.png"),
            ("foo".to_string(), Some("png".to_string()))
        );
        assert_eq!(split_extension("foo"), ("foo".to_string(), None));
    }
}
