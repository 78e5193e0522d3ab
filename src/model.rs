//! Core data model: package descriptors and software components.
//!
//! A [`Package`] is an immutable snapshot of one binary package taken from
//! the archive index. A [`Component`] is the unit of output: one software
//! application's metadata, assembled by the extractor and serialized as a
//! DEP-11 YAML document. Components never point back at live package
//! state; they carry a cheap copy of the descriptor instead.

use indexmap::IndexMap;
use md5::{Digest, Md5};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::hints::Hint;

/// Locale → text mapping. Ordered so output is stable for identical input.
pub type LocalizedText = IndexMap<String, String>;

/// Locale → word-list mapping (keywords).
pub type LocalizedList = IndexMap<String, Vec<String>>;

/// Snapshot of one binary package from the archive index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub arch: String,
    /// Payload location relative to the archive root.
    pub filename: String,
    pub maintainer: Option<String>,
    /// Localized short description; `C` holds the untranslated text as an
    /// HTML fragment.
    pub description: LocalizedText,
}

impl Package {
    pub fn pkid(&self) -> String {
        format!("{}/{}/{}", self.name, self.version, self.arch)
    }

    pub fn has_description(&self) -> bool {
        !self.description.is_empty()
    }
}

/// A square icon size. Parses from and displays as the `WxH` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IconSize(pub u32);

impl IconSize {
    pub fn pixels(self) -> u32 {
        self.0
    }
}

impl fmt::Display for IconSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.0, self.0)
    }
}

impl FromStr for IconSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('x') {
            Some((w, h)) => {
                let w: u32 = w.parse().map_err(|_| format!("invalid icon size '{s}'"))?;
                let h: u32 = h.parse().map_err(|_| format!("invalid icon size '{s}'"))?;
                if w != h {
                    tracing::warn!(size = %s, "processing asymmetric icon size, using width");
                }
                Ok(IconSize(w))
            }
            None => s
                .parse()
                .map(IconSize)
                .map_err(|_| format!("invalid icon size '{s}'")),
        }
    }
}

/// Kind of software component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComponentKind {
    #[default]
    Generic,
    DesktopApp,
    Font,
    Codec,
    InputMethod,
    Addon,
    Firmware,
}

impl ComponentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentKind::Generic => "generic",
            ComponentKind::DesktopApp => "desktop-app",
            ComponentKind::Font => "font",
            ComponentKind::Codec => "codec",
            ComponentKind::InputMethod => "inputmethod",
            ComponentKind::Addon => "addon",
            ComponentKind::Firmware => "firmware",
        }
    }

    /// Maps the upstream XML `type` attribute. `desktop` is the legacy
    /// spelling of `desktop-app`; unknown values fall back to generic.
    pub fn from_metainfo(value: &str) -> Self {
        match value {
            "desktop" | "desktop-app" | "desktop-application" => ComponentKind::DesktopApp,
            "font" => ComponentKind::Font,
            "codec" => ComponentKind::Codec,
            "inputmethod" => ComponentKind::InputMethod,
            "addon" => ComponentKind::Addon,
            "firmware" => ComponentKind::Firmware,
            "generic" => ComponentKind::Generic,
            other => {
                tracing::debug!(kind = other, "unknown component type, treating as generic");
                ComponentKind::Generic
            }
        }
    }
}

/// Kinds of publicly provided interfaces, used as keys of `Provides`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvidedItemKind {
    Binary,
    Library,
    Mimetype,
    Font,
    Modalias,
    Python2,
    Python3,
    Dbus,
    Firmware,
}

impl ProvidedItemKind {
    pub fn yaml_key(self) -> &'static str {
        match self {
            ProvidedItemKind::Binary => "binaries",
            ProvidedItemKind::Library => "libraries",
            ProvidedItemKind::Mimetype => "mimetypes",
            ProvidedItemKind::Font => "fonts",
            ProvidedItemKind::Modalias => "modaliases",
            ProvidedItemKind::Python2 => "python2",
            ProvidedItemKind::Python3 => "python3",
            ProvidedItemKind::Dbus => "dbus",
            ProvidedItemKind::Firmware => "firmware",
        }
    }

    /// Maps a `<provides>` child element name.
    pub fn from_element(name: &str) -> Option<Self> {
        match name {
            "binary" => Some(ProvidedItemKind::Binary),
            "library" => Some(ProvidedItemKind::Library),
            "mimetype" => Some(ProvidedItemKind::Mimetype),
            "font" => Some(ProvidedItemKind::Font),
            "modalias" => Some(ProvidedItemKind::Modalias),
            "python2" => Some(ProvidedItemKind::Python2),
            "python3" => Some(ProvidedItemKind::Python3),
            "dbus" => Some(ProvidedItemKind::Dbus),
            "firmware" => Some(ProvidedItemKind::Firmware),
            _ => None,
        }
    }
}

/// Image reference with dimensions, as stored in the media pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImageRef {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// One screenshot: a source image plus generated thumbnails.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Screenshot {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub default: bool,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub caption: LocalizedText,
    #[serde(rename = "source-image")]
    pub source_image: ImageRef,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub thumbnails: Vec<ImageRef>,
}

/// One upstream release record.
#[derive(Debug, Clone, Serialize)]
pub struct Release {
    pub version: String,
    #[serde(rename = "unix-timestamp", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Translation coverage for one locale.
#[derive(Debug, Clone)]
pub struct Language {
    pub locale: String,
    pub percentage: Option<u8>,
}

/// Icon references by kind.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Icons {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stock: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
}

impl Icons {
    pub fn is_empty(&self) -> bool {
        self.cached.is_none() && self.stock.is_none() && self.remote.is_none()
    }
}

/// The unit of output: one application's metadata.
#[derive(Debug, Clone, Default)]
pub struct Component {
    pub cid: Option<String>,
    pub kind: Option<ComponentKind>,
    pub name: LocalizedText,
    pub summary: LocalizedText,
    pub description: LocalizedText,
    pub developer_name: LocalizedText,
    pub keywords: LocalizedList,
    pub categories: Vec<String>,
    pub archs: Vec<String>,
    pub icons: Icons,
    /// Icon name as referenced by the desktop file, before resolution.
    pub icon_name: Option<String>,
    pub screenshots: Vec<Screenshot>,
    pub urls: IndexMap<String, String>,
    pub project_license: Option<String>,
    pub project_group: Option<String>,
    pub provides: IndexMap<ProvidedItemKind, Vec<String>>,
    pub extends: Vec<String>,
    pub compulsory_for_desktops: Vec<String>,
    pub releases: Vec<Release>,
    pub languages: Vec<Language>,
    pub package: Option<Package>,
    pub srcdata_checksum: Option<String>,
    pub hints: Vec<Hint>,
}

impl Component {
    pub fn new(package: Package) -> Self {
        Component {
            package: Some(package),
            ..Component::default()
        }
    }

    pub fn add_hint(&mut self, hint: Hint) {
        self.hints.push(hint);
    }

    /// A component is ignored when any of its hints is an error. The flag is
    /// computed, never stored.
    pub fn is_ignored(&self) -> bool {
        self.hints.iter().any(Hint::is_error)
    }

    pub fn add_provided_item(&mut self, kind: ProvidedItemKind, value: String) {
        self.provides.entry(kind).or_default().push(value);
    }

    /// Computes the source-data checksum over the raw metainfo bytes plus
    /// the originating package version. Whitespace-only changes in the
    /// source therefore produce a different identity.
    pub fn set_srcdata_checksum(&mut self, parts: &[&str]) {
        let mut hasher = Md5::new();
        for part in parts {
            hasher.update(part.as_bytes());
        }
        if let Some(pkg) = &self.package {
            hasher.update(pkg.version.as_bytes());
        }
        self.srcdata_checksum = Some(hex::encode(hasher.finalize()));
    }

    /// Content-addressed identity: a deterministic function of the component
    /// id and the source-data checksum. `None` until both are known.
    pub fn global_id(&self) -> Option<String> {
        let cid = self.cid.as_deref()?;
        let checksum = self.srcdata_checksum.as_deref()?;
        build_global_id(cid, checksum)
    }

    pub fn pkid(&self) -> Option<String> {
        self.package.as_ref().map(Package::pkid)
    }

    /// Runs the data-model invariants: cleans locale maps and reports every
    /// missing mandatory field. Safe to call more than once.
    pub fn finalize(&mut self) {
        cleanup_localized(&mut self.name);
        cleanup_localized(&mut self.summary);
        cleanup_localized(&mut self.description);
        cleanup_localized(&mut self.developer_name);
        cleanup_localized_list(&mut self.keywords);
        for shot in &mut self.screenshots {
            cleanup_localized(&mut shot.caption);
        }

        if !self.is_ignored() {
            if self.cid.as_deref().unwrap_or("").is_empty() {
                self.add_hint(Hint::tag_only("metainfo-no-id"));
            }
            if self.kind.is_none() {
                self.add_hint(Hint::tag_only("metainfo-no-type"));
            }
            if self.name.is_empty() {
                self.add_hint(Hint::tag_only("metainfo-no-name"));
            }
            if self.package.is_none() {
                self.add_hint(Hint::tag_only("metainfo-no-package"));
            }
            if self.summary.is_empty() {
                self.add_hint(Hint::tag_only("metainfo-no-summary"));
            }
        }

        let mut missing_template = Vec::new();
        for (field, map) in [
            ("Name", &self.name),
            ("Summary", &self.summary),
            ("Description", &self.description),
            ("DeveloperName", &self.developer_name),
        ] {
            if !map.is_empty() && !map.contains_key("C") {
                missing_template.push(field);
            }
        }
        for field in missing_template {
            self.add_hint(Hint::new(
                "metainfo-localized-field-without-template",
                [("field", field)],
            ));
        }
    }

    /// The serializable catalog view. `None` for ignored components, which
    /// only appear in the hints stream.
    pub fn catalog_view(&self) -> Option<CatalogView<'_>> {
        if self.is_ignored() {
            return None;
        }
        let provides: IndexMap<&'static str, &Vec<String>> = self
            .provides
            .iter()
            .map(|(kind, items)| (kind.yaml_key(), items))
            .collect();
        Some(CatalogView {
            package: self.package.as_ref().map(|p| p.name.as_str()),
            id: self.cid.as_deref(),
            kind: self.kind.map(ComponentKind::as_str),
            name: &self.name,
            summary: &self.summary,
            description: &self.description,
            categories: &self.categories,
            keywords: &self.keywords,
            screenshots: &self.screenshots,
            archs: &self.archs,
            icon: if self.icons.is_empty() {
                None
            } else {
                Some(&self.icons)
            },
            url: &self.urls,
            provides,
            project_license: self.project_license.as_deref(),
            project_group: self.project_group.as_deref(),
            developer_name: &self.developer_name,
            extends: &self.extends,
            compulsory_for_desktops: &self.compulsory_for_desktops,
            releases: &self.releases,
        })
    }

    /// Serializes the component to one explicit-start YAML document.
    pub fn to_yaml_doc(&self) -> Result<Option<String>, serde_yaml::Error> {
        match self.catalog_view() {
            Some(view) => {
                let body = serde_yaml::to_string(&view)?;
                Ok(Some(format!("---\n{body}")))
            }
            None => Ok(None),
        }
    }

    /// Hint document for the per-package diagnostics stream.
    pub fn hints_view(&self) -> Option<HintsView<'_>> {
        if self.hints.is_empty() {
            return None;
        }
        Some(HintsView {
            package: self.package.as_ref().map(|p| p.name.as_str()),
            package_id: self.pkid(),
            id: self.cid.as_deref(),
            kind: self.kind.map(ComponentKind::as_str),
            ignored: if self.is_ignored() { Some(true) } else { None },
            hints: &self.hints,
        })
    }

    pub fn hints_yaml_doc(&self) -> Result<Option<String>, serde_yaml::Error> {
        match self.hints_view() {
            Some(view) => {
                let body = serde_yaml::to_string(&view)?;
                Ok(Some(format!("---\n{body}")))
            }
            None => Ok(None),
        }
    }
}

/// Catalog serialization of a non-ignored component, in DEP-11 key order.
#[derive(Debug, Serialize)]
pub struct CatalogView<'a> {
    #[serde(rename = "Package", skip_serializing_if = "Option::is_none")]
    package: Option<&'a str>,
    #[serde(rename = "ID", skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(rename = "Type", skip_serializing_if = "Option::is_none")]
    kind: Option<&'a str>,
    #[serde(rename = "Name", skip_serializing_if = "IndexMap::is_empty")]
    name: &'a LocalizedText,
    #[serde(rename = "Summary", skip_serializing_if = "IndexMap::is_empty")]
    summary: &'a LocalizedText,
    #[serde(rename = "Description", skip_serializing_if = "IndexMap::is_empty")]
    description: &'a LocalizedText,
    #[serde(rename = "Categories", skip_serializing_if = "Vec::is_empty")]
    categories: &'a Vec<String>,
    #[serde(rename = "Keywords", skip_serializing_if = "IndexMap::is_empty")]
    keywords: &'a LocalizedList,
    #[serde(rename = "Screenshots", skip_serializing_if = "Vec::is_empty")]
    screenshots: &'a Vec<Screenshot>,
    #[serde(rename = "Architectures", skip_serializing_if = "Vec::is_empty")]
    archs: &'a Vec<String>,
    #[serde(rename = "Icon", skip_serializing_if = "Option::is_none")]
    icon: Option<&'a Icons>,
    #[serde(rename = "Url", skip_serializing_if = "IndexMap::is_empty")]
    url: &'a IndexMap<String, String>,
    #[serde(rename = "Provides", skip_serializing_if = "IndexMap::is_empty")]
    provides: IndexMap<&'static str, &'a Vec<String>>,
    #[serde(rename = "ProjectLicense", skip_serializing_if = "Option::is_none")]
    project_license: Option<&'a str>,
    #[serde(rename = "ProjectGroup", skip_serializing_if = "Option::is_none")]
    project_group: Option<&'a str>,
    #[serde(rename = "DeveloperName", skip_serializing_if = "IndexMap::is_empty")]
    developer_name: &'a LocalizedText,
    #[serde(rename = "Extends", skip_serializing_if = "Vec::is_empty")]
    extends: &'a Vec<String>,
    #[serde(
        rename = "CompulsoryForDesktops",
        skip_serializing_if = "Vec::is_empty"
    )]
    compulsory_for_desktops: &'a Vec<String>,
    #[serde(rename = "Releases", skip_serializing_if = "Vec::is_empty")]
    releases: &'a Vec<Release>,
}

/// Hints serialization for the diagnostics stream.
#[derive(Debug, Serialize)]
pub struct HintsView<'a> {
    #[serde(rename = "Package", skip_serializing_if = "Option::is_none")]
    package: Option<&'a str>,
    #[serde(rename = "PackageID", skip_serializing_if = "Option::is_none")]
    package_id: Option<String>,
    #[serde(rename = "ID", skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(rename = "Type", skip_serializing_if = "Option::is_none")]
    kind: Option<&'a str>,
    #[serde(rename = "Ignored", skip_serializing_if = "Option::is_none")]
    ignored: Option<bool>,
    #[serde(rename = "Hints")]
    hints: &'a Vec<Hint>,
}

const REVERSE_DNS_TLDS: &[&str] = &["org", "net", "com", "io", "edu", "name"];

/// Builds the content-addressed global id from a component id and the
/// source-data checksum.
///
/// Reverse-DNS ids split into `tld/vendor/rest/<checksum>`; everything else
/// uses the two-character prefix form `f/fo/foo.desktop/<checksum>`. The
/// prefix match is case-sensitive: only a lowercase TLD label counts as
/// reverse-DNS.
pub fn build_global_id(cid: &str, checksum: &str) -> Option<String> {
    if cid.is_empty() || checksum.is_empty() {
        return None;
    }

    let mut parts = cid.splitn(3, '.');
    if let (Some(tld), Some(vendor), Some(rest)) = (parts.next(), parts.next(), parts.next()) {
        if REVERSE_DNS_TLDS.contains(&tld) && !rest.is_empty() {
            return Some(format!("{tld}/{vendor}/{rest}/{checksum}"));
        }
    }

    let first: String = cid.chars().take(1).collect::<String>().to_lowercase();
    let prefix: String = cid.chars().take(2).collect::<String>().to_lowercase();
    Some(format!("{first}/{prefix}/{cid}/{checksum}"))
}

fn is_quoted(s: &str) -> bool {
    (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
}

fn unquote(s: &str) -> &str {
    if is_quoted(s) {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// Removes cruft locales, duplicate translations and encoding suffixes from
/// a localized text map.
pub fn cleanup_localized(map: &mut LocalizedText) {
    map.shift_remove("x-test");
    map.shift_remove("xx");

    let template = map.get("C").cloned();
    let mut cleaned: LocalizedText = IndexMap::with_capacity(map.len());
    for (locale, value) in map.drain(..) {
        let locale = locale.strip_suffix(".UTF-8").unwrap_or(&locale).to_string();
        let value = unquote(&value).to_string();
        if locale != "C" {
            if let Some(template) = &template {
                if value == *template {
                    continue;
                }
            }
        }
        cleaned.insert(locale, value);
    }
    *map = cleaned;
}

/// Keyword-list variant of [`cleanup_localized`].
pub fn cleanup_localized_list(map: &mut LocalizedList) {
    map.shift_remove("x-test");
    map.shift_remove("xx");

    let mut cleaned: LocalizedList = IndexMap::with_capacity(map.len());
    for (locale, value) in map.drain(..) {
        let locale = locale.strip_suffix(".UTF-8").unwrap_or(&locale).to_string();
        cleaned.insert(locale, value);
    }
    *map = cleaned;
}
