//! Diagnostic hints attached to components during extraction.
//!
//! Every pipeline stage can report issues against the component it is
//! working on. A hint carries a tag from a fixed catalog, a severity and a
//! set of string parameters. Any hint of [`Severity::Error`] marks the
//! component as ignored: it is withheld from the catalog but its hints are
//! still exported so archive maintainers can see why.

use indexmap::IndexMap;
use serde::Serialize;

/// Importance of a component hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One diagnostic reported against a component.
#[derive(Debug, Clone, Serialize)]
pub struct Hint {
    pub tag: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub params: IndexMap<String, String>,
}

impl Hint {
    /// Creates a hint for `tag`, looking its severity up in the catalog.
    /// Unknown tags are reported as `internal-unknown-tag` at error severity.
    pub fn new<I, K, V>(tag: &str, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut params: IndexMap<String, String> = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        match severity_for(tag) {
            Some(severity) => Hint {
                tag: tag.to_string(),
                severity,
                params,
            },
            None => {
                params.insert("tag".to_string(), tag.to_string());
                Hint {
                    tag: "internal-unknown-tag".to_string(),
                    severity: Severity::Error,
                    params,
                }
            }
        }
    }

    /// Creates a hint without parameters.
    pub fn tag_only(tag: &str) -> Self {
        Self::new(tag, std::iter::empty::<(String, String)>())
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// The compiled-in hint catalog: tag and severity. Human-readable tag
/// descriptions live in the external reporting tool.
///
/// Loaded once into the binary; there is no runtime tag registration.
const HINT_CATALOG: &[(&str, Severity)] = &[
    ("deb-filelist-error", Severity::Error),
    ("deb-extract-error", Severity::Error),
    ("deb-empty-file", Severity::Error),
    ("metainfo-parse-error", Severity::Error),
    ("desktop-file-error", Severity::Error),
    ("metainfo-no-id", Severity::Error),
    ("metainfo-no-type", Severity::Error),
    ("metainfo-no-name", Severity::Error),
    ("metainfo-no-package", Severity::Error),
    ("metainfo-no-summary", Severity::Error),
    ("metainfo-localized-field-without-template", Severity::Error),
    ("metainfo-duplicate-id", Severity::Error),
    ("missing-desktop-file", Severity::Error),
    ("icon-format-unsupported", Severity::Error),
    ("icon-not-found", Severity::Warning),
    ("gui-app-without-icon", Severity::Error),
    ("svgz-decompress-error", Severity::Error),
    ("screenshot-download-error", Severity::Warning),
    ("screenshot-read-error", Severity::Warning),
    ("screenshot-save-error", Severity::Warning),
    ("description-from-package", Severity::Info),
    ("extractor-timeout", Severity::Error),
    ("internal-error", Severity::Error),
    ("internal-unknown-tag", Severity::Error),
];

fn severity_for(tag: &str) -> Option<Severity> {
    HINT_CATALOG
        .iter()
        .find(|(t, _)| *t == tag)
        .map(|(_, severity)| *severity)
}
