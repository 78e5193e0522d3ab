//! Metadata readers: AppStream upstream XML and XDG desktop entries.

pub mod desktop;
pub mod xml;

use thiserror::Error;

pub use desktop::{read_desktop_data, DesktopStatus};
pub use xml::read_appstream_upstream_xml;

/// Malformed metadata input.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("malformed XML: {0}")]
    Xml(String),
    #[error("malformed desktop entry: {0}")]
    DesktopEntry(String),
}
