//! Screenshot download and thumbnail generation.
//!
//! Source images are fetched over HTTPS with a strict timeout, decoded to
//! learn their real dimensions (upstream-declared sizes are discarded) and
//! written to the media pool as PNG, together with a fixed set of
//! thumbnails. Download failures skip the affected screenshot only.

use std::io::Cursor;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::hints::Hint;
use crate::model::{Component, ImageRef, Screenshot};

/// Thumbnail geometries generated for every screenshot.
pub const THUMBNAIL_SIZES: [(u32, u32); 4] = [(1248, 702), (752, 423), (624, 351), (112, 63)];

/// Dimensions above this are rejected before resampling.
const MAX_IMAGE_AXIS: u32 = 16384;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra CA certificates used by Debian-style service setups that do not
/// trust the global roots by default.
const EXTRA_CA_DIR: &str = "/etc/ssl/ca-global";

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("could not construct http client: {0}")]
    Client(reqwest::Error),
    #[error("request failed: {0}")]
    Request(reqwest::Error),
    #[error("http status {0}")]
    Status(u16),
}

/// Downloads and scales screenshots into the media pool.
pub struct ScreenshotHandler {
    client: reqwest::blocking::Client,
}

impl ScreenshotHandler {
    pub fn new() -> Result<Self, NetworkError> {
        let mut builder = reqwest::blocking::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .use_rustls_tls();

        let ca_dir = Path::new(EXTRA_CA_DIR);
        if ca_dir.is_dir() {
            if let Ok(entries) = std::fs::read_dir(ca_dir) {
                for entry in entries.flatten() {
                    match std::fs::read(entry.path())
                        .ok()
                        .and_then(|pem| reqwest::Certificate::from_pem(&pem).ok())
                    {
                        Some(cert) => builder = builder.add_root_certificate(cert),
                        None => {
                            debug!(path = %entry.path().display(), "skipping unreadable CA file")
                        }
                    }
                }
            }
        }

        Ok(ScreenshotHandler {
            client: builder.build().map_err(NetworkError::Client)?,
        })
    }

    fn download(&self, url: &str) -> Result<Vec<u8>, NetworkError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(NetworkError::Request)?;
        if response.status().as_u16() != 200 {
            return Err(NetworkError::Status(response.status().as_u16()));
        }
        let bytes = response.bytes().map_err(NetworkError::Request)?;
        Ok(bytes.to_vec())
    }

    /// Fetches all screenshots of a component into
    /// `<media_root>/<archive_component>/<gid>/screenshots/` and rewrites
    /// their URLs to pool-relative paths.
    ///
    /// Returns false when at least one screenshot failed; the remaining
    /// ones are still processed.
    pub fn fetch_screenshots(
        &self,
        cpt: &mut Component,
        media_root: &Path,
        archive_component: &str,
    ) -> bool {
        if cpt.screenshots.is_empty() {
            return true;
        }
        let Some(gid) = cpt.global_id() else {
            warn!(cid = ?cpt.cid, "component without global id, skipping screenshots");
            return false;
        };
        let cid = cpt.cid.clone().unwrap_or_default();

        let export_dir = media_root
            .join(archive_component)
            .join(&gid)
            .join("screenshots");
        let url_base = format!("{archive_component}/{gid}/screenshots");

        let mut success = true;
        let mut kept: Vec<Screenshot> = Vec::new();
        let mut count = 1usize;
        let shots = std::mem::take(&mut cpt.screenshots);
        for mut shot in shots {
            let origin_url = shot.source_image.url.clone();
            if origin_url.is_empty() {
                continue;
            }

            let data = match self.download(&origin_url) {
                Ok(data) => data,
                Err(e) => {
                    let err = e.to_string();
                    cpt.add_hint(Hint::new(
                        "screenshot-download-error",
                        [
                            ("url", origin_url.as_str()),
                            ("cpt_id", cid.as_str()),
                            ("error", err.as_str()),
                        ],
                    ));
                    success = false;
                    continue;
                }
            };

            match process_screenshot(&mut shot, &data, &export_dir, &url_base, count) {
                Ok(()) => {
                    kept.push(shot);
                    count += 1;
                }
                Err(ScreenshotError::Decode(msg)) => {
                    cpt.add_hint(Hint::new(
                        "screenshot-read-error",
                        [
                            ("url", origin_url.as_str()),
                            ("cpt_id", cid.as_str()),
                            ("error", msg.as_str()),
                        ],
                    ));
                    success = false;
                }
                Err(ScreenshotError::Io(e)) => {
                    let err = e.to_string();
                    cpt.add_hint(Hint::new(
                        "screenshot-save-error",
                        [
                            ("url", origin_url.as_str()),
                            ("cpt_id", cid.as_str()),
                            ("error", err.as_str()),
                        ],
                    ));
                    success = false;
                }
            }
        }

        cpt.screenshots = kept;
        success
    }
}

#[derive(Debug)]
enum ScreenshotError {
    Decode(String),
    Io(std::io::Error),
}

impl From<std::io::Error> for ScreenshotError {
    fn from(e: std::io::Error) -> Self {
        ScreenshotError::Io(e)
    }
}

/// Decodes one downloaded image, writes the PNG source and all thumbnails
/// and rewrites the screenshot record to pool-relative URLs with
/// authoritative dimensions.
fn process_screenshot(
    shot: &mut Screenshot,
    data: &[u8],
    export_dir: &Path,
    url_base: &str,
    number: usize,
) -> Result<(), ScreenshotError> {
    let img = image::load_from_memory(data).map_err(|e| ScreenshotError::Decode(e.to_string()))?;
    if img.width() > MAX_IMAGE_AXIS || img.height() > MAX_IMAGE_AXIS {
        return Err(ScreenshotError::Decode(format!(
            "image dimensions {}x{} exceed the sanity limit",
            img.width(),
            img.height()
        )));
    }

    let name = format!("scr-{number}.png");

    let source_dir = export_dir.join("source");
    std::fs::create_dir_all(&source_dir)?;
    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|e| ScreenshotError::Decode(e.to_string()))?;
    std::fs::write(source_dir.join(&name), &png)?;

    shot.source_image = ImageRef {
        url: format!("{url_base}/source/{name}"),
        width: Some(img.width()),
        height: Some(img.height()),
    };

    shot.thumbnails.clear();
    for (width, height) in THUMBNAIL_SIZES {
        let thumb = img.resize_exact(width, height, image::imageops::FilterType::Lanczos3);
        let size_dir = export_dir.join(format!("{width}x{height}"));
        std::fs::create_dir_all(&size_dir)?;
        let mut buf = Vec::new();
        thumb
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .map_err(|e| ScreenshotError::Decode(e.to_string()))?;
        std::fs::write(size_dir.join(&name), &buf)?;
        shot.thumbnails.push(ImageRef {
            url: format!("{url_base}/{width}x{height}/{name}"),
            width: Some(width),
            height: Some(height),
        });
    }

    Ok(())
}
