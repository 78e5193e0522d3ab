//! Binary package reader.
//!
//! A `.deb` file is an `ar` archive carrying `control.tar.*` and
//! `data.tar.*` members. The reader exposes the payload file list and
//! single-file extraction, following one level of intra-package symlinks.
//! Every operation re-opens the package so enumeration is restartable and
//! no file descriptors are held between calls.

use std::fs::File;
use std::io::Read;
use std::path::{Component as PathComponent, Path, PathBuf};

use super::ReadError;

/// What a payload entry is, as far as the reader cares.
enum EntryKind {
    File,
    Symlink(String),
    Other,
}

/// Reader for one binary package on disk.
pub struct DebReader {
    path: PathBuf,
    file_list: Option<Vec<String>>,
}

impl DebReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DebReader {
            path: path.into(),
            file_list: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lists all payload entry names, normalized without a leading `./`.
    /// The result is cached for subsequent calls.
    pub fn file_list(&mut self) -> Result<&[String], ReadError> {
        if self.file_list.is_none() {
            let mut files = Vec::new();
            self.walk_payload(&mut |path, _kind, _reader| {
                files.push(path.to_string());
                Ok(true)
            })?;
            self.file_list = Some(files);
        }
        Ok(self.file_list.as_deref().unwrap_or_default())
    }

    /// Extracts the contents of one payload entry.
    ///
    /// If the entry is a symlink the target is resolved (absolute targets
    /// lose their leading slash, relative targets are normalized against
    /// the requesting path) and read in a second pass. Explicitly empty
    /// files yield an empty buffer.
    pub fn read_file(&mut self, name: &str) -> Result<Vec<u8>, ReadError> {
        let wanted = name.trim_start_matches('/').to_string();

        let mut data: Option<Vec<u8>> = None;
        let mut symlink_target: Option<String> = None;
        self.walk_payload(&mut |path, kind, reader| {
            if path != wanted {
                return Ok(true);
            }
            match kind {
                EntryKind::Symlink(target) => {
                    symlink_target = Some(resolve_link_target(&wanted, target));
                }
                EntryKind::File => {
                    let mut buf = Vec::new();
                    reader
                        .read_to_end(&mut buf)
                        .map_err(|e| ReadError::corrupt(path, e))?;
                    data = Some(buf);
                }
                EntryKind::Other => {}
            }
            Ok(false)
        })?;

        if data.is_none() {
            if let Some(target) = symlink_target {
                self.walk_payload(&mut |path, kind, reader| {
                    if path != target {
                        return Ok(true);
                    }
                    if let EntryKind::File = kind {
                        let mut buf = Vec::new();
                        reader
                            .read_to_end(&mut buf)
                            .map_err(|e| ReadError::corrupt(path, e))?;
                        data = Some(buf);
                    }
                    Ok(false)
                })?;
            }
        }

        data.ok_or_else(|| ReadError::NotFound(wanted))
    }

    /// Walks payload entries, calling `visit` with the normalized path, the
    /// entry kind and a reader over the entry contents. The callback returns
    /// `false` to stop the walk early.
    fn walk_payload(
        &self,
        visit: &mut dyn FnMut(&str, &EntryKind, &mut dyn Read) -> Result<bool, ReadError>,
    ) -> Result<(), ReadError> {
        let display = self.path.display().to_string();
        let file = File::open(&self.path)?;
        let mut archive = ar::Archive::new(file);

        while let Some(entry) = archive.next_entry() {
            let entry = entry.map_err(|e| ReadError::corrupt(&display, e))?;
            let member = String::from_utf8_lossy(entry.header().identifier()).to_string();
            if !member.starts_with("data.tar") {
                continue;
            }
            let reader = decompressor(&member, Box::new(entry))
                .map_err(|e| ReadError::corrupt(&display, e))?;
            let mut tar = tar::Archive::new(reader);
            for payload_entry in tar.entries().map_err(|e| ReadError::corrupt(&display, e))? {
                let mut payload_entry =
                    payload_entry.map_err(|e| ReadError::corrupt(&display, e))?;
                let path = payload_entry
                    .path()
                    .map_err(|e| ReadError::corrupt(&display, e))?
                    .to_string_lossy()
                    .to_string();
                let path = normalize_entry_name(&path);
                if path.is_empty() {
                    continue;
                }
                let entry_type = payload_entry.header().entry_type();
                let kind = if entry_type.is_symlink() {
                    match payload_entry
                        .link_name()
                        .map_err(|e| ReadError::corrupt(&path, e))?
                    {
                        Some(link) => EntryKind::Symlink(link.to_string_lossy().to_string()),
                        None => EntryKind::Other,
                    }
                } else if entry_type.is_file() {
                    EntryKind::File
                } else {
                    EntryKind::Other
                };
                if !visit(&path, &kind, &mut payload_entry)? {
                    return Ok(());
                }
            }
            return Ok(());
        }

        Err(ReadError::corrupt(display, "no data.tar member found"))
    }
}

/// Picks a decompressor from the `data.tar.<ext>` member name.
fn decompressor<'a>(
    member: &str,
    reader: Box<dyn Read + 'a>,
) -> std::io::Result<Box<dyn Read + 'a>> {
    Ok(match member.rsplit_once('.').map(|(_, ext)| ext) {
        Some("gz") => Box::new(flate2::read::GzDecoder::new(reader)),
        Some("xz") => Box::new(xz2::read::XzDecoder::new(reader)),
        Some("bz2") => Box::new(bzip2::read::BzDecoder::new(reader)),
        Some("zst") => Box::new(zstd::stream::read::Decoder::new(reader)?),
        _ => reader,
    })
}

fn normalize_entry_name(path: &str) -> String {
    path.trim_start_matches("./")
        .trim_start_matches('/')
        .to_string()
}

/// Applies the symlink policy: absolute targets are archive-relative,
/// relative targets resolve against the requesting entry's directory.
fn resolve_link_target(requesting: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }
    let base = Path::new(requesting).parent().unwrap_or(Path::new(""));
    lexical_normalize(&base.join(target))
}

/// Resolves `.` and `..` components without touching the filesystem.
fn lexical_normalize(path: &Path) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.components() {
        match component {
            PathComponent::CurDir => {}
            PathComponent::ParentDir => {
                parts.pop();
            }
            PathComponent::Normal(p) => parts.push(p.to_str().unwrap_or_default()),
            PathComponent::RootDir | PathComponent::Prefix(_) => parts.clear(),
        }
    }
    parts.join("/")
}
