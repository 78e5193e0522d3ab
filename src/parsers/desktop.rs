//! XDG desktop-entry reader.
//!
//! Only the `[Desktop Entry]` group matters. Entries that are not
//! applications, and entries marked `NoDisplay` without a paired metainfo
//! document, are invisible: they vanish without producing a hint.

use configparser::ini::Ini;

use super::ParseError;
use crate::model::{Component, ComponentKind, ProvidedItemKind};

/// Outcome of reading a desktop entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesktopStatus {
    /// Data was merged into the component.
    Ok,
    /// The entry is intentionally not user-visible; drop the component
    /// silently, without a hint.
    Invisible,
}

/// Splits `Name[de]` into the bare key and its locale, stripping a
/// trailing `.UTF-8` encoding marker.
fn split_locale_key(key: &str) -> (&str, Option<&str>) {
    if let Some(open) = key.find('[') {
        if let Some(rest) = key[open + 1..].strip_suffix(']') {
            let locale = rest.strip_suffix(".UTF-8").unwrap_or(rest);
            return (&key[..open], Some(locale));
        }
    }
    (key, None)
}

fn split_list(value: &str, separators: &[char]) -> Vec<String> {
    let mut items: Vec<String> = value
        .split(|c| separators.contains(&c))
        .map(str::to_string)
        .collect();
    // a trailing separator leaves one empty element behind
    if items.last().is_some_and(|s| s.is_empty()) {
        items.pop();
    }
    items
}

/// Reads a desktop entry into the component.
///
/// With `ignore_nodisplay` set (a paired metainfo document exists),
/// `NoDisplay=true` is disregarded; otherwise it makes the entry
/// invisible. Files whose `Type` is not `Application` are always
/// invisible.
pub fn read_desktop_data(
    cpt: &mut Component,
    content: &str,
    ignore_nodisplay: bool,
) -> Result<DesktopStatus, ParseError> {
    let mut ini = Ini::new_cs();
    ini.read(content.to_string())
        .map_err(ParseError::DesktopEntry)?;

    let map = ini.get_map_ref();
    let Some(entries) = map.get("Desktop Entry") else {
        return Err(ParseError::DesktopEntry(
            "no [Desktop Entry] group".to_string(),
        ));
    };

    let entry_type = entries.get("Type").cloned().flatten().unwrap_or_default();
    if entry_type != "Application" {
        return Ok(DesktopStatus::Invisible);
    }
    if !ignore_nodisplay {
        if let Some(Some(nodisplay)) = entries.get("NoDisplay") {
            if nodisplay.eq_ignore_ascii_case("true") {
                return Ok(DesktopStatus::Invisible);
            }
        }
    }

    cpt.kind = Some(ComponentKind::DesktopApp);

    // sort keys so locale maps come out in a stable order
    let mut keys: Vec<&String> = entries.keys().collect();
    keys.sort();

    let mut generic_names: Vec<(String, String)> = Vec::new();
    for key in keys {
        let Some(Some(value)) = entries.get(key) else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let (bare, locale) = split_locale_key(key);
        let locale = locale.unwrap_or("C").to_string();
        match bare {
            "Name" => {
                cpt.name.insert(locale, value.to_string());
            }
            "GenericName" => {
                generic_names.push((locale, value.to_string()));
            }
            "Comment" => {
                cpt.summary.insert(locale, value.to_string());
            }
            "Icon" => {
                cpt.icon_name = Some(value.to_string());
            }
            "Categories" => {
                cpt.categories = split_list(value, &[';']);
            }
            "Keywords" => {
                let words = split_list(value, &[';', ',']);
                if !words.is_empty() {
                    cpt.keywords.insert(locale, words);
                }
            }
            "MimeType" => {
                for mime in split_list(value, &[';']) {
                    cpt.add_provided_item(ProvidedItemKind::Mimetype, mime);
                }
            }
            _ => {}
        }
    }

    // GenericName is only a fallback for entries that carry no Name at all
    if cpt.name.is_empty() {
        for (locale, value) in generic_names {
            cpt.name.insert(locale, value);
        }
    }

    Ok(DesktopStatus::Ok)
}
