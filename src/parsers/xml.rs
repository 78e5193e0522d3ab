//! AppStream upstream XML reader.
//!
//! Parses a metainfo document into an in-memory element tree, then walks
//! the tree filling [`Component`] fields. Descriptions are flattened to
//! per-locale HTML fragments; screenshots understand both the legacy
//! text-URL form and the caption/image form.

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use super::ParseError;
use crate::model::{Component, ComponentKind, ImageRef, ProvidedItemKind, Release, Screenshot};
use crate::model::Language;

/// Minimal element tree; enough structure for metainfo documents.
#[derive(Debug, Default)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    /// Direct text content, entities resolved.
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// `xml:lang` attribute, defaulting to the untranslated locale.
    fn locale(&self) -> &str {
        self.attr("xml:lang").unwrap_or("C")
    }

    fn text_trimmed(&self) -> &str {
        self.text.trim()
    }
}

fn parse_tree(content: &str) -> Result<Element, ParseError> {
    let mut reader = Reader::from_str(content);
    let mut stack: Vec<Element> = Vec::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| ParseError::Xml(e.to_string()))?;
        match event {
            Event::Start(start) => {
                let mut element = Element {
                    name: String::from_utf8_lossy(start.name().as_ref()).to_string(),
                    ..Element::default()
                };
                for attr in start.attributes() {
                    let attr = attr.map_err(|e| ParseError::Xml(e.to_string()))?;
                    let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                    let value = attr
                        .unescape_value()
                        .map_err(|e| ParseError::Xml(e.to_string()))?
                        .to_string();
                    element.attrs.push((key, value));
                }
                stack.push(element);
            }
            Event::Empty(start) => {
                let mut element = Element {
                    name: String::from_utf8_lossy(start.name().as_ref()).to_string(),
                    ..Element::default()
                };
                for attr in start.attributes() {
                    let attr = attr.map_err(|e| ParseError::Xml(e.to_string()))?;
                    let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                    let value = attr
                        .unescape_value()
                        .map_err(|e| ParseError::Xml(e.to_string()))?
                        .to_string();
                    element.attrs.push((key, value));
                }
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(element),
                }
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| ParseError::Xml("unbalanced end tag".to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(element),
                }
            }
            Event::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(
                        &text
                            .unescape()
                            .map_err(|e| ParseError::Xml(e.to_string()))?,
                    );
                }
            }
            Event::CData(data) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::Eof => {
                return Err(ParseError::Xml("no root element".to_string()));
            }
            // declarations, comments, processing instructions
            _ => {}
        }
    }
}

/// Collapses internal whitespace and XML-escapes the result.
fn prepare_desc_string(s: &str) -> String {
    let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
    escape(&collapsed).into_owned()
}

/// Renders a `<description>` element into per-locale HTML fragments.
///
/// Paragraph translations are combined per language so clients can pick one
/// complete fragment; list items land under their own locale wrapped in the
/// list's tag.
fn parse_description(element: &Element, target: &mut crate::model::LocalizedText) {
    for child in &element.children {
        match child.name.as_str() {
            "p" => {
                let locale = child.locale();
                let entry = target.entry(locale.to_string()).or_default();
                entry.push_str(&format!(
                    "<p>{}</p>",
                    prepare_desc_string(child.text_trimmed())
                ));
            }
            "ul" | "ol" => {
                let mut per_locale: crate::model::LocalizedText = Default::default();
                for item in &child.children {
                    if item.name != "li" {
                        continue;
                    }
                    let entry = per_locale.entry(item.locale().to_string()).or_default();
                    entry.push_str(&format!(
                        "<li>{}</li>",
                        prepare_desc_string(item.text_trimmed())
                    ));
                }
                for (locale, items) in per_locale {
                    let entry = target.entry(locale).or_default();
                    entry.push_str(&format!("<{0}>{1}</{0}>", child.name, items));
                }
            }
            _ => {}
        }
    }
}

fn parse_screenshots(element: &Element) -> Vec<Screenshot> {
    let mut shots = Vec::new();
    for child in &element.children {
        if child.name != "screenshot" {
            continue;
        }
        let mut shot = Screenshot {
            default: child.attr("type") == Some("default"),
            ..Screenshot::default()
        };

        // legacy form: the element text is the image URL
        let legacy_url = child.text_trimmed();
        if !legacy_url.is_empty() {
            shot.source_image = ImageRef {
                url: legacy_url.to_string(),
                width: None,
                height: None,
            };
            shots.push(shot);
            continue;
        }

        for sub in &child.children {
            match sub.name.as_str() {
                "caption" => {
                    shot.caption
                        .insert(sub.locale().to_string(), sub.text_trimmed().to_string());
                }
                "image" => {
                    shot.source_image = ImageRef {
                        url: sub.text_trimmed().to_string(),
                        width: sub.attr("width").and_then(|w| w.parse().ok()),
                        height: sub.attr("height").and_then(|h| h.parse().ok()),
                    };
                }
                _ => {}
            }
        }

        // screenshots without a source image are useless
        if !shot.source_image.url.is_empty() {
            shots.push(shot);
        }
    }
    shots
}

fn parse_releases(element: &Element) -> Vec<Release> {
    let mut releases = Vec::new();
    for child in &element.children {
        if child.name != "release" {
            continue;
        }
        let Some(version) = child.attr("version") else {
            continue;
        };
        let timestamp = child
            .attr("timestamp")
            .and_then(|t| t.parse::<i64>().ok())
            .or_else(|| {
                child.attr("date").and_then(|d| {
                    chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d")
                        .ok()
                        .and_then(|date| date.and_hms_opt(0, 0, 0))
                        .map(|dt| dt.and_utc().timestamp())
                })
            });
        let description = child
            .children
            .iter()
            .find(|c| c.name == "description")
            .map(|desc| {
                let mut map = crate::model::LocalizedText::default();
                parse_description(desc, &mut map);
                map.get("C").cloned().unwrap_or_default()
            })
            .filter(|d| !d.is_empty());
        releases.push(Release {
            version: version.to_string(),
            timestamp,
            description,
        });
    }
    releases
}

/// Reads an AppStream upstream metainfo document into the component.
pub fn read_appstream_upstream_xml(cpt: &mut Component, content: &str) -> Result<(), ParseError> {
    let root = parse_tree(content)?;

    if let Some(kind) = root.attr("type") {
        cpt.kind = Some(ComponentKind::from_metainfo(kind));
    }

    for child in &root.children {
        let locale = child.locale().to_string();
        let text = child.text_trimmed().to_string();
        match child.name.as_str() {
            "id" => {
                if !text.is_empty() {
                    cpt.cid = Some(text);
                }
                // legacy documents carry the type on the id element
                if cpt.kind.is_none() {
                    if let Some(kind) = child.attr("type") {
                        cpt.kind = Some(ComponentKind::from_metainfo(kind));
                    }
                }
            }
            "name" => {
                if !text.is_empty() {
                    cpt.name.insert(locale, text);
                }
            }
            "summary" => {
                if !text.is_empty() {
                    cpt.summary.insert(locale, text);
                }
            }
            "developer_name" => {
                if !text.is_empty() {
                    cpt.developer_name.insert(locale, text);
                }
            }
            "description" => {
                parse_description(child, &mut cpt.description);
            }
            "screenshots" => {
                cpt.screenshots = parse_screenshots(child);
            }
            "provides" => {
                for item in &child.children {
                    if let Some(kind) = ProvidedItemKind::from_element(&item.name) {
                        let value = item.text_trimmed();
                        if !value.is_empty() {
                            cpt.add_provided_item(kind, value.to_string());
                        }
                    }
                }
            }
            "url" => {
                if !text.is_empty() {
                    let url_kind = child.attr("type").unwrap_or("homepage").to_string();
                    cpt.urls.insert(url_kind, text);
                }
            }
            "project_license" => {
                if !text.is_empty() {
                    cpt.project_license = Some(text);
                }
            }
            "project_group" => {
                if !text.is_empty() {
                    cpt.project_group = Some(text);
                }
            }
            "extends" => {
                if !text.is_empty() {
                    cpt.extends.push(text);
                }
            }
            "compulsory_for_desktop" => {
                if !text.is_empty() {
                    cpt.compulsory_for_desktops.push(text);
                }
            }
            "releases" => {
                cpt.releases = parse_releases(child);
            }
            "languages" => {
                for lang in &child.children {
                    if lang.name == "lang" {
                        let locale = lang.text_trimmed();
                        if !locale.is_empty() {
                            cpt.languages.push(Language {
                                locale: locale.to_string(),
                                percentage: lang
                                    .attr("percentage")
                                    .and_then(|p| p.parse().ok()),
                            });
                        }
                    }
                }
            }
            "categories" => {
                for category in &child.children {
                    if category.name == "category" {
                        let value = category.text_trimmed();
                        if !value.is_empty() {
                            cpt.categories.push(value.to_string());
                        }
                    }
                }
            }
            "keywords" => {
                for keyword in &child.children {
                    if keyword.name == "keyword" {
                        let value = keyword.text_trimmed();
                        if !value.is_empty() {
                            cpt.keywords
                                .entry(keyword.locale().to_string())
                                .or_default()
                                .push(value.to_string());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Package;

    fn test_component() -> Component {
        Component::new(Package {
            name: "foo".to_string(),
            version: "1.0".to_string(),
            arch: "amd64".to_string(),
            filename: "pool/main/f/foo/foo_1.0_amd64.deb".to_string(),
            maintainer: None,
            description: Default::default(),
        })
    }

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<component type="desktop">
  <id>org.example.Foo</id>
  <name>Foo</name>
  <name xml:lang="de">Das Foo</name>
  <summary>Fooify your bars</summary>
  <description>
    <p>Foo   is a
       tool &amp; more.</p>
    <p xml:lang="de">Foo ist ein Werkzeug.</p>
    <ul>
      <li>first</li>
      <li xml:lang="de">erstens</li>
    </ul>
  </description>
  <screenshots>
    <screenshot type="default">
      <caption>Main window</caption>
      <image width="1280" height="720">https://example.org/shot1.png</image>
    </screenshot>
    <screenshot>https://example.org/legacy.png</screenshot>
    <screenshot>
      <caption>No source, dropped</caption>
    </screenshot>
  </screenshots>
  <provides>
    <binary>foo</binary>
    <mimetype>image/x-foo</mimetype>
    <dbus>org.example.Foo</dbus>
  </provides>
  <url type="homepage">https://example.org</url>
  <url type="bugtracker">https://bugs.example.org</url>
  <project_license>GPL-3.0+</project_license>
  <project_group>Example</project_group>
  <developer_name>The Foo Team</developer_name>
  <extends>org.example.Shell</extends>
  <compulsory_for_desktop>GNOME</compulsory_for_desktop>
  <releases>
    <release version="1.0" timestamp="1136073600"/>
    <release version="0.9" date="2005-11-02"/>
  </releases>
  <languages>
    <lang percentage="96">de</lang>
    <lang>en</lang>
  </languages>
  <categories>
    <category>Graphics</category>
  </categories>
  <keywords>
    <keyword>fooify</keyword>
    <keyword xml:lang="de">fooifizieren</keyword>
  </keywords>
</component>
"#;

    #[test]
    fn reads_a_full_metainfo_document() {
        let mut cpt = test_component();
        read_appstream_upstream_xml(&mut cpt, SAMPLE).unwrap();

        assert_eq!(cpt.cid.as_deref(), Some("org.example.Foo"));
        assert_eq!(cpt.kind, Some(ComponentKind::DesktopApp));
        assert_eq!(cpt.name.get("C").map(String::as_str), Some("Foo"));
        assert_eq!(cpt.name.get("de").map(String::as_str), Some("Das Foo"));
        assert_eq!(
            cpt.summary.get("C").map(String::as_str),
            Some("Fooify your bars")
        );
        assert_eq!(cpt.project_license.as_deref(), Some("GPL-3.0+"));
        assert_eq!(cpt.project_group.as_deref(), Some("Example"));
        assert_eq!(
            cpt.developer_name.get("C").map(String::as_str),
            Some("The Foo Team")
        );
        assert_eq!(cpt.extends, vec!["org.example.Shell"]);
        assert_eq!(cpt.compulsory_for_desktops, vec!["GNOME"]);
        assert_eq!(cpt.categories, vec!["Graphics"]);
        assert_eq!(cpt.keywords.get("C").unwrap(), &vec!["fooify".to_string()]);
        assert_eq!(
            cpt.keywords.get("de").unwrap(),
            &vec!["fooifizieren".to_string()]
        );
        assert_eq!(
            cpt.urls.get("homepage").map(String::as_str),
            Some("https://example.org")
        );
        assert_eq!(
            cpt.urls.get("bugtracker").map(String::as_str),
            Some("https://bugs.example.org")
        );
        assert_eq!(cpt.provides.len(), 3);
        assert_eq!(cpt.languages.len(), 2);
        assert_eq!(cpt.languages[0].percentage, Some(96));
    }

    #[test]
    fn description_collapses_to_html_fragments() {
        let mut cpt = test_component();
        read_appstream_upstream_xml(&mut cpt, SAMPLE).unwrap();

        let c = cpt.description.get("C").unwrap();
        assert_eq!(c, "<p>Foo is a tool &amp; more.</p><ul><li>first</li></ul>");
        let de = cpt.description.get("de").unwrap();
        assert_eq!(
            de,
            "<p>Foo ist ein Werkzeug.</p><ul><li>erstens</li></ul>"
        );
    }

    #[test]
    fn screenshots_support_both_forms_and_drop_sourceless() {
        let mut cpt = test_component();
        read_appstream_upstream_xml(&mut cpt, SAMPLE).unwrap();

        assert_eq!(cpt.screenshots.len(), 2);
        let first = &cpt.screenshots[0];
        assert!(first.default);
        assert_eq!(first.source_image.url, "https://example.org/shot1.png");
        assert_eq!(first.source_image.width, Some(1280));
        assert_eq!(
            first.caption.get("C").map(String::as_str),
            Some("Main window")
        );
        let legacy = &cpt.screenshots[1];
        assert!(!legacy.default);
        assert_eq!(legacy.source_image.url, "https://example.org/legacy.png");
    }

    #[test]
    fn releases_parse_timestamps_and_dates() {
        let mut cpt = test_component();
        read_appstream_upstream_xml(&mut cpt, SAMPLE).unwrap();

        assert_eq!(cpt.releases.len(), 2);
        assert_eq!(cpt.releases[0].version, "1.0");
        assert_eq!(cpt.releases[0].timestamp, Some(1_136_073_600));
        assert!(cpt.releases[1].timestamp.is_some());
    }

    #[test]
    fn legacy_type_on_id_element_is_honored() {
        let mut cpt = test_component();
        read_appstream_upstream_xml(
            &mut cpt,
            r#"<component><id type="desktop">foo.desktop</id></component>"#,
        )
        .unwrap();
        assert_eq!(cpt.kind, Some(ComponentKind::DesktopApp));
        assert_eq!(cpt.cid.as_deref(), Some("foo.desktop"));
    }

    #[test]
    fn malformed_xml_is_a_parse_error() {
        let mut cpt = test_component();
        assert!(matches!(
            read_appstream_upstream_xml(&mut cpt, "<component><id>unclosed"),
            Err(ParseError::Xml(_))
        ));
    }
}
