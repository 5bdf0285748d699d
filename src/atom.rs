//! Atom rendering of the feed.
//!
//! Entries are stored oldest first; the document lists them newest first so
//! fresh notifications sit at the top and old ones drop off the end.

use std::borrow::Cow;
use std::fmt::Write;

use crate::custom_date::format_iso8601_millis;
use crate::feed::{FeedData, FeedEntry};

pub const ATOM_MIME_TYPE: &str = "application/atom+xml";
const ATOM_NAMESPACE: &str = "http://www.w3.org/2005/Atom";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("closing </{0}> without a matching open element")]
    Unbalanced(String),
    #[error("element <{0}> left open at end of document")]
    Unclosed(String),
    #[error("writing output failed")]
    Write(#[from] std::fmt::Error),
}

/// Minimal streaming XML writer. Escapes all text and attribute values and
/// tracks element nesting so a malformed document is an error, not output.
struct XmlWriter {
    out: String,
    open: Vec<&'static str>,
}

impl XmlWriter {
    fn new() -> Self {
        Self {
            out: String::new(),
            open: Vec::new(),
        }
    }

    fn begin_document(&mut self) -> Result<(), RenderError> {
        writeln!(self.out, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
        Ok(())
    }

    fn indent(&mut self) -> Result<(), RenderError> {
        for _ in 0..self.open.len() {
            self.out.write_str("  ")?;
        }
        Ok(())
    }

    fn begin_element(
        &mut self,
        name: &'static str,
        attributes: &[(&str, &str)],
    ) -> Result<(), RenderError> {
        self.indent()?;
        write!(self.out, "<{name}")?;
        self.write_attributes(attributes)?;
        self.out.write_str(">\n")?;
        self.open.push(name);
        Ok(())
    }

    fn empty_element(
        &mut self,
        name: &'static str,
        attributes: &[(&str, &str)],
    ) -> Result<(), RenderError> {
        self.indent()?;
        write!(self.out, "<{name}")?;
        self.write_attributes(attributes)?;
        self.out.write_str("/>\n")?;
        Ok(())
    }

    fn text_element(&mut self, name: &'static str, text: &str) -> Result<(), RenderError> {
        self.indent()?;
        write!(self.out, "<{name}>")?;
        escape_into(&mut self.out, text)?;
        writeln!(self.out, "</{name}>")?;
        Ok(())
    }

    fn end_element(&mut self, name: &'static str) -> Result<(), RenderError> {
        match self.open.pop() {
            Some(open) if open == name => {
                self.indent()?;
                writeln!(self.out, "</{name}>")?;
                Ok(())
            }
            _ => Err(RenderError::Unbalanced(name.to_string())),
        }
    }

    fn finish(self) -> Result<String, RenderError> {
        match self.open.last() {
            Some(name) => Err(RenderError::Unclosed(name.to_string())),
            None => Ok(self.out),
        }
    }

    fn write_attributes(&mut self, attributes: &[(&str, &str)]) -> Result<(), RenderError> {
        for (key, value) in attributes {
            write!(self.out, " {key}=\"")?;
            escape_into(&mut self.out, value)?;
            self.out.write_char('"')?;
        }
        Ok(())
    }
}

fn is_xml_char(c: char) -> bool {
    matches!(
        c,
        '\u{9}'
            | '\u{A}'
            | '\u{D}'
            | '\u{20}'..='\u{D7FF}'
            | '\u{E000}'..='\u{FFFD}'
            | '\u{10000}'..='\u{10FFFF}'
    )
}

/// `text` with every character XML cannot carry replaced by U+FFFD.
pub fn xml_safe(text: &str) -> Cow<'_, str> {
    if text.chars().all(is_xml_char) {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(
            text.chars()
                .map(|c| if is_xml_char(c) { c } else { char::REPLACEMENT_CHARACTER })
                .collect(),
        )
    }
}

fn escape_into(out: &mut String, text: &str) -> Result<(), RenderError> {
    for c in text.chars() {
        match c {
            '&' => out.write_str("&amp;")?,
            '<' => out.write_str("&lt;")?,
            '>' => out.write_str("&gt;")?,
            '"' => out.write_str("&quot;")?,
            '\'' => out.write_str("&apos;")?,
            c if is_xml_char(c) => out.write_char(c)?,
            _ => out.write_char(char::REPLACEMENT_CHARACTER)?,
        }
    }
    Ok(())
}

fn write_entry(writer: &mut XmlWriter, entry: &FeedEntry) -> Result<(), RenderError> {
    writer.begin_element("entry", &[])?;
    writer.text_element("title", &entry.title)?;
    writer.empty_element("link", &[("href", entry.link.as_str())])?;
    writer.text_element("id", &entry.id)?;
    writer.text_element("updated", &format_iso8601_millis(entry.date_updated))?;
    writer.text_element("summary", &entry.summary)?;
    writer.end_element("entry")
}

/// Renders the whole feed or nothing.
pub fn render(feed: &FeedData) -> Result<String, RenderError> {
    let properties = &feed.properties;
    let mut writer = XmlWriter::new();

    writer.begin_document()?;
    writer.begin_element("feed", &[("xmlns", ATOM_NAMESPACE)])?;
    writer.text_element("title", &properties.title)?;
    writer.empty_element("link", &[("href", properties.link.as_str())])?;
    writer.text_element("updated", &format_iso8601_millis(properties.date_updated))?;
    writer.begin_element("author", &[])?;
    writer.text_element("name", &properties.author_name)?;
    writer.end_element("author")?;
    writer.text_element("id", &properties.id)?;

    for entry in feed.entries.iter().rev() {
        write_entry(&mut writer, entry)?;
    }

    writer.end_element("feed")?;
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedProperties;
    use chrono::{Duration, TimeZone, Utc};

    fn feed() -> FeedData {
        FeedData::new(FeedProperties {
            title: "Example Feed".to_string(),
            link: "http://example.org/".to_string(),
            date_updated: Utc.with_ymd_and_hms(2003, 12, 13, 18, 30, 2).unwrap(),
            author_name: "John Doe".to_string(),
            id: "urn:uuid:60a76c80-d399-11d9-b93c-0003939e0af6".to_string(),
        })
    }

    fn entry(title: &str, seconds: i64) -> FeedEntry {
        FeedEntry {
            title: title.to_string(),
            link: "http://example.org/2003/12/13/atom03".to_string(),
            summary: "Some text.".to_string(),
            date_updated: Utc.with_ymd_and_hms(2003, 12, 13, 18, 30, 2).unwrap()
                + Duration::seconds(seconds),
            id: "urn:uuid:1225c695-cfb8-4ebb-aaaa-80da344efa6a".to_string(),
        }
    }

    #[test]
    fn renders_expected_document() {
        let mut data = feed();
        data.entries.push(entry("Atom-Powered Robots Run Amok", 0));

        let expected = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Example Feed</title>
  <link href="http://example.org/"/>
  <updated>2003-12-13T18:30:02.000Z</updated>
  <author>
    <name>John Doe</name>
  </author>
  <id>urn:uuid:60a76c80-d399-11d9-b93c-0003939e0af6</id>
  <entry>
    <title>Atom-Powered Robots Run Amok</title>
    <link href="http://example.org/2003/12/13/atom03"/>
    <id>urn:uuid:1225c695-cfb8-4ebb-aaaa-80da344efa6a</id>
    <updated>2003-12-13T18:30:02.000Z</updated>
    <summary>Some text.</summary>
  </entry>
</feed>
"#;
        assert_eq!(render(&data).unwrap(), expected);
    }

    #[test]
    fn newest_entry_comes_first() {
        let mut data = feed();
        data.entries.push(entry("Item 1", 1));
        data.entries.push(entry("Item 2", 2));
        data.entries.push(entry("Item 3", 3));

        let xml = render(&data).unwrap();
        let one = xml.find("Item 1").unwrap();
        let two = xml.find("Item 2").unwrap();
        let three = xml.find("Item 3").unwrap();
        assert!(three < two && two < one);
    }

    #[test]
    fn escapes_markup_in_text_and_attributes() {
        let mut data = feed();
        data.properties.title = "Tom & Jerry's <feed>".to_string();
        let mut e = entry("a < b", 0);
        e.link = "https://gitlab.home/issues?a=1&b=\"2\"".to_string();
        data.entries.push(e);

        let xml = render(&data).unwrap();
        assert!(xml.contains("<title>Tom &amp; Jerry&apos;s &lt;feed&gt;</title>"));
        assert!(xml.contains("<title>a &lt; b</title>"));
        assert!(xml.contains(r#"href="https://gitlab.home/issues?a=1&amp;b=&quot;2&quot;""#));
    }

    #[test]
    fn control_characters_are_replaced() {
        let mut data = feed();
        data.entries.push(entry("bell\u{7}", 0));
        data.entries.push(entry("tab\tand\u{FFFE}", 1));

        let xml = render(&data).unwrap();
        assert!(xml.contains("<title>bell\u{FFFD}</title>"));
        assert!(xml.contains("<title>tab\tand\u{FFFD}</title>"));
    }

    #[test]
    fn xml_safe_borrows_clean_text() {
        assert!(matches!(xml_safe("Pay rent"), Cow::Borrowed("Pay rent")));
        assert_eq!(xml_safe("Pay\u{8}bill\u{1F}"), "Pay\u{FFFD}bill\u{FFFD}");
    }

    #[test]
    fn writer_rejects_mismatched_nesting() {
        let mut writer = XmlWriter::new();
        writer.begin_element("feed", &[]).unwrap();
        assert_eq!(
            writer.end_element("entry"),
            Err(RenderError::Unbalanced("entry".to_string()))
        );

        let mut writer = XmlWriter::new();
        writer.begin_element("feed", &[]).unwrap();
        assert_eq!(writer.finish(), Err(RenderError::Unclosed("feed".to_string())));
    }
}
