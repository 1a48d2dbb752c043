//! Minimal parser for cleartext XML exports.
//!
//! Understands the common KeePass-style export shape: nested `<Group>`
//! elements carrying a `<Name>`, with `<Entry>` elements holding
//! `<String><Key>..</Key><Value>..</Value></String>` pairs. Anything
//! else is skipped. This is intentionally a small scanner, not a general
//! XML parser - exports are machine-written and regular.

use crate::error::{VaultError, VaultResult};
use std::collections::BTreeMap;

/// A parsed entry: group path, title, and remaining fields.
pub type ImportedEntry = (String, String, BTreeMap<String, String>);

/// Extracts entries from a cleartext XML export.
///
/// # Errors
///
/// Returns [`VaultError::Xml`] on unbalanced tags or truncated input.
pub fn parse_xml_entries(xml: &str) -> VaultResult<Vec<ImportedEntry>> {
    let mut parser = Parser::new(xml);
    let mut groups: Vec<String> = Vec::new();
    let mut entries = Vec::new();

    while let Some(tag) = parser.next_tag()? {
        match tag {
            Tag::Open("Group") => {
                groups.push(String::new());
            }
            Tag::Close("Group") => {
                if groups.pop().is_none() {
                    return Err(VaultError::xml("unbalanced </Group>"));
                }
            }
            Tag::Open("Name") => {
                let name = parser.text_until("Name")?;
                if let Some(current) = groups.last_mut() {
                    if current.is_empty() {
                        *current = name;
                    }
                }
            }
            Tag::Open("Entry") => {
                let mut fields = parser.entry_fields()?;
                let title = fields.remove("Title").unwrap_or_default();
                let group = groups
                    .iter()
                    .filter(|g| !g.is_empty())
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("/");
                entries.push((group, title, fields));
            }
            _ => {}
        }
    }

    if !groups.is_empty() {
        return Err(VaultError::xml("unclosed <Group>"));
    }
    Ok(entries)
}

enum Tag<'a> {
    Open(&'a str),
    Close(&'a str),
    Other,
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    /// Advances to the next tag, returning its name and kind.
    fn next_tag(&mut self) -> VaultResult<Option<Tag<'a>>> {
        let rest = &self.input[self.pos..];
        let Some(start) = rest.find('<') else {
            self.pos = self.input.len();
            return Ok(None);
        };
        let rest = &rest[start..];
        let end = rest
            .find('>')
            .ok_or_else(|| VaultError::xml("unterminated tag"))?;
        let inner = &rest[1..end];
        self.pos += start + end + 1;

        if inner.starts_with('?') || inner.starts_with('!') {
            return Ok(Some(Tag::Other));
        }
        if let Some(name) = inner.strip_prefix('/') {
            return Ok(Some(Tag::Close(name.trim())));
        }
        if inner.ends_with('/') {
            return Ok(Some(Tag::Other));
        }
        let name = inner.split_whitespace().next().unwrap_or("");
        Ok(Some(Tag::Open(name)))
    }

    /// Reads text content up to the matching close tag.
    fn text_until(&mut self, name: &str) -> VaultResult<String> {
        let rest = &self.input[self.pos..];
        let close = format!("</{name}>");
        let end = rest
            .find(&close)
            .ok_or_else(|| VaultError::xml(format!("missing {close}")))?;
        let text = &rest[..end];
        self.pos += end + close.len();
        Ok(unescape(text))
    }

    /// Collects Key/Value pairs until the entry closes.
    fn entry_fields(&mut self) -> VaultResult<BTreeMap<String, String>> {
        let mut fields = BTreeMap::new();
        let mut key: Option<String> = None;

        loop {
            match self.next_tag()? {
                Some(Tag::Open("Key")) => {
                    key = Some(self.text_until("Key")?);
                }
                Some(Tag::Open("Value")) => {
                    let value = self.text_until("Value")?;
                    if let Some(key) = key.take() {
                        fields.insert(key, value);
                    }
                }
                Some(Tag::Close("Entry")) => return Ok(fields),
                Some(_) => {}
                None => return Err(VaultError::xml("unclosed <Entry>")),
            }
        }
    }
}

fn unescape(text: &str) -> String {
    text.trim()
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
