//! Gettext `.po` catalogs.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::library::Library;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranslationEntry {
    pub msgctxt: Option<String>,
    pub msgid: String,
    pub msgid_plural: Option<String>,
    /// One string, or one per plural form.
    pub msgstr: Vec<String>,
}

impl TranslationEntry {
    fn is_translated(&self) -> bool {
        self.msgstr.iter().any(|s| !s.is_empty())
    }

    /// Value written into a package: a string, or an array of plural forms.
    pub fn to_value(&self) -> Value {
        match (&self.msgid_plural, self.msgstr.as_slice()) {
            (None, [single]) => Value::String(single.clone()),
            _ => Value::Array(self.msgstr.iter().cloned().map(Value::String).collect()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Translation {
    pub locale: String,
    entries: BTreeMap<String, TranslationEntry>,
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    None,
    Context,
    Id,
    IdPlural,
    Str(usize),
}

impl Translation {
    pub fn parse(locale: &str, text: &str) -> Self {
        let mut translation = Translation {
            locale: locale.to_string(),
            entries: BTreeMap::new(),
        };
        let mut entry = TranslationEntry::default();
        let mut field = Field::None;
        let mut started = false;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('"') {
                let value = unquote(line);
                match field {
                    Field::Context => entry.msgctxt.get_or_insert_with(String::new).push_str(&value),
                    Field::Id => entry.msgid.push_str(&value),
                    Field::IdPlural => entry.msgid_plural.get_or_insert_with(String::new).push_str(&value),
                    Field::Str(i) => {
                        if let Some(s) = entry.msgstr.get_mut(i) {
                            s.push_str(&value);
                        }
                    }
                    Field::None => {}
                }
                continue;
            }

            let (keyword, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            let value = unquote(rest.trim());
            // A new msgctxt, or a msgid not preceded by one, opens a new entry.
            let opens = keyword == "msgctxt" || (keyword == "msgid" && field != Field::Context);
            if opens && started {
                translation.insert(std::mem::take(&mut entry));
            }
            started = true;

            field = match keyword {
                "msgctxt" => {
                    entry.msgctxt = Some(value);
                    Field::Context
                }
                "msgid" => {
                    entry.msgid = value;
                    Field::Id
                }
                "msgid_plural" => {
                    entry.msgid_plural = Some(value);
                    Field::IdPlural
                }
                "msgstr" => {
                    entry.msgstr = vec![value];
                    Field::Str(0)
                }
                other => match other
                    .strip_prefix("msgstr[")
                    .and_then(|r| r.strip_suffix(']'))
                    .and_then(|n| n.parse::<usize>().ok())
                {
                    Some(index) => {
                        if entry.msgstr.len() <= index {
                            entry.msgstr.resize(index + 1, String::new());
                        }
                        entry.msgstr[index] = value;
                        Field::Str(index)
                    }
                    None => {
                        tracing::debug!(locale, keyword = other, "ignoring unknown .po keyword");
                        Field::None
                    }
                },
            };
        }
        if started {
            translation.insert(entry);
        }
        translation
    }

    pub fn load(locale: &str, path: &Path) -> std::io::Result<Self> {
        Ok(Self::parse(locale, &fs::read_to_string(path)?))
    }

    fn insert(&mut self, entry: TranslationEntry) {
        // The header entry has an empty msgid.
        if !entry.msgid.is_empty() {
            self.entries.entry(entry.msgid.clone()).or_insert(entry);
        }
    }

    pub fn get(&self, msgid: &str) -> Option<&TranslationEntry> {
        self.entries.get(msgid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Translated strings for `msgids`, skipping untranslated ones.
    pub fn select<'a>(&self, msgids: impl IntoIterator<Item = &'a String>) -> BTreeMap<String, Value> {
        msgids
            .into_iter()
            .filter_map(|id| {
                let entry = self.entries.get(id)?;
                entry.is_translated().then(|| (id.clone(), entry.to_value()))
            })
            .collect()
    }

    fn merge(&mut self, other: Translation) {
        for (msgid, entry) in other.entries {
            self.entries.entry(msgid).or_insert(entry);
        }
    }
}

/// Catalogs of every library for each locale. Earlier libraries win when
/// two translate the same msgid.
pub fn load_translations<'a>(
    libraries: impl IntoIterator<Item = &'a Library>,
    locales: &[String],
) -> BTreeMap<String, Translation> {
    let mut catalogs: BTreeMap<String, Translation> = locales
        .iter()
        .map(|l| {
            (
                l.clone(),
                Translation {
                    locale: l.clone(),
                    entries: BTreeMap::new(),
                },
            )
        })
        .collect();
    for library in libraries {
        for locale in locales {
            let path = library.translation_path.join(format!("{}.po", locale));
            if !path.is_file() {
                continue;
            }
            match Translation::load(locale, &path) {
                Ok(found) => {
                    if let Some(catalog) = catalogs.get_mut(locale) {
                        catalog.merge(found);
                    }
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "cannot read translation"),
            }
        }
    }
    catalogs
}

fn unquote(raw: &str) -> String {
    let inner = raw
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(raw);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
