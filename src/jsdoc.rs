//! JSDoc comment parsing.
//!
//! Understands both `@param {Type} name desc` and the `@param name {Type} desc`
//! ordering, optional markers (`[name]`, `[name=default]`, `name?`, `{Type?}`,
//! `{Type=}`) and call-style directives such as `@require(qx.ui.core.Widget)`.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

lazy_static! {
    static ref TAG_RE: Regex = Regex::new(r"^@([A-Za-z][\w-]*)(.*)$").unwrap();
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JsDocParam {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JsDocReturn {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JsDoc {
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<JsDocParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<JsDocReturn>,
    /// Every other tag, keyed by name, values in source order.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl JsDoc {
    /// Parse the raw text of a `/** ... */` block.
    pub fn parse(comment: &str) -> JsDoc {
        let body = comment
            .trim()
            .trim_start_matches("/**")
            .trim_end_matches("*/");

        let mut doc = JsDoc::default();
        let mut description: Vec<String> = Vec::new();
        let mut current: Option<(String, String)> = None;

        for raw_line in body.lines() {
            let line = raw_line.trim();
            let line = line.strip_prefix('*').unwrap_or(line);
            let line = line.strip_prefix(' ').unwrap_or(line);

            if let Some(caps) = TAG_RE.captures(line.trim_start()) {
                if let Some((name, value)) = current.take() {
                    doc.add_tag(&name, value.trim());
                }
                current = Some((caps[1].to_string(), caps[2].to_string()));
                continue;
            }

            match current.as_mut() {
                Some((_, value)) => {
                    value.push('\n');
                    value.push_str(line.trim());
                }
                None => description.push(line.to_string()),
            }
        }
        if let Some((name, value)) = current.take() {
            doc.add_tag(&name, value.trim());
        }

        doc.description = description.join("\n").trim().to_string();
        doc
    }

    fn add_tag(&mut self, name: &str, value: &str) {
        match name {
            "param" => {
                if let Some(param) = parse_param(value) {
                    self.params.push(param);
                }
            }
            "return" | "returns" => {
                let (type_name, rest) = take_type(value);
                self.returns = Some(JsDocReturn {
                    type_name,
                    description: rest.trim().to_string(),
                });
            }
            _ => self
                .tags
                .entry(name.to_string())
                .or_default()
                .push(value.to_string()),
        }
    }

    pub fn param(&self, name: &str) -> Option<&JsDocParam> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn tag(&self, name: &str) -> Option<&[String]> {
        self.tags.get(name).map(|v| v.as_slice())
    }

    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.contains_key(name)
    }

    pub fn is_deprecated(&self) -> bool {
        self.has_tag("deprecated")
    }

    /// Arguments of call-style directives, e.g. `@asset(app/*)` → `app/*`.
    pub fn directives(&self, name: &str) -> Vec<String> {
        self.tag(name)
            .unwrap_or(&[])
            .iter()
            .filter_map(|value| {
                let value = value.trim();
                let inner = value.strip_prefix('(')?;
                let end = inner.find(')')?;
                Some(inner[..end].trim().to_string())
            })
            .flat_map(|args| {
                args.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

/// Split a leading `{Type}` off `text`, honouring nested braces.
fn take_type(text: &str) -> (Option<String>, &str) {
    let text = text.trim_start();
    if !text.starts_with('{') {
        return (None, text);
    }
    let mut depth = 0;
    for (i, c) in text.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let type_name = text[1..i].trim().to_string();
                    return (Some(type_name), &text[i + 1..]);
                }
            }
            _ => {}
        }
    }
    (None, text)
}

fn parse_param(value: &str) -> Option<JsDocParam> {
    let (mut type_name, rest) = take_type(value);
    let rest = rest.trim_start();
    let name_end = rest
        .find(|c: char| c.is_whitespace() || c == '{')
        .unwrap_or(rest.len());
    let mut raw_name = rest[..name_end].to_string();
    let mut rest = &rest[name_end..];

    if type_name.is_none() {
        let (after_type, remainder) = take_type(rest);
        if after_type.is_some() {
            type_name = after_type;
            rest = remainder;
        }
    }

    if raw_name.is_empty() {
        return None;
    }

    let mut optional = false;
    let mut default_value = None;
    if raw_name.starts_with('[') && raw_name.ends_with(']') {
        optional = true;
        raw_name = raw_name[1..raw_name.len() - 1].to_string();
        if let Some(eq) = raw_name.find('=') {
            default_value = Some(raw_name[eq + 1..].trim().to_string());
            raw_name.truncate(eq);
        }
    }
    if let Some(stripped) = raw_name.strip_suffix('?') {
        optional = true;
        raw_name = stripped.to_string();
    }
    if let Some(t) = type_name.as_mut() {
        if let Some(stripped) = t.strip_suffix('?').or_else(|| t.strip_suffix('=')) {
            optional = true;
            *t = stripped.trim().to_string();
        }
    }

    Some(JsDocParam {
        name: raw_name.trim().to_string(),
        type_name,
        optional,
        default_value,
        description: rest.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_and_tags() {
        let doc = JsDoc::parse(
            "/**\n * Does a thing.\n * Second line.\n *\n * @deprecated since 2.0\n * @internal\n */",
        );
        assert_eq!(doc.description, "Does a thing.\nSecond line.");
        assert!(doc.is_deprecated());
        assert_eq!(doc.tag("deprecated").unwrap()[0], "since 2.0");
        assert!(doc.has_tag("internal"));
    }

    #[test]
    fn test_param_orderings() {
        let doc = JsDoc::parse(
            "/**\n * @param {String} first the first\n * @param second {Integer?} the second\n * @param [third=42] {Number}\n */",
        );
        let first = doc.param("first").unwrap();
        assert_eq!(first.type_name.as_deref(), Some("String"));
        assert!(!first.optional);
        assert_eq!(first.description, "the first");

        let second = doc.param("second").unwrap();
        assert_eq!(second.type_name.as_deref(), Some("Integer"));
        assert!(second.optional);

        let third = doc.param("third").unwrap();
        assert!(third.optional);
        assert_eq!(third.default_value.as_deref(), Some("42"));
        assert_eq!(third.type_name.as_deref(), Some("Number"));
    }

    #[test]
    fn test_return_with_nested_type() {
        let doc = JsDoc::parse("/** @return {Map<String,{a:Number}>} the map */");
        let ret = doc.returns.unwrap();
        assert_eq!(ret.type_name.as_deref(), Some("Map<String,{a:Number}>"));
        assert_eq!(ret.description, "the map");
    }

    #[test]
    fn test_directives() {
        let doc = JsDoc::parse(
            "/**\n * @require(qx.bom.Client)\n * @asset(app/*, app/icons/logo.png)\n * @ignore(Foo)\n */",
        );
        assert_eq!(doc.directives("require"), vec!["qx.bom.Client"]);
        assert_eq!(doc.directives("asset"), vec!["app/*", "app/icons/logo.png"]);
        assert_eq!(doc.directives("ignore"), vec!["Foo"]);
        assert!(doc.directives("use").is_empty());
    }

    #[test]
    fn test_multiline_tag_continuation() {
        let doc = JsDoc::parse("/**\n * @param a {String} first line\n *   continues here\n */");
        assert_eq!(doc.param("a").unwrap().description, "first line\ncontinues here");
    }
}
