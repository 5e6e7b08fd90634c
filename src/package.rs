//! Parts and packages.
//!
//! A part is a unit the application loads on demand; each part owns one
//! package of class code, assets, locale data and translations. The boot
//! part always comes first and takes every class no other part claims.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::application::{class_pattern_matches, PartConfig, BOOT_PART};

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub id: usize,
    pub classes: Vec<String>,
    pub assets: BTreeSet<String>,
    /// Locale → locale data.
    pub locales: BTreeMap<String, Value>,
    /// Locale → msgid → translation.
    pub translations: BTreeMap<String, BTreeMap<String, Value>>,
}

impl Package {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Class code only counts when it is embedded into the package file;
    /// otherwise it is loaded from its own file.
    pub fn is_empty(&self, embed_all_js: bool) -> bool {
        self.assets.is_empty()
            && self.locales.is_empty()
            && self.translations.values().all(BTreeMap::is_empty)
            && (!embed_all_js || self.classes.is_empty())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub name: String,
    pub packages: Vec<usize>,
}

/// Split `load_order` into parts. Each class goes to the first non-boot part
/// whose include pattern matches it; the rest stay in boot. Order within a
/// package follows `load_order`.
pub fn partition(load_order: &[String], parts: &[PartConfig]) -> (Vec<Part>, Vec<Package>) {
    // First definition of a part name wins.
    let mut names = BTreeSet::new();
    let configs: Vec<&PartConfig> = parts
        .iter()
        .filter(|p| p.name != BOOT_PART && names.insert(p.name.as_str()))
        .collect();

    let mut packages: Vec<Package> = (0..=configs.len()).map(Package::new).collect();
    for classname in load_order {
        let index = configs
            .iter()
            .position(|p| p.include.iter().any(|pat| class_pattern_matches(pat, classname)))
            .map(|i| i + 1)
            .unwrap_or(0);
        packages[index].classes.push(classname.clone());
    }

    let mut result = vec![Part {
        name: BOOT_PART.to_string(),
        packages: vec![0],
    }];
    result.extend(configs.iter().enumerate().map(|(i, p)| Part {
        name: p.name.clone(),
        packages: vec![i + 1],
    }));
    (result, packages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_empty() {
        let mut package = Package::new(0);
        assert!(package.is_empty(false));
        package.classes.push("app.Main".into());
        assert!(package.is_empty(false));
        assert!(!package.is_empty(true));

        let mut with_translations = Package::new(1);
        with_translations
            .translations
            .insert("de".into(), BTreeMap::new());
        assert!(with_translations.is_empty(true));
        with_translations
            .translations
            .get_mut("de")
            .unwrap()
            .insert("Hello".into(), Value::from("Hallo"));
        assert!(!with_translations.is_empty(false));

        let mut with_asset = Package::new(2);
        with_asset.assets.insert("app/logo.png".into());
        assert!(!with_asset.is_empty(false));

        let mut with_locale = Package::new(3);
        with_locale.locales.insert("de".into(), serde_json::json!({}));
        assert!(!with_locale.is_empty(false));
    }

    #[test]
    fn test_partition_boot_takes_the_rest() {
        let order: Vec<String> = ["qx.core.Object", "app.admin.Panel", "app.Main", "app.admin.Users"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let parts = vec![
            PartConfig {
                name: "boot".into(),
                include: vec!["app.Main".into()],
            },
            PartConfig {
                name: "admin".into(),
                include: vec!["app.admin.*".into()],
            },
        ];
        let (parts, packages) = partition(&order, &parts);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, "boot");
        assert_eq!(packages[0].classes, vec!["qx.core.Object", "app.Main"]);
        assert_eq!(packages[1].classes, vec!["app.admin.Panel", "app.admin.Users"]);
    }

    #[test]
    fn test_partition_ignores_repeated_part_names() {
        let order: Vec<String> = ["app.Main", "app.admin.Panel", "app.report.Chart"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let part = |name: &str, include: &str| PartConfig {
            name: name.into(),
            include: vec![include.into()],
        };
        let parts = vec![
            part("admin", "app.admin.*"),
            part("report", "app.report.*"),
            part("admin", "app.report.*"),
        ];
        let (parts, packages) = partition(&order, &parts);
        let names: Vec<&str> = parts.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["boot", "admin", "report"]);
        assert_eq!(packages.len(), 3);
        assert_eq!(packages[2].classes, vec!["app.report.Chart"]);
    }
}
