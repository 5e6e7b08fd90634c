//! Explicit class hierarchy graph.
//!
//! Nodes are classes, mixins and interfaces; edges are `extends`, `includes`
//! and `implements`. Override provenance and `appearsIn` are deterministic
//! walks over this graph. It is rebuilt from the current records whenever the
//! database reconciles, so it always reflects just-applied edits.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use crate::class_meta::{ClassRecord, ClassType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EdgeKind {
    Extends,
    Includes,
    Implements,
}

/// Which declaration table of a class a name lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberCategory {
    Member,
    Static,
    Property,
}

/// Where the effective definition of a member comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    /// Declared in the body of the named class.
    OverriddenFrom(String),
    /// Merged in from the named mixin.
    Mixin(String),
}

#[derive(Debug, Clone, Default)]
struct ClassNode {
    class_type: Option<ClassType>,
    super_class: Option<String>,
    mixins: Vec<String>,
    interfaces: Vec<String>,
    members: BTreeSet<String>,
    statics: BTreeSet<String>,
    properties: BTreeSet<String>,
}

impl ClassNode {
    fn declares(&self, category: MemberCategory, name: &str) -> bool {
        match category {
            MemberCategory::Member => self.members.contains(name),
            MemberCategory::Static => self.statics.contains(name),
            MemberCategory::Property => self.properties.contains(name),
        }
    }

    fn edges(&self) -> impl Iterator<Item = (EdgeKind, &String)> {
        self.super_class
            .iter()
            .map(|s| (EdgeKind::Extends, s))
            .chain(self.mixins.iter().map(|m| (EdgeKind::Includes, m)))
            .chain(self.interfaces.iter().map(|i| (EdgeKind::Implements, i)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClassGraph {
    nodes: BTreeMap<String, ClassNode>,
    /// target → classes with an edge pointing at it.
    derived: BTreeMap<String, BTreeSet<String>>,
}

impl ClassGraph {
    /// Build from records. Only entries written by each class body count as
    /// declarations; merged or synthesized entries are ignored.
    pub fn build<'r>(records: impl IntoIterator<Item = &'r ClassRecord>) -> Self {
        let mut graph = ClassGraph::default();
        for record in records {
            let node = ClassNode {
                class_type: Some(record.class_type),
                super_class: record.super_class.clone(),
                mixins: record.mixins.clone(),
                interfaces: record.interfaces.clone(),
                members: own_names(record.members.iter().map(|(n, m)| (n, m.is_own()))),
                statics: own_names(record.statics.iter().map(|(n, m)| (n, m.is_own()))),
                properties: own_names(record.properties.iter().map(|(n, p)| (n, p.is_own()))),
            };
            for (_, target) in node.edges() {
                graph
                    .derived
                    .entry(target.clone())
                    .or_default()
                    .insert(record.classname.clone());
            }
            graph.nodes.insert(record.classname.clone(), node);
        }
        graph
    }

    pub fn contains(&self, classname: &str) -> bool {
        self.nodes.contains_key(classname)
    }

    pub fn class_type(&self, classname: &str) -> Option<ClassType> {
        self.nodes.get(classname).and_then(|n| n.class_type)
    }

    pub fn edges(&self, classname: &str) -> Vec<(EdgeKind, String)> {
        self.nodes
            .get(classname)
            .map(|n| n.edges().map(|(k, t)| (k, t.clone())).collect())
            .unwrap_or_default()
    }

    /// Classes that directly extend, include or implement `classname`.
    pub fn direct_derived(&self, classname: &str) -> impl Iterator<Item = &String> {
        self.derived.get(classname).into_iter().flatten()
    }

    /// `seeds` plus every class that transitively derives from any of them.
    pub fn derived_closure<'s>(&self, seeds: impl IntoIterator<Item = &'s String>) -> BTreeSet<String> {
        let mut closure: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = seeds.into_iter().cloned().collect();
        while let Some(classname) = queue.pop_front() {
            if !closure.insert(classname.clone()) {
                continue;
            }
            for derived in self.direct_derived(&classname) {
                if !closure.contains(derived) {
                    queue.push_back(derived.clone());
                }
            }
        }
        closure
    }

    /// Own body first, then the class's own mixins in declaration order, then
    /// the superclass. Mixins of mixins are not searched.
    pub fn find_provenance(
        &self,
        classname: &str,
        category: MemberCategory,
        name: &str,
    ) -> Option<Provenance> {
        let mut seen = HashSet::new();
        let mut current = Some(classname);
        while let Some(class) = current {
            if !seen.insert(class) {
                tracing::warn!(classname, "cyclic superclass chain");
                return None;
            }
            let node = self.nodes.get(class)?;
            if node.declares(category, name) {
                return Some(Provenance::OverriddenFrom(class.to_string()));
            }
            for mixin in &node.mixins {
                if self
                    .nodes
                    .get(mixin)
                    .is_some_and(|m| m.declares(category, name))
                {
                    return Some(Provenance::Mixin(mixin.clone()));
                }
            }
            current = node.super_class.as_deref();
        }
        None
    }

    /// Every ancestor, mixin or interface (transitively, excluding the class
    /// itself) whose body declares `name`, in breadth-first order.
    pub fn appears_in(&self, classname: &str, category: MemberCategory, name: &str) -> Vec<String> {
        self.ancestry(classname)
            .into_iter()
            .filter(|ancestor| {
                self.nodes
                    .get(ancestor)
                    .is_some_and(|n| n.declares(category, name))
            })
            .collect()
    }

    /// Breadth-first over extends/includes/implements, excluding `classname`.
    pub fn ancestry(&self, classname: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen: HashSet<String> = HashSet::from([classname.to_string()]);
        let mut queue: VecDeque<String> = VecDeque::new();
        if let Some(node) = self.nodes.get(classname) {
            queue.extend(node.edges().map(|(_, t)| t.clone()));
        }
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&next) {
                queue.extend(node.edges().map(|(_, t)| t.clone()));
            }
            out.push(next);
        }
        out
    }

    /// Interfaces a class is bound to through itself, its mixins and the
    /// interfaces those extend. Superclass interfaces are the superclass's
    /// concern.
    pub fn bound_interfaces(&self, classname: &str) -> Vec<String> {
        let Some(node) = self.nodes.get(classname) else {
            return Vec::new();
        };
        let mut queue: VecDeque<String> = node.interfaces.iter().cloned().collect();
        for mixin in &node.mixins {
            if let Some(m) = self.nodes.get(mixin) {
                queue.extend(m.interfaces.iter().cloned());
            }
        }
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        while let Some(iface) = queue.pop_front() {
            if !seen.insert(iface.clone()) {
                continue;
            }
            if let Some(n) = self.nodes.get(&iface) {
                queue.extend(n.interfaces.iter().cloned());
            }
            out.push(iface);
        }
        out
    }
}

fn own_names<'r>(entries: impl Iterator<Item = (&'r String, bool)>) -> BTreeSet<String> {
    entries
        .filter(|(_, own)| *own)
        .map(|(name, _)| name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class_meta::{MemberMeta, PropertyMeta};

    fn class(name: &str, super_class: Option<&str>, mixins: &[&str], members: &[&str]) -> ClassRecord {
        let mut record = ClassRecord::new(name, ClassType::Class);
        record.super_class = super_class.map(String::from);
        record.mixins = mixins.iter().map(|m| m.to_string()).collect();
        for member in members {
            record.members.insert(member.to_string(), MemberMeta::default());
        }
        record
    }

    fn mixin(name: &str, members: &[&str]) -> ClassRecord {
        let mut record = class(name, None, &[], members);
        record.class_type = ClassType::Mixin;
        record
    }

    #[test]
    fn test_mixin_wins_over_superclass() {
        let records = vec![
            class("B", None, &[], &["f"]),
            mixin("M", &["f"]),
            class("C", Some("B"), &["M"], &[]),
        ];
        let graph = ClassGraph::build(&records);
        assert_eq!(
            graph.find_provenance("C", MemberCategory::Member, "f"),
            Some(Provenance::Mixin("M".into()))
        );
        assert_eq!(
            graph.appears_in("C", MemberCategory::Member, "f"),
            vec!["B".to_string(), "M".to_string()]
        );
    }

    #[test]
    fn test_own_body_wins() {
        let records = vec![
            class("B", None, &[], &["f"]),
            mixin("M", &["f"]),
            class("C", Some("B"), &["M"], &["f"]),
        ];
        let graph = ClassGraph::build(&records);
        assert_eq!(
            graph.find_provenance("C", MemberCategory::Member, "f"),
            Some(Provenance::OverriddenFrom("C".into()))
        );
    }

    #[test]
    fn test_mixins_of_mixins_are_not_searched() {
        let mut outer = mixin("M1", &[]);
        outer.mixins = vec!["M2".into()];
        let records = vec![outer, mixin("M2", &["g"]), class("C", None, &["M1"], &[])];
        let graph = ClassGraph::build(&records);
        assert_eq!(graph.find_provenance("C", MemberCategory::Member, "g"), None);
    }

    #[test]
    fn test_derived_closure_follows_all_edge_kinds() {
        let mut iface = ClassRecord::new("I", ClassType::Interface);
        iface.members.insert("run".into(), MemberMeta::default());
        let mut impl_class = class("Impl", None, &[], &[]);
        impl_class.interfaces = vec!["I".into()];
        let records = vec![
            class("A", None, &[], &[]),
            class("B", Some("A"), &[], &[]),
            class("C", Some("B"), &[], &[]),
            class("Other", None, &[], &[]),
            iface,
            impl_class,
        ];
        let graph = ClassGraph::build(&records);
        let closure = graph.derived_closure(&["A".to_string()]);
        assert_eq!(
            closure.into_iter().collect::<Vec<_>>(),
            vec!["A", "B", "C"]
        );
        assert!(graph.derived_closure(&["I".to_string()]).contains("Impl"));
    }

    #[test]
    fn test_merged_entries_are_not_declarations() {
        let mut record = class("C", None, &[], &[]);
        record.properties.insert(
            "p".into(),
            PropertyMeta {
                mixin: Some("M".into()),
                ..PropertyMeta::default()
            },
        );
        let graph = ClassGraph::build(&[record]);
        assert_eq!(graph.find_provenance("C", MemberCategory::Property, "p"), None);
    }
}
