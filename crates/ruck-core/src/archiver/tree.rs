use std::collections::{BTreeMap, HashSet};

use ruck_types::{Result, RuckError};

/// Defines how a snapshot should look when archived: a nested mapping keyed
/// by path component.
///
/// A node is a *leaf* (carries `path`) iff a concrete target ends at it;
/// otherwise it is purely structural and carries `file_info_path`, the
/// directory whose metadata is captured for the intermediate level. `root`
/// is the parent directory the tree's first component resolves against —
/// two targets with the same first component but different roots must not
/// collapse into one child.
#[derive(Debug, Clone, Default)]
pub struct ArchiveTree {
    pub nodes: BTreeMap<String, ArchiveTree>,
    pub path: Option<String>,
    pub file_info_path: Option<String>,
    pub root: String,
}

/// Lexically clean a path: collapse `//` and `/./`, resolve `..` where
/// possible (root-bounded for absolute paths, kept leading for relative).
pub fn clean_path(p: &str) -> String {
    if p.is_empty() {
        return ".".into();
    }
    let rooted = p.starts_with('/');
    let mut out: Vec<&str> = Vec::new();
    for comp in p.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                match out.last() {
                    Some(&last) if last != ".." => {
                        out.pop();
                    }
                    _ if rooted => {}
                    _ => out.push(".."),
                }
            }
            c => out.push(c),
        }
    }
    let body = out.join("/");
    match (rooted, body.is_empty()) {
        (true, true) => "/".into(),
        (true, false) => format!("/{body}"),
        (false, true) => ".".into(),
        (false, false) => body,
    }
}

/// Join and clean two path fragments.
fn join(a: &str, b: &str) -> String {
    if a.is_empty() {
        return clean_path(b);
    }
    clean_path(&format!("{a}/{b}"))
}

#[cfg(windows)]
fn split_volume(p: &str) -> (Option<String>, &str) {
    let bytes = p.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        (Some((bytes[0] as char).to_string()), &p[2..])
    } else {
        (None, p)
    }
}

#[cfg(not(windows))]
fn split_volume(p: &str) -> (Option<String>, &str) {
    (None, p)
}

/// All path components of `p`.
///
/// Absolute paths split on `/` after cleaning. Relative paths are rooted
/// first unless `include_relative` is set, so `./foo/bar` and `foo/bar`
/// both produce `[foo, bar]`; with `include_relative`, leading `..`
/// components survive. A Windows volume letter becomes the first component.
pub fn path_components(p: &str, include_relative: bool) -> Vec<String> {
    let (volume, p) = split_volume(p);

    let cleaned = if !p.starts_with('/') && !include_relative {
        clean_path(&format!("/{p}"))
    } else {
        clean_path(p)
    };

    let mut components: Vec<String> = cleaned
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .map(String::from)
        .collect();

    if let Some(v) = volume {
        components.insert(0, v);
    }
    components
}

/// The directory containing the first component of `target`: `/` for
/// absolute targets, otherwise `.` extended by one `..` per leading parent
/// reference.
pub fn root_directory(target: &str) -> String {
    if target.is_empty() {
        return String::new();
    }
    if target.starts_with('/') {
        return "/".into();
    }

    let cleaned = clean_path(target);
    let mut rel = String::from(".");
    for comp in path_components(&cleaned, true) {
        if comp == ".." {
            rel = join(&rel, "..");
        }
    }
    rel
}

impl ArchiveTree {
    /// Build an archive tree from target paths. Targets are cleaned and
    /// duplicates dropped, preserving first-seen order.
    pub fn new(targets: &[String]) -> Result<ArchiveTree> {
        let mut tree = ArchiveTree::default();
        let mut seen = HashSet::new();
        for target in targets {
            let target = clean_path(target);
            if !seen.insert(target.clone()) {
                continue;
            }
            tree.add(&target)?;
        }
        Ok(tree)
    }

    /// Add one target path to the tree.
    ///
    /// Collision rule: when the first component matches an existing child
    /// with a different root, the new child gets a `-1`, `-2`, … suffix;
    /// with the same root, the existing subtree is extended.
    pub fn add(&mut self, target: &str) -> Result<()> {
        if target.is_empty() {
            return Err(RuckError::InvalidFormat("invalid target (empty string)".into()));
        }

        let pc = path_components(target, false);
        if pc.is_empty() {
            return Err(RuckError::InvalidFormat(format!(
                "invalid target (no path components): '{target}'"
            )));
        }

        let orig_name = pc[0].clone();
        let root = root_directory(target);

        let mut name = orig_name.clone();
        let mut subtree = ArchiveTree {
            root: root.clone(),
            ..Default::default()
        };
        let mut i = 0;
        loop {
            match self.nodes.get(&name) {
                None => break,
                Some(other) => {
                    i += 1;
                    if other.root == root {
                        subtree = other.clone();
                        break;
                    }
                    name = format!("{orig_name}-{i}");
                }
            }
        }

        if pc.len() > 1 {
            let subroot = join(&root, &orig_name);
            subtree.add_below(target, &subroot, &pc[1..])?;
            subtree.file_info_path = Some(subroot);
        } else {
            subtree.path = Some(target.to_string());
        }

        self.nodes.insert(name, subtree);
        Ok(())
    }

    fn add_below(&mut self, target: &str, root: &str, pc: &[String]) -> Result<()> {
        if pc.is_empty() {
            return Err(RuckError::InvalidFormat(format!("invalid path '{target}'")));
        }
        let name = &pc[0];

        if pc.len() == 1 {
            match self.nodes.get_mut(name) {
                None => {
                    self.nodes.insert(
                        name.clone(),
                        ArchiveTree {
                            path: Some(target.to_string()),
                            ..Default::default()
                        },
                    );
                    Ok(())
                }
                Some(existing) => {
                    if existing.path.is_some() {
                        return Err(RuckError::InvalidFormat(format!(
                            "path is already set for target '{target}'"
                        )));
                    }
                    existing.path = Some(target.to_string());
                    Ok(())
                }
            }
        } else {
            let mut subtree = self.nodes.remove(name).unwrap_or_default();
            let subroot = join(root, name);
            subtree.file_info_path = Some(subroot.clone());
            subtree.add_below(target, &subroot, &pc[1..])?;
            self.nodes.insert(name.clone(), subtree);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_from(targets: &[&str]) -> ArchiveTree {
        let targets: Vec<String> = targets.iter().map(|s| s.to_string()).collect();
        ArchiveTree::new(&targets).unwrap()
    }

    #[test]
    fn clean_path_cases() {
        assert_eq!(clean_path(""), ".");
        assert_eq!(clean_path("."), ".");
        assert_eq!(clean_path("./foo/bar"), "foo/bar");
        assert_eq!(clean_path("foo//bar/"), "foo/bar");
        assert_eq!(clean_path("/a/../b"), "/b");
        assert_eq!(clean_path("/.."), "/");
        assert_eq!(clean_path("../../x"), "../../x");
        assert_eq!(clean_path("a/.."), ".");
    }

    #[test]
    fn path_components_cases() {
        assert_eq!(path_components("/foo/bar/baz", false), ["foo", "bar", "baz"]);
        assert_eq!(path_components("/foo/bar/baz", true), ["foo", "bar", "baz"]);
        assert_eq!(path_components("foo/bar/baz", false), ["foo", "bar", "baz"]);
        assert_eq!(path_components("./foo/bar", false), ["foo", "bar"]);
        assert_eq!(path_components("../foo/bar", false), ["foo", "bar"]);
        assert_eq!(path_components("../foo/bar", true), ["..", "foo", "bar"]);
        assert!(path_components(".", false).is_empty());
        assert!(path_components("..", false).is_empty());
        assert!(path_components("../..", false).is_empty());
        assert!(path_components("/", false).is_empty());
    }

    #[test]
    fn root_directory_cases() {
        assert_eq!(root_directory(""), "");
        assert_eq!(root_directory("/foo/bar"), "/");
        assert_eq!(root_directory("foo"), ".");
        assert_eq!(root_directory("./foo"), ".");
        assert_eq!(root_directory("../foo"), "..");
        assert_eq!(root_directory("../../x/y"), "../..");
    }

    #[test]
    fn single_file_target() {
        let tree = tree_from(&["foo"]);
        assert_eq!(tree.nodes.len(), 1);
        let foo = &tree.nodes["foo"];
        assert_eq!(foo.path.as_deref(), Some("foo"));
        assert_eq!(foo.root, ".");
        assert!(foo.nodes.is_empty());
    }

    #[test]
    fn nested_target_builds_structural_chain() {
        let tree = tree_from(&["foo/bar/baz"]);
        let foo = &tree.nodes["foo"];
        assert!(foo.path.is_none());
        assert_eq!(foo.file_info_path.as_deref(), Some("foo"));
        let bar = &foo.nodes["bar"];
        assert_eq!(bar.file_info_path.as_deref(), Some("foo/bar"));
        let baz = &bar.nodes["baz"];
        assert_eq!(baz.path.as_deref(), Some("foo/bar/baz"));
    }

    #[test]
    fn name_collision_gets_numeric_suffix() {
        // Scenario: same first component, different resolved roots.
        let tree = tree_from(&["foo/user1", "../foo/other", "foo/user2"]);

        let keys: Vec<&str> = tree.nodes.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["foo", "foo-1"]);

        let foo = &tree.nodes["foo"];
        assert_eq!(foo.root, ".");
        assert!(foo.nodes.contains_key("user1"));
        assert!(foo.nodes.contains_key("user2"));
        assert_eq!(
            foo.nodes["user1"].path.as_deref(),
            Some("foo/user1")
        );

        let foo1 = &tree.nodes["foo-1"];
        assert_eq!(foo1.root, "..");
        assert_eq!(
            foo1.nodes["other"].path.as_deref(),
            Some("../foo/other")
        );
    }

    #[test]
    fn cleaned_duplicates_collapse() {
        // "./foo/work/user" and "foo/work/user" clean to the same target.
        let tree = tree_from(&["./foo/work/user", "foo/work/user"]);
        let user = &tree.nodes["foo"].nodes["work"].nodes["user"];
        assert_eq!(user.path.as_deref(), Some("foo/work/user"));
        // A single leaf; no duplicate-path error, no suffixed sibling.
        assert_eq!(tree.nodes.len(), 1);
        assert_eq!(tree.nodes["foo"].nodes["work"].nodes.len(), 1);
    }

    #[test]
    fn same_root_extends_existing_subtree() {
        let tree = tree_from(&["foo/a", "foo/b"]);
        assert_eq!(tree.nodes.len(), 1);
        let foo = &tree.nodes["foo"];
        assert_eq!(foo.nodes.len(), 2);
    }

    #[test]
    fn duplicate_leaf_is_error() {
        // Distinct spellings that collide on the same leaf slot with a path
        // already set (cleaning inside `add` maps both to foo/bar).
        let mut tree = ArchiveTree::default();
        tree.add("foo/bar").unwrap();
        assert!(tree.add("foo/baz/../bar").is_err());
    }

    #[test]
    fn absolute_targets_root_at_slash() {
        let tree = tree_from(&["/home/alice", "/home/bob"]);
        let home = &tree.nodes["home"];
        assert_eq!(home.root, "/");
        assert_eq!(home.nodes.len(), 2);
        assert_eq!(
            home.nodes["alice"].path.as_deref(),
            Some("/home/alice")
        );
    }

    #[test]
    fn empty_target_is_rejected() {
        let mut tree = ArchiveTree::default();
        assert!(tree.add("").is_err());
    }
}
