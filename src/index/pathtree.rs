//! Path prefix compression
//!
//! Manifest paths are stored as arrays of interned components. Sibling
//! entries almost always share a leading directory (`pkg-1.0/src/...`), so
//! at every level of the tree the common directory prefix of the children is
//! pulled out into its own component and shared through the string pool.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use thiserror::Error;

/// A path collided with an existing leaf or directory
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("path {path:?} conflicts with an existing entry")]
pub struct TreeConflict {
    pub path: Vec<String>,
}

#[derive(Debug)]
enum Node {
    Dir(BTreeMap<String, Node>),
    Leaf(i64),
}

/// Longest common prefix of two strings, compared by characters
pub fn longest_common_prefix<'s>(a: &'s str, b: &str) -> &'s str {
    let end = a
        .char_indices()
        .zip(b.chars())
        .find(|((_, ca), cb)| ca != cb)
        .map(|((i, _), _)| i)
        .unwrap_or_else(|| a.len().min(b.len()));
    &a[..end]
}

/// Shared directory prefix of a set of names, including the trailing `/`;
/// empty when there is none
pub fn common_prefix<'s, I>(strings: I) -> String
where
    I: IntoIterator<Item = &'s str>,
{
    let mut iter = strings.into_iter();
    let mut prefix = match iter.next() {
        Some(first) => first,
        None => return String::new(),
    };
    for s in iter {
        if s.starts_with(prefix) {
            continue;
        }
        prefix = longest_common_prefix(prefix, s);
    }

    match prefix.rfind('/') {
        Some(slash) => prefix[..=slash].to_string(),
        None => String::new(),
    }
}

fn strip(children: BTreeMap<String, Node>, prefix: &str) -> BTreeMap<String, Node> {
    if prefix.is_empty() {
        return children;
    }
    children
        .into_iter()
        .map(|(key, node)| (key[prefix.len()..].to_string(), node))
        .collect()
}

fn flatten(dir: BTreeMap<String, Node>, so_far: &mut Vec<String>, out: &mut Vec<(Vec<String>, i64)>) {
    for (key, node) in dir {
        match node {
            Node::Leaf(pos) => {
                let mut path = so_far.clone();
                path.push(key);
                out.push((path, pos));
            }
            Node::Dir(children) => {
                let prefix = common_prefix(children.keys().map(String::as_str));
                let children = strip(children, &prefix);
                so_far.push(key);
                so_far.push(prefix);
                flatten(children, so_far, out);
                so_far.truncate(so_far.len() - 2);
            }
        }
    }
}

/// In-memory tree of one manifest's paths, leaves holding blob positions
#[derive(Debug, Default)]
pub struct PathTree {
    root: BTreeMap<String, Node>,
    leaves: usize,
}

impl PathTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.leaves
    }

    pub fn is_empty(&self) -> bool {
        self.leaves == 0
    }

    /// Add a leaf. A path that runs through an existing leaf, or lands on
    /// an existing entry, is rejected and the tree is left unchanged.
    pub fn insert(&mut self, path: &[String], pos: i64) -> Result<(), TreeConflict> {
        let conflict = || TreeConflict {
            path: path.to_vec(),
        };
        let Some((last, dirs)) = path.split_last() else {
            return Err(conflict());
        };

        // check before mutating so a conflict leaves no empty directories
        let mut cursor = &self.root;
        for segment in dirs {
            match cursor.get(segment) {
                Some(Node::Dir(children)) => cursor = children,
                Some(Node::Leaf(_)) => return Err(conflict()),
                None => break,
            }
        }

        let mut dir = &mut self.root;
        for segment in dirs {
            let node = dir
                .entry(segment.clone())
                .or_insert_with(|| Node::Dir(BTreeMap::new()));
            dir = match node {
                Node::Dir(children) => children,
                Node::Leaf(_) => return Err(conflict()),
            };
        }

        match dir.entry(last.clone()) {
            Entry::Occupied(_) => Err(conflict()),
            Entry::Vacant(slot) => {
                slot.insert(Node::Leaf(pos));
                self.leaves += 1;
                Ok(())
            }
        }
    }

    /// Flatten into `(segments, position)` pairs with prefixes pulled out.
    /// The root's prefix appears only when non-empty; every directory below
    /// it contributes a prefix segment, possibly `""`.
    pub fn into_compressed(self) -> Vec<(Vec<String>, i64)> {
        let prefix = common_prefix(self.root.keys().map(String::as_str));
        let root = strip(self.root, &prefix);

        let mut so_far = Vec::new();
        if !prefix.is_empty() {
            so_far.push(prefix);
        }

        let mut out = Vec::with_capacity(self.leaves);
        flatten(root, &mut so_far, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segs(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn tree(entries: &[(&[&str], i64)]) -> PathTree {
        let mut tree = PathTree::new();
        for (path, pos) in entries {
            tree.insert(&segs(path), *pos).unwrap();
        }
        tree
    }

    #[test]
    fn test_longest_common_prefix() {
        assert_eq!(longest_common_prefix("foo", "bar"), "");
        assert_eq!(longest_common_prefix("foo", "food"), "foo");
        assert_eq!(longest_common_prefix("abcd", "abfd"), "ab");
        assert_eq!(longest_common_prefix("héllo", "hélp"), "hél");
    }

    #[test]
    fn test_common_prefix() {
        assert_eq!(common_prefix(["foo/bar", "foo/baz"]), "foo/");
        assert_eq!(common_prefix(Vec::<&str>::new()), "");
        assert_eq!(common_prefix(["one/two"]), "one/");
        assert_eq!(common_prefix(["one/two", "one"]), "");
        assert_eq!(common_prefix(["one/two", "two"]), "");
        assert_eq!(common_prefix(["a/b/c", "a/b/d", "a/e"]), "a/");
    }

    #[test]
    fn test_root_prefix_is_emitted_when_shared() {
        let out = tree(&[(&["a/b"], 3), (&["a/c"], 4)]).into_compressed();
        assert_eq!(out, vec![(segs(&["a/", "b"]), 3), (segs(&["a/", "c"]), 4)]);
    }

    #[test]
    fn test_nested_prefix() {
        let out = tree(&[(&["a", "b/c"], 3), (&["a", "b/d"], 4)]).into_compressed();
        assert_eq!(
            out,
            vec![(segs(&["a", "b/", "c"]), 3), (segs(&["a", "b/", "d"]), 4)]
        );
    }

    #[test]
    fn test_inner_directory_always_emits_prefix() {
        let out = tree(&[(&["x.tar", "README"], 1), (&["x.tar", "COPYING"], 2)]).into_compressed();
        assert_eq!(
            out,
            vec![
                (segs(&["x.tar", "", "COPYING"]), 2),
                (segs(&["x.tar", "", "README"]), 1),
            ]
        );
    }

    #[test]
    fn test_flat_root_is_unchanged() {
        let out = tree(&[(&["a"], 1), (&["b"], 2), (&["c"], 3)]).into_compressed();
        assert_eq!(
            out,
            vec![(segs(&["a"]), 1), (segs(&["b"]), 2), (segs(&["c"]), 3)]
        );
    }

    #[test]
    fn test_package_layout() {
        let out = tree(&[
            (&["some.dsc"], 0),
            (&["foo.tar", "foo-1337/Makefile"], 1),
            (&["foo.tar", "foo-1337/src/main.c"], 2),
            (&["foo.tar", "foo-1337/some.jar", "META-INF/MANIFEST.MF"], 3),
        ])
        .into_compressed();

        assert_eq!(
            out,
            vec![
                (segs(&["foo.tar", "foo-1337/", "Makefile"]), 1),
                (
                    segs(&["foo.tar", "foo-1337/", "some.jar", "META-INF/", "MANIFEST.MF"]),
                    3
                ),
                (segs(&["foo.tar", "foo-1337/", "src/main.c"]), 2),
                (segs(&["some.dsc"]), 0),
            ]
        );
    }

    #[test]
    fn test_conflicts_are_rejected_without_side_effects() {
        let mut tree = tree(&[(&["a.tar"], 1)]);
        assert!(tree.insert(&segs(&["a.tar", "inner"]), 2).is_err());
        assert!(tree.insert(&segs(&["a.tar"]), 3).is_err());
        assert!(tree.insert(&[], 4).is_err());

        tree.insert(&segs(&["d", "x"]), 5).unwrap();
        assert!(tree.insert(&segs(&["d"]), 6).is_err());
        assert_eq!(tree.len(), 2);
    }
}
