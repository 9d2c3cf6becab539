//! Topic trie with MQTT style wildcards.
//!
//! Patterns are `/` separated. `+` matches exactly one level, `#` matches the
//! remaining levels (zero or more) and may only appear last. Topics starting
//! with `$` are never matched by a wildcard in the first level.

use std::collections::HashMap;

struct Node<T> {
    children: HashMap<String, Node<T>>,
    value: Option<T>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            value: None,
        }
    }
}

impl<T> Node<T> {
    fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }
}

/// Maps topic patterns to values and finds every pattern matching a topic.
pub struct TopicMatcher<T> {
    root: Node<T>,
    len: usize,
}

impl<T> Default for TopicMatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TopicMatcher<T> {
    pub fn new() -> Self {
        Self {
            root: Node::default(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert or replace the value stored under `pattern`.
    pub fn insert(&mut self, pattern: &str, value: T) -> Option<T> {
        let mut node = &mut self.root;
        for level in pattern.split('/') {
            node = node.children.entry(level.to_string()).or_default();
        }
        let old = node.value.replace(value);
        if old.is_none() {
            self.len += 1;
        }
        old
    }

    /// Value stored under the exact pattern.
    pub fn get(&self, pattern: &str) -> Option<&T> {
        let mut node = &self.root;
        for level in pattern.split('/') {
            node = node.children.get(level)?;
        }
        node.value.as_ref()
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.get(pattern).is_some()
    }

    /// Remove the value stored under `pattern`, pruning emptied branches.
    pub fn remove(&mut self, pattern: &str) -> Option<T> {
        let levels: Vec<&str> = pattern.split('/').collect();
        let removed = Self::remove_rec(&mut self.root, &levels);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    fn remove_rec(node: &mut Node<T>, levels: &[&str]) -> Option<T> {
        let Some((first, rest)) = levels.split_first() else {
            return node.value.take();
        };
        let child = node.children.get_mut(*first)?;
        let removed = Self::remove_rec(child, rest);
        if child.is_empty() {
            node.children.remove(*first);
        }
        removed
    }

    /// All values whose pattern matches the concrete `topic`.
    pub fn matches(&self, topic: &str) -> Vec<&T> {
        let levels: Vec<&str> = topic.split('/').collect();
        let normal = !topic.starts_with('$');
        let mut out = Vec::new();
        Self::match_rec(&self.root, &levels, 0, normal, &mut out);
        out
    }

    fn match_rec<'a>(node: &'a Node<T>, levels: &[&str], i: usize, normal: bool, out: &mut Vec<&'a T>) {
        let wildcard_ok = normal || i > 0;
        if i == levels.len() {
            if let Some(v) = &node.value {
                out.push(v);
            }
        } else {
            if let Some(child) = node.children.get(levels[i]) {
                Self::match_rec(child, levels, i + 1, normal, out);
            }
            if wildcard_ok && let Some(child) = node.children.get("+") {
                Self::match_rec(child, levels, i + 1, normal, out);
            }
        }
        if wildcard_ok && let Some(v) = node.children.get("#").and_then(|c| c.value.as_ref()) {
            out.push(v);
        }
    }

    /// Every stored pattern with its value.
    pub fn iter_all(&self) -> Vec<(String, &T)> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        Self::collect_rec(&self.root, &mut path, &mut out);
        out
    }

    /// Stored patterns that start with the given literal prefix levels.
    pub fn iter_prefix(&self, prefix: &str) -> Vec<(String, &T)> {
        let mut node = &self.root;
        let mut path: Vec<&str> = Vec::new();
        for level in prefix.split('/').filter(|l| !l.is_empty()) {
            match node.children.get_key_value(level) {
                Some((key, child)) => {
                    node = child;
                    path.push(key.as_str());
                }
                None => return Vec::new(),
            }
        }
        let mut out = Vec::new();
        Self::collect_rec(node, &mut path, &mut out);
        out
    }

    fn collect_rec<'a>(node: &'a Node<T>, path: &mut Vec<&'a str>, out: &mut Vec<(String, &'a T)>) {
        if let Some(v) = &node.value {
            out.push((path.join("/"), v));
        }
        for (level, child) in &node.children {
            path.push(level.as_str());
            Self::collect_rec(child, path, out);
            path.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(mut v: Vec<&i32>) -> Vec<i32> {
        v.sort();
        v.into_iter().copied().collect()
    }

    #[test]
    fn exact_and_wildcard_matches() {
        let mut m = TopicMatcher::new();
        m.insert("123/p/2/1", 1);
        m.insert("123/p/#", 2);
        m.insert("123/+/2/1", 3);
        m.insert("456/p/2/1", 4);
        m.insert("#", 5);

        assert_eq!(sorted(m.matches("123/p/2/1")), vec![1, 2, 3, 5]);
        assert_eq!(sorted(m.matches("123/e/2/1")), vec![3, 5]);
        assert_eq!(sorted(m.matches("123/p")), vec![2, 5]);
        assert_eq!(sorted(m.matches("789")), vec![5]);
    }

    #[test]
    fn dollar_topics_skip_leading_wildcards() {
        let mut m = TopicMatcher::new();
        m.insert("#", 1);
        m.insert("+/x", 2);
        m.insert("$SYS/#", 3);
        assert_eq!(sorted(m.matches("$SYS/x")), vec![3]);
    }

    #[test]
    fn insert_replace_and_remove_prunes() {
        let mut m = TopicMatcher::new();
        assert_eq!(m.insert("a/b/c", 1), None);
        assert_eq!(m.insert("a/b/c", 2), Some(1));
        m.insert("a/b", 3);
        assert_eq!(m.len(), 2);

        assert_eq!(m.remove("a/b/c"), Some(2));
        assert_eq!(m.remove("a/b/c"), None);
        assert!(m.matches("a/b/c").is_empty());
        assert_eq!(m.get("a/b"), Some(&3));
        assert_eq!(m.remove("a/b"), Some(3));
        assert!(m.is_empty());
        assert!(m.root.children.is_empty());
    }

    #[test]
    fn iterates_patterns_and_prefixes() {
        let mut m = TopicMatcher::new();
        m.insert("1/p/2/1", ());
        m.insert("1/e/3/1", ());
        m.insert("2/p/#", ());

        let mut all: Vec<String> = m.iter_all().into_iter().map(|(k, _)| k).collect();
        all.sort();
        assert_eq!(all, vec!["1/e/3/1", "1/p/2/1", "2/p/#"]);

        let mut one: Vec<String> = m.iter_prefix("1").into_iter().map(|(k, _)| k).collect();
        one.sort();
        assert_eq!(one, vec!["1/e/3/1", "1/p/2/1"]);
        assert!(m.iter_prefix("3").is_empty());
    }
}
