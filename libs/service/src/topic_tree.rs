use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::iter::Peekable;
use std::str::Split;

use crate::Message;

struct Node<K, D> {
    multi_wildcard: Option<Box<Node<K, D>>>,
    single_wildcard: Option<Box<Node<K, D>>>,
    children: HashMap<String, Node<K, D>>,
    subscribers: HashMap<K, D>,
    retained: Option<Message>,
}

impl<K, D> Node<K, D> {
    #[inline]
    fn is_empty(&self) -> bool {
        self.multi_wildcard.is_none()
            && self.single_wildcard.is_none()
            && self.children.is_empty()
            && self.subscribers.is_empty()
            && self.retained.is_none()
    }
}

impl<K, D> Default for Node<K, D> {
    fn default() -> Self {
        Self {
            multi_wildcard: None,
            single_wildcard: None,
            children: HashMap::new(),
            subscribers: HashMap::new(),
            retained: None,
        }
    }
}

/// Trie keyed on topic levels.
///
/// `+` and `#` are dedicated child edges. Each node carries the subscriber
/// entries whose filter terminates at that node, and optionally the retained
/// message of the topic the node path spells, so a retained lookup on
/// subscribe walks matched nodes instead of scanning every retained topic.
pub struct TopicTree<K, D> {
    root: Node<K, D>,
    subscriber_count: usize,
    retained_count: usize,
}

impl<K, D> Default for TopicTree<K, D> {
    fn default() -> Self {
        Self {
            root: Node::default(),
            subscriber_count: 0,
            retained_count: 0,
        }
    }
}

impl<K: Eq + Hash, D> TopicTree<K, D> {
    fn node_for_filter<'a>(
        node: &'a mut Node<K, D>,
        mut segments: Peekable<Split<'_, char>>,
    ) -> &'a mut Node<K, D> {
        let segment = segments.next().unwrap();
        let child = match segment {
            "#" => node
                .multi_wildcard
                .get_or_insert_with(|| Box::new(Node::default())),
            "+" => node
                .single_wildcard
                .get_or_insert_with(|| Box::new(Node::default())),
            _ => node.children.entry(segment.to_string()).or_default(),
        };

        if segments.peek().is_none() {
            child
        } else {
            Self::node_for_filter(child, segments)
        }
    }

    /// Idempotent per `(key, filter)`; a re-insert replaces the data and
    /// returns the previous value.
    pub fn insert(&mut self, filter: impl AsRef<str>, key: K, data: D) -> Option<D> {
        let mut segments = filter.as_ref().split('/').peekable();
        assert!(segments.peek().is_some());
        let node = Self::node_for_filter(&mut self.root, segments);
        let prev = node.subscribers.insert(key, data);
        if prev.is_none() {
            self.subscriber_count += 1;
        }
        prev
    }

    fn collect_matches<'a>(
        node: &'a Node<K, D>,
        matched: &mut Vec<&'a Node<K, D>>,
        segments: &[&str],
    ) {
        let (segment, tail) = segments.split_first().unwrap();

        // a `#` edge ends the walk and matches whatever remains
        matched.extend(node.multi_wildcard.as_deref());

        if tail.is_empty() {
            // a `#` child of the last level also matches its parent topic,
            // so `a/#` admits the bare `a`
            if let Some(single) = node.single_wildcard.as_deref() {
                matched.push(single);
                matched.extend(single.multi_wildcard.as_deref());
            }
            if let Some(named) = node.children.get(*segment) {
                matched.push(named);
                matched.extend(named.multi_wildcard.as_deref());
            }
        } else {
            if let Some(single) = node.single_wildcard.as_deref() {
                Self::collect_matches(single, matched, tail);
            }
            if let Some(named) = node.children.get(*segment) {
                Self::collect_matches(named, matched, tail);
            }
        }
    }

    /// Every subscriber entry whose filter admits `topic`. A key reached
    /// through several overlapping filters appears once per filter; the
    /// caller collapses duplicates.
    pub fn matches(&self, topic: impl AsRef<str>) -> impl Iterator<Item = (&K, &D)> {
        let mut matched = Vec::new();
        let segments = topic.as_ref().split('/').collect::<Vec<_>>();
        assert!(!segments.is_empty());
        Self::collect_matches(&self.root, &mut matched, &segments[..]);
        matched
            .into_iter()
            .flat_map(|node| node.subscribers.iter())
    }

    fn remove_from_filter<Q: ?Sized>(
        node: &mut Node<K, D>,
        mut segments: Peekable<Split<'_, char>>,
        key: &Q,
    ) -> Option<D>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        let segment = segments.next().unwrap();
        let child = match segment {
            "#" => node.multi_wildcard.as_deref_mut(),
            "+" => node.single_wildcard.as_deref_mut(),
            _ => node.children.get_mut(segment),
        }?;

        let removed = if segments.peek().is_none() {
            child.subscribers.remove(key)
        } else {
            Self::remove_from_filter(child, segments, key)
        };

        // prune empty nodes bottom-up
        if child.is_empty() {
            match segment {
                "#" => node.multi_wildcard = None,
                "+" => node.single_wildcard = None,
                _ => {
                    node.children.remove(segment);
                }
            }
        }

        removed
    }

    pub fn remove<Q: ?Sized>(&mut self, filter: impl AsRef<str>, key: &Q) -> Option<D>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        let mut segments = filter.as_ref().split('/').peekable();
        assert!(segments.peek().is_some());
        let removed = Self::remove_from_filter(&mut self.root, segments, key);
        if removed.is_some() {
            self.subscriber_count -= 1;
        }
        removed
    }

    fn remove_key_everywhere<Q: ?Sized>(node: &mut Node<K, D>, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        let mut removed = 0;

        if node.subscribers.remove(key).is_some() {
            removed += 1;
        }

        if let Some(multi) = &mut node.multi_wildcard {
            removed += Self::remove_key_everywhere(multi, key);
            if multi.is_empty() {
                node.multi_wildcard = None;
            }
        }

        if let Some(single) = &mut node.single_wildcard {
            removed += Self::remove_key_everywhere(single, key);
            if single.is_empty() {
                node.single_wildcard = None;
            }
        }

        let mut empty_children = Vec::new();
        for (name, child) in &mut node.children {
            removed += Self::remove_key_everywhere(child, key);
            if child.is_empty() {
                empty_children.push(name.to_string());
            }
        }
        for name in empty_children {
            node.children.remove(&name);
        }

        removed
    }

    /// Drop every subscription of `key`, pruning emptied branches.
    pub fn remove_all<Q: ?Sized>(&mut self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        let removed = Self::remove_key_everywhere(&mut self.root, key);
        self.subscriber_count -= removed;
    }

    fn collect_all_retained<'a>(node: &'a Node<K, D>, msgs: &mut Vec<&'a Message>) {
        if let Some(msg) = &node.retained {
            msgs.push(msg);
        }
        for child in node.children.values() {
            Self::collect_all_retained(child, msgs);
        }
    }

    fn collect_retained<'a>(node: &'a Node<K, D>, msgs: &mut Vec<&'a Message>, segments: &[&str]) {
        let (segment, tail) = segments.split_first().unwrap();
        let is_end = tail.is_empty();

        match *segment {
            "#" => Self::collect_all_retained(node, msgs),
            "+" => {
                for child in node.children.values() {
                    if is_end {
                        msgs.extend(child.retained.as_ref());
                    } else {
                        Self::collect_retained(child, msgs, tail);
                    }
                }
            }
            _ => {
                if let Some(child) = node.children.get(*segment) {
                    if is_end {
                        msgs.extend(child.retained.as_ref());
                    } else {
                        Self::collect_retained(child, msgs, tail);
                    }
                }
            }
        }
    }

    /// Walk the retained slots with a subscription filter.
    pub fn retained_matches(&self, filter: impl AsRef<str>) -> impl Iterator<Item = &Message> {
        let mut msgs = Vec::new();
        let segments = filter.as_ref().split('/').collect::<Vec<_>>();
        assert!(!segments.is_empty());
        Self::collect_retained(&self.root, &mut msgs, &segments[..]);
        msgs.into_iter()
    }

    fn set_retained_at(
        node: &mut Node<K, D>,
        mut segments: Peekable<Split<'_, char>>,
        msg: Option<Message>,
    ) -> Option<Message> {
        let segment = segments.next().unwrap();
        let is_end = segments.peek().is_none();
        let is_delete = msg.is_none();

        let child = node.children.entry(segment.to_string()).or_default();

        let prev = if is_end {
            let prev = child.retained.take();
            child.retained = msg;
            prev
        } else {
            Self::set_retained_at(child, segments, msg)
        };

        if is_delete && child.is_empty() {
            node.children.remove(segment);
        }

        prev
    }

    /// Replace (or with `None`, clear) the retained message for a topic,
    /// returning the previous one.
    pub fn set_retained(&mut self, topic: impl AsRef<str>, msg: Option<Message>) -> Option<Message> {
        let mut segments = topic.as_ref().split('/').peekable();
        assert!(segments.peek().is_some());
        let inserting = msg.is_some();
        let prev = Self::set_retained_at(&mut self.root, segments, msg);
        match (&prev, inserting) {
            (None, true) => self.retained_count += 1,
            (Some(_), false) => self.retained_count -= 1,
            _ => {}
        }
        prev
    }

    #[inline]
    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count
    }

    #[inline]
    pub fn retained_count(&self) -> usize {
        self.retained_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::Qos;

    macro_rules! do_matches {
        ($tree:expr, $topic:expr) => {{
            let mut res = $tree.matches($topic).collect::<Vec<_>>();
            res.sort_by(|a, b| a.0.cmp(&b.0));
            res
        }};
    }

    macro_rules! do_retained_matches {
        ($tree:expr, $filter:expr) => {{
            let mut res = $tree
                .retained_matches($filter)
                .map(|msg| &*msg.topic())
                .collect::<Vec<_>>();
            res.sort();
            res
        }};
    }

    #[test]
    fn test_matches() {
        let mut tree = TopicTree::default();

        tree.insert("a/b/c", 1, 1);
        tree.insert("a/+/c", 2, 1);
        tree.insert("d/+", 1, 2);
        tree.insert("#", 3, 1);
        tree.insert("a/#", 4, 1);
        tree.insert("e/+/#", 5, 1);

        assert_eq!(tree.subscriber_count(), 6);

        assert_eq!(
            do_matches!(tree, "a/b/c"),
            vec![(&1, &1), (&2, &1), (&3, &1), (&4, &1)]
        );
        assert_eq!(do_matches!(tree, "d/1"), vec![(&1, &2), (&3, &1)]);
        assert_eq!(do_matches!(tree, "d/1/1"), vec![(&3, &1)]);
        assert_eq!(do_matches!(tree, "a/1"), vec![(&3, &1), (&4, &1)]);

        // `a/#` also admits its parent topic `a`
        assert_eq!(do_matches!(tree, "a"), vec![(&3, &1), (&4, &1)]);
        assert_eq!(do_matches!(tree, "d"), vec![(&3, &1)]);
        assert_eq!(do_matches!(tree, "a/b"), vec![(&3, &1), (&4, &1)]);
        assert_eq!(do_matches!(tree, "e/f"), vec![(&3, &1), (&5, &1)]);
    }

    #[test]
    fn test_overlapping_filters_repeat_the_key() {
        let mut tree = TopicTree::default();

        tree.insert("a/b", "cli", Qos::AtMostOnce);
        tree.insert("a/+", "cli", Qos::ExactlyOnce);

        let matched = tree.matches("a/b").collect::<Vec<_>>();
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn test_insert_replaces() {
        let mut tree = TopicTree::default();

        assert_eq!(tree.insert("a/b", 1, Qos::AtMostOnce), None);
        assert_eq!(
            tree.insert("a/b", 1, Qos::AtLeastOnce),
            Some(Qos::AtMostOnce)
        );
        assert_eq!(tree.subscriber_count(), 1);
    }

    #[test]
    fn test_remove_prunes() {
        let mut tree = TopicTree::default();

        tree.insert("a/b/c", 1, 1);
        tree.insert("a/b", 2, 1);
        assert_eq!(tree.subscriber_count(), 2);

        assert_eq!(tree.remove("a/b", &2), Some(1));
        assert_eq!(tree.subscriber_count(), 1);
        assert!(!tree.root.children.is_empty());

        assert_eq!(tree.remove("a/b/c", &1), Some(1));
        assert_eq!(tree.subscriber_count(), 0);
        assert!(tree.root.children.is_empty());

        tree.insert("a/+/c", 1, 1);
        tree.insert("a/#", 2, 1);
        assert_eq!(tree.remove("a/+/c", &1), Some(1));
        assert_eq!(tree.remove("a/#", &2), Some(1));
        assert!(tree.root.is_empty());
    }

    #[test]
    fn test_remove_all() {
        let mut tree = TopicTree::default();

        tree.insert("a/b/c", 1, 1);
        tree.insert("a/+/c", 2, 1);
        tree.insert("d/+", 1, 2);
        tree.insert("#", 3, 1);
        tree.insert("a/#", 4, 1);

        tree.remove_all(&1);
        assert_eq!(tree.subscriber_count(), 3);

        tree.remove_all(&2);
        tree.remove_all(&3);
        tree.remove_all(&4);
        assert_eq!(tree.subscriber_count(), 0);
        assert!(tree.root.is_empty());
    }

    #[test]
    fn test_retained() {
        let mut tree = TopicTree::<i32, i32>::default();

        tree.set_retained("a/b/c", Some(Message::new("a", Qos::AtMostOnce, &b"123"[..])));
        tree.set_retained("a/k/c", Some(Message::new("d", Qos::AtMostOnce, &b"123"[..])));
        tree.set_retained("a/b", Some(Message::new("b", Qos::AtMostOnce, &b"123"[..])));
        tree.set_retained("b/1", Some(Message::new("c", Qos::AtMostOnce, &b"123"[..])));
        assert_eq!(tree.retained_count(), 4);

        assert_eq!(do_retained_matches!(tree, "a/#"), vec!["a", "b", "d"]);
        assert_eq!(do_retained_matches!(tree, "a/b"), vec!["b"]);
        assert_eq!(do_retained_matches!(tree, "b/+"), vec!["c"]);
        assert_eq!(do_retained_matches!(tree, "#"), vec!["a", "b", "c", "d"]);
        assert_eq!(do_retained_matches!(tree, "a/+/c"), vec!["a", "d"]);

        tree.set_retained("b/1", None);
        tree.set_retained("a/b", None);
        assert_eq!(tree.retained_count(), 2);

        // clearing a topic that holds nothing is a no-op
        tree.set_retained("c", None);
        assert_eq!(tree.retained_count(), 2);

        tree.set_retained("a/b/c", None);
        tree.set_retained("a/k/c", None);
        assert_eq!(tree.retained_count(), 0);
        assert!(tree.root.is_empty());
    }
}
