//! Subscription store with trie-based topic matching.
//!
//! Filters are split on `/` into a tree of levels, with dedicated slots for
//! the `+` and `#` wildcards. Mutations go through a [`Transaction`] so that
//! a multi-filter subscribe either fully applies or fully rolls back.

use crate::{PublishHandler, Publication};
use std::collections::HashMap;
use tether_protocol::{Filter, FilterBuf, QoS, Topic};

/// One active subscription.
#[derive(Clone)]
pub(crate) struct Subscription {
	pub filter: FilterBuf,
	pub qos: QoS,
	pub handler: Option<PublishHandler>,
	/// Local subscriptions route matched publications without any broker
	/// involvement and are skipped when the session is re-established.
	pub local: bool,
}

impl std::fmt::Debug for Subscription {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Subscription")
			.field("filter", &self.filter)
			.field("qos", &self.qos)
			.field("local", &self.local)
			.finish()
	}
}

#[derive(Default)]
struct Node {
	/// Subscription terminating at this node, keyed by its full filter.
	subscription: Option<Subscription>,
	/// Child nodes by literal topic level.
	children: HashMap<String, Node>,
	/// Child node for the single-level wildcard.
	single_wildcard: Option<Box<Node>>,
	/// Subscription for the multi-level wildcard ending here.
	multi_wildcard: Option<Subscription>,
}

impl Node {
	fn is_empty(&self) -> bool {
		self.subscription.is_none()
			&& self.children.is_empty()
			&& self.single_wildcard.is_none()
			&& self.multi_wildcard.is_none()
	}

	fn insert(&mut self, levels: &[&str], subscription: Subscription) -> Option<Subscription> {
		let Some((level, remaining)) = levels.split_first() else {
			return self.subscription.replace(subscription);
		};

		match *level {
			"#" => self.multi_wildcard.replace(subscription),
			"+" => self
				.single_wildcard
				.get_or_insert_with(Default::default)
				.insert(remaining, subscription),
			_ => self
				.children
				.entry(level.to_string())
				.or_default()
				.insert(remaining, subscription),
		}
	}

	fn remove(&mut self, levels: &[&str]) -> Option<Subscription> {
		let Some((level, remaining)) = levels.split_first() else {
			return self.subscription.take();
		};

		match *level {
			"#" => self.multi_wildcard.take(),
			"+" => {
				let child = self.single_wildcard.as_mut()?;
				let removed = child.remove(remaining);
				if child.is_empty() {
					self.single_wildcard = None;
				}
				removed
			}
			_ => {
				let child = self.children.get_mut(*level)?;
				let removed = child.remove(remaining);
				if child.is_empty() {
					self.children.remove(*level);
				}
				removed
			}
		}
	}

	fn collect(&self, levels: &[&str], out: &mut Vec<Subscription>) {
		if let Some(subscription) = &self.multi_wildcard {
			// `#` must cover at least the current level.
			if !levels.is_empty() {
				out.push(subscription.clone());
			}
		}

		let Some((level, remaining)) = levels.split_first() else {
			if let Some(subscription) = &self.subscription {
				out.push(subscription.clone());
			}
			return;
		};

		if let Some(child) = &self.single_wildcard {
			child.collect(remaining, out);
		}

		if let Some(child) = self.children.get(*level) {
			child.collect(remaining, out);
		}
	}

	fn walk(&self, out: &mut Vec<(FilterBuf, QoS)>) {
		for subscription in [&self.subscription, &self.multi_wildcard].into_iter().flatten() {
			if !subscription.local {
				out.push((subscription.filter.clone(), subscription.qos));
			}
		}

		if let Some(child) = &self.single_wildcard {
			child.walk(out);
		}

		for child in self.children.values() {
			child.walk(out);
		}
	}
}

pub(crate) struct TopicTree {
	root: Node,
	len: usize,
}

impl TopicTree {
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

	pub fn insert(&mut self, subscription: Subscription) -> Option<Subscription> {
		let levels: Vec<&str> = subscription.filter.levels().collect();
		let displaced = self.root.insert(&levels, subscription.clone());
		if displaced.is_none() {
			self.len += 1;
		}
		displaced
	}

	pub fn remove(&mut self, filter: &Filter) -> Option<Subscription> {
		let levels: Vec<&str> = filter.levels().collect();
		let removed = self.root.remove(&levels);
		if removed.is_some() {
			self.len -= 1;
		}
		removed
	}

	/// Collects every subscription matching `topic`, most recently walked
	/// last. Clones are cheap: handlers are reference counted.
	pub fn matches(&self, topic: &Topic) -> Vec<Subscription> {
		let levels: Vec<&str> = topic.levels().collect();
		let mut out = Vec::new();
		self.root.collect(&levels, &mut out);
		out
	}

	/// Routes a publication to every matching handler. Returns how many
	/// handlers were invoked.
	pub fn dispatch(&self, publication: &Publication) -> usize {
		let matches = self.matches(&publication.topic);
		let mut dispatched = 0;
		for subscription in &matches {
			if let Some(handler) = &subscription.handler {
				handler(publication);
				dispatched += 1;
			}
		}
		dispatched
	}

	/// The filters a freshly resumed session has to re-establish on the
	/// broker; local subscriptions are excluded.
	pub fn remote_filters(&self) -> Vec<(FilterBuf, QoS)> {
		let mut out = Vec::new();
		self.root.walk(&mut out);
		out
	}

	pub fn transaction(&mut self) -> Transaction<'_> {
		Transaction {
			tree: self,
			undo: Vec::new(),
			committed: false,
		}
	}
}

enum Undo {
	/// Reverse of an insert: remove the filter, restoring anything the
	/// insert displaced.
	Deinsert(FilterBuf, Option<Subscription>),
	/// Reverse of a remove: put the subscription back.
	Reinsert(Subscription),
}

/// A batch of tree mutations that roll back unless committed.
pub(crate) struct Transaction<'t> {
	tree: &'t mut TopicTree,
	undo: Vec<Undo>,
	committed: bool,
}

impl Transaction<'_> {
	pub fn insert(&mut self, subscription: Subscription) {
		let filter = subscription.filter.clone();
		let displaced = self.tree.insert(subscription);
		self.undo.push(Undo::Deinsert(filter, displaced));
	}

	pub fn remove(&mut self, filter: &Filter) -> Option<Subscription> {
		let removed = self.tree.remove(filter)?;
		self.undo.push(Undo::Reinsert(removed.clone()));
		Some(removed)
	}

	pub fn commit(mut self) {
		self.committed = true;
	}
}

impl Drop for Transaction<'_> {
	fn drop(&mut self) {
		if self.committed {
			return;
		}

		for undo in self.undo.drain(..).rev() {
			match undo {
				Undo::Deinsert(filter, displaced) => {
					self.tree.remove(&filter);
					if let Some(subscription) = displaced {
						self.tree.insert(subscription);
					}
				}
				Undo::Reinsert(subscription) => {
					self.tree.insert(subscription);
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	};
	use tether_protocol::TopicBuf;

	fn subscription(filter: &str) -> Subscription {
		Subscription {
			filter: FilterBuf::new(filter).unwrap(),
			qos: QoS::AtLeastOnce,
			handler: None,
			local: false,
		}
	}

	fn counting(filter: &str, hits: &Arc<AtomicUsize>) -> Subscription {
		let hits = Arc::clone(hits);
		Subscription {
			handler: Some(Arc::new(move |_| {
				hits.fetch_add(1, Ordering::SeqCst);
			})),
			..subscription(filter)
		}
	}

	fn filters(tree: &TopicTree, topic: &str) -> Vec<String> {
		let mut names: Vec<String> = tree
			.matches(&TopicBuf::new(topic).unwrap())
			.into_iter()
			.map(|s| s.filter.to_string())
			.collect();
		names.sort();
		names
	}

	#[test]
	fn matches_exact_and_wildcards() {
		let mut tree = TopicTree::new();
		tree.insert(subscription("sensors/temp"));
		tree.insert(subscription("sensors/+/reading"));
		tree.insert(subscription("sensors/#"));
		tree.insert(subscription("+"));

		assert_eq!(
			filters(&tree, "sensors/temp"),
			["sensors/#", "sensors/temp"]
		);
		assert_eq!(
			filters(&tree, "sensors/a/reading"),
			["sensors/#", "sensors/+/reading"]
		);
		assert_eq!(filters(&tree, "sensors"), ["+"]);
		assert!(filters(&tree, "actuators/light").is_empty());
	}

	#[test]
	fn insert_replaces_same_filter() {
		let mut tree = TopicTree::new();
		assert!(tree.insert(subscription("a/b")).is_none());
		assert!(tree.insert(subscription("a/b")).is_some());
		assert_eq!(tree.len(), 1);
	}

	#[test]
	fn subscribe_then_unsubscribe_restores_the_tree() {
		let mut tree = TopicTree::new();
		tree.insert(subscription("keep/this"));

		tree.insert(subscription("a/b/c"));
		tree.insert(subscription("a/+/#"));
		assert_eq!(tree.len(), 3);

		tree.remove(Filter::new("a/b/c").unwrap());
		tree.remove(Filter::new("a/+/#").unwrap());

		assert_eq!(tree.len(), 1);
		assert_eq!(filters(&tree, "keep/this"), ["keep/this"]);
		// Pruning leaves no husk nodes behind.
		assert_eq!(tree.root.children.len(), 1);
		assert!(tree.root.single_wildcard.is_none());
	}

	#[test]
	fn dropped_transaction_rolls_back() {
		let mut tree = TopicTree::new();
		tree.insert(subscription("existing"));

		{
			let mut tx = tree.transaction();
			tx.insert(subscription("a/b"));
			tx.insert(subscription("c/d"));
			assert!(tx.remove(Filter::new("existing").unwrap()).is_some());
			// No commit.
		}

		assert_eq!(tree.len(), 1);
		assert_eq!(filters(&tree, "existing"), ["existing"]);
		assert!(filters(&tree, "a/b").is_empty());
	}

	#[test]
	fn committed_transaction_sticks() {
		let mut tree = TopicTree::new();

		let mut tx = tree.transaction();
		tx.insert(subscription("a/b"));
		tx.insert(subscription("c/#"));
		tx.commit();

		assert_eq!(tree.len(), 2);
		assert_eq!(filters(&tree, "c/anything"), ["c/#"]);
	}

	#[test]
	fn rollback_restores_displaced_subscription() {
		let mut tree = TopicTree::new();
		tree.insert(Subscription {
			qos: QoS::ExactlyOnce,
			..subscription("a/b")
		});

		{
			let mut tx = tree.transaction();
			tx.insert(subscription("a/b"));
		}

		assert_eq!(tree.len(), 1);
		let matched = tree.matches(&TopicBuf::new("a/b").unwrap());
		assert_eq!(matched[0].qos, QoS::ExactlyOnce);
	}

	#[test]
	fn dispatch_invokes_matching_handlers() {
		let hits = Arc::new(AtomicUsize::new(0));
		let mut tree = TopicTree::new();
		tree.insert(counting("s/#", &hits));
		tree.insert(counting("s/x", &hits));
		tree.insert(counting("other", &hits));

		let publication = Publication {
			topic: TopicBuf::new("s/x").unwrap(),
			payload: Default::default(),
			qos: QoS::AtMostOnce,
			retain: false,
			duplicate: false,
		};
		assert_eq!(tree.dispatch(&publication), 2);
		assert_eq!(hits.load(Ordering::SeqCst), 2);
	}

	#[test]
	fn remote_filters_skip_local_subscriptions() {
		let mut tree = TopicTree::new();
		tree.insert(subscription("a/b"));
		tree.insert(Subscription {
			local: true,
			..subscription("local/only")
		});

		let filters = tree.remote_filters();
		assert_eq!(filters.len(), 1);
		assert_eq!(filters[0].0.as_str(), "a/b");
	}
}
