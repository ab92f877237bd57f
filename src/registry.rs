//! Append-only name registry (spec §3 "Name registry").
//!
//! Keeps location keys compact: a durable operation references its name by a
//! stable, insertion-ordered index rather than the name string itself.
//! `flushed_count` lets the storage mirror persist only the tail of names
//! added since the last flush.

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct NameRegistry {
	names: Vec<String>,
	index_of: HashMap<String, usize>,
	flushed_count: usize,
}

impl NameRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_persisted(names: Vec<String>) -> Self {
		let index_of = names
			.iter()
			.enumerate()
			.map(|(i, n)| (n.clone(), i))
			.collect();
		let flushed_count = names.len();
		NameRegistry {
			names,
			index_of,
			flushed_count,
		}
	}

	/// Returns the index for `name`, assigning a fresh one if this is the first
	/// time it's seen. Never mutates or reorders existing indices.
	pub fn index_of(&mut self, name: &str) -> usize {
		if let Some(&idx) = self.index_of.get(name) {
			return idx;
		}
		let idx = self.names.len();
		self.names.push(name.to_string());
		self.index_of.insert(name.to_string(), idx);
		idx
	}

	pub fn name_at(&self, index: usize) -> Option<&str> {
		self.names.get(index).map(|s| s.as_str())
	}

	pub fn names(&self) -> &[String] {
		&self.names
	}

	/// Names appended since the last flush.
	pub fn unflushed_tail(&self) -> &[String] {
		&self.names[self.flushed_count..]
	}

	pub fn mark_flushed(&mut self) {
		self.flushed_count = self.names.len();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn assigns_stable_sequential_indices() {
		let mut reg = NameRegistry::new();
		assert_eq!(reg.index_of("a"), 0);
		assert_eq!(reg.index_of("b"), 1);
		assert_eq!(reg.index_of("a"), 0);
		assert_eq!(reg.name_at(1), Some("b"));
	}

	#[test]
	fn tracks_unflushed_tail() {
		let mut reg = NameRegistry::new();
		reg.index_of("a");
		reg.index_of("b");
		assert_eq!(reg.unflushed_tail(), &["a".to_string(), "b".to_string()]);
		reg.mark_flushed();
		assert!(reg.unflushed_tail().is_empty());
		reg.index_of("c");
		assert_eq!(reg.unflushed_tail(), &["c".to_string()]);
	}
}
