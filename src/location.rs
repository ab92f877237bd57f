//! Location algebra (spec §4.1).
//!
//! A location is a path into the execution tree: an ordered list of segments,
//! each either a name-registry index or a loop-iteration marker. Locations
//! canonicalize to a stable string key used for map lookups, prefix deletes,
//! and dashboard snapshot identifiers. The canonical encoding chosen here
//! (`/`-joined, iteration markers as `<loop>~<iteration>`) is fixed forever by
//! on-disk compatibility once a driver starts persisting it — the spec permits
//! any unambiguous encoding, this is the one this crate commits to.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Segment {
	Name(usize),
	LoopIteration { loop_index: usize, iteration: u64 },
}

impl fmt::Display for Segment {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Segment::Name(idx) => write!(f, "{idx}"),
			Segment::LoopIteration {
				loop_index,
				iteration,
			} => write!(f, "{loop_index}~{iteration}"),
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location(Vec<Segment>);

impl Location {
	pub fn empty() -> Self {
		Location(Vec::new())
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn segments(&self) -> &[Segment] {
		&self.0
	}

	pub fn with_name(&self, name_index: usize) -> Self {
		let mut segs = self.0.clone();
		segs.push(Segment::Name(name_index));
		Location(segs)
	}

	pub fn with_loop_iteration(&self, loop_index: usize, iteration: u64) -> Self {
		let mut segs = self.0.clone();
		segs.push(Segment::LoopIteration {
			loop_index,
			iteration,
		});
		Location(segs)
	}

	/// Canonical string key used for map lookup and prefix delete.
	pub fn to_key(&self) -> String {
		self.0.iter().map(|s| s.to_string()).collect::<Vec<_>>().join("/")
	}

	/// True if `self` is `other` or a descendant of `other` (prefix match on segments).
	pub fn is_under(&self, prefix: &Location) -> bool {
		self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
	}
}

impl fmt::Display for Location {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_key())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_location_is_root() {
		assert_eq!(Location::empty().to_key(), "");
	}

	#[test]
	fn name_segments_render_as_decimal_index() {
		let loc = Location::empty().with_name(0).with_name(3);
		assert_eq!(loc.to_key(), "0/3");
	}

	#[test]
	fn loop_iteration_segment_is_unambiguous() {
		let loc = Location::empty().with_name(2).with_loop_iteration(2, 5);
		assert_eq!(loc.to_key(), "2/2~5");
	}

	#[test]
	fn prefix_matching() {
		let root = Location::empty().with_name(1);
		let child = root.with_name(2);
		assert!(child.is_under(&root));
		assert!(!root.is_under(&child));
		assert!(root.is_under(&root));
	}
}
