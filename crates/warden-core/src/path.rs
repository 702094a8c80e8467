//! Segment paths.
//!
//! The pointer namespace is a flat key space with keys of the form
//! `project/segmentIndex/bucket/objectPath`. Paths are kept as strings and
//! only split on demand; most of the core treats them as opaque keys.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Key of a single segment in the pointer namespace.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentPath(String);

impl SegmentPath {
    pub fn new(raw: impl Into<String>) -> Self {
        SegmentPath(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Whether this is the object's last segment (segment index `l`).
    ///
    /// The last segment is written once per object, so it doubles as the
    /// loop's once-per-object dispatch marker.
    pub fn is_last_segment(&self) -> bool {
        self.components().nth(1) == Some("l")
    }

    /// The object this segment belongs to, as `project/bucket/objectPath`.
    ///
    /// Returns `None` for paths with fewer than four components: the first
    /// three are project, segment index, and bucket, and without an object
    /// name there is no object to attribute the segment to.
    pub fn object_key(&self) -> Option<String> {
        let parts: Vec<&str> = self.components().collect();
        if parts.len() < 4 {
            return None;
        }
        Some(format!("{}/{}/{}", parts[0], parts[2], parts[3]))
    }
}

impl fmt::Display for SegmentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SegmentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentPath({})", self.0)
    }
}

impl From<&str> for SegmentPath {
    fn from(raw: &str) -> Self {
        SegmentPath(raw.to_string())
    }
}

impl From<String> for SegmentPath {
    fn from(raw: String) -> Self {
        SegmentPath(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_requires_four_components() {
        let path = SegmentPath::from("project/s0/bucket/photos/cat.jpg");
        assert_eq!(path.object_key().as_deref(), Some("project/bucket/photos"));

        let short = SegmentPath::from("project/s0/bucket");
        assert_eq!(short.object_key(), None);
    }

    #[test]
    fn same_object_for_all_segments() {
        let a = SegmentPath::from("p/s0/b/obj");
        let b = SegmentPath::from("p/s1/b/obj");
        let c = SegmentPath::from("p/l/b/obj");
        assert_eq!(a.object_key(), b.object_key());
        assert_eq!(b.object_key(), c.object_key());
    }

    #[test]
    fn paths_order_lexicographically() {
        let mut paths = vec![
            SegmentPath::from("p/s1/b/obj"),
            SegmentPath::from("p/l/b/obj"),
            SegmentPath::from("p/s0/b/obj"),
        ];
        paths.sort();
        assert_eq!(paths[0].as_str(), "p/l/b/obj");
        assert_eq!(paths[1].as_str(), "p/s0/b/obj");
    }
}
