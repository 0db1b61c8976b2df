//! Link identifier type

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier assigned by a link binding to each accepted link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkId(pub u32);

impl LinkId {
    /// Create a new link ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

impl From<u32> for LinkId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_id_display() {
        let id = LinkId::new(42);
        assert_eq!(format!("{}", id), "link-42");
    }

    #[test]
    fn test_link_id_ordering() {
        assert!(LinkId::new(1) < LinkId::new(2));
        assert_eq!(LinkId::from(7), LinkId::new(7));
    }
}
