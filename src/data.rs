use serde::{Deserialize, Serialize};

use crate::sorter::SortValue;
use crate::value::ValueMap;

/// Marker stored in place of an empty tag list.
///
/// The serialised tag list is never empty: either it carries user tags or
/// exactly this sentinel. Readers substitute the sentinel back to an empty
/// list before handing tags to the caller.
pub(crate) const NO_TAGS: &str = "***NOTAGS***";

/// The in-memory state of one record: the ordered value tree plus the
/// indexing metadata (sort value, secondary key, tags).
///
/// This is what the primary blob serialises. Mutation happens in place under
/// the owning holder's monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapData {
    map: ValueMap,
    sorter: SortValue,
    secondary_key: Option<String>,
    tags: Vec<String>,
}

impl MapData {
    pub fn new() -> Self {
        Self {
            map: ValueMap::new(),
            sorter: SortValue::None,
            secondary_key: None,
            tags: vec![NO_TAGS.to_string()],
        }
    }

    pub fn map(&self) -> &ValueMap {
        &self.map
    }

    pub fn map_mut(&mut self) -> &mut ValueMap {
        &mut self.map
    }

    pub fn sorter(&self) -> &SortValue {
        &self.sorter
    }

    pub fn set_sorter(&mut self, sorter: SortValue) {
        self.sorter = sorter;
    }

    pub fn secondary_key(&self) -> Option<&str> {
        self.secondary_key.as_deref()
    }

    pub fn set_secondary_key(&mut self, secondary_key: Option<String>) {
        self.secondary_key = secondary_key;
    }

    /// Replaces the tag list; an empty list is stored as the sentinel.
    pub fn set_tags(&mut self, tags: Vec<String>) {
        if tags.is_empty() {
            self.tags = vec![NO_TAGS.to_string()];
        } else {
            self.tags = tags;
        }
    }

    /// The stored tag list, sentinel included. This is what the secondary
    /// index receives.
    pub(crate) fn raw_tags(&self) -> &[String] {
        &self.tags
    }

    /// The user-visible tag list, with the sentinel substituted away.
    pub fn tags(&self) -> &[String] {
        if self.tags.len() == 1 && self.tags[0] == NO_TAGS {
            &[]
        } else {
            &self.tags
        }
    }
}

impl Default for MapData {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_payload_carries_the_sentinel() {
        let data = MapData::new();
        assert_eq!(data.raw_tags(), &[NO_TAGS.to_string()]);
        assert!(data.tags().is_empty());
    }

    #[test]
    fn test_clearing_tags_restores_the_sentinel() {
        let mut data = MapData::new();
        data.set_tags(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(data.tags().len(), 2);
        assert_eq!(data.raw_tags().len(), 2);

        data.set_tags(Vec::new());
        assert!(data.tags().is_empty());
        assert_eq!(data.raw_tags(), &[NO_TAGS.to_string()]);
    }

    #[test]
    fn test_blob_round_trip() {
        let mut data = MapData::new();
        data.map_mut().insert("title", "hello");
        data.set_sorter(SortValue::Int(5));
        data.set_secondary_key(Some("alt".to_string()));
        data.set_tags(vec!["news".to_string()]);

        let bytes = bincode::serialize(&data).unwrap();
        let back: MapData = bincode::deserialize(&bytes).unwrap();
        assert_eq!(data, back);
    }
}
