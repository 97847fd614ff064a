use serde::{Deserialize, Serialize};

use crate::types::Version;

/// Geometry of raw batch archives: a batch is `batch_size` pages of
/// `page_size` versions each, identified by a zero-based index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatchLayout {
    pub page_size: u64,
    pub batch_size: u64,
}

impl Default for BatchLayout {
    fn default() -> Self {
        Self {
            page_size: 100,
            batch_size: 100,
        }
    }
}

impl BatchLayout {
    pub fn new(page_size: u64, batch_size: u64) -> Self {
        Self {
            page_size: page_size.max(2),
            batch_size: batch_size.max(1),
        }
    }

    /// First version covered by batch `index`.
    pub fn index_start(&self, index: u64) -> Version {
        index * self.batch_size * self.page_size
    }

    /// `"from-to"` range label used as the archive name for batch `index`.
    pub fn index_dir(&self, index: u64) -> String {
        let from = self.index_start(index);
        let to = from + (self.page_size - 1) * self.batch_size;
        format!("{from}-{to}")
    }

    /// Batch index that owns `version`. Version 0 belongs to batch 0.
    pub fn batch_index(&self, version: Version) -> u64 {
        if version == 0 {
            return 0;
        }
        (version - 1) / ((self.page_size - 1) * self.batch_size)
    }

    pub fn is_last_version_of_batch(&self, version: Version) -> bool {
        version % (self.page_size * self.batch_size) == (self.page_size - 1) * self.batch_size
    }

    /// Number of complete batches below the ledger tip.
    pub fn expected_batches(&self, tip: Version) -> u64 {
        (tip / self.page_size) / self.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_labels() {
        let layout = BatchLayout::default();
        assert_eq!(layout.index_dir(0), "0-9900");
        assert_eq!(layout.index_dir(1), "10000-19900");
    }

    #[test]
    fn single_batch_layout_labels() {
        // tip=250, page_size=100, batch_size=1: batch 0 covers the first
        // 100-wide page and is labelled 0-99.
        let layout = BatchLayout::new(100, 1);
        assert_eq!(layout.index_dir(0), "0-99");
        assert_eq!(layout.expected_batches(250), 2);
    }

    #[test]
    fn version_zero_maps_to_batch_zero() {
        let layout = BatchLayout::default();
        assert_eq!(layout.batch_index(0), 0);
        assert_eq!(layout.batch_index(1), 0);
    }

    #[test]
    fn batch_index_inverts_its_stride() {
        let layout = BatchLayout::default();
        let stride = (layout.page_size - 1) * layout.batch_size;
        for index in 0..5u64 {
            for version in [index * stride + 1, (index + 1) * stride] {
                assert_eq!(layout.batch_index(version), index, "version {version}");
            }
        }
    }

    #[test]
    fn last_version_of_batch() {
        let layout = BatchLayout::default();
        assert!(layout.is_last_version_of_batch(9900));
        assert!(!layout.is_last_version_of_batch(9901));
        assert!(layout.is_last_version_of_batch(19900));
    }

    #[test]
    fn expected_batches_at_tip() {
        let layout = BatchLayout::default();
        assert_eq!(layout.expected_batches(9_999), 0);
        assert_eq!(layout.expected_batches(10_000), 1);
        assert_eq!(layout.expected_batches(25_000), 2);
    }
}
