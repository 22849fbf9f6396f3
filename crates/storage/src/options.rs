use quiver_types::{NodeGroupIdx, NodeOffset, RowIdx};

use crate::error::{Error, Result};

/// Storage engine options.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Rows per chunked node group. Must be a power of two ≤ 65,536.
    pub node_group_capacity: u64,
    /// Whether column chunks use type-specific encoding on flush.
    pub enable_compression: bool,
    /// Skip all file I/O; the primary key index lives in a transient arena.
    pub in_memory: bool,
    /// Fixed page size of the page manager. Must be a power of two.
    pub page_size: u32,
    /// Accumulated WAL bytes after which a checkpoint is due.
    pub checkpoint_threshold_bytes: u64,
    /// Load factor ceiling of the primary key index before slot-page extension.
    pub pk_index_load_factor_max: f64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            node_group_capacity: 2048,
            enable_compression: true,
            in_memory: false,
            page_size: 4096,
            checkpoint_threshold_bytes: 16 * 1024 * 1024,
            pk_index_load_factor_max: 0.75,
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        if !self.node_group_capacity.is_power_of_two() || self.node_group_capacity > 65_536 {
            return Err(Error::InvariantViolation(format!(
                "node_group_capacity must be a power of two <= 65536, got {}",
                self.node_group_capacity
            )));
        }
        if !self.page_size.is_power_of_two() || self.page_size < 512 {
            return Err(Error::InvariantViolation(format!(
                "page_size must be a power of two >= 512, got {}",
                self.page_size
            )));
        }
        if !(0.1..=0.95).contains(&self.pk_index_load_factor_max) {
            return Err(Error::InvariantViolation(format!(
                "pk_index_load_factor_max out of range: {}",
                self.pk_index_load_factor_max
            )));
        }
        Ok(())
    }

    /// The node group a global row offset falls into.
    #[inline]
    pub fn node_group_idx(&self, offset: NodeOffset) -> NodeGroupIdx {
        offset / self.node_group_capacity
    }

    /// The row within its node group of a global row offset.
    #[inline]
    pub fn offset_in_group(&self, offset: NodeOffset) -> RowIdx {
        offset % self.node_group_capacity
    }

    /// The global offset of the first row of a node group.
    #[inline]
    pub fn group_start_offset(&self, group_idx: NodeGroupIdx) -> NodeOffset {
        group_idx * self.node_group_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        Options::default().validate().unwrap();
    }

    #[test]
    fn offset_math() {
        let opts = Options::default();
        assert_eq!(opts.node_group_idx(0), 0);
        assert_eq!(opts.node_group_idx(2048), 1);
        assert_eq!(opts.offset_in_group(2049), 1);
        assert_eq!(opts.group_start_offset(3), 3 * 2048);
    }

    #[test]
    fn bad_capacity_is_rejected() {
        let opts = Options {
            node_group_capacity: 1000,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }
}
