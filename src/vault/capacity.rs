//! Capacity planning for a vault region

use super::region::HEADER_SIZE;
use super::slot::SLOT_SIZE;
use crate::error::{Error, Result};
use tracing::warn;

/// Smallest byte budget the configuration layer accepts
pub const PAGE_SIZE: usize = 4096;

/// Default byte budget, plenty of space for passwords
pub const DEFAULT_BUDGET: usize = 1024 * 1024;

/// How a byte budget splits into header and slots
///
/// Computed once when a region is created; the resulting capacity is written
/// into the region header so every attached handle agrees on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityPlan {
    /// Total bytes of the region
    pub budget: usize,
    /// Number of slots that fit after the header
    pub capacity: usize,
}

impl CapacityPlan {
    /// Plan the slot array for a byte budget
    ///
    /// `capacity = (budget - header) / slot_size`. A budget that cannot hold
    /// the header is a configuration error; a zero capacity is legal but
    /// logged, since such a vault rejects every `add`.
    pub fn for_budget(budget: usize) -> Result<Self> {
        if budget < HEADER_SIZE {
            return Err(Error::Configuration(format!(
                "region budget {} B cannot hold the {} B header",
                budget, HEADER_SIZE
            )));
        }

        let capacity = (budget - HEADER_SIZE) / SLOT_SIZE;
        if capacity == 0 {
            warn!(
                budget,
                slot_size = SLOT_SIZE,
                "Region budget leaves room for zero slots"
            );
        }

        Ok(Self { budget, capacity })
    }

    /// Bytes actually covered by header and slots
    pub fn used_bytes(&self) -> usize {
        HEADER_SIZE + self.capacity * SLOT_SIZE
    }

    /// Trailing bytes too small for another slot
    pub fn slack(&self) -> usize {
        self.budget - self.used_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_budget_capacity() -> Result<()> {
        let plan = CapacityPlan::for_budget(DEFAULT_BUDGET)?;
        assert_eq!(plan.capacity, 780);
        assert!(plan.slack() < SLOT_SIZE);
        Ok(())
    }

    #[test]
    fn test_one_page_budget() -> Result<()> {
        let plan = CapacityPlan::for_budget(PAGE_SIZE)?;
        assert_eq!(plan.capacity, (PAGE_SIZE - HEADER_SIZE) / SLOT_SIZE);
        assert_eq!(plan.capacity, 3);
        Ok(())
    }

    #[test]
    fn test_zero_capacity_is_not_an_error() -> Result<()> {
        let plan = CapacityPlan::for_budget(HEADER_SIZE + SLOT_SIZE - 1)?;
        assert_eq!(plan.capacity, 0);

        let plan = CapacityPlan::for_budget(HEADER_SIZE + SLOT_SIZE)?;
        assert_eq!(plan.capacity, 1);
        assert_eq!(plan.slack(), 0);
        Ok(())
    }

    #[test]
    fn test_budget_smaller_than_header() {
        let err = CapacityPlan::for_budget(HEADER_SIZE - 1).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
