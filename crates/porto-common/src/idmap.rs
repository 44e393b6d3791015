//! Reusable integer id pool.
//!
//! Containers and volumes draw small unique ids from a shared pool. The id
//! doubles as the key-value store key and as the network traffic-class
//! minor, so released ids must be reusable.

use crate::error::{PortoError, PortoResult};

/// A bitmap-backed pool of ids `1..=capacity`.
#[derive(Debug)]
pub struct IdMap {
    bits: Vec<u64>,
    capacity: u32,
    hint: u32,
}

impl IdMap {
    /// Create a pool holding ids `1..=capacity`.
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        let words = (capacity as usize).div_ceil(64);
        Self {
            bits: vec![0; words],
            capacity,
            hint: 0,
        }
    }

    /// Allocate the lowest free id.
    ///
    /// # Errors
    ///
    /// Returns [`PortoError::ResourceNotAvailable`] when the pool is empty.
    pub fn get(&mut self) -> PortoResult<u32> {
        let start = self.hint;
        for offset in 0..self.capacity {
            let id = (start + offset) % self.capacity + 1;
            if !self.is_taken(id) {
                self.mark(id, true);
                self.hint = id % self.capacity;
                return Ok(id);
            }
        }
        Err(PortoError::ResourceNotAvailable {
            message: format!("id pool exhausted ({} ids)", self.capacity),
        })
    }

    /// Claim a specific id, used when restoring persisted state.
    ///
    /// # Errors
    ///
    /// Returns [`PortoError::Busy`] when the id is already taken and
    /// [`PortoError::InvalidValue`] when it is out of range.
    pub fn get_at(&mut self, id: u32) -> PortoResult<()> {
        if id == 0 || id > self.capacity {
            return Err(PortoError::InvalidValue {
                message: format!("id {id} out of range 1..={}", self.capacity),
            });
        }
        if self.is_taken(id) {
            return Err(PortoError::Busy {
                message: format!("id {id} already taken"),
            });
        }
        self.mark(id, true);
        Ok(())
    }

    /// Return an id to the pool. Releasing a free id is a no-op.
    pub fn put(&mut self, id: u32) {
        if id >= 1 && id <= self.capacity {
            self.mark(id, false);
        }
    }

    /// Whether the id is currently allocated.
    #[must_use]
    pub fn is_taken(&self, id: u32) -> bool {
        let bit = (id - 1) as usize;
        self.bits[bit / 64] & (1 << (bit % 64)) != 0
    }

    fn mark(&mut self, id: u32, taken: bool) {
        let bit = (id - 1) as usize;
        if taken {
            self.bits[bit / 64] |= 1 << (bit % 64);
        } else {
            self.bits[bit / 64] &= !(1 << (bit % 64));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_from_one() {
        let mut pool = IdMap::new(8);
        assert_eq!(pool.get().unwrap(), 1);
        assert_eq!(pool.get().unwrap(), 2);
    }

    #[test]
    fn reuses_released_ids() {
        let mut pool = IdMap::new(4);
        let a = pool.get().unwrap();
        let _b = pool.get().unwrap();
        pool.put(a);
        let ids: Vec<u32> = (0..3).map(|_| pool.get().unwrap()).collect();
        assert!(ids.contains(&a));
        assert!(pool.get().is_err());
    }

    #[test]
    fn restore_claims_specific_ids() {
        let mut pool = IdMap::new(8);
        pool.get_at(5).unwrap();
        assert!(pool.get_at(5).is_err());
        assert!(pool.get_at(9).is_err());
        assert!(pool.is_taken(5));
    }

    #[test]
    fn exhaustion_reports_resource_error() {
        let mut pool = IdMap::new(1);
        pool.get().unwrap();
        assert!(matches!(
            pool.get(),
            Err(PortoError::ResourceNotAvailable { .. })
        ));
    }
}
