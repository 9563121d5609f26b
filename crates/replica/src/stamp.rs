use std::ops::{Index, IndexMut};

/// Largest forward distance still considered "newer" in the 8-bit stamp space.
pub const STAMP_MAX_DELTA: u8 = 128;

pub const STAMP_SLOTS: usize = 256;

#[inline]
pub fn is_new_stamp(stamp: u8, reference: u8) -> bool {
    let delta = stamp as i32 - reference as i32;
    match delta {
        0 => false,
        d if d > 0 => d < STAMP_MAX_DELTA as i32,
        d => 255 + d < STAMP_MAX_DELTA as i32,
    }
}

#[inline]
pub fn is_new_or_equal_stamp(stamp: u8, reference: u8) -> bool {
    stamp == reference || is_new_stamp(stamp, reference)
}

/// Per-entity reliability stamp. Zero is reserved for "never stamped".
#[inline]
pub fn next_entity_stamp(stamp: u8) -> u8 {
    if stamp == u8::MAX { 1 } else { stamp + 1 }
}

/// Stamp that skips zero on wrap, used by spawn counters.
#[inline]
pub fn next_nonzero_stamp(stamp: u8) -> u8 {
    match stamp.wrapping_add(1) {
        0 => 1,
        s => s,
    }
}

/// Fixed ring of 256 slots addressed by a wrapping byte stamp.
#[derive(Debug, Clone)]
pub struct StampRing<T> {
    slots: Box<[T]>,
}

impl<T: Default> Default for StampRing<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default> StampRing<T> {
    pub fn new() -> Self {
        Self {
            slots: (0..STAMP_SLOTS).map(|_| T::default()).collect(),
        }
    }

    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = T::default();
        }
    }
}

impl<T> StampRing<T> {
    pub fn get(&self, stamp: u8) -> &T {
        &self.slots[stamp as usize]
    }

    pub fn get_mut(&mut self, stamp: u8) -> &mut T {
        &mut self.slots[stamp as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &T)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(stamp, slot)| (stamp as u8, slot))
    }
}

impl<T> Index<u8> for StampRing<T> {
    type Output = T;

    fn index(&self, stamp: u8) -> &T {
        self.get(stamp)
    }
}

impl<T> IndexMut<u8> for StampRing<T> {
    fn index_mut(&mut self, stamp: u8) -> &mut T {
        self.get_mut(stamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_comparison() {
        assert!(is_new_stamp(2, 1));
        assert!(!is_new_stamp(1, 2));
        assert!(!is_new_stamp(5, 5));
        assert!(is_new_stamp(3, 250));
        assert!(!is_new_stamp(250, 3));
        assert!(!is_new_stamp(200, 10));
    }

    #[test]
    fn test_new_or_equal() {
        assert!(is_new_or_equal_stamp(5, 5));
        assert!(is_new_or_equal_stamp(0, 255));
        assert!(!is_new_or_equal_stamp(4, 5));
    }

    #[test]
    fn entity_stamp_skips_zero() {
        assert_eq!(next_entity_stamp(0), 1);
        assert_eq!(next_entity_stamp(254), 255);
        assert_eq!(next_entity_stamp(255), 1);
        assert_eq!(next_nonzero_stamp(255), 1);
        assert_eq!(next_nonzero_stamp(9), 10);
    }

    #[test]
    fn ring_wraps_on_byte() {
        let mut ring: StampRing<u32> = StampRing::new();
        ring[255] = 7;
        ring[255u8.wrapping_add(1)] = 9;
        assert_eq!(ring[255], 7);
        assert_eq!(ring[0], 9);
        ring.reset();
        assert!(ring.iter().all(|(_, v)| *v == 0));
    }
}
