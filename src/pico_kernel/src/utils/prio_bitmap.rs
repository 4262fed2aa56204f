//! A one-word bit array tracking which priority levels have runnable tasks,
//! supporting constant-time highest-set-bit scans.
use core::fmt;

use super::Init;

/// A bit set over the priority levels `0..`[`MAX_PRIORITY_LEVELS`], bit `i`
/// meaning "at least one Ready task exists at priority `i`".
///
/// All methods panic when the given bit position is out of range.
///
/// [`MAX_PRIORITY_LEVELS`]: crate::MAX_PRIORITY_LEVELS
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct PrioBitmap {
    bits: u32,
}

impl Init for PrioBitmap {
    const INIT: Self = Self { bits: 0 };
}

impl fmt::Debug for PrioBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..u32::BITS as usize).filter(|&i| self.get(i)))
            .finish()
    }
}

impl PrioBitmap {
    /// Get the bit at the specified position.
    pub(crate) fn get(&self, i: usize) -> bool {
        assert!(i < u32::BITS as usize);
        (self.bits >> i) & 1 != 0
    }

    /// Set the bit at the specified position.
    pub(crate) fn set(&mut self, i: usize) {
        assert!(i < u32::BITS as usize);
        self.bits |= 1 << i;
    }

    /// Clear the bit at the specified position.
    pub(crate) fn clear(&mut self, i: usize) {
        assert!(i < u32::BITS as usize);
        self.bits &= !(1 << i);
    }

    /// Get the position of the most significant set bit — the highest
    /// priority level with a runnable task.
    pub(crate) fn find_highest(&self) -> Option<usize> {
        if self.bits == 0 {
            None
        } else {
            Some((u32::BITS - 1 - self.bits.leading_zeros()) as usize)
        }
    }

    /// Iterate over the set bit positions, highest first.
    pub(crate) fn iter_down(&self) -> impl Iterator<Item = usize> {
        let mut bits = self.bits;
        core::iter::from_fn(move || {
            if bits == 0 {
                None
            } else {
                let i = (u32::BITS - 1 - bits.leading_zeros()) as usize;
                bits &= !(1 << i);
                Some(i)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;

    /// A `BTreeSet`-backed reference implementation.
    struct SetBitmap(BTreeSet<usize>);

    impl SetBitmap {
        fn find_highest(&self) -> Option<usize> {
            self.0.iter().next_back().cloned()
        }
    }

    /// A modifying operation on `PrioBitmap`.
    #[derive(Debug)]
    enum Cmd {
        Insert(usize),
        Remove(usize),
    }

    /// Map random bytes to operations on `PrioBitmap`.
    fn interpret(bytecode: &[u8]) -> impl Iterator<Item = Cmd> + '_ {
        let mut i = 0;
        let mut known_set_bits = Vec::new();
        std::iter::from_fn(move || {
            if let Some(instr) = bytecode.get(i..i + 2) {
                i += 2;

                if instr[0] % 2 == 0 || known_set_bits.is_empty() {
                    let bit = instr[1] as usize % 32;
                    known_set_bits.push(bit);
                    Some(Cmd::Insert(bit))
                } else {
                    let j = instr[1] as usize % known_set_bits.len();
                    let bit = known_set_bits.swap_remove(j);
                    Some(Cmd::Remove(bit))
                }
            } else {
                None
            }
        })
    }

    #[quickcheck]
    fn matches_reference(bytecode: Vec<u8>) {
        let mut subject = PrioBitmap::INIT;
        let mut reference = SetBitmap(BTreeSet::new());

        for cmd in interpret(&bytecode) {
            match cmd {
                Cmd::Insert(bit) => {
                    subject.set(bit);
                    reference.0.insert(bit);
                }
                Cmd::Remove(bit) => {
                    subject.clear(bit);
                    reference.0.remove(&bit);
                }
            }

            assert_eq!(subject.find_highest(), reference.find_highest());
        }

        let set_bits: Vec<usize> = (0..32).filter(|&i| subject.get(i)).collect();
        let reference_bits: Vec<usize> = reference.0.iter().cloned().collect();
        assert_eq!(set_bits, reference_bits);
        assert_eq!(
            subject.iter_down().collect::<Vec<_>>(),
            reference.0.iter().rev().cloned().collect::<Vec<_>>()
        );
    }

    #[test]
    fn empty() {
        assert_eq!(PrioBitmap::INIT.find_highest(), None);
        assert_eq!(PrioBitmap::INIT.iter_down().count(), 0);
    }
}
