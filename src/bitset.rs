use core::fmt;

use crate::allocators::Allocator;
use crate::error::AllocError;
use crate::raw_array::RawArray;

const WORD_BITS: usize = 64;

/// A growable set of bits, stored in 64-bit words from an injected
/// allocator.
pub struct BitSet<A: Allocator> {
    words: RawArray<u64, A>,
}

impl<A: Allocator> BitSet<A> {
    /// A set holding at least `num_bits` bits, all clear.
    pub fn new(allocator: A, num_bits: usize) -> Result<Self, AllocError> {
        let mut set = BitSet {
            words: RawArray::new(allocator),
        };
        set.resize(num_bits)?;
        Ok(set)
    }

    /// Grow to hold at least `num_bits` bits. New bits are clear; the set
    /// never shrinks.
    pub fn resize(&mut self, num_bits: usize) -> Result<(), AllocError> {
        let words = (num_bits + WORD_BITS - 1) / WORD_BITS;
        if words > self.words.len() {
            self.words.resize(words, 0)?;
        }
        Ok(())
    }

    /// Number of bits available, always a multiple of 64.
    pub fn num_bits(&self) -> usize {
        self.words.len() * WORD_BITS
    }

    fn locate(&self, bit: usize) -> (usize, u64) {
        assert!(
            bit < self.num_bits(),
            "bit {} out of bounds for BitSet of {} bits",
            bit,
            self.num_bits()
        );
        (bit / WORD_BITS, 1 << (bit % WORD_BITS))
    }

    pub fn get(&self, bit: usize) -> bool {
        let (word, mask) = self.locate(bit);
        self.words.as_slice()[word] & mask != 0
    }

    pub fn set(&mut self, bit: usize, value: bool) {
        let (word, mask) = self.locate(bit);
        let word = &mut self.words.as_mut_slice()[word];
        if value {
            *word |= mask;
        } else {
            *word &= !mask;
        }
    }

    pub fn toggle(&mut self, bit: usize) {
        let (word, mask) = self.locate(bit);
        self.words.as_mut_slice()[word] ^= mask;
    }

    /// Clear every bit, keeping the size.
    pub fn clear(&mut self) {
        for word in self.words.as_mut_slice() {
            *word = 0;
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.words.as_slice().iter().all(|&w| w == 0)
    }

    /// Iterate over the indices of set bits, in ascending order.
    pub fn iter(&self) -> BitIter<'_> {
        let words = self.words.as_slice();
        BitIter {
            current: words.first().copied().unwrap_or(0),
            words,
            index: 0,
        }
    }
}

impl<A: Allocator> fmt::Debug for BitSet<A> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<'a, A: Allocator> IntoIterator for &'a BitSet<A> {
    type Item = usize;
    type IntoIter = BitIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct BitIter<'a> {
    words: &'a [u64],
    index: usize,
    // Remaining set bits of words[index]
    current: u64,
}

impl<'a> Iterator for BitIter<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.current == 0 {
            self.index += 1;
            self.current = *self.words.get(self.index)?;
        }

        let bit = self.current.trailing_zeros() as usize;
        self.current &= self.current - 1;
        Some(self.index * WORD_BITS + bit)
    }
}
