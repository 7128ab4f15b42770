use crate::interfaces::TokenId;
use super::constant::BITS_PER_WORD;

/// A packed `(batch, vocab)` token validity mask.
///
/// Each row holds `ceil(vocab_size / 32)` words; bit `j` of word `w` marks token
/// `w * 32 + j` as legal. A freshly allocated mask is fully permissive, so rows
/// belonging to unconstrained requests never need to be touched.
///
/// The mask lives on the host: grammar matchers fill it before the decode loop
/// and [`TokenBitmask::to_bool_mask`] expands it for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBitmask {
    batch_size: usize,
    vocab_size: usize,
    words: Vec<u32>,
}

impl TokenBitmask {
    /// Number of words needed to pack `vocab_size` bits.
    pub fn words_per_row(vocab_size: usize) -> usize {
        vocab_size.div_ceil(BITS_PER_WORD)
    }

    /// Allocate a mask where every token of every row is allowed.
    pub fn permissive(batch_size: usize, vocab_size: usize) -> Self {
        Self {
            batch_size,
            vocab_size,
            words: vec![u32::MAX; batch_size * Self::words_per_row(vocab_size)],
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Packed words of one row, for matchers that write the mask directly.
    pub fn row_mut(&mut self, row: usize) -> &mut [u32] {
        let width = Self::words_per_row(self.vocab_size);
        &mut self.words[row * width..(row + 1) * width]
    }

    pub fn row(&self, row: usize) -> &[u32] {
        let width = Self::words_per_row(self.vocab_size);
        &self.words[row * width..(row + 1) * width]
    }

    /// Restrict `row` to exactly the given tokens. Out of range ids are ignored.
    pub fn allow_only(&mut self, row: usize, tokens: &[TokenId]) {
        let vocab_size = self.vocab_size;
        let words = self.row_mut(row);
        words.iter_mut().for_each(|w| *w = 0);
        for &token in tokens {
            if token < 0 || token as usize >= vocab_size {
                continue;
            }
            let token = token as usize;
            words[token / BITS_PER_WORD] |= 1 << (token % BITS_PER_WORD);
        }
    }

    /// Reset `row` to fully permissive.
    pub fn allow_all(&mut self, row: usize) {
        self.row_mut(row).iter_mut().for_each(|w| *w = u32::MAX);
    }

    pub fn is_allowed(&self, row: usize, token: TokenId) -> bool {
        if token < 0 || token as usize >= self.vocab_size {
            return false;
        }
        let token = token as usize;
        self.row(row)[token / BITS_PER_WORD] & (1 << (token % BITS_PER_WORD)) != 0
    }

    /// Expand to a row-major `(batch, vocab)` byte mask, `1` meaning allowed.
    ///
    /// Padding bits past `vocab_size` in the last word are dropped.
    pub fn to_bool_mask(&self) -> Vec<u8> {
        let width = Self::words_per_row(self.vocab_size);
        let mut mask = Vec::with_capacity(self.batch_size * self.vocab_size);
        for row in 0..self.batch_size {
            let words = &self.words[row * width..(row + 1) * width];
            mask.extend((0..self.vocab_size).map(|token| {
                ((words[token / BITS_PER_WORD] >> (token % BITS_PER_WORD)) & 1) as u8
            }));
        }
        mask
    }
}
