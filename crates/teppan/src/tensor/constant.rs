/// # Constants with reserved meanings in Teppan

/// In a given tensor shape, Teppan reserves the `0th` dimension for batching
pub const BATCH_DIM: usize = 0;

/// In a given tensor shape, Teppan reserves the `1st` dimension for sequence
pub const SEQ_DIM: usize = 1;

/// Bits stored in one word of a packed token bitmask
pub const BITS_PER_WORD: usize = 32;
