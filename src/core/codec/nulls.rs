// Packed null bitmap, MSB-first within each byte.

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NullIndicator {
    bits: Vec<u8>,
    columns: usize,
}

impl NullIndicator {
    pub fn new(columns: usize) -> Self {
        Self {
            bits: vec![0; columns.div_ceil(8)],
            columns,
        }
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn byte_len(&self) -> usize {
        self.bits.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn set(&mut self, index: usize, is_null: bool) {
        if index >= self.columns {
            return;
        }
        let mask = 1u8 << (7 - index % 8);
        if is_null {
            self.bits[index / 8] |= mask;
        } else {
            self.bits[index / 8] &= !mask;
        }
    }

    pub fn is_null(&self, index: usize) -> bool {
        if index >= self.columns {
            return false;
        }
        self.bits[index / 8] & (1u8 << (7 - index % 8)) != 0
    }

    pub fn reset(&mut self) {
        self.bits.fill(0);
    }

    /// Replaces the bitmap with `bytes`; the slice must be exactly `byte_len()` long.
    pub fn load(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() != self.bits.len() {
            return false;
        }
        self.bits.copy_from_slice(bytes);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::NullIndicator;

    #[test]
    fn length_is_ceil_of_columns_over_eight() {
        for (columns, bytes) in [(0, 0), (1, 1), (8, 1), (9, 2), (16, 2), (17, 3)] {
            assert_eq!(NullIndicator::new(columns).byte_len(), bytes);
        }
    }

    #[test]
    fn setting_one_column_leaves_others_clear() {
        let columns = 19;
        for target in 0..columns {
            let mut nulls = NullIndicator::new(columns);
            nulls.set(target, true);
            for index in 0..columns {
                assert_eq!(nulls.is_null(index), index == target, "col {index}");
            }
        }
    }

    #[test]
    fn bit_order_is_msb_first() {
        let mut nulls = NullIndicator::new(10);
        nulls.set(0, true);
        nulls.set(9, true);
        assert_eq!(nulls.as_bytes(), &[0b1000_0000, 0b0100_0000]);
        nulls.set(0, false);
        assert_eq!(nulls.as_bytes(), &[0, 0b0100_0000]);
    }

    #[test]
    fn reset_clears_every_bit() {
        let mut nulls = NullIndicator::new(12);
        for index in 0..12 {
            nulls.set(index, true);
        }
        nulls.reset();
        assert!((0..12).all(|index| !nulls.is_null(index)));
        assert_eq!(nulls.as_bytes(), &[0, 0]);
    }
}
