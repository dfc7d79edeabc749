//! Record contract: fixed-width byte images.

/// A fixed-width record that can be copied between its in-memory form and its
/// on-disk byte image.
///
/// Sortable files are flat sequences of such images, so every file handled by
/// the sorter has a length that is a multiple of [`Record::SIZE`]. The image
/// is the record's only persistent form; there is no framing, no alignment
/// padding between records and no metadata.
///
/// Ordering is not part of the contract. The sorter takes a comparator
/// (`Fn(&T, &T) -> Ordering`) alongside the record type, so the same type can
/// be sorted under different orders.
pub trait Record: Sized {
    /// Byte width of one record image. Must be greater than zero.
    const SIZE: usize;

    /// Reads a record from the first [`Record::SIZE`] bytes of `bytes`.
    ///
    /// Panics if fewer bytes are supplied; callers always slice exact images.
    fn decode(bytes: &[u8]) -> Self;

    /// Writes the record image into the first [`Record::SIZE`] bytes of `out`.
    ///
    /// Panics if `out` is too short.
    fn encode(&self, out: &mut [u8]);
}

// Little-endian images for the fixed-width integer primitives, so plain
// integer files sort without any caller-side boilerplate.
macro_rules! integer_record {
    ($($int:ty),*) => {$(
        impl Record for $int {
            const SIZE: usize = std::mem::size_of::<$int>();

            fn decode(bytes: &[u8]) -> Self {
                let mut image = [0u8; std::mem::size_of::<$int>()];
                image.copy_from_slice(&bytes[..Self::SIZE]);
                <$int>::from_le_bytes(image)
            }

            fn encode(&self, out: &mut [u8]) {
                out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
            }
        }
    )*};
}

integer_record!(u32, i32, u64, i64);

#[cfg(test)]
mod test {
    use super::Record;

    #[test]
    fn test_integer_images() {
        let mut image = [0u8; 8];

        0x0102_0304_0506_0708u64.encode(&mut image);
        assert_eq!(image, [8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(u64::decode(&image), 0x0102_0304_0506_0708);

        (-2i64).encode(&mut image);
        assert_eq!(i64::decode(&image), -2);
    }
}
