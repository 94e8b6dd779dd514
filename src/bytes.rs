//! Growable byte buffer with alignment-aware read/write cursors.
//!
//! The write cursor is implicit: every write grows the buffer to the next
//! multiple of the value's alignment and appends there, so the buffer length
//! always tracks the write position. The read cursor aligns itself the same
//! way, which makes a read sequence land exactly on the fields a matching
//! write sequence produced.
//!
//! The layout is same-build in-memory layout (native endianness, natural
//! alignment); this is a closed protocol, not an interchange format.

use crate::error::{Error, Result};

#[inline]
fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[derive(Default)]
pub struct ByteBuffer {
    data: Vec<u8>,
    read_pos: usize,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Replace the whole contents with a received contiguous block and rewind.
    pub fn replace(&mut self, data: Vec<u8>) {
        self.data = data;
        self.read_pos = 0;
    }

    /// Rewind the read cursor to the buffer start.
    pub fn reset(&mut self) {
        self.read_pos = 0;
    }

    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    /// Restore a previously saved read position. Used by dispatchers that
    /// peek at a payload and then decline the transaction.
    pub fn seek(&mut self, pos: usize) {
        debug_assert!(pos <= self.data.len());
        self.read_pos = pos.min(self.data.len());
    }

    /// Pad the buffer up to `alignment`, then append `bytes`.
    pub fn write(&mut self, bytes: &[u8], alignment: usize) {
        let aligned = align_up(self.data.len(), alignment);
        self.data.resize(aligned, 0);
        self.data.extend_from_slice(bytes);
    }

    /// Length-prefixed element array: element count, then the raw elements.
    pub fn write_array(&mut self, bytes: &[u8], elem_size: usize) {
        debug_assert!(elem_size == 0 || bytes.len() % elem_size == 0);
        let count = if elem_size == 0 { 0 } else { bytes.len() / elem_size };
        self.write(&count.to_ne_bytes(), std::mem::size_of::<usize>());
        self.write(bytes, elem_size.max(1));
    }

    /// Align the read cursor up and borrow `length` bytes. A read that would
    /// overrun the buffer is a hard error and leaves the cursor untouched.
    pub fn read(&mut self, length: usize, alignment: usize) -> Result<&[u8]> {
        let aligned = align_up(self.read_pos, alignment);
        let end = aligned.checked_add(length).ok_or(Error::UnexpectedEof)?;
        if end > self.data.len() {
            return Err(Error::UnexpectedEof);
        }
        self.read_pos = end;
        Ok(&self.data[aligned..end])
    }

    /// Counterpart of [`write_array`]: length prefix, then a borrowed slice of
    /// the elements. An empty array reads back as `Ok(&[])`.
    pub fn read_array(&mut self, elem_size: usize) -> Result<&[u8]> {
        let prefix = std::mem::size_of::<usize>();
        let mut count_bytes = [0u8; std::mem::size_of::<usize>()];
        count_bytes.copy_from_slice(self.read(prefix, prefix)?);
        let count = usize::from_ne_bytes(count_bytes);
        let length = count
            .checked_mul(elem_size)
            .ok_or(Error::UnexpectedEof)?;
        self.read(length, elem_size.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{ByteOrder, NativeEndian};

    #[test]
    fn round_trips_mixed_scalars_across_padding() {
        let mut buf = ByteBuffer::new();
        buf.write(&[0x5au8], 1);
        buf.write(&0x1122_3344i32.to_ne_bytes(), 4);
        buf.write(&[7u8], 1);
        buf.write(&0x0102_0304_0506_0708i64.to_ne_bytes(), 8);

        assert_eq!(buf.read(1, 1).unwrap(), &[0x5a]);
        assert_eq!(NativeEndian::read_i32(buf.read(4, 4).unwrap()), 0x1122_3344);
        assert_eq!(buf.read(1, 1).unwrap(), &[7]);
        assert_eq!(
            NativeEndian::read_i64(buf.read(8, 8).unwrap()),
            0x0102_0304_0506_0708
        );
    }

    #[test]
    fn read_past_end_is_a_hard_error() {
        let mut buf = ByteBuffer::new();
        buf.write(&1i32.to_ne_bytes(), 4);
        assert!(buf.read(4, 4).is_ok());
        assert!(matches!(buf.read(1, 1), Err(Error::UnexpectedEof)));
    }

    #[test]
    fn failed_read_leaves_cursor_in_place() {
        let mut buf = ByteBuffer::new();
        buf.write(&[1u8, 2], 1);
        assert!(buf.read(8, 8).is_err());
        assert_eq!(buf.read(2, 1).unwrap(), &[1, 2]);
    }

    #[test]
    fn empty_array_round_trips() {
        let mut buf = ByteBuffer::new();
        buf.write_array(&[], 4);
        let elems = buf.read_array(4).unwrap();
        assert!(elems.is_empty());
    }

    #[test]
    fn array_round_trips_after_odd_prefix() {
        let mut buf = ByteBuffer::new();
        buf.write(&[9u8], 1);
        buf.write_array(&[1, 2, 3, 4, 5, 6, 7, 8], 4);

        assert_eq!(buf.read(1, 1).unwrap(), &[9]);
        assert_eq!(buf.read_array(4).unwrap(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn seek_rewinds_a_peeked_field() {
        let mut buf = ByteBuffer::new();
        buf.write(&42i32.to_ne_bytes(), 4);

        let saved = buf.read_pos();
        assert_eq!(NativeEndian::read_i32(buf.read(4, 4).unwrap()), 42);
        buf.seek(saved);
        assert_eq!(NativeEndian::read_i32(buf.read(4, 4).unwrap()), 42);
    }
}
