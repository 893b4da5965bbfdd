//! Little-endian byte sink with chunk size back-patching.

pub(crate) struct PsyWriter {
    buf: Vec<u8>,
}

/// Position of a size field waiting to be patched.
#[must_use]
pub(crate) struct SizeMark(usize);

impl PsyWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn pos(&self) -> usize {
        self.buf.len()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn write_u16_le(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i16_le(&mut self, v: i16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u32_le(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i32_le(&mut self, v: i32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_f32_le(&mut self, v: f32) {
        self.write_bytes(&v.to_le_bytes());
    }

    /// String plus terminating NUL. Interior NULs end the string early.
    pub fn write_cstring(&mut self, s: &str) {
        let bytes = s.as_bytes();
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        self.write_bytes(&bytes[..end]);
        self.write_u8(0);
    }

    /// Write a zero size field and remember where it is.
    pub fn size_placeholder(&mut self) -> SizeMark {
        let mark = SizeMark(self.pos());
        self.write_u32_le(0);
        mark
    }

    /// Patch the field with the number of bytes written after it.
    pub fn patch_size(&mut self, mark: SizeMark) {
        let size = (self.pos() - mark.0 - 4) as u32;
        self.buf[mark.0..mark.0 + 4].copy_from_slice(&size.to_le_bytes());
    }

    /// Start a chunk: tag, version and a placeholder size.
    pub fn begin_chunk(&mut self, tag: &[u8; 4], version: u32) -> SizeMark {
        self.write_bytes(tag);
        self.write_u32_le(version);
        self.size_placeholder()
    }
}
