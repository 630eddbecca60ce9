/// Adler-style weak checksum over a window of bytes.
///
/// `s1` is the byte sum and `s2` the sum of prefix sums, both kept modulo
/// 2^16. The window can slide forward by one byte or shrink from the front
/// in constant time, which is what the delta reader relies on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollingChecksum {
    s1: u32,
    s2: u32,
    len: usize,
}

impl RollingChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_window(window: &[u8]) -> Self {
        let mut checksum = Self::new();
        checksum.update(window);
        checksum
    }

    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.s1 = (self.s1 + u32::from(byte)) & 0xffff;
            self.s2 = (self.s2 + self.s1) & 0xffff;
        }
        self.len += data.len();
    }

    /// Slides the window one byte forward, dropping `outgoing` and appending `incoming`.
    #[inline]
    pub fn roll(&mut self, outgoing: u8, incoming: u8) {
        let out = u32::from(outgoing);
        let len = (self.len as u32) & 0xffff;
        self.s1 = self.s1.wrapping_sub(out).wrapping_add(u32::from(incoming)) & 0xffff;
        self.s2 = self
            .s2
            .wrapping_sub(len.wrapping_mul(out))
            .wrapping_add(self.s1)
            & 0xffff;
    }

    /// Drops `outgoing` from the front of the window without appending anything.
    #[inline]
    pub fn shrink(&mut self, outgoing: u8) {
        if self.len == 0 {
            return;
        }
        let out = u32::from(outgoing);
        let len = (self.len as u32) & 0xffff;
        self.s1 = self.s1.wrapping_sub(out) & 0xffff;
        self.s2 = self.s2.wrapping_sub(len.wrapping_mul(out)) & 0xffff;
        self.len -= 1;
    }

    pub fn value(&self) -> u32 {
        (self.s2 << 16) | self.s1
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub fn weak_checksum(data: &[u8]) -> u32 {
    RollingChecksum::from_window(data).value()
}
