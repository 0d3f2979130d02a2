/// Fixed header size for a frame: [u64 index][u32 len][u32 crc]
pub const FRAME_HEADER_SIZE: usize = 16;

/// Append one frame for `bytes` at `index` to `buf`.
pub fn encode_frame(buf: &mut Vec<u8>, index: u64, bytes: &[u8]) {
    let len = bytes.len() as u32;
    let crc = crc32fast::hash(bytes);
    buf.extend_from_slice(&index.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(bytes);
}

/// A complete, CRC-valid frame inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef<'a> {
    pub index: u64,
    pub payload: &'a [u8],
    /// Byte offset just past this frame.
    pub end: usize,
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

/// Decode the frame starting at `at`, or `None` when it is torn or its CRC
/// does not match.
pub fn frame_at(buf: &[u8], at: usize) -> Option<FrameRef<'_>> {
    if at + FRAME_HEADER_SIZE > buf.len() {
        return None;
    }
    let index = read_u64(buf, at);
    let len = read_u32(buf, at + 8) as usize;
    let crc = read_u32(buf, at + 12);
    let end = at + FRAME_HEADER_SIZE + len;
    if end > buf.len() {
        return None;
    }
    let payload = &buf[at + FRAME_HEADER_SIZE..end];
    if crc32fast::hash(payload) != crc {
        return None;
    }
    Some(FrameRef {
        index,
        payload,
        end,
    })
}

/// Iterate frames from the start of `buf`, stopping at the first torn or
/// CRC-mismatching frame.
pub fn frames(buf: &[u8]) -> impl Iterator<Item = FrameRef<'_>> + '_ {
    let mut at = 0usize;
    std::iter::from_fn(move || {
        let frame = frame_at(buf, at)?;
        at = frame.end;
        Some(frame)
    })
}

/// Largest prefix length of `buf` that ends exactly on a valid frame.
pub fn scan_safe_frame_boundary_with_crc(buf: &[u8]) -> usize {
    frames(buf).last().map(|f| f.end).unwrap_or(0)
}

/// Byte offset just past the frame holding `index`, if that frame is present.
pub fn end_of_index(buf: &[u8], index: u64) -> Option<usize> {
    frames(buf).find(|f| f.index == index).map(|f| f.end)
}
