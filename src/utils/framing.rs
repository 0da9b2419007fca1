/// RTP over a connection oriented transport (RFC 4571) prefixes each packet
/// with a 16 bit big endian length.
pub const RFC4571_MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Splits a byte stream into RFC 4571 frames.
///
/// Data can be pushed in arbitrary chunks (as a TCP read returns it). Complete
/// frames are returned by [Self::next_frame()], incomplete ones stay buffered
/// until the rest arrives.
#[derive(Debug, Default)]
pub struct Rfc4571Deframer {
    buf: Vec<u8>,
    pos: usize,
}

impl Rfc4571Deframer {
    pub fn new() -> Self {
        Rfc4571Deframer {
            buf: Vec::with_capacity(2 * (RFC4571_MAX_FRAME_LEN + 2)),
            pos: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        if self.pos > 0 && self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos > RFC4571_MAX_FRAME_LEN {
            // compact so the buffer doesn't grow with a slow consumer
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(data);
    }

    /// returns the next complete frame (without the length prefix)
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let rem = &self.buf[self.pos..];
        if rem.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([rem[0], rem[1]]) as usize;
        if rem.len() < 2 + len {
            return None;
        }
        let frame = rem[2..2 + len].to_vec();
        self.pos += 2 + len;
        Some(frame)
    }

    /// number of buffered bytes not yet returned as a frame
    pub fn pending(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }
}

/// Prefix a packet with its RFC 4571 length.
pub fn frame_rfc4571(packet: &[u8]) -> std::io::Result<Vec<u8>> {
    if packet.len() > RFC4571_MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("packet too large for rfc4571 framing: {}", packet.len()),
        ));
    }
    let mut framed = Vec::with_capacity(packet.len() + 2);
    framed.extend_from_slice(&(packet.len() as u16).to_be_bytes());
    framed.extend_from_slice(packet);
    Ok(framed)
}
