use std::fmt;

/// RTP version we accept. Versions 0 (vat) and 1 (draft) are not supported.
pub const RTP_VERSION: u8 = 2;
/// size of the fixed RTP header (without csrcs/extension)
pub const RTP_FIXED_HEADER_LEN: usize = 12;

const RTP_HDR_PADDING: u8 = 1 << 5;
const RTP_HDR_EXTENSION: u8 = 1 << 4;
const RTP_HDR_CSRC_COUNT_MASK: u8 = 0x0f;
const RTP_HDR_MARKER: u8 = 1 << 7;
const RTP_HDR_PAYLOAD_TYPE_MASK: u8 = 0x7f;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpExtensionHeader {
    /// profile defined id (e.g. 0xbede for one-byte header extensions)
    pub profile: u16,
    pub data: Vec<u8>,
}

/// A parsed RTP packet.
///
/// The packet keeps the full received buffer. The header fields are decoded and
/// the payload is kept as a range into the buffer, so [Self::raw()] and
/// [Self::payload()] don't copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    csrcs: Vec<u32>,
    extension_header: Option<RtpExtensionHeader>,
    payload_start: usize,
    payload_end: usize,
    data: Vec<u8>,
}

impl RtpPacket {
    /// Parse an RTP packet as defined by RFC 3550 section 5.1.
    ///
    /// The whole buffer is treated as one packet. Use the length prefix (RFC 4571)
    /// to split a stream before calling this.
    pub fn parse(data: &[u8]) -> Result<RtpPacket, Error> {
        RtpPacket::from_vec(data.to_vec())
    }

    /// Like [Self::parse()] but takes ownership of the buffer.
    pub fn from_vec(data: Vec<u8>) -> Result<RtpPacket, Error> {
        if data.len() < RTP_FIXED_HEADER_LEN {
            return Err(Error::new(ErrorKind::NotEnoughData(
                RTP_FIXED_HEADER_LEN - data.len(),
            )));
        }
        let b0 = data[0];
        let b1 = data[1];
        let version = b0 >> 6;
        if version != RTP_VERSION {
            return Err(Error::new(ErrorKind::InvalidData(format!(
                "unsupported rtp version {}",
                version
            ))));
        }
        let padding = (b0 & RTP_HDR_PADDING) != 0;
        let extension = (b0 & RTP_HDR_EXTENSION) != 0;
        let cc = (b0 & RTP_HDR_CSRC_COUNT_MASK) as usize;

        let mut pos = RTP_FIXED_HEADER_LEN;
        let csrc_end = pos + 4 * cc;
        if data.len() < csrc_end {
            return Err(Error::new(ErrorKind::NotEnoughData(csrc_end - data.len())));
        }
        let csrcs = data[pos..csrc_end]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        pos = csrc_end;

        let extension_header = if extension {
            if data.len() < pos + 4 {
                return Err(Error::new(ErrorKind::NotEnoughData(pos + 4 - data.len())));
            }
            let profile = u16::from_be_bytes([data[pos], data[pos + 1]]);
            let len_words = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            let ext_start = pos + 4;
            let ext_end = ext_start + 4 * len_words;
            if data.len() < ext_end {
                return Err(Error::new(ErrorKind::NotEnoughData(ext_end - data.len())));
            }
            pos = ext_end;
            Some(RtpExtensionHeader {
                profile,
                data: data[ext_start..ext_end].to_vec(),
            })
        } else {
            None
        };

        let mut payload_end = data.len();
        if padding {
            // last octet contains the number of padding octets incl. itself
            let pad_len = data[data.len() - 1] as usize;
            if pad_len == 0 || pos + pad_len > data.len() {
                return Err(Error::new(ErrorKind::InvalidData(format!(
                    "invalid padding length {} (header len {}, packet len {})",
                    pad_len,
                    pos,
                    data.len()
                ))));
            }
            payload_end -= pad_len;
        }

        Ok(RtpPacket {
            version,
            padding,
            extension,
            marker: (b1 & RTP_HDR_MARKER) != 0,
            payload_type: b1 & RTP_HDR_PAYLOAD_TYPE_MASK,
            sequence_number: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            csrcs,
            extension_header,
            payload_start: pos,
            payload_end,
            data,
        })
    }

    /// the full packet as received (header, payload and padding)
    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    /// the payload only, without header, csrcs, extension and padding
    pub fn payload(&self) -> &[u8] {
        &self.data[self.payload_start..self.payload_end]
    }

    pub fn csrcs(&self) -> &[u32] {
        &self.csrcs
    }

    pub fn extension_header(&self) -> Option<&RtpExtensionHeader> {
        self.extension_header.as_ref()
    }

    pub fn header_len(&self) -> usize {
        self.payload_start
    }

    /// Write a one line summary of the header to the writer.
    ///
    /// Format: `seq ts ssrc pt [M] payload_len`
    pub fn header_as_text_to_write(&self, writer: &mut impl std::io::Write) -> std::io::Result<()> {
        write!(
            writer,
            "{:5} {:10} {:08x} pt={:3}{} len={}",
            self.sequence_number,
            self.timestamp,
            self.ssrc,
            self.payload_type,
            if self.marker { " M" } else { "  " },
            self.payload_end - self.payload_start
        )?;
        if !self.csrcs.is_empty() {
            write!(writer, " csrcs={}", self.csrcs.len())?;
        }
        Ok(())
    }

    pub fn header_as_text(&self) -> String {
        let mut text = Vec::with_capacity(64);
        // writing into a Vec cannot fail
        let _ = self.header_as_text_to_write(&mut text);
        String::from_utf8_lossy(&text).into_owned()
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Error {
        Error { kind }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            ErrorKind::NotEnoughData(amount) => {
                write!(f, "not enough data - missing at least {} bytes", amount)
            }
            ErrorKind::InvalidData(ref desc) => {
                write!(f, "invalid data - {}", desc)
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidData(String),
    NotEnoughData(usize),
}

#[cfg(test)]
pub(crate) fn packet_for_test(seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RTP_FIXED_HEADER_LEN + payload.len());
    buf.push(RTP_VERSION << 6);
    buf.push(96);
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(&(seq as u32 * 160).to_be_bytes());
    buf.extend_from_slice(&0x1234_5678u32.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}
