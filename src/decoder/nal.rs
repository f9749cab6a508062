//! Annex B NAL unit inspection

use crate::config::CodecKind;

/// Iterator over the header byte of every NAL unit in an Annex B buffer.
///
/// Both 3-byte (`00 00 01`) and 4-byte (`00 00 00 01`) start codes are
/// recognised; the 4-byte form is just a 3-byte code preceded by a zero.
struct NalHeaders<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for NalHeaders<'a> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        let data = self.data;
        while self.pos + 3 < data.len() {
            let i = self.pos;
            if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
                self.pos = i + 3;
                return Some(data[i + 3]);
            }
            self.pos += 1;
        }
        None
    }
}

fn nal_headers(data: &[u8]) -> NalHeaders<'_> {
    NalHeaders { data, pos: 0 }
}

/// NAL unit type of an H.264 header byte.
#[inline]
fn avc_type(header: u8) -> u8 {
    header & 0x1F
}

/// NAL unit type of the first H.265 header byte.
#[inline]
fn hevc_type(header: u8) -> u8 {
    (header >> 1) & 0x3F
}

/// Return true if the frame contains a random access point or the parameter
/// sets needed to start decoding.
///
/// H.264: IDR (5), SPS (7), PPS (8).
/// H.265: IRAP pictures (16..=23), VPS/SPS/PPS (32..=34).
pub fn is_keyframe(codec: CodecKind, frame: &[u8]) -> bool {
    match codec {
        CodecKind::Avc => nal_headers(frame).any(|h| matches!(avc_type(h), 5 | 7 | 8)),
        CodecKind::Hevc => {
            nal_headers(frame).any(|h| matches!(hevc_type(h), 16..=23 | 32..=34))
        }
    }
}
