use bytes::{Bytes, BytesMut};

/// Annex B start code (4-byte)
const START_CODE: &[u8] = &[0x00, 0x00, 0x00, 0x01];

/// Length of the big-endian length prefix in AVCC/HVCC framing.
const LENGTH_PREFIX: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    Hevc,
}

/// Check if a buffer is already in Annex B format by looking at the start codes.
pub fn is_annex_b(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    if data[0] == 0x00 && data[1] == 0x00 && data[2] == 0x00 && data[3] == 0x01 {
        return true;
    }
    if data[0] == 0x00 && data[1] == 0x00 && data[2] == 0x01 {
        return true;
    }
    false
}

/// Converts a length-prefixed NAL sequence (4-byte big-endian length per
/// NALU, as produced by hardware encoders) to Annex B framing.
/// NALU order and payload bytes are preserved; each length prefix becomes a
/// start code. A zero or overflowing length terminates the walk, so a
/// truncated trailing unit is never emitted.
pub fn to_annex_b(avcc: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(avcc.len());
    let mut i = 0;
    while i + LENGTH_PREFIX <= avcc.len() {
        let len = u32::from_be_bytes([avcc[i], avcc[i + 1], avcc[i + 2], avcc[i + 3]]) as usize;
        i += LENGTH_PREFIX;
        if len == 0 || i + len > avcc.len() {
            break;
        }
        out.extend_from_slice(START_CODE);
        out.extend_from_slice(&avcc[i..i + len]);
        i += len;
    }
    out.freeze()
}

/// Splits an Annex B buffer back into NALU payloads (start codes stripped).
pub fn split_nalus(annexb: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut start = None;
    let mut i = 0;
    while i + 4 <= annexb.len() {
        if &annexb[i..i + 4] == START_CODE {
            if let Some(s) = start {
                units.push(&annexb[s..i]);
            }
            start = Some(i + 4);
            i += 4;
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        units.push(&annexb[s..]);
    }
    units
}

/// Out-of-band codec metadata attached to a compressed sample: SPS/PPS for
/// H.264, VPS/SPS/PPS for HEVC, in index order.
#[derive(Clone, Debug)]
pub struct FormatDescription {
    pub codec: Codec,
    pub parameter_sets: Vec<Bytes>,
}

/// Concatenates `start code + parameter set` for each set in index order.
/// H.264 requires exactly 2 sets, HEVC at least 3; any other count returns
/// `None` rather than a truncated result. The output is prepended to a
/// keyframe's payload so every keyframe is independently decodable.
pub fn extract_parameter_sets(desc: &FormatDescription) -> Option<Bytes> {
    let count = desc.parameter_sets.len();
    let ok = match desc.codec {
        Codec::H264 => count == 2,
        Codec::Hevc => count >= 3,
    };
    if !ok {
        log::warn!("unexpected video parameter set count {} for {:?}", count, desc.codec);
        return None;
    }
    let total: usize = desc.parameter_sets.iter().map(|p| p.len() + START_CODE.len()).sum();
    let mut out = BytesMut::with_capacity(total);
    for set in &desc.parameter_sets {
        out.extend_from_slice(START_CODE);
        out.extend_from_slice(set);
    }
    Some(out.freeze())
}

/// Per-sample attachments reported by the compression session.
/// `not_sync` absent or false means the sample is a keyframe.
#[derive(Clone, Copy, Debug, Default)]
pub struct SampleFlags {
    pub not_sync: Option<bool>,
}

impl SampleFlags {
    pub fn is_keyframe(&self) -> bool {
        !self.not_sync.unwrap_or(false)
    }
}
