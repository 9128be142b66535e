use std::io::{Read, Write};

use bytes::Bytes;
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};

use crate::frame::DepthBuffer;

/// Lossless zlib compression of a depth plane. This is a generic buffer
/// codec, deliberately separate from the video path: depth must survive
/// round-trips bit-exact.
pub fn compress_depth(depth: &DepthBuffer) -> anyhow::Result<Bytes> {
    let mut encoder =
        ZlibEncoder::new(Vec::with_capacity(depth.data.len() / 2), Compression::fast());
    encoder.write_all(&depth.data)?;
    Ok(Bytes::from(encoder.finish()?))
}

pub fn decompress_depth(data: &[u8]) -> anyhow::Result<Bytes> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_round_trip() {
        let plane: Vec<u8> = (0..64u32)
            .flat_map(|i| (i as f32 * 0.25).to_le_bytes())
            .collect();
        let depth = DepthBuffer {
            width: 8,
            height: 8,
            scale: 1.0,
            data: Bytes::from(plane.clone()),
        };
        let compressed = compress_depth(&depth).unwrap();
        let restored = decompress_depth(&compressed).unwrap();
        assert_eq!(&restored[..], &plane[..]);
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(decompress_depth(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }
}
