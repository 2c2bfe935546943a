//! WAV container validation and repair
//!
//! Recognition providers consume complete RIFF/WAVE byte sequences. The
//! decoder subprocess normally emits a header on its first bytes, but a
//! restarted or misbehaving decoder can hand us bare PCM; `repair` then
//! synthesizes a correct header from the configured format instead of
//! shipping an invalid payload upstream.
//!
//! Accepted format: PCM (format tag 1), 16-bit little-endian, 1 or 2
//! channels, sample rate in the supported set.

use crate::config::SUPPORTED_SAMPLE_RATES;
use crate::error::{Error, Result};

/// Byte length of the canonical header written by `write_header`.
pub const HEADER_LEN: usize = 44;

/// PCM format parameters carried in a WAV `fmt ` chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavSpec {
    pub sample_rate: u32,
    pub channels: u16,
}

impl WavSpec {
    /// Bytes of PCM per second of audio.
    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.channels as u32 * 2
    }
}

/// Parsed layout of a WAV byte sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavLayout {
    pub spec: WavSpec,
    /// Offset of the first PCM byte.
    pub data_offset: usize,
    /// Length of the PCM payload.
    pub data_len: usize,
}

/// Parse and validate a WAV header, walking chunks until `data`.
///
/// Returns the format and the location of the PCM payload. Fails on missing
/// RIFF/WAVE magic, a non-PCM format tag, unsupported channel count, sample
/// rate, or bit depth, or a truncated chunk structure.
pub fn parse_header(bytes: &[u8]) -> Result<WavLayout> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(Error::InvalidWav("missing RIFF/WAVE magic".to_string()));
    }

    let mut spec: Option<WavSpec> = None;
    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let chunk_id = &bytes[pos..pos + 4];
        let chunk_len = u32::from_le_bytes(bytes[pos + 4..pos + 8].try_into().unwrap()) as usize;
        let body = pos + 8;

        match chunk_id {
            b"fmt " => {
                if body + 16 > bytes.len() {
                    return Err(Error::InvalidWav("truncated fmt chunk".to_string()));
                }
                let format_tag = u16::from_le_bytes(bytes[body..body + 2].try_into().unwrap());
                if format_tag != 1 {
                    return Err(Error::InvalidWav(format!(
                        "unsupported format tag {format_tag} (PCM required)"
                    )));
                }
                let channels = u16::from_le_bytes(bytes[body + 2..body + 4].try_into().unwrap());
                if channels != 1 && channels != 2 {
                    return Err(Error::InvalidWav(format!("unsupported channel count {channels}")));
                }
                let sample_rate =
                    u32::from_le_bytes(bytes[body + 4..body + 8].try_into().unwrap());
                if !SUPPORTED_SAMPLE_RATES.contains(&sample_rate) {
                    return Err(Error::InvalidWav(format!("unsupported sample rate {sample_rate}")));
                }
                let bits = u16::from_le_bytes(bytes[body + 14..body + 16].try_into().unwrap());
                if bits != 16 {
                    return Err(Error::InvalidWav(format!("unsupported bit depth {bits}")));
                }
                spec = Some(WavSpec { sample_rate, channels });
            }
            b"data" => {
                let spec = spec
                    .ok_or_else(|| Error::InvalidWav("data chunk before fmt chunk".to_string()))?;
                // Streaming encoders write a placeholder size; trust the
                // actual payload length in that case.
                let available = bytes.len() - body;
                let data_len = if chunk_len == 0 || chunk_len == 0xFFFF_FFFF || chunk_len > available
                {
                    available
                } else {
                    chunk_len
                };
                return Ok(WavLayout { spec, data_offset: body, data_len });
            }
            _ => {}
        }

        // Chunks are word-aligned.
        pos = body + chunk_len + (chunk_len & 1);
    }

    Err(Error::InvalidWav("no data chunk found".to_string()))
}

/// Write a canonical 44-byte header for `data_len` bytes of PCM.
pub fn write_header(data_len: usize, spec: WavSpec) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    let data_len = data_len as u32;
    let block_align = spec.channels * 2;

    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&(36 + data_len).to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM
    header[22..24].copy_from_slice(&spec.channels.to_le_bytes());
    header[24..28].copy_from_slice(&spec.sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&spec.byte_rate().to_le_bytes());
    header[32..34].copy_from_slice(&block_align.to_le_bytes());
    header[34..36].copy_from_slice(&16u16.to_le_bytes());
    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_len.to_le_bytes());
    header
}

/// Wrap raw PCM in a complete WAV byte sequence.
pub fn wrap_pcm(pcm: &[u8], spec: WavSpec) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + pcm.len());
    out.extend_from_slice(&write_header(pcm.len(), spec));
    out.extend_from_slice(pcm);
    out
}

/// Validate a WAV payload, synthesizing a header when one is missing.
///
/// Returns bytes safe to submit to a provider. A payload that already
/// carries a valid header passes through unchanged. A headerless payload is
/// accepted when it is plausibly bare PCM for `expected` (non-empty,
/// even-byte-aligned); anything else is rejected without touching the
/// upstream provider.
pub fn repair(bytes: &[u8], expected: WavSpec) -> Result<Vec<u8>> {
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" {
        parse_header(bytes)?;
        return Ok(bytes.to_vec());
    }

    if bytes.is_empty() {
        return Err(Error::InvalidWav("empty audio payload".to_string()));
    }
    if bytes.len() % 2 != 0 {
        return Err(Error::InvalidWav(
            "headerless payload is not 16-bit aligned".to_string(),
        ));
    }

    Ok(wrap_pcm(bytes, expected))
}
