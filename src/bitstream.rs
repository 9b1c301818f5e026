use std::collections::VecDeque;
use std::mem;

use crate::{BackendError, Codec, Timestamp90k};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    pub nalus: Vec<Vec<u8>>,
    pub codec: Codec,
    pub pts_90k: Option<Timestamp90k>,
    pub is_keyframe: bool,
}

impl AccessUnit {
    /// Wraps NAL units already known to form exactly one access unit.
    pub fn from_nalus(codec: Codec, nalus: Vec<Vec<u8>>, pts_90k: Option<Timestamp90k>) -> Self {
        let is_keyframe = nalus.iter().any(|nal| is_key_vcl(codec, nal));
        Self {
            nalus,
            codec,
            pts_90k,
            is_keyframe,
        }
    }

    pub fn to_annexb(&self) -> Vec<u8> {
        pack_annexb(&self.nalus)
    }

    pub fn payload_len(&self) -> usize {
        self.nalus.iter().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParameterSetCache {
    h264_sps: Option<Vec<u8>>,
    h264_pps: Option<Vec<u8>>,
    hevc_vps: Option<Vec<u8>>,
    hevc_sps: Option<Vec<u8>>,
    hevc_pps: Option<Vec<u8>>,
}

impl ParameterSetCache {
    pub fn required_for_codec(&self, codec: Codec) -> Option<Vec<Vec<u8>>> {
        match codec {
            Codec::H264 => Some(vec![self.h264_sps.clone()?, self.h264_pps.clone()?]),
            Codec::Hevc => Some(vec![
                self.hevc_vps.clone()?,
                self.hevc_sps.clone()?,
                self.hevc_pps.clone()?,
            ]),
        }
    }

    fn observe(&mut self, codec: Codec, nal: &[u8]) {
        let Some(nal_type) = nal_type(codec, nal) else {
            return;
        };
        match (codec, nal_type) {
            (Codec::H264, 7) => self.h264_sps = Some(nal.to_vec()),
            (Codec::H264, 8) => self.h264_pps = Some(nal.to_vec()),
            (Codec::Hevc, 32) => self.hevc_vps = Some(nal.to_vec()),
            (Codec::Hevc, 33) => self.hevc_sps = Some(nal.to_vec()),
            (Codec::Hevc, 34) => self.hevc_pps = Some(nal.to_vec()),
            _ => {}
        }
    }
}

/// Splits an Annex-B byte stream, delivered in arbitrary chunks, into access units.
///
/// Only complete access units are returned; a unit is known to be complete once the
/// first NAL of the next one has been seen, or on [`flush`](Self::flush).
#[derive(Debug, Default)]
pub struct AccessUnitAssembler {
    codec: Option<Codec>,
    pending: Vec<u8>,
    // Stream offset of `pending[0]`.
    pending_offset: u64,
    stream_len: u64,
    // `pending` starts with a 3-byte start code.
    synced: bool,
    scan_from: usize,
    chunk_pts: VecDeque<(u64, Timestamp90k)>,
    current_nalus: Vec<Vec<u8>>,
    current_pts: Option<Timestamp90k>,
    current_has_vcl: bool,
    current_has_key_vcl: bool,
    parameter_sets: ParameterSetCache,
}

impl AccessUnitAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codec(codec: Codec) -> Self {
        Self {
            codec: Some(codec),
            ..Self::default()
        }
    }

    pub fn parameter_sets(&self) -> &ParameterSetCache {
        &self.parameter_sets
    }

    /// Bytes held back because they do not yet form a complete access unit.
    pub fn pending_bytes(&self) -> usize {
        self.pending.len() + self.current_nalus.iter().map(Vec::len).sum::<usize>()
    }

    pub fn push_chunk(
        &mut self,
        chunk: &[u8],
        codec: Codec,
        pts_90k: Option<Timestamp90k>,
    ) -> Result<Vec<AccessUnit>, BackendError> {
        match self.codec {
            Some(current) if current != codec && self.pending_bytes() > 0 => {
                return Err(BackendError::InvalidInput(format!(
                    "codec changed from {current} to {codec} in the middle of a stream"
                )));
            }
            _ => self.codec = Some(codec),
        }
        if chunk.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(pts) = pts_90k {
            self.chunk_pts.push_back((self.stream_len, pts));
        }
        self.stream_len += chunk.len() as u64;
        self.pending.extend_from_slice(chunk);

        let nalus = self.take_complete_nals(false);
        Ok(self.process_nals(codec, nalus))
    }

    pub fn flush(&mut self) -> Result<Vec<AccessUnit>, BackendError> {
        let codec = self
            .codec
            .ok_or_else(|| BackendError::InvalidInput("codec is not set".to_string()))?;
        let nalus = self.take_complete_nals(true);
        let mut access_units = self.process_nals(codec, nalus);
        if self.current_has_vcl && !self.current_nalus.is_empty() {
            access_units.push(self.finish_current_access_unit(codec));
        } else {
            self.current_nalus.clear();
            self.current_pts = None;
        }
        self.chunk_pts.clear();
        Ok(access_units)
    }

    fn process_nals(&mut self, codec: Codec, nalus: Vec<(u64, Vec<u8>)>) -> Vec<AccessUnit> {
        let mut out = Vec::new();

        for (offset, nal) in nalus {
            self.parameter_sets.observe(codec, &nal);

            let nal_is_vcl = is_vcl(codec, &nal);
            let starts_new_unit = if nal_is_vcl {
                begins_new_picture(codec, &nal)
            } else {
                opens_access_unit(codec, &nal)
            };
            if starts_new_unit && self.current_has_vcl && !self.current_nalus.is_empty() {
                out.push(self.finish_current_access_unit(codec));
            }

            if self.current_nalus.is_empty() {
                self.current_pts = self.take_pts_at(offset);
            }
            let nal_is_key = is_key_vcl(codec, &nal);
            self.current_nalus.push(nal);
            if nal_is_vcl {
                self.current_has_vcl = true;
                self.current_has_key_vcl = self.current_has_key_vcl || nal_is_key;
            }
        }

        out
    }

    fn finish_current_access_unit(&mut self, codec: Codec) -> AccessUnit {
        let au = AccessUnit {
            nalus: mem::take(&mut self.current_nalus),
            codec,
            pts_90k: self.current_pts.take(),
            is_keyframe: self.current_has_key_vcl,
        };
        self.current_has_vcl = false;
        self.current_has_key_vcl = false;
        au
    }

    // Latest pts whose chunk began at or before `offset`.
    fn take_pts_at(&mut self, offset: u64) -> Option<Timestamp90k> {
        let mut taken = None;
        while let Some(&(chunk_offset, pts)) = self.chunk_pts.front() {
            if chunk_offset > offset {
                break;
            }
            taken = Some(pts);
            self.chunk_pts.pop_front();
        }
        taken
    }

    fn take_complete_nals(&mut self, finalize: bool) -> Vec<(u64, Vec<u8>)> {
        let mut nalus = Vec::new();
        let mut start = 0;

        if !self.synced {
            match find_start_code(&self.pending, 0) {
                Some(pos) => {
                    start = pos;
                    self.synced = true;
                    self.scan_from = pos + 3;
                }
                None => {
                    // Keep a possible partial start code.
                    let keep = if finalize { 0 } else { self.pending.len().min(2) };
                    let junk = self.pending.len() - keep;
                    self.drop_front(junk);
                    return nalus;
                }
            }
        }

        while let Some(pos) = find_start_code(&self.pending, self.scan_from) {
            let nal = trim_trailing_zeros(&self.pending[start + 3..pos]);
            if !nal.is_empty() {
                nalus.push((self.pending_offset + start as u64, nal.to_vec()));
            }
            start = pos;
            self.scan_from = pos + 3;
        }

        if finalize {
            if self.pending.len() > start + 3 {
                let nal = trim_trailing_zeros(&self.pending[start + 3..]);
                if !nal.is_empty() {
                    nalus.push((self.pending_offset + start as u64, nal.to_vec()));
                }
            }
            let len = self.pending.len();
            self.drop_front(len);
            self.synced = false;
            self.scan_from = 0;
            return nalus;
        }

        self.drop_front(start);
        self.scan_from = self.pending.len().saturating_sub(2).max(3);
        nalus
    }

    fn drop_front(&mut self, count: usize) {
        self.pending.drain(..count);
        self.pending_offset += count as u64;
    }
}

/// Joins NAL payloads into an Annex-B byte stream with 4-byte start codes.
pub fn pack_annexb(nalus: &[Vec<u8>]) -> Vec<u8> {
    let total = nalus.iter().map(|nal| nal.len() + START_CODE.len()).sum();
    let mut out = Vec::with_capacity(total);
    for nal in nalus {
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(nal);
    }
    out
}

/// Splits an AVCC/HVCC sample (4-byte big-endian NAL lengths) into NAL payloads.
pub fn split_length_prefixed(sample: &[u8]) -> Result<Vec<Vec<u8>>, BackendError> {
    let mut nalus = Vec::new();
    let mut payload = sample;
    while payload.len() >= 4 {
        let nal_len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
        payload = &payload[4..];
        if nal_len == 0 || payload.len() < nal_len {
            return Err(BackendError::InvalidBitstream(
                "invalid length-prefixed sample payload".to_string(),
            ));
        }
        nalus.push(payload[..nal_len].to_vec());
        payload = &payload[nal_len..];
    }
    if !payload.is_empty() {
        return Err(BackendError::InvalidBitstream(
            "trailing bytes after length-prefixed sample parse".to_string(),
        ));
    }
    Ok(nalus)
}

/// Converts an AVCC/HVCC sample to Annex-B.
pub fn unpack_length_prefixed(sample: &[u8]) -> Result<Vec<u8>, BackendError> {
    Ok(pack_annexb(&split_length_prefixed(sample)?))
}

// Position of the next `00 00 01` at or after `from`.
fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    if data.len() < 3 {
        return None;
    }
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i + 2] > 1 {
            i += 3;
            continue;
        }
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn trim_trailing_zeros(nal: &[u8]) -> &[u8] {
    let end = nal.iter().rposition(|&b| b != 0).map_or(0, |pos| pos + 1);
    &nal[..end]
}

fn nal_type(codec: Codec, nal: &[u8]) -> Option<u8> {
    let header = *nal.first()?;
    Some(match codec {
        Codec::H264 => header & 0x1f,
        Codec::Hevc => (header >> 1) & 0x3f,
    })
}

fn is_vcl(codec: Codec, nal: &[u8]) -> bool {
    match (codec, nal_type(codec, nal)) {
        (Codec::H264, Some(t)) => matches!(t, 1..=5 | 19),
        (Codec::Hevc, Some(t)) => t <= 31,
        (_, None) => false,
    }
}

fn is_key_vcl(codec: Codec, nal: &[u8]) -> bool {
    match (codec, nal_type(codec, nal)) {
        (Codec::H264, Some(t)) => t == 5,
        (Codec::Hevc, Some(t)) => (16..=21).contains(&t),
        (_, None) => false,
    }
}

// first_mb_in_slice == 0 (H.264) or first_slice_segment_in_pic_flag (HEVC). Both are the
// first bit after the NAL header; ue(v) zero encodes as a single `1` bit.
fn begins_new_picture(codec: Codec, nal: &[u8]) -> bool {
    match (codec, nal_type(codec, nal)) {
        (Codec::H264, Some(1 | 2 | 5)) => nal.get(1).is_some_and(|b| b & 0x80 != 0),
        (Codec::H264, _) => false,
        (Codec::Hevc, Some(_)) => nal.get(2).is_some_and(|b| b & 0x80 != 0),
        (Codec::Hevc, None) => false,
    }
}

// Non-VCL NAL types that may only appear before the first VCL NAL of an access unit.
fn opens_access_unit(codec: Codec, nal: &[u8]) -> bool {
    match (codec, nal_type(codec, nal)) {
        (Codec::H264, Some(t)) => matches!(t, 6..=9 | 14..=18),
        (Codec::Hevc, Some(t)) => matches!(t, 32..=35 | 39 | 41..=44 | 48..=55),
        (_, None) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annexb(nalus: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nalus {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(nal);
        }
        out
    }

    fn h264_sample_annexb() -> Vec<u8> {
        annexb(&[
            &[0x09, 0xF0],
            &[0x67, 0x42, 0x00, 0x1E],
            &[0x68, 0xCE, 0x06, 0xE2],
            &[0x65, 0x88, 0x84, 0x21],
            &[0x09, 0xF0],
            &[0x41, 0x9A, 0x22, 0x11],
        ])
    }

    fn assemble(data: &[u8], codec: Codec, chunk_size: usize) -> Vec<AccessUnit> {
        let mut assembler = AccessUnitAssembler::new();
        let mut emitted = Vec::new();
        for chunk in data.chunks(chunk_size) {
            emitted.extend(assembler.push_chunk(chunk, codec, None).unwrap());
        }
        emitted.extend(assembler.flush().unwrap());
        emitted
    }

    #[test]
    fn chunked_parse_converges() {
        let data = h264_sample_annexb();
        let whole = assemble(&data, Codec::H264, data.len());
        for chunk_size in 1..=7 {
            let emitted = assemble(&data, Codec::H264, chunk_size);
            assert_eq!(emitted, whole, "chunk_size={chunk_size}");
        }
        assert_eq!(whole.len(), 2);
        assert!(whole[0].is_keyframe);
        assert!(!whole[1].is_keyframe);
        assert_eq!(whole[0].nalus.len(), 4);
        assert_eq!(whole[1].nalus[1], vec![0x41, 0x9A, 0x22, 0x11]);
    }

    #[test]
    fn extracts_required_parameter_sets() {
        let data = h264_sample_annexb();
        let mut assembler = AccessUnitAssembler::new();
        let _ = assembler.push_chunk(&data, Codec::H264, None).unwrap();
        let _ = assembler.flush().unwrap();

        let params = assembler
            .parameter_sets()
            .required_for_codec(Codec::H264)
            .unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0][0] & 0x1f, 7);
        assert!(assembler.parameter_sets().required_for_codec(Codec::Hevc).is_none());
    }

    #[test]
    fn slices_of_one_picture_stay_together_without_aud() {
        let data = annexb(&[
            &[0x67, 0x42, 0x00, 0x1E],
            &[0x68, 0xCE, 0x06, 0xE2],
            // IDR, first_mb_in_slice == 0, then a second slice of the same picture.
            &[0x65, 0x88, 0x84],
            &[0x65, 0x40, 0x11],
            &[0x06, 0x05, 0x01],
            &[0x41, 0x9A, 0x22],
            &[0x41, 0x9B, 0x22],
        ]);
        let units = assemble(&data, Codec::H264, 5);
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].nalus.len(), 4);
        assert!(units[0].is_keyframe);
        // SEI opens the second unit.
        assert_eq!(units[1].nalus[0][0] & 0x1f, 6);
        assert_eq!(units[1].nalus.len(), 2);
        assert_eq!(units[2].nalus.len(), 1);
    }

    #[test]
    fn hevc_units_split_on_first_slice_flag() {
        let data = annexb(&[
            &[0x40, 0x01, 0x0C],
            &[0x42, 0x01, 0x01],
            &[0x44, 0x01, 0xC1],
            // IDR_W_RADL with first_slice_segment_in_pic_flag set, then a dependent slice.
            &[0x26, 0x01, 0xAF],
            &[0x26, 0x01, 0x2F],
            &[0x02, 0x01, 0xD0],
        ]);
        let units = assemble(&data, Codec::Hevc, 4);
        assert_eq!(units.len(), 2);
        assert!(units[0].is_keyframe);
        assert_eq!(units[0].nalus.len(), 5);
        assert!(!units[1].is_keyframe);
    }

    #[test]
    fn discards_leading_junk_and_trailing_zero_bytes() {
        let mut data = vec![0xAB, 0xCD, 0x00];
        data.extend_from_slice(&[0, 0, 1, 0x65, 0x88, 0x00, 0x00]);
        data.extend_from_slice(&[0, 0, 0, 1, 0x41, 0x9A]);
        let units = assemble(&data, Codec::H264, 3);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].nalus, vec![vec![0x65, 0x88]]);
        assert_eq!(units[1].nalus, vec![vec![0x41, 0x9A]]);
    }

    #[test]
    fn pending_bytes_track_incomplete_unit() {
        let data = h264_sample_annexb();
        let mut assembler = AccessUnitAssembler::with_codec(Codec::H264);
        assert_eq!(assembler.pending_bytes(), 0);
        let units = assembler.push_chunk(&data[..10], Codec::H264, None).unwrap();
        assert!(units.is_empty());
        assert!(assembler.pending_bytes() > 0);
        let _ = assembler.push_chunk(&data[10..], Codec::H264, None).unwrap();
        let _ = assembler.flush().unwrap();
        assert_eq!(assembler.pending_bytes(), 0);
    }

    #[test]
    fn chunk_pts_attaches_to_unit_starting_in_that_chunk() {
        let data = h264_sample_annexb();
        // [00 00 00 01 09 F0] [00 00 00 01 41 9A 22 11]
        let second_aud = data.len() - 14;
        let mut assembler = AccessUnitAssembler::new();
        let mut units = assembler
            .push_chunk(&data[..second_aud], Codec::H264, Some(Timestamp90k(0)))
            .unwrap();
        units.extend(
            assembler
                .push_chunk(&data[second_aud..], Codec::H264, Some(Timestamp90k(3000)))
                .unwrap(),
        );
        units.extend(assembler.flush().unwrap());
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].pts_90k, Some(Timestamp90k(0)));
        assert_eq!(units[1].pts_90k, Some(Timestamp90k(3000)));
    }

    #[test]
    fn chunk_pts_is_used_once() {
        let data = h264_sample_annexb();
        let mut assembler = AccessUnitAssembler::new();
        let mut units = assembler
            .push_chunk(&data, Codec::H264, Some(Timestamp90k(1500)))
            .unwrap();
        units.extend(assembler.flush().unwrap());
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].pts_90k, Some(Timestamp90k(1500)));
        assert_eq!(units[1].pts_90k, None);
    }

    #[test]
    fn single_large_chunk_matches_small_chunks() {
        let mut data = annexb(&[&[0x67, 0x42, 0x00, 0x1E], &[0x68, 0xCE, 0x06, 0xE2]]);
        for i in 0..20_000u32 {
            let header = if i == 0 { 0x65 } else { 0x41 };
            data.extend_from_slice(&[0, 0, 1, 0x09, 0xF0]);
            data.extend_from_slice(&[0, 0, 1, header, 0x88, (i % 251) as u8 | 1]);
        }

        let mut assembler = AccessUnitAssembler::new();
        let mut whole = assembler.push_chunk(&data, Codec::H264, None).unwrap();
        assert_eq!(whole.len(), 19_999);
        assert!(assembler.pending_bytes() < 16);
        whole.extend(assembler.flush().unwrap());

        assert_eq!(whole.len(), 20_000);
        assert_eq!(whole, assemble(&data, Codec::H264, 1024));
        assert!(whole[0].is_keyframe);
        assert_eq!(whole[19_999].nalus.len(), 2);
    }

    #[test]
    fn flush_without_codec_is_rejected() {
        let mut assembler = AccessUnitAssembler::new();
        assert!(matches!(
            assembler.flush(),
            Err(BackendError::InvalidInput(_))
        ));
    }

    #[test]
    fn codec_switch_mid_stream_is_rejected() {
        let mut assembler = AccessUnitAssembler::new();
        let _ = assembler
            .push_chunk(&[0, 0, 1, 0x65, 0x88], Codec::H264, None)
            .unwrap();
        assert!(matches!(
            assembler.push_chunk(&[0, 0, 1], Codec::Hevc, None),
            Err(BackendError::InvalidInput(_))
        ));
    }

    #[test]
    fn unpack_length_prefixed_converts_nals() {
        let sample = [
            0, 0, 0, 2, 0x67, 0x64, //
            0, 0, 0, 3, 0x68, 0xEE, 0x3C,
        ];
        let annexb = unpack_length_prefixed(&sample).unwrap();
        assert_eq!(
            annexb,
            vec![
                0, 0, 0, 1, 0x67, 0x64, //
                0, 0, 0, 1, 0x68, 0xEE, 0x3C
            ]
        );
        assert_eq!(annexb, pack_annexb(&[vec![0x67, 0x64], vec![0x68, 0xEE, 0x3C]]));
    }

    #[test]
    fn from_nalus_detects_keyframes() {
        let idr = AccessUnit::from_nalus(Codec::H264, vec![vec![0x67, 0x42], vec![0x65, 0x88]], None);
        assert!(idr.is_keyframe);
        assert_eq!(idr.payload_len(), 4);
        let cra = AccessUnit::from_nalus(Codec::Hevc, vec![vec![0x2A, 0x01, 0x80]], None);
        assert!(cra.is_keyframe);
        let trail = AccessUnit::from_nalus(Codec::Hevc, vec![vec![0x02, 0x01, 0x80]], None);
        assert!(!trail.is_keyframe);
    }

    #[test]
    fn unpack_length_prefixed_rejects_truncation() {
        assert!(matches!(
            unpack_length_prefixed(&[0, 0, 0, 5, 0x67]),
            Err(BackendError::InvalidBitstream(_))
        ));
        assert!(matches!(
            unpack_length_prefixed(&[0, 0, 0, 1, 0x67, 0x00]),
            Err(BackendError::InvalidBitstream(_))
        ));
        assert!(matches!(
            unpack_length_prefixed(&[0, 0, 0, 0]),
            Err(BackendError::InvalidBitstream(_))
        ));
    }
}
