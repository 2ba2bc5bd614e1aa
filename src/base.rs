//! BASE (Broadcast Audio Source Endpoint) parser.
//!
//! A strict, bounded parser over the blob a broadcast source advertises: a
//! header, then one subgroup per advertised codec configuration, each
//! carrying a flat list of BISes. Capability and metadata blobs are treated
//! as opaque bytes of the declared length — this parser never interprets
//! their LTV contents, only frames them, and tolerates trailing junk within
//! a subgroup.
//!
//! All integers are little-endian.

use crate::error::ParseError;
use crate::pac::{CapabilityRegistry, PacHandle};
use crate::types::{CodecId, LtvBlob};

/// One BIS matched against the local capability set while parsing a BASE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedBis {
    pub local_pac: PacHandle,
    pub capabilities: LtvBlob,
    pub metadata: LtvBlob,
    pub bis_index: u8,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8, ParseError> {
        let b = self.bytes(1)?[0];
        Ok(b)
    }

    fn u16_le(&mut self) -> Result<u16, ParseError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u24_le(&mut self) -> Result<u32, ParseError> {
        let b = self.bytes(3)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        if self.remaining() < n {
            return Err(ParseError::LengthOverrun {
                field: "base",
                len: n,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

/// One BIS entry to serialize into a subgroup by [`encode_base`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeBis {
    pub bis_index: u8,
    pub level_3_caps: LtvBlob,
}

/// One subgroup to serialize by [`encode_base`]: a codec descriptor shared
/// by every BIS in it, plus the BISes themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeSubgroup {
    pub codec: CodecId,
    pub level_2_caps: LtvBlob,
    pub metadata: LtvBlob,
    pub bises: Vec<EncodeBis>,
}

/// Serializes a BASE blob in the same field order [`parse_base`] reads:
/// 24-bit presentation delay, subgroup count, then per subgroup the BIS
/// count, codec descriptor, level-2 caps, metadata, and per-BIS index plus
/// level-3 caps. The inverse of `parse_base` for well-formed input.
pub fn encode_base(presentation_delay: u32, subgroups: &[EncodeSubgroup]) -> LtvBlob {
    let mut out = Vec::new();
    out.extend_from_slice(&presentation_delay.to_le_bytes()[..3]);
    out.push(subgroups.len() as u8);
    for sg in subgroups {
        out.push(sg.bises.len() as u8);
        out.push(sg.codec.id);
        out.extend_from_slice(&sg.codec.company_id.to_le_bytes());
        out.extend_from_slice(&sg.codec.vendor_id.to_le_bytes());
        out.push(sg.level_2_caps.len() as u8);
        out.extend_from_slice(&sg.level_2_caps);
        out.push(sg.metadata.len() as u8);
        out.extend_from_slice(&sg.metadata);
        for bis in &sg.bises {
            out.push(bis.bis_index);
            out.push(bis.level_3_caps.len() as u8);
            out.extend_from_slice(&bis.level_3_caps);
        }
    }
    out
}

/// Parses `base_blob` against `cr`'s local PAC set, returning every matched
/// BIS. The presentation delay parsed from the header is the value a real
/// caller would fold into each derived Setup's broadcast QoS — this parser
/// only frames the structure, it doesn't own QoS assembly.
///
/// Any length overrun aborts parsing of the subgroup it occurs in and
/// discards that subgroup; BISes already matched from earlier subgroups are
/// kept, and later subgroups still get a chance to parse.
pub fn parse_base(base_blob: &[u8], cr: &CapabilityRegistry) -> Vec<MatchedBis> {
    let mut cursor = Cursor::new(base_blob);
    let mut results = Vec::new();

    let _presentation_delay = match cursor.u24_le() {
        Ok(v) => v,
        Err(_) => return results,
    };
    let subgroup_count = match cursor.u8() {
        Ok(v) => v,
        Err(_) => return results,
    };

    for _ in 0..subgroup_count {
        if parse_subgroup(&mut cursor, cr, &mut results).is_err() {
            break;
        }
    }
    results
}

fn parse_subgroup(
    cursor: &mut Cursor<'_>,
    cr: &CapabilityRegistry,
    results: &mut Vec<MatchedBis>,
) -> Result<(), ParseError> {
    let bis_count = cursor.u8()?;
    let codec = CodecId {
        id: cursor.u8()?,
        company_id: cursor.u16_le()?,
        vendor_id: cursor.u16_le()?,
    };
    let level_2_len = cursor.u8()? as usize;
    let level_2_caps = cursor.bytes(level_2_len)?;
    let metadata_len = cursor.u8()? as usize;
    let metadata = cursor.bytes(metadata_len)?;

    for _ in 0..bis_count {
        let bis_index = cursor.u8()?;
        let level_3_len = cursor.u8()? as usize;
        let level_3_caps = cursor.bytes(level_3_len)?;

        if let Some((local_pac, capabilities)) = cr.verify_bis(codec, level_2_caps, level_3_caps) {
            results.push(MatchedBis {
                local_pac,
                capabilities,
                metadata: metadata.to_vec(),
                bis_index,
            });
        }
    }
    Ok(())
}
