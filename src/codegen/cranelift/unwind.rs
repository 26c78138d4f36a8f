//! Unwind metadata handed to the host
//!
//! A JIT-compiled method comes with two pieces of unwind information: the
//! frame descriptor Cranelift produced for the native code, and a table of
//! exception regions describing which clause each landing belongs to. The
//! region table uses the host's byte format:
//!
//! ```text
//! u32 count
//! count * { u32 clause, u8 kind, u32 handler block, u32 catch token, u32 landing sites }
//! ```
//!
//! All integers are little endian; a catch token of 0 means "no token".

use super::lower::LoweringStats;
use super::{CodegenError, CodegenResult};
use crate::ir::{ClauseKind, Method};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use cranelift_codegen::isa::unwind::UnwindInfo;
use std::io::Cursor;

/// One exception clause as the host unwinder sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionEntry {
    pub clause: u32,
    pub kind: ClauseKind,
    pub handler_block: u32,
    pub catch_token: Option<u32>,
    /// Exceptional edges that lead into the clause's landing block
    pub landing_sites: u32,
}

fn kind_code(kind: ClauseKind) -> u8 {
    match kind {
        ClauseKind::Catch => 0,
        ClauseKind::Finally => 1,
        ClauseKind::Filter => 2,
        ClauseKind::Fault => 3,
    }
}

fn kind_from_code(code: u8) -> CodegenResult<ClauseKind> {
    match code {
        0 => Ok(ClauseKind::Catch),
        1 => Ok(ClauseKind::Finally),
        2 => Ok(ClauseKind::Filter),
        3 => Ok(ClauseKind::Fault),
        other => Err(CodegenError::InternalError(format!("unknown clause kind {}", other))),
    }
}

/// Region table of a lowered method
pub fn regions(method: &Method, stats: &LoweringStats) -> Vec<RegionEntry> {
    method
        .clauses
        .iter()
        .enumerate()
        .map(|(index, clause)| RegionEntry {
            clause: index as u32,
            kind: clause.kind,
            handler_block: clause.handler_entry.0,
            catch_token: clause.catch_token,
            landing_sites: stats
                .exceptional_edges
                .iter()
                .filter(|edge| edge.clause == index)
                .count() as u32,
        })
        .collect()
}

pub fn encode_regions(entries: &[RegionEntry]) -> CodegenResult<Vec<u8>> {
    let mut out = Vec::with_capacity(4 + entries.len() * 17);
    out.write_u32::<LittleEndian>(entries.len() as u32)?;
    for entry in entries {
        out.write_u32::<LittleEndian>(entry.clause)?;
        out.write_u8(kind_code(entry.kind))?;
        out.write_u32::<LittleEndian>(entry.handler_block)?;
        out.write_u32::<LittleEndian>(entry.catch_token.unwrap_or(0))?;
        out.write_u32::<LittleEndian>(entry.landing_sites)?;
    }
    Ok(out)
}

pub fn decode_regions(bytes: &[u8]) -> CodegenResult<Vec<RegionEntry>> {
    let mut cursor = Cursor::new(bytes);
    let count = cursor.read_u32::<LittleEndian>()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let clause = cursor.read_u32::<LittleEndian>()?;
        let kind = kind_from_code(cursor.read_u8()?)?;
        let handler_block = cursor.read_u32::<LittleEndian>()?;
        let token = cursor.read_u32::<LittleEndian>()?;
        let landing_sites = cursor.read_u32::<LittleEndian>()?;
        entries.push(RegionEntry {
            clause,
            kind,
            handler_block,
            catch_token: (token != 0).then_some(token),
            landing_sites,
        });
    }
    Ok(entries)
}

/// Unwind information of one JIT-compiled method
#[derive(Debug, Clone)]
pub struct MethodUnwindInfo {
    /// Native frame descriptor; absent on targets without unwind support
    pub frame: Option<UnwindInfo>,
    pub regions: Vec<RegionEntry>,
}

impl MethodUnwindInfo {
    /// Region table in the host format
    pub fn encoded_regions(&self) -> CodegenResult<Vec<u8>> {
        encode_regions(&self.regions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_table_decodes() {
        let entries = vec![
            RegionEntry {
                clause: 0,
                kind: ClauseKind::Catch,
                handler_block: 3,
                catch_token: Some(0x0200_001c),
                landing_sites: 2,
            },
            RegionEntry {
                clause: 1,
                kind: ClauseKind::Finally,
                handler_block: 5,
                catch_token: None,
                landing_sites: 1,
            },
        ];
        let bytes = encode_regions(&entries).expect("encode");
        assert_eq!(bytes.len(), 4 + 2 * 17);
        assert_eq!(&bytes[..4], &[2, 0, 0, 0]);
        assert_eq!(decode_regions(&bytes).expect("decode"), entries);
    }

    #[test]
    fn test_truncated_table_is_an_error() {
        let err = decode_regions(&[1, 0, 0, 0, 7]).expect_err("truncated");
        assert!(matches!(err, CodegenError::IoError(_)));
        let err = decode_regions(&[1, 0, 0, 0, 0, 0, 0, 0, 9, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0])
            .expect_err("bad kind");
        assert!(matches!(err, CodegenError::InternalError(_)));
    }
}
