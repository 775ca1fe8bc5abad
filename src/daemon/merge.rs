//! Merge-operand protocol of the metadata KV engine.
//!
//! Size updates and creation are expressed as compact operands merged into
//! the stored record instead of read-modify-write round trips, which keeps
//! concurrent writers to one file from racing at the KV layer. The
//! serialized operand format is stable within a job: operands may sit in
//! the engine's log across restarts.
//!
//! An operand is `<id>:<params>`:
//!
//! * `i:<size>,<t|f>` - increase size; `t` marks an append.
//! * `d:<size>` - decrease size.
//! * `c:<serialized metadata>` - create-if-absent carrier.

use std::cmp;

use crate::error::{FsError, FsResult};
use crate::metadata::Metadata;

const OPERAND_ID_SUFFIX: char = ':';
const PARAM_SEPARATOR: char = ',';
const TRUE_CHAR: &str = "t";
const FALSE_CHAR: &str = "f";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOperand {
    /// Grow the size field. Append adds to the current size; a plain
    /// increase carries the requested logical end-of-file and the merge
    /// keeps the larger of current and requested.
    IncreaseSize { size: u64, append: bool },
    /// Shrink the size field to at most `size`.
    DecreaseSize { size: u64 },
    /// Create-if-absent: the payload becomes the record when none exists.
    Create { metadata: String },
}

impl MergeOperand {
    pub fn serialize(&self) -> String {
        match self {
            MergeOperand::IncreaseSize { size, append } => format!(
                "i{}{}{}{}",
                OPERAND_ID_SUFFIX,
                size,
                PARAM_SEPARATOR,
                if *append { TRUE_CHAR } else { FALSE_CHAR }
            ),
            MergeOperand::DecreaseSize { size } => format!("d{}{}", OPERAND_ID_SUFFIX, size),
            MergeOperand::Create { metadata } => format!("c{}{}", OPERAND_ID_SUFFIX, metadata),
        }
    }

    pub fn parse(serialized: &[u8]) -> FsResult<MergeOperand> {
        let malformed = || FsError::InvalidArgument("malformed merge operand".into());

        let s = std::str::from_utf8(serialized).map_err(|_| malformed())?;
        let sep = s.find(OPERAND_ID_SUFFIX).ok_or_else(malformed)?;
        let (id, params) = s.split_at(sep);
        let params = &params[1..];

        match id {
            "i" => {
                let mut parts = params.splitn(2, PARAM_SEPARATOR);
                let size = parts
                    .next()
                    .and_then(|p| p.parse::<u64>().ok())
                    .ok_or_else(malformed)?;
                let append = match parts.next() {
                    Some(TRUE_CHAR) => true,
                    Some(FALSE_CHAR) => false,
                    _ => return Err(malformed()),
                };
                Ok(MergeOperand::IncreaseSize { size, append })
            }
            "d" => {
                let size = params.parse::<u64>().map_err(|_| malformed())?;
                Ok(MergeOperand::DecreaseSize { size })
            }
            "c" => Ok(MergeOperand::Create {
                metadata: params.to_string(),
            }),
            _ => Err(malformed()),
        }
    }
}

fn apply(md: &mut Metadata, operand: &MergeOperand) {
    match operand {
        MergeOperand::IncreaseSize { size, append } => {
            if *append {
                md.set_size(md.size() + size);
            } else {
                md.set_size(cmp::max(md.size(), *size));
            }
        }
        MergeOperand::DecreaseSize { size } => {
            md.set_size(cmp::min(md.size(), *size));
        }
        // base exists: creation already happened, leave the record alone
        MergeOperand::Create { .. } => {}
    }
}

/// Apply a sequence of operands, in insertion order, to an optional base
/// record. With no base, the first `Create` supplies the record and later
/// `Create`s are ignored; size operands against a missing record are
/// dropped. Returns the new serialized record, or `None` when nothing was
/// created.
pub fn full_merge(base: Option<&[u8]>, operands: &[MergeOperand]) -> FsResult<Option<String>> {
    let mut record = match base {
        Some(raw) => {
            let s = std::str::from_utf8(raw)
                .map_err(|_| FsError::InvalidArgument("non-utf8 record".into()))?;
            Some(Metadata::deserialize(s)?)
        }
        None => None,
    };

    let compacted;
    let operands = if operands.len() > 1 {
        compacted = partial_merge(operands.to_vec());
        &compacted[..]
    } else {
        operands
    };

    for operand in operands {
        if let Some(md) = record.as_mut() {
            apply(md, operand);
        } else if let MergeOperand::Create { metadata } = operand {
            record = Some(Metadata::deserialize(metadata)?);
        }
        // a size edit against a missing record is dropped
    }

    Ok(record.map(|md| md.serialize()))
}

/// Compact a pending operand sequence without a base value. Runs of
/// `IncreaseSize` coalesce when all of them append (sizes add) or none do
/// (the max wins); runs of `DecreaseSize` collapse to their minimum.
/// Nothing coalesces across a `Create`.
pub fn partial_merge(operands: Vec<MergeOperand>) -> Vec<MergeOperand> {
    let mut out: Vec<MergeOperand> = Vec::with_capacity(operands.len());
    for op in operands {
        match (out.last_mut(), &op) {
            (
                Some(MergeOperand::IncreaseSize { size, append }),
                MergeOperand::IncreaseSize {
                    size: next,
                    append: next_append,
                },
            ) if *append == *next_append => {
                if *append {
                    *size += *next;
                } else {
                    *size = cmp::max(*size, *next);
                }
            }
            (
                Some(MergeOperand::DecreaseSize { size }),
                MergeOperand::DecreaseSize { size: next },
            ) => {
                *size = cmp::min(*size, *next);
            }
            _ => out.push(op),
        }
    }
    out
}
