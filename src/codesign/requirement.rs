//! Requirement sets and best-effort expression rendering.
//!
//! Requirements are compiled expressions in a prefix bytecode. Only the
//! common opcodes are rendered; anything else is described by its size so
//! that offsets and lengths stay exact.

use std::fmt;

use super::reader::BlobReader;
use super::structs::*;
use crate::error::{Error, Result};
use crate::util::read_u32_be_at;

/// Requirement blob header: magic, length, kind.
const REQUIREMENT_HEADER_SIZE: usize = 12;

/// Expressions nested deeper than this are rendered opaquely.
const MAX_EXPRESSION_DEPTH: usize = 64;

/// A single requirement from a requirement set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Requirement kind
    pub kind: RequirementType,
    /// File offset of the requirement blob
    pub offset: u64,
    /// Length of the requirement blob
    pub length: u32,
    /// Textual rendering of the expression
    pub description: String,
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (@{}, {} bytes): {}",
            self.kind, self.offset, self.length, self.description
        )
    }
}

/// Parses a requirement set blob starting at `data[0]` (file offset `base`).
pub(crate) fn parse_requirement_set(data: &[u8], base: u64) -> Result<Vec<Requirement>> {
    let mut r = BlobReader::new(data, base, "requirement set");
    let magic = r.u32()?;
    if magic != CSMAGIC_REQUIREMENTS {
        return Err(Error::malformed_signature(
            base,
            format!("bad requirement set magic {magic:#010x}"),
        ));
    }
    let length = r.u32()? as usize;
    if length > data.len() {
        return Err(Error::malformed_signature(
            base,
            format!("requirement set length {length:#x} exceeds its blob"),
        ));
    }
    let count = r.u32()?;

    let mut requirements = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        let entry_pos = r.position() as u64;
        let kind = RequirementType::from(r.u32()?);
        let offset = r.u32()? as usize;

        let blob_len = read_u32_be_at(data, offset + 4)
            .filter(|_| offset + REQUIREMENT_HEADER_SIZE <= length)
            .ok_or_else(|| {
                Error::malformed_signature(
                    base + entry_pos,
                    format!("requirement offset {offset:#x} outside set of {length:#x} bytes"),
                )
            })? as usize;
        if read_u32_be_at(data, offset) != Some(CSMAGIC_REQUIREMENT) {
            return Err(Error::malformed_signature(
                base + offset as u64,
                "bad requirement magic",
            ));
        }
        if blob_len < REQUIREMENT_HEADER_SIZE || offset + blob_len > length {
            return Err(Error::malformed_signature(
                base + offset as u64,
                format!("requirement length {blob_len:#x} overflows the set"),
            ));
        }

        let expression = &data[offset + REQUIREMENT_HEADER_SIZE..offset + blob_len];
        requirements.push(Requirement {
            kind,
            offset: base + offset as u64,
            length: blob_len as u32,
            description: describe_expression(expression),
        });
    }

    Ok(requirements)
}

/// Renders a compiled requirement expression, falling back to its size.
pub fn describe_expression(expr: &[u8]) -> String {
    let mut decoder = ExprDecoder {
        r: BlobReader::new(expr, 0, "requirement expression"),
    };
    decoder
        .expr(0)
        .map(|(text, _)| text)
        .unwrap_or_else(|| format!("<{} bytes>", expr.len()))
}

// =============================================================================
// Expression Decoder
// =============================================================================

/// Binding strength used to decide where parentheses are needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    Or,
    And,
    Primary,
}

const OP_FLAG_MASK: u32 = 0xFF00_0000;

struct ExprDecoder<'a> {
    r: BlobReader<'a>,
}

impl ExprDecoder<'_> {
    fn expr(&mut self, depth: usize) -> Option<(String, Prec)> {
        if depth > MAX_EXPRESSION_DEPTH {
            return None;
        }
        let op = self.r.u32().ok()? & !OP_FLAG_MASK;

        let text = match op {
            0 => "never".to_string(),
            1 => "always".to_string(),
            2 => format!("identifier {}", self.string()?),
            3 => "anchor apple".to_string(),
            4 => {
                let slot = self.cert_slot()?;
                format!("certificate {slot} = {}", hex_literal(self.r.data_item().ok()?))
            }
            5 => {
                let key = self.string()?;
                format!("info[{}] = {}", unquote(&key), self.string()?)
            }
            6 | 7 => {
                let (prec, word) = if op == 6 {
                    (Prec::And, "and")
                } else {
                    (Prec::Or, "or")
                };
                let lhs = self.operand(depth, prec)?;
                let rhs = self.operand(depth, prec)?;
                return Some((format!("{lhs} {word} {rhs}"), prec));
            }
            8 => format!("cdhash {}", hex_literal(self.r.data_item().ok()?)),
            9 => format!("! {}", self.operand(depth, Prec::Primary)?),
            10 => {
                let key = self.string()?;
                format!("info[{}]{}", unquote(&key), self.match_suffix()?)
            }
            11 => {
                let slot = self.cert_slot()?;
                let key = self.string()?;
                format!("certificate {slot}[{}]{}", unquote(&key), self.match_suffix()?)
            }
            12 => format!("certificate {} trusted", self.cert_slot()?),
            13 => "anchor trusted".to_string(),
            14 | 17 | 22 => {
                let slot = self.cert_slot()?;
                let oid = decode_oid(self.r.data_item().ok()?)?;
                let prefix = match op {
                    14 => "field",
                    17 => "policy",
                    _ => "timestamp",
                };
                format!("certificate {slot}[{prefix}.{oid}]{}", self.match_suffix()?)
            }
            15 => "anchor apple generic".to_string(),
            16 => {
                let key = self.string()?;
                format!("entitlement[{}]{}", key, self.match_suffix()?)
            }
            18 => format!("anchor {}", unquote(&self.string()?)),
            19 => format!("({})", unquote(&self.string()?)),
            20 => format!("platform = {}", self.r.u32().ok()?),
            21 => "notarized".to_string(),
            23 => "legacy".to_string(),
            _ => return None,
        };
        Some((text, Prec::Primary))
    }

    /// Decodes a sub-expression, parenthesizing it if it binds looser than `prec`.
    fn operand(&mut self, depth: usize, prec: Prec) -> Option<String> {
        let (text, inner) = self.expr(depth + 1)?;
        Some(if inner < prec {
            format!("({text})")
        } else {
            text
        })
    }

    fn cert_slot(&mut self) -> Option<String> {
        Some(match self.r.u32().ok()? as i32 {
            0 => "leaf".to_string(),
            -1 => "root".to_string(),
            n => n.to_string(),
        })
    }

    /// Reads a data item and renders it as a quoted string or hex literal.
    fn string(&mut self) -> Option<String> {
        let data = self.r.data_item().ok()?;
        Some(match std::str::from_utf8(data) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => format!("\"{s}\""),
            _ => hex_literal(data),
        })
    }

    fn match_suffix(&mut self) -> Option<String> {
        let op = self.r.u32().ok()?;
        let suffix = match op {
            0 => " /* exists */".to_string(),
            1 => format!(" = {}", self.string()?),
            2 => format!(" ~ {}", self.string()?),
            3 => format!(" = {}*", self.string()?),
            4 => format!(" = *{}", self.string()?),
            5 => format!(" < {}", self.string()?),
            6 => format!(" > {}", self.string()?),
            7 => format!(" <= {}", self.string()?),
            8 => format!(" >= {}", self.string()?),
            9..=13 => {
                let word = ["=", "<", ">", "<=", ">="][(op - 9) as usize];
                format!(" {word} timestamp {}", self.r.u64().ok()? as i64)
            }
            14 => " absent".to_string(),
            _ => return None,
        };
        Some(suffix)
    }
}

fn hex_literal(data: &[u8]) -> String {
    format!("H\"{}\"", hex::encode(data))
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

/// Decodes DER object identifier content octets into dotted form.
fn decode_oid(data: &[u8]) -> Option<String> {
    let (&first, rest) = data.split_first()?;
    let top = (first / 40).min(2);
    let mut arcs = vec![top as u64, (first - 40 * top) as u64];
    let mut value: u64 = 0;
    for &b in rest {
        value = value.checked_mul(128)? | (b & 0x7F) as u64;
        if b & 0x80 == 0 {
            arcs.push(value);
            value = 0;
        }
    }
    Some(
        arcs.iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join("."),
    )
}
