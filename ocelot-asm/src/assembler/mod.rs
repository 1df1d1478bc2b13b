//! The instruction text front end.
//!
//! Patch composition often starts from textual assembly: either typed by
//! a user or printed earlier by this crate. This module parses such text
//! back into a neutral [`ParsedInsn`] form that the architecture's
//! [`ArchOps::parse_insn`] implementation turns into an [`Instruction`].
//!
//! Full printed lines are accepted: an address prefix and the coding hex
//! bytes are recognised and stripped, and the trailing data-reference
//! comment is ignored.
//!
//! [`ParsedInsn`]: struct.ParsedInsn.html
//! [`ArchOps::parse_insn`]: ../arch/trait.ArchOps.html#tymethod.parse_insn
//! [`Instruction`]: ../insn/struct.Instruction.html

pub mod lexer;
pub mod parser;

use std::fmt;

use thiserror::Error;

use crate::arch::ArchDescriptor;
use lexer::Token;

/// An error raised while parsing instruction text.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ParseError {
    message: String,
}

impl ParseError {
    /// Builds an error from its message.
    pub fn new(message: impl Into<String>) -> Self {
        ParseError {
            message: message.into(),
        }
    }

    /// Builds the error reporting an unknown mnemonic.
    pub fn unknown_mnemonic(mnemonic: impl fmt::Display) -> Self {
        ParseError::new(format!("unknown mnemonic \"{}\"", mnemonic))
    }
}

/// A parsed operand, before architecture interpretation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParsedOperand {
    /// A register, as an index into the architecture's register table.
    Reg(u16),
    /// An immediate value.
    Imm(i64),
    /// A code or data address.
    Addr(u64),
    /// A memory access.
    Mem {
        /// The base register.
        base: u16,
        /// The constant displacement.
        offset: i64,
        /// Whether the base register is written back.
        writeback: bool,
        /// Whether the displacement applies after the access.
        post: bool,
    },
}

/// One parsed line of instruction text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedInsn {
    /// The full mnemonic, including any condition suffix.
    pub mnemonic: String,
    /// The operands, in order.
    pub operands: Vec<ParsedOperand>,
    /// The instruction address, when the line carried one.
    pub address: Option<u64>,
}

/// Parses one line of instruction text against an architecture
/// descriptor.
pub fn parse_line(desc: &ArchDescriptor, text: &str) -> Result<ParsedInsn, ParseError> {
    // Strip the trailing data-reference comment, if any.
    let text = match text.find("\t#") {
        Some(pos) => &text[..pos],
        None => text,
    };

    // A printed line is `address:<TAB>coding<TAB>asm`; bare assembly
    // text is a single field.
    let fields: Vec<&str> = text.split('\t').filter(|f| !f.trim().is_empty()).collect();
    if fields.is_empty() {
        return Err(ParseError::new("empty instruction text"));
    }
    let mut address = None;
    let asm = *fields.last().unwrap();
    let first = fields[0].trim();
    if fields.len() > 1 && first.ends_with(':') {
        let addr_text = &first[..first.len() - 1];
        address = Some(
            u64::from_str_radix(addr_text, 16)
                .map_err(|_| ParseError::new(format!("bad address \"{}\"", addr_text)))?,
        );
    }

    let tokens = lexer::tokenize(asm)?;
    let mut it = tokens.into_iter().peekable();

    let mnemonic = match it.next() {
        Some(Token::Ident(m)) => m.to_string(),
        _ => return Err(ParseError::new("missing mnemonic")),
    };

    let mut operands = Vec::new();
    while let Some(token) = it.next() {
        let op = match token {
            Token::Comma => continue,
            Token::Ident(name) => match reg_lookup(desc, name) {
                Some(reg) => ParsedOperand::Reg(reg),
                None => return Err(ParseError::new(format!("unknown operand \"{}\"", name))),
            },
            Token::Immediate(v) => ParsedOperand::Imm(v),
            Token::Address(a) => ParsedOperand::Addr(a),
            Token::LBracket => {
                let base = match it.next() {
                    Some(Token::Ident(name)) => reg_lookup(desc, name).ok_or_else(|| {
                        ParseError::new(format!("unknown base register \"{}\"", name))
                    })?,
                    _ => return Err(ParseError::new("expected a base register")),
                };
                let mut offset = 0;
                let mut post = false;
                let mut writeback = false;
                match it.next() {
                    Some(Token::Comma) => {
                        match it.next() {
                            Some(Token::Immediate(v)) => offset = v,
                            _ => return Err(ParseError::new("expected a displacement")),
                        }
                        match it.next() {
                            Some(Token::RBracket) => {}
                            _ => return Err(ParseError::new("expected `]`")),
                        }
                        if let Some(Token::Bang) = it.peek() {
                            it.next();
                            writeback = true;
                        }
                    }
                    Some(Token::RBracket) => {
                        // `[base], #off` applies the displacement after
                        // the access.
                        if let Some(Token::Comma) = it.peek() {
                            it.next();
                            match it.next() {
                                Some(Token::Immediate(v)) => {
                                    offset = v;
                                    post = true;
                                }
                                _ => return Err(ParseError::new("expected a displacement")),
                            }
                        }
                    }
                    _ => return Err(ParseError::new("unterminated memory operand")),
                }
                ParsedOperand::Mem {
                    base,
                    offset,
                    writeback,
                    post,
                }
            }
            other => {
                return Err(ParseError::new(format!(
                    "unexpected token {:?} in operand list",
                    other
                )))
            }
        };
        operands.push(op);
    }

    Ok(ParsedInsn {
        mnemonic,
        operands,
        address,
    })
}

fn reg_lookup(desc: &ArchDescriptor, name: &str) -> Option<u16> {
    desc.reg_names
        .iter()
        .position(|r| *r == name)
        .map(|i| i as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::a64::A64_DESCRIPTOR;

    #[test]
    fn parses_a_bare_mnemonic() {
        let parsed = parse_line(&A64_DESCRIPTOR, "hint").unwrap();
        assert_eq!(parsed.mnemonic, "hint");
        assert!(parsed.operands.is_empty());
        assert_eq!(parsed.address, None);
    }

    #[test]
    fn parses_a_full_printed_line() {
        let parsed = parse_line(&A64_DESCRIPTOR, "1000:\t1f 20 03 d5\thint").unwrap();
        assert_eq!(parsed.mnemonic, "hint");
        assert_eq!(parsed.address, Some(0x1000));
    }

    #[test]
    fn strips_the_reference_comment() {
        let parsed =
            parse_line(&A64_DESCRIPTOR, "3000:\t58 00 00 e0\tldr x0, 0x301c\t# 0x301c <var_x>")
                .unwrap();
        assert_eq!(parsed.mnemonic, "ldr");
        assert_eq!(
            parsed.operands,
            vec![ParsedOperand::Reg(0), ParsedOperand::Addr(0x301c)]
        );
    }

    #[test]
    fn parses_registers_and_immediates() {
        let parsed = parse_line(&A64_DESCRIPTOR, "add x0, x1, #0x2a").unwrap();
        assert_eq!(
            parsed.operands,
            vec![
                ParsedOperand::Reg(0),
                ParsedOperand::Reg(1),
                ParsedOperand::Imm(0x2a)
            ]
        );
    }

    #[test]
    fn parses_memory_operands() {
        let parsed = parse_line(&A64_DESCRIPTOR, "str x9, [sp, #-16]!").unwrap();
        assert_eq!(
            parsed.operands[1],
            ParsedOperand::Mem {
                base: 31,
                offset: -16,
                writeback: true,
                post: false
            }
        );

        let parsed = parse_line(&A64_DESCRIPTOR, "ldr x9, [sp], #16").unwrap();
        assert_eq!(
            parsed.operands[1],
            ParsedOperand::Mem {
                base: 31,
                offset: 16,
                writeback: false,
                post: true
            }
        );
    }

    #[test]
    fn parses_condition_suffixes_as_part_of_the_mnemonic() {
        let parsed = parse_line(&A64_DESCRIPTOR, "b.ne 0x5008").unwrap();
        assert_eq!(parsed.mnemonic, "b.ne");
        assert_eq!(parsed.operands, vec![ParsedOperand::Addr(0x5008)]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_line(&A64_DESCRIPTOR, "add x0, ???").is_err());
        assert!(parse_line(&A64_DESCRIPTOR, "").is_err());
    }
}
