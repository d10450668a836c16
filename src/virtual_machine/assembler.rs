//! Assembly language parser and module compiler.
//!
//! Converts human-readable assembly source into a loadable module. Mnemonics
//! and operand shapes come from the [`for_each_instruction!`](crate::for_each_instruction)
//! table through [`Instruction`].
//!
//! # Syntax
//!
//! ```text
//! .label                       # label definition, alone on its line
//! mnemonic operand, operand    # optional comment
//! ```
//!
//! - Mnemonics are lowercase (e.g., `mov`, `call_far`)
//! - `s<n>` / `d<n>` address the stack (relative to `sp`) or the module code
//! - `<target><holder><n>` is indirect: the 2-byte offset stored at
//!   `<holder><n>` addresses the `<target>` segment (e.g. `ss8`)
//! - Immediates are decimal integers, `.label` (2-byte immediates only) or a
//!   direct pointer, which makes the immediate indirect
//! - Labels `.method_0`, `.method_1`, ... mark the method entry points
//! - Comments start with `#`; commas between operands are optional

use crate::error;
use crate::virtual_machine::errors::AsmError;
use crate::virtual_machine::isa::{Instruction, OperandKind};
use crate::virtual_machine::operand::{Operand, OperandWriter, PtrOperand, Segment};
use crate::virtual_machine::program::{Header, METHODS_MIN, MODULE_SIZE_MAX, MODULE_VERSION};
use std::collections::HashMap;
use std::fmt::Write;
use std::fs;
use std::path::Path;

const COMMENT_CHAR: char = '#';
const LABEL_PREFIX: char = '.';
const METHOD_PREFIX: &str = "method_";

/// Formats a compiler-style diagnostic for assembly failures.
pub fn render_diagnostic(file: &str, source: &str, err: &AsmError) -> String {
    let mut diag = String::new();
    let _ = writeln!(diag, "error: {err}");
    let Some((line, column)) = err.location() else {
        let _ = writeln!(diag, " --> {file}");
        return diag;
    };
    let _ = writeln!(diag, " --> {file}:{line}:{column}");

    if let Some(raw_line) = source.lines().nth(line.saturating_sub(1)) {
        let line_text = raw_line.trim_end_matches('\r');
        let underline = " ".repeat(column.saturating_sub(1));
        let _ = writeln!(diag, "  |");
        let _ = writeln!(diag, "{:>4} | {}", line, line_text);
        let _ = writeln!(diag, "  | {}^", underline);
    }

    diag
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Token<'a> {
    text: &'a str,
    /// 1-based column in the line.
    column: usize,
}

/// Tokenize a single line of assembly.
///
/// Rules:
/// - `#` starts a comment
/// - commas and whitespace separate tokens
/// - every comma must follow a token and be followed by one
///
/// A misplaced comma is reported by its 1-based column.
fn tokenize(line: &str) -> Result<Vec<Token<'_>>, usize> {
    let mut out = Vec::with_capacity(6);
    let mut start: Option<usize> = None;
    // Column of a comma still waiting for its operand.
    let mut comma: Option<usize> = None;

    let code = line.split(COMMENT_CHAR).next().unwrap_or_default();
    for (i, c) in code.char_indices() {
        if c == ',' || c.is_whitespace() {
            if let Some(s) = start.take() {
                out.push(Token {
                    text: &code[s..i],
                    column: s + 1,
                });
                comma = None;
            }
            if c == ',' {
                if comma.is_some() || out.is_empty() {
                    return Err(i + 1);
                }
                comma = Some(i + 1);
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        out.push(Token {
            text: &code[s..],
            column: s + 1,
        });
    } else if let Some(column) = comma {
        return Err(column);
    }
    Ok(out)
}

fn is_label_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Definition site and pending uses of one label.
#[derive(Debug, Default)]
struct Label {
    /// Offset in the code body, once defined.
    pos: Option<usize>,
    def: (usize, usize),
    /// Positions of 2-byte immediates to patch, with their source location.
    refs: Vec<(usize, usize, usize)>,
}

/// Line-at-a-time assembler.
///
/// [`parse_once`](Compiler::parse_once) consumes one source line;
/// [`finalize`](Compiler::finalize) parses whatever is left, resolves labels
/// and prepends the module header.
pub struct Compiler<'a> {
    lines: Vec<&'a str>,
    /// Index of the next line to parse.
    line: usize,
    out: OperandWriter,
    labels: HashMap<String, Label>,
}

impl<'a> Compiler<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            lines: source.lines().collect(),
            line: 0,
            out: OperandWriter::new(),
            labels: HashMap::new(),
        }
    }

    /// Restarts from the first line, dropping everything emitted so far.
    pub fn reset(&mut self) {
        self.line = 0;
        self.out = OperandWriter::new();
        self.labels.clear();
    }

    /// Size of the code body emitted so far.
    pub fn position(&self) -> usize {
        self.out.len()
    }

    /// Parses the next line. Returns `Ok(false)` once the source is exhausted.
    pub fn parse_once(&mut self) -> Result<bool, AsmError> {
        let Some(text) = self.lines.get(self.line).copied() else {
            return Ok(false);
        };
        self.line += 1;
        let line = self.line;

        let tokens = tokenize(text).map_err(|column| AsmError::Syntax {
            line,
            column,
            message: "missing operand around `,`".to_string(),
        })?;
        let Some((head, rest)) = tokens.split_first() else {
            return Ok(true);
        };

        if let Some(name) = head.text.strip_prefix(LABEL_PREFIX) {
            if let Some(extra) = rest.first() {
                return Err(AsmError::Syntax {
                    line,
                    column: extra.column,
                    message: format!("unexpected `{}` after label", extra.text),
                });
            }
            return self.define_label(name, line, head.column);
        }

        let instr = Instruction::from_mnemonic(head.text).ok_or_else(|| {
            AsmError::UnknownMnemonic {
                line,
                column: head.column,
                name: head.text.to_string(),
            }
        })?;
        let kinds = instr.operands();
        if kinds.len() != rest.len() {
            return Err(AsmError::ArityMismatch {
                line,
                column: head.column,
                mnemonic: instr.mnemonic(),
                expected: kinds.len(),
                actual: rest.len(),
            });
        }

        self.out.begin_instruction(instr as u8);
        for (token, kind) in rest.iter().zip(kinds) {
            self.emit_operand(line, token, *kind)?;
        }
        Ok(true)
    }

    fn define_label(&mut self, name: &str, line: usize, column: usize) -> Result<bool, AsmError> {
        if !is_label_name(name) {
            return Err(AsmError::Syntax {
                line,
                column,
                message: format!("invalid label name `{name}`"),
            });
        }
        let pos = self.out.len();
        let label = self.labels.entry(name.to_string()).or_default();
        if label.pos.is_some() {
            return Err(AsmError::DuplicateLabel {
                line,
                column,
                label: name.to_string(),
            });
        }
        label.pos = Some(pos);
        label.def = (line, column);
        Ok(true)
    }

    fn emit_operand(
        &mut self,
        line: usize,
        token: &Token<'_>,
        kind: OperandKind,
    ) -> Result<(), AsmError> {
        let Some(width) = kind.width() else {
            let ptr = parse_pointer(line, token)?.ok_or_else(|| AsmError::Syntax {
                line,
                column: token.column,
                message: format!("expected pointer, got `{}`", token.text),
            })?;
            self.out.write_ptr(&ptr);
            return Ok(());
        };

        if let Some(name) = token.text.strip_prefix(LABEL_PREFIX) {
            if width != 2 {
                return Err(AsmError::Syntax {
                    line,
                    column: token.column,
                    message: format!("label `{name}` needs a 2-byte immediate"),
                });
            }
            if !is_label_name(name) {
                return Err(AsmError::Syntax {
                    line,
                    column: token.column,
                    message: format!("invalid label name `{name}`"),
                });
            }
            let at = self.out.write_imm(&[0, 0]);
            self.labels
                .entry(name.to_string())
                .or_default()
                .refs
                .push((at, line, token.column));
            return Ok(());
        }

        let operand = match parse_pointer(line, token)? {
            Some(ptr) if ptr.deref.is_some() => {
                return Err(AsmError::Syntax {
                    line,
                    column: token.column,
                    message: format!("immediate `{}` cannot be doubly indirect", token.text),
                });
            }
            Some(ptr) => Operand::ImmIndirect {
                offset: ptr.offset,
                segment: ptr.segment,
            },
            None => Operand::Imm(parse_literal(line, token, width)?),
        };
        self.out.write_operand(&operand);
        Ok(())
    }

    /// Parses any remaining lines and produces the module bytes.
    pub fn finalize(mut self) -> Result<Vec<u8>, AsmError> {
        while self.parse_once()? {}

        let mut methods = Vec::new();
        while let Some(pos) = self
            .labels
            .get(&format!("{METHOD_PREFIX}{}", methods.len()))
            .and_then(|label| label.pos)
        {
            methods.push(pos);
        }
        if methods.len() < METHODS_MIN as usize {
            return Err(AsmError::TooFewMethods {
                found: methods.len(),
                min: METHODS_MIN as usize,
            });
        }
        let header_size = Header::size(methods.len());
        let size = header_size + self.out.len();
        if size > MODULE_SIZE_MAX {
            return Err(AsmError::CodeTooLarge { size });
        }

        // Report the earliest use of an undefined label.
        let undefined = self
            .labels
            .iter()
            .filter(|(_, label)| label.pos.is_none())
            .filter_map(|(name, label)| label.refs.first().map(|r| (r.1, r.2, name)))
            .min();
        if let Some((line, column, name)) = undefined {
            return Err(AsmError::UndefinedLabel {
                line,
                column,
                label: name.clone(),
            });
        }

        let code = self.out.bytes_mut();
        for label in self.labels.values() {
            let Some(pos) = label.pos else { continue };
            let target = ((header_size + pos) as u16).to_be_bytes();
            for (at, _, _) in &label.refs {
                code[*at..*at + 2].copy_from_slice(&target);
            }
        }

        let mut module = Vec::with_capacity(size);
        Header {
            version: MODULE_VERSION,
            methods: methods
                .iter()
                .map(|pos| (header_size + pos) as u16)
                .collect(),
        }
        .encode(&mut module);
        module.extend_from_slice(self.out.bytes());
        Ok(module)
    }
}

/// Parses `s<n>`, `d<n>` or an indirect `<target><holder><n>` token.
/// Returns `Ok(None)` when the token is not pointer-shaped.
fn parse_pointer(line: usize, token: &Token<'_>) -> Result<Option<PtrOperand>, AsmError> {
    let mut chars = token.text.chars();
    let Some(first) = chars.next().and_then(Segment::from_letter) else {
        return Ok(None);
    };
    let second = chars.next().and_then(Segment::from_letter);
    let digits = &token.text[if second.is_some() { 2 } else { 1 }..];
    if digits.is_empty() {
        return Err(AsmError::Syntax {
            line,
            column: token.column,
            message: format!("pointer `{}` lacks an offset", token.text),
        });
    }
    let value: i64 = digits.parse().map_err(|_| AsmError::Syntax {
        line,
        column: token.column,
        message: format!("invalid pointer offset `{}`", token.text),
    })?;
    if !(i16::MIN as i64..=u16::MAX as i64).contains(&value) {
        return Err(AsmError::LiteralOverflow {
            line,
            column: token.column,
            token: token.text.to_string(),
            width: 2,
        });
    }
    let offset = value as u16;
    Ok(Some(match second {
        Some(holder) => PtrOperand::indirect(first, holder, offset),
        None => PtrOperand::direct(first, offset),
    }))
}

/// Parses a decimal literal into `width` big-endian bytes. Accepts the
/// signed and unsigned ranges of the width.
fn parse_literal(line: usize, token: &Token<'_>, width: usize) -> Result<Vec<u8>, AsmError> {
    let value: i128 = token.text.parse().map_err(|_| AsmError::Syntax {
        line,
        column: token.column,
        message: format!("invalid literal `{}`", token.text),
    })?;
    let bits = 8 * width as u32;
    let min = -(1i128 << (bits - 1));
    let max = (1i128 << bits) - 1;
    if value < min || value > max {
        return Err(AsmError::LiteralOverflow {
            line,
            column: token.column,
            token: token.text.to_string(),
            width,
        });
    }
    let bytes = (value as u64).to_be_bytes();
    Ok(bytes[8 - width..].to_vec())
}

/// Assembles a complete source text into module bytes.
pub fn assemble_source(source: &str) -> Result<Vec<u8>, AsmError> {
    Compiler::new(source).finalize()
}

/// Assembles a file, logging a compiler-style diagnostic on failure.
pub fn assemble_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, AsmError> {
    let path_ref = path.as_ref();
    let name = path_ref.display().to_string();
    let source = fs::read_to_string(path_ref).map_err(|e| AsmError::Io {
        path: name.clone(),
        source: e.to_string(),
    })?;
    let result = assemble_source(&source);
    if let Err(err) = &result {
        error!("{}", render_diagnostic(&name, &source, err).trim_end());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::operand::OperandReader;
    use std::io::Write as _;

    const MINIMAL: &str = ".method_0\n    ret\n.method_1\n    ret\n";

    fn wrap(body: &str) -> String {
        format!(".method_0\n{body}\n.method_1\n    ret\n")
    }

    /// Decodes the first instruction after a two-method header.
    fn decode_first(module: &[u8]) -> (Instruction, Vec<Operand>) {
        let start = Header::size(2);
        let instr = Instruction::try_from(module[start]).unwrap();
        let mut reader = OperandReader::new(module, start, start + 1);
        let ops = instr
            .operands()
            .iter()
            .map(|k| reader.read_operand(*k).unwrap())
            .collect();
        reader.finish().unwrap();
        (instr, ops)
    }

    #[test]
    fn tokenize_tracks_columns() {
        let tokens = tokenize("  mov s0,d-4 ,  8 # trailing").unwrap();
        let texts: Vec<_> = tokens.iter().map(|t| (t.text, t.column)).collect();
        assert_eq!(texts, vec![("mov", 3), ("s0", 7), ("d-4", 10), ("8", 17)]);
        assert!(tokenize("# only a comment").unwrap().is_empty());
    }

    #[test]
    fn tokenize_rejects_empty_operands() {
        assert_eq!(tokenize("mov s0,,s1, 1"), Err(8));
        assert_eq!(tokenize("mov s0, s1 , ,1"), Err(14));
        assert_eq!(tokenize("mov s0, s1, 1,"), Err(14));
        assert_eq!(tokenize(", ret"), Err(1));

        let err = assemble_source(".method_0\n    mov s0,,s1,,,1\n.method_1\n    ret\n").unwrap_err();
        assert!(matches!(err, AsmError::Syntax { line: 2, column: 12, .. }));
    }

    #[test]
    fn minimal_module_layout() {
        let module = assemble_source(MINIMAL).unwrap();
        assert_eq!(module, vec![0, 1, 0, 2, 0, 8, 0, 9, 0x4A, 0x4A]);
    }

    #[test]
    fn pointer_and_immediate_operands() {
        let module = assemble_source(&wrap("    mov s-4, d10, 8")).unwrap();
        let (instr, ops) = decode_first(&module);
        assert_eq!(instr, Instruction::Mov);
        assert_eq!(
            ops,
            vec![
                Operand::Ptr(PtrOperand::direct(Segment::Stack, 0xFFFC)),
                Operand::Ptr(PtrOperand::direct(Segment::Code, 10)),
                Operand::Imm(vec![0, 8]),
            ]
        );
    }

    #[test]
    fn indirect_operands() {
        let module = assemble_source(&wrap("    mov ds8, s2, s4")).unwrap();
        let (_, ops) = decode_first(&module);
        assert_eq!(
            ops,
            vec![
                Operand::Ptr(PtrOperand::indirect(Segment::Code, Segment::Stack, 8)),
                Operand::Ptr(PtrOperand::direct(Segment::Stack, 2)),
                Operand::ImmIndirect {
                    offset: 4,
                    segment: Segment::Stack
                },
            ]
        );
    }

    #[test]
    fn negative_literals_are_twos_complement() {
        let module = assemble_source(&wrap("    mov2 s0, -2")).unwrap();
        let (_, ops) = decode_first(&module);
        assert_eq!(ops[1], Operand::Imm(vec![0xFF, 0xFE]));
    }

    #[test]
    fn labels_resolve_to_absolute_offsets() {
        let src = ".method_0\n    jmp .end\n    fail\n.end\n    ret\n.method_1\n    ret\n";
        let module = assemble_source(src).unwrap();
        // header 8, jmp = opcode + bit byte + 2 bytes, fail = 1 byte
        let (instr, ops) = decode_first(&module);
        assert_eq!(instr, Instruction::Jmp);
        assert_eq!(ops, vec![Operand::Imm(vec![0, 13])]);
        assert_eq!(module[13], Instruction::Ret as u8);
        assert_eq!(&module[4..8], &[0, 8, 0, 14]);
    }

    #[test]
    fn forward_and_backward_references_agree() {
        let src = ".method_0\n.top\n    jmp .top\n.method_1\n    jmp .top\n";
        let module = assemble_source(src).unwrap();
        assert_eq!(&module[10..12], &[0, 8]);
        assert_eq!(&module[14..16], &[0, 8]);
    }

    #[test]
    fn unknown_mnemonic_reports_location() {
        let err = assemble_source(&wrap("    mov s0, s1, 1\n    frob s0")).unwrap_err();
        assert!(matches!(
            err,
            AsmError::UnknownMnemonic { line: 3, column: 5, ref name } if name == "frob"
        ));
    }

    #[test]
    fn arity_is_checked() {
        let err = assemble_source(&wrap("    mov s0, s1")).unwrap_err();
        assert!(matches!(
            err,
            AsmError::ArityMismatch {
                mnemonic: "mov",
                expected: 3,
                actual: 2,
                ..
            }
        ));
    }

    #[test]
    fn literal_ranges() {
        assert!(assemble_source(&wrap("    mov1 s0, 255")).is_ok());
        assert!(assemble_source(&wrap("    mov1 s0, -128")).is_ok());
        for bad in ["    mov1 s0, 256", "    mov1 s0, -129", "    mov s70000, s0, 1"] {
            assert!(matches!(
                assemble_source(&wrap(bad)),
                Err(AsmError::LiteralOverflow { .. })
            ));
        }
        assert!(matches!(
            assemble_source(&wrap("    mov1 s0, x1")),
            Err(AsmError::Syntax { .. })
        ));
    }

    #[test]
    fn labels_only_fit_two_bytes() {
        let err = assemble_source(&wrap("    mov4 s0, .method_1")).unwrap_err();
        assert!(matches!(err, AsmError::Syntax { line: 2, column: 14, .. }));
    }

    #[test]
    fn pointer_operand_required() {
        let err = assemble_source(&wrap("    add_sig 5")).unwrap_err();
        assert!(matches!(err, AsmError::Syntax { line: 2, .. }));
    }

    #[test]
    fn label_errors() {
        let dup = assemble_source(".method_0\n.method_0\n    ret\n.method_1\n    ret\n");
        assert!(matches!(dup, Err(AsmError::DuplicateLabel { line: 2, .. })));

        let undefined = assemble_source(&wrap("    jz .nowhere"));
        assert!(matches!(
            undefined,
            Err(AsmError::UndefinedLabel { line: 2, column: 8, ref label }) if label == "nowhere"
        ));

        let trailing = assemble_source(".method_0 ret\n.method_1\n    ret\n");
        assert!(matches!(trailing, Err(AsmError::Syntax { line: 1, column: 11, .. })));
    }

    #[test]
    fn method_table_rules() {
        assert!(matches!(
            assemble_source(".method_0\n    ret\n"),
            Err(AsmError::TooFewMethods { found: 1, min: 2 })
        ));
        // only the contiguous run counts; `method_3` is an ordinary label
        let gap = ".method_0\n    ret\n.method_1\n    ret\n.method_3\n    jmp .method_3\n";
        let module = assemble_source(gap).unwrap();
        assert_eq!(&module[..8], &[0, 1, 0, 2, 0, 8, 0, 9]);
        assert_eq!(&module[10..], &[Instruction::Jmp as u8, 0, 0, 10]);
    }

    #[test]
    fn size_limit_counts_header() {
        let body = "    ret\n".repeat(MODULE_SIZE_MAX - Header::size(2) - 1);
        let src = format!(".method_0\n.method_1\n{body}");
        assert_eq!(assemble_source(&src).unwrap().len(), MODULE_SIZE_MAX - 1);
        let src = format!("{src}    ret\n    ret\n");
        assert!(matches!(
            assemble_source(&src),
            Err(AsmError::CodeTooLarge { size }) if size == MODULE_SIZE_MAX + 1
        ));
    }

    #[test]
    fn parse_once_steps_and_resets() {
        let mut compiler = Compiler::new(MINIMAL);
        assert!(compiler.parse_once().unwrap());
        assert_eq!(compiler.position(), 0);
        assert!(compiler.parse_once().unwrap());
        assert_eq!(compiler.position(), 1);
        compiler.reset();
        assert_eq!(compiler.position(), 0);
        for _ in 0..4 {
            assert!(compiler.parse_once().unwrap());
        }
        assert!(!compiler.parse_once().unwrap());
        assert_eq!(compiler.finalize().unwrap(), assemble_source(MINIMAL).unwrap());
    }

    #[test]
    fn diagnostic_points_at_column() {
        let src = wrap("    jz .nowhere");
        let err = assemble_source(&src).unwrap_err();
        let diag = render_diagnostic("test.asm", &src, &err);
        assert!(diag.starts_with("error: undefined label `nowhere`\n --> test.asm:2:8\n"));
        assert!(diag.contains("   2 |     jz .nowhere\n"));
        assert!(diag.ends_with("  |        ^\n"));
    }

    #[test]
    fn assemble_file_reads_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        assert_eq!(
            assemble_file(file.path()).unwrap(),
            assemble_source(MINIMAL).unwrap()
        );

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.asm");
        assert!(matches!(assemble_file(&missing), Err(AsmError::Io { .. })));
    }
}
