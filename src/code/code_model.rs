//! The decoded view of one `Code` attribute.

use crate::attribute::Attribute;
use crate::bytes::ByteView;
use crate::code::instruction::{self, Instruction};
use crate::code::label::LabelContext;
use crate::code::{CodeElement, Label};
use crate::error::{Error, Result};
use crate::model::{scan_attributes, AttrSpan};
use crate::options::{DebugElementsOption, LineNumbersOption, Options, UnknownAttributesOption};
use crate::pool::{BoundPool, PoolRead};
use rustc_hash::FxHashSet;
use std::cell::{OnceCell, RefCell};
use std::rc::Rc;

/// A raw exception-table row, pcs unresolved.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    /// 0 is the catch-all.
    pub catch_type: u16,
}

/// A method body bound to the classfile buffer. The instruction stream and
/// its interleaved pseudo-elements materialize on the first call to
/// [`CodeModel::elements`] and are memoized.
pub struct CodeModel {
    data: Rc<[u8]>,
    pool: Rc<BoundPool>,
    options: Options,
    max_stack: u16,
    max_locals: u16,
    code_start: usize,
    code_len: usize,
    exception_entries: Vec<ExceptionTableEntry>,
    attr_spans: Vec<AttrSpan>,
    labels: RefCell<LabelContext>,
    elements: OnceCell<Vec<CodeElement>>,
}

impl CodeModel {
    pub(crate) fn decode(
        data: Rc<[u8]>,
        pool: Rc<BoundPool>,
        options: Options,
        payload_start: usize,
        payload_len: usize,
    ) -> Result<CodeModel> {
        let view = ByteView::new(&data);
        let max_stack = view.u2(payload_start)?;
        let max_locals = view.u2(payload_start + 2)?;
        let code_len = view.u4(payload_start + 4)? as usize;
        if code_len == 0 || code_len > u16::MAX as usize {
            return Err(Error::Malformed(format!("code length {code_len} out of range 1..65536")));
        }
        let code_start = payload_start + 8;
        view.read_bytes(code_start, code_len)?;
        let mut at = code_start + code_len;
        let entry_count = view.u2(at)? as usize;
        at += 2;
        let mut exception_entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            exception_entries.push(ExceptionTableEntry {
                start_pc: view.u2(at)?,
                end_pc: view.u2(at + 2)?,
                handler_pc: view.u2(at + 4)?,
                catch_type: view.u2(at + 6)?,
            });
            at += 8;
        }
        let (attr_spans, end) = scan_attributes(&view, at)?;
        if end != payload_start + payload_len {
            return Err(Error::Malformed(
                "Code attribute length disagrees with its contents".to_string(),
            ));
        }
        Ok(CodeModel {
            data,
            pool,
            options,
            max_stack,
            max_locals,
            code_start,
            code_len,
            exception_entries,
            attr_spans,
            labels: RefCell::new(LabelContext::new()),
            elements: OnceCell::new(),
        })
    }

    pub fn max_stack(&self) -> u16 {
        self.max_stack
    }

    pub fn max_locals(&self) -> u16 {
        self.max_locals
    }

    /// The raw code array.
    pub fn code_bytes(&self) -> &[u8] {
        &self.data[self.code_start..self.code_start + self.code_len]
    }

    pub fn exception_table(&self) -> &[ExceptionTableEntry] {
        &self.exception_entries
    }

    /// The bci a label of this model stands for.
    pub fn label_bci(&self, label: Label) -> Result<u32> {
        self.labels.borrow().bci(label)
    }

    /// The raw payload of the `StackMapTable` sub-attribute, if present.
    /// Frames are regenerated rather than passed through on writing, so
    /// this is the only way to inspect the source frames.
    pub fn stack_map_table_bytes(&self) -> Result<Option<&[u8]>> {
        for span in &self.attr_spans {
            if self.pool.utf8(span.name_index)? == "StackMapTable" {
                return Ok(Some(&self.data[span.start..span.start + span.len]));
            }
        }
        Ok(None)
    }

    /// The element stream: exception catches first, then instructions in bci
    /// order with labels and debug pseudo-elements interleaved at their bci.
    pub fn elements(&self) -> Result<&[CodeElement]> {
        if self.elements.get().is_none() {
            let built = self.build_elements()?;
            let _ = self.elements.set(built);
        }
        Ok(self.elements.get().expect("just initialized"))
    }

    fn build_elements(&self) -> Result<Vec<CodeElement>> {
        let code = ByteView::new(self.code_bytes());
        let mut labels = self.labels.borrow_mut();
        let pool_id = self.pool.pool_id();

        let mut instructions: Vec<(u32, Instruction)> = vec![];
        let mut boundaries: FxHashSet<u32> = FxHashSet::default();
        let mut bci = 0usize;
        while bci < self.code_len {
            let (insn, size) = instruction::decode(&code, bci, pool_id, &mut labels)?;
            boundaries.insert(bci as u32);
            instructions.push((bci as u32, insn));
            bci += size;
        }

        let mut elements: Vec<CodeElement> = vec![];

        for entry in &self.exception_entries {
            let end = entry.end_pc as usize;
            if entry.start_pc as usize > end || end > self.code_len {
                return Err(Error::Malformed(format!(
                    "exception table range {}..{} outside code of length {}",
                    entry.start_pc, entry.end_pc, self.code_len
                )));
            }
            let catch_type = if entry.catch_type == 0 {
                None
            } else {
                Some(self.pool.class_name(entry.catch_type)?.to_string())
            };
            elements.push(CodeElement::ExceptionCatch {
                start: labels.label_at_bci(entry.start_pc as u32),
                end: labels.label_at_bci(entry.end_pc as u32),
                handler: labels.label_at_bci(entry.handler_pc as u32),
                catch_type,
            });
        }

        let mut lines: Vec<(u32, u16)> = vec![];
        let mut locals: Vec<(u32, CodeElement)> = vec![];
        for span in &self.attr_spans {
            let name = self.pool.utf8(span.name_index)?;
            let payload = ByteView::new(&self.data[span.start..span.start + span.len]);
            match name {
                "StackMapTable" => {
                    // Regenerated from scratch when the output needs one
                }
                "LineNumberTable" => {
                    if self.options.line_numbers == LineNumbersOption::Drop {
                        continue;
                    }
                    let count = payload.u2(0)? as usize;
                    for i in 0..count {
                        lines.push((payload.u2(2 + 4 * i)? as u32, payload.u2(4 + 4 * i)?));
                    }
                }
                "LocalVariableTable" | "LocalVariableTypeTable" => {
                    if self.options.debug_elements == DebugElementsOption::Drop {
                        continue;
                    }
                    let count = payload.u2(0)? as usize;
                    for i in 0..count {
                        let at = 2 + 10 * i;
                        let start_pc = payload.u2(at)? as u32;
                        let length = payload.u2(at + 2)? as u32;
                        let var_name = self.pool.utf8(payload.u2(at + 4)?)?.to_string();
                        let type_string = self.pool.utf8(payload.u2(at + 6)?)?.to_string();
                        let slot = payload.u2(at + 8)?;
                        let start = labels.label_at_bci(start_pc);
                        let end = labels.label_at_bci(start_pc + length);
                        let element = if name == "LocalVariableTable" {
                            CodeElement::LocalVariable {
                                start,
                                end,
                                name: var_name,
                                descriptor: type_string,
                                slot,
                            }
                        } else {
                            CodeElement::LocalVariableType {
                                start,
                                end,
                                name: var_name,
                                signature: type_string,
                                slot,
                            }
                        };
                        locals.push((start_pc, element));
                    }
                }
                "RuntimeVisibleTypeAnnotations" | "RuntimeInvisibleTypeAnnotations" => {
                    elements.push(CodeElement::CodeAttribute(Attribute::Raw {
                        name: name.to_string(),
                        bytes: self.data[span.start..span.start + span.len].to_vec(),
                    }));
                }
                other => {
                    if self.options.unknown_attributes == UnknownAttributesOption::Pass {
                        elements.push(CodeElement::CodeAttribute(Attribute::Unknown {
                            name: other.to_string(),
                            bytes: self.data[span.start..span.start + span.len].to_vec(),
                        }));
                    }
                }
            }
        }

        // Every label must sit on an instruction boundary (or one past the
        // last instruction, for exclusive range ends)
        for label_bci in labels.bound_bcis() {
            if label_bci as usize != self.code_len && !boundaries.contains(&label_bci) {
                return Err(Error::Malformed(format!(
                    "bci {label_bci} is referenced but falls inside an instruction"
                )));
            }
        }

        lines.sort_by_key(|(bci, _)| *bci);
        locals.sort_by_key(|(bci, _)| *bci);
        let mut next_line = 0usize;
        let mut next_local = 0usize;
        for (bci, insn) in instructions {
            if let Some(label) = labels.bound_label_at(bci) {
                elements.push(CodeElement::Label(label));
            }
            while lines.get(next_line).is_some_and(|(at, _)| *at <= bci) {
                elements.push(CodeElement::LineNumber { line: lines[next_line].1 });
                next_line += 1;
            }
            while locals.get(next_local).is_some_and(|(at, _)| *at <= bci) {
                elements.push(locals[next_local].1.clone());
                next_local += 1;
            }
            elements.push(CodeElement::Instruction(insn));
        }
        if let Some(label) = labels.bound_label_at(self.code_len as u32) {
            elements.push(CodeElement::Label(label));
        }

        Ok(elements)
    }
}
