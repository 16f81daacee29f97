//! The transform engine: element consumers and their composition.
//!
//! A transform is a function of `(builder, element)`. The default behavior
//! for every element is a single `builder.with(element)` call; a transform
//! replaces or drops an element by calling `with` differently, or injects
//! new elements by calling it more than once. Composition links tail to
//! head: in `and_then(f, g)`, whatever `f` emits streams through `g` before
//! reaching the terminal builder that owns the assembler and pool.

use crate::builder::{ClassBuilder, ClassElement, CodeBuilder};
use crate::code::CodeElement;
use crate::error::Result;

/// A class-level transform.
pub type ClassTransformFn<'a> =
    Box<dyn FnMut(&mut ClassBuilder, &ClassElement<'_>) -> Result<()> + 'a>;

/// A code-level transform.
pub type CodeTransformFn<'a> =
    Box<dyn FnMut(&mut CodeBuilder<'_>, &CodeElement) -> Result<()> + 'a>;

/// The identity class transform: every element passes through unchanged.
pub fn identity_class<'a>() -> ClassTransformFn<'a> {
    Box::new(|builder, element| builder.with(element))
}

/// The identity code transform.
pub fn identity_code<'a>() -> CodeTransformFn<'a> {
    Box::new(|builder, element| builder.with(element))
}

/// A class transform that passes everything through but routes each
/// method's code elements through `transform`.
pub fn transforming_code<'a>(mut transform: CodeTransformFn<'a>) -> ClassTransformFn<'a> {
    Box::new(move |builder, element| match element {
        ClassElement::Method(model) => {
            builder.add_method_from_model(model, Some(&mut transform))
        }
        other => builder.with(other),
    })
}

/// Chain two code transforms: `first`'s emissions are staged in the
/// builder's buffer, then replayed through `second`.
pub fn and_then<'a>(
    mut first: CodeTransformFn<'a>,
    mut second: CodeTransformFn<'a>,
) -> CodeTransformFn<'a> {
    Box::new(move |builder, element| {
        let staged = builder.stage(|staging| first(staging, element))?;
        for staged_element in &staged {
            second(builder, staged_element)?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{Instruction, Opcode};
    use crate::Classfile;

    fn sample_class() -> Vec<u8> {
        Classfile::new()
            .build("Sample", |class| {
                class.with_method(
                    crate::access_flags::MethodAccessFlags::PUBLIC
                        | crate::access_flags::MethodAccessFlags::STATIC,
                    "answer",
                    "()I",
                    |method| {
                        method.with_code(|code| {
                            code.const_int(41)?;
                            code.return_(Opcode::IReturn)
                        })
                    },
                )
            })
            .unwrap()
    }

    #[test]
    fn chained_transforms_stream_tail_to_head() {
        let classfile = Classfile::new();
        let model = classfile.parse(&sample_class()).unwrap();

        // first: duplicate every nop; second: count what flows past it
        let mut seen_by_second = 0usize;
        {
            let first: CodeTransformFn<'_> = Box::new(|builder, element| {
                builder.with(element)?;
                if matches!(element, CodeElement::Instruction(Instruction::Nop)) {
                    builder.with(element)?;
                }
                Ok(())
            });
            let second: CodeTransformFn<'_> = Box::new(|builder, element| {
                seen_by_second += 1;
                builder.with(element)
            });
            let bytes = classfile
                .transform(&model, transforming_code(and_then(first, second)))
                .unwrap();
            let reparsed = classfile.parse(&bytes).unwrap();
            assert_eq!(reparsed.methods().len(), 1);
        }
        // bipush + ireturn flowed through the chain
        assert!(seen_by_second >= 2);
    }

    #[test]
    fn dropping_transform_removes_instructions() {
        let classfile = Classfile::new();
        let model = classfile.parse(&sample_class()).unwrap();
        // Replace the pushed constant with a different one
        let rewrite: CodeTransformFn<'_> = Box::new(|builder, element| match element {
            CodeElement::Instruction(Instruction::Push { .. }) => builder.const_int(42),
            other => builder.with(other),
        });
        let bytes = classfile.transform(&model, transforming_code(rewrite)).unwrap();
        let reparsed = classfile.parse(&bytes).unwrap();
        let code = reparsed.methods()[0].code().unwrap().unwrap();
        // bipush 42; ireturn
        assert_eq!(code.code_bytes(), &[0x10, 42, 0xAC]);
    }
}
