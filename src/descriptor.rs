//! Field and method descriptor parsing, [JVMS §4.3][0].
//!
//! Only as much structure as the code pipeline needs: slot widths for
//! computing locals, and component types for the verifier.
//!
//! [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.3

use crate::error::{Error, Result};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BaseType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum FieldType {
    Base(BaseType),
    /// Binary class name, no `L;` wrapping.
    Object(String),
    Array(Box<FieldType>),
}

impl FieldType {
    /// Local-variable slots the type occupies (2 for long/double).
    pub fn slot_width(&self) -> u16 {
        match self {
            FieldType::Base(BaseType::Long) | FieldType::Base(BaseType::Double) => 2,
            _ => 1,
        }
    }

    /// The descriptor string form, e.g. `[Ljava/lang/String;`.
    pub fn render(&self) -> String {
        match self {
            FieldType::Base(BaseType::Byte) => "B".to_string(),
            FieldType::Base(BaseType::Char) => "C".to_string(),
            FieldType::Base(BaseType::Double) => "D".to_string(),
            FieldType::Base(BaseType::Float) => "F".to_string(),
            FieldType::Base(BaseType::Int) => "I".to_string(),
            FieldType::Base(BaseType::Long) => "J".to_string(),
            FieldType::Base(BaseType::Short) => "S".to_string(),
            FieldType::Base(BaseType::Boolean) => "Z".to_string(),
            FieldType::Object(name) => format!("L{name};"),
            FieldType::Array(component) => format!("[{}", component.render()),
        }
    }

    fn parse_from(chars: &[u8], at: &mut usize, descriptor: &str) -> Result<FieldType> {
        let bad = || Error::Malformed(format!("invalid descriptor {descriptor:?}"));
        let c = *chars.get(*at).ok_or_else(bad)?;
        *at += 1;
        Ok(match c {
            b'B' => FieldType::Base(BaseType::Byte),
            b'C' => FieldType::Base(BaseType::Char),
            b'D' => FieldType::Base(BaseType::Double),
            b'F' => FieldType::Base(BaseType::Float),
            b'I' => FieldType::Base(BaseType::Int),
            b'J' => FieldType::Base(BaseType::Long),
            b'S' => FieldType::Base(BaseType::Short),
            b'Z' => FieldType::Base(BaseType::Boolean),
            b'L' => {
                let start = *at;
                while *chars.get(*at).ok_or_else(bad)? != b';' {
                    *at += 1;
                }
                let name = std::str::from_utf8(&chars[start..*at]).map_err(|_| bad())?;
                *at += 1;
                FieldType::Object(name.to_string())
            }
            b'[' => FieldType::Array(Box::new(FieldType::parse_from(chars, at, descriptor)?)),
            _ => return Err(bad()),
        })
    }

    pub fn parse(descriptor: &str) -> Result<FieldType> {
        let mut at = 0;
        let parsed = FieldType::parse_from(descriptor.as_bytes(), &mut at, descriptor)?;
        if at != descriptor.len() {
            return Err(Error::Malformed(format!(
                "trailing characters in descriptor {descriptor:?}"
            )));
        }
        Ok(parsed)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MethodDescriptor {
    pub parameters: Vec<FieldType>,
    /// `None` for `void`.
    pub return_type: Option<FieldType>,
}

impl MethodDescriptor {
    pub fn parse(descriptor: &str) -> Result<MethodDescriptor> {
        let bad = || Error::Malformed(format!("invalid method descriptor {descriptor:?}"));
        let chars = descriptor.as_bytes();
        if chars.first() != Some(&b'(') {
            return Err(bad());
        }
        let mut at = 1;
        let mut parameters = vec![];
        while *chars.get(at).ok_or_else(bad)? != b')' {
            parameters.push(FieldType::parse_from(chars, &mut at, descriptor)?);
        }
        at += 1;
        let return_type = if chars.get(at) == Some(&b'V') {
            at += 1;
            None
        } else {
            Some(FieldType::parse_from(chars, &mut at, descriptor)?)
        };
        if at != chars.len() {
            return Err(bad());
        }
        Ok(MethodDescriptor { parameters, return_type })
    }

    /// Slots the parameters occupy, not counting a `this` receiver.
    pub fn parameter_slots(&self) -> u16 {
        self.parameters.iter().map(FieldType::slot_width).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_signature() {
        let descriptor = MethodDescriptor::parse("(I[JLjava/lang/String;)V").unwrap();
        assert_eq!(descriptor.parameters.len(), 3);
        assert_eq!(descriptor.return_type, None);
        assert_eq!(descriptor.parameter_slots(), 3);
        assert_eq!(descriptor.parameters[1].render(), "[J");
    }

    #[test]
    fn wide_parameters_take_two_slots() {
        let descriptor = MethodDescriptor::parse("(DJ)D").unwrap();
        assert_eq!(descriptor.parameter_slots(), 4);
        assert_eq!(
            descriptor.return_type,
            Some(FieldType::Base(BaseType::Double))
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(MethodDescriptor::parse("()").is_err());
        assert!(MethodDescriptor::parse("(Q)V").is_err());
        assert!(MethodDescriptor::parse("I)V").is_err());
        assert!(FieldType::parse("Ljava/lang/String").is_err());
        assert!(FieldType::parse("II").is_err());
    }
}
