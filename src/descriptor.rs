//! Field and method descriptor parsing (JVMS 4.3). Grounded in the
//! teacher's `parse.rs::parse_field_type`/`parse_method_descriptor`, extended
//! to cover the full primitive-type letter set the teacher's own
//! `run.rs` already assumes exists (`Boolean`/`Byte`/`Char`/`Short`/`Float`/
//! `Double`/`Long`) but which its retrieved `parse.rs` snapshot never defined.

use std::{error::Error, str::Chars};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Byte,
    Char,
    Double,
    Float,
    Integer,
    Long,
    Short,
    Boolean,
    ClassInstance(String),
    Array(Box<FieldType>),
}

impl FieldType {
    pub fn as_class_instance(&self) -> Option<&str> {
        match self {
            FieldType::ClassInstance(name) => Some(name),
            _ => None,
        }
    }

    /// Number of 32-bit local-variable/operand-stack slots this type
    /// occupies (JVMS 2.6.1: only long and double are category 2).
    pub fn category(&self) -> u8 {
        match self {
            FieldType::Long | FieldType::Double => 2,
            _ => 1,
        }
    }

    pub fn descriptor_letter(&self) -> String {
        match self {
            FieldType::Byte => "B".to_string(),
            FieldType::Char => "C".to_string(),
            FieldType::Double => "D".to_string(),
            FieldType::Float => "F".to_string(),
            FieldType::Integer => "I".to_string(),
            FieldType::Long => "J".to_string(),
            FieldType::Short => "S".to_string(),
            FieldType::Boolean => "Z".to_string(),
            FieldType::ClassInstance(name) => format!("L{name};"),
            FieldType::Array(inner) => format!("[{}", inner.descriptor_letter()),
        }
    }
}

pub fn parse_field_type(chars: &mut Chars) -> Result<FieldType, Box<dyn Error>> {
    match chars.next().ok_or("empty field type")? {
        'B' => Ok(FieldType::Byte),
        'C' => Ok(FieldType::Char),
        'D' => Ok(FieldType::Double),
        'F' => Ok(FieldType::Float),
        'I' => Ok(FieldType::Integer),
        'J' => Ok(FieldType::Long),
        'S' => Ok(FieldType::Short),
        'Z' => Ok(FieldType::Boolean),
        'L' => Ok(FieldType::ClassInstance(chars.take_while(|c| *c != ';').collect())),
        '[' => Ok(FieldType::Array(Box::new(parse_field_type(chars)?))),
        other => Err(format!("invalid field type tag '{other}'").into()),
    }
}

#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub field_type: FieldType,
}

pub fn parse_field_descriptor(descriptor: &str) -> Result<FieldDescriptor, Box<dyn Error>> {
    Ok(FieldDescriptor { field_type: parse_field_type(&mut descriptor.chars())? })
}

#[derive(Debug, Clone)]
pub enum ReturnDescriptor {
    FieldType(FieldType),
    Void,
}

#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    pub parameter_descriptors: Vec<FieldType>,
    pub return_descriptor: ReturnDescriptor,
}

impl MethodDescriptor {
    /// Number of local-variable slots the parameters occupy (category-aware).
    pub fn parameter_slot_width(&self) -> usize {
        self.parameter_descriptors.iter().map(|t| t.category() as usize).sum()
    }
}

impl PartialEq for MethodDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.parameter_descriptors == other.parameter_descriptors
    }
}

pub fn parse_method_descriptor(descriptor: &str) -> Result<MethodDescriptor, Box<dyn Error>> {
    let mut chars = descriptor.chars();
    if chars.next() != Some('(') {
        return Err(format!("method descriptor {descriptor} missing opening '('").into());
    }

    let mut parameter_descriptors = vec![];
    loop {
        match chars.clone().next() {
            Some(')') => {
                chars.next();
                break;
            }
            Some(_) => parameter_descriptors.push(parse_field_type(&mut chars)?),
            None => return Err(format!("method descriptor {descriptor} missing ')'").into()),
        }
    }

    let return_descriptor = if chars.clone().next() == Some('V') {
        ReturnDescriptor::Void
    } else {
        ReturnDescriptor::FieldType(parse_field_type(&mut chars)?)
    };

    Ok(MethodDescriptor { parameter_descriptors, return_descriptor })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_void_no_arg_method() {
        let d = parse_method_descriptor("()V").unwrap();
        assert!(d.parameter_descriptors.is_empty());
        assert!(matches!(d.return_descriptor, ReturnDescriptor::Void));
    }

    #[test]
    fn parses_main_method_descriptor() {
        let d = parse_method_descriptor("([Ljava/lang/String;)V").unwrap();
        assert_eq!(d.parameter_descriptors.len(), 1);
        assert!(matches!(d.parameter_descriptors[0], FieldType::Array(_)));
    }

    #[test]
    fn long_and_double_are_category_two() {
        assert_eq!(FieldType::Long.category(), 2);
        assert_eq!(FieldType::Double.category(), 2);
        assert_eq!(FieldType::Integer.category(), 1);
    }
}
