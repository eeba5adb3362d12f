//! The parsed, constant-pool-resolved representation of a class, and the
//! method-area `Klass` types built from it. Grounded in the teacher's
//! `parse.rs` (parsed representation) and `run.rs`'s `InstanceKlass`/
//! `ArrayKlass`/`Klass` trait (method-area linking), extended with the
//! constant kinds (`Integer`/`Float`/`Long`/`Double`/`InterfaceMethodref`/
//! `MethodType`) the teacher's own `run.rs` already assumes exist.

use std::{error::Error, fmt::Debug, rc::Rc};

use crate::{
    classfile::{ClassFile, CpInfo},
    descriptor::{parse_field_descriptor, parse_method_descriptor, FieldDescriptor, FieldType, MethodDescriptor},
};

#[derive(Debug, Clone, Default)]
pub struct Access {
    pub public: bool,
    pub private: bool,
    pub protected: bool,
    pub is_static: bool,
    pub is_final: bool,
    pub is_super: bool,
    pub interface: bool,
    pub is_abstract: bool,
    pub native: bool,
    pub is_synthetic: bool,
}

pub fn parse_access_flags(flags: u16) -> Access {
    Access {
        public: flags & 0x0001 != 0,
        private: flags & 0x0002 != 0,
        protected: flags & 0x0004 != 0,
        is_static: flags & 0x0008 != 0,
        is_final: flags & 0x0010 != 0,
        is_super: flags & 0x0020 != 0,
        native: flags & 0x0100 != 0,
        interface: flags & 0x0200 != 0,
        is_abstract: flags & 0x0400 != 0,
        is_synthetic: flags & 0x1000 != 0,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassInfo {
    pub name: String,
}

#[derive(Debug, Clone)]
pub enum RefKind {
    GetField,
    GetStatic,
    PutField,
    PutStatic,
    InvokeVirtual,
    InvokeStatic,
    InvokeSpecial,
    NewInvokeSpecial,
    InvokeInterface,
}

impl RefKind {
    fn from_tag(tag: u8) -> RefKind {
        match tag {
            1 => RefKind::GetField,
            2 => RefKind::GetStatic,
            3 => RefKind::PutField,
            4 => RefKind::PutStatic,
            5 => RefKind::InvokeVirtual,
            6 => RefKind::InvokeStatic,
            7 => RefKind::InvokeSpecial,
            8 => RefKind::NewInvokeSpecial,
            _ => RefKind::InvokeInterface,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Constant {
    Class(ClassInfo),
    Utf8(String),
    String(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    MethodRef(ClassInfo, Box<Constant>),
    FieldRef(ClassInfo, Box<Constant>),
    InterfaceMethodRef(ClassInfo, Box<Constant>),
    NameAndType(String, String),
    MethodType(String),
    InvokeDynamic(u16, Box<Constant>),
    MethodHandle(RefKind, Box<Constant>),
    Placeholder,
}

impl Constant {
    pub fn as_class(&self) -> Option<&ClassInfo> {
        match self {
            Constant::Class(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_utf8(&self) -> Option<&str> {
        match self {
            Constant::Utf8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_method_ref(&self) -> Option<(&ClassInfo, &Constant)> {
        match self {
            Constant::MethodRef(c, n) | Constant::InterfaceMethodRef(c, n) => Some((c, n)),
            _ => None,
        }
    }

    pub fn as_field_ref(&self) -> Option<(&ClassInfo, &Constant)> {
        match self {
            Constant::FieldRef(c, n) => Some((c, n)),
            _ => None,
        }
    }

    pub fn as_name_and_type(&self) -> Option<(&str, &str)> {
        match self {
            Constant::NameAndType(n, d) => Some((n, d)),
            _ => None,
        }
    }
}

/// Resolves constant-pool entry `index` (1-based) into a fully-formed
/// `Constant`, recursively resolving and memoizing dependencies in
/// `pool`. Mirrors the teacher's `parse_or_get_constant`.
pub fn resolve_constant(
    pool: &mut Vec<Constant>,
    raw: &[CpInfo],
    index: u16,
) -> Result<Constant, Box<dyn Error>> {
    if index == 0 {
        return Err("constant pool index 0 is reserved".into());
    }
    let slot = (index - 1) as usize;
    if !matches!(pool.get(slot).ok_or("constant pool index out of range")?, Constant::Placeholder) {
        return Ok(pool[slot].clone());
    }

    let cp_info = raw.get(slot).ok_or("constant pool index out of range")?;
    let constant = match cp_info {
        CpInfo::Class { name_index } => {
            let name = resolve_constant(pool, raw, *name_index)?;
            Constant::Class(ClassInfo { name: name.as_utf8().ok_or("class name is not utf8")?.to_string() })
        }
        CpInfo::Methodref { class_index, name_and_type_index } => {
            let class = resolve_constant(pool, raw, *class_index)?.as_class().ok_or("not a class")?.clone();
            let nat = resolve_constant(pool, raw, *name_and_type_index)?;
            Constant::MethodRef(class, Box::new(nat))
        }
        CpInfo::InterfaceMethodref { class_index, name_and_type_index } => {
            let class = resolve_constant(pool, raw, *class_index)?.as_class().ok_or("not a class")?.clone();
            let nat = resolve_constant(pool, raw, *name_and_type_index)?;
            Constant::InterfaceMethodRef(class, Box::new(nat))
        }
        CpInfo::Fieldref { class_index, name_and_type_index } => {
            let class = resolve_constant(pool, raw, *class_index)?.as_class().ok_or("not a class")?.clone();
            let nat = resolve_constant(pool, raw, *name_and_type_index)?;
            Constant::FieldRef(class, Box::new(nat))
        }
        CpInfo::String { string_index } => {
            let s = resolve_constant(pool, raw, *string_index)?;
            Constant::String(s.as_utf8().ok_or("string index is not utf8")?.to_string())
        }
        CpInfo::Integer { bytes } => Constant::Integer(*bytes as i32),
        CpInfo::Float { bytes } => Constant::Float(f32::from_bits(*bytes)),
        CpInfo::Long { high_bytes, low_bytes } => {
            Constant::Long((((*high_bytes as u64) << 32) | *low_bytes as u64) as i64)
        }
        CpInfo::Double { high_bytes, low_bytes } => {
            Constant::Double(f64::from_bits(((*high_bytes as u64) << 32) | *low_bytes as u64))
        }
        CpInfo::NameAndType { name_index, descriptor_index } => {
            let name = resolve_constant(pool, raw, *name_index)?;
            let descriptor = resolve_constant(pool, raw, *descriptor_index)?;
            Constant::NameAndType(
                name.as_utf8().ok_or("name is not utf8")?.to_string(),
                descriptor.as_utf8().ok_or("descriptor is not utf8")?.to_string(),
            )
        }
        CpInfo::Utf8 { bytes } => Constant::Utf8(String::from_utf8(bytes.clone())?),
        CpInfo::MethodType { descriptor_index } => {
            let d = resolve_constant(pool, raw, *descriptor_index)?;
            Constant::MethodType(d.as_utf8().ok_or("descriptor is not utf8")?.to_string())
        }
        CpInfo::InvokeDynamic { bootstrap_method_attr_index, name_and_type_index } => {
            let nat = resolve_constant(pool, raw, *name_and_type_index)?;
            Constant::InvokeDynamic(*bootstrap_method_attr_index, Box::new(nat))
        }
        CpInfo::MethodHandle { reference_kind, reference_index } => {
            let referenced = resolve_constant(pool, raw, *reference_index)?;
            Constant::MethodHandle(RefKind::from_tag(*reference_kind), Box::new(referenced))
        }
    };

    pool[slot] = constant.clone();
    Ok(constant)
}

#[derive(Debug, Clone)]
pub struct ExceptionTableItem {
    pub start_pc: usize,
    pub end_pc: usize,
    pub handler_pc: usize,
    /// Constant-pool index of the caught class, or `None` for `finally`
    /// (catch_type == 0, matches any throwable).
    pub catch_type: Option<u16>,
}

#[derive(Debug, Clone)]
pub enum Attribute {
    Code {
        max_stack: u16,
        max_locals: u16,
        bytes: Vec<u8>,
        exception_table: Vec<ExceptionTableItem>,
    },
    ConstantValue {
        constant_index: u16,
    },
    Other,
}

impl Attribute {
    pub fn as_code(&self) -> Option<(&[u8], u16, &[ExceptionTableItem])> {
        match self {
            Attribute::Code { bytes, max_locals, exception_table, .. } => {
                Some((bytes, *max_locals, exception_table))
            }
            _ => None,
        }
    }
}

fn parse_attribute(
    info: &crate::classfile::AttributeInfo,
    pool: &[Constant],
) -> Result<Attribute, Box<dyn Error>> {
    use byteorder::{BigEndian, ReadBytesExt};
    use std::io::{Cursor, Read};

    let name = pool
        .get((info.attribute_name_index - 1) as usize)
        .and_then(Constant::as_utf8)
        .ok_or("attribute name is not utf8")?;

    match name {
        "Code" => {
            let mut rdr = Cursor::new(&info.info);
            let max_stack = rdr.read_u16::<BigEndian>()?;
            let max_locals = rdr.read_u16::<BigEndian>()?;
            let code_length = rdr.read_u32::<BigEndian>()?;
            let mut bytes = vec![0u8; code_length as usize];
            rdr.read_exact(&mut bytes)?;

            let exception_table_length = rdr.read_u16::<BigEndian>()?;
            let mut exception_table = Vec::with_capacity(exception_table_length as usize);
            for _ in 0..exception_table_length {
                let start_pc = rdr.read_u16::<BigEndian>()? as usize;
                let end_pc = rdr.read_u16::<BigEndian>()? as usize;
                let handler_pc = rdr.read_u16::<BigEndian>()? as usize;
                let catch_type = rdr.read_u16::<BigEndian>()?;
                exception_table.push(ExceptionTableItem {
                    start_pc,
                    end_pc,
                    handler_pc,
                    catch_type: if catch_type == 0 { None } else { Some(catch_type) },
                });
            }
            // Remaining bytes are nested attributes (LineNumberTable etc.);
            // not needed for execution, skipped deliberately.
            Ok(Attribute::Code { max_stack, max_locals, bytes, exception_table })
        }
        "ConstantValue" => {
            let mut rdr = Cursor::new(&info.info);
            Ok(Attribute::ConstantValue { constant_index: rdr.read_u16::<BigEndian>()? })
        }
        _ => Ok(Attribute::Other),
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub access: Access,
    pub name: String,
    pub descriptor: FieldDescriptor,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct Method {
    pub access: Access,
    pub name: String,
    pub descriptor: MethodDescriptor,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug)]
pub struct Class {
    pub access: Access,
    pub constant_pool: Vec<Constant>,
    pub this_class: ClassInfo,
    pub super_class: Option<ClassInfo>,
    pub interfaces: Vec<ClassInfo>,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
}

pub fn parse_class(class_file: ClassFile) -> Result<Class, Box<dyn Error>> {
    let access = parse_access_flags(class_file.access_flags);
    let mut pool = vec![Constant::Placeholder; class_file.constant_pool.len()];

    let this_class = resolve_constant(&mut pool, &class_file.constant_pool, class_file.this_class)?
        .as_class()
        .ok_or("this_class is not a class constant")?
        .clone();

    let super_class = if class_file.super_class == 0 {
        None
    } else {
        Some(
            resolve_constant(&mut pool, &class_file.constant_pool, class_file.super_class)?
                .as_class()
                .ok_or("super_class is not a class constant")?
                .clone(),
        )
    };

    let mut interfaces = vec![];
    for index in &class_file.interfaces {
        interfaces.push(
            resolve_constant(&mut pool, &class_file.constant_pool, *index)?
                .as_class()
                .ok_or("interface is not a class constant")?
                .clone(),
        );
    }

    // Resolve every remaining pool entry up front so field/method parsing
    // below can borrow `pool` as fully resolved `Constant`s.
    for i in 0..pool.len() {
        if matches!(pool[i], Constant::Placeholder) {
            resolve_constant(&mut pool, &class_file.constant_pool, i as u16 + 1)?;
        }
    }

    let mut fields = vec![];
    for field_info in &class_file.fields {
        let access = parse_access_flags(field_info.access_flags);
        let name = pool
            .get((field_info.name_index - 1) as usize)
            .and_then(Constant::as_utf8)
            .ok_or("field name is not utf8")?
            .to_string();
        let descriptor_text = pool
            .get((field_info.descriptor_index - 1) as usize)
            .and_then(Constant::as_utf8)
            .ok_or("field descriptor is not utf8")?;
        let descriptor = parse_field_descriptor(descriptor_text)?;
        let mut attributes = vec![];
        for attribute_info in &field_info.attributes {
            attributes.push(parse_attribute(attribute_info, &pool)?);
        }
        fields.push(Field { access, name, descriptor, attributes });
    }

    let mut methods = vec![];
    for method_info in &class_file.methods {
        let access = parse_access_flags(method_info.access_flags);
        let name = pool
            .get((method_info.name_index - 1) as usize)
            .and_then(Constant::as_utf8)
            .ok_or("method name is not utf8")?
            .to_string();
        let descriptor_text = pool
            .get((method_info.descriptor_index - 1) as usize)
            .and_then(Constant::as_utf8)
            .ok_or("method descriptor is not utf8")?;
        let descriptor = parse_method_descriptor(descriptor_text)?;
        let mut attributes = vec![];
        for attribute_info in &method_info.attributes {
            attributes.push(parse_attribute(attribute_info, &pool)?);
        }
        methods.push(Method { access, name, descriptor, attributes });
    }

    Ok(Class { access, constant_pool: pool, this_class, super_class, interfaces, fields, methods })
}

/// Layout information for a single instance or static field, including the
/// 2-slot width long/double fields need.
#[derive(Debug, Clone)]
pub struct KlassField {
    pub declaring_class: String,
    pub name: String,
    pub field_type: FieldType,
    pub width: usize,
}

pub trait Klass: Debug {
    fn is_initialized(&self) -> bool;
    fn name(&self) -> &str;
    fn java_lang_class_instance(&self) -> Option<crate::value::Reference>;
    fn as_instance_klass(&self) -> Option<&InstanceKlass>;
    fn as_instance_klass_mut(&mut self) -> Option<&mut InstanceKlass>;
}

#[derive(Debug)]
pub struct InstanceKlass {
    pub name: String,
    pub parsed_class: Rc<Class>,
    pub constant_pool: Vec<Constant>,
    pub instance_fields: Vec<KlassField>,
    pub static_fields: Vec<KlassField>,
    pub static_field_values: Vec<crate::value::Slot>,
    pub java_lang_class_instance: Option<crate::value::Reference>,
    pub initialized: bool,
    pub linked: bool,
}

impl Klass for InstanceKlass {
    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn java_lang_class_instance(&self) -> Option<crate::value::Reference> {
        self.java_lang_class_instance
    }

    fn as_instance_klass(&self) -> Option<&InstanceKlass> {
        Some(self)
    }

    fn as_instance_klass_mut(&mut self) -> Option<&mut InstanceKlass> {
        Some(self)
    }
}

impl InstanceKlass {
    pub fn instance_field_offset(&self, field_name: &str) -> Option<usize> {
        let mut offset = 0;
        for field in &self.instance_fields {
            if field.name == field_name {
                return Some(offset);
            }
            offset += field.width;
        }
        None
    }

    pub fn static_field_offset(&self, field_name: &str) -> Option<usize> {
        let mut offset = 0;
        for field in &self.static_fields {
            if field.name == field_name {
                return Some(offset);
            }
            offset += field.width;
        }
        None
    }

    pub fn total_instance_width(&self) -> usize {
        self.instance_fields.iter().map(|f| f.width).sum()
    }

    /// Looks up a method declared directly on this class (no super-chain
    /// walk); used by `resolve_method_with_super` in `classloader.rs`.
    pub fn find_declared_method(&self, name: &str, descriptor: &MethodDescriptor) -> Option<&Method> {
        self.parsed_class
            .methods
            .iter()
            .find(|m| m.name == name && m.descriptor == *descriptor)
    }
}

#[derive(Debug)]
pub struct ArrayKlass {
    pub name: String,
    pub element_type: FieldType,
    pub java_lang_class_instance: Option<crate::value::Reference>,
}

impl Klass for ArrayKlass {
    fn is_initialized(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn java_lang_class_instance(&self) -> Option<crate::value::Reference> {
        self.java_lang_class_instance
    }

    fn as_instance_klass(&self) -> Option<&InstanceKlass> {
        None
    }

    fn as_instance_klass_mut(&mut self) -> Option<&mut InstanceKlass> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_flags_decode_public_final_class() {
        let access = parse_access_flags(0x0001 | 0x0010 | 0x0020);
        assert!(access.public);
        assert!(access.is_final);
        assert!(access.is_super);
        assert!(!access.interface);
    }
}
