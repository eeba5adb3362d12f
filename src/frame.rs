//! A single JVM stack frame: local variables, operand stack, and the
//! bookkeeping needed to resume interpretation after a call returns or an
//! exception unwinds through it.
//!
//! Grounded in the teacher's `Frame`/`Frame::new`, with two deliberate
//! departures: locals/operand stack hold tagged `Slot`s instead of raw
//! `u32`s (see `value.rs`), and locals are sized to the method's actual
//! `max_locals` instead of the teacher's hardcoded `vec![0; 20]`.

use std::rc::Rc;

use crate::{
    class::{Class, ExceptionTableItem, Method},
    value::Slot,
};

#[derive(Debug)]
pub struct Frame {
    pub local_variables: Vec<Slot>,
    pub operand_stack: Vec<Slot>,
    /// The defining class's resolved constant pool, kept alive independent
    /// of the method area so a frame stays valid across a GC-triggered
    /// compaction (which never touches the method area, only the heap).
    pub constant_pool: Rc<Class>,
    pub code_bytes: Vec<u8>,
    pub exception_table: Vec<ExceptionTableItem>,
    pub pc: usize,
    pub class_name: String,
    pub method_name: String,
    pub running_native: bool,
}

impl Frame {
    /// Builds the frame for a call to `method`, declared on `class`
    /// (`class_name` names the class that actually *owns* the method,
    /// which may differ from the receiver's runtime class for virtual
    /// dispatch -- the caller resolves that before calling this).
    pub fn new(class_name: String, class: Rc<Class>, method: &Method) -> Frame {
        let (code_bytes, exception_table, max_locals) = if method.access.native {
            (vec![], vec![], method.descriptor.parameter_slot_width() as u16 + 1)
        } else {
            match method.attributes.iter().find_map(|a| a.as_code()) {
                Some((bytes, max_locals, exception_table)) => (bytes.to_vec(), exception_table.to_vec(), max_locals),
                None => (vec![], vec![], method.descriptor.parameter_slot_width() as u16 + 1),
            }
        };

        Frame {
            local_variables: vec![Slot::Int(0); max_locals as usize],
            operand_stack: vec![],
            constant_pool: class,
            code_bytes,
            exception_table,
            pc: 0,
            class_name,
            method_name: method.name.clone(),
            running_native: method.access.native,
        }
    }

    /// Looks up a constant-pool entry by its 1-based index.
    pub fn constant(&self, index: u16) -> Option<&crate::class::Constant> {
        self.constant_pool.constant_pool.get((index as usize).checked_sub(1)?)
    }

    pub fn push(&mut self, value: Slot) {
        self.operand_stack.push(value);
    }

    pub fn pop(&mut self) -> Result<Slot, crate::error::VmError> {
        self.operand_stack
            .pop()
            .ok_or_else(|| crate::error::VmError::Internal("operand stack underflow".into()))
    }

    /// Fetches the next `u8` from the code array and advances the PC.
    pub fn fetch_u8(&mut self) -> Option<u8> {
        let byte = self.code_bytes.get(self.pc).copied();
        if byte.is_some() {
            self.pc += 1;
        }
        byte
    }

    pub fn fetch_u16(&mut self) -> Option<u16> {
        let hi = self.fetch_u8()? as u16;
        let lo = self.fetch_u8()? as u16;
        Some((hi << 8) | lo)
    }

    pub fn fetch_i16(&mut self) -> Option<i16> {
        self.fetch_u16().map(|v| v as i16)
    }

    pub fn fetch_i32(&mut self) -> Option<i32> {
        let a = self.fetch_u8()? as u32;
        let b = self.fetch_u8()? as u32;
        let c = self.fetch_u8()? as u32;
        let d = self.fetch_u8()? as u32;
        Some(((a << 24) | (b << 16) | (c << 8) | d) as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{parse_access_flags, Access};

    fn bare_method(name: &str, code: Vec<u8>) -> Method {
        Method {
            access: Access { native: false, ..parse_access_flags(0) },
            name: name.to_string(),
            descriptor: crate::descriptor::parse_method_descriptor("()V").unwrap(),
            attributes: vec![crate::class::Attribute::Code {
                max_stack: 2,
                max_locals: 3,
                bytes: code,
                exception_table: vec![],
            }],
        }
    }

    fn bare_class() -> Rc<Class> {
        Rc::new(Class {
            access: parse_access_flags(0),
            constant_pool: vec![],
            this_class: crate::class::ClassInfo { name: "Test".into() },
            super_class: None,
            interfaces: vec![],
            fields: vec![],
            methods: vec![],
        })
    }

    #[test]
    fn locals_sized_to_max_locals_not_a_fixed_constant() {
        let method = bare_method("run", vec![0xb1]);
        let frame = Frame::new("Test".into(), bare_class(), &method);
        assert_eq!(frame.local_variables.len(), 3);
    }

    #[test]
    fn fetch_u16_reads_big_endian_operand() {
        let method = bare_method("run", vec![0x00, 0x01, 0x02]);
        let mut frame = Frame::new("Test".into(), bare_class(), &method);
        frame.pc = 1;
        assert_eq!(frame.fetch_u16(), Some(0x0102));
        assert_eq!(frame.pc, 3);
    }
}
