//! The object heap. Every live object is addressed indirectly by a
//! `Reference` handle (its index into `Heap::objects`); nothing in the
//! interpreter ever holds a raw pointer to heap storage. That indirection
//! is what lets `gc::collect` compact the heap by rewriting the backing
//! `Vec` and remapping handles, instead of leaving holes.
//!
//! Grounded in the teacher's `Heap`/`HeapItem` (index 0 reserved as the
//! null sentinel, `store`/`allocate_klass`) and the Python reference's
//! `runtime/heap.py` (fixed-capacity array, retry-once-then-fatal
//! allocation policy).

use crate::{
    class::{ArrayKlass, InstanceKlass, Klass},
    error::VmError,
    value::{Reference, Slot, NULL},
};

#[derive(Debug, Clone)]
pub enum ObjectKind {
    Instance { class_name: String },
    Array { element_type: crate::descriptor::FieldType },
}

#[derive(Debug, Clone)]
pub struct HeapObject {
    pub kind: ObjectKind,
    pub data: Vec<Slot>,
}

impl HeapObject {
    pub fn class_name(&self) -> Option<&str> {
        match &self.kind {
            ObjectKind::Instance { class_name } => Some(class_name),
            ObjectKind::Array { .. } => None,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, ObjectKind::Array { .. })
    }

    pub fn array_length(&self) -> usize {
        self.data.len()
    }
}

#[derive(Debug)]
pub struct Heap {
    pub objects: Vec<HeapObject>,
    pub capacity: usize,
}

impl Heap {
    pub fn new(capacity: usize) -> Heap {
        let mut heap = Heap { objects: Vec::with_capacity(capacity), capacity };
        // Handle 0 is the permanent null sentinel; never reused or collected.
        heap.objects.push(HeapObject { kind: ObjectKind::Array { element_type: crate::descriptor::FieldType::Byte }, data: vec![] });
        heap
    }

    fn push(&mut self, object: HeapObject) -> Reference {
        self.objects.push(object);
        (self.objects.len() - 1) as Reference
    }

    pub fn allocate_instance(&mut self, klass: &InstanceKlass) -> Result<Reference, VmError> {
        if self.objects.len() >= self.capacity {
            return Err(VmError::HeapFull);
        }
        let mut data = Vec::with_capacity(klass.total_instance_width());
        for field in &klass.instance_fields {
            push_field_default(&mut data, &field.field_type);
        }
        Ok(self.push(HeapObject { kind: ObjectKind::Instance { class_name: klass.name.clone() }, data }))
    }

    pub fn allocate_array(
        &mut self,
        element_type: crate::descriptor::FieldType,
        length: usize,
    ) -> Result<Reference, VmError> {
        if self.objects.len() >= self.capacity {
            return Err(VmError::HeapFull);
        }
        let mut data = Vec::with_capacity(length);
        for _ in 0..length {
            push_default(&mut data, &element_type);
        }
        Ok(self.push(HeapObject { kind: ObjectKind::Array { element_type }, data }))
    }

    pub fn get(&self, reference: Reference) -> Result<&HeapObject, VmError> {
        if reference == NULL {
            return Err(VmError::NullReference);
        }
        self.objects.get(reference as usize).ok_or(VmError::NullReference)
    }

    pub fn get_mut(&mut self, reference: Reference) -> Result<&mut HeapObject, VmError> {
        if reference == NULL {
            return Err(VmError::NullReference);
        }
        self.objects.get_mut(reference as usize).ok_or(VmError::NullReference)
    }

    /// Allocates a `java.lang.Class` mirror instance for `klass`, used by
    /// the class loader when linking a class and by `Object.getClass()`.
    pub fn allocate_class_mirror(&mut self, java_lang_class: &dyn Klass) -> Result<Reference, VmError> {
        let instance_klass = java_lang_class.as_instance_klass().ok_or(VmError::Internal(
            "java/lang/Class must be an InstanceKlass".into(),
        ))?;
        self.allocate_instance(instance_klass)
    }

    pub fn allocate_array_klass_mirror(&mut self, java_lang_class: &ArrayKlass) -> Option<Reference> {
        java_lang_class.java_lang_class_instance
    }
}

/// Pushes one array element's default value. Array elements are addressed
/// by element index, not by word-slot index, so -- unlike instance/static
/// fields -- a long/double element is exactly one `Slot`.
fn push_default(data: &mut Vec<Slot>, field_type: &crate::descriptor::FieldType) {
    use crate::descriptor::FieldType::*;
    match field_type {
        Byte | Boolean | Char | Short | Integer => data.push(Slot::Int(0)),
        Float => data.push(Slot::Float(0.0)),
        Long => data.push(Slot::Long(0)),
        Double => data.push(Slot::Double(0.0)),
        ClassInstance(_) | Array(_) => data.push(Slot::Ref(NULL)),
    }
}

/// Pushes one instance/static field's default value. Long/Double fields
/// push a second `Slot::Continuation` behind them so the vector's indices
/// line up with `InstanceKlass::instance_field_offset`/`static_field_offset`,
/// which count those fields as occupying two slots -- mirroring local
/// variable slot layout rather than array element layout.
fn push_field_default(data: &mut Vec<Slot>, field_type: &crate::descriptor::FieldType) {
    use crate::descriptor::FieldType::*;
    match field_type {
        Long => {
            data.push(Slot::Long(0));
            data.push(Slot::Continuation);
        }
        Double => {
            data.push(Slot::Double(0.0));
            data.push(Slot::Continuation);
        }
        other => push_default(data, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle_is_reference_zero() {
        let heap = Heap::new(16);
        assert_eq!(heap.objects[0].data.len(), 0);
        assert!(matches!(heap.get(NULL), Err(VmError::NullReference)));
    }

    #[test]
    fn allocation_fails_fatally_once_capacity_reached() {
        let mut heap = Heap::new(1);
        let err = heap.allocate_array(crate::descriptor::FieldType::Byte, 4).unwrap_err();
        assert!(matches!(err, VmError::HeapFull));
    }
}
