//! Class loading, linking and initialization, plus the shared runtime data
//! areas (method area + heap) the interpreter operates on.
//!
//! Grounded in the teacher's `GlobalMemory::{ensure_class, load_class,
//! link_class, init_class, ensure_array}` and the Python reference's
//! `runtime/jclass.py::ClassLoader` (loading-set bookkeeping, array-class
//! synthesis with `super = Object` and `has_inited` pre-set) and
//! `MethodRef.resolve_method_with_super` (cache-then-invalidate-per-receiver
//! resolution, reproduced here as `ClassLoader::resolve_virtual_method`'s
//! `method_cache`).

use std::{collections::HashMap, error::Error, path::Path, rc::Rc};

use crate::{
    class::{parse_class, ArrayKlass, Class, Constant, InstanceKlass, Klass, KlassField, Method},
    classfile::read_class_file,
    config::Config,
    descriptor::{FieldType, MethodDescriptor, ReturnDescriptor},
    error::VmError,
    heap::Heap,
    value::Slot,
};

pub struct MethodArea {
    pub classes: HashMap<String, Box<dyn Klass>>,
}

impl MethodArea {
    fn new() -> MethodArea {
        MethodArea { classes: HashMap::new() }
    }
}

pub struct ClassLoader {
    pub method_area: MethodArea,
    pub heap: Heap,
    classpath: Vec<String>,
    /// Classes currently being loaded, to catch cyclic super-class chains
    /// the way the Python reference's `_loading_classes` set does (minus
    /// the cross-thread spin-wait, since loading here is synchronous).
    loading: Vec<String>,
    /// invokevirtual/invokeinterface dispatch cache, keyed by
    /// (receiver_class, method_name, descriptor); invalidated implicitly
    /// because it is only ever consulted for the receiver class it was
    /// computed for.
    method_cache: HashMap<(String, String, String), String>,
}

impl ClassLoader {
    pub fn new(config: &Config) -> ClassLoader {
        ClassLoader {
            method_area: MethodArea::new(),
            heap: Heap::new(config.heap_size),
            classpath: config.classpath.clone(),
            loading: vec![],
            method_cache: HashMap::new(),
        }
    }

    /// Loads, links and initializes `name` if it isn't already in that
    /// state. Safe to call redundantly -- every opcode that touches a class
    /// symbolically goes through this first.
    pub fn ensure_class(&mut self, name: &str) -> Result<(), Box<dyn Error>> {
        if self.method_area.classes.get(name).map(|k| k.is_initialized()).unwrap_or(false) {
            return Ok(());
        }
        self.load_class(name)?;
        self.link_class(name)?;
        self.init_class(name)?;
        Ok(())
    }

    fn resolve_classpath(&self, name: &str) -> Option<std::path::PathBuf> {
        for directory in &self.classpath {
            let candidate = Path::new(directory).join(format!("{name}.class"));
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    fn load_class(&mut self, name: &str) -> Result<(), Box<dyn Error>> {
        if self.method_area.classes.contains_key(name) {
            return Ok(());
        }
        if self.loading.iter().any(|l| l == name) {
            return Err(format!("cyclic class load detected for {name}").into());
        }

        let path = self
            .resolve_classpath(name)
            .ok_or_else(|| Box::new(VmError::MissingClass(name.to_string())) as Box<dyn Error>)?;
        let path_str = path.to_str().ok_or("classpath entry is not valid UTF-8")?.to_string();

        self.loading.push(name.to_string());
        let class_file = read_class_file(&path_str)?;
        let class = parse_class(class_file)?;

        if let Some(super_class) = &class.super_class {
            self.load_class(&super_class.name.clone())?;
        }
        for interface in class.interfaces.clone() {
            self.load_class(&interface.name)?;
        }
        self.loading.retain(|l| l != name);

        self.register_class(name.to_string(), class);
        Ok(())
    }

    fn register_class(&mut self, name: String, class: Class) {
        let parsed = Rc::new(class);
        let (instance_fields, static_fields) = layout_fields(&self.method_area, &name, &parsed);

        self.method_area.classes.insert(
            name.clone(),
            Box::new(InstanceKlass {
                name,
                parsed_class: parsed,
                constant_pool: vec![],
                instance_fields,
                static_fields,
                static_field_values: vec![],
                java_lang_class_instance: None,
                initialized: false,
                linked: false,
            }),
        );
    }

    fn link_class(&mut self, name: &str) -> Result<(), Box<dyn Error>> {
        let already_linked = self
            .method_area
            .classes
            .get(name)
            .and_then(|k| k.as_instance_klass())
            .map(|k| k.linked)
            .unwrap_or(true);
        if already_linked {
            return Ok(());
        }

        let super_name = self
            .method_area
            .classes
            .get(name)
            .and_then(|k| k.as_instance_klass())
            .and_then(|k| k.parsed_class.super_class.clone())
            .map(|c| c.name);
        if let Some(super_name) = &super_name {
            self.link_class(super_name)?;
        }

        let class = self
            .method_area
            .classes
            .get(name)
            .and_then(|k| k.as_instance_klass())
            .ok_or("class not found during linking")?;
        let pool = class.parsed_class.constant_pool.clone();
        let mut static_values = Vec::with_capacity(class.static_fields.len());
        for field in &class.static_fields {
            push_static_default(&mut static_values, &field.field_type);
        }

        // `java/lang/Class` is bootstrapped before anything else gets a
        // mirror; every other class (including Class itself, lazily) gets
        // one here so `Object.getClass()` has somewhere to point.
        let java_lang_class_mirror = if name == "java/lang/Class" {
            None
        } else if let Some(klass) = self.method_area.classes.get("java/lang/Class") {
            let instance = klass.as_instance_klass().ok_or("java/lang/Class is not an InstanceKlass")?;
            Some(self.heap.allocate_instance(instance)?)
        } else {
            None
        };

        let class = self
            .method_area
            .classes
            .get_mut(name)
            .and_then(|k| k.as_instance_klass_mut())
            .ok_or("class not found during linking")?;
        class.constant_pool = pool;
        class.static_field_values = static_values;
        class.java_lang_class_instance = java_lang_class_mirror;
        class.linked = true;

        Ok(())
    }

    fn init_class(&mut self, _name: &str) -> Result<(), Box<dyn Error>> {
        // `<clinit>` invocation requires pushing a frame through the
        // interpreter and running it to completion, which needs a call
        // stack this module doesn't own. `Thread::trigger_class_init` in
        // `thread.rs` performs that step -- for the four bytecodes JVMS
        // 5.5 names as initialization triggers (`new`, `getstatic`,
        // `putstatic`, `invokestatic`) -- and marks `initialized = true`
        // itself. This function only exists so `ensure_class`'s
        // load/link/init shape mirrors the teacher's; nothing happens here.
        Ok(())
    }

    pub fn ensure_array_class(&mut self, descriptor: &str, element_type: FieldType) -> Result<(), Box<dyn Error>> {
        if self.method_area.classes.contains_key(descriptor) {
            return Ok(());
        }
        self.ensure_class("java/lang/Object")?;

        let java_lang_class_mirror = if let Some(klass) = self.method_area.classes.get("java/lang/Class") {
            let instance = klass.as_instance_klass().ok_or("java/lang/Class is not an InstanceKlass")?;
            Some(self.heap.allocate_instance(instance)?)
        } else {
            None
        };

        self.method_area.classes.insert(
            descriptor.to_string(),
            Box::new(ArrayKlass {
                name: descriptor.to_string(),
                element_type,
                java_lang_class_instance: java_lang_class_mirror,
            }),
        );
        Ok(())
    }

    /// Walks the super-chain looking for `name`/`descriptor`, the way
    /// `Frame::new` does in the teacher and `resolve_method_with_super`
    /// does in the Python reference. Used for `invokespecial`/
    /// `invokestatic` (statically-bound) and as the fallback for
    /// `invokevirtual` before caching the result.
    pub fn resolve_method(
        &self,
        start_class: &str,
        method_name: &str,
        descriptor: &MethodDescriptor,
    ) -> Result<(String, Method), VmError> {
        let mut class_name = start_class.to_string();
        loop {
            let klass = self
                .method_area
                .classes
                .get(&class_name)
                .and_then(|k| k.as_instance_klass())
                .ok_or_else(|| VmError::MissingClass(class_name.clone()))?;
            if let Some(method) = klass.find_declared_method(method_name, descriptor) {
                return Ok((class_name, method.clone()));
            }
            class_name = klass
                .parsed_class
                .super_class
                .clone()
                .ok_or_else(|| {
                    VmError::Internal(format!("no method {method_name} found in {start_class} or its supertypes"))
                })?
                .name;
        }
    }

    /// `invokevirtual`/`invokeinterface` dispatch: resolve against the
    /// receiver's *actual* runtime class, caching the answer per
    /// (receiver_class, name, descriptor) so repeat dispatches on the same
    /// receiver class skip the super-chain walk.
    pub fn resolve_virtual_method(
        &mut self,
        receiver_class: &str,
        method_name: &str,
        descriptor: &MethodDescriptor,
    ) -> Result<(String, Method), VmError> {
        let key = (receiver_class.to_string(), method_name.to_string(), descriptor_key(descriptor));
        if let Some(owner) = self.method_cache.get(&key) {
            let method = self
                .method_area
                .classes
                .get(owner)
                .and_then(|k| k.as_instance_klass())
                .and_then(|k| k.find_declared_method(method_name, descriptor))
                .cloned();
            if let Some(method) = method {
                return Ok((owner.clone(), method));
            }
        }

        let (owner, method) = self.resolve_method(receiver_class, method_name, descriptor)?;
        self.method_cache.insert(key, owner.clone());
        Ok((owner, method))
    }

    /// Allocates a `java.lang.String` instance for `value`, matching the
    /// compact-string layout (`byte[] value` + `byte coder`) `StringUTF16`'s
    /// native stubs above advertise -- every string constant `ldc` produces
    /// goes through here.
    pub fn intern_string(&mut self, value: &str) -> Result<crate::value::Reference, VmError> {
        self.ensure_class("java/lang/String")?;
        let klass = self
            .method_area
            .classes
            .get("java/lang/String")
            .and_then(|k| k.as_instance_klass())
            .ok_or_else(|| VmError::MissingClass("java/lang/String".to_string()))?;
        let is_latin1 = value.chars().all(|c| (c as u32) <= 0xff);
        let bytes: Vec<u8> = if is_latin1 {
            value.chars().map(|c| c as u8).collect()
        } else {
            value.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
        };
        let value_offset = klass.instance_field_offset("value");
        let coder_offset = klass.instance_field_offset("coder");
        let string_ref = self.heap.allocate_instance(klass)?;

        let array_ref = self.heap.allocate_array(FieldType::Byte, bytes.len())?;
        {
            let array = self.heap.get_mut(array_ref)?;
            for (slot, byte) in array.data.iter_mut().zip(bytes.iter()) {
                *slot = Slot::Int(*byte as i32);
            }
        }

        let instance = self.heap.get_mut(string_ref)?;
        if let Some(offset) = value_offset {
            instance.data[offset] = Slot::Ref(array_ref);
        }
        if let Some(offset) = coder_offset {
            instance.data[offset] = Slot::Int(if is_latin1 { 0 } else { 1 });
        }
        Ok(string_ref)
    }

    /// Walks `subclass`'s super-chain (and, loosely, its interfaces) to see
    /// whether it is `superclass` or a descendant of it -- the exception
    /// handler's catch-type match and `instanceof`/`checkcast` both need
    /// this full walk rather than the teacher's exact-name-only comparison.
    pub fn is_subclass_of(&self, subclass: &str, superclass: &str) -> bool {
        if subclass == superclass {
            return true;
        }
        let mut current = subclass.to_string();
        while let Some(klass) = self.method_area.classes.get(&current).and_then(|k| k.as_instance_klass()) {
            for interface in &klass.parsed_class.interfaces {
                if interface.name == superclass || self.is_subclass_of(&interface.name, superclass) {
                    return true;
                }
            }
            match &klass.parsed_class.super_class {
                Some(super_class) if super_class.name == superclass => return true,
                Some(super_class) => current = super_class.name.clone(),
                None => return false,
            }
        }
        false
    }
}

fn descriptor_key(descriptor: &MethodDescriptor) -> String {
    let mut key = String::from("(");
    for param in &descriptor.parameter_descriptors {
        key.push_str(&param.descriptor_letter());
    }
    key.push(')');
    match &descriptor.return_descriptor {
        ReturnDescriptor::Void => key.push('V'),
        ReturnDescriptor::FieldType(t) => key.push_str(&t.descriptor_letter()),
    }
    key
}

/// Mirrors `heap::push_field_default`: static fields are addressed by the
/// same width-aware offsets as instance fields, so long/double statics
/// also reserve a trailing `Continuation` slot.
fn push_static_default(values: &mut Vec<Slot>, field_type: &FieldType) {
    use FieldType::*;
    match field_type {
        Byte | Boolean | Char | Short | Integer => values.push(Slot::Int(0)),
        Float => values.push(Slot::Float(0.0)),
        Long => {
            values.push(Slot::Long(0));
            values.push(Slot::Continuation);
        }
        Double => {
            values.push(Slot::Double(0.0));
            values.push(Slot::Continuation);
        }
        ClassInstance(_) | Array(_) => values.push(Slot::Ref(crate::value::NULL)),
    }
}

/// Builds the instance/static field layout for a freshly-loaded class,
/// prepending the already-computed layout of its linked superclass so
/// offsets stay stable across the hierarchy (JVMS 5.4.3.2 isn't this
/// explicit about layout, but every real implementation does it this way).
fn layout_fields(method_area: &MethodArea, class_name: &str, class: &Rc<Class>) -> (Vec<KlassField>, Vec<KlassField>) {
    let mut instance_fields = vec![];
    let mut static_fields = vec![];

    for field in &class.fields {
        let width = field.descriptor.field_type.category() as usize;
        let klass_field = KlassField {
            declaring_class: class_name.to_string(),
            name: field.name.clone(),
            field_type: field.descriptor.field_type.clone(),
            width,
        };
        if field.access.is_static {
            static_fields.push(klass_field);
        } else {
            instance_fields.push(klass_field);
        }
    }

    if let Some(super_class) = &class.super_class {
        if let Some(parent) = method_area.classes.get(&super_class.name).and_then(|k| k.as_instance_klass()) {
            let mut parent_fields = parent.instance_fields.clone();
            parent_fields.append(&mut instance_fields);
            instance_fields = parent_fields;
        }
    }

    (instance_fields, static_fields)
}

/// Resolves a `FieldRef`/`MethodRef` constant's declaring class name and
/// member name, a small helper used across `thread.rs`'s opcode handlers.
pub fn constant_owner_and_name(constant: &Constant) -> Option<(&str, &str)> {
    let (class, name_and_type) = constant.as_field_ref().or_else(|| constant.as_method_ref())?;
    let (name, _descriptor) = name_and_type.as_name_and_type()?;
    Some((class.name.as_str(), name))
}
