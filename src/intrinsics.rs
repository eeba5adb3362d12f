//! Native-method dispatch table.
//!
//! The teacher implements every native method as an inline `match` arm
//! inside one large `run_native_methods` function, keyed first by owning
//! class then by method name. Centralizing that into a
//! `(class, method, descriptor) -> fn` lookup, as noted in the design
//! notes, makes it possible to see the whole native surface area at a
//! glance and to unit-test an intrinsic without building a frame for it.
//!
//! Covers the same JDK bootstrap surface the teacher stubs out (`Object`,
//! `Class`, `System`, `StringUTF16`, `Float`, `Double`, `Throwable`,
//! `Unsafe`, `Runtime`, `Thread`) plus the `println` and `Thread.start`
//! hacks the Python reference implements directly in
//! `instruction.py::__hack_println`/`__hack_thread` rather than as true
//! native methods.

use crate::{
    classloader::ClassLoader,
    error::VmError,
    value::{Slot, NULL},
};

/// The result of a native call: values to push onto the caller's operand
/// stack, in order (empty for `void`).
pub type NativeResult = Result<Vec<Slot>, VmError>;

pub type NativeFn = fn(&mut ClassLoader, &[Slot]) -> NativeResult;

/// The root standard-library behaviors that bypass real bytecode
/// entirely: `PrintStream.println`/`print` and `Thread.start`. Kept as a
/// (class, method) lookup table consulted once during `invokevirtual`
/// resolution rather than scattered as inline checks through the
/// interpreter, per the source implementation's own intent (it
/// implements both as opcode-site special cases; this keeps the same
/// shape but collects the recognition logic in one place).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialMethod {
    Println { newline: bool },
    ThreadStart,
}

pub fn resolve_special(class: &str, method: &str) -> Option<SpecialMethod> {
    match (class, method) {
        ("java/io/PrintStream", "println") => Some(SpecialMethod::Println { newline: true }),
        ("java/io/PrintStream", "print") => Some(SpecialMethod::Println { newline: false }),
        ("java/lang/Thread", "start") => Some(SpecialMethod::ThreadStart),
        _ => None,
    }
}

/// Looks up the native implementation for `class.method`, ignoring the
/// descriptor for now (none of the covered methods are overloaded on
/// argument types in a way that matters here). Returns `None` for methods
/// the interpreter should just treat as a silent no-op returning void --
/// `registerNatives` and friends, which the teacher also special-cases.
pub fn lookup(class: &str, method: &str) -> Option<NativeFn> {
    match (class, method) {
        ("java/lang/Object", "hashCode") => Some(object_hash_code),
        ("java/lang/Object", "getClass") => Some(object_get_class),
        ("java/lang/Class", "getName") | ("java/lang/Class", "initClassName") => Some(class_get_name),
        ("java/lang/Class", "desiredAssertionStatus0") => Some(|_, _| Ok(vec![Slot::Int(0)])),
        ("java/lang/System", "currentTimeMillis") => Some(|_, _| Ok(vec![Slot::Long(0), Slot::Continuation])),
        ("java/lang/System", "nanoTime") => Some(|_, _| Ok(vec![Slot::Long(0), Slot::Continuation])),
        ("java/lang/System", "identityHashCode") => Some(object_hash_code),
        ("java/lang/System", "arraycopy") => Some(system_arraycopy),
        ("java/lang/StringUTF16", "isBigEndian") => Some(|_, _| Ok(vec![Slot::Int(0)])),
        ("java/lang/Float", "floatToRawIntBits") => Some(float_to_raw_int_bits),
        ("java/lang/Double", "doubleToRawLongBits") => Some(double_to_raw_long_bits),
        ("java/lang/Double", "longBitsToDouble") => Some(long_bits_to_double),
        ("java/lang/Throwable", "fillInStackTrace") => Some(|_, args| Ok(vec![args[0].clone()])),
        ("java/lang/Runtime", "availableProcessors") => Some(|_, _| Ok(vec![Slot::Int(1)])),
        ("java/lang/Thread", "currentThread") => Some(|_, _| Ok(vec![Slot::Ref(NULL)])),
        (
            "java/lang/Object" | "java/lang/Class" | "java/lang/System" | "java/lang/Thread"
            | "sun/misc/Unsafe" | "jdk/internal/misc/Unsafe",
            "registerNatives" | "initialize" | "initializeFromArchive" | "storeFence",
        ) => Some(|_, _| Ok(vec![])),
        _ => None,
    }
}

fn object_hash_code(_: &mut ClassLoader, args: &[Slot]) -> NativeResult {
    let reference = args.first().ok_or(VmError::Internal("hashCode called with no receiver".into()))?.as_ref()?;
    Ok(vec![Slot::Int(reference as i32)])
}

fn object_get_class(class_loader: &mut ClassLoader, args: &[Slot]) -> NativeResult {
    let reference = args.first().ok_or(VmError::Internal("getClass called with no receiver".into()))?.as_ref()?;
    let class_name = class_loader
        .heap
        .get(reference)?
        .class_name()
        .ok_or(VmError::Internal("getClass on a non-instance".into()))?
        .to_string();
    let mirror = class_loader
        .method_area
        .classes
        .get(&class_name)
        .and_then(|k| k.java_lang_class_instance())
        .unwrap_or(NULL);
    Ok(vec![Slot::Ref(mirror)])
}

/// `Class.getName()`: walks the mirror reference back to its owning
/// class (no reverse index is kept, so this is a linear scan over the
/// method area -- `getName` is not a hot path) and interns its binary
/// name, dots in place of slashes per `Class.getName`'s documented format.
fn class_get_name(class_loader: &mut ClassLoader, args: &[Slot]) -> NativeResult {
    let mirror = args.first().ok_or(VmError::Internal("Class.getName called with no receiver".into()))?.as_ref()?;
    let owner = class_loader
        .method_area
        .classes
        .iter()
        .find(|(_, klass)| klass.java_lang_class_instance() == Some(mirror))
        .map(|(name, _)| name.clone());
    match owner {
        Some(name) => Ok(vec![Slot::Ref(class_loader.intern_string(&name.replace('/', "."))?)]),
        None => Ok(vec![Slot::Ref(NULL)]),
    }
}

fn system_arraycopy(class_loader: &mut ClassLoader, args: &[Slot]) -> NativeResult {
    let src = args[0].as_ref()?;
    let src_pos = args[1].as_int()?;
    let dest = args[2].as_ref()?;
    let dest_pos = args[3].as_int()?;
    let length = args[4].as_int()?;

    if src_pos < 0 || dest_pos < 0 || length < 0 {
        return Err(VmError::IndexOutOfBounds { index: src_pos.min(dest_pos), length: 0 });
    }

    let data: Vec<Slot> = {
        let source = class_loader.heap.get(src)?;
        let end = (src_pos + length) as usize;
        source.data.get(src_pos as usize..end).ok_or(VmError::IndexOutOfBounds { index: end as i32, length: source.data.len() })?.to_vec()
    };

    let target = class_loader.heap.get_mut(dest)?;
    let dest_end = (dest_pos + length) as usize;
    if dest_end > target.data.len() {
        return Err(VmError::IndexOutOfBounds { index: dest_end as i32, length: target.data.len() });
    }
    target.data[dest_pos as usize..dest_end].clone_from_slice(&data);
    Ok(vec![])
}

fn float_to_raw_int_bits(_: &mut ClassLoader, args: &[Slot]) -> NativeResult {
    Ok(vec![Slot::Int(args[0].as_float()?.to_bits() as i32)])
}

fn double_to_raw_long_bits(_: &mut ClassLoader, args: &[Slot]) -> NativeResult {
    Ok(vec![Slot::Long(args[0].as_double()?.to_bits() as i64), Slot::Continuation])
}

fn long_bits_to_double(_: &mut ClassLoader, args: &[Slot]) -> NativeResult {
    Ok(vec![Slot::Double(f64::from_bits(args[0].as_long()? as u64)), Slot::Continuation])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn unknown_native_is_not_found() {
        assert!(lookup("com/example/Foo", "bar").is_none());
    }

    #[test]
    fn object_hash_code_is_the_handle_value() {
        let mut class_loader = ClassLoader::new(&Config::default());
        let result = object_hash_code(&mut class_loader, &[Slot::Ref(7)]).unwrap();
        assert_eq!(result, vec![Slot::Int(7)]);
    }

    #[test]
    fn array_copy_moves_elements_between_arrays() {
        let mut class_loader = ClassLoader::new(&Config::default());
        let src = class_loader.heap.allocate_array(crate::descriptor::FieldType::Integer, 3).unwrap();
        let dest = class_loader.heap.allocate_array(crate::descriptor::FieldType::Integer, 3).unwrap();
        class_loader.heap.get_mut(src).unwrap().data[1] = Slot::Int(42);

        system_arraycopy(
            &mut class_loader,
            &[Slot::Ref(src), Slot::Int(1), Slot::Ref(dest), Slot::Int(0), Slot::Int(1)],
        )
        .unwrap();

        assert_eq!(class_loader.heap.get(dest).unwrap().data[0], Slot::Int(42));
    }
}
