//! The interpreter: one `Thread` per JVM thread, each owning its own call
//! stack and driving bytecode dispatch over the shared `ClassLoader`
//! (method area + heap).
//!
//! Grounded in the teacher's `Thread`/`Thread::run` match-on-opcode-byte
//! loop, rebuilt to dispatch on the decoded `opcode::Opcode` and to cover
//! the families the teacher's version never implemented: `tableswitch`,
//! `lookupswitch`, `wide`, the `dup2*` family with correct JVM semantics,
//! checked integer division, the full widening/narrowing conversion
//! matrix, and `instanceof`/`checkcast` via a real superclass walk.

use std::convert::TryFrom;

use crate::{
    class::{Attribute, Constant},
    classloader::ClassLoader,
    descriptor::{FieldType, ReturnDescriptor},
    error::VmError,
    exception::{self, UnwindOutcome},
    frame::Frame,
    gc,
    intrinsics,
    opcode::{ArrayType, Opcode},
    value::{Slot, NULL},
};

pub struct Thread {
    pub frames: Vec<Frame>,
    /// Set by `athrow` or a propagated `VmError`; consumed by the top of
    /// the run loop before the next instruction fetch.
    pending_exception: Option<crate::value::Reference>,
    /// Set by a `*return` opcode that pops the last frame `run` owns;
    /// consumed by the top of the run loop to hand the values back to
    /// `invoke`'s caller.
    pending_return: Option<Vec<Slot>>,
    /// Ordered output this thread has produced via the `PrintStream`
    /// printing hack, buffered here when `print_in_real_time` is off and
    /// flushed on thread termination.
    output: Vec<String>,
    print_in_real_time: bool,
}

impl Thread {
    pub fn new(print_in_real_time: bool) -> Thread {
        Thread { frames: vec![], pending_exception: None, pending_return: None, output: vec![], print_in_real_time }
    }

    /// The output this thread has buffered but not yet flushed (empty if
    /// `print_in_real_time` is on, since output goes straight to stdout).
    pub fn buffered_output(&self) -> &[String] {
        &self.output
    }

    fn emit_output(&mut self, text: String) {
        if self.print_in_real_time {
            print!("{text}");
            use std::io::Write;
            let _ = std::io::stdout().flush();
        } else {
            self.output.push(text);
        }
    }

    /// Drains and prints whatever output is still buffered. Called when
    /// this thread's frame stack empties -- `print_in_real_time` threads
    /// have nothing to drain, since `emit_output` already wrote directly.
    fn flush_output(&mut self) {
        if self.output.is_empty() {
            return;
        }
        use std::io::Write;
        let mut stdout = std::io::stdout();
        for line in self.output.drain(..) {
            let _ = write!(stdout, "{line}");
        }
        let _ = stdout.flush();
    }

    /// Runs `method_name`/`descriptor` on `class_name` to completion,
    /// returning whatever values it left behind (empty for void).
    pub fn invoke(
        &mut self,
        class_loader: &mut ClassLoader,
        class_name: &str,
        method_name: &str,
        descriptor: &crate::descriptor::MethodDescriptor,
        args: Vec<Slot>,
    ) -> Result<Vec<Slot>, Box<dyn std::error::Error>> {
        let (owner, method) = class_loader.resolve_method(class_name, method_name, descriptor)?;
        self.push_frame(class_loader, &owner, &method, args)?;
        self.run(class_loader)
    }

    fn push_frame(
        &mut self,
        class_loader: &ClassLoader,
        owner: &str,
        method: &crate::class::Method,
        args: Vec<Slot>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let parsed_class = class_loader
            .method_area
            .classes
            .get(owner)
            .and_then(|k| k.as_instance_klass())
            .ok_or(format!("class {owner} not found when building a frame"))?
            .parsed_class
            .clone();

        let mut frame = Frame::new(owner.to_string(), parsed_class, method);
        for (i, arg) in args.into_iter().enumerate() {
            frame.local_variables[i] = arg;
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Drives the interpreter until the frame pushed by the call that
    /// started this `run` returns, yielding its return values.
    fn run(&mut self, class_loader: &mut ClassLoader) -> Result<Vec<Slot>, Box<dyn std::error::Error>> {
        loop {
            if let Some(values) = self.pending_return.take() {
                self.flush_output();
                return Ok(values);
            }

            if let Some(exception) = self.pending_exception.take() {
                match exception::unwind(&mut self.frames, class_loader, &class_loader.heap, exception) {
                    UnwindOutcome::Handled { .. } => {}
                    UnwindOutcome::Uncaught => {
                        let class_name =
                            class_loader.heap.get(exception).ok().and_then(|o| o.class_name()).unwrap_or("?");
                        return Err(VmError::Uncaught(class_name.to_string()).into());
                    }
                }
                continue;
            }

            if self.frames.is_empty() {
                self.flush_output();
                return Ok(vec![]);
            }

            if self.frames.last().unwrap().running_native {
                let frame = self.frames.pop().unwrap();
                let result = match intrinsics::lookup(&frame.class_name, &frame.method_name) {
                    Some(native) => native(class_loader, &frame.local_variables),
                    None => {
                        tracing::warn!(class = frame.class_name, method = frame.method_name, "unimplemented native method treated as no-op");
                        Ok(vec![])
                    }
                };
                match result {
                    Ok(values) => self.return_from_frame(values),
                    Err(err) => self.throw_vm_error(class_loader, err)?,
                }
                continue;
            }

            let opcode_byte = match self.frames.last_mut().unwrap().fetch_u8() {
                Some(b) => b,
                None => {
                    self.return_from_frame(vec![]);
                    continue;
                }
            };
            let opcode = match Opcode::try_from(opcode_byte) {
                Ok(op) => op,
                Err(_) => {
                    self.throw_vm_error(class_loader, VmError::UnknownOpcode(opcode_byte))?;
                    continue;
                }
            };

            if let Err(err) = self.step(class_loader, opcode) {
                self.throw_vm_error(class_loader, err)?;
            }
        }
    }

    /// Pops the current frame and delivers `values` to the new top frame,
    /// or stashes them in `pending_return` if the call stack just emptied.
    fn return_from_frame(&mut self, values: Vec<Slot>) {
        self.frames.pop();
        match self.frames.last_mut() {
            Some(caller) => {
                for value in values {
                    caller.push(value);
                }
            }
            None => self.pending_return = Some(values),
        }
    }

    /// Materializes a `VmError` as a thrown exception of the matching
    /// class, or propagates it as a hard failure if there is no catchable
    /// mapping (e.g. `HeapFull`).
    fn throw_vm_error(&mut self, class_loader: &mut ClassLoader, err: VmError) -> Result<(), Box<dyn std::error::Error>> {
        match err.exception_class_name() {
            Some(class_name) => {
                class_loader.ensure_class(class_name)?;
                let klass = class_loader
                    .method_area
                    .classes
                    .get(class_name)
                    .and_then(|k| k.as_instance_klass())
                    .ok_or(format!("{class_name} missing after ensure_class"))?;
                let reference = class_loader.heap.allocate_instance(klass)?;
                self.pending_exception = Some(reference);
                Ok(())
            }
            None => Err(err.into()),
        }
    }

    /// Every reference-shaped slot `gc::collect` must treat as live: each
    /// frame's locals and operand stack, plus every class's static field
    /// slots (spec §4.9 root #3) -- an object reachable only through a
    /// `putstatic`'d reference would otherwise be reclaimed out from under
    /// it.
    fn gc_roots<'a>(&'a mut self, method_area: &'a mut crate::classloader::MethodArea) -> Vec<&'a mut Slot> {
        let mut roots = vec![];
        for frame in &mut self.frames {
            roots.extend(frame.local_variables.iter_mut());
            roots.extend(frame.operand_stack.iter_mut());
        }
        for klass in method_area.classes.values_mut() {
            if let Some(instance_klass) = klass.as_instance_klass_mut() {
                roots.extend(instance_klass.static_field_values.iter_mut());
            }
        }
        roots
    }

    fn allocate_instance(&mut self, class_loader: &mut ClassLoader, class_name: &str) -> Result<crate::value::Reference, VmError> {
        let klass = class_loader
            .method_area
            .classes
            .get(class_name)
            .and_then(|k| k.as_instance_klass())
            .ok_or_else(|| VmError::MissingClass(class_name.to_string()))?;
        match class_loader.heap.allocate_instance(klass) {
            Ok(r) => Ok(r),
            Err(VmError::HeapFull) => {
                let ClassLoader { heap, method_area, .. } = class_loader;
                gc::collect(heap, self.gc_roots(method_area));
                let klass = class_loader
                    .method_area
                    .classes
                    .get(class_name)
                    .and_then(|k| k.as_instance_klass())
                    .ok_or_else(|| VmError::MissingClass(class_name.to_string()))?;
                class_loader.heap.allocate_instance(klass)
            }
            Err(other) => Err(other),
        }
    }

    fn allocate_array(&mut self, class_loader: &mut ClassLoader, element_type: FieldType, length: i32) -> Result<crate::value::Reference, VmError> {
        if length < 0 {
            return Err(VmError::IndexOutOfBounds { index: length, length: 0 });
        }
        match class_loader.heap.allocate_array(element_type.clone(), length as usize) {
            Ok(r) => Ok(r),
            Err(VmError::HeapFull) => {
                let ClassLoader { heap, method_area, .. } = class_loader;
                gc::collect(heap, self.gc_roots(method_area));
                class_loader.heap.allocate_array(element_type, length as usize)
            }
            Err(other) => Err(other),
        }
    }

    /// JVMS 5.5: `new`/`getstatic`/`putstatic`/`invokestatic` must run a
    /// class's (and its uninitialized supers') `<clinit>` before the
    /// instruction's own effect. Rather than recursing into `invoke`/`run`
    /// (which would reenter the same frame stack this call is already
    /// driving), this rewinds the current frame back to `instruction_pc`
    /// and pushes the `<clinit>` chain on top -- the ordinary loop in
    /// `run` executes them and then retries this instruction, which finds
    /// the class already initialized the second time through. Returns
    /// `true` when the caller must stop processing this opcode now.
    fn trigger_class_init(&mut self, class_loader: &mut ClassLoader, class_name: &str, instruction_pc: usize) -> Result<bool, VmError> {
        let mut chain = vec![];
        let mut current = Some(class_name.to_string());
        while let Some(name) = current {
            let Some(klass) = class_loader.method_area.classes.get(&name).and_then(|k| k.as_instance_klass()) else { break };
            if klass.initialized {
                break;
            }
            chain.push(name.clone());
            current = klass.parsed_class.super_class.clone().map(|c| c.name);
        }
        if chain.is_empty() {
            return Ok(false);
        }

        // Rewind while the triggering frame is still on top, before any
        // `<clinit>` frame is pushed above it.
        self.frame().pc = instruction_pc;

        // `chain` runs most-derived to most-base; push in that order so
        // the most-base (first-needed) `<clinit>` ends up on top and runs
        // first, with each subclass's `<clinit>` following underneath.
        for name in &chain {
            if let Some(klass) = class_loader.method_area.classes.get_mut(name).and_then(|k| k.as_instance_klass_mut()) {
                klass.initialized = true;
            }
            let clinit = class_loader
                .method_area
                .classes
                .get(name)
                .and_then(|k| k.as_instance_klass())
                .and_then(|k| k.parsed_class.methods.iter().find(|m| m.name == "<clinit>").cloned());
            if let Some(method) = clinit {
                self.push_frame(class_loader, name, &method, vec![]).map_err(|e| VmError::Internal(e.to_string()))?;
            }
        }

        Ok(true)
    }

    fn step(&mut self, class_loader: &mut ClassLoader, opcode: Opcode) -> Result<(), VmError> {
        use Opcode::*;
        let instruction_pc = self.frame().pc - 1;

        match opcode {
            Nop => {}
            AconstNull => self.frame().push(Slot::Ref(NULL)),
            IconstM1 => self.frame().push(Slot::Int(-1)),
            Iconst0 => self.frame().push(Slot::Int(0)),
            Iconst1 => self.frame().push(Slot::Int(1)),
            Iconst2 => self.frame().push(Slot::Int(2)),
            Iconst3 => self.frame().push(Slot::Int(3)),
            Iconst4 => self.frame().push(Slot::Int(4)),
            Iconst5 => self.frame().push(Slot::Int(5)),
            Lconst0 => self.push_long(0),
            Lconst1 => self.push_long(1),
            Fconst0 => self.frame().push(Slot::Float(0.0)),
            Fconst1 => self.frame().push(Slot::Float(1.0)),
            Fconst2 => self.frame().push(Slot::Float(2.0)),
            Dconst0 => self.push_double(0.0),
            Dconst1 => self.push_double(1.0),
            Bipush => {
                let byte = self.frame().fetch_u8().ok_or(underflow())? as i8;
                self.frame().push(Slot::Int(byte as i32));
            }
            Sipush => {
                let value = self.frame().fetch_i16().ok_or(underflow())?;
                self.frame().push(Slot::Int(value as i32));
            }
            Ldc => {
                let index = self.frame().fetch_u8().ok_or(underflow())? as u16;
                self.load_constant(class_loader, index)?;
            }
            LdcW | Ldc2W => {
                let index = self.frame().fetch_u16().ok_or(underflow())?;
                self.load_constant(class_loader, index)?;
            }
            Iload | Fload | Aload => {
                let index = self.frame().fetch_u8().ok_or(underflow())? as usize;
                let value = self.frame().local_variables[index];
                self.frame().push(value);
            }
            Lload | Dload => {
                let index = self.frame().fetch_u8().ok_or(underflow())? as usize;
                let value = self.frame().local_variables[index];
                self.frame().push(value);
                self.frame().push(Slot::Continuation);
            }
            Iload0 | Fload0 | Aload0 => self.load_local(0),
            Iload1 | Fload1 | Aload1 => self.load_local(1),
            Iload2 | Fload2 | Aload2 => self.load_local(2),
            Iload3 | Fload3 | Aload3 => self.load_local(3),
            Lload0 | Dload0 => self.load_wide_local(0),
            Lload1 | Dload1 => self.load_wide_local(1),
            Lload2 | Dload2 => self.load_wide_local(2),
            Lload3 | Dload3 => self.load_wide_local(3),
            Iaload => self.array_load(class_loader, |s| s.as_int().map(Slot::Int))?,
            Faload => self.array_load(class_loader, |s| s.as_float().map(Slot::Float))?,
            Laload => self.array_load_wide(class_loader, |s| s.as_long().map(Slot::Long))?,
            Daload => self.array_load_wide(class_loader, |s| s.as_double().map(Slot::Double))?,
            Aaload => self.array_load(class_loader, |s| s.as_ref().map(Slot::Ref))?,
            Baload => self.array_load(class_loader, |s| s.as_int().map(Slot::Int))?,
            Caload => self.array_load(class_loader, |s| s.as_int().map(Slot::Int))?,
            Saload => self.array_load(class_loader, |s| s.as_int().map(Slot::Int))?,
            Istore | Fstore | Astore => {
                let index = self.frame().fetch_u8().ok_or(underflow())? as usize;
                let value = self.frame().pop()?;
                self.frame().local_variables[index] = value;
            }
            Lstore | Dstore => {
                let index = self.frame().fetch_u8().ok_or(underflow())? as usize;
                self.frame().pop()?; // Continuation
                let value = self.frame().pop()?;
                self.frame().local_variables[index] = value;
                self.frame().local_variables[index + 1] = Slot::Continuation;
            }
            Istore0 | Fstore0 | Astore0 => self.store_local(0)?,
            Istore1 | Fstore1 | Astore1 => self.store_local(1)?,
            Istore2 | Fstore2 | Astore2 => self.store_local(2)?,
            Istore3 | Fstore3 | Astore3 => self.store_local(3)?,
            Lstore0 | Dstore0 => self.store_wide_local(0)?,
            Lstore1 | Dstore1 => self.store_wide_local(1)?,
            Lstore2 | Dstore2 => self.store_wide_local(2)?,
            Lstore3 | Dstore3 => self.store_wide_local(3)?,
            Iastore => self.array_store(class_loader, |v| v.as_int().map(Slot::Int))?,
            Fastore => self.array_store(class_loader, |v| v.as_float().map(Slot::Float))?,
            Lastore => self.array_store_wide(class_loader, |v| v.as_long().map(Slot::Long))?,
            Dastore => self.array_store_wide(class_loader, |v| v.as_double().map(Slot::Double))?,
            Aastore => self.array_store(class_loader, |v| v.as_ref().map(Slot::Ref))?,
            Bastore => self.array_store(class_loader, |v| v.as_int().map(|i| Slot::Int(i as i8 as i32)))?,
            Castore | Sastore => self.array_store(class_loader, |v| v.as_int().map(Slot::Int))?,
            Pop => {
                self.frame().pop()?;
            }
            Pop2 => {
                self.frame().pop()?;
                self.frame().pop()?;
            }
            Dup => {
                let v = *self.frame().operand_stack.last().ok_or(underflow())?;
                self.frame().push(v);
            }
            DupX1 => {
                let frame = self.frame();
                let v1 = frame.pop()?;
                let v2 = frame.pop()?;
                frame.push(v1);
                frame.push(v2);
                frame.push(v1);
            }
            DupX2 => {
                let frame = self.frame();
                let v1 = frame.pop()?;
                let v2 = frame.pop()?;
                let v3 = frame.pop()?;
                frame.push(v1);
                frame.push(v3);
                frame.push(v2);
                frame.push(v1);
            }
            Dup2 => {
                let frame = self.frame();
                let v1 = frame.pop()?;
                let v2 = frame.pop()?;
                frame.push(v2);
                frame.push(v1);
                frame.push(v2);
                frame.push(v1);
            }
            Dup2X1 => {
                let frame = self.frame();
                let v1 = frame.pop()?;
                let v2 = frame.pop()?;
                let v3 = frame.pop()?;
                frame.push(v2);
                frame.push(v1);
                frame.push(v3);
                frame.push(v2);
                frame.push(v1);
            }
            Dup2X2 => {
                let frame = self.frame();
                let v1 = frame.pop()?;
                let v2 = frame.pop()?;
                let v3 = frame.pop()?;
                let v4 = frame.pop()?;
                frame.push(v2);
                frame.push(v1);
                frame.push(v4);
                frame.push(v3);
                frame.push(v2);
                frame.push(v1);
            }
            Swap => {
                let frame = self.frame();
                let v1 = frame.pop()?;
                let v2 = frame.pop()?;
                frame.push(v1);
                frame.push(v2);
            }
            Iadd => self.binary_int(|a, b| Ok(a.wrapping_add(b)))?,
            Isub => self.binary_int(|a, b| Ok(a.wrapping_sub(b)))?,
            Imul => self.binary_int(|a, b| Ok(a.wrapping_mul(b)))?,
            Idiv => self.binary_int(|a, b| if b == 0 { Err(VmError::ArithmeticDivZero) } else { Ok(a.wrapping_div(b)) })?,
            Irem => self.binary_int(|a, b| if b == 0 { Err(VmError::ArithmeticDivZero) } else { Ok(a.wrapping_rem(b)) })?,
            Iand => self.binary_int(|a, b| Ok(a & b))?,
            Ior => self.binary_int(|a, b| Ok(a | b))?,
            Ixor => self.binary_int(|a, b| Ok(a ^ b))?,
            Ishl => self.binary_int(|a, b| Ok(a.wrapping_shl(b as u32 & 0x1f)))?,
            Ishr => self.binary_int(|a, b| Ok(a.wrapping_shr(b as u32 & 0x1f)))?,
            Iushr => self.binary_int(|a, b| Ok(((a as u32).wrapping_shr(b as u32 & 0x1f)) as i32))?,
            Ineg => {
                let v = self.frame().pop()?.as_int()?;
                self.frame().push(Slot::Int(v.wrapping_neg()));
            }
            Ladd => self.binary_long(|a, b| Ok(a.wrapping_add(b)))?,
            Lsub => self.binary_long(|a, b| Ok(a.wrapping_sub(b)))?,
            Lmul => self.binary_long(|a, b| Ok(a.wrapping_mul(b)))?,
            Ldiv => self.binary_long(|a, b| if b == 0 { Err(VmError::ArithmeticDivZero) } else { Ok(a.wrapping_div(b)) })?,
            Lrem => self.binary_long(|a, b| if b == 0 { Err(VmError::ArithmeticDivZero) } else { Ok(a.wrapping_rem(b)) })?,
            Land => self.binary_long(|a, b| Ok(a & b))?,
            Lor => self.binary_long(|a, b| Ok(a | b))?,
            Lxor => self.binary_long(|a, b| Ok(a ^ b))?,
            Lshl => {
                let shift = self.frame().pop()?.as_int()?;
                let value = self.pop_long()?;
                self.push_long(value.wrapping_shl(shift as u32 & 0x3f));
            }
            Lshr => {
                let shift = self.frame().pop()?.as_int()?;
                let value = self.pop_long()?;
                self.push_long(value.wrapping_shr(shift as u32 & 0x3f));
            }
            Lushr => {
                let shift = self.frame().pop()?.as_int()?;
                let value = self.pop_long()?;
                self.push_long(((value as u64).wrapping_shr(shift as u32 & 0x3f)) as i64);
            }
            Lneg => {
                let v = self.pop_long()?;
                self.push_long(v.wrapping_neg());
            }
            Fadd => self.binary_float(|a, b| a + b)?,
            Fsub => self.binary_float(|a, b| a - b)?,
            Fmul => self.binary_float(|a, b| a * b)?,
            Fdiv => self.binary_float(|a, b| a / b)?,
            Frem => self.binary_float(|a, b| a % b)?,
            Fneg => {
                let v = self.frame().pop()?.as_float()?;
                self.frame().push(Slot::Float(-v));
            }
            Dadd => self.binary_double(|a, b| a + b)?,
            Dsub => self.binary_double(|a, b| a - b)?,
            Dmul => self.binary_double(|a, b| a * b)?,
            Ddiv => self.binary_double(|a, b| a / b)?,
            Drem => self.binary_double(|a, b| a % b)?,
            Dneg => {
                let v = self.pop_double()?;
                self.push_double(-v);
            }
            Iinc => {
                let index = self.frame().fetch_u8().ok_or(underflow())? as usize;
                let delta = self.frame().fetch_u8().ok_or(underflow())? as i8;
                let current = self.frame().local_variables[index].as_int()?;
                self.frame().local_variables[index] = Slot::Int(current.wrapping_add(delta as i32));
            }
            I2l => {
                let v = self.frame().pop()?.as_int()?;
                self.push_long(v as i64);
            }
            I2f => {
                let v = self.frame().pop()?.as_int()?;
                self.frame().push(Slot::Float(v as f32));
            }
            I2d => {
                let v = self.frame().pop()?.as_int()?;
                self.push_double(v as f64);
            }
            L2i => {
                let v = self.pop_long()?;
                self.frame().push(Slot::Int(v as i32));
            }
            L2f => {
                let v = self.pop_long()?;
                self.frame().push(Slot::Float(v as f32));
            }
            L2d => {
                let v = self.pop_long()?;
                self.push_double(v as f64);
            }
            F2i => {
                let v = self.frame().pop()?.as_float()?;
                self.frame().push(Slot::Int(v as i32));
            }
            F2l => {
                let v = self.frame().pop()?.as_float()?;
                self.push_long(v as i64);
            }
            F2d => {
                let v = self.frame().pop()?.as_float()?;
                self.push_double(v as f64);
            }
            D2i => {
                let v = self.pop_double()?;
                self.frame().push(Slot::Int(v as i32));
            }
            D2l => {
                let v = self.pop_double()?;
                self.push_long(v as i64);
            }
            D2f => {
                let v = self.pop_double()?;
                self.frame().push(Slot::Float(v as f32));
            }
            I2b => {
                let v = self.frame().pop()?.as_int()?;
                self.frame().push(Slot::Int(v as i8 as i32));
            }
            I2c => {
                let v = self.frame().pop()?.as_int()?;
                self.frame().push(Slot::Int(v as u16 as i32));
            }
            I2s => {
                let v = self.frame().pop()?.as_int()?;
                self.frame().push(Slot::Int(v as i16 as i32));
            }
            Lcmp => {
                let b = self.pop_long()?;
                let a = self.pop_long()?;
                self.frame().push(Slot::Int(a.cmp(&b) as i32));
            }
            Fcmpl | Fcmpg => {
                let b = self.frame().pop()?.as_float()?;
                let a = self.frame().pop()?.as_float()?;
                self.frame().push(Slot::Int(float_cmp(a, b, opcode == Fcmpg)));
            }
            Dcmpl | Dcmpg => {
                let b = self.pop_double()?;
                let a = self.pop_double()?;
                self.frame().push(Slot::Int(float_cmp(a, b, opcode == Dcmpg)));
            }
            Ifeq | Ifne | Iflt | Ifge | Ifgt | Ifle => {
                let target = self.frame().fetch_i16().ok_or(underflow())?;
                let value = self.frame().pop()?.as_int()?;
                if compare_to_zero(opcode, value) {
                    self.branch(target);
                }
            }
            IfIcmpeq | IfIcmpne | IfIcmplt | IfIcmpge | IfIcmpgt | IfIcmple => {
                let target = self.frame().fetch_i16().ok_or(underflow())?;
                let b = self.frame().pop()?.as_int()?;
                let a = self.frame().pop()?.as_int()?;
                if compare_ints(opcode, a, b) {
                    self.branch(target);
                }
            }
            IfAcmpeq | IfAcmpne => {
                let target = self.frame().fetch_i16().ok_or(underflow())?;
                let b = self.frame().pop()?.as_ref()?;
                let a = self.frame().pop()?.as_ref()?;
                if (a == b) == (opcode == IfAcmpeq) {
                    self.branch(target);
                }
            }
            Ifnull | Ifnonnull => {
                let target = self.frame().fetch_i16().ok_or(underflow())?;
                let value = self.frame().pop()?;
                if value.is_zero_or_null() == (opcode == Ifnull) {
                    self.branch(target);
                }
            }
            Goto => {
                let target = self.frame().fetch_i16().ok_or(underflow())?;
                self.branch(target);
            }
            GotoW => {
                let target = self.frame().fetch_i32().ok_or(underflow())?;
                self.branch_wide(target);
            }
            Jsr | JsrW => {
                let return_pc = if opcode == Jsr {
                    let target = self.frame().fetch_i16().ok_or(underflow())?;
                    let return_pc = self.frame().pc as i32;
                    self.branch(target);
                    return_pc
                } else {
                    let target = self.frame().fetch_i32().ok_or(underflow())?;
                    let return_pc = self.frame().pc as i32;
                    self.branch_wide(target);
                    return_pc
                };
                self.frame().push(Slot::Int(return_pc));
            }
            Ret => {
                let index = self.frame().fetch_u8().ok_or(underflow())? as usize;
                let target = self.frame().local_variables[index].as_int()?;
                self.frame().pc = target as usize;
            }
            Tableswitch => self.tableswitch()?,
            Lookupswitch => self.lookupswitch()?,
            Ireturn | Freturn | Areturn | Lreturn | Dreturn | Return => {
                let values = match opcode {
                    Ireturn | Freturn | Areturn => vec![self.frame().pop()?],
                    Lreturn => {
                        let v = self.pop_long()?;
                        vec![Slot::Long(v), Slot::Continuation]
                    }
                    Dreturn => {
                        let v = self.pop_double()?;
                        vec![Slot::Double(v), Slot::Continuation]
                    }
                    _ => vec![],
                };
                self.return_from_frame(values);
            }
            Getstatic => self.get_static(class_loader, instruction_pc)?,
            Putstatic => self.put_static(class_loader, instruction_pc)?,
            Getfield => self.get_field(class_loader)?,
            Putfield => self.put_field(class_loader)?,
            Invokevirtual => self.invoke_virtual(class_loader)?,
            Invokeinterface => return Err(VmError::Internal("invokeinterface is not supported".into())),
            Invokespecial => self.invoke_special(class_loader)?,
            Invokestatic => self.invoke_static(class_loader, instruction_pc)?,
            Invokedynamic => return Err(VmError::Internal("invokedynamic is not supported".into())),
            New => {
                let index = self.frame().fetch_u16().ok_or(underflow())?;
                let class_name = self.resolve_class_name(index)?;
                class_loader.ensure_class(&class_name).map_err(|e| VmError::Internal(e.to_string()))?;
                if self.trigger_class_init(class_loader, &class_name, instruction_pc)? {
                    return Ok(());
                }
                let reference = self.allocate_instance(class_loader, &class_name)?;
                self.frame().push(Slot::Ref(reference));
            }
            Newarray => {
                let atype = self.frame().fetch_u8().ok_or(underflow())?;
                let element_type = array_type_to_field_type(ArrayType::try_from(atype).map_err(|_| VmError::Internal(format!("invalid newarray atype {atype}")))?);
                let length = self.frame().pop()?.as_int()?;
                let reference = self.allocate_array(class_loader, element_type, length)?;
                self.frame().push(Slot::Ref(reference));
            }
            Anewarray => {
                let index = self.frame().fetch_u16().ok_or(underflow())?;
                let class_name = self.resolve_class_name(index)?;
                let length = self.frame().pop()?.as_int()?;
                let reference = self.allocate_array(class_loader, FieldType::ClassInstance(class_name), length)?;
                self.frame().push(Slot::Ref(reference));
            }
            Multianewarray => {
                let index = self.frame().fetch_u16().ok_or(underflow())?;
                let dimensions = self.frame().fetch_u8().ok_or(underflow())? as usize;
                let class_name = self.resolve_class_name(index)?;
                let mut counts = vec![0i32; dimensions];
                for i in (0..dimensions).rev() {
                    counts[i] = self.frame().pop()?.as_int()?;
                }
                let reference = self.allocate_multi_array(class_loader, &class_name, &counts)?;
                self.frame().push(Slot::Ref(reference));
            }
            Arraylength => {
                let array = self.frame().pop()?.as_ref()?;
                if array == NULL {
                    return Err(VmError::NullReference);
                }
                let length = class_loader.heap.get(array)?.array_length();
                self.frame().push(Slot::Int(length as i32));
            }
            Athrow => {
                let reference = self.frame().pop()?.as_ref()?;
                if reference == NULL {
                    return Err(VmError::NullReference);
                }
                self.pending_exception = Some(reference);
            }
            Checkcast => {
                let index = self.frame().fetch_u16().ok_or(underflow())?;
                let target_class = self.resolve_class_name(index)?;
                let reference = *self.frame().operand_stack.last().ok_or(underflow())?;
                let reference = reference.as_ref()?;
                if reference != NULL {
                    let actual = class_loader.heap.get(reference)?.class_name().unwrap_or("").to_string();
                    if !class_loader.is_subclass_of(&actual, &target_class) {
                        return Err(VmError::ClassCast { from: actual, to: target_class });
                    }
                }
            }
            Instanceof => {
                let index = self.frame().fetch_u16().ok_or(underflow())?;
                let target_class = self.resolve_class_name(index)?;
                let reference = self.frame().pop()?.as_ref()?;
                let result = if reference == NULL {
                    false
                } else {
                    let actual = class_loader.heap.get(reference)?.class_name().unwrap_or("").to_string();
                    class_loader.is_subclass_of(&actual, &target_class)
                };
                self.frame().push(Slot::Int(result as i32));
            }
            Monitorenter | Monitorexit => {
                // Single interpreter thread drives one `Thread` instance at
                // a time (see `SPEC_FULL.md` concurrency section); no real
                // lock is needed, only the reference-count-would-go-here
                // pop.
                self.frame().pop()?;
            }
            Wide => self.wide(class_loader)?,
        }
        Ok(())
    }

    fn frame(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("step called with no active frame")
    }

    fn load_local(&mut self, index: usize) {
        let value = self.frame().local_variables[index];
        self.frame().push(value);
    }

    /// Category-2 counterpart of `load_local`: pushes the value then a
    /// trailing `Continuation`, mirroring `push_long`/`push_double` so
    /// `pop_long`/`pop_double` and friends see the two-cell shape they
    /// expect.
    fn load_wide_local(&mut self, index: usize) {
        let value = self.frame().local_variables[index];
        self.frame().push(value);
        self.frame().push(Slot::Continuation);
    }

    fn store_local(&mut self, index: usize) -> Result<(), VmError> {
        let value = self.frame().pop()?;
        self.frame().local_variables[index] = value;
        Ok(())
    }

    fn store_wide_local(&mut self, index: usize) -> Result<(), VmError> {
        self.frame().pop()?; // Continuation
        let value = self.frame().pop()?;
        self.frame().local_variables[index] = value;
        self.frame().local_variables[index + 1] = Slot::Continuation;
        Ok(())
    }

    fn push_long(&mut self, value: i64) {
        self.frame().push(Slot::Long(value));
        self.frame().push(Slot::Continuation);
    }

    fn pop_long(&mut self) -> Result<i64, VmError> {
        self.frame().pop()?; // Continuation
        self.frame().pop()?.as_long()
    }

    fn push_double(&mut self, value: f64) {
        self.frame().push(Slot::Double(value));
        self.frame().push(Slot::Continuation);
    }

    fn pop_double(&mut self) -> Result<f64, VmError> {
        self.frame().pop()?; // Continuation
        self.frame().pop()?.as_double()
    }

    fn binary_int(&mut self, op: impl Fn(i32, i32) -> Result<i32, VmError>) -> Result<(), VmError> {
        let b = self.frame().pop()?.as_int()?;
        let a = self.frame().pop()?.as_int()?;
        self.frame().push(Slot::Int(op(a, b)?));
        Ok(())
    }

    fn binary_long(&mut self, op: impl Fn(i64, i64) -> Result<i64, VmError>) -> Result<(), VmError> {
        let b = self.pop_long()?;
        let a = self.pop_long()?;
        self.push_long(op(a, b)?);
        Ok(())
    }

    fn binary_float(&mut self, op: impl Fn(f32, f32) -> f32) -> Result<(), VmError> {
        let b = self.frame().pop()?.as_float()?;
        let a = self.frame().pop()?.as_float()?;
        self.frame().push(Slot::Float(op(a, b)));
        Ok(())
    }

    fn binary_double(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), VmError> {
        let b = self.pop_double()?;
        let a = self.pop_double()?;
        self.push_double(op(a, b));
        Ok(())
    }

    fn branch(&mut self, offset: i16) {
        let frame = self.frame();
        let origin = (frame.pc - 3) as i64; // opcode + 2-byte operand already consumed
        frame.pc = (origin + offset as i64) as usize;
    }

    fn branch_wide(&mut self, offset: i32) {
        let frame = self.frame();
        let origin = (frame.pc - 5) as i64; // opcode + 4-byte operand already consumed
        frame.pc = (origin + offset as i64) as usize;
    }

    fn tableswitch(&mut self) -> Result<(), VmError> {
        let frame = self.frame();
        let instruction_pc = frame.pc - 1;
        while frame.pc % 4 != 0 {
            frame.fetch_u8();
        }
        let default = frame.fetch_i32().ok_or(underflow())?;
        let low = frame.fetch_i32().ok_or(underflow())?;
        let high = frame.fetch_i32().ok_or(underflow())?;
        let index = frame.pop()?.as_int()?;

        let offset = if index < low || index > high {
            default
        } else {
            let entry = (index - low) as usize;
            for _ in 0..entry {
                frame.fetch_i32();
            }
            frame.fetch_i32().ok_or(underflow())?
        };
        frame.pc = (instruction_pc as i64 + offset as i64) as usize;
        Ok(())
    }

    fn lookupswitch(&mut self) -> Result<(), VmError> {
        let frame = self.frame();
        let instruction_pc = frame.pc - 1;
        while frame.pc % 4 != 0 {
            frame.fetch_u8();
        }
        let default = frame.fetch_i32().ok_or(underflow())?;
        let npairs = frame.fetch_i32().ok_or(underflow())?;
        let key = frame.pop()?.as_int()?;

        let mut offset = default;
        for _ in 0..npairs {
            let match_value = frame.fetch_i32().ok_or(underflow())?;
            let match_offset = frame.fetch_i32().ok_or(underflow())?;
            if match_value == key {
                offset = match_offset;
            }
        }
        frame.pc = (instruction_pc as i64 + offset as i64) as usize;
        Ok(())
    }

    fn wide(&mut self, class_loader: &mut ClassLoader) -> Result<(), VmError> {
        let modified = self.frame().fetch_u8().ok_or(underflow())?;
        let index = self.frame().fetch_u16().ok_or(underflow())? as usize;
        match Opcode::try_from(modified).map_err(|_| VmError::UnknownOpcode(modified))? {
            Opcode::Iload | Opcode::Fload | Opcode::Aload => {
                let value = self.frame().local_variables[index];
                self.frame().push(value);
            }
            Opcode::Lload | Opcode::Dload => {
                let value = self.frame().local_variables[index];
                self.frame().push(value);
                self.frame().push(Slot::Continuation);
            }
            Opcode::Istore | Opcode::Fstore | Opcode::Astore => {
                let value = self.frame().pop()?;
                self.frame().local_variables[index] = value;
            }
            Opcode::Lstore | Opcode::Dstore => {
                self.frame().pop()?; // Continuation
                let value = self.frame().pop()?;
                self.frame().local_variables[index] = value;
                self.frame().local_variables[index + 1] = Slot::Continuation;
            }
            Opcode::Iinc => {
                let delta = self.frame().fetch_i16().ok_or(underflow())?;
                let current = self.frame().local_variables[index].as_int()?;
                self.frame().local_variables[index] = Slot::Int(current.wrapping_add(delta as i32));
            }
            Opcode::Ret => {
                let target = self.frame().local_variables[index].as_int()?;
                self.frame().pc = target as usize;
            }
            other => return Err(VmError::Internal(format!("{other:?} is not valid after wide"))),
            // class_loader is unused by every arm above but kept in the
            // signature so future widenable opcodes needing it don't
            // require a signature change.
        }
        let _ = class_loader;
        Ok(())
    }

    fn resolve_class_name(&mut self, index: u16) -> Result<String, VmError> {
        match self.frame().constant(index) {
            Some(Constant::Class(info)) => Ok(info.name.clone()),
            _ => Err(VmError::Internal(format!("constant pool entry {index} is not a class"))),
        }
    }

    fn load_constant(&mut self, class_loader: &mut ClassLoader, index: u16) -> Result<(), VmError> {
        let constant = self.frame().constant(index).cloned().ok_or(VmError::Internal(format!("no constant at {index}")))?;
        match constant {
            Constant::Integer(v) => self.frame().push(Slot::Int(v)),
            Constant::Float(v) => self.frame().push(Slot::Float(v)),
            Constant::Long(v) => self.push_long(v),
            Constant::Double(v) => self.push_double(v),
            Constant::String(s) => {
                let reference = class_loader.intern_string(&s)?;
                self.frame().push(Slot::Ref(reference));
            }
            Constant::Class(info) => {
                class_loader.ensure_class(&info.name).map_err(|e| VmError::Internal(e.to_string()))?;
                let mirror = class_loader
                    .method_area
                    .classes
                    .get(&info.name)
                    .and_then(|k| k.java_lang_class_instance())
                    .unwrap_or(NULL);
                self.frame().push(Slot::Ref(mirror));
            }
            other => return Err(VmError::Internal(format!("unsupported ldc constant {other:?}"))),
        }
        Ok(())
    }

    fn field_descriptor(&mut self, index: u16) -> Result<(String, String, FieldType), VmError> {
        let (class, name_and_type) = match self.frame().constant(index) {
            Some(c) => c.as_field_ref().map(|(c, n)| (c.clone(), n.clone())),
            None => None,
        }
        .ok_or(VmError::Internal(format!("constant pool entry {index} is not a field ref")))?;
        let (name, descriptor) = name_and_type.as_name_and_type().ok_or(VmError::Internal("not a NameAndType".into()))?;
        let field_type = crate::descriptor::parse_field_descriptor(descriptor)
            .map_err(|e| VmError::Internal(e.to_string()))?
            .field_type;
        Ok((class.name, name.to_string(), field_type))
    }

    fn get_static(&mut self, class_loader: &mut ClassLoader, instruction_pc: usize) -> Result<(), VmError> {
        let index = self.frame().fetch_u16().ok_or(underflow())?;
        let (class_name, field_name, field_type) = self.field_descriptor(index)?;
        class_loader.ensure_class(&class_name).map_err(|e| VmError::Internal(e.to_string()))?;
        if self.trigger_class_init(class_loader, &class_name, instruction_pc)? {
            return Ok(());
        }
        let klass = class_loader.method_area.classes.get(&class_name).and_then(|k| k.as_instance_klass()).ok_or(VmError::MissingClass(class_name.clone()))?;
        let offset = klass.static_field_offset(&field_name).ok_or(VmError::Internal(format!("no static field {field_name}")))?;
        self.frame().push(klass.static_field_values[offset]);
        if field_type.category() == 2 {
            self.frame().push(klass.static_field_values[offset + 1]);
        }
        Ok(())
    }

    fn put_static(&mut self, class_loader: &mut ClassLoader, instruction_pc: usize) -> Result<(), VmError> {
        let index = self.frame().fetch_u16().ok_or(underflow())?;
        let (class_name, field_name, field_type) = self.field_descriptor(index)?;
        class_loader.ensure_class(&class_name).map_err(|e| VmError::Internal(e.to_string()))?;
        if self.trigger_class_init(class_loader, &class_name, instruction_pc)? {
            return Ok(());
        }
        let high = if field_type.category() == 2 { Some(self.frame().pop()?) } else { None };
        let value = self.frame().pop()?;
        let klass = class_loader.method_area.classes.get_mut(&class_name).and_then(|k| k.as_instance_klass_mut()).ok_or(VmError::MissingClass(class_name.clone()))?;
        let offset = klass.static_field_offset(&field_name).ok_or(VmError::Internal(format!("no static field {field_name}")))?;
        klass.static_field_values[offset] = value;
        if let Some(high) = high {
            klass.static_field_values[offset + 1] = high;
        }
        Ok(())
    }

    fn get_field(&mut self, class_loader: &mut ClassLoader) -> Result<(), VmError> {
        let index = self.frame().fetch_u16().ok_or(underflow())?;
        let (class_name, field_name, field_type) = self.field_descriptor(index)?;
        let reference = self.frame().pop()?.as_ref()?;
        if reference == NULL {
            return Err(VmError::NullReference);
        }
        let runtime_class = class_loader.heap.get(reference)?.class_name().unwrap_or(&class_name).to_string();
        let klass = class_loader.method_area.classes.get(&runtime_class).and_then(|k| k.as_instance_klass()).ok_or(VmError::MissingClass(runtime_class))?;
        let offset = klass.instance_field_offset(&field_name).ok_or(VmError::Internal(format!("no instance field {field_name}")))?;
        let object = class_loader.heap.get(reference)?;
        self.frame().push(object.data[offset]);
        if field_type.category() == 2 {
            self.frame().push(object.data[offset + 1]);
        }
        Ok(())
    }

    fn put_field(&mut self, class_loader: &mut ClassLoader) -> Result<(), VmError> {
        let index = self.frame().fetch_u16().ok_or(underflow())?;
        let (class_name, field_name, field_type) = self.field_descriptor(index)?;
        let high = if field_type.category() == 2 { Some(self.frame().pop()?) } else { None };
        let value = self.frame().pop()?;
        let reference = self.frame().pop()?.as_ref()?;
        if reference == NULL {
            return Err(VmError::NullReference);
        }
        let runtime_class = class_loader.heap.get(reference)?.class_name().unwrap_or(&class_name).to_string();
        let klass = class_loader.method_area.classes.get(&runtime_class).and_then(|k| k.as_instance_klass()).ok_or(VmError::MissingClass(runtime_class))?;
        let offset = klass.instance_field_offset(&field_name).ok_or(VmError::Internal(format!("no instance field {field_name}")))?;
        let object = class_loader.heap.get_mut(reference)?;
        object.data[offset] = value;
        if let Some(high) = high {
            object.data[offset + 1] = high;
        }
        Ok(())
    }

    fn method_ref(&mut self, index: u16) -> Result<(String, String, crate::descriptor::MethodDescriptor), VmError> {
        let (class, name_and_type) = match self.frame().constant(index) {
            Some(c) => c.as_method_ref().map(|(c, n)| (c.clone(), n.clone())),
            None => None,
        }
        .ok_or(VmError::Internal(format!("constant pool entry {index} is not a method ref")))?;
        let (name, descriptor) = name_and_type.as_name_and_type().ok_or(VmError::Internal("not a NameAndType".into()))?;
        let descriptor = crate::descriptor::parse_method_descriptor(descriptor).map_err(|e| VmError::Internal(e.to_string()))?;
        Ok((class.name, name.to_string(), descriptor))
    }

    fn pop_args(&mut self, descriptor: &crate::descriptor::MethodDescriptor) -> Result<Vec<Slot>, VmError> {
        let mut args = vec![Slot::Int(0); descriptor.parameter_slot_width()];
        let mut cursor = args.len();
        for param in descriptor.parameter_descriptors.iter().rev() {
            if param.category() == 2 {
                self.frame().pop()?; // Continuation
                let v = self.frame().pop()?;
                cursor -= 2;
                args[cursor] = v;
            } else {
                let v = self.frame().pop()?;
                cursor -= 1;
                args[cursor] = v;
            }
        }
        Ok(args)
    }

    fn invoke_static(&mut self, class_loader: &mut ClassLoader, instruction_pc: usize) -> Result<(), VmError> {
        let index = self.frame().fetch_u16().ok_or(underflow())?;
        let (class_name, method_name, descriptor) = self.method_ref(index)?;
        class_loader.ensure_class(&class_name).map_err(|e| VmError::Internal(e.to_string()))?;
        if self.trigger_class_init(class_loader, &class_name, instruction_pc)? {
            return Ok(());
        }
        let args = self.pop_args(&descriptor)?;
        self.dispatch(class_loader, &class_name, &method_name, &descriptor, args)
    }

    fn invoke_special(&mut self, class_loader: &mut ClassLoader) -> Result<(), VmError> {
        let index = self.frame().fetch_u16().ok_or(underflow())?;
        let (class_name, method_name, descriptor) = self.method_ref(index)?;
        class_loader.ensure_class(&class_name).map_err(|e| VmError::Internal(e.to_string()))?;
        let mut args = self.pop_args(&descriptor)?;
        let receiver = self.frame().pop()?;
        if receiver.as_ref()? == NULL {
            return Err(VmError::NullReference);
        }
        args.insert(0, receiver);
        self.dispatch(class_loader, &class_name, &method_name, &descriptor, args)
    }

    fn invoke_virtual(&mut self, class_loader: &mut ClassLoader) -> Result<(), VmError> {
        let index = self.frame().fetch_u16().ok_or(underflow())?;
        let (static_class, method_name, descriptor) = self.method_ref(index)?;
        let mut args = self.pop_args(&descriptor)?;
        let receiver = self.frame().pop()?;
        let receiver_ref = receiver.as_ref()?;
        if receiver_ref == NULL {
            return Err(VmError::NullReference);
        }

        let receiver_class = class_loader.heap.get(receiver_ref)?.class_name().unwrap_or(&static_class).to_string();
        let (owner, method) = class_loader.resolve_virtual_method(&receiver_class, &method_name, &descriptor)?;

        // The printing and thread-start hacks (see `intrinsics.rs`):
        // resolved to their declaring class like any other virtual call,
        // but recognized before a frame is built for them so neither one
        // ever needs to run real bytecode.
        if let Some(special) = intrinsics::resolve_special(&owner, &method_name) {
            return self.dispatch_special(class_loader, special, &descriptor, receiver, args);
        }

        args.insert(0, receiver);
        self.push_frame(class_loader, &owner, &method, args).map_err(|e| VmError::Internal(e.to_string()))
    }

    fn dispatch_special(
        &mut self,
        class_loader: &mut ClassLoader,
        special: intrinsics::SpecialMethod,
        descriptor: &crate::descriptor::MethodDescriptor,
        receiver: Slot,
        args: Vec<Slot>,
    ) -> Result<(), VmError> {
        match special {
            intrinsics::SpecialMethod::Println { newline } => {
                let text = match descriptor.parameter_descriptors.first() {
                    Some(field_type) => self.stringify_print_arg(class_loader, field_type, args[0])?,
                    None => String::new(),
                };
                self.emit_output(if newline { format!("{text}\n") } else { text });
                Ok(())
            }
            // Spawns a fresh interpreter and runs the receiver's `run`
            // method on it to completion before returning -- there is no
            // real OS-level concurrency here, only the one
            // cooperatively-scheduled `Thread` per JVM thread object.
            intrinsics::SpecialMethod::ThreadStart => {
                let receiver_ref = receiver.as_ref()?;
                let class_name =
                    class_loader.heap.get(receiver_ref)?.class_name().unwrap_or("java/lang/Thread").to_string();
                let run_descriptor = crate::descriptor::parse_method_descriptor("()V")
                    .map_err(|e| VmError::Internal(e.to_string()))?;
                let mut spawned = Thread::new(self.print_in_real_time);
                spawned
                    .invoke(class_loader, &class_name, "run", &run_descriptor, vec![receiver])
                    .map_err(|e| VmError::Internal(e.to_string()))?;
                Ok(())
            }
        }
    }

    /// Renders one `println`/`print` argument as text, per JVMS-adjacent
    /// `PrintStream` overload resolution: primitives print their value,
    /// `String` is decoded from its compact byte layout, anything else
    /// falls back to `ClassName@handle` the way `Object.toString()`'s
    /// default implementation does.
    fn stringify_print_arg(&mut self, class_loader: &mut ClassLoader, field_type: &FieldType, value: Slot) -> Result<String, VmError> {
        use FieldType::*;
        Ok(match field_type {
            Boolean => (value.as_int()? != 0).to_string(),
            Char => char::from_u32(value.as_int()? as u32).map(|c| c.to_string()).unwrap_or_default(),
            Byte | Short | Integer => value.as_int()?.to_string(),
            Long => value.as_long()?.to_string(),
            Float => value.as_float()?.to_string(),
            Double => value.as_double()?.to_string(),
            ClassInstance(name) if name == "java/lang/String" => {
                let reference = value.as_ref()?;
                if reference == NULL {
                    "null".to_string()
                } else {
                    self.decode_string(class_loader, reference)?
                }
            }
            _ => {
                let reference = value.as_ref()?;
                if reference == NULL {
                    "null".to_string()
                } else {
                    let class_name = class_loader.heap.get(reference)?.class_name().unwrap_or("java/lang/Object").to_string();
                    format!("{}@{:x}", class_name.replace('/', "."), reference)
                }
            }
        })
    }

    /// Reverses `ClassLoader::intern_string`'s compact-string encoding back
    /// into a Rust `String`, for `println(String)` and similar.
    fn decode_string(&mut self, class_loader: &mut ClassLoader, reference: crate::value::Reference) -> Result<String, VmError> {
        let klass = class_loader
            .method_area
            .classes
            .get("java/lang/String")
            .and_then(|k| k.as_instance_klass())
            .ok_or_else(|| VmError::MissingClass("java/lang/String".to_string()))?;
        let value_offset = klass.instance_field_offset("value").ok_or(VmError::Internal("String has no value field".into()))?;
        let coder_offset = klass.instance_field_offset("coder").ok_or(VmError::Internal("String has no coder field".into()))?;

        let object = class_loader.heap.get(reference)?;
        let array_ref = object.data[value_offset].as_ref()?;
        let coder = object.data[coder_offset].as_int()?;
        let array = class_loader.heap.get(array_ref)?;
        let bytes = array.data.iter().map(|s| s.as_int().map(|v| v as u8)).collect::<Result<Vec<u8>, _>>()?;

        Ok(if coder == 0 {
            bytes.iter().map(|&b| b as char).collect()
        } else {
            let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
            String::from_utf16_lossy(&units)
        })
    }

    /// Shared tail for `invokestatic`/`invokespecial`: resolves the method
    /// (static binding, no receiver-class dispatch) and pushes its frame,
    /// short-circuiting through `intrinsics` when it is native.
    fn dispatch(
        &mut self,
        class_loader: &mut ClassLoader,
        class_name: &str,
        method_name: &str,
        descriptor: &crate::descriptor::MethodDescriptor,
        args: Vec<Slot>,
    ) -> Result<(), VmError> {
        let (owner, method) = class_loader.resolve_method(class_name, method_name, descriptor)?;
        self.push_frame(class_loader, &owner, &method, args).map_err(|e| VmError::Internal(e.to_string()))
    }

    fn array_load(&mut self, class_loader: &mut ClassLoader, convert: impl Fn(&Slot) -> Result<Slot, VmError>) -> Result<(), VmError> {
        let index = self.frame().pop()?.as_int()?;
        let array = self.frame().pop()?.as_ref()?;
        if array == NULL {
            return Err(VmError::NullReference);
        }
        let object = class_loader.heap.get(array)?;
        let value = object
            .data
            .get(index as usize)
            .ok_or(VmError::IndexOutOfBounds { index, length: object.data.len() })?;
        self.frame().push(convert(value)?);
        Ok(())
    }

    fn array_store(&mut self, class_loader: &mut ClassLoader, convert: impl Fn(&Slot) -> Result<Slot, VmError>) -> Result<(), VmError> {
        let value = self.frame().pop()?;
        let index = self.frame().pop()?.as_int()?;
        let array = self.frame().pop()?.as_ref()?;
        if array == NULL {
            return Err(VmError::NullReference);
        }
        let converted = convert(&value)?;
        let object = class_loader.heap.get_mut(array)?;
        let length = object.data.len();
        let slot = object.data.get_mut(index as usize).ok_or(VmError::IndexOutOfBounds { index, length })?;
        *slot = converted;
        Ok(())
    }

    /// `laload`/`daload`: a single array element holds the whole 64-bit
    /// value (see `heap::push_default`), but the operand stack still needs
    /// the value plus a trailing `Continuation` to preserve category-2
    /// width for `dup2`/`pop2` and local-variable stores downstream.
    fn array_load_wide(&mut self, class_loader: &mut ClassLoader, convert: impl Fn(&Slot) -> Result<Slot, VmError>) -> Result<(), VmError> {
        self.array_load(class_loader, convert)?;
        self.frame().push(Slot::Continuation);
        Ok(())
    }

    /// `lastore`/`dastore`: pop the category-2 value (continuation then the
    /// real value) off the operand stack, but write only the single `Slot`
    /// the heap's per-element array layout expects.
    fn array_store_wide(&mut self, class_loader: &mut ClassLoader, convert: impl Fn(&Slot) -> Result<Slot, VmError>) -> Result<(), VmError> {
        self.frame().pop()?; // Continuation
        self.array_store(class_loader, convert)
    }

    fn allocate_multi_array(&mut self, class_loader: &mut ClassLoader, element_class: &str, counts: &[i32]) -> Result<crate::value::Reference, VmError> {
        let length = counts[0];
        let element_type = if counts.len() == 1 {
            FieldType::ClassInstance(element_class.to_string())
        } else {
            let mut inner = FieldType::ClassInstance(element_class.to_string());
            for _ in 1..counts.len() {
                inner = FieldType::Array(Box::new(inner));
            }
            inner
        };
        let array = self.allocate_array(class_loader, element_type, length)?;
        if counts.len() > 1 {
            for i in 0..length {
                let nested = self.allocate_multi_array(class_loader, element_class, &counts[1..])?;
                class_loader.heap.get_mut(array)?.data[i as usize] = Slot::Ref(nested);
            }
        }
        Ok(array)
    }
}

impl Default for Thread {
    fn default() -> Self {
        Thread::new(true)
    }
}

fn underflow() -> VmError {
    VmError::Internal("operand stack underflow".into())
}

fn compare_to_zero(opcode: Opcode, value: i32) -> bool {
    use Opcode::*;
    match opcode {
        Ifeq => value == 0,
        Ifne => value != 0,
        Iflt => value < 0,
        Ifge => value >= 0,
        Ifgt => value > 0,
        Ifle => value <= 0,
        _ => unreachable!(),
    }
}

fn compare_ints(opcode: Opcode, a: i32, b: i32) -> bool {
    use Opcode::*;
    match opcode {
        IfIcmpeq => a == b,
        IfIcmpne => a != b,
        IfIcmplt => a < b,
        IfIcmpge => a >= b,
        IfIcmpgt => a > b,
        IfIcmple => a <= b,
        _ => unreachable!(),
    }
}

/// JVMS `fcmp<op>`/`dcmp<op>`: NaN makes `fcmpg`/`dcmpg` return 1 and
/// `fcmpl`/`dcmpl` return -1, so that a subsequent `ifgt`/`iflt` branch can
/// be used for "greater-than-or-unordered" vs "less-than-or-unordered".
fn float_cmp<T: PartialOrd>(a: T, b: T, is_g_variant: bool) -> i32 {
    match a.partial_cmp(&b) {
        Some(std::cmp::Ordering::Less) => -1,
        Some(std::cmp::Ordering::Equal) => 0,
        Some(std::cmp::Ordering::Greater) => 1,
        None => {
            if is_g_variant {
                1
            } else {
                -1
            }
        }
    }
}

fn array_type_to_field_type(atype: ArrayType) -> FieldType {
    match atype {
        ArrayType::Boolean => FieldType::Boolean,
        ArrayType::Char => FieldType::Char,
        ArrayType::Float => FieldType::Float,
        ArrayType::Double => FieldType::Double,
        ArrayType::Byte => FieldType::Byte,
        ArrayType::Short => FieldType::Short,
        ArrayType::Int => FieldType::Integer,
        ArrayType::Long => FieldType::Long,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_cmp_nan_favors_g_variant_upward() {
        assert_eq!(float_cmp(f32::NAN, 1.0, true), 1);
        assert_eq!(float_cmp(f32::NAN, 1.0, false), -1);
    }

    #[test]
    fn int_div_rounds_toward_zero() {
        assert_eq!((-7i32).wrapping_div(2), -3);
    }

    #[test]
    fn array_type_atype_maps_to_primitive_field_types() {
        assert_eq!(array_type_to_field_type(ArrayType::Int), FieldType::Integer);
        assert_eq!(array_type_to_field_type(ArrayType::Long), FieldType::Long);
    }
}
