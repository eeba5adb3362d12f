//! Exception-table matching and stack unwinding.
//!
//! Grounded in the teacher's `Thread::handle_exception`, with the exact
//! catch-type-name comparison (`class_info_name == field_info_name`)
//! replaced by a full superclass-chain walk through
//! `ClassLoader::is_subclass_of` -- the teacher's version fails to catch a
//! `NullPointerException` with a `catch (RuntimeException e)` handler,
//! which is standard JVMS 2.10 behavior.

use crate::{classloader::ClassLoader, frame::Frame, heap::Heap, value::Reference};

/// Outcome of trying to deliver a pending exception to the current call
/// stack.
pub enum UnwindOutcome {
    /// A handler was found in `frames[handler_frame_index]`; its operand
    /// stack already has the exception reference pushed and its PC has
    /// been moved to the handler, so interpretation can resume there.
    Handled { handler_frame_index: usize },
    /// No handler anywhere on the stack; the thread must terminate.
    Uncaught,
}

/// Walks `frames` from the top down, looking for an exception-table entry
/// in each frame whose PC range covers that frame's current `pc` and whose
/// catch type is a superclass of (or exactly) the thrown object's class.
/// Frames without a match are popped (their values discarded, as JVMS
/// requires -- the frame's locals and partial operand stack are not
/// preserved across an unwind).
pub fn unwind(
    frames: &mut Vec<Frame>,
    class_loader: &ClassLoader,
    heap: &Heap,
    exception: Reference,
) -> UnwindOutcome {
    let thrown_class = match heap.get(exception).ok().and_then(|o| o.class_name()) {
        Some(name) => name.to_string(),
        None => return UnwindOutcome::Uncaught,
    };

    while let Some(frame) = frames.last_mut() {
        let handler_pc = frame.exception_table.iter().find_map(|item| {
            if item.pc_in_range(frame.pc) && item.catches(class_loader, &frame.constant_pool, &thrown_class) {
                Some(item.handler_pc)
            } else {
                None
            }
        });

        if let Some(handler_pc) = handler_pc {
            frame.operand_stack.clear();
            frame.pc = handler_pc;
            frame.push(crate::value::Slot::Ref(exception));
            return UnwindOutcome::Handled { handler_frame_index: frames.len() - 1 };
        }

        frames.pop();
    }

    UnwindOutcome::Uncaught
}

impl crate::class::ExceptionTableItem {
    fn pc_in_range(&self, pc: usize) -> bool {
        pc >= self.start_pc && pc < self.end_pc
    }

    fn catches(&self, class_loader: &ClassLoader, pool: &crate::class::Class, thrown_class: &str) -> bool {
        let Some(catch_type_index) = self.catch_type else {
            return true; // finally block: catches everything
        };
        let Some(catch_class) = pool
            .constant_pool
            .get((catch_type_index - 1) as usize)
            .and_then(crate::class::Constant::as_class)
        else {
            return false;
        };
        class_loader.is_subclass_of(thrown_class, &catch_class.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{class::ExceptionTableItem, config::Config};

    #[test]
    fn finally_handler_catches_everything() {
        let item = ExceptionTableItem { start_pc: 0, end_pc: 10, handler_pc: 20, catch_type: None };
        assert!(item.pc_in_range(5));
        assert!(!item.pc_in_range(10));
        let class_loader = ClassLoader::new(&Config::default());
        let pool = crate::class::Class {
            access: crate::class::parse_access_flags(0),
            constant_pool: vec![],
            this_class: crate::class::ClassInfo { name: "Test".into() },
            super_class: None,
            interfaces: vec![],
            fields: vec![],
            methods: vec![],
        };
        assert!(item.catches(&class_loader, &pool, "anything/At/All"));
    }

    #[test]
    fn uncaught_with_empty_stack_reports_uncaught() {
        let class_loader = ClassLoader::new(&Config::default());
        let heap = Heap::new(16);
        let mut frames: Vec<Frame> = vec![];
        assert!(matches!(unwind(&mut frames, &class_loader, &heap, 0), UnwindOutcome::Uncaught));
    }
}
