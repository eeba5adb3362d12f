use thiserror::Error;

/// Errors raised by the core VM (class loading, linking, the interpreter, the
/// heap). Boundary code (the binary class-file parser, the CLI) still uses
/// `Box<dyn std::error::Error>` with string literals the way the rest of the
/// crate does; this enum exists for the kinds the interpreter needs to
/// reason about (turn into a thrown exception, or abort the thread).
#[derive(Debug, Error)]
pub enum VmError {
    #[error("null pointer dereference")]
    NullReference,

    #[error("index {index} out of bounds for length {length}")]
    IndexOutOfBounds { index: i32, length: usize },

    #[error("division by zero")]
    ArithmeticDivZero,

    #[error("class {from} cannot be cast to {to}")]
    ClassCast { from: String, to: String },

    #[error("uncaught exception of type {0}")]
    Uncaught(String),

    #[error("heap space exhausted")]
    HeapFull,

    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("class {0} could not be found on the classpath")]
    MissingClass(String),

    #[error("{0}")]
    Internal(String),
}

impl VmError {
    /// The name of the source-platform exception class this error kind
    /// should be materialised as when thrown through the interpreter's
    /// unwinder, if any.
    pub fn exception_class_name(&self) -> Option<&'static str> {
        match self {
            VmError::NullReference => Some("java/lang/NullPointerException"),
            VmError::IndexOutOfBounds { .. } => Some("java/lang/ArrayIndexOutOfBoundsException"),
            VmError::ArithmeticDivZero => Some("java/lang/ArithmeticException"),
            VmError::ClassCast { .. } => Some("java/lang/ClassCastException"),
            _ => None,
        }
    }

    /// Whether this error kind terminates the owning thread outright rather
    /// than being materialised as a catchable exception.
    pub fn is_fatal(&self) -> bool {
        self.exception_class_name().is_none()
    }
}
