//! Error types for the Lua interpreter

use std::fmt;

/// Result type for Lua operations
pub type Result<T> = std::result::Result<T, LuaError>;

/// Kind of a runtime error, independent of the message text.
///
/// Kept separate from the message so `pcall`/`xpcall` and the coroutine
/// boundary can classify an error without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Lexical,
    Syntax,
    StaticCompile,
    RuntimeType,
    RuntimeArity,
    RuntimeIndex,
    ArithmeticDomain,
    CoroutineState,
    StackOverflow,
    User,
}

/// Errors that can occur anywhere in the Lua front end or VM.
///
/// A raised Lua error is not necessarily a string: `error(t)` where `t` is a
/// table propagates `t` unchanged. `LuaValue` carries that case; the other
/// variants are produced internally by the compiler and VM and always carry
/// a formatted message plus an [`ErrorKind`] for classification.
#[derive(Debug, Clone)]
pub enum LuaError {
    /// Lexical error (unterminated string/comment, malformed numeral).
    Lexical { message: String, line: u32 },

    /// Parser error: well-formedness violation with the offending token.
    Syntax { message: String, line: u32 },

    /// Static-compile error: unresolved goto, bad `<const>`/`<close>` use.
    Compile { message: String, line: u32 },

    /// Runtime error with a message already prefixed per `error()` semantics.
    Runtime { message: String, kind: ErrorKind },

    /// Type error with structured expected/got fields, used by arithmetic
    /// and indexing sites before they've been formatted into a message.
    TypeError { expected: String, got: String },

    /// A value raised via `error(v)` where `v` is not a string (or a string
    /// raised at level 0, i.e. with no location prefix desired yet).
    Value(crate::value::Value),

    /// Internal invariant violation — a compiler or VM bug, not a Lua-level
    /// error. Should never be observable from a well-formed program.
    Internal(String),

    /// Arithmetic/bitwise conversion can't be represented as an integer.
    NoIntegerRepresentation,

    /// `resume`d a coroutine that is not suspended, or `yield`ed illegally.
    CoroutineState(String),

    /// Native or Lua call depth exceeded configured limits.
    StackOverflow,

    /// Instruction budget exhausted (host-imposed CPU limit).
    InstructionLimit,

    /// Heap/table arena handle no longer refers to a live object.
    InvalidHandle,

    /// Chunk failed the binary-format signature/size checks on load.
    InvalidBytecode(String),
}

impl LuaError {
    pub fn runtime(msg: impl Into<String>) -> Self {
        LuaError::Runtime { message: msg.into(), kind: ErrorKind::RuntimeType }
    }

    pub fn arity(msg: impl Into<String>) -> Self {
        LuaError::Runtime { message: msg.into(), kind: ErrorKind::RuntimeArity }
    }

    pub fn index(msg: impl Into<String>) -> Self {
        LuaError::Runtime { message: msg.into(), kind: ErrorKind::RuntimeIndex }
    }

    pub fn domain(msg: impl Into<String>) -> Self {
        LuaError::Runtime { message: msg.into(), kind: ErrorKind::ArithmeticDomain }
    }

    /// Best-effort plain-text rendering used when building traceback lines
    /// and when a non-string error value needs a placeholder description.
    pub fn describe(&self) -> String {
        match self {
            LuaError::Lexical { message, line } => format!("{}: {}", line, message),
            LuaError::Syntax { message, line } => format!("{}: {}", line, message),
            LuaError::Compile { message, line } => format!("{}: {}", line, message),
            LuaError::Runtime { message, .. } => message.clone(),
            LuaError::TypeError { expected, got } => {
                format!("expected {}, got {}", expected, got)
            }
            LuaError::Value(v) => format!("{}", v),
            LuaError::Internal(m) => format!("internal error: {}", m),
            LuaError::NoIntegerRepresentation => {
                "number has no integer representation".to_string()
            }
            LuaError::CoroutineState(m) => m.clone(),
            LuaError::StackOverflow => "stack overflow".to_string(),
            LuaError::InstructionLimit => "instruction limit exceeded".to_string(),
            LuaError::InvalidHandle => "invalid reference".to_string(),
            LuaError::InvalidBytecode(m) => format!("invalid bytecode: {}", m),
        }
    }
}

impl fmt::Display for LuaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}

impl std::error::Error for LuaError {}

/// Convenience constructor matching the parser's traditional call sites.
pub fn syntax_error(message: impl Into<String>, line: u32) -> LuaError {
    LuaError::Syntax { message: message.into(), line }
}

pub fn lexical_error(message: impl Into<String>, line: u32) -> LuaError {
    LuaError::Lexical { message: message.into(), line }
}

pub fn compile_error(message: impl Into<String>, line: u32) -> LuaError {
    LuaError::Compile { message: message.into(), line }
}

/// A smaller, closed error set for the binary chunk reader, where the
/// failure modes are fixed (bad signature, size mismatch, truncated input)
/// and a derive-based enum reads more clearly than hand-rolled `Display`.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("not a precompiled chunk")]
    BadSignature,
    #[error("version mismatch (expected {expected:#x}, got {got:#x})")]
    VersionMismatch { expected: u8, got: u8 },
    #[error("chunk corrupted: {0}")]
    Corrupted(String),
    #[error("unexpected end of chunk data")]
    Truncated,
    #[error("incompatible size of {name} (expected {expected}, got {got})")]
    SizeMismatch { name: &'static str, expected: u8, got: u8 },
}

impl From<ChunkError> for LuaError {
    fn from(err: ChunkError) -> Self {
        LuaError::InvalidBytecode(err.to_string())
    }
}
