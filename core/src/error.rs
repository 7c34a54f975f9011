use std::fmt;

/// Failure raised while reducing the graph.
///
/// `Fatal` covers broken invariants (bad bytecode, missing address-table
/// entries, stale handles) and tears the task down. `Application` covers
/// errors in the reduced program itself; the task records it and reports it
/// to the output-collecting task instead of crashing.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
    Fatal(String),
    Application(String),
}

pub type RtResult<T> = Result<T, RuntimeError>;

impl RuntimeError {
    pub fn fatal(message: impl Into<String>) -> Self {
        RuntimeError::Fatal(message.into())
    }

    pub fn app(message: impl Into<String>) -> Self {
        RuntimeError::Application(message.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, RuntimeError::Fatal(_))
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Fatal(msg) => write!(f, "fatal: {}", msg),
            RuntimeError::Application(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Build a `RuntimeError::Fatal` with `format!` syntax.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::error::RuntimeError::Fatal(format!($($arg)*))
    };
}

/// Application-level error recorded on a task, with the location it was raised at.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TaskError {
    pub task: u32,
    pub message: String,
    pub location: String,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {}: {} (at {})", self.task, self.message, self.location)
    }
}

impl std::error::Error for TaskError {}
