// ABOUTME: Output line processors turning a process's stdout into typed results
// ABOUTME: Defines the OutputProcessor trait and re-exports the built-in processors

pub mod processor;

pub use processor::{
    FirstNonNullLineOutputProcessor, FirstResultOutputProcessor, LineProcessor,
    RaiseAndDiscardOutputProcessor, SimpleListOutputProcessor, SimpleOutputProcessor,
};

/// Consumes the lines of a stream one at a time and builds a result from them.
///
/// `process` is called once per line, then once with `None` when the stream ends. Implementations
/// must not block; they run on the thread pumping the process output.
pub trait OutputProcessor: Send + 'static {
    /// Item raised for an individual line.
    type Entry: Send + Sync + 'static;
    /// Final result once the stream is exhausted.
    type Output: Send + 'static;

    /// Feed one line, returning the entry it produced, if any.
    fn process(&mut self, line: Option<&str>) -> Option<Self::Entry>;

    fn result(&self) -> Self::Output;
}
