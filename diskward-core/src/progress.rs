/// Receives progress from long-running stages.
///
/// Every method has a no-op default, and `()` implements the trait for
/// callers that do not display progress.
pub trait Progress {
    /// A new stage begins, covering `total` bytes.
    fn start(&mut self, _stage: &str, _total: u64) {}
    /// `done` bytes of the current stage are complete.
    fn advance(&mut self, _done: u64) {}
    fn finish(&mut self) {}
}

impl Progress for () {}
