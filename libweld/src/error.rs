pub(crate) use anyhow::Error;
use crossbeam_queue::SegQueue;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Prints a warning. By using our own function for this, it'll be easier to find places that issue
/// warnings if we later want a flag to suppress them.
pub(crate) fn warning(message: &str) {
    println!("WARNING: weld: {message}");
}

/// Prints a line of user-requested diagnostic output, e.g. for `--trace-symbol`.
pub(crate) fn output(message: &str) {
    println!("weld: {message}");
}

/// Errors that shouldn't stop the phase that detected them, but must still fail the link. They're
/// recorded here from worker threads and checked once the parallel phases are done.
#[derive(Default)]
pub struct Diagnostics {
    errors: SegQueue<Error>,
}

impl Diagnostics {
    pub(crate) fn error(&self, error: Error) {
        self.errors.push(error);
    }

    /// Fails if any error was recorded. All but the first are printed, since returning gives us
    /// only one error value.
    pub fn check(&self) -> Result {
        let Some(first) = self.errors.pop() else {
            return Ok(());
        };
        while let Some(error) = self.errors.pop() {
            eprintln!("weld: error: {error:#}");
        }
        Err(first)
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}
