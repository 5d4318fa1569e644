/// Abstraction over user-facing output.
///
/// Command modules use this trait instead of `println!`/`eprintln!` so that
/// machine-readable output (`--json`) and human output go through one place.
pub trait UserOutput: Send + Sync {
    /// Informational status message (e.g., "Session: runs/login_20240101_120000_ab12")
    fn status(&self, message: &str);

    /// Success message (e.g., "Run completed: success")
    fn success(&self, message: &str);

    /// Warning message (e.g., "Unrecognized setting 'foo' is ignored")
    fn warning(&self, message: &str);

    /// Error message (e.g., "Step 'login' failed: ...")
    fn error(&self, message: &str);

    /// A blank line separator.
    fn blank(&self);
}

/// Standard CLI output. Writes to stdout/stderr, errors in red.
pub struct CliOutput;

impl UserOutput for CliOutput {
    fn status(&self, message: &str) {
        println!("{}", message);
    }

    fn success(&self, message: &str) {
        println!("\x1b[32m{}\x1b[0m", message);
    }

    fn warning(&self, message: &str) {
        eprintln!("\x1b[33m{}\x1b[0m", message);
    }

    fn error(&self, message: &str) {
        eprintln!("\x1b[31m{}\x1b[0m", message);
    }

    fn blank(&self) {
        println!();
    }
}
