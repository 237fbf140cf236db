//! Operator-facing progress reporting: a thin seam the CLI implements with
//! stderr output and tests implement with an in-memory buffer.

pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Discards everything. Used where a caller has no operator to talk to
/// (e.g. a bare library call in a test).
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// Collects every line in order, tagged by level, for assertions in tests.
#[derive(Debug, Default)]
pub struct VecReporter {
    pub lines: Vec<(&'static str, String)>,
}

impl Reporter for VecReporter {
    fn info(&mut self, msg: &str) {
        self.lines.push(("info", msg.to_string()));
    }
    fn warn(&mut self, msg: &str) {
        self.lines.push(("warn", msg.to_string()));
    }
    fn error(&mut self, msg: &str) {
        self.lines.push(("error", msg.to_string()));
    }
}
