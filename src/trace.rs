//! Call tracing.
//!
//! When tracing is enabled, every session API call emits exactly one
//! line: the function name, its arguments spelled verbatim, and for
//! handle-returning calls a `)=<kind>_<id>` terminator (`)=NULL` when
//! the call failed). The output is deterministic and serves as the
//! oracle of the non-regression tests.

use std::io::Write;

/// The trace sink of a session.
pub struct Tracer {
    sink: Box<dyn Write>,
}

impl Tracer {
    /// Wraps a writer into a tracer.
    pub fn new(sink: Box<dyn Write>) -> Self {
        Tracer { sink }
    }

    /// Emits one complete trace line.
    pub fn call(&mut self, name: &str, args: &str) {
        let _ = writeln!(self.sink, "{}({})", name, args);
    }

    /// Emits one trace line for a call returning a handle.
    pub fn call_handle(&mut self, name: &str, args: &str, kind: &str, id: Option<u32>) {
        match id {
            Some(id) => {
                let _ = writeln!(self.sink, "{}({})={}_{}", name, args, kind, id);
            }
            None => {
                let _ = writeln!(self.sink, "{}({})=NULL", name, args);
            }
        }
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Tracer")
    }
}
