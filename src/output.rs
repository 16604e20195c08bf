//! Build output stream
//!
//! The order of lines relative to steps is part of the contract with
//! callers; the exact wording is not.

use crate::image::truncate_id;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Line-oriented writer for build progress.
///
/// Cheap to clone; clones share the underlying sink so container output
/// streamed from another task interleaves by line.
#[derive(Clone)]
pub struct Progress {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Progress {
    pub fn new(sink: impl Write + Send + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(sink))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Discards everything
    pub fn quiet() -> Self {
        Self::new(io::sink())
    }

    /// Write one line. Output errors never fail a build.
    pub fn line(&self, line: &str) {
        if let Ok(mut sink) = self.sink.lock() {
            let _ = writeln!(sink, "{}", line);
            let _ = sink.flush();
        }
    }

    pub fn step(&self, number: usize, total: usize, description: &str) {
        self.line(&format!("Step {}/{} : {}", number, total, description));
    }

    pub fn using_cache(&self) {
        self.line(" ---> Using cache");
    }

    pub fn warning(&self, warning: &str) {
        self.line(&format!(" ---> [Warning] {}", warning));
    }

    pub fn running_in(&self, container_id: &str) {
        self.line(&format!(" ---> Running in {}", truncate_id(container_id)));
    }

    pub fn image(&self, image_id: &str) {
        self.line(&format!(" ---> {}", truncate_id(image_id)));
    }

    pub fn removed(&self, container_id: &str) {
        self.line(&format!(
            " ---> Removed intermediate container {}",
            truncate_id(container_id)
        ));
    }
}

/// In-memory sink that can be read back after a build
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.0
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.lock() {
            Ok(mut inner) => {
                inner.extend_from_slice(buf);
                Ok(buf.len())
            }
            Err(_) => Err(io::Error::other("output buffer poisoned")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
