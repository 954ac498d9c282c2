use std::io::Write;

/// Single-line `done_request, left N` counter on stdout.
///
/// Purely observational: disabled in quiet mode and when the JSON report is
/// written to stdout, so it never corrupts machine-readable output.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    enabled: bool,
}

impl Progress {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn update(&self, left: usize) {
        if !self.enabled {
            return;
        }
        let mut stdout = std::io::stdout().lock();
        // Trailing spaces overwrite a longer previous count.
        let _ = write!(stdout, "\r{}", render(left));
        let _ = stdout.flush();
    }

    pub fn finish(&self) {
        if self.enabled {
            println!();
        }
    }
}

fn render(left: usize) -> String {
    format!("done_request, left {}    ", left)
}
