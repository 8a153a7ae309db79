//! Indentation-aware line buffer shared by the emitters.

pub struct CodeWriter {
    out: String,
    indent: usize,
    unit: &'static str,
}

impl CodeWriter {
    pub fn new(unit: &'static str) -> Self {
        CodeWriter {
            out: String::new(),
            indent: 0,
            unit,
        }
    }

    /// Write `text` at the current indentation. Embedded newlines start
    /// new lines at the same indentation.
    pub fn line(&mut self, text: impl AsRef<str>) {
        for line in text.as_ref().split('\n') {
            if line.is_empty() {
                self.out.push('\n');
                continue;
            }
            for _ in 0..self.indent {
                self.out.push_str(self.unit);
            }
            self.out.push_str(line);
            self.out.push('\n');
        }
    }

    pub fn blank(&mut self) {
        if !self.out.is_empty() && !self.out.ends_with("\n\n") {
            self.out.push('\n');
        }
    }

    pub fn indent(&mut self) {
        self.indent += 1;
    }

    pub fn dedent(&mut self) {
        self.indent = self.indent.saturating_sub(1);
    }

    /// Append already formatted text verbatim.
    pub fn raw(&mut self, text: &str) {
        self.out.push_str(text);
    }

    pub fn finish(self) -> String {
        self.out
    }
}
