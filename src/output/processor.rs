// ABOUTME: Built-in output processors for accumulating, listing and picking process output lines
// ABOUTME: Each processor is a plain state machine fed by the process wrapper

use super::OutputProcessor;

/// Accumulates every line into one string joined by `\n`.
#[derive(Debug, Default, Clone)]
pub struct SimpleOutputProcessor {
    lines: Vec<String>,
}

impl SimpleOutputProcessor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputProcessor for SimpleOutputProcessor {
    type Entry = String;
    type Output = String;

    fn process(&mut self, line: Option<&str>) -> Option<String> {
        let line = line?;
        self.lines.push(line.to_string());
        Some(line.to_string())
    }

    fn result(&self) -> String {
        self.lines.join("\n")
    }
}

/// Collects every line into a list.
#[derive(Debug, Default, Clone)]
pub struct SimpleListOutputProcessor {
    lines: Vec<String>,
}

impl SimpleListOutputProcessor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputProcessor for SimpleListOutputProcessor {
    type Entry = String;
    type Output = Vec<String>;

    fn process(&mut self, line: Option<&str>) -> Option<String> {
        let line = line?;
        self.lines.push(line.to_string());
        Some(line.to_string())
    }

    fn result(&self) -> Vec<String> {
        self.lines.clone()
    }
}

/// Collects the entries a converter extracts from lines it recognises.
pub struct LineProcessor<T, F> {
    converter: F,
    entries: Vec<T>,
}

impl<T, F> LineProcessor<T, F>
where
    F: FnMut(&str) -> Option<T>,
{
    pub fn new(converter: F) -> Self {
        Self {
            converter,
            entries: Vec::new(),
        }
    }
}

impl<T, F> OutputProcessor for LineProcessor<T, F>
where
    T: Clone + Send + Sync + 'static,
    F: FnMut(&str) -> Option<T> + Send + 'static,
{
    type Entry = T;
    type Output = Vec<T>;

    fn process(&mut self, line: Option<&str>) -> Option<T> {
        let entry = (self.converter)(line?)?;
        self.entries.push(entry.clone());
        Some(entry)
    }

    fn result(&self) -> Vec<T> {
        self.entries.clone()
    }
}

/// Keeps the first entry a parser accepts and ignores everything after it.
pub struct FirstResultOutputProcessor<T, F> {
    parser: F,
    result: Option<T>,
}

impl<T, F> FirstResultOutputProcessor<T, F>
where
    F: FnMut(&str) -> Option<T>,
{
    pub fn new(parser: F) -> Self {
        Self {
            parser,
            result: None,
        }
    }
}

impl<T, F> OutputProcessor for FirstResultOutputProcessor<T, F>
where
    T: Clone + Send + Sync + 'static,
    F: FnMut(&str) -> Option<T> + Send + 'static,
{
    type Entry = T;
    type Output = Option<T>;

    fn process(&mut self, line: Option<&str>) -> Option<T> {
        if self.result.is_some() {
            return None;
        }
        let entry = (self.parser)(line?)?;
        self.result = Some(entry.clone());
        Some(entry)
    }

    fn result(&self) -> Option<T> {
        self.result.clone()
    }
}

/// Keeps the first non-empty line, trimmed and optionally converted.
pub struct FirstNonNullLineOutputProcessor<T> {
    converter: Box<dyn FnMut(&str) -> T + Send>,
    result: Option<T>,
}

impl FirstNonNullLineOutputProcessor<String> {
    pub fn new() -> Self {
        Self::with_converter(str::to_string)
    }
}

impl Default for FirstNonNullLineOutputProcessor<String> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FirstNonNullLineOutputProcessor<T> {
    pub fn with_converter<F>(converter: F) -> Self
    where
        F: FnMut(&str) -> T + Send + 'static,
    {
        Self {
            converter: Box::new(converter),
            result: None,
        }
    }
}

impl<T> OutputProcessor for FirstNonNullLineOutputProcessor<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Entry = T;
    type Output = Option<T>;

    fn process(&mut self, line: Option<&str>) -> Option<T> {
        if self.result.is_some() {
            return None;
        }
        let line = line?;
        if line.is_empty() {
            return None;
        }
        let entry = (self.converter)(line.trim());
        self.result = Some(entry.clone());
        Some(entry)
    }

    fn result(&self) -> Option<T> {
        self.result.clone()
    }
}

/// Raises every line as an entry and keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct RaiseAndDiscardOutputProcessor;

impl OutputProcessor for RaiseAndDiscardOutputProcessor {
    type Entry = String;
    type Output = ();

    fn process(&mut self, line: Option<&str>) -> Option<String> {
        line.map(str::to_string)
    }

    fn result(&self) {}
}
