//! Command templates and the extension dispatch table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{PagemillError, Result};
use crate::escape::posix_quote;
use crate::models::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placeholder {
    Input,
    Output,
    Stem,
    Ext,
    Dir,
}

const PLACEHOLDERS: &[(&str, Placeholder)] = &[
    ("input", Placeholder::Input),
    ("output", Placeholder::Output),
    ("stem", Placeholder::Stem),
    ("ext", Placeholder::Ext),
    ("dir", Placeholder::Dir),
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Value(Placeholder),
}

/// A shell command line with `{input}`, `{output}`, `{stem}`, `{ext}` and
/// `{dir}` placeholders. Substituted values are always shell-quoted; `{{` and
/// `}}` produce literal braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl CommandTemplate {
    pub fn new(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let segments = parse_segments(&source)?;
        Ok(Self { source, segments })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render the template for one input file. `{output}` is the input's file
    /// name placed under `out_dir`.
    pub fn render(&self, input: &Path, out_dir: &Path) -> Result<Command> {
        let file_name = input.file_name().ok_or_else(|| {
            PagemillError::Template(format!("input has no file name: {}", input.display()))
        })?;
        let output: PathBuf = out_dir.join(file_name);
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = input
            .extension()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut line = String::with_capacity(self.source.len() * 2);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => line.push_str(text),
                Segment::Value(placeholder) => {
                    let value = match placeholder {
                        Placeholder::Input => input.to_string_lossy().into_owned(),
                        Placeholder::Output => output.to_string_lossy().into_owned(),
                        Placeholder::Stem => stem.clone(),
                        Placeholder::Ext => ext.clone(),
                        Placeholder::Dir => out_dir.to_string_lossy().into_owned(),
                    };
                    line.push_str(&posix_quote(&value));
                }
            }
        }

        Ok(Command::new(line))
    }
}

fn parse_segments(source: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(n) => name.push(n),
                        None => {
                            return Err(PagemillError::Template(format!(
                                "unclosed placeholder in `{}`",
                                source
                            )))
                        }
                    }
                }
                let placeholder = PLACEHOLDERS
                    .iter()
                    .find(|(key, _)| *key == name)
                    .map(|(_, p)| *p)
                    .ok_or_else(|| {
                        PagemillError::Template(format!("unknown placeholder {{{}}}", name))
                    })?;
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Value(placeholder));
            }
            '}' => {
                return Err(PagemillError::Template(format!(
                    "unmatched `}}` in `{}`",
                    source
                )))
            }
            other => literal.push(other),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

/// Maps a file extension to the template that processes it. Extensions are
/// stored lowercase without the leading dot.
#[derive(Debug, Clone, Default)]
pub struct TemplateTable {
    entries: HashMap<String, CommandTemplate>,
}

impl TemplateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ext: &str, template: CommandTemplate) -> Option<CommandTemplate> {
        self.entries.insert(normalize_ext(ext), template)
    }

    pub fn with(mut self, ext: &str, template: CommandTemplate) -> Self {
        self.insert(ext, template);
        self
    }

    pub fn get(&self, ext: &str) -> Option<&CommandTemplate> {
        self.entries.get(&normalize_ext(ext))
    }

    pub fn template_for(&self, path: &Path) -> Option<&CommandTemplate> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.get(ext))
    }

    /// Build one command per input that has a table entry, in input order.
    /// Inputs without a matching extension are skipped.
    pub fn commands_for<P: AsRef<Path>>(&self, inputs: &[P], out_dir: &Path) -> Result<Vec<Command>> {
        let mut commands = Vec::new();
        for input in inputs {
            let input = input.as_ref();
            if let Some(template) = self.template_for(input) {
                commands.push(template.render(input, out_dir)?);
            }
        }
        Ok(commands)
    }
}

fn normalize_ext(ext: &str) -> String {
    ext.trim_start_matches('.').to_ascii_lowercase()
}
