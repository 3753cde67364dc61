//! Toolchain registry: file extension -> compile/execute command templates.
//!
//! Extensions are matched exactly as received, leading dot included
//! (`".kt"`, not `"kt"` or `".KT"`). Supporting another language means adding
//! a [`ToolchainEntry`] to [`BUILTIN_TOOLCHAINS`]; nothing else changes.

use std::{collections::HashMap, path::Path};

use anyhow::{anyhow, Result};

/// Builds the argv for one step from the path of the materialized source file.
pub type CommandTemplate = fn(&Path) -> Result<Vec<String>>;

#[derive(Debug, Clone)]
pub struct ToolchainEntry {
    pub extension: &'static str,
    pub compile: CommandTemplate,
    /// `None` for syntax-check-only toolchains.
    pub execute: Option<CommandTemplate>,
    pub description: &'static str,
}

impl ToolchainEntry {
    pub fn compile_command(&self, source: &Path) -> Result<Vec<String>> {
        (self.compile)(source)
    }

    pub fn execute_command(&self, source: &Path) -> Option<Result<Vec<String>>> {
        self.execute.map(|build| build(source))
    }
}

pub const BUILTIN_TOOLCHAINS: &[ToolchainEntry] = &[
    ToolchainEntry {
        extension: ".kt",
        compile: kotlin_compile,
        execute: Some(kotlin_execute),
        description: "Kotlin compiler and executor",
    },
    ToolchainEntry {
        extension: ".java",
        compile: java_compile,
        execute: Some(java_execute),
        description: "Java compiler and executor",
    },
    ToolchainEntry {
        extension: ".py",
        compile: python_compile,
        execute: Some(python_execute),
        description: "Python syntax checker and executor",
    },
];

/// Immutable lookup table, built once and shared read-only.
#[derive(Debug, Clone)]
pub struct Registry {
    entries: HashMap<&'static str, ToolchainEntry>,
    order: Vec<&'static str>,
}

impl Registry {
    /// Later entries with a duplicate extension replace earlier ones.
    pub fn new(entries: impl IntoIterator<Item = ToolchainEntry>) -> Self {
        let mut map = HashMap::new();
        let mut order = Vec::new();
        for entry in entries {
            if map.insert(entry.extension, entry.clone()).is_none() {
                order.push(entry.extension);
            }
        }
        Self { entries: map, order }
    }

    pub fn builtin() -> Self {
        Self::new(BUILTIN_TOOLCHAINS.iter().cloned())
    }

    pub fn lookup(&self, extension: &str) -> Option<&ToolchainEntry> {
        self.entries.get(extension)
    }

    /// Entries in registration order.
    pub fn entries(&self) -> impl Iterator<Item = &ToolchainEntry> {
        self.order.iter().filter_map(|ext| self.entries.get(ext))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn path_arg(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("path is not valid UTF-8: {}", path.display()))
}

fn kotlin_jar(source: &Path) -> Result<String> {
    path_arg(&source.with_extension("jar"))
}

fn kotlin_compile(source: &Path) -> Result<Vec<String>> {
    Ok(vec![
        "kotlinc".into(),
        path_arg(source)?,
        "-include-runtime".into(),
        "-d".into(),
        kotlin_jar(source)?,
    ])
}

fn kotlin_execute(source: &Path) -> Result<Vec<String>> {
    Ok(vec!["java".into(), "-jar".into(), kotlin_jar(source)?])
}

fn java_compile(source: &Path) -> Result<Vec<String>> {
    Ok(vec!["javac".into(), path_arg(source)?])
}

fn java_execute(source: &Path) -> Result<Vec<String>> {
    let dir = source
        .parent()
        .ok_or_else(|| anyhow!("source has no parent directory: {}", source.display()))?;
    let class = source
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("cannot derive class name from {}", source.display()))?;
    Ok(vec!["java".into(), "-cp".into(), path_arg(dir)?, class.to_string()])
}

fn python_compile(source: &Path) -> Result<Vec<String>> {
    Ok(vec!["python3".into(), "-m".into(), "py_compile".into(), path_arg(source)?])
}

fn python_execute(source: &Path) -> Result<Vec<String>> {
    Ok(vec!["python3".into(), path_arg(source)?])
}
