//! Minimal INI reader/writer for the engine settings file.
//!
//! - Sections in `[brackets]`
//! - `key=value` pairs, whitespace around both sides trimmed
//! - Comments start with `;` or `#` and survive a rewrite
//! - Written back with `\n` line endings

use std::path::Path;
use std::str::FromStr;

/// A parsed INI file preserving section order and comments.
#[derive(Debug, Clone, Default)]
pub struct IniFile {
    /// Sections in order. Empty name = entries before the first header.
    pub sections: Vec<IniSection>,
}

#[derive(Debug, Clone)]
pub struct IniSection {
    pub name: String,
    pub entries: Vec<IniEntry>,
}

#[derive(Debug, Clone)]
pub enum IniEntry {
    Comment(String),
    KeyValue { key: String, value: String },
    Blank,
}

impl IniFile {
    /// Parse INI content.
    pub fn parse(content: &str) -> Self {
        let mut sections = Vec::new();
        let mut current = IniSection {
            name: String::new(),
            entries: Vec::new(),
        };

        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() {
                current.entries.push(IniEntry::Blank);
            } else if trimmed.starts_with(';') || trimmed.starts_with('#') {
                current.entries.push(IniEntry::Comment(trimmed.to_string()));
            } else if let Some(name) = trimmed
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
            {
                sections.push(current);
                current = IniSection {
                    name: name.trim().to_string(),
                    entries: Vec::new(),
                };
            } else if let Some((key, value)) = trimmed.split_once('=') {
                current.entries.push(IniEntry::KeyValue {
                    key: key.trim().to_string(),
                    value: value.trim().to_string(),
                });
            } else {
                // Keep stray lines so a rewrite does not lose them.
                current.entries.push(IniEntry::Comment(format!("; {trimmed}")));
            }
        }

        sections.push(current);
        IniFile { sections }
    }

    /// Read and parse an INI file from disk.
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    pub fn write_to_string(&self) -> String {
        let mut out = String::new();
        let mut first_named = true;
        for section in &self.sections {
            if section.name.is_empty() {
                if section.entries.is_empty() {
                    continue;
                }
            } else {
                // Blank line between named sections unless one is already there
                if !first_named && !out.ends_with("\n\n") {
                    out.push('\n');
                }
                first_named = false;
                out.push('[');
                out.push_str(&section.name);
                out.push_str("]\n");
            }
            for entry in &section.entries {
                match entry {
                    IniEntry::Comment(c) => {
                        out.push_str(c);
                        out.push('\n');
                    }
                    IniEntry::KeyValue { key, value } => {
                        out.push_str(key);
                        out.push('=');
                        out.push_str(value);
                        out.push('\n');
                    }
                    IniEntry::Blank => out.push('\n'),
                }
            }
        }
        out
    }

    /// Write the INI file to disk, creating the parent directory.
    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.write_to_string())?;
        Ok(())
    }

    /// Get a raw value from a section.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.find_section(section).and_then(|s| {
            s.entries.iter().find_map(|e| match e {
                IniEntry::KeyValue { key: k, value } if k == key => Some(value.as_str()),
                _ => None,
            })
        })
    }

    /// Get a value and parse it.
    ///
    /// `Ok(None)` when the key is absent, `Err(raw)` when it is present but
    /// does not parse.
    pub fn get_parsed<T: FromStr>(&self, section: &str, key: &str) -> Result<Option<T>, String> {
        match self.get(section, key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| raw.to_string()),
        }
    }

    /// Set a value, creating the section/key if needed.
    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        let sec = self.find_or_create_section(section);
        for entry in sec.entries.iter_mut() {
            if let IniEntry::KeyValue { key: k, value: v } = entry {
                if k == key {
                    *v = value.to_string();
                    return;
                }
            }
        }
        sec.entries.push(IniEntry::KeyValue {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    /// Remove a key from a section. Returns whether anything was removed.
    pub fn remove(&mut self, section: &str, key: &str) -> bool {
        let Some(sec) = self.sections.iter_mut().find(|s| s.name == section) else {
            return false;
        };
        let len_before = sec.entries.len();
        sec.entries.retain(|e| match e {
            IniEntry::KeyValue { key: k, .. } => k != key,
            _ => true,
        });
        sec.entries.len() != len_before
    }

    fn find_section(&self, name: &str) -> Option<&IniSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    fn find_or_create_section(&mut self, name: &str) -> &mut IniSection {
        let idx = match self.sections.iter().position(|s| s.name == name) {
            Some(idx) => idx,
            None => {
                self.sections.push(IniSection {
                    name: name.to_string(),
                    entries: Vec::new(),
                });
                self.sections.len() - 1
            }
        };
        &mut self.sections[idx]
    }
}
