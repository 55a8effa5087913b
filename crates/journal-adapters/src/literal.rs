//! Lookup catalogs embedded as literal declarations in the front-end script.
//!
//! Declarations are located by pattern, sliced out up to their balanced closing bracket and
//! decoded with a JSON5 data parser. Nothing in the artifact is ever evaluated.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use journal_core::{LookupCatalog, LookupCategory, LookupRecord};
use regex::Regex;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::{LookupSource, SourceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    List,
    EmailMap,
}

#[derive(Debug)]
struct Declaration {
    name: &'static str,
    category: LookupCategory,
    shape: Shape,
    /// Matches up to and including the opening bracket of the literal.
    pattern: &'static str,
}

const DECLARATIONS: [Declaration; 6] = [
    Declaration {
        name: "MKB_CODES",
        category: LookupCategory::Codes,
        shape: Shape::List,
        pattern: r"\b(?:const|let|var)\s+MKB_CODES\s*=\s*\[",
    },
    Declaration {
        name: "OPERATION_CODES",
        category: LookupCategory::OperationCodes,
        shape: Shape::List,
        pattern: r"\b(?:const|let|var)\s+OPERATION_CODES\s*=\s*\[",
    },
    Declaration {
        name: "ORG_EMAIL_MAP",
        category: LookupCategory::Organizations,
        shape: Shape::EmailMap,
        pattern: r"\b(?:const|let|var)\s+ORG_EMAIL_MAP\s*=\s*\{",
    },
    Declaration {
        name: "regions",
        category: LookupCategory::Regions,
        shape: Shape::List,
        pattern: r"\b(?:const|let|var)\s+regions\s*=\s*\[",
    },
    Declaration {
        name: "fillSelect('help-type')",
        category: LookupCategory::HelpTypes,
        shape: Shape::List,
        pattern: r#"\bfillSelect\(\s*['"]help-type['"]\s*,\s*\["#,
    },
    Declaration {
        name: "DEFAULT_DEPARTMENTS",
        category: LookupCategory::Departments,
        shape: Shape::List,
        pattern: r"\b(?:const|let|var)\s+DEFAULT_DEPARTMENTS\s*=\s*\[",
    },
];

/// Compiled `DECLARATIONS` patterns, index for index.
static PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    DECLARATIONS
        .iter()
        .map(|declaration| Regex::new(declaration.pattern).expect("declaration pattern compiles"))
        .collect()
});

/// Lookup source reading literal declarations from a script file.
#[derive(Debug, Clone)]
pub struct LiteralLookups {
    path: PathBuf,
}

impl LiteralLookups {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LookupSource for LiteralLookups {
    fn origin(&self) -> String {
        format!("literal:{}", self.path.display())
    }

    async fn lookups(&self) -> Result<LookupCatalog, SourceError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                SourceError::LookupSourceNotFound(self.path.clone())
            } else {
                SourceError::Io {
                    path: self.path.clone(),
                    source,
                }
            }
        })?;
        extract_lookups(&text)
    }
}

/// Extracts every known catalog from `text`. Absent declarations yield empty categories.
pub fn extract_lookups(text: &str) -> Result<LookupCatalog, SourceError> {
    let mut catalog = LookupCatalog::default();
    for (declaration, pattern) in DECLARATIONS.iter().zip(PATTERNS.iter()) {
        let Some(found) = pattern.find(text) else {
            debug!(declaration = declaration.name, "literal declaration absent");
            continue;
        };
        let open = found.end() - 1;
        let literal = balanced_literal(text, open).ok_or_else(|| SourceError::LiteralParse {
            name: declaration.name.to_string(),
            message: "unterminated literal".to_string(),
        })?;
        let value: JsonValue = json5::from_str(literal).map_err(|e| SourceError::LiteralParse {
            name: declaration.name.to_string(),
            message: e.to_string(),
        })?;

        let records = match declaration.shape {
            Shape::List => list_records(declaration, &value),
            Shape::EmailMap => organization_records(&value),
        };
        debug!(
            declaration = declaration.name,
            records = records.len(),
            "extracted literal declaration"
        );
        catalog.extend(records);
    }
    Ok(catalog)
}

fn list_records(declaration: &Declaration, value: &JsonValue) -> Vec<LookupRecord> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    let mut records = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let key = match item {
            JsonValue::String(s) => s.clone(),
            JsonValue::Number(n) => n.to_string(),
            other => {
                warn!(declaration = declaration.name, value = %other, "skipping non-scalar literal entry");
                continue;
            }
        };
        records.push(LookupRecord::named(declaration.category, key, Some(index as i64)));
    }
    records
}

fn organization_records(value: &JsonValue) -> Vec<LookupRecord> {
    let Some(entries) = value.as_object() else {
        return Vec::new();
    };
    entries
        .iter()
        .enumerate()
        .map(|(index, (name, emails))| {
            let emails = match emails {
                JsonValue::String(s) if !s.is_empty() => vec![s.clone()],
                JsonValue::Array(items) => items
                    .iter()
                    .filter_map(|e| e.as_str().filter(|s| !s.is_empty()).map(str::to_string))
                    .collect(),
                _ => Vec::new(),
            };
            LookupRecord::organization(name.clone(), emails, Some(index as i64))
        })
        .collect()
}

/// Slice from the bracket at `open` through its matching closer, skipping strings and comments.
fn balanced_literal(text: &str, open: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = open;
    while i < bytes.len() {
        match bytes[i] {
            b'[' | b'{' | b'(' => depth += 1,
            b']' | b'}' | b')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[open..=i]);
                }
            }
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }
    None
}
