//! Signature: the ordered set of predicate declarations a monitor binds to.
//!
//! The textual form is the engine's own signature syntax, one declaration
//! per predicate: `name(sort, sort, ...)`. Declaration order is preserved
//! because the store schema and the event codec both rely on positional
//! column naming (`x1..xN`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Argument sort of a predicate position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgSort {
    Int,
    String,
    Float,
}

impl ArgSort {
    pub fn as_str(self) -> &'static str {
        match self {
            ArgSort::Int => "int",
            ArgSort::String => "string",
            ArgSort::Float => "float",
        }
    }

    fn parse(raw: &str) -> Result<Self, SignatureParseError> {
        match raw.trim() {
            "int" => Ok(ArgSort::Int),
            "string" => Ok(ArgSort::String),
            "float" => Ok(ArgSort::Float),
            other => Err(SignatureParseError::UnknownSort {
                sort: other.to_string(),
            }),
        }
    }
}

/// One predicate declaration: name plus the sorts of its argument positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredicateDecl {
    pub name: String,
    pub arg_sorts: Vec<ArgSort>,
}

impl PredicateDecl {
    pub fn arity(&self) -> usize {
        self.arg_sorts.len()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureParseError {
    #[error("malformed declaration: {chunk:?}")]
    Malformed { chunk: String },

    #[error("unknown sort: {sort:?}")]
    UnknownSort { sort: String },

    #[error("duplicate predicate: {name:?}")]
    Duplicate { name: String },

    #[error("empty signature")]
    Empty,

    #[error("invalid predicate name: {name:?}")]
    InvalidName { name: String },
}

/// Ordered set of predicate declarations.
///
/// Immutable once a monitor instance has bound to it; replacing the
/// signature requires resetting the whole instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    decls: Vec<PredicateDecl>,
}

impl Signature {
    /// Parse the engine's signature syntax. Whitespace and newlines between
    /// declarations are not significant.
    pub fn parse(text: &str) -> Result<Self, SignatureParseError> {
        let mut decls: Vec<PredicateDecl> = Vec::new();
        let mut rest = text.trim();
        while !rest.is_empty() {
            let close = rest
                .find(')')
                .ok_or_else(|| SignatureParseError::Malformed {
                    chunk: rest.to_string(),
                })?;
            let chunk = &rest[..close];
            let open = chunk
                .find('(')
                .ok_or_else(|| SignatureParseError::Malformed {
                    chunk: chunk.to_string(),
                })?;
            let name = chunk[..open].trim().to_string();
            if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                return Err(SignatureParseError::InvalidName { name });
            }
            if decls.iter().any(|d| d.name == name) {
                return Err(SignatureParseError::Duplicate { name });
            }
            let args = chunk[open + 1..].trim();
            let arg_sorts = if args.is_empty() {
                Vec::new()
            } else {
                args.split(',')
                    .map(ArgSort::parse)
                    .collect::<Result<Vec<_>, _>>()?
            };
            decls.push(PredicateDecl { name, arg_sorts });
            rest = rest[close + 1..].trim_start();
        }
        if decls.is_empty() {
            return Err(SignatureParseError::Empty);
        }
        Ok(Signature { decls })
    }

    /// Canonical textual form, one declaration per line. Round-trips through
    /// [`Signature::parse`].
    pub fn canonical_text(&self) -> String {
        let mut out = String::new();
        for decl in &self.decls {
            let sorts: Vec<&str> = decl.arg_sorts.iter().map(|s| s.as_str()).collect();
            out.push_str(&decl.name);
            out.push('(');
            out.push_str(&sorts.join(", "));
            out.push_str(")\n");
        }
        out
    }

    pub fn decls(&self) -> &[PredicateDecl] {
        &self.decls
    }

    pub fn get(&self, name: &str) -> Option<&PredicateDecl> {
        self.decls.iter().find(|d| d.name == name)
    }

    pub fn arity(&self, name: &str) -> Option<usize> {
        self.get(name).map(PredicateDecl::arity)
    }
}
