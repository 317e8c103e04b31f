//! Classification of callables into kind and input/output shapes.
//!
//! Sources are consulted in order: explicit [`ShapeHint`]s, shapes the callable declares
//! itself, and finally its signature string (`fn(Input) -> Output`).

use crate::core::descriptor::{Callable, ElementType, FunctionKind, Shape, ShapeHint};
use crate::core::error::{CatalogError, Result};

/// Where a classification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeSource {
    Hint,
    Structural,
    Signature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: FunctionKind,
    /// `None` for suppliers.
    pub input: Option<Shape>,
    /// `None` for consumers.
    pub output: Option<Shape>,
    /// The least authoritative source that contributed to the result.
    pub source: ShapeSource,
}

#[derive(Debug, Clone)]
pub struct TypeResolver {
    unknown_as_stream: bool,
}

impl Default for TypeResolver {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TypeResolver {
    /// `unknown_as_stream` decides whether erased element types are treated as streams.
    pub fn new(unknown_as_stream: bool) -> Self {
        Self { unknown_as_stream }
    }

    pub fn classify(
        &self,
        name: &str,
        callable: &Callable,
        hint: Option<&ShapeHint>,
    ) -> Result<Classification> {
        let kind = callable.kind();
        let hint = hint.copied().unwrap_or_default();
        let (declared_in, declared_out) = declared_shapes(callable);
        let parsed = callable.signature().and_then(|s| self.parse_signature(&s));

        let mut source = ShapeSource::Hint;
        let mut pick = |hinted: Option<Shape>, declared: Option<Shape>, parsed: Option<Shape>| {
            if hinted.is_some() {
                return hinted;
            }
            if declared.is_some() {
                source = source.max_with(ShapeSource::Structural);
                return declared;
            }
            if parsed.is_some() {
                source = source.max_with(ShapeSource::Signature);
            }
            parsed
        };

        let (parsed_in, parsed_out) = match parsed {
            Some(p) => (p.input, p.output),
            None => (None, None),
        };
        let input = match kind {
            FunctionKind::Supplier => None,
            _ => Some(
                pick(hint.input, declared_in, parsed_in)
                    .ok_or_else(|| unclassifiable(name, "input shape"))?,
            ),
        };
        let output = match kind {
            FunctionKind::Consumer => None,
            _ => Some(
                pick(hint.output, declared_out, parsed_out)
                    .ok_or_else(|| unclassifiable(name, "output shape"))?,
            ),
        };

        log::debug!(
            "Classified '{}' as {} (input: {:?}, output: {:?}, via {:?})",
            name,
            kind,
            input,
            output,
            source
        );
        Ok(Classification {
            kind,
            input,
            output,
            source,
        })
    }

    /// Parses `fn(Input) -> Output`, `fn() -> Output` or `fn(Input)`.
    fn parse_signature(&self, signature: &str) -> Option<ParsedSignature> {
        let rest = signature.trim().strip_prefix("fn(")?;
        let close = matching_paren(rest)?;
        let args = rest[..close].trim();
        let ret = rest[close + 1..].trim();

        let input = if args.is_empty() {
            None
        } else {
            if split_top_level(args).len() != 1 {
                return None;
            }
            Some(self.shape_of_token(args))
        };
        let output = match ret.strip_prefix("->") {
            Some(token) if !token.trim().is_empty() => Some(self.shape_of_token(token.trim())),
            Some(_) => return None,
            None if ret.is_empty() => None,
            None => return None,
        };
        Some(ParsedSignature { input, output })
    }

    fn shape_of_token(&self, token: &str) -> Shape {
        if let Some(item) = stream_item(token) {
            return Shape::stream(element_of(item));
        }
        match element_of(token) {
            ElementType::Unknown if is_erased(token) => Shape {
                element: ElementType::Unknown,
                stream: self.unknown_as_stream,
            },
            element => Shape::scalar(element),
        }
    }
}

impl ShapeSource {
    fn max_with(self, other: ShapeSource) -> ShapeSource {
        let rank = |s: ShapeSource| match s {
            ShapeSource::Hint => 0,
            ShapeSource::Structural => 1,
            ShapeSource::Signature => 2,
        };
        if rank(other) > rank(self) { other } else { self }
    }
}

struct ParsedSignature {
    input: Option<Shape>,
    output: Option<Shape>,
}

fn declared_shapes(callable: &Callable) -> (Option<Shape>, Option<Shape>) {
    match callable {
        Callable::Function(l) => match l.shapes() {
            Some((i, o)) => (Some(i), Some(o)),
            None => (None, None),
        },
        Callable::Supplier(l) => (None, l.output_shape()),
        Callable::Consumer(l) => (l.input_shape(), None),
    }
}

fn unclassifiable(name: &str, side: &str) -> CatalogError {
    CatalogError::Unclassifiable {
        name: name.to_string(),
        reason: format!("no hint, declared shape or parsable signature provides the {side}"),
    }
}

/// Index of the `)` closing the already opened parenthesis.
fn matching_paren(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' | '<' | '[' => depth += 1,
            ')' if depth == 0 => return Some(i),
            ')' | ']' => depth = depth.checked_sub(1)?,
            // `->` inside nested fn types is not a closing bracket
            '>' if !s[..i].ends_with('-') => depth = depth.checked_sub(1)?,
            _ => {}
        }
    }
    None
}

fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' | '<' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            '>' if !s[..i].ends_with('-') => depth -= 1,
            ',' if depth == 0 => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts
}

/// The item type of the designated stream wrapper (`Stream<Item = T>`), if `token` is one.
fn stream_item(token: &str) -> Option<&str> {
    if let Some(pos) = token.find("Stream<Item = ") {
        let item = &token[pos + "Stream<Item = ".len()..];
        return Some(item_until_close(item));
    }
    // Written by hand: `BoxStream<'static, T>` or `BoxStream<T>`
    let pos = token.find("BoxStream<")?;
    let args = item_until_close(&token[pos + "BoxStream<".len()..]);
    split_top_level(args)
        .into_iter()
        .rfind(|a| !a.starts_with('\''))
}

fn item_until_close(s: &str) -> &str {
    let mut depth = 0i32;
    for (i, c) in s.char_indices() {
        match c {
            '<' | '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            '>' if depth == 0 => return s[..i].trim(),
            '>' => depth -= 1,
            '+' if depth == 0 => return s[..i].trim(),
            _ => {}
        }
    }
    s.trim()
}

/// Generic parameters, placeholders and `dyn Any` carry no element information.
fn is_erased(token: &str) -> bool {
    let t = token.trim();
    t.is_empty()
        || t == "_"
        || t == "?"
        || t.contains("dyn core::any::Any")
        || t.contains("dyn Any")
        || (t.len() == 1 && t.chars().all(|c| c.is_ascii_uppercase()))
}

fn element_of(token: &str) -> ElementType {
    let t = token.trim().trim_start_matches('&');
    if is_erased(t) {
        return ElementType::Unknown;
    }
    if t.contains("Vec<u8>") || t.ends_with("[u8]") {
        return ElementType::Bytes;
    }
    let path = t.split('<').next().unwrap_or(t);
    let simple = path.rsplit("::").next().unwrap_or(path).trim();
    match simple {
        "String" | "str" | "Cow" => ElementType::Text,
        "Bytes" | "BytesMut" => ElementType::Bytes,
        "Payload" => ElementType::Unknown,
        _ => ElementType::Record,
    }
}
