//! Go chunking with tree-sitter.

use super::{ChunkContext, chunk_type};
use crate::types::{Chunk, ChunkKind};
use thiserror::Error;
use tree_sitter::{Node, Parser};

#[derive(Debug, Error)]
pub enum GoChunkError {
    #[error("failed to set Go language: {0}")]
    Language(String),

    #[error("parser produced no tree")]
    NoTree,

    #[error("syntax error near line {line}")]
    Syntax { line: usize },
}

/// Signature complexity never exceeds this.
const MAX_COMPLEXITY: f32 = 3.0;

pub(super) fn chunk(ctx: &ChunkContext<'_>, source: &str) -> Result<Vec<Chunk>, GoChunkError> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_go::LANGUAGE.into())
        .map_err(|e| GoChunkError::Language(e.to_string()))?;

    let tree = parser.parse(source, None).ok_or(GoChunkError::NoTree)?;
    let root = tree.root_node();
    if root.has_error() {
        let line = first_error_row(root).unwrap_or(0) + 1;
        return Err(GoChunkError::Syntax { line });
    }

    let pad = ctx.config.min_context_lines;
    let mut chunks = Vec::new();
    let mut cursor = root.walk();
    for node in root.named_children(&mut cursor) {
        match node.kind() {
            "function_declaration" | "method_declaration" => {
                chunks.push(function_chunk(ctx, node, source, pad));
            }
            "type_declaration" => {
                let mut specs = node.walk();
                for spec in node.named_children(&mut specs) {
                    if matches!(spec.kind(), "type_spec" | "type_alias") {
                        chunks.push(type_chunk(ctx, spec, source, pad));
                    }
                }
            }
            "import_declaration" => {
                let (start, end) = rows(node);
                chunks.push(ctx.padded(start, end, pad, ChunkKind::Imports, chunk_type("imports")));
            }
            _ => {}
        }
    }
    Ok(chunks)
}

fn function_chunk(ctx: &ChunkContext<'_>, node: Node, source: &str, pad: usize) -> Chunk {
    let receiver = node.child_by_field_name("receiver");
    let params = node
        .child_by_field_name("parameters")
        .map_or(0, count_fields);
    let results = node.child_by_field_name("result").map_or(0, |result| {
        if result.kind() == "parameter_list" {
            count_fields(result)
        } else {
            1
        }
    });

    let complexity = signature_complexity(receiver.is_some(), params, results);
    let mut metadata = chunk_type(if receiver.is_some() { "method" } else { "function" });
    metadata.function_name = node
        .child_by_field_name("name")
        .map(|n| source[n.byte_range()].to_string());
    metadata.complexity = Some(complexity);
    metadata.adaptive_size =
        Some((ctx.config.base_chunk_size as f32 * complexity).round() as u32);
    if let Some(receiver) = receiver.and_then(|r| receiver_type(r, source)) {
        metadata.class_name = Some(receiver.clone());
        metadata.extra.insert("receiver".to_string(), receiver);
    }

    let (start, end) = rows(node);
    ctx.padded(start, end, pad, ChunkKind::Function, metadata)
}

fn type_chunk(ctx: &ChunkContext<'_>, spec: Node, source: &str, pad: usize) -> Chunk {
    let mut metadata = chunk_type("type");
    metadata.class_name = spec
        .child_by_field_name("name")
        .map(|n| source[n.byte_range()].to_string());
    if let Some(ty) = spec.child_by_field_name("type") {
        metadata
            .extra
            .insert("type_kind".to_string(), ty.kind().to_string());
    }
    let (start, end) = rows(spec);
    ctx.padded(start, end, pad, ChunkKind::Class, metadata)
}

/// `1 + 0.5 (receiver) + 0.2 per parameter + 0.2 per result`, capped.
pub(super) fn signature_complexity(has_receiver: bool, params: usize, results: usize) -> f32 {
    let mut complexity = 1.0;
    if has_receiver {
        complexity += 0.5;
    }
    complexity += params as f32 * 0.2;
    complexity += results as f32 * 0.2;
    complexity.min(MAX_COMPLEXITY)
}

fn count_fields(list: Node) -> usize {
    let mut cursor = list.walk();
    list.named_children(&mut cursor)
        .filter(|child| {
            matches!(
                child.kind(),
                "parameter_declaration" | "variadic_parameter_declaration"
            )
        })
        .count()
}

/// `(s *Server)` -> `Server`, `(l List[T])` -> `List`.
fn receiver_type(receiver: Node, source: &str) -> Option<String> {
    let mut cursor = receiver.walk();
    let param = receiver
        .named_children(&mut cursor)
        .find(|child| child.kind() == "parameter_declaration")?;
    let ty = &source[param.child_by_field_name("type")?.byte_range()];
    let name = ty.trim_start_matches('*').split('[').next()?.trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn rows(node: Node) -> (usize, usize) {
    (node.start_position().row, node.end_position().row)
}

fn first_error_row(node: Node) -> Option<usize> {
    if node.is_error() || node.is_missing() {
        return Some(node.start_position().row);
    }
    let mut cursor = node.walk();
    node.children(&mut cursor)
        .filter(|child| child.has_error())
        .find_map(first_error_row)
}
