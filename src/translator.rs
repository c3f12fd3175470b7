use crate::chat::ChatCompletionRequest;
use crate::source::{Source, SourceType};

/// Produces the per-upstream copy of a request. The original is never
/// mutated; the compatibility layer reads tool schemas from it later.
///
/// Aggregators never see `thinking`, and a tools-bearing request headed
/// for a non-FC upstream has its tool fields stripped here; the
/// compatibility layer re-injects the semantics as a prompt.
pub fn translate_request(req: &ChatCompletionRequest, src: &Source) -> ChatCompletionRequest {
    let mut translated = req.clone();

    if src.source_type == SourceType::Cpa {
        translated.thinking = None;
        if translated.has_tools() && !src.supports_fc_for_model(&req.model) {
            translated.strip_tool_fields();
        }
        return translated;
    }

    if translated.has_tools() && !src.capabilities().function_calling {
        translated.strip_tool_fields();
    }

    if translated.has_thinking() && !src.capabilities().extended_thinking {
        translated.thinking = None;
    }

    match src.source_type {
        // Anthropic-type sources speak the OpenAI-compatible surface of
        // their proxy; kept as an adaptation point.
        SourceType::Anthropic => translated,
        _ => translated,
    }
}
