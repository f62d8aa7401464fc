//! Navigation of provider reply envelopes.
//!
//! Provider replies are treated as untrusted, partially specified JSON. Each
//! shape we know about is one strategy variant; callers try them in
//! `PRIORITY` order and take the first hit. No match means an empty result.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextStrategy {
    /// `candidate.content.parts[*].text`, concatenated.
    Parts,
    /// `candidate.content.text`
    ContentText,
    /// `candidate.text`
    CandidateText,
}

impl TextStrategy {
    pub const PRIORITY: [TextStrategy; 3] = [
        TextStrategy::Parts,
        TextStrategy::ContentText,
        TextStrategy::CandidateText,
    ];

    pub fn apply(self, candidate: &Value) -> Option<String> {
        let text = match self {
            TextStrategy::Parts => {
                let parts = candidate.get("content")?.get("parts")?;
                match parts {
                    Value::Array(items) => items
                        .iter()
                        .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
                        .collect::<String>(),
                    Value::Object(_) => parts.get("text")?.as_str()?.to_string(),
                    _ => return None,
                }
            }
            TextStrategy::ContentText => candidate
                .get("content")?
                .get("text")?
                .as_str()?
                .to_string(),
            TextStrategy::CandidateText => candidate.get("text")?.as_str()?.to_string(),
        };
        non_empty(text.trim())
    }
}

pub fn first_candidate(envelope: &Value) -> Option<&Value> {
    envelope
        .get("candidates")?
        .as_array()?
        .first()
        .filter(|c| c.is_object())
}

pub fn candidate_text(candidate: &Value) -> Option<String> {
    TextStrategy::PRIORITY
        .iter()
        .find_map(|strategy| strategy.apply(candidate))
}

/// Text of one streamed envelope. Unlike [`candidate_text`] nothing is
/// trimmed, since whitespace at chunk edges belongs to the running text.
pub fn stream_chunk_text(envelope: &Value) -> Option<String> {
    let parts = first_candidate(envelope)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
        .collect();
    non_empty(&text)
}

/// Safety-filter diagnostic attached to an envelope without candidates.
pub fn block_reason(envelope: &Value) -> Option<String> {
    let feedback = envelope.get("promptFeedback")?;
    feedback
        .get("blockReason")
        .or_else(|| feedback.get("blockReasonMessage"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub mime_type: String,
    pub data: String,
}

impl InlineImage {
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStrategy {
    /// First part of the first candidate carrying `inlineData`.
    InlineData,
    /// `predictions[0].bytesBase64Encoded`; always PNG.
    Prediction,
}

impl ImageStrategy {
    pub fn apply(self, envelope: &Value) -> Option<InlineImage> {
        match self {
            ImageStrategy::InlineData => {
                let parts = first_candidate(envelope)?
                    .get("content")?
                    .get("parts")?
                    .as_array()?;
                parts.iter().find_map(|part| {
                    let inline = part.get("inlineData").or_else(|| part.get("inline_data"))?;
                    let data = inline.get("data")?.as_str().filter(|d| !d.is_empty())?;
                    let mime_type = inline
                        .get("mimeType")
                        .or_else(|| inline.get("mime_type"))
                        .and_then(|m| m.as_str())
                        .filter(|m| !m.is_empty())
                        .map(str::to_string)
                        .unwrap_or_else(|| mime::IMAGE_PNG.to_string());
                    Some(InlineImage {
                        mime_type,
                        data: data.to_string(),
                    })
                })
            }
            ImageStrategy::Prediction => {
                let data = envelope
                    .get("predictions")?
                    .as_array()?
                    .first()?
                    .get("bytesBase64Encoded")?
                    .as_str()
                    .filter(|d| !d.is_empty())?;
                Some(InlineImage {
                    mime_type: mime::IMAGE_PNG.to_string(),
                    data: data.to_string(),
                })
            }
        }
    }
}

/// Shapes a completed queue job may put under `output`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStrategy {
    StringList,
    ChoiceTokens,
    ChoiceText,
    MessageContent,
    DictText,
    PlainString,
}

impl OutputStrategy {
    pub const PRIORITY: [OutputStrategy; 6] = [
        OutputStrategy::StringList,
        OutputStrategy::ChoiceTokens,
        OutputStrategy::ChoiceText,
        OutputStrategy::MessageContent,
        OutputStrategy::DictText,
        OutputStrategy::PlainString,
    ];

    pub fn apply(self, output: &Value) -> Option<String> {
        let text = match self {
            OutputStrategy::StringList => {
                let items = output.as_array()?;
                if items.is_empty() || !items.iter().all(Value::is_string) {
                    return None;
                }
                items.iter().filter_map(Value::as_str).collect::<String>()
            }
            OutputStrategy::ChoiceTokens => {
                join_records(output, |choice| join_strings(choice.get("tokens")?))?
            }
            OutputStrategy::ChoiceText => {
                join_records(output, |choice| string_or_list(choice.get("text")?))?
            }
            OutputStrategy::MessageContent => join_records(output, |choice| {
                choice
                    .get("message")?
                    .get("content")?
                    .as_str()
                    .map(str::to_string)
            })?,
            OutputStrategy::DictText => {
                if !output.is_object() {
                    return None;
                }
                string_or_list(output.get("text")?)?
            }
            OutputStrategy::PlainString => output.as_str()?.to_string(),
        };
        non_empty(&text)
    }
}

pub fn job_output_text(output: &Value) -> Option<String> {
    OutputStrategy::PRIORITY
        .iter()
        .find_map(|strategy| strategy.apply(output))
}

/// Cut a JSON object or array out of model prose, dropping markdown fences.
pub fn extract_json_block(text: &str) -> String {
    let clean = text.replace("```json", "").replace("```", "");
    let first_obj = clean.find('{');
    let first_arr = clean.find('[');

    let (first, closer) = match (first_obj, first_arr) {
        (None, None) => return clean,
        (Some(obj), None) => (obj, '}'),
        (None, Some(arr)) => (arr, ']'),
        (Some(obj), Some(arr)) if arr < obj => (arr, ']'),
        (Some(obj), Some(_)) => (obj, '}'),
    };
    match clean.rfind(closer) {
        Some(last) if last >= first => clean[first..=last].to_string(),
        _ => clean,
    }
}

fn records(output: &Value) -> Vec<&Value> {
    match output {
        Value::Array(items) => items.iter().filter(|item| item.is_object()).collect(),
        Value::Object(_) => vec![output],
        _ => Vec::new(),
    }
}

fn join_records(output: &Value, pick: impl Fn(&Value) -> Option<String>) -> Option<String> {
    let pieces: Vec<String> = records(output)
        .into_iter()
        .filter_map(|record| {
            let choice = record.get("choices")?.as_array()?.first()?;
            pick(choice)
        })
        .collect();
    if pieces.is_empty() {
        None
    } else {
        Some(pieces.concat())
    }
}

fn join_strings(value: &Value) -> Option<String> {
    let items = value.as_array()?;
    Some(items.iter().filter_map(Value::as_str).collect())
}

fn string_or_list(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(_) => join_strings(value),
        _ => None,
    }
}

fn non_empty(text: &str) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn joins_text_parts_and_skips_others() {
        let envelope = json!({"candidates": [{"content": {"parts": [
            {"text": "Once upon "},
            {"inlineData": {"data": "AAAA"}},
            {"text": "a time. "}
        ]}}]});
        let candidate = first_candidate(&envelope).unwrap();
        assert_eq!(candidate_text(candidate).as_deref(), Some("Once upon a time."));
    }

    #[test]
    fn stream_chunks_keep_edge_whitespace() {
        let envelope = json!({"candidates": [{"content": {"parts": [
            {"text": " the fox "},
            {"text": "ran.\n"}
        ]}}]});
        assert_eq!(stream_chunk_text(&envelope).as_deref(), Some(" the fox ran.\n"));
        assert_eq!(
            stream_chunk_text(&json!({"candidates": [{"finishReason": "STOP"}]})),
            None
        );
    }

    #[test]
    fn falls_back_to_secondary_text_locations() {
        let content_text = json!({"content": {"parts": [], "text": "from content"}});
        assert_eq!(candidate_text(&content_text).as_deref(), Some("from content"));

        let candidate_level = json!({"content": {"parts": [{"text": "  "}]}, "text": "top"});
        assert_eq!(candidate_text(&candidate_level).as_deref(), Some("top"));

        assert_eq!(candidate_text(&json!({"finishReason": "MAX_TOKENS"})), None);
    }

    #[test]
    fn reads_block_reason() {
        let envelope = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        assert_eq!(first_candidate(&envelope), None);
        assert_eq!(block_reason(&envelope).as_deref(), Some("SAFETY"));
    }

    #[test]
    fn inline_image_defaults_to_png() {
        let envelope = json!({"candidates": [{"content": {"parts": [
            {"text": "here you go"},
            {"inlineData": {"data": "iVBOR"}},
            {"inlineData": {"mimeType": "image/jpeg", "data": "/9j/"}}
        ]}}]});
        let image = ImageStrategy::InlineData.apply(&envelope).unwrap();
        assert_eq!(image.to_data_url(), "data:image/png;base64,iVBOR");
    }

    #[test]
    fn prediction_without_bytes_is_absent() {
        assert_eq!(
            ImageStrategy::Prediction.apply(&json!({"predictions": [{"raiFilteredReason": "x"}]})),
            None
        );
        assert_eq!(ImageStrategy::Prediction.apply(&json!({})), None);
    }

    #[test]
    fn job_output_shapes() {
        assert_eq!(job_output_text(&json!(["a", "b"])).as_deref(), Some("ab"));
        assert_eq!(
            job_output_text(&json!([{"choices": [{"tokens": ["Hel", "lo"]}]}])).as_deref(),
            Some("Hello")
        );
        assert_eq!(
            job_output_text(&json!([{"choices": [{"text": ["x", "y"]}]}])).as_deref(),
            Some("xy")
        );
        assert_eq!(
            job_output_text(&json!({"choices": [{"message": {"content": "hi"}}]})).as_deref(),
            Some("hi")
        );
        assert_eq!(
            job_output_text(&json!({"text": ["a", "b"]})).as_deref(),
            Some("ab")
        );
        assert_eq!(job_output_text(&json!({"text": 42})), None);
        assert_eq!(job_output_text(&json!([])), None);
    }

    #[test]
    fn json_block_from_fenced_prose() {
        let text = "Sure!\n```json\n{\"title\": \"Dune\"}\n```\nEnjoy.";
        assert_eq!(extract_json_block(text), "{\"title\": \"Dune\"}");
        assert_eq!(extract_json_block("list: [1, {\"a\": 2}] done"), "[1, {\"a\": 2}]");
        assert_eq!(extract_json_block("no json here"), "no json here");
    }
}
