//! Content Parts
//!
//! Request contents (history and the new turn) and the collaborator that
//! converts a user's text and files into parts.

use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde::{Deserialize, Serialize};

use crate::messages::EntryRole;
use crate::session::{FileRef, MediaResolution, TranscriptEntry};

/// Part of a request content
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentPart {
    /// Plain text, optionally carrying a reasoning signature to replay
    Text {
        /// The text
        text: String,
        /// Opaque signature returned with the model's reasoning
        #[serde(rename = "thoughtSignature", default, skip_serializing_if = "Option::is_none")]
        thought_signature: Option<String>,
    },
    /// Base64 payload carried in the request
    InlineData {
        /// Payload
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
    /// Reference to a file hosted by the file service
    FileData {
        /// Reference
        #[serde(rename = "fileData")]
        file_data: FileData,
    },
}

impl ContentPart {
    /// A text part
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            thought_signature: None,
        }
    }

    /// A text part carrying a reasoning signature
    pub fn signed(text: impl Into<String>, signature: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            thought_signature: Some(signature.into()),
        }
    }
}

/// Inline payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    /// MIME type
    pub mime_type: String,
    /// Base64 data
    pub data: String,
}

/// Hosted file reference
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    /// MIME type
    pub mime_type: String,
    /// File URI
    pub file_uri: String,
}

/// One turn of request contents
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    /// `user` or `model`
    pub role: String,
    /// Parts in order
    pub parts: Vec<ContentPart>,
}

impl Content {
    /// A user turn
    pub fn user(parts: Vec<ContentPart>) -> Self {
        Self {
            role: "user".to_string(),
            parts,
        }
    }
}

/// Converts a user's text and files into request parts
pub trait TurnPartsBuilder: Send + Sync {
    /// Build the parts for one turn
    fn build_turn_parts(
        &self,
        text: &str,
        files: &[FileRef],
        model_id: &str,
        resolution: MediaResolution,
    ) -> Vec<ContentPart>;
}

/// Media first, then the text
///
/// Hosted files become `fileData` references, inline files are sent as
/// base64. Files with neither are skipped.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultPartsBuilder;

impl TurnPartsBuilder for DefaultPartsBuilder {
    fn build_turn_parts(
        &self,
        text: &str,
        files: &[FileRef],
        _model_id: &str,
        _resolution: MediaResolution,
    ) -> Vec<ContentPart> {
        let mut parts: Vec<ContentPart> = files.iter().filter_map(file_part).collect();
        if !text.trim().is_empty() {
            parts.push(ContentPart::text(text));
        }
        parts
    }
}

fn file_part(file: &FileRef) -> Option<ContentPart> {
    if let Some(uri) = &file.remote_uri {
        return Some(ContentPart::FileData {
            file_data: FileData {
                mime_type: file.mime_type.clone(),
                file_uri: uri.clone(),
            },
        });
    }
    file.inline_data.as_ref().map(|data| ContentPart::InlineData {
        inline_data: InlineData {
            mime_type: file.mime_type.clone(),
            data: data.clone(),
        },
    })
}

/// Encode raw bytes for an inline part
pub fn encode_inline(bytes: &[u8]) -> String {
    BASE64_STANDARD.encode(bytes)
}

/// Request history from a transcript
///
/// Loading entries and error entries are never replayed. Reasoning
/// signatures of model entries go back on their text parts, in order; any
/// left over are sent as signature-only parts.
pub fn build_history(entries: &[TranscriptEntry], parts_builder: &dyn TurnPartsBuilder, model_id: &str) -> Vec<Content> {
    entries
        .iter()
        .filter(|e| !e.is_loading && e.role != EntryRole::Error)
        .filter_map(|e| {
            let parts = match e.role {
                EntryRole::User => {
                    parts_builder.build_turn_parts(&e.content, &e.files, model_id, MediaResolution::Unspecified)
                }
                _ => {
                    let mut parts: Vec<ContentPart> = e.files.iter().filter_map(file_part).collect();
                    let mut signatures = e.thought_signatures.iter();
                    if !e.content.is_empty() {
                        parts.push(match signatures.next() {
                            Some(sig) => ContentPart::signed(e.content.clone(), sig.clone()),
                            None => ContentPart::text(e.content.clone()),
                        });
                    }
                    parts.extend(signatures.map(|sig| ContentPart::signed("", sig.clone())));
                    parts
                }
            };
            if parts.is_empty() {
                None
            } else {
                Some(Content {
                    role: e.role.wire_role().to_string(),
                    parts,
                })
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::GenerationKey;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_media_before_text() {
        let files = vec![
            FileRef::remote("doc.pdf", "application/pdf", "files/abc"),
            FileRef::inline("a.png", "image/png", encode_inline(b"png"), 3),
        ];
        let parts = DefaultPartsBuilder.build_turn_parts("describe", &files, "m", MediaResolution::Unspecified);

        assert_eq!(parts.len(), 3);
        assert!(matches!(parts[0], ContentPart::FileData { .. }));
        assert!(matches!(parts[1], ContentPart::InlineData { .. }));
        assert_eq!(parts[2], ContentPart::text("describe"));
    }

    #[test]
    fn test_blank_text_omitted() {
        let parts = DefaultPartsBuilder.build_turn_parts("  ", &[], "m", MediaResolution::Unspecified);
        assert!(parts.is_empty());
    }

    #[test]
    fn test_part_wire_shape() {
        let part = ContentPart::InlineData {
            inline_data: InlineData {
                mime_type: "image/png".into(),
                data: "AAAA".into(),
            },
        };
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json, serde_json::json!({"inlineData": {"mimeType": "image/png", "data": "AAAA"}}));
    }

    #[test]
    fn test_history_skips_loading_and_errors() {
        let mut done = TranscriptEntry::loading(GenerationKey(1));
        done.is_loading = false;
        done.content = "answer".into();

        let entries = vec![
            TranscriptEntry::user("question", vec![]),
            done,
            TranscriptEntry::error("boom", None),
            TranscriptEntry::user("again", vec![]),
            TranscriptEntry::loading(GenerationKey(2)),
        ];
        let history = build_history(&entries, &DefaultPartsBuilder, "m");

        let roles: Vec<&str> = history.iter().map(|c| c.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "model", "user"]);
    }

    #[test]
    fn test_history_replays_thought_signatures() {
        let mut answer = TranscriptEntry::loading(GenerationKey(1));
        answer.is_loading = false;
        answer.content = "answer".into();
        answer.thought_signatures = vec!["sig-abc".into(), "sig-def".into()];

        let entries = vec![TranscriptEntry::user("q", vec![]), answer];
        let history = build_history(&entries, &DefaultPartsBuilder, "m");

        assert_eq!(
            history[1].parts,
            vec![ContentPart::signed("answer", "sig-abc"), ContentPart::signed("", "sig-def")]
        );
        let json = serde_json::to_value(&history).unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                {"role": "user", "parts": [{"text": "q"}]},
                {"role": "model", "parts": [
                    {"text": "answer", "thoughtSignature": "sig-abc"},
                    {"text": "", "thoughtSignature": "sig-def"}
                ]}
            ])
        );
    }

    #[test]
    fn test_signature_only_model_entry_kept() {
        let mut thinking = TranscriptEntry::loading(GenerationKey(1));
        thinking.is_loading = false;
        thinking.thought_signatures = vec!["sig".into()];

        let history = build_history(&[thinking], &DefaultPartsBuilder, "m");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].parts, vec![ContentPart::signed("", "sig")]);
    }
}
