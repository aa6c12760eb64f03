//! Character-level provenance of prompt text across a handler chain.
//!
//! A field's text is kept as ordered segments whose concatenation always
//! equals the field's value. Each before/after change is reduced to one
//! replaced region (longest common prefix and suffix) and the inserted text
//! is attributed to the acting handler.

use serde::{Deserialize, Serialize};

use concord_framework::ContentPart;

/// Which request field a segment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptField {
    /// The user prompt.
    Prompt,
    /// The system prompt.
    SystemPrompt,
    /// Extra content parts.
    ExtraUserContentParts,
}

impl PromptField {
    /// The request field name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prompt => "prompt",
            Self::SystemPrompt => "system_prompt",
            Self::ExtraUserContentParts => "extra_user_content_parts",
        }
    }
}

/// How a segment's text entered the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    /// Inserted at the start.
    Prepend,
    /// Added at the end (including into an empty field).
    Append,
    /// Inserted in the middle.
    Insert,
    /// Replaced existing text.
    Replace,
    /// Removed text without inserting any. Never carried by a segment.
    Delete,
    /// The persona's own text.
    Persona,
}

/// Outcome of one handler invocation in a dry run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerStatus {
    /// Ran to completion.
    Executed,
    /// Attempted a blocked side effect.
    Blocked,
    /// Failed for an unrelated reason.
    Errored,
    /// Not run.
    Skipped,
}

/// Who produced a segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribution {
    /// Plugin module id, or `persona`.
    pub plugin: String,
    /// Handler full name, or the persona name.
    pub handler: String,
    /// Handler priority.
    pub priority: i64,
    /// Field the text lives in.
    pub field: PromptField,
    /// How the text got there.
    pub mutation: MutationKind,
    /// Outcome of the producing invocation.
    pub status: HandlerStatus,
}

/// One run of text with its producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptSegment {
    /// The text.
    pub text: String,
    /// Producer; `None` for base text or text that cannot be attributed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribution: Option<Attribution>,
    /// Every producer, when merged from several contributions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Attribution>,
}

impl PromptSegment {
    pub(crate) fn new(text: impl Into<String>, attribution: Option<Attribution>) -> Self {
        Self {
            text: text.into(),
            attribution,
            sources: Vec::new(),
        }
    }
}

/// The handler currently acting on the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    /// Plugin module id.
    pub plugin: String,
    /// Handler full name.
    pub handler: String,
    /// Handler priority.
    pub priority: i64,
    /// Outcome of the invocation.
    pub status: HandlerStatus,
}

impl Actor {
    fn attribute(&self, field: PromptField, mutation: MutationKind) -> Attribution {
        Attribution {
            plugin: self.plugin.clone(),
            handler: self.handler.clone(),
            priority: self.priority,
            field,
            mutation,
            status: self.status,
        }
    }
}

/// Byte length of the longest common prefix, on a char boundary.
fn common_prefix(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .find(|((_, ca), cb)| ca != cb)
        .map(|((i, _), _)| i)
        .unwrap_or_else(|| a.len().min(b.len()))
}

/// Byte length of the longest common suffix not exceeding `limit`.
fn common_suffix(a: &str, b: &str, limit: usize) -> usize {
    let mut len = 0;
    for (ca, cb) in a.chars().rev().zip(b.chars().rev()) {
        if ca != cb || len + ca.len_utf8() > limit {
            break;
        }
        len += ca.len_utf8();
    }
    len
}

/// Tracks the segments of one text field.
#[derive(Debug, Clone)]
pub struct SegmentTracker {
    field: PromptField,
    segments: Vec<PromptSegment>,
    persona: Option<(String, String)>,
    resets: usize,
}

impl SegmentTracker {
    /// Starts from `initial` as unattributed base text.
    pub fn new(field: PromptField, initial: &str) -> Self {
        let segments = if initial.is_empty() {
            Vec::new()
        } else {
            vec![PromptSegment::new(initial, None)]
        };
        Self {
            field,
            segments,
            persona: None,
            resets: 0,
        }
    }

    /// Starts from the persona text, attributed to the persona.
    pub fn with_persona_applied(field: PromptField, name: &str, text: &str) -> Self {
        let mut tracker = Self::new(field, "").with_persona(name, text);
        if !text.is_empty() {
            let attribution = tracker.persona_attribution();
            tracker.segments.push(PromptSegment::new(text, attribution));
        }
        tracker
    }

    /// Registers the literal persona text so insertions containing it are split.
    pub fn with_persona(mut self, name: &str, text: &str) -> Self {
        if !text.is_empty() {
            self.persona = Some((name.to_string(), text.to_string()));
        }
        self
    }

    /// The current reconstructed text.
    pub fn text(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }

    /// The current segments.
    pub fn segments(&self) -> &[PromptSegment] {
        &self.segments
    }

    /// How many times the tracker fell back to one unattributed segment.
    pub fn resets(&self) -> usize {
        self.resets
    }

    fn persona_attribution(&self) -> Option<Attribution> {
        self.persona.as_ref().map(|(name, _)| Attribution {
            plugin: "persona".to_string(),
            handler: name.clone(),
            priority: 0,
            field: self.field,
            mutation: MutationKind::Persona,
            status: HandlerStatus::Executed,
        })
    }

    /// Checks the reconstruction against `actual`, resetting on divergence.
    ///
    /// Returns `false` when a reset happened.
    pub fn verify(&mut self, actual: &str) -> bool {
        if self.text() == actual {
            return true;
        }
        self.segments = if actual.is_empty() {
            Vec::new()
        } else {
            vec![PromptSegment::new(actual, None)]
        };
        self.resets += 1;
        false
    }

    /// Records a change made by `actor` and returns how it was classified.
    ///
    /// `collaborator` is the producer known to wrap persona text outside
    /// dispatch; it receives the text around a verbatim persona insertion.
    pub fn record(
        &mut self,
        before: &str,
        after: &str,
        actor: &Actor,
        collaborator: Option<&Actor>,
    ) -> Option<MutationKind> {
        if before == after {
            return None;
        }
        self.verify(before);

        let prefix = common_prefix(before, after);
        let limit = before.len().min(after.len()) - prefix;
        let suffix = common_suffix(before, after, limit);
        let removed_end = before.len() - suffix;
        let inserted = &after[prefix..after.len() - suffix];
        let pure_insert = removed_end == prefix;

        let kind = if inserted.is_empty() {
            MutationKind::Delete
        } else if !pure_insert {
            MutationKind::Replace
        } else if suffix == 0 {
            MutationKind::Append
        } else if prefix == 0 {
            MutationKind::Prepend
        } else {
            MutationKind::Insert
        };

        let new_segments = if kind == MutationKind::Delete {
            Vec::new()
        } else {
            self.attribute_insertion(inserted, kind, pure_insert, actor, collaborator)
        };

        let start = self.split_at(prefix);
        let end = self.split_at(removed_end);
        self.segments.splice(start..end, new_segments);
        self.merge_adjacent();
        self.verify(after);
        Some(kind)
    }

    fn attribute_insertion(
        &self,
        inserted: &str,
        kind: MutationKind,
        pure_insert: bool,
        actor: &Actor,
        collaborator: Option<&Actor>,
    ) -> Vec<PromptSegment> {
        let own = || Some(actor.attribute(self.field, kind));
        let Some((_, persona_text)) = &self.persona else {
            return vec![PromptSegment::new(inserted, own())];
        };
        let Some(at) = inserted.find(persona_text.as_str()).filter(|_| pure_insert) else {
            return vec![PromptSegment::new(inserted, own())];
        };

        let around = collaborator.unwrap_or(actor);
        let (pre, rest) = inserted.split_at(at);
        let post = &rest[persona_text.len()..];
        let mut out = Vec::with_capacity(3);
        if !pre.is_empty() {
            out.push(PromptSegment::new(pre, Some(around.attribute(self.field, kind))));
        }
        out.push(PromptSegment::new(persona_text.as_str(), self.persona_attribution()));
        if !post.is_empty() {
            out.push(PromptSegment::new(post, Some(around.attribute(self.field, kind))));
        }
        out
    }

    /// Splits so a segment starts at byte `offset`; returns its index.
    fn split_at(&mut self, offset: usize) -> usize {
        let mut start = 0;
        for index in 0..self.segments.len() {
            let len = self.segments[index].text.len();
            if offset == start {
                return index;
            }
            if offset < start + len {
                let tail = self.segments[index].text.split_off(offset - start);
                let mut second = self.segments[index].clone();
                second.text = tail;
                self.segments.insert(index + 1, second);
                return index + 1;
            }
            start += len;
        }
        self.segments.len()
    }

    fn merge_adjacent(&mut self) {
        let mut merged: Vec<PromptSegment> = Vec::with_capacity(self.segments.len());
        for segment in self.segments.drain(..) {
            if segment.text.is_empty() {
                continue;
            }
            match merged.last_mut() {
                Some(last)
                    if last.attribution == segment.attribution
                        && last.sources.is_empty()
                        && segment.sources.is_empty() =>
                {
                    last.text.push_str(&segment.text);
                }
                _ => merged.push(segment),
            }
        }
        self.segments = merged;
    }

    /// Final pass: whitespace-only segments lose their attribution, then
    /// consecutive segments of the same plugin merge, keeping every
    /// contributing handler and mutation in `sources`.
    pub fn finalize(mut self) -> Vec<PromptSegment> {
        for segment in &mut self.segments {
            if segment.text.trim().is_empty() {
                segment.attribution = None;
                segment.sources.clear();
            }
        }

        let mut out: Vec<PromptSegment> = Vec::with_capacity(self.segments.len());
        for segment in self.segments {
            let Some(last) = out.last_mut() else {
                out.push(segment);
                continue;
            };
            let same_plugin = match (&last.attribution, &segment.attribution) {
                (Some(a), Some(b)) => a.plugin == b.plugin,
                (None, None) => true,
                _ => false,
            };
            if !same_plugin {
                out.push(segment);
                continue;
            }
            last.text.push_str(&segment.text);
            if let (Some(first), Some(next)) = (&last.attribution, &segment.attribution) {
                if last.sources.is_empty() {
                    last.sources.push(first.clone());
                }
                let incoming = if segment.sources.is_empty() {
                    vec![next.clone()]
                } else {
                    segment.sources
                };
                for source in incoming {
                    if !last.sources.contains(&source) {
                        last.sources.push(source);
                    }
                }
                if last.sources.len() == 1 {
                    last.sources.clear();
                }
            }
        }
        out
    }
}

/// One extra content part with its producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributedPart {
    /// The part.
    pub part: ContentPart,
    /// Producer, when attributable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribution: Option<Attribution>,
}

/// Tracks extra content parts. Only pure appends are attributed.
#[derive(Debug, Clone, Default)]
pub struct PartsTracker {
    parts: Vec<AttributedPart>,
}

impl PartsTracker {
    /// Starts from `initial` as unattributed parts.
    pub fn new(initial: &[ContentPart]) -> Self {
        Self {
            parts: Self::unattributed(initial),
        }
    }

    fn unattributed(parts: &[ContentPart]) -> Vec<AttributedPart> {
        parts
            .iter()
            .map(|part| AttributedPart {
                part: part.clone(),
                attribution: None,
            })
            .collect()
    }

    /// Records a change made by `actor`.
    ///
    /// Returns `false` when the change is not a pure append and the whole
    /// list was reverted to unattributed parts.
    pub fn record(&mut self, before: &[ContentPart], after: &[ContentPart], actor: &Actor) -> bool {
        if before == after {
            return true;
        }
        let tracked_matches = self.parts.len() == before.len()
            && self.parts.iter().zip(before).all(|(t, b)| &t.part == b);
        if !tracked_matches {
            self.parts = Self::unattributed(before);
        }
        if after.len() > before.len() && after.starts_with(before) {
            let attribution = actor.attribute(PromptField::ExtraUserContentParts, MutationKind::Append);
            self.parts.extend(after[before.len()..].iter().map(|part| AttributedPart {
                part: part.clone(),
                attribution: Some(attribution.clone()),
            }));
            return true;
        }
        self.parts = Self::unattributed(after);
        false
    }

    /// The tracked parts.
    pub fn into_parts(self) -> Vec<AttributedPart> {
        self.parts
    }
}
