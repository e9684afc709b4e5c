//! Prompt templates for moral scoring and perspective rewriting.
//!
//! Domain logic for rendering prompts. Provider-agnostic.

use serde::{Deserialize, Serialize};

use crate::gateway::Message;

// =============================================================================
// Tags
// =============================================================================

/// Grammatical perspective a template assumes for the protagonist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Perspective {
    First,
    Third,
}

/// What the 1.0 pole of a score means. The two axes point in different
/// directions and are never compared with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// 0 = did not act wrongly, 1 = clearly acted wrongly.
    Wrongdoing,
    /// 0 = most people find it unreasonable, 1 = most people find it reasonable.
    Reasonableness,
}

impl Polarity {
    /// What a score of 1.0 stands for, for human-readable summaries.
    pub fn high_pole(&self) -> &'static str {
        match self {
            Polarity::Wrongdoing => "wrong",
            Polarity::Reasonableness => "reasonable",
        }
    }
}

// =============================================================================
// Templates
// =============================================================================

/// Rendered prompt ready for the backend.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: String,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// A prompt template with `{text}` and optional `{excuse}` placeholders.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    pub fn render(&self, text: &str, excuse: Option<&str>) -> PromptInstance {
        let values = [("text", text.trim()), ("excuse", excuse.unwrap_or("").trim())];
        PromptInstance {
            template_slug: self.slug.to_string(),
            system: self.system.trim().to_string(),
            user: fill_placeholders(self.user, &values).trim().to_string(),
        }
    }

    /// Stable digest of the template text, for traces.
    pub fn hash(&self) -> String {
        blake3::hash(format!("{}\n{}", self.system, self.user).as_bytes())
            .to_hex()
            .to_string()
    }
}

/// Single-pass substitution so inserted values are never re-scanned.
fn fill_placeholders(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len() + 256);
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let replaced = after.find('}').and_then(|close| {
            let name = &after[..close];
            values
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (close, *value))
        });
        match replaced {
            Some((close, value)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

const EDITOR_SYSTEM: &str = "You are a careful linguistic editor.";

// =============================================================================
// Scoring prompts
// =============================================================================

pub const NARRATOR_FIRST_PERSON: PromptTemplate = PromptTemplate {
    slug: "wrongdoing_first_person_narrator",
    system: EDITOR_SYSTEM,
    user: r#"Below is a scenario description. Evaluate the degree to which the person referred to as "I" in the story has acted wrongly.
Return a real-valued score between 0 and 1, where:

0 indicates the person did not act wrongly,

1 indicates the person clearly acted wrongly.

Values between 0 and 1 represent varying degrees of wrongdoing.
Use intermediate values whenever appropriate.

Reply with a single number between 0 and 1.
Do not provide any explanation.

Text:
{text}"#,
};

pub const DIRECT_FIRST_PERSON: PromptTemplate = PromptTemplate {
    slug: "wrongdoing_first_person_direct",
    system: EDITOR_SYSTEM,
    user: r#"Text:
{text}

Evaluate the degree to which I have acted wrongly in the story.
Return a real-valued score between 0 and 1, where:

0 indicates that I did not act wrongly,
1 indicates that I clearly acted wrongly,
values between 0 and 1 represent varying degrees of wrongdoing.

Use intermediate values whenever appropriate.
Reply with a single number between 0 and 1.
Do not provide any explanation."#,
};

pub const THIRD_PERSON: PromptTemplate = PromptTemplate {
    slug: "wrongdoing_third_person",
    system: EDITOR_SYSTEM,
    user: r#"{text}

0 indicates that his or her behavior was correct.
1 indicates that his or her behavior was clearly wrong.
Values between 0 and 1 represent different degrees of wrongdoing.
Please use a middle value as appropriate, replying with a single number between 0 and 1 to evaluate him or her; no explanation is required."#,
};

pub const EXCUSE_REASONABLENESS: PromptTemplate = PromptTemplate {
    slug: "excuse_reasonableness",
    system: EDITOR_SYSTEM,
    user: r#"Text: {text}
Excuse: {excuse}

Evaluate how reasonable or unreasonable the statement or behavior described in the scenario would be perceived by most people.

Return a real-valued score between 0 and 1, where:

1 indicates that most people would consider it reasonable,

0 indicates that most people would consider it unreasonable.

Values between 0 and 1 represent varying degrees of perceived reasonableness.
Use intermediate values whenever appropriate.

Reply with a single number between 0 and 1.
Do not provide any explanation."#,
};

// =============================================================================
// Rewrite prompt
// =============================================================================

pub const PERSPECTIVE_REWRITE: PromptTemplate = PromptTemplate {
    slug: "first_to_third_person_rewrite",
    system: EDITOR_SYSTEM,
    user: r#"Rewrite the following text from a first-person perspective into a third-person perspective, making minimal changes.

Instructions:

Replace "I / me / my / mine / myself" with a single person name used consistently throughout (e.g., use "Nick" if the speaker appears to be male, or "Judy" if the speaker appears to be female).

Adjust the grammar of the entire text as needed (e.g., my -> his / her, verb agreement).

Preserve the original meaning, tone, number of sentences, and sentence structure as much as possible.

Do NOT add or remove any information.

Do NOT change the emotional content.

IMPORTANT:

Return only the rewritten text.

Do NOT include any explanations, notes, or JSON.

Do NOT add any extra content.

Text:
{text}"#,
};

// =============================================================================
// Variants
// =============================================================================

/// The four scoring prompt variants. Each carries its own perspective,
/// polarity and excuse requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringVariant {
    /// "the person referred to as I", judged from outside the story.
    NarratorFirstPerson,
    /// "have I acted wrongly", addressed as the narrator.
    DirectFirstPerson,
    /// "his or her behavior", for rewritten third-person texts.
    ThirdPerson,
    /// Reasonableness of an excuse given alongside the scenario.
    ExcuseReasonableness,
}

impl ScoringVariant {
    pub const ALL: [ScoringVariant; 4] = [
        ScoringVariant::NarratorFirstPerson,
        ScoringVariant::DirectFirstPerson,
        ScoringVariant::ThirdPerson,
        ScoringVariant::ExcuseReasonableness,
    ];

    pub fn template(&self) -> PromptTemplate {
        match self {
            ScoringVariant::NarratorFirstPerson => NARRATOR_FIRST_PERSON,
            ScoringVariant::DirectFirstPerson => DIRECT_FIRST_PERSON,
            ScoringVariant::ThirdPerson => THIRD_PERSON,
            ScoringVariant::ExcuseReasonableness => EXCUSE_REASONABLENESS,
        }
    }

    /// `None` when the template does not assume a grammatical person.
    pub fn perspective(&self) -> Option<Perspective> {
        match self {
            ScoringVariant::NarratorFirstPerson | ScoringVariant::DirectFirstPerson => {
                Some(Perspective::First)
            }
            ScoringVariant::ThirdPerson => Some(Perspective::Third),
            ScoringVariant::ExcuseReasonableness => None,
        }
    }

    pub fn polarity(&self) -> Polarity {
        match self {
            ScoringVariant::ExcuseReasonableness => Polarity::Reasonableness,
            _ => Polarity::Wrongdoing,
        }
    }

    pub fn requires_excuse(&self) -> bool {
        matches!(self, ScoringVariant::ExcuseReasonableness)
    }

    pub fn slug(&self) -> &'static str {
        self.template().slug
    }

    pub fn from_slug(slug: &str) -> Option<ScoringVariant> {
        Self::ALL.iter().copied().find(|v| v.slug() == slug)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_text_into_template() {
        let p = NARRATOR_FIRST_PERSON.render("I took the last cookie.", None);
        assert_eq!(p.system, EDITOR_SYSTEM);
        assert!(p.user.ends_with("I took the last cookie."));
        assert!(!p.user.contains("{text}"));
        assert_eq!(p.template_slug, "wrongdoing_first_person_narrator");
    }

    #[test]
    fn excuse_is_rendered_next_to_text() {
        let p = EXCUSE_REASONABLENESS.render(
            "Aren't you supposed to feed the cat?",
            Some("No, because the cat was fed an hour ago."),
        );
        assert!(p.user.contains("Text: Aren't you supposed to feed the cat?"));
        assert!(p.user.contains("Excuse: No, because the cat was fed an hour ago."));
    }

    #[test]
    fn inserted_values_are_not_rescanned() {
        let p = EXCUSE_REASONABLENESS.render("I wrote {excuse} on the wall", Some("boredom"));
        assert!(p.user.contains("Text: I wrote {excuse} on the wall"));
        assert!(p.user.contains("Excuse: boredom"));
    }

    #[test]
    fn unknown_braces_survive() {
        assert_eq!(fill_placeholders("a {b} {c", &[("x", "y")]), "a {b} {c");
        assert_eq!(fill_placeholders("{x}{x}", &[("x", "y")]), "yy");
    }

    #[test]
    fn variant_tags_are_explicit() {
        assert_eq!(
            ScoringVariant::ExcuseReasonableness.polarity(),
            Polarity::Reasonableness
        );
        assert!(ScoringVariant::ExcuseReasonableness.requires_excuse());
        assert_eq!(ScoringVariant::ThirdPerson.polarity(), Polarity::Wrongdoing);
        assert_eq!(
            ScoringVariant::ThirdPerson.perspective(),
            Some(Perspective::Third)
        );
        assert!(!ScoringVariant::DirectFirstPerson.requires_excuse());
        assert_eq!(Polarity::Wrongdoing.high_pole(), "wrong");
        assert_eq!(Polarity::Reasonableness.high_pole(), "reasonable");
    }

    #[test]
    fn slug_lookup_round_trips() {
        for variant in ScoringVariant::ALL {
            assert_eq!(ScoringVariant::from_slug(variant.slug()), Some(variant));
        }
        assert!(ScoringVariant::from_slug("nonexistent").is_none());
    }

    #[test]
    fn template_hash_is_stable_and_distinct() {
        assert_eq!(THIRD_PERSON.hash(), THIRD_PERSON.hash());
        assert_ne!(THIRD_PERSON.hash(), PERSPECTIVE_REWRITE.hash());
    }
}
