//! Fixed input contexts and the question set appended to them.

use anyhow::{Context, Result};
use rand::Rng;
use rand::seq::SliceRandom;

use crate::config::TemplateConfig;

/// Label of the short probe context that is sent without a question.
pub const PROBE_LABEL: &str = "13t";

/// Built-in labels in ladder order.
pub const BUILTIN_LABELS: [&str; 10] = [
    "13t", "1k", "2k", "4k", "8k", "16k", "32k", "64k", "92k", "128k",
];

// (label, base paragraph, repetitions)
const BUILTIN_TEMPLATES: [(&str, &str, usize); 10] = [
    ("13t", include_str!("../templates/13t.txt"), 1),
    ("1k", include_str!("../templates/1k.txt"), 2),
    ("2k", include_str!("../templates/2k.txt"), 3),
    ("4k", include_str!("../templates/4k.txt"), 4),
    ("8k", include_str!("../templates/8k.txt"), 6),
    ("16k", include_str!("../templates/16k.txt"), 8),
    ("32k", include_str!("../templates/32k.txt"), 12),
    ("64k", include_str!("../templates/64k.txt"), 16),
    ("92k", include_str!("../templates/92k.txt"), 20),
    ("128k", include_str!("../templates/128k.txt"), 24),
];

const BUILTIN_QUESTIONS: &str = include_str!("../templates/questions.txt");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextTemplate {
    pub label: String,
    pub text: String,
    /// Probe templates are sent verbatim
    pub probe: bool,
}

impl ContextTemplate {
    pub fn new(label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            text: text.into(),
            probe: false,
        }
    }

    pub fn probe(label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            probe: true,
            ..Self::new(label, text)
        }
    }

    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }
}

/// A fully composed prompt, ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub context_size: String,
    pub text: String,
    pub question: Option<String>,
    pub context_char_count: usize,
}

impl Prompt {
    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }
}

/// The set of templates and questions a benchmark run draws from.
#[derive(Debug, Clone)]
pub struct ContextCatalog {
    templates: Vec<ContextTemplate>,
    questions: Vec<String>,
}

impl ContextCatalog {
    pub fn new(templates: Vec<ContextTemplate>, questions: Vec<String>) -> Result<Self> {
        if questions.is_empty() {
            anyhow::bail!("question set must not be empty");
        }
        Ok(Self {
            templates,
            questions,
        })
    }

    pub fn builtin() -> Self {
        let templates = BUILTIN_TEMPLATES
            .iter()
            .map(|(label, paragraph, repeat)| ContextTemplate {
                label: label.to_string(),
                text: paragraph.repeat(*repeat),
                probe: *label == PROBE_LABEL,
            })
            .collect();

        let questions = BUILTIN_QUESTIONS
            .lines()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_string)
            .collect();

        Self {
            templates,
            questions,
        }
    }

    /// Reads extra templates from disk. A label that already exists is
    /// replaced in place; new labels are appended.
    pub fn with_files(mut self, extra: &[TemplateConfig]) -> Result<Self> {
        for entry in extra {
            let text = std::fs::read_to_string(&entry.path).with_context(|| {
                format!(
                    "failed to read template '{}' from {}",
                    entry.label,
                    entry.path.display()
                )
            })?;
            let template = ContextTemplate {
                label: entry.label.clone(),
                text,
                probe: entry.probe,
            };
            self.insert(template);
        }
        Ok(self)
    }

    pub fn insert(&mut self, template: ContextTemplate) {
        match self.templates.iter_mut().find(|t| t.label == template.label) {
            Some(existing) => *existing = template,
            None => self.templates.push(template),
        }
    }

    pub fn get(&self, label: &str) -> Option<&ContextTemplate> {
        self.templates.iter().find(|t| t.label == label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.templates.iter().map(|t| t.label.as_str())
    }

    pub fn questions(&self) -> &[String] {
        &self.questions
    }

    /// Resolves labels to templates, rejecting any label the catalog lacks.
    pub fn resolve(&self, labels: &[String]) -> Result<Vec<ContextTemplate>> {
        labels
            .iter()
            .map(|label| {
                self.get(label).cloned().ok_or_else(|| {
                    anyhow::anyhow!(
                        "invalid context size '{}'. Available: {}",
                        label,
                        self.labels().collect::<Vec<_>>().join(", ")
                    )
                })
            })
            .collect()
    }

    /// Builds the prompt for one request, drawing the question from `rng`.
    pub fn compose<R: Rng + ?Sized>(&self, template: &ContextTemplate, rng: &mut R) -> Prompt {
        let question = if template.probe {
            None
        } else {
            self.questions.choose(rng).cloned()
        };

        let text = match &question {
            Some(question) => format!("{}\n\n{}", template.text, question),
            None => template.text.clone(),
        };

        Prompt {
            context_size: template.label.clone(),
            text,
            question,
            context_char_count: template.char_count(),
        }
    }
}
