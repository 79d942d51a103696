//! Field schemas and the selection store that accumulates wizard choices.

use tracing::{debug, trace};

use crate::config::LimitsConfig;
use crate::error::SelectionError;

/// How a bounded text field measures its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextUnit {
    Words,
    Characters,
}

impl TextUnit {
    pub fn measure(self, text: &str) -> usize {
        match self {
            TextUnit::Words => count_words(text),
            TextUnit::Characters => text.chars().count(),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TextUnit::Words => "words",
            TextUnit::Characters => "characters",
        }
    }
}

/// Declared kind of a field, consulted by every store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// One value, overwritten on update.
    Singleton,
    /// A set of values, toggled on update.
    MultiSet { max_selections: Option<usize> },
    /// Free text that never exceeds `max` units.
    BoundedText { max: usize, unit: TextUnit },
}

/// A choice offered for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldOption {
    pub value: &'static str,
    /// Secondary text shown next to the option.
    pub hint: Option<&'static str>,
}

const fn opt(value: &'static str) -> FieldOption {
    FieldOption { value, hint: None }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub label: &'static str,
    pub kind: FieldKind,
    /// Allowed values. Empty means any value is accepted.
    pub options: &'static [FieldOption],
    /// Value restored by `reset`.
    pub default: &'static str,
    /// Whether the field contributes to the derived character description.
    pub describes_character: bool,
}

impl FieldSpec {
    fn accepts(&self, value: &str) -> bool {
        self.options.is_empty() || self.options.iter().any(|o| o.value == value)
    }

    fn default_value(&self) -> FieldValue {
        match self.kind {
            FieldKind::Singleton => FieldValue::Single(self.default.to_string()),
            FieldKind::MultiSet { .. } => FieldValue::Many(Vec::new()),
            FieldKind::BoundedText { .. } => FieldValue::Text(self.default.to_string()),
        }
    }

    fn empty_value(&self) -> FieldValue {
        match self.kind {
            FieldKind::Singleton => FieldValue::Single(String::new()),
            FieldKind::MultiSet { .. } => FieldValue::Many(Vec::new()),
            FieldKind::BoundedText { .. } => FieldValue::Text(String::new()),
        }
    }
}

/// Fixed field set of one wizard type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub fields: Vec<FieldSpec>,
    /// Total word budget across every field, if any.
    pub word_budget: Option<usize>,
}

impl Schema {
    pub fn field(&self, name: &str) -> Result<(usize, &FieldSpec), SelectionError> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == name)
            .ok_or_else(|| SelectionError::UnknownField(name.to_string()))
    }
}

/// Stored value of one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Single(String),
    Many(Vec<String>),
    Text(String),
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Single(s) | FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::Many(values) => values.is_empty(),
        }
    }

    fn texts(&self) -> Vec<&str> {
        match self {
            FieldValue::Single(s) | FieldValue::Text(s) => vec![s.as_str()],
            FieldValue::Many(values) => values.iter().map(String::as_str).collect(),
        }
    }

    /// Single or text content; empty for sets.
    pub fn as_text(&self) -> &str {
        match self {
            FieldValue::Single(s) | FieldValue::Text(s) => s,
            FieldValue::Many(_) => "",
        }
    }

    pub fn as_set(&self) -> &[String] {
        match self {
            FieldValue::Many(values) => values,
            _ => &[],
        }
    }
}

/// Why an update was refused. The store is left unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The set already holds its maximum number of values.
    SelectionLimit { max: usize },
    /// The text would exceed the field's own bound.
    TooLong { max: usize, unit: TextUnit },
    /// The text would push the store past its total word budget.
    OverBudget { budget: usize },
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::SelectionLimit { max } => write!(f, "at most {} selections", max),
            Rejection::TooLong { max, unit } => write!(f, "at most {} {}", max, unit.label()),
            Rejection::OverBudget { budget } => write!(f, "total limit of {} words", budget),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    Rejected(Rejection),
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied)
    }
}

/// Count whitespace separated tokens.
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Split text into prompt tokens. Commas separate tokens like whitespace does.
pub fn prompt_tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
}

/// Mutable record of one wizard's choices over a fixed schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionStore {
    schema: Schema,
    values: Vec<FieldValue>,
    /// Incremented on every successful mutation.
    version: u64,
}

impl SelectionStore {
    pub fn new(schema: Schema) -> Self {
        let values = schema.fields.iter().map(FieldSpec::default_value).collect();
        Self {
            schema,
            values,
            version: 0,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, field: &str) -> Result<&FieldValue, SelectionError> {
        let (index, _) = self.schema.field(field)?;
        Ok(&self.values[index])
    }

    /// Iterate over `(spec, value)` pairs in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (&FieldSpec, &FieldValue)> {
        self.schema.fields.iter().zip(self.values.iter())
    }

    /// Apply a field-level update according to the field's kind.
    ///
    /// Singletons are replaced, sets toggle `value`, and bounded text is
    /// replaced only while it fits its bound and does not grow past the total
    /// word budget.
    pub fn update(&mut self, field: &str, value: &str) -> Result<UpdateOutcome, SelectionError> {
        let (index, spec) = self.schema.field(field)?;
        let spec = spec.clone();

        let candidate = match (&spec.kind, &self.values[index]) {
            (FieldKind::Singleton, _) => {
                let value = value.trim();
                if !value.is_empty() && !spec.accepts(value) {
                    return Err(unknown_option(&spec, value));
                }
                FieldValue::Single(value.to_string())
            }
            (FieldKind::MultiSet { max_selections }, current) => {
                if !spec.accepts(value) {
                    return Err(unknown_option(&spec, value));
                }
                let mut set = current.as_set().to_vec();
                if let Some(pos) = set.iter().position(|v| v == value) {
                    set.remove(pos);
                } else {
                    if let Some(max) = *max_selections
                        && set.len() >= max
                    {
                        return Ok(self.reject(field, Rejection::SelectionLimit { max }));
                    }
                    set.push(value.to_string());
                }
                FieldValue::Many(set)
            }
            (FieldKind::BoundedText { max, unit }, current) => {
                if unit.measure(value) > *max {
                    return Ok(self.reject(
                        field,
                        Rejection::TooLong {
                            max: *max,
                            unit: *unit,
                        },
                    ));
                }
                if let Some(budget) = self.schema.word_budget {
                    let others: usize = self
                        .values
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| *i != index)
                        .map(|(_, v)| v.texts().iter().map(|t| count_words(t)).sum::<usize>())
                        .sum();
                    // Option picks may already have spent the budget; edits that
                    // do not add words still go through
                    let words = count_words(value);
                    let current_words: usize =
                        current.texts().iter().map(|t| count_words(t)).sum();
                    if others + words > budget && words > current_words {
                        return Ok(self.reject(field, Rejection::OverBudget { budget }));
                    }
                }
                FieldValue::Text(value.to_string())
            }
        };

        if self.values[index] != candidate {
            self.values[index] = candidate;
            self.version += 1;
        }
        trace!(field, version = self.version, "selection_updated");
        Ok(UpdateOutcome::Applied)
    }

    fn reject(&self, field: &str, rejection: Rejection) -> UpdateOutcome {
        debug!(field, %rejection, "selection_rejected");
        UpdateOutcome::Rejected(rejection)
    }

    /// Clear a field to its empty value.
    pub fn remove(&mut self, field: &str) -> Result<(), SelectionError> {
        let (index, spec) = self.schema.field(field)?;
        let empty = spec.empty_value();
        if self.values[index] != empty {
            self.values[index] = empty;
            self.version += 1;
        }
        Ok(())
    }

    /// Remove one value: a member of a set, or a singleton/text holding exactly `value`.
    pub fn remove_value(&mut self, field: &str, value: &str) -> Result<(), SelectionError> {
        let (index, spec) = self.schema.field(field)?;
        let changed = match &mut self.values[index] {
            FieldValue::Many(set) => {
                let before = set.len();
                set.retain(|v| v != value);
                set.len() != before
            }
            FieldValue::Single(s) | FieldValue::Text(s) if s == value => {
                s.clear();
                true
            }
            _ => false,
        };
        if changed {
            self.version += 1;
            debug!(field = spec.name, value, "selection_value_removed");
        }
        Ok(())
    }

    /// Restore every field to its declared default.
    pub fn reset(&mut self) {
        self.values = self
            .schema
            .fields
            .iter()
            .map(FieldSpec::default_value)
            .collect();
        self.version += 1;
    }

    /// Remaining units for a bounded text field (`max - current length`).
    pub fn remaining_capacity(&self, field: &str) -> Result<usize, SelectionError> {
        let (index, spec) = self.schema.field(field)?;
        match spec.kind {
            FieldKind::BoundedText { max, unit } => {
                Ok(max.saturating_sub(unit.measure(self.values[index].as_text())))
            }
            FieldKind::MultiSet {
                max_selections: Some(max),
            } => Ok(max.saturating_sub(self.values[index].as_set().len())),
            _ => Ok(usize::MAX),
        }
    }

    /// Total whitespace separated tokens across all fields.
    pub fn word_count(&self) -> usize {
        self.values
            .iter()
            .flat_map(FieldValue::texts)
            .map(count_words)
            .sum()
    }

    /// Words left in the total budget, or `None` when the schema has no budget.
    pub fn remaining_words(&self) -> Option<usize> {
        self.schema
            .word_budget
            .map(|budget| budget.saturating_sub(self.word_count()))
    }

    /// Serialize every non-empty field into one prompt string.
    ///
    /// Tokens keep field declaration order, sets are flattened in insertion
    /// order, and tokens are joined by single spaces.
    pub fn to_prompt(&self) -> String {
        self.values
            .iter()
            .flat_map(FieldValue::texts)
            .flat_map(prompt_tokens)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Short human readable description of the character-describing fields.
    pub fn describe(&self) -> String {
        self.fields()
            .filter(|(spec, value)| spec.describes_character && !value.is_empty())
            .map(|(spec, value)| match value {
                FieldValue::Text(text) => text.trim().to_string(),
                _ => format!("{}: {}", spec.label, value.texts().join(", ")),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn is_empty(&self, field: &str) -> Result<bool, SelectionError> {
        Ok(self.get(field)?.is_empty())
    }
}

fn unknown_option(spec: &FieldSpec, value: &str) -> SelectionError {
    SelectionError::UnknownOption {
        field: spec.name.to_string(),
        value: value.to_string(),
    }
}

// Image wizard fields.
pub const IMAGE_STYLE: &str = "imageStyle";
pub const HAIR_COLOR: &str = "hairColor";
pub const HAIR_STYLE: &str = "hairStyle";
pub const HEIGHT: &str = "height";
pub const BUILD: &str = "build";
pub const SKIN_TONE: &str = "skinTone";
pub const FACIAL_FEATURES: &str = "facialFeatures";
pub const DESCRIPTION: &str = "description";

// Backstory wizard fields.
pub const NAME: &str = "name";
pub const THEME: &str = "theme";
pub const STORY_LENGTH: &str = "storyLength";

pub static IMAGE_STYLES: &[FieldOption] = &[
    opt("Claymation"),
    opt("Hand-drawn 2D art"),
    opt("Anthropomorphic animals"),
    opt("Pixel art"),
    opt("Cel-shaded"),
    opt("Watercolor"),
    opt("Cartoon"),
    opt("Sci-fi"),
    opt("Realistic"),
    opt("Chibi"),
    opt("Anime"),
];

static HAIR_COLORS: &[FieldOption] = &[
    opt("Brown"),
    opt("Black"),
    opt("Red"),
    opt("White"),
    opt("Grey"),
    opt("Blonde"),
    opt("Platinum"),
    opt("Violet"),
    opt("Blue"),
    opt("Green"),
];

static HAIR_STYLES: &[FieldOption] = &[
    opt("Short and spiky"),
    opt("Long flowing"),
    opt("Ponytail"),
    opt("Bun"),
    opt("Braids"),
    opt("Mohawk"),
    opt("Dreadlocks"),
    opt("Bald"),
    opt("Fringe"),
];

static HEIGHTS: &[FieldOption] = &[
    opt("Very tall"),
    opt("Tall"),
    opt("Average"),
    opt("Short"),
    opt("Very short"),
];

static BUILDS: &[FieldOption] = &[
    opt("Muscular"),
    opt("Slender"),
    opt("Stocky"),
    opt("Athletic"),
    opt("Lean"),
    opt("Curvy"),
    opt("Petite"),
    opt("Heavyset"),
];

static SKIN_TONES: &[FieldOption] = &[
    opt("Fair"),
    opt("Light"),
    opt("Medium"),
    opt("Olive"),
    opt("Tan"),
    opt("Dark"),
    opt("Ebony"),
    opt("Purple"),
    opt("Blue"),
    opt("Green"),
];

static FACIAL_FEATURE_OPTIONS: &[FieldOption] = &[
    opt("Prominent nose"),
    opt("Sharp jawline"),
    opt("High cheekbones"),
    opt("Full lips"),
    opt("Deep-set eyes"),
    opt("Thin eyebrows"),
    opt("Spots"),
];

static THEMES: &[FieldOption] = &[
    opt("Adventure"),
    opt("Romance"),
    opt("Tragedy"),
    opt("Comedy"),
    opt("Mystery"),
    opt("Fantasy"),
    opt("Horror"),
    opt("Heroic"),
    opt("Redemption"),
    opt("Revenge"),
    opt("Epic"),
];

static STORY_LENGTHS: &[FieldOption] = &[
    FieldOption {
        value: "Short size, 100-200 words",
        hint: Some("Brief and concise, ideal for quick backstories"),
    },
    FieldOption {
        value: "Medium size, 300-500 words",
        hint: Some("Detailed enough to provide a good amount of background information"),
    },
    FieldOption {
        value: "Long size, 600-1000 words",
        hint: Some("In-depth and comprehensive, perfect for detailed backstories"),
    },
];

fn trait_field(name: &'static str, label: &'static str, options: &'static [FieldOption]) -> FieldSpec {
    FieldSpec {
        name,
        label,
        kind: FieldKind::Singleton,
        options,
        default: "",
        describes_character: true,
    }
}

/// Fields of the image wizard, in prompt order.
pub fn image_schema(limits: &LimitsConfig) -> Schema {
    Schema {
        fields: vec![
            FieldSpec {
                name: IMAGE_STYLE,
                label: "Image style",
                kind: FieldKind::MultiSet {
                    max_selections: Some(limits.max_image_styles),
                },
                options: IMAGE_STYLES,
                default: "",
                describes_character: false,
            },
            trait_field(HAIR_COLOR, "Hair color", HAIR_COLORS),
            trait_field(HAIR_STYLE, "Hair style", HAIR_STYLES),
            trait_field(HEIGHT, "Height", HEIGHTS),
            trait_field(BUILD, "Build", BUILDS),
            trait_field(SKIN_TONE, "Skin tone", SKIN_TONES),
            trait_field(FACIAL_FEATURES, "Facial features", FACIAL_FEATURE_OPTIONS),
            FieldSpec {
                name: DESCRIPTION,
                label: "Description",
                kind: FieldKind::BoundedText {
                    max: limits.description_words,
                    unit: TextUnit::Words,
                },
                options: &[],
                default: "",
                describes_character: true,
            },
        ],
        word_budget: Some(limits.description_words),
    }
}

/// Fields of the backstory wizard.
pub fn backstory_schema(limits: &LimitsConfig) -> Schema {
    Schema {
        fields: vec![
            FieldSpec {
                name: NAME,
                label: "Name",
                kind: FieldKind::Singleton,
                options: &[],
                default: "",
                describes_character: false,
            },
            FieldSpec {
                name: THEME,
                label: "Theme",
                kind: FieldKind::Singleton,
                options: THEMES,
                default: "Adventure",
                describes_character: false,
            },
            FieldSpec {
                name: STORY_LENGTH,
                label: "Story length",
                kind: FieldKind::Singleton,
                options: STORY_LENGTHS,
                default: "Short size, 100-200 words",
                describes_character: false,
            },
            FieldSpec {
                name: DESCRIPTION,
                label: "Description",
                kind: FieldKind::BoundedText {
                    max: limits.backstory_characters,
                    unit: TextUnit::Characters,
                },
                options: &[],
                default: "",
                describes_character: false,
            },
        ],
        word_budget: None,
    }
}
