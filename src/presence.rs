//! Data-presence questions about the sheet on screen.
//!
//! Instructions such as "is there any data here?" or "is column B empty?"
//! are answered on-device, without the text model, whenever a verdict is
//! available. A question about "this column" that names no column gets a
//! request to name one instead.
//!
//! Verdicts come from, in order:
//!
//! 1. [`LocalDetector::estimate_presence`](crate::vision::LocalDetector::estimate_presence),
//!    which can also judge a single column
//! 2. a scene detection labelled `data_present`, `data_sparse` or
//!    `data_empty` (sheet level only)
//!
//! | Verdict | Sheet reply | Column reply |
//! |---------|-------------|--------------|
//! | `HasData` | visible area has data | column has data |
//! | `Sparse` | a little data | column might have a little data |
//! | `Empty` | looks like an empty sheet | column looks empty |

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::vision::SceneDescription;

/// Largest column index understood (Excel's `XFD`).
pub const MAX_COLUMN: u32 = 16_384;

/// Reply to a column question that names no column.
pub const CLARIFY_COLUMN: &str = "Meow, which column? Name it like column 1 or column B.";

const PRESENCE_SIGNALS: [&str; 19] = [
    "any data",
    "is there data",
    "has data",
    "have data",
    "contain data",
    "contains data",
    "no data",
    "empty",
    "blank",
    "是否有数据",
    "有没有数据",
    "有无数据",
    "有没有内容",
    "是否为空",
    "是不是空表",
    "空白",
    "有数据",
    "没数据",
    "无数据",
];

const AMBIGUOUS_COLUMN_SIGNALS: [&str; 12] = [
    "this column",
    "that column",
    "which column",
    "empty column",
    "blank column",
    "column without data",
    "没数据的列",
    "空列",
    "空白列",
    "这个列",
    "该列",
    "哪列",
];

static ENGLISH_COLUMN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:[Cc]olumn|[Cc]ol)\.?\s*(\d{1,5}|[A-Z]{1,3}|[a-z])\b")
        .expect("column regex is valid")
});

static CHINESE_COLUMN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"第\s*(\d{1,5}|[A-Za-z]{1,3}|[一二两三四五六七八九十]{1,3})\s*列|(?:^|[^A-Za-z])([A-Za-z]{1,3})\s*列")
        .expect("column regex is valid")
});

// ============================================================================
// Columns
// ============================================================================

/// A 1-based spreadsheet column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef(u32);

impl ColumnRef {
    /// `None` for zero or anything past [`MAX_COLUMN`].
    pub fn new(index: u32) -> Option<Self> {
        (1..=MAX_COLUMN).contains(&index).then_some(Self(index))
    }

    /// Column from its letters, `A` = 1, `AA` = 27.
    pub fn from_letters(letters: &str) -> Option<Self> {
        if letters.is_empty() || letters.len() > 3 {
            return None;
        }
        let mut index = 0u32;
        for c in letters.chars() {
            if !c.is_ascii_alphabetic() {
                return None;
            }
            index = index * 26 + (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1);
        }
        Self::new(index)
    }

    pub fn index(&self) -> u32 {
        self.0
    }

    pub fn letters(&self) -> String {
        let mut n = self.0;
        let mut out = Vec::new();
        while n > 0 {
            let rem = (n - 1) % 26;
            out.push(char::from(b'A' + rem as u8));
            n = (n - 1) / 26;
        }
        out.iter().rev().collect()
    }

    fn parse_token(token: &str) -> Option<Self> {
        if let Ok(index) = token.parse::<u32>() {
            return Self::new(index);
        }
        if token.chars().all(|c| c.is_ascii_alphabetic()) {
            return Self::from_letters(token);
        }
        parse_chinese_number(token).and_then(Self::new)
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.letters())
    }
}

fn chinese_digit(c: char) -> Option<u32> {
    let digit = match c {
        '一' => 1,
        '二' | '两' => 2,
        '三' => 3,
        '四' => 4,
        '五' => 5,
        '六' => 6,
        '七' => 7,
        '八' => 8,
        '九' => 9,
        _ => return None,
    };
    Some(digit)
}

/// Chinese numerals up to 99, e.g. `三` = 3, `十二` = 12, `二十` = 20.
fn parse_chinese_number(token: &str) -> Option<u32> {
    let chars: Vec<char> = token.chars().collect();
    match chars.iter().position(|c| *c == '十') {
        None if chars.len() == 1 => chinese_digit(chars[0]),
        None => None,
        Some(pos) => {
            let tens = match &chars[..pos] {
                [] => 1,
                [c] => chinese_digit(*c)?,
                _ => return None,
            };
            let ones = match &chars[pos + 1..] {
                [] => 0,
                [c] => chinese_digit(*c)?,
                _ => return None,
            };
            Some(tens * 10 + ones)
        }
    }
}

/// Column named in `text`, if any.
pub fn parse_target_column(text: &str) -> Option<ColumnRef> {
    if let Some(caps) = ENGLISH_COLUMN_RE.captures(text) {
        if let Some(column) = caps.get(1).and_then(|m| ColumnRef::parse_token(m.as_str())) {
            return Some(column);
        }
    }
    CHINESE_COLUMN_RE.captures(text).and_then(|caps| {
        caps.get(1)
            .or_else(|| caps.get(2))
            .and_then(|m| ColumnRef::parse_token(m.as_str()))
    })
}

// ============================================================================
// Questions
// ============================================================================

/// A recognised data-presence question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceQuestion {
    /// About the visible sheet as a whole.
    Sheet,
    /// About one named column.
    Column(ColumnRef),
    /// About a column the user did not name.
    AmbiguousColumn,
}

impl PresenceQuestion {
    /// `None` unless `instruction` asks whether data is present.
    pub fn parse(instruction: &str) -> Option<Self> {
        let text = instruction.trim();
        if !is_data_presence_question(text) {
            return None;
        }
        if let Some(column) = parse_target_column(text) {
            return Some(Self::Column(column));
        }
        let lowered = text.to_lowercase();
        if AMBIGUOUS_COLUMN_SIGNALS.iter().any(|s| lowered.contains(s)) {
            Some(Self::AmbiguousColumn)
        } else {
            Some(Self::Sheet)
        }
    }

    pub fn column(&self) -> Option<ColumnRef> {
        match self {
            Self::Column(column) => Some(*column),
            _ => None,
        }
    }
}

/// Whether `instruction` asks if there is any data.
pub fn is_data_presence_question(instruction: &str) -> bool {
    let lowered = instruction.trim().to_lowercase();
    !lowered.is_empty() && PRESENCE_SIGNALS.iter().any(|s| lowered.contains(s))
}

// ============================================================================
// Verdicts
// ============================================================================

/// How much data a region shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataPresence {
    HasData,
    Sparse,
    Empty,
}

impl DataPresence {
    /// Fill ratio at or above which a region counts as holding data.
    pub const HAS_DATA_RATIO: f32 = 0.45;
    /// Fill ratio at or above which a region might hold a little data.
    pub const SPARSE_RATIO: f32 = 0.12;

    /// Verdict for the share of non-blank cells, `0.0..=1.0`.
    pub fn from_fill_ratio(ratio: f32) -> Self {
        if ratio >= Self::HAS_DATA_RATIO {
            Self::HasData
        } else if ratio >= Self::SPARSE_RATIO {
            Self::Sparse
        } else {
            Self::Empty
        }
    }

    /// Verdict carried by a detection label such as `data_present`.
    pub fn from_label(label: &str) -> Option<Self> {
        let key: String = label
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect();
        if ["data_empty", "empty_sheet", "no_data"].iter().any(|k| key.contains(k)) {
            Some(Self::Empty)
        } else if ["data_sparse", "little_data"].iter().any(|k| key.contains(k)) {
            Some(Self::Sparse)
        } else if ["data_present", "has_data"].iter().any(|k| key.contains(k)) {
            Some(Self::HasData)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HasData => "has_data",
            Self::Sparse => "sparse",
            Self::Empty => "empty",
        }
    }

    fn sheet_reply(&self) -> String {
        match self {
            Self::HasData => "Meow~ the visible area has data.".to_string(),
            Self::Sparse => "Meow, there seems to be a little data here.".to_string(),
            Self::Empty => "Meow, this looks like an empty sheet.".to_string(),
        }
    }

    fn column_reply(&self, column: ColumnRef) -> String {
        match self {
            Self::HasData => format!("Meow~ column {} has data.", column),
            Self::Sparse => format!("Meow, column {} might have a little data.", column),
            Self::Empty => format!("Meow, column {} looks empty.", column),
        }
    }
}

impl fmt::Display for DataPresence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict for one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnPresence {
    pub column: ColumnRef,
    pub presence: DataPresence,
}

/// A detector's data-presence verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEstimate {
    pub sheet: DataPresence,
    /// Set when the detector could judge the requested column.
    pub column: Option<ColumnPresence>,
}

impl PresenceEstimate {
    pub fn sheet(sheet: DataPresence) -> Self {
        Self {
            sheet,
            column: None,
        }
    }

    pub fn with_column(mut self, column: ColumnRef, presence: DataPresence) -> Self {
        self.column = Some(ColumnPresence { column, presence });
        self
    }
}

/// Sheet-level verdict from the scene's detection labels.
pub fn scene_presence(scene: &SceneDescription) -> Option<DataPresence> {
    scene
        .detections
        .iter()
        .find_map(|d| DataPresence::from_label(&d.label))
}

/// Local answer to `question`, or `None` when nothing can tell.
pub fn presence_reply(
    question: PresenceQuestion,
    estimate: Option<&PresenceEstimate>,
    scene: &SceneDescription,
) -> Option<String> {
    match (question, estimate) {
        (PresenceQuestion::AmbiguousColumn, _) => Some(CLARIFY_COLUMN.to_string()),
        (PresenceQuestion::Column(column), Some(estimate)) => Some(match estimate.column {
            Some(found) if found.column == column => found.presence.column_reply(column),
            _ => format!("Meow, I can't see column {} clearly yet.", column),
        }),
        (_, Some(estimate)) => Some(estimate.sheet.sheet_reply()),
        (_, None) => scene_presence(scene).map(|presence| presence.sheet_reply()),
    }
}
