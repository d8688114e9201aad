//! Per-participant typing state machine.
//!
//! A [`TypingCursor`] consumes classified keystrokes against an immutable
//! [`RaceText`] and yields absolute counter snapshots. Words must be typed exactly
//! before a word boundary advances the cursor; history of mistakes is never
//! rewound by backspace.

use crate::error::RaceError;
use crate::metrics::round2;
use serde::{Deserialize, Serialize};

/// A single keystroke, already classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Keystroke {
    Char(char),
    Backspace,
    WordBoundary,
}

impl Keystroke {
    /// Classifies a raw character coming from a keyboard or terminal.
    pub fn from_char(c: char) -> Self {
        match c {
            '\u{8}' | '\u{7f}' => Keystroke::Backspace,
            c if c.is_whitespace() => Keystroke::WordBoundary,
            c => Keystroke::Char(c),
        }
    }
}

/// Race text split into whitespace-delimited words of Unicode scalar values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RaceText {
    raw: String,
    words: Vec<Vec<char>>,
    total_chars: u32,
}

impl RaceText {
    pub fn new(text: &str) -> Result<Self, RaceError> {
        let words: Vec<Vec<char>> = text
            .split_whitespace()
            .map(|word| word.chars().collect())
            .collect();

        if words.is_empty() {
            return Err(RaceError::EmptyText);
        }

        let total_chars = words.iter().map(|w| w.len() as u32).sum();

        Ok(Self {
            raw: text.to_string(),
            words,
            total_chars,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn word(&self, index: usize) -> Option<&[char]> {
        self.words.get(index).map(|w| w.as_slice())
    }

    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    /// Non-whitespace characters across all words; the denominator for progress.
    pub fn total_chars(&self) -> u32 {
        self.total_chars
    }
}

impl TryFrom<String> for RaceText {
    type Error = RaceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RaceText::new(&value)
    }
}

impl From<RaceText> for String {
    fn from(text: RaceText) -> Self {
        text.raw
    }
}

/// Absolute counter snapshot for one participant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Counters {
    pub correct_chars: u32,
    pub total_chars_typed: u32,
    pub mistakes: u32,
    pub progress_percent: f64,
    /// Number of state-changing keystrokes accepted so far.
    pub revision: u32,
}

/// Result of feeding one keystroke to a cursor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeystrokeOutcome {
    /// State changed; new snapshot.
    Progress(Counters),
    /// Keystroke had no effect (overtype, backspace at word start, wrong word boundary).
    Unchanged(Counters),
    /// Final word completed by this keystroke. Emitted once per cursor.
    Completed(Counters),
    /// Cursor already finished; keystroke dropped.
    Rejected,
}

impl KeystrokeOutcome {
    pub fn counters(&self) -> Option<Counters> {
        match self {
            KeystrokeOutcome::Progress(c)
            | KeystrokeOutcome::Unchanged(c)
            | KeystrokeOutcome::Completed(c) => Some(*c),
            KeystrokeOutcome::Rejected => None,
        }
    }
}

/// Transient position of one participant within the race text.
#[derive(Debug, Clone, PartialEq)]
pub struct TypingCursor {
    word_index: usize,
    char_index: usize,
    inputs: Vec<Vec<char>>,
    total_chars_typed: u32,
    mistakes: u32,
    revision: u32,
    finished: bool,
}

impl TypingCursor {
    pub fn new(text: &RaceText) -> Self {
        Self {
            word_index: 0,
            char_index: 0,
            inputs: vec![Vec::new(); text.word_count()],
            total_chars_typed: 0,
            mistakes: 0,
            revision: 0,
            finished: false,
        }
    }

    pub fn word_index(&self) -> usize {
        self.word_index
    }

    pub fn char_index(&self) -> usize {
        self.char_index
    }

    /// What the participant has typed for the given word.
    pub fn input(&self, word_index: usize) -> Option<&[char]> {
        self.inputs.get(word_index).map(|w| w.as_slice())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn apply(&mut self, text: &RaceText, key: Keystroke) -> KeystrokeOutcome {
        if self.finished {
            return KeystrokeOutcome::Rejected;
        }

        let Some(word) = text.word(self.word_index) else {
            return KeystrokeOutcome::Rejected;
        };

        match key {
            Keystroke::Char(c) => {
                // Overtype past the end of a word is not recorded.
                if self.char_index >= word.len() {
                    return KeystrokeOutcome::Unchanged(self.counters(text));
                }

                if c != word[self.char_index] {
                    self.mistakes += 1;
                }
                self.inputs[self.word_index].push(c);
                self.char_index += 1;
                self.total_chars_typed += 1;
                self.revision += 1;

                let is_last_word = self.word_index + 1 == text.word_count();
                if is_last_word && self.inputs[self.word_index].as_slice() == word {
                    self.advance_word(text);
                    return KeystrokeOutcome::Completed(self.counters(text));
                }
            }
            Keystroke::Backspace => {
                if self.char_index == 0 {
                    return KeystrokeOutcome::Unchanged(self.counters(text));
                }
                self.char_index -= 1;
                self.inputs[self.word_index].truncate(self.char_index);
                self.revision += 1;
            }
            Keystroke::WordBoundary => {
                if self.inputs[self.word_index].as_slice() != word {
                    return KeystrokeOutcome::Unchanged(self.counters(text));
                }
                self.revision += 1;
                self.advance_word(text);
                if self.finished {
                    return KeystrokeOutcome::Completed(self.counters(text));
                }
            }
        }

        KeystrokeOutcome::Progress(self.counters(text))
    }

    fn advance_word(&mut self, text: &RaceText) {
        self.word_index += 1;
        self.char_index = 0;
        if self.word_index >= text.word_count() {
            self.finished = true;
        }
    }

    /// Correct characters, recomputed from the cursor state.
    ///
    /// Completed words count in full; the word in progress counts positions that
    /// match the expected word.
    pub fn correct_chars(&self, text: &RaceText) -> u32 {
        let completed: u32 = (0..self.word_index.min(text.word_count()))
            .filter_map(|i| text.word(i))
            .map(|w| w.len() as u32)
            .sum();

        let in_progress = match (text.word(self.word_index), self.input(self.word_index)) {
            (Some(expected), Some(typed)) => typed
                .iter()
                .zip(expected.iter())
                .filter(|(a, b)| a == b)
                .count() as u32,
            _ => 0,
        };

        completed + in_progress
    }

    pub fn counters(&self, text: &RaceText) -> Counters {
        let correct_chars = self.correct_chars(text);
        Counters {
            correct_chars,
            total_chars_typed: self.total_chars_typed,
            mistakes: self.mistakes,
            progress_percent: round2(100.0 * correct_chars as f64 / text.total_chars() as f64),
            revision: self.revision,
        }
    }
}
