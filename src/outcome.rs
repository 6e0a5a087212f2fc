//! Final report of an import run.

use serde::Serialize;

use crate::progress::{MessageLevel, ProgressSink};
use crate::store::EntityKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeState {
    AllSucceeded,
    SucceededWithErrors,
    /// The file could not be read; no row was processed.
    FatalParseFailure,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub state: OutcomeState,
    pub total_rows: usize,
    pub processed_rows: usize,
    pub created: usize,
    pub updated: usize,
    pub inactive_rows: usize,
    pub deactivated: usize,
    pub errors: Vec<String>,
}

impl ImportOutcome {
    pub fn fatal(message: String) -> Self {
        Self {
            state: OutcomeState::FatalParseFailure,
            total_rows: 0,
            processed_rows: 0,
            created: 0,
            updated: 0,
            inactive_rows: 0,
            deactivated: 0,
            errors: vec![message],
        }
    }

    pub fn any_failed(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Counters accumulated by the row loop.
#[derive(Debug, Default)]
pub struct Tally {
    pub total_rows: usize,
    pub processed_rows: usize,
    pub created: usize,
    pub updated: usize,
    pub inactive_rows: usize,
    pub deactivated: usize,
    pub errors: Vec<String>,
}

impl Tally {
    pub fn new(total_rows: usize) -> Self {
        Self {
            total_rows,
            ..Self::default()
        }
    }

    pub fn finish(self, cancelled: bool) -> ImportOutcome {
        let state = if cancelled {
            OutcomeState::Cancelled
        } else if self.errors.is_empty() {
            OutcomeState::AllSucceeded
        } else {
            OutcomeState::SucceededWithErrors
        };
        ImportOutcome {
            state,
            total_rows: self.total_rows,
            processed_rows: self.processed_rows,
            created: self.created,
            updated: self.updated,
            inactive_rows: self.inactive_rows,
            deactivated: self.deactivated,
            errors: self.errors,
        }
    }
}

/// Emit the closing summary messages.
pub fn report(outcome: &ImportOutcome, kind: EntityKind, progress: &mut dyn ProgressSink) {
    let plural = kind.plural();
    match outcome.state {
        OutcomeState::FatalParseFailure => {
            progress.add_message(
                MessageLevel::Error,
                format!("The file could not be read, no {} were imported.", plural),
            );
            return;
        }
        OutcomeState::Cancelled => {
            progress.add_message(
                MessageLevel::Warning,
                format!(
                    "Import cancelled after {} of {} rows.",
                    outcome.processed_rows, outcome.total_rows
                ),
            );
        }
        _ => {}
    }
    if outcome.deactivated > 0 {
        progress.add_message(
            MessageLevel::Warning,
            format!("{} existing {} were deactivated.", outcome.deactivated, plural),
        );
    }
    if outcome.created > 0 {
        progress.add_message(
            MessageLevel::Success,
            format!("{} {} were newly created.", outcome.created, plural),
        );
    }
    match outcome.state {
        OutcomeState::AllSucceeded => progress.add_message(
            MessageLevel::Success,
            format!("All {} were imported successfully.", plural),
        ),
        OutcomeState::SucceededWithErrors => progress.add_message(
            MessageLevel::Warning,
            format!("Some {} failed to be imported.", plural),
        ),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::RecordingProgress;

    #[test]
    fn states_from_tally() {
        let t = Tally::new(3);
        assert_eq!(t.finish(false).state, OutcomeState::AllSucceeded);

        let mut t = Tally::new(3);
        t.errors.push("Row 2 (line 3): boom".into());
        let o = t.finish(false);
        assert_eq!(o.state, OutcomeState::SucceededWithErrors);
        assert!(o.any_failed());

        let mut t = Tally::new(3);
        t.errors.push("x".into());
        assert_eq!(t.finish(true).state, OutcomeState::Cancelled);
    }

    #[test]
    fn summary_messages() {
        let mut t = Tally::new(4);
        t.processed_rows = 4;
        t.created = 2;
        t.deactivated = 1;
        let outcome = t.finish(false);
        let mut sink = RecordingProgress::new();
        report(&outcome, EntityKind::Person, &mut sink);
        let texts: Vec<_> = sink.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "1 existing persons were deactivated.",
                "2 persons were newly created.",
                "All persons were imported successfully.",
            ]
        );

        let mut sink = RecordingProgress::new();
        report(&ImportOutcome::fatal("line 2: bad".into()), EntityKind::Group, &mut sink);
        assert_eq!(sink.messages().len(), 1);
        assert_eq!(sink.messages()[0].level, MessageLevel::Error);
    }
}
