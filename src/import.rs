use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Context};
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::ledger::{Clock, Ledger};
use crate::models::{Action, ActionEvent, UserKey, Vote};
use crate::store::LedgerStore;

#[derive(Debug, Deserialize)]
struct CsvRow {
    event_id: Option<Uuid>,
    user: String,
    kind: String,
    occurred_on: NaiveDate,
    post_id: Option<i64>,
    vote: Option<String>,
    saved: Option<bool>,
    problem_id: Option<String>,
    topic_id: Option<String>,
    solved: Option<bool>,
    video_id: Option<String>,
    percentage: Option<u8>,
    minutes: Option<i64>,
}

fn required<T>(value: Option<T>, column: &str, kind: &str) -> anyhow::Result<T> {
    value.ok_or_else(|| anyhow!("{kind} rows need a {column} column"))
}

impl CsvRow {
    fn into_event(self) -> anyhow::Result<ActionEvent> {
        let kind = self.kind.as_str();
        let action = match kind {
            "vote" => Action::Vote {
                post_id: required(self.post_id, "post_id", kind)?,
                vote: self.vote.as_deref().unwrap_or("none").parse::<Vote>()?,
            },
            "save" => Action::Save {
                post_id: required(self.post_id, "post_id", kind)?,
                saved: required(self.saved, "saved", kind)?,
            },
            "toggle_problem" => Action::ToggleProblem {
                problem_id: required(self.problem_id, "problem_id", kind)?,
                topic_id: required(self.topic_id, "topic_id", kind)?,
            },
            "set_problem" => Action::SetProblem {
                problem_id: required(self.problem_id, "problem_id", kind)?,
                topic_id: required(self.topic_id, "topic_id", kind)?,
                solved: required(self.solved, "solved", kind)?,
            },
            "video_progress" => Action::VideoProgress {
                video_id: required(self.video_id, "video_id", kind)?,
                topic_id: required(self.topic_id, "topic_id", kind)?,
                percentage: required(self.percentage, "percentage", kind)?,
            },
            "message_sent" => Action::MessageSent,
            "study_minutes" => Action::StudyMinutes {
                minutes: required(self.minutes, "minutes", kind)?,
            },
            other => return Err(anyhow!("unknown action kind {other:?}")),
        };

        Ok(ActionEvent {
            id: self.event_id.unwrap_or_else(Uuid::new_v4),
            user: UserKey::parse(&self.user)?,
            action,
            occurred_on: self.occurred_on,
        })
    }
}

pub fn read_events<R: Read>(reader: R) -> anyhow::Result<Vec<ActionEvent>> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut events = Vec::new();

    for (index, result) in reader.deserialize::<CsvRow>().enumerate() {
        let line = index + 2;
        let row = result.with_context(|| format!("malformed CSV row on line {line}"))?;
        events.push(row.into_event().with_context(|| format!("line {line}"))?);
    }

    Ok(events)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub applied: usize,
    pub rejected: usize,
}

/// Replays events in file order. Rows the ledger rejects are logged and
/// skipped; storage failures abort the import.
pub async fn import_csv<S, C>(ledger: &Ledger<S, C>, path: &Path) -> anyhow::Result<ImportSummary>
where
    S: LedgerStore,
    C: Clock,
{
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let events = read_events(file)?;
    let mut summary = ImportSummary::default();

    for event in &events {
        match ledger.apply_event(event).await {
            Ok(_) => summary.applied += 1,
            Err(err @ (LedgerError::Validation(_) | LedgerError::NotFound { .. })) => {
                warn!(event_id = %event.id, error = %err, "skipping rejected event");
                summary.rejected += 1;
            }
            Err(err) => return Err(err).context(format!("event {} failed", event.id)),
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "\
event_id,user,kind,occurred_on,post_id,vote,saved,problem_id,topic_id,solved,video_id,percentage,minutes
,avery@example.com,vote,2024-01-10,7,up,,,,,,,
,avery@example.com,toggle_problem,2024-01-10,,,,two-sum,arrays,,,,
,avery@example.com,video_progress,2024-01-11,,,,,arrays,,intro-video,95,
,avery@example.com,study_minutes,2024-01-11,,,,,,,,,30
3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2,avery@example.com,message_sent,2024-01-11,,,,,,,,,
";

    #[test]
    fn reads_each_action_kind() {
        let events = read_events(CSV.as_bytes()).unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(
            events[0].action,
            Action::Vote {
                post_id: 7,
                vote: Vote::Up
            }
        );
        assert_eq!(
            events[2].action,
            Action::VideoProgress {
                video_id: "intro-video".into(),
                topic_id: "arrays".into(),
                percentage: 95
            }
        );
        assert_eq!(
            events[4].id,
            Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2").unwrap()
        );
    }

    #[test]
    fn missing_columns_name_the_line() {
        let csv = "\
event_id,user,kind,occurred_on,post_id,vote,saved,problem_id,topic_id,solved,video_id,percentage,minutes
,avery@example.com,save,2024-01-10,7,,,,,,,,
";
        let err = read_events(csv.as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
        assert!(format!("{err:#}").contains("saved"));
    }

    #[test]
    fn malformed_user_keys_are_rejected() {
        let csv = "\
event_id,user,kind,occurred_on,post_id,vote,saved,problem_id,topic_id,solved,video_id,percentage,minutes
, ,message_sent,2024-01-10,,,,,,,,,
";
        assert!(read_events(csv.as_bytes()).is_err());
    }
}
