/// Plan tracking with an append-only audit history.
///
/// A `PlanTracker` owns an ordered list of plan items. Ids come from a
/// counter that lives as long as the tracker and is never rewound, so an id
/// handed out once is never handed out again, even across `reset`.
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};

use crate::error::{KernelError, KernelResult};
use crate::events::{ActionEvent, EventLog, EventOutcome};
use crate::render::LOG_PREFIX;

pub const PLAN_ACTION: &str = "plan_manager";
pub const PLAN_COMMAND_NAMES: &[&str] = &["reset", "add", "update", "remove", "show"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

impl PlanStatus {
    pub const ALL: [PlanStatus; 4] = [
        PlanStatus::Pending,
        PlanStatus::InProgress,
        PlanStatus::Completed,
        PlanStatus::Blocked,
    ];

    pub fn label(self) -> &'static str {
        match self {
            PlanStatus::Pending => "pending",
            PlanStatus::InProgress => "in_progress",
            PlanStatus::Completed => "completed",
            PlanStatus::Blocked => "blocked",
        }
    }

    pub fn marker(self) -> &'static str {
        match self {
            PlanStatus::Pending => "[ ]",
            PlanStatus::InProgress => "[~]",
            PlanStatus::Completed => "[x]",
            PlanStatus::Blocked => "[!]",
        }
    }

    pub fn parse(raw: &str) -> KernelResult<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|status| status.label() == normalized)
            .ok_or_else(|| {
                let mut valid = Self::ALL.map(PlanStatus::label);
                valid.sort_unstable();
                KernelError::validation(format!(
                    "invalid status '{normalized}'. Valid options: {}",
                    valid.join(", ")
                ))
            })
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub status: PlanStatus,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanItem {
    pub id: u64,
    pub title: String,
    pub status: PlanStatus,
    pub history: Vec<HistoryEntry>,
}

impl PlanItem {
    fn record(&mut self, reason: &str) {
        self.history.push(HistoryEntry {
            status: self.status,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn last_reason(&self) -> Option<&str> {
        self.history.last().map(|entry| entry.reason.as_str())
    }
}

/// A plan action requested by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanCommand {
    Add {
        title: String,
        status: Option<PlanStatus>,
        reason: Option<String>,
    },
    Update {
        id: u64,
        title: Option<String>,
        status: Option<PlanStatus>,
        reason: String,
    },
    Remove {
        id: u64,
    },
    Reset,
    Show,
}

fn optional_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn required_id(params: &Value) -> KernelResult<u64> {
    match params.get("item_id") {
        None | Some(Value::Null) => Err(KernelError::validation(
            "item_id is required for this action",
        )),
        Some(Value::Number(number)) => number
            .as_u64()
            .ok_or_else(|| KernelError::validation("item_id must be a positive integer")),
        Some(Value::String(raw)) => {
            let raw = raw.trim();
            if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit()) {
                return Err(KernelError::validation("item_id must be an integer"));
            }
            raw.parse::<u64>()
                .map_err(|_| KernelError::validation("item_id is out of range"))
        }
        Some(_) => Err(KernelError::validation("item_id must be an integer")),
    }
}

impl PlanCommand {
    /// Parse `{action, title, item_id, status, reason}` parameters.
    pub fn from_params(params: &Value) -> KernelResult<Self> {
        let action = params
            .get("action")
            .and_then(Value::as_str)
            .map(|value| value.trim().to_ascii_lowercase())
            .unwrap_or_default();
        if action.is_empty() {
            return Err(KernelError::validation("action is required"));
        }

        let status = optional_str(params, "status")
            .map(|raw| PlanStatus::parse(&raw))
            .transpose()?;

        match action.as_str() {
            "reset" => Ok(PlanCommand::Reset),
            "show" => Ok(PlanCommand::Show),
            "add" => Ok(PlanCommand::Add {
                title: params
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                status,
                reason: optional_str(params, "reason"),
            }),
            "update" => Ok(PlanCommand::Update {
                id: required_id(params)?,
                title: optional_str(params, "title"),
                status,
                reason: params
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "remove" => Ok(PlanCommand::Remove {
                id: required_id(params)?,
            }),
            _ => Err(KernelError::validation(format!(
                "invalid action. use one of: {}.",
                PLAN_COMMAND_NAMES.join(", ")
            ))),
        }
    }
}

pub struct PlanTracker {
    items: Vec<PlanItem>,
    next_id: u64,
    events: EventLog,
}

impl PlanTracker {
    pub fn new(events: EventLog) -> Self {
        Self {
            items: Vec::new(),
            next_id: 1,
            events,
        }
    }

    pub fn items(&self) -> &[PlanItem] {
        &self.items
    }

    pub fn get(&self, id: u64) -> Option<&PlanItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Highest id ever issued by this tracker, if any.
    pub fn last_issued_id(&self) -> Option<u64> {
        (self.next_id > 1).then(|| self.next_id - 1)
    }

    pub fn add(
        &mut self,
        title: &str,
        status: Option<PlanStatus>,
        reason: Option<&str>,
    ) -> KernelResult<u64> {
        let params = json!({
            "action": "add",
            "title": title,
            "status": status.map(PlanStatus::label),
            "reason": reason,
        });
        let result = self.add_item(title, status, reason);
        self.observe(params, &result, |id| format!("added plan item #{id}."));
        result
    }

    pub fn update(
        &mut self,
        id: u64,
        title: Option<&str>,
        status: Option<PlanStatus>,
        reason: &str,
    ) -> KernelResult<()> {
        let params = json!({
            "action": "update",
            "item_id": id,
            "title": title,
            "status": status.map(PlanStatus::label),
            "reason": reason,
        });
        let result = self.update_item(id, title, status, reason);
        self.observe(params, &result, |_| format!("updated plan item #{id}."));
        result
    }

    pub fn remove(&mut self, id: u64) -> KernelResult<()> {
        let params = json!({"action": "remove", "item_id": id});
        let result = match self.items.iter().position(|item| item.id == id) {
            Some(index) => {
                self.items.remove(index);
                Ok(())
            }
            None => Err(KernelError::NotFound(id)),
        };
        self.observe(params, &result, |_| format!("removed plan item #{id}."));
        result
    }

    pub fn reset(&mut self) {
        self.items.clear();
        let result: KernelResult<()> = Ok(());
        self.observe(json!({"action": "reset"}), &result, |_| {
            "plan cleared.".to_string()
        });
    }

    pub fn show(&self) {
        let result: KernelResult<()> = Ok(());
        self.observe(json!({"action": "show"}), &result, |_| {
            "displayed current plan.".to_string()
        });
    }

    pub fn apply(&mut self, command: PlanCommand) -> KernelResult<String> {
        match command {
            PlanCommand::Add {
                title,
                status,
                reason,
            } => self
                .add(&title, status, reason.as_deref())
                .map(|id| format!("added plan item #{id}.")),
            PlanCommand::Update {
                id,
                title,
                status,
                reason,
            } => self
                .update(id, title.as_deref(), status, &reason)
                .map(|()| format!("updated plan item #{id}.")),
            PlanCommand::Remove { id } => self
                .remove(id)
                .map(|()| format!("removed plan item #{id}.")),
            PlanCommand::Reset => {
                self.reset();
                Ok("plan cleared.".to_string())
            }
            PlanCommand::Show => {
                self.show();
                Ok(format!("displayed current plan.\n{}", self.render()))
            }
        }
    }

    /// Parse and apply raw `plan_manager` parameters. Parse failures are
    /// logged like any other failed plan action.
    pub fn apply_params(&mut self, params: &Value) -> KernelResult<String> {
        match PlanCommand::from_params(params) {
            Ok(command) => self.apply(command),
            Err(err) => {
                self.events.record(
                    &ActionEvent::new(PLAN_ACTION, EventOutcome::Error, params.clone())
                        .with_detail(err.to_string()),
                );
                Err(err)
            }
        }
    }

    pub fn render(&self) -> String {
        if self.items.is_empty() {
            return format!("{LOG_PREFIX}[plan] (plan is empty)");
        }

        let mut lines = vec![format!("{LOG_PREFIX}[plan] current plan"), String::new()];
        for item in &self.items {
            let reason_suffix = item
                .last_reason()
                .filter(|reason| !reason.is_empty())
                .map(|reason| format!(" - {reason}"))
                .unwrap_or_default();
            lines.push(format!(
                "- {} #{} {} ({}){}",
                item.status.marker(),
                item.id,
                item.title,
                item.status,
                reason_suffix
            ));
        }
        lines.join("\n")
    }

    fn add_item(
        &mut self,
        title: &str,
        status: Option<PlanStatus>,
        reason: Option<&str>,
    ) -> KernelResult<u64> {
        let title = title.trim();
        if title.is_empty() {
            return Err(KernelError::validation(
                "title is required to add a plan item",
            ));
        }

        let id = self.next_id;
        self.next_id += 1;

        let mut item = PlanItem {
            id,
            title: title.to_string(),
            status: status.unwrap_or(PlanStatus::Pending),
            history: Vec::new(),
        };
        if let Some(reason) = reason.map(str::trim).filter(|r| !r.is_empty()) {
            item.record(reason);
        }
        self.items.push(item);
        Ok(id)
    }

    fn update_item(
        &mut self,
        id: u64,
        title: Option<&str>,
        status: Option<PlanStatus>,
        reason: &str,
    ) -> KernelResult<()> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(KernelError::validation(
                "reason is required when updating a plan item",
            ));
        }

        let item = self
            .items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or(KernelError::NotFound(id))?;

        if let Some(title) = title.map(str::trim).filter(|t| !t.is_empty()) {
            item.title = title.to_string();
        }
        if let Some(status) = status {
            item.status = status;
        }
        item.record(reason);
        Ok(())
    }

    fn observe<T>(
        &self,
        params: Value,
        result: &KernelResult<T>,
        describe: impl FnOnce(&T) -> String,
    ) {
        self.events.render(&self.render());
        let event = match result {
            Ok(value) => ActionEvent::new(PLAN_ACTION, EventOutcome::Success, params)
                .with_detail(describe(value)),
            Err(err) => ActionEvent::new(PLAN_ACTION, EventOutcome::Error, params)
                .with_detail(err.to_string()),
        };
        self.events.record(&event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::testing::{RecordingRenderer, event_log};

    fn tracker() -> (PlanTracker, Arc<RecordingRenderer>) {
        let renderer = Arc::new(RecordingRenderer::default());
        (PlanTracker::new(event_log(renderer.clone())), renderer)
    }

    #[test]
    fn add_then_update_records_history_and_rejects_empty_reason() {
        let (mut plan, _) = tracker();
        let id = plan.add("write tests", None, None).unwrap();
        assert_eq!(id, 1);
        assert_eq!(plan.get(1).unwrap().status, PlanStatus::Pending);
        assert!(plan.get(1).unwrap().history.is_empty());

        plan.update(1, None, Some(PlanStatus::InProgress), "starting")
            .unwrap();
        let item = plan.get(1).unwrap();
        assert_eq!(item.history.len(), 1);
        assert_eq!(item.status, PlanStatus::InProgress);
        assert_eq!(item.history[0].status, PlanStatus::InProgress);
        assert_eq!(item.history[0].reason, "starting");

        let err = plan.update(1, None, None, "").unwrap_err();
        assert!(matches!(err, KernelError::Validation(_)));
        assert_eq!(plan.get(1).unwrap().history.len(), 1);
    }

    #[test]
    fn update_with_blank_reason_fails_even_for_unknown_ids() {
        let (mut plan, _) = tracker();
        let err = plan
            .update(42, Some("x"), Some(PlanStatus::Completed), "   ")
            .unwrap_err();
        assert!(matches!(err, KernelError::Validation(_)));

        let err = plan.update(42, None, None, "because").unwrap_err();
        assert_eq!(err, KernelError::NotFound(42));
    }

    #[test]
    fn add_with_reason_records_initial_status() {
        let (mut plan, _) = tracker();
        let id = plan
            .add("triage", Some(PlanStatus::Blocked), Some(" waiting on repo "))
            .unwrap();
        let item = plan.get(id).unwrap();
        assert_eq!(item.history.len(), 1);
        assert_eq!(item.history[0].status, PlanStatus::Blocked);
        assert_eq!(item.history[0].reason, "waiting on repo");
    }

    #[test]
    fn add_rejects_blank_title_without_consuming_an_id() {
        let (mut plan, _) = tracker();
        assert!(matches!(
            plan.add("  ", None, None),
            Err(KernelError::Validation(_))
        ));
        assert_eq!(plan.add("real", None, None).unwrap(), 1);
    }

    #[test]
    fn ids_are_never_reused_across_remove_and_reset() {
        let (mut plan, _) = tracker();
        let mut issued = Vec::new();
        issued.push(plan.add("a", None, None).unwrap());
        issued.push(plan.add("b", None, None).unwrap());
        plan.remove(issued[1]).unwrap();
        issued.push(plan.add("c", None, None).unwrap());
        let before_reset = plan.last_issued_id().unwrap();
        plan.reset();
        assert!(plan.is_empty());
        issued.push(plan.add("d", None, None).unwrap());

        assert_eq!(issued, vec![1, 2, 3, 4]);
        assert!(issued.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(issued[3] > before_reset);
        assert_eq!(plan.remove(2), Err(KernelError::NotFound(2)));
    }

    #[test]
    fn render_lists_items_in_insertion_order_with_latest_reason() {
        let (mut plan, _) = tracker();
        assert_eq!(plan.render(), "[conductor][plan] (plan is empty)");

        plan.add("gather context", None, None).unwrap();
        plan.add("implement", None, None).unwrap();
        plan.update(1, None, Some(PlanStatus::Completed), "read files")
            .unwrap();
        plan.update(2, Some("implement parser"), None, "renamed")
            .unwrap();

        assert_eq!(
            plan.render(),
            "[conductor][plan] current plan\n\n\
             - [x] #1 gather context (completed) - read files\n\
             - [ ] #2 implement parser (pending) - renamed"
        );
    }

    #[test]
    fn every_mutation_renders_and_logs_an_event() {
        let (mut plan, renderer) = tracker();
        plan.add("a", None, None).unwrap();
        let _ = plan.update(1, None, None, "");
        let _ = plan.remove(9);
        plan.reset();

        let rendered = renderer.rendered();
        let plan_renders = rendered
            .iter()
            .filter(|text| text.starts_with("[conductor][plan]"))
            .count();
        assert_eq!(plan_renders, 4);
        let events = rendered
            .iter()
            .filter(|text| text.starts_with("[conductor][plan_manager]"))
            .collect::<Vec<_>>();
        assert_eq!(events.len(), 4);
        assert!(events[0].contains("SUCCESS"));
        assert!(events[1].contains("ERROR"));
        assert!(events[1].contains("reason is required"));
        assert!(events[2].contains("plan item #9 not found"));
        assert!(events[3].contains("plan cleared."));
    }

    #[test]
    fn apply_params_parses_plan_manager_requests() {
        let (mut plan, _) = tracker();
        let message = plan
            .apply_params(&json!({"action": " ADD ", "title": "ship", "reason": "kickoff"}))
            .unwrap();
        assert_eq!(message, "added plan item #1.");

        plan.apply_params(&json!({
            "action": "update",
            "item_id": "1",
            "status": "In_Progress",
            "reason": "go"
        }))
        .unwrap();
        assert_eq!(plan.get(1).unwrap().status, PlanStatus::InProgress);

        let err = plan
            .apply_params(&json!({"action": "update", "item_id": 1, "status": "done", "reason": "x"}))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid status 'done'. Valid options: blocked, completed, in_progress, pending"
        );

        let err = plan
            .apply_params(&json!({"action": "update", "item_id": "one", "reason": "x"}))
            .unwrap_err();
        assert!(matches!(err, KernelError::Validation(_)));

        let err = plan.apply_params(&json!({"action": "rename"})).unwrap_err();
        assert!(err.to_string().contains("reset, add, update, remove, show"));

        let shown = plan.apply_params(&json!({"action": "show"})).unwrap();
        assert!(shown.contains("#1 ship (in_progress) - go"));
    }

    #[test]
    fn concurrent_updates_are_serialized_without_loss() {
        let (mut plan, _) = tracker();
        let id = plan.add("shared", None, None).unwrap();
        let plan = Arc::new(Mutex::new(plan));

        let handles = [
            ("first", PlanStatus::InProgress),
            ("second", PlanStatus::Completed),
        ]
        .into_iter()
        .map(|(reason, status)| {
            let plan = Arc::clone(&plan);
            std::thread::spawn(move || {
                plan.lock()
                    .unwrap()
                    .update(id, None, Some(status), reason)
                    .unwrap();
            })
        })
        .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        let plan = plan.lock().unwrap();
        let item = plan.get(id).unwrap();
        assert_eq!(item.history.len(), 2);
        let mut reasons = item
            .history
            .iter()
            .map(|entry| entry.reason.as_str())
            .collect::<Vec<_>>();
        reasons.sort_unstable();
        assert_eq!(reasons, vec!["first", "second"]);
        assert_eq!(item.status, item.history.last().unwrap().status);
    }
}
