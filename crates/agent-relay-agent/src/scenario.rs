//! Scripted scenarios replayed as protocol events.
//!
//! A scenario is a list of turns. Each turn pairs a trigger with the exact
//! events to replay when the last user message matches it. Scenarios are
//! loaded from YAML or JSON; a few ship with the binary.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use agent_relay_core::config::Config;
use agent_relay_core::protocol::Event;
use agent_relay_core::run::RunRequest;
use anyhow::Context;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::sink::{EventSink, SinkClosed, spawn_run};
use crate::{Agent, EventStream, new_message_id};

/// Trigger that matches any message.
pub const WILDCARD: &str = "*";

const NO_MATCH_REPLY: &str = "This scenario has no response for that message.";

const BUILTIN: &[(&str, &str)] = &[
    ("error.yaml", include_str!("../scenarios/error.yaml")),
    ("greeting.yaml", include_str!("../scenarios/greeting.yaml")),
    ("weather.yaml", include_str!("../scenarios/weather.yaml")),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub turns: Vec<Turn>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub trigger: String,
    pub events: Vec<Event>,
}

impl Turn {
    /// `*` matches anything; otherwise the trigger is a case-insensitive
    /// regex, or a case-insensitive literal when it does not compile.
    pub fn matches(&self, message: &str) -> bool {
        if self.trigger == WILDCARD {
            return true;
        }
        match RegexBuilder::new(&self.trigger).case_insensitive(true).build() {
            Ok(re) => re.is_match(message),
            Err(_) => self.trigger.to_lowercase() == message.to_lowercase(),
        }
    }
}

impl Scenario {
    /// Parse a scenario file. `.json` is read as JSON, anything else as YAML.
    pub fn parse(raw: &str, path: &Path) -> anyhow::Result<Self> {
        let is_json = path.extension().is_some_and(|e| e == "json");
        let scenario: Scenario = if is_json {
            serde_json::from_str(raw)?
        } else {
            serde_yaml::from_str(raw)?
        };
        if scenario.id.trim().is_empty() {
            anyhow::bail!("scenario id must not be empty");
        }
        Ok(scenario)
    }

    /// The turn to replay for `message`. No user message selects the first turn.
    pub fn select_turn(&self, message: Option<&str>) -> Option<&Turn> {
        match message {
            None => self.turns.first(),
            Some(text) => self.turns.iter().find(|t| t.matches(text)),
        }
    }
}

/// All known scenarios, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ScenarioStore {
    scenarios: HashMap<String, Arc<Scenario>>,
}

impl ScenarioStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The scenarios compiled into the binary.
    pub fn builtin() -> Self {
        let mut store = Self::new();
        for (name, raw) in BUILTIN {
            match Scenario::parse(raw, Path::new(name)) {
                Ok(scenario) => store.insert(scenario),
                Err(e) => warn!(file = name, %e, "Invalid built-in scenario"),
            }
        }
        store
    }

    /// Built-ins plus everything in `agent.scenario_dir`, which overrides
    /// built-ins with the same id.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut store = Self::builtin();
        if let Some(dir) = config.scenario_dir() {
            let loaded = store.load_dir(&dir)?;
            info!(dir = %dir.display(), loaded, "Loaded scenarios");
        }
        Ok(store)
    }

    /// Load every `.yaml`, `.yml` and `.json` file in `dir`. Files that fail
    /// to parse are skipped with a warning. Returns the number loaded.
    pub fn load_dir(&mut self, dir: &Path) -> anyhow::Result<usize> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("reading scenario dir {}", dir.display()))?;

        let mut paths: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| matches!(e, "yaml" | "yml" | "json"))
            })
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let parsed = std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| Scenario::parse(&raw, &path));
            match parsed {
                Ok(scenario) => {
                    debug!(id = %scenario.id, path = %path.display(), "Scenario loaded");
                    self.insert(scenario);
                    loaded += 1;
                }
                Err(e) => warn!(path = %path.display(), %e, "Skipping invalid scenario"),
            }
        }
        Ok(loaded)
    }

    pub fn insert(&mut self, scenario: Scenario) {
        self.scenarios
            .insert(scenario.id.clone(), Arc::new(scenario));
    }

    pub fn get(&self, id: &str) -> Option<Arc<Scenario>> {
        self.scenarios.get(id).cloned()
    }

    /// Every scenario, sorted by id.
    pub fn list(&self) -> Vec<Arc<Scenario>> {
        let mut all: Vec<_> = self.scenarios.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}

/// Replays one scenario with a fixed delay between events.
pub struct ScenarioAgent {
    scenario: Arc<Scenario>,
    delay: Duration,
}

impl ScenarioAgent {
    pub fn new(scenario: Arc<Scenario>, delay: Duration) -> Self {
        Self { scenario, delay }
    }
}

impl Agent for ScenarioAgent {
    fn id(&self) -> &str {
        &self.scenario.id
    }

    fn run(&self, request: RunRequest) -> EventStream {
        let scenario = self.scenario.clone();
        let delay = self.delay;
        spawn_run(move |sink| async move {
            if replay(&scenario, &request, delay, &sink).await.is_err() {
                debug!(scenario = %scenario.id, run_id = %request.run_id, "Scenario run abandoned by consumer");
            }
        })
    }
}

async fn replay(
    scenario: &Scenario,
    request: &RunRequest,
    delay: Duration,
    sink: &EventSink,
) -> Result<(), SinkClosed> {
    let thread_id = request.thread_id.as_str();
    let run_id = request.run_id.as_str();

    let Some(turn) = scenario.select_turn(request.last_user_message()) else {
        debug!(scenario = %scenario.id, "No turn matched");
        let message_id = new_message_id();
        for event in [
            Event::run_started(thread_id, run_id),
            Event::text_start(&message_id),
            Event::text_chunk(&message_id, NO_MATCH_REPLY),
            Event::text_end(&message_id),
            Event::run_finished(thread_id, run_id),
        ] {
            sink.emit(event).await?;
        }
        return Ok(());
    };

    for (i, event) in turn.events.iter().enumerate() {
        if i > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        sink.emit(event.clone().restamp(thread_id, run_id)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_relay_core::run::Message;
    use tokio_stream::StreamExt;

    fn turn(trigger: &str, text: &str) -> Turn {
        Turn {
            trigger: trigger.into(),
            events: vec![
                Event::run_started("x", "x"),
                Event::text_start("m"),
                Event::text_chunk("m", text),
                Event::text_end("m"),
                Event::run_finished("x", "x"),
            ],
        }
    }

    fn scenario(turns: Vec<Turn>) -> Arc<Scenario> {
        Arc::new(Scenario {
            id: "test".into(),
            name: "Test".into(),
            description: String::new(),
            turns,
        })
    }

    #[test]
    fn test_wildcard_always_matches() {
        let t = turn("*", "");
        assert!(t.matches(""));
        assert!(t.matches("anything at all"));
    }

    #[test]
    fn test_regex_trigger_is_case_insensitive() {
        let t = turn("^hel+o", "");
        assert!(t.matches("HELLO there"));
        assert!(!t.matches("oh hello"));
    }

    #[test]
    fn test_invalid_regex_falls_back_to_exact_match() {
        let t = turn("what (is", "");
        assert!(t.matches("What (IS"));
        assert!(!t.matches("what (is this"));
    }

    #[test]
    fn test_first_matching_turn_wins() {
        let s = scenario(vec![turn("weather", "a"), turn("*", "b")]);
        assert_eq!(s.select_turn(Some("the weather?")).unwrap().trigger, "weather");
        assert_eq!(s.select_turn(Some("hi")).unwrap().trigger, "*");
        assert_eq!(s.select_turn(None).unwrap().trigger, "weather");
    }

    #[test]
    fn test_builtin_scenarios_parse() {
        let store = ScenarioStore::builtin();
        let ids: Vec<_> = store.list().iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec!["error", "greeting", "weather"]);
    }

    #[test]
    fn test_load_dir_skips_invalid_and_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("greeting.json"),
            r#"{"id":"greeting","name":"Custom","turns":[]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "id: [").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut store = ScenarioStore::builtin();
        assert_eq!(store.load_dir(dir.path()).unwrap(), 1);
        assert_eq!(store.get("greeting").unwrap().name, "Custom");
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_load_missing_dir_fails() {
        let mut store = ScenarioStore::new();
        assert!(store.load_dir(Path::new("/nonexistent/scenarios")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_restamps_lifecycle_with_delay() {
        let agent = ScenarioAgent::new(
            scenario(vec![turn("*", "scripted")]),
            Duration::from_millis(50),
        );
        let request = RunRequest::new("t1", "r1").with_messages(vec![Message::user("go")]);

        let start = tokio::time::Instant::now();
        let events: Vec<Event> = agent.run(request).collect().await;

        assert_eq!(events.len(), 5);
        assert_eq!(events[0], Event::run_started("t1", "r1"));
        assert_eq!(events[2], Event::text_chunk("m", "scripted"));
        assert_eq!(events[4], Event::run_finished("t1", "r1"));
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_no_match_emits_default_message() {
        let agent = ScenarioAgent::new(scenario(vec![turn("^never$", "x")]), Duration::ZERO);
        let request = RunRequest::new("t1", "r1").with_messages(vec![Message::user("hello")]);
        let events: Vec<Event> = agent.run(request).collect().await;

        assert_eq!(events.first(), Some(&Event::run_started("t1", "r1")));
        assert_eq!(events.last(), Some(&Event::run_finished("t1", "r1")));
        assert!(events.iter().any(|e| matches!(
            e,
            Event::TextMessageChunk { delta, .. } if delta == NO_MATCH_REPLY
        )));
    }
}
