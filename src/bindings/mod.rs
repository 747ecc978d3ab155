use crate::model::{StateEvent, TriggerEvent};
use serde::{Deserialize, Serialize};

pub const SUPPORTED_TRIGGERS: &[&str] = &[
    "follow",
    "sub",
    "raid_in",
    "raid_out",
    "shoutout",
    "hype_train_start",
    "follow_goal_complete",
    "sub_goal_complete",
    "plus_goal_complete",
    "channel_point_redeem",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerFilter {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl TriggerFilter {
    /// `source` and `name` only constrain the match when they are set.
    pub fn matches(&self, trigger: &TriggerEvent) -> bool {
        self.event == trigger.event
            && field_matches(self.source.as_deref(), trigger.source.as_deref())
            && field_matches(self.name.as_deref(), trigger.name.as_deref())
    }
}

fn field_matches(wanted: Option<&str>, actual: Option<&str>) -> bool {
    wanted.map_or(true, |wanted| actual == Some(wanted))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBinding {
    pub trigger: TriggerFilter,
    pub state: StateEvent,
}

/// State events for every binding the trigger matches, in config order.
pub fn resolve<'a>(bindings: &'a [EventBinding], trigger: &TriggerEvent) -> Vec<&'a StateEvent> {
    bindings
        .iter()
        .filter(|binding| binding.trigger.matches(trigger))
        .map(|binding| &binding.state)
        .collect()
}

pub fn is_supported_trigger(event: &str) -> bool {
    SUPPORTED_TRIGGERS.contains(&event)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(event: &str, source: Option<&str>, name: Option<&str>, state: &str) -> EventBinding {
        EventBinding {
            trigger: TriggerFilter {
                event: event.to_string(),
                source: source.map(str::to_string),
                name: name.map(str::to_string),
            },
            state: StateEvent::set(state),
        }
    }

    fn trigger(event: &str, source: Option<&str>, name: Option<&str>) -> TriggerEvent {
        TriggerEvent {
            event: event.to_string(),
            source: source.map(str::to_string),
            name: name.map(str::to_string),
        }
    }

    #[test]
    fn unfiltered_binding_matches_any_source() {
        let bindings = vec![binding("follow", None, None, "shy")];
        let matched = resolve(&bindings, &trigger("follow", Some("alice"), None));
        assert_eq!(matched, vec![&StateEvent::set("shy")]);
    }

    #[test]
    fn filters_must_match_when_set() {
        let bindings = vec![
            binding("channel_point_redeem", None, Some("Hydrate"), "laugh"),
            binding("raid_in", Some("bob"), None, "confused"),
        ];

        let redeem = trigger("channel_point_redeem", Some("carol"), Some("Hydrate"));
        assert_eq!(resolve(&bindings, &redeem).len(), 1);

        let other_redeem = trigger("channel_point_redeem", Some("carol"), Some("Stretch"));
        assert_eq!(resolve(&bindings, &other_redeem).len(), 0);

        let raid_without_source = trigger("raid_in", None, None);
        assert_eq!(resolve(&bindings, &raid_without_source).len(), 0);
    }

    #[test]
    fn all_matching_bindings_fire_in_order() {
        let bindings = vec![
            binding("sub", None, None, "laugh"),
            binding("follow", None, None, "shy"),
            binding("sub", None, None, "sad"),
        ];
        let states: Vec<_> = resolve(&bindings, &trigger("sub", None, None))
            .into_iter()
            .map(|s| s.state.as_str())
            .collect();
        assert_eq!(states, vec!["laugh", "sad"]);
    }

    #[test]
    fn knows_supported_triggers() {
        assert!(is_supported_trigger("hype_train_start"));
        assert!(!is_supported_trigger("bits"));
    }
}
