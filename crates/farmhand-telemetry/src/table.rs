//! Subscription bookkeeping shared between the bridge API and the MQTT
//! event loop.
//!
//! All three maps move together under one lock. Methods mutate the table
//! only; the physical broker calls they imply are returned as a
//! [`TopicChange`] for the caller to perform after the lock is released.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::fieldpath;
use crate::plug::{PlugSnapshot, PlugState, PlugSubscription};

/// Broker operations implied by a table change.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct TopicChange {
    /// Topic that gained its first referencing plug.
    pub subscribe: Option<String>,
    /// Topic that lost its last referencing plug.
    pub unsubscribe: Option<String>,
}

impl TopicChange {
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_none() && self.unsubscribe.is_none()
    }
}

/// Subscriptions, topic fan-out, and latest readings for every plug.
#[derive(Debug, Default)]
pub(crate) struct PlugTable {
    configs: HashMap<i64, PlugSubscription>,
    topics: HashMap<String, Vec<i64>>,
    data: HashMap<i64, PlugSnapshot>,
}

impl PlugTable {
    /// Records or replaces a plug's subscription.
    ///
    /// A plug moving to a new topic releases its old membership.
    pub fn subscribe(&mut self, plug_id: i64, sub: PlugSubscription) -> TopicChange {
        let mut change = TopicChange::default();

        let previous_topic = self.configs.get(&plug_id).map(|c| c.topic.clone());
        if let Some(previous) = previous_topic {
            if previous != sub.topic {
                change.unsubscribe = self.release(plug_id, &previous);
            }
        }

        let ids = self.topics.entry(sub.topic.clone()).or_default();
        if ids.is_empty() {
            change.subscribe = Some(sub.topic.clone());
        }
        if !ids.contains(&plug_id) {
            ids.push(plug_id);
        }
        self.data
            .entry(plug_id)
            .or_insert_with(|| PlugSnapshot::new(plug_id));
        self.configs.insert(plug_id, sub);
        change
    }

    /// Removes a plug, its configuration and its readings.
    ///
    /// Returns the topic to physically unsubscribe when this plug was its
    /// last reference. Unknown ids are a no-op.
    pub fn unsubscribe(&mut self, plug_id: i64) -> Option<String> {
        let config = self.configs.remove(&plug_id)?;
        self.data.remove(&plug_id);
        self.release(plug_id, &config.topic)
    }

    /// Drops `plug_id` from a topic's membership; returns the topic when
    /// the last reference went away.
    fn release(&mut self, plug_id: i64, topic: &str) -> Option<String> {
        let ids = self.topics.get_mut(topic)?;
        ids.retain(|id| *id != plug_id);
        if ids.is_empty() {
            self.topics.remove(topic);
            Some(topic.to_string())
        } else {
            None
        }
    }

    /// Applies a parsed payload to every plug subscribed to `topic`.
    ///
    /// Extracted fields overwrite, missing ones keep their prior values,
    /// and `last_seen` advances for every plug on the topic either way.
    /// Returns how many plugs were touched.
    pub fn apply(&mut self, topic: &str, payload: &Value, now: DateTime<Utc>) -> usize {
        let ids = match self.topics.get(topic) {
            Some(ids) => ids.clone(),
            None => return 0,
        };

        let mut touched = 0;
        for plug_id in ids {
            let config = match self.configs.get(&plug_id) {
                Some(config) => config,
                None => continue,
            };

            let power = config
                .power_path
                .as_deref()
                .and_then(|path| fieldpath::lookup(payload, path))
                .and_then(fieldpath::numeric)
                .map(|value| value * config.multiplier);
            let energy = config
                .energy_path
                .as_deref()
                .and_then(|path| fieldpath::lookup(payload, path))
                .and_then(fieldpath::numeric)
                .map(|value| value * config.multiplier);
            let state = config
                .state_path
                .as_deref()
                .and_then(|path| fieldpath::lookup(payload, path))
                .and_then(|value| fieldpath::text(value))
                .map(|raw| PlugState::parse(&raw));

            let snapshot = self
                .data
                .entry(plug_id)
                .or_insert_with(|| PlugSnapshot::new(plug_id));
            if power.is_some() {
                snapshot.power = power;
            }
            if energy.is_some() {
                snapshot.energy = energy;
            }
            if state.is_some() {
                snapshot.state = state;
            }
            snapshot.last_seen = now;
            touched += 1;
        }
        touched
    }

    /// Latest readings for one plug.
    pub fn snapshot(&self, plug_id: i64) -> Option<PlugSnapshot> {
        self.data.get(&plug_id).cloned()
    }

    /// Whether the plug's `last_seen` falls within `window`.
    pub fn is_reachable(&self, plug_id: i64, window: Duration) -> bool {
        let snapshot = match self.data.get(&plug_id) {
            Some(snapshot) => snapshot,
            None => return false,
        };
        let window = match chrono::Duration::from_std(window) {
            Ok(window) => window,
            // A window too large for the calendar never expires.
            Err(_) => return true,
        };
        Utc::now() - snapshot.last_seen < window
    }

    /// Every topic currently referenced by at least one plug.
    pub fn topics(&self) -> Vec<String> {
        self.topics.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topic_reference_counting() {
        let mut table = PlugTable::default();

        let first = table.subscribe(1, PlugSubscription::new("shed/power"));
        assert_eq!(first.subscribe.as_deref(), Some("shed/power"));

        // Second plug on the same topic: already subscribed physically.
        let second = table.subscribe(2, PlugSubscription::new("shed/power"));
        assert!(second.is_empty());

        assert!(table.unsubscribe(1).is_none());
        assert_eq!(table.unsubscribe(2).as_deref(), Some("shed/power"));

        // Unknown id is a no-op.
        assert!(table.unsubscribe(2).is_none());
        assert!(table.topics().is_empty());
    }

    #[test]
    fn test_resubscribing_same_plug_is_safe() {
        let mut table = PlugTable::default();
        table.subscribe(1, PlugSubscription::new("plug/1").with_power_path("p"));

        let change = table.subscribe(1, PlugSubscription::new("plug/1").with_power_path("q"));
        assert!(change.is_empty());
        assert_eq!(table.topics().len(), 1);
    }

    #[test]
    fn test_moving_a_plug_between_topics() {
        let mut table = PlugTable::default();
        table.subscribe(5, PlugSubscription::new("old/topic"));

        let change = table.subscribe(5, PlugSubscription::new("new/topic"));
        assert_eq!(change.unsubscribe.as_deref(), Some("old/topic"));
        assert_eq!(change.subscribe.as_deref(), Some("new/topic"));
        assert_eq!(table.topics(), vec!["new/topic".to_string()]);
    }

    #[test]
    fn test_power_scaled_by_multiplier() {
        let mut table = PlugTable::default();
        table.subscribe(
            7,
            PlugSubscription::new("plug/7")
                .with_power_path("power")
                .with_multiplier(10.0),
        );

        let later = Utc::now() + chrono::Duration::milliseconds(5);
        let touched = table.apply("plug/7", &json!({"power": 2.5}), later);
        assert_eq!(touched, 1);

        let snapshot = table.snapshot(7).unwrap();
        assert_eq!(snapshot.power, Some(25.0));
        assert!(snapshot.energy.is_none());
        assert!(snapshot.state.is_none());
        assert_eq!(snapshot.last_seen, later);
    }

    #[test]
    fn test_fan_out_to_all_plugs_on_topic() {
        let mut table = PlugTable::default();
        table.subscribe(1, PlugSubscription::new("shared").with_power_path("p"));
        table.subscribe(2, PlugSubscription::new("shared").with_power_path("missing"));

        let touched = table.apply("shared", &json!({"p": 3.0}), Utc::now());
        assert_eq!(touched, 2);
        assert_eq!(table.snapshot(1).unwrap().power, Some(3.0));

        // Path missed: field untouched, last_seen still advanced.
        assert!(table.snapshot(2).unwrap().power.is_none());
    }

    #[test]
    fn test_partial_updates_keep_prior_fields() {
        let mut table = PlugTable::default();
        table.subscribe(
            3,
            PlugSubscription::new("plug/3")
                .with_power_path("power")
                .with_energy_path("energy")
                .with_state_path("state"),
        );

        table.apply("plug/3", &json!({"power": 11.0, "state": "on"}), Utc::now());
        table.apply("plug/3", &json!({"energy": 1.25}), Utc::now());
        table.apply(
            "plug/3",
            &json!({"power": "garbage", "state": "standby"}),
            Utc::now(),
        );

        let snapshot = table.snapshot(3).unwrap();
        assert_eq!(snapshot.power, Some(11.0));
        assert_eq!(snapshot.energy, Some(1.25));
        assert_eq!(snapshot.state, Some(PlugState::Other("STANDBY".into())));
    }

    #[test]
    fn test_last_seen_advances_without_matches() {
        let mut table = PlugTable::default();
        table.subscribe(8, PlugSubscription::new("plug/8").with_power_path("power"));

        let later = Utc::now() + chrono::Duration::seconds(1);
        table.apply("plug/8", &json!({"unrelated": true}), later);
        assert_eq!(table.snapshot(8).unwrap().last_seen, later);
    }

    #[test]
    fn test_unknown_topic_is_ignored() {
        let mut table = PlugTable::default();
        assert_eq!(table.apply("nobody/home", &json!({"power": 1.0}), Utc::now()), 0);
    }

    #[test]
    fn test_reachability_window() {
        let mut table = PlugTable::default();
        table.subscribe(4, PlugSubscription::new("plug/4"));

        // Fresh subscription counts as seen.
        assert!(table.is_reachable(4, Duration::from_secs(300)));

        table.data.get_mut(&4).unwrap().last_seen = Utc::now() - chrono::Duration::minutes(6);
        assert!(!table.is_reachable(4, Duration::from_secs(300)));
        assert!(table.is_reachable(4, Duration::from_secs(3600)));

        assert!(!table.is_reachable(99, Duration::from_secs(300)));
    }
}
