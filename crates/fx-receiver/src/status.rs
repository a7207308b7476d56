//! Per-connection effect-status diff filter.
//!
//! The peer only needs to hear about visibility/selectability *changes*;
//! re-broadcasting the state it already knows is chatter. Each connection
//! tracks which (effect, idType) pairs it has told the peer are not visible
//! or not selectable, and outbound EFFECT_STATUS packets are reduced to the
//! ids whose membership actually changes. A packet left with no ids is
//! suppressed entirely.

use fx_protocol::{IdType, PacketType, Response, ResultType};
use std::collections::{BTreeSet, HashSet};

#[derive(Debug, Default)]
pub(crate) struct StatusFilter {
    not_visible: HashSet<(String, IdType)>,
    not_selectable: HashSet<(String, IdType)>,
}

impl StatusFilter {
    /// Reduce an outbound EFFECT_STATUS packet to the ids whose state
    /// changes. Returns `None` when every id is dropped. Non-status packets
    /// pass through untouched.
    pub(crate) fn apply(&mut self, response: &Response) -> Option<Response> {
        if response.packet != PacketType::EffectStatus {
            return Some(response.clone());
        }
        let result = response.result?;
        let id_type = response.id_type.unwrap_or(IdType::Effect);

        // A single-effect packet is a one-element id set.
        let keys: Vec<&str> = match (&response.ids, &response.effect) {
            (Some(ids), _) => ids.iter().map(String::as_str).collect(),
            (None, Some(effect)) => vec![effect.as_str()],
            (None, None) => return None,
        };

        let kept: BTreeSet<String> = keys
            .into_iter()
            .filter(|key| self.changes(result, (key.to_string(), id_type)))
            .map(str::to_owned)
            .collect();
        if kept.is_empty() {
            return None;
        }

        let mut reduced = response.clone();
        if reduced.ids.is_some() {
            reduced.ids = Some(kept);
        }
        Some(reduced)
    }

    /// Record the transition and report whether the peer's view changes.
    fn changes(&mut self, result: ResultType, key: (String, IdType)) -> bool {
        match result {
            ResultType::Visible => self.not_visible.remove(&key),
            ResultType::NotVisible => self.not_visible.insert(key),
            ResultType::Selectable => self.not_selectable.remove(&key),
            ResultType::NotSelectable => self.not_selectable.insert(key),
            // Only status results reach here; anything else passes through.
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(result: ResultType, ids: &[&str]) -> Response {
        Response::builder(PacketType::EffectStatus)
            .result(result)
            .ids(ids.iter().copied())
            .id_type(IdType::Effect)
            .build()
            .unwrap()
    }

    fn kept_ids(response: &Response) -> Vec<String> {
        response.ids.as_ref().unwrap().iter().cloned().collect()
    }

    #[test]
    fn first_not_visible_passes_then_repeats_are_suppressed() {
        let mut filter = StatusFilter::default();
        let packet = status(ResultType::NotVisible, &["kill"]);
        assert!(filter.apply(&packet).is_some());
        assert!(filter.apply(&packet).is_none(), "no-op transition must be suppressed");
    }

    #[test]
    fn visible_only_passes_for_effects_marked_not_visible() {
        let mut filter = StatusFilter::default();
        // Peer already assumes visible.
        assert!(filter.apply(&status(ResultType::Visible, &["kill"])).is_none());

        filter.apply(&status(ResultType::NotVisible, &["kill"])).unwrap();
        let restored = filter.apply(&status(ResultType::Visible, &["kill"])).unwrap();
        assert_eq!(kept_ids(&restored), vec!["kill"]);
        // And the cycle can repeat.
        assert!(filter.apply(&status(ResultType::Visible, &["kill"])).is_none());
    }

    #[test]
    fn unchanged_ids_are_dropped_from_mixed_sets() {
        let mut filter = StatusFilter::default();
        filter.apply(&status(ResultType::NotVisible, &["a"])).unwrap();

        let mixed = filter
            .apply(&status(ResultType::NotVisible, &["a", "b"]))
            .unwrap();
        assert_eq!(kept_ids(&mixed), vec!["b"], "only the new transition survives");
    }

    #[test]
    fn visibility_and_selectability_are_tracked_separately() {
        let mut filter = StatusFilter::default();
        filter.apply(&status(ResultType::NotVisible, &["a"])).unwrap();
        // Selectability of `a` is untouched by the visibility set.
        assert!(filter.apply(&status(ResultType::NotSelectable, &["a"])).is_some());
        assert!(filter.apply(&status(ResultType::Selectable, &["a"])).is_some());
        assert!(filter.apply(&status(ResultType::Selectable, &["a"])).is_none());
    }

    #[test]
    fn single_effect_packets_use_the_same_state() {
        let mut filter = StatusFilter::default();
        let single = Response::builder(PacketType::EffectStatus)
            .result(ResultType::NotVisible)
            .effect("kill")
            .build()
            .unwrap();
        assert!(filter.apply(&single).is_some());
        // The id-set form sees the same recorded state.
        assert!(filter.apply(&status(ResultType::NotVisible, &["kill"])).is_none());
    }

    #[test]
    fn non_status_packets_pass_through() {
        let mut filter = StatusFilter::default();
        let keep_alive = Response::keep_alive();
        assert_eq!(filter.apply(&keep_alive), Some(keep_alive));
    }
}
