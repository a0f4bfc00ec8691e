//! Presence transition function.
//!
//! Pure: takes the current record (if any) and one admitted read, returns the
//! record to write or the reason the read changed nothing. Locking, storage
//! and change detection live in the engine.

use serde::Serialize;

use crate::types::{
    ReadHint, ReadPolicy, SensorPersonality, Tag, TagEvent, TagRead, TagState,
};

/// Per-read inputs that come from reference data rather than the read itself.
#[derive(Debug, Clone, Copy)]
pub struct ReadContext<'a> {
    pub personality: SensorPersonality,
    pub policy: &'a ReadPolicy,
    /// Sensor-level replacement for the qualifying threshold
    pub min_rssi_override: Option<i32>,
    pub history_limit: usize,
}

impl ReadContext<'_> {
    fn arrival_threshold(&self) -> i32 {
        self.min_rssi_override.unwrap_or(self.policy.arrival_min_rssi)
    }

    fn exit_threshold(&self) -> i32 {
        self.min_rssi_override.unwrap_or(self.policy.exit_min_rssi)
    }
}

/// Why a read left the record untouched.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Skip {
    /// Not newer than the tag's last read
    Stale,
    /// Below the qualifying threshold with nothing to refresh
    Weak,
    /// Tag already departed and this read may not revive it
    Departed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Write(Tag),
    Skip(Skip),
}

/// Apply one read to the current record.
pub fn apply_read(current: Option<&Tag>, read: &TagRead, ctx: &ReadContext<'_>) -> Transition {
    if let Some(tag) = current {
        if read.timestamp <= tag.last_read {
            return Transition::Skip(Skip::Stale);
        }
    }

    if read.hint == ReadHint::Arrival {
        return Transition::Write(settle_present(current, read, ctx));
    }

    match ctx.personality {
        SensorPersonality::None => floor_read(current, read, ctx),
        SensorPersonality::Exit => exit_read(current, read, ctx),
        SensorPersonality::Pos => pos_read(current, read, ctx),
    }
}

/// Force a silent tag out. `None` when the tag is not on the premises or
/// has not been silent for strictly longer than `age_out_ms`.
pub fn age_out(tag: &Tag, now: i64, age_out_ms: i64) -> Option<Tag> {
    match tag.state {
        TagState::Present | TagState::Exiting if tag.silent_for(now) > age_out_ms => {
            let mut departed = tag.clone();
            depart(&mut departed, TagState::DepartedExit, now);
            Some(departed)
        }
        TagState::Unknown
        | TagState::Present
        | TagState::Exiting
        | TagState::DepartedExit
        | TagState::DepartedPos => None,
    }
}

// ============================================================================
// Per-personality rules
// ============================================================================

fn floor_read(current: Option<&Tag>, read: &TagRead, ctx: &ReadContext<'_>) -> Transition {
    let qualifying = read.rssi >= ctx.arrival_threshold();
    let state = current.map_or(TagState::Unknown, |t| t.state);

    match (state, qualifying) {
        (_, true) => Transition::Write(settle_present(current, read, ctx)),
        (TagState::Present | TagState::Exiting, false) => refresh(current, read),
        (TagState::Unknown, false) => Transition::Skip(Skip::Weak),
        (TagState::DepartedExit | TagState::DepartedPos, false) => {
            Transition::Skip(Skip::Departed)
        }
    }
}

fn exit_read(current: Option<&Tag>, read: &TagRead, ctx: &ReadContext<'_>) -> Transition {
    let state = current.map_or(TagState::Unknown, |t| t.state);
    let qualifying = read.rssi >= ctx.exit_threshold();

    match (state, current) {
        // First sighting at the portal: the tag is here, not leaving
        (TagState::Unknown, _) => {
            if read.rssi >= ctx.arrival_threshold() {
                Transition::Write(settle_present(current, read, ctx))
            } else {
                Transition::Skip(Skip::Weak)
            }
        }
        (TagState::Present, Some(tag)) => {
            if !qualifying {
                return refresh(current, read);
            }
            let mut next = tag.clone();
            next.mark_seen(read, ctx.history_limit);
            next.state = TagState::Exiting;
            next.event = TagEvent::Moved;
            next.exit_reads = 1;
            next.last_exit_read = Some(read.timestamp);
            Transition::Write(next)
        }
        (TagState::Exiting, Some(tag)) => {
            if !qualifying {
                return refresh(current, read);
            }
            let in_window = tag
                .last_exit_read
                .is_some_and(|prev| read.timestamp - prev <= ctx.policy.exit_confirm_window_ms);
            let mut next = tag.clone();
            next.mark_seen(read, ctx.history_limit);
            next.exit_reads = if in_window { tag.exit_reads + 1 } else { 1 };
            next.last_exit_read = Some(read.timestamp);
            if next.exit_reads >= ctx.policy.exit_confirm_reads {
                depart(&mut next, TagState::DepartedExit, read.timestamp);
            } else {
                next.event = TagEvent::CycleCount;
            }
            Transition::Write(next)
        }
        (TagState::DepartedExit | TagState::DepartedPos, _) => Transition::Skip(Skip::Departed),
        // A non-Unknown state always comes with a record
        (TagState::Present | TagState::Exiting, None) => Transition::Skip(Skip::Weak),
    }
}

fn pos_read(current: Option<&Tag>, read: &TagRead, ctx: &ReadContext<'_>) -> Transition {
    let qualifying = read.rssi >= ctx.arrival_threshold();
    let state = current.map_or(TagState::Unknown, |t| t.state);

    match (state, current, qualifying) {
        (TagState::Unknown, _, true) => Transition::Write(settle_present(current, read, ctx)),
        (TagState::Unknown, _, false) => Transition::Skip(Skip::Weak),
        (TagState::Present | TagState::Exiting, Some(tag), true) => {
            let mut next = tag.clone();
            next.mark_seen(read, ctx.history_limit);
            depart(&mut next, TagState::DepartedPos, read.timestamp);
            Transition::Write(next)
        }
        (TagState::Present | TagState::Exiting, _, false) => refresh(current, read),
        (TagState::DepartedExit | TagState::DepartedPos, _, _) => Transition::Skip(Skip::Departed),
        (TagState::Present | TagState::Exiting, None, true) => Transition::Skip(Skip::Weak),
    }
}

// ============================================================================
// Shared steps
// ============================================================================

/// Move (or keep) the tag in `Present` at the read's location.
fn settle_present(current: Option<&Tag>, read: &TagRead, ctx: &ReadContext<'_>) -> Tag {
    let mut tag = current.cloned().unwrap_or_else(|| Tag::first_sighting(read));
    let moved = tag.mark_seen(read, ctx.history_limit);

    // Exiting never left the premises, so coming back is not an arrival
    tag.event = match (tag.state, moved) {
        (TagState::Present | TagState::Exiting, true) => TagEvent::Moved,
        (TagState::Present | TagState::Exiting, false) => TagEvent::CycleCount,
        (TagState::Unknown | TagState::DepartedExit | TagState::DepartedPos, _) => {
            TagEvent::Arrival
        }
    };
    tag.state = TagState::Present;
    tag.departed_at = None;
    tag.reset_exit_sequence();
    tag
}

/// Weak read on a tag that is on the premises: keep it alive, change nothing else.
fn refresh(current: Option<&Tag>, read: &TagRead) -> Transition {
    match current {
        Some(tag) => {
            let mut next = tag.clone();
            next.touch(read);
            Transition::Write(next)
        }
        None => Transition::Skip(Skip::Weak),
    }
}

fn depart(tag: &mut Tag, state: TagState, at: i64) {
    tag.state = state;
    tag.event = TagEvent::Departed;
    tag.departed_at = Some(at);
    tag.reset_exit_sequence();
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: ReadPolicy = ReadPolicy {
        arrival_min_rssi: -80,
        weak_read_rssi: -70,
        exit_min_rssi: -60,
        exit_confirm_reads: 3,
        exit_confirm_window_ms: 30_000,
    };

    const STRONG: i32 = -50;
    const WEAK: i32 = -85;

    fn ctx(personality: SensorPersonality) -> ReadContext<'static> {
        ReadContext {
            personality,
            policy: &POLICY,
            min_rssi_override: None,
            history_limit: 5,
        }
    }

    fn read(device: &str, rssi: i32, ts: i64) -> TagRead {
        TagRead::new("3034AA", rssi, ts, device, "F1")
    }

    fn tag_in(state: TagState, last_read: i64) -> Tag {
        let mut tag = Tag::first_sighting(&read("floor-1", STRONG, last_read));
        tag.mark_seen(&read("floor-1", STRONG, last_read), 5);
        tag.state = state;
        tag
    }

    fn written(t: Transition) -> Tag {
        match t {
            Transition::Write(tag) => tag,
            Transition::Skip(s) => panic!("expected a write, got {s:?}"),
        }
    }

    /// Outcome state of one read for every (state, personality, strength).
    /// `None` means the read is skipped.
    fn expected(state: TagState, personality: SensorPersonality, strong: bool) -> Option<TagState> {
        use SensorPersonality as P;
        use TagState as S;
        match (personality, state, strong) {
            (P::None, _, true) => Some(S::Present),
            (P::None, S::Present | S::Exiting, false) => Some(state),
            (P::None, S::Unknown | S::DepartedExit | S::DepartedPos, false) => None,

            (P::Exit, S::Unknown, true) => Some(S::Present),
            (P::Exit, S::Unknown, false) => None,
            (P::Exit, S::Present, true) => Some(S::Exiting),
            // First read of a fresh sequence: count restarts at 1
            (P::Exit, S::Exiting, true) => Some(S::Exiting),
            (P::Exit, S::Present | S::Exiting, false) => Some(state),
            (P::Exit, S::DepartedExit | S::DepartedPos, _) => None,

            (P::Pos, S::Unknown, true) => Some(S::Present),
            (P::Pos, S::Unknown, false) => None,
            (P::Pos, S::Present | S::Exiting, true) => Some(S::DepartedPos),
            (P::Pos, S::Present | S::Exiting, false) => Some(state),
            (P::Pos, S::DepartedExit | S::DepartedPos, _) => None,
        }
    }

    #[test]
    fn test_transition_table() {
        for personality in [SensorPersonality::None, SensorPersonality::Exit, SensorPersonality::Pos] {
            for state in TagState::ALL {
                for strong in [true, false] {
                    let current = (state != TagState::Unknown).then(|| tag_in(state, 1_000));
                    let r = read("sensor-x", if strong { STRONG } else { WEAK }, 100_000);
                    let got = match apply_read(current.as_ref(), &r, &ctx(personality)) {
                        Transition::Write(tag) => Some(tag.state),
                        Transition::Skip(_) => None,
                    };
                    assert_eq!(
                        got,
                        expected(state, personality, strong),
                        "{personality} / {state} / strong={strong}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_arrival_hint_overrides_everything() {
        for state in TagState::ALL {
            let current = (state != TagState::Unknown).then(|| tag_in(state, 1_000));
            let mut r = read("handheld-1", WEAK, 2_000);
            r.hint = ReadHint::Arrival;
            let tag = written(apply_read(current.as_ref(), &r, &ctx(SensorPersonality::Exit)));
            assert_eq!(tag.state, TagState::Present, "from {state}");
            assert_eq!(tag.location, "handheld-1");
            assert_eq!(tag.departed_at, None);
        }
    }

    #[test]
    fn test_stale_read_skipped() {
        let tag = tag_in(TagState::Present, 5_000);
        for ts in [4_000, 5_000] {
            assert_eq!(
                apply_read(Some(&tag), &read("floor-2", STRONG, ts), &ctx(SensorPersonality::None)),
                Transition::Skip(Skip::Stale)
            );
        }
    }

    #[test]
    fn test_exit_sequence_confirms_on_third_read() {
        let exit = ctx(SensorPersonality::Exit);
        let mut tag = tag_in(TagState::Present, 1_000);

        tag = written(apply_read(Some(&tag), &read("exit-1", STRONG, 2_000), &exit));
        assert_eq!((tag.state, tag.exit_reads), (TagState::Exiting, 1));
        tag = written(apply_read(Some(&tag), &read("exit-1", STRONG, 3_000), &exit));
        assert_eq!((tag.state, tag.exit_reads), (TagState::Exiting, 2));
        tag = written(apply_read(Some(&tag), &read("exit-1", STRONG, 4_000), &exit));
        assert_eq!(tag.state, TagState::DepartedExit);
        assert_eq!(tag.event, TagEvent::Departed);
        assert_eq!(tag.departed_at, Some(4_000));
    }

    #[test]
    fn test_exit_gap_restarts_sequence() {
        let exit = ctx(SensorPersonality::Exit);
        let mut tag = tag_in(TagState::Present, 1_000);
        tag = written(apply_read(Some(&tag), &read("exit-1", STRONG, 2_000), &exit));
        tag = written(apply_read(Some(&tag), &read("exit-1", STRONG, 3_000), &exit));
        // Gap longer than the window
        tag = written(apply_read(Some(&tag), &read("exit-1", STRONG, 40_000), &exit));
        assert_eq!((tag.state, tag.exit_reads), (TagState::Exiting, 1));
    }

    #[test]
    fn test_weak_exit_read_does_not_advance() {
        let exit = ctx(SensorPersonality::Exit);
        let mut tag = tag_in(TagState::Present, 1_000);
        tag = written(apply_read(Some(&tag), &read("exit-1", STRONG, 2_000), &exit));
        // -70 clears arrival but not the exit threshold
        tag = written(apply_read(Some(&tag), &read("exit-1", -70, 3_000), &exit));
        assert_eq!((tag.state, tag.exit_reads), (TagState::Exiting, 1));
        assert_eq!(tag.last_read, 3_000);
    }

    #[test]
    fn test_floor_read_cancels_exit_sequence() {
        let mut tag = tag_in(TagState::Present, 1_000);
        tag = written(apply_read(Some(&tag), &read("exit-1", STRONG, 2_000), &ctx(SensorPersonality::Exit)));
        tag = written(apply_read(Some(&tag), &read("floor-1", STRONG, 3_000), &ctx(SensorPersonality::None)));
        assert_eq!(tag.state, TagState::Present);
        assert_eq!(tag.exit_reads, 0);
        assert_eq!(tag.last_exit_read, None);
    }

    #[test]
    fn test_sensor_override_threshold() {
        let mut strict = ctx(SensorPersonality::None);
        strict.min_rssi_override = Some(-40);
        assert_eq!(
            apply_read(None, &read("floor-1", STRONG, 1_000), &strict),
            Transition::Skip(Skip::Weak)
        );
    }

    #[test]
    fn test_event_classification() {
        let floor = ctx(SensorPersonality::None);
        let tag = written(apply_read(None, &read("floor-1", STRONG, 1_000), &floor));
        assert_eq!(tag.event, TagEvent::Arrival);
        let tag = written(apply_read(Some(&tag), &read("floor-1", STRONG, 2_000), &floor));
        assert_eq!(tag.event, TagEvent::CycleCount);
        let tag = written(apply_read(Some(&tag), &read("floor-2", STRONG, 3_000), &floor));
        assert_eq!(tag.event, TagEvent::Moved);
        assert_eq!(tag.location_history.len(), 2);

        let mut gone = tag.clone();
        gone.state = TagState::DepartedExit;
        let back = written(apply_read(Some(&gone), &read("floor-2", STRONG, 4_000), &floor));
        assert_eq!(back.event, TagEvent::Arrival);
    }

    #[test]
    fn test_age_out_is_strict() {
        let tag = tag_in(TagState::Present, 1_000);
        assert!(age_out(&tag, 1_000 + 60_000, 60_000).is_none());
        let departed = age_out(&tag, 1_000 + 60_001, 60_000).unwrap();
        assert_eq!(departed.state, TagState::DepartedExit);
        assert_eq!(departed.event, TagEvent::Departed);

        for state in [TagState::Unknown, TagState::DepartedExit, TagState::DepartedPos] {
            assert!(age_out(&tag_in(state, 1_000), i64::MAX, 60_000).is_none());
        }
    }
}
