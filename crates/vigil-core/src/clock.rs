//! The per-root logical clock and the clockspec protocol.
//!
//! Every observed change bumps a per-root `ticks` counter. Clients name a
//! point in time with a *clockspec*: a unix timestamp, a named cursor
//! (`n:foo`), or a clock string (`c:<start_time>:<pid>:<root_number>:<ticks>`)
//! previously returned by us. The `(start_time, pid, root_number)` triple
//! pins a clock string to one incarnation of one root in one daemon process;
//! anything else resolves as a *fresh instance* — the caller's prior view
//! cannot be trusted and a full snapshot is in order.

use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};

use once_cell::sync::Lazy;
use serde_json::Value;

/// Identity of this daemon process, captured once. Clock strings minted with
/// a different identity belong to a previous (or foreign) daemon.
pub struct ProcessIdentity {
    pub pid: u32,
    pub start_time: u64,
}

static IDENTITY: Lazy<ProcessIdentity> = Lazy::new(|| ProcessIdentity {
    pid: std::process::id(),
    start_time: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0),
});

pub fn process_identity() -> &'static ProcessIdentity {
    &IDENTITY
}

/// A logical observation stamp on a file node: the tick at which the change
/// was observed and the wall-clock second it happened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClockStamp {
    pub ticks: u32,
    pub timestamp: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockValue {
    pub start_time: u64,
    pub pid: u32,
    pub root_number: u32,
    pub ticks: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ClockSpec {
    Timestamp(i64),
    NamedCursor(String),
    Clock(ClockValue),
}

impl ClockSpec {
    /// A clock value naming the current process incarnation.
    pub fn new_clock(root_number: u32, ticks: u32) -> Self {
        let id = process_identity();
        ClockSpec::Clock(ClockValue {
            start_time: id.start_time,
            pid: id.pid,
            root_number,
            ticks,
        })
    }

    pub fn parse(value: &Value) -> Option<Self> {
        if let Some(ts) = value.as_i64() {
            return Some(ClockSpec::Timestamp(ts));
        }
        value.as_str().and_then(Self::parse_str)
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        if let Some(name) = s.strip_prefix("n:") {
            if name.is_empty() {
                return None;
            }
            return Some(ClockSpec::NamedCursor(name.to_string()));
        }

        let rest = s.strip_prefix("c:")?;
        let fields: Vec<&str> = rest.split(':').collect();
        match fields.as_slice() {
            [start_time, pid, root_number, ticks] => Some(ClockSpec::Clock(ClockValue {
                start_time: start_time.parse().ok()?,
                pid: pid.parse().ok()?,
                root_number: root_number.parse().ok()?,
                ticks: ticks.parse().ok()?,
            })),
            // Old-style two field clock. Zero start_time and root_number
            // guarantee it is treated as a fresh instance.
            [pid, ticks] => Some(ClockSpec::Clock(ClockValue {
                start_time: 0,
                pid: pid.parse().ok()?,
                root_number: 0,
                ticks: ticks.parse().ok()?,
            })),
            _ => None,
        }
    }
}

/// Render a clock string for this process.
pub fn clock_id_string(root_number: u32, ticks: u32) -> String {
    let id = process_identity();
    format!("c:{}:{}:{}:{}", id.start_time, id.pid, root_number, ticks)
}

/// The resolved meaning of a clockspec for one query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuerySince {
    Timestamp(i64),
    Clock { is_fresh_instance: bool, ticks: u32 },
}

impl QuerySince {
    pub fn fresh() -> Self {
        QuerySince::Clock {
            is_fresh_instance: true,
            ticks: 0,
        }
    }

    pub fn is_fresh_instance(&self) -> bool {
        matches!(
            self,
            QuerySince::Clock {
                is_fresh_instance: true,
                ..
            }
        )
    }
}

/// The mutable clock state of one root: the tick counter, the incarnation
/// number, and the named cursor map.
#[derive(Debug)]
pub struct RootClock {
    pub root_number: u32,
    pub ticks: u32,
    cursors: HashMap<String, u32>,
}

impl RootClock {
    pub fn new(root_number: u32) -> Self {
        Self {
            root_number,
            ticks: 0,
            cursors: HashMap::new(),
        }
    }

    pub fn current_clock_string(&self) -> String {
        clock_id_string(self.root_number, self.ticks)
    }

    /// Resolve a clockspec without disturbing clock state.
    pub fn eval_readonly(
        &self,
        spec: Option<&ClockSpec>,
        last_age_out_tick: u32,
    ) -> QuerySince {
        match spec {
            None => QuerySince::fresh(),
            Some(ClockSpec::Timestamp(ts)) => QuerySince::Timestamp(*ts),
            Some(ClockSpec::NamedCursor(name)) => match self.cursors.get(name) {
                None => QuerySince::fresh(),
                Some(&ticks) => QuerySince::Clock {
                    is_fresh_instance: ticks < last_age_out_tick,
                    ticks,
                },
            },
            Some(ClockSpec::Clock(value)) => self.eval_clock_value(value, last_age_out_tick),
        }
    }

    /// Resolve a clockspec, recording cursor movement. Repeat queries with
    /// no intervening filesystem change must produce an empty second
    /// response, so a cursor is advanced to a brand new tick on every
    /// resolve, and a clock equal to the current tick forces a tick bump.
    pub fn eval(&mut self, spec: Option<&ClockSpec>, last_age_out_tick: u32) -> QuerySince {
        match spec {
            None => QuerySince::fresh(),
            Some(ClockSpec::Timestamp(ts)) => QuerySince::Timestamp(*ts),
            Some(ClockSpec::NamedCursor(name)) => {
                let since = match self.cursors.get(name) {
                    None => QuerySince::fresh(),
                    Some(&ticks) => QuerySince::Clock {
                        is_fresh_instance: ticks < last_age_out_tick,
                        ticks,
                    },
                };
                self.ticks += 1;
                self.cursors.insert(name.clone(), self.ticks);
                tracing::debug!(cursor = %name, ?since, "resolved cursor");
                since
            }
            Some(ClockSpec::Clock(value)) => {
                let since = self.eval_clock_value(value, last_age_out_tick);
                if let QuerySince::Clock {
                    is_fresh_instance: false,
                    ticks,
                } = since
                {
                    if ticks == self.ticks {
                        self.ticks += 1;
                    }
                }
                since
            }
        }
    }

    fn eval_clock_value(&self, value: &ClockValue, last_age_out_tick: u32) -> QuerySince {
        resolve_clock_value(value, self.root_number, last_age_out_tick)
    }
}

/// Resolve a clock value against a root incarnation. Shared between full
/// clockspec resolution and per-file `since` expression terms.
pub(crate) fn resolve_clock_value(
    value: &ClockValue,
    root_number: u32,
    last_age_out_tick: u32,
) -> QuerySince {
    let id = process_identity();
    if value.start_time == id.start_time && value.pid == id.pid && value.root_number == root_number
    {
        if value.ticks < last_age_out_tick {
            // A response would have had to include nodes that have since
            // been aged out. We no longer have them, so we cannot answer
            // incrementally.
            QuerySince::fresh()
        } else {
            QuerySince::Clock {
                is_fresh_instance: false,
                ticks: value.ticks,
            }
        }
    } else {
        // A different incarnation of the daemon or of this root; the
        // caller has never spoken to us.
        QuerySince::fresh()
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::{clock_id_string, ClockSpec, ClockValue, QuerySince, RootClock};

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(
            ClockSpec::parse(&json!(12345)),
            Some(ClockSpec::Timestamp(12345))
        );
    }

    #[test]
    fn test_parse_cursor() {
        assert_eq!(
            ClockSpec::parse_str("n:mycursor"),
            Some(ClockSpec::NamedCursor("mycursor".to_string()))
        );
        assert_eq!(ClockSpec::parse_str("n:"), None);
    }

    #[test]
    fn test_parse_clock_string() {
        assert_eq!(
            ClockSpec::parse_str("c:123456:42:7:99"),
            Some(ClockSpec::Clock(ClockValue {
                start_time: 123_456,
                pid: 42,
                root_number: 7,
                ticks: 99,
            }))
        );
    }

    #[test]
    fn test_parse_legacy_clock_is_fresh_shaped() {
        assert_eq!(
            ClockSpec::parse_str("c:42:99"),
            Some(ClockSpec::Clock(ClockValue {
                start_time: 0,
                pid: 42,
                root_number: 0,
                ticks: 99,
            }))
        );
    }

    #[test]
    fn test_parse_garbage() {
        assert_eq!(ClockSpec::parse_str("zebra"), None);
        assert_eq!(ClockSpec::parse_str("c:a:b:c:d"), None);
        assert_eq!(ClockSpec::parse_str("c:1"), None);
    }

    #[test]
    fn test_round_trip() {
        let rendered = clock_id_string(3, 17);
        match ClockSpec::parse_str(&rendered) {
            Some(ClockSpec::Clock(value)) => {
                assert_eq!(value.root_number, 3);
                assert_eq!(value.ticks, 17);
                assert_eq!(value.pid, std::process::id());
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_own_clock_resolves_non_fresh() {
        let mut clock = RootClock::new(1);
        clock.ticks = 10;
        let spec = ClockSpec::new_clock(1, 5);
        assert_eq!(
            clock.eval_readonly(Some(&spec), 0),
            QuerySince::Clock {
                is_fresh_instance: false,
                ticks: 5
            }
        );
    }

    #[test]
    fn test_foreign_clock_is_fresh() {
        let clock = RootClock::new(1);
        let spec = ClockSpec::Clock(ClockValue {
            start_time: 1,
            pid: 2,
            root_number: 1,
            ticks: 5,
        });
        assert!(clock.eval_readonly(Some(&spec), 0).is_fresh_instance());
    }

    #[test]
    fn test_wrong_root_number_is_fresh() {
        let clock = RootClock::new(2);
        let spec = ClockSpec::new_clock(1, 5);
        assert!(clock.eval_readonly(Some(&spec), 0).is_fresh_instance());
    }

    #[test]
    fn test_aged_out_clock_is_fresh() {
        let mut clock = RootClock::new(1);
        clock.ticks = 50;
        let spec = ClockSpec::new_clock(1, 5);
        assert!(clock.eval_readonly(Some(&spec), 10).is_fresh_instance());
        assert!(!clock.eval_readonly(Some(&spec), 5).is_fresh_instance());
    }

    #[test]
    fn test_current_tick_self_bumps() {
        let mut clock = RootClock::new(1);
        clock.ticks = 7;
        let spec = ClockSpec::new_clock(1, 7);
        let since = clock.eval(Some(&spec), 0);
        assert_eq!(
            since,
            QuerySince::Clock {
                is_fresh_instance: false,
                ticks: 7
            }
        );
        assert_eq!(clock.ticks, 8);
    }

    #[test]
    fn test_cursor_idempotence() {
        let mut clock = RootClock::new(1);
        clock.ticks = 3;

        // First use: unknown cursor resolves fresh and records a new tick.
        let since = clock.eval(Some(&ClockSpec::NamedCursor("cur".into())), 0);
        assert!(since.is_fresh_instance());
        assert_eq!(clock.ticks, 4);

        // Second use with no intervening change: resolves to the recorded
        // tick, which equals everything observed so far, so a query walking
        // "newer than ticks" sees nothing.
        let since = clock.eval(Some(&ClockSpec::NamedCursor("cur".into())), 0);
        assert_eq!(
            since,
            QuerySince::Clock {
                is_fresh_instance: false,
                ticks: 4
            }
        );
        assert_eq!(clock.ticks, 5);
    }

    #[test]
    fn test_none_spec_is_fresh() {
        let clock = RootClock::new(1);
        assert!(clock.eval_readonly(None, 0).is_fresh_instance());
    }
}
