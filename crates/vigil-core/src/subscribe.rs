//! Subscriptions: push query results to clients at settle points.

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::{
    clock::{clock_id_string, ClockSpec},
    query::{execute, Query, QueryResult},
    state,
    view::InMemoryView,
};

/// The receiving end handed back to the subscriber. Unilateral responses
/// (including the `canceled` notice if the root goes away) arrive on `rx`.
pub struct SubscriptionHandle {
    pub name: String,
    pub rx: mpsc::UnboundedReceiver<Value>,
}

pub(crate) struct Subscription {
    pub name: String,
    pub query: Query,
    /// Rolling clock: each dispatched batch advances it to the clock at the
    /// start of that batch's query.
    pub since_spec: Option<ClockSpec>,
    pub last_sub_tick: u32,
    pub vcs_defer: bool,
    /// state name → true for drop, false for defer.
    pub drop_or_defer: std::collections::HashMap<String, bool>,
    pub tx: mpsc::UnboundedSender<Value>,
}

impl Subscription {
    /// Execute the subscription's query and package the unilateral
    /// response. Returns `None` when there is nothing to send.
    pub(crate) fn build_results(
        &mut self,
        view: &InMemoryView,
        clock: &mut crate::clock::RootClock,
    ) -> Option<Value> {
        match &self.since_spec {
            Some(ClockSpec::Clock(value)) => {
                debug!(name = %self.name, since = value.ticks, "running subscription rules");
            }
            _ => debug!(name = %self.name, "running subscription rules (no since)"),
        }

        self.query.since = self.since_spec.clone();
        // Subscriptions never need to sync: they are dispatched at settle
        // points, which are by definition up to date.
        self.query.sync_timeout = std::time::Duration::ZERO;

        let result = match execute(&self.query, view, clock) {
            Ok(result) => result,
            Err(err) => {
                error!(name = %self.name, %err, "error running subscription query");
                return None;
            }
        };

        debug!(
            name = %self.name,
            results = result.files.len(),
            "subscription generated results"
        );

        // The next batch picks up where this query started.
        self.since_spec = Some(ClockSpec::new_clock(result.root_number, result.ticks));

        if result.files.is_empty() {
            return None;
        }
        Some(self.render_unilateral(view, &result))
    }

    fn render_unilateral(&self, view: &InMemoryView, result: &QueryResult) -> Value {
        let mut response = result.render_response();
        let obj = response.as_object_mut().expect("response is an object");
        obj.insert("root".into(), json!(view.root_path.as_str()));
        obj.insert("subscription".into(), json!(self.name));
        obj.insert("unilateral".into(), json!(true));
        response
    }

    pub(crate) fn render_cancel_notice(&self, root_path: &str) -> Value {
        json!({
            "root": root_path,
            "subscription": self.name,
            "unilateral": true,
            "canceled": true,
        })
    }
}

/// Settle-point dispatch: walk every subscription, apply drop/defer policy,
/// and deliver fresh results. Subscriptions whose receiver has gone away
/// are removed.
pub(crate) fn process_subscriptions(
    subscriptions: &mut std::collections::HashMap<String, Subscription>,
    view: &InMemoryView,
    clock: &mut crate::clock::RootClock,
    asserted: &crate::state::AssertedStates,
) {
    if subscriptions.is_empty() {
        return;
    }

    // If it looks like we're in a repo undergoing a rebase or similar
    // operation, defer interested subscribers until things settle down.
    let vcs_in_progress = state::is_vcs_operation_in_progress(view);
    let most_recent = view.most_recent_tick();

    let mut dead = Vec::new();
    for sub in subscriptions.values_mut() {
        debug!(
            name = %sub.name,
            last = sub.last_sub_tick,
            pending = most_recent,
            "considering subscription"
        );
        if sub.last_sub_tick == most_recent {
            continue;
        }

        let mut defer = false;
        let mut drop = false;
        let mut policy_name = None;
        if !asserted.is_empty() && !sub.drop_or_defer.is_empty() {
            // One or more states are asserted and this subscription has a
            // policy for states; figure out what to do.
            for (name, policy_is_drop) in &sub.drop_or_defer {
                if !asserted.is_asserted(name) {
                    continue;
                }
                if !defer {
                    defer = true;
                    policy_name = Some(name.clone());
                }
                if *policy_is_drop {
                    drop = true;
                    policy_name = Some(name.clone());
                    break;
                }
            }
        }

        if drop {
            // Fast-forward over the notifications while dropping.
            sub.last_sub_tick = most_recent;
            debug!(
                name = %sub.name,
                state = policy_name.as_deref().unwrap_or(""),
                "dropping subscription notifications until state is vacated"
            );
            continue;
        }

        if defer {
            debug!(
                name = %sub.name,
                state = policy_name.as_deref().unwrap_or(""),
                "deferring subscription notifications until state is vacated"
            );
            continue;
        }

        if sub.vcs_defer && vcs_in_progress {
            debug!(
                name = %sub.name,
                "deferring subscription notifications until VCS operations complete"
            );
            continue;
        }

        if let Some(response) = sub.build_results(view, clock) {
            if sub.tx.send(response).is_err() {
                dead.push(sub.name.clone());
            }
        }
        sub.last_sub_tick = most_recent;
    }

    for name in dead {
        debug!(%name, "removing subscription with departed client");
        subscriptions.remove(&name);
    }
}

/// Build the clock portion of the `since` field the way a subscription
/// reports it: only relative clocks are rendered.
pub(crate) fn render_since_field(spec: &Option<ClockSpec>) -> Option<String> {
    match spec {
        Some(ClockSpec::Clock(value)) => Some(clock_id_string(value.root_number, value.ticks)),
        _ => None,
    }
}
