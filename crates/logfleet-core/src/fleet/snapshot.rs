use crate::model::{BusyStage, ConnDetails, ConnectionState, FleetSnapshot, StateCounts};

/// What the fleet knows about one client, fed from its updates.
#[derive(Debug, Clone)]
pub(crate) struct HostView {
    pub state: ConnectionState,
    pub conn_details: ConnDetails,
    pub busy_stage: Option<BusyStage>,
}

impl Default for HostView {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            conn_details: ConnDetails::default(),
            busy_stage: None,
        }
    }
}

pub(crate) fn compute<'a>(
    active: impl IntoIterator<Item = (&'a String, &'a HostView)>,
    closing: impl IntoIterator<Item = &'a String>,
    query_in_flight: bool,
) -> FleetSnapshot {
    let mut snapshot = FleetSnapshot::default();
    let mut counts = StateCounts::default();
    for (name, view) in active {
        counts.add(view.state);
        snapshot.states.insert(name.clone(), view.state);
        // Connection diagnostics only matter until the host is up.
        if !view.state.is_connected() {
            snapshot
                .conn_details
                .insert(name.clone(), view.conn_details.clone());
        }
        if let Some(stage) = view.busy_stage.as_ref() {
            snapshot.busy_stages.insert(name.clone(), stage.clone());
        }
    }
    snapshot.tearing_down = closing.into_iter().cloned().collect();
    snapshot.tearing_down.sort();
    snapshot.no_matching_hosts = snapshot.states.is_empty();
    snapshot.connected = !snapshot.no_matching_hosts && counts.not_connected() == 0;
    // Bootstraps and idle pings keep a host busy without any fleet query.
    snapshot.busy = query_in_flight || counts.busy > 0;
    snapshot.counts = counts;
    snapshot
}
