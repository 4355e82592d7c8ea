//! Idle outer-channel reclamation. Event-driven rather than timer-driven:
//! swept only when the inner socket is about to create a new outer channel,
//! immediately before the new one is inserted.

use std::time::Instant;

use log::debug;

use crate::reactor::ReactorCore;

use super::inner::UdpReactorState;

/// Removes every outer channel whose `last_op` is older than
/// `max_idle_duration`. A zero `max_idle_duration` disables sweeping
/// entirely (channels live until the crusher is closed or crushed).
pub fn sweep(core: &mut ReactorCore, id: u64) {
    let (max_idle, now) = {
        let state = match core.state_mut::<UdpReactorState>(id) {
            Some(s) => s,
            None => return,
        };
        (state.config.max_idle_duration, Instant::now())
    };
    if max_idle.is_zero() {
        return;
    }

    let expired: Vec<_> = {
        let state = core.state_mut::<UdpReactorState>(id).unwrap();
        state
            .outers
            .iter()
            .filter(|(_, outer)| now.duration_since(outer.last_op) >= max_idle)
            .map(|(addr, outer)| (*addr, outer.token))
            .collect()
    };

    for (addr, token) in expired {
        debug!("{}: udp outer channel idle-expired", addr);
        core.cancel(token);
        let state = core.state_mut::<UdpReactorState>(id).unwrap();
        state.outers.remove(&addr);
    }
}
