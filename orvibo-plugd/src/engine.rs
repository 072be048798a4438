//! The protocol engine: command dispatch, periodic discovery and
//! reconciliation, and inbound packet handling.
//!
//! The engine owns the registry and is driven from a single task, so no
//! locking is needed: on_packet() runs when the socket is readable,
//! on_tick() roughly once a second. Both rate-limit themselves and never
//! fail; send errors are logged and repaired by the next sweep.

use std::net::SocketAddr;
use chrono::{DateTime, Duration, Utc};
use shared::protocol::state_name;
use shared::types::{PlugDescriptor, PlugStatus};
use tokio::sync::mpsc;

use crate::codec;
use crate::events::PlugEvent;
use crate::registry::PlugRegistry;
use crate::transport::Transport;

/// Seconds between discovery broadcasts
const SENSE_INTERVAL: i64 = 30;

/// Seconds between reconciliation sweeps
const SWEEP_INTERVAL: i64 = 5;

/// A plug unheard from for this long (three discovery cycles) is silent
const SILENT_AFTER: i64 = 90;

/// Time source, swappable so tests can run on a simulated clock.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct PlugEngine<T, C> {
    registry: PlugRegistry,
    transport: T,
    clock: C,
    events: mpsc::UnboundedSender<PlugEvent>,
    last_sense: Option<DateTime<Utc>>,
    last_sweep: Option<DateTime<Utc>>,
}

impl<T: Transport, C: Clock> PlugEngine<T, C> {
    pub fn new(
        descriptors: &[PlugDescriptor],
        transport: T,
        clock: C,
        events: mpsc::UnboundedSender<PlugEvent>,
    ) -> Self {
        Self {
            registry: PlugRegistry::from_config(descriptors),
            transport,
            clock,
            events,
            last_sense: None,
            last_sweep: None,
        }
    }

    pub fn registry(&self) -> &PlugRegistry {
        &self.registry
    }

    /// Rebuild the registry from fresh configuration. Must be called from
    /// the same task as on_packet/on_tick so no sweep runs mid-rebuild.
    pub fn refresh(&mut self, descriptors: &[PlugDescriptor]) {
        self.registry.refresh(descriptors);
        tracing::info!("registry rebuilt with {} configured plugs", self.registry.count());
    }

    pub fn live_config(&self) -> Vec<PlugDescriptor> {
        self.registry.live_config()
    }

    /// Per-plug status for the control surface. Unreachable plugs report
    /// their failure reason instead of a fabricated state.
    pub fn status(&self) -> Vec<PlugStatus> {
        (0..self.registry.count())
            .map(|i| PlugStatus {
                name: self.registry.name(i).to_string(),
                state: match self.registry.failure(i) {
                    Some(reason) => reason.to_string(),
                    None => state_name(self.registry.actual(i)).to_string(),
                },
                command: state_name(self.registry.commanded(i)).to_string(),
                pulse: self.registry.deadline(i),
            })
            .collect()
    }

    /// Drive one plug to the requested state, optionally for a limited
    /// number of seconds. Returns false for an unknown index.
    ///
    /// The command is always recorded; packets only go out if the plug has
    /// been seen on the network. An unreachable plug picks the command up
    /// through reconciliation once it reappears.
    pub fn set(&mut self, index: usize, state: bool, pulse_secs: u32) -> bool {
        let now = self.clock.now();
        let Some(plug) = self.registry.get_mut(index) else {
            return false;
        };
        plug.deadline = if pulse_secs > 0 {
            Some(now + Duration::seconds(i64::from(pulse_secs)))
        } else {
            None
        };
        plug.commanded = state;

        let name = plug.name.clone();
        let mac = plug.mac.clone();
        let target = plug.endpoint.filter(|_| plug.reachable());

        self.emit(PlugEvent::Set {
            name,
            state,
            pulse_secs,
        });
        if let Some(dest) = target {
            self.command_plug(&mac, dest, state);
        }
        true
    }

    /// Apply a command to the named plug, or to every plug for "all".
    /// Returns whether any plug matched.
    pub fn set_named(&mut self, name: &str, state: bool, pulse_secs: u32) -> bool {
        let mut found = false;
        for index in 0..self.registry.count() {
            if name == "all" || self.registry.name(index) == name {
                found |= self.set(index, state, pulse_secs);
            }
        }
        found
    }

    /// Periodic duties: broadcast a discovery probe every 30 seconds, and
    /// every 5 seconds sweep the registry to expire silent plugs, end
    /// pulses, and re-send commands that have not converged. Call roughly
    /// once a second; the internal periods are self-managed.
    pub fn on_tick(&mut self) {
        let now = self.clock.now();

        if self
            .last_sense
            .map_or(true, |t| now >= t + Duration::seconds(SENSE_INTERVAL))
        {
            self.last_sense = Some(now);
            if let Err(e) = self.transport.broadcast(&codec::SENSE) {
                tracing::warn!("discovery broadcast failed: {e}");
            }
        }

        if self
            .last_sweep
            .is_some_and(|t| now < t + Duration::seconds(SWEEP_INTERVAL))
        {
            return;
        }
        self.last_sweep = Some(now);

        for index in 0..self.registry.count() {
            self.sweep_plug(index, now);
        }
    }

    /// One reconciliation pass over one plug: silence detection, then pulse
    /// expiry, then convergence retry, in that order. An expired pulse is
    /// therefore retried toward off within the same pass.
    fn sweep_plug(&mut self, index: usize, now: DateTime<Utc>) {
        let mut pending = Vec::new();
        let mut retry = None;
        {
            let Some(plug) = self.registry.get_mut(index) else {
                return;
            };

            if plug
                .last_seen
                .is_some_and(|seen| seen < now - Duration::seconds(SILENT_AFTER))
            {
                pending.push(PlugEvent::Silent {
                    name: plug.name.clone(),
                    mac: plug.mac.clone(),
                });
                plug.last_seen = None;
            }

            if plug.deadline.is_some_and(|deadline| now >= deadline) {
                pending.push(PlugEvent::Reset {
                    name: plug.name.clone(),
                });
                plug.commanded = false;
                plug.deadline = None;
            }

            if plug.actual != plug.commanded && plug.reachable() {
                pending.push(PlugEvent::Retry {
                    name: plug.name.clone(),
                    state: plug.commanded,
                });
                retry = plug.endpoint.map(|dest| (plug.mac.clone(), dest, plug.commanded));
            }
        }
        for event in pending {
            self.emit(event);
        }
        if let Some((mac, dest, state)) = retry {
            self.command_plug(&mac, dest, state);
        }
    }

    /// Handle one inbound datagram. Unrecognized payloads are dropped;
    /// recognized ones refresh or create the matching registry entry.
    pub fn on_packet(&mut self, payload: &[u8], source: SocketAddr) {
        let Some(report) = codec::decode(payload) else {
            tracing::trace!("ignoring datagram from {source}: {}", hex::encode(payload));
            return;
        };
        let now = self.clock.now();

        let index = match self.registry.find_by_mac(&report.mac) {
            Some(index) => index,
            None => {
                let Some(index) = self.registry.register_discovered(&report.mac) else {
                    tracing::debug!("plug table full, ignoring device {}", report.mac);
                    return;
                };
                // Marking the new entry as seen right away keeps the same
                // packet from also producing a DETECTED event.
                if let Some(plug) = self.registry.get_mut(index) {
                    plug.last_seen = Some(now);
                }
                self.emit(PlugEvent::Added {
                    name: self.registry.name(index).to_string(),
                    mac: report.mac.clone(),
                });
                index
            }
        };

        let mut pending = Vec::new();
        if let Some(plug) = self.registry.get_mut(index) {
            if !plug.reachable() {
                pending.push(PlugEvent::Detected {
                    name: plug.name.clone(),
                    mac: plug.mac.clone(),
                });
            }
            plug.last_seen = Some(now);
            if plug.actual != report.on {
                pending.push(PlugEvent::Changed {
                    name: plug.name.clone(),
                    from: plug.actual,
                    to: report.on,
                });
                plug.actual = report.on;
            }
            plug.endpoint = Some(source);
        }
        for event in pending {
            self.emit(event);
        }
    }

    fn command_plug(&self, mac: &str, dest: SocketAddr, state: bool) {
        self.transmit(&codec::subscribe(mac), dest);
        self.transmit(&codec::control(mac, state), dest);
    }

    fn transmit(&self, payload: &[u8], dest: SocketAddr) {
        tracing::debug!("sending {} to {dest}", hex::encode(payload));
        if let Err(e) = self.transport.send(payload, dest) {
            tracing::warn!("send to {dest} failed: {e}");
        }
    }

    fn emit(&self, event: PlugEvent) {
        // The consumer outliving the engine is the daemon's problem, not ours
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[derive(Debug, PartialEq, Eq)]
    enum Sent {
        Unicast(Vec<u8>, SocketAddr),
        Broadcast(Vec<u8>),
    }

    #[derive(Default)]
    struct MockTransport {
        sent: RefCell<Vec<Sent>>,
    }

    impl MockTransport {
        fn take(&self) -> Vec<Sent> {
            self.sent.take()
        }

        fn unicast_count(&self) -> usize {
            self.sent
                .borrow()
                .iter()
                .filter(|s| matches!(s, Sent::Unicast(..)))
                .count()
        }
    }

    impl Transport for Rc<MockTransport> {
        fn send(&self, payload: &[u8], dest: SocketAddr) -> std::io::Result<usize> {
            self.sent
                .borrow_mut()
                .push(Sent::Unicast(payload.to_vec(), dest));
            Ok(payload.len())
        }

        fn broadcast(&self, payload: &[u8]) -> std::io::Result<usize> {
            self.sent.borrow_mut().push(Sent::Broadcast(payload.to_vec()));
            Ok(payload.len())
        }
    }

    struct FakeClock {
        now: Cell<DateTime<Utc>>,
    }

    impl FakeClock {
        fn new() -> Self {
            Self {
                now: Cell::new(Utc::now()),
            }
        }

        fn advance(&self, secs: i64) {
            self.now.set(self.now.get() + Duration::seconds(secs));
        }
    }

    impl Clock for Rc<FakeClock> {
        fn now(&self) -> DateTime<Utc> {
            self.now.get()
        }
    }

    const LAMP_MAC: &str = "accf238d9dbe";

    fn descriptors() -> Vec<PlugDescriptor> {
        vec![PlugDescriptor {
            name: "lamp".to_string(),
            address: LAMP_MAC.to_string(),
            description: String::new(),
        }]
    }

    struct Harness {
        engine: PlugEngine<Rc<MockTransport>, Rc<FakeClock>>,
        transport: Rc<MockTransport>,
        clock: Rc<FakeClock>,
        events: mpsc::UnboundedReceiver<PlugEvent>,
    }

    impl Harness {
        fn new(descriptors: &[PlugDescriptor]) -> Self {
            let transport = Rc::new(MockTransport::default());
            let clock = Rc::new(FakeClock::new());
            let (tx, events) = mpsc::unbounded_channel();
            let engine = PlugEngine::new(descriptors, transport.clone(), clock.clone(), tx);
            Self {
                engine,
                transport,
                clock,
                events,
            }
        }

        /// Deliver a discovery reply for the given MAC, making it reachable.
        fn hear_from(&mut self, mac: &str, on: bool) {
            let mut payload = vec![0u8; 42];
            payload[..7].copy_from_slice(&[0x68, 0x64, 0x00, 0x2a, 0x71, 0x61, 0x00]);
            payload[7..13].copy_from_slice(&codec::decode_mac(mac));
            payload[41] = u8::from(on);
            self.engine.on_packet(&payload, plug_addr());
        }

        fn drain_events(&mut self) -> Vec<PlugEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    fn plug_addr() -> SocketAddr {
        "192.168.1.50:10000".parse().unwrap()
    }

    #[test]
    fn test_set_reachable_sends_subscribe_then_control() {
        let mut h = Harness::new(&descriptors());
        h.hear_from(LAMP_MAC, false);
        h.drain_events();
        h.transport.take();

        assert!(h.engine.set(0, true, 0));
        assert!(h.engine.registry().commanded(0));
        assert_eq!(h.engine.registry().deadline(0), None);

        let sent = h.transport.take();
        assert_eq!(
            sent,
            vec![
                Sent::Unicast(codec::subscribe(LAMP_MAC), plug_addr()),
                Sent::Unicast(codec::control(LAMP_MAC, true), plug_addr()),
            ]
        );
        assert_eq!(
            h.drain_events(),
            vec![PlugEvent::Set {
                name: "lamp".to_string(),
                state: true,
                pulse_secs: 0
            }]
        );
    }

    #[test]
    fn test_set_unreachable_records_but_does_not_send() {
        let mut h = Harness::new(&descriptors());
        assert!(h.engine.set(0, true, 0));
        assert!(h.engine.registry().commanded(0));
        assert_eq!(h.transport.take(), vec![]);
        // Still reported as a SET so the operator sees the intent
        assert_eq!(h.drain_events().len(), 1);
    }

    #[test]
    fn test_set_rejects_bad_index() {
        let mut h = Harness::new(&descriptors());
        assert!(!h.engine.set(5, true, 0));
        assert_eq!(h.drain_events(), vec![]);
    }

    #[test]
    fn test_set_named_and_all() {
        let mut descs = descriptors();
        descs.push(PlugDescriptor {
            name: "heater".to_string(),
            address: "accf23112233".to_string(),
            description: String::new(),
        });
        let mut h = Harness::new(&descs);

        assert!(h.engine.set_named("heater", true, 0));
        assert!(h.engine.registry().commanded(1));
        assert!(!h.engine.registry().commanded(0));

        assert!(h.engine.set_named("all", false, 0));
        assert!(!h.engine.registry().commanded(1));

        assert!(!h.engine.set_named("toaster", true, 0));
    }

    #[test]
    fn test_pulse_expiry_resets_command() {
        let mut h = Harness::new(&descriptors());
        h.hear_from(LAMP_MAC, true);
        assert!(h.engine.set(0, true, 5));
        assert!(h.engine.registry().deadline(0).is_some());
        h.drain_events();

        h.clock.advance(6);
        h.engine.on_tick();

        assert!(!h.engine.registry().commanded(0));
        assert_eq!(h.engine.registry().deadline(0), None);
        let events = h.drain_events();
        assert_eq!(
            events[0],
            PlugEvent::Reset {
                name: "lamp".to_string()
            }
        );
        // The plug still reports on, so the same sweep retries it off
        assert_eq!(
            events[1],
            PlugEvent::Retry {
                name: "lamp".to_string(),
                state: false
            }
        );
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_silence_detection_fires_once() {
        let mut h = Harness::new(&descriptors());
        h.hear_from(LAMP_MAC, false);
        h.drain_events();

        h.clock.advance(91);
        h.engine.on_tick();
        assert_eq!(
            h.drain_events(),
            vec![PlugEvent::Silent {
                name: "lamp".to_string(),
                mac: LAMP_MAC.to_string()
            }]
        );
        assert_eq!(h.engine.registry().failure(0), Some("silent"));

        h.clock.advance(5);
        h.engine.on_tick();
        assert_eq!(h.drain_events(), vec![]);
    }

    #[test]
    fn test_exactly_90_seconds_is_not_silent() {
        let mut h = Harness::new(&descriptors());
        h.hear_from(LAMP_MAC, false);
        h.drain_events();

        h.clock.advance(90);
        h.engine.on_tick();
        assert_eq!(h.drain_events(), vec![]);
        assert_eq!(h.engine.registry().failure(0), None);
    }

    #[test]
    fn test_auto_discovery_names_and_deduplicates() {
        let mut h = Harness::new(&descriptors());
        h.hear_from("eeeeeeeeeeee", true);

        assert_eq!(h.engine.registry().count(), 2);
        assert_eq!(h.engine.registry().name(1), "plug1");
        assert!(h.engine.registry().actual(1));
        let events = h.drain_events();
        assert_eq!(
            events[0],
            PlugEvent::Added {
                name: "plug1".to_string(),
                mac: "eeeeeeeeeeee".to_string()
            }
        );
        // The creating packet must not also announce DETECTED
        assert!(!events
            .iter()
            .any(|e| matches!(e, PlugEvent::Detected { .. })));

        h.hear_from("eeeeeeeeeeee", false);
        assert_eq!(h.engine.registry().count(), 2);
        let events = h.drain_events();
        assert_eq!(
            events,
            vec![PlugEvent::Changed {
                name: "plug1".to_string(),
                from: true,
                to: false
            }]
        );
    }

    #[test]
    fn test_detected_after_silence() {
        let mut h = Harness::new(&descriptors());
        h.hear_from(LAMP_MAC, false);
        h.clock.advance(91);
        h.engine.on_tick();
        h.drain_events();

        h.hear_from(LAMP_MAC, false);
        assert_eq!(
            h.drain_events(),
            vec![PlugEvent::Detected {
                name: "lamp".to_string(),
                mac: LAMP_MAC.to_string()
            }]
        );
    }

    #[test]
    fn test_convergence_retries_until_acknowledged() {
        let mut h = Harness::new(&descriptors());
        h.hear_from(LAMP_MAC, false);
        h.engine.set(0, true, 0);
        h.drain_events();
        h.transport.take();

        // Two sweeps without an acknowledgment: two subscribe+control pairs
        h.clock.advance(5);
        h.engine.on_tick();
        h.clock.advance(5);
        h.engine.on_tick();
        assert_eq!(h.transport.unicast_count(), 4);
        let retries = h
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, PlugEvent::Retry { state: true, .. }))
            .count();
        assert_eq!(retries, 2);

        // The plug confirms: no further sends
        h.hear_from(LAMP_MAC, true);
        h.transport.take();
        h.clock.advance(5);
        h.engine.on_tick();
        assert_eq!(h.transport.unicast_count(), 0);
    }

    #[test]
    fn test_unreachable_mismatch_is_not_retried() {
        let mut h = Harness::new(&descriptors());
        h.engine.set(0, true, 0);
        h.drain_events();

        h.clock.advance(5);
        h.engine.on_tick();
        assert_eq!(h.transport.unicast_count(), 0);
        assert_eq!(h.drain_events(), vec![]);
    }

    #[test]
    fn test_discovery_probe_every_30_seconds() {
        let mut h = Harness::new(&descriptors());
        h.engine.on_tick();
        assert_eq!(h.transport.take(), vec![Sent::Broadcast(codec::SENSE.to_vec())]);

        h.clock.advance(1);
        h.engine.on_tick();
        assert_eq!(h.transport.take(), vec![]);

        h.clock.advance(29);
        h.engine.on_tick();
        assert_eq!(h.transport.take(), vec![Sent::Broadcast(codec::SENSE.to_vec())]);
    }

    #[test]
    fn test_sweep_rate_limited_to_5_seconds() {
        let mut h = Harness::new(&descriptors());
        h.hear_from(LAMP_MAC, false);
        h.engine.set(0, true, 0);
        h.drain_events();

        h.clock.advance(5);
        h.engine.on_tick();
        h.clock.advance(1);
        h.engine.on_tick();
        let retries = h
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, PlugEvent::Retry { .. }))
            .count();
        assert_eq!(retries, 1);
    }

    #[test]
    fn test_status_reports_failure_reason() {
        let mut h = Harness::new(&descriptors());
        let status = h.engine.status();
        assert_eq!(status[0].name, "lamp");
        assert_eq!(status[0].state, "silent");
        assert_eq!(status[0].command, "off");
        assert_eq!(status[0].pulse, None);

        h.hear_from(LAMP_MAC, true);
        h.engine.set(0, true, 10);
        let status = h.engine.status();
        assert_eq!(status[0].state, "on");
        assert_eq!(status[0].command, "on");
        assert!(status[0].pulse.is_some());
    }

    #[test]
    fn test_refresh_is_a_full_rebuild() {
        let mut h = Harness::new(&descriptors());
        h.hear_from("eeeeeeeeeeee", true);
        assert_eq!(h.engine.registry().count(), 2);

        h.engine.refresh(&descriptors());
        assert_eq!(h.engine.registry().count(), 1);
        assert_eq!(h.engine.registry().failure(0), Some("silent"));
    }
}
