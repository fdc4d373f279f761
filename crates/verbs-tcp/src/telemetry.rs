//! Per-frame latency telemetry hook (spec §6a), mirroring the teacher's
//! `TcpTelemetry` control surface without its shared-memory timer registry
//! (`flux_communication::Timer`/`flux_timing::Nanos`) — that machinery is
//! tied to the embedding monorepo and out of scope here (see `DESIGN.md`).
//! Callers get a plain `Duration` and report it however their own
//! observability stack expects.

use std::time::Duration;

/// Notified once per inbound message, with the elapsed time between the
/// first byte of its TLV frame arriving and the message being fully
/// reassembled and handed to the application.
pub trait Telemetry {
    fn on_message_assembled(&mut self, latency: Duration);
}

/// The default: telemetry emission has no effect on framing or delivery.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoTelemetry;

impl Telemetry for NoTelemetry {
    fn on_message_assembled(&mut self, _latency: Duration) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_telemetry_is_a_true_no_op() {
        let mut t = NoTelemetry;
        t.on_message_assembled(Duration::from_secs(1));
    }
}
