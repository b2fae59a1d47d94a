//! MIDI transport over midir.
//!
//! Output runs on a dedicated thread fed by a command channel, so scheduled
//! calibration scripts and live MIDI-thru traffic share one connection and
//! nobody but that thread ever blocks on the port.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use midir::{MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use swivel_core::{Error, MidiMessage, MidiRouter, MidiSink, ScheduledMessage};
use tracing::{debug, info, warn};

/// Longest the output thread sleeps with nothing due.
const IDLE_POLL: Duration = Duration::from_millis(100);

enum OutputCommand {
    Schedule(Vec<ScheduledMessage>, Instant),
    ClearScheduled,
    Send(Vec<u8>),
    Shutdown,
}

pub struct MidiOutputManager {
    command_sender: Sender<OutputCommand>,
    thread: Option<JoinHandle<()>>,
    port_name: String,
}

impl MidiOutputManager {
    /// Connects to the first output port whose name contains `port`, or to the
    /// first port at all.
    pub fn connect(port: Option<&str>) -> Result<Self> {
        let midi_output = MidiOutput::new("swivel-output")?;
        let ports = midi_output.ports();
        let (out_port, port_name) = ports
            .iter()
            .filter_map(|p| midi_output.port_name(p).ok().map(|name| (p, name)))
            .find(|(_, name)| port.is_none_or(|wanted| name.contains(wanted)))
            .ok_or_else(|| anyhow!("MIDI output port {:?} not found", port.unwrap_or("any")))?;
        let out_port = out_port.clone();

        let connection = midi_output
            .connect(&out_port, "swivel-out")
            .map_err(|e| anyhow!("Failed to connect to MIDI output {port_name}: {e}"))?;
        info!("Using MIDI output: {port_name}");

        let (command_sender, command_receiver) = unbounded();
        let thread = thread::Builder::new()
            .name("midi-output-thread".to_string())
            .spawn(move || Self::midi_output_thread(command_receiver, connection))?;

        Ok(Self {
            command_sender,
            thread: Some(thread),
            port_name,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// A [`MidiSink`] feeding this output.
    pub fn sink(&self) -> MidiOutputSink {
        MidiOutputSink(self.command_sender.clone())
    }

    fn midi_output_thread(
        command_receiver: Receiver<OutputCommand>,
        mut connection: MidiOutputConnection,
    ) {
        let mut pending = PendingMessages::default();

        loop {
            let wait = pending.next_wait(Instant::now()).unwrap_or(IDLE_POLL);

            match command_receiver.recv_timeout(wait) {
                Ok(OutputCommand::Schedule(messages, start)) => {
                    debug!("Scheduling {} message(s)", messages.len());
                    pending.schedule(&messages, start);
                }
                Ok(OutputCommand::ClearScheduled) => {
                    debug!("Dropping {} scheduled message(s)", pending.len());
                    pending.clear();
                }
                Ok(OutputCommand::Send(bytes)) => {
                    if let Err(e) = connection.send(&bytes) {
                        warn!("Failed to send MIDI message: {e}");
                    }
                }
                Ok(OutputCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            for message in pending.take_due(Instant::now()) {
                if let Err(e) = connection.send(message.as_bytes()) {
                    warn!("Failed to send scheduled MIDI message: {e}");
                }
            }
        }

        connection.close();
    }
}

impl Drop for MidiOutputManager {
    fn drop(&mut self) {
        let _ = self.command_sender.send(OutputCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Scheduled messages waiting for their due time, earliest first.
#[derive(Default)]
struct PendingMessages(Vec<(Instant, MidiMessage)>);

impl PendingMessages {
    fn schedule(&mut self, messages: &[ScheduledMessage], start: Instant) {
        self.0
            .extend(messages.iter().map(|m| (start + m.offset, m.message)));
        self.0.sort_by_key(|(due, _)| *due);
    }

    fn clear(&mut self) {
        self.0.clear();
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    /// Time until the earliest message is due, if any is pending.
    fn next_wait(&self, now: Instant) -> Option<Duration> {
        self.0
            .first()
            .map(|(due, _)| due.saturating_duration_since(now))
    }

    /// Removes and returns every message due at or before `now`.
    fn take_due(&mut self, now: Instant) -> Vec<MidiMessage> {
        let due = self.0.partition_point(|(at, _)| *at <= now);
        self.0.drain(..due).map(|(_, message)| message).collect()
    }
}

/// Cloneable handle that queues messages on a [`MidiOutputManager`].
#[derive(Clone)]
pub struct MidiOutputSink(Sender<OutputCommand>);

impl MidiOutputSink {
    /// Sends raw bytes as soon as possible.
    pub fn send(&self, bytes: &[u8]) {
        let _ = self.0.send(OutputCommand::Send(bytes.to_vec()));
    }
}

impl MidiSink for MidiOutputSink {
    fn schedule(
        &mut self,
        messages: &[ScheduledMessage],
        start: Instant,
    ) -> swivel_core::Result<()> {
        self.0
            .send(OutputCommand::Schedule(messages.to_vec(), start))
            .map_err(|_| Error::Midi("MIDI output thread has stopped".into()))
    }

    fn clear_scheduled(&mut self) -> swivel_core::Result<()> {
        self.0
            .send(OutputCommand::ClearScheduled)
            .map_err(|_| Error::Midi("MIDI output thread has stopped".into()))
    }
}

/// Opens MIDI-thru: every message from the input port goes through `router`
/// and whatever it returns is sent to `output`.
///
/// The connection stays open until the returned value is dropped.
pub fn start_midi_thru(
    port: Option<&str>,
    router: MidiRouter,
    output: MidiOutputSink,
) -> Result<MidiInputConnection<()>> {
    let midi_input = MidiInput::new("swivel-input")?;
    let ports = midi_input.ports();
    let (in_port, port_name) = ports
        .iter()
        .filter_map(|p| midi_input.port_name(p).ok().map(|name| (p, name)))
        .find(|(_, name)| port.is_none_or(|wanted| name.contains(wanted)))
        .ok_or_else(|| anyhow!("MIDI input port {:?} not found", port.unwrap_or("any")))?;
    let in_port = in_port.clone();

    let connection = midi_input
        .connect(
            &in_port,
            "swivel-in",
            move |_stamp, bytes, _| {
                if bytes.len() > 3 {
                    // System exclusive and friends are never rewritten.
                    output.send(bytes);
                } else if let Some(message) = router.route(&MidiMessage::from_bytes(bytes)) {
                    output.send(message.as_bytes());
                }
            },
            (),
        )
        .map_err(|e| anyhow!("Failed to connect to MIDI input {port_name}: {e}"))?;
    info!("MIDI-thru from {port_name}");
    Ok(connection)
}

/// Names of every MIDI port, inputs first.
pub fn list_ports() -> Result<(Vec<String>, Vec<String>)> {
    let input = MidiInput::new("swivel-list")?;
    let output = MidiOutput::new("swivel-list")?;
    let inputs = input
        .ports()
        .iter()
        .filter_map(|p| input.port_name(p).ok())
        .collect();
    let outputs = output
        .ports()
        .iter()
        .filter_map(|p| output.port_name(p).ok())
        .collect();
    Ok((inputs, outputs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script() -> Vec<ScheduledMessage> {
        vec![
            ScheduledMessage {
                offset: Duration::ZERO,
                message: MidiMessage::note_on(1, 40, 100),
            },
            ScheduledMessage {
                offset: Duration::from_millis(500),
                message: MidiMessage::note_on(1, 40, 0),
            },
        ]
    }

    #[test]
    fn test_pending_messages_come_due_in_order() {
        let start = Instant::now();
        let mut pending = PendingMessages::default();
        pending.schedule(&script(), start + Duration::from_millis(100));
        pending.schedule(&script()[..1], start);

        assert_eq!(pending.next_wait(start), Some(Duration::ZERO));
        assert_eq!(pending.take_due(start).len(), 1);
        assert_eq!(
            pending.next_wait(start),
            Some(Duration::from_millis(100))
        );

        let due = pending.take_due(start + Duration::from_millis(200));
        assert_eq!(due, vec![MidiMessage::note_on(1, 40, 100)]);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_clearing_drops_the_rest_of_a_script() {
        let start = Instant::now();
        let mut pending = PendingMessages::default();
        pending.schedule(&script(), start);
        assert_eq!(pending.take_due(start).len(), 1);

        pending.clear();
        assert_eq!(pending.next_wait(start), None);
        assert!(pending.take_due(start + Duration::from_secs(1)).is_empty());
    }
}
