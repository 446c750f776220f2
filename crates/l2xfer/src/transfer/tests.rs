//! Unit tests for the transfer engine

use std::sync::{Arc, Mutex};

use crate::error::{StackError, TransferError, TransferResult};
use crate::l2cap::psm::Spsm;
use crate::l2cap::types::{ChannelId, CloseReason, ConnectionHandle, ConnectionResult};
use crate::stack::{BleStack, BtEvent};
use crate::transfer::*;

const CONN: ConnectionHandle = ConnectionHandle(1);

/// Commands the engine issued to the mock stack
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Open {
        connection: ConnectionHandle,
        spsm: Spsm,
        max_sdu: u16,
        max_pdu: u16,
        credit: u16,
    },
    Response {
        connection: ConnectionHandle,
        cid: ChannelId,
        max_sdu: u16,
        max_pdu: u16,
        credit: u16,
        result: ConnectionResult,
    },
    Data {
        connection: ConnectionHandle,
        cid: ChannelId,
        data: Vec<u8>,
    },
    Credit {
        connection: ConnectionHandle,
        cid: ChannelId,
        credit: u16,
    },
    Close {
        connection: ConnectionHandle,
        cid: ChannelId,
    },
}

/// Runs inside `open_le_channel`, before the channel id is returned
type OpenHook = Box<dyn Fn(ChannelId)>;

/// Mock host stack that records every command
#[derive(Default)]
struct MockStack {
    commands: Mutex<Vec<Command>>,
    next_cid: Mutex<ChannelId>,
    fail_open: Mutex<Option<StackError>>,
    fail_send: Mutex<Option<StackError>>,
    fail_close: Mutex<Option<StackError>>,
    on_open: Mutex<Option<OpenHook>>,
}

impl MockStack {
    fn new() -> Self {
        Self {
            next_cid: Mutex::new(0x0040),
            ..Default::default()
        }
    }

    fn commands(&self) -> Vec<Command> {
        self.commands.lock().unwrap().clone()
    }

    fn data_sizes(&self) -> Vec<usize> {
        self.commands()
            .iter()
            .filter_map(|command| match command {
                Command::Data { data, .. } => Some(data.len()),
                _ => None,
            })
            .collect()
    }

    fn close_count(&self) -> usize {
        self.commands()
            .iter()
            .filter(|command| matches!(command, Command::Close { .. }))
            .count()
    }

    fn record(&self, command: Command) {
        self.commands.lock().unwrap().push(command);
    }
}

impl BleStack for MockStack {
    fn open_le_channel(
        &self,
        connection: ConnectionHandle,
        spsm: Spsm,
        max_sdu: u16,
        max_pdu: u16,
        credit: u16,
    ) -> Result<ChannelId, StackError> {
        if let Some(err) = self.fail_open.lock().unwrap().clone() {
            return Err(err);
        }
        self.record(Command::Open {
            connection,
            spsm,
            max_sdu,
            max_pdu,
            credit,
        });
        let cid = {
            let mut next_cid = self.next_cid.lock().unwrap();
            *next_cid += 1;
            *next_cid - 1
        };
        if let Some(hook) = self.on_open.lock().unwrap().as_ref() {
            hook(cid);
        }
        Ok(cid)
    }

    fn send_le_channel_open_response(
        &self,
        connection: ConnectionHandle,
        cid: ChannelId,
        max_sdu: u16,
        max_pdu: u16,
        credit: u16,
        result: ConnectionResult,
    ) -> Result<(), StackError> {
        self.record(Command::Response {
            connection,
            cid,
            max_sdu,
            max_pdu,
            credit,
            result,
        });
        Ok(())
    }

    fn send_le_channel_data(&self, connection: ConnectionHandle, cid: ChannelId, data: &[u8]) -> Result<(), StackError> {
        if let Some(err) = self.fail_send.lock().unwrap().clone() {
            return Err(err);
        }
        self.record(Command::Data {
            connection,
            cid,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn send_le_channel_credit(&self, connection: ConnectionHandle, cid: ChannelId, credit: u16) -> Result<(), StackError> {
        self.record(Command::Credit { connection, cid, credit });
        Ok(())
    }

    fn close_le_channel(&self, connection: ConnectionHandle, cid: ChannelId) -> Result<(), StackError> {
        if let Some(err) = self.fail_close.lock().unwrap().clone() {
            return Err(err);
        }
        self.record(Command::Close { connection, cid });
        Ok(())
    }
}

/// Transmit hook serving a fixed buffer
struct Source {
    data: Vec<u8>,
    requests: Vec<(u32, u32)>,
    starve: bool,
}

impl Source {
    fn new(length: usize) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            data: (0..length).map(|i| i as u8).collect(),
            requests: Vec::new(),
            starve: false,
        }))
    }
}

impl Transmitter for Source {
    fn on_transmit(&mut self, _id: TransferId, offset: u32, size: u32) -> &[u8] {
        self.requests.push((offset, size));
        if self.starve {
            return &[];
        }
        let start = offset as usize;
        &self.data[start..start + size as usize]
    }
}

/// Receive hook collecting every segment
struct Sink {
    received: Vec<(u32, Vec<u8>)>,
    grant: u16,
}

impl Sink {
    fn new(grant: u16) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            received: Vec::new(),
            grant,
        }))
    }
}

impl Receiver for Sink {
    fn on_receive(&mut self, _id: TransferId, offset: u32, data: &[u8]) -> u16 {
        self.received.push((offset, data.to_vec()));
        self.grant
    }
}

/// Lifecycle hook recording notifications
#[derive(Default)]
struct Recorder {
    opened: Vec<TransferId>,
    finished: Vec<(TransferId, TransferResult<()>)>,
}

impl Recorder {
    fn new() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::default()))
    }
}

impl Finisher for Recorder {
    fn on_finish(&mut self, id: TransferId, result: TransferResult<()>) {
        self.finished.push((id, result));
    }

    fn on_open(&mut self, id: TransferId) {
        self.opened.push(id);
    }
}

fn transmitter(length: u32, source: &Arc<Mutex<Source>>, recorder: &Arc<Mutex<Recorder>>) -> Transfer {
    Transfer::transmitter(CONN, length)
        .with_spsm(Spsm::OTS)
        .with_transmitter(source.clone())
        .with_finisher(recorder.clone())
}

fn receiver(length: u32, sink: &Arc<Mutex<Sink>>, recorder: &Arc<Mutex<Recorder>>) -> Transfer {
    Transfer::receiver(CONN, length)
        .with_spsm(Spsm::OTS)
        .with_receiver(sink.clone())
        .with_finisher(recorder.clone())
}

fn open_response(cid: ChannelId, credit: u16, result: ConnectionResult) -> BtEvent {
    BtEvent::LeChannelOpenResponse {
        connection: CONN,
        cid,
        max_sdu: 247,
        max_pdu: 247,
        credit,
        result,
    }
}

fn open_request(spsm: Spsm, cid: ChannelId, mtu: u16, credit: u16) -> BtEvent {
    BtEvent::LeChannelOpenRequest {
        connection: CONN,
        spsm,
        cid,
        max_sdu: mtu,
        max_pdu: mtu,
        credit,
    }
}

fn data(cid: ChannelId, length: usize) -> BtEvent {
    BtEvent::LeChannelData {
        connection: CONN,
        cid,
        data: vec![0xA5; length],
    }
}

fn closed(cid: ChannelId, reason: CloseReason) -> BtEvent {
    BtEvent::LeChannelClosed {
        connection: CONN,
        cid,
        reason,
    }
}

/// Every held transfer sits in exactly one state
fn assert_single_membership<S: BleStack>(engine: &TransferEngine<S>, expected: usize) {
    let states = [
        StateSet::REQUEST_OPEN,
        StateSet::REQUEST_PENDING,
        StateSet::REQUEST_RESPONSE,
        StateSet::ACTIVE_TRANSMIT,
        StateSet::ACTIVE_RECEIVE,
        StateSet::CLOSING,
    ];
    let held: usize = states.iter().map(|set| engine.transfers_in(*set).len()).sum();
    assert_eq!(held, expected);
    assert_eq!(engine.transfers_in(StateSet::all()).len(), expected);
}

/// Bring a transmitter up to ActiveTransmit with the given peer credit
fn open_transmitter(
    engine: &TransferEngine<MockStack>,
    transfer: Transfer,
    credit: u16,
) -> (TransferId, ChannelId) {
    let id = engine.start_transfer(transfer, true).unwrap();
    engine.process_action();
    let cid = engine.transfer(id).unwrap().channel_id;
    engine.on_bt_event(&open_response(cid, credit, ConnectionResult::Success));
    assert_eq!(engine.state(id), Some(TransferState::ActiveTransmit));
    (id, cid)
}

#[test]
fn test_start_transfer_validation() {
    let engine = TransferEngine::new(MockStack::new());
    let source = Source::new(16);
    let recorder = Recorder::new();

    let mut inactive = transmitter(16, &source, &recorder);
    inactive.mode = TransferMode::Inactive;
    assert!(matches!(
        engine.start_transfer(inactive, true),
        Err(TransferError::InvalidParameter(_))
    ));

    let no_finish = Transfer::transmitter(CONN, 16).with_transmitter(source.clone());
    assert_eq!(
        engine.start_transfer(no_finish, true).unwrap_err(),
        TransferError::MissingCallback("on_finish")
    );

    let no_source = Transfer::transmitter(CONN, 16).with_finisher(recorder.clone());
    assert_eq!(
        engine.start_transfer(no_source, true).unwrap_err(),
        TransferError::MissingCallback("on_transmit")
    );

    let no_sink = Transfer::receiver(CONN, 16).with_finisher(recorder.clone());
    assert_eq!(
        engine.start_transfer(no_sink, false).unwrap_err(),
        TransferError::MissingCallback("on_receive")
    );

    assert!(matches!(
        engine.start_transfer(transmitter(0, &source, &recorder), true),
        Err(TransferError::InvalidParameter(_))
    ));

    assert!(matches!(
        engine.start_transfer(transmitter(16, &source, &recorder).with_data_offset(17), true),
        Err(TransferError::InvalidParameter(_))
    ));

    let mut unconnected = transmitter(16, &source, &recorder);
    unconnected.connection = ConnectionHandle::INVALID;
    assert_eq!(
        engine.start_transfer(unconnected, true).unwrap_err(),
        TransferError::InvalidHandle
    );

    // Nothing was queued and nothing reached the stack
    assert!(engine.is_ok_to_sleep());
    engine.process_action();
    assert!(engine.stack().commands().is_empty());
    assert!(recorder.lock().unwrap().finished.is_empty());
}

#[test]
fn test_start_transfer_resource_limit() {
    let config = EngineConfig {
        max_transfers: 2,
        ..Default::default()
    };
    let engine = TransferEngine::with_config(MockStack::new(), config);
    let source = Source::new(16);
    let recorder = Recorder::new();

    engine.start_transfer(transmitter(16, &source, &recorder), true).unwrap();
    engine.start_transfer(transmitter(16, &source, &recorder), false).unwrap();
    assert_eq!(
        engine.start_transfer(transmitter(16, &source, &recorder), true).unwrap_err(),
        TransferError::ResourceLimitReached
    );
    assert_single_membership(&engine, 2);
}

#[test]
fn test_start_transfer_applies_defaults() {
    let engine = TransferEngine::new(MockStack::new());
    let source = Source::new(16);
    let recorder = Recorder::new();

    let id = engine.start_transfer(transmitter(16, &source, &recorder), true).unwrap();
    let held = engine.transfer(id).unwrap();
    assert_eq!(held.max_sdu, 247);
    assert_eq!(held.max_pdu, 247);
    assert_eq!(held.credit, 1);
    assert_eq!(engine.state(id), Some(TransferState::RequestOpen));
    assert!(!engine.check_progress(id));
}

#[test]
fn test_one_open_request_per_poll() {
    let engine = TransferEngine::new(MockStack::new());
    let source = Source::new(16);
    let recorder = Recorder::new();

    let first = engine.start_transfer(transmitter(16, &source, &recorder), true).unwrap();
    let second = engine.start_transfer(transmitter(16, &source, &recorder), true).unwrap();

    engine.process_action();
    assert_eq!(engine.state(first), Some(TransferState::RequestPending));
    assert_eq!(engine.state(second), Some(TransferState::RequestOpen));
    assert_eq!(engine.transfer(first).unwrap().channel_id, 0x0040);
    assert_eq!(engine.stack().commands().len(), 1);

    engine.process_action();
    assert_eq!(engine.state(second), Some(TransferState::RequestPending));
    assert_eq!(engine.transfer(second).unwrap().channel_id, 0x0041);
    assert_eq!(
        engine.stack().commands()[1],
        Command::Open {
            connection: CONN,
            spsm: Spsm::OTS,
            max_sdu: 247,
            max_pdu: 247,
            credit: 1,
        }
    );
    assert_single_membership(&engine, 2);
}

#[test]
fn test_transmit_with_credit_refill() {
    let engine = TransferEngine::new(MockStack::new());
    let source = Source::new(500);
    let recorder = Recorder::new();

    let transfer = transmitter(500, &source, &recorder).with_max_pdu(200);
    let (id, cid) = open_transmitter(&engine, transfer, 2);
    assert_eq!(recorder.lock().unwrap().opened, vec![id]);
    assert!(engine.check_progress(id));

    engine.process_action();
    engine.process_action();
    assert_eq!(engine.stack().data_sizes(), vec![200, 200]);
    assert_eq!(engine.transfer(id).unwrap().credit, 0);

    // Out of credit: polling sends nothing
    engine.process_action();
    engine.process_action();
    assert_eq!(engine.stack().data_sizes(), vec![200, 200]);

    engine.on_bt_event(&BtEvent::LeChannelCredit {
        connection: CONN,
        cid,
        credit: 1,
    });
    engine.process_action();
    assert_eq!(engine.stack().data_sizes(), vec![200, 200, 100]);
    assert_eq!(engine.state(id), Some(TransferState::Closing));
    assert_eq!(engine.stack().close_count(), 1);
    assert!(recorder.lock().unwrap().finished.is_empty());

    // The last segment carries the tail of the buffer
    let commands = engine.stack().commands();
    let Some(Command::Data { data, .. }) = commands.iter().rev().find(|c| matches!(c, Command::Data { .. })) else {
        panic!("no data sent");
    };
    assert_eq!(data[..], source.lock().unwrap().data[400..]);
    assert_eq!(source.lock().unwrap().requests, vec![(0, 200), (200, 200), (400, 100)]);

    engine.on_bt_event(&closed(cid, CloseReason::LocalDisconnected));
    assert_eq!(recorder.lock().unwrap().finished, vec![(id, Ok(()))]);
    assert!(engine.is_ok_to_sleep());
    assert!(!engine.check_progress(id));

    let stats = engine.stats();
    assert_eq!(stats.segments_sent, 3);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
}

#[test]
fn test_transmit_starts_at_data_offset() {
    let engine = TransferEngine::new(MockStack::new());
    let source = Source::new(100);
    let recorder = Recorder::new();

    let transfer = transmitter(100, &source, &recorder).with_max_pdu(50).with_data_offset(70);
    let (id, _) = open_transmitter(&engine, transfer, 5);

    engine.process_action();
    assert_eq!(source.lock().unwrap().requests, vec![(70, 30)]);
    assert_eq!(engine.state(id), Some(TransferState::Closing));
}

#[test]
fn test_transmit_drops_unusable_segment() {
    let engine = TransferEngine::new(MockStack::new());
    let source = Source::new(64);
    let recorder = Recorder::new();

    let (id, _) = open_transmitter(&engine, transmitter(64, &source, &recorder), 3);

    source.lock().unwrap().starve = true;
    engine.process_action();
    assert!(engine.stack().data_sizes().is_empty());
    assert_eq!(engine.stats().dropped_segments, 1);
    assert_eq!(engine.transfer(id).unwrap().credit, 3);
    assert_eq!(engine.transfer(id).unwrap().data_offset, 0);

    source.lock().unwrap().starve = false;
    engine.process_action();
    assert_eq!(engine.stack().data_sizes(), vec![64]);
    assert_eq!(source.lock().unwrap().requests, vec![(0, 64), (0, 64)]);
}

#[test]
fn test_transmit_send_failure_finishes_transfer() {
    let engine = TransferEngine::new(MockStack::new());
    let source = Source::new(64);
    let recorder = Recorder::new();

    let (id, _) = open_transmitter(&engine, transmitter(64, &source, &recorder), 1);
    *engine.stack().fail_send.lock().unwrap() = Some(StackError::NotConnected);

    engine.process_action();
    assert_eq!(
        recorder.lock().unwrap().finished,
        vec![(id, Err(TransferError::Stack(StackError::NotConnected)))]
    );
    assert_eq!(engine.state(id), None);
}

#[test]
fn test_close_failure_after_completion_reports_success() {
    let engine = TransferEngine::new(MockStack::new());
    let source = Source::new(10);
    let recorder = Recorder::new();

    let (id, _) = open_transmitter(&engine, transmitter(10, &source, &recorder), 1);
    *engine.stack().fail_close.lock().unwrap() = Some(StackError::ChannelNotFound);

    engine.process_action();
    assert_eq!(recorder.lock().unwrap().finished, vec![(id, Ok(()))]);
    assert!(engine.is_ok_to_sleep());
}

#[test]
fn test_open_failure_finishes_transfer() {
    let engine = TransferEngine::new(MockStack::new());
    let source = Source::new(10);
    let recorder = Recorder::new();
    *engine.stack().fail_open.lock().unwrap() = Some(StackError::NoResources);

    let id = engine.start_transfer(transmitter(10, &source, &recorder), true).unwrap();
    engine.process_action();

    assert_eq!(
        recorder.lock().unwrap().finished,
        vec![(id, Err(TransferError::Stack(StackError::NoResources)))]
    );
    assert!(engine.is_ok_to_sleep());
}

#[test]
fn test_open_response_before_request_returns() {
    let engine = Arc::new(TransferEngine::new(MockStack::new()));
    let source = Source::new(100);
    let recorder = Recorder::new();

    let events = Arc::downgrade(&engine);
    *engine.stack().on_open.lock().unwrap() = Some(Box::new(move |cid| {
        if let Some(engine) = events.upgrade() {
            engine.on_bt_event(&open_response(cid, 3, ConnectionResult::Success));
        }
    }));

    let id = engine
        .start_transfer(transmitter(100, &source, &recorder).with_max_pdu(40), true)
        .unwrap();
    engine.process_action();

    assert_eq!(engine.state(id), Some(TransferState::ActiveTransmit));
    assert_eq!(engine.transfer(id).unwrap().channel_id, 0x0040);
    assert_eq!(recorder.lock().unwrap().opened, vec![id]);

    engine.process_action();
    engine.process_action();
    assert_eq!(engine.stack().data_sizes(), vec![40, 40, 20]);
    assert_eq!(engine.state(id), Some(TransferState::Closing));

    engine.on_bt_event(&closed(0x0040, CloseReason::LocalDisconnected));
    assert_eq!(recorder.lock().unwrap().finished, vec![(id, Ok(()))]);
    assert!(engine.is_ok_to_sleep());
}

#[test]
fn test_abort_during_open_request_closes_channel() {
    let engine = Arc::new(TransferEngine::new(MockStack::new()));
    let source = Source::new(100);
    let recorder = Recorder::new();

    let id = engine.start_transfer(transmitter(100, &source, &recorder), true).unwrap();
    let events = Arc::downgrade(&engine);
    *engine.stack().on_open.lock().unwrap() = Some(Box::new(move |_| {
        if let Some(engine) = events.upgrade() {
            engine.abort_transfer(id).unwrap();
        }
    }));

    engine.process_action();

    assert_eq!(recorder.lock().unwrap().finished, vec![(id, Err(TransferError::Aborted))]);
    assert_eq!(
        engine.stack().commands().last(),
        Some(&Command::Close {
            connection: CONN,
            cid: 0x0040,
        })
    );
    assert!(engine.is_ok_to_sleep());
}

#[test]
fn test_open_rejected_by_peer() {
    let engine = TransferEngine::new(MockStack::new());
    let source = Source::new(10);
    let recorder = Recorder::new();

    let id = engine.start_transfer(transmitter(10, &source, &recorder), true).unwrap();
    engine.process_action();
    engine.on_bt_event(&open_response(0x0040, 0, ConnectionResult::SpsmNotSupported));

    assert_eq!(
        recorder.lock().unwrap().finished,
        vec![(id, Err(TransferError::Rejected(ConnectionResult::SpsmNotSupported)))]
    );
    assert!(recorder.lock().unwrap().opened.is_empty());
    assert!(engine.is_ok_to_sleep());
}

#[test]
fn test_command_rejected_finishes_pending_open() {
    let engine = TransferEngine::new(MockStack::new());
    let source = Source::new(10);
    let recorder = Recorder::new();

    let id = engine.start_transfer(transmitter(10, &source, &recorder), true).unwrap();
    let waiting = engine.start_transfer(transmitter(10, &source, &recorder), false).unwrap();
    engine.process_action();

    engine.on_bt_event(&BtEvent::CommandRejected {
        connection: CONN,
        code: 0x14,
        reason: 0x0000,
    });

    assert_eq!(
        recorder.lock().unwrap().finished,
        vec![(id, Err(TransferError::CommandRejected(0x0000)))]
    );
    assert_eq!(engine.state(waiting), Some(TransferState::RequestResponse));
}

#[test]
fn test_receive_completion_closes_once() {
    let engine = TransferEngine::new(MockStack::new());
    let sink = Sink::new(1);
    let recorder = Recorder::new();

    let id = engine.start_transfer(receiver(300, &sink, &recorder), false).unwrap();
    assert_eq!(engine.state(id), Some(TransferState::RequestResponse));

    engine.on_bt_event(&open_request(Spsm::OTS, 0x0041, 100, 5));
    assert_eq!(engine.state(id), Some(TransferState::ActiveReceive));
    assert_eq!(
        engine.stack().commands(),
        vec![Command::Response {
            connection: CONN,
            cid: 0x0041,
            max_sdu: 100,
            max_pdu: 100,
            credit: 1,
            result: ConnectionResult::Success,
        }]
    );
    assert_eq!(recorder.lock().unwrap().opened, vec![id]);

    engine.on_bt_event(&data(0x0041, 100));
    engine.on_bt_event(&data(0x0041, 100));
    assert_eq!(engine.transfer(id).unwrap().data_offset, 200);
    assert_eq!(engine.transfer(id).unwrap().credit, 1);

    engine.on_bt_event(&data(0x0041, 100));
    assert_eq!(engine.state(id), Some(TransferState::Closing));
    assert_eq!(engine.stack().close_count(), 1);

    // Late data while closing is dropped and never closes twice
    engine.on_bt_event(&data(0x0041, 10));
    assert_eq!(engine.stack().close_count(), 1);

    let offsets: Vec<u32> = sink.lock().unwrap().received.iter().map(|(offset, _)| *offset).collect();
    assert_eq!(offsets, vec![0, 100, 200]);

    let credits: Vec<Command> = engine
        .stack()
        .commands()
        .into_iter()
        .filter(|command| matches!(command, Command::Credit { .. }))
        .collect();
    assert_eq!(credits.len(), 3);

    // The grant asked for by the last segment goes out before the close
    let commands = engine.stack().commands();
    let last_credit = commands.iter().rposition(|command| matches!(command, Command::Credit { .. }));
    let close = commands.iter().position(|command| matches!(command, Command::Close { .. }));
    assert!(last_credit < close);

    // A peer disconnect after all bytes arrived still counts as success
    engine.on_bt_event(&closed(0x0041, CloseReason::RemoteDisconnected));
    assert_eq!(recorder.lock().unwrap().finished, vec![(id, Ok(()))]);
    assert_eq!(engine.stats().segments_received, 3);
}

#[test]
fn test_open_request_without_waiting_transfer_is_rejected() {
    let engine = TransferEngine::new(MockStack::new());

    engine.on_bt_event(&open_request(Spsm::OTS, 0x0042, 100, 5));
    assert_eq!(
        engine.stack().commands(),
        vec![Command::Response {
            connection: CONN,
            cid: 0x0042,
            max_sdu: 0,
            max_pdu: 0,
            credit: 0,
            result: ConnectionResult::NoResourcesAvailable,
        }]
    );
}

#[test]
fn test_open_request_matches_spsm() {
    let engine = TransferEngine::new(MockStack::new());
    let sink = Sink::new(0);
    let recorder = Recorder::new();

    let ots = engine.start_transfer(receiver(10, &sink, &recorder), false).unwrap();
    engine.on_bt_event(&open_request(Spsm::IPSP, 0x0040, 100, 1));
    assert_eq!(engine.state(ots), Some(TransferState::RequestResponse));

    let any = engine
        .start_transfer(receiver(10, &sink, &recorder).with_spsm(Spsm::UNSET), false)
        .unwrap();
    engine.on_bt_event(&open_request(Spsm::IPSP, 0x0041, 100, 1));
    assert_eq!(engine.state(any), Some(TransferState::ActiveReceive));
    assert_eq!(engine.transfer(any).unwrap().spsm, Spsm::IPSP);
    assert_eq!(engine.state(ots), Some(TransferState::RequestResponse));
}

#[test]
fn test_responder_transmitter_uses_peer_credit() {
    let engine = TransferEngine::new(MockStack::new());
    let source = Source::new(30);
    let recorder = Recorder::new();

    let id = engine
        .start_transfer(transmitter(30, &source, &recorder).with_credit(4), false)
        .unwrap();
    engine.on_bt_event(&open_request(Spsm::OTS, 0x0050, 23, 2));

    let held = engine.transfer(id).unwrap();
    assert_eq!(held.credit, 2);
    assert_eq!(held.max_pdu, 23);
    assert!(matches!(
        engine.stack().commands()[0],
        Command::Response { credit: 4, .. }
    ));

    engine.process_action();
    engine.process_action();
    assert_eq!(engine.stack().data_sizes(), vec![23, 7]);
    assert_eq!(engine.state(id), Some(TransferState::Closing));
}

#[test]
fn test_increase_credit() {
    let engine = TransferEngine::new(MockStack::new());
    let sink = Sink::new(0);
    let recorder = Recorder::new();

    let id = engine.start_transfer(receiver(100, &sink, &recorder), false).unwrap();
    assert_eq!(engine.increase_credit(id, 3).unwrap_err(), TransferError::InvalidState);
    assert_eq!(
        engine.increase_credit(TransferId(999), 3).unwrap_err(),
        TransferError::UnknownTransfer
    );

    engine.on_bt_event(&open_request(Spsm::OTS, 0x0040, 100, 1));
    engine.increase_credit(id, 3).unwrap();
    assert_eq!(engine.transfer(id).unwrap().credit, 4);
    assert_eq!(
        engine.stack().commands().last(),
        Some(&Command::Credit {
            connection: CONN,
            cid: 0x0040,
            credit: 3,
        })
    );
}

#[test]
fn test_abort_before_open() {
    let engine = TransferEngine::new(MockStack::new());
    let source = Source::new(10);
    let recorder = Recorder::new();

    let id = engine.start_transfer(transmitter(10, &source, &recorder), true).unwrap();
    engine.abort_transfer(id).unwrap();

    assert_eq!(recorder.lock().unwrap().finished, vec![(id, Err(TransferError::Aborted))]);
    assert!(engine.stack().commands().is_empty());
    assert_eq!(engine.abort_transfer(id).unwrap_err(), TransferError::UnknownTransfer);
}

#[test]
fn test_abort_active_transfer() {
    let engine = TransferEngine::new(MockStack::new());
    let source = Source::new(100);
    let recorder = Recorder::new();

    let (id, cid) = open_transmitter(&engine, transmitter(100, &source, &recorder).with_max_pdu(40), 1);
    engine.process_action();

    engine.abort_transfer(id).unwrap();
    assert_eq!(engine.stack().close_count(), 1);
    assert!(recorder.lock().unwrap().finished.is_empty());

    engine.on_bt_event(&closed(cid, CloseReason::LocalDisconnected));
    assert_eq!(recorder.lock().unwrap().finished, vec![(id, Err(TransferError::Aborted))]);
}

#[test]
fn test_abort_while_open_pending_keeps_channel_idle() {
    let engine = TransferEngine::new(MockStack::new());
    let source = Source::new(100);
    let recorder = Recorder::new();

    let id = engine.start_transfer(transmitter(100, &source, &recorder), true).unwrap();
    engine.process_action();
    engine.abort_transfer(id).unwrap();
    assert_eq!(engine.stack().close_count(), 1);
    assert_eq!(engine.state(id), Some(TransferState::RequestPending));

    // The peer accepts anyway: no data flows and the channel is closed again
    engine.on_bt_event(&open_response(0x0040, 2, ConnectionResult::Success));
    assert_eq!(engine.state(id), Some(TransferState::Closing));
    assert!(recorder.lock().unwrap().opened.is_empty());
    assert_eq!(engine.stack().close_count(), 2);

    engine.process_action();
    assert!(engine.stack().data_sizes().is_empty());

    engine.on_bt_event(&closed(0x0040, CloseReason::LocalDisconnected));
    assert_eq!(recorder.lock().unwrap().finished, vec![(id, Err(TransferError::Aborted))]);
    assert!(engine.is_ok_to_sleep());
}

#[test]
fn test_abort_while_open_pending_then_refused() {
    let engine = TransferEngine::new(MockStack::new());
    let source = Source::new(100);
    let recorder = Recorder::new();

    let id = engine.start_transfer(transmitter(100, &source, &recorder), true).unwrap();
    engine.process_action();
    engine.abort_transfer(id).unwrap();

    engine.on_bt_event(&open_response(0x0040, 0, ConnectionResult::NoResourcesAvailable));
    assert_eq!(recorder.lock().unwrap().finished, vec![(id, Err(TransferError::Aborted))]);
    assert_eq!(engine.stack().close_count(), 1);
}

#[test]
fn test_abort_with_failing_close_finishes_immediately() {
    let engine = TransferEngine::new(MockStack::new());
    let source = Source::new(100);
    let recorder = Recorder::new();

    let (id, _) = open_transmitter(&engine, transmitter(100, &source, &recorder), 1);
    *engine.stack().fail_close.lock().unwrap() = Some(StackError::NotConnected);

    engine.abort_transfer(id).unwrap();
    assert_eq!(recorder.lock().unwrap().finished, vec![(id, Err(TransferError::Aborted))]);
    assert!(engine.is_ok_to_sleep());
}

#[test]
fn test_unexpected_close_reports_reason() {
    let engine = TransferEngine::new(MockStack::new());
    let source = Source::new(100);
    let recorder = Recorder::new();

    let (id, cid) = open_transmitter(&engine, transmitter(100, &source, &recorder), 1);
    engine.on_bt_event(&closed(cid, CloseReason::RemoteDisconnected));

    assert_eq!(
        recorder.lock().unwrap().finished,
        vec![(id, Err(TransferError::Closed(CloseReason::RemoteDisconnected)))]
    );
}

#[test]
fn test_connection_closed_finishes_transfers_on_link() {
    let engine = TransferEngine::new(MockStack::new());
    let source = Source::new(100);
    let recorder = Recorder::new();

    let (active, _) = open_transmitter(&engine, transmitter(100, &source, &recorder), 1);
    let waiting = engine.start_transfer(transmitter(100, &source, &recorder), false).unwrap();
    let mut elsewhere = transmitter(100, &source, &recorder);
    elsewhere.connection = ConnectionHandle(2);
    let other = engine.start_transfer(elsewhere, false).unwrap();

    engine.on_bt_event(&BtEvent::ConnectionClosed {
        connection: CONN,
        reason: CloseReason::ConnectionLost,
    });

    let lost = Err(TransferError::Closed(CloseReason::ConnectionLost));
    assert_eq!(
        recorder.lock().unwrap().finished,
        vec![(active, lost.clone()), (waiting, lost)]
    );
    assert_eq!(engine.state(other), Some(TransferState::RequestResponse));
    assert_single_membership(&engine, 1);
}

#[test]
fn test_check_progress() {
    let engine = TransferEngine::new(MockStack::new());
    let source = Source::new(100);
    let recorder = Recorder::new();

    assert!(!engine.check_progress(TransferId(42)));

    let (id, cid) = open_transmitter(&engine, transmitter(100, &source, &recorder), 1);
    assert!(engine.check_progress(id));

    engine.on_bt_event(&closed(cid, CloseReason::ConnectionLost));
    assert!(!engine.check_progress(id));
}

#[test]
fn test_sleep_veto() {
    let engine = TransferEngine::new(MockStack::new());
    let sink = Sink::new(0);
    let recorder = Recorder::new();

    assert!(engine.is_ok_to_sleep());
    let id = engine.start_transfer(receiver(10, &sink, &recorder), false).unwrap();
    assert!(!engine.is_ok_to_sleep());
    engine.abort_transfer(id).unwrap();
    assert!(engine.is_ok_to_sleep());
}

#[test]
fn test_shutdown_finishes_everything() {
    let engine = TransferEngine::new(MockStack::new());
    let source = Source::new(100);
    let sink = Sink::new(0);
    let recorder = Recorder::new();

    let (active, _) = open_transmitter(&engine, transmitter(100, &source, &recorder), 1);
    let waiting = engine.start_transfer(receiver(10, &sink, &recorder), false).unwrap();
    let commands_before = engine.stack().commands().len();

    engine.shutdown();

    assert_eq!(
        recorder.lock().unwrap().finished,
        vec![
            (active, Err(TransferError::Shutdown)),
            (waiting, Err(TransferError::Shutdown)),
        ]
    );
    assert_eq!(engine.stack().commands().len(), commands_before);
    assert!(engine.is_ok_to_sleep());
    assert_eq!(engine.stats().failed, 2);
}

#[test]
fn test_events_for_unknown_channels_are_ignored() {
    let engine = TransferEngine::new(MockStack::new());
    let source = Source::new(100);
    let recorder = Recorder::new();

    let (id, _) = open_transmitter(&engine, transmitter(100, &source, &recorder), 1);

    engine.on_bt_event(&data(0x0077, 10));
    engine.on_bt_event(&BtEvent::LeChannelCredit {
        connection: CONN,
        cid: 0x0077,
        credit: 5,
    });
    engine.on_bt_event(&closed(0x0077, CloseReason::RemoteDisconnected));
    engine.on_bt_event(&open_response(0x0077, 5, ConnectionResult::Success));

    assert_eq!(engine.state(id), Some(TransferState::ActiveTransmit));
    assert_eq!(engine.transfer(id).unwrap().credit, 1);
    assert!(recorder.lock().unwrap().finished.is_empty());
}
