//! Credit-based transfer engine
//!
//! This module drives [`Transfer`]s through their lifecycle:
//! - Issuing channel open requests from the poll loop
//! - Answering peer open requests for waiting responders
//! - Pushing one segment per poll while credit lasts
//! - Feeding received segments to the owner and granting credit back
//! - Funnelling every kind of termination through one finish path
//!
//! ```text
//!  start(open) ──▶ RequestOpen ──[poll]──▶ RequestPending ──[response ok]──┐
//!                                                                           ▼
//!  start(wait) ──▶ RequestResponse ──[peer request]──▶ ActiveTransmit / ActiveReceive
//!                                                                           │
//!                                                               [all bytes exchanged]
//!                                                                           ▼
//!                                     finished ◀──[channel closed]──── Closing
//! ```
//!
//! Any state can be left early through an error, a disconnect or an abort;
//! the owner's `on_finish` hook runs exactly once either way.

use std::collections::BTreeMap;
use std::sync::Mutex;

use log::{debug, info, trace, warn};

use super::config::EngineConfig;
use super::types::*;
use crate::error::{TransferError, TransferResult};
use crate::l2cap::psm::Spsm;
use crate::l2cap::types::{ChannelId, CloseReason, ConnectionHandle, ConnectionResult};
use crate::stack::{BleStack, BtEvent};
use crate::sync::lock;

/// Counters describing what the engine has done so far
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Segments handed to the stack
    pub segments_sent: u64,
    /// Segments delivered to receive hooks
    pub segments_received: u64,
    /// Transmit segments skipped because the hook returned an unusable length
    pub dropped_segments: u64,
    /// Transfers finished with success
    pub completed: u64,
    /// Transfers finished with an error
    pub failed: u64,
}

/// A transfer held by the engine
struct Entry {
    transfer: Transfer,
    state: TransferState,
    /// Set once the owner asked for an abort while a channel was up
    aborted: bool,
}

impl Entry {
    fn set_state(&mut self, id: TransferId, state: TransferState) {
        debug!("{}: {} -> {}", id, self.state, state);
        self.state = state;
    }

    fn matches(&self, connection: ConnectionHandle, cid: ChannelId, states: StateSet) -> bool {
        states.holds(self.state) && self.transfer.connection == connection && self.transfer.channel_id == cid
    }

    /// Outcome of a transfer whose channel went away
    fn closing_result(&self, reason: CloseReason) -> TransferResult<()> {
        if self.transfer.is_complete() && reason.is_disconnect() {
            Ok(())
        } else if self.aborted {
            Err(TransferError::Aborted)
        } else {
            Err(TransferError::Closed(reason))
        }
    }
}

/// Everything guarded by the engine lock
struct Table {
    entries: BTreeMap<TransferId, Entry>,
    next_id: u32,
    stats: EngineStats,
}

impl Table {
    fn allocate_id(&mut self) -> TransferId {
        let id = TransferId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    fn find_mut(
        &mut self,
        connection: ConnectionHandle,
        cid: ChannelId,
        states: StateSet,
    ) -> Option<(TransferId, &mut Entry)> {
        self.entries
            .iter_mut()
            .find(|(_, entry)| entry.matches(connection, cid, states))
            .map(|(id, entry)| (*id, entry))
    }
}

/// Channel-open request waiting to be issued by the poll loop
struct OpenRequest {
    id: TransferId,
    connection: ConnectionHandle,
    spsm: Spsm,
    max_sdu: u16,
    max_pdu: u16,
    credit: u16,
}

/// What an open response means for the pending transfer it matched
enum OpenOutcome {
    Opened(TransferId, Option<FinishHandler>),
    Refused(TransferId),
    /// The owner aborted while the request was outstanding
    Aborted(TransferId),
}

/// Segment the poll loop should ask for
struct SendSlot {
    id: TransferId,
    handler: TransmitHandler,
    connection: ConnectionHandle,
    cid: ChannelId,
    offset: u32,
    size: u32,
    max_pdu: u16,
}

/// Credit-based transfer engine
///
/// All methods take `&self`. The transfer table sits behind one lock that
/// is held only for lookups and state changes; stack calls and hooks run
/// with the lock released, so hooks may call back into the engine. A hook
/// must not abort its own transfer.
pub struct TransferEngine<S: BleStack> {
    /// Host stack used for every outbound command
    stack: S,
    /// Engine settings
    config: EngineConfig,
    /// Transfers mapped by id, in submission order
    table: Mutex<Table>,
}

impl<S: BleStack> TransferEngine<S> {
    /// Create a new transfer engine with default settings
    pub fn new(stack: S) -> Self {
        Self::with_config(stack, EngineConfig::default())
    }

    /// Create a new transfer engine
    pub fn with_config(stack: S, config: EngineConfig) -> Self {
        if !config.channel.validate() {
            warn!(
                "Default channel parameters (MTU {}, MPS {}) are outside the LE limits",
                config.channel.mtu, config.channel.mps
            );
        }

        Self {
            stack,
            config,
            table: Mutex::new(Table {
                entries: BTreeMap::new(),
                next_id: 1,
                stats: EngineStats::default(),
            }),
        }
    }

    /// Get the host stack
    pub fn stack(&self) -> &S {
        &self.stack
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        lock(&self.table).stats
    }

    /// Hand a transfer to the engine.
    ///
    /// With `open_channel` the engine opens the channel itself on the next
    /// poll; otherwise the transfer waits for the peer to open it.
    pub fn start_transfer(&self, mut transfer: Transfer, open_channel: bool) -> TransferResult<TransferId> {
        Self::validate(&transfer)?;

        if transfer.max_sdu == 0 {
            transfer.max_sdu = self.config.channel.mtu;
        }
        if transfer.max_pdu == 0 {
            transfer.max_pdu = self.config.channel.mps;
        }
        if transfer.credit == 0 {
            transfer.credit = self.config.default_credit;
        }
        transfer.channel_id = 0;

        let state = if open_channel {
            TransferState::RequestOpen
        } else {
            TransferState::RequestResponse
        };

        let mut table = lock(&self.table);
        if table.entries.len() >= self.config.max_transfers {
            return Err(TransferError::ResourceLimitReached);
        }

        let id = table.allocate_id();
        debug!(
            "{}: queued {:?} of {} bytes on connection {} ({})",
            id, transfer.mode, transfer.data_length, transfer.connection, state
        );
        table.entries.insert(
            id,
            Entry {
                transfer,
                state,
                aborted: false,
            },
        );

        Ok(id)
    }

    fn validate(transfer: &Transfer) -> TransferResult<()> {
        if transfer.mode == TransferMode::Inactive {
            return Err(TransferError::InvalidParameter("transfer mode is inactive".into()));
        }
        if transfer.callbacks.on_finish.is_none() {
            return Err(TransferError::MissingCallback("on_finish"));
        }

        match transfer.mode {
            TransferMode::Inactive => {}
            TransferMode::Transmit => {
                if transfer.callbacks.on_transmit.is_none() {
                    return Err(TransferError::MissingCallback("on_transmit"));
                }
                if transfer.data_length == 0 {
                    return Err(TransferError::InvalidParameter("nothing to transmit".into()));
                }
            }
            TransferMode::Receive => {
                if transfer.callbacks.on_receive.is_none() {
                    return Err(TransferError::MissingCallback("on_receive"));
                }
            }
        }

        if transfer.data_offset > transfer.data_length {
            return Err(TransferError::InvalidParameter(format!(
                "offset {} beyond length {}",
                transfer.data_offset, transfer.data_length
            )));
        }

        if !transfer.connection.is_valid() {
            return Err(TransferError::InvalidHandle);
        }

        Ok(())
    }

    /// Cooperative poll: issue at most one open request, then push one
    /// segment for every transmitting transfer that has credit.
    pub fn process_action(&self) {
        self.issue_open_request();

        let slots: Vec<SendSlot> = {
            let table = lock(&self.table);
            table
                .entries
                .iter()
                .filter(|(_, entry)| entry.state == TransferState::ActiveTransmit && entry.transfer.credit > 0)
                .filter_map(|(id, entry)| {
                    let handler = entry.transfer.callbacks.on_transmit.clone()?;
                    Some(SendSlot {
                        id: *id,
                        handler,
                        connection: entry.transfer.connection,
                        cid: entry.transfer.channel_id,
                        offset: entry.transfer.data_offset,
                        size: entry.transfer.next_segment_size(),
                        max_pdu: entry.transfer.max_pdu,
                    })
                })
                .collect()
        };

        for slot in slots {
            self.send_segment(slot);
        }
    }

    fn issue_open_request(&self) {
        let request = {
            let mut table = lock(&self.table);
            let next = table
                .entries
                .iter_mut()
                .find(|(_, entry)| entry.state == TransferState::RequestOpen);

            match next {
                Some((id, entry)) => {
                    let id = *id;
                    entry.set_state(id, TransferState::RequestPending);
                    OpenRequest {
                        id,
                        connection: entry.transfer.connection,
                        spsm: entry.transfer.spsm,
                        max_sdu: entry.transfer.max_sdu,
                        max_pdu: entry.transfer.max_pdu,
                        credit: entry.transfer.credit,
                    }
                }
                None => return,
            }
        };

        let opened = self.stack.open_le_channel(
            request.connection,
            request.spsm,
            request.max_sdu,
            request.max_pdu,
            request.credit,
        );

        match opened {
            Ok(cid) => {
                let held = match lock(&self.table).entries.get_mut(&request.id) {
                    Some(entry) => {
                        entry.transfer.channel_id = cid;
                        true
                    }
                    None => false,
                };

                if held {
                    info!(
                        "{}: requested channel {:#06x} on connection {} for {}",
                        request.id, cid, request.connection, request.spsm
                    );
                } else {
                    // Aborted or refused while the request was being issued
                    debug!("{}: gone before channel {:#06x} was assigned, closing it", request.id, cid);
                    if let Err(err) = self.stack.close_le_channel(request.connection, cid) {
                        debug!("{}: close of channel {:#06x} not needed: {}", request.id, cid, err);
                    }
                }
            }
            Err(err) => {
                warn!("{}: open request failed: {}", request.id, err);
                self.finish(request.id, Err(err.into()));
            }
        }
    }

    fn send_segment(&self, slot: SendSlot) {
        let sent = {
            let mut handler = lock(&slot.handler);
            let data = handler.on_transmit(slot.id, slot.offset, slot.size);

            if data.is_empty() || data.len() > slot.max_pdu as usize {
                warn!(
                    "{}: transmit hook returned {} bytes for a {} byte segment (max {}), retrying next poll",
                    slot.id,
                    data.len(),
                    slot.size,
                    slot.max_pdu
                );
                drop(handler);
                lock(&self.table).stats.dropped_segments += 1;
                return;
            }

            trace!("{}: sending {} bytes at offset {}", slot.id, data.len(), slot.offset);
            self.stack
                .send_le_channel_data(slot.connection, slot.cid, data)
                .map(|()| data.len() as u32)
        };

        let length = match sent {
            Ok(length) => length,
            Err(err) => {
                warn!("{}: send failed: {}", slot.id, err);
                self.finish(slot.id, Err(err.into()));
                return;
            }
        };

        let completed = {
            let mut table = lock(&self.table);
            table.stats.segments_sent += 1;

            match table.entries.get_mut(&slot.id) {
                Some(entry) if entry.state == TransferState::ActiveTransmit => {
                    entry.transfer.credit = entry.transfer.credit.saturating_sub(1);
                    entry.transfer.data_offset = entry.transfer.data_offset.saturating_add(length);
                    if entry.transfer.is_complete() {
                        entry.set_state(slot.id, TransferState::Closing);
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            }
        };

        if completed {
            self.close_completed(slot.id, slot.connection, slot.cid);
        }
    }

    /// Request the close of a channel whose bytes have all been exchanged
    fn close_completed(&self, id: TransferId, connection: ConnectionHandle, cid: ChannelId) {
        debug!("{}: all bytes exchanged, closing channel {:#06x}", id, cid);
        if let Err(err) = self.stack.close_le_channel(connection, cid) {
            warn!("{}: close request failed ({}), finishing locally", id, err);
            self.finish(id, Ok(()));
        }
    }

    /// Dispatch an event from the host stack
    pub fn on_bt_event(&self, event: &BtEvent) {
        match event {
            BtEvent::LeChannelOpenRequest { connection, spsm, cid, max_sdu, max_pdu, credit } => {
                self.handle_open_request(*connection, *spsm, *cid, *max_sdu, *max_pdu, *credit)
            }
            BtEvent::LeChannelOpenResponse { connection, cid, max_sdu, max_pdu, credit, result } => {
                self.handle_open_response(*connection, *cid, *max_sdu, *max_pdu, *credit, *result)
            }
            BtEvent::LeChannelData { connection, cid, data } => self.handle_data(*connection, *cid, data),
            BtEvent::LeChannelCredit { connection, cid, credit } => self.handle_credit(*connection, *cid, *credit),
            BtEvent::LeChannelClosed { connection, cid, reason } => {
                self.handle_channel_closed(*connection, *cid, *reason)
            }
            BtEvent::CommandRejected { connection, code, reason } => {
                self.handle_command_rejected(*connection, *code, *reason)
            }
            BtEvent::ConnectionClosed { connection, reason } => self.handle_connection_closed(*connection, *reason),
        }
    }

    fn handle_open_request(
        &self,
        connection: ConnectionHandle,
        spsm: Spsm,
        cid: ChannelId,
        max_sdu: u16,
        max_pdu: u16,
        credit: u16,
    ) {
        let accepted = {
            let mut table = lock(&self.table);
            let default_credit = self.config.default_credit;

            table
                .entries
                .iter_mut()
                .find(|(_, entry)| {
                    entry.state == TransferState::RequestResponse
                        && entry.transfer.connection == connection
                        && entry.transfer.spsm.accepts(spsm)
                })
                .and_then(|(id, entry)| {
                    let id = *id;
                    let active = TransferState::active_for(entry.transfer.mode)?;
                    let transfer = &mut entry.transfer;

                    transfer.max_sdu = transfer.max_sdu.min(max_sdu);
                    transfer.max_pdu = transfer.max_pdu.min(max_pdu);
                    if transfer.credit == 0 {
                        transfer.credit = default_credit;
                    }
                    transfer.channel_id = cid;
                    transfer.spsm = spsm;

                    let granted = transfer.credit;
                    if transfer.mode == TransferMode::Transmit {
                        transfer.credit = credit;
                    }

                    let response = (id, transfer.max_sdu, transfer.max_pdu, granted, transfer.callbacks.on_finish.clone());
                    entry.set_state(id, active);
                    Some(response)
                })
        };

        let Some((id, sdu, pdu, granted, finisher)) = accepted else {
            warn!(
                "No transfer waiting for {} on connection {}, rejecting channel {:#06x}",
                spsm, connection, cid
            );
            if let Err(err) = self.stack.send_le_channel_open_response(
                connection,
                cid,
                0,
                0,
                0,
                ConnectionResult::NoResourcesAvailable,
            ) {
                warn!("Failed to reject channel {:#06x}: {}", cid, err);
            }
            return;
        };

        match self
            .stack
            .send_le_channel_open_response(connection, cid, sdu, pdu, granted, ConnectionResult::Success)
        {
            Ok(()) => {
                info!("{}: accepted channel {:#06x} on connection {} (sdu {}, pdu {})", id, cid, connection, sdu, pdu);
                Self::notify_open(id, finisher);
            }
            Err(err) => {
                warn!("{}: open response failed: {}", id, err);
                self.finish(id, Err(err.into()));
            }
        }
    }

    fn handle_open_response(
        &self,
        connection: ConnectionHandle,
        cid: ChannelId,
        max_sdu: u16,
        max_pdu: u16,
        credit: u16,
        result: ConnectionResult,
    ) {
        let outcome = {
            let mut table = lock(&self.table);
            // The response can beat the channel id back from `open_le_channel`;
            // only the request in flight is pending without one.
            let matched = table.find_mut(connection, cid, StateSet::REQUEST_PENDING).map(|(id, _)| id);
            let in_flight = table.find_mut(connection, 0, StateSet::REQUEST_PENDING).map(|(id, _)| id);
            let Some(id) = matched.or(in_flight) else {
                debug!("Open response for unknown channel {:#06x} on connection {}", cid, connection);
                return;
            };
            let Some(entry) = table.entries.get_mut(&id) else {
                return;
            };

            if entry.transfer.channel_id == 0 {
                debug!("{}: response for channel {:#06x} arrived before the request returned", id, cid);
                entry.transfer.channel_id = cid;
            }

            if entry.aborted {
                if result.is_success() {
                    entry.set_state(id, TransferState::Closing);
                }
                OpenOutcome::Aborted(id)
            } else if !result.is_success() {
                OpenOutcome::Refused(id)
            } else {
                let transfer = &mut entry.transfer;
                transfer.max_sdu = transfer.max_sdu.min(max_sdu);
                transfer.max_pdu = transfer.max_pdu.min(max_pdu);
                if transfer.mode == TransferMode::Transmit {
                    transfer.credit = credit;
                }
                let finisher = transfer.callbacks.on_finish.clone();

                match TransferState::active_for(transfer.mode) {
                    Some(active) => {
                        entry.set_state(id, active);
                        OpenOutcome::Opened(id, finisher)
                    }
                    None => OpenOutcome::Refused(id),
                }
            }
        };

        match outcome {
            OpenOutcome::Opened(id, finisher) => {
                info!("{}: channel {:#06x} open on connection {}", id, cid, connection);
                Self::notify_open(id, finisher);
            }
            OpenOutcome::Refused(id) => {
                warn!("{}: channel {:#06x} rejected: {}", id, cid, result);
                self.finish(id, Err(TransferError::Rejected(result)));
            }
            OpenOutcome::Aborted(id) if result.is_success() => {
                info!("{}: channel {:#06x} opened after abort, closing it", id, cid);
                if let Err(err) = self.stack.close_le_channel(connection, cid) {
                    warn!("{}: close request failed ({}), removing transfer", id, err);
                    self.finish(id, Err(TransferError::Aborted));
                }
            }
            OpenOutcome::Aborted(id) => {
                debug!("{}: aborted open refused: {}", id, result);
                self.finish(id, Err(TransferError::Aborted));
            }
        }
    }

    fn handle_data(&self, connection: ConnectionHandle, cid: ChannelId, data: &[u8]) {
        let target = {
            let mut table = lock(&self.table);
            match table.find_mut(connection, cid, StateSet::ACTIVE_RECEIVE | StateSet::CLOSING) {
                Some((id, entry)) if entry.state == TransferState::ActiveReceive => {
                    if entry.transfer.credit == 0 {
                        warn!("{}: peer sent data without credit", id);
                    }
                    entry.transfer.credit = entry.transfer.credit.saturating_sub(1);
                    entry
                        .transfer
                        .callbacks
                        .on_receive
                        .clone()
                        .map(|handler| (id, handler, entry.transfer.data_offset))
                }
                Some((id, _)) => {
                    debug!("{}: dropping {} bytes received while closing", id, data.len());
                    None
                }
                None => {
                    trace!("Data for unknown channel {:#06x} on connection {}", cid, connection);
                    None
                }
            }
        };

        let Some((id, handler, offset)) = target else {
            return;
        };

        let extra_credit = lock(&handler).on_receive(id, offset, data);

        let (grant, completed) = {
            let mut table = lock(&self.table);
            table.stats.segments_received += 1;

            match table.entries.get_mut(&id) {
                Some(entry) if entry.state == TransferState::ActiveReceive => {
                    entry.transfer.data_offset = entry.transfer.data_offset.saturating_add(data.len() as u32);
                    entry.transfer.credit = entry.transfer.credit.saturating_add(extra_credit);
                    let completed = entry.transfer.is_complete();
                    if completed {
                        entry.set_state(id, TransferState::Closing);
                    }
                    (extra_credit, completed)
                }
                _ => (0, false),
            }
        };

        if grant > 0 {
            if let Err(err) = self.stack.send_le_channel_credit(connection, cid, grant) {
                warn!("{}: granting {} credits failed: {}", id, grant, err);
                if !completed {
                    self.finish(id, Err(err.into()));
                    return;
                }
            }
        }

        if completed {
            self.close_completed(id, connection, cid);
        }
    }

    fn handle_credit(&self, connection: ConnectionHandle, cid: ChannelId, credit: u16) {
        let mut table = lock(&self.table);
        match table.find_mut(connection, cid, StateSet::ACTIVE_TRANSMIT) {
            Some((id, entry)) => {
                entry.transfer.credit = entry.transfer.credit.saturating_add(credit);
                trace!("{}: +{} credits, now {}", id, credit, entry.transfer.credit);
            }
            None => trace!("Credit for unknown channel {:#06x} on connection {}", cid, connection),
        }
    }

    fn handle_channel_closed(&self, connection: ConnectionHandle, cid: ChannelId, reason: CloseReason) {
        let id = lock(&self.table)
            .find_mut(connection, cid, StateSet::HAS_CHANNEL)
            .map(|(id, _)| id);

        match id {
            Some(id) => {
                self.finish_with(id, |entry| entry.closing_result(reason));
            }
            None => debug!("Channel {:#06x} on connection {} closed: {}", cid, connection, reason),
        }
    }

    fn handle_command_rejected(&self, connection: ConnectionHandle, code: u8, reason: u16) {
        let id = lock(&self.table)
            .entries
            .iter()
            .find(|(_, entry)| entry.state == TransferState::RequestPending && entry.transfer.connection == connection)
            .map(|(id, _)| *id);

        match id {
            Some(id) => {
                warn!("{}: command {:#04x} rejected with reason {:#06x}", id, code, reason);
                self.finish(id, Err(TransferError::CommandRejected(reason)));
            }
            None => debug!("Command {:#04x} rejected on connection {}", code, connection),
        }
    }

    fn handle_connection_closed(&self, connection: ConnectionHandle, reason: CloseReason) {
        let ids: Vec<TransferId> = lock(&self.table)
            .entries
            .iter()
            .filter(|(_, entry)| entry.transfer.connection == connection)
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            self.finish_with(id, |entry| {
                if entry.transfer.is_complete() {
                    Ok(())
                } else {
                    entry.closing_result(reason)
                }
            });
        }
    }

    /// Grant the peer additional credits on a receiving transfer
    pub fn increase_credit(&self, id: TransferId, credit: u16) -> TransferResult<()> {
        let (connection, cid) = {
            let table = lock(&self.table);
            let entry = table.entries.get(&id).ok_or(TransferError::UnknownTransfer)?;
            if entry.state != TransferState::ActiveReceive {
                return Err(TransferError::InvalidState);
            }
            (entry.transfer.connection, entry.transfer.channel_id)
        };

        self.stack.send_le_channel_credit(connection, cid, credit)?;

        if let Some(entry) = lock(&self.table).entries.get_mut(&id) {
            entry.transfer.credit = entry.transfer.credit.saturating_add(credit);
        }

        Ok(())
    }

    /// Abort a transfer.
    ///
    /// A transfer with an open (or opening) channel gets a close request and
    /// finishes when the channel is gone; if the close request cannot be
    /// issued it finishes immediately. A transfer without a channel finishes
    /// immediately.
    pub fn abort_transfer(&self, id: TransferId) -> TransferResult<()> {
        let channel = {
            let mut table = lock(&self.table);
            let entry = table.entries.get_mut(&id).ok_or(TransferError::UnknownTransfer)?;

            if StateSet::HAS_CHANNEL.holds(entry.state) && entry.transfer.channel_id != 0 {
                entry.aborted = true;
                Some((entry.transfer.connection, entry.transfer.channel_id))
            } else {
                None
            }
        };

        match channel {
            Some((connection, cid)) => {
                info!("{}: aborting, closing channel {:#06x}", id, cid);
                if let Err(err) = self.stack.close_le_channel(connection, cid) {
                    warn!("{}: close request failed ({}), removing transfer", id, err);
                    self.finish_with(id, |entry| entry.closing_result(CloseReason::LocalDisconnected));
                }
            }
            None => {
                info!("{}: aborting before channel open", id);
                self.finish(id, Err(TransferError::Aborted));
            }
        }

        Ok(())
    }

    /// Whether the transfer is still exchanging data on an open channel
    pub fn check_progress(&self, id: TransferId) -> bool {
        lock(&self.table)
            .entries
            .get(&id)
            .map(|entry| StateSet::ACTIVE.holds(entry.state))
            .unwrap_or(false)
    }

    /// Current lifecycle state of a transfer, `None` once it finished
    pub fn state(&self, id: TransferId) -> Option<TransferState> {
        lock(&self.table).entries.get(&id).map(|entry| entry.state)
    }

    /// Snapshot of a held transfer
    pub fn transfer(&self, id: TransferId) -> Option<Transfer> {
        lock(&self.table).entries.get(&id).map(|entry| entry.transfer.clone())
    }

    /// Transfers currently in any of the given states
    pub fn transfers_in(&self, states: StateSet) -> Vec<TransferId> {
        lock(&self.table)
            .entries
            .iter()
            .filter(|(_, entry)| states.holds(entry.state))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Sleep veto: low-power entry is fine only when no transfer is held
    pub fn is_ok_to_sleep(&self) -> bool {
        lock(&self.table).entries.is_empty()
    }

    /// Drop every held transfer, notifying owners with
    /// [`TransferError::Shutdown`]. No stack calls are made.
    pub fn shutdown(&self) {
        let drained: Vec<(TransferId, Entry)> = {
            let mut table = lock(&self.table);
            let entries = std::mem::take(&mut table.entries);
            table.stats.failed += entries.len() as u64;
            entries.into_iter().collect()
        };

        if !drained.is_empty() {
            info!("Shutting down with {} transfers outstanding", drained.len());
        }

        for (id, entry) in drained {
            Self::notify_finish(id, entry, Err(TransferError::Shutdown));
        }
    }

    fn finish(&self, id: TransferId, result: TransferResult<()>) -> bool {
        self.finish_with(id, move |_| result)
    }

    /// The one way out of the engine: remove the transfer from the table
    /// and run its finish hook with the result computed from its last state.
    fn finish_with<F>(&self, id: TransferId, result: F) -> bool
    where
        F: FnOnce(&Entry) -> TransferResult<()>,
    {
        let (entry, result) = {
            let mut table = lock(&self.table);
            let Some(entry) = table.entries.remove(&id) else {
                return false;
            };
            let result = result(&entry);
            if result.is_ok() {
                table.stats.completed += 1;
            } else {
                table.stats.failed += 1;
            }
            (entry, result)
        };

        Self::notify_finish(id, entry, result);
        true
    }

    fn notify_finish(id: TransferId, entry: Entry, result: TransferResult<()>) {
        match &result {
            Ok(()) => info!(
                "{}: finished, {} of {} bytes",
                id, entry.transfer.data_offset, entry.transfer.data_length
            ),
            Err(err) => info!("{}: failed in state {}: {}", id, entry.state, err),
        }

        if let Some(handler) = entry.transfer.callbacks.on_finish {
            lock(&handler).on_finish(id, result);
        }
    }

    fn notify_open(id: TransferId, finisher: Option<FinishHandler>) {
        if let Some(handler) = finisher {
            lock(&handler).on_open(id);
        }
    }
}
