//! Record transfer between two peers.
//!
//! A sender walks its records in timestamp order from the peer's send
//! cursor, one batch per request, and advances the cursor only when the
//! peer acknowledges a batch. Receivers save a batch and then advance their
//! receive cursor to the batch's end watermark, so an interrupted transfer
//! resumes where the last acknowledged batch ended.

use crate::error::{SyncError, SyncResult};
use crate::operation::{report_status, OperationStatus};
use crate::runtime::PermissionFlags;
use crate::state_table::{SyncEvent, SyncState};
use crate::task_context::{DataTransfer, FeedDogDirection, Outstanding, SyncTarget, SyncTaskContext};
use crate::time_helper::shift;
use kvsync_protocol::{
    AckCode, DataAckPacket, DataRequestPacket, Message, MessageType, Packet, QuerySpec, SyncMode,
};
use kvsync_storage::DataItem;
use tracing::{debug, info, warn};

impl SyncTaskContext {
    pub(crate) fn initiative_data_sync_action(&self) -> SyncResult<Option<SyncEvent>> {
        let (mode, started, operation) = {
            let state = self.state.lock();
            (state.mode, state.transfer.is_some(), state.operation.clone())
        };
        if !started {
            self.clear_device_data_if_needed()?;
            if let Some(operation) = &operation {
                let preset = match mode {
                    SyncMode::Push => Some(OperationStatus::RecvFinished),
                    SyncMode::Pull => Some(OperationStatus::SendFinished),
                    _ => None,
                };
                if let Some(status) = preset {
                    report_status(
                        operation,
                        self.shared.runtime.as_ref(),
                        &self.device,
                        status,
                        None,
                    );
                }
            }
            let transfer = if mode.sends_data() {
                DataTransfer {
                    cursor: self.send_begin()?,
                    end: self.shared.storage.max_timestamp(),
                    outstanding: None,
                }
            } else {
                DataTransfer {
                    cursor: 0,
                    end: 0,
                    outstanding: None,
                }
            };
            self.state.lock().transfer = Some(transfer);
        }
        if mode.sends_data() {
            self.send_next_batch()
        } else {
            self.send_pull_request()
        }
    }

    pub(crate) fn passive_data_sync_action(&self) -> SyncResult<Option<SyncEvent>> {
        {
            let mut state = self.state.lock();
            if state.transfer.is_none() {
                state.transfer = Some(DataTransfer {
                    cursor: state.response_begin,
                    end: self.shared.storage.max_timestamp(),
                    outstanding: None,
                });
            }
        }
        self.send_next_batch()
    }

    /// Cursor the next push starts after.
    fn send_begin(&self) -> SyncResult<u64> {
        let (query, auto_lift) = self.cursor_params();
        match query {
            Some(query) => {
                self.shared
                    .metadata
                    .get_send_query_water_mark(&query.id, &self.device, auto_lift)
            }
            None => Ok(self.shared.metadata.get_peer_water_mark(&self.device)),
        }
    }

    /// Cursor the peer should stream its records after.
    fn recv_begin(&self) -> SyncResult<u64> {
        let (query, auto_lift) = self.cursor_params();
        match query {
            Some(query) => {
                self.shared
                    .metadata
                    .get_recv_query_water_mark(&query.id, &self.device, auto_lift)
            }
            None => Ok(self.shared.metadata.get_local_water_mark(&self.device)),
        }
    }

    fn cursor_params(&self) -> (Option<QuerySpec>, bool) {
        let state = self.state.lock();
        (
            state.query.clone(),
            state.negotiation_count < self.shared.config.negotiation_limit,
        )
    }

    /// Reads and sends the batch after the transfer cursor. The final batch
    /// is always sent, even when empty.
    fn send_next_batch(&self) -> SyncResult<Option<SyncEvent>> {
        let (mode, query, cursor, end, session_id, sequence_id) = {
            let state = self.state.lock();
            let transfer = state
                .transfer
                .ok_or_else(|| SyncError::inner("batch requested without a transfer"))?;
            (
                state.mode,
                state.query.clone(),
                transfer.cursor,
                transfer.end,
                state.session_id,
                state.sequence_id,
            )
        };
        let batch_size = self.shared.config.batch_size.max(1);
        let prefix = query.as_ref().map(|q| q.key_prefix.as_slice());
        let storage = &self.shared.storage;
        let items = if mode == SyncMode::ResponsePull {
            self.with_data_notify(session_id, sequence_id, || {
                storage.sync_data(cursor, end, prefix, batch_size)
            })?
        } else {
            storage.sync_data(cursor, end, prefix, batch_size)?
        };

        let last = items.len() < batch_size || items.last().is_some_and(|item| item.timestamp >= end);
        let end_watermark = items.last().map_or(cursor, |item| item.timestamp.max(cursor));
        let tombstones = items.iter().any(|item| item.deleted);
        let mut packet = DataRequestPacket::batch(mode, items, cursor, end_watermark)
            .with_query(query)
            .with_last(last);
        if last && mode == SyncMode::PushAndPull {
            packet = packet.with_pull_begin(self.recv_begin()?);
        }
        let feed_dog = packet.payload_size() > self.shared.communicator.mtu_size(&self.device);
        debug!(
            device = %self.masked(),
            %mode,
            count = packet.items.len(),
            begin = cursor,
            end = end_watermark,
            last,
            "sending batch"
        );
        let replaced = self.state.lock().transfer.as_mut().and_then(|transfer| {
            transfer.outstanding.replace(Outstanding::Batch {
                end_watermark,
                last,
                tombstones,
                feed_dog,
            })
        });
        // A resent batch releases the keep-alive of the attempt it replaces.
        if matches!(replaced, Some(Outstanding::Batch { feed_dog: true, .. })) {
            self.stop_feed_dog(FeedDogDirection::Send);
        }
        if feed_dog {
            self.start_feed_dog(FeedDogDirection::Send);
        }
        self.send_request(Packet::DataRequest(packet))?;
        Ok(None)
    }

    pub(crate) fn send_pull_request(&self) -> SyncResult<Option<SyncEvent>> {
        let query = self.state.lock().query.clone();
        let packet = DataRequestPacket::pull(self.recv_begin()?).with_query(query);
        {
            let mut state = self.state.lock();
            let transfer = state.transfer.get_or_insert(DataTransfer {
                cursor: 0,
                end: 0,
                outstanding: None,
            });
            transfer.outstanding = Some(Outstanding::PullRequest);
        }
        self.send_request(Packet::DataRequest(packet))?;
        Ok(None)
    }

    pub(crate) fn on_data_ack(&self, message: &Message) -> SyncResult<Option<SyncEvent>> {
        if !self.is_current_response(
            message,
            &[
                SyncState::InitiativeDataSync,
                SyncState::PassiveDataSync,
                SyncState::WaitForReceiveDataFinish,
            ],
        ) {
            return Ok(None);
        }
        let Packet::DataAck(ack) = &message.packet else {
            return Err(SyncError::inner("data response without ack"));
        };
        if ack.code == AckCode::NeedAbilitySync {
            return self.renegotiate();
        }
        if !ack.code.is_ok() {
            return Err(SyncError::from_ack(ack.code));
        }
        let (mode, outstanding) = {
            let mut state = self.state.lock();
            let outstanding = state
                .transfer
                .as_mut()
                .and_then(|transfer| transfer.outstanding.take());
            (state.mode, outstanding)
        };
        match outstanding {
            None => Ok(None),
            Some(Outstanding::PullRequest) => {
                self.reset_watchdog();
                Ok(Some(SyncEvent::WaitRecvData))
            }
            Some(Outstanding::Batch {
                end_watermark,
                last,
                tombstones,
                feed_dog,
            }) => {
                if mode != SyncMode::ResponsePull {
                    self.advance_send_water_mark(end_watermark, tombstones)?;
                }
                self.reset_watchdog();
                if feed_dog {
                    self.stop_feed_dog(FeedDogDirection::Send);
                }
                if let Some(transfer) = self.state.lock().transfer.as_mut() {
                    transfer.cursor = transfer.cursor.max(end_watermark);
                }
                if !last {
                    return self.send_next_batch();
                }
                match mode {
                    SyncMode::Push | SyncMode::PushAndPull => {
                        self.report_own(OperationStatus::SendFinished);
                        Ok(Some(if mode == SyncMode::Push {
                            SyncEvent::SendFinished
                        } else {
                            SyncEvent::WaitRecvData
                        }))
                    }
                    _ => Ok(Some(SyncEvent::SendFinished)),
                }
            }
        }
    }

    fn report_own(&self, status: OperationStatus) {
        let operation = self.state.lock().operation.clone();
        if let Some(operation) = operation {
            report_status(
                &operation,
                self.shared.runtime.as_ref(),
                &self.device,
                status,
                None,
            );
        }
    }

    /// The peer lost our ability info: negotiate again, within the limit.
    fn renegotiate(&self) -> SyncResult<Option<SyncEvent>> {
        let count = {
            let mut state = self.state.lock();
            state.negotiation_count += 1;
            state.transfer = None;
            state.negotiation_count
        };
        if count > self.shared.config.negotiation_limit {
            return Err(SyncError::NeedAbilitySync);
        }
        self.ability.lock().known = false;
        info!(device = %self.masked(), count, "peer requested ability sync");
        Ok(Some(SyncEvent::NeedAbilitySync))
    }

    fn advance_send_water_mark(&self, water_mark: u64, tombstones: bool) -> SyncResult<()> {
        let query = self.state.lock().query.clone();
        let metadata = &self.shared.metadata;
        match query {
            Some(query) => {
                let current = metadata.get_send_query_water_mark(&query.id, &self.device, false)?;
                if water_mark > current {
                    metadata.save_send_query_water_mark(&query.id, &self.device, water_mark)?;
                }
            }
            None => {
                if water_mark > metadata.get_peer_water_mark(&self.device) {
                    metadata.save_peer_water_mark(&self.device, water_mark)?;
                }
            }
        }
        if tombstones {
            let current = metadata.get_send_delete_sync_water_mark(&self.device, false)?;
            if water_mark > current {
                metadata.save_send_delete_sync_water_mark(&self.device, water_mark)?;
            }
        }
        Ok(())
    }

    /// Records a received batch's end watermark and returns the receive
    /// cursor now in effect.
    fn advance_recv_water_mark(
        &self,
        query: Option<&QuerySpec>,
        water_mark: u64,
        tombstones: bool,
    ) -> SyncResult<u64> {
        let metadata = &self.shared.metadata;
        let current = match query {
            Some(query) => {
                let current = metadata.get_recv_query_water_mark(&query.id, &self.device, false)?;
                if water_mark > current {
                    metadata.save_recv_query_water_mark(&query.id, &self.device, water_mark)?;
                }
                current.max(water_mark)
            }
            None => {
                let current = metadata.get_local_water_mark(&self.device);
                if water_mark > current {
                    metadata.save_local_water_mark(&self.device, water_mark)?;
                }
                current.max(water_mark)
            }
        };
        if tombstones {
            let deleted = metadata.get_recv_delete_sync_water_mark(&self.device, false)?;
            if water_mark > deleted {
                metadata.save_recv_delete_sync_water_mark(&self.device, water_mark)?;
            }
        }
        Ok(current)
    }

    fn clear_device_data_if_needed(&self) -> SyncResult<()> {
        let metadata = &self.shared.metadata;
        if !metadata.get_remove_data_mark(&self.device) {
            return Ok(());
        }
        info!(device = %self.masked(), "peer store was rebuilt, removing its records");
        self.shared.storage.remove_device_data(&self.device)?;
        metadata.erase_device_water_mark(&self.device)?;
        metadata.reset_meta_data_after_remove_data(&self.device)
    }

    /// Saves a batch with write times moved onto the local clock.
    fn save_received(
        &self,
        session_id: u32,
        sequence_id: u32,
        items: Vec<DataItem>,
        query: Option<&QuerySpec>,
        end_watermark: u64,
    ) -> SyncResult<u64> {
        let tombstones = items.iter().any(|item| item.deleted);
        if !items.is_empty() {
            let offset = self.shared.metadata.get_time_offset(&self.device);
            let items: Vec<DataItem> = items
                .into_iter()
                .map(|mut item| {
                    item.write_timestamp = shift(item.write_timestamp, offset.saturating_neg());
                    item
                })
                .collect();
            let storage = &self.shared.storage;
            self.with_data_notify(session_id, sequence_id, || {
                storage.put_sync_data(&self.device, items)
            })?;
        }
        self.advance_recv_water_mark(query, end_watermark, tombstones)
    }

    pub(crate) fn on_data_request(&self, message: Message) -> SyncResult<Option<SyncEvent>> {
        let Message {
            session_id,
            sequence_id,
            packet,
            ..
        } = message;
        let Packet::DataRequest(packet) = packet else {
            return Ok(None);
        };
        if packet.mode == SyncMode::ResponsePull {
            return self.on_pulled_data(session_id, sequence_id, packet);
        }
        self.on_pushed_data(session_id, sequence_id, packet);
        Ok(None)
    }

    fn send_data_ack(&self, session_id: u32, sequence_id: u32, ack: DataAckPacket) -> SyncResult<()> {
        self.send_reply(Message {
            kind: MessageType::Response,
            session_id,
            sequence_id,
            packet: Packet::DataAck(ack),
        })
    }

    /// Passive side of a push, or of the pull half of a task.
    fn on_pushed_data(&self, session_id: u32, sequence_id: u32, packet: DataRequestPacket) {
        let requests_pull = packet.requests_pull();
        let pull_begin = packet.pull_begin;
        let query = packet.query.clone();
        let ack = match self.accept_pushed_data(session_id, sequence_id, packet) {
            Ok(water_mark) => DataAckPacket::ok(water_mark),
            Err(e) => {
                warn!(device = %self.masked(), session_id, error = %e, "incoming batch refused");
                DataAckPacket::error(e.ack_code())
            }
        };
        let accepted = ack.code.is_ok();
        if let Err(e) = self.send_data_ack(session_id, sequence_id, ack) {
            debug!(device = %self.masked(), error = %e, "data ack not sent");
        }
        if accepted && requests_pull {
            debug!(device = %self.masked(), session_id, begin = pull_begin, "peer pull queued");
            self.add_sync_target(SyncTarget::Response {
                session_id,
                begin: pull_begin,
                query,
            });
        }
    }

    fn accept_pushed_data(
        &self,
        session_id: u32,
        sequence_id: u32,
        packet: DataRequestPacket,
    ) -> SyncResult<u64> {
        if !self.ability.lock().known {
            return Err(SyncError::NeedAbilitySync);
        }
        let runtime = &self.shared.runtime;
        if packet.mode != SyncMode::Pull
            && !runtime.check_permission(&self.device, PermissionFlags::RECEIVE)
        {
            return Err(SyncError::PermissionDenied);
        }
        if packet.requests_pull() && !runtime.check_permission(&self.device, PermissionFlags::SEND)
        {
            return Err(SyncError::PermissionDenied);
        }
        self.clear_device_data_if_needed()?;
        let DataRequestPacket {
            items,
            end_watermark,
            query,
            ..
        } = packet;
        self.save_received(session_id, sequence_id, items, query.as_ref(), end_watermark)
    }

    /// Requester side of a pull: the peer streams its records back on our
    /// session.
    fn on_pulled_data(
        &self,
        session_id: u32,
        sequence_id: u32,
        packet: DataRequestPacket,
    ) -> SyncResult<Option<SyncEvent>> {
        let waiting = {
            let state = self.state.lock();
            state.machine == SyncState::WaitForReceiveDataFinish && state.session_id == session_id
        };
        if !waiting {
            debug!(device = %self.masked(), session_id, "pulled data for finished session dropped");
            return Ok(None);
        }
        let last = packet.last;
        if !last && packet.payload_size() > self.shared.communicator.mtu_size(&self.device) {
            self.start_feed_dog(FeedDogDirection::Receive);
        }
        let DataRequestPacket {
            items,
            end_watermark,
            query,
            ..
        } = packet;
        let water_mark =
            match self.save_received(session_id, sequence_id, items, query.as_ref(), end_watermark) {
                Ok(water_mark) => water_mark,
                Err(e) => {
                    if let Err(send_error) = self.send_data_ack(
                        session_id,
                        sequence_id,
                        DataAckPacket::error(e.ack_code()),
                    ) {
                        debug!(device = %self.masked(), error = %send_error, "data ack not sent");
                    }
                    return Err(e);
                }
            };
        self.reset_watchdog();
        self.send_data_ack(session_id, sequence_id, DataAckPacket::ok(water_mark))?;
        if !last {
            return Ok(None);
        }
        self.stop_feed_dog(FeedDogDirection::Receive);
        self.report_own(OperationStatus::RecvFinished);
        Ok(Some(SyncEvent::RecvFinished))
    }
}
