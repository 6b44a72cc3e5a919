//! State machine driving one peer's task.
//!
//! Transitions come from the versioned tables in [`crate::state_table`];
//! this module holds the action run on entering each state and the handlers
//! for time sync, ability sync and control messages. Data transfer lives in
//! [`crate::data_sync`].

use crate::ability_sync::{answer_request, build_notify, build_request, check_ack};
use crate::config::backoff_timeout;
use crate::error::{SyncError, SyncResult};
use crate::operation::{report_status, OperationStatus};
use crate::runtime::{PermissionFlags, TimerId};
use crate::state_table::{SyncEvent, SyncState};
use crate::task_context::{MachineInput, SyncTarget, SyncTaskContext};
use crate::time_sync::{compute_offset, respond};
use kvsync_protocol::{
    AbilitySyncAck, AckCode, ControlCommand, ControlPacket, Message, MessageId, MessageType,
    Packet, SyncMode, TimeSyncPacket, SOFTWARE_VERSION_RELEASE_3_0,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

impl SyncTaskContext {
    pub(crate) fn dispatch(&self, input: MachineInput) {
        match input {
            MachineInput::TaskAdded => self.on_task_added(),
            MachineInput::Message(message) => self.on_message(message),
            MachineInput::Timeout(timer) => self.on_timeout(timer),
            MachineInput::CommError { session_id, error } => self.on_comm_error(session_id, error),
            MachineInput::Abort { sync_id } => self.on_abort(sync_id),
            MachineInput::Offline => self.on_offline(),
        }
    }

    fn on_task_added(&self) {
        if self.state.lock().machine != SyncState::Idle {
            return;
        }
        if let Some(event) = self.run_action(SyncState::Idle) {
            self.switch_state(event);
        }
    }

    /// Applies `event` and every event produced by the actions it triggers.
    pub(crate) fn switch_state(&self, event: SyncEvent) {
        let mut pending = Some(event);
        while let Some(event) = pending.take() {
            let current = self.state.lock().machine;
            let version = self.ability.lock().remote_software_version;
            let Some(next) = self.shared.tables.select(version).next(current, event) else {
                debug!(device = %self.masked(), state = ?current, ?event, "event ignored");
                return;
            };
            debug!(device = %self.masked(), from = ?current, to = ?next, ?event, "state switch");
            self.state.lock().machine = next;
            pending = self.run_action(next);
        }
    }

    fn run_action(&self, state: SyncState) -> Option<SyncEvent> {
        let result = match state {
            SyncState::Idle => Ok(self.start_next_task()),
            SyncState::TimeSync => self.time_sync_action(),
            SyncState::AbilitySync => self.ability_sync_action(),
            SyncState::InitiativeDataSync => self.initiative_data_sync_action(),
            SyncState::WaitForReceiveDataFinish => Ok(None),
            SyncState::PassiveDataSync => self.passive_data_sync_action(),
            SyncState::SyncControlCmd => self.control_cmd_action(),
            SyncState::SyncTaskFinished => Ok(Some(self.finish_task())),
            SyncState::SyncTimeout => {
                self.record_failure(OperationStatus::Timeout, Some(SyncError::Timeout));
                Ok(Some(SyncEvent::AnyEvent))
            }
            SyncState::InnerError => {
                self.record_failure(OperationStatus::Failed, None);
                Ok(Some(SyncEvent::AnyEvent))
            }
        };
        match result {
            Ok(event) => event,
            Err(e) => {
                warn!(device = %self.masked(), state = ?state, error = %e, "sync action failed");
                self.fail_task(e);
                Some(SyncEvent::InnerErr)
            }
        }
    }

    /// Keeps the first failure of a task.
    pub(crate) fn record_failure(&self, status: OperationStatus, cause: Option<SyncError>) {
        let mut state = self.state.lock();
        if state.failure.is_none() {
            state.failure = Some((status, cause));
        }
    }

    pub(crate) fn fail_task(&self, error: SyncError) {
        self.record_failure(error.operation_status(), Some(error));
    }

    fn start_next_task(&self) -> Option<SyncEvent> {
        loop {
            let target = self.get_next_target()?;
            let operation = {
                let mut state = self.state.lock();
                let last = state.last_session_id;
                state.clear();
                state.last_session_id = last;
                match target {
                    SyncTarget::Request { operation } => {
                        state.mode = operation.mode();
                        state.query = operation.query().cloned();
                        state.is_auto = operation.is_auto();
                        state.session_id = self.generate_session_id(operation.id(), last);
                        state.operation = Some(Arc::clone(&operation));
                        Some(operation)
                    }
                    SyncTarget::Response {
                        session_id,
                        begin,
                        query,
                    } => {
                        state.mode = SyncMode::ResponsePull;
                        state.session_id = session_id;
                        state.response_begin = begin;
                        state.query = query;
                        None
                    }
                }
            };
            if let Err(e) = self.start_watchdog() {
                warn!(device = %self.masked(), error = %e, "watchdog not armed, task dropped");
                if let Some(operation) = &operation {
                    report_status(
                        operation,
                        self.shared.runtime.as_ref(),
                        &self.device,
                        e.operation_status(),
                        Some(&e),
                    );
                }
                self.state.lock().clear();
                continue;
            }
            let (session_id, mode) = self.current_session_and_mode();
            if let Some(operation) = &operation {
                report_status(
                    operation,
                    self.shared.runtime.as_ref(),
                    &self.device,
                    OperationStatus::Syncing,
                    None,
                );
            }
            info!(device = %self.masked(), session_id, %mode, "sync task started");
            return Some(SyncEvent::StartSync);
        }
    }

    fn current_session_and_mode(&self) -> (u32, SyncMode) {
        let state = self.state.lock();
        (state.session_id, state.mode)
    }

    fn finish_task(&self) -> SyncEvent {
        self.stop_watchdog();
        self.stop_all_feed_dogs();
        let (operation, failure, session_id, mode) = {
            let mut state = self.state.lock();
            let operation = state.operation.take();
            let failure = state.failure.take();
            let finished = (operation, failure, state.session_id, state.mode);
            state.clear();
            finished
        };
        if let Some(operation) = operation {
            match failure {
                Some((status, cause)) => report_status(
                    &operation,
                    self.shared.runtime.as_ref(),
                    &self.device,
                    status,
                    cause.as_ref(),
                ),
                None => {
                    let done = operation
                        .status(&self.device)
                        .is_some_and(|status| status.is_terminal());
                    if !done {
                        report_status(
                            &operation,
                            self.shared.runtime.as_ref(),
                            &self.device,
                            OperationStatus::Failed,
                            None,
                        );
                    }
                }
            }
            info!(
                device = %self.masked(),
                sync_id = operation.id(),
                session_id,
                status = ?operation.status(&self.device),
                "sync task finished"
            );
        } else {
            debug!(device = %self.masked(), session_id, %mode, "passive task finished");
        }
        SyncEvent::AllTaskFinished
    }

    /// Whether `message` answers the exchange the task is waiting on.
    pub(crate) fn is_current_response(&self, message: &Message, expected: &[SyncState]) -> bool {
        let state = self.state.lock();
        let current = expected.contains(&state.machine)
            && message.session_id == state.session_id
            && message.sequence_id == state.sequence_id;
        if !current {
            debug!(
                device = %self.masked(),
                state = ?state.machine,
                session_id = message.session_id,
                sequence_id = message.sequence_id,
                "stale response dropped"
            );
        }
        current
    }

    fn on_message(&self, message: Message) {
        let result = match (message.id(), message.kind) {
            (_, MessageType::Notify) if matches!(message.packet, Packet::Notify { .. }) => {
                self.on_keep_alive(&message);
                Ok(None)
            }
            (MessageId::TimeSync, MessageType::Request) => {
                self.on_time_sync_request(&message);
                Ok(None)
            }
            (MessageId::TimeSync, MessageType::Response) => self.on_time_sync_response(&message),
            (MessageId::AbilitySync, MessageType::Request) => {
                self.on_ability_request(&message);
                Ok(None)
            }
            (MessageId::AbilitySync, MessageType::Response) => self.on_ability_ack(&message),
            (MessageId::AbilitySync, MessageType::Notify) => {
                self.on_ability_notify(&message);
                Ok(None)
            }
            (MessageId::DataSync, MessageType::Request) => self.on_data_request(message),
            (MessageId::DataSync, MessageType::Response) => self.on_data_ack(&message),
            (MessageId::ControlSync, MessageType::Request) => {
                self.on_control_request(&message);
                Ok(None)
            }
            (MessageId::ControlSync, MessageType::Response) => self.on_control_ack(&message),
            (id, kind) => {
                debug!(device = %self.masked(), ?id, ?kind, "unexpected message dropped");
                Ok(None)
            }
        };
        match result {
            Ok(Some(event)) => self.switch_state(event),
            Ok(None) => {}
            Err(e) => {
                warn!(device = %self.masked(), error = %e, "sync task failed");
                if self.state.lock().machine.is_working() {
                    self.fail_task(e);
                    self.switch_state(SyncEvent::InnerErr);
                }
            }
        }
    }

    fn on_keep_alive(&self, message: &Message) {
        let current = {
            let state = self.state.lock();
            state.machine.is_working() && state.session_id == message.session_id
        };
        if current {
            self.reset_watchdog();
        }
    }

    fn on_timeout(&self, timer: TimerId) {
        let (machine, retry, eligible, limit, is_auto) = {
            let state = self.state.lock();
            if state.timer_id != Some(timer) || !state.machine.is_working() {
                return;
            }
            let is_control = state.mode.is_control();
            let eligible = state.is_auto
                || is_control
                || self.shared.sync_retry.load(std::sync::atomic::Ordering::SeqCst);
            (
                state.machine,
                state.retry_count,
                eligible,
                self.shared.config.retry_limit(state.is_auto, is_control),
                state.is_auto,
            )
        };
        if eligible && retry < limit {
            let retry = retry + 1;
            self.state.lock().retry_count = retry;
            // Only auto syncs back off; manual retries keep the base interval.
            let interval = if is_auto {
                backoff_timeout(self.base_timeout(), retry)
            } else {
                self.base_timeout()
            };
            info!(device = %self.masked(), retry, ?interval, state = ?machine, "sync timed out, retrying");
            if let Err(e) = self.shared.runtime.modify_timer(timer, interval) {
                warn!(device = %self.masked(), error = %e, "watchdog not re-armed");
            }
            let event = if machine == SyncState::WaitForReceiveDataFinish {
                match self.send_pull_request() {
                    Ok(event) => event,
                    Err(e) => {
                        self.fail_task(e);
                        Some(SyncEvent::InnerErr)
                    }
                }
            } else {
                self.run_action(machine)
            };
            if let Some(event) = event {
                self.switch_state(event);
            }
            return;
        }
        warn!(device = %self.masked(), state = ?machine, retry, "sync timed out");
        self.switch_state(SyncEvent::TimeOut);
    }

    fn on_comm_error(&self, session_id: u32, error: SyncError) {
        let current = {
            let state = self.state.lock();
            state.machine.is_working() && state.session_id == session_id
        };
        if !current {
            debug!(device = %self.masked(), session_id, "send error for finished session");
            return;
        }
        warn!(device = %self.masked(), session_id, error = %error, "send failed after acceptance");
        self.fail_task(SyncError::CommunicationAbnormal);
        self.switch_state(SyncEvent::InnerErr);
    }

    fn on_abort(&self, sync_id: u32) {
        let current = {
            let state = self.state.lock();
            state.machine.is_working()
                && state.operation.as_ref().is_some_and(|op| op.id() == sync_id)
        };
        if current {
            info!(device = %self.masked(), sync_id, "sync task aborted");
            self.record_failure(OperationStatus::Failed, None);
            self.switch_state(SyncEvent::InnerErr);
        }
    }

    fn on_offline(&self) {
        self.set_comm_normal(false);
        {
            let mut ability = self.ability.lock();
            ability.known = false;
        }
        self.time_sync.invalidate();
        self.fail_queued(OperationStatus::CommAbnormal);
        if self.state.lock().machine.is_working() {
            info!(device = %self.masked(), "peer went offline during sync");
            self.fail_task(SyncError::CommunicationAbnormal);
            self.switch_state(SyncEvent::InnerErr);
        }
    }

    fn time_sync_action(&self) -> SyncResult<Option<SyncEvent>> {
        let mode = self.state.lock().mode;
        if mode == SyncMode::ResponsePull
            || !self.time_sync.needs_sync(
                &self.shared.metadata,
                &self.device,
                self.shared.config.time_sync_interval,
            )
        {
            return Ok(Some(SyncEvent::TimeSyncFinished));
        }
        let packet = TimeSyncPacket::request(self.shared.time_helper.get_time());
        self.send_request(Packet::TimeSync(packet))?;
        Ok(None)
    }

    fn on_time_sync_request(&self, message: &Message) {
        let Packet::TimeSync(packet) = &message.packet else {
            return;
        };
        let received_at = self.shared.time_helper.get_time();
        self.time_sync
            .check_noise(&self.shared.metadata, &self.device, packet, received_at);
        let reply = respond(packet, received_at, self.shared.time_helper.get_time());
        if let Err(e) = self.send_reply(Message::response_to(message, Packet::TimeSync(reply))) {
            debug!(device = %self.masked(), error = %e, "time sync reply not sent");
        }
    }

    fn on_time_sync_response(&self, message: &Message) -> SyncResult<Option<SyncEvent>> {
        if !self.is_current_response(message, &[SyncState::TimeSync]) {
            return Ok(None);
        }
        let Packet::TimeSync(packet) = &message.packet else {
            return Err(SyncError::inner("time sync response without time packet"));
        };
        let mut packet = *packet;
        packet.source_time_end = self.shared.time_helper.get_time();
        let offset = compute_offset(&packet)?;
        self.time_sync.finish(
            &self.shared.metadata,
            self.shared.runtime.as_ref(),
            &self.device,
            offset,
            self.shared.config.time_sync_interval,
        )?;
        Ok(Some(SyncEvent::TimeSyncFinished))
    }

    fn ability_sync_action(&self) -> SyncResult<Option<SyncEvent>> {
        if self.ability.lock().known {
            return self.ability_finished_event().map(Some);
        }
        let request = build_request(self.shared.storage.as_ref())?;
        self.send_request(Packet::AbilityRequest(request))?;
        Ok(None)
    }

    /// Event leaving `AbilitySync` for the running task's mode.
    fn ability_finished_event(&self) -> SyncResult<SyncEvent> {
        let (mode, has_query) = {
            let state = self.state.lock();
            (state.mode, state.query.is_some())
        };
        let ability = *self.ability.lock();
        if has_query && !ability.ability.query_sync {
            return Err(SyncError::NotSupported("query sync".to_string()));
        }
        match mode {
            SyncMode::ResponsePull => Ok(SyncEvent::SwitchToProvideData),
            mode if mode.is_control() => {
                if ability.remote_software_version < SOFTWARE_VERSION_RELEASE_3_0
                    || !ability.ability.subscribe
                {
                    Err(SyncError::NotSupported("subscribe".to_string()))
                } else {
                    Ok(SyncEvent::ControlCmd)
                }
            }
            _ => Ok(SyncEvent::AbilitySyncFinished),
        }
    }

    fn on_ability_request(&self, message: &Message) {
        let Packet::AbilityRequest(request) = &message.packet else {
            return;
        };
        let ack = match answer_request(self.shared.storage.as_ref(), request) {
            Ok(ack) => ack,
            Err(e) => {
                warn!(device = %self.masked(), error = %e, "ability request not answered");
                AbilitySyncAck::new(e.ack_code())
            }
        };
        if ack.code.is_ok() {
            {
                let mut ability = self.ability.lock();
                ability.remote_software_version = request.software_version;
                ability.ability = request.ability;
            }
            if request.software_version > SOFTWARE_VERSION_RELEASE_3_0 {
                if let Err(e) = self
                    .shared
                    .metadata
                    .set_db_create_time(&self.device, request.db_create_time)
                {
                    warn!(device = %self.masked(), error = %e, "peer create time not saved");
                }
            }
        } else {
            warn!(device = %self.masked(), code = ?ack.code, "ability request refused");
        }
        if let Err(e) = self.send_reply(Message::response_to(message, Packet::AbilityAck(ack))) {
            debug!(device = %self.masked(), error = %e, "ability ack not sent");
        }
    }

    fn on_ability_ack(&self, message: &Message) -> SyncResult<Option<SyncEvent>> {
        if !self.is_current_response(message, &[SyncState::AbilitySync]) {
            return Ok(None);
        }
        let Packet::AbilityAck(ack) = &message.packet else {
            return Err(SyncError::inner("ability response without ack"));
        };
        check_ack(self.shared.storage.as_ref(), ack)?;
        {
            let mut ability = self.ability.lock();
            ability.known = true;
            ability.remote_software_version = ack.software_version;
            ability.ability = ack.ability;
        }
        if ack.software_version > SOFTWARE_VERSION_RELEASE_3_0 {
            self.shared
                .metadata
                .set_db_create_time(&self.device, ack.db_create_time)?;
        }
        let notify = build_notify(self.shared.storage.as_ref())?;
        let (session_id, sequence_id) = self.current_ids();
        self.send_reply(Message::notify(
            session_id,
            sequence_id,
            Packet::AbilityAck(notify),
        ))?;
        info!(device = %self.masked(), version = ack.software_version, "ability sync finished");
        self.ability_finished_event().map(Some)
    }

    fn on_ability_notify(&self, message: &Message) {
        let Packet::AbilityAck(ack) = &message.packet else {
            return;
        };
        if !ack.code.is_ok() {
            return;
        }
        let mut ability = self.ability.lock();
        ability.known = true;
        ability.remote_software_version = ack.software_version;
        ability.ability = ack.ability;
    }

    fn control_cmd_action(&self) -> SyncResult<Option<SyncEvent>> {
        let (mode, query) = {
            let state = self.state.lock();
            (state.mode, state.query.clone())
        };
        let query =
            query.ok_or_else(|| SyncError::invalid_args("control command without a query"))?;
        let command = if mode == SyncMode::SubscribeQuery {
            ControlCommand::Subscribe
        } else {
            ControlCommand::Unsubscribe
        };
        self.send_request(Packet::Control(ControlPacket { command, query }))?;
        Ok(None)
    }

    fn on_control_request(&self, message: &Message) {
        let Packet::Control(packet) = &message.packet else {
            return;
        };
        let code = if !self.ability.lock().known {
            AckCode::NeedAbilitySync
        } else if !self
            .shared
            .runtime
            .check_permission(&self.device, PermissionFlags::SEND)
        {
            AckCode::PermissionDenied
        } else {
            match packet.command {
                ControlCommand::Subscribe => {
                    self.shared.subscribe(&self.device, packet.query.clone())
                }
                ControlCommand::Unsubscribe => {
                    self.shared.unsubscribe(&self.device, &packet.query.id)
                }
            }
            AckCode::Ok
        };
        if let Err(e) = self.send_reply(Message::response_to(message, Packet::ControlAck(code))) {
            debug!(device = %self.masked(), error = %e, "control ack not sent");
        }
    }

    fn on_control_ack(&self, message: &Message) -> SyncResult<Option<SyncEvent>> {
        if !self.is_current_response(message, &[SyncState::SyncControlCmd]) {
            return Ok(None);
        }
        let Packet::ControlAck(code) = &message.packet else {
            return Err(SyncError::inner("control response without ack"));
        };
        if !code.is_ok() {
            return Err(SyncError::from_ack(*code));
        }
        let operation = self.state.lock().operation.clone();
        if let Some(operation) = operation {
            report_status(
                &operation,
                self.shared.runtime.as_ref(),
                &self.device,
                OperationStatus::FinishedAll,
                None,
            );
        }
        Ok(Some(SyncEvent::ControlCmdFinished))
    }
}
