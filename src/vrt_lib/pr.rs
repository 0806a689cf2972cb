//! SCSI-3 persistent reservations (SPC-3 subset), one state machine per
//! LUN. Sits between the target frontend and the volume layer: the target
//! calls `check_rights` before any data command and routes PR-IN / PR-OUT
//! here. All state transitions are serialized per group by the caller.

use crate::vrt_lib::error::{VrtError, VrtResult};
use crate::vrt_lib::stream::{MemoryStream, StreamAccess, StreamExt};
use log::*;
use num_enum::TryFromPrimitive;

pub type Lun = u32;
pub type PrKey = u64;

pub const MAX_LUNS: usize = 256;

/// Sessions per node the target accepts
pub const TARGET_MAX_SESSIONS: u32 = 16;
/// The PR engine only tracks sessions of up to 32 nodes, fewer than the
/// cluster-wide maximum; a known limitation inherited from the protocol.
pub const PR_MAX_NODES: u32 = 32;
pub const MAX_GLOBAL_SESSION: u32 = PR_MAX_NODES * TARGET_MAX_SESSIONS;
/// Number of session ids reserved to keep registrations and reservations
/// across a nexus loss
pub const PR_NEXUS_LOSS_REGISTRATION_DATA: u32 = 64;
pub const MAX_GLOBAL_SESSION_PLUS_EXTRA: u32 =
    MAX_GLOBAL_SESSION + PR_NEXUS_LOSS_REGISTRATION_DATA;

pub const MAX_REGISTRATIONS: usize = 32;

/* SCSI operation codes the gate needs to recognize */
pub const INQUIRY: u8 = 0x12;
pub const RESERVE_6: u8 = 0x16;
pub const RELEASE_6: u8 = 0x17;
pub const WRITE_6: u8 = 0x0A;
pub const WRITE_10: u8 = 0x2A;
pub const WRITE_12: u8 = 0xAA;
pub const WRITE_16: u8 = 0x8A;
pub const PERSISTENT_RESERVE_IN: u8 = 0x5E;
pub const PERSISTENT_RESERVE_OUT: u8 = 0x5F;

/* Sense keys and additional sense codes */
pub const SCSI_SENSE_ILLEGAL_REQUEST: u8 = 0x05;
pub const SCSI_SENSE_UNIT_ATTENTION: u8 = 0x06;
pub const SCSI_ASC_INVALID_FIELD_IN_CDB: u16 = 0x2400;
pub const SCSI_ASC_INVALID_FIELD_IN_PARAMETER_LIST: u16 = 0x2600;
pub const SCSI_ASC_INVALID_RELEASE_OF_PERSISTENT_RESERVATION: u16 = 0x2604;
pub const SCSI_ASC_RESERVATIONS_RELEASED: u16 = 0x2A04;
pub const SCSI_ASC_RESERVATIONS_PREEMPTED: u16 = 0x2A05;
pub const SCSI_ASC_INSUFFICIENT_REGISTRATION_RESOURCES: u16 = 0x5503;

/* Reported capabilities */
pub const PR_CAP_WR_EX_RO: u16 = 0x20;
pub const PR_CAP_SIP_C: u8 = 0x08;

/* Reservation scope: only LU scope is supported */
pub const PR_LU_SCOPE: u8 = 0;

/// Reservation type of a LUN, SCSI wire values
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum PrType {
    /// Internal value, not a SCSI one
    #[default]
    None = 0x0,
    WriteExclusive = 0x1,
    ExclusiveAccess = 0x3,
    WriteExclusiveRegistrantsOnly = 0x5,
    ExclusiveAccessRegistrantsOnly = 0x6,
    WriteExclusiveAllRegistrants = 0x7,
    ExclusiveAccessAllRegistrants = 0x8,
}

impl PrType {
    fn all_registrants(self) -> bool {
        matches!(self, PrType::WriteExclusiveAllRegistrants
                     | PrType::ExclusiveAccessAllRegistrants)
    }

    fn registrants_only(self) -> bool {
        matches!(self, PrType::WriteExclusiveRegistrantsOnly
                     | PrType::ExclusiveAccessRegistrantsOnly)
    }

    fn single_holder(self) -> bool {
        matches!(self, PrType::WriteExclusive | PrType::ExclusiveAccess)
            || self.registrants_only()
    }
}

/// PR-OUT service actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum PrOutAction {
    Register = 0,
    Reserve = 1,
    Release = 2,
    Clear = 3,
    Preempt = 4,
    PreemptAndAbort = 5,
    RegisterAndIgnoreExistingKey = 6,
    RegisterAndMove = 7,
}

/// PR-IN service actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum PrInAction {
    ReadKeys = 0,
    ReadReservation = 1,
    ReportCapabilities = 2,
    /// Reserved in the protocol, not supported
    ReadFullStatus = 3,
}

/// Status returned to the initiator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiStatus {
    Good,
    ReservationConflict,
    CheckCondition { sense_key: u8, asc: u16 },
}

/// Outcome of a PR command: SCSI status plus the number of valid bytes in
/// the data-out buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScsiResult {
    pub status: ScsiStatus,
    pub data_len: usize,
}

impl ScsiResult {
    fn good(data_len: usize) -> Self {
        Self { status: ScsiStatus::Good, data_len }
    }

    fn conflict() -> Self {
        Self { status: ScsiStatus::ReservationConflict, data_len: 0 }
    }

    fn check_condition(sense_key: u8, asc: u16) -> Self {
        Self { status: ScsiStatus::CheckCondition { sense_key, asc }, data_len: 0 }
    }
}

/// Parsed parameters of a PR-OUT command
#[derive(Debug, Clone, Copy)]
pub struct PrOutParams {
    pub action: PrOutAction,
    pub scope: u8,
    pub pr_type: PrType,
    pub reservation_key: PrKey,
    pub service_action_key: PrKey,
    pub spec_i_pt: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrRegistration {
    pub session_id: u32,
    pub key: PrKey,
}

/// All the persistent-reservation state of one LUN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrInfo {
    pub reservation_type: PrType,
    pub pr_generation: u32,
    /// Session holding an SPC-2 reservation, if any
    pub spc2_reserve: Option<u32>,
    /// Index into `registrations` for single-holder reservation types
    pub holder_index: Option<usize>,
    pub registrations: [Option<PrRegistration>; MAX_REGISTRATIONS],
}

impl Default for PrInfo {
    fn default() -> Self {
        Self {
            reservation_type: PrType::None,
            pr_generation: 0,
            spc2_reserve: None,
            holder_index: None,
            registrations: [None; MAX_REGISTRATIONS],
        }
    }
}

impl PrInfo {
    /// Register a session, or change its key if already registered
    fn add_registration(&mut self, session_id: u32, key: PrKey) -> Option<usize> {
        let mut first_free = None;

        for (i, slot) in self.registrations.iter_mut().enumerate() {
            match slot {
                Some(reg) if reg.session_id == session_id => {
                    reg.key = key;
                    return Some(i);
                }
                None if first_free.is_none() => first_free = Some(i),
                _ => {}
            }
        }

        let i = first_free?;
        self.registrations[i] = Some(PrRegistration { session_id, key });
        Some(i)
    }

    fn del_registration(&mut self, session_id: u32) {
        for (i, slot) in self.registrations.iter_mut().enumerate() {
            if matches!(slot, Some(reg) if reg.session_id == session_id) {
                *slot = None;
                if self.holder_index == Some(i) {
                    self.holder_index = None;
                }
            }
        }
    }

    fn clear_registrations(&mut self) {
        self.registrations = [None; MAX_REGISTRATIONS];
        self.holder_index = None;
    }

    fn has_registrations(&self) -> bool {
        self.registrations.iter().any(|r| r.is_some())
    }

    fn is_registered(&self, session_id: u32) -> bool {
        self.registrations.iter().flatten()
            .any(|reg| reg.session_id == session_id && reg.key != 0)
    }

    fn registration_key(&self, session_id: u32) -> PrKey {
        self.registrations.iter().flatten()
            .find(|reg| reg.session_id == session_id)
            .map_or(0, |reg| reg.key)
    }

    fn holder(&self) -> Option<&PrRegistration> {
        self.registrations[self.holder_index?].as_ref()
    }

    fn set_holder(&mut self, session_id: u32) {
        self.holder_index = self.registrations.iter()
            .position(|r| matches!(r, Some(reg) if reg.session_id == session_id));
    }

    fn is_reserved(&self) -> bool {
        self.reservation_type != PrType::None
    }

    /// Is this session a reservation holder (spc3r23 5.6.9)?
    fn is_holder(&self, session_id: u32) -> bool {
        if self.reservation_type.all_registrants() {
            return self.is_registered(session_id);
        }
        if self.reservation_type.single_holder() {
            return self.holder().map_or(false, |reg| reg.session_id == session_id);
        }
        false
    }

    /// Reservation holder key reported by READ RESERVATION: 0 under the
    /// all-registrants types (spc3r23 5.6.9)
    fn holder_key(&self) -> PrKey {
        if self.reservation_type.single_holder() {
            self.holder().map_or(0, |reg| reg.key)
        } else {
            0
        }
    }

    fn drop_reservation(&mut self) {
        self.reservation_type = PrType::None;
        self.holder_index = None;
    }
}

impl std::fmt::Display for PrInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "type {:?}, generation {}, {} registrations",
               self.reservation_type, self.pr_generation,
               self.registrations.iter().flatten().count())?;
        if let Some(holder) = self.holder() {
            write!(f, ", held by session {}", holder.session_id)?;
        }
        if let Some(spc2) = self.spc2_reserve {
            write!(f, ", SPC-2 reserved by session {}", spc2)?;
        }
        Ok(())
    }
}

/// Unit-attention sink: (session, lun, sense key, asc)
pub type PrSenseCallback = Box<dyn FnMut(u32, Lun, u8, u16) + Send>;
/// Task-abort sink for PREEMPT AND ABORT: (session, lun)
pub type PrAbortCallback = Box<dyn FnMut(u32, Lun) + Send>;

/// Persistent-reservation state of every LUN of one target
pub struct PrContext {
    send_sense_data: PrSenseCallback,
    abort_tasks: PrAbortCallback,
    pr_info: Vec<PrInfo>,
}

impl PrContext {
    pub fn new(send_sense_data: PrSenseCallback, abort_tasks: PrAbortCallback) -> Self {
        Self {
            send_sense_data,
            abort_tasks,
            pr_info: vec![PrInfo::default(); MAX_LUNS],
        }
    }

    pub fn info(&self, lun: Lun) -> &PrInfo {
        &self.pr_info[lun as usize]
    }

    /// Notify a registrant with a unit attention. Stashed nexus-loss
    /// sessions are never called back.
    fn callback(&mut self, session_id: u32, lun: Lun, sense_key: u8, asc: u16) {
        assert!(session_id < MAX_GLOBAL_SESSION_PLUS_EXTRA);

        if session_id >= MAX_GLOBAL_SESSION {
            return; /* this session id is a lost nexus */
        }

        (self.send_sense_data)(session_id, lun, sense_key, asc);
    }

    /// Access gate applied to every data command (spc3r23 table on PR
    /// command handling). `cdb0` is the SCSI operation code.
    pub fn check_rights(&self, lun: Lun, cdb0: u8, session_id: u32) -> bool {
        assert!(session_id < MAX_GLOBAL_SESSION);
        let pr_info = self.info(lun);

        let write = cdb0 == WRITE_6 || cdb0 == WRITE_10 || cdb0 == WRITE_12
            || cdb0 == WRITE_16;

        if let Some(spc2_holder) = pr_info.spc2_reserve {
            if session_id != spc2_holder && cdb0 != INQUIRY {
                debug!("session {} denied on LUN {}: SPC-2 reserved by {}",
                       session_id, lun, spc2_holder);
                return false;
            }
            /* an SPC-2 reserve is in force, persistent reservations don't apply */
            return true;
        }

        if cdb0 == PERSISTENT_RESERVE_OUT || cdb0 == PERSISTENT_RESERVE_IN {
            return true;
        }

        let allowed = match pr_info.reservation_type {
            PrType::None => true,
            PrType::WriteExclusive => !write || pr_info.is_holder(session_id),
            PrType::ExclusiveAccess => pr_info.is_holder(session_id),
            PrType::WriteExclusiveRegistrantsOnly => {
                !write || pr_info.is_registered(session_id)
            }
            PrType::ExclusiveAccessRegistrantsOnly => pr_info.is_registered(session_id),
            PrType::WriteExclusiveAllRegistrants => {
                !write || pr_info.is_registered(session_id)
            }
            PrType::ExclusiveAccessAllRegistrants => pr_info.is_registered(session_id),
        };

        if !allowed {
            debug!("session {} cannot access LUN {}: reservation type {:?}",
                   session_id, lun, pr_info.reservation_type);
        }
        allowed
    }

    fn check_registration(&self, lun: Lun, session_id: u32, reservation_key: PrKey,
                          action: PrOutAction) -> bool {
        let pr_info = self.info(lun);
        let is_registered = pr_info.is_registered(session_id);
        let current_key = pr_info.registration_key(session_id);

        if action != PrOutAction::RegisterAndIgnoreExistingKey
            && is_registered && current_key != reservation_key
        {
            warn!("PR conflict: session {} key mismatch on LUN {} \
                   (received {} / current {})",
                  session_id, lun, reservation_key, current_key);
            return false;
        }

        if action != PrOutAction::RegisterAndIgnoreExistingKey
            && action != PrOutAction::Register
            && !is_registered
        {
            warn!("PR conflict: session {} not registered on LUN {}", session_id, lun);
            return false;
        }

        true
    }

    fn register(&mut self, lun: Lun, session_id: u32, service_action_key: PrKey) -> ScsiResult {
        if service_action_key != 0 {
            let added = self.pr_info[lun as usize]
                .add_registration(session_id, service_action_key);
            return match added {
                Some(_) => ScsiResult::good(0),
                None => {
                    warn!("no more free registrations on LUN {}", lun);
                    ScsiResult::check_condition(SCSI_SENSE_ILLEGAL_REQUEST,
                                                SCSI_ASC_INSUFFICIENT_REGISTRATION_RESOURCES)
                }
            };
        }

        /* spc3r23 5.6.10.3: registering key 0 unregisters, and may release
         * the reservation with it */
        let pr_info = self.info(lun);
        let mut release_reservation = false;
        let mut notify = vec![];

        if pr_info.is_reserved() {
            if pr_info.reservation_type.all_registrants() {
                // The reservation goes away with the last registrant
                release_reservation = pr_info.is_holder(session_id)
                    && !pr_info.registrations.iter().flatten()
                        .any(|reg| reg.session_id != session_id);
            } else if pr_info.is_holder(session_id) {
                release_reservation = true;
                if pr_info.reservation_type.registrants_only() {
                    notify = pr_info.registrations.iter().flatten()
                        .filter(|reg| reg.session_id != session_id)
                        .map(|reg| reg.session_id)
                        .collect();
                }
            }
        }

        for id in notify {
            self.callback(id, lun, SCSI_SENSE_UNIT_ATTENTION,
                          SCSI_ASC_RESERVATIONS_RELEASED);
        }

        let pr_info = &mut self.pr_info[lun as usize];
        if release_reservation {
            pr_info.drop_reservation();
        }
        pr_info.del_registration(session_id);

        debug!("session {} unregistered from LUN {}", session_id, lun);
        ScsiResult::good(0)
    }

    fn reserve(&mut self, lun: Lun, session_id: u32, pr_type: PrType) -> ScsiResult {
        let pr_info = &self.pr_info[lun as usize];

        if pr_info.is_reserved() && !pr_info.is_holder(session_id) {
            warn!("PR conflict: LUN {} already reserved by another session", lun);
            return ScsiResult::conflict();
        }

        if pr_info.is_reserved() && pr_info.is_holder(session_id)
            && pr_info.reservation_type != pr_type
        {
            warn!("PR conflict: session {} cannot change LUN {} reservation type \
                   ({:?} / current {:?})",
                  session_id, lun, pr_type, pr_info.reservation_type);
            return ScsiResult::conflict();
        }

        let pr_info = &mut self.pr_info[lun as usize];
        pr_info.reservation_type = pr_type;
        pr_info.set_holder(session_id);

        debug!("session {} got a {:?} reservation on LUN {}", session_id, pr_type, lun);
        ScsiResult::good(0)
    }

    fn release(&mut self, lun: Lun, session_id: u32, pr_type: PrType) -> ScsiResult {
        let pr_info = self.info(lun);

        if !pr_info.is_reserved() {
            return ScsiResult::good(0);
        }

        if !pr_info.is_holder(session_id) {
            warn!("PR conflict: session {} does not hold the reservation on LUN {}",
                  session_id, lun);
            return ScsiResult::conflict();
        }

        if pr_info.reservation_type != pr_type {
            warn!("PR failed: release type mismatch on LUN {} ({:?} / current {:?})",
                  lun, pr_type, pr_info.reservation_type);
            return ScsiResult::check_condition(
                SCSI_SENSE_ILLEGAL_REQUEST,
                SCSI_ASC_INVALID_RELEASE_OF_PERSISTENT_RESERVATION);
        }

        // Registrants lose the reservation they were sharing
        let notify: Vec<u32> = if !pr_info.reservation_type.single_holder()
            || pr_info.reservation_type.registrants_only()
        {
            pr_info.registrations.iter().flatten()
                .filter(|reg| reg.session_id != session_id)
                .map(|reg| reg.session_id)
                .collect()
        } else {
            vec![]
        };

        for id in notify {
            self.callback(id, lun, SCSI_SENSE_UNIT_ATTENTION,
                          SCSI_ASC_RESERVATIONS_RELEASED);
        }

        self.pr_info[lun as usize].drop_reservation();

        debug!("session {} released the reservation on LUN {}", session_id, lun);
        ScsiResult::good(0)
    }

    fn clear(&mut self, lun: Lun, session_id: u32) -> ScsiResult {
        let others: Vec<u32> = self.info(lun).registrations.iter().flatten()
            .filter(|reg| reg.session_id != session_id)
            .map(|reg| reg.session_id)
            .collect();

        for id in others {
            self.callback(id, lun, SCSI_SENSE_UNIT_ATTENTION,
                          SCSI_ASC_RESERVATIONS_RELEASED);
        }

        let pr_info = &mut self.pr_info[lun as usize];
        pr_info.clear_registrations();
        pr_info.drop_reservation();

        debug!("session {} cleared LUN {} reservations", session_id, lun);
        ScsiResult::good(0)
    }

    fn preempt(&mut self, lun: Lun, session_id: u32, service_action_key: PrKey,
               pr_type: PrType, abort: bool) -> ScsiResult {
        let all_registrants = self.info(lun).reservation_type.all_registrants();

        /* spc3r23 5.6.10.4.1: a zero service action key is only meaningful
         * under an all-registrants reservation */
        if !all_registrants && service_action_key == 0 {
            warn!("PR failed: session {} preempt with no key on LUN {}", session_id, lun);
            return ScsiResult::check_condition(SCSI_SENSE_ILLEGAL_REQUEST,
                                               SCSI_ASC_INVALID_FIELD_IN_PARAMETER_LIST);
        }

        let holder_key = self.info(lun).holder_key();

        // Unregister every victim except the preempting nexus itself
        let victims: Vec<u32> = self.info(lun).registrations.iter().flatten()
            .filter(|reg| (service_action_key == 0 || reg.key == service_action_key)
                          && reg.session_id != session_id)
            .map(|reg| reg.session_id)
            .collect();

        for id in &victims {
            self.pr_info[lun as usize].del_registration(*id);
            self.callback(*id, lun, SCSI_SENSE_UNIT_ATTENTION,
                          SCSI_ASC_RESERVATIONS_PREEMPTED);
            if abort {
                (self.abort_tasks)(*id, lun);
            }
        }

        debug!("session {} preempted {} registrations on LUN {}",
               session_id, victims.len(), lun);

        /* If there is no reservation on the LUN, preempt does not create one */
        if !self.info(lun).is_reserved() {
            return ScsiResult::good(0);
        }

        if (all_registrants && service_action_key == 0)
            || (!all_registrants && service_action_key == holder_key)
        {
            let pr_info = &mut self.pr_info[lun as usize];
            pr_info.set_holder(session_id);
            pr_info.reservation_type = pr_type;
        }

        ScsiResult::good(0)
    }

    /// SPC-2 RESERVE(6). Allowed only when the LUN has no registrations
    /// and no persistent reservation.
    pub fn spc2_reserve(&mut self, lun: Lun, session_id: u32) -> ScsiResult {
        assert!(session_id < MAX_GLOBAL_SESSION);
        let pr_info = self.info(lun);

        if pr_info.is_reserved() || pr_info.has_registrations() {
            warn!("PR conflict: SPC-2 reserve not possible on LUN {}", lun);
            return ScsiResult::conflict();
        }

        if matches!(pr_info.spc2_reserve, Some(holder) if holder != session_id) {
            warn!("PR conflict: LUN {} already SPC-2 reserved", lun);
            return ScsiResult::conflict();
        }

        self.pr_info[lun as usize].spc2_reserve = Some(session_id);
        ScsiResult::good(0)
    }

    /// SPC-2 RELEASE(6)
    pub fn spc2_release(&mut self, lun: Lun, session_id: u32) -> ScsiResult {
        assert!(session_id < MAX_GLOBAL_SESSION);
        let pr_info = self.info(lun);

        if pr_info.is_reserved() || pr_info.has_registrations() {
            return ScsiResult::conflict();
        }

        if matches!(pr_info.spc2_reserve, Some(holder) if holder != session_id) {
            warn!("PR conflict: LUN {} SPC-2 reserved by another session", lun);
            return ScsiResult::conflict();
        }

        self.pr_info[lun as usize].spc2_reserve = None;
        ScsiResult::good(0)
    }

    pub fn reset_lun_reservation(&mut self, lun: Lun) {
        self.pr_info[lun as usize].spc2_reserve = None;
    }

    /// PR-OUT entry point
    pub fn reserve_out(&mut self, lun: Lun, session_id: u32,
                       params: &PrOutParams) -> ScsiResult {
        assert!(session_id < MAX_GLOBAL_SESSION);

        /* spc3r23 table 116 "allowed scope" */
        if params.scope != PR_LU_SCOPE
            && params.action != PrOutAction::Register
            && params.action != PrOutAction::RegisterAndIgnoreExistingKey
            && params.action != PrOutAction::Clear
        {
            error!("PR failed: scope {} not allowed for {:?} on LUN {}",
                   params.scope, params.action, lun);
            return ScsiResult::check_condition(SCSI_SENSE_ILLEGAL_REQUEST,
                                               SCSI_ASC_INVALID_FIELD_IN_CDB);
        }

        if !self.check_registration(lun, session_id, params.reservation_key, params.action) {
            return ScsiResult::conflict();
        }

        let result = match params.action {
            PrOutAction::Register => {
                if params.spec_i_pt && params.reservation_key != 0 {
                    /* spec_i_pt on an already registered nexus */
                    warn!("PR conflict: register with spec_i_pt on registered nexus \
                           (session {}, LUN {})", session_id, lun);
                    ScsiResult::check_condition(SCSI_SENSE_ILLEGAL_REQUEST,
                                                SCSI_ASC_INVALID_FIELD_IN_CDB)
                } else {
                    self.register(lun, session_id, params.service_action_key)
                }
            }

            PrOutAction::RegisterAndIgnoreExistingKey => {
                if params.service_action_key == 0
                    && !self.info(lun).is_registered(session_id)
                {
                    // Nothing to do
                    ScsiResult::good(0)
                } else if params.spec_i_pt {
                    ScsiResult::check_condition(SCSI_SENSE_ILLEGAL_REQUEST,
                                                SCSI_ASC_INVALID_FIELD_IN_CDB)
                } else {
                    self.register(lun, session_id, params.service_action_key)
                }
            }

            PrOutAction::Reserve => self.reserve(lun, session_id, params.pr_type),
            PrOutAction::Release => self.release(lun, session_id, params.pr_type),
            PrOutAction::Clear => self.clear(lun, session_id),
            PrOutAction::Preempt => {
                self.preempt(lun, session_id, params.service_action_key,
                             params.pr_type, false)
            }
            PrOutAction::PreemptAndAbort => {
                self.preempt(lun, session_id, params.service_action_key,
                             params.pr_type, true)
            }

            PrOutAction::RegisterAndMove => {
                error!("PR failed: 'register and move' not supported \
                        (session {}, LUN {})", session_id, lun);
                ScsiResult::check_condition(SCSI_SENSE_ILLEGAL_REQUEST, 0)
            }
        };

        /* PR generation, spc3r23 6.11.2 */
        if result.status == ScsiStatus::Good
            && params.action != PrOutAction::Reserve
            && params.action != PrOutAction::Release
        {
            self.pr_info[lun as usize].pr_generation =
                self.pr_info[lun as usize].pr_generation.wrapping_add(1);
        }

        result
    }

    /// PR-IN entry point; fills `data_out` and reports the valid length
    pub fn reserve_in(&self, lun: Lun, session_id: u32, action: PrInAction,
                      alloc_len: usize, data_out: &mut [u8]) -> ScsiResult {
        assert!(session_id < MAX_GLOBAL_SESSION);
        let pr_info = self.info(lun);

        debug!("session {} requests PR information on LUN {}", session_id, lun);

        match action {
            PrInAction::ReadKeys => {
                data_out[0..4].copy_from_slice(&pr_info.pr_generation.to_be_bytes());
                let mut add_len = 0;
                for reg in pr_info.registrations.iter().flatten() {
                    if reg.key != 0 {
                        data_out[8 + add_len..16 + add_len]
                            .copy_from_slice(&reg.key.to_be_bytes());
                        add_len += 8;
                    }
                }
                data_out[4..8].copy_from_slice(&(add_len as u32).to_be_bytes());
                ScsiResult::good((add_len + 8).min(alloc_len))
            }

            PrInAction::ReadReservation => {
                data_out[0..4].copy_from_slice(&pr_info.pr_generation.to_be_bytes());
                if !pr_info.is_reserved() {
                    data_out[4..8].copy_from_slice(&0u32.to_be_bytes());
                    return ScsiResult::good(8);
                }
                data_out[4..8].copy_from_slice(&16u32.to_be_bytes());
                data_out[8..16].copy_from_slice(&pr_info.holder_key().to_be_bytes());
                data_out[16..24].copy_from_slice(&0u64.to_be_bytes());
                data_out[21] = (PR_LU_SCOPE << 4) | pr_info.reservation_type as u8;
                ScsiResult::good(24.min(alloc_len))
            }

            PrInAction::ReportCapabilities => {
                data_out[0..2].copy_from_slice(&8u16.to_be_bytes());
                data_out[2] = PR_CAP_SIP_C;
                data_out[3] = 0;
                /* only mode needed by the initiators we care about */
                data_out[4..6].copy_from_slice(&PR_CAP_WR_EX_RO.to_be_bytes());
                data_out[6..8].copy_from_slice(&0u16.to_be_bytes());
                ScsiResult::good(8)
            }

            PrInAction::ReadFullStatus => {
                error!("PR failed: unexpected PR-IN operation {:?} from session {} \
                        on LUN {}", action, session_id, lun);
                ScsiResult::check_condition(SCSI_SENSE_ILLEGAL_REQUEST, 0)
            }
        }
    }

    /// A new session shows up: make sure no stale registration lingers
    /// under its id.
    pub fn add_session(&mut self, session_id: u32) {
        assert!(session_id < MAX_GLOBAL_SESSION);

        for lun in 0..MAX_LUNS {
            self.pr_info[lun].del_registration(session_id);
        }
    }

    fn session_has_reserve_data(&self, session_id: u32) -> bool {
        self.pr_info.iter().any(|info| info.is_registered(session_id))
    }

    /// A session is dropped. Per spc3r20 5.6.4.1 its registrations and
    /// reservations survive the nexus loss: they are moved to a spare
    /// session id so that a later reconnect can restore them.
    pub fn del_session(&mut self, session_id: u32) {
        assert!(session_id < MAX_GLOBAL_SESSION);

        if !self.session_has_reserve_data(session_id) {
            return;
        }

        let free_session_id = (MAX_GLOBAL_SESSION..MAX_GLOBAL_SESSION_PLUS_EXTRA)
            .find(|id| !self.session_has_reserve_data(*id));

        let free_session_id = match free_session_id {
            Some(id) => id,
            None => {
                warn!("no nexus-loss slot left, dropping session {} PR data", session_id);
                for lun in 0..MAX_LUNS {
                    self.pr_info[lun].del_registration(session_id);
                }
                return;
            }
        };

        debug!("stashing session {} PR data as {}", session_id, free_session_id);
        for info in self.pr_info.iter_mut() {
            for reg in info.registrations.iter_mut().flatten() {
                if reg.session_id == session_id {
                    reg.session_id = free_session_id;
                }
            }
            if info.spc2_reserve == Some(session_id) {
                info.spc2_reserve = Some(free_session_id);
            }
        }
    }

    /// A reconnecting initiator claims back the PR data stashed at nexus
    /// loss.
    pub fn restore_session(&mut self, stashed_id: u32, session_id: u32) {
        assert!(stashed_id >= MAX_GLOBAL_SESSION
                && stashed_id < MAX_GLOBAL_SESSION_PLUS_EXTRA);
        assert!(session_id < MAX_GLOBAL_SESSION);

        for info in self.pr_info.iter_mut() {
            for reg in info.registrations.iter_mut().flatten() {
                if reg.session_id == stashed_id {
                    reg.session_id = session_id;
                }
            }
            if info.spc2_reserve == Some(stashed_id) {
                info.spc2_reserve = Some(session_id);
            }
        }
    }

    pub fn packed_size(&self) -> usize {
        self.pr_info.iter().map(|info| {
            1 + 4 + 4 + 4
                + 4 + info.registrations.iter().flatten().count() * 16
        }).sum()
    }

    /// Pack the whole PR state for shipping to another node
    pub fn pack(&self) -> VrtResult<Vec<u8>> {
        let mut buf = vec![0u8; self.packed_size()];
        let mut stream = MemoryStream::new(&mut buf, StreamAccess::Write);

        for info in &self.pr_info {
            stream.write_all(&[info.reservation_type as u8])?;
            stream.write_u32_le(info.pr_generation)?;
            stream.write_u32_le(info.spc2_reserve.map_or(u32::MAX, |s| s))?;
            stream.write_u32_le(info.holder_index.map_or(u32::MAX, |i| i as u32))?;

            stream.write_u32_le(info.registrations.iter().flatten().count() as u32)?;
            for (i, reg) in info.registrations.iter().enumerate() {
                if let Some(reg) = reg {
                    stream.write_u32_le(i as u32)?;
                    stream.write_u32_le(reg.session_id)?;
                    stream.write_u64_le(reg.key)?;
                }
            }
        }

        drop(stream);
        Ok(buf)
    }

    /// Inverse of [`PrContext::pack`]
    pub fn unpack(&mut self, buf: &[u8]) -> VrtResult<()> {
        let mut buf = buf.to_vec();
        let mut stream = MemoryStream::new(&mut buf, StreamAccess::Read);

        for lun in 0..MAX_LUNS {
            let mut type_byte = [0u8; 1];
            stream.read_exact(&mut type_byte)?;
            let reservation_type = PrType::try_from(type_byte[0])
                .map_err(|_| VrtError::InvalidArg)?;

            let pr_generation = stream.read_u32_le()?;
            let spc2 = stream.read_u32_le()?;
            let holder = stream.read_u32_le()?;

            let mut info = PrInfo {
                reservation_type,
                pr_generation,
                spc2_reserve: if spc2 == u32::MAX { None } else { Some(spc2) },
                holder_index: if holder == u32::MAX { None } else { Some(holder as usize) },
                registrations: [None; MAX_REGISTRATIONS],
            };

            let count = stream.read_u32_le()?;
            for _ in 0..count {
                let slot = stream.read_u32_le()? as usize;
                if slot >= MAX_REGISTRATIONS {
                    return Err(VrtError::InvalidArg);
                }
                let session_id = stream.read_u32_le()?;
                let key = stream.read_u64_le()?;
                info.registrations[slot] = Some(PrRegistration { session_id, key });
            }

            self.pr_info[lun] = info;
        }

        Ok(())
    }
}
