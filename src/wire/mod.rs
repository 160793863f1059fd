use std::fmt;

use crate::orchestrator::jobs::{JobPriority, UniqueId};

pub const PROTOCOL_VIOLATION_CODE: &str = "PROTOCOL_VIOLATION";
pub const QUEUE_FULL_CODE: &str = "QUEUE_FULL";
pub const JOB_NOT_FOUND_CODE: &str = "JOB_NOT_FOUND";
pub const JOB_BUSY_CODE: &str = "JOB_BUSY";
pub const STATUS_TERMINATOR: &str = ".\n";
pub const ADMIN_OK: &str = "OK\n";

/// Parsed protocol messages exchanged between the broker and its clients or workers.
///
/// Byte-level framing is the transport's business; everything above the transport
/// speaks in these values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    CanDo {
        function: String,
    },
    CantDo {
        function: String,
    },
    ResetAbilities,
    PreSleep,
    GrabJob,
    GrabJobUniq,
    SubmitJob {
        function: String,
        unique_id: UniqueId,
        payload: Vec<u8>,
        priority: JobPriority,
        background: bool,
    },
    WorkStatus {
        handle: String,
        numerator: u32,
        denominator: u32,
    },
    WorkData {
        handle: String,
        data: Vec<u8>,
    },
    WorkComplete {
        handle: String,
        data: Vec<u8>,
    },
    WorkFail {
        handle: String,
    },
    EchoReq {
        data: Vec<u8>,
    },
    SetClientId {
        client_id: String,
    },
    AdminStatus,
    AdminMaxQueue {
        function: String,
        max_queue_depth: usize,
    },
    AdminCancel {
        function: String,
        unique_id: UniqueId,
    },

    JobCreated {
        handle: String,
        unique_id: UniqueId,
    },
    NoJob,
    Noop,
    JobAssign {
        handle: String,
        function: String,
        payload: Vec<u8>,
    },
    JobAssignUniq {
        handle: String,
        function: String,
        unique_id: UniqueId,
        payload: Vec<u8>,
    },
    EchoRes {
        data: Vec<u8>,
    },
    Error {
        code: String,
        message: String,
    },
    Text(String),
}

impl Packet {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_owned(),
            message: message.into(),
        }
    }

    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::error(PROTOCOL_VIOLATION_CODE, message)
    }

    pub fn kind(&self) -> PacketKind {
        match self {
            Self::CanDo { .. } => PacketKind::CanDo,
            Self::CantDo { .. } => PacketKind::CantDo,
            Self::ResetAbilities => PacketKind::ResetAbilities,
            Self::PreSleep => PacketKind::PreSleep,
            Self::GrabJob => PacketKind::GrabJob,
            Self::GrabJobUniq => PacketKind::GrabJobUniq,
            Self::SubmitJob { .. } => PacketKind::SubmitJob,
            Self::WorkStatus { .. } => PacketKind::WorkStatus,
            Self::WorkData { .. } => PacketKind::WorkData,
            Self::WorkComplete { .. } => PacketKind::WorkComplete,
            Self::WorkFail { .. } => PacketKind::WorkFail,
            Self::EchoReq { .. } => PacketKind::EchoReq,
            Self::SetClientId { .. } => PacketKind::SetClientId,
            Self::AdminStatus => PacketKind::AdminStatus,
            Self::AdminMaxQueue { .. } => PacketKind::AdminMaxQueue,
            Self::AdminCancel { .. } => PacketKind::AdminCancel,
            Self::JobCreated { .. } => PacketKind::JobCreated,
            Self::NoJob => PacketKind::NoJob,
            Self::Noop => PacketKind::Noop,
            Self::JobAssign { .. } => PacketKind::JobAssign,
            Self::JobAssignUniq { .. } => PacketKind::JobAssignUniq,
            Self::EchoRes { .. } => PacketKind::EchoRes,
            Self::Error { .. } => PacketKind::Error,
            Self::Text(_) => PacketKind::Text,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketKind {
    CanDo,
    CantDo,
    ResetAbilities,
    PreSleep,
    GrabJob,
    GrabJobUniq,
    SubmitJob,
    WorkStatus,
    WorkData,
    WorkComplete,
    WorkFail,
    EchoReq,
    SetClientId,
    AdminStatus,
    AdminMaxQueue,
    AdminCancel,
    JobCreated,
    NoJob,
    Noop,
    JobAssign,
    JobAssignUniq,
    EchoRes,
    Error,
    Text,
}

impl PacketKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CanDo => "CAN_DO",
            Self::CantDo => "CANT_DO",
            Self::ResetAbilities => "RESET_ABILITIES",
            Self::PreSleep => "PRE_SLEEP",
            Self::GrabJob => "GRAB_JOB",
            Self::GrabJobUniq => "GRAB_JOB_UNIQ",
            Self::SubmitJob => "SUBMIT_JOB",
            Self::WorkStatus => "WORK_STATUS",
            Self::WorkData => "WORK_DATA",
            Self::WorkComplete => "WORK_COMPLETE",
            Self::WorkFail => "WORK_FAIL",
            Self::EchoReq => "ECHO_REQ",
            Self::SetClientId => "SET_CLIENT_ID",
            Self::AdminStatus => "ADMIN_STATUS",
            Self::AdminMaxQueue => "ADMIN_MAX_QUEUE",
            Self::AdminCancel => "ADMIN_CANCEL",
            Self::JobCreated => "JOB_CREATED",
            Self::NoJob => "NO_JOB",
            Self::Noop => "NOOP",
            Self::JobAssign => "JOB_ASSIGN",
            Self::JobAssignUniq => "JOB_ASSIGN_UNIQ",
            Self::EchoRes => "ECHO_RES",
            Self::Error => "ERROR",
            Self::Text => "TEXT",
        }
    }

    /// Kinds only the broker may emit; receiving one from a peer is a protocol violation.
    pub fn is_server_to_client(self) -> bool {
        matches!(
            self,
            Self::JobCreated
                | Self::NoJob
                | Self::Noop
                | Self::JobAssign
                | Self::JobAssignUniq
                | Self::EchoRes
                | Self::Error
                | Self::Text
        )
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{Packet, PacketKind, QUEUE_FULL_CODE};

    #[test]
    fn kinds_split_requests_from_responses() {
        assert!(!Packet::GrabJob.kind().is_server_to_client());
        assert!(!Packet::AdminStatus.kind().is_server_to_client());
        assert!(Packet::Noop.kind().is_server_to_client());
        assert!(Packet::Text(".\n".to_owned()).kind().is_server_to_client());
    }

    #[test]
    fn error_helper_fills_code_and_message() {
        let packet = Packet::error(QUEUE_FULL_CODE, "function 'resize' is at capacity");
        assert_eq!(packet.kind(), PacketKind::Error);
        assert_eq!(
            packet,
            Packet::Error {
                code: "QUEUE_FULL".to_owned(),
                message: "function 'resize' is at capacity".to_owned(),
            }
        );
        assert_eq!(PacketKind::JobAssignUniq.to_string(), "JOB_ASSIGN_UNIQ");
    }
}
