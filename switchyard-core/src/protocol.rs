//! Switchyard wire protocol: message kinds, payloads and status codes.

use uuid::Uuid;

/// Default port the router listens on for clients, services and devices.
pub const DEFAULT_ROUTER_PORT: u16 = 31254;

/// Default port spawned services dial back on for the second hop.
pub const DEFAULT_SERVICE_PORT: u16 = 31255;

/// Status codes carried by `ClientServerStarted` and `ServerStarted`.
pub mod status {
    pub const SUCCESS: i32 = 0;
    pub const FAILED: i32 = 1;
    pub const TIMEOUT: i32 = 2;
    pub const REJECTED: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const UNSUPPORTED: i32 = 5;
    pub const PROTOCOL: i32 = 6;
}

/// The `i16` header that starts every logical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum MessageKind {
    ServiceProvideServer = 0x0000,
    ServiceRequestServer = 0x0001,
    TaskProvideServer = 0x0100,
    ClientRequestServer = 0x1000,
    ClientServerStarted = 0x1001,
    ServerStarted = 0x2000,
}

impl MessageKind {
    pub fn as_i16(self) -> i16 {
        self as i16
    }
}

impl TryFrom<i16> for MessageKind {
    type Error = i16;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        Ok(match value {
            0x0000 => MessageKind::ServiceProvideServer,
            0x0001 => MessageKind::ServiceRequestServer,
            0x0100 => MessageKind::TaskProvideServer,
            0x1000 => MessageKind::ClientRequestServer,
            0x1001 => MessageKind::ClientServerStarted,
            0x2000 => MessageKind::ServerStarted,
            other => return Err(other),
        })
    }
}

/// Outcome reported by `ClientServerStarted` and `ServerStarted`.
/// On the wire: `i32` code, followed by a message string only when the code is non-zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartStatus {
    Started,
    Failed { code: i32, message: String },
}

impl StartStatus {
    pub fn failed(code: i32, message: impl Into<String>) -> Self {
        // A zero code would read back as success and drop the message.
        let code = if code == status::SUCCESS { status::FAILED } else { code };
        StartStatus::Failed {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            StartStatus::Started => status::SUCCESS,
            StartStatus::Failed { code, .. } => *code,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, StartStatus::Started)
    }
}

/// All router messages. The first message on a connection decides its role;
/// after `ClientServerStarted`/`ServerStarted` succeed the connection carries raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Service announces itself as the live channel for `url`. First registration wins.
    ServiceProvideServer { url: String },
    /// Router asks a service to dial back with `guid` to serve one client.
    ServiceRequestServer { url: String, guid: Uuid },
    /// Like `ServiceProvideServer`, but replaces any previous registration.
    TaskProvideServer { url: String },
    /// Client asks for a server at `url`.
    ClientRequestServer { url: String },
    /// Router tells the client whether the rendezvous succeeded.
    ClientServerStarted { status: StartStatus },
    /// First message on a service's callback connection.
    ServerStarted { guid: Uuid, status: StartStatus },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::ServiceProvideServer { .. } => MessageKind::ServiceProvideServer,
            Message::ServiceRequestServer { .. } => MessageKind::ServiceRequestServer,
            Message::TaskProvideServer { .. } => MessageKind::TaskProvideServer,
            Message::ClientRequestServer { .. } => MessageKind::ClientRequestServer,
            Message::ClientServerStarted { .. } => MessageKind::ClientServerStarted,
            Message::ServerStarted { .. } => MessageKind::ServerStarted,
        }
    }
}
