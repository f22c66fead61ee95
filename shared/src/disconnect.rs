use std::fmt;

/// Reason codes carried by `DISCONNECT`. The numeric values are part of the
/// wire protocol and follow declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DisconnectReason {
    None = 0,
    IcmpError,
    Timeout,
    Terminated,
    ManagerDeleted,
    ConnectFail,
    Application,
    UnreachableConnection,
    UnackTimeout,
    NewConnection,
    ConnectionRefused,
    MutualConnectError,
    ConnectingToSelf,
    ReliableOverflow,
}

impl DisconnectReason {
    const ALL: [DisconnectReason; 14] = [
        DisconnectReason::None,
        DisconnectReason::IcmpError,
        DisconnectReason::Timeout,
        DisconnectReason::Terminated,
        DisconnectReason::ManagerDeleted,
        DisconnectReason::ConnectFail,
        DisconnectReason::Application,
        DisconnectReason::UnreachableConnection,
        DisconnectReason::UnackTimeout,
        DisconnectReason::NewConnection,
        DisconnectReason::ConnectionRefused,
        DisconnectReason::MutualConnectError,
        DisconnectReason::ConnectingToSelf,
        DisconnectReason::ReliableOverflow,
    ];
}

impl From<DisconnectReason> for u16 {
    fn from(reason: DisconnectReason) -> Self {
        reason as u16
    }
}

impl TryFrom<u16> for DisconnectReason {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::ALL.get(value as usize).copied().ok_or(value)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisconnectReason::None => "None",
            DisconnectReason::IcmpError => "ICMPError",
            DisconnectReason::Timeout => "Timeout",
            DisconnectReason::Terminated => "Terminated",
            DisconnectReason::ManagerDeleted => "ManagerDeleted",
            DisconnectReason::ConnectFail => "ConnectFail",
            DisconnectReason::Application => "Application",
            DisconnectReason::UnreachableConnection => "UnreachableConnection",
            DisconnectReason::UnackTimeout => "UnackTimeout",
            DisconnectReason::NewConnection => "NewConnection",
            DisconnectReason::ConnectionRefused => "ConnectionRefused",
            DisconnectReason::MutualConnectError => "MutualConnectError",
            DisconnectReason::ConnectingToSelf => "ConnectingToSelf",
            DisconnectReason::ReliableOverflow => "ReliableOverflow",
        };
        f.write_str(name)
    }
}
