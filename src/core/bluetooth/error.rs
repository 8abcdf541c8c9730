//! Error classification for the device link
//! Every platform failure is mapped onto a closed set of kinds, each carrying a
//! remediation hint that can be shown to the user as-is.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The closed taxonomy of device link failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    NotSupported,
    UserCancelled,
    SecurityError,
    ConnectionFailed,
    DeviceDisconnected,
    PermissionDenied,
    ServiceNotFound,
    CharacteristicNotFound,
    WriteFailed,
    NotificationFailed,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 11] = [
        ErrorKind::NotSupported,
        ErrorKind::UserCancelled,
        ErrorKind::SecurityError,
        ErrorKind::ConnectionFailed,
        ErrorKind::DeviceDisconnected,
        ErrorKind::PermissionDenied,
        ErrorKind::ServiceNotFound,
        ErrorKind::CharacteristicNotFound,
        ErrorKind::WriteFailed,
        ErrorKind::NotificationFailed,
        ErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotSupported => "not-supported",
            Self::UserCancelled => "user-cancelled",
            Self::SecurityError => "security-error",
            Self::ConnectionFailed => "connection-failed",
            Self::DeviceDisconnected => "device-disconnected",
            Self::PermissionDenied => "permission-denied",
            Self::ServiceNotFound => "service-not-found",
            Self::CharacteristicNotFound => "characteristic-not-found",
            Self::WriteFailed => "write-failed",
            Self::NotificationFailed => "notification-failed",
            Self::Unknown => "unknown",
        }
    }

    /// User-facing remediation for this kind of failure.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::NotSupported => {
                "Bluetooth is not available here. Use a system with a Bluetooth LE adapter and make sure it is switched on."
            }
            Self::UserCancelled => "No device was selected. Start the scan again and pick your device.",
            Self::SecurityError => {
                "Bluetooth access requires a secure context. Open the application over HTTPS or from localhost."
            }
            Self::ConnectionFailed => "Ensure the device is powered on and in range, then try again.",
            Self::DeviceDisconnected => "The device disconnected. Reconnect to continue.",
            Self::PermissionDenied => "Bluetooth permission was denied. Allow Bluetooth access and try again.",
            Self::ServiceNotFound => {
                "The device does not expose a supported serial service. Check that it is a BLE serial module."
            }
            Self::CharacteristicNotFound => {
                "The serial characteristic was not found. Check the module firmware or service settings."
            }
            Self::WriteFailed => "The command could not be written. Check the connection and send it again.",
            Self::NotificationFailed => "Could not subscribe to device output. Reconnect the device.",
            Self::Unknown => "An unexpected Bluetooth error occurred. Try reconnecting the device.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse category reported by the platform layer alongside its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    Unsupported,
    Cancelled,
    Security,
    Permission,
    Timeout,
    NotConnected,
    NotFound,
    Protocol,
    Other,
}

/// A raw failure from the BLE platform, before classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct PlatformFailure {
    pub category: FailureCategory,
    pub message: String,
}

impl PlatformFailure {
    pub fn new(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FailureCategory::Other, message)
    }
}

/// The step of the link lifecycle a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Availability,
    Scan,
    Connect,
    ResolveService,
    ResolveCharacteristic,
    StartNotifications,
    StopNotifications,
    Write,
    Disconnect,
}

/// A classified device link failure. Every fallible link operation returns this.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct LinkError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl LinkError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn from_failure(operation: Operation, failure: PlatformFailure) -> Self {
        Self {
            kind: classify(operation, &failure),
            detail: failure.message,
        }
    }

    pub fn hint(&self) -> &'static str {
        self.kind.hint()
    }

    /// Whether the one-click reconnect affordance applies.
    pub fn offers_reconnect(&self) -> bool {
        self.kind == ErrorKind::DeviceDisconnected
    }
}

fn pattern(source: &str) -> Regex {
    Regex::new(source).unwrap_or_else(|e| panic!("invalid classifier pattern {source:?}: {e}"))
}

static CANCELLED: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)user cancel|\bcancell?ed\b|chooser (was )?(dismissed|closed)"));
static UNSUPPORTED: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)not supported|unsupported|no bluetooth adapter|bluetooth (adapter )?(is )?(not available|unavailable|turned off|powered off)")
});
static SECURITY: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)securityerror|secure context|insecure|security"));
static PERMISSION: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)permission|not authori[sz]ed|notallowederror|access (is )?denied")
});
static SERVICE_MISSING: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)no services? matching|primary service.*not found|service .*not found"));
static CHARACTERISTIC_MISSING: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)no characteristics? matching|characteristic.*not found")
});
static DISCONNECTED: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)disconnected|not connected|connection (was )?lost|gatt server is disconnected")
});
static NOTIFICATION: LazyLock<Regex> = LazyLock::new(|| pattern(r"(?i)notif|indicat"));
static CONNECTION: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)connection failed|failed to connect|timed? ?out|networkerror|unreachable|out of range")
});

struct Rule {
    kind: ErrorKind,
    applies: fn(Operation, &PlatformFailure) -> bool,
}

/// Priority ordered: the first rule that applies decides the kind.
static RULES: [Rule; 10] = [
    Rule {
        kind: ErrorKind::UserCancelled,
        applies: |_, f| f.category == FailureCategory::Cancelled || CANCELLED.is_match(&f.message),
    },
    Rule {
        kind: ErrorKind::NotSupported,
        applies: |_, f| {
            f.category == FailureCategory::Unsupported || UNSUPPORTED.is_match(&f.message)
        },
    },
    Rule {
        kind: ErrorKind::SecurityError,
        applies: |_, f| f.category == FailureCategory::Security || SECURITY.is_match(&f.message),
    },
    Rule {
        kind: ErrorKind::PermissionDenied,
        applies: |_, f| {
            f.category == FailureCategory::Permission || PERMISSION.is_match(&f.message)
        },
    },
    Rule {
        kind: ErrorKind::ServiceNotFound,
        applies: |op, f| op == Operation::ResolveService || SERVICE_MISSING.is_match(&f.message),
    },
    Rule {
        kind: ErrorKind::CharacteristicNotFound,
        applies: |op, f| {
            op == Operation::ResolveCharacteristic || CHARACTERISTIC_MISSING.is_match(&f.message)
        },
    },
    Rule {
        kind: ErrorKind::DeviceDisconnected,
        applies: |_, f| {
            f.category == FailureCategory::NotConnected || DISCONNECTED.is_match(&f.message)
        },
    },
    Rule {
        kind: ErrorKind::WriteFailed,
        applies: |op, _| op == Operation::Write,
    },
    Rule {
        kind: ErrorKind::NotificationFailed,
        applies: |op, f| {
            matches!(op, Operation::StartNotifications | Operation::StopNotifications)
                || NOTIFICATION.is_match(&f.message)
        },
    },
    Rule {
        kind: ErrorKind::ConnectionFailed,
        applies: |op, f| {
            op == Operation::Connect
                || f.category == FailureCategory::Timeout
                || CONNECTION.is_match(&f.message)
        },
    },
];

/// Maps a platform failure onto exactly one [`ErrorKind`]. Pure and total.
pub fn classify(operation: Operation, failure: &PlatformFailure) -> ErrorKind {
    RULES
        .iter()
        .find(|rule| (rule.applies)(operation, failure))
        .map(|rule| rule.kind)
        .unwrap_or(ErrorKind::Unknown)
}
