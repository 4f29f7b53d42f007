//! Core identifiers and the per-request actor context.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a single (non-B2B) shipment
    ShipmentId
);
uuid_id!(
    /// Identifier of a multi-volume B2B shipment
    B2bShipmentId
);
uuid_id!(
    /// Identifier of one physical volume inside a B2B shipment
    VolumeId
);
uuid_id!(
    /// Driver (motorista) identifier
    DriverId
);
uuid_id!(
    /// Occurrence record identifier
    OccurrenceId
);

/// Externally visible tracking code, distinct from internal ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackingCode(pub String);

impl TrackingCode {
    const ALPHABET: &'static [u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

    /// Generate a random alphanumeric code: `prefix` followed by 10 characters.
    pub fn generate(prefix: &str) -> Self {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let body: String = (0..10)
            .map(|_| Self::ALPHABET[rng.gen_range(0..Self::ALPHABET.len())] as char)
            .collect();
        Self(format!("{prefix}{body}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role of whoever is driving an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Driver,
    Admin,
    Customer,
    B2bClient,
    Anonymous,
}

impl ActorRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "driver" | "motorista" => Some(ActorRole::Driver),
            "admin" => Some(ActorRole::Admin),
            "customer" => Some(ActorRole::Customer),
            "b2b_client" | "b2b" => Some(ActorRole::B2bClient),
            "anonymous" => Some(ActorRole::Anonymous),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActorRole::Driver => "driver",
            ActorRole::Admin => "admin",
            ActorRole::Customer => "customer",
            ActorRole::B2bClient => "b2b_client",
            ActorRole::Anonymous => "anonymous",
        }
    }
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the actor behind an operation.
///
/// Built once at the edge (request middleware, CLI) and passed explicitly into
/// every workflow call that needs to know who is acting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub actor_id: Uuid,
    pub role: ActorRole,
    /// Anonymous checkout session, persisted by the client across reloads
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl SessionContext {
    pub fn new(actor_id: Uuid, role: ActorRole) -> Self {
        Self {
            actor_id,
            role,
            session_id: None,
        }
    }

    pub fn driver(driver_id: DriverId) -> Self {
        Self::new(driver_id.0, ActorRole::Driver)
    }

    pub fn admin(admin_id: Uuid) -> Self {
        Self::new(admin_id, ActorRole::Admin)
    }

    pub fn anonymous(session_id: impl Into<String>) -> Self {
        Self {
            actor_id: Uuid::nil(),
            role: ActorRole::Anonymous,
            session_id: Some(session_id.into()),
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn is_admin(&self) -> bool {
        self.role == ActorRole::Admin
    }

    /// Driver id when the actor is a driver
    pub fn driver_id(&self) -> Option<DriverId> {
        match self.role {
            ActorRole::Driver => Some(DriverId(self.actor_id)),
            _ => None,
        }
    }

    /// Whether the actor may perform driver actions (drivers and admins)
    pub fn can_drive(&self) -> bool {
        matches!(self.role, ActorRole::Driver | ActorRole::Admin)
    }

    /// Short description for logs and history rows
    pub fn describe(&self) -> String {
        match &self.session_id {
            Some(session) if self.role == ActorRole::Anonymous => format!("anonymous:{session}"),
            _ => format!("{}:{}", self.role, self.actor_id),
        }
    }
}
