//! Identifier newtypes shared by the media and signaling planes.

use nanoid::nanoid;
use serde::{Deserialize, Serialize};

/// Generate a 12-character nanoid for locally minted identifiers.
///
/// Engine-side identifiers (transports, producers, consumers) are minted by
/// the engine itself and only wrapped here.
#[must_use]
pub fn generate_id() -> String {
    nanoid!(12)
}

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(generate_id())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

id_type!(
    /// Identifier of a call room.
    RoomId
);

id_type!(
    /// Identifier of a participant within a room.
    ///
    /// Peers are keyed by the joining user's identity, so a `PeerId` converts
    /// losslessly to the [`UserId`] the presence tracker resolves.
    PeerId
);

id_type!(
    /// Identifier of a connected user, independent of any room.
    UserId
);

id_type!(
    /// Engine-assigned identifier of a media transport.
    TransportId
);

id_type!(
    /// Engine-assigned identifier of a media producer.
    ProducerId
);

id_type!(
    /// Engine-assigned identifier of a media consumer.
    ConsumerId
);

impl PeerId {
    /// The presence identity this peer joined under.
    #[must_use]
    pub fn as_user(&self) -> UserId {
        UserId::from(self.0.as_str())
    }
}

impl UserId {
    /// The peer identity this user takes when joining a room.
    #[must_use]
    pub fn as_peer(&self) -> PeerId {
        PeerId::from(self.0.as_str())
    }
}
