pub mod membership;
pub mod message_store;
pub mod relay;

pub use membership::RoomMembership;
pub use message_store::{
    MembershipStore, MessageStore, PersistError, PgMembershipStore, PgMessageStore,
};
pub use relay::{FanoutReport, FanoutStats, RelayService, RelaySettings};
