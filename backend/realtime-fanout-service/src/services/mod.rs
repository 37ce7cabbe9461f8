pub mod membership_store;
pub mod user_directory;

pub use membership_store::{MembershipStore, PgMembershipStore};
pub use user_directory::{PgUserDirectory, UserDirectory};
