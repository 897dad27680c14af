//! Domain modules: thin REST and realtime callers over the core components.

mod channels;
mod messages;
mod users;

pub use channels::ChannelsApi;
pub use messages::MessagesApi;
pub use users::UsersApi;
