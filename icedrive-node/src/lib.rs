//! A content-addressed blob storage node: configuration, identity and the
//! wiring between the blob store, the TCP query server and peer resolution.

pub mod node;
pub mod settings;

pub use node::{load_or_create_secret, save_session, Node, RunningServer};
pub use settings::Settings;
