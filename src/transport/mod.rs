//! Frame hand-off and command publishing.

pub mod command;
pub mod mailbox;
pub mod mqtt;

pub use command::{
    unix_seconds, CommandPublisher, CommandRecord, MemoryPublisher, TcpCommandPublisher,
};
pub use mailbox::{FrameChannel, Mailbox, MailboxStats, Receive};
pub use mqtt::MqttCommandPublisher;
