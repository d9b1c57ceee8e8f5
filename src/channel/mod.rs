pub mod manager;

pub use manager::ChannelManager;
