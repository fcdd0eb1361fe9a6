pub mod chunks;
pub mod embed;
