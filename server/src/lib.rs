pub mod api;
pub mod auth;
pub mod config;
pub mod conversations;
pub mod db;
pub mod devices;
pub mod dispatch;
pub mod entitlements;
pub mod error;
pub mod messages;
pub mod notify;
pub mod presence;
pub mod receipts;
pub mod ws;
