//! Bridge a Chromecast's receiver volume and mute state onto MQTT topics.

pub mod bridge;
pub mod cache;
pub mod cast;
pub mod cli;
pub mod config;
pub mod device;
pub mod discovery;
pub mod health;
pub mod locator;
pub mod mqtt;
pub mod publisher;
pub mod runtime;
pub mod session;
pub mod translator;
