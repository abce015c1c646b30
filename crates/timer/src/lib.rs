//! Scheduled on/off control for relay-driven devices (sprinkler valves,
//! lights) on a Raspberry Pi.
//!
//! Each device is switched according to its schedule, no two devices in the
//! same group run at once, and every transition is logged to SQLite so that
//! run budgets survive restarts.

pub mod accounting;
pub mod admin;
pub mod arbiter;
pub mod calendar;
pub mod config;
pub mod daemon;
pub mod db;
pub mod device;
pub mod engine;
pub mod gpio;
pub mod logging;
pub mod schedule;
pub mod state;
pub mod watchdog;
pub mod web;
