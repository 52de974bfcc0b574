#![forbid(unsafe_code)]

//! Queue YouTube Shorts URLs through a small web form, keep a handful of them
//! downloaded, and publish one at each daily slot.

pub mod config;
pub mod continuous;
pub mod fetcher;
pub mod library;
pub mod logging;
pub mod oauth;
pub mod publisher;
pub mod queue;
pub mod replenish;
pub mod scheduler;
pub mod security;
pub mod status;
pub mod web;

#[cfg(test)]
mod testing;
