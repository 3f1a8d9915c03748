#![forbid(unsafe_code)]

//! Telegram bot that turns Reddit video links into Telegram videos.
//!
//! The webhook in [`server`] feeds each update to the [`pipeline`], which
//! authenticates against Reddit, runs yt-dlp and replies through the Bot API.

pub mod config;
pub mod downloader;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod reddit;
pub mod scratch;
pub mod server;
pub mod telegram;

#[cfg(test)]
mod testing;
