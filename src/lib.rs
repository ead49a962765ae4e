#![doc = include_str!("../README.md")]
#![warn(
    missing_docs,
    rustdoc::missing_crate_level_docs,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]
#![allow(
    clippy::unreadable_literal,
    clippy::cognitive_complexity,
    clippy::match_like_matches_macro,
    clippy::derive_partial_eq_without_eq
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod options;

pub use ::bson;

mod bson_util;
pub mod cmap;
pub mod compression;
pub mod error;
pub mod event;
pub mod executor;
mod hello;
pub(crate) mod runtime;
pub mod session;
#[cfg(test)]
mod test_util;
#[cfg(feature = "tracing-unstable")]
mod trace;

pub use crate::{
    cmap::{Connection, ConnectionPool},
    executor::Executor,
    hello::ServerType,
    session::{ClientSession, ClusterTime},
};
