// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Intercepting HTTP proxy that serves a userscript and per-character web app
//! manifests.
//!
//! The interesting parts are [`broker::DataBroker`], a keyed rendezvous with
//! per-waiter deadlines and TTL eviction, and [`resolver::FallbackResolver`],
//! an ordered chain of sources with a single-slot refreshing cache.

pub mod broker;
pub mod ca;
pub mod client;
pub mod config;
pub mod events;
pub mod fetch;
pub mod filter;
pub mod flow;
pub mod interceptor;
pub mod logging;
pub mod proxy;
pub mod resolver;
pub mod userscript;
pub mod webmanifest;

#[cfg(test)]
mod test_helpers;
